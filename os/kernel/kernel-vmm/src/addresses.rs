//! # Virtual and Physical Memory Addresses

use core::fmt;
use core::ops::{Add, AddAssign};

/// Size of a base page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2([`PAGE_SIZE`]), i.e. the number of low bits used for the in-page offset.
pub const PAGE_SHIFT: u32 = 12;

const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);

/// Align `x` down to the nearest multiple of `a`.
///
/// This returns the greatest value `y <= x` such that `y % a == 0`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_vmm::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(4096,   4096), 4096);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
/// - `x + (a - 1)` must **not overflow** `u64`.
///
/// ### Examples
/// ```rust
/// # use kernel_vmm::align_up;
/// assert_eq!(align_up(0,    4096), 0);
/// assert_eq!(align_up(1,    4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(4097, 4096), 8192);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// A **virtual** (linear) memory address.
///
/// Carries the *kind* of address at the type level so virtual and physical
/// values cannot be mixed. No alignment or canonicality is implied.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

/// A **physical** memory address (machine bus address).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

/// A physical page frame, identified by its page frame number (PFN).
///
/// The frame's base address is `pfn << PAGE_SHIFT`; a `PageFrame` is therefore
/// always page aligned.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageFrame(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The base of the page containing this address.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }

    /// Byte offset of this address inside its page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Virtual page number (address divided by the page size).
    #[inline]
    #[must_use]
    pub const fn page_number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The frame containing this address.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PageFrame {
        PageFrame(self.0 >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl PageFrame {
    /// Build a frame from its page frame number.
    #[inline]
    #[must_use]
    pub const fn new(pfn: u64) -> Self {
        Self(pfn)
    }

    /// Build a frame from a page-aligned physical address.
    ///
    /// ### Debug assertions
    /// - Asserts that `pa` is page aligned.
    #[inline]
    #[must_use]
    pub const fn from_addr(pa: PhysicalAddress) -> Self {
        debug_assert!(pa.page_offset() == 0, "physical address not page aligned");
        pa.frame()
    }

    #[inline]
    #[must_use]
    pub const fn pfn(self) -> u64 {
        self.0
    }

    /// The frame number as an index into per-frame tables.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Physical base address of the frame.
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0 << PAGE_SHIFT)
    }

    /// Physical address of byte `offset` inside this frame.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> PhysicalAddress {
        debug_assert!(offset < PAGE_SIZE);
        PhysicalAddress((self.0 << PAGE_SHIFT) | offset)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:08X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:08X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame(#{} @ 0x{:08X})", self.0, self.0 << PAGE_SHIFT)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
