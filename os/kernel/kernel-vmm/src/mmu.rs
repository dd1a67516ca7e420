//! # Collaborator Contracts
//!
//! The fault resolver does not own physical memory, page tables or swap
//! storage. It reaches them through three narrow traits:
//!
//! | Trait                | Provides                                            |
//! |:---------------------|:----------------------------------------------------|
//! | [`FrameAllocator`]   | 4 KiB physical frames and their descriptors         |
//! | [`PageTableWalker`]  | entry lookup (allocating missing tables) and mapping|
//! | [`SwapManager`]      | swap-in from backing storage, replacement tracking  |
//!
//! A page-table entry is observed as an [`EntrySlot`]: a by-value snapshot of
//! the entry's location and decoded [`EntryState`]. No reference into the page
//! table outlives the call that produced it.

use crate::address_space::AddressSpaceId;
use crate::addresses::{PageFrame, PhysicalAddress, VirtualAddress};
use crate::error::{SwapError, VmError};
use core::fmt;

/// Handle to the root table of a page-table tree.
///
/// The tree is owned by the page-table collaborator; an address space only
/// refers to it.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PageTableRoot(PageFrame);

impl PageTableRoot {
    #[inline]
    #[must_use]
    pub const fn new(frame: PageFrame) -> Self {
        Self(frame)
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> PageFrame {
        self.0
    }
}

bitflags::bitflags! {
    /// Permissions requested for a leaf mapping.
    ///
    /// Bit positions follow the x86 entry layout; the walker adds the
    /// present bit itself.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MapPermissions: u32 {
        /// Page is writable.
        const WRITABLE = 1 << 1;
        /// Page is accessible from user mode.
        const USER     = 1 << 2;
    }
}

/// Opaque token stored in a non-present page-table entry whose page content
/// lives in backing storage.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SwapEntry(u64);

impl SwapEntry {
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SwapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Decoded content of a leaf page-table entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryState {
    /// The all-zero sentinel: nothing was ever mapped here.
    Unmapped,
    /// A valid present mapping of the given frame.
    Present(PageFrame),
    /// Non-zero but not present: the page was swapped out.
    Swapped(SwapEntry),
}

/// Snapshot of one leaf page-table entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EntrySlot {
    location: PhysicalAddress,
    state: EntryState,
}

impl EntrySlot {
    #[inline]
    #[must_use]
    pub const fn new(location: PhysicalAddress, state: EntryState) -> Self {
        Self { location, state }
    }

    /// Physical address of the entry inside its page table.
    #[inline]
    #[must_use]
    pub const fn location(self) -> PhysicalAddress {
        self.location
    }

    #[inline]
    #[must_use]
    pub const fn state(self) -> EntryState {
        self.state
    }
}

/// Physical frame allocator.
pub trait FrameAllocator {
    /// Allocate one frame. Returns `None` when memory is exhausted.
    fn allocate_page(&mut self) -> Option<PageFrame>;

    /// Return a frame obtained from [`allocate_page`](Self::allocate_page).
    fn free_page(&mut self, page: PageFrame);

    /// Number of frames currently free.
    fn free_page_count(&self) -> usize;

    /// Remember that `page` is mapped at `va`, for the replacement
    /// algorithm's reverse lookup at eviction time.
    fn record_mapping(&mut self, page: PageFrame, va: VirtualAddress);
}

/// Page-table walker.
pub trait PageTableWalker {
    /// Locate the leaf entry for `va` below `root`.
    ///
    /// With `create_if_missing` set, missing intermediate tables are
    /// allocated (zeroed) on the way down.
    ///
    /// # Errors
    /// - [`VmError::OutOfMemory`] if an intermediate table cannot be
    ///   allocated, or (without `create_if_missing`) if it does not exist.
    /// - [`VmError::InvalidAddress`] if the tree cannot map `va` at all.
    fn entry_slot(
        &mut self,
        root: PageTableRoot,
        va: VirtualAddress,
        create_if_missing: bool,
    ) -> Result<EntrySlot, VmError>;

    /// Map `page` at the page-aligned `va` with `perm` (plus present).
    ///
    /// A previous mapping at `va` is replaced. The walker takes a reference
    /// on `page`.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if a page table cannot be allocated.
    fn establish_mapping(
        &mut self,
        root: PageTableRoot,
        page: PageFrame,
        va: VirtualAddress,
        perm: MapPermissions,
    ) -> Result<(), VmError>;
}

/// Swap manager: optional, may be globally inactive.
pub trait SwapManager {
    /// Per-address-space state, held in the address space's
    /// [`SwapSlot`](crate::SwapSlot).
    type Private;

    /// Whether the swap subsystem was initialised.
    fn is_active(&self) -> bool;

    /// Called when an address space is created while the manager is active.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the private state cannot be allocated.
    fn register(&mut self, mm: AddressSpaceId) -> Result<Self::Private, VmError>;

    /// Bring the page behind `entry` back into a freshly allocated frame.
    ///
    /// The content stays in backing storage until
    /// [`release_entry`](Self::release_entry), so a mapping that fails after
    /// this call can be retried.
    ///
    /// # Errors
    /// A [`SwapError`] describing why the content could not be restored.
    fn swap_in(
        &mut self,
        private: &mut Self::Private,
        va: VirtualAddress,
        entry: SwapEntry,
    ) -> Result<PageFrame, SwapError>;

    /// Drop the backing storage of `entry` once its page is mapped again.
    fn release_entry(&mut self, entry: SwapEntry);

    /// Make the page mapped at `va` eligible for eviction.
    fn mark_swappable(&mut self, private: &mut Self::Private, va: VirtualAddress, page: PageFrame);
}

/// A swap manager that is never active.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoSwap;

impl SwapManager for NoSwap {
    type Private = ();

    fn is_active(&self) -> bool {
        false
    }

    fn register(&mut self, _mm: AddressSpaceId) -> Result<Self::Private, VmError> {
        Ok(())
    }

    fn swap_in(
        &mut self,
        _private: &mut Self::Private,
        _va: VirtualAddress,
        entry: SwapEntry,
    ) -> Result<PageFrame, SwapError> {
        Err(SwapError::Inactive(entry))
    }

    fn release_entry(&mut self, _entry: SwapEntry) {}

    fn mark_swappable(&mut self, _private: &mut Self::Private, _va: VirtualAddress, _page: PageFrame) {}
}
