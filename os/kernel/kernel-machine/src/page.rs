//! # Physical Page Descriptors
//!
//! One [`Page`] per frame of simulated RAM. The descriptor array is indexed by
//! page frame number, so a [`PageFrame`](kernel_vmm::PageFrame) doubles as the
//! handle to its descriptor.

use kernel_vmm::VirtualAddress;

bitflags::bitflags! {
    /// Status bits of a page descriptor.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct PageFlags: u8 {
        /// Frame is not managed by the allocator.
        const RESERVED = 1 << 0;

        /// Frame is the head of a free block; `property` holds the block length.
        const PROPERTY = 1 << 1;
    }
}

/// Descriptor of one physical frame.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Page {
    ref_count: u32,
    flags: PageFlags,
    property: usize,
    pra_vaddr: Option<VirtualAddress>,
}

impl Page {
    /// A frame not yet handed to the allocator.
    #[must_use]
    pub const fn reserved() -> Self {
        Self {
            ref_count: 0,
            flags: PageFlags::RESERVED,
            property: 0,
            pra_vaddr: None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn ref_count(&self) -> u32 {
        self.ref_count
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Length of the free block this frame heads, or 0.
    #[inline]
    #[must_use]
    pub const fn property(&self) -> usize {
        self.property
    }

    /// Virtual address this frame was last mapped at, for eviction.
    #[inline]
    #[must_use]
    pub const fn pra_vaddr(&self) -> Option<VirtualAddress> {
        self.pra_vaddr
    }

    #[inline]
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        self.flags.contains(PageFlags::RESERVED)
    }

    #[inline]
    #[must_use]
    pub const fn is_free_head(&self) -> bool {
        self.flags.contains(PageFlags::PROPERTY)
    }

    pub(crate) const fn set_ref_count(&mut self, count: u32) {
        self.ref_count = count;
    }

    pub(crate) const fn inc_ref(&mut self) -> u32 {
        self.ref_count += 1;
        self.ref_count
    }

    /// # Panics
    /// If the count is already zero.
    pub(crate) fn dec_ref(&mut self) -> u32 {
        assert!(self.ref_count > 0, "reference count underflow");
        self.ref_count -= 1;
        self.ref_count
    }

    pub(crate) const fn set_pra_vaddr(&mut self, va: Option<VirtualAddress>) {
        self.pra_vaddr = va;
    }

    pub(crate) fn make_free_head(&mut self, len: usize) {
        self.property = len;
        self.flags.insert(PageFlags::PROPERTY);
    }

    pub(crate) fn clear_free_head(&mut self) {
        self.property = 0;
        self.flags.remove(PageFlags::PROPERTY);
    }

    /// Reset to the state of a frame freshly handed to the allocator.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}
