//! # Memory Regions
//!
//! A [`Region`] is one contiguous, permission-homogeneous range
//! `[start, end)` of an address space. Regions are built with [`Region::new`]
//! and handed straight to [`AddressSpace::insert`], which takes ownership,
//! validates the bounds and records the owning address space.
//!
//! [`AddressSpace::insert`]: crate::AddressSpace::insert

use crate::address_space::AddressSpaceId;
use crate::addresses::VirtualAddress;

bitflags::bitflags! {
    /// Access permissions of a [`Region`].
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct RegionFlags: u32 {
        /// Region may be read.
        const READ  = 1 << 0;
        /// Region may be written.
        const WRITE = 1 << 1;
        /// Region may be executed.
        const EXEC  = 1 << 2;
    }
}

impl RegionFlags {
    #[inline]
    #[must_use]
    pub const fn can_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Instruction fetches and reads are both satisfied by a readable or
    /// executable region.
    #[inline]
    #[must_use]
    pub const fn can_read_or_exec(self) -> bool {
        self.intersects(Self::READ.union(Self::EXEC))
    }
}

/// Stable handle to a region inside one address space.
///
/// Handles carry a generation so that a handle to a removed region never
/// resolves to a region inserted later into the same arena slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct RegionId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// A contiguous range `[start, end)` of virtual memory with uniform permissions.
///
/// The owner back-reference is written once, when the region is inserted into
/// an address space, and is read-only afterwards.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Region {
    owner: Option<AddressSpaceId>,
    start: VirtualAddress,
    end: VirtualAddress,
    flags: RegionFlags,
}

impl Region {
    /// Build a region covering `[start, end)`.
    ///
    /// No validation is performed here; bounds are checked on insertion.
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress, flags: RegionFlags) -> Self {
        Self {
            owner: None,
            start,
            end,
            flags,
        }
    }

    /// Inclusive start address.
    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// Exclusive end address.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> RegionFlags {
        self.flags
    }

    /// The address space this region was inserted into, if any.
    #[inline]
    #[must_use]
    pub const fn owner(&self) -> Option<AddressSpaceId> {
        self.owner
    }

    /// Number of bytes covered.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64().saturating_sub(self.start.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` if `start <= addr < end`.
    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        self.start.as_u64() <= addr.as_u64() && addr.as_u64() < self.end.as_u64()
    }

    /// `true` if the two half-open ranges share at least one address.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start.as_u64() < other.end.as_u64() && other.start.as_u64() < self.end.as_u64()
    }

    /// Record the owning address space.
    ///
    /// # Panics
    /// If the region already belongs to an address space.
    pub(crate) fn set_owner(&mut self, owner: AddressSpaceId) {
        assert!(
            self.owner.is_none(),
            "region [{}, {}) already belongs to address space {:?}",
            self.start,
            self.end,
            self.owner
        );
        self.owner = Some(owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u64, end: u64) -> Region {
        Region::new(start.into(), end.into(), RegionFlags::READ)
    }

    #[test]
    fn half_open_containment() {
        let r = region(5, 7);
        assert!(!r.contains(VirtualAddress::new(4)));
        assert!(r.contains(VirtualAddress::new(5)));
        assert!(r.contains(VirtualAddress::new(6)));
        assert!(!r.contains(VirtualAddress::new(7)));
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn adjacent_regions_do_not_overlap() {
        assert!(!region(0, 4096).overlaps(&region(4096, 8192)));
        assert!(region(0, 4097).overlaps(&region(4096, 8192)));
        assert!(region(10, 20).overlaps(&region(12, 14)));
    }

    #[test]
    fn permission_helpers() {
        assert!(RegionFlags::EXEC.can_read_or_exec());
        assert!(RegionFlags::READ.can_read_or_exec());
        assert!(!RegionFlags::WRITE.can_read_or_exec());
        assert!(!RegionFlags::empty().can_write());
        assert!((RegionFlags::READ | RegionFlags::WRITE).can_write());
    }

    #[test]
    fn construction_does_not_validate() {
        let inverted = region(8, 4);
        assert!(inverted.is_empty());
        assert_eq!(inverted.owner(), None);
    }
}
