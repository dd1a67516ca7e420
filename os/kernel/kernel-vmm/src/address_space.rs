//! # Address Space
//!
//! Per-process bookkeeping of mapped regions.
//!
//! An [`AddressSpace`] owns:
//!
//! - the ordered, non-overlapping set of [`Region`]s (see [`region_index`]),
//! - a handle to its root page table (the page-table frames themselves are
//!   owned by the page-table collaborator),
//! - the private slot of the swap manager, resolved once at creation into a
//!   [`SwapSlot`].
//!
//! ## Lifecycle
//!
//! ```text
//! create ──► insert* ──► (faults resolved against it) ──► destroy
//!                                                          │
//!                       page-table handle returned to its ◄┘
//!                       owner; regions and swap slot dropped
//! ```
//!
//! ## Concurrency
//!
//! Mutation takes `&mut self`, so insertion, removal, teardown and fault
//! resolution on the same address space can never interleave. Lookups only
//! need `&self`; the lookup cache is a [`Cell`](core::cell::Cell), which keeps
//! an address space `!Sync`. Callers that share one across CPUs must wrap it in
//! a lock.

mod region_index;

use crate::addresses::VirtualAddress;
use crate::error::VmError;
use crate::mmu::{PageTableRoot, SwapManager};
use crate::region::{Region, RegionId};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use log::debug;
use region_index::RegionIndex;

static NEXT_ADDRESS_SPACE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of an [`AddressSpace`], used as the owner back-reference of
/// its regions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    fn next() -> Self {
        Self(NEXT_ADDRESS_SPACE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mm#{}", self.0)
    }
}

/// Private state of the swap manager attached to an address space.
#[derive(Debug, Default)]
pub enum SwapSlot<P> {
    /// No swap manager was active when the address space was created.
    #[default]
    Inactive,
    /// State handed out by [`SwapManager::register`].
    Active(P),
}

impl<P> SwapSlot<P> {
    #[inline]
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    #[inline]
    #[must_use]
    pub const fn as_ref(&self) -> Option<&P> {
        match self {
            Self::Active(p) => Some(p),
            Self::Inactive => None,
        }
    }

    #[inline]
    pub fn as_mut(&mut self) -> Option<&mut P> {
        match self {
            Self::Active(p) => Some(p),
            Self::Inactive => None,
        }
    }
}

/// One virtual address space: its regions, page-table root and swap state.
///
/// `P` is the private slot type of the swap manager in use
/// ([`SwapManager::Private`]).
pub struct AddressSpace<P = ()> {
    id: AddressSpaceId,
    regions: RegionIndex,
    page_table: Option<PageTableRoot>,
    swap: SwapSlot<P>,
}

impl<P> AddressSpace<P> {
    /// Create an empty address space.
    ///
    /// The region collection starts empty, the lookup cache is clear and no
    /// page table is attached. If `swap` is active the new address space is
    /// registered with it and keeps the returned private slot; otherwise the
    /// slot stays [`SwapSlot::Inactive`].
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the control block or the swap slot cannot
    /// be allocated.
    pub fn create<S>(swap: &mut S) -> Result<Self, VmError>
    where
        S: SwapManager<Private = P> + ?Sized,
    {
        let id = AddressSpaceId::next();
        let regions = RegionIndex::try_new().map_err(|_| VmError::OutOfMemory)?;
        let swap = if swap.is_active() {
            SwapSlot::Active(swap.register(id)?)
        } else {
            SwapSlot::Inactive
        };

        debug!(
            "created address space {id} (swap {})",
            if swap.is_active() { "active" } else { "inactive" }
        );
        Ok(Self {
            id,
            regions,
            page_table: None,
            swap,
        })
    }

    /// Tear the address space down.
    ///
    /// Every region is unlinked and dropped, then the control block itself.
    /// The page table is **not** freed here: its handle is handed back so the
    /// page-table owner can release it.
    #[must_use = "the page table must be released by its owner"]
    pub fn destroy(mut self) -> Option<PageTableRoot> {
        let dropped = self.regions.clear();
        debug!("destroyed address space {} ({dropped} regions)", self.id);
        self.page_table.take()
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Number of regions (`map_count`).
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.regions.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a region built by [`Region::new`], keeping the collection
    /// ordered by start address. The lookup cache is left untouched.
    ///
    /// # Panics
    /// These are caller bugs, not runtime conditions:
    /// - `region.start >= region.end`,
    /// - the region overlaps one already present,
    /// - the region was already inserted into an address space.
    pub fn insert(&mut self, region: Region) -> RegionId {
        self.regions.insert(self.id, region)
    }

    /// Find the region with `start <= addr < end`.
    ///
    /// Consults the single-entry cache first, then scans the ordered
    /// collection. A hit refreshes the cache.
    #[must_use]
    pub fn find(&self, addr: VirtualAddress) -> Option<RegionId> {
        self.regions.find(addr)
    }

    /// [`find`](Self::find) followed by [`region`](Self::region).
    #[must_use]
    pub fn lookup(&self, addr: VirtualAddress) -> Option<&Region> {
        self.find(addr).and_then(|id| self.region(id))
    }

    /// Resolve a region handle. Stale handles yield `None`.
    #[must_use]
    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(id)
    }

    /// Unlink a region and hand it back to the caller.
    pub fn remove(&mut self, id: RegionId) -> Option<Region> {
        self.regions.remove(id)
    }

    /// Regions in ascending start-address order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter().map(|(_, r)| r)
    }

    /// Region handles in ascending start-address order.
    pub fn region_ids(&self) -> impl Iterator<Item = RegionId> {
        self.regions.iter().map(|(id, _)| id)
    }

    #[inline]
    #[must_use]
    pub const fn page_table(&self) -> Option<PageTableRoot> {
        self.page_table
    }

    /// Attach a page-table root, returning the previously attached one.
    pub fn set_page_table(&mut self, root: PageTableRoot) -> Option<PageTableRoot> {
        self.page_table.replace(root)
    }

    /// Detach the page-table root.
    pub fn take_page_table(&mut self) -> Option<PageTableRoot> {
        self.page_table.take()
    }

    #[inline]
    #[must_use]
    pub const fn swap_slot(&self) -> &SwapSlot<P> {
        &self.swap
    }

    #[inline]
    pub fn swap_slot_mut(&mut self) -> &mut SwapSlot<P> {
        &mut self.swap
    }

    #[cfg(test)]
    pub(crate) fn invalidate_cache(&self) {
        self.regions.invalidate_cache();
    }

    #[cfg(test)]
    pub(crate) fn cached(&self) -> Option<RegionId> {
        self.regions.cached()
    }
}

impl<P> fmt::Debug for AddressSpace<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("map_count", &self.len())
            .field("page_table", &self.page_table)
            .field("swap", &self.swap.is_active())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::PageFrame;
    use crate::mmu::NoSwap;
    use crate::region::RegionFlags;

    fn mm() -> AddressSpace {
        AddressSpace::create(&mut NoSwap).expect("create")
    }

    fn region(start: u64, end: u64) -> Region {
        Region::new(start.into(), end.into(), RegionFlags::READ)
    }

    #[test]
    fn create_starts_empty() {
        let mm = mm();
        assert!(mm.is_empty());
        assert_eq!(mm.page_table(), None);
        assert!(!mm.swap_slot().is_active());
        assert_eq!(mm.cached(), None);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(mm().id(), mm().id());
    }

    #[test]
    fn insert_records_owner_and_count() {
        let mut mm = mm();
        let id = mm.insert(region(0x1000, 0x2000));
        assert_eq!(mm.len(), 1);
        assert_eq!(mm.region(id).and_then(Region::owner), Some(mm.id()));
    }

    #[test]
    fn insert_leaves_cache_alone() {
        let mut mm = mm();
        let a = mm.insert(region(0x1000, 0x2000));
        assert_eq!(mm.find(VirtualAddress::new(0x1800)), Some(a));
        assert_eq!(mm.cached(), Some(a));
        mm.insert(region(0x3000, 0x4000));
        assert_eq!(mm.cached(), Some(a));
    }

    #[test]
    fn find_refreshes_cache() {
        let mut mm = mm();
        let a = mm.insert(region(0x1000, 0x2000));
        let b = mm.insert(region(0x3000, 0x4000));
        assert_eq!(mm.find(VirtualAddress::new(0x3000)), Some(b));
        assert_eq!(mm.cached(), Some(b));
        assert_eq!(mm.find(VirtualAddress::new(0x1fff)), Some(a));
        assert_eq!(mm.cached(), Some(a));
        assert_eq!(mm.find(VirtualAddress::new(0x2000)), None);
        assert_eq!(mm.cached(), Some(a));
    }

    #[test]
    fn cache_is_transparent() {
        let mut mm = mm();
        for i in (0..20u64).rev() {
            mm.insert(region(i * 0x3000, i * 0x3000 + 0x2000));
        }
        for addr in (0..0x3c000u64).step_by(0x800) {
            let va = VirtualAddress::new(addr);
            let warm = mm.find(va);
            mm.invalidate_cache();
            let cold = mm.find(va);
            assert_eq!(warm, cold, "cache changed the result for {va}");
        }
    }

    #[test]
    fn remove_clears_cache_and_invalidates_handle() {
        let mut mm = mm();
        let a = mm.insert(region(0x1000, 0x2000));
        assert_eq!(mm.find(VirtualAddress::new(0x1000)), Some(a));

        let removed = mm.remove(a).expect("removed");
        assert_eq!(removed.start(), VirtualAddress::new(0x1000));
        assert_eq!(mm.len(), 0);
        assert_eq!(mm.cached(), None);
        assert_eq!(mm.region(a), None);
        assert_eq!(mm.remove(a), None);

        // The freed slot is reused, but the old handle stays dead.
        let b = mm.insert(region(0x1000, 0x2000));
        assert_ne!(a, b);
        assert_eq!(mm.region(a), None);
        assert_eq!(mm.find(VirtualAddress::new(0x1000)), Some(b));
    }

    #[test]
    fn destroy_returns_page_table() {
        let mut mm = mm();
        let root = PageTableRoot::new(PageFrame::new(7));
        assert_eq!(mm.set_page_table(root), None);
        mm.insert(region(0x1000, 0x2000));
        mm.insert(region(0x2000, 0x3000));
        assert_eq!(mm.destroy(), Some(root));
    }

    #[test]
    fn destroy_empty() {
        assert_eq!(mm().destroy(), None);
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn overlapping_insert_panics() {
        let mut mm = mm();
        mm.insert(region(0x1000, 0x3000));
        mm.insert(region(0x2000, 0x4000));
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn same_start_panics() {
        let mut mm = mm();
        mm.insert(region(0x1000, 0x2000));
        mm.insert(region(0x1000, 0x1800));
    }

    #[test]
    #[should_panic(expected = "empty or inverted")]
    fn inverted_insert_panics() {
        let mut mm = mm();
        mm.insert(region(0x2000, 0x1000));
    }

    #[test]
    #[should_panic(expected = "already belongs")]
    fn reinsert_owned_region_panics() {
        let mut a = mm();
        let mut b = mm();
        let id = a.insert(region(0x1000, 0x2000));
        let r = a.remove(id).expect("removed");
        b.insert(r);
    }
}
