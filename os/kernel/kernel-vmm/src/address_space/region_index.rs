//! # Region Index
//!
//! Ordered, non-overlapping collection of the regions of one address space.
//!
//! Regions live in an arena of generation-checked slots; a separate `order`
//! vector holds their handles sorted by ascending start address. Lookups go
//! through a single-entry cache that remembers the last region found, which
//! captures the common pattern of repeated faults inside one hot region.
//!
//! ## Invariants
//! - For any two regions `a`, `b`: `a.end <= b.start || b.end <= a.start`.
//! - `order` is strictly ascending by start address.
//! - `map_count == order.len()`.
//! - The cache is only a hint; a stale cached handle is ignored.

use crate::address_space::AddressSpaceId;
use crate::addresses::VirtualAddress;
use crate::region::{Region, RegionId};
use alloc::collections::TryReserveError;
use alloc::vec::Vec;
use core::cell::Cell;

/// Arena slots reserved up front when an address space is created.
const INITIAL_CAPACITY: usize = 8;

struct Slot {
    generation: u32,
    region: Option<Region>,
}

pub(crate) struct RegionIndex {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    order: Vec<RegionId>,
    cache: Cell<Option<RegionId>>,
    map_count: usize,
}

impl RegionIndex {
    pub(crate) fn try_new() -> Result<Self, TryReserveError> {
        let mut slots = Vec::new();
        slots.try_reserve(INITIAL_CAPACITY)?;
        let mut order = Vec::new();
        order.try_reserve(INITIAL_CAPACITY)?;
        Ok(Self {
            slots,
            vacant: Vec::new(),
            order,
            cache: Cell::new(None),
            map_count: 0,
        })
    }

    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.map_count
    }

    pub(crate) fn get(&self, id: RegionId) -> Option<&Region> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.region.as_ref()
    }

    /// Resolve a handle taken from `order`.
    ///
    /// # Panics
    /// If the handle is dangling, which means the index is corrupted.
    fn linked(&self, id: RegionId) -> &Region {
        self.get(id)
            .unwrap_or_else(|| panic!("region index corrupted: dangling handle {id:?}"))
    }

    /// Iterate regions in ascending start order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (RegionId, &Region)> {
        self.order.iter().map(|&id| (id, self.linked(id)))
    }

    /// Insert `region` at its ordered position.
    ///
    /// # Panics
    /// If `region.start >= region.end`, if it overlaps a neighbour, or if it
    /// already belongs to an address space.
    pub(crate) fn insert(&mut self, owner: AddressSpaceId, mut region: Region) -> RegionId {
        assert!(
            region.start() < region.end(),
            "region [{}, {}) is empty or inverted",
            region.start(),
            region.end()
        );

        // Everything before `pos` starts at or below the new region.
        let pos = self
            .order
            .iter()
            .position(|&id| self.linked(id).start() > region.start())
            .unwrap_or(self.order.len());

        if let Some(prev) = pos.checked_sub(1) {
            check_overlap(self.linked(self.order[prev]), &region);
        }
        if let Some(&next) = self.order.get(pos) {
            check_overlap(&region, self.linked(next));
        }

        region.set_owner(owner);
        let id = self.occupy(region);
        self.order.insert(pos, id);
        self.map_count += 1;
        debug_assert_eq!(self.map_count, self.order.len());
        id
    }

    /// Find the region containing `addr`, refreshing the cache on a hit.
    pub(crate) fn find(&self, addr: VirtualAddress) -> Option<RegionId> {
        if let Some(id) = self.cache.get()
            && self.get(id).is_some_and(|r| r.contains(addr))
        {
            return Some(id);
        }

        // Regions are ordered and disjoint: once a region starts above `addr`,
        // no later one can contain it.
        let found = self
            .order
            .iter()
            .copied()
            .take_while(|&id| self.linked(id).start() <= addr)
            .find(|&id| self.linked(id).contains(addr))?;

        self.cache.set(Some(found));
        Some(found)
    }

    /// Unlink and return the region behind `id`.
    pub(crate) fn remove(&mut self, id: RegionId) -> Option<Region> {
        self.get(id)?;
        let pos = self
            .order
            .iter()
            .position(|&o| o == id)
            .unwrap_or_else(|| panic!("region index corrupted: {id:?} is not linked"));
        self.order.remove(pos);

        if self.cache.get() == Some(id) {
            self.cache.set(None);
        }

        let slot = &mut self.slots[id.index as usize];
        let region = slot.region.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        self.map_count -= 1;
        region
    }

    /// Remove every region, returning how many were dropped.
    pub(crate) fn clear(&mut self) -> usize {
        let mut dropped = 0;
        while let Some(id) = self.order.last().copied() {
            drop(self.remove(id));
            dropped += 1;
        }
        debug_assert_eq!(self.map_count, 0);
        dropped
    }

    #[cfg(test)]
    pub(crate) fn invalidate_cache(&self) {
        self.cache.set(None);
    }

    #[cfg(test)]
    pub(crate) fn cached(&self) -> Option<RegionId> {
        self.cache.get()
    }

    fn occupy(&mut self, region: Region) -> RegionId {
        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.region.is_none());
            slot.region = Some(region);
            return RegionId {
                index,
                generation: slot.generation,
            };
        }

        let index = u32::try_from(self.slots.len())
            .unwrap_or_else(|_| panic!("region arena exhausted"));
        self.slots.push(Slot {
            generation: 0,
            region: Some(region),
        });
        RegionId {
            index,
            generation: 0,
        }
    }
}

/// Both regions must be well formed and `prev` must end at or before `next` starts.
///
/// # Panics
/// If any of the conditions is violated.
fn check_overlap(prev: &Region, next: &Region) {
    assert!(prev.start() < prev.end());
    assert!(
        prev.end() <= next.start(),
        "region [{}, {}) overlaps [{}, {})",
        prev.start(),
        prev.end(),
        next.start(),
        next.end()
    );
    assert!(next.start() < next.end());
}
