//! # FIFO Swapping
//!
//! A RAM-backed swap device plus the first-in, first-out replacement queue.
//!
//! Each address space keeps its own [`FifoQueue`] of resident swappable pages
//! (oldest at the front). Evicting a page copies its frame into a free swap
//! slot and leaves a swap entry in the page table:
//!
//! ```text
//!   31                         8 7        0
//!  +----------------------------+----------+
//!  |        slot offset         |    0     |
//!  +----------------------------+----------+
//! ```
//!
//! Offset 0 is never handed out, so a swap entry is never the all-zero
//! unmapped sentinel, and bit 0 (present) is always clear.

use crate::config::FRAME_BYTES;
use crate::memory::Frame;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use kernel_vmm::{PageFrame, SwapEntry, SwapError, VirtualAddress};
use log::trace;

/// Bits below the slot offset in a swap entry.
pub const SWAP_OFFSET_SHIFT: u32 = 8;

/// Resident swappable pages of one address space, oldest first.
pub type FifoQueue = VecDeque<(VirtualAddress, PageFrame)>;

/// Simulated swap device.
pub struct SwapStore {
    /// Index `i` holds offset `i + 1`.
    slots: Vec<Option<Box<Frame>>>,
}

impl SwapStore {
    #[must_use]
    pub fn new(slots: usize) -> Self {
        let mut v = Vec::with_capacity(slots);
        v.resize_with(slots, || None);
        Self { slots: v }
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently holding a page.
    #[must_use]
    pub fn used(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Copy `content` into the first free slot.
    ///
    /// Returns `None` if the device is full.
    pub fn write(&mut self, content: &Frame) -> Option<SwapEntry> {
        let index = self.slots.iter().position(Option::is_none)?;
        self.slots[index] = Some(Box::new(*content));
        let entry = entry_for(index);
        trace!("swap: stored page in slot {} (entry {entry})", index + 1);
        Some(entry)
    }

    /// The page behind `entry`. The slot stays occupied until
    /// [`discard`](Self::discard).
    ///
    /// # Errors
    /// [`SwapError::Unreadable`] if the entry is malformed or its slot is empty.
    pub fn read(&self, entry: SwapEntry) -> Result<&Frame, SwapError> {
        let index = slot_index(entry).ok_or(SwapError::Unreadable(entry))?;
        self.slots
            .get(index)
            .and_then(Option::as_deref)
            .ok_or(SwapError::Unreadable(entry))
    }

    /// Free the slot behind `entry`.
    pub fn discard(&mut self, entry: SwapEntry) {
        if let Some(slot) = slot_index(entry).and_then(|i| self.slots.get_mut(i)) {
            *slot = None;
        }
    }
}

impl core::fmt::Debug for SwapStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SwapStore")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("page_bytes", &FRAME_BYTES)
            .finish()
    }
}

fn entry_for(index: usize) -> SwapEntry {
    SwapEntry::new(((index as u64) + 1) << SWAP_OFFSET_SHIFT)
}

fn slot_index(entry: SwapEntry) -> Option<usize> {
    let raw = entry.as_u64();
    if raw & ((1 << SWAP_OFFSET_SHIFT) - 1) != 0 {
        return None;
    }
    let offset = raw >> SWAP_OFFSET_SHIFT;
    let index = offset.checked_sub(1)?;
    usize::try_from(index).ok()
}

/// Oldest resident page of the queue, the FIFO victim.
pub fn pick_victim(queue: &mut FifoQueue) -> Option<(VirtualAddress, PageFrame)> {
    queue.pop_front()
}
