//! # Physical Memory
//!
//! Simulated RAM plus a first-fit, split-and-coalesce page allocator.
//!
//! ```text
//!   free list (ascending frame number)
//!   ┌────────────┐    ┌────────────┐    ┌────────────┐
//!   │ head: 3    │ ─► │ head: 10   │ ─► │ head: 40   │
//!   │ property 2 │    │ property 7 │    │ property 216│
//!   └────────────┘    └────────────┘    └────────────┘
//! ```
//!
//! Each free block is described by its first frame's descriptor
//! (`PROPERTY` set, `property` = length). The list holds block heads sorted by
//! frame number so neighbours can be merged on free.
//!
//! ## Invariants
//! - Free blocks never overlap and never touch; touching blocks are merged.
//! - `nr_free` equals the sum of all block lengths.

use crate::config::{ENTRY_BYTES, FRAME_BYTES};
use crate::page::{Page, PageFlags};
use alloc::vec;
use alloc::vec::Vec;
use kernel_vmm::{PageFrame, PhysicalAddress};
use log::{debug, trace};

pub type Frame = [u8; FRAME_BYTES];

/// Simulated physical memory with its page allocator.
pub struct PhysicalMemory {
    pages: Vec<Page>,
    frames: Vec<Frame>,
    free_list: Vec<usize>,
    nr_free: usize,
}

impl PhysicalMemory {
    /// Create `frames` frames of zeroed memory, all free.
    #[must_use]
    pub fn new(frames: usize) -> Self {
        let mut mem = Self {
            pages: vec![Page::reserved(); frames],
            frames: vec![[0; FRAME_BYTES]; frames],
            free_list: Vec::new(),
            nr_free: 0,
        };
        if frames > 0 {
            mem.init_memmap(0, frames);
        }
        debug!("physical memory: {frames} frames");
        mem
    }

    /// Hand `[base, base + n)` to the allocator as one free block.
    fn init_memmap(&mut self, base: usize, n: usize) {
        for page in &mut self.pages[base..base + n] {
            debug_assert!(page.is_reserved());
            page.reset();
        }
        self.pages[base].make_free_head(n);
        self.nr_free += n;
        self.free_list.push(base);
    }

    /// Total frames, free or not.
    #[inline]
    #[must_use]
    pub const fn total_pages(&self) -> usize {
        self.pages.len()
    }

    /// Frames currently free.
    #[inline]
    #[must_use]
    pub const fn free_page_count(&self) -> usize {
        self.nr_free
    }

    /// Free blocks as `(first frame, length)`, ascending.
    pub fn free_blocks(&self) -> impl Iterator<Item = (PageFrame, usize)> + '_ {
        self.free_list
            .iter()
            .map(|&head| (pfn(head), self.pages[head].property()))
    }

    /// Allocate `n` contiguous frames, first fit.
    ///
    /// The returned frames have a reference count of zero.
    ///
    /// # Panics
    /// If `n` is zero.
    pub fn alloc_pages(&mut self, n: usize) -> Option<PageFrame> {
        assert!(n > 0, "zero-sized page allocation");
        if n > self.nr_free {
            return None;
        }

        let pos = self
            .free_list
            .iter()
            .position(|&head| self.pages[head].property() >= n)?;
        let head = self.free_list[pos];
        let len = self.pages[head].property();

        if len > n {
            let rest = head + n;
            self.pages[rest].make_free_head(len - n);
            self.free_list[pos] = rest;
        } else {
            self.free_list.remove(pos);
        }
        self.pages[head].clear_free_head();
        self.nr_free -= n;

        trace!("allocated {n} frame(s) at {:?}", pfn(head));
        Some(pfn(head))
    }

    /// Return `[base, base + n)` to the allocator, merging with neighbours.
    ///
    /// # Panics
    /// If `n` is zero, the range is out of bounds, or any frame in it is
    /// reserved or already free.
    pub fn free_pages(&mut self, base: PageFrame, n: usize) {
        assert!(n > 0, "zero-sized page free");
        let mut head = base.index();
        assert!(
            head + n <= self.pages.len(),
            "freeing {n} frame(s) at {base:?} beyond end of memory"
        );
        for page in &self.pages[head..head + n] {
            assert!(
                !page.flags().intersects(PageFlags::RESERVED | PageFlags::PROPERTY),
                "freeing reserved or free frame in block at {base:?}"
            );
        }
        for page in &mut self.pages[head..head + n] {
            page.reset();
        }

        let mut len = n;
        let pos = self.free_list.partition_point(|&h| h < head);

        // Merge with the following block.
        if let Some(&next) = self.free_list.get(pos) {
            assert!(next >= head + len, "double free of frame {:?}", pfn(next));
            if next == head + len {
                len += self.pages[next].property();
                self.pages[next].clear_free_head();
                self.free_list.remove(pos);
            }
        }

        // Merge with the preceding block.
        let mut insert = true;
        if let Some(prev_pos) = pos.checked_sub(1) {
            let prev = self.free_list[prev_pos];
            let prev_len = self.pages[prev].property();
            assert!(prev + prev_len <= head, "double free of frame {base:?}");
            if prev + prev_len == head {
                head = prev;
                len += prev_len;
                insert = false;
            }
        }

        self.pages[head].make_free_head(len);
        if insert {
            self.free_list.insert(pos, head);
        }
        self.nr_free += n;
        trace!("freed {n} frame(s) at {base:?}");
    }

    #[must_use]
    pub fn page(&self, frame: PageFrame) -> &Page {
        &self.pages[frame.index()]
    }

    pub(crate) fn page_mut(&mut self, frame: PageFrame) -> &mut Page {
        &mut self.pages[frame.index()]
    }

    #[must_use]
    pub fn page_ref(&self, frame: PageFrame) -> u32 {
        self.page(frame).ref_count()
    }

    pub(crate) fn page_ref_inc(&mut self, frame: PageFrame) -> u32 {
        self.page_mut(frame).inc_ref()
    }

    pub(crate) fn page_ref_dec(&mut self, frame: PageFrame) -> u32 {
        self.page_mut(frame).dec_ref()
    }

    pub(crate) fn set_page_ref(&mut self, frame: PageFrame, count: u32) {
        self.page_mut(frame).set_ref_count(count);
    }

    /// Contents of a frame.
    #[must_use]
    pub fn frame(&self, frame: PageFrame) -> &Frame {
        &self.frames[frame.index()]
    }

    pub fn frame_mut(&mut self, frame: PageFrame) -> &mut Frame {
        &mut self.frames[frame.index()]
    }

    pub fn zero_frame(&mut self, frame: PageFrame) {
        self.frame_mut(frame).fill(0);
    }

    #[must_use]
    pub fn read_byte(&self, pa: PhysicalAddress) -> u8 {
        self.frame(pa.frame())[offset(pa)]
    }

    pub fn write_byte(&mut self, pa: PhysicalAddress, value: u8) {
        self.frame_mut(pa.frame())[offset(pa)] = value;
    }

    /// Load a little-endian page-table entry.
    #[must_use]
    pub fn read_u32(&self, pa: PhysicalAddress) -> u32 {
        let off = offset(pa);
        let mut raw = [0; ENTRY_BYTES];
        raw.copy_from_slice(&self.frame(pa.frame())[off..off + ENTRY_BYTES]);
        u32::from_le_bytes(raw)
    }

    pub fn write_u32(&mut self, pa: PhysicalAddress, value: u32) {
        let off = offset(pa);
        self.frame_mut(pa.frame())[off..off + ENTRY_BYTES].copy_from_slice(&value.to_le_bytes());
    }
}

impl core::fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysicalMemory")
            .field("total", &self.total_pages())
            .field("free", &self.nr_free)
            .field("blocks", &self.free_list.len())
            .finish()
    }
}

#[inline]
const fn pfn(index: usize) -> PageFrame {
    PageFrame::new(index as u64)
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn offset(pa: PhysicalAddress) -> usize {
    pa.page_offset() as usize
}
