//! # Virtual Memory Management
//!
//! Per-process virtual-memory bookkeeping and page-fault resolution for a
//! small teaching kernel.
//!
//! ## What you get
//! - An [`AddressSpace`] holding an ordered, non-overlapping set of
//!   [`Region`]s with a one-entry lookup cache.
//! - Tiny [`VirtualAddress`]/[`PhysicalAddress`]/[`PageFrame`] newtypes to
//!   avoid mixing address kinds.
//! - The [`PageFaultError`] error-code decoder and [`resolve_page_fault`],
//!   which turns a fault into a fresh mapping, a swap-in, or a [`VmError`].
//! - Narrow collaborator traits ([`FrameAllocator`], [`PageTableWalker`],
//!   [`SwapManager`]) so the core never owns physical memory, page tables or
//!   backing storage.
//!
//! ## Fault path
//!
//! ```text
//!  trap handler
//!      │ error code, faulting address
//!      ▼
//!  resolve_page_fault ──► AddressSpace::find ──► Region (flags)
//!      │
//!      ├──► PageTableWalker::entry_slot ──► Unmapped | Present | Swapped
//!      ├──► FrameAllocator::allocate_page
//!      ├──► SwapManager::swap_in / mark_swappable
//!      └──► PageTableWalker::establish_mapping
//! ```
//!
//! ## Error-code bits
//!
//! | Bit | Name    | Meaning when set                  |
//! |:----|:--------|:----------------------------------|
//! | 0   | present | protection violation on a present page |
//! | 1   | write   | the access was a write            |
//! | 2   | user    | the access came from user mode    |
//!
//! Only bits 0 and 1 select the resolution path.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address_space;
mod addresses;
mod error;
pub mod fault;
pub mod mmu;
mod region;

pub use crate::address_space::{AddressSpace, AddressSpaceId, SwapSlot};
pub use crate::addresses::{
    PAGE_SHIFT, PAGE_SIZE, PageFrame, PhysicalAddress, VirtualAddress, align_down, align_up,
};
pub use crate::error::{SwapError, VmError};
pub use crate::fault::{FaultAccess, PageFaultError, page_fault_count, resolve_page_fault};
pub use crate::mmu::{
    EntrySlot, EntryState, FrameAllocator, MapPermissions, NoSwap, PageTableRoot,
    PageTableWalker, SwapEntry, SwapManager,
};
pub use crate::region::{Region, RegionFlags, RegionId};
