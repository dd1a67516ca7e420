//! # Page Fault Resolution
//!
//! Turns a hardware page-fault trap into either a new or restored mapping, or
//! a typed failure.
//!
//! ```text
//! trap ─► resolve_page_fault(mm, error code, CR2)
//!           │
//!           ├─ find region ─────────────── none / below start ─► InvalidAddress
//!           ├─ check access vs. flags ───── disallowed ─────────► PermissionDenied
//!           ├─ walk page table (create) ─── no memory ──────────► OutOfMemory
//!           └─ entry state
//!                ├─ Unmapped ─► allocate frame, map ─────────────► Ok / OutOfMemory
//!                ├─ Swapped  ─► swap in, map, mark swappable ─────► Ok / SwapFailure
//!                └─ Present  ─► re-map with region permissions ──► Ok
//! ```
//!
//! Nothing is mutated before the entry state is known, so every failure
//! before that point leaves the region collection and the page table exactly
//! as they were.

use crate::address_space::AddressSpace;
use crate::addresses::{PageFrame, VirtualAddress};
use crate::error::{SwapError, VmError};
use crate::mmu::{
    EntryState, FrameAllocator, MapPermissions, PageTableRoot, PageTableWalker, SwapEntry,
    SwapManager,
};
use crate::region::RegionFlags;
use bitfield_struct::bitfield;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{trace, warn};

/// Number of page faults seen since boot, successful or not.
static PAGE_FAULTS: AtomicU64 = AtomicU64::new(0);

/// Total number of calls to [`resolve_page_fault`] so far.
#[must_use]
pub fn page_fault_count() -> u64 {
    PAGE_FAULTS.load(Ordering::Relaxed)
}

/// Page-fault error code layout (x86).
///
/// Only bits 0 and 1 drive resolution; the remaining bits are decoded for
/// diagnostics.
/// Reference: Intel SDM Vol. 3A, §6.15 “Page-Fault Exception (#PF)”.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor mode.
    /// 1 = user mode.
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch.
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation.
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access.
    pub shadow_stack: bool, // bit 6

    #[bits(25)]
    __: u32, // reserved / ignored bits
}

/// The (present, write) combination of a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FaultAccess {
    /// First read or instruction fetch of an unmapped page.
    ReadNotPresent,
    /// Read on a mapped page that faulted anyway.
    ReadPresent,
    /// First write to an unmapped page.
    WriteNotPresent,
    /// Write to a mapped page that faulted.
    WritePresent,
}

impl PageFaultError {
    /// Classify by the present and write bits.
    #[must_use]
    pub const fn access(&self) -> FaultAccess {
        match (self.present(), self.write()) {
            (false, false) => FaultAccess::ReadNotPresent,
            (true, false) => FaultAccess::ReadPresent,
            (false, true) => FaultAccess::WriteNotPresent,
            (true, true) => FaultAccess::WritePresent,
        }
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (page not mapped or swapped out)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

impl fmt::Display for FaultAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadNotPresent => "read of non-present page",
            Self::ReadPresent => "read of present page",
            Self::WriteNotPresent => "write to non-present page",
            Self::WritePresent => "write to present page",
        })
    }
}

/// Resolve a page fault at `addr` in `mm`.
///
/// On success a mapping for the page containing `addr` is installed (fresh,
/// restored from swap, or re-installed with the region's permissions); there
/// is no other observable result.
///
/// # Errors
/// - [`VmError::InvalidAddress`] if no region covers `addr`, or `mm` has no
///   page table to map it in.
/// - [`VmError::PermissionDenied`] if the access is incompatible with the
///   region, or for any read fault on a present page.
/// - [`VmError::OutOfMemory`] if a page table or frame cannot be allocated.
/// - [`VmError::SwapFailure`] if a swapped page cannot be restored.
pub fn resolve_page_fault<P, M>(
    mm: &mut AddressSpace<P>,
    error: PageFaultError,
    addr: VirtualAddress,
    mmu: &mut M,
) -> Result<(), VmError>
where
    M: FrameAllocator + PageTableWalker + SwapManager<Private = P> + ?Sized,
{
    PAGE_FAULTS.fetch_add(1, Ordering::Relaxed);
    let access = error.access();

    let flags = match mm.lookup(addr) {
        Some(region) if region.start() <= addr => region.flags(),
        _ => {
            warn!("page fault: {addr} is not covered by any region of {}", mm.id());
            return Err(VmError::InvalidAddress(addr));
        }
    };

    if !access_allowed(access, flags) {
        warn!("page fault: {access} at {addr} denied, region flags {flags:?}");
        return Err(VmError::PermissionDenied {
            addr,
            access,
            flags,
        });
    }

    let mut perm = MapPermissions::USER;
    if flags.can_write() {
        perm |= MapPermissions::WRITABLE;
    }

    let va = addr.page_base();
    let Some(root) = mm.page_table() else {
        warn!("page fault: {} has no page table to map {addr}", mm.id());
        return Err(VmError::InvalidAddress(addr));
    };

    let slot = mmu.entry_slot(root, va, true).inspect_err(|e| {
        warn!("page fault: no page table for {va}: {e}");
    })?;

    match slot.state() {
        EntryState::Unmapped => map_fresh_page(mm, mmu, root, va, perm),
        EntryState::Swapped(entry) => swap_in_page(mm, mmu, root, va, entry, perm),
        EntryState::Present(page) => {
            trace!("page fault: re-mapping present {page:?} at {va} as {perm:?}");
            mmu.establish_mapping(root, page, va, perm)
        }
    }
}

/// Whether `access` is allowed on a region with `flags`.
///
/// A write to a present page is handled like a write to a non-present one:
/// both need a writable region.
const fn access_allowed(access: FaultAccess, flags: RegionFlags) -> bool {
    match access {
        FaultAccess::WriteNotPresent | FaultAccess::WritePresent => flags.can_write(),
        FaultAccess::ReadPresent => false,
        FaultAccess::ReadNotPresent => flags.can_read_or_exec(),
    }
}

fn map_fresh_page<P, M>(
    mm: &mut AddressSpace<P>,
    mmu: &mut M,
    root: PageTableRoot,
    va: VirtualAddress,
    perm: MapPermissions,
) -> Result<(), VmError>
where
    M: FrameAllocator + PageTableWalker + SwapManager<Private = P> + ?Sized,
{
    let Some(page) = mmu.allocate_page() else {
        warn!("page fault: no frame left to map {va}");
        return Err(VmError::OutOfMemory);
    };
    install(mmu, root, page, va, perm)?;

    if mmu.is_active()
        && let Some(private) = mm.swap_slot_mut().as_mut()
    {
        mmu.mark_swappable(private, va, page);
    }
    trace!("page fault: mapped fresh {page:?} at {va} as {perm:?}");
    Ok(())
}

fn swap_in_page<P, M>(
    mm: &mut AddressSpace<P>,
    mmu: &mut M,
    root: PageTableRoot,
    va: VirtualAddress,
    entry: SwapEntry,
    perm: MapPermissions,
) -> Result<(), VmError>
where
    M: FrameAllocator + PageTableWalker + SwapManager<Private = P> + ?Sized,
{
    // A swap entry can only exist if swapping ran before.
    let private = match mm.swap_slot_mut().as_mut() {
        Some(private) if mmu.is_active() => private,
        _ => {
            warn!("page fault: swap entry {entry} at {va} but swapping is inactive");
            return Err(SwapError::Inactive(entry).into());
        }
    };

    let page = mmu.swap_in(private, va, entry).inspect_err(|e| {
        warn!("page fault: swap-in of {va} failed: {e}");
    })?;
    // The entry still names the backing copy until the page is mapped.
    install(mmu, root, page, va, perm)?;
    mmu.release_entry(entry);
    mmu.mark_swappable(private, va, page);
    trace!("page fault: swapped in {page:?} at {va} from entry {entry}");
    Ok(())
}

/// Map `page` and record the reverse mapping; the frame is released again if
/// the mapping cannot be installed.
fn install<M>(
    mmu: &mut M,
    root: PageTableRoot,
    page: PageFrame,
    va: VirtualAddress,
    perm: MapPermissions,
) -> Result<(), VmError>
where
    M: FrameAllocator + PageTableWalker + ?Sized,
{
    if let Err(e) = mmu.establish_mapping(root, page, va, perm) {
        warn!("page fault: mapping {page:?} at {va} failed: {e}");
        mmu.free_page(page);
        return Err(e);
    }
    mmu.record_mapping(page, va);
    Ok(())
}
