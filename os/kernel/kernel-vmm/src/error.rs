//! # Errors
//!
//! Recoverable outcomes of virtual-memory operations. Contract violations
//! (malformed or overlapping regions, a corrupted region index) are not
//! represented here; they panic.

use crate::addresses::VirtualAddress;
use crate::fault::FaultAccess;
use crate::mmu::SwapEntry;
use crate::region::RegionFlags;

/// Error returned by address-space and fault-resolution operations.
///
/// None of these are retried by this crate; the trap-return path decides
/// what happens to the faulting context.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// An allocation failed somewhere along the chain.
    #[error("out of memory")]
    OutOfMemory,
    /// No region of the address space covers the address.
    #[error("no region covers address {0}")]
    InvalidAddress(VirtualAddress),
    /// The access is incompatible with the region's permissions, or is a
    /// protection fault on a present page.
    #[error("{access} at {addr} not permitted by region flags {flags:?}")]
    PermissionDenied {
        addr: VirtualAddress,
        access: FaultAccess,
        flags: RegionFlags,
    },
    /// A swapped-out page could not be brought back.
    #[error("swap failure: {0}")]
    SwapFailure(#[from] SwapError),
}

/// Cause of a [`VmError::SwapFailure`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwapError {
    /// An eviction was requested but no swap manager is active.
    #[error("swapping is inactive")]
    Disabled,
    /// A swap entry was found but no swap manager is active.
    #[error("swap entry {0} found while swapping is inactive")]
    Inactive(SwapEntry),
    /// The swap entry does not refer to readable backing storage.
    #[error("swap entry {0} cannot be read from backing storage")]
    Unreadable(SwapEntry),
    /// No frame was available to swap the page into.
    #[error("no free frame to swap in entry {0}")]
    OutOfMemory(SwapEntry),
}
