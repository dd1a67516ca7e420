//! # Machine Geometry and Configuration

use kernel_vmm::PAGE_SIZE;

/// Bytes in one physical frame.
pub const FRAME_BYTES: usize = 4096;

/// Entries in a page directory or page table (32-bit entries, one frame).
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Size of one page-table entry in bytes.
pub const ENTRY_BYTES: usize = 4;

/// Shift of the page-directory index in a virtual address.
pub const PD_SHIFT: u32 = 22;

/// Virtual range covered by one page table (one page-directory entry): 4 MiB.
pub const PT_SPAN: u64 = ENTRIES_PER_TABLE as u64 * PAGE_SIZE;

/// First virtual address past the 32-bit range the page tables can map.
pub const VA_LIMIT: u64 = 1 << 32;

/// Frames of simulated RAM in the default configuration.
pub const DEFAULT_FRAMES: usize = 256;

/// Slots in the simulated swap device in the default configuration.
pub const DEFAULT_SWAP_SLOTS: usize = 64;

const _: () = {
    assert!(FRAME_BYTES as u64 == PAGE_SIZE);
    assert!(ENTRIES_PER_TABLE * ENTRY_BYTES == FRAME_BYTES);
    assert!(PT_SPAN == 1 << PD_SHIFT);
    assert!(VA_LIMIT == ENTRIES_PER_TABLE as u64 * PT_SPAN);
};

/// Shape of a simulated machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MachineConfig {
    /// Frames of physical memory.
    pub frames: usize,
    /// Whether the swap manager is initialised at boot.
    pub swap: bool,
    /// Pages the swap device can hold.
    pub swap_slots: usize,
}

impl MachineConfig {
    #[must_use]
    pub const fn new(frames: usize) -> Self {
        Self {
            frames,
            swap: true,
            swap_slots: DEFAULT_SWAP_SLOTS,
        }
    }

    #[must_use]
    pub const fn with_swap(mut self, swap: bool) -> Self {
        self.swap = swap;
        self
    }

    #[must_use]
    pub const fn with_swap_slots(mut self, slots: usize) -> Self {
        self.swap_slots = slots;
        self
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_FRAMES)
    }
}
