//! # Simulated Machine for the VM Core
//!
//! Hosted implementations of everything [`kernel_vmm`] expects from the rest
//! of the kernel, plus the boot-time self test.
//!
//! | Module         | Provides                                                   |
//! |:---------------|:-----------------------------------------------------------|
//! | [`memory`]     | simulated RAM, page descriptors, first-fit page allocator  |
//! | [`page_table`] | two-level 32-bit page tables                               |
//! | [`swap`]       | RAM-backed swap device and FIFO replacement                |
//! | [`machine`]    | the MMU: byte access, fault delivery, swap-out             |
//! | [`check`]      | `check_vmm` and its sub-checks                             |
//!
//! ## Example
//! ```rust
//! # use kernel_machine::{Machine, MachineConfig};
//! # use kernel_vmm::{Region, RegionFlags, VirtualAddress};
//! let mut machine = Machine::new(MachineConfig::default());
//! let mut mm = machine.create_address_space().unwrap();
//! mm.insert(Region::new(
//!     VirtualAddress::new(0x1000),
//!     VirtualAddress::new(0x3000),
//!     RegionFlags::READ | RegionFlags::WRITE,
//! ));
//! machine.write_byte(&mut mm, VirtualAddress::new(0x1234), 42).unwrap();
//! assert_eq!(machine.read_byte(&mut mm, VirtualAddress::new(0x1234)).unwrap(), 42);
//! assert_eq!(machine.faults_delivered(), 1);
//! machine.destroy_address_space(mm);
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod check;
mod config;
pub mod machine;
pub mod memory;
mod page;
pub mod page_table;
pub mod swap;

pub use crate::check::check_vmm;
pub use crate::config::{
    DEFAULT_FRAMES, DEFAULT_SWAP_SLOTS, ENTRIES_PER_TABLE, ENTRY_BYTES, FRAME_BYTES,
    MachineConfig, PD_SHIFT, PT_SPAN, VA_LIMIT,
};
pub use crate::machine::{Machine, MachineAddressSpace};
pub use crate::memory::PhysicalMemory;
pub use crate::page::{Page, PageFlags};
pub use crate::swap::{FifoQueue, SwapStore};
