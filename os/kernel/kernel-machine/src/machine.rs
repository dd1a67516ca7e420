//! # Simulated Machine
//!
//! Ties simulated RAM, page tables and the swap device together and plays the
//! part of the MMU: every byte access is translated through the current
//! address space's page table, and a miss raises a page fault that is handed
//! to [`resolve_page_fault`].
//!
//! ```text
//!  read_byte / write_byte
//!      │
//!      ├─ translate ── ok ──────────────────────────────► access RAM
//!      │
//!      └─ miss / protection ─► error code ─► resolve_page_fault
//!                                                │
//!                                   Err ◄────────┤
//!                                                └─► translate again ─► access RAM
//! ```
//!
//! The machine is the single collaborator object the resolver talks to: it
//! implements [`FrameAllocator`], [`PageTableWalker`] and [`SwapManager`].

use crate::config::MachineConfig;
use crate::memory::PhysicalMemory;
use crate::page_table::{self, EntryBits};
use crate::swap::{FifoQueue, SwapStore, pick_victim};
use kernel_vmm::{
    AddressSpace, AddressSpaceId, EntrySlot, EntryState, FrameAllocator, MapPermissions,
    PageFaultError, PageFrame, PageTableRoot, PageTableWalker, PhysicalAddress, SwapEntry,
    SwapError, SwapManager, VirtualAddress, VmError, resolve_page_fault,
};
use log::{debug, trace, warn};

/// Address space type used with a [`Machine`].
pub type MachineAddressSpace = AddressSpace<FifoQueue>;

/// Physical memory, swap device and fault delivery.
pub struct Machine {
    config: MachineConfig,
    memory: PhysicalMemory,
    swap: Option<SwapStore>,
    faults_delivered: u64,
}

impl Machine {
    #[must_use]
    pub fn new(config: MachineConfig) -> Self {
        let swap = config.swap.then(|| SwapStore::new(config.swap_slots));
        debug!(
            "machine: {} frames, swap {}",
            config.frames,
            if swap.is_some() { "on" } else { "off" }
        );
        Self {
            config,
            memory: PhysicalMemory::new(config.frames),
            swap,
            faults_delivered: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &MachineConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub const fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    #[inline]
    pub const fn memory_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.memory
    }

    #[inline]
    #[must_use]
    pub const fn swap_store(&self) -> Option<&SwapStore> {
        self.swap.as_ref()
    }

    /// Page faults raised by [`read_byte`](Self::read_byte) and
    /// [`write_byte`](Self::write_byte) on this machine.
    #[inline]
    #[must_use]
    pub const fn faults_delivered(&self) -> u64 {
        self.faults_delivered
    }

    /// Create an address space with a fresh, empty page directory.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the directory cannot be allocated.
    pub fn create_address_space(&mut self) -> Result<MachineAddressSpace, VmError> {
        let mut mm = AddressSpace::create(self)?;
        let root = page_table::create_page_directory(&mut self.memory)?;
        let previous = mm.set_page_table(root);
        debug_assert!(previous.is_none());
        Ok(mm)
    }

    /// Destroy `mm` and release its page directory, every frame mapped
    /// through it and every swap slot it still references.
    pub fn destroy_address_space(&mut self, mm: MachineAddressSpace) {
        let id = mm.id();
        let Some(root) = mm.destroy() else {
            return;
        };
        let swap = &mut self.swap;
        page_table::destroy_page_directory(&mut self.memory, root, |entry| {
            if let Some(store) = swap.as_mut() {
                store.discard(entry);
            }
        });
        debug!("machine: released page directory of {id}");
    }

    /// Evict up to `n` of the oldest resident pages of `mm` to the swap device.
    ///
    /// Returns the number of pages evicted; fewer than `n` if the queue runs
    /// dry.
    ///
    /// # Errors
    /// - [`VmError::SwapFailure`] with [`SwapError::Disabled`] if swapping is
    ///   inactive.
    /// - [`VmError::OutOfMemory`] if the swap device is full; the victim stays
    ///   resident at the head of the queue.
    pub fn swap_out(&mut self, mm: &mut MachineAddressSpace, n: usize) -> Result<usize, VmError> {
        let root = page_table_of(mm);
        let Some(store) = self.swap.as_mut() else {
            warn!("swap_out: swapping is inactive");
            return Err(SwapError::Disabled.into());
        };
        let Some(queue) = mm.swap_slot_mut().as_mut() else {
            return Ok(0);
        };

        let mut evicted = 0;
        while evicted < n {
            let Some((va, page)) = pick_victim(queue) else {
                break;
            };
            let Some(pte_at) = page_table::get_pte(&mut self.memory, root, va, false) else {
                warn!("swap_out: {va} queued but has no page table, dropped");
                continue;
            };
            if page_table::decode(self.memory.read_u32(pte_at)) != EntryState::Present(page) {
                warn!("swap_out: {va} no longer maps {page:?}, dropped");
                continue;
            }

            let Some(entry) = store.write(self.memory.frame(page)) else {
                queue.push_front((va, page));
                warn!("swap_out: swap device full");
                return Err(VmError::OutOfMemory);
            };
            self.memory
                .write_u32(pte_at, page_table::encode_swap_entry(entry));
            if self.memory.page_ref_dec(page) == 0 {
                self.memory.free_pages(page, 1);
            }
            trace!("swap_out: {va} ({page:?}) written to entry {entry}");
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Load the byte at `va` in `mm`, faulting it in if necessary.
    ///
    /// # Errors
    /// Whatever the fault resolver reports.
    pub fn read_byte(
        &mut self,
        mm: &mut MachineAddressSpace,
        va: VirtualAddress,
    ) -> Result<u8, VmError> {
        let pa = self.access(mm, va, false)?;
        Ok(self.memory.read_byte(pa))
    }

    /// Store `value` at `va` in `mm`, faulting the page in if necessary.
    ///
    /// # Errors
    /// Whatever the fault resolver reports.
    pub fn write_byte(
        &mut self,
        mm: &mut MachineAddressSpace,
        va: VirtualAddress,
        value: u8,
    ) -> Result<(), VmError> {
        let pa = self.access(mm, va, true)?;
        self.memory.write_byte(pa, value);
        Ok(())
    }

    /// Translate an access, delivering at most one page fault.
    ///
    /// # Panics
    /// If the access still faults after the resolver reported success.
    fn access(
        &mut self,
        mm: &mut MachineAddressSpace,
        va: VirtualAddress,
        write: bool,
    ) -> Result<PhysicalAddress, VmError> {
        let root = page_table_of(mm);
        let code = match self.check(root, va, write) {
            Ok(pa) => return Ok(pa),
            Err(code) => code,
        };

        self.faults_delivered += 1;
        trace!("mmu: fault at {va}: {}", code.explain());
        resolve_page_fault(mm, code, va, self)?;

        match self.check(root, va, write) {
            Ok(pa) => Ok(pa),
            Err(code) => panic!("{va} still faults after resolution ({})", code.explain()),
        }
    }

    /// The MMU's view of a user-mode access: a physical address, or the
    /// error code of the fault it raises.
    fn check(
        &self,
        root: PageTableRoot,
        va: VirtualAddress,
        write: bool,
    ) -> Result<PhysicalAddress, PageFaultError> {
        let code = PageFaultError::new().with_write(write).with_user(true);
        match page_table::translate(&self.memory, root, va) {
            None => Err(code),
            Some((_, bits)) if !allows(bits, write) => Err(code.with_present(true)),
            Some((pa, _)) => Ok(pa),
        }
    }
}

const fn allows(bits: EntryBits, write: bool) -> bool {
    bits.user() && (!write || bits.writable())
}

/// # Panics
/// If `mm` has no page directory.
fn page_table_of(mm: &MachineAddressSpace) -> PageTableRoot {
    mm.page_table()
        .unwrap_or_else(|| panic!("{} has no page directory", mm.id()))
}

impl FrameAllocator for Machine {
    /// Fresh anonymous pages read as zero.
    fn allocate_page(&mut self) -> Option<PageFrame> {
        let page = self.memory.alloc_pages(1)?;
        self.memory.zero_frame(page);
        Some(page)
    }

    fn free_page(&mut self, page: PageFrame) {
        self.memory.free_pages(page, 1);
    }

    fn free_page_count(&self) -> usize {
        self.memory.free_page_count()
    }

    fn record_mapping(&mut self, page: PageFrame, va: VirtualAddress) {
        self.memory.page_mut(page).set_pra_vaddr(Some(va));
    }
}

impl PageTableWalker for Machine {
    fn entry_slot(
        &mut self,
        root: PageTableRoot,
        va: VirtualAddress,
        create_if_missing: bool,
    ) -> Result<EntrySlot, VmError> {
        page_table::entry_slot(&mut self.memory, root, va, create_if_missing)
    }

    fn establish_mapping(
        &mut self,
        root: PageTableRoot,
        page: PageFrame,
        va: VirtualAddress,
        perm: MapPermissions,
    ) -> Result<(), VmError> {
        page_table::page_insert(&mut self.memory, root, page, va, perm)
    }
}

impl SwapManager for Machine {
    type Private = FifoQueue;

    fn is_active(&self) -> bool {
        self.swap.is_some()
    }

    fn register(&mut self, mm: AddressSpaceId) -> Result<Self::Private, VmError> {
        let mut queue = FifoQueue::new();
        queue.try_reserve(1).map_err(|_| VmError::OutOfMemory)?;
        trace!("swap: registered {mm}");
        Ok(queue)
    }

    fn swap_in(
        &mut self,
        _private: &mut Self::Private,
        va: VirtualAddress,
        entry: SwapEntry,
    ) -> Result<PageFrame, SwapError> {
        let store = self.swap.as_ref().ok_or(SwapError::Inactive(entry))?;
        let page = self
            .memory
            .alloc_pages(1)
            .ok_or(SwapError::OutOfMemory(entry))?;
        match store.read(entry) {
            Ok(content) => {
                *self.memory.frame_mut(page) = *content;
                trace!("swap: {va} read back from entry {entry} into {page:?}");
                Ok(page)
            }
            Err(e) => {
                self.memory.free_pages(page, 1);
                Err(e)
            }
        }
    }

    fn release_entry(&mut self, entry: SwapEntry) {
        if let Some(store) = self.swap.as_mut() {
            store.discard(entry);
        }
    }

    fn mark_swappable(&mut self, private: &mut Self::Private, va: VirtualAddress, page: PageFrame) {
        private.push_back((va, page));
    }
}

impl core::fmt::Debug for Machine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Machine")
            .field("memory", &self.memory)
            .field("swap", &self.swap)
            .field("faults_delivered", &self.faults_delivered)
            .finish()
    }
}
