//! # Two-Level Page Tables
//!
//! 32-bit paging: a page directory of 1024 entries, each pointing to a page
//! table of 1024 entries, each mapping one 4 KiB page.
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PDX  |  PTX  | Offset |
//!
//!  root (PD) ─► PDE[PDX] ─► PT ─► PTE[PTX] ─► frame
//! ```
//!
//! A leaf entry is in one of three states:
//!
//! | Raw value             | State                                    |
//! |:----------------------|:-----------------------------------------|
//! | `0`                   | unmapped                                 |
//! | `P = 1`               | present: frame number plus permissions   |
//! | `P = 0`, non-zero     | swapped: the value is a swap entry       |
//!
//! Page-table frames live in simulated RAM and are reached through
//! [`PhysicalMemory`]; missing page tables are allocated on demand.
//! Addresses at or above [`VA_LIMIT`] have no entry: they never translate and
//! cannot be mapped.

use crate::config::{ENTRIES_PER_TABLE, ENTRY_BYTES, PD_SHIFT, VA_LIMIT};
use crate::memory::PhysicalMemory;
use bitfield_struct::bitfield;
use kernel_vmm::{
    EntrySlot, EntryState, MapPermissions, PAGE_SHIFT, PageFrame, PageTableRoot,
    PhysicalAddress, SwapEntry, VirtualAddress, VmError,
};
use log::trace;

/// Raw layout of a 32-bit page-directory or page-table entry.
///
/// | Bits  | Name    | Meaning                         |
/// |-------|---------|---------------------------------|
/// | 0     | `P`     | present                         |
/// | 1     | `RW`    | writable                        |
/// | 2     | `US`    | user accessible                 |
/// | 3     | `PWT`   | write-through                   |
/// | 4     | `PCD`   | cache disabled                  |
/// | 5     | `A`     | accessed                        |
/// | 6     | `D`     | dirty (leaf only)               |
/// | 7     | `PS`    | 4 MiB page (directory only)     |
/// | 8     | `G`     | global                          |
/// | 9–11  | avail   | OS use                          |
/// | 12–31 | frame   | physical frame number           |
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct EntryBits {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global: bool,
    #[bits(3)]
    pub os_available: u8,
    #[bits(20)]
    frame_number: u32,
}

impl EntryBits {
    /// A present entry for `frame` with `perm`.
    ///
    /// # Panics
    /// If the frame lies beyond the 32-bit physical address space.
    #[must_use]
    pub fn make(frame: PageFrame, perm: MapPermissions) -> Self {
        let number = u32::try_from(frame.pfn())
            .ok()
            .filter(|&n| n < 1 << 20)
            .unwrap_or_else(|| panic!("{frame:?} not addressable by a 32-bit entry"));
        Self::new()
            .with_present(true)
            .with_writable(perm.contains(MapPermissions::WRITABLE))
            .with_user(perm.contains(MapPermissions::USER))
            .with_frame_number(number)
    }

    #[inline]
    #[must_use]
    pub fn frame(self) -> PageFrame {
        PageFrame::new(u64::from(self.frame_number()))
    }

    /// Permissions carried by a present entry.
    #[must_use]
    pub fn permissions(self) -> MapPermissions {
        let mut perm = MapPermissions::empty();
        perm.set(MapPermissions::WRITABLE, self.writable());
        perm.set(MapPermissions::USER, self.user());
        perm
    }
}

/// Decode a raw leaf entry.
#[must_use]
pub fn decode(raw: u32) -> EntryState {
    let bits = EntryBits::from_bits(raw);
    if raw == 0 {
        EntryState::Unmapped
    } else if bits.present() {
        EntryState::Present(bits.frame())
    } else {
        EntryState::Swapped(SwapEntry::new(u64::from(raw)))
    }
}

/// Raw form of a swap entry as stored in a leaf entry.
///
/// # Panics
/// If the entry is zero, has the present bit set, or does not fit 32 bits.
#[must_use]
pub fn encode_swap_entry(entry: SwapEntry) -> u32 {
    let raw = u32::try_from(entry.as_u64())
        .unwrap_or_else(|_| panic!("swap entry {entry} does not fit a 32-bit entry"));
    assert!(
        raw != 0 && !EntryBits::from_bits(raw).present(),
        "swap entry {entry} collides with the unmapped or present encoding"
    );
    raw
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn pdx(va: VirtualAddress) -> usize {
    ((va.as_u64() >> PD_SHIFT) as usize) & (ENTRIES_PER_TABLE - 1)
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn ptx(va: VirtualAddress) -> usize {
    ((va.as_u64() >> PAGE_SHIFT) as usize) & (ENTRIES_PER_TABLE - 1)
}

/// Whether `va` fits the 32-bit paging structures.
#[inline]
#[must_use]
pub const fn is_addressable(va: VirtualAddress) -> bool {
    va.as_u64() < VA_LIMIT
}

#[inline]
fn entry_address(table: PageFrame, index: usize) -> PhysicalAddress {
    table.join((index * ENTRY_BYTES) as u64)
}

/// Allocate an empty page directory.
///
/// # Errors
/// [`VmError::OutOfMemory`] if no frame is free.
pub fn create_page_directory(mem: &mut PhysicalMemory) -> Result<PageTableRoot, VmError> {
    let frame = mem.alloc_pages(1).ok_or(VmError::OutOfMemory)?;
    mem.zero_frame(frame);
    mem.set_page_ref(frame, 1);
    trace!("page directory at {frame:?}");
    Ok(PageTableRoot::new(frame))
}

/// Location of the leaf entry for `va`.
///
/// With `create`, a missing page table is allocated, zeroed and linked into
/// the directory. Returns `None` if the table is missing (and `create` is
/// unset) or cannot be allocated, and for addresses that are not
/// [addressable](is_addressable).
pub fn get_pte(
    mem: &mut PhysicalMemory,
    root: PageTableRoot,
    va: VirtualAddress,
    create: bool,
) -> Option<PhysicalAddress> {
    if !is_addressable(va) {
        return None;
    }
    let pde_at = entry_address(root.frame(), pdx(va));
    let pde = EntryBits::from_bits(mem.read_u32(pde_at));

    let table = if pde.present() {
        pde.frame()
    } else {
        if !create {
            return None;
        }
        let table = mem.alloc_pages(1)?;
        mem.set_page_ref(table, 1);
        mem.zero_frame(table);
        let link = EntryBits::make(table, MapPermissions::USER | MapPermissions::WRITABLE);
        mem.write_u32(pde_at, link.into_bits());
        trace!("page table for {va} at {table:?}");
        table
    };
    Some(entry_address(table, ptx(va)))
}

/// Snapshot of the leaf entry for `va`.
///
/// # Errors
/// - [`VmError::InvalidAddress`] if `va` is beyond the 32-bit range.
/// - [`VmError::OutOfMemory`] if the page table is missing and cannot be
///   created.
pub fn entry_slot(
    mem: &mut PhysicalMemory,
    root: PageTableRoot,
    va: VirtualAddress,
    create: bool,
) -> Result<EntrySlot, VmError> {
    if !is_addressable(va) {
        return Err(VmError::InvalidAddress(va));
    }
    let location = get_pte(mem, root, va, create).ok_or(VmError::OutOfMemory)?;
    Ok(EntrySlot::new(location, decode(mem.read_u32(location))))
}

/// Map `page` at `va`, replacing whatever was mapped there.
///
/// Takes a reference on `page`; a previously mapped different frame loses one
/// and is freed when it drops to zero.
///
/// # Errors
/// - [`VmError::InvalidAddress`] if `va` is beyond the 32-bit range.
/// - [`VmError::OutOfMemory`] if the page table cannot be allocated.
pub fn page_insert(
    mem: &mut PhysicalMemory,
    root: PageTableRoot,
    page: PageFrame,
    va: VirtualAddress,
    perm: MapPermissions,
) -> Result<(), VmError> {
    if !is_addressable(va) {
        return Err(VmError::InvalidAddress(va));
    }
    let pte_at = get_pte(mem, root, va, true).ok_or(VmError::OutOfMemory)?;
    mem.page_ref_inc(page);

    let old = EntryBits::from_bits(mem.read_u32(pte_at));
    if old.present() {
        if old.frame() == page {
            mem.page_ref_dec(page);
        } else {
            release(mem, old.frame());
        }
    }
    mem.write_u32(pte_at, EntryBits::make(page, perm).into_bits());
    Ok(())
}

/// Unmap the page at `va`, freeing its frame when unreferenced.
pub fn page_remove(mem: &mut PhysicalMemory, root: PageTableRoot, va: VirtualAddress) {
    let Some(pte_at) = get_pte(mem, root, va, false) else {
        return;
    };
    let old = EntryBits::from_bits(mem.read_u32(pte_at));
    if old.present() {
        release(mem, old.frame());
        mem.write_u32(pte_at, 0);
    }
}

/// Physical address and entry for `va` if it is mapped.
#[must_use]
pub fn translate(
    mem: &PhysicalMemory,
    root: PageTableRoot,
    va: VirtualAddress,
) -> Option<(PhysicalAddress, EntryBits)> {
    if !is_addressable(va) {
        return None;
    }
    let pde = EntryBits::from_bits(mem.read_u32(entry_address(root.frame(), pdx(va))));
    if !pde.present() {
        return None;
    }
    let pte = EntryBits::from_bits(mem.read_u32(entry_address(pde.frame(), ptx(va))));
    pte.present()
        .then(|| (pte.frame().join(va.page_offset()), pte))
}

/// Read the raw leaf entry for `va` without allocating anything.
#[must_use]
pub fn leaf_state(mem: &PhysicalMemory, root: PageTableRoot, va: VirtualAddress) -> EntryState {
    if !is_addressable(va) {
        return EntryState::Unmapped;
    }
    let pde = EntryBits::from_bits(mem.read_u32(entry_address(root.frame(), pdx(va))));
    if !pde.present() {
        return EntryState::Unmapped;
    }
    decode(mem.read_u32(entry_address(pde.frame(), ptx(va))))
}

/// Number of present leaf entries below `root`.
#[must_use]
pub fn mapped_pages(mem: &PhysicalMemory, root: PageTableRoot) -> usize {
    (0..ENTRIES_PER_TABLE)
        .map(|d| EntryBits::from_bits(mem.read_u32(entry_address(root.frame(), d))))
        .filter(|pde| pde.present())
        .map(|pde| {
            (0..ENTRIES_PER_TABLE)
                .filter(|&t| {
                    EntryBits::from_bits(mem.read_u32(entry_address(pde.frame(), t))).present()
                })
                .count()
        })
        .sum()
}

/// Tear down the tree below `root`, freeing mapped frames, page tables and
/// the directory itself. Swapped entries are handed to `on_swapped`.
pub fn destroy_page_directory<F>(mem: &mut PhysicalMemory, root: PageTableRoot, mut on_swapped: F)
where
    F: FnMut(SwapEntry),
{
    for d in 0..ENTRIES_PER_TABLE {
        let pde = EntryBits::from_bits(mem.read_u32(entry_address(root.frame(), d)));
        if !pde.present() {
            continue;
        }
        let table = pde.frame();
        for t in 0..ENTRIES_PER_TABLE {
            match decode(mem.read_u32(entry_address(table, t))) {
                EntryState::Unmapped => {}
                EntryState::Present(page) => release(mem, page),
                EntryState::Swapped(entry) => on_swapped(entry),
            }
        }
        mem.set_page_ref(table, 0);
        mem.free_pages(table, 1);
    }
    mem.set_page_ref(root.frame(), 0);
    mem.free_pages(root.frame(), 1);
    trace!("page directory at {:?} destroyed", root.frame());
}

/// Drop one reference on `page`, freeing it at zero.
fn release(mem: &mut PhysicalMemory, page: PageFrame) {
    if mem.page_ref_dec(page) == 0 {
        mem.free_pages(page, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW_USER: MapPermissions = MapPermissions::USER.union(MapPermissions::WRITABLE);

    fn setup() -> (PhysicalMemory, PageTableRoot) {
        let mut mem = PhysicalMemory::new(16);
        let root = create_page_directory(&mut mem).unwrap();
        (mem, root)
    }

    #[test]
    fn indices() {
        let va = VirtualAddress::new(0xC040_3123);
        assert_eq!(pdx(va), 0x301);
        assert_eq!(ptx(va), 0x003);
    }

    #[test]
    fn entry_layout() {
        let e = EntryBits::make(PageFrame::new(0x12345), RW_USER);
        assert_eq!(e.into_bits(), 0x1234_5007);
        assert_eq!(e.frame(), PageFrame::new(0x12345));
        assert_eq!(e.permissions(), RW_USER);
        assert_eq!(decode(0x1234_5007), EntryState::Present(PageFrame::new(0x12345)));
        assert_eq!(decode(0), EntryState::Unmapped);
        assert_eq!(decode(0x300), EntryState::Swapped(SwapEntry::new(0x300)));
    }

    #[test]
    fn get_pte_creates_table_on_demand() {
        let (mut mem, root) = setup();
        let va = VirtualAddress::new(0x0040_1000);
        assert_eq!(get_pte(&mut mem, root, va, false), None);
        assert_eq!(mem.free_page_count(), 15);

        let pte = get_pte(&mut mem, root, va, true).unwrap();
        assert_eq!(mem.free_page_count(), 14);
        assert_eq!(mem.read_u32(pte), 0);
        // second lookup reuses the table
        assert_eq!(get_pte(&mut mem, root, va, true), Some(pte));
        assert_eq!(mem.free_page_count(), 14);
    }

    #[test]
    fn insert_translate_remove() {
        let (mut mem, root) = setup();
        let page = mem.alloc_pages(1).unwrap();
        let va = VirtualAddress::new(0x2000);
        page_insert(&mut mem, root, page, va, MapPermissions::USER).unwrap();
        assert_eq!(mem.page_ref(page), 1);

        let (pa, bits) = translate(&mem, root, va + 0x10).unwrap();
        assert_eq!(pa, page.join(0x10));
        assert!(!bits.writable());
        assert_eq!(mapped_pages(&mem, root), 1);

        // re-inserting the same frame only updates permissions
        page_insert(&mut mem, root, page, va, RW_USER).unwrap();
        assert_eq!(mem.page_ref(page), 1);
        assert!(translate(&mem, root, va).unwrap().1.writable());

        let before = mem.free_page_count();
        page_remove(&mut mem, root, va);
        assert_eq!(translate(&mem, root, va), None);
        assert_eq!(mem.free_page_count(), before + 1);
    }

    #[test]
    fn replacing_a_mapping_frees_the_old_frame() {
        let (mut mem, root) = setup();
        let va = VirtualAddress::new(0x3000);
        let a = mem.alloc_pages(1).unwrap();
        let b = mem.alloc_pages(1).unwrap();
        page_insert(&mut mem, root, a, va, RW_USER).unwrap();
        let free = mem.free_page_count();
        page_insert(&mut mem, root, b, va, RW_USER).unwrap();
        assert_eq!(mem.free_page_count(), free + 1);
        assert_eq!(leaf_state(&mem, root, va), EntryState::Present(b));
    }

    #[test]
    fn destroy_returns_everything() {
        let mut mem = PhysicalMemory::new(16);
        let root = create_page_directory(&mut mem).unwrap();
        for va in [0x1000, 0x2000, 0x0080_0000] {
            let page = mem.alloc_pages(1).unwrap();
            page_insert(&mut mem, root, page, VirtualAddress::new(va), RW_USER).unwrap();
        }
        let swapped = get_pte(&mut mem, root, VirtualAddress::new(0x5000), true).unwrap();
        mem.write_u32(swapped, 0x100);

        let mut seen = Vec::new();
        destroy_page_directory(&mut mem, root, |e| seen.push(e));
        assert_eq!(seen, [SwapEntry::new(0x100)]);
        assert_eq!(mem.free_page_count(), 16);
    }

    #[test]
    fn out_of_memory_while_creating_table() {
        let mut mem = PhysicalMemory::new(1);
        let root = create_page_directory(&mut mem).unwrap();
        let err = entry_slot(&mut mem, root, VirtualAddress::new(0x1000), true).unwrap_err();
        assert_eq!(err, VmError::OutOfMemory);
    }

    #[test]
    fn addresses_past_32_bits_have_no_entry() {
        let (mut mem, root) = setup();
        let page = mem.alloc_pages(1).unwrap();
        page_insert(&mut mem, root, page, VirtualAddress::zero(), RW_USER).unwrap();

        let high = VirtualAddress::new(VA_LIMIT);
        assert_eq!(translate(&mem, root, high), None);
        assert_eq!(translate(&mem, root, high + 0x10), None);
        assert_eq!(get_pte(&mut mem, root, high, true), None);
        assert_eq!(
            entry_slot(&mut mem, root, high, true),
            Err(VmError::InvalidAddress(high))
        );
        assert_eq!(
            page_insert(&mut mem, root, page, high, RW_USER),
            Err(VmError::InvalidAddress(high))
        );
        assert_eq!(leaf_state(&mem, root, high), EntryState::Unmapped);
        assert_eq!(mem.page_ref(page), 1);
        assert_eq!(mapped_pages(&mem, root), 1);
    }

    #[test]
    #[should_panic(expected = "collides")]
    fn swap_entry_must_not_look_present() {
        let _ = encode_swap_entry(SwapEntry::new(0x101));
    }
}
