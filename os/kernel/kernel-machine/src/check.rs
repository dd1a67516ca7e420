//! # Virtual-Memory Self-Test
//!
//! Boot-time checks run against a [`Machine`]. Each check builds its own
//! address space and asserts that the machine's free page count is back to
//! where it started once the address space is gone.
//!
//! Invariant violations panic; errors from the fault path are returned.

use crate::config::PT_SPAN;
use crate::machine::Machine;
use crate::page_table;
use kernel_vmm::{EntryState, PAGE_SIZE, Region, RegionFlags, VirtualAddress, VmError};
use log::info;

/// Run every check that applies to `machine`.
///
/// The swap round trip is skipped when swapping is inactive.
///
/// # Errors
/// The first fault-path error any check runs into.
///
/// # Panics
/// If any check's assertions fail.
pub fn check_vmm(machine: &mut Machine) -> Result<(), VmError> {
    let free = machine.memory().free_page_count();

    check_vma_struct(machine)?;
    check_pgfault(machine)?;
    if machine.swap_store().is_some() {
        check_swap(machine)?;
    }

    assert_eq!(free, machine.memory().free_page_count());
    info!("check_vmm() succeeded.");
    Ok(())
}

/// Region insertion order and lookup over 100 small regions.
///
/// # Errors
/// [`VmError::OutOfMemory`] if the address space cannot be created.
///
/// # Panics
/// If ordering or lookup is wrong.
pub fn check_vma_struct(machine: &mut Machine) -> Result<(), VmError> {
    const STEP1: u64 = 10;
    const STEP2: u64 = STEP1 * 10;

    let free = machine.memory().free_page_count();
    let mut mm = machine.create_address_space()?;

    let region = |i: u64| {
        Region::new(
            VirtualAddress::new(i * 5),
            VirtualAddress::new(i * 5 + 2),
            RegionFlags::empty(),
        )
    };
    for i in (1..=STEP1).rev() {
        mm.insert(region(i));
    }
    for i in STEP1 + 1..=STEP2 {
        mm.insert(region(i));
    }

    assert_eq!(mm.len() as u64, STEP2);
    for (i, r) in (1..=STEP2).zip(mm.regions()) {
        assert_eq!(r.start(), VirtualAddress::new(i * 5));
        assert_eq!(r.end(), VirtualAddress::new(i * 5 + 2));
    }

    for i in (5..=5 * STEP2).step_by(5) {
        let va = |off: u64| VirtualAddress::new(i + off);
        let vma1 = mm.find(va(0)).and_then(|id| mm.region(id).cloned());
        let vma2 = mm.find(va(1)).and_then(|id| mm.region(id).cloned());
        let vma1 = vma1.unwrap_or_else(|| panic!("no region at {}", va(0)));
        let vma2 = vma2.unwrap_or_else(|| panic!("no region at {}", va(1)));
        assert_eq!(vma1, vma2);
        assert_eq!((vma1.start(), vma1.end()), (va(0), va(2)));
        for off in 2..5 {
            assert_eq!(mm.find(va(off)), None);
        }
    }
    for i in 0..5 {
        assert_eq!(mm.find(VirtualAddress::new(i)), None);
    }

    machine.destroy_address_space(mm);
    assert_eq!(free, machine.memory().free_page_count());
    info!("check_vma_struct() succeeded!");
    Ok(())
}

/// Demand paging: 100 byte writes and reads inside one writable page table
/// span fault in exactly one page.
///
/// # Errors
/// Any error from the fault path.
///
/// # Panics
/// If the data read back differs or more than one page got mapped.
pub fn check_pgfault(machine: &mut Machine) -> Result<(), VmError> {
    let free = machine.memory().free_page_count();
    let mut mm = machine.create_address_space()?;

    let id = mm.insert(Region::new(
        VirtualAddress::zero(),
        VirtualAddress::new(PT_SPAN),
        RegionFlags::WRITE,
    ));
    let addr = VirtualAddress::new(0x100);
    assert_eq!(mm.find(addr), Some(id));

    let faults = machine.faults_delivered();
    let mut sum: i64 = 0;
    for i in 0..100u8 {
        machine.write_byte(&mut mm, addr + u64::from(i), i)?;
        sum += i64::from(i);
    }
    for i in 0..100u8 {
        sum -= i64::from(machine.read_byte(&mut mm, addr + u64::from(i))?);
    }
    assert_eq!(sum, 0);
    assert_eq!(machine.faults_delivered() - faults, 1);

    let root = mm
        .page_table()
        .unwrap_or_else(|| panic!("{} lost its page directory", mm.id()));
    assert_eq!(page_table::mapped_pages(machine.memory(), root), 1);
    page_table::page_remove(machine.memory_mut(), root, addr.page_base());
    assert_eq!(page_table::mapped_pages(machine.memory(), root), 0);

    machine.destroy_address_space(mm);
    assert_eq!(free, machine.memory().free_page_count());
    info!("check_pgfault() succeeded!");
    Ok(())
}

/// Swap round trip: evicted pages come back with their content intact.
///
/// # Errors
/// Any error from the fault path or the swap device.
///
/// # Panics
/// If content is lost, or frames or swap slots leak.
pub fn check_swap(machine: &mut Machine) -> Result<(), VmError> {
    const PAGES: u64 = 4;

    let free = machine.memory().free_page_count();
    let slots = machine.swap_store().map_or(0, |s| s.used());
    let mut mm = machine.create_address_space()?;
    mm.insert(Region::new(
        VirtualAddress::zero(),
        VirtualAddress::new(2 * PAGES * PAGE_SIZE),
        RegionFlags::READ | RegionFlags::WRITE,
    ));

    let page = |p: u64| VirtualAddress::new(p * PAGE_SIZE);
    for p in 0..PAGES {
        let tag = pattern(p);
        machine.write_byte(&mut mm, page(p), tag)?;
        machine.write_byte(&mut mm, page(p) + (PAGE_SIZE - 1), !tag)?;
    }

    let resident = machine.memory().free_page_count();
    assert_eq!(machine.swap_out(&mut mm, 2)?, 2);
    assert_eq!(machine.memory().free_page_count(), resident + 2);

    let root = mm
        .page_table()
        .unwrap_or_else(|| panic!("{} lost its page directory", mm.id()));
    for p in 0..2 {
        let state = page_table::leaf_state(machine.memory(), root, page(p));
        assert!(
            matches!(state, EntryState::Swapped(_)),
            "{} should be swapped out, is {state:?}",
            page(p)
        );
    }

    let faults = machine.faults_delivered();
    for p in 0..PAGES {
        let tag = pattern(p);
        assert_eq!(machine.read_byte(&mut mm, page(p))?, tag);
        assert_eq!(machine.read_byte(&mut mm, page(p) + (PAGE_SIZE - 1))?, !tag);
    }
    assert_eq!(machine.faults_delivered() - faults, 2);
    assert_eq!(machine.memory().free_page_count(), resident);

    machine.destroy_address_space(mm);
    assert_eq!(free, machine.memory().free_page_count());
    assert_eq!(slots, machine.swap_store().map_or(0, |s| s.used()));
    info!("check_swap() succeeded!");
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
const fn pattern(page: u64) -> u8 {
    0xA0 | (page as u8)
}
