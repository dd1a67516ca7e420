use kernel_machine::{
    Machine, MachineAddressSpace, MachineConfig, PT_SPAN, VA_LIMIT, check, page_table,
};
use kernel_vmm::{
    EntryState, FaultAccess, PAGE_SIZE, PageFaultError, Region, RegionFlags, SwapError,
    VirtualAddress, VmError, page_fault_count, resolve_page_fault,
};

const RW: RegionFlags = RegionFlags::READ.union(RegionFlags::WRITE);

fn machine() -> Machine {
    Machine::new(MachineConfig::new(64).with_swap_slots(8))
}

fn region(start: u64, end: u64, flags: RegionFlags) -> Region {
    Region::new(VirtualAddress::new(start), VirtualAddress::new(end), flags)
}

fn fault(present: bool, write: bool) -> PageFaultError {
    PageFaultError::new()
        .with_present(present)
        .with_write(write)
        .with_user(true)
}

fn leaf(machine: &Machine, mm: &MachineAddressSpace, va: u64) -> EntryState {
    let root = mm.page_table().expect("page directory");
    page_table::leaf_state(machine.memory(), root, VirtualAddress::new(va))
}

#[test]
fn self_test_passes() {
    let mut machine = Machine::new(MachineConfig::default());
    let free = machine.memory().free_page_count();
    check::check_vmm(&mut machine).expect("check_vmm");
    assert_eq!(machine.memory().free_page_count(), free);
}

#[test]
fn self_test_without_swap() {
    let mut machine = Machine::new(MachineConfig::default().with_swap(false));
    check::check_vmm(&mut machine).expect("check_vmm");
}

#[test]
fn sequential_bytes_share_one_page() {
    let mut machine = machine();
    let mut mm = machine.create_address_space().unwrap();
    mm.insert(region(0, PT_SPAN, RegionFlags::WRITE));

    let base = VirtualAddress::new(0x100);
    let mut sum = 0i32;
    for i in 0..100u8 {
        machine.write_byte(&mut mm, base + u64::from(i), i).unwrap();
        sum += i32::from(i);
    }
    for i in 0..100u8 {
        sum -= i32::from(machine.read_byte(&mut mm, base + u64::from(i)).unwrap());
    }
    assert_eq!(sum, 0);
    assert_eq!(machine.faults_delivered(), 1);

    let root = mm.page_table().unwrap();
    assert_eq!(page_table::mapped_pages(machine.memory(), root), 1);
    machine.destroy_address_space(mm);
}

#[test]
fn present_read_fault_is_denied_for_any_flags() {
    for flags in [RegionFlags::empty(), RegionFlags::READ, RW, RegionFlags::all()] {
        let mut machine = machine();
        let mut mm = machine.create_address_space().unwrap();
        mm.insert(region(0x1000, 0x2000, flags));
        let va = VirtualAddress::new(0x1000);

        let err = resolve_page_fault(&mut mm, fault(true, false), va, &mut machine).unwrap_err();
        assert_eq!(
            err,
            VmError::PermissionDenied {
                addr: va,
                access: FaultAccess::ReadPresent,
                flags,
            }
        );
        machine.destroy_address_space(mm);
    }
}

#[test]
fn faults_outside_regions_are_invalid() {
    let mut machine = machine();
    let mut mm = machine.create_address_space().unwrap();
    mm.insert(region(0x4000, 0x6000, RW));

    for addr in [0x0, 0x3fff, 0x6000, 0x10_0000] {
        let va = VirtualAddress::new(addr);
        for code in [fault(false, false), fault(false, true)] {
            let err = resolve_page_fault(&mut mm, code, va, &mut machine).unwrap_err();
            assert_eq!(err, VmError::InvalidAddress(va));
        }
    }

    assert_eq!(
        machine.read_byte(&mut mm, VirtualAddress::new(0x1000)),
        Err(VmError::InvalidAddress(VirtualAddress::new(0x1000)))
    );
    machine.destroy_address_space(mm);
}

#[test]
fn write_to_read_only_region_leaves_slot_unmapped() {
    let mut machine = machine();
    let mut mm = machine.create_address_space().unwrap();
    mm.insert(region(0x1000, 0x2000, RegionFlags::READ));
    let free = machine.memory().free_page_count();

    let err = machine
        .write_byte(&mut mm, VirtualAddress::new(0x1800), 1)
        .unwrap_err();
    assert!(matches!(
        err,
        VmError::PermissionDenied {
            access: FaultAccess::WriteNotPresent,
            ..
        }
    ));
    assert_eq!(leaf(&machine, &mm, 0x1000), EntryState::Unmapped);
    assert_eq!(machine.memory().free_page_count(), free);

    // reading is still fine
    assert_eq!(machine.read_byte(&mut mm, VirtualAddress::new(0x1800)), Ok(0));
    machine.destroy_address_space(mm);
}

#[test]
fn fresh_pages_read_as_zero() {
    let mut machine = machine();
    let mut mm = machine.create_address_space().unwrap();
    mm.insert(region(0, 4 * PAGE_SIZE, RW));

    machine.write_byte(&mut mm, VirtualAddress::new(10), 0x5A).unwrap();
    assert_eq!(machine.read_byte(&mut mm, VirtualAddress::new(10)), Ok(0x5A));
    assert_eq!(leaf(&machine, &mm, PAGE_SIZE), EntryState::Unmapped);

    let root = mm.page_table().unwrap();
    page_table::page_remove(machine.memory_mut(), root, VirtualAddress::zero());
    assert_eq!(leaf(&machine, &mm, 0), EntryState::Unmapped);

    // the next fault hands out a wiped frame
    assert_eq!(machine.read_byte(&mut mm, VirtualAddress::new(10)), Ok(0));
    machine.destroy_address_space(mm);
}

#[test]
fn swap_round_trip_preserves_content() {
    let mut machine = machine();
    let free = machine.memory().free_page_count();
    let mut mm = machine.create_address_space().unwrap();
    mm.insert(region(0, 8 * PAGE_SIZE, RW));

    for p in 0..5u8 {
        let va = VirtualAddress::new(u64::from(p) * PAGE_SIZE + 7);
        machine.write_byte(&mut mm, va, p + 1).unwrap();
    }
    assert_eq!(mm.swap_slot().as_ref().map(|q| q.len()), Some(5));

    assert_eq!(machine.swap_out(&mut mm, 3), Ok(3));
    assert_eq!(machine.swap_store().unwrap().used(), 3);
    for p in 0..3 {
        assert!(matches!(leaf(&machine, &mm, p * PAGE_SIZE), EntryState::Swapped(_)));
    }
    assert!(matches!(leaf(&machine, &mm, 3 * PAGE_SIZE), EntryState::Present(_)));

    // a write brings a swapped page back as well
    machine
        .write_byte(&mut mm, VirtualAddress::new(PAGE_SIZE + 8), 0xEE)
        .unwrap();
    for p in 0..5u8 {
        let va = VirtualAddress::new(u64::from(p) * PAGE_SIZE + 7);
        assert_eq!(machine.read_byte(&mut mm, va), Ok(p + 1));
    }
    assert_eq!(
        machine.read_byte(&mut mm, VirtualAddress::new(PAGE_SIZE + 8)),
        Ok(0xEE)
    );
    assert_eq!(machine.swap_store().unwrap().used(), 0);

    // swapped-in pages rejoin the queue at the back
    let order: Vec<u64> = mm
        .swap_slot()
        .as_ref()
        .unwrap()
        .iter()
        .map(|(va, _)| va.as_u64())
        .collect();
    assert_eq!(order, [3 * PAGE_SIZE, 4 * PAGE_SIZE, PAGE_SIZE, 0, 2 * PAGE_SIZE]);

    machine.destroy_address_space(mm);
    assert_eq!(machine.memory().free_page_count(), free);
}

#[test]
fn destroying_a_partly_swapped_space_releases_swap_slots() {
    let mut machine = machine();
    let free = machine.memory().free_page_count();
    let mut mm = machine.create_address_space().unwrap();
    mm.insert(region(0, 4 * PAGE_SIZE, RW));
    for p in 0..4 {
        machine
            .write_byte(&mut mm, VirtualAddress::new(p * PAGE_SIZE), 1)
            .unwrap();
    }
    assert_eq!(machine.swap_out(&mut mm, 10), Ok(4));
    machine.destroy_address_space(mm);
    assert_eq!(machine.swap_store().unwrap().used(), 0);
    assert_eq!(machine.memory().free_page_count(), free);
}

#[test]
fn full_swap_device_keeps_the_victim_resident() {
    let mut machine = Machine::new(MachineConfig::new(32).with_swap_slots(1));
    let mut mm = machine.create_address_space().unwrap();
    mm.insert(region(0, 2 * PAGE_SIZE, RW));
    machine.write_byte(&mut mm, VirtualAddress::new(0), 1).unwrap();
    machine
        .write_byte(&mut mm, VirtualAddress::new(PAGE_SIZE), 2)
        .unwrap();

    assert_eq!(machine.swap_out(&mut mm, 2), Err(VmError::OutOfMemory));
    assert!(matches!(leaf(&machine, &mm, 0), EntryState::Swapped(_)));
    assert!(matches!(leaf(&machine, &mm, PAGE_SIZE), EntryState::Present(_)));
    assert_eq!(machine.read_byte(&mut mm, VirtualAddress::new(PAGE_SIZE)), Ok(2));
    machine.destroy_address_space(mm);
}

#[test]
fn swapped_entry_with_swap_disabled_is_a_swap_failure() {
    let mut machine = Machine::new(MachineConfig::new(32).with_swap(false));
    let mut mm = machine.create_address_space().unwrap();
    mm.insert(region(0, PAGE_SIZE, RW));
    assert!(!mm.swap_slot().is_active());

    let root = mm.page_table().unwrap();
    let pte = page_table::get_pte(machine.memory_mut(), root, VirtualAddress::new(0), true)
        .unwrap();
    machine.memory_mut().write_u32(pte, 5 << 8);

    let err = machine
        .read_byte(&mut mm, VirtualAddress::new(0))
        .unwrap_err();
    assert!(matches!(err, VmError::SwapFailure(SwapError::Inactive(_))));
    assert!(matches!(leaf(&machine, &mm, 0), EntryState::Swapped(_)));

    // clear the forged entry before tearing down
    machine.memory_mut().write_u32(pte, 0);
    machine.destroy_address_space(mm);
}

#[test]
fn swap_out_without_swap_device_is_disabled() {
    let mut machine = Machine::new(MachineConfig::new(32).with_swap(false));
    let mut mm = machine.create_address_space().unwrap();
    mm.insert(region(0, PAGE_SIZE, RW));
    machine.write_byte(&mut mm, VirtualAddress::new(0), 1).unwrap();

    let err = machine.swap_out(&mut mm, 1).unwrap_err();
    assert_eq!(err, VmError::SwapFailure(SwapError::Disabled));
    assert_eq!(err.to_string(), "swap failure: swapping is inactive");
    assert!(matches!(leaf(&machine, &mm, 0), EntryState::Present(_)));
    machine.destroy_address_space(mm);
}

#[test]
fn regions_past_32_bits_do_not_alias_low_pages() {
    let mut machine = machine();
    let free = machine.memory().free_page_count();
    let mut mm = machine.create_address_space().unwrap();
    mm.insert(region(0, PAGE_SIZE, RW));
    mm.insert(region(VA_LIMIT, VA_LIMIT + PAGE_SIZE, RW));

    machine.write_byte(&mut mm, VirtualAddress::zero(), 0x11).unwrap();
    let faults = machine.faults_delivered();
    let high = VirtualAddress::new(VA_LIMIT);
    assert_eq!(
        machine.write_byte(&mut mm, high, 0x22),
        Err(VmError::InvalidAddress(high))
    );
    assert_eq!(
        machine.read_byte(&mut mm, high + 0x10),
        Err(VmError::InvalidAddress(high))
    );
    assert_eq!(machine.faults_delivered(), faults + 2);
    assert_eq!(machine.read_byte(&mut mm, VirtualAddress::zero()), Ok(0x11));

    let root = mm.page_table().unwrap();
    assert_eq!(page_table::mapped_pages(machine.memory(), root), 1);
    machine.destroy_address_space(mm);
    assert_eq!(machine.memory().free_page_count(), free);
}

#[test]
fn running_out_of_frames_is_out_of_memory() {
    // directory + one page table + one data page
    let mut machine = Machine::new(MachineConfig::new(3).with_swap(false));
    let mut mm = machine.create_address_space().unwrap();
    mm.insert(region(0, 2 * PAGE_SIZE, RW));

    machine.write_byte(&mut mm, VirtualAddress::new(0), 1).unwrap();
    assert_eq!(machine.memory().free_page_count(), 0);
    assert_eq!(
        machine.write_byte(&mut mm, VirtualAddress::new(PAGE_SIZE), 1),
        Err(VmError::OutOfMemory)
    );
    assert_eq!(leaf(&machine, &mm, PAGE_SIZE), EntryState::Unmapped);
    machine.destroy_address_space(mm);
    assert_eq!(machine.memory().free_page_count(), 3);
}

#[test]
fn write_to_present_read_only_mapping_upgrades_it() {
    let mut machine = machine();
    let mut mm = machine.create_address_space().unwrap();
    let id = mm.insert(region(0, PAGE_SIZE, RegionFlags::READ));

    // read maps the page without write permission
    assert_eq!(machine.read_byte(&mut mm, VirtualAddress::new(0)), Ok(0));
    let page = match leaf(&machine, &mm, 0) {
        EntryState::Present(page) => page,
        other => panic!("expected a present entry, got {other:?}"),
    };

    // the region becomes writable; the next write faults on the present page
    let old = mm.remove(id).unwrap();
    assert_eq!(old.flags(), RegionFlags::READ);
    mm.insert(region(0, PAGE_SIZE, RW));
    let faults = machine.faults_delivered();
    machine.write_byte(&mut mm, VirtualAddress::new(1), 9).unwrap();
    assert_eq!(machine.faults_delivered(), faults + 1);
    assert_eq!(leaf(&machine, &mm, 0), EntryState::Present(page));
    assert_eq!(machine.memory().page_ref(page), 1);
    machine.destroy_address_space(mm);
}

#[test]
fn fault_counter_is_monotonic() {
    let mut machine = machine();
    let mut mm = machine.create_address_space().unwrap();
    mm.insert(region(0, PAGE_SIZE, RW));
    let before = page_fault_count();
    machine.write_byte(&mut mm, VirtualAddress::new(0), 1).unwrap();
    let _ = machine.read_byte(&mut mm, VirtualAddress::new(PAGE_SIZE));
    assert!(page_fault_count() >= before + 2);
    machine.destroy_address_space(mm);
}
