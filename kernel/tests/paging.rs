use proptest::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use vmkernel::block::block_core::{Block, BlockDriver, BlockType};
use vmkernel::drivers::ram_disk::RamDisk;
use vmkernel::fs::{File, MemFile};
use vmkernel::user_program::loader::ProgramSegment;
use vmkernel::user_program::process::{FaultOutcome, Process, ProcessState};
use vmkernel::vm::fault::handle_page_fault;
use vmkernel::vm::page::PageState;
use vmkernel::vm::swap::SECTORS_PER_PAGE;
use vmkernel::vm::{VirtualMemory, VmConfig};
use vmkernel_shared::mem::{PAGE_FRAME_SIZE, PHYS_BASE};

const CODE: usize = 0x0804_8000;

fn vm(frames: usize, swap_slots: usize) -> VirtualMemory {
    let sectors = (swap_slots * SECTORS_PER_PAGE) as u32;
    VirtualMemory::new(
        VmConfig {
            user_frames: frames,
        },
        Block::new(
            BlockType::Swap,
            "swap",
            sectors,
            BlockDriver::RamDisk(RamDisk::new(sectors)),
        ),
    )
}

fn program(pages: usize) -> Arc<dyn File> {
    Arc::new(MemFile::new(
        (0..pages * PAGE_FRAME_SIZE).map(|i| (i / 7) as u8).collect(),
    ))
}

fn data_segment(pages: usize) -> ProgramSegment {
    ProgramSegment {
        offset: 0,
        vaddr: CODE,
        file_size: pages * PAGE_FRAME_SIZE,
        mem_size: pages * PAGE_FRAME_SIZE,
        writable: true,
    }
}

/// Swaps one page of a scratch process out so the swap bitmap is not empty.
fn occupy_one_slot(vm: &VirtualMemory, state: &ProcessState) -> Process {
    let mut scratch = Process::new(state);
    let space = scratch.address_space().clone();
    for page in [0x1000_0000, 0x1000_1000] {
        space
            .register_lazy(page, None, 0, 0, PAGE_FRAME_SIZE, true)
            .unwrap();
    }
    assert!(scratch.write_user(vm, 0x1000_0000, &[1]));
    assert!(scratch.write_user(vm, 0x1000_1000, &[2]));
    scratch
}

#[test]
fn untouched_process_leaves_nothing_behind() {
    let vm = vm(1, 4);
    let state = ProcessState::default();
    let mut scratch = occupy_one_slot(&vm, &state);
    let swap_before = vm.swap().used_sectors();
    assert_eq!(swap_before, SECTORS_PER_PAGE);

    let (mut process, esp) = Process::load(&state, &program(3), &[data_segment(3)]).unwrap();
    assert_eq!(esp, PHYS_BASE);
    assert_eq!(process.address_space().lock().page_table.len(), 4);
    assert_eq!(vm.frames().frames_owned_by(process.pid()), 0);

    process.exit(&vm, 0);
    assert_eq!(vm.frames().frames_owned_by(process.pid()), 0);
    assert_eq!(vm.swap().used_sectors(), swap_before);
    assert!(process.address_space().lock().page_table.is_empty());

    scratch.exit(&vm, 0);
    assert_eq!(vm.swap().used_sectors(), 0);
    assert_eq!(vm.pool().frames_allocated(), 0);
}

#[test]
fn dirty_eviction_costs_one_page_of_sector_io() {
    let vm = vm(1, 4);
    let state = ProcessState::default();
    let (mut process, _) = Process::load(&state, &program(2), &[data_segment(2)]).unwrap();

    assert!(process.write_user(&vm, CODE, &[0xAA; 16]));
    assert_eq!(vm.swap().device_counts(), (0, 0));

    // Bringing in the second page evicts the first, which is dirty.
    assert_eq!(
        process.page_fault(&vm, CODE + PAGE_FRAME_SIZE),
        FaultOutcome::Resolved
    );
    assert_eq!(vm.swap().device_counts(), (0, SECTORS_PER_PAGE as u32));
    let slot = {
        let inner = process.address_space().lock();
        match inner.page_table.find(CODE).unwrap().state() {
            PageState::Swapped(slot) => slot,
            state => panic!("expected the first page in swap, found {:?}", state),
        }
    };
    assert!(vm.swap().is_reserved(slot));
    assert_eq!(vm.swap().used_sectors(), SECTORS_PER_PAGE);

    // The second page was never written, so evicting it costs no I/O.
    assert_eq!(process.read_user(&vm, CODE, 16), Some(vec![0xAA; 16]));
    assert_eq!(
        vm.swap().device_counts(),
        (SECTORS_PER_PAGE as u32, SECTORS_PER_PAGE as u32)
    );
    assert!(!vm.swap().is_reserved(slot));
    assert_eq!(vm.swap().used_sectors(), 0);

    process.exit(&vm, 0);
}

#[test]
fn file_contents_survive_memory_pressure() {
    let pages = 6;
    let vm = vm(2, 8);
    let state = ProcessState::default();
    let file = program(pages);
    let (mut process, _) = Process::load(&state, &file, &[data_segment(pages)]).unwrap();

    let mut expected = vec![0; pages * PAGE_FRAME_SIZE];
    assert_eq!(file.read(0, &mut expected), expected.len());

    for page in (0..pages).step_by(2) {
        let addr = CODE + page * PAGE_FRAME_SIZE + 100;
        assert!(process.write_user(&vm, addr, &[page as u8; 8]));
        expected[page * PAGE_FRAME_SIZE + 100..page * PAGE_FRAME_SIZE + 108].fill(page as u8);
    }

    let read = process
        .read_user(&vm, CODE, pages * PAGE_FRAME_SIZE)
        .unwrap();
    assert_eq!(read, expected);
    assert!(vm.frames().stats().evictions > 0);
    assert!(vm.frames().stats().entries <= 2);

    process.exit(&vm, 0);
    assert_eq!(vm.swap().used_slots(), 0);
    assert_eq!(vm.pool().frames_allocated(), 0);
}

#[test]
fn processes_share_the_pool() {
    let vm = vm(3, 16);
    let state = ProcessState::default();
    let file = program(4);
    let mut processes: Vec<Process> = (0..3)
        .map(|_| Process::load(&state, &file, &[data_segment(4)]).unwrap().0)
        .collect();

    for (i, process) in processes.iter_mut().enumerate() {
        for page in 0..4 {
            let tag = [i as u8 * 16 + page as u8; 32];
            assert!(process.write_user(&vm, CODE + page * PAGE_FRAME_SIZE, &tag));
        }
    }
    for (i, process) in processes.iter_mut().enumerate() {
        for page in 0..4 {
            let tag = vec![i as u8 * 16 + page as u8; 32];
            assert_eq!(
                process.read_user(&vm, CODE + page * PAGE_FRAME_SIZE, 32),
                Some(tag)
            );
        }
    }

    let stats = vm.frames().stats();
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.pinned, 0);

    for process in &mut processes {
        process.exit(&vm, 0);
        assert_eq!(vm.frames().frames_owned_by(process.pid()), 0);
    }
    assert_eq!(vm.swap().used_slots(), 0);
    assert_eq!(vm.pool().frames_allocated(), 0);
}

#[test]
fn invalid_access_terminates_only_the_faulting_process() {
    let vm = vm(2, 4);
    let state = ProcessState::default();
    let (mut good, _) = Process::load(&state, &program(1), &[data_segment(1)]).unwrap();
    let (mut bad, _) = Process::load(&state, &program(1), &[data_segment(1)]).unwrap();

    assert_eq!(good.page_fault(&vm, CODE), FaultOutcome::Resolved);
    assert_eq!(bad.page_fault(&vm, CODE), FaultOutcome::Resolved);
    assert_eq!(bad.page_fault(&vm, 0x4000_0000), FaultOutcome::Terminated(-1));

    assert_eq!(bad.exit_code(), Some(-1));
    assert_eq!(vm.frames().frames_owned_by(bad.pid()), 0);
    assert_eq!(vm.frames().frames_owned_by(good.pid()), 1);
    assert_eq!(good.read_user(&vm, CODE, 1), Some(vec![0]));
    good.exit(&vm, 0);
}

#[test]
fn fault_waits_out_a_busy_address_space() {
    let vm = vm(1, 1);
    let state = ProcessState::default();
    let a = Process::new(&state);
    let b = Process::new(&state);
    for process in [&a, &b] {
        process
            .address_space()
            .register_lazy(CODE, None, 0, 0, PAGE_FRAME_SIZE, true)
            .unwrap();
    }
    // b owns the only frame, unpinned and not recently used.
    assert_eq!(handle_page_fault(&vm, b.address_space(), CODE), Ok(()));

    let locked = Arc::new(Barrier::new(2));
    let holder = {
        let space = b.address_space().clone();
        let locked = locked.clone();
        thread::spawn(move || {
            let _inner = space.lock();
            locked.wait();
            thread::sleep(Duration::from_millis(50));
        })
    };
    locked.wait();
    assert_eq!(handle_page_fault(&vm, a.address_space(), CODE), Ok(()));
    holder.join().unwrap();

    assert_eq!(vm.frames().frames_owned_by(a.pid()), 1);
    assert_eq!(vm.frames().frames_owned_by(b.pid()), 0);
    assert_eq!(
        b.address_space().lock().page_table.find(CODE).unwrap().state(),
        PageState::Unloaded
    );
}

#[test]
fn exit_runs_alongside_faults_of_other_processes() {
    let vm = Arc::new(vm(2, 8));
    let state = ProcessState::default();
    let (mut leaving, _) = Process::load(&state, &program(4), &[data_segment(4)]).unwrap();
    for page in 0..4 {
        assert!(leaving.write_user(&vm, CODE + page * PAGE_FRAME_SIZE, &[page as u8 + 1]));
    }
    let (staying, _) = Process::load(&state, &program(4), &[data_segment(4)]).unwrap();

    let faulter = {
        let vm = vm.clone();
        let space = staying.address_space().clone();
        thread::spawn(move || {
            for round in 0..8 {
                let page = CODE + (round % 4) * PAGE_FRAME_SIZE;
                assert_eq!(handle_page_fault(&vm, &space, page), Ok(()));
            }
        })
    };
    leaving.exit(&vm, 0);
    faulter.join().unwrap();

    assert_eq!(vm.frames().frames_owned_by(leaving.pid()), 0);
    assert!(vm.frames().frames_owned_by(staying.pid()) <= 2);
    assert!(vm.swap().used_slots() <= 4);
}

#[derive(Debug, Clone)]
enum Op {
    Write { page: usize, value: u8 },
    Read { page: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..5usize, any::<u8>()).prop_map(|(page, value)| Op::Write { page, value }),
        (0..5usize).prop_map(|page| Op::Read { page }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn page_states_stay_consistent(ops in proptest::collection::vec(op(), 1..40)) {
        let pages = 5;
        let vm = vm(2, pages);
        let state = ProcessState::default();
        let mut process = Process::new(&state);
        let space = process.address_space().clone();
        for page in 0..pages {
            space
                .register_lazy(CODE + page * PAGE_FRAME_SIZE, None, 0, 0, PAGE_FRAME_SIZE, true)
                .unwrap();
        }
        let mut model = vec![0u8; pages];

        for op in ops {
            match op {
                Op::Write { page, value } => {
                    prop_assert!(process.write_user(&vm, CODE + page * PAGE_FRAME_SIZE, &[value]));
                    model[page] = value;
                }
                Op::Read { page } => {
                    let got = process.read_user(&vm, CODE + page * PAGE_FRAME_SIZE, 1);
                    prop_assert_eq!(got, Some(vec![model[page]]));
                }
            }

            let inner = space.lock();
            let mut resident = 0;
            let mut swapped = 0;
            for entry in inner.page_table.iter() {
                let mapped = inner.page_manager.translate(entry.vaddr());
                match entry.state() {
                    PageState::Resident(frame) => {
                        resident += 1;
                        prop_assert_eq!(mapped, Some(frame));
                        prop_assert!(vm.frames().is_tracked(frame));
                    }
                    PageState::Swapped(slot) => {
                        swapped += 1;
                        prop_assert!(mapped.is_none());
                        prop_assert!(vm.swap().is_reserved(slot));
                    }
                    PageState::Unloaded => {
                        prop_assert!(mapped.is_none());
                    }
                }
                prop_assert!(!entry.is_loading());
            }
            prop_assert_eq!(resident, vm.frames().stats().entries);
            prop_assert_eq!(swapped, vm.swap().used_slots());
            prop_assert_eq!(vm.frames().stats().pinned, 0);
        }

        process.exit(&vm, 0);
        prop_assert_eq!(vm.frames().stats().entries, 0);
        prop_assert_eq!(vm.swap().used_sectors(), 0);
    }
}
