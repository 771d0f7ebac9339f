//! Round-robin scheduling across simulated CPUs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use crate::arch::hosted::boot_cpu;
use crate::tests::mock::MockFactory;
use crate::{KernelConfig, KernelState, Pid, RegisterSet, cpu_id};

const ENTRIES: [u64; 3] = [0x1000, 0x2000, 0x3000];

/// Book-keeping of one simulated process, indexed like `ENTRIES`.
#[derive(Default)]
struct Observed {
    /// Steps executed so far; the process keeps the same count in `rax`.
    executed: AtomicU64,
    /// Set while some CPU is executing a step of this process.
    on_cpu: AtomicBool,
}

fn run_cpu(
    state: &KernelState,
    hw: u32,
    pids: &[Pid; 3],
    observed: &[Observed; 3],
    barrier: &Barrier,
    ticks: usize,
) {
    boot_cpu(hw);
    let me = state.attach_current_cpu();
    assert_eq!(cpu_id(), me);
    barrier.wait();

    // The idle loop's registers.
    let mut frame = RegisterSet::initial(0xffff_8000_0000_0000 + u64::from(hw), 0);

    for _ in 0..ticks {
        if let Some(pid) = state.current_pid() {
            let Some(i) = pids.iter().position(|&p| p == pid) else {
                panic!("unknown {pid} on {me}");
            };
            let seen = &observed[i];
            assert!(
                !seen.on_cpu.swap(true, Ordering::SeqCst),
                "{pid} running on two cpus"
            );

            let done = seen.executed.load(Ordering::SeqCst);
            assert_eq!(frame.rax, done, "{pid} lost its registers");
            if done == 0 {
                assert_eq!(frame.rip, ENTRIES[i]);
                assert_eq!(frame.rsp % 16, 0);
            }
            frame.rax += 1;
            frame.rip += 4;
            seen.executed.fetch_add(1, Ordering::SeqCst);

            seen.on_cpu.store(false, Ordering::SeqCst);
        }
        state.on_timer_tick(&mut frame);
    }
}

#[test]
fn three_processes_round_robin_on_two_cpus() {
    const TICKS: usize = 300;

    boot_cpu(0);
    let factory = Arc::new(MockFactory::new());
    let state = KernelState::new(KernelConfig::default(), &[0, 1], Box::new(Arc::clone(&factory)));

    let pids = ENTRIES.map(|entry| state.spawn(entry).unwrap());
    let observed: [Observed; 3] = Default::default();
    let barrier = Barrier::new(2);

    thread::scope(|s| {
        for hw in 0..2 {
            let (state, pids, observed, barrier) = (&state, &pids, &observed, &barrier);
            s.spawn(move || run_cpu(state, hw, pids, observed, barrier, TICKS));
        }
    });

    for (i, seen) in observed.iter().enumerate() {
        assert!(
            seen.executed.load(Ordering::SeqCst) > 0,
            "{} never scheduled",
            pids[i]
        );
    }
    assert_eq!(state.ticks(), 2 * TICKS as i32);
    assert!(factory.activated() >= 3);
}

#[test]
fn every_cpu_counts_its_own_switches() {
    boot_cpu(0);
    let state = KernelState::new(KernelConfig::default(), &[0, 1], Box::new(MockFactory::new()));
    for entry in ENTRIES {
        state.spawn(entry).unwrap();
    }

    let counts: Vec<(u64, u64)> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|hw| {
                let state = &state;
                s.spawn(move || {
                    boot_cpu(hw);
                    state.attach_current_cpu();
                    let mut frame = RegisterSet::default();
                    let mut switched = 0;
                    for _ in 0..10 {
                        if state.on_timer_tick(&mut frame) {
                            switched += 1;
                        }
                    }
                    (switched, state.switches())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (switched, counted) in counts {
        assert_eq!(switched, counted);
        assert!(counted > 0);
    }
}
