//! Boot workload: three kernel-mode processes that make scheduling visible
//! on the serial log.
//!
//! Two of them run forever and report which CPU they find themselves on;
//! the third does a fixed amount of work and exits, after which its CPU
//! picks up whoever is next or goes back to idling.

use core::arch::asm;

use kcore::{KernelError, KernelState, Pid};

use crate::kernel_state;
use crate::traps::EXIT_VECTOR;

/// Busy-work between reports.
const ROUND_SPINS: u64 = 20_000_000;

/// Rounds the finite process runs before exiting.
const FINITE_ROUNDS: u64 = 5;

fn whoami() -> Option<Pid> {
    kernel_state().and_then(KernelState::current_pid)
}

fn round() {
    for _ in 0..ROUND_SPINS {
        core::hint::spin_loop();
    }
}

fn report(name: &str, round: u64) {
    match whoami() {
        Some(pid) => log::info!("{} ({}) round {} on {}", name, pid, round, kcore::cpu_id()),
        None => log::warn!("{} round {} outside any process", name, round),
    }
}

/// Terminates the calling process. Its CPU continues elsewhere.
fn exit() -> ! {
    // SAFETY: the exit trap replaces this context for good.
    unsafe { asm!("int {vector}", vector = const EXIT_VECTOR, options(noreturn)) }
}

extern "C" fn ping() -> ! {
    let mut n = 0;
    loop {
        round();
        n += 1;
        report("ping", n);
    }
}

extern "C" fn pong() -> ! {
    let mut n = 0;
    loop {
        round();
        round();
        n += 1;
        report("pong", n);
    }
}

extern "C" fn finite() -> ! {
    for n in 1..=FINITE_ROUNDS {
        round();
        report("finite", n);
    }
    log::info!("finite: done, exiting");
    exit()
}

/// Spawns the workload on `state`.
pub fn spawn_all(state: &KernelState) -> Result<(), KernelError> {
    for entry in [ping as extern "C" fn() -> !, pong, finite] {
        state.spawn(entry as usize as u64)?;
    }
    Ok(())
}
