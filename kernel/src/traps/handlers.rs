//! Interrupt and exception handlers, called from the stubs in `entry`.

use kcore::RegisterSet;
use x86_64::registers::control::Cr2;

use crate::kernel_state;

/// Timer interrupt (vector 32).
///
/// The kernel's heartbeat: accounts the tick to the running process and
/// lets the policy preempt it. `frame` is rewritten in place when the CPU
/// switches to another process. Ticks that arrive before the kernel state
/// exists are only acknowledged.
pub extern "C" fn timer_trap(frame: &mut RegisterSet) {
    if let Some(state) = kernel_state() {
        state.on_timer_tick(frame);
    }
    khal::apic::eoi();
}

/// Exit request (`int EXIT_VECTOR`) from the running process.
///
/// The caller's registers are discarded: the frame is replaced by the next
/// process, or by this CPU's idle loop.
pub extern "C" fn exit_trap(frame: &mut RegisterSet) {
    let Some(state) = kernel_state() else {
        kcore::kfatal!("exit requested before the kernel state exists");
    };
    *frame = state.exit_current();
}

/// CPU exceptions. Every fault in the kernel is a bug: report and halt.
pub extern "C" fn fault_trap(vector: u64, error_code: u64, rip: u64) -> ! {
    match vector {
        0 => kcore::kfatal!("divide error at {:#x}", rip),
        6 => kcore::kfatal!("invalid opcode at {:#x}", rip),
        8 => kcore::kfatal!("double fault (rip {:#x})", rip),
        13 => kcore::kfatal!("general protection fault at {:#x}, selector {:#x}", rip, error_code),
        14 => kcore::kfatal!(
            "page fault at {:#x} accessing {:#x}, error {:#x}",
            rip,
            Cr2::read_raw(),
            error_code
        ),
        _ => kcore::kfatal!("exception {} at {:#x}, error {:#x}", vector, rip, error_code),
    }
}
