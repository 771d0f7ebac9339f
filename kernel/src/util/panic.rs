// =============================================================================
// Trellis — Kernel Panic Handler
// =============================================================================
//
// Panics in the kernel are FATAL: a violated invariant, corrupted state, an
// impossible condition. Invariants the core checks itself go through
// `kfatal!`; this handler catches everything else (allocation failure,
// index out of bounds, `unreachable!`).
//
// WHAT WE DO:
//   1. Stop this CPU's timer so no further ticks arrive
//   2. Print the message and location straight to the UART, bypassing the
//      serial lock (the panicking CPU may be holding it)
//   3. Halt this CPU permanently
//
// Other CPUs keep running until they need a lock this one holds.
// =============================================================================

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    khal::apic::disable_timer();

    match info.location() {
        Some(location) => klog::emergency(format_args!(
            "kernel panic at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        )),
        None => klog::emergency(format_args!("kernel panic: {}", info.message())),
    }

    kcore::arch::halt_cpu(format_args!("panic"))
}
