// =============================================================================
// Trellis — Kernel Entry Point
// =============================================================================
//
// WHAT HAPPENED BEFORE WE GOT HERE:
//   Limine loaded this ELF into the higher half, set up long mode with its
//   own page tables (kernel image + direct map of all RAM), filled in our
//   request structures and jumped to `kmain` on the boot CPU. Every other
//   CPU is parked in the bootloader, waiting for a `goto_address`.
//
// WHAT WE DO HERE (boot CPU):
//   1. Per-CPU placeholder, serial, logger, boot options
//   2. Frame allocator and heap
//   3. Kernel state: scheduler + per-CPU areas; attach this CPU
//   4. Descriptor tables, legacy PIC masked, Local APIC, timer calibration
//   5. Wake the application processors
//   6. Spawn the demo processes, release the APs, start the tick
//   7. Idle: every CPU waits in `sti; hlt` for the scheduler to give it work
// =============================================================================

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

extern crate alloc;

mod arch;
mod demo;
mod memory;
mod timer;
mod traps;
mod util;

use alloc::boxed::Box;
use alloc::vec::Vec;

use kcore::arch::HardwareId;
use kcore::{KernelConfig, KernelState};
use log::LevelFilter;
use spin::Once;

use arch::{boot, smp};
use memory::space::PageSpaces;

/// The scheduling core, shared by every CPU once built.
static KERNEL: Once<KernelState> = Once::new();

/// The kernel state, or `None` while the boot CPU is still building it.
pub fn kernel_state() -> Option<&'static KernelState> {
    KERNEL.get()
}

/// The kernel's main entry point, called by Limine on the boot CPU with
/// interrupts disabled.
#[unsafe(no_mangle)]
extern "C" fn kmain() -> ! {
    // Nothing may take a lock or log before GS points somewhere valid.
    kcore::percpu::early_init();

    // =========================================================================
    // PHASE 1: output and options
    // =========================================================================
    klog::init(LevelFilter::Info);
    log::info!("Trellis {}", env!("CARGO_PKG_VERSION"));

    if !boot::revision_supported() {
        kcore::kfatal!("bootloader does not support our Limine base revision");
    }

    let config = match KernelConfig::parse(boot::cmdline()) {
        Ok(config) => config,
        Err(err) => {
            log::warn!("boot options: {}, using defaults", err);
            KernelConfig::default()
        }
    };
    klog::set_level(config.log_level);
    log::info!(
        "config: cpus<={} hz={} sched={}",
        config.max_cpus,
        config.tick_hz,
        config.policy.name()
    );

    // =========================================================================
    // PHASE 2: memory
    // =========================================================================
    let Some(hhdm) = boot::hhdm_offset() else {
        kcore::kfatal!("no HHDM response from the bootloader");
    };
    memory::init_hhdm(hhdm);

    let Some(memory_map) = boot::memory_map() else {
        kcore::kfatal!("no memory map from the bootloader");
    };
    if let Err(err) = memory::pmm::init(memory_map) {
        kcore::kfatal!("pmm: {}", err);
    }
    if let Err(err) = memory::heap::init() {
        kcore::kfatal!("heap: {}", err);
    }

    // Before the first address space is built, so all of them inherit it.
    if let Err(err) = memory::paging::map_mmio(khal::apic::physical_base()) {
        kcore::kfatal!("cannot map the local APIC: {}", err);
    }

    // =========================================================================
    // PHASE 3: scheduling core
    // =========================================================================
    let hardware_ids = cpu_hardware_ids();
    let state = KERNEL.call_once(|| {
        KernelState::new(config, &hardware_ids, Box::new(PageSpaces::new()))
    });
    let me = state.attach_current_cpu();

    // =========================================================================
    // PHASE 4: interrupts
    // =========================================================================
    // SAFETY: boot CPU, once, interrupts still disabled.
    if let Err(err) = unsafe { smp::init_bsp(state.cpu_count()) } {
        kcore::kfatal!("descriptor tables: {}", err);
    }
    traps::load_idt();
    khal::pic::disable();
    let apic_id = khal::apic::init(hhdm);
    timer::calibrate(state.config().tick_hz);
    log::info!("{} is the boot CPU (APIC {})", me, apic_id);

    // =========================================================================
    // PHASE 5: application processors
    // =========================================================================
    if let Some(mp) = boot::mp() {
        smp::wake_aps(mp, state);
    }

    // =========================================================================
    // PHASE 6: workload
    // =========================================================================
    if let Err(err) = demo::spawn_all(state) {
        log::error!("demo workload: {}", err);
    }
    log::info!(
        "boot complete: {} cpus, {} runnable, {} frames free, heap {}/{} KiB",
        state.cpu_count(),
        state.scheduler().len(),
        memory::pmm::free_frame_count(),
        memory::heap::allocated_bytes() / 1024,
        memory::heap::total_bytes() / 1024,
    );

    smp::release_aps();
    timer::start();
    idle()
}

/// APIC ids of every CPU, boot CPU first so that it becomes `cpu0`.
fn cpu_hardware_ids() -> Vec<HardwareId> {
    let bsp = kcore::arch::hardware_id();
    let mut ids = Vec::from([bsp]);
    if let Some(mp) = boot::mp() {
        ids.extend(
            mp.cpus()
                .iter()
                .map(|cpu| cpu.lapic_id)
                .filter(|&id| id != bsp),
        );
    }
    ids
}

/// This CPU's idle loop: sleep until an interrupt, forever. The timer
/// handler switches away from here whenever there is something to run and
/// switches back when a process exits with nothing else runnable.
pub fn idle() -> ! {
    loop {
        kcore::arch::wait_for_interrupt();
    }
}
