//! SMP (Symmetric Multiprocessing) bring-up.
//!
//! Each core gets its own GDT and TSS (a loaded TSS is marked busy, so they
//! cannot be shared) with two interrupt stacks: one for double faults and
//! one for the timer and exit traps. The boot CPU builds these tables for
//! every core before any application processor is started.
//!
//! Start-up handshake:
//!   1. BSP points each AP's Limine `goto_address` at `ap_entry`
//!   2. each AP attaches its per-CPU area, loads its tables, starts its
//!      APIC timer and bumps `AP_READY_COUNT`, interrupts still off
//!   3. BSP waits for the count, finishes boot, sets `AP_GO`
//!   4. APs enable interrupts and idle until the scheduler gives them work

use alloc::alloc::{alloc_zeroed, Layout};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use kcore::{CpuId, KernelError, KernelState};
use limine::mp::Cpu;
use limine::response::MpResponse;
use spin::Once;

use super::gdt::Gdt;
use super::tss::{DOUBLE_FAULT_IST, IST_STACK_SIZE, TRAP_IST, Tss};

/// Counter of APs that have completed their init sequence.
static AP_READY_COUNT: AtomicU32 = AtomicU32::new(0);

/// APs spin until the BSP sets this after the demo processes are spawned.
static AP_GO: AtomicBool = AtomicBool::new(false);

/// Per-core descriptor tables, indexed by `CpuId`.
static CORE_TABLES: Once<Vec<&'static CoreTables>> = Once::new();

/// Bounded wait for APs, in spin iterations.
const AP_READY_SPINS: u64 = 100_000_000;

struct CoreTables {
	tss: Tss,
	gdt: Once<Gdt>,
}

impl CoreTables {
	/// Builds the TSS (with fresh IST stacks) and the GDT around it. The
	/// tables are leaked: a core uses them until the machine stops.
	fn leak() -> Result<&'static Self, KernelError> {
		let mut tss = Tss::new();
		tss.set_interrupt_stack(DOUBLE_FAULT_IST, ist_stack()?);
		tss.set_interrupt_stack(TRAP_IST, ist_stack()?);

		let tables: &'static Self = Box::leak(Box::new(Self {
			tss,
			gdt: Once::new(),
		}));
		tables.gdt.call_once(|| Gdt::new(&tables.tss));
		Ok(tables)
	}

	/// # Safety
	///
	/// Once per core, interrupts disabled.
	unsafe fn load(&'static self) {
		if let Some(gdt) = self.gdt.get() {
			unsafe { gdt.load() };
		}
	}
}

/// Top of a new, never freed interrupt stack.
fn ist_stack() -> Result<u64, KernelError> {
	let layout =
		Layout::from_size_align(IST_STACK_SIZE, 16).map_err(|_| KernelError::StackUnavailable)?;
	let bottom = unsafe { alloc_zeroed(layout) };
	if bottom.is_null() {
		return Err(KernelError::StackUnavailable);
	}
	Ok(bottom as u64 + IST_STACK_SIZE as u64)
}

/// Builds the tables of all `cpu_count` cores and loads the boot CPU's.
///
/// # Safety
///
/// Must be called exactly once, on the attached boot CPU, with interrupts
/// disabled.
pub unsafe fn init_bsp(cpu_count: usize) -> Result<(), KernelError> {
	let mut tables = Vec::with_capacity(cpu_count);
	for _ in 0..cpu_count {
		tables.push(CoreTables::leak()?);
	}
	let tables = CORE_TABLES.call_once(|| tables);

	let me = kcore::cpu_id();
	match tables.get(me.index()) {
		Some(mine) => unsafe { mine.load() },
		None => kcore::kfatal!("{} has no descriptor tables", me),
	}
	log::info!("smp: descriptor tables for {} cores", cpu_count);
	Ok(())
}

/// Starts every AP that has a per-CPU area and waits until they report in.
///
/// APs beyond the configured CPU limit are left parked in the bootloader.
pub fn wake_aps(mp: &MpResponse, state: &KernelState) {
	let bsp = mp.bsp_lapic_id();
	let mut expected: u32 = 0;

	for cpu in mp.cpus().iter().filter(|cpu| cpu.lapic_id != bsp) {
		let has_area = (0..state.cpu_count())
			.any(|i| state.percpu().hardware_id(CpuId(i as u32)) == Some(cpu.lapic_id));
		if !has_area {
			log::debug!("smp: leaving APIC {} parked", cpu.lapic_id);
			continue;
		}
		log::debug!("smp: waking APIC {}", cpu.lapic_id);
		cpu.goto_address.write(ap_entry);
		expected += 1;
	}

	let mut spins: u64 = 0;
	while AP_READY_COUNT.load(Ordering::Acquire) < expected {
		core::hint::spin_loop();
		spins += 1;
		if spins > AP_READY_SPINS {
			log::warn!(
				"smp: timed out waiting for APs ({}/{} ready)",
				AP_READY_COUNT.load(Ordering::Relaxed),
				expected
			);
			return;
		}
	}
	log::info!("smp: {} APs ready", expected);
}

/// Lets the APs enable interrupts and take part in scheduling.
pub fn release_aps() {
	AP_GO.store(true, Ordering::Release);
}

/// Entry point for each Application Processor.
///
/// Limine delivers the AP here with paging on (the BSP's CR3), interrupts
/// disabled and a small bootloader stack.
extern "C" fn ap_entry(_cpu: &Cpu) -> ! {
	kcore::percpu::early_init();

	let Some(state) = crate::kernel_state() else {
		kcore::kfatal!("AP started before the kernel state exists");
	};
	let me = state.attach_current_cpu();

	match CORE_TABLES.get().and_then(|tables| tables.get(me.index())) {
		// SAFETY: first and only load on this core, interrupts are off.
		Some(tables) => unsafe { tables.load() },
		None => kcore::kfatal!("{} has no descriptor tables", me),
	}
	crate::traps::load_idt();

	khal::pic::disable();
	khal::apic::init(crate::memory::hhdm_offset());
	crate::timer::start();

	log::info!("smp: {} online (APIC {})", me, khal::apic::id());
	AP_READY_COUNT.fetch_add(1, Ordering::Release);

	while !AP_GO.load(Ordering::Acquire) {
		core::hint::spin_loop();
	}

	crate::idle()
}
