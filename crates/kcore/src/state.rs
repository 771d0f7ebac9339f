// =============================================================================
// Trellis — Kernel State
// =============================================================================
//
// Everything the scheduling core shares between CPUs, built once at boot:
//
//   scheduler   the policy and its runqueue (Box<dyn Scheduler>)
//   spaces      address-space factory for new processes
//   percpu      per-CPU areas, holding for every CPU:
//                 current       the process this CPU runs, if any
//                 idle_context  where this CPU was before it picked a process
//                 switches      number of context switches on this CPU
//   ticks       global timer epoch
//
// CONTEXT SWITCH
//   The timer stub saves the interrupted registers on the interrupt stack
//   and passes them here as a RegisterSet. `switch_to` stores them in the
//   outgoing descriptor, hands that descriptor back to the policy, installs
//   the incoming one as `current`, activates its address space and returns
//   its saved registers. The stub restores those and `iretq`s, so the
//   incoming process continues at exactly the instruction where it was
//   interrupted, and the outgoing one will do the same once some CPU
//   switches back to it.
//
// Every entry point runs with local interrupts masked.
// =============================================================================

use alloc::boxed::Box;

use crate::arch::{self, HardwareId};
use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::percpu::{CpuId, PerCpuLayout, PerCpuRegistry, PerCpuVar, cpu_id};
use crate::process::{AddressSpaceFactory, Pid, ProcessDescriptor, ProcessState, RegisterSet};
use crate::sched::Scheduler;
use crate::sync::AtomicCounter;

pub struct KernelState {
    config: KernelConfig,
    scheduler: Box<dyn Scheduler>,
    spaces: Box<dyn AddressSpaceFactory>,
    percpu: PerCpuRegistry,
    current: PerCpuVar<Option<Box<ProcessDescriptor>>>,
    idle_context: PerCpuVar<Option<RegisterSet>>,
    switches: PerCpuVar<u64>,
    ticks: AtomicCounter,
}

impl KernelState {
    /// Provisions per-CPU state for up to `config.max_cpus` of the given
    /// CPUs and starts the configured scheduling policy.
    pub fn new(
        config: KernelConfig,
        hardware_ids: &[HardwareId],
        spaces: Box<dyn AddressSpaceFactory>,
    ) -> Self {
        let usable = hardware_ids.len().min(config.max_cpus);
        if usable < hardware_ids.len() {
            log::warn!(
                "limiting to {} of {} cpus",
                usable,
                hardware_ids.len()
            );
        }

        let mut layout = PerCpuLayout::new();
        let current = layout.declare("current");
        let idle_context = layout.declare("idle_context");
        let switches = layout.declare("switches");
        let percpu = PerCpuRegistry::init(layout, &hardware_ids[..usable]);

        let scheduler = config.policy.build();
        scheduler.init();

        Self {
            config,
            scheduler,
            spaces,
            percpu,
            current,
            idle_context,
            switches,
            ticks: AtomicCounter::new(0),
        }
    }

    /// Binds the executing CPU to its per-CPU area. Once per CPU.
    pub fn attach_current_cpu(&self) -> CpuId {
        self.percpu.attach_current_cpu()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        &*self.scheduler
    }

    pub fn percpu(&self) -> &PerCpuRegistry {
        &self.percpu
    }

    pub fn cpu_count(&self) -> usize {
        self.percpu.cpu_count()
    }

    // ── Process lifecycle ───────────────────────────────────────

    /// Creates a process starting at `entry` and makes it runnable.
    pub fn spawn(&self, entry: u64) -> Result<Pid, KernelError> {
        let process = ProcessDescriptor::create(&*self.spaces, entry)?;
        let pid = process.pid();
        log::info!("spawned {} at {:#x}", pid, process.entry_point());
        self.enqueue(process);
        Ok(pid)
    }

    pub fn enqueue(&self, process: Box<ProcessDescriptor>) {
        self.scheduler.enqueue(process);
    }

    /// Takes an enqueued process away from the scheduler. Fatal if `pid` is
    /// not enqueued.
    pub fn dequeue(&self, pid: Pid) -> Box<ProcessDescriptor> {
        self.scheduler.dequeue(pid)
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.percpu
            .with_this_cpu(self.current, |current| current.as_ref().map(|p| p.pid()))
    }

    // ── Timer path ──────────────────────────────────────────────

    /// Timer interrupt on this CPU. `frame` holds the interrupted registers
    /// and, on return, the registers to resume with.
    ///
    /// Returns `true` if this CPU now runs a different process.
    pub fn on_timer_tick(&self, frame: &mut RegisterSet) -> bool {
        arch::without_interrupts(|| {
            self.ticks.inc();
            let reschedule = self.percpu.with_this_cpu(self.current, |current| {
                if let Some(process) = current.as_deref_mut() {
                    self.scheduler.update_current(process);
                }
                self.scheduler.tick()
            });
            reschedule && self.schedule(frame)
        })
    }

    /// Switches to the policy's next process, if it has one. With an empty
    /// runqueue the interrupted code simply continues.
    pub fn schedule(&self, frame: &mut RegisterSet) -> bool {
        arch::without_interrupts(|| match self.scheduler.pick_next() {
            Some(next) => {
                *frame = self.switch_to(next, Some(&*frame));
                true
            }
            None => false,
        })
    }

    /// Makes `next` this CPU's current process and returns the registers it
    /// must resume with.
    ///
    /// `interrupted` is the register state of whatever this CPU was running:
    /// the current process, which is saved and handed back to the policy, or
    /// the idle loop, which is remembered as this CPU's idle context. It may
    /// only be `None` when there is no current process (after an exit).
    pub fn switch_to(
        &self,
        mut next: Box<ProcessDescriptor>,
        interrupted: Option<&RegisterSet>,
    ) -> RegisterSet {
        arch::without_interrupts(|| {
            let cpu = cpu_id();
            next.set_state(ProcessState::Running(cpu));
            next.address_space().activate();
            let resume = *next.saved_registers();
            let pid = next.pid();

            let prev = self
                .percpu
                .with_this_cpu(self.current, |current| current.replace(next));
            match (prev, interrupted) {
                (Some(mut prev), Some(regs)) => {
                    prev.save_registers(regs);
                    self.scheduler.put_prev(prev);
                }
                (Some(prev), None) => {
                    kfatal!("{} switched out without saving its registers", prev.pid());
                }
                (None, Some(regs)) => {
                    self.percpu.write_this_cpu(self.idle_context, Some(*regs));
                }
                (None, None) => {}
            }

            self.percpu.with_this_cpu(self.switches, |n| *n += 1);
            log::trace!("{}: now running {}", cpu, pid);
            resume
        })
    }

    /// Terminates this CPU's current process and returns the registers to
    /// continue with: the next runnable process, or the idle loop.
    pub fn exit_current(&self) -> RegisterSet {
        arch::without_interrupts(|| {
            let Some(mut exiting) = self.percpu.with_this_cpu(self.current, Option::take) else {
                kfatal!("exit on {} with no current process", cpu_id());
            };
            exiting.set_state(ProcessState::Terminated);

            let resume = match self.scheduler.pick_next() {
                Some(next) => self.switch_to(next, None),
                None => {
                    self.spaces.activate_kernel();
                    let idle = self
                        .percpu
                        .with_this_cpu(self.idle_context, Option::take);
                    let Some(idle) = idle else {
                        kfatal!("{} has no idle context to return to", cpu_id());
                    };
                    idle
                }
            };

            log::info!(
                "{} exited after {} ticks",
                exiting.pid(),
                exiting.runtime_ticks()
            );
            // The exiting address space is no longer active anywhere.
            drop(exiting);
            resume
        })
    }

    // ── Statistics ──────────────────────────────────────────────

    /// Timer interrupts taken across all CPUs.
    pub fn ticks(&self) -> i32 {
        self.ticks.read()
    }

    /// Context switches performed by the executing CPU.
    pub fn switches(&self) -> u64 {
        self.percpu.read_this_cpu(self.switches)
    }
}
