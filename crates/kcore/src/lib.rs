//! Trellis kernel core.
//!
//! The pieces of the kernel that several CPUs touch at once live here:
//! atomic counters, interrupt-aware spinlocks, the per-CPU registry, process
//! descriptors with the context-switch protocol, and the scheduler.
//!
//! Hardware access is funnelled through [`arch`]. On the bare-metal target
//! that is x86_64 (`CLI`/`STI`, `GS`-relative loads, `CPUID`); in tests and
//! with the `hosted` feature each host thread plays one simulated CPU.

#![cfg_attr(not(any(test, feature = "hosted")), no_std)]

extern crate alloc;

#[doc(hidden)]
pub use log as __log;

#[macro_use]
mod fatal;

pub mod arch;
pub mod config;
pub mod error;
pub mod percpu;
pub mod process;
pub mod sched;
pub mod state;
pub mod sync;

#[cfg(test)]
mod tests;

pub use config::KernelConfig;
pub use error::KernelError;
pub use percpu::{CpuId, PerCpuLayout, PerCpuRegistry, PerCpuVar, cpu_id};
pub use process::{
    AddressSpace, AddressSpaceFactory, Pid, ProcessDescriptor, ProcessState, RegisterSet,
    StackBounds,
};
pub use sched::{SchedPolicy, Scheduler, TrivialScheduler};
pub use state::KernelState;
pub use sync::{AtomicCounter, RawSpinLock, SpinLock, SpinLockGuard};

/// Upper bound on the number of CPUs the per-CPU registry will provision.
pub const MAX_CPUS: usize = 64;
