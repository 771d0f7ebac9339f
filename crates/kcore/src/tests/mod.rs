//! Scenarios spanning several modules, run on simulated CPUs.

pub(crate) mod mock;

mod diagnostics;
mod smp;
