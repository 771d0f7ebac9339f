//! Recoverable kernel errors.
//!
//! Invariant violations never show up here: those halt the CPU through
//! `kfatal!`. These are the conditions a collaborator can run into and
//! report back, mostly resource exhaustion.

use core::fmt;

/// Error returned by process creation, address-space collaborators and
/// configuration parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The physical frame allocator has nothing left.
    OutOfFrames,
    /// No address space could be created for a new process.
    AddressSpaceUnavailable,
    /// The stack of a new process could not be mapped.
    StackUnavailable,
    /// More CPUs were asked for than the per-CPU registry supports.
    TooManyCpus { requested: usize, max: usize },
    /// A boot option had a value that could not be parsed.
    InvalidConfig { key: &'static str },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfFrames => f.write_str("out of physical frames"),
            KernelError::AddressSpaceUnavailable => f.write_str("cannot create address space"),
            KernelError::StackUnavailable => f.write_str("cannot map process stack"),
            KernelError::TooManyCpus { requested, max } => {
                write!(f, "{requested} cpus requested, at most {max} supported")
            }
            KernelError::InvalidConfig { key } => write!(f, "invalid value for boot option `{key}`"),
        }
    }
}

impl core::error::Error for KernelError {}
