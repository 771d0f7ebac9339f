//! Process descriptors and their lifecycle.
//!
//! A [`ProcessDescriptor`] is owned by exactly one place at a time: the
//! runqueue, a CPU's `current` slot, or a collaborator that dequeued it.
//! Ownership moves with the `Box`, so "linked into a runqueue" and "running
//! on a CPU" can never both be true.

mod context;

pub use self::context::RegisterSet;

use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::KernelError;
use crate::percpu::CpuId;

/// Stack size handed to every new process.
pub const PROCESS_STACK_SIZE: usize = 16 * 1024;

// ── Process identifiers ─────────────────────────────────────────

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Stable process identifier. Never reused within a boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u64);

impl Pid {
    fn alloc() -> Self {
        Pid(NEXT_PID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

// ── Address-space collaborator ──────────────────────────────────

/// Virtual range of a process stack. Grows down from `top`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    pub bottom: u64,
    pub top: u64,
}

impl StackBounds {
    pub fn size(&self) -> u64 {
        self.top - self.bottom
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr > self.bottom && addr <= self.top
    }
}

/// A private address space, exclusively owned by one descriptor.
///
/// Dropping it tears the mappings down and returns their frames.
pub trait AddressSpace: Send {
    /// Makes this the active address space of the executing CPU.
    fn activate(&self);

    /// Maps a fresh stack of at least `size` bytes.
    fn map_stack(&mut self, size: usize) -> Result<StackBounds, KernelError>;
}

/// Builds address spaces for new processes.
pub trait AddressSpaceFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn AddressSpace>, KernelError>;

    /// Switches the executing CPU back to the kernel-only address space,
    /// used when a CPU goes idle after its process exited.
    fn activate_kernel(&self);
}

// ── Lifecycle ───────────────────────────────────────────────────

/// ```text
/// Created ──enqueue──> Enqueued ──switch──> Running(cpu) ──exit──> Terminated
///    ^                   │  ^                    │
///    └──── dequeue ──────┘  └───── preempt ──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Not on any runqueue and not running: freshly built, or held by a
    /// collaborator after `dequeue`.
    Created,
    Enqueued,
    Running(CpuId),
    Terminated,
}

impl ProcessState {
    fn can_become(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Created, Enqueued)
                | (Created, Terminated)
                | (Enqueued, Created)
                | (Enqueued, Running(_))
                | (Running(_), Enqueued)
                | (Running(_), Terminated)
        )
    }
}

// ── Descriptor ──────────────────────────────────────────────────

pub struct ProcessDescriptor {
    pid: Pid,
    address_space: Box<dyn AddressSpace>,
    saved: RegisterSet,
    stack: StackBounds,
    entry: u64,
    state: ProcessState,
    runtime_ticks: u64,
    dispatches: u64,
}

impl ProcessDescriptor {
    /// Builds a process that will start at `entry` on its own stack.
    ///
    /// If the stack cannot be mapped the half-built address space is
    /// dropped, which returns whatever it had already allocated.
    pub fn create(
        factory: &dyn AddressSpaceFactory,
        entry: u64,
    ) -> Result<Box<Self>, KernelError> {
        let mut address_space = factory.create()?;
        let stack = address_space.map_stack(PROCESS_STACK_SIZE)?;

        let process = Box::new(Self {
            pid: Pid::alloc(),
            address_space,
            saved: RegisterSet::initial(entry, stack.top),
            stack,
            entry,
            state: ProcessState::Created,
            runtime_ticks: 0,
            dispatches: 0,
        });
        log::debug!(
            "{}: entry {:#x}, stack {:#x}..{:#x}",
            process.pid,
            entry,
            stack.bottom,
            stack.top
        );
        Ok(process)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn entry_point(&self) -> u64 {
        self.entry
    }

    pub fn stack(&self) -> StackBounds {
        self.stack
    }

    /// Registers the process will resume with.
    pub fn saved_registers(&self) -> &RegisterSet {
        &self.saved
    }

    pub fn address_space(&self) -> &dyn AddressSpace {
        &*self.address_space
    }

    /// Timer ticks spent running.
    pub fn runtime_ticks(&self) -> u64 {
        self.runtime_ticks
    }

    /// Times the process was switched onto a CPU.
    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    pub(crate) fn set_state(&mut self, next: ProcessState) {
        kassert!(
            self.state.can_become(next),
            "{}: illegal transition {:?} -> {:?}",
            self.pid,
            self.state,
            next
        );
        if let ProcessState::Running(_) = next {
            self.dispatches += 1;
        }
        self.state = next;
    }

    pub(crate) fn save_registers(&mut self, regs: &RegisterSet) {
        self.saved = *regs;
    }

    pub(crate) fn account_tick(&mut self) {
        self.runtime_ticks += 1;
    }
}

impl fmt::Debug for ProcessDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessDescriptor")
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("entry", &format_args!("{:#x}", self.entry))
            .field("rip", &format_args!("{:#x}", self.saved.rip))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::mock::MockFactory;

    #[test]
    fn create_sets_entry_and_stack_only() {
        let factory = MockFactory::new();
        let process = ProcessDescriptor::create(&factory, 0x1000).unwrap();

        let regs = process.saved_registers();
        assert_eq!(process.entry_point(), 0x1000);
        assert_eq!(regs.rip, process.entry_point());
        assert_eq!(regs.rsp, process.stack().top);
        assert_eq!(regs.rax, 0);
        assert_eq!(process.stack().size(), PROCESS_STACK_SIZE as u64);
        assert_eq!(process.state(), ProcessState::Created);
        assert_eq!(factory.created(), 1);
    }

    #[test]
    fn pids_are_unique() {
        let factory = MockFactory::new();
        let a = ProcessDescriptor::create(&factory, 0x1000).unwrap();
        let b = ProcessDescriptor::create(&factory, 0x1000).unwrap();
        assert_ne!(a.pid(), b.pid());
    }

    #[test]
    fn address_space_is_destroyed_with_descriptor() {
        let factory = MockFactory::new();
        let process = ProcessDescriptor::create(&factory, 0x1000).unwrap();
        assert_eq!(factory.destroyed(), 0);
        drop(process);
        assert_eq!(factory.destroyed(), 1);
    }

    #[test]
    fn failed_stack_releases_address_space() {
        let factory = MockFactory::new().without_stacks();
        let err = ProcessDescriptor::create(&factory, 0x1000).unwrap_err();
        assert_eq!(err, KernelError::StackUnavailable);
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.destroyed(), 1);
    }

    #[test]
    fn exhausted_factory_reports_error() {
        let factory = MockFactory::new().with_capacity(0);
        let err = ProcessDescriptor::create(&factory, 0x1000).unwrap_err();
        assert_eq!(err, KernelError::AddressSpaceUnavailable);
    }

    #[test]
    fn lifecycle_follows_state_machine() {
        let factory = MockFactory::new();
        let mut process = ProcessDescriptor::create(&factory, 0x1000).unwrap();
        process.set_state(ProcessState::Enqueued);
        process.set_state(ProcessState::Running(CpuId(0)));
        process.set_state(ProcessState::Enqueued);
        process.set_state(ProcessState::Running(CpuId(1)));
        process.set_state(ProcessState::Terminated);
        assert_eq!(process.dispatches(), 2);
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn running_twice_is_fatal() {
        let factory = MockFactory::new();
        let mut process = ProcessDescriptor::create(&factory, 0x1000).unwrap();
        process.set_state(ProcessState::Enqueued);
        process.set_state(ProcessState::Running(CpuId(0)));
        process.set_state(ProcessState::Running(CpuId(1)));
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn terminated_is_final() {
        let factory = MockFactory::new();
        let mut process = ProcessDescriptor::create(&factory, 0x1000).unwrap();
        process.set_state(ProcessState::Terminated);
        process.set_state(ProcessState::Enqueued);
    }
}
