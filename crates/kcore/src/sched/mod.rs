// =============================================================================
// Trellis — Scheduler Interface
// =============================================================================
//
// A policy owns the runnable processes. The kernel talks to it only through
// the `Scheduler` trait, chosen once at boot (`SchedPolicy::build`):
//
//   timer tick ──> update_current(current) ──> tick()? ──> pick_next()
//                                                              │
//        put_prev(preempted) <── switch_to(next) <─────────────┘
//
// Ownership travels with the Box: `pick_next` hands a descriptor out of the
// policy, `put_prev`/`enqueue` hand it back. A descriptor is therefore in
// at most one runqueue position at a time by construction.
// =============================================================================

mod trivial;

pub use self::trivial::TrivialScheduler;

use alloc::boxed::Box;

use crate::process::{Pid, ProcessDescriptor};

pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once per boot, before any process runs.
    fn init(&self);

    /// Makes a new or unblocked process runnable.
    fn enqueue(&self, process: Box<ProcessDescriptor>);

    /// Removes a specific enqueued process and hands it to the caller.
    ///
    /// Asking for a process that is not enqueued is fatal.
    fn dequeue(&self, pid: Pid) -> Box<ProcessDescriptor>;

    /// Accounting hook for the process running on this CPU, once per tick.
    fn update_current(&self, current: &mut ProcessDescriptor);

    /// Timer hook: `true` requests a reschedule on this CPU.
    fn tick(&self) -> bool;

    /// Next process to run, or `None` if this CPU should idle.
    fn pick_next(&self) -> Option<Box<ProcessDescriptor>>;

    /// Returns a preempted process to the policy.
    fn put_prev(&self, process: Box<ProcessDescriptor>);

    /// Number of runnable processes held by the policy.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scheduling policies selectable at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// One shared FIFO runqueue, reschedule on every tick.
    #[default]
    Trivial,
}

impl SchedPolicy {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "trivial" => Some(SchedPolicy::Trivial),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SchedPolicy::Trivial => "trivial",
        }
    }

    pub fn build(self) -> Box<dyn Scheduler> {
        match self {
            SchedPolicy::Trivial => Box::new(TrivialScheduler::new()),
        }
    }
}
