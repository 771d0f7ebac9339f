//! Round-robin over one runqueue shared by every CPU.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use super::Scheduler;
use crate::process::{Pid, ProcessDescriptor, ProcessState};
use crate::sync::SpinLock;

/// FIFO runqueue behind one spinlock, rescheduling on every tick.
///
/// With several CPUs pulling from the same queue this is strict round-robin
/// across whichever CPUs happen to take the timer interrupt.
pub struct TrivialScheduler {
    runqueue: SpinLock<VecDeque<Box<ProcessDescriptor>>>,
}

impl TrivialScheduler {
    pub const fn new() -> Self {
        Self {
            runqueue: SpinLock::new(VecDeque::new()),
        }
    }

    /// Whether some CPU holds the runqueue lock right now.
    pub fn is_locked(&self) -> bool {
        self.runqueue.is_locked()
    }

    /// Pids in queue order.
    pub fn snapshot(&self) -> Vec<Pid> {
        self.runqueue.lock().iter().map(|p| p.pid()).collect()
    }

    fn push_tail(&self, mut process: Box<ProcessDescriptor>) {
        process.set_state(ProcessState::Enqueued);
        let pid = process.pid();
        self.runqueue.lock().push_back(process);
        log::trace!("{} enqueued", pid);
    }
}

impl Default for TrivialScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TrivialScheduler {
    fn name(&self) -> &'static str {
        "trivial"
    }

    fn init(&self) {
        log::info!("scheduler: trivial round-robin");
    }

    fn enqueue(&self, process: Box<ProcessDescriptor>) {
        self.push_tail(process);
    }

    fn dequeue(&self, pid: Pid) -> Box<ProcessDescriptor> {
        let mut queue = self.runqueue.lock();
        let Some(mut process) = queue
            .iter()
            .position(|p| p.pid() == pid)
            .and_then(|index| queue.remove(index))
        else {
            kfatal!("dequeue of {} which is not enqueued", pid);
        };
        drop(queue);

        process.set_state(ProcessState::Created);
        process
    }

    fn update_current(&self, current: &mut ProcessDescriptor) {
        current.account_tick();
    }

    fn tick(&self) -> bool {
        true
    }

    fn pick_next(&self) -> Option<Box<ProcessDescriptor>> {
        let next = self.runqueue.lock().pop_front();
        if let Some(process) = &next {
            log::trace!("picked {}", process.pid());
        }
        next
    }

    fn put_prev(&self, process: Box<ProcessDescriptor>) {
        self.push_tail(process);
    }

    fn len(&self) -> usize {
        self.runqueue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::boot_cpu;
    use crate::percpu::CpuId;
    use crate::tests::mock::MockFactory;
    use std::thread;

    fn spawn(factory: &MockFactory, entry: u64) -> Box<ProcessDescriptor> {
        ProcessDescriptor::create(factory, entry).unwrap()
    }

    #[test]
    fn runqueue_is_fifo() {
        boot_cpu(0);
        let factory = MockFactory::new();
        let sched = TrivialScheduler::new();
        sched.init();

        let (p1, p2, p3) = (spawn(&factory, 1), spawn(&factory, 2), spawn(&factory, 3));
        let pids = [p1.pid(), p2.pid(), p3.pid()];
        sched.enqueue(p1);
        sched.enqueue(p2);
        sched.enqueue(p3);
        assert_eq!(sched.len(), 3);

        for pid in pids {
            let next = sched.pick_next().unwrap();
            assert_eq!(next.pid(), pid);
            assert_eq!(next.state(), ProcessState::Enqueued);
        }
        assert!(sched.pick_next().is_none());
        assert!(sched.is_empty());
    }

    #[test]
    fn put_prev_goes_to_the_tail() {
        boot_cpu(0);
        let factory = MockFactory::new();
        let sched = TrivialScheduler::new();
        let (a, b) = (spawn(&factory, 1), spawn(&factory, 2));
        let (a_pid, b_pid) = (a.pid(), b.pid());
        sched.enqueue(a);
        sched.enqueue(b);

        let mut running = sched.pick_next().unwrap();
        running.set_state(ProcessState::Running(CpuId(0)));
        sched.put_prev(running);

        assert_eq!(sched.snapshot(), [b_pid, a_pid]);
    }

    #[test]
    fn dequeue_removes_by_identity() {
        boot_cpu(0);
        let factory = MockFactory::new();
        let sched = TrivialScheduler::new();
        let procs: Vec<_> = (1..=3).map(|e| spawn(&factory, e)).collect();
        let pids: Vec<_> = procs.iter().map(|p| p.pid()).collect();
        for p in procs {
            sched.enqueue(p);
        }

        let middle = sched.dequeue(pids[1]);
        assert_eq!(middle.pid(), pids[1]);
        assert_eq!(middle.state(), ProcessState::Created);
        assert_eq!(sched.snapshot(), [pids[0], pids[2]]);

        // A dequeued process can come back.
        sched.enqueue(middle);
        assert_eq!(sched.snapshot(), [pids[0], pids[2], pids[1]]);
    }

    #[test]
    #[should_panic(expected = "not enqueued")]
    fn dequeue_of_absent_process_is_fatal() {
        boot_cpu(0);
        let factory = MockFactory::new();
        let sched = TrivialScheduler::new();
        let stray = spawn(&factory, 1);
        sched.dequeue(stray.pid());
    }

    #[test]
    fn cpu_halted_inside_runqueue_locks_everyone_out() {
        boot_cpu(0);
        let factory = MockFactory::new();
        let sched = TrivialScheduler::new();
        sched.enqueue(spawn(&factory, 1));
        let stray = spawn(&factory, 2).pid();

        let halted = thread::scope(|s| {
            s.spawn(|| {
                boot_cpu(1);
                sched.dequeue(stray);
            })
            .join()
        });
        assert!(halted.is_err());

        // Every other CPU would now spin forever on the runqueue lock.
        assert!(sched.is_locked());
        assert!(sched.runqueue.try_lock().is_none());
        assert_eq!(sched.runqueue.owner(), Some(CpuId(1)));
    }

    #[test]
    fn trivial_policy_always_reschedules_and_accounts() {
        boot_cpu(0);
        let factory = MockFactory::new();
        let sched = TrivialScheduler::new();
        let mut p = spawn(&factory, 1);
        for _ in 0..5 {
            sched.update_current(&mut p);
            assert!(sched.tick());
        }
        assert_eq!(p.runtime_ticks(), 5);
    }
}
