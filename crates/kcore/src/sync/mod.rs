// =============================================================================
// Trellis — Synchronization Primitives
// =============================================================================
//
// Lock ordering (outermost first):
//   1. Scheduler runqueue lock
//   2. Anything a policy needs while holding it (nothing, for TrivialScheduler)
//
// Per-CPU state is never locked. It is only touched by its own CPU with
// local interrupts disabled, see `percpu::with_this_cpu`.
//
// Rules that hold for every SpinLock in the kernel:
//   - no recursion: taking a lock this CPU already owns is fatal
//   - never call into the scheduler while holding a lock
//   - never attach a CPU to the per-CPU registry while holding a lock
//     (the owner id would change under the lock's feet)
// =============================================================================

mod atomic;
mod spinlock;

pub use self::atomic::AtomicCounter;
pub use self::spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
