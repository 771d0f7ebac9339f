// =============================================================================
// Trellis — Interrupt-Aware Ticket Spinlock
// =============================================================================
//
// Fair FIFO spinlock: `next_ticket` is handed out to arriving CPUs and
// `now_serving` names the ticket that may enter. Unlock advances
// `now_serving` by one.
//
// ACQUIRE, in order:
//   1. remember this CPU's interrupt flag
//   2. CLI (there is no instruction that masks interrupts and takes a lock
//      atomically, so interrupts go off first)
//   3. take a ticket and spin with PAUSE until it is served
//   4. record the remembered flag and this CPU's id in the lock
//
// RELEASE:
//   read back the recorded flag, clear the owner, advance `now_serving`,
//   then restore the flag. The flag is restored last so that an interrupt
//   can never be taken on this CPU while the lock is still held.
//
// A CPU taking a lock it already owns, or releasing one it does not own, is a
// fatal invariant violation (kfatal!), not a silent deadlock.
// =============================================================================

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch;
use crate::percpu::{CpuId, cpu_id};

const NO_OWNER: u32 = u32::MAX;

/// The bare lock: explicit `lock`/`unlock` with no protected data.
///
/// Prefer [`SpinLock<T>`], whose guard cannot forget to unlock.
pub struct RawSpinLock {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    /// `CpuId` of the holder, `NO_OWNER` when free.
    owner: AtomicU32,
    /// Holder's interrupt flag before it called `lock`.
    interrupts_were_enabled: AtomicBool,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            owner: AtomicU32::new(NO_OWNER),
            interrupts_were_enabled: AtomicBool::new(false),
        }
    }

    /// Acquires the lock, leaving local interrupts disabled until `unlock`.
    pub fn lock(&self) {
        let irq_was_enabled = arch::interrupts_enabled();
        arch::disable_interrupts();

        let me = cpu_id();
        // Only this CPU ever stores its own id here, so a relaxed load
        // cannot produce a false positive.
        kassert!(
            self.owner.load(Ordering::Relaxed) != me.0,
            "spinlock already held by cpu {}",
            me.0
        );

        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != my_ticket {
            arch::relax();
        }

        self.owner.store(me.0, Ordering::Relaxed);
        self.interrupts_were_enabled
            .store(irq_was_enabled, Ordering::Relaxed);
    }

    /// Acquires the lock only if it is free right now.
    ///
    /// Never spins, so it is usable from interrupt context even when the
    /// interrupted code might hold the lock.
    pub fn try_lock(&self) -> bool {
        let irq_was_enabled = arch::interrupts_enabled();
        arch::disable_interrupts();

        let serving = self.now_serving.load(Ordering::Relaxed);
        let acquired = self
            .next_ticket
            .compare_exchange(
                serving,
                serving.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok();

        if acquired {
            self.owner.store(cpu_id().0, Ordering::Relaxed);
            self.interrupts_were_enabled
                .store(irq_was_enabled, Ordering::Relaxed);
        } else if irq_was_enabled {
            arch::enable_interrupts();
        }
        acquired
    }

    /// Releases the lock and restores the interrupt flag saved by `lock`.
    pub fn unlock(&self) {
        let me = cpu_id();
        let owner = self.owner.load(Ordering::Relaxed);
        kassert!(
            owner == me.0,
            "cpu {} released a spinlock it does not own (owner {})",
            me.0,
            OwnerDisplay(owner)
        );

        let restore = self.interrupts_were_enabled.load(Ordering::Relaxed);
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.now_serving.fetch_add(1, Ordering::Release);

        if restore {
            arch::enable_interrupts();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    pub fn is_held_by_current_cpu(&self) -> bool {
        self.is_locked() && self.owner.load(Ordering::Relaxed) == cpu_id().0
    }

    /// CPU currently holding the lock. Racy unless called by the owner.
    pub fn owner(&self) -> Option<CpuId> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            id => Some(CpuId(id)),
        }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

struct OwnerDisplay(u32);

impl core::fmt::Display for OwnerDisplay {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.0 {
            NO_OWNER => f.write_str("none"),
            id => write!(f, "cpu {id}"),
        }
    }
}

/// A ticket spinlock protecting a `T`, with interrupts disabled while held.
///
/// ```ignore
/// static TABLE: SpinLock<Vec<Pid>> = SpinLock::new(Vec::new());
///
/// TABLE.lock().push(pid);
/// ```
pub struct SpinLock<T: ?Sized> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// SAFETY: the lock hands out access to `T` to one CPU at a time.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.raw.try_lock().then(|| SpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn is_held_by_current_cpu(&self) -> bool {
        self.raw.is_held_by_current_cpu()
    }

    pub fn owner(&self) -> Option<CpuId> {
        self.raw.owner()
    }

    /// No locking needed: `&mut self` already proves exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for a held [`SpinLock`].
///
/// Not `Send`: the lock must be released on the CPU that took it, since
/// that CPU's interrupt flag is what gets restored.
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    _not_send: PhantomData<*mut ()>,
}

// SAFETY: sharing the guard only shares `&T`.
unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // A simulated CPU unwinding from `halt_cpu` is a halted CPU: it keeps
        // whatever it held, exactly as the hardware would.
        #[cfg(any(test, feature = "hosted"))]
        if std::thread::panicking() {
            return;
        }
        self.lock.raw.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::boot_cpu;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn interrupt_flag_round_trips_from_enabled() {
        boot_cpu(0);
        let lock = SpinLock::new(0u32);
        assert!(arch::interrupts_enabled());
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(!arch::interrupts_enabled());
            assert!(lock.is_held_by_current_cpu());
        }
        assert!(arch::interrupts_enabled());
        assert!(!lock.is_locked());
    }

    #[test]
    fn interrupt_flag_round_trips_from_disabled() {
        boot_cpu(0);
        arch::disable_interrupts();
        let lock = RawSpinLock::new();
        lock.lock();
        assert!(!arch::interrupts_enabled());
        assert_eq!(lock.owner(), Some(CpuId(0)));
        lock.unlock();
        assert!(!arch::interrupts_enabled());
        assert_eq!(lock.owner(), None);
    }

    #[test]
    fn nested_locks_restore_in_order() {
        boot_cpu(0);
        let outer = SpinLock::new(());
        let inner = SpinLock::new(());
        let a = outer.lock();
        let b = inner.lock();
        drop(b);
        // Still inside the outer critical section.
        assert!(!arch::interrupts_enabled());
        drop(a);
        assert!(arch::interrupts_enabled());
    }

    #[test]
    fn try_lock_fails_while_held_and_keeps_flag() {
        boot_cpu(3);
        let lock = SpinLock::new(());
        let guard = lock.lock();

        let contender = thread::scope(|s| {
            s.spawn(|| {
                boot_cpu(4);
                let got = lock.try_lock().is_some();
                (got, arch::interrupts_enabled())
            })
            .join()
            .unwrap()
        });
        assert_eq!(contender, (false, true));

        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn mutual_exclusion_across_cpus() {
        const CPUS: u32 = 4;
        const ROUNDS: u64 = 2_000;

        let lock = SpinLock::new(0u64);
        let inside = AtomicUsize::new(0);
        let barrier = Barrier::new(CPUS as usize);

        thread::scope(|s| {
            for hw in 0..CPUS {
                let (lock, inside, barrier) = (&lock, &inside, &barrier);
                s.spawn(move || {
                    boot_cpu(hw);
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        let mut guard = lock.lock();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        assert!(lock.is_held_by_current_cpu());
                        *guard += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                    assert!(arch::interrupts_enabled());
                });
            }
        });

        assert_eq!(lock.into_inner(), ROUNDS * CPUS as u64);
    }

    #[test]
    #[should_panic(expected = "already held")]
    fn double_lock_is_fatal() {
        boot_cpu(0);
        let lock = RawSpinLock::new();
        lock.lock();
        lock.lock();
    }

    #[test]
    #[should_panic(expected = "does not own")]
    fn unlock_when_free_is_fatal() {
        boot_cpu(0);
        RawSpinLock::new().unlock();
    }

    #[test]
    fn unlock_by_other_cpu_halts_that_cpu() {
        boot_cpu(0);
        let lock = RawSpinLock::new();
        lock.lock();

        let result = thread::scope(|s| {
            s.spawn(|| {
                boot_cpu(1);
                lock.unlock();
            })
            .join()
        });
        assert!(result.is_err());

        // The rightful owner can still release it.
        assert!(lock.is_held_by_current_cpu());
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn halted_holder_never_releases() {
        let lock = SpinLock::new(0u32);

        let result = thread::scope(|s| {
            s.spawn(|| {
                boot_cpu(2);
                let _guard = lock.lock();
                kfatal!("corrupted state under lock");
            })
            .join()
        });
        assert!(result.is_err());

        boot_cpu(0);
        assert!(lock.is_locked());
        assert_eq!(lock.owner(), Some(CpuId(2)));
        assert!(lock.try_lock().is_none());
    }
}
