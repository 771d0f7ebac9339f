//! Single-word atomic counter.

use core::sync::atomic::{AtomicI32, Ordering};

/// A signed 32-bit counter whose every operation is linearizable across CPUs.
///
/// Arithmetic wraps on overflow. Used for reference counts and epoch
/// counters (the global tick count lives in one).
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct AtomicCounter {
    value: AtomicI32,
}

impl AtomicCounter {
    pub const fn new(value: i32) -> Self {
        Self {
            value: AtomicI32::new(value),
        }
    }

    /// Resets the counter to `value`.
    #[inline]
    pub fn init(&self, value: i32) {
        self.write(value);
    }

    #[inline]
    pub fn read(&self) -> i32 {
        self.value.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn write(&self, value: i32) {
        self.value.store(value, Ordering::SeqCst);
    }

    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    #[inline]
    pub fn dec(&self) {
        self.sub(1);
    }

    #[inline]
    pub fn add(&self, delta: i32) {
        self.value.fetch_add(delta, Ordering::SeqCst);
    }

    #[inline]
    pub fn sub(&self, delta: i32) {
        self.value.fetch_sub(delta, Ordering::SeqCst);
    }

    /// Adds `delta` and returns the value before the update.
    #[inline]
    pub fn fetch_and_add(&self, delta: i32) -> i32 {
        self.value.fetch_add(delta, Ordering::SeqCst)
    }

    /// Subtracts `delta` and returns the value before the update.
    #[inline]
    pub fn fetch_and_sub(&self, delta: i32) -> i32 {
        self.value.fetch_sub(delta, Ordering::SeqCst)
    }

    /// Decrements and returns `true` iff the new value is exactly zero.
    #[inline]
    pub fn dec_and_test(&self) -> bool {
        self.value.fetch_sub(1, Ordering::SeqCst) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn dec_and_test_hits_zero_once() {
        let counter = AtomicCounter::new(1);
        assert!(counter.dec_and_test());
        assert_eq!(counter.read(), 0);

        counter.init(2);
        assert!(!counter.dec_and_test());
        assert!(counter.dec_and_test());

        // Going negative is not "becoming zero".
        assert!(!counter.dec_and_test());
        assert_eq!(counter.read(), -1);
    }

    #[test]
    fn fetch_ops_return_previous_value() {
        let counter = AtomicCounter::new(10);
        assert_eq!(counter.fetch_and_add(5), 10);
        assert_eq!(counter.fetch_and_sub(3), 15);
        assert_eq!(counter.read(), 12);
    }

    #[test]
    fn arithmetic_wraps() {
        let counter = AtomicCounter::new(i32::MAX);
        counter.inc();
        assert_eq!(counter.read(), i32::MIN);
        counter.dec();
        assert_eq!(counter.read(), i32::MAX);
    }

    #[test]
    fn concurrent_updates_are_linearizable() {
        const CPUS: usize = 4;
        const ROUNDS: i32 = 10_000;

        let counter = AtomicCounter::new(0);
        let barrier = Barrier::new(CPUS);
        thread::scope(|s| {
            for cpu in 0..CPUS {
                let counter = &counter;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for i in 0..ROUNDS {
                        // Each simulated CPU nets +3 per round.
                        counter.add(4);
                        counter.dec();
                        if cpu % 2 == 0 {
                            counter.inc();
                            counter.sub(1);
                        } else {
                            counter.fetch_and_add(i);
                            counter.fetch_and_sub(i);
                        }
                    }
                });
            }
        });
        assert_eq!(counter.read(), 3 * ROUNDS * CPUS as i32);
    }
}
