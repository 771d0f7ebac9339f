//! In-memory address-space collaborator for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::KernelError;
use crate::process::{AddressSpace, AddressSpaceFactory, StackBounds};

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    activated: AtomicUsize,
    kernel_activated: AtomicUsize,
}

pub(crate) struct MockFactory {
    counters: Arc<Counters>,
    capacity: usize,
    stacks: bool,
    next_base: AtomicU64,
}

impl MockFactory {
    pub(crate) fn new() -> Self {
        Self {
            counters: Arc::default(),
            capacity: usize::MAX,
            stacks: true,
            next_base: AtomicU64::new(0x10_0000),
        }
    }

    /// Fails `create` once `capacity` address spaces exist.
    pub(crate) fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub(crate) fn without_stacks(mut self) -> Self {
        self.stacks = false;
        self
    }

    pub(crate) fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub(crate) fn destroyed(&self) -> usize {
        self.counters.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn activated(&self) -> usize {
        self.counters.activated.load(Ordering::SeqCst)
    }

    pub(crate) fn kernel_activated(&self) -> usize {
        self.counters.kernel_activated.load(Ordering::SeqCst)
    }
}

impl AddressSpaceFactory for MockFactory {
    fn create(&self) -> Result<Box<dyn AddressSpace>, KernelError> {
        let live = self.created() - self.destroyed();
        if live >= self.capacity {
            return Err(KernelError::AddressSpaceUnavailable);
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSpace {
            counters: Arc::clone(&self.counters),
            base: self.next_base.fetch_add(0x10_0000, Ordering::SeqCst),
            stacks: self.stacks,
        }))
    }

    fn activate_kernel(&self) {
        self.counters.kernel_activated.fetch_add(1, Ordering::SeqCst);
    }
}

/// Shares the counter set so the test keeps observing it after the factory
/// has been moved into a `KernelState`.
impl AddressSpaceFactory for Arc<MockFactory> {
    fn create(&self) -> Result<Box<dyn AddressSpace>, KernelError> {
        (**self).create()
    }

    fn activate_kernel(&self) {
        (**self).activate_kernel();
    }
}

struct MockSpace {
    counters: Arc<Counters>,
    base: u64,
    stacks: bool,
}

impl AddressSpace for MockSpace {
    fn activate(&self) {
        self.counters.activated.fetch_add(1, Ordering::SeqCst);
    }

    fn map_stack(&mut self, size: usize) -> Result<StackBounds, KernelError> {
        if !self.stacks {
            return Err(KernelError::StackUnavailable);
        }
        Ok(StackBounds {
            bottom: self.base,
            top: self.base + size as u64,
        })
    }
}

impl Drop for MockSpace {
    fn drop(&mut self) {
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}
