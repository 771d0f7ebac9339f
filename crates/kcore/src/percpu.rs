// =============================================================================
// Trellis — Per-CPU Variables
// =============================================================================
//
// Every CPU owns one copy of a fixed template area. All copies share the same
// layout, so a variable is just an offset that is valid on every CPU.
//
//   offset 0   self pointer   (area base, read with one GS-relative load)
//   offset 8   cpu index      (EARLY | hardware id until the CPU attaches)
//   offset 16  declared variables, each followed by a one-byte borrow flag
//
// BOOTSTRAP (one protocol for every CPU, the boot CPU included):
//   1. early_init()          the one slow hardware query; GS -> a static
//                            placeholder {self: 0, index: EARLY | hardware id}
//                            cpu_id() now reports the hardware id
//   2. PerCpuRegistry::init  boot CPU only: allocate N areas, run every
//                            variable's Default, fill the headers
//   3. attach_current_cpu()  each CPU: look its hardware id up, then GS ->
//                            its own area
//
// After step 3 `cpu_id()` and `this_cpu()` are a single memory load each.
// =============================================================================

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::vec::Vec;
use core::any::TypeId;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::MAX_CPUS;
use crate::arch::{self, HardwareId};

const SELF_OFFSET: usize = 0;
const INDEX_OFFSET: usize = 8;
const HEADER_SIZE: usize = 16;

/// Area alignment and stride granularity: one cache line, so two CPUs
/// never share a line of per-CPU data.
const AREA_ALIGN: usize = 64;

const UNATTACHED: usize = usize::MAX;

/// Logical CPU index: dense, starting at 0 for the first provisioned CPU.
///
/// Before a CPU attaches, [`cpu_id`] reports its hardware id instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u32);

impl CpuId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Index-word tag of a CPU that has run `early_init` but not attached yet.
/// The low bits hold its hardware id.
const EARLY: usize = 1 << (usize::BITS - 1);

/// What GS points at before a CPU is attached. `cpu_index` is
/// `EARLY | hardware id` once claimed, `UNATTACHED` while vacant.
#[repr(C, align(64))]
struct Placeholder {
    // Only ever read through the local base.
    #[allow(dead_code)]
    self_ptr: usize,
    cpu_index: AtomicUsize,
}

impl Placeholder {
    const fn vacant() -> Self {
        Self {
            self_ptr: 0,
            cpu_index: AtomicUsize::new(UNATTACHED),
        }
    }
}

static PLACEHOLDERS: [Placeholder; MAX_CPUS] = [const { Placeholder::vacant() }; MAX_CPUS];

/// Shared by CPUs that find every placeholder taken; they fall back to the
/// hardware query on each `cpu_id()`.
static OVERFLOW_PLACEHOLDER: Placeholder = Placeholder::vacant();

fn claim_placeholder(hw: HardwareId) -> &'static Placeholder {
    let tagged = EARLY | hw as usize;
    if let Some(slot) = PLACEHOLDERS
        .iter()
        .find(|slot| slot.cpu_index.load(Ordering::Acquire) == tagged)
    {
        return slot;
    }
    PLACEHOLDERS
        .iter()
        .find(|slot| {
            slot.cpu_index
                .compare_exchange(UNATTACHED, tagged, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
        .unwrap_or(&OVERFLOW_PLACEHOLDER)
}

/// Points this CPU's local base at a placeholder carrying its hardware id.
///
/// Must be the first thing every CPU does, before any lock is taken. This
/// is the one place the slow hardware query runs.
pub fn early_init() {
    let slot = claim_placeholder(arch::hardware_id());
    // SAFETY: placeholders are statics holding both header words.
    unsafe { arch::set_local_base(slot as *const Placeholder as usize) };
}

/// Identity of the executing CPU.
///
/// One GS-relative load. Before attach it is the hardware id recorded by
/// `early_init`.
#[inline]
pub fn cpu_id() -> CpuId {
    match arch::read_local_word(INDEX_OFFSET) {
        UNATTACHED => CpuId(arch::hardware_id()),
        word if word & EARLY != 0 => CpuId((word & !EARLY) as u32),
        index => CpuId(index as u32),
    }
}

/// Hardware id of the executing CPU, without querying the hardware if
/// `early_init` already did.
fn early_hardware_id() -> HardwareId {
    match arch::read_local_word(INDEX_OFFSET) {
        word if word != UNATTACHED && word & EARLY != 0 => (word & !EARLY) as HardwareId,
        _ => arch::hardware_id(),
    }
}

/// Handle to a declared per-CPU variable: its offset in every area.
pub struct PerCpuVar<T> {
    offset: usize,
    flag: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for PerCpuVar<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PerCpuVar<T> {}

impl<T> fmt::Debug for PerCpuVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerCpuVar")
            .field("offset", &self.offset)
            .finish()
    }
}

impl<T> PerCpuVar<T> {
    pub fn offset(&self) -> usize {
        self.offset
    }
}

struct Slot {
    name: &'static str,
    offset: usize,
    flag: usize,
    type_id: TypeId,
    init: unsafe fn(*mut u8),
    drop: unsafe fn(*mut u8),
}

unsafe fn init_slot<T: Default>(ptr: *mut u8) {
    unsafe { ptr.cast::<T>().write(T::default()) }
}

unsafe fn drop_slot<T>(ptr: *mut u8) {
    unsafe { ptr.cast::<T>().drop_in_place() }
}

/// Catalog of per-CPU variables, fixed before the registry is built.
pub struct PerCpuLayout {
    slots: Vec<Slot>,
    size: usize,
}

impl PerCpuLayout {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            size: HEADER_SIZE,
        }
    }

    /// Registers a variable, default-initialised on every CPU.
    pub fn declare<T: Default + Send + 'static>(&mut self, name: &'static str) -> PerCpuVar<T> {
        kassert!(
            self.slots.iter().all(|slot| slot.name != name),
            "per-cpu variable `{}` declared twice",
            name
        );
        let layout = Layout::new::<T>();
        kassert!(
            layout.align() <= AREA_ALIGN,
            "per-cpu variable `{}` needs {}-byte alignment",
            name,
            layout.align()
        );

        let offset = self.size.next_multiple_of(layout.align());
        let flag = offset + layout.size();
        self.size = flag + 1;
        self.slots.push(Slot {
            name,
            offset,
            flag,
            type_id: TypeId::of::<T>(),
            init: init_slot::<T>,
            drop: drop_slot::<T>,
        });

        PerCpuVar {
            offset,
            flag,
            _marker: PhantomData,
        }
    }

    /// Finds a declared variable by name, if it has type `T`.
    pub fn lookup<T: 'static>(&self, name: &str) -> Option<PerCpuVar<T>> {
        let slot = self.slots.iter().find(|slot| slot.name == name)?;
        if slot.type_id != TypeId::of::<T>() {
            return None;
        }
        Some(PerCpuVar {
            offset: slot.offset,
            flag: slot.flag,
            _marker: PhantomData,
        })
    }

    /// Template size in bytes, header included.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for PerCpuLayout {
    fn default() -> Self {
        Self::new()
    }
}

/// One template copy per CPU plus the `offsets[cpu] -> base` table.
pub struct PerCpuRegistry {
    layout: PerCpuLayout,
    block: NonNull<u8>,
    block_layout: Layout,
    stride: usize,
    offsets: Vec<usize>,
    hardware_ids: Vec<HardwareId>,
}

// SAFETY: areas are only touched by their own CPU (or by `remote_cpu`, whose
// callers guarantee exclusion), and every variable type is `Send`.
unsafe impl Send for PerCpuRegistry {}
unsafe impl Sync for PerCpuRegistry {}

impl PerCpuRegistry {
    /// Allocates and initialises one area per entry of `hardware_ids`.
    ///
    /// CPU index `i` is the CPU whose hardware id is `hardware_ids[i]`.
    /// Fatal if the areas cannot be allocated: there is no degraded mode
    /// without per-CPU state.
    pub fn init(layout: PerCpuLayout, hardware_ids: &[HardwareId]) -> Self {
        let count = hardware_ids.len();
        kassert!(
            count > 0 && count <= MAX_CPUS,
            "cannot provision per-cpu areas for {} cpus (max {})",
            count,
            MAX_CPUS
        );
        for (i, id) in hardware_ids.iter().enumerate() {
            kassert!(
                !hardware_ids[..i].contains(id),
                "hardware id {} listed twice",
                id
            );
        }

        let stride = layout.size.next_multiple_of(AREA_ALIGN);
        let Ok(block_layout) = Layout::from_size_align(stride * count, AREA_ALIGN) else {
            kfatal!("per-cpu block of {} x {} bytes is not representable", count, stride);
        };
        // SAFETY: the size is at least one header, never zero.
        let raw = unsafe { alloc_zeroed(block_layout) };
        let Some(block) = NonNull::new(raw) else {
            kfatal!("out of memory allocating {} bytes of per-cpu areas", block_layout.size());
        };

        let mut offsets = Vec::with_capacity(count);
        for cpu in 0..count {
            // SAFETY: `cpu * stride` is within the block just allocated, and
            // every slot offset was laid out inside `layout.size <= stride`.
            unsafe {
                let base = block.as_ptr().add(cpu * stride);
                base.add(SELF_OFFSET).cast::<usize>().write(base as usize);
                base.add(INDEX_OFFSET).cast::<usize>().write(cpu);
                for slot in &layout.slots {
                    (slot.init)(base.add(slot.offset));
                }
                offsets.push(base as usize);
            }
        }

        log::info!(
            "per-cpu: {} areas, {} bytes each, {} variables",
            count,
            stride,
            layout.slots.len()
        );

        Self {
            layout,
            block,
            block_layout,
            stride,
            offsets,
            hardware_ids: hardware_ids.to_vec(),
        }
    }

    /// Points the executing CPU's local base at its own area.
    ///
    /// Every CPU runs this once, boot CPU included. Must not be called while
    /// holding a spinlock: lock ownership is recorded by `cpu_id()`, which
    /// changes from hardware id to index here.
    pub fn attach_current_cpu(&self) -> CpuId {
        let hw = early_hardware_id();
        let Some(index) = self.hardware_ids.iter().position(|&id| id == hw) else {
            kfatal!("cpu with hardware id {} has no per-cpu area", hw);
        };
        // SAFETY: the area lives as long as the registry, and the registry
        // resets this CPU to the placeholder when dropped.
        unsafe { arch::set_local_base(self.offsets[index]) };

        let cpu = CpuId(index as u32);
        log::debug!("{} attached (hardware id {})", cpu, hw);
        cpu
    }

    pub fn cpu_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn layout(&self) -> &PerCpuLayout {
        &self.layout
    }

    pub fn hardware_id(&self, cpu: CpuId) -> Option<HardwareId> {
        self.hardware_ids.get(cpu.index()).copied()
    }

    pub fn lookup<T: 'static>(&self, name: &str) -> Option<PerCpuVar<T>> {
        self.layout.lookup(name)
    }

    fn owns(&self, base: usize) -> bool {
        let start = self.block.as_ptr() as usize;
        base >= start && base < start + self.block_layout.size()
    }

    fn current_base(&self) -> usize {
        let base = arch::read_local_word(SELF_OFFSET);
        kassert!(base != 0, "per-cpu variable used before this cpu attached");
        debug_assert!(self.owns(base), "cpu attached to a different registry");
        base
    }

    /// This CPU's copy of `var`.
    ///
    /// # Safety
    /// The caller must keep the reference exclusive: no interrupt handler or
    /// nested call on this CPU may reach the same variable while it is live.
    /// [`with_this_cpu`](Self::with_this_cpu) is the checked form.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn this_cpu<T>(&self, var: PerCpuVar<T>) -> &mut T {
        let base = self.current_base();
        // SAFETY: `var` was declared in this layout, so the offset is in
        // bounds and the slot holds an initialised `T`.
        unsafe { &mut *((base + var.offset) as *mut T) }
    }

    /// Runs `f` on this CPU's copy of `var` with local interrupts disabled.
    ///
    /// Re-entering the same variable from inside `f` is fatal.
    pub fn with_this_cpu<T, R>(&self, var: PerCpuVar<T>, f: impl FnOnce(&mut T) -> R) -> R {
        arch::without_interrupts(|| {
            let base = self.current_base();
            let flag = (base + var.flag) as *mut u8;
            // SAFETY: the flag byte belongs to this CPU's area and interrupts
            // are off, so nothing else on this CPU can touch it.
            unsafe {
                kassert!(
                    flag.read() == 0,
                    "per-cpu variable at offset {} re-entered",
                    var.offset
                );
                flag.write(1);
            }
            // SAFETY: the borrow flag guarantees this is the only reference.
            let result = f(unsafe { &mut *((base + var.offset) as *mut T) });
            // SAFETY: as above.
            unsafe { flag.write(0) };
            result
        })
    }

    pub fn read_this_cpu<T: Copy>(&self, var: PerCpuVar<T>) -> T {
        self.with_this_cpu(var, |value| *value)
    }

    pub fn write_this_cpu<T>(&self, var: PerCpuVar<T>, value: T) {
        self.with_this_cpu(var, |slot| *slot = value);
    }

    /// Another CPU's copy of `var`. Bootstrap only.
    ///
    /// # Safety
    /// The target CPU must not be running kernel code that touches `var`
    /// (before it attaches, or while it is parked), and no other reference
    /// to that copy may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn remote_cpu<T>(&self, var: PerCpuVar<T>, cpu: CpuId) -> &mut T {
        kassert!(
            cpu.index() < self.offsets.len(),
            "{} has no per-cpu area ({} provisioned)",
            cpu,
            self.offsets.len()
        );
        let base = self.offsets[cpu.index()];
        // SAFETY: see `this_cpu`; exclusion is the caller's obligation.
        unsafe { &mut *((base + var.offset) as *mut T) }
    }
}

impl Drop for PerCpuRegistry {
    fn drop(&mut self) {
        if self.owns(arch::local_base()) {
            early_init();
        }
        for cpu in 0..self.offsets.len() {
            // SAFETY: every slot was initialised in `init` and is dropped
            // exactly once here.
            unsafe {
                let base = self.block.as_ptr().add(cpu * self.stride);
                for slot in &self.layout.slots {
                    (slot.drop)(base.add(slot.offset));
                }
            }
        }
        // SAFETY: allocated in `init` with this layout.
        unsafe { dealloc(self.block.as_ptr(), self.block_layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::{boot_cpu, hardware_id_queries};
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn layout_starts_after_header_and_respects_alignment() {
        let mut layout = PerCpuLayout::new();
        let byte = layout.declare::<u8>("byte");
        let word = layout.declare::<u64>("word");
        assert_eq!(byte.offset(), HEADER_SIZE);
        assert_eq!(word.offset() % 8, 0);
        assert!(word.offset() > byte.offset());
        assert_eq!(layout.len(), 2);

        assert!(layout.lookup::<u64>("word").is_some());
        assert!(layout.lookup::<u32>("word").is_none());
        assert!(layout.lookup::<u64>("missing").is_none());
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn duplicate_declaration_is_fatal() {
        let mut layout = PerCpuLayout::new();
        layout.declare::<u32>("ticks");
        layout.declare::<u64>("ticks");
    }

    #[test]
    #[should_panic(expected = "cannot provision")]
    fn zero_cpus_is_fatal() {
        PerCpuRegistry::init(PerCpuLayout::new(), &[]);
    }

    #[test]
    #[should_panic(expected = "cannot provision")]
    fn too_many_cpus_is_fatal() {
        let ids: Vec<HardwareId> = (0..=MAX_CPUS as u32).collect();
        PerCpuRegistry::init(PerCpuLayout::new(), &ids);
    }

    #[test]
    fn cpu_id_reports_hardware_id_until_attached() {
        boot_cpu(7);
        assert_eq!(cpu_id(), CpuId(7));

        let registry = PerCpuRegistry::init(PerCpuLayout::new(), &[3, 7]);
        assert_eq!(cpu_id(), CpuId(7));
        assert_eq!(registry.attach_current_cpu(), CpuId(1));
        assert_eq!(cpu_id(), CpuId(1));
        assert_eq!(registry.hardware_id(CpuId(1)), Some(7));

        drop(registry);
        // Back on the placeholder, not on freed memory.
        assert_eq!(cpu_id(), CpuId(7));
    }

    #[test]
    fn hardware_is_queried_once_per_cpu() {
        let queried = thread::spawn(|| {
            boot_cpu(4);
            let after_boot = hardware_id_queries();

            for _ in 0..16 {
                assert_eq!(cpu_id(), CpuId(4));
            }
            let lock = crate::RawSpinLock::new();
            lock.lock();
            assert_eq!(lock.owner(), Some(CpuId(4)));
            lock.unlock();

            let registry = PerCpuRegistry::init(PerCpuLayout::new(), &[2, 4]);
            assert_eq!(registry.attach_current_cpu(), CpuId(1));
            assert_eq!(cpu_id(), CpuId(1));
            hardware_id_queries() - after_boot
        })
        .join()
        .unwrap();
        assert_eq!(queried, 0);
    }

    #[test]
    #[should_panic(expected = "has no per-cpu area")]
    fn attach_of_unknown_cpu_is_fatal() {
        boot_cpu(9);
        let registry = PerCpuRegistry::init(PerCpuLayout::new(), &[0, 1]);
        registry.attach_current_cpu();
    }

    #[test]
    #[should_panic(expected = "before this cpu attached")]
    fn this_cpu_before_attach_is_fatal() {
        boot_cpu(0);
        let mut layout = PerCpuLayout::new();
        let var = layout.declare::<u32>("x");
        let registry = PerCpuRegistry::init(layout, &[0]);
        registry.read_this_cpu(var);
    }

    #[test]
    fn this_cpu_is_isolated_between_cpus() {
        const CPUS: u32 = 4;
        let mut layout = PerCpuLayout::new();
        let var = layout.declare::<u64>("value");
        let registry = PerCpuRegistry::init(layout, &[0, 1, 2, 3]);
        let barrier = Barrier::new(CPUS as usize);

        thread::scope(|s| {
            for hw in 0..CPUS {
                let (registry, barrier) = (&registry, &barrier);
                s.spawn(move || {
                    boot_cpu(hw);
                    let me = registry.attach_current_cpu();
                    assert_eq!(registry.read_this_cpu(var), 0);
                    barrier.wait();
                    for _ in 0..1_000 {
                        registry.with_this_cpu(var, |v| *v += u64::from(hw) + 1);
                    }
                    barrier.wait();
                    assert_eq!(registry.read_this_cpu(var), 1_000 * (u64::from(hw) + 1));
                    assert_eq!(cpu_id(), me);
                });
            }
        });
    }

    #[test]
    fn remote_write_is_seen_by_target_after_attach() {
        let mut layout = PerCpuLayout::new();
        let var = layout.declare::<Option<u32>>("boot_arg");
        boot_cpu(0);
        let registry = PerCpuRegistry::init(layout, &[0, 1]);
        registry.attach_current_cpu();

        // SAFETY: cpu 1 has not started yet.
        unsafe { *registry.remote_cpu(var, CpuId(1)) = Some(42) };

        let seen = thread::scope(|s| {
            s.spawn(|| {
                boot_cpu(1);
                registry.attach_current_cpu();
                registry.read_this_cpu(var)
            })
            .join()
            .unwrap()
        });
        assert_eq!(seen, Some(42));
        assert_eq!(registry.read_this_cpu(var), None);
    }

    #[test]
    #[should_panic(expected = "re-entered")]
    fn nested_with_this_cpu_is_fatal() {
        boot_cpu(0);
        let mut layout = PerCpuLayout::new();
        let var = layout.declare::<u32>("x");
        let registry = PerCpuRegistry::init(layout, &[0]);
        registry.attach_current_cpu();
        registry.with_this_cpu(var, |_| registry.write_this_cpu(var, 1));
    }

    #[test]
    fn with_this_cpu_masks_interrupts() {
        boot_cpu(0);
        let mut layout = PerCpuLayout::new();
        let var = layout.declare::<bool>("flag");
        let registry = PerCpuRegistry::init(layout, &[0]);
        registry.attach_current_cpu();
        let inside = registry.with_this_cpu(var, |_| arch::interrupts_enabled());
        assert!(!inside);
        assert!(arch::interrupts_enabled());
    }

    static LIVE: AtomicUsize = AtomicUsize::new(0);

    struct Tracked;

    impl Default for Tracked {
        fn default() -> Self {
            LIVE.fetch_add(1, Ordering::SeqCst);
            Tracked
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            LIVE.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn variables_are_constructed_and_dropped_per_cpu() {
        let mut layout = PerCpuLayout::new();
        layout.declare::<Tracked>("tracked");
        let registry = PerCpuRegistry::init(layout, &[0, 1, 2]);
        assert_eq!(LIVE.load(Ordering::SeqCst), 3);
        assert_eq!(registry.cpu_count(), 3);
        drop(registry);
        assert_eq!(LIVE.load(Ordering::SeqCst), 0);
    }
}
