//! Global Descriptor Table (GDT) for x86_64.
//!
//! In long mode segmentation is mostly disabled, but a GDT is still required
//! for the code and stack selectors `iretq` checks, and to point at the TSS.
//! Every core has its own GDT: loading a TSS marks its descriptor busy, so
//! two cores cannot share one.

use core::arch::asm;
use core::mem::size_of;

use kcore::arch::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR};

use super::tss::Tss;

/// Null, kernel code, kernel data, TSS (two slots).
const GDT_ENTRIES: usize = 5;

const TSS_SELECTOR: u16 = 0x18;

/// 64-bit kernel code: P=1, DPL=0, S=1, executable, readable; L=1.
const KERNEL_CODE: u64 = 0x00_2F_9A_00_0000_FFFF;

/// Kernel data: P=1, DPL=0, S=1, writable.
const KERNEL_DATA: u64 = 0x00_0F_92_00_0000_FFFF;

/// A TSS descriptor in the GDT (128 bits / 2 entries).
#[derive(Debug, Clone, Copy)]
struct TssDescriptor {
    low: u64,
    high: u64,
}

impl TssDescriptor {
    fn new(tss: &Tss) -> Self {
        let base = tss as *const Tss as u64;
        let limit = (size_of::<Tss>() - 1) as u64;

        let mut low: u64 = 0;
        low |= limit & 0xFFFF;
        low |= (base & 0xFF_FFFF) << 16;
        // Present, DPL=0, type 0x9 (64-bit TSS, available).
        low |= 0x89u64 << 40;
        low |= ((limit >> 16) & 0xF) << 48;
        low |= ((base >> 24) & 0xFF) << 56;

        Self { low, high: base >> 32 }
    }
}

/// One core's descriptor table.
///
/// | selector | entry                 |
/// |----------|-----------------------|
/// | 0x00     | null                  |
/// | 0x08     | kernel code (64-bit)  |
/// | 0x10     | kernel data           |
/// | 0x18     | TSS (two slots)       |
#[repr(C, align(16))]
pub struct Gdt {
    entries: [u64; GDT_ENTRIES],
}

impl Gdt {
    pub fn new(tss: &'static Tss) -> Self {
        let tss = TssDescriptor::new(tss);
        Self {
            entries: [0, KERNEL_CODE, KERNEL_DATA, tss.low, tss.high],
        }
    }

    /// Loads this GDT, reloads every segment register and the task register.
    ///
    /// # Safety
    ///
    /// Must run once per core, with interrupts disabled, on the core that
    /// owns this table.
    pub unsafe fn load(&'static self) {
        let ptr = GdtPointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const _ as u64,
        };

        unsafe {
            asm!(
                "lgdt [{}]",
                in(reg) &ptr,
                options(readonly, nostack, preserves_flags)
            );

            // Reload CS with a far return to the next instruction.
            asm!(
                "push {sel}",
                "lea {tmp}, [rip + 2f]",
                "push {tmp}",
                "retfq",
                "2:",
                sel = in(reg) KERNEL_CODE_SELECTOR,
                tmp = lateout(reg) _,
                options(preserves_flags)
            );

            // GS is left alone: reloading it would clear the per-CPU base.
            asm!(
                "mov ds, {sel:x}",
                "mov es, {sel:x}",
                "mov ss, {sel:x}",
                sel = in(reg) KERNEL_DATA_SELECTOR as u16,
                options(nostack, preserves_flags)
            );

            asm!(
                "ltr {sel:x}",
                sel = in(reg) TSS_SELECTOR,
                options(nostack, preserves_flags)
            );
        }
    }
}

/// Pointer structure for the `lgdt` instruction.
#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u64,
}
