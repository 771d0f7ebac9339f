// =============================================================================
// Trellis — x86_64 Boot Glue
// =============================================================================
//
// This module holds the hardware-facing code only the kernel image needs.
// The pieces the scheduling core relies on (interrupt flag, GS base, CPUID)
// live in `kcore::arch`; the devices (APIC, PIC, UART) in `khal`.
//
//   boot.rs  Limine request/response handling
//   gdt.rs   per-core Global Descriptor Table
//   tss.rs   per-core Task State Segment and its interrupt stacks
//   idt.rs   the Interrupt Descriptor Table shared by every core
//   smp.rs   per-core tables, application processor start-up
// =============================================================================

pub mod boot;
pub mod gdt;
pub mod idt;
pub mod smp;
pub mod tss;
