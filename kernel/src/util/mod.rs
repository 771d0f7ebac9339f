// =============================================================================
// Trellis — Kernel Utilities
// =============================================================================
//
//   panic.rs   panic handler: what happens when the kernel panics
// =============================================================================

#[cfg(not(test))]
pub mod panic;
