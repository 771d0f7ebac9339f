// =============================================================================
// Trellis — Fatal Invariant Violations
// =============================================================================
//
// A broken locking or scheduling invariant means the shared kernel state can
// no longer be trusted. There is no recovery path: we log where it happened
// and what was violated, then halt the offending CPU.
//
// On bare metal `halt_cpu()` is CLI + HLT forever. Other CPUs keep running
// unless the halted one held a lock they need (the runqueue lock in
// particular), in which case they spin on it forever.
//
// In the hosted simulation `halt_cpu()` unwinds the simulated CPU's thread,
// so tests can observe the halt with `#[should_panic]` or a failed join.
// =============================================================================

/// Logs a fatal error with its source location and halts the current CPU.
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)+) => {{
        $crate::__log::error!(
            "fatal at {}:{}: {}",
            ::core::file!(),
            ::core::line!(),
            ::core::format_args!($($arg)+)
        );
        $crate::arch::halt_cpu(::core::format_args!($($arg)+))
    }};
}

/// Checks a kernel invariant; a failure is fatal (see [`kfatal!`]).
///
/// Unlike `debug_assert!` the check is kept in release builds.
#[macro_export]
macro_rules! kassert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::kfatal!(
                "assertion `{}` failed: {}",
                ::core::stringify!($cond),
                ::core::format_args!($($arg)+)
            );
        }
    };
}
