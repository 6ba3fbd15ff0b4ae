//! Ad hoc tracing for the demand-paging daemon.
//!
//! This crate has no UART of its own: unlike the kernel binary it grew out
//! of, it's a library meant to be linked into a larger kernel that already
//! owns a console. Rather than pull in a `log`/`defmt`-style facade this
//! crate doesn't need, `trace!` is a thin wrapper that is entirely compiled
//! out unless both the `vm-trace` feature and a host test build are active,
//! mirroring the ad hoc `printf` debugging the original kernel's authors
//! left in `evict_one`/`fault_in`/`clone_into` to chase swap-slot bugs.

#[cfg(all(feature = "vm-trace", test))]
macro_rules! trace {
    ($($arg:tt)*) => {
        std::eprintln!("[vmcore] {}", std::format!($($arg)*))
    };
}

#[cfg(not(all(feature = "vm-trace", test)))]
macro_rules! trace {
    ($($arg:tt)*) => {
        ()
    };
}

pub(crate) use trace;
