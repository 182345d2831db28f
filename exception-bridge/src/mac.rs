//! The Mach implementation of the [`crate::Kernel`].
//!
//! Exceptions are delivered as `mach_exc.defs` messages to a port registered
//! per thread with `thread_swap_exception_ports`, and hijacked threads talk
//! to the monitor with two private messages sent to the same port.

mod ffi;
mod kernel;
mod wire;

pub use kernel::MachKernel;
