//! Portable types shared between the pieces of the exception bridge.
//!
//! Nothing in here talks to the kernel, these are plain values that describe
//! a hardware exception (the native [`ExceptionInfo`]), the portable
//! [`ExceptionRecord`] it is translated into, and a byte exact snapshot of the
//! register state ([`ThreadState`]) of the thread that raised it.

// crate-specific exceptions:
#![allow(unsafe_code, nonstandard_style)]

mod code;
mod info;
mod state;

pub use code::{ExceptionCode, ExceptionRecord, EXCEPTION_IS_HARDWARE};
pub use info::{ExceptionInfo, ExceptionMask, ExceptionType, EXC_TYPES_COUNT};
pub use state::*;
