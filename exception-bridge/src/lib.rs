//! [`RuntimeExceptionCoordinator`] turns hardware exceptions (access
//! violations, illegal instructions, arithmetic faults, breakpoints) into
//! portable structured exceptions that are delivered to a single registered
//! [`ExceptionEvent`], while still cooperating with any exception handlers
//! other components of the process registered before us.
//!
//! # Overview
//!
//! Exceptions are delivered by the kernel as messages to an exception port
//! that is serviced by a dedicated monitor thread (see [`Monitor`]). For each
//! notification the monitor decides whether the fault belongs to code we own
//! (see [`Ownership`]).
//!
//! - If it does, the faulting thread is hijacked: a synthetic frame holding
//!   the portable [`ExceptionRecord`] and the captured register context is
//!   built on the thread's own stack and the thread is resumed inside the
//!   portable dispatch routine, which invokes the [`ExceptionEvent`] on the
//!   faulting thread itself.
//! - If it doesn't, the notification is forwarded to whatever handler was
//!   registered for the thread before us (the chain-back table kept by the
//!   [`RegistryIndex`]), and the eventual reply is routed back to the kernel.
//!
//! When the [`ExceptionEvent`] declines an exception, the faulting thread's
//! original state is restored so that the fault reoccurs, and the second
//! delivery is forwarded to the chain-back handler as if we had never seen it.
//!
//! # Macos
//!
//! On Macos the [`Kernel`] is implemented with Mach exception ports, see
//! [`MachKernel`]. Other targets only get the portable pieces and need to
//! supply their own [`Kernel`].
//!
//! # Stack overflows
//!
//! Access violations that look like they hit the guard page of the faulting
//! thread's stack are never turned into structured exceptions, the process
//! is aborted immediately instead.

#![allow(unsafe_code)]

mod capture;
mod classify;
mod config;
mod coordinator;
mod dispatch;
mod error;
mod forward;
mod frame;
mod hijack;
mod image;
mod kernel;
mod message;
mod monitor;
mod ownership;
mod registry;

pub use capture::{get_thread_context, set_thread_context, CapturedException};
pub use classify::{build_exception_record, is_stack_overflow, BadCodeCount};
pub use config::{
    debugger_present, Config, ExceptionMode, FaultInjection, FAULT_INJECTION_VAR, MODE_VAR,
};
pub use coordinator::RuntimeExceptionCoordinator;
pub use dispatch::{await_rehijack, DispatchOutcome, Dispatcher};
pub use error::Error;
pub use exception_context::{
    ExceptionCode, ExceptionInfo, ExceptionMask, ExceptionRecord, ExceptionType, RawState,
    ThreadState, ThreadStateFlavor,
};
pub use forward::{
    ForwardedException, ForwardedExceptions, PendingReplay, PendingReply, MAX_FORWARDS,
};
pub use frame::{build_trampoline_frame, HijackFrame, Trampoline, RED_ZONE};
pub use hijack::STACK_OVERFLOW_MESSAGE;
pub use image::current_image_range;
pub use kernel::{
    kern_ret, ExceptionBehavior, Kernel, KernelError, MemoryRegion, Port, ThreadId, KERN_FAILURE,
    KERN_SUCCESS, PORT_NULL,
};
pub use message::{Body, ForwardRequest, Message, MessageKind, Notification, Reply, SetContext};
pub use monitor::Monitor;
pub use ownership::{OwnedRegion, Ownership, RegionKind};
pub use registry::{ChainBackEntry, ChainBackTable, HandlerSet, RegistryIndex, MAX_HANDLERS};

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    // SAFETY: syscall
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        mod mac;

        pub use mac::MachKernel;
    }
}

/// The result of the user code executed for an exception
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventResult {
    /// Resume the faulting thread with the (possibly modified) context in the
    /// [`HardwareException`]
    ContinueExecution,
    /// The exception is not ours, let whoever was registered before us have
    /// a go at it
    NotHandled,
}

/// The exception handed to an [`ExceptionEvent`]
#[derive(Copy, Clone, Debug)]
pub struct HardwareException {
    /// The portable description of the exception
    pub record: ExceptionRecord,
    /// The register context of the faulting thread at the time of the fault.
    /// Any changes made to this are applied to the thread if the event
    /// returns [`EventResult::ContinueExecution`]
    pub context: ThreadState,
}

impl HardwareException {
    #[inline]
    pub fn code(&self) -> ExceptionCode {
        self.record.code
    }

    /// The address of the instruction that raised the exception
    #[inline]
    pub fn address(&self) -> usize {
        self.record.address
    }

    #[inline]
    pub fn parameters(&self) -> &[usize] {
        self.record.parameters()
    }
}

/// User implemented trait for handling a hardware exception
///
/// # Safety
///
/// This trait is marked unsafe as [`Self::on_exception`] is run on the
/// faulting thread itself, which was interrupted at an arbitrary instruction
/// and may hold arbitrary locks, including the allocator's. In general, it is
/// advised to do as _little_ as possible when handling an exception.
pub unsafe trait ExceptionEvent: Send + Sync {
    /// Method invoked when an exception occurs in code we own.
    fn on_exception(&self, exception: &mut HardwareException) -> EventResult;
}

/// Creates an [`ExceptionEvent`] using the supplied closure as the implementation.
///
/// # Safety
///
/// See the [`ExceptionEvent`] Safety section for information on why this is `unsafe`.
#[inline]
pub unsafe fn make_exception_event<F>(closure: F) -> Box<dyn ExceptionEvent>
where
    F: Send + Sync + Fn(&mut HardwareException) -> EventResult + 'static,
{
    struct Wrapper<F> {
        inner: F,
    }

    unsafe impl<F> ExceptionEvent for Wrapper<F>
    where
        F: Send + Sync + Fn(&mut HardwareException) -> EventResult,
    {
        fn on_exception(&self, exception: &mut HardwareException) -> EventResult {
            (self.inner)(exception)
        }
    }

    Box::new(Wrapper { inner: closure })
}
