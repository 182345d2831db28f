//! Redirects a faulting thread into the portable dispatch routine.

use crate::{
    capture::{set_thread_context, CapturedException},
    classify::{build_exception_record, is_stack_overflow},
    config::{Config, FaultInjection},
    dispatch::{self, Dispatcher},
    frame::{build_trampoline_frame, Trampoline},
    kernel::{Kernel, ThreadId},
};
use exception_context::ExceptionCode;

/// Written to stderr before aborting when a stack overflow is detected
pub const STACK_OVERFLOW_MESSAGE: &str = "Stack overflow.";

/// Hijacks the thread, which must be stopped in the exception described by
/// `exception`, so that when it is resumed it runs the exception handler
/// registered with the dispatcher.
///
/// Stack overflows are never dispatched, they abort the process.
pub(crate) fn hijack_thread(
    kernel: &dyn Kernel,
    dispatcher: &Dispatcher,
    config: &Config,
    thread: ThreadId,
    exception: &CapturedException,
) {
    let Ok(mut record) = build_exception_record(&exception.info, &exception.state) else {
        kernel.fatal("exception has an invalid number of codes");
    };

    if let Some(fault) = record.fault_address() {
        if config.injected(FaultInjection::StackOverflow)
            || is_stack_overflow(kernel, exception.state.sp(), fault)
        {
            kernel.fatal(STACK_OVERFLOW_MESSAGE);
        }
    }

    let mut context = exception.state;

    // int3 reports the instruction after the breakpoint
    if cfg!(target_arch = "x86_64") && record.code == ExceptionCode::Breakpoint {
        context.set_pc(context.pc() - 1);
        record.address = context.pc();
    }

    if context.single_step() && record.code != ExceptionCode::SingleStep {
        context.clear_single_step();
    }

    let trampoline = Trampoline {
        entry: dispatch::dispatch_hijacked as usize,
        return_marker: dispatch::hijack_return_marker as usize,
        argument: dispatcher as *const Dispatcher as usize,
    };

    crate::debug_print!("hijacking faulting thread");

    // SAFETY: the thread is stopped in the exception and its stack is in our
    // address space, as we only hijack threads that faulted in our code
    let new_state = unsafe { build_trampoline_frame(exception, &context, &record, &trampoline) };

    if set_thread_context(kernel, thread, &new_state).is_err() {
        kernel.fatal("failed to set the state of a hijacked thread");
    }
}
