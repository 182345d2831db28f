//! The portable dispatch routine, which runs on a hijacked thread.

use crate::{
    capture::CapturedException,
    kernel::{Kernel, Port, ThreadId},
    message::Message,
    Error, EventResult, ExceptionEvent, HardwareException,
};
use exception_context::{ExceptionRecord, ThreadState};
use std::sync::{Arc, OnceLock};

/// What happened to an exception after it was dispatched
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler handled the exception, the monitor has been asked to
    /// resume the thread with the handler's context
    Resumed,
    /// The handler declined the exception, the monitor has been asked to
    /// replay it to the chain-back handler
    Forwarded,
}

/// Owns the registered [`ExceptionEvent`] and hands it exceptions
pub struct Dispatcher {
    kernel: Arc<dyn Kernel>,
    monitor_port: Port,
    handler: OnceLock<Box<dyn ExceptionEvent>>,
    decline_all: bool,
}

impl Dispatcher {
    pub(crate) fn new(kernel: Arc<dyn Kernel>, monitor_port: Port, decline_all: bool) -> Self {
        Self {
            kernel,
            monitor_port,
            handler: OnceLock::new(),
            decline_all,
        }
    }

    /// Sets the handler, which can only be done once
    pub fn set_handler(&self, handler: Box<dyn ExceptionEvent>) -> Result<(), Error> {
        self.handler
            .set(handler)
            .map_err(|_handler| Error::HandlerAlreadyInstalled)
    }

    #[inline]
    pub fn has_handler(&self) -> bool {
        self.handler.get().is_some()
    }

    /// The port the monitor receives requests on
    #[inline]
    pub fn monitor_port(&self) -> Port {
        self.monitor_port
    }

    /// Invokes the handler for the exception, then asks the monitor to either
    /// resume `thread` with the handler's context, or to replay the original
    /// exception so it reaches the chain-back handler.
    ///
    /// This is run on the faulting thread itself, the caller must not return
    /// to the faulting code afterwards, see [`await_rehijack`].
    pub fn dispatch_on(
        &self,
        thread: ThreadId,
        context: &mut ThreadState,
        record: &ExceptionRecord,
        exception: &CapturedException,
    ) -> DispatchOutcome {
        let kernel = &*self.kernel;
        let mut hw = HardwareException {
            record: *record,
            context: *context,
        };

        let result = match self.handler.get() {
            Some(handler) if !self.decline_all => handler.on_exception(&mut hw),
            _ => EventResult::NotHandled,
        };

        let mut msg = Message::empty();
        match result {
            EventResult::ContinueExecution => {
                crate::debug_print!("exception handled, resuming");
                *context = hw.context;
                msg.send_set_context(kernel, self.monitor_port, thread, context);
                DispatchOutcome::Resumed
            }
            EventResult::NotHandled => {
                crate::debug_print!("exception declined, forwarding");
                msg.send_forward_request(kernel, self.monitor_port, thread, thread, exception);
                DispatchOutcome::Forwarded
            }
        }
    }
}

/// Waits for the monitor to rewrite the state of this thread.
///
/// The monitor suspends this thread and overwrites all of its registers, so
/// this must never block in the kernel, it just yields until that happens.
pub fn await_rehijack() -> ! {
    loop {
        std::thread::yield_now();
    }
}

/// The entry point of a hijacked thread, see [`crate::frame::build_trampoline_frame`]
///
/// # Safety
///
/// Must only be entered via a frame built by the hijacker, which supplies
/// valid pointers into the frame on this thread's stack and a live dispatcher
pub(crate) unsafe extern "C" fn dispatch_hijacked(
    context: *mut ThreadState,
    record: *const ExceptionRecord,
    exception: *const CapturedException,
    dispatcher: *const Dispatcher,
) -> ! {
    let dispatcher = &*dispatcher;
    let thread = dispatcher.kernel.current_thread();

    dispatcher.dispatch_on(thread, &mut *context, &*record, &*exception);
    await_rehijack()
}

/// The return address of [`dispatch_hijacked`], which never returns
pub(crate) extern "C" fn hijack_return_marker() -> ! {
    crate::write_stderr("returned from a hijacked exception dispatch\n");
    // SAFETY: syscall
    unsafe { libc::abort() }
}
