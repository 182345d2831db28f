use crate::{
    kernel::{Kernel, KernelError, ThreadId},
    message::Message,
};
use exception_context::{ExceptionInfo, RawState, ThreadState};

/// The exception info and full register state of a faulting thread, captured
/// when the exception notification was received so that the thread can be
/// restored to exactly that state later
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(C)]
pub struct CapturedException {
    pub info: ExceptionInfo,
    pub state: ThreadState,
}

impl CapturedException {
    /// Captures the exception described by the notification, using the state
    /// embedded in the message where possible and falling back to the live
    /// state of the thread otherwise
    pub fn capture(kernel: &dyn Kernel, notification: &Message, thread: ThreadId) -> Self {
        let info = notification.notification(kernel).info;

        let mut state = ThreadState::zeroed();
        let mut raw = RawState::empty(exception_context::ThreadStateFlavor::NONE);
        for flavor in ThreadState::FLAVORS {
            notification.register_state(kernel, flavor, thread, &mut raw);
            if !state.set_raw(&raw) {
                kernel.fatal("thread state is truncated or of the wrong flavor");
            }
        }

        Self { info, state }
    }

    /// Applies the captured state back to the thread, which must be suspended
    #[inline]
    pub fn restore(&self, kernel: &dyn Kernel, thread: ThreadId) -> Result<(), KernelError> {
        set_thread_context(kernel, thread, &self.state)
    }
}

/// Retrieves the full register state of the thread
pub fn get_thread_context(kernel: &dyn Kernel, thread: ThreadId) -> Result<ThreadState, KernelError> {
    let mut state = ThreadState::zeroed();
    let mut raw = RawState::empty(exception_context::ThreadStateFlavor::NONE);

    for flavor in ThreadState::FLAVORS {
        kernel.get_thread_state(thread, flavor, &mut raw)?;
        if !state.set_raw(&raw) {
            return Err(KernelError::INVALID_ARGUMENT);
        }
    }

    Ok(state)
}

/// Applies the full register state to the thread, which must be suspended
pub fn set_thread_context(
    kernel: &dyn Kernel,
    thread: ThreadId,
    state: &ThreadState,
) -> Result<(), KernelError> {
    for flavor in ThreadState::FLAVORS {
        let Some(raw) = state.raw(flavor) else {
            continue;
        };
        kernel.set_thread_state(thread, &raw)?;
    }

    Ok(())
}
