use crate::kernel::KernelError;

/// An error that can occur when setting up the [`crate::RuntimeExceptionCoordinator`]
/// or registering threads with it
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Only one [`crate::ExceptionEvent`] can be registered per coordinator
    #[error("an exception handler is already installed")]
    HandlerAlreadyInstalled,
    /// The [`crate::Monitor`] can only be taken once
    #[error("the monitor thread has already been started")]
    MonitorAlreadyStarted,
    /// A kernel call failed
    #[error("{call} failed")]
    Kernel {
        call: &'static str,
        #[source]
        err: KernelError,
    },
    /// Registering or restoring the exception ports of a thread failed
    #[error("unable to register exception ports for thread {thread}")]
    Registration {
        thread: u32,
        #[source]
        err: KernelError,
    },
    /// The loaded image containing this crate could not be located
    #[error("unable to locate the image containing the exception bridge")]
    ImageNotFound,
    /// An environment variable had a value we don't understand
    #[error("invalid value '{value}' for {name}")]
    InvalidConfig { name: &'static str, value: String },
    /// A failure was forced via fault injection
    #[error("injected failure: {0}")]
    InjectedFailure(&'static str),
    /// An I/O or other syscall failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    #[inline]
    pub(crate) fn kernel(call: &'static str) -> impl FnOnce(KernelError) -> Self {
        move |err| Self::Kernel { call, err }
    }
}
