use crate::{
    config::{Config, FaultInjection},
    dispatch::Dispatcher,
    error::Error,
    kernel::{ExceptionBehavior, Kernel, Port, ThreadId},
    monitor::Monitor,
    ownership::{OwnedRegion, Ownership, RegionKind},
    registry::RegistryIndex,
    ExceptionEvent,
};
use exception_context::ThreadStateFlavor;
use std::sync::Arc;

/// Owns all of the process lifetime state of the exception bridge: the
/// exception port, the chain-back tables of every registered thread, the
/// set of memory we own, the registered exception handler, and the monitor
/// that services the exception port.
///
/// Each coordinator is fully independent, but only one per process should
/// ever register threads with a native kernel.
pub struct RuntimeExceptionCoordinator {
    kernel: Arc<dyn Kernel>,
    config: Config,
    exception_port: Port,
    registry: Arc<RegistryIndex>,
    ownership: Arc<Ownership>,
    dispatcher: Arc<Dispatcher>,
    monitor: parking_lot::Mutex<Option<Monitor>>,
}

impl RuntimeExceptionCoordinator {
    /// Creates the exception port and the (not yet running) monitor
    ///
    /// # Errors
    ///
    /// The port set or exception port could not be created
    pub fn new(kernel: Arc<dyn Kernel>, config: Config, ownership: Ownership) -> Result<Self, Error> {
        let port_set = kernel
            .create_port_set()
            .map_err(Error::kernel("create_port_set"))?;
        let exception_port = kernel
            .create_port(port_set)
            .map_err(Error::kernel("create_port"))?;

        log::debug!(
            "created exception port {exception_port} in set {port_set}, mode {:?}",
            config.mode
        );

        let registry = Arc::new(RegistryIndex::new());
        let ownership = Arc::new(ownership);
        let dispatcher = Arc::new(Dispatcher::new(
            kernel.clone(),
            exception_port,
            config.injected(FaultInjection::Decline),
        ));

        let monitor = Monitor::new(
            kernel.clone(),
            port_set,
            exception_port,
            registry.clone(),
            ownership.clone(),
            dispatcher.clone(),
            config,
        );

        Ok(Self {
            kernel,
            config,
            exception_port,
            registry,
            ownership,
            dispatcher,
            monitor: parking_lot::Mutex::new(Some(monitor)),
        })
    }

    /// Creates a coordinator for the current process, configured from the
    /// environment, that owns the image this crate is linked into
    #[cfg(target_os = "macos")]
    pub fn native() -> Result<Self, Error> {
        let config = Config::from_env()?;
        let ownership = Ownership::for_current_image()?;
        Self::new(Arc::new(crate::MachKernel::new()), config, ownership)
    }

    /// Takes the monitor so that it can be driven manually, which can only be
    /// done once, and not after [`Self::spawn_monitor`]
    pub fn take_monitor(&self) -> Result<Monitor, Error> {
        self.monitor.lock().take().ok_or(Error::MonitorAlreadyStarted)
    }

    /// Starts the monitor on a dedicated thread.
    ///
    /// The thread must never be registered for exceptions.
    pub fn spawn_monitor(&self) -> Result<std::thread::JoinHandle<()>, Error> {
        let monitor = self.take_monitor()?;

        let handle = std::thread::Builder::new()
            .name("exception-monitor".to_owned())
            .spawn(move || {
                monitor.run();
            })?;

        log::debug!("started exception monitor thread");
        Ok(handle)
    }

    /// Registers the handler that exceptions in owned code are dispatched
    /// to, there can only be one
    pub fn set_exception_handler(&self, handler: Box<dyn ExceptionEvent>) -> Result<(), Error> {
        self.dispatcher.set_handler(handler)
    }

    /// Registers our exception port on the thread for the exceptions the
    /// configured mode doesn't suppress, remembering the handlers that were
    /// registered before us
    pub fn enable_for_thread(&self, thread: ThreadId) -> Result<(), Error> {
        if self.config.injected(FaultInjection::Install) {
            log::warn!("failing exception port registration for thread {thread}");
            return Err(Error::InjectedFailure("install"));
        }

        let mask = self.config.exception_mask();
        if mask.is_empty() {
            log::debug!("every exception is suppressed, not registering thread {thread}");
            return Ok(());
        }

        self.registry.install(
            &*self.kernel,
            thread,
            self.exception_port,
            mask,
            ExceptionBehavior::DEFAULT.with_64bit_codes(),
            ThreadStateFlavor::GENERAL,
        )
    }

    #[inline]
    pub fn enable_for_current_thread(&self) -> Result<(), Error> {
        self.enable_for_thread(self.kernel.current_thread())
    }

    /// Restores the handlers that were registered on the thread before us
    pub fn disable_for_thread(&self, thread: ThreadId) -> Result<(), Error> {
        self.registry.uninstall(&*self.kernel, thread)
    }

    #[inline]
    pub fn disable_for_current_thread(&self) -> Result<(), Error> {
        self.disable_for_thread(self.kernel.current_thread())
    }

    /// Marks the memory as ours, so that faults in it are dispatched
    #[inline]
    pub fn register_owned_region(&self, start: usize, len: usize, kind: RegionKind) {
        self.ownership.register(start, len, kind);
    }

    #[inline]
    pub fn unregister_owned_region(&self, start: usize) -> Option<OwnedRegion> {
        self.ownership.unregister(start)
    }

    #[inline]
    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    #[inline]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[inline]
    pub fn registry(&self) -> &Arc<RegistryIndex> {
        &self.registry
    }

    #[inline]
    pub fn ownership(&self) -> &Ownership {
        &self.ownership
    }

    #[inline]
    pub fn exception_port(&self) -> Port {
        self.exception_port
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }
}
