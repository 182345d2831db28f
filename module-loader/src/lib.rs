//! [`ModuleRegistry`] keeps track of the dynamic libraries loaded into the
//! process through it, so that loading the same library twice yields the same
//! [`ModuleHandle`] and the library is only unloaded once every load has been
//! released.
//!
//! # Lifecycle callbacks
//!
//! A module can export two optional callbacks, resolved once when the module
//! is first loaded.
//!
//! - `module_register`, a [`ModuleRegister`], is called first with the name
//!   the module was loaded by, and returns the instance value passed to the
//!   entry point.
//! - `module_entry`, a [`ModuleEntry`], is called with
//!   [`AttachReason::ProcessAttach`] after registration, with
//!   [`AttachReason::ProcessDetach`] when the module is unloaded, and with the
//!   thread reasons whenever the host reports a thread starting or exiting,
//!   unless the module opted out with
//!   [`ModuleRegistry::disable_thread_notifications`].
//!
//! If either callback fails during the load, the module is unloaded and the
//! load fails.
//!
//! # Permanent modules
//!
//! The executable and the image containing this crate are registered when
//! the registry is created and are never unloaded, their reference count is
//! always `-1`.

mod error;
mod native;
mod registry;

pub use error::Error;
pub use native::{NativeHandle, NativeLibraries};
pub use registry::{
    AttachReason, ModuleEntry, ModuleHandle, ModuleRegister, ModuleRegistry,
    ENTRY_SYMBOL, LIBRARY_SUFFIX, REGISTER_SYMBOL,
};

#[cfg(unix)]
pub use native::Dl;
