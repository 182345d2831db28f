use crate::{
    native::{NativeHandle, NativeLibraries},
    Error,
};
use parking_lot::ReentrantMutex;
use std::{
    cell::RefCell,
    ffi::{c_char, c_void, CString},
    sync::Arc,
};

/// The reference count of records that are never unloaded
const PERMANENT: i32 = -1;

/// The name of the optional lifecycle entry point a module can export
pub const ENTRY_SYMBOL: &str = "module_entry";
/// The name of the optional registration callback a module can export
pub const REGISTER_SYMBOL: &str = "module_register";

/// The suffix of dynamic libraries on this platform, appended to bare names
pub const LIBRARY_SUFFIX: &str = std::env::consts::DLL_SUFFIX;

/// Why a module's entry point is being invoked
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AttachReason {
    ProcessDetach = 0,
    ProcessAttach = 1,
    ThreadAttach = 2,
    ThreadDetach = 3,
}

/// The lifecycle entry point, returning zero on failure
pub type ModuleEntry =
    unsafe extern "C" fn(instance: *mut c_void, reason: u32, reserved: *mut c_void) -> i32;
/// The registration callback, receives the name the module was loaded by and
/// returns the instance handed to the entry point, null on failure
pub type ModuleRegister = unsafe extern "C" fn(name: *const c_char) -> *mut c_void;

/// The optional callbacks of a module, resolved once when it is first loaded
#[derive(Copy, Clone, Default)]
struct ModuleCallbacks {
    entry: Option<ModuleEntry>,
    register: Option<ModuleRegister>,
}

impl ModuleCallbacks {
    fn resolve(native: &dyn NativeLibraries, handle: NativeHandle) -> Self {
        // SAFETY: a module exporting these symbols promises they have these
        // signatures
        unsafe {
            Self {
                entry: native
                    .symbol(handle, ENTRY_SYMBOL)
                    .map(|addr| std::mem::transmute::<usize, ModuleEntry>(addr)),
                register: native
                    .symbol(handle, REGISTER_SYMBOL)
                    .map(|addr| std::mem::transmute::<usize, ModuleRegister>(addr)),
            }
        }
    }
}

/// A handle to a module loaded through a [`ModuleRegistry`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleHandle(u32);

struct ModuleRecord {
    handle: ModuleHandle,
    native: NativeHandle,
    name: String,
    ref_count: i32,
    callbacks: ModuleCallbacks,
    /// Passed to the entry point, the native handle unless the registration
    /// callback supplied one
    instance: usize,
    thread_notifications: bool,
}

impl ModuleRecord {
    #[inline]
    fn is_permanent(&self) -> bool {
        self.ref_count == PERMANENT
    }

    /// The entry point and its instance if the module wants thread
    /// notifications
    #[inline]
    fn thread_entry(&self) -> Option<(ModuleEntry, usize)> {
        self.thread_notifications
            .then_some(self.callbacks.entry)
            .flatten()
            .map(|entry| (entry, self.instance))
    }
}

#[derive(Default)]
struct Modules {
    /// In load order
    records: Vec<ModuleRecord>,
    next_handle: u32,
}

impl Modules {
    fn insert(
        &mut self,
        native: NativeHandle,
        name: String,
        ref_count: i32,
        callbacks: ModuleCallbacks,
    ) -> ModuleHandle {
        self.next_handle += 1;
        let handle = ModuleHandle(self.next_handle);

        self.records.push(ModuleRecord {
            handle,
            native,
            name,
            ref_count,
            callbacks,
            instance: native.0,
            thread_notifications: true,
        });

        handle
    }

    #[inline]
    fn get(&self, handle: ModuleHandle) -> Result<&ModuleRecord, Error> {
        self.records
            .iter()
            .find(|rec| rec.handle == handle)
            .ok_or(Error::InvalidHandle)
    }

    #[inline]
    fn get_mut(&mut self, handle: ModuleHandle) -> Result<&mut ModuleRecord, Error> {
        self.records
            .iter_mut()
            .find(|rec| rec.handle == handle)
            .ok_or(Error::InvalidHandle)
    }

    fn remove(&mut self, handle: ModuleHandle) -> Option<ModuleRecord> {
        let index = self.records.iter().position(|rec| rec.handle == handle)?;
        Some(self.records.remove(index))
    }
}

/// The registry of every module loaded into the process.
///
/// Every entry point holds a single re-entrant lock for its duration, module
/// callbacks are invoked while it is held but without any outstanding borrow
/// of the module list, so they can load, release, and query modules
/// themselves.
pub struct ModuleRegistry {
    native: Arc<dyn NativeLibraries>,
    modules: ReentrantMutex<RefCell<Modules>>,
}

impl ModuleRegistry {
    /// Creates the registry, with permanent records for the executable and
    /// the image containing this crate
    pub fn new(native: Arc<dyn NativeLibraries>) -> Self {
        let mut modules = Modules::default();

        if let Some((handle, path)) = native.executable() {
            log::debug!("registering executable '{path}'");
            modules.insert(handle, path, PERMANENT, ModuleCallbacks::default());
        }

        if let Some((handle, path)) = native.own_image() {
            if modules.records.iter().any(|rec| rec.native == handle) {
                native.close(handle);
            } else {
                log::debug!("registering own image '{path}'");
                modules.insert(handle, path, PERMANENT, ModuleCallbacks::default());
            }
        }

        Self {
            native,
            modules: ReentrantMutex::new(RefCell::new(modules)),
        }
    }

    /// Creates a registry using the platform's dynamic loader
    #[cfg(unix)]
    pub fn native() -> Self {
        Self::new(Arc::new(crate::native::Dl))
    }

    /// Opens the library, retrying bare names with the platform suffix
    fn open(&self, name: &str) -> Result<(NativeHandle, String), Error> {
        let err = match self.native.open(name) {
            Ok(handle) => return Ok((handle, name.to_owned())),
            Err(err) => err,
        };

        if !name.contains(std::path::MAIN_SEPARATOR) && !name.ends_with(LIBRARY_SUFFIX) {
            let suffixed = format!("{name}{LIBRARY_SUFFIX}");
            if let Ok(handle) = self.native.open(&suffixed) {
                return Ok((handle, suffixed));
            }
        }

        Err(Error::NotFound {
            name: name.to_owned(),
            reason: err,
        })
    }

    /// Loads the module, or adds a reference to it if it is already loaded.
    ///
    /// The first load of a module runs its registration callback and then
    /// its entry point with [`AttachReason::ProcessAttach`], if either fails
    /// the module is unloaded again.
    pub fn load(&self, name: &str) -> Result<ModuleHandle, Error> {
        if name.is_empty() || name.contains('\0') {
            return Err(Error::InvalidName);
        }

        let modules = self.modules.lock();
        let (native, path) = self.open(name)?;

        let existing = modules
            .borrow_mut()
            .records
            .iter_mut()
            .find(|rec| rec.native == native)
            .map(|rec| {
                if !rec.is_permanent() {
                    rec.ref_count += 1;
                }
                rec.handle
            });

        if let Some(handle) = existing {
            // The record already holds a native reference
            self.native.close(native);
            log::debug!("'{name}' is already loaded");
            return Ok(handle);
        }

        let callbacks = ModuleCallbacks::resolve(&*self.native, native);
        let handle = modules.borrow_mut().insert(native, path, 1, callbacks);

        if let Some(register) = callbacks.register {
            let cname = CString::new(name).map_err(|_err| Error::InvalidName)?;

            // SAFETY: resolved from the module's exports
            let instance = unsafe { register(cname.as_ptr()) };
            if instance.is_null() {
                self.discard(handle);
                return Err(Error::InitFailed {
                    name: name.to_owned(),
                    callback: REGISTER_SYMBOL,
                });
            }

            if let Ok(rec) = modules.borrow_mut().get_mut(handle) {
                rec.instance = instance as usize;
            }
        }

        if let Some(entry) = callbacks.entry {
            let instance = modules.borrow().get(handle)?.instance;

            // SAFETY: resolved from the module's exports
            let ok = unsafe {
                entry(
                    instance as *mut c_void,
                    AttachReason::ProcessAttach as u32,
                    std::ptr::null_mut(),
                )
            };

            if ok == 0 {
                self.discard(handle);
                return Err(Error::InitFailed {
                    name: name.to_owned(),
                    callback: ENTRY_SYMBOL,
                });
            }
        }

        log::debug!("loaded '{name}'");
        Ok(handle)
    }

    /// Removes a module that failed to initialize, without running its
    /// detach callback
    fn discard(&self, handle: ModuleHandle) {
        let modules = self.modules.lock();
        let removed = modules.borrow_mut().remove(handle);

        if let Some(rec) = removed {
            log::warn!("unloading '{}' after it failed to initialize", rec.name);
            self.native.close(rec.native);
        }
    }

    /// Finds the address of an exported symbol of the module
    pub fn get_symbol(&self, handle: ModuleHandle, name: &str) -> Result<usize, Error> {
        let modules = self.modules.lock();
        let modules = modules.borrow();
        let rec = modules.get(handle)?;

        self.native
            .symbol(rec.native, name)
            .ok_or_else(|| Error::SymbolNotFound {
                module: rec.name.clone(),
                symbol: name.to_owned(),
            })
    }

    /// The name the module was loaded with
    pub fn get_path(&self, handle: ModuleHandle) -> Result<String, Error> {
        let modules = self.modules.lock();
        let path = modules.borrow().get(handle)?.name.clone();
        Ok(path)
    }

    /// Drops a reference to the module, unloading it when the last one is
    /// released. Permanent modules are never unloaded.
    pub fn release(&self, handle: ModuleHandle) -> Result<(), Error> {
        let modules = self.modules.lock();

        let detach = {
            let mut records = modules.borrow_mut();
            let rec = records.get_mut(handle)?;

            if rec.is_permanent() {
                return Ok(());
            }

            rec.ref_count -= 1;
            if rec.ref_count > 0 {
                return Ok(());
            }

            rec.callbacks.entry.map(|entry| (entry, rec.instance))
        };

        if let Some((entry, instance)) = detach {
            // SAFETY: resolved from the module's exports, the return value is
            // meaningless on detach
            unsafe {
                entry(
                    instance as *mut c_void,
                    AttachReason::ProcessDetach as u32,
                    std::ptr::null_mut(),
                );
            }
        }

        let removed = modules.borrow_mut().remove(handle);
        if let Some(rec) = removed {
            self.native.close(rec.native);
            log::debug!("unloaded '{}'", rec.name);
        }

        Ok(())
    }

    /// Stops the module's entry point from being invoked when threads start
    /// and exit
    pub fn disable_thread_notifications(&self, handle: ModuleHandle) -> Result<(), Error> {
        let modules = self.modules.lock();
        modules.borrow_mut().get_mut(handle)?.thread_notifications = false;
        Ok(())
    }

    /// Invokes the entry point of every module that wants it with
    /// [`AttachReason::ThreadAttach`], in load order
    #[inline]
    pub fn notify_thread_attach(&self) {
        self.notify_threads(AttachReason::ThreadAttach);
    }

    /// Invokes the entry point of every module that wants it with
    /// [`AttachReason::ThreadDetach`], in load order
    #[inline]
    pub fn notify_thread_detach(&self) {
        self.notify_threads(AttachReason::ThreadDetach);
    }

    fn notify_threads(&self, reason: AttachReason) {
        let modules = self.modules.lock();
        let entries: Vec<_> = modules
            .borrow()
            .records
            .iter()
            .filter_map(ModuleRecord::thread_entry)
            .collect();

        for (entry, instance) in entries {
            // SAFETY: resolved from the module's exports, the return value is
            // meaningless for thread notifications
            unsafe {
                entry(instance as *mut c_void, reason as u32, std::ptr::null_mut());
            }
        }
    }

    /// The current reference count of the module, `-1` for permanent ones
    pub fn reference_count(&self, handle: ModuleHandle) -> Result<i32, Error> {
        let modules = self.modules.lock();
        let count = modules.borrow().get(handle)?.ref_count;
        Ok(count)
    }

    /// Every loaded module, in load order
    pub fn handles(&self) -> Vec<ModuleHandle> {
        let modules = self.modules.lock();
        let handles = modules.borrow().records.iter().map(|rec| rec.handle).collect();
        handles
    }
}
