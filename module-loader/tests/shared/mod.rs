#![allow(dead_code)]

pub use module_loader as ml;

use ml::{AttachReason, ModuleHandle, ModuleRegistry, NativeHandle, NativeLibraries};
use parking_lot::Mutex;
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    ffi::{c_char, c_void, CStr},
    sync::Arc,
};

pub const EXE: NativeHandle = NativeHandle(0x10);
pub const EXE_PATH: &str = "/bin/host";
pub const OWN: NativeHandle = NativeHandle(0x20);
pub const OWN_PATH: &str = "/lib/libruntime.so";

pub struct FakeLibrary {
    pub name: String,
    pub handle: NativeHandle,
    pub symbols: Vec<(&'static str, usize)>,
}

/// A [`NativeLibraries`] serving a fixed set of libraries
pub struct FakeLibraries {
    libs: Vec<FakeLibrary>,
    opened: Mutex<HashMap<NativeHandle, i32>>,
    attempts: Mutex<Vec<String>>,
}

impl FakeLibraries {
    pub fn new() -> Self {
        Self {
            libs: vec![
                FakeLibrary {
                    name: EXE_PATH.to_owned(),
                    handle: EXE,
                    symbols: Vec::new(),
                },
                FakeLibrary {
                    name: OWN_PATH.to_owned(),
                    handle: OWN,
                    symbols: Vec::new(),
                },
            ],
            opened: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Adds a library that can be opened by the name
    pub fn with(mut self, name: impl Into<String>, symbols: &[(&'static str, usize)]) -> Self {
        let handle = NativeHandle(0x1000 * (self.libs.len() + 1));
        self.libs.push(FakeLibrary {
            name: name.into(),
            handle,
            symbols: symbols.to_vec(),
        });
        self
    }

    pub fn handle_of(&self, name: &str) -> NativeHandle {
        self.libs.iter().find(|lib| lib.name == name).unwrap().handle
    }

    /// The number of outstanding opens of the library
    pub fn open_count(&self, name: &str) -> i32 {
        let handle = self.handle_of(name);
        self.opened.lock().get(&handle).copied().unwrap_or_default()
    }

    /// Every name an open was attempted with
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    pub fn into_registry(self) -> (Arc<Self>, ModuleRegistry) {
        let libs = Arc::new(self);
        let registry = ModuleRegistry::new(libs.clone());
        (libs, registry)
    }
}

impl NativeLibraries for FakeLibraries {
    fn open(&self, name: &str) -> Result<NativeHandle, String> {
        self.attempts.lock().push(name.to_owned());

        let lib = self
            .libs
            .iter()
            .find(|lib| lib.name == name)
            .ok_or_else(|| format!("{name}: cannot open shared object file"))?;

        *self.opened.lock().entry(lib.handle).or_default() += 1;
        Ok(lib.handle)
    }

    fn close(&self, handle: NativeHandle) {
        let mut opened = self.opened.lock();
        let count = opened.entry(handle).or_default();
        assert!(*count > 0, "closed {handle:?} more times than it was opened");
        *count -= 1;
    }

    fn symbol(&self, handle: NativeHandle, name: &str) -> Option<usize> {
        self.libs
            .iter()
            .find(|lib| lib.handle == handle)?
            .symbols
            .iter()
            .find(|(sym, _)| *sym == name)
            .map(|(_, addr)| *addr)
    }

    fn executable(&self) -> Option<(NativeHandle, String)> {
        Some((EXE, EXE_PATH.to_owned()))
    }

    fn own_image(&self) -> Option<(NativeHandle, String)> {
        Some((OWN, OWN_PATH.to_owned()))
    }
}

thread_local! {
    /// Every entry point invocation on this thread, `(instance, reason)`
    static EVENTS: RefCell<Vec<(usize, u32)>> = RefCell::new(Vec::new());
    /// Every registration on this thread
    static REGISTERED: RefCell<Vec<String>> = RefCell::new(Vec::new());
    /// The registry a module's callbacks re-enter
    static REGISTRY: Cell<*const ModuleRegistry> = Cell::new(std::ptr::null());
    /// The dependency loaded by [`entry_loads_dependency`]
    static DEPENDENCY: Cell<Option<ModuleHandle>> = Cell::new(None);
}

pub const INSTANCE: usize = 0xabc0;
pub const DEPENDENCY_NAME: &str = "libdep";

pub fn events() -> Vec<(usize, u32)> {
    EVENTS.with(|ev| ev.borrow().clone())
}

pub fn registered() -> Vec<String> {
    REGISTERED.with(|reg| reg.borrow().clone())
}

pub fn dependency() -> Option<ModuleHandle> {
    DEPENDENCY.with(Cell::get)
}

/// Lets [`entry_loads_dependency`] use the registry, which must outlive any
/// use of it
pub fn set_registry(registry: &ModuleRegistry) {
    REGISTRY.with(|reg| reg.set(registry));
}

fn record(instance: *mut c_void, reason: u32) {
    EVENTS.with(|ev| ev.borrow_mut().push((instance as usize, reason)));
}

pub unsafe extern "C" fn entry_ok(instance: *mut c_void, reason: u32, _reserved: *mut c_void) -> i32 {
    record(instance, reason);
    1
}

pub unsafe extern "C" fn entry_fails(
    instance: *mut c_void,
    reason: u32,
    _reserved: *mut c_void,
) -> i32 {
    record(instance, reason);
    0
}

pub unsafe extern "C" fn register_ok(name: *const c_char) -> *mut c_void {
    let name = CStr::from_ptr(name).to_string_lossy().into_owned();
    REGISTERED.with(|reg| reg.borrow_mut().push(name));
    INSTANCE as *mut c_void
}

pub unsafe extern "C" fn register_fails(_name: *const c_char) -> *mut c_void {
    std::ptr::null_mut()
}

/// Loads [`DEPENDENCY_NAME`] when attached and releases it when detached
pub unsafe extern "C" fn entry_loads_dependency(
    instance: *mut c_void,
    reason: u32,
    _reserved: *mut c_void,
) -> i32 {
    record(instance, reason);

    let registry = REGISTRY.with(Cell::get);
    if registry.is_null() {
        return 0;
    }
    let registry = &*registry;

    if reason == AttachReason::ProcessAttach as u32 {
        match registry.load(DEPENDENCY_NAME) {
            Ok(handle) => {
                DEPENDENCY.with(|dep| dep.set(Some(handle)));
                1
            }
            Err(_err) => 0,
        }
    } else {
        if reason == AttachReason::ProcessDetach as u32 {
            if let Some(handle) = DEPENDENCY.with(Cell::take) {
                let _res = registry.release(handle);
            }
        }
        1
    }
}

#[inline]
pub fn entry_symbol(entry: ml::ModuleEntry) -> (&'static str, usize) {
    (ml::ENTRY_SYMBOL, entry as usize)
}

#[inline]
pub fn register_symbol(register: ml::ModuleRegister) -> (&'static str, usize) {
    (ml::REGISTER_SYMBOL, register as usize)
}
