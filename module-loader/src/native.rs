/// An opaque handle to a library opened by the platform loader
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub usize);

/// The platform's dynamic library loader.
///
/// Opening a library that is already open must return the same handle, and
/// every successful [`Self::open`] is balanced by exactly one [`Self::close`].
pub trait NativeLibraries: Send + Sync {
    /// Opens the library, returning the loader's error message on failure
    fn open(&self, name: &str) -> Result<NativeHandle, String>;
    /// Drops one reference to the library
    fn close(&self, handle: NativeHandle);
    /// Finds the address of an exported symbol
    fn symbol(&self, handle: NativeHandle, name: &str) -> Option<usize>;
    /// The handle and path of the executable hosting the process
    fn executable(&self) -> Option<(NativeHandle, String)>;
    /// The handle and path of the image this crate is linked into, which
    /// may be the executable
    fn own_image(&self) -> Option<(NativeHandle, String)>;
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::ffi::{c_void, CStr, CString};

        /// [`NativeLibraries`] implemented with `dlopen`
        pub struct Dl;

        impl Dl {
            fn error() -> String {
                // SAFETY: syscall, the returned string is valid until the next
                // dl call on this thread and we copy it immediately
                unsafe {
                    let err = libc::dlerror();
                    if err.is_null() {
                        "unknown error".to_owned()
                    } else {
                        CStr::from_ptr(err).to_string_lossy().into_owned()
                    }
                }
            }
        }

        impl NativeLibraries for Dl {
            fn open(&self, name: &str) -> Result<NativeHandle, String> {
                let name = CString::new(name).map_err(|_err| "name contains a nul".to_owned())?;

                // SAFETY: syscall
                let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_LAZY) };
                if handle.is_null() {
                    Err(Self::error())
                } else {
                    Ok(NativeHandle(handle as usize))
                }
            }

            fn close(&self, handle: NativeHandle) {
                // SAFETY: syscall, the handle came from dlopen
                if unsafe { libc::dlclose(handle.0 as *mut c_void) } != 0 {
                    log::warn!("failed to close library: {}", Self::error());
                }
            }

            fn symbol(&self, handle: NativeHandle, name: &str) -> Option<usize> {
                let name = CString::new(name).ok()?;

                // SAFETY: syscall, the handle came from dlopen
                let addr = unsafe { libc::dlsym(handle.0 as *mut c_void, name.as_ptr()) };
                (!addr.is_null()).then_some(addr as usize)
            }

            fn executable(&self) -> Option<(NativeHandle, String)> {
                // SAFETY: syscall, a null name opens the executable itself
                let handle = unsafe { libc::dlopen(std::ptr::null(), libc::RTLD_LAZY) };
                if handle.is_null() {
                    return None;
                }

                let path = std::env::current_exe()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Some((NativeHandle(handle as usize), path))
            }

            fn own_image(&self) -> Option<(NativeHandle, String)> {
                // SAFETY: syscalls, dladdr fills the info for any address in a
                // loaded image, and RTLD_NOLOAD only gets an already open handle
                unsafe {
                    let mut info: libc::Dl_info = std::mem::zeroed();
                    let marker = Self::error as *const c_void;
                    if libc::dladdr(marker, &mut info) == 0 || info.dli_fname.is_null() {
                        return None;
                    }

                    let handle = libc::dlopen(info.dli_fname, libc::RTLD_LAZY | libc::RTLD_NOLOAD);
                    if handle.is_null() {
                        // The main executable isn't always findable by path
                        return None;
                    }

                    let path = CStr::from_ptr(info.dli_fname).to_string_lossy().into_owned();
                    Some((NativeHandle(handle as usize), path))
                }
            }
        }
    }
}
