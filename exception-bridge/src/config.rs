use crate::Error;
use exception_context::ExceptionMask;

/// Selects which categories of exceptions are *not* hooked
pub const MODE_VAR: &str = "EXCEPTION_BRIDGE_MODE";
/// Forces a failure path for testing, see [`FaultInjection`]
pub const FAULT_INJECTION_VAR: &str = "EXCEPTION_BRIDGE_FAULT_INJECTION";

bitflags::bitflags! {
    /// The categories of exceptions to leave alone
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ExceptionMode: u32 {
        /// Don't hook illegal/emulated instructions
        const SUPPRESS_ILLEGAL = 1;
        /// Don't hook breakpoints and software exceptions, leaving them to
        /// a debugger
        const SUPPRESS_DEBUGGING = 2;
        /// Don't hook access violations and arithmetic faults
        const SUPPRESS_MANAGED = 4;
    }
}

impl ExceptionMode {
    /// The mode used when none is specified
    pub fn default_for(debugger_present: bool) -> Self {
        let mut mode = if cfg!(debug_assertions) {
            Self::SUPPRESS_DEBUGGING
        } else {
            Self::empty()
        };

        if debugger_present {
            mode |= Self::SUPPRESS_DEBUGGING;
        }

        mode
    }
}

/// A failure path that can be forced for testing
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultInjection {
    /// Registering a thread fails
    Install,
    /// Every exception is declined, as if the handler returned
    /// [`crate::EventResult::NotHandled`]
    Decline,
    /// Every access violation is treated as a stack overflow
    StackOverflow,
}

impl std::str::FromStr for FaultInjection {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "install" => Self::Install,
            "decline" => Self::Decline,
            "stack-overflow" => Self::StackOverflow,
            _ => return Err(()),
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub mode: ExceptionMode,
    pub fault_injection: Option<FaultInjection>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ExceptionMode::default_for(false),
            fault_injection: None,
        }
    }
}

impl Config {
    /// Reads the configuration from the environment
    pub fn from_env() -> Result<Self, Error> {
        let mode = std::env::var(MODE_VAR).ok();
        let injection = std::env::var(FAULT_INJECTION_VAR).ok();

        let debugger_present = if mode.is_none() {
            debugger_present()?
        } else {
            false
        };

        Self::from_vars(mode.as_deref(), injection.as_deref(), debugger_present)
    }

    /// Builds the configuration from the raw values of the environment
    /// variables
    pub fn from_vars(
        mode: Option<&str>,
        injection: Option<&str>,
        debugger_present: bool,
    ) -> Result<Self, Error> {
        let mode = match mode {
            Some(value) => value
                .trim()
                .parse::<u32>()
                .ok()
                .and_then(ExceptionMode::from_bits)
                .ok_or_else(|| Error::InvalidConfig {
                    name: MODE_VAR,
                    value: value.to_owned(),
                })?,
            None => ExceptionMode::default_for(debugger_present),
        };

        let fault_injection = injection
            .map(|value| {
                value.parse().map_err(|()| Error::InvalidConfig {
                    name: FAULT_INJECTION_VAR,
                    value: value.to_owned(),
                })
            })
            .transpose()?;

        Ok(Self {
            mode,
            fault_injection,
        })
    }

    /// The exceptions to register our exception port for
    pub fn exception_mask(&self) -> ExceptionMask {
        let mut mask = ExceptionMask::BAD_ACCESS
            | ExceptionMask::BAD_INSTRUCTION
            | ExceptionMask::ARITHMETIC
            | ExceptionMask::EMULATION
            | ExceptionMask::SOFTWARE
            | ExceptionMask::BREAKPOINT;

        if self.mode.contains(ExceptionMode::SUPPRESS_ILLEGAL) {
            mask -= ExceptionMask::BAD_INSTRUCTION | ExceptionMask::EMULATION;
        }

        if self.mode.contains(ExceptionMode::SUPPRESS_DEBUGGING) {
            mask -= ExceptionMask::BREAKPOINT | ExceptionMask::SOFTWARE;
        }

        if self.mode.contains(ExceptionMode::SUPPRESS_MANAGED) {
            mask -= ExceptionMask::BAD_ACCESS | ExceptionMask::ARITHMETIC;
        }

        mask
    }

    #[inline]
    pub(crate) fn injected(&self, fi: FaultInjection) -> bool {
        self.fault_injection == Some(fi)
    }
}

/// Checks if a debugger is attached to this process
pub fn debugger_present() -> Result<bool, Error> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "macos")] {
            // SAFETY: syscall, kinfo_proc is POD
            unsafe {
                let mut info: libc::kinfo_proc = std::mem::zeroed();
                let mut size = std::mem::size_of::<libc::kinfo_proc>();
                let mut mib = [
                    libc::CTL_KERN,
                    libc::KERN_PROC,
                    libc::KERN_PROC_PID,
                    libc::getpid(),
                ];

                if libc::sysctl(
                    mib.as_mut_ptr(),
                    mib.len() as _,
                    (&mut info as *mut libc::kinfo_proc).cast(),
                    &mut size,
                    std::ptr::null_mut(),
                    0,
                ) != 0
                {
                    return Err(std::io::Error::last_os_error().into());
                }

                // Debugged by a parent process, `sys/proc.h`
                const P_TRACED: i32 = 0x0000_0800;

                Ok(info.kp_proc.p_flag & P_TRACED != 0)
            }
        } else if #[cfg(any(target_os = "linux", target_os = "android"))] {
            let status = std::fs::read_to_string("/proc/self/status")?;
            Ok(status
                .lines()
                .find_map(|line| line.strip_prefix("TracerPid:"))
                .is_some_and(|pid| pid.trim() != "0"))
        } else {
            Ok(false)
        }
    }
}
