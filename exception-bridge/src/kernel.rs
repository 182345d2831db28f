//! The seam between the exception protocol and the kernel that delivers the
//! exceptions.

use crate::{message::Message, registry::ChainBackEntry, registry::HandlerSet};
use exception_context::{ExceptionMask, RawState, ThreadStateFlavor};

/// A kernel port name, `mach_port_t`
pub type Port = u32;
/// A thread, identified by the name of its kernel port
pub type ThreadId = Port;

pub const PORT_NULL: Port = 0;

/// `kern_return.h`
pub const KERN_SUCCESS: i32 = 0;
/// `kern_return.h`
pub const KERN_FAILURE: i32 = 5;

/// A failed kernel call, carrying the native return code
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("kernel call failed with {0} ({0:#x})")]
pub struct KernelError(pub i32);

impl KernelError {
    /// Specified address is not currently valid
    pub const INVALID_ADDRESS: Self = Self(1);
    /// The address range specified is already in use, or no address range of
    /// the size specified could be found
    pub const NO_SPACE: Self = Self(3);
    pub const INVALID_ARGUMENT: Self = Self(4);
    pub const FAILURE: Self = Self(KERN_FAILURE);
    /// The name doesn't denote a right in the task
    pub const INVALID_NAME: Self = Self(15);
    /// Target task isn't an active task
    pub const INVALID_TASK: Self = Self(16);
}

/// Converts a `kern_return_t` into a `Result`
#[inline]
pub fn kern_ret(func: impl FnOnce() -> i32) -> Result<(), KernelError> {
    let res = func();

    if res == KERN_SUCCESS {
        Ok(())
    } else {
        Err(KernelError(res))
    }
}

/// The way in which an exception is raised to a handler port
///
/// `exception_types.h`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ExceptionBehavior(pub i32);

impl ExceptionBehavior {
    /// Send a `catch_exception_raise` message including the identity.
    pub const DEFAULT: Self = Self(1);
    /// Send a `catch_exception_raise_state` message including the thread state.
    pub const STATE: Self = Self(2);
    /// Send a `catch_exception_raise_state_identity` message including the
    /// thread identity and state.
    pub const STATE_IDENTITY: Self = Self(3);
    /// Send 64-bit code and subcode in the exception header.
    pub const MACH_EXCEPTION_CODES: i32 = 0x8000_0000_u32 as i32;

    /// The behavior without any flags
    #[inline]
    pub fn base(self) -> Self {
        Self(self.0 & !Self::MACH_EXCEPTION_CODES)
    }

    /// True if the codes are sent as 64-bit values
    #[inline]
    pub fn has_64bit_codes(self) -> bool {
        self.0 & Self::MACH_EXCEPTION_CODES != 0
    }

    #[inline]
    pub fn with_64bit_codes(self) -> Self {
        Self(self.0 | Self::MACH_EXCEPTION_CODES)
    }

    /// True if messages with this behavior embed the thread and task
    #[inline]
    pub fn carries_identity(self) -> bool {
        matches!(self.base(), Self::DEFAULT | Self::STATE_IDENTITY)
    }

    /// True if messages with this behavior embed a thread state
    #[inline]
    pub fn carries_state(self) -> bool {
        matches!(self.base(), Self::STATE | Self::STATE_IDENTITY)
    }
}

/// A virtual memory region, `[start, end)`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: usize,
    pub end: usize,
}

impl MemoryRegion {
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Everything the exception protocol needs from the kernel.
///
/// Methods that are used on the monitor thread or on a hijacked thread must
/// not allocate or take locks that a faulting thread could be holding.
pub trait Kernel: Send + Sync {
    /// Creates a port set that a single receive can wait on
    fn create_port_set(&self) -> Result<Port, KernelError>;
    /// Creates a port with a receive and a send right, and adds it to the
    /// specified port set if it isn't [`PORT_NULL`]
    fn create_port(&self, set: Port) -> Result<Port, KernelError>;
    /// Destroys all of our rights to the port, implicitly removing it from
    /// any port set
    fn destroy_port(&self, port: Port) -> Result<(), KernelError>;
    /// Releases one reference to a send right received in a message
    fn release_port(&self, port: Port);
    /// True if the port is not null and is not a dead name, ie. messages
    /// can still be sent to it
    fn is_port_alive(&self, port: Port) -> bool;

    /// Blocks until a message is received on the port (or port set)
    fn receive(&self, port: Port, msg: &mut Message) -> Result<(), KernelError>;
    /// Sends the message to its remote port
    fn send(&self, msg: &Message) -> Result<(), KernelError>;

    /// The port for this process
    fn current_task(&self) -> Port;
    /// The calling thread
    fn current_thread(&self) -> ThreadId;
    /// Invokes the callback for each live thread in the process
    fn for_each_thread(&self, f: &mut dyn FnMut(ThreadId)) -> Result<(), KernelError>;
    /// True if the thread still exists
    fn is_thread_alive(&self, thread: ThreadId) -> bool {
        let mut alive = false;
        let _res = self.for_each_thread(&mut |tid| alive |= tid == thread);
        alive
    }
    fn suspend_thread(&self, thread: ThreadId) -> Result<(), KernelError>;
    fn resume_thread(&self, thread: ThreadId) -> Result<(), KernelError>;
    /// Retrieves the thread state of the specified flavor
    fn get_thread_state(
        &self,
        thread: ThreadId,
        flavor: ThreadStateFlavor,
        state: &mut RawState,
    ) -> Result<(), KernelError>;
    /// Sets the thread state of the flavor the state describes
    fn set_thread_state(&self, thread: ThreadId, state: &RawState) -> Result<(), KernelError>;

    /// Registers the port for the exceptions in the mask on the thread,
    /// returning the previously registered handlers
    fn swap_exception_ports(
        &self,
        thread: ThreadId,
        mask: ExceptionMask,
        port: Port,
        behavior: ExceptionBehavior,
        flavor: ThreadStateFlavor,
        previous: &mut HandlerSet,
    ) -> Result<(), KernelError>;
    /// Registers the handler in the entry for the exceptions in its mask
    fn set_exception_ports(&self, thread: ThreadId, entry: &ChainBackEntry)
        -> Result<(), KernelError>;

    /// The size of a virtual memory page
    fn page_size(&self) -> usize;
    /// Finds the region containing the address or, if the address isn't
    /// mapped, the first region above it, with the same semantics as
    /// `vm_region`
    fn region_at(&self, addr: usize) -> Option<MemoryRegion>;
    /// Reads a single pointer sized value, failing with
    /// [`KernelError::INVALID_ADDRESS`] if the address is not readable
    fn read_word(&self, addr: usize) -> Result<usize, KernelError>;

    /// Aborts the process after writing the message to stderr.
    ///
    /// This is the only way the monitor thread and hijacked threads report
    /// unrecoverable conditions, so it must not allocate or lock.
    fn fatal(&self, msg: &'static str) -> ! {
        crate::write_stderr(msg);
        crate::write_stderr("\n");
        // SAFETY: syscall
        unsafe { libc::abort() }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn behaviors() {
        let b = ExceptionBehavior::STATE_IDENTITY.with_64bit_codes();
        assert!(b.has_64bit_codes());
        assert_eq!(b.base(), ExceptionBehavior::STATE_IDENTITY);
        assert!(b.carries_identity() && b.carries_state());

        assert!(!ExceptionBehavior::STATE.carries_identity());
        assert!(!ExceptionBehavior::DEFAULT.carries_state());
        assert!(ExceptionBehavior::DEFAULT.carries_identity());
    }

    #[test]
    fn kern_ret_maps_codes() {
        assert!(kern_ret(|| KERN_SUCCESS).is_ok());
        assert_eq!(kern_ret(|| 1), Err(KernelError::INVALID_ADDRESS));
    }
}
