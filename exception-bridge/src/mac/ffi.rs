//! Bindings that `mach2` doesn't provide, or provides with types that are
//! awkward to use from the portable side.
//!
//! All the bindings here are lifted from headers in usr/include/mach, each one
//! notes the specific header it can be located in

pub use mach2::{
    kern_return::{kern_return_t, KERN_SUCCESS},
    mach_port as mp, message as msg,
    port::{mach_port_t, MACH_PORT_NULL, MACH_PORT_RIGHT_PORT_SET, MACH_PORT_RIGHT_RECEIVE},
    task, thread_act as ta,
    traps::mach_task_self,
    vm,
};

/// `message.h`
pub const MACH_MSG_TYPE_MOVE_SEND_ONCE: u32 = 18;
pub const MACH_MSG_TYPE_COPY_SEND: u32 = 19;
pub const MACH_MSG_TYPE_MAKE_SEND: u32 = 20;
pub const MACH_MSG_TYPE_MAKE_SEND_ONCE: u32 = 21;
pub const MACH_MSGH_BITS_COMPLEX: u32 = 0x8000_0000;
pub const MACH_MSG_PORT_DESCRIPTOR: u8 = 0;

/// `MACH_MSGH_BITS(remote, local)`
#[inline]
pub const fn msgh_bits(remote: u32, local: u32) -> u32 {
    remote | (local << 8)
}

/// `port.h`
pub const MACH_PORT_TYPE_DEAD_NAME: u32 = 0x0010_0000;

/// `kern_return.h`
pub const KERN_PROTECTION_FAILURE: kern_return_t = 2;

/// `vm_region.h`
pub const VM_REGION_BASIC_INFO_64: i32 = 9;
pub const VM_REGION_BASIC_INFO_COUNT_64: u32 = 9;

/// The id of a notification sent when a send-once right is destroyed without
/// being used
///
/// `notify.h`
pub const MACH_NOTIFY_SEND_ONCE: i32 = 0o100 + 7;

/// Network Data Representation Record
///
/// ndr.h
#[repr(C)]
#[derive(Copy, Clone)]
pub struct NDR_record_t {
    pub mig_vers: u8,
    pub if_vers: u8,
    pub reserved1: u8,
    pub mig_encoding: u8,
    pub int_rep: u8,
    pub char_rep: u8,
    pub float_rep: u8,
    pub reserved2: u8,
}

extern "C" {
    /// Swaps the exception ports of a single thread, returning the
    /// previously registered ports as 4 parallel arrays
    ///
    /// thread_act.h
    pub fn thread_swap_exception_ports(
        thread: mach_port_t,
        exception_mask: u32,
        new_port: mach_port_t,
        behavior: i32,
        new_flavor: i32,
        masks: *mut u32,
        masks_count: *mut u32,
        old_handlers: *mut mach_port_t,
        old_behaviors: *mut i32,
        old_flavors: *mut i32,
    ) -> kern_return_t;

    /// Sets the exception port of a single thread for the exceptions in the mask
    ///
    /// thread_act.h
    pub fn thread_set_exception_ports(
        thread: mach_port_t,
        exception_mask: u32,
        new_port: mach_port_t,
        behavior: i32,
        new_flavor: i32,
    ) -> kern_return_t;

    /// mach_port.h
    pub fn mach_port_type(
        task: mach_port_t,
        name: mach_port_t,
        ptype: *mut u32,
    ) -> kern_return_t;

    /// Moves a receive right into a port set, or out of one if `after` is null
    ///
    /// mach_port.h
    pub fn mach_port_move_member(
        task: mach_port_t,
        member: mach_port_t,
        after: mach_port_t,
    ) -> kern_return_t;

    /// mach_port.h
    pub fn mach_port_destroy(task: mach_port_t, name: mach_port_t) -> kern_return_t;

    /// mach_vm.h
    pub fn mach_vm_region(
        target_task: mach_port_t,
        address: *mut u64,
        size: *mut u64,
        flavor: i32,
        info: *mut i32,
        info_count: *mut u32,
        object_name: *mut mach_port_t,
    ) -> kern_return_t;

    /// Reads memory without faulting, even if it isn't mapped
    ///
    /// mach_vm.h
    pub fn mach_vm_read_overwrite(
        target_task: mach_port_t,
        address: u64,
        size: u64,
        data: u64,
        out_size: *mut u64,
    ) -> kern_return_t;

    /// <arch>/ndr_def.h
    pub static NDR_record: NDR_record_t;
}
