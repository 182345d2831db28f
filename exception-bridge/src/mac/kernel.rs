use super::{ffi::*, wire};
use crate::{
    kernel::{kern_ret, ExceptionBehavior, Kernel, KernelError, MemoryRegion, Port, ThreadId},
    message::Message,
    registry::{ChainBackEntry, HandlerSet},
};
use exception_context::{
    ExceptionMask, RawState, ThreadStateFlavor, EXC_TYPES_COUNT, THREAD_STATE_MAX,
};

/// The [`Kernel`] backed by Mach ports in the current task
pub struct MachKernel {
    task: mach_port_t,
    page_size: usize,
}

impl Default for MachKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl MachKernel {
    pub fn new() -> Self {
        // SAFETY: syscalls
        let (task, page_size) = unsafe { (mach_task_self(), libc::sysconf(libc::_SC_PAGESIZE)) };

        Self {
            task,
            page_size: if page_size > 0 {
                page_size as usize
            } else {
                4096
            },
        }
    }
}

impl Kernel for MachKernel {
    fn create_port_set(&self) -> Result<Port, KernelError> {
        let mut set = MACH_PORT_NULL;
        // SAFETY: syscall
        kern_ret(|| unsafe { mp::mach_port_allocate(self.task, MACH_PORT_RIGHT_PORT_SET, &mut set) })?;
        Ok(set)
    }

    fn create_port(&self, set: Port) -> Result<Port, KernelError> {
        let mut port = MACH_PORT_NULL;

        // SAFETY: syscalls
        unsafe {
            // Create a receive right so that we can actually receive messages on the port
            kern_ret(|| mp::mach_port_allocate(self.task, MACH_PORT_RIGHT_RECEIVE, &mut port))?;

            // Add send right so that the port can be registered as an
            // exception port and messages can be sent to it
            if let Err(err) = kern_ret(|| {
                mp::mach_port_insert_right(self.task, port, port, MACH_MSG_TYPE_MAKE_SEND)
            }) {
                mach_port_destroy(self.task, port);
                return Err(err);
            }

            if set != MACH_PORT_NULL {
                if let Err(err) = kern_ret(|| mach_port_move_member(self.task, port, set)) {
                    mach_port_destroy(self.task, port);
                    return Err(err);
                }
            }
        }

        Ok(port)
    }

    fn destroy_port(&self, port: Port) -> Result<(), KernelError> {
        // SAFETY: syscall
        kern_ret(|| unsafe { mach_port_destroy(self.task, port) })
    }

    fn release_port(&self, port: Port) {
        // SAFETY: syscall
        unsafe {
            mp::mach_port_deallocate(self.task, port);
        }
    }

    fn is_port_alive(&self, port: Port) -> bool {
        if port == MACH_PORT_NULL {
            return false;
        }

        let mut ptype = 0;
        // SAFETY: syscall
        let res = kern_ret(|| unsafe { mach_port_type(self.task, port, &mut ptype) });
        res.is_ok() && ptype & MACH_PORT_TYPE_DEAD_NAME == 0
    }

    fn receive(&self, port: Port, message: &mut Message) -> Result<(), KernelError> {
        let mut buf = wire::WireBuffer::new();

        // SAFETY: syscall, the buffer is large enough for any message of the
        // protocol and the kernel fails the receive for anything larger
        kern_ret(|| unsafe {
            msg::mach_msg(
                buf.header(),
                msg::MACH_RCV_MSG,
                0,
                wire::WIRE_SIZE as u32,
                port,
                msg::MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        })?;

        *message = wire::decode(&buf);
        Ok(())
    }

    fn send(&self, message: &Message) -> Result<(), KernelError> {
        let mut buf = wire::WireBuffer::new();
        let size = wire::encode(message, &mut buf).ok_or(KernelError::INVALID_ARGUMENT)?;

        // SAFETY: syscall
        kern_ret(|| unsafe {
            msg::mach_msg(
                buf.header(),
                msg::MACH_SEND_MSG,
                size,
                0,
                MACH_PORT_NULL,
                msg::MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        })
    }

    fn current_task(&self) -> Port {
        self.task
    }

    fn current_thread(&self) -> ThreadId {
        // Unlike mach_thread_self this doesn't add a reference to the port
        // SAFETY: syscall
        unsafe { libc::pthread_mach_thread_np(libc::pthread_self()) }
    }

    fn for_each_thread(&self, f: &mut dyn FnMut(ThreadId)) -> Result<(), KernelError> {
        let mut threads = std::ptr::null_mut();
        let mut count = 0;

        // SAFETY: syscalls, the kernel allocates the array which we free
        unsafe {
            kern_ret(|| task::task_threads(self.task, &mut threads, &mut count))?;

            let list = std::slice::from_raw_parts(threads, count as usize);
            for thread in list {
                f(*thread);
            }

            for thread in list {
                mp::mach_port_deallocate(self.task, *thread);
            }

            vm::mach_vm_deallocate(
                self.task,
                threads as u64,
                (count as usize * std::mem::size_of::<mach_port_t>()) as u64,
            );
        }

        Ok(())
    }

    fn suspend_thread(&self, thread: ThreadId) -> Result<(), KernelError> {
        // SAFETY: syscall
        kern_ret(|| unsafe { ta::thread_suspend(thread) })
    }

    fn resume_thread(&self, thread: ThreadId) -> Result<(), KernelError> {
        // SAFETY: syscall
        kern_ret(|| unsafe { ta::thread_resume(thread) })
    }

    fn get_thread_state(
        &self,
        thread: ThreadId,
        flavor: ThreadStateFlavor,
        state: &mut RawState,
    ) -> Result<(), KernelError> {
        let mut count = THREAD_STATE_MAX as u32;

        // SAFETY: syscall, the buffer is THREAD_STATE_MAX words
        kern_ret(|| unsafe {
            ta::thread_get_state(thread, flavor.0, state.words.as_mut_ptr(), &mut count)
        })?;

        state.flavor = flavor;
        state.count = count;
        Ok(())
    }

    fn set_thread_state(&self, thread: ThreadId, state: &RawState) -> Result<(), KernelError> {
        let words = state.as_words();

        // SAFETY: syscall, the kernel only reads the state
        kern_ret(|| unsafe {
            ta::thread_set_state(
                thread,
                state.flavor.0,
                words.as_ptr().cast_mut(),
                words.len() as u32,
            )
        })
    }

    fn swap_exception_ports(
        &self,
        thread: ThreadId,
        mask: ExceptionMask,
        port: Port,
        behavior: ExceptionBehavior,
        flavor: ThreadStateFlavor,
        previous: &mut HandlerSet,
    ) -> Result<(), KernelError> {
        let mut masks = [0u32; EXC_TYPES_COUNT];
        let mut handlers = [MACH_PORT_NULL; EXC_TYPES_COUNT];
        let mut behaviors = [0i32; EXC_TYPES_COUNT];
        let mut flavors = [0i32; EXC_TYPES_COUNT];
        let mut count = EXC_TYPES_COUNT as u32;

        // SAFETY: syscall, each array holds EXC_TYPES_COUNT entries
        kern_ret(|| unsafe {
            thread_swap_exception_ports(
                thread,
                mask.bits(),
                port,
                behavior.0,
                flavor.0,
                masks.as_mut_ptr(),
                &mut count,
                handlers.as_mut_ptr(),
                behaviors.as_mut_ptr(),
                flavors.as_mut_ptr(),
            )
        })?;

        previous.clear();
        for i in 0..(count as usize).min(EXC_TYPES_COUNT) {
            previous.push(ChainBackEntry {
                mask: ExceptionMask::from_bits_retain(masks[i]),
                handler: handlers[i],
                behavior: ExceptionBehavior(behaviors[i]),
                flavor: ThreadStateFlavor(flavors[i]),
            });
        }

        Ok(())
    }

    fn set_exception_ports(
        &self,
        thread: ThreadId,
        entry: &ChainBackEntry,
    ) -> Result<(), KernelError> {
        // SAFETY: syscall
        kern_ret(|| unsafe {
            thread_set_exception_ports(
                thread,
                entry.mask.bits(),
                entry.handler,
                entry.behavior.0,
                entry.flavor.0,
            )
        })
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn region_at(&self, addr: usize) -> Option<MemoryRegion> {
        let mut address = addr as u64;
        let mut size = 0;
        let mut info = [0i32; VM_REGION_BASIC_INFO_COUNT_64 as usize];
        let mut info_count = VM_REGION_BASIC_INFO_COUNT_64;
        let mut object_name = MACH_PORT_NULL;

        // SAFETY: syscall
        kern_ret(|| unsafe {
            mach_vm_region(
                self.task,
                &mut address,
                &mut size,
                VM_REGION_BASIC_INFO_64,
                info.as_mut_ptr(),
                &mut info_count,
                &mut object_name,
            )
        })
        .ok()?;

        Some(MemoryRegion {
            start: address as usize,
            end: (address + size) as usize,
        })
    }

    fn read_word(&self, addr: usize) -> Result<usize, KernelError> {
        let mut word = 0usize;
        let mut read = 0;

        // SAFETY: syscall, the kernel validates the source address
        let res = kern_ret(|| unsafe {
            mach_vm_read_overwrite(
                self.task,
                addr as u64,
                std::mem::size_of::<usize>() as u64,
                &mut word as *mut usize as u64,
                &mut read,
            )
        });

        match res {
            Ok(()) => Ok(word),
            // Guard pages are mapped, but can't be read
            Err(KernelError(KERN_PROTECTION_FAILURE)) => Err(KernelError::INVALID_ADDRESS),
            Err(err) => Err(err),
        }
    }
}
