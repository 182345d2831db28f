//! Builds the synthetic frame a hijacked thread resumes into.
//!
//! This is the only place that knows how a stack is laid out, everything
//! else treats a [`ThreadState`] as an opaque value.

use crate::capture::CapturedException;
use exception_context::{ExceptionRecord, ThreadState};
use std::mem::size_of;

/// The area below the stack pointer that leaf functions may use without
/// adjusting the stack pointer, which we must not clobber
pub const RED_ZONE: usize = 128;

/// The data embedded on the faulting thread's stack, the dispatch routine
/// receives pointers to each field
#[repr(C, align(16))]
pub struct HijackFrame {
    /// The context handed to the exception handler
    pub context: ThreadState,
    /// The portable exception
    pub record: ExceptionRecord,
    /// The exception exactly as it was captured, used to replay it if the
    /// handler declines it
    pub exception: CapturedException,
}

/// Where the hijacked thread is sent
#[derive(Copy, Clone, Debug)]
pub struct Trampoline {
    /// The routine the thread resumes in, called with pointers to the
    /// context, the record, the captured exception, and `argument`
    pub entry: usize,
    /// The return address of `entry`, which must never be reached
    pub return_marker: usize,
    /// Passed through to `entry` untouched
    pub argument: usize,
}

#[inline]
unsafe fn push(sp: &mut usize, value: usize) {
    *sp -= size_of::<usize>();
    std::ptr::write_unaligned(*sp as *mut usize, value);
}

/// Writes a [`HijackFrame`] and a fabricated caller frame onto the stack of
/// the thread described by `exception`, returning the state that resumes
/// the thread in [`Trampoline::entry`].
///
/// The fabricated frame makes the faulting instruction look like the caller
/// of the dispatch routine, so that unwinders can walk through it. Its
/// return address is one past the faulting pc, since unwinders subtract one
/// from return addresses to find the call site.
///
/// # Safety
///
/// The stack of the thread must be mapped and writable in the current
/// process for at least [`RED_ZONE`] plus the size of the frame below its
/// stack pointer, and the thread must be suspended.
pub unsafe fn build_trampoline_frame(
    exception: &CapturedException,
    context: &ThreadState,
    record: &ExceptionRecord,
    trampoline: &Trampoline,
) -> ThreadState {
    let original = &exception.state;
    let mut sp = (original.sp() - RED_ZONE) & !15;

    // The fabricated caller frame, laid out the same way as the frame
    // record each function pushes in its prologue
    push(&mut sp, original.pc() + 1);
    push(&mut sp, original.fp());
    let frame_pointer = sp;

    let frame_addr = (sp - size_of::<HijackFrame>()) & !15;
    let frame = frame_addr as *mut HijackFrame;
    std::ptr::write(
        frame,
        HijackFrame {
            context: *context,
            record: *record,
            exception: *exception,
        },
    );
    sp = frame_addr;

    let mut state = *original;

    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            // Looks like `entry` was just called, the return address is on
            // the stack and rsp is misaligned by it
            push(&mut sp, trampoline.return_marker);
        } else if #[cfg(target_arch = "aarch64")] {
            state.general.set_lr(trampoline.return_marker);
        }
    }

    state.set_sp(sp);
    state.set_fp(frame_pointer);
    state.set_pc(trampoline.entry);

    state.general.set_argument(0, std::ptr::addr_of!((*frame).context) as usize);
    state.general.set_argument(1, std::ptr::addr_of!((*frame).record) as usize);
    state.general.set_argument(2, std::ptr::addr_of!((*frame).exception) as usize);
    state.general.set_argument(3, trampoline.argument);

    // The dispatch routine must not trap after its first instruction
    state.clear_single_step();

    state
}
