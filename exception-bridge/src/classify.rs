//! Translation of native exceptions into portable exception records, and the
//! stack overflow heuristic.

use crate::kernel::{Kernel, KernelError};
use exception_context::{ExceptionCode, ExceptionInfo, ExceptionRecord, ExceptionType, ThreadState};

/// The exception had a number of codes it should never have
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BadCodeCount(pub usize);

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// `i386/exception.h`
        mod codes {
            pub const EXC_I386_DIV: i64 = 1;
            pub const EXC_I386_INTO: i64 = 2;
            pub const EXC_I386_EXTOVR: i64 = 4;
            pub const EXC_I386_EXTERR: i64 = 5;
            pub const EXC_I386_BOUND: i64 = 7;
            pub const EXC_I386_SSEEXTERR: i64 = 8;

            pub const EXC_I386_SGL: i64 = 1;
            pub const EXC_I386_BPT: i64 = 2;

            // x87 and SSE status word exception bits, reported in the subcode
            // of EXC_I386_EXTERR and EXC_I386_SSEEXTERR
            pub const FPU_IE: i64 = 0x01;
            pub const FPU_DE: i64 = 0x02;
            pub const FPU_ZE: i64 = 0x04;
            pub const FPU_OE: i64 = 0x08;
            pub const FPU_UE: i64 = 0x10;
            pub const FPU_PE: i64 = 0x20;
        }

        fn arithmetic(info: &ExceptionInfo) -> ExceptionCode {
            use codes::*;

            match info.code().unwrap_or_default() {
                EXC_I386_DIV => ExceptionCode::IntDivideByZero,
                EXC_I386_INTO => ExceptionCode::IntOverflow,
                EXC_I386_EXTOVR => ExceptionCode::FltOverflow,
                EXC_I386_BOUND => ExceptionCode::ArrayBoundsExceeded,
                EXC_I386_EXTERR | EXC_I386_SSEEXTERR => {
                    let status = info.subcode().unwrap_or_default();

                    if status & FPU_IE != 0 {
                        ExceptionCode::FltInvalidOperation
                    } else if status & FPU_DE != 0 {
                        ExceptionCode::FltDenormalOperand
                    } else if status & FPU_ZE != 0 {
                        ExceptionCode::FltDivideByZero
                    } else if status & FPU_OE != 0 {
                        ExceptionCode::FltOverflow
                    } else if status & FPU_UE != 0 {
                        ExceptionCode::FltUnderflow
                    } else if status & FPU_PE != 0 {
                        ExceptionCode::FltInexactResult
                    } else {
                        ExceptionCode::IllegalInstruction
                    }
                }
                _ => ExceptionCode::IllegalInstruction,
            }
        }

        fn breakpoint(info: &ExceptionInfo, _state: &ThreadState) -> ExceptionCode {
            match info.code().unwrap_or_default() {
                codes::EXC_I386_SGL => ExceptionCode::SingleStep,
                codes::EXC_I386_BPT => ExceptionCode::Breakpoint,
                _ => ExceptionCode::Breakpoint,
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// `arm/exception.h`
        mod codes {
            pub const EXC_ARM_FP_IO: i64 = 1;
            pub const EXC_ARM_FP_DZ: i64 = 2;
            pub const EXC_ARM_FP_OF: i64 = 3;
            pub const EXC_ARM_FP_UF: i64 = 4;
            pub const EXC_ARM_FP_IX: i64 = 5;
            pub const EXC_ARM_FP_ID: i64 = 6;
        }

        fn arithmetic(info: &ExceptionInfo) -> ExceptionCode {
            use codes::*;

            // Integer division doesn't trap on arm64
            match info.code().unwrap_or_default() {
                EXC_ARM_FP_IO => ExceptionCode::FltInvalidOperation,
                EXC_ARM_FP_DZ => ExceptionCode::FltDivideByZero,
                EXC_ARM_FP_OF => ExceptionCode::FltOverflow,
                EXC_ARM_FP_UF => ExceptionCode::FltUnderflow,
                EXC_ARM_FP_IX => ExceptionCode::FltInexactResult,
                EXC_ARM_FP_ID => ExceptionCode::FltDenormalOperand,
                _ => ExceptionCode::IllegalInstruction,
            }
        }

        fn breakpoint(_info: &ExceptionInfo, state: &ThreadState) -> ExceptionCode {
            // Hardware single step and brk share the same exception code, the
            // debug state tells them apart
            if state.single_step() {
                ExceptionCode::SingleStep
            } else {
                ExceptionCode::Breakpoint
            }
        }
    }
}

/// Builds the portable exception record for a native exception.
///
/// Every exception maps to one of the [`ExceptionCode`]s, anything we don't
/// recognize is an illegal instruction. The only error is an exception with
/// codes it can't have, eg. an access violation without the faulting address.
pub fn build_exception_record(
    info: &ExceptionInfo,
    state: &ThreadState,
) -> Result<ExceptionRecord, BadCodeCount> {
    let code_count = info.codes().len();
    if !(1..=ExceptionInfo::MAX_CODES).contains(&code_count) {
        return Err(BadCodeCount(code_count));
    }

    let code = match info.kind {
        ExceptionType::BAD_ACCESS => {
            let Some(address) = info.subcode() else {
                return Err(BadCodeCount(code_count));
            };

            let mut record = ExceptionRecord::new(ExceptionCode::AccessViolation);
            record.address = state.pc();
            record.parameter_count = 2;
            // Read/write is not reported, always read
            record.parameters = [0, address as usize];
            return Ok(record);
        }
        ExceptionType::ARITHMETIC => arithmetic(info),
        ExceptionType::BREAKPOINT => breakpoint(info, state),
        ExceptionType::BAD_INSTRUCTION
        | ExceptionType::SOFTWARE
        | ExceptionType::SYSCALL
        | ExceptionType::MACH_SYSCALL => ExceptionCode::IllegalInstruction,
        _ => ExceptionCode::IllegalInstruction,
    };

    let mut record = ExceptionRecord::new(code);
    record.address = state.pc();
    Ok(record)
}

/// The furthest away from the stack pointer a fault can be and still be
/// considered a stack overflow, the default size of a thread stack
const MAX_OVERFLOW_DISTANCE: usize = 512 * 1024;

/// Determines if an access violation at `fault` on a thread whose stack
/// pointer is `sp` was caused by overflowing the thread's stack.
///
/// This assumes the thread's stack is a single region with a guard page
/// immediately below it, which is true for every thread on Macos.
///
/// 1. The fault is in the same page as the stack pointer, or the page right
///    below it.
/// 2. The fault is below, and reasonably close to, the stack pointer and the
///    page after the fault starts the region that contains the stack
///    pointer, so there is no other guard page in between.
/// 3. The word right below the stack pointer can't be read.
pub fn is_stack_overflow(kernel: &dyn Kernel, sp: usize, fault: usize) -> bool {
    let page_size = kernel.page_size();
    let page_mask = !(page_size - 1);

    let fault_page = fault & page_mask;
    let sp_page = sp & page_mask;

    if fault_page == sp_page || Some(fault_page) == sp_page.checked_sub(page_size) {
        return true;
    }

    if fault_page < sp_page && sp_page - fault_page < MAX_OVERFLOW_DISTANCE {
        let next_page = fault_page + page_size;

        // If the page after the fault isn't the start of a region it is not
        // the guard page of anything
        if kernel
            .region_at(next_page)
            .is_some_and(|region| region.start == next_page && sp_page < region.end)
        {
            return true;
        }
    }

    let word = std::mem::size_of::<usize>();
    sp.checked_sub(word)
        .map_or(true, |below| kernel.read_word(below) == Err(KernelError::INVALID_ADDRESS))
}
