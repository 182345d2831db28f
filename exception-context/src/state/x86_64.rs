use super::{Registers, ThreadState, ThreadStateFlavor};

pub(crate) mod flavors {
    pub const GENERAL: i32 = 4;
    pub const FLOAT: i32 = 5;
    pub const EXCEPTION: i32 = 6;
    pub const DEBUG: i32 = 11;
    pub const NONE: i32 = 13;
}

/// The trap flag in `rflags`
const TRAP_FLAG: u64 = 0x100;

/// `x86_thread_state64_t`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub fs: u64,
    pub gs: u64,
}

impl GeneralRegisters {
    #[inline]
    pub fn pc(&self) -> usize {
        self.rip as usize
    }

    #[inline]
    pub fn set_pc(&mut self, pc: usize) {
        self.rip = pc as u64;
    }

    #[inline]
    pub fn sp(&self) -> usize {
        self.rsp as usize
    }

    #[inline]
    pub fn set_sp(&mut self, sp: usize) {
        self.rsp = sp as u64;
    }

    #[inline]
    pub fn fp(&self) -> usize {
        self.rbp as usize
    }

    #[inline]
    pub fn set_fp(&mut self, fp: usize) {
        self.rbp = fp as u64;
    }

    /// Sets one of the first 4 integer arguments of the System V calling
    /// convention
    pub fn set_argument(&mut self, index: usize, value: usize) {
        let value = value as u64;
        match index {
            0 => self.rdi = value,
            1 => self.rsi = value,
            2 => self.rdx = value,
            3 => self.rcx = value,
            _ => unreachable!("only 4 register arguments are used"),
        }
    }

    pub fn argument(&self, index: usize) -> usize {
        (match index {
            0 => self.rdi,
            1 => self.rsi,
            2 => self.rdx,
            3 => self.rcx,
            _ => unreachable!("only 4 register arguments are used"),
        }) as usize
    }
}

unsafe impl Registers for GeneralRegisters {
    const FLAVOR: ThreadStateFlavor = ThreadStateFlavor::GENERAL;
    const COUNT: u32 = 42;
}

/// `x86_float_state64_t`, the layout of the individual fields doesn't matter
/// to us, it is only ever captured and restored as a whole
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct FloatRegisters {
    pub words: [u32; 131],
}

impl FloatRegisters {
    /// The `mxcsr` control/status register
    #[inline]
    pub fn mxcsr(&self) -> u32 {
        // 2 reserved ints, fcw/fsw, ftw/rsrv/fop, ip, cs/rsrv, dp, ds/rsrv
        self.words[10]
    }
}

impl Default for FloatRegisters {
    fn default() -> Self {
        Self { words: [0; 131] }
    }
}

impl std::fmt::Debug for FloatRegisters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FloatRegisters")
            .field("mxcsr", &format_args!("{:#x}", self.mxcsr()))
            .finish_non_exhaustive()
    }
}

unsafe impl Registers for FloatRegisters {
    const FLAVOR: ThreadStateFlavor = ThreadStateFlavor::FLOAT;
    const COUNT: u32 = 131;
}

/// `x86_debug_state64_t`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DebugRegisters {
    pub dr: [u64; 8],
}

unsafe impl Registers for DebugRegisters {
    const FLAVOR: ThreadStateFlavor = ThreadStateFlavor::DEBUG;
    const COUNT: u32 = 16;
}

#[inline]
pub(crate) fn single_step(ts: &ThreadState) -> bool {
    ts.general.rflags & TRAP_FLAG != 0
}

#[inline]
pub(crate) fn set_single_step(ts: &mut ThreadState) {
    ts.general.rflags |= TRAP_FLAG;
}

#[inline]
pub(crate) fn clear_single_step(ts: &mut ThreadState) {
    ts.general.rflags &= !TRAP_FLAG;
}
