use super::{Registers, ThreadState, ThreadStateFlavor};

pub(crate) mod flavors {
    pub const NONE: i32 = 5;
    pub const GENERAL: i32 = 6;
    pub const EXCEPTION: i32 = 7;
    pub const DEBUG: i32 = 15;
    pub const FLOAT: i32 = 17;
}

/// The software step bit in `MDSCR_EL1`
const MDSCR_SS: u64 = 1;

/// `arm_thread_state64_t`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GeneralRegisters {
    pub x: [u64; 29],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub pc: u64,
    pub cpsr: u32,
    pub flags: u32,
}

impl GeneralRegisters {
    #[inline]
    pub fn pc(&self) -> usize {
        self.pc as usize
    }

    #[inline]
    pub fn set_pc(&mut self, pc: usize) {
        self.pc = pc as u64;
    }

    #[inline]
    pub fn sp(&self) -> usize {
        self.sp as usize
    }

    #[inline]
    pub fn set_sp(&mut self, sp: usize) {
        self.sp = sp as u64;
    }

    #[inline]
    pub fn fp(&self) -> usize {
        self.fp as usize
    }

    #[inline]
    pub fn set_fp(&mut self, fp: usize) {
        self.fp = fp as u64;
    }

    #[inline]
    pub fn lr(&self) -> usize {
        self.lr as usize
    }

    #[inline]
    pub fn set_lr(&mut self, lr: usize) {
        self.lr = lr as u64;
    }

    /// Sets one of the integer argument registers, `x0-x7`
    #[inline]
    pub fn set_argument(&mut self, index: usize, value: usize) {
        assert!(index < 8, "only 8 register arguments exist");
        self.x[index] = value as u64;
    }

    #[inline]
    pub fn argument(&self, index: usize) -> usize {
        assert!(index < 8, "only 8 register arguments exist");
        self.x[index] as usize
    }
}

unsafe impl Registers for GeneralRegisters {
    const FLAVOR: ThreadStateFlavor = ThreadStateFlavor::GENERAL;
    const COUNT: u32 = 68;
}

/// `arm_neon_state64_t`, 32 128-bit vector registers followed by `fpsr` and
/// `fpcr`, padded out to 16 byte alignment
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct FloatRegisters {
    pub words: [u32; 132],
}

impl FloatRegisters {
    #[inline]
    pub fn fpsr(&self) -> u32 {
        self.words[128]
    }

    #[inline]
    pub fn fpcr(&self) -> u32 {
        self.words[129]
    }
}

impl Default for FloatRegisters {
    fn default() -> Self {
        Self { words: [0; 132] }
    }
}

impl std::fmt::Debug for FloatRegisters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FloatRegisters")
            .field("fpsr", &format_args!("{:#x}", self.fpsr()))
            .field("fpcr", &format_args!("{:#x}", self.fpcr()))
            .finish_non_exhaustive()
    }
}

unsafe impl Registers for FloatRegisters {
    const FLAVOR: ThreadStateFlavor = ThreadStateFlavor::FLOAT;
    const COUNT: u32 = 132;
}

/// `arm_debug_state64_t`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct DebugRegisters {
    pub bvr: [u64; 16],
    pub bcr: [u64; 16],
    pub wvr: [u64; 16],
    pub wcr: [u64; 16],
    pub mdscr_el1: u64,
}

impl Default for DebugRegisters {
    fn default() -> Self {
        Self {
            bvr: [0; 16],
            bcr: [0; 16],
            wvr: [0; 16],
            wcr: [0; 16],
            mdscr_el1: 0,
        }
    }
}

unsafe impl Registers for DebugRegisters {
    const FLAVOR: ThreadStateFlavor = ThreadStateFlavor::DEBUG;
    const COUNT: u32 = 130;
}

#[inline]
pub(crate) fn single_step(ts: &ThreadState) -> bool {
    ts.debug.mdscr_el1 & MDSCR_SS != 0
}

#[inline]
pub(crate) fn set_single_step(ts: &mut ThreadState) {
    ts.debug.mdscr_el1 |= MDSCR_SS;
}

#[inline]
pub(crate) fn clear_single_step(ts: &mut ThreadState) {
    ts.debug.mdscr_el1 &= !MDSCR_SS;
}
