//! Register state snapshots.
//!
//! [`RawState`] is the native, flavor tagged buffer that the kernel hands out
//! and accepts, [`ThreadState`] is the full general + float + debug snapshot
//! built from three of them. Everything outside of the frame builder treats a
//! [`ThreadState`] as an opaque value and only uses the accessors here.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else {
        compile_error!("the exception bridge only supports x86_64 and aarch64");
    }
}

/// The flavor of a thread state, ie which register set it describes
///
/// `thread_status.h`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ThreadStateFlavor(pub i32);

impl ThreadStateFlavor {
    /// The general purpose registers
    pub const GENERAL: Self = Self(flavors::GENERAL);
    /// The floating point/vector registers
    pub const FLOAT: Self = Self(flavors::FLOAT);
    /// The debug registers
    pub const DEBUG: Self = Self(flavors::DEBUG);
    /// The exception state, fault address etc
    pub const EXCEPTION: Self = Self(flavors::EXCEPTION);
    /// No state at all
    pub const NONE: Self = Self(flavors::NONE);
}

/// The largest thread state the kernel will ever hand out, in `u32` words
///
/// `thread_status.h`
pub const THREAD_STATE_MAX: usize = 1296;

/// A register set that can be stored in a [`RawState`]
///
/// # Safety
///
/// The implementor must be plain old data exactly `COUNT * 4` bytes in size,
/// with the layout the kernel uses for `FLAVOR`.
pub unsafe trait Registers: Copy {
    const FLAVOR: ThreadStateFlavor;
    const COUNT: u32;
}

/// A native thread state of a particular flavor
#[derive(Copy, Clone)]
#[repr(C)]
pub struct RawState {
    pub flavor: ThreadStateFlavor,
    /// The number of valid `u32` words in `words`
    pub count: u32,
    pub words: [u32; THREAD_STATE_MAX],
}

impl RawState {
    #[inline]
    pub fn empty(flavor: ThreadStateFlavor) -> Self {
        Self {
            flavor,
            count: 0,
            words: [0; THREAD_STATE_MAX],
        }
    }

    /// Copies the words into a new state, `None` if there are too many of them
    pub fn from_words(flavor: ThreadStateFlavor, words: &[u32]) -> Option<Self> {
        if words.len() > THREAD_STATE_MAX {
            return None;
        }

        let mut rs = Self::empty(flavor);
        rs.words[..words.len()].copy_from_slice(words);
        rs.count = words.len() as u32;
        Some(rs)
    }

    #[inline]
    pub fn as_words(&self) -> &[u32] {
        &self.words[..(self.count as usize).min(THREAD_STATE_MAX)]
    }

    pub fn from_registers<R: Registers>(regs: &R) -> Self {
        let mut rs = Self::empty(R::FLAVOR);
        // SAFETY: Registers guarantees R is POD of COUNT words, which always
        // fits in THREAD_STATE_MAX
        unsafe {
            std::ptr::copy_nonoverlapping(
                (regs as *const R).cast::<u8>(),
                rs.words.as_mut_ptr().cast::<u8>(),
                std::mem::size_of::<R>(),
            );
        }
        rs.count = R::COUNT;
        rs
    }

    /// Reinterprets the state as the specified register set, `None` if the
    /// flavor doesn't match or the kernel gave us less state than expected
    pub fn to_registers<R: Registers>(&self) -> Option<R> {
        if self.flavor != R::FLAVOR || self.count < R::COUNT {
            return None;
        }

        // SAFETY: Registers guarantees R is POD, and we've checked there are
        // enough valid words
        unsafe { Some(std::ptr::read_unaligned(self.words.as_ptr().cast::<R>())) }
    }
}

impl PartialEq for RawState {
    fn eq(&self, o: &Self) -> bool {
        self.flavor == o.flavor && self.as_words() == o.as_words()
    }
}

impl std::fmt::Debug for RawState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawState")
            .field("flavor", &self.flavor)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

/// A full snapshot of a thread's registers
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(C)]
pub struct ThreadState {
    pub general: GeneralRegisters,
    pub float: FloatRegisters,
    pub debug: DebugRegisters,
}

impl ThreadState {
    /// The flavors that make up a full snapshot, in the order they are
    /// captured and applied
    pub const FLAVORS: [ThreadStateFlavor; 3] = [
        ThreadStateFlavor::GENERAL,
        ThreadStateFlavor::FLOAT,
        ThreadStateFlavor::DEBUG,
    ];

    #[inline]
    pub fn zeroed() -> Self {
        // SAFETY: all of the register sets are POD for which all zeroes is valid
        unsafe { std::mem::zeroed() }
    }

    /// Gets the native state for one of [`Self::FLAVORS`]
    pub fn raw(&self, flavor: ThreadStateFlavor) -> Option<RawState> {
        match flavor {
            ThreadStateFlavor::GENERAL => Some(RawState::from_registers(&self.general)),
            ThreadStateFlavor::FLOAT => Some(RawState::from_registers(&self.float)),
            ThreadStateFlavor::DEBUG => Some(RawState::from_registers(&self.debug)),
            _ => None,
        }
    }

    /// Overwrites the register set the native state describes, returning
    /// false if it isn't one of [`Self::FLAVORS`] or is truncated
    pub fn set_raw(&mut self, rs: &RawState) -> bool {
        match rs.flavor {
            ThreadStateFlavor::GENERAL => rs.to_registers().map(|r| self.general = r).is_some(),
            ThreadStateFlavor::FLOAT => rs.to_registers().map(|r| self.float = r).is_some(),
            ThreadStateFlavor::DEBUG => rs.to_registers().map(|r| self.debug = r).is_some(),
            _ => false,
        }
    }

    #[inline]
    pub fn pc(&self) -> usize {
        self.general.pc()
    }

    #[inline]
    pub fn set_pc(&mut self, pc: usize) {
        self.general.set_pc(pc);
    }

    #[inline]
    pub fn sp(&self) -> usize {
        self.general.sp()
    }

    #[inline]
    pub fn set_sp(&mut self, sp: usize) {
        self.general.set_sp(sp);
    }

    #[inline]
    pub fn fp(&self) -> usize {
        self.general.fp()
    }

    #[inline]
    pub fn set_fp(&mut self, fp: usize) {
        self.general.set_fp(fp);
    }

    /// True if the thread is single stepping, ie. will trap after the next
    /// instruction
    #[inline]
    pub fn single_step(&self) -> bool {
        single_step(self)
    }

    #[inline]
    pub fn set_single_step(&mut self) {
        set_single_step(self);
    }

    #[inline]
    pub fn clear_single_step(&mut self) {
        clear_single_step(self);
    }
}
