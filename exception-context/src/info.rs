/// Number of top level exception types
///
/// This is platform independent, but located the `<arch>/exception.h`
pub const EXC_TYPES_COUNT: usize = 14;

/// A native exception type, as delivered in an exception notification.
///
/// This is kept as an open set rather than an enum as the kernel is free to
/// deliver types we don't know about, which still need to be forwarded
/// untouched.
///
/// `exception_types.h`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ExceptionType(pub i32);

impl ExceptionType {
    /// Could not access memory. (SIGSEGV/SIGBUS)
    ///
    /// Code field contains `kern_return_t` describing error.
    /// Subcode field contains bad memory address.
    pub const BAD_ACCESS: Self = Self(1);
    /// Instruction failed. (SIGILL)
    pub const BAD_INSTRUCTION: Self = Self(2);
    /// Arithmetic exception (SIGFPE)
    ///
    /// Exact nature of the exception is in code field.
    pub const ARITHMETIC: Self = Self(3);
    /// Emulation support instruction encountered
    pub const EMULATION: Self = Self(4);
    /// Software generated exception
    pub const SOFTWARE: Self = Self(5);
    /// Trace, breakpoint, etc
    ///
    /// Details in the code field
    pub const BREAKPOINT: Self = Self(6);
    /// System calls
    pub const SYSCALL: Self = Self(7);
    /// Mach system calls
    pub const MACH_SYSCALL: Self = Self(8);
    /// RPC alert
    pub const RPC_ALERT: Self = Self(9);
    /// Abnormal process exit
    pub const CRASH: Self = Self(10);
    /// Hit resource consumption limit
    pub const RESOURCE: Self = Self(11);
    /// Violated guarded resource protections
    pub const GUARD: Self = Self(12);
    /// Abnormal process exited to corpse state
    pub const CORPSE_NOTIFY: Self = Self(13);

    /// The mask bit for this exception type, empty for types outside the
    /// range that can be expressed in a mask
    #[inline]
    pub fn mask(self) -> ExceptionMask {
        if (0..32).contains(&self.0) {
            ExceptionMask::from_bits_retain(1 << self.0)
        } else {
            ExceptionMask::empty()
        }
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            1 => "EXC_BAD_ACCESS",
            2 => "EXC_BAD_INSTRUCTION",
            3 => "EXC_ARITHMETIC",
            4 => "EXC_EMULATION",
            5 => "EXC_SOFTWARE",
            6 => "EXC_BREAKPOINT",
            7 => "EXC_SYSCALL",
            8 => "EXC_MACH_SYSCALL",
            9 => "EXC_RPC_ALERT",
            10 => "EXC_CRASH",
            11 => "EXC_RESOURCE",
            12 => "EXC_GUARD",
            13 => "EXC_CORPSE_NOTIFY",
            _ => "EXC_UNKNOWN",
        }
    }
}

impl std::fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

bitflags::bitflags! {
    /// A set of [`ExceptionType`]s, one bit per type
    ///
    /// `exception_types.h`
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ExceptionMask: u32 {
        const BAD_ACCESS = 1 << 1;
        const BAD_INSTRUCTION = 1 << 2;
        const ARITHMETIC = 1 << 3;
        const EMULATION = 1 << 4;
        const SOFTWARE = 1 << 5;
        const BREAKPOINT = 1 << 6;
        const SYSCALL = 1 << 7;
        const MACH_SYSCALL = 1 << 8;
        const RPC_ALERT = 1 << 9;
        const CRASH = 1 << 10;
        const RESOURCE = 1 << 11;
        const GUARD = 1 << 12;
        const CORPSE_NOTIFY = 1 << 13;
    }
}

impl ExceptionMask {
    /// Iterates each exception type present in the mask, lowest first
    pub fn types(self) -> impl Iterator<Item = ExceptionType> {
        let bits = self.bits();
        (0..32).filter(move |bit| bits & (1 << bit) != 0).map(ExceptionType)
    }
}

/// The native exception type plus its machine specific codes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct ExceptionInfo {
    /// The exception kind
    pub kind: ExceptionType,
    /// The number of valid entries in `codes`, always 0-2
    pub code_count: u32,
    /// The code and subcode, eg. for `EXC_BAD_ACCESS` the subcode is the
    /// faulting address
    pub codes: [i64; 2],
}

impl ExceptionInfo {
    pub const MAX_CODES: usize = 2;

    /// Creates a new info, `None` if more than [`Self::MAX_CODES`] codes are
    /// supplied
    pub fn new(kind: ExceptionType, codes: &[i64]) -> Option<Self> {
        if codes.len() > Self::MAX_CODES {
            return None;
        }

        let mut info = Self {
            kind,
            code_count: codes.len() as u32,
            codes: [0; 2],
        };
        info.codes[..codes.len()].copy_from_slice(codes);
        Some(info)
    }

    #[inline]
    pub fn codes(&self) -> &[i64] {
        &self.codes[..(self.code_count as usize).min(Self::MAX_CODES)]
    }

    #[inline]
    pub fn code(&self) -> Option<i64> {
        self.codes().first().copied()
    }

    #[inline]
    pub fn subcode(&self) -> Option<i64> {
        self.codes().get(1).copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn masks_round_trip_types() {
        let mask = ExceptionType::BAD_ACCESS.mask() | ExceptionType::BREAKPOINT.mask();
        assert_eq!(mask, ExceptionMask::BAD_ACCESS | ExceptionMask::BREAKPOINT);

        let types: Vec<_> = mask.types().collect();
        assert_eq!(types, [ExceptionType::BAD_ACCESS, ExceptionType::BREAKPOINT]);

        assert!(ExceptionType(-1).mask().is_empty());
    }

    #[test]
    fn rejects_too_many_codes() {
        assert!(ExceptionInfo::new(ExceptionType::ARITHMETIC, &[1, 2, 3]).is_none());

        let info = ExceptionInfo::new(ExceptionType::BAD_ACCESS, &[1, 0x10]).unwrap();
        assert_eq!(info.code(), Some(1));
        assert_eq!(info.subcode(), Some(0x10));

        let info = ExceptionInfo::new(ExceptionType::BAD_INSTRUCTION, &[]).unwrap();
        assert!(info.code().is_none());
    }
}
