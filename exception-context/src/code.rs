/// The portable exception codes a native fault is translated into.
///
/// The values are the ones used by structured exception handling so that
/// consumers written against that model can use them directly.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExceptionCode {
    AccessViolation = 0xc000_0005,
    IllegalInstruction = 0xc000_001d,
    IntDivideByZero = 0xc000_0094,
    IntOverflow = 0xc000_0095,
    FltDenormalOperand = 0xc000_008d,
    FltDivideByZero = 0xc000_008e,
    FltInexactResult = 0xc000_008f,
    FltInvalidOperation = 0xc000_0090,
    FltOverflow = 0xc000_0091,
    FltUnderflow = 0xc000_0093,
    ArrayBoundsExceeded = 0xc000_008c,
    Breakpoint = 0x8000_0003,
    SingleStep = 0x8000_0004,
}

impl ExceptionCode {
    pub const ALL: [Self; 13] = [
        Self::AccessViolation,
        Self::IllegalInstruction,
        Self::IntDivideByZero,
        Self::IntOverflow,
        Self::FltDenormalOperand,
        Self::FltDivideByZero,
        Self::FltInexactResult,
        Self::FltInvalidOperation,
        Self::FltOverflow,
        Self::FltUnderflow,
        Self::ArrayBoundsExceeded,
        Self::Breakpoint,
        Self::SingleStep,
    ];

    #[inline]
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|code| *code as u32 == raw)
    }
}

/// Set in [`ExceptionRecord::flags`] for records that were created from a
/// hardware fault rather than raised by software
pub const EXCEPTION_IS_HARDWARE: u32 = 0x100;

/// The portable, OS independent description of an exception
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct ExceptionRecord {
    pub code: ExceptionCode,
    pub flags: u32,
    /// The address of the instruction that raised the exception
    pub address: usize,
    /// The number of valid entries in `parameters`
    pub parameter_count: u32,
    /// Auxiliary information, for access violations `[0]` is the kind of
    /// access (always 0) and `[1]` is the faulting address
    pub parameters: [usize; 2],
}

impl ExceptionRecord {
    #[inline]
    pub fn new(code: ExceptionCode) -> Self {
        Self {
            code,
            flags: EXCEPTION_IS_HARDWARE,
            address: 0,
            parameter_count: 0,
            parameters: [0; 2],
        }
    }

    #[inline]
    pub fn parameters(&self) -> &[usize] {
        &self.parameters[..(self.parameter_count as usize).min(2)]
    }

    /// The faulting data address, only present for access violations
    #[inline]
    pub fn fault_address(&self) -> Option<usize> {
        (self.code == ExceptionCode::AccessViolation)
            .then(|| self.parameters().get(1).copied())
            .flatten()
    }
}
