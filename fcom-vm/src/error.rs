//! Interrupts and emulator errors.

/// Conditions that stop the running thread immediately.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, strum::EnumIter, strum::FromRepr,
)]
#[repr(u8)]
pub enum Interrupt {
    /// The word at IP does not decode to any instruction.
    #[display(fmt = "unknown instruction")]
    UnknownInstruction = 1,
    /// Operands are invalid for the instruction.
    #[display(fmt = "wrong parameters")]
    WrongParameters = 2,
    /// Read from unmapped or unreadable memory.
    #[display(fmt = "memory read access violation")]
    AccessRead = 3,
    /// Write to unmapped or unwritable memory.
    #[display(fmt = "memory write access violation")]
    AccessWrite = 4,
    /// Fetch from non-executable memory.
    #[display(fmt = "execute access violation")]
    AccessExecute = 5,
    /// Array index beyond its limit.
    #[display(fmt = "array bounds violation")]
    ArrayBounds = 6,
    /// Misaligned data access.
    #[display(fmt = "misaligned memory access")]
    MisalignedMemory = 7,
    /// Jump target not on an instruction boundary.
    #[display(fmt = "misaligned jump target")]
    MisalignedJump = 8,
    /// Too many nested calls.
    #[display(fmt = "call stack overflow")]
    CallStackOverflow = 9,
    /// Return without a call.
    #[display(fmt = "call stack underflow")]
    CallStackUnderflow = 10,
    /// Breakpoint instruction.
    #[display(fmt = "breakpoint")]
    Breakpoint = 11,
}

impl std::error::Error for Interrupt {}

/// Emulator setup and run errors.
#[derive(Debug, thiserror::Error)]
pub enum EmuError {
    /// The input is not an executable.
    #[error("input is not an executable")]
    NotExecutable,
    /// The image has no loadable contents.
    #[error("empty memory image")]
    EmptyImage,
    /// The image is too large to map.
    #[error("image too large")]
    ImageTooLarge,
    /// The thread stopped on an interrupt.
    #[error("interrupt at {ip:#x}: {interrupt}")]
    Stopped {
        /// Interrupt code.
        interrupt: Interrupt,
        /// Instruction address.
        ip: u64,
    },
    /// The configured step limit was reached.
    #[error("step limit of {0} instructions reached")]
    StepLimit(u64),
}

/// Floating point exception codes carried in quiet-NaN payloads.
///
/// The payload is right-justified: bits 8.. hold the code, bits 0..8 the
/// low bits of the faulting instruction's address.
pub mod fp_exception {
    /// Result was rounded.
    pub const INEXACT: u32 = 1;
    /// Result underflowed to subnormal or zero.
    pub const UNDERFLOW: u32 = 2;
    /// Result overflowed to infinity.
    pub const OVERFLOW: u32 = 3;
    /// Division by zero.
    pub const DIV_ZERO: u32 = 4;
    /// Invalid operation.
    pub const INVALID: u32 = 5;
    /// Square root of a negative number.
    pub const INVALID_SQRT: u32 = 6;
}

/// Build a quiet NaN with the given exception payload, in 32-bit format.
pub fn nan_payload_f32(code: u32, address: u64) -> u32 {
    let payload = ((code & 0x3f) << 8) | (address as u32 & 0xff);
    0x7fc0_0000 | payload
}

/// Build a quiet NaN with the given exception payload, in 64-bit format.
pub fn nan_payload_f64(code: u32, address: u64) -> u64 {
    let payload = u64::from((code & 0x3f) << 8) | (address & 0xff);
    0x7ff8_0000_0000_0000 | payload
}

/// Extract the exception code of a payload NaN, if the value is NaN.
pub fn nan_code_f32(bits: u32) -> Option<u32> {
    let is_nan = bits & 0x7f80_0000 == 0x7f80_0000 && bits & 0x007f_ffff != 0;
    is_nan.then_some((bits >> 8) & 0x3f)
}

/// Extract the exception code of a payload NaN, if the value is NaN.
pub fn nan_code_f64(bits: u64) -> Option<u32> {
    let is_nan = bits & 0x7ff0_0000_0000_0000 == 0x7ff0_0000_0000_0000
        && bits & 0x000f_ffff_ffff_ffff != 0;
    is_nan.then_some(((bits >> 8) & 0x3f) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip() {
        let bits = nan_payload_f32(fp_exception::INVALID_SQRT, 0x1234);
        assert!(f32::from_bits(bits).is_nan());
        assert_eq!(nan_code_f32(bits), Some(fp_exception::INVALID_SQRT));
        assert_eq!(bits & 0xff, 0x34);

        let bits = nan_payload_f64(fp_exception::DIV_ZERO, 0xabcd);
        assert!(f64::from_bits(bits).is_nan());
        assert_eq!(nan_code_f64(bits), Some(fp_exception::DIV_ZERO));
    }

    #[test]
    fn ordinary_values_have_no_code() {
        assert_eq!(nan_code_f32(1.5f32.to_bits()), None);
        assert_eq!(nan_code_f32(f32::INFINITY.to_bits()), None);
        assert_eq!(nan_code_f64(0.0f64.to_bits()), None);
    }
}
