use core::fmt;

/// General-purpose register id, `r0` through `r31`.
///
/// `r31` doubles as the stack pointer and is written `sp` in assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegId(u8);

impl RegId {
    /// Construct a register id, if the index is in range.
    pub const fn new(id: u8) -> Option<Self> {
        if id < 32 {
            Some(Self(id))
        } else {
            None
        }
    }

    /// Construct a register id, masking the index into range.
    pub const fn new_masked(id: u8) -> Self {
        Self(id & 0x1f)
    }

    /// The stack pointer, `r31`.
    pub const SP: Self = Self(31);

    /// Register index.
    pub const fn index(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for RegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 31 {
            write!(f, "sp")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

/// Vector register id, `v0` through `v31`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VecRegId(u8);

impl VecRegId {
    /// Construct a vector register id, if the index is in range.
    pub const fn new(id: u8) -> Option<Self> {
        if id < 32 {
            Some(Self(id))
        } else {
            None
        }
    }

    /// Construct a vector register id, masking the index into range.
    pub const fn new_masked(id: u8) -> Self {
        Self(id & 0x1f)
    }

    /// Register index.
    pub const fn index(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for VecRegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Operand type selected by the OT field of an instruction word.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, strum::FromRepr, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum OperandType {
    /// 8-bit integer.
    Int8 = 0,
    /// 16-bit integer.
    Int16 = 1,
    /// 32-bit integer.
    Int32 = 2,
    /// 64-bit integer.
    Int64 = 3,
    /// 128-bit integer. Reserved; the emulator does not implement it.
    Int128 = 4,
    /// Single-precision float.
    Float = 5,
    /// Double-precision float.
    Double = 6,
    /// Half-precision float.
    Float16 = 7,
}

impl OperandType {
    /// Element size in bytes.
    pub const fn data_size(self) -> u32 {
        match self {
            Self::Int8 => 1,
            Self::Int16 | Self::Float16 => 2,
            Self::Int32 | Self::Float => 4,
            Self::Int64 | Self::Double => 8,
            Self::Int128 => 16,
        }
    }

    /// log2 of the element size.
    pub const fn size_log2(self) -> u32 {
        match self {
            Self::Int8 => 0,
            Self::Int16 | Self::Float16 => 1,
            Self::Int32 | Self::Float => 2,
            Self::Int64 | Self::Double => 3,
            Self::Int128 => 4,
        }
    }

    /// Whether the type is a floating point type.
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double | Self::Float16)
    }

    /// The OT field value.
    pub const fn field(self) -> u32 {
        self as u32
    }
}

/// Which base pointer a section or memory operand is addressed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BasePointer {
    /// Instruction pointer. Code and read-only data.
    Ip,
    /// Data pointer. Writable and uninitialized data.
    Datap,
    /// Thread-local data pointer.
    Threadp,
    /// Absolute or register-relative; no base pointer involved.
    None,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn reg_id_bounds() {
        assert!(RegId::new(31).is_some());
        assert!(RegId::new(32).is_none());
        assert_eq!(RegId::new_masked(33).index(), 1);
        assert_eq!(RegId::SP.to_string(), "sp");
        assert_eq!(RegId::new(7).unwrap().to_string(), "r7");
    }

    #[test]
    fn operand_type_field_round_trip() {
        for ot in OperandType::iter() {
            assert_eq!(OperandType::from_repr(ot as u8), Some(ot));
        }
    }

    #[test]
    fn operand_type_sizes() {
        assert_eq!(OperandType::Int32.data_size(), 4);
        assert_eq!(OperandType::Double.data_size(), 8);
        assert_eq!(OperandType::Float16.data_size(), 2);
        assert_eq!(1u32 << OperandType::Int64.size_log2(), 8);
        assert!(OperandType::Float.is_float());
        assert!(!OperandType::Int8.is_float());
    }
}
