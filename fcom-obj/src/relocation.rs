use crate::ObjError;

/// Relocation kind, bits 16..20 of the composite type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum RelocKind {
    /// Absolute address.
    Abs = 0,
    /// Relative to the end of the instruction (self-relative).
    SelfRel = 1,
    /// Relative to the IP base.
    IpBase = 2,
    /// Relative to the DATAP base.
    DatapBase = 3,
    /// Relative to the THREADP base.
    ThreadpBase = 4,
    /// Relative to an arbitrary reference symbol.
    RefPoint = 5,
    /// System function id.
    Sysfunc = 6,
    /// System module id.
    Sysmod = 7,
    /// Combined system call id.
    Syscall = 8,
    /// Computed data stack size.
    DataStack = 9,
    /// Computed call stack size.
    CallStack = 10,
    /// Register-use mask of the target function.
    RegUse = 11,
}

/// Target field size selector, bits 8..12 of the composite type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum RelocSize {
    /// No size; placeholder.
    None = 0,
    /// 8 bits.
    B8 = 1,
    /// 16 bits.
    B16 = 2,
    /// Low 16 of a 32-bit value.
    B16Lo = 3,
    /// High 16 of a 32-bit value.
    B16Hi = 4,
    /// 24 bits.
    B24 = 5,
    /// 32 bits.
    B32 = 6,
    /// Low 32 of a 64-bit value.
    B32Lo = 7,
    /// High 32 of a 64-bit value.
    B32Hi = 8,
    /// 64 bits.
    B64 = 9,
}

impl RelocSize {
    /// Number of bytes written into the target.
    pub const fn byte_count(self) -> u32 {
        match self {
            Self::None => 0,
            Self::B8 => 1,
            Self::B16 | Self::B16Lo | Self::B16Hi => 2,
            Self::B24 => 3,
            Self::B32 | Self::B32Lo | Self::B32Hi => 4,
            Self::B64 => 8,
        }
    }

    /// Whether a value, after scaling and part selection, fits the field.
    /// Signed and unsigned interpretations are both accepted.
    pub fn value_fits(self, value: i64) -> bool {
        match self {
            Self::None => true,
            Self::B8 => (-0x80..0x100).contains(&value),
            Self::B16 => (-0x8000..0x1_0000).contains(&value),
            Self::B16Lo | Self::B16Hi => true, // a part of a checked 32-bit value
            Self::B24 => (-0x80_0000..0x100_0000).contains(&value),
            Self::B32 => (-0x8000_0000..0x1_0000_0000).contains(&value),
            Self::B32Lo | Self::B32Hi => true,
            Self::B64 => true,
        }
    }
}

/// One relocation record.
#[derive(Debug, Clone, PartialEq)]
pub struct Relocation {
    /// Source section index.
    pub section: u32,
    /// Offset of the target field within the source section.
    pub offset: u64,
    /// Target symbol name.
    pub sym: String,
    /// Reference symbol for symbol-difference relocations.
    pub ref_sym: Option<String>,
    /// Constant addend.
    pub addend: i32,
    /// Kind.
    pub kind: RelocKind,
    /// Target field size.
    pub size: RelocSize,
    /// Right-shift applied to the computed value, log2.
    pub scale: u8,
    /// Fixup deferred to load time.
    pub load_time: bool,
}

impl Relocation {
    /// Pack kind, size, scale and the load-time flag into the 24-bit
    /// composite type field.
    pub fn type_field(&self) -> u32 {
        u32::from(self.scale & 0xf)
            | (u32::from(self.size as u8) << 8)
            | (u32::from(self.kind as u8) << 16)
            | (u32::from(self.load_time) << 23)
    }

    /// Unpack the composite type field.
    pub fn parse_type_field(field: u32) -> Result<(RelocKind, RelocSize, u8, bool), ObjError> {
        let scale = (field & 0xf) as u8;
        let size = RelocSize::from_repr(((field >> 8) & 0xf) as u8)
            .ok_or(ObjError::Malformed("bad relocation size selector"))?;
        let kind = RelocKind::from_repr(((field >> 16) & 0xf) as u8)
            .ok_or(ObjError::Malformed("bad relocation kind"))?;
        let load_time = field & (1 << 23) != 0;
        Ok((kind, size, scale, load_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn type_field_round_trip() {
        let r = Relocation {
            section: 0,
            offset: 0,
            sym: "x".into(),
            ref_sym: None,
            addend: 0,
            kind: RelocKind::DatapBase,
            size: RelocSize::B32Lo,
            scale: 3,
            load_time: true,
        };
        let field = r.type_field();
        assert_eq!(field & 0xf, 3);
        assert_eq!((field >> 8) & 0xf, RelocSize::B32Lo as u32);
        assert_eq!((field >> 16) & 0xf, RelocKind::DatapBase as u32);
        assert_ne!(field & (1 << 23), 0);
        let (kind, size, scale, load) = Relocation::parse_type_field(field).unwrap();
        assert_eq!(
            (kind, size, scale, load),
            (RelocKind::DatapBase, RelocSize::B32Lo, 3, true)
        );
    }

    #[rstest]
    #[case(RelocSize::B8, 255, true)]
    #[case(RelocSize::B8, 256, false)]
    #[case(RelocSize::B8, -128, true)]
    #[case(RelocSize::B8, -129, false)]
    #[case(RelocSize::B16, 0xffff, true)]
    #[case(RelocSize::B16, 0x10000, false)]
    #[case(RelocSize::B24, -0x80_0000, true)]
    #[case(RelocSize::B32, 0xffff_ffff, true)]
    #[case(RelocSize::B32, 0x1_0000_0000, false)]
    fn size_range_checks(#[case] size: RelocSize, #[case] value: i64, #[case] fits: bool) {
        assert_eq!(size.value_fits(value), fits);
    }

    #[test]
    fn bad_type_field_is_rejected() {
        // size selector 10 does not exist
        assert!(Relocation::parse_type_field(10 << 8).is_err());
        // kind 12 does not exist
        assert!(Relocation::parse_type_field(12 << 16).is_err());
    }
}
