//! Physical instruction formats.
//!
//! An instruction is one to three little-endian 32-bit words. Word 0 carries
//! the fields common to all templates:
//!
//! ```text
//! bits 30..32  IL     length in words, 1..=3
//! bits 27..30  MODE   operand pattern selector
//! bits 21..27  OP1    opcode
//! bits 16..21  RD     destination register
//! bits 13..16  OT     operand type
//! bits 10..13  MASK   mask register, 7 = unmasked
//! bits  5..10  RS     source register
//! bits  0..5   RT     source / index register
//! ```
//!
//! Templates B, C and D redefine the low bits of word 0; template E adds a
//! second word (OP2, RU, IM5, IM6) and optionally a third (IM7). The format
//! table below is the authoritative description of which fields each
//! encoding carries and where its immediate, address and jump fields live.

use fcom_types::OperandType;

/// Physical template tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Template {
    /// Single word, three register operands.
    A,
    /// Single word, two registers and an 8-bit immediate.
    B,
    /// Single word, one register and a 16-bit immediate.
    C,
    /// Single word, 24-bit jump offset.
    D,
    /// Two or three words with sub-opcode, extra register and wide fields.
    E,
}

bitflags::bitflags! {
    /// Which operand fields a format makes available.
    ///
    /// The bit values are fixed: the operand-gather loops in the emulator
    /// and the disassembler scan them in the documented priority order
    /// IMM, MEM, RT, RS, RU, RD.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpAvail: u8 {
        /// Immediate operand.
        const IMM = 0x01;
        /// Memory operand.
        const MEM = 0x02;
        /// Register RT.
        const RT = 0x10;
        /// Register RS.
        const RS = 0x20;
        /// Register RU (word 1).
        const RU = 0x40;
        /// Register RD, readable as first source operand.
        const RD = 0x80;
    }
}

/// Coarse class of a format, used for dispatch-table selection and
/// performance-counter bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum FormatCategory {
    /// Multi-format: the mnemonic chooses among several of these.
    Multi,
    /// Bound to exactly one mnemonic family via OP1/OP2.
    Single,
    /// Direct jump or call.
    Jump,
}

/// Role of the RU register field in word 1 of a template-E format.
///
/// RU is never a gathered source operand; when present it carries the
/// vector fallback register or the memory-operand length register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuUse {
    /// No RU field.
    #[default]
    None,
    /// Fallback register for masked vector operations.
    Fallback,
    /// Length register for vector memory operands.
    Length,
}

/// Composite format key decoded from the leading bits of word 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatKey {
    /// Instruction length in words.
    pub il: u8,
    /// Mode field.
    pub mode: u8,
    /// Sub-mode: the D sub-op field for (il=1, mode=7), else 0.
    pub mode2: u8,
}

/// Static description of one physical encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRecord {
    /// Short name used in listings and diagnostics.
    pub name: &'static str,
    /// Lookup key.
    pub key: FormatKey,
    /// Template tag.
    pub tmpl: Template,
    /// Available operand fields.
    pub op_avail: OpAvail,
    /// Byte position of the immediate field within the encoded instruction.
    pub imm_pos: u8,
    /// Immediate field size in bytes; 0 = no immediate field.
    pub imm_size: u8,
    /// Byte position of the address-offset field for memory operands.
    pub addr_pos: u8,
    /// Address field size in bytes; 0 = no memory operand.
    pub addr_size: u8,
    /// Byte position of the jump-offset field.
    pub jump_pos: u8,
    /// Jump field size in bytes; 0 = not a jump format.
    pub jump_size: u8,
    /// Flag word controlling OPJ extraction and related quirks.
    ///
    /// `0x80`: OPJ is in an alternative field rather than OP1 — IM1
    /// (byte 0) by default, or the top byte of word 1 when `0x10` is also
    /// set. `0x40`: OPJ has the fixed value 63.
    pub imm2: u16,
    /// Register operands are vector registers.
    pub vector: bool,
    /// The address offset is scaled by the operand-type size.
    pub scale: bool,
    /// Operand type when the encoding has no OT field.
    pub ot_fixed: Option<OperandType>,
    /// Role of the RU field.
    pub ru_use: RuUse,
    /// Format class.
    pub category: FormatCategory,
    /// Emulator dispatch-table selector.
    pub exe_table: u8,
}

impl FormatRecord {
    /// Encoded size in bytes.
    pub const fn byte_size(&self) -> u32 {
        self.key.il as u32 * 4
    }

    /// Whether word 0 uses the B field layout: IM1 in bits 0..8 and RS
    /// moved up to bits 8..13 (the mask field position; B-layout formats
    /// are unmasked). Applies to template B and to template-E formats
    /// whose 8-bit immediate lives in word 0.
    pub const fn b_layout(&self) -> bool {
        matches!(self.tmpl, Template::B)
            || (matches!(self.tmpl, Template::E) && self.imm_size == 1 && self.imm_pos == 0)
    }

    /// Read the RS field of word 0, honoring the B layout.
    pub const fn rs_of(&self, word0: u32) -> u8 {
        if self.b_layout() {
            ((word0 >> 8) & 0x1f) as u8
        } else {
            ((word0 >> 5) & 0x1f) as u8
        }
    }

    /// Write the RS field of word 0, honoring the B layout.
    pub fn set_rs(&self, word0: &mut u32, rs: u8) {
        if self.b_layout() {
            *word0 = (*word0 & !(0x1f << 8)) | ((rs as u32 & 0x1f) << 8);
        } else {
            *word0 = (*word0 & !(0x1f << 5)) | ((rs as u32 & 0x1f) << 5);
        }
    }

    /// Encoded size in 32-bit words.
    pub const fn word_size(&self) -> u32 {
        self.key.il as u32
    }

    /// Whether the format has a mask field. Templates A and E carry one
    /// unless the B field layout has taken those bits.
    pub const fn has_mask(&self) -> bool {
        matches!(self.tmpl, Template::A | Template::E) && !self.b_layout()
    }
}

/// Emulator dispatch-table selectors.
pub mod exe_table {
    /// General-purpose multi-format handlers.
    pub const GP: u8 = 0;
    /// Vector multi-format handlers.
    pub const VECTOR: u8 = 1;
    /// Jump handlers.
    pub const JUMP: u8 = 2;
    /// Single-format handlers (OP2 dispatch).
    pub const SINGLE: u8 = 3;
}

macro_rules! fmt_index {
    ($($(#[$doc:meta])* $name:ident = $val:expr;)*) => {
        $($(#[$doc])* pub const $name: usize = $val;)*
    };
}

fmt_index! {
    /// Template A, three GP registers.
    FMT_A = 0;
    /// Template B, GP registers and 8-bit immediate.
    FMT_B = 1;
    /// Template C, GP register and 16-bit immediate.
    FMT_C = 2;
    /// Template A, vector registers.
    FMT_A_V = 3;
    /// Template B, vector registers and broadcast immediate.
    FMT_B_V = 4;
    /// Template C conditional jump, compare-with-zero families.
    FMT_C_J = 5;
    /// Template D, unconditional 24-bit jump.
    FMT_D_J = 6;
    /// Template D, 24-bit call.
    FMT_D_C = 7;
    /// Template E, two words, GP registers and 16-bit immediate.
    FMT_E2 = 8;
    /// Template E, two words, GP memory operand.
    FMT_E2_M = 9;
    /// Template E, two words, vector registers, fallback and immediate.
    FMT_E2_V = 10;
    /// Template E, two words, vector memory operand with length register.
    FMT_E2_VM = 11;
    /// Template E conditional jump with 24-bit offset.
    FMT_E_J = 12;
    /// Template E single-format, OP2 is the opcode extension.
    FMT_E2_X = 13;
    /// Template E, three words, 32-bit immediate.
    FMT_E3 = 14;
    /// Template E, three words, memory operand with 32-bit offset.
    FMT_E3_M = 15;
}

const fn key(il: u8, mode: u8, mode2: u8) -> FormatKey {
    FormatKey { il, mode, mode2 }
}

/// The format table. Indexed by the `FMT_*` constants; order is the
/// tie-break order of the code fitter and must stay stable.
pub const FORMAT_TABLE: &[FormatRecord] = &[
    FormatRecord {
        name: "A",
        key: key(1, 0, 0),
        tmpl: Template::A,
        op_avail: OpAvail::RD.union(OpAvail::RS).union(OpAvail::RT),
        imm_pos: 0,
        imm_size: 0,
        addr_pos: 0,
        addr_size: 0,
        jump_pos: 0,
        jump_size: 0,
        imm2: 0,
        vector: false,
        scale: false,
        ot_fixed: None,
        ru_use: RuUse::None,
        category: FormatCategory::Multi,
        exe_table: exe_table::GP,
    },
    FormatRecord {
        name: "B",
        key: key(1, 1, 0),
        tmpl: Template::B,
        op_avail: OpAvail::RD.union(OpAvail::RS).union(OpAvail::IMM),
        imm_pos: 0,
        imm_size: 1,
        addr_pos: 0,
        addr_size: 0,
        jump_pos: 0,
        jump_size: 0,
        imm2: 0,
        vector: false,
        scale: false,
        ot_fixed: None,
        ru_use: RuUse::None,
        category: FormatCategory::Multi,
        exe_table: exe_table::GP,
    },
    FormatRecord {
        name: "C",
        key: key(1, 2, 0),
        tmpl: Template::C,
        op_avail: OpAvail::RD.union(OpAvail::IMM),
        imm_pos: 0,
        imm_size: 2,
        addr_pos: 0,
        addr_size: 0,
        jump_pos: 0,
        jump_size: 0,
        imm2: 0,
        vector: false,
        scale: false,
        ot_fixed: Some(OperandType::Int64),
        ru_use: RuUse::None,
        category: FormatCategory::Multi,
        exe_table: exe_table::GP,
    },
    FormatRecord {
        name: "A.v",
        key: key(1, 3, 0),
        tmpl: Template::A,
        op_avail: OpAvail::RD.union(OpAvail::RS).union(OpAvail::RT),
        imm_pos: 0,
        imm_size: 0,
        addr_pos: 0,
        addr_size: 0,
        jump_pos: 0,
        jump_size: 0,
        imm2: 0,
        vector: true,
        scale: false,
        ot_fixed: None,
        ru_use: RuUse::None,
        category: FormatCategory::Multi,
        exe_table: exe_table::VECTOR,
    },
    FormatRecord {
        name: "B.v",
        key: key(1, 4, 0),
        tmpl: Template::B,
        op_avail: OpAvail::RD.union(OpAvail::RS).union(OpAvail::IMM),
        imm_pos: 0,
        imm_size: 1,
        addr_pos: 0,
        addr_size: 0,
        jump_pos: 0,
        jump_size: 0,
        imm2: 0,
        vector: true,
        scale: false,
        ot_fixed: None,
        ru_use: RuUse::None,
        category: FormatCategory::Multi,
        exe_table: exe_table::VECTOR,
    },
    FormatRecord {
        name: "C.j",
        key: key(1, 6, 0),
        tmpl: Template::C,
        op_avail: OpAvail::RD,
        imm_pos: 0,
        imm_size: 0,
        addr_pos: 0,
        addr_size: 0,
        jump_pos: 1,
        jump_size: 1,
        imm2: 0x80,
        vector: false,
        scale: false,
        ot_fixed: Some(OperandType::Int64),
        ru_use: RuUse::None,
        category: FormatCategory::Jump,
        exe_table: exe_table::JUMP,
    },
    FormatRecord {
        name: "D.jump",
        key: key(1, 7, 0),
        tmpl: Template::D,
        op_avail: OpAvail::empty(),
        imm_pos: 0,
        imm_size: 0,
        addr_pos: 0,
        addr_size: 0,
        jump_pos: 0,
        jump_size: 3,
        imm2: 0x40,
        vector: false,
        scale: false,
        ot_fixed: Some(OperandType::Int64),
        ru_use: RuUse::None,
        category: FormatCategory::Jump,
        exe_table: exe_table::JUMP,
    },
    FormatRecord {
        name: "D.call",
        key: key(1, 7, 1),
        tmpl: Template::D,
        op_avail: OpAvail::empty(),
        imm_pos: 0,
        imm_size: 0,
        addr_pos: 0,
        addr_size: 0,
        jump_pos: 0,
        jump_size: 3,
        imm2: 0x40,
        vector: false,
        scale: false,
        ot_fixed: Some(OperandType::Int64),
        ru_use: RuUse::None,
        category: FormatCategory::Jump,
        exe_table: exe_table::JUMP,
    },
    FormatRecord {
        name: "E2",
        key: key(2, 0, 0),
        tmpl: Template::E,
        op_avail: OpAvail::RD
            .union(OpAvail::RS)
            .union(OpAvail::RT)
            .union(OpAvail::IMM),
        imm_pos: 4,
        imm_size: 2,
        addr_pos: 0,
        addr_size: 0,
        jump_pos: 0,
        jump_size: 0,
        imm2: 0,
        vector: false,
        scale: false,
        ot_fixed: None,
        ru_use: RuUse::None,
        category: FormatCategory::Multi,
        exe_table: exe_table::GP,
    },
    FormatRecord {
        name: "E2.m",
        key: key(2, 1, 0),
        tmpl: Template::E,
        op_avail: OpAvail::RD.union(OpAvail::MEM),
        imm_pos: 0,
        imm_size: 0,
        addr_pos: 4,
        addr_size: 2,
        jump_pos: 0,
        jump_size: 0,
        imm2: 0,
        vector: false,
        scale: true,
        ot_fixed: None,
        ru_use: RuUse::None,
        category: FormatCategory::Multi,
        exe_table: exe_table::GP,
    },
    FormatRecord {
        name: "E2.v",
        key: key(2, 3, 0),
        tmpl: Template::E,
        op_avail: OpAvail::RD
            .union(OpAvail::RS)
            .union(OpAvail::RT)
            .union(OpAvail::IMM),
        imm_pos: 4,
        imm_size: 2,
        addr_pos: 0,
        addr_size: 0,
        jump_pos: 0,
        jump_size: 0,
        imm2: 0,
        vector: true,
        scale: false,
        ot_fixed: None,
        ru_use: RuUse::Fallback,
        category: FormatCategory::Multi,
        exe_table: exe_table::VECTOR,
    },
    FormatRecord {
        name: "E2.vm",
        key: key(2, 4, 0),
        tmpl: Template::E,
        op_avail: OpAvail::RD.union(OpAvail::MEM),
        imm_pos: 0,
        imm_size: 0,
        addr_pos: 4,
        addr_size: 2,
        jump_pos: 0,
        jump_size: 0,
        imm2: 0,
        vector: true,
        scale: true,
        ot_fixed: None,
        ru_use: RuUse::Length,
        category: FormatCategory::Multi,
        exe_table: exe_table::VECTOR,
    },
    FormatRecord {
        name: "E.j",
        key: key(2, 6, 0),
        tmpl: Template::E,
        op_avail: OpAvail::RD.union(OpAvail::RS).union(OpAvail::IMM),
        imm_pos: 0,
        imm_size: 1,
        addr_pos: 0,
        addr_size: 0,
        jump_pos: 4,
        jump_size: 3,
        imm2: 0x90,
        vector: false,
        scale: false,
        ot_fixed: None,
        ru_use: RuUse::None,
        category: FormatCategory::Jump,
        exe_table: exe_table::JUMP,
    },
    FormatRecord {
        name: "E2.x",
        key: key(2, 7, 0),
        tmpl: Template::E,
        op_avail: OpAvail::RD
            .union(OpAvail::RS)
            .union(OpAvail::RT)
            .union(OpAvail::IMM),
        imm_pos: 4,
        imm_size: 2,
        addr_pos: 0,
        addr_size: 0,
        jump_pos: 0,
        jump_size: 0,
        imm2: 0,
        vector: true,
        scale: false,
        ot_fixed: None,
        ru_use: RuUse::Fallback,
        category: FormatCategory::Single,
        exe_table: exe_table::SINGLE,
    },
    FormatRecord {
        name: "E3",
        key: key(3, 0, 0),
        tmpl: Template::E,
        op_avail: OpAvail::RD
            .union(OpAvail::RS)
            .union(OpAvail::RT)
            .union(OpAvail::IMM),
        imm_pos: 8,
        imm_size: 4,
        addr_pos: 0,
        addr_size: 0,
        jump_pos: 0,
        jump_size: 0,
        imm2: 0,
        vector: false,
        scale: false,
        ot_fixed: None,
        ru_use: RuUse::None,
        category: FormatCategory::Multi,
        exe_table: exe_table::GP,
    },
    FormatRecord {
        name: "E3.m",
        key: key(3, 1, 0),
        tmpl: Template::E,
        op_avail: OpAvail::RD.union(OpAvail::MEM).union(OpAvail::IMM),
        imm_pos: 4,
        imm_size: 2,
        addr_pos: 8,
        addr_size: 4,
        jump_pos: 0,
        jump_size: 0,
        imm2: 0,
        vector: false,
        scale: false,
        ot_fixed: None,
        ru_use: RuUse::None,
        category: FormatCategory::Multi,
        exe_table: exe_table::GP,
    },
];

/// Fields of instruction word 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fields {
    /// Instruction length in words.
    pub il: u8,
    /// Mode field.
    pub mode: u8,
    /// Opcode field.
    pub op1: u8,
    /// Destination register field.
    pub rd: u8,
    /// Operand-type field.
    pub ot: u8,
    /// Mask register field; 7 = unmasked.
    pub mask: u8,
    /// Source register field.
    pub rs: u8,
    /// Source / index register field.
    pub rt: u8,
}

impl Fields {
    /// Decode the common fields of word 0.
    pub const fn decode(word0: u32) -> Self {
        Self {
            il: ((word0 >> 30) & 0x3) as u8,
            mode: ((word0 >> 27) & 0x7) as u8,
            op1: ((word0 >> 21) & 0x3f) as u8,
            rd: ((word0 >> 16) & 0x1f) as u8,
            ot: ((word0 >> 13) & 0x7) as u8,
            mask: ((word0 >> 10) & 0x7) as u8,
            rs: ((word0 >> 5) & 0x1f) as u8,
            rt: (word0 & 0x1f) as u8,
        }
    }

    /// Pack the fields back into word 0.
    pub const fn encode(&self) -> u32 {
        ((self.il as u32 & 0x3) << 30)
            | ((self.mode as u32 & 0x7) << 27)
            | ((self.op1 as u32 & 0x3f) << 21)
            | ((self.rd as u32 & 0x1f) << 16)
            | ((self.ot as u32 & 0x7) << 13)
            | ((self.mask as u32 & 0x7) << 10)
            | ((self.rs as u32 & 0x1f) << 5)
            | (self.rt as u32 & 0x1f)
    }
}

/// Look up the format record matching the first word of an instruction.
///
/// Returns `None` for reserved encodings (IL = 0 or an unassigned
/// (il, mode) combination).
pub fn lookup_format(word0: u32) -> Option<&'static FormatRecord> {
    let il = ((word0 >> 30) & 0x3) as u8;
    let mode = ((word0 >> 27) & 0x7) as u8;
    if il == 0 {
        return None;
    }
    let mode2 = if il == 1 && mode == 7 {
        ((word0 >> 24) & 0x7) as u8
    } else {
        0
    };
    let k = FormatKey { il, mode, mode2 };
    FORMAT_TABLE.iter().find(|f| f.key == k)
}

/// Extract the effective OPJ (jump condition code) of a decoded jump
/// instruction.
///
/// The default position is OP1. `imm2 & 0x80` moves it to an alternative
/// field: IM1 (byte 0 of word 0), or the top byte of word 1 when
/// `imm2 & 0x10` is also set. `imm2 & 0x40` pins it to 63 (unconditional).
pub fn effective_opj(fmt: &FormatRecord, words: &[u32]) -> u8 {
    if fmt.imm2 & 0x40 != 0 {
        return 63;
    }
    if fmt.imm2 & 0x80 != 0 {
        if fmt.imm2 & 0x10 != 0 {
            return words.get(1).map_or(0, |w| (w >> 24) as u8);
        }
        return (words[0] & 0xff) as u8;
    }
    Fields::decode(words[0]).op1
}

/// Fields of word 1 of a template-E instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldsE {
    /// Sub-opcode.
    pub op2: u8,
    /// Extra register: fallback, length or limit.
    pub ru: u8,
    /// Option bits.
    pub im5: u8,
    /// 16-bit immediate or address offset.
    pub im6: u16,
}

impl FieldsE {
    /// Decode word 1.
    pub const fn decode(word1: u32) -> Self {
        Self {
            op2: ((word1 >> 26) & 0x3f) as u8,
            ru: ((word1 >> 21) & 0x1f) as u8,
            im5: ((word1 >> 16) & 0x1f) as u8,
            im6: (word1 & 0xffff) as u16,
        }
    }

    /// Pack word 1.
    pub const fn encode(&self) -> u32 {
        ((self.op2 as u32 & 0x3f) << 26)
            | ((self.ru as u32 & 0x1f) << 21)
            | ((self.im5 as u32 & 0x1f) << 16)
            | (self.im6 as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word0_field_round_trip() {
        let f = Fields {
            il: 2,
            mode: 3,
            op1: 0x2a,
            rd: 17,
            ot: 5,
            mask: 7,
            rs: 30,
            rt: 1,
        };
        assert_eq!(Fields::decode(f.encode()), f);
    }

    #[test]
    fn word1_field_round_trip() {
        let f = FieldsE {
            op2: 0x3f,
            ru: 9,
            im5: 0x15,
            im6: 0xbeef,
        };
        assert_eq!(FieldsE::decode(f.encode()), f);
    }

    #[test]
    fn table_indices_match_keys() {
        assert_eq!(FORMAT_TABLE[FMT_A].key, FormatKey { il: 1, mode: 0, mode2: 0 });
        assert_eq!(FORMAT_TABLE[FMT_E3_M].key, FormatKey { il: 3, mode: 1, mode2: 0 });
        for (i, f) in FORMAT_TABLE.iter().enumerate() {
            // every record is reachable through lookup_format
            let mut w = Fields {
                il: f.key.il,
                mode: f.key.mode,
                ..Fields::default()
            }
            .encode();
            if f.key.il == 1 && f.key.mode == 7 {
                w |= (f.key.mode2 as u32) << 24;
            }
            let found = lookup_format(w).expect("record must be found");
            assert_eq!(found.key, f.key, "table entry {i} not reachable");
        }
    }

    #[test]
    fn reserved_il_is_rejected() {
        assert!(lookup_format(0).is_none());
    }

    #[test]
    fn opj_extraction() {
        // default: OPJ in OP1
        let w0 = Fields {
            il: 1,
            mode: 0,
            op1: 17,
            ..Fields::default()
        }
        .encode();
        assert_eq!(effective_opj(&FORMAT_TABLE[FMT_A], &[w0]), 17);

        // C.j: OPJ in IM1
        let w0 = (1 << 30) | (6 << 27) | 0x0000_0005;
        assert_eq!(effective_opj(&FORMAT_TABLE[FMT_C_J], &[w0]), 5);

        // E.j: OPJ in the top byte of word 1
        let w1 = (9u32 << 24) | 0x00_1234;
        assert_eq!(effective_opj(&FORMAT_TABLE[FMT_E_J], &[0, w1]), 9);

        // D: fixed 63
        assert_eq!(effective_opj(&FORMAT_TABLE[FMT_D_J], &[0]), 63);
    }
}
