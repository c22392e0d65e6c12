//! Per-mnemonic instruction records.
//!
//! The table is loaded once from an embedded CSV and exposed through three
//! sorted views: by name for the assembler, by id for the disassembler, and
//! by (dispatch table, op) key for the jump and single-format subsets.

use std::sync::OnceLock;

use crate::format::FORMAT_TABLE;

/// Raw CSV the table is parsed from.
const INSTRUCTION_CSV: &str = include_str!("instruction_set.csv");

/// Instruction category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Category {
    /// Encodable in several formats; the fitter chooses.
    Multi,
    /// Bound to one format.
    Single,
    /// Direct jump, call or fused arithmetic-and-branch.
    Jump,
}

bitflags::bitflags! {
    /// Per-mnemonic quirk flags consulted by both encoder and decoder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VariantFlags: u32 {
        /// No destination operand.
        const D0 = 0x0001;
        /// Destination is a general-purpose register even in vector context.
        const D1 = 0x0002;
        /// Memory operand is the destination (store forms).
        const M0 = 0x0004;
        /// Immediate operand is unsigned.
        const U0 = 0x0008;
        /// Mask and fallback registers apply.
        const F0 = 0x0010;
        /// Has a second immediate operand in IM6.
        const I2 = 0x0020;
        /// Has option bits in IM5.
        const OPT = 0x0040;
        /// Half precision operands.
        const H0 = 0x0080;
    }
}

/// How an immediate field is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ImmStyle {
    /// No immediate.
    None,
    /// Raw signed, sized by the chosen format.
    ByOt,
    /// Signed 8-bit.
    I8,
    /// Signed 16-bit.
    I16,
    /// Signed 32-bit.
    I32,
    /// Unsigned 8-bit.
    U8,
    /// Unsigned 16-bit.
    U16,
    /// Unsigned 32-bit.
    U32,
    /// Signed 8-bit shifted left by IM5.
    I8Shift,
    /// Signed 16-bit shifted left by IM5.
    I16Shift,
    /// Signed 16-bit shifted left by 16.
    I16Sh16,
    /// Signed 32-bit shifted left by 32.
    I32Sh32,
    /// Half-precision float.
    F16,
    /// Single-precision float.
    F32,
    /// Double-precision float.
    F64,
    /// Implicit constant; no field.
    Implicit,
}

/// One record per mnemonic.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionRecord {
    /// Mnemonic.
    pub name: String,
    /// Numeric instruction id, unique per record.
    pub id: u32,
    /// Category.
    pub category: Category,
    /// Bitmask of permitted formats, by format-table index.
    pub formats: u32,
    /// OP1 value; for jumps, the arithmetic family code.
    pub op1: u8,
    /// OP2 value for template-E single-format records.
    pub op2: u8,
    /// Number of source operands.
    pub num_operands: u8,
    /// Permitted operand types in general-purpose context, one bit per
    /// [`fcom_types::OperandType`] repr.
    pub optypes_gp: u16,
    /// Permitted operand types in vector context.
    pub optypes_vec: u16,
    /// Immediate interpretation.
    pub imm_style: ImmStyle,
    /// Quirk flags.
    pub variant: VariantFlags,
    /// Condition sub-code for jump records; `None` otherwise.
    pub opj: Option<u8>,
}

impl InstructionRecord {
    /// Whether the record may be encoded in the format with table index
    /// `fmt_index`.
    pub const fn allows_format(&self, fmt_index: usize) -> bool {
        self.formats & (1 << fmt_index) != 0
    }
}

/// Error produced while loading the instruction table.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TableError {
    /// A CSV line does not have the expected number of columns.
    #[error("instruction table line {0}: expected 12 columns, found {1}")]
    ColumnCount(usize, usize),
    /// A field failed to parse.
    #[error("instruction table line {line}: bad {what}: {text}")]
    BadField {
        /// Line number.
        line: usize,
        /// Which column.
        what: &'static str,
        /// Offending text.
        text: String,
    },
    /// Two records share an id.
    #[error("instruction table: duplicate id {0:#x}")]
    DuplicateId(u32),
    /// Two records share a name.
    #[error("instruction table: duplicate name {0}")]
    DuplicateName(String),
    /// A format mask references a format index outside the table.
    #[error("instruction table line {0}: format mask references unknown format")]
    UnknownFormat(usize),
}

/// The instruction table with its sorted views.
#[derive(Debug)]
pub struct InstructionSet {
    records: Vec<InstructionRecord>,
    by_name: Vec<u16>,
    by_id: Vec<u16>,
    /// Jump and single-format records keyed by (exe table, op1, opj/op2).
    by_op: Vec<(u32, u16)>,
}

fn op_key(table: u8, op1: u8, sub: u8) -> u32 {
    (u32::from(table) << 16) | (u32::from(op1) << 8) | u32::from(sub)
}

impl InstructionSet {
    /// Parse a table from CSV text.
    pub fn parse(csv: &str) -> Result<Self, TableError> {
        let mut records = Vec::new();
        for (lineno, line) in csv.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            records.push(parse_line(lineno + 1, line)?);
        }

        let mut by_name: Vec<u16> = (0..records.len() as u16).collect();
        by_name.sort_by(|&a, &b| records[a as usize].name.cmp(&records[b as usize].name));
        for pair in by_name.windows(2) {
            let (a, b) = (&records[pair[0] as usize], &records[pair[1] as usize]);
            if a.name == b.name {
                return Err(TableError::DuplicateName(a.name.clone()));
            }
        }

        let mut by_id: Vec<u16> = (0..records.len() as u16).collect();
        by_id.sort_by_key(|&i| records[i as usize].id);
        for pair in by_id.windows(2) {
            let (a, b) = (&records[pair[0] as usize], &records[pair[1] as usize]);
            if a.id == b.id {
                return Err(TableError::DuplicateId(a.id));
            }
        }

        let mut by_op: Vec<(u32, u16)> = Vec::new();
        for (i, r) in records.iter().enumerate() {
            match r.category {
                Category::Jump => {
                    by_op.push((op_key(2, r.op1, r.opj.unwrap_or(63)), i as u16));
                }
                Category::Single => {
                    by_op.push((op_key(3, r.op1, r.op2), i as u16));
                }
                Category::Multi => {}
            }
        }
        by_op.sort_by_key(|&(k, _)| k);

        Ok(Self {
            records,
            by_name,
            by_id,
            by_op,
        })
    }

    /// All records, in table order.
    pub fn records(&self) -> &[InstructionRecord] {
        &self.records
    }

    /// Look up a mnemonic.
    pub fn find_name(&self, name: &str) -> Option<&InstructionRecord> {
        let idx = self
            .by_name
            .binary_search_by(|&i| self.records[i as usize].name.as_str().cmp(name))
            .ok()?;
        Some(&self.records[self.by_name[idx] as usize])
    }

    /// Look up by instruction id.
    pub fn find_id(&self, id: u32) -> Option<&InstructionRecord> {
        let idx = self
            .by_id
            .binary_search_by_key(&id, |&i| self.records[i as usize].id)
            .ok()?;
        Some(&self.records[self.by_id[idx] as usize])
    }

    /// Look up a multi-format record by OP1.
    pub fn find_multi(&self, op1: u8) -> Option<&InstructionRecord> {
        self.records
            .iter()
            .find(|r| r.category == Category::Multi && r.op1 == op1)
    }

    /// Look up a jump record by arithmetic family and condition code.
    pub fn find_jump(&self, op1: u8, opj: u8) -> Option<&InstructionRecord> {
        let key = op_key(2, op1, opj);
        let idx = self.by_op.binary_search_by_key(&key, |&(k, _)| k).ok()?;
        Some(&self.records[self.by_op[idx].1 as usize])
    }

    /// Look up a single-format record by OP1 and OP2.
    pub fn find_single(&self, op1: u8, op2: u8) -> Option<&InstructionRecord> {
        let key = op_key(3, op1, op2);
        let idx = self.by_op.binary_search_by_key(&key, |&(k, _)| k).ok()?;
        Some(&self.records[self.by_op[idx].1 as usize])
    }
}

fn parse_line(lineno: usize, line: &str) -> Result<InstructionRecord, TableError> {
    let cols: Vec<&str> = line.split(',').map(str::trim).collect();
    if cols.len() != 12 {
        return Err(TableError::ColumnCount(lineno, cols.len()));
    }
    let bad = |what: &'static str, text: &str| TableError::BadField {
        line: lineno,
        what,
        text: text.to_string(),
    };

    let name = cols[0].to_string();
    let id = parse_u32(cols[1]).ok_or_else(|| bad("id", cols[1]))?;
    let category = match cols[2] {
        "multi" => Category::Multi,
        "single" => Category::Single,
        "jump" => Category::Jump,
        other => return Err(bad("category", other)),
    };
    let formats = parse_u32(cols[3]).ok_or_else(|| bad("formats", cols[3]))?;
    if formats >> FORMAT_TABLE.len() != 0 {
        return Err(TableError::UnknownFormat(lineno));
    }
    let op1 = parse_u32(cols[4]).ok_or_else(|| bad("op1", cols[4]))? as u8;
    let op2 = parse_u32(cols[5]).ok_or_else(|| bad("op2", cols[5]))? as u8;
    let num_operands = parse_u32(cols[6]).ok_or_else(|| bad("operands", cols[6]))? as u8;
    let optypes_gp = parse_u32(cols[7]).ok_or_else(|| bad("optypes_gp", cols[7]))? as u16;
    let optypes_vec = parse_u32(cols[8]).ok_or_else(|| bad("optypes_vec", cols[8]))? as u16;
    let imm_style = parse_imm_style(cols[9]).ok_or_else(|| bad("imm", cols[9]))?;
    let variant = parse_variant(cols[10]).ok_or_else(|| bad("variant", cols[10]))?;
    let opj = match cols[11] {
        "-" => None,
        text => Some(parse_u32(text).ok_or_else(|| bad("opj", text))? as u8),
    };

    Ok(InstructionRecord {
        name,
        id,
        category,
        formats,
        op1,
        op2,
        num_operands,
        optypes_gp,
        optypes_vec,
        imm_style,
        variant,
        opj,
    })
}

fn parse_u32(text: &str) -> Option<u32> {
    if let Some(hex) = text.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn parse_imm_style(text: &str) -> Option<ImmStyle> {
    Some(match text {
        "none" => ImmStyle::None,
        "byot" => ImmStyle::ByOt,
        "i8" => ImmStyle::I8,
        "i16" => ImmStyle::I16,
        "i32" => ImmStyle::I32,
        "u8" => ImmStyle::U8,
        "u16" => ImmStyle::U16,
        "u32" => ImmStyle::U32,
        "i8sh" => ImmStyle::I8Shift,
        "i16sh" => ImmStyle::I16Shift,
        "i16sh16" => ImmStyle::I16Sh16,
        "i32sh32" => ImmStyle::I32Sh32,
        "f16" => ImmStyle::F16,
        "f32" => ImmStyle::F32,
        "f64" => ImmStyle::F64,
        "implicit" => ImmStyle::Implicit,
        _ => return None,
    })
}

fn parse_variant(text: &str) -> Option<VariantFlags> {
    if text == "-" {
        return Some(VariantFlags::empty());
    }
    let mut flags = VariantFlags::empty();
    for part in text.split('|') {
        flags |= match part {
            "D0" => VariantFlags::D0,
            "D1" => VariantFlags::D1,
            "M0" => VariantFlags::M0,
            "U0" => VariantFlags::U0,
            "F0" => VariantFlags::F0,
            "I2" => VariantFlags::I2,
            "OPT" => VariantFlags::OPT,
            "H0" => VariantFlags::H0,
            _ => return None,
        };
    }
    Some(flags)
}

/// The process-wide instruction set, loaded from the embedded CSV on first
/// use.
pub fn instruction_set() -> Result<&'static InstructionSet, TableError> {
    static SET: OnceLock<Result<InstructionSet, TableError>> = OnceLock::new();
    SET.get_or_init(|| InstructionSet::parse(INSTRUCTION_CSV))
        .as_ref()
        .map_err(Clone::clone)
}

/// OP1 values of the multi-format instructions and the template-A/B
/// singles, one constant per CSV row.
pub mod op1 {
    /// `store`.
    pub const STORE: u8 = 1;
    /// `move`.
    pub const MOVE: u8 = 2;
    /// `compare`.
    pub const COMPARE: u8 = 7;
    /// `add`.
    pub const ADD: u8 = 8;
    /// `sub`.
    pub const SUB: u8 = 9;
    /// `sub_rev`.
    pub const SUB_REV: u8 = 10;
    /// `mul`.
    pub const MUL: u8 = 11;
    /// `mul_hi`.
    pub const MUL_HI: u8 = 12;
    /// `div`.
    pub const DIV: u8 = 14;
    /// `div_u`.
    pub const DIV_U: u8 = 15;
    /// `rem`.
    pub const REM: u8 = 18;
    /// `min`.
    pub const MIN: u8 = 20;
    /// `max`.
    pub const MAX: u8 = 21;
    /// `and`.
    pub const AND: u8 = 26;
    /// `or`.
    pub const OR: u8 = 27;
    /// `xor`.
    pub const XOR: u8 = 28;
    /// `shift_left`.
    pub const SHIFT_LEFT: u8 = 32;
    /// `rotate`.
    pub const ROTATE: u8 = 33;
    /// `shift_right_s`.
    pub const SHIFT_RIGHT_S: u8 = 34;
    /// `shift_right_u`.
    pub const SHIFT_RIGHT_U: u8 = 35;
    /// `clear_bit`.
    pub const CLEAR_BIT: u8 = 36;
    /// `set_bit`.
    pub const SET_BIT: u8 = 37;
    /// `toggle_bit`.
    pub const TOGGLE_BIT: u8 = 38;
    /// `test_bit`.
    pub const TEST_BIT: u8 = 39;
    /// `test_bits_and`.
    pub const TEST_BITS_AND: u8 = 40;
    /// `test_bits_or`.
    pub const TEST_BITS_OR: u8 = 41;
    /// `mul_add`.
    pub const MUL_ADD: u8 = 49;
    /// `add_add`.
    pub const ADD_ADD: u8 = 51;
    /// `select_bits`.
    pub const SELECT_BITS: u8 = 52;
    /// `push` (single-format, template B).
    pub const PUSH: u8 = 60;
    /// `pop` (single-format, template B).
    pub const POP: u8 = 61;
    /// `return` (single-format, template A).
    pub const RETURN: u8 = 62;
    /// `nop` (single-format, template A).
    pub const NOP: u8 = 63;
    /// Jump family: compare the register with zero.
    pub const JF_CMP_ZERO: u8 = 0;
    /// Jump family: subtract, then test.
    pub const JF_SUB: u8 = 1;
    /// Jump family: add, then test.
    pub const JF_ADD: u8 = 2;
    /// Jump family: test a bit.
    pub const JF_TEST_BIT: u8 = 3;
    /// Jump family: compare two operands.
    pub const JF_COMPARE: u8 = 4;
    /// Jump family: increment, compare against a limit.
    pub const JF_INC_CMP: u8 = 8;
}

/// Well-known OP2 values of E2.x single-format instructions.
pub mod op2 {
    /// `set_len`.
    pub const SET_LEN: u8 = 1;
    /// `get_len`.
    pub const GET_LEN: u8 = 2;
    /// `broadcast`.
    pub const BROADCAST: u8 = 3;
    /// `compress_sparse`.
    pub const COMPRESS_SPARSE: u8 = 4;
    /// `expand`.
    pub const EXPAND: u8 = 5;
    /// `permute`.
    pub const PERMUTE: u8 = 6;
    /// `insert`.
    pub const INSERT: u8 = 7;
    /// `extract`.
    pub const EXTRACT: u8 = 8;
    /// `sqrt`.
    pub const SQRT: u8 = 9;
    /// `float2int`.
    pub const FLOAT2INT: u8 = 10;
    /// `int2float`.
    pub const INT2FLOAT: u8 = 11;
    /// `read_spec`.
    pub const READ_SPEC: u8 = 12;
    /// `write_spec`.
    pub const WRITE_SPEC: u8 = 13;
    /// `sys_call`.
    pub const SYS_CALL: u8 = 14;
    /// `address`.
    pub const ADDRESS: u8 = 15;
}

/// Condition sub-codes. Bit 0 inverts the condition.
pub mod opj {
    /// Zero / equal.
    pub const ZERO: u8 = 0;
    /// Not zero / not equal.
    pub const NZERO: u8 = 1;
    /// Negative / signed less.
    pub const NEG: u8 = 2;
    /// Not negative / signed greater or equal.
    pub const NNEG: u8 = 3;
    /// Positive / signed greater.
    pub const POS: u8 = 4;
    /// Not positive / signed less or equal.
    pub const NPOS: u8 = 5;
    /// Signed overflow.
    pub const OVERFLOW: u8 = 6;
    /// No signed overflow.
    pub const NOVERFLOW: u8 = 7;
    /// Carry / borrow / unsigned below.
    pub const CARRY: u8 = 8;
    /// No carry / unsigned at or above.
    pub const NCARRY: u8 = 9;
    /// Test result true.
    pub const TRUE: u8 = 10;
    /// Test result false.
    pub const FALSE: u8 = 11;
    /// Always.
    pub const ALWAYS: u8 = 63;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_table_loads() {
        let set = instruction_set().expect("embedded table must parse");
        assert!(set.records().len() > 50);
    }

    #[test]
    fn name_lookup() {
        let set = instruction_set().unwrap();
        let add = set.find_name("add").unwrap();
        assert_eq!(add.op1, op1::ADD);
        assert_eq!(add.category, Category::Multi);
        assert!(set.find_name("no_such_mnemonic").is_none());
    }

    #[test]
    fn id_lookup_matches_name_lookup() {
        let set = instruction_set().unwrap();
        for r in set.records() {
            assert_eq!(set.find_id(r.id).map(|x| x.name.as_str()), Some(r.name.as_str()));
            assert_eq!(set.find_name(&r.name).map(|x| x.id), Some(r.id));
        }
    }

    #[test]
    fn jump_lookup_by_family_and_condition() {
        let set = instruction_set().unwrap();
        let jz = set.find_jump(op1::JF_CMP_ZERO, opj::ZERO).unwrap();
        assert_eq!(jz.name, "jump_zero");
        let fused = set.find_jump(op1::JF_SUB, opj::NZERO).unwrap();
        assert_eq!(fused.name, "sub_jump_nzero");
    }

    #[test]
    fn single_lookup_by_op2() {
        let set = instruction_set().unwrap();
        let cs = set.find_single(0, op2::COMPRESS_SPARSE).unwrap();
        assert_eq!(cs.name, "compress_sparse");
        assert_eq!(cs.category, Category::Single);
    }

    #[test]
    fn store_is_memory_destination() {
        let set = instruction_set().unwrap();
        let store = set.find_name("store").unwrap();
        assert!(store.variant.contains(VariantFlags::M0));
    }

    #[test]
    fn bad_csv_is_rejected() {
        assert!(matches!(
            InstructionSet::parse("onlythreecols,1,multi"),
            Err(TableError::ColumnCount(1, 3))
        ));
        assert!(InstructionSet::parse(
            "a,1,multi,0x1,1,0,2,0xf,0xf,byot,-,-\nb,1,multi,0x1,2,0,2,0xf,0xf,byot,-,-"
        )
        .is_err());
    }
}
