//! Translate a fitted code item into the on-wire bit layout.

use fcom_asm::{
    f64_to_f16, operand_shape, plan_regs, Category, FieldsE, FormatCategory, InstructionSet,
    RegSlot, RuUse, Template, FORMAT_TABLE,
};
use fcom_obj::RelocSize;

use crate::code::CodeItem;
use crate::expr::{ExprValue, MemOperand, RegClass};
use crate::fitter::{ImmValue, JumpValue};

/// Which field of the instruction a relocation patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocSpot {
    /// The immediate field.
    Imm,
    /// The address-offset field of a memory operand.
    Addr,
    /// The jump-offset field.
    Jump,
}

/// A relocation the encoder could not resolve; the assembler turns it
/// into an object-file record.
#[derive(Debug, Clone, PartialEq)]
pub struct RelocRequest {
    /// Field being patched.
    pub spot: RelocSpot,
    /// Byte offset of the field within the instruction.
    pub offset: u32,
    /// Field size selector.
    pub size: RelocSize,
    /// Right-shift scale, log2.
    pub scale: u8,
    /// Target symbol.
    pub sym: String,
    /// Constant addend.
    pub addend: i64,
}

/// Encoder output: instruction words plus pending relocations.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    /// Little-endian instruction words.
    pub words: Vec<u32>,
    /// Pending relocations.
    pub relocs: Vec<RelocRequest>,
}

/// Encoding failure; these indicate assembler bugs or operand mixes the
/// fitter should have rejected.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum EncodeError {
    /// The item has not been through the fitter.
    #[error("instruction has no chosen format")]
    NotFitted,
    /// Index scale does not match the operand size.
    #[error("index scale must equal the operand size")]
    BadScale,
    /// Internal inconsistency.
    #[error("encoder inconsistency: {0}")]
    Internal(&'static str),
}

/// Encode one fitted item.
pub fn encode_item(
    item: &CodeItem,
    iset: &InstructionSet,
    imm: ImmValue,
    jump: JumpValue,
) -> Result<Encoded, EncodeError> {
    let fmt_index = item.chosen.ok_or(EncodeError::NotFitted)?;
    let fmt = &FORMAT_TABLE[fmt_index];
    let rec = iset
        .find_id(item.id)
        .ok_or(EncodeError::Internal("unknown instruction id"))?;
    let shape =
        operand_shape(rec, fmt).ok_or(EncodeError::Internal("shape vanished after fitting"))?;
    let plan = plan_regs(fmt, shape.n_regs)
        .ok_or(EncodeError::Internal("register plan vanished after fitting"))?;

    let mut words = vec![0u32; fmt.word_size() as usize];
    let mut relocs = Vec::new();

    // word 0 skeleton
    words[0] = (u32::from(fmt.key.il) << 30) | (u32::from(fmt.key.mode) << 27);
    if fmt.tmpl == Template::D {
        words[0] |= u32::from(fmt.key.mode2) << 24;
    } else {
        words[0] |= u32::from(rec.op1) << 21;
    }
    if let Some(dest) = item.dest {
        words[0] |= u32::from(dest.index) << 16;
    }
    if fmt.ot_fixed.is_none() && fmt.tmpl != Template::D {
        words[0] |= item.ot.field() << 13;
    }
    if fmt.has_mask() {
        words[0] |= u32::from(item.mask.unwrap_or(7)) << 10;
    }

    // word 1 skeleton for template E
    if fmt.tmpl == Template::E && fmt.category != FormatCategory::Jump {
        let mut e = FieldsE {
            op2: rec.op2,
            ..FieldsE::default()
        };
        match fmt.ru_use {
            RuUse::Fallback => e.ru = item.fallback.unwrap_or(31),
            RuUse::Length => {
                e.ru = mem_operand(item)
                    .and_then(|m| m.length)
                    .map(|r| r.index)
                    .unwrap_or(31);
            }
            RuUse::None => {}
        }
        words[1] = e.encode();
    }

    // register sources
    let regs: Vec<_> = item
        .operands
        .iter()
        .filter_map(|o| match o {
            ExprValue::Reg(r) => Some(*r),
            _ => None,
        })
        .collect();
    if regs.len() != plan.len() {
        return Err(EncodeError::Internal("register count mismatch"));
    }
    for (reg, slot) in regs.iter().zip(&plan) {
        match slot {
            RegSlot::Rd => {
                words[0] = (words[0] & !(0x1f << 16)) | (u32::from(reg.index) << 16);
            }
            RegSlot::Rs => fmt.set_rs(&mut words[0], reg.index),
            RegSlot::Rt => {
                words[0] = (words[0] & !0x1f) | u32::from(reg.index);
            }
        }
    }

    // memory operand
    if let Some(m) = mem_operand(item) {
        encode_memory(item, fmt, m, &mut words, &mut relocs)?;
    }

    // immediate
    if shape.has_imm {
        encode_immediate(item, fmt, imm, &mut words, &mut relocs)?;
    }

    // jump offset and condition code
    if rec.category == Category::Jump {
        let opj = rec.opj.unwrap_or(63);
        let offset_units = match jump {
            JumpValue::Offset(v) => (v >> 2) as i32,
            _ => 0,
        };
        let needs_reloc = !matches!(jump, JumpValue::Offset(_));
        match fmt_index {
            fcom_asm::FMT_C_J => {
                words[0] |= u32::from(opj);
                words[0] |= (offset_units as u32 & 0xff) << 8;
                if needs_reloc {
                    return Err(EncodeError::Internal("one-word jump cannot relocate"));
                }
            }
            fcom_asm::FMT_D_J | fcom_asm::FMT_D_C => {
                words[0] |= offset_units as u32 & 0x00ff_ffff;
                if needs_reloc {
                    push_jump_reloc(item, fmt.jump_pos, RelocSize::B24, &mut relocs)?;
                    words[0] &= !0x00ff_ffff;
                }
            }
            fcom_asm::FMT_E_J => {
                words[1] = (u32::from(opj) << 24) | (offset_units as u32 & 0x00ff_ffff);
                if needs_reloc {
                    push_jump_reloc(item, fmt.jump_pos, RelocSize::B24, &mut relocs)?;
                    words[1] &= !0x00ff_ffff;
                }
            }
            _ => return Err(EncodeError::Internal("jump in a non-jump format")),
        }
    }

    Ok(Encoded { words, relocs })
}

fn mem_operand(item: &CodeItem) -> Option<&MemOperand> {
    item.operands.iter().find_map(|o| match o {
        ExprValue::Mem(m) => Some(m),
        _ => None,
    })
}

fn encode_memory(
    item: &CodeItem,
    fmt: &fcom_asm::FormatRecord,
    m: &MemOperand,
    words: &mut [u32],
    relocs: &mut Vec<RelocRequest>,
) -> Result<(), EncodeError> {
    // base in RS, index in RT
    if let Some(base) = m.base {
        if base.class == RegClass::Gp {
            fmt.set_rs(&mut words[0], base.index);
        } else {
            // special-pointer bases use the reserved encodings 28..30 in RS
            let index = match base.index as u32 {
                crate::token::reg_class::SP_IP => 28,
                crate::token::reg_class::SP_DATAP => 29,
                crate::token::reg_class::SP_THREADP => 30,
                _ => return Err(EncodeError::Internal("bad special base")),
            };
            fmt.set_rs(&mut words[0], index);
        }
    }
    if let Some(index) = m.index {
        let expected = i64::from(item.ot.data_size());
        if i64::from(m.scale) != expected && m.scale != 1 {
            return Err(EncodeError::BadScale);
        }
        words[0] = (words[0] & !0x1f) | u32::from(index.index);
        // mark the index presence in IM5 bit 0 of word 1
        if fmt.tmpl == Template::E && words.len() > 1 {
            words[1] |= 1 << 16;
        }
    }

    if let Some(sym) = &m.sym {
        relocs.push(RelocRequest {
            spot: RelocSpot::Addr,
            offset: u32::from(fmt.addr_pos),
            size: match fmt.addr_size {
                2 => RelocSize::B16,
                4 => RelocSize::B32,
                _ => return Err(EncodeError::Internal("bad address field")),
            },
            // scaled address fields hold the offset in operand-size units
            scale: if fmt.scale { item.ot.size_log2() as u8 } else { 0 },
            sym: sym.clone(),
            addend: m.offset,
        });
        return Ok(());
    }

    let raw = if fmt.scale {
        let size = i64::from(item.ot.data_size());
        if m.offset % size != 0 {
            return Err(EncodeError::Internal("unscalable offset after fitting"));
        }
        m.offset / size
    } else {
        m.offset
    };
    write_field(words, fmt.addr_pos, fmt.addr_size, raw as u64);
    Ok(())
}

fn encode_immediate(
    item: &CodeItem,
    fmt: &fcom_asm::FormatRecord,
    imm: ImmValue,
    words: &mut [u32],
    relocs: &mut Vec<RelocRequest>,
) -> Result<(), EncodeError> {
    match imm {
        ImmValue::Int(v) => {
            write_field(words, fmt.imm_pos, fmt.imm_size, v as u64);
        }
        ImmValue::Float(v) => {
            let bits = match fmt.imm_size {
                2 => u64::from(f64_to_f16(v)),
                4 => u64::from((v as f32).to_bits()),
                _ => return Err(EncodeError::Internal("bad float immediate field")),
            };
            write_field(words, fmt.imm_pos, fmt.imm_size, bits);
        }
        ImmValue::Reloc | ImmValue::Unknown => {
            let sym = item
                .operands
                .iter()
                .find_map(|o| match o {
                    ExprValue::Sym(s) => Some((s.name.clone(), s.addend)),
                    ExprValue::Unresolved { name } => Some((name.clone(), 0)),
                    _ => None,
                })
                .ok_or(EncodeError::Internal("relocated immediate without symbol"))?;
            relocs.push(RelocRequest {
                spot: RelocSpot::Imm,
                offset: u32::from(fmt.imm_pos),
                size: match fmt.imm_size {
                    2 => RelocSize::B16,
                    4 => RelocSize::B32,
                    _ => return Err(EncodeError::Internal("bad immediate field")),
                },
                scale: 0,
                sym: sym.0,
                addend: sym.1,
            });
        }
        ImmValue::None => return Err(EncodeError::Internal("missing immediate")),
    }
    Ok(())
}

fn push_jump_reloc(
    item: &CodeItem,
    pos: u8,
    size: RelocSize,
    relocs: &mut Vec<RelocRequest>,
) -> Result<(), EncodeError> {
    let target = item
        .target
        .as_ref()
        .ok_or(EncodeError::Internal("jump without target"))?;
    relocs.push(RelocRequest {
        spot: RelocSpot::Jump,
        offset: u32::from(pos),
        size,
        scale: 2,
        sym: target.name.clone(),
        addend: target.addend,
    });
    Ok(())
}

/// Write `value`'s low bytes into the instruction image at byte `pos`.
fn write_field(words: &mut [u32], pos: u8, size: u8, value: u64) {
    for i in 0..size {
        let byte = ((value >> (8 * i)) & 0xff) as u32;
        let at = usize::from(pos + i);
        let word = at / 4;
        let shift = (at % 4) * 8;
        words[word] = (words[word] & !(0xff << shift)) | (byte << shift);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{RegOperand, SymRef};
    use crate::fitter::fit_code;
    use fcom_asm::{instruction_set, lookup_format, Fields};
    use fcom_types::OperandType;

    fn gp(i: u8) -> RegOperand {
        RegOperand {
            class: RegClass::Gp,
            index: i,
        }
    }

    fn fitted(name: &str, dest: u8, operands: Vec<ExprValue>, imm: ImmValue) -> CodeItem {
        let iset = instruction_set().unwrap();
        let rec = iset.find_name(name).unwrap();
        let mut item = CodeItem::new(1, 0, rec.id, OperandType::Int64);
        item.dest = Some(gp(dest));
        item.operands = operands;
        fit_code(&mut item, iset, imm, JumpValue::None).unwrap();
        item
    }

    #[test]
    fn add_register_encoding_decodes_back() {
        let item = fitted(
            "add",
            0,
            vec![ExprValue::Reg(gp(0)), ExprValue::Reg(gp(1))],
            ImmValue::None,
        );
        let enc = encode_item(&item, instruction_set().unwrap(), ImmValue::None, JumpValue::None)
            .unwrap();
        assert_eq!(enc.words.len(), 1);
        assert!(enc.relocs.is_empty());

        let f = Fields::decode(enc.words[0]);
        assert_eq!(f.il, 1);
        assert_eq!(f.mode, 0);
        assert_eq!(f.op1, 8); // add
        assert_eq!(f.rd, 0);
        assert_eq!(f.rs, 0); // first source
        assert_eq!(f.rt, 1); // second source
        assert_eq!(f.mask, 7);
        let fmt = lookup_format(enc.words[0]).unwrap();
        assert_eq!(fmt.name, "A");
    }

    #[test]
    fn immediate_encoding_little_endian() {
        let item = fitted(
            "move",
            3,
            vec![ExprValue::Int(0x1234)],
            ImmValue::Int(0x1234),
        );
        let enc = encode_item(
            &item,
            instruction_set().unwrap(),
            ImmValue::Int(0x1234),
            JumpValue::None,
        )
        .unwrap();
        let fmt = lookup_format(enc.words[0]).unwrap();
        assert_eq!(fmt.name, "C");
        assert_eq!(enc.words[0] & 0xffff, 0x1234);
        assert_eq!((enc.words[0] >> 16) & 0x1f, 3);
    }

    #[test]
    fn symbolic_load_emits_address_reloc() {
        let iset = instruction_set().unwrap();
        let rec = iset.find_name("move").unwrap();
        let mut item = CodeItem::new(1, 0, rec.id, OperandType::Int32);
        item.dest = Some(gp(0));
        item.operands = vec![ExprValue::Mem(MemOperand {
            sym: Some("x".into()),
            ..MemOperand::default()
        })];
        fit_code(&mut item, iset, ImmValue::None, JumpValue::None).unwrap();
        let enc = encode_item(&item, iset, ImmValue::None, JumpValue::None).unwrap();
        assert_eq!(enc.words.len(), 3);
        assert_eq!(enc.relocs.len(), 1);
        let r = &enc.relocs[0];
        assert_eq!(r.spot, RelocSpot::Addr);
        assert_eq!(r.offset, 8);
        assert_eq!(r.size, RelocSize::B32);
        assert_eq!(r.sym, "x");
    }

    #[test]
    fn conditional_jump_encoding_carries_opj_in_im1() {
        let iset = instruction_set().unwrap();
        let rec = iset.find_name("jump_nzero").unwrap();
        let mut item = CodeItem::new(1, 0, rec.id, OperandType::Int64);
        item.dest = Some(gp(1));
        item.operands = vec![ExprValue::Reg(gp(1))];
        item.target = Some(SymRef {
            name: "loop".into(),
            addend: 0,
        });
        fit_code(&mut item, iset, ImmValue::None, JumpValue::Offset(-64)).unwrap();
        let enc =
            encode_item(&item, iset, ImmValue::None, JumpValue::Offset(-64)).unwrap();
        let fmt = lookup_format(enc.words[0]).unwrap();
        assert_eq!(fmt.name, "C.j");
        // OPJ = 1 (not zero) in IM1
        assert_eq!(fcom_asm::effective_opj(fmt, &enc.words), 1);
        // offset −64 bytes = −16 units in byte 1
        assert_eq!((enc.words[0] >> 8) & 0xff, (-16i8 as u8) as u32);
    }

    #[test]
    fn call_uses_template_d() {
        let iset = instruction_set().unwrap();
        let rec = iset.find_name("call").unwrap();
        let mut item = CodeItem::new(1, 0, rec.id, OperandType::Int64);
        item.target = Some(SymRef {
            name: "f".into(),
            addend: 0,
        });
        fit_code(&mut item, iset, ImmValue::None, JumpValue::Offset(0x100)).unwrap();
        let enc = encode_item(&item, iset, ImmValue::None, JumpValue::Offset(0x100)).unwrap();
        let fmt = lookup_format(enc.words[0]).unwrap();
        assert_eq!(fmt.name, "D.call");
        assert_eq!(enc.words[0] & 0x00ff_ffff, 0x40);
        assert_eq!(fcom_asm::effective_opj(fmt, &enc.words), 63);
    }
}
