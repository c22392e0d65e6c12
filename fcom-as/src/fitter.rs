//! The code fitter: choose the smallest format that satisfies every
//! operand constraint of an instruction.

use fcom_asm::{
    fit_float, fit_int, fit_jump, operand_shape, plan_regs, Category, FitMask, InstructionSet,
    RegSlot, RuUse, VariantFlags, FORMAT_TABLE,
};

use crate::code::CodeItem;
use crate::expr::{ExprValue, RegClass};

/// Resolved state of the immediate operand for one fit round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImmValue {
    /// No immediate operand.
    None,
    /// Known integer.
    Int(i64),
    /// Known float.
    Float(f64),
    /// Symbolic; a relocation record will be needed.
    Reloc,
    /// Forward reference still unresolved in this round.
    Unknown,
}

/// Resolved state of the jump target for one fit round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JumpValue {
    /// Not a jump.
    None,
    /// Offset in bytes from the end of the instruction.
    Offset(i64),
    /// Target in another section; a relocation record will be needed.
    Reloc,
    /// Forward reference with no address estimate yet.
    Unknown,
}

/// Why no format fits.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum FitError {
    /// The instruction id is not in the table.
    #[error("unknown instruction id {0}")]
    UnknownInstruction(u32),
    /// Wrong number of operands.
    #[error("wrong number of operands: expected {expected}, found {found}")]
    OperandCount {
        /// Expected source operand count.
        expected: u8,
        /// Found source operand count.
        found: u8,
    },
    /// An operand kind no candidate format accepts.
    #[error("operand mix not supported by any format of this instruction")]
    OperandType,
    /// The immediate cannot be represented.
    #[error("immediate out of range for every format")]
    ImmediateRange,
    /// The operand type is not permitted for this instruction.
    #[error("operand type not permitted in {0} context")]
    BadOperandType(&'static str),
    /// Register class mismatch.
    #[error("register class mismatch")]
    RegisterClass,
    /// The jump offset cannot be represented.
    #[error("jump target out of range")]
    JumpRange,
}

/// Outcome of a successful fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fit {
    /// Format-table index.
    pub format: usize,
    /// Encoded size in words.
    pub words: u32,
    /// Number of relocation records the encoding will need.
    pub relocs: u32,
}

/// Choose a format for `item`, updating its fit masks, chosen format and
/// size. `imm` and `jump` carry the operand values as resolved so far in
/// the current convergence round.
pub fn fit_code(
    item: &mut CodeItem,
    iset: &InstructionSet,
    imm: ImmValue,
    jump: JumpValue,
) -> Result<Fit, FitError> {
    let rec = iset
        .find_id(item.id)
        .ok_or(FitError::UnknownInstruction(item.id))?;

    // operand census
    let n_found = item.operands.len() as u8 + u8::from(item.target.is_some());
    if n_found != rec.num_operands {
        return Err(FitError::OperandCount {
            expected: rec.num_operands,
            found: n_found,
        });
    }
    let actual_regs = item
        .operands
        .iter()
        .filter(|o| matches!(o, ExprValue::Reg(_)))
        .count();
    let actual_imm = imm != ImmValue::None;
    let mem = item.operands.iter().find_map(|o| match o {
        ExprValue::Mem(m) => Some(m),
        _ => None,
    });
    let is_vector = item
        .dest
        .map(|d| d.class == RegClass::Vec)
        .unwrap_or(false)
        || item
            .operands
            .iter()
            .any(|o| matches!(o, ExprValue::Reg(r) if r.class == RegClass::Vec));

    // operand-type permission
    let ot_bit = 1u16 << (item.ot as u8);
    let ot_allowed = if is_vector {
        rec.optypes_vec
    } else {
        rec.optypes_gp
    };
    if ot_allowed & ot_bit == 0 {
        return Err(FitError::BadOperandType(if is_vector {
            "vector"
        } else {
            "general purpose"
        }));
    }

    // fit masks for this round
    item.fit_imm = match imm {
        ImmValue::None => FitMask::empty(),
        ImmValue::Int(v) => fit_int(v),
        ImmValue::Float(v) => fit_float(v),
        ImmValue::Reloc => FitMask::RELOC,
        ImmValue::Unknown => {
            if item.force_large {
                FitMask::RELOC | FitMask::LARGE
            } else {
                FitMask::RELOC
            }
        }
    };
    item.fit_jump = match jump {
        JumpValue::None => FitMask::empty(),
        JumpValue::Offset(v) => fit_jump(v),
        JumpValue::Reloc => FitMask::RELOC,
        JumpValue::Unknown => {
            if item.force_large {
                FitMask::LARGE
            } else {
                // optimistic until the convergence pass proves otherwise
                FitMask::I8 | FitMask::I16 | FitMask::I24
            }
        }
    };
    item.fit_addr = match mem {
        None => FitMask::empty(),
        Some(m) if m.sym.is_some() => FitMask::RELOC,
        Some(m) => fcom_asm::fit_address(m.offset),
    };

    // whether the 32-bit address field of E3.m is actually reachable for
    // this operand mix; if not, a 16-bit relocation has to do
    let wide_addr_ok = !is_vector
        && rec.allows_format(fcom_asm::FMT_E3_M)
        && operand_shape(rec, &FORMAT_TABLE[fcom_asm::FMT_E3_M]).is_some_and(|s| {
            s.n_regs == actual_regs
                && s.has_imm == actual_imm
                && (s.mem_source || s.mem_dest)
        });

    let mut best: Option<Fit> = None;
    let mut saw_shape_failure = false;
    let mut saw_class_failure = false;
    let mut saw_imm_failure = false;
    let mut saw_jump_failure = false;

    for (index, fmt) in FORMAT_TABLE.iter().enumerate() {
        if !rec.allows_format(index) {
            continue;
        }
        if rec.category == Category::Multi && fmt.vector != is_vector {
            continue;
        }
        let Some(shape) = operand_shape(rec, fmt) else {
            saw_shape_failure = true;
            continue;
        };
        if shape.n_regs != actual_regs
            || shape.has_imm != actual_imm
            || (shape.mem_source || shape.mem_dest) != mem.is_some()
        {
            saw_shape_failure = true;
            continue;
        }

        // register placement and classes
        let plan = match plan_regs(fmt, shape.n_regs) {
            Some(p) => p,
            None => {
                saw_shape_failure = true;
                continue;
            }
        };
        if plan.first() == Some(&RegSlot::Rd)
            && !rec.variant.contains(VariantFlags::D0)
            && item.dest != first_reg(item)
        {
            saw_shape_failure = true;
            continue;
        }
        if rec.category != Category::Single && !reg_classes_match(item, fmt.vector) {
            saw_class_failure = true;
            continue;
        }
        if item.mask.is_some() && !fmt.has_mask() {
            saw_shape_failure = true;
            continue;
        }
        if item.fallback.is_some() && fmt.ru_use != RuUse::Fallback {
            saw_shape_failure = true;
            continue;
        }

        let mut relocs = 0u32;

        // immediate field
        if shape.has_imm {
            let unsigned = rec.variant.contains(VariantFlags::U0);
            if item.fit_imm.intersects(FitMask::RELOC) {
                if fmt.imm_size < 2
                    || (item.fit_imm.contains(FitMask::LARGE) && fmt.imm_size < 4)
                {
                    saw_imm_failure = true;
                    continue;
                }
                relocs += 1;
            } else {
                let needed = imm_capacity(fmt.imm_size, unsigned, item.ot.is_float());
                if !item.fit_imm.intersects(needed) {
                    saw_imm_failure = true;
                    continue;
                }
            }
        }

        // memory operand
        if let Some(m) = mem {
            if m.sym.is_some() {
                // symbolic addresses prefer the 32-bit field when it can
                // hold this operand mix
                if fmt.addr_size < 4 && wide_addr_ok {
                    saw_imm_failure = true;
                    continue;
                }
                relocs += 1;
            } else {
                let needed = match fmt.addr_size {
                    2 => FitMask::I16,
                    4 => FitMask::I32,
                    _ => {
                        saw_shape_failure = true;
                        continue;
                    }
                };
                let ok = if fmt.scale {
                    let size = i64::from(item.ot.data_size());
                    m.offset % size == 0
                        && fcom_asm::fit_address(m.offset / size).intersects(needed)
                } else {
                    item.fit_addr.intersects(needed)
                };
                if !ok {
                    saw_imm_failure = true;
                    continue;
                }
            }
            if m.length.is_some() && fmt.ru_use != RuUse::Length {
                saw_shape_failure = true;
                continue;
            }
        }

        // jump field
        if rec.category == Category::Jump {
            let ok = if item.fit_jump.contains(FitMask::RELOC)
                || item.fit_jump.contains(FitMask::LARGE)
            {
                fmt.jump_size >= 3
            } else {
                let needed = match fmt.jump_size {
                    1 => FitMask::I8,
                    3 => FitMask::I8 | FitMask::I16 | FitMask::I24,
                    _ => FitMask::empty(),
                };
                item.fit_jump.intersects(needed)
            };
            if !ok {
                saw_jump_failure = true;
                continue;
            }
            if item.fit_jump.contains(FitMask::RELOC) {
                relocs += 1;
            }
        }

        let candidate = Fit {
            format: index,
            words: fmt.word_size(),
            relocs,
        };
        let better = match best {
            None => true,
            Some(b) => (candidate.words, candidate.relocs) < (b.words, b.relocs),
        };
        if better {
            best = Some(candidate);
        }
    }

    match best {
        Some(fit) => {
            item.chosen = Some(fit.format);
            item.words = fit.words;
            Ok(fit)
        }
        None => Err(if saw_jump_failure {
            FitError::JumpRange
        } else if saw_imm_failure {
            FitError::ImmediateRange
        } else if saw_class_failure {
            FitError::RegisterClass
        } else if saw_shape_failure {
            FitError::OperandType
        } else {
            FitError::OperandType
        }),
    }
}

fn first_reg(item: &CodeItem) -> Option<crate::expr::RegOperand> {
    item.operands.iter().find_map(|o| match o {
        ExprValue::Reg(r) => Some(*r),
        _ => None,
    })
}

fn reg_classes_match(item: &CodeItem, vector: bool) -> bool {
    item.operands.iter().all(|o| match o {
        ExprValue::Reg(r) => (r.class == RegClass::Vec) == vector,
        _ => true,
    })
}

fn imm_capacity(imm_size: u8, unsigned: bool, float_ot: bool) -> FitMask {
    match imm_size {
        1 => {
            if unsigned {
                FitMask::I8 | FitMask::U8
            } else {
                FitMask::I8
            }
        }
        2 => {
            let mut m = FitMask::I16;
            if unsigned {
                m |= FitMask::U16;
            }
            if float_ot {
                m |= FitMask::F16;
            }
            m
        }
        4 => {
            let mut m = FitMask::I32;
            if unsigned {
                m |= FitMask::U32;
            }
            if float_ot {
                m |= FitMask::F32;
            }
            m
        }
        _ => FitMask::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ExprValue, RegOperand, SymRef};
    use fcom_asm::{instruction_set, FMT_A, FMT_B, FMT_C, FMT_C_J, FMT_E3, FMT_E_J};
    use fcom_types::OperandType;

    fn gp(i: u8) -> RegOperand {
        RegOperand {
            class: RegClass::Gp,
            index: i,
        }
    }

    fn item_for(name: &str) -> CodeItem {
        let iset = instruction_set().unwrap();
        let rec = iset.find_name(name).unwrap();
        CodeItem::new(1, 0, rec.id, OperandType::Int64)
    }

    #[test]
    fn three_register_add_uses_template_a() {
        let mut item = item_for("add");
        item.dest = Some(gp(0));
        item.operands = vec![ExprValue::Reg(gp(0)), ExprValue::Reg(gp(1))];
        let fit = fit_code(
            &mut item,
            instruction_set().unwrap(),
            ImmValue::None,
            JumpValue::None,
        )
        .unwrap();
        assert_eq!(fit.format, FMT_A);
        assert_eq!(fit.words, 1);
        assert_eq!(fit.relocs, 0);
    }

    #[test]
    fn small_immediate_uses_template_b() {
        let mut item = item_for("add");
        item.dest = Some(gp(0));
        item.operands = vec![ExprValue::Reg(gp(1)), ExprValue::Int(5)];
        let fit = fit_code(
            &mut item,
            instruction_set().unwrap(),
            ImmValue::Int(5),
            JumpValue::None,
        )
        .unwrap();
        assert_eq!(fit.format, FMT_B);
    }

    #[test]
    fn wide_immediate_grows_the_format() {
        let iset = instruction_set().unwrap();
        // dest aliases src1, so template C (rd + imm16) is in play
        let mut item = item_for("add");
        item.dest = Some(gp(0));
        item.operands = vec![ExprValue::Reg(gp(0)), ExprValue::Int(0x1234)];
        let fit = fit_code(&mut item, iset, ImmValue::Int(0x1234), JumpValue::None).unwrap();
        assert_eq!(fit.format, FMT_C);
        assert_eq!(fit.words, 1);

        // 32-bit immediate forces the three-word E3 format
        let mut item = item_for("add");
        item.dest = Some(gp(0));
        item.operands = vec![ExprValue::Reg(gp(0)), ExprValue::Int(0x1234_5678)];
        let fit = fit_code(&mut item, iset, ImmValue::Int(0x1234_5678), JumpValue::None).unwrap();
        assert_eq!(fit.format, FMT_E3);
        assert_eq!(fit.words, 3);
    }

    #[test]
    fn fitter_minimality_no_smaller_format_fits() {
        // 0x80 does not fit i8; B must be rejected, C chosen
        let iset = instruction_set().unwrap();
        let mut item = item_for("add");
        item.dest = Some(gp(0));
        item.operands = vec![ExprValue::Reg(gp(0)), ExprValue::Int(0x80)];
        let fit = fit_code(&mut item, iset, ImmValue::Int(0x80), JumpValue::None).unwrap();
        assert_eq!(fit.format, FMT_C);
    }

    #[test]
    fn near_jump_uses_one_word() {
        let iset = instruction_set().unwrap();
        let mut item = item_for("jump_nzero");
        item.dest = Some(gp(1));
        item.operands = vec![ExprValue::Reg(gp(1))];
        item.target = Some(SymRef {
            name: "loop".into(),
            addend: 0,
        });
        let fit = fit_code(&mut item, iset, ImmValue::None, JumpValue::Offset(-64)).unwrap();
        assert_eq!(fit.format, FMT_C_J);

        let fit =
            fit_code(&mut item, iset, ImmValue::None, JumpValue::Offset(-100_000)).unwrap();
        assert_eq!(fit.format, FMT_E_J);
        assert_eq!(fit.words, 2);
    }

    #[test]
    fn force_large_pins_the_wider_jump() {
        let iset = instruction_set().unwrap();
        let mut item = item_for("jump_zero");
        item.dest = Some(gp(3));
        item.operands = vec![ExprValue::Reg(gp(3))];
        item.target = Some(SymRef {
            name: "fwd".into(),
            addend: 0,
        });
        item.force_large = true;
        let fit = fit_code(&mut item, iset, ImmValue::None, JumpValue::Unknown).unwrap();
        assert_eq!(fit.format, FMT_E_J);
    }

    #[test]
    fn fused_jump_takes_register_and_immediate() {
        let iset = instruction_set().unwrap();
        let mut item = item_for("sub_jump_nzero");
        item.dest = Some(gp(1));
        item.operands = vec![ExprValue::Reg(gp(1)), ExprValue::Int(1)];
        item.target = Some(SymRef {
            name: "loop".into(),
            addend: 0,
        });
        let fit = fit_code(&mut item, iset, ImmValue::Int(1), JumpValue::Offset(-40)).unwrap();
        assert_eq!(fit.format, FMT_E_J);
    }

    #[test]
    fn operand_count_is_checked() {
        let iset = instruction_set().unwrap();
        let mut item = item_for("add");
        item.dest = Some(gp(0));
        item.operands = vec![ExprValue::Reg(gp(0))];
        assert_eq!(
            fit_code(&mut item, iset, ImmValue::None, JumpValue::None),
            Err(FitError::OperandCount {
                expected: 2,
                found: 1
            })
        );
    }

    #[test]
    fn float_ot_rejected_for_integer_only_instruction() {
        let iset = instruction_set().unwrap();
        let mut item = item_for("and");
        item.ot = OperandType::Double;
        item.dest = Some(gp(0));
        item.operands = vec![ExprValue::Reg(gp(0)), ExprValue::Reg(gp(1))];
        assert!(matches!(
            fit_code(&mut item, iset, ImmValue::None, JumpValue::None),
            Err(FitError::BadOperandType(_))
        ));
    }

    #[test]
    fn memory_load_with_symbol_uses_wide_offset() {
        let iset = instruction_set().unwrap();
        let mut item = item_for("move");
        item.ot = OperandType::Int32;
        item.dest = Some(gp(0));
        item.operands = vec![ExprValue::Mem(crate::expr::MemOperand {
            sym: Some("x".into()),
            ..crate::expr::MemOperand::default()
        })];
        let fit = fit_code(&mut item, iset, ImmValue::None, JumpValue::None).unwrap();
        assert_eq!(fit.format, fcom_asm::FMT_E3_M);
        assert_eq!(fit.relocs, 1);
    }
}
