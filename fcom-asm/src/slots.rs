//! Operand-to-field assignment.
//!
//! The encoder, the disassembler and the emulator must agree on which
//! instruction field holds which source operand. The rule, derived from
//! the operand-gather priority (immediate, memory, RT, RS, RU, RD):
//!
//! * register sources fill RS then RT, in operand order;
//! * when there is one more register source than RS/RT slots, the RD
//!   field doubles as the first source (for records with a destination,
//!   it must alias the destination register);
//! * the memory operand and the immediate always occupy their dedicated
//!   fields and come after the register sources in operand order;
//! * RU never carries a source operand (it is fallback or length).

use crate::format::{FormatRecord, OpAvail};
use crate::instruction::{Category, ImmStyle, InstructionRecord, VariantFlags};

/// A register-source position in word 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegSlot {
    /// The RD field, doubling as first source.
    Rd,
    /// The RS field.
    Rs,
    /// The RT field.
    Rt,
}

/// The operand mix a (record, format) pair implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandShape {
    /// Number of register source operands.
    pub n_regs: usize,
    /// The encoding carries an immediate operand.
    pub has_imm: bool,
    /// The encoding carries a second immediate (IM6 of a three-word
    /// form, `I2` variant).
    pub has_imm2: bool,
    /// A memory operand is a source.
    pub mem_source: bool,
    /// A memory operand is the destination (`M0` store forms).
    pub mem_dest: bool,
    /// The last operand is a jump target.
    pub has_target: bool,
}

/// Compute the operand shape of `rec` encoded in `fmt`.
///
/// The operand budget is spent in a fixed order so that encode and decode
/// agree: the jump target first, then the memory operand, then the
/// immediate (store forms never take one), and the remainder are register
/// sources. Returns `None` when the record cannot inhabit the format.
pub fn operand_shape(rec: &InstructionRecord, fmt: &FormatRecord) -> Option<OperandShape> {
    let mut budget = rec.num_operands as usize;

    let has_target = rec.category == Category::Jump;
    if has_target {
        if fmt.jump_size == 0 {
            return None;
        }
        budget = budget.checked_sub(1)?;
    }

    let fmt_mem = fmt.op_avail.contains(OpAvail::MEM);
    let mem_dest = fmt_mem && rec.variant.contains(VariantFlags::M0);
    let mem_source = fmt_mem && !mem_dest;
    if mem_source {
        budget = budget.checked_sub(1)?;
    }

    let mut has_imm = false;
    let mut has_imm2 = false;
    if !mem_dest {
        let imm_capable = fmt.imm_size > 0
            && fmt.op_avail.contains(OpAvail::IMM)
            && !matches!(rec.imm_style, ImmStyle::None | ImmStyle::Implicit);
        if imm_capable && budget > 0 {
            has_imm = true;
            budget -= 1;
            if rec.variant.contains(VariantFlags::I2) && budget > 0 {
                has_imm2 = true;
                budget -= 1;
            }
        }
    }

    let n_regs = budget;
    plan_regs(fmt, n_regs)?;
    Some(OperandShape {
        n_regs,
        has_imm,
        has_imm2,
        mem_source,
        mem_dest,
        has_target,
    })
}

/// Assign register sources to fields, in operand order.
///
/// Returns `None` when the format lacks the capacity.
pub fn plan_regs(fmt: &FormatRecord, n_regs: usize) -> Option<Vec<RegSlot>> {
    let mut avail = Vec::with_capacity(3);
    if fmt.op_avail.contains(OpAvail::RS) {
        avail.push(RegSlot::Rs);
    }
    if fmt.op_avail.contains(OpAvail::RT) {
        avail.push(RegSlot::Rt);
    }
    if n_regs <= avail.len() {
        avail.truncate(n_regs);
        return Some(avail);
    }
    if n_regs == avail.len() + 1 && fmt.op_avail.contains(OpAvail::RD) {
        let mut plan = Vec::with_capacity(n_regs);
        plan.push(RegSlot::Rd);
        plan.extend(avail);
        return Some(plan);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FMT_A, FMT_B, FMT_C, FMT_C_J, FMT_E_J, FORMAT_TABLE};
    use crate::instruction::instruction_set;

    #[test]
    fn register_plans() {
        let a = &FORMAT_TABLE[FMT_A];
        assert_eq!(plan_regs(a, 2), Some(vec![RegSlot::Rs, RegSlot::Rt]));
        assert_eq!(plan_regs(a, 1), Some(vec![RegSlot::Rs]));
        assert_eq!(
            plan_regs(a, 3),
            Some(vec![RegSlot::Rd, RegSlot::Rs, RegSlot::Rt])
        );
        assert_eq!(plan_regs(a, 4), None);

        let b = &FORMAT_TABLE[FMT_B];
        assert_eq!(plan_regs(b, 1), Some(vec![RegSlot::Rs]));
        assert_eq!(plan_regs(b, 2), Some(vec![RegSlot::Rd, RegSlot::Rs]));

        let c = &FORMAT_TABLE[FMT_C];
        assert_eq!(plan_regs(c, 1), Some(vec![RegSlot::Rd]));
        assert_eq!(plan_regs(c, 2), None);
    }

    #[test]
    fn shapes_match_formats() {
        let iset = instruction_set().unwrap();
        let add = iset.find_name("add").unwrap();

        let shape = operand_shape(add, &FORMAT_TABLE[FMT_A]).unwrap();
        assert_eq!(shape.n_regs, 2);
        assert!(!shape.has_imm);

        let shape = operand_shape(add, &FORMAT_TABLE[FMT_B]).unwrap();
        assert_eq!(shape.n_regs, 1);
        assert!(shape.has_imm);

        let jz = iset.find_name("jump_zero").unwrap();
        let shape = operand_shape(jz, &FORMAT_TABLE[FMT_C_J]).unwrap();
        assert_eq!(shape.n_regs, 1);
        assert!(shape.has_target && !shape.has_imm);

        let fused = iset.find_name("sub_jump_nzero").unwrap();
        let shape = operand_shape(fused, &FORMAT_TABLE[FMT_E_J]).unwrap();
        assert_eq!(shape.n_regs, 1);
        assert!(shape.has_target && shape.has_imm);
    }
}
