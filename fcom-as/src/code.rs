//! Instructions under construction.

use fcom_asm::FitMask;
use fcom_types::OperandType;

use crate::expr::{ExprValue, RegOperand, SymRef};

/// An instruction being assembled: operands plus encoding state that the
/// fitter and the convergence pass refine.
#[derive(Debug, Clone)]
pub struct CodeItem {
    /// Source line, for diagnostics.
    pub line: u32,
    /// Owning section index.
    pub section: u32,
    /// Offset within the section; assigned during convergence.
    pub address: u64,
    /// Instruction id in the instruction table.
    pub id: u32,
    /// Operand type.
    pub ot: OperandType,
    /// Destination register.
    pub dest: Option<RegOperand>,
    /// Mask register index.
    pub mask: Option<u8>,
    /// Fallback register index.
    pub fallback: Option<u8>,
    /// Source operands in syntactic order.
    pub operands: Vec<ExprValue>,
    /// Jump target.
    pub target: Option<SymRef>,
    /// Which representations the immediate operand fits.
    pub fit_imm: FitMask,
    /// Which representations the address offset fits.
    pub fit_addr: FitMask,
    /// Which representations the jump offset fits.
    pub fit_jump: FitMask,
    /// Chosen format-table index.
    pub chosen: Option<usize>,
    /// Encoded size in 32-bit words under the chosen format.
    pub words: u32,
    /// Force the larger encoding when the fit is uncertain.
    pub force_large: bool,
}

impl CodeItem {
    /// New item for the given instruction.
    pub fn new(line: u32, section: u32, id: u32, ot: OperandType) -> Self {
        Self {
            line,
            section,
            address: 0,
            id,
            ot,
            dest: None,
            mask: None,
            fallback: None,
            operands: Vec::new(),
            target: None,
            fit_imm: FitMask::empty(),
            fit_addr: FitMask::empty(),
            fit_jump: FitMask::empty(),
            chosen: None,
            words: 1,
            force_large: false,
        }
    }

    /// Encoded size in bytes.
    pub fn byte_size(&self) -> u64 {
        u64::from(self.words) * 4
    }
}
