//! Instruction encoding tables of the ForwardCom ISA.
//!
//! This crate is the single source of truth for the physical instruction
//! formats (templates A through E), the per-mnemonic instruction records,
//! and the fit masks used to pick the smallest encoding for a constant.
//! The assembler, the disassembler and the emulator all decode through the
//! tables defined here.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod fit;
mod float16;
mod format;
mod instruction;
mod slots;

pub use fit::{fit_address, fit_float, fit_int, fit_jump, FitMask};
pub use float16::{f16_to_f64, f64_to_f16};
pub use format::{
    effective_opj, exe_table, lookup_format, Fields, FieldsE, FormatCategory, FormatKey,
    FormatRecord, OpAvail, RuUse, Template, FORMAT_TABLE,
};
pub use format::{
    FMT_A, FMT_A_V, FMT_B, FMT_B_V, FMT_C, FMT_C_J, FMT_D_C, FMT_D_J, FMT_E2, FMT_E2_M, FMT_E2_V,
    FMT_E2_VM, FMT_E2_X, FMT_E3, FMT_E3_M, FMT_E_J,
};
pub use instruction::{
    instruction_set, Category, ImmStyle, InstructionRecord, InstructionSet, TableError,
    VariantFlags,
};
pub use instruction::{op1, op2, opj};
pub use slots::{operand_shape, plan_regs, OperandShape, RegSlot};
