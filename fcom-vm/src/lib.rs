//! Interpreting emulator for ForwardCom executables.
//!
//! Pure interpreter: fetch, decode through the shared instruction
//! tables, dispatch, and a permission-checked memory map. One thread,
//! program order, no speculation.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod error;
mod machine;
mod memory;
mod registers;

pub use error::{
    fp_exception, nan_code_f32, nan_code_f64, nan_payload_f32, nan_payload_f64, EmuError,
    Interrupt,
};
pub use machine::{Config, Emulator, ExitStatus};
pub use memory::{MapEntry, Memory, Perm, Purpose};
pub use registers::{spec, PerfCounters, Registers};
