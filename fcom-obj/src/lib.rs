//! In-memory model and on-disk codec for the ForwardCom object-file format,
//! an ELF variant with extra base-pointer and relink metadata, plus the
//! `ar`-layout static library format.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod elf;
mod error;
mod library;
mod object;
mod relocation;
mod section;
mod symbol;

pub use elf::{FileHeader, FileType, ProgramHeader, SECTION_HEADER_SIZE, SYMBOL_RECORD_SIZE};
pub use error::ObjError;
pub use library::{Library, Member, AR_SIGNATURE, LONGNAMES_NAME, SYMDEF_NAME};
pub use object::ObjectFile;
pub use relocation::{RelocKind, RelocSize, Relocation};
pub use section::{RelinkMark, Section, SectionFlags, SectionType};
pub use symbol::{Symbol, SymbolBinding, SymbolFlags, SymbolTable, SymbolType};
