use crate::relocation::RelocSize;

/// Errors of the object model and the library manager.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ObjError {
    /// File too short or with inconsistent offsets.
    #[error("malformed object file: {0}")]
    Malformed(&'static str),
    /// Bad magic bytes.
    #[error("not a ForwardCom object file")]
    BadMagic,
    /// A table index points outside its table.
    #[error("{table} index {index} out of range")]
    IndexRange {
        /// Which table.
        table: &'static str,
        /// The offending index.
        index: u64,
    },
    /// A string table offset points outside the table.
    #[error("string table offset {0:#x} out of range")]
    StringRange(u64),
    /// A string table grew past the 32-bit offset space.
    #[error("string table overflow")]
    StringOverflow,
    /// Symbol not found.
    #[error("symbol {0} not found")]
    SymbolNotFound(String),
    /// Two strong definitions of one symbol.
    #[error("duplicate symbol {0}")]
    DuplicateSymbol(String),
    /// A relocation value does not fit its size selector.
    #[error("relocation overflow: value {value:#x} does not fit {size:?}")]
    RelocationOverflow {
        /// Value after scaling.
        value: i64,
        /// Target field size.
        size: RelocSize,
    },
    /// A relocation size selector does not match the target field.
    #[error("bad relocation size at section {section} offset {offset:#x}")]
    RelocationSize {
        /// Source section index.
        section: u32,
        /// Source offset.
        offset: u64,
    },
    /// Corrupt library archive.
    #[error("corrupt library: {0}")]
    CorruptLibrary(&'static str),
    /// Library member not found for delete or extract.
    #[error("library member {0} not found")]
    MemberNotFound(String),
    /// Same member name given twice in one command.
    #[error("duplicate member name {0} on command line")]
    DuplicateMember(String),
    /// Alignment not a power-of-two exponent within range.
    #[error("alignment 2^{0} exceeds the maximum of 4096")]
    BadAlignment(u32),
}
