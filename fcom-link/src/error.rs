use fcom_obj::ObjError;

/// Linker and relinker errors.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Object model failure.
    #[error(transparent)]
    Object(#[from] ObjError),
    /// Same strong symbol exported by two modules.
    #[error("duplicate symbol {symbol} in {first} and {second}")]
    DuplicateSymbol {
        /// Symbol name.
        symbol: String,
        /// First defining module.
        first: String,
        /// Second defining module.
        second: String,
    },
    /// An import never found an export.
    #[error("unresolved symbol {0}")]
    Unresolved(String),
    /// No entry symbol.
    #[error("entry symbol {0} not found")]
    NoEntry(String),
    /// Relocation value does not fit its field.
    #[error("relocation overflow on {symbol} in section {section}: value {value:#x}")]
    RelocationOverflow {
        /// Target symbol.
        symbol: String,
        /// Source section name.
        section: String,
        /// Value after scaling.
        value: i64,
    },
    /// The input executable cannot be split.
    #[error("input executable is not relinkable")]
    NotRelinkable,
    /// A module named for replacement or removal is absent.
    #[error("module {0} not found in the executable")]
    ModuleNotFound(String),
}
