use crate::ObjError;

/// Symbol binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum SymbolBinding {
    /// Visible in the defining module only.
    Local = 0,
    /// Exported.
    Global = 1,
    /// Exported, loses against a global of the same name.
    Weak = 2,
    /// Imported; not yet matched to an export.
    Unresolved = 3,
}

/// Symbol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum SymbolType {
    /// Untyped.
    None = 0,
    /// Names a section.
    Section = 1,
    /// Function entry.
    Function = 2,
    /// Data object.
    Object = 3,
    /// Assemble-time constant; `value` is the constant itself.
    Constant = 4,
    /// Source file name.
    File = 5,
    /// Communal data, merged by name at link time.
    Common = 6,
}

bitflags::bitflags! {
    /// Symbol attribute flags (the `st_other` field).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SymbolFlags: u16 {
        /// Addressed relative to the instruction pointer.
        const IP = 0x1;
        /// Addressed relative to DATAP.
        const DATAP = 0x2;
        /// Addressed relative to THREADP.
        const THREADP = 0x4;
        /// Executable.
        const EXEC = 0x8;
        /// Readable.
        const READ = 0x10;
        /// Writable.
        const WRITE = 0x20;
        /// Floating point constant.
        const FLOAT = 0x40;
        /// String constant.
        const STRING = 0x80;
        /// Communal.
        const COMMON = 0x100;
        /// Register-use masks are populated.
        const REGUSE = 0x200;
    }
}

/// An in-memory symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    /// Symbol name.
    pub name: String,
    /// Defining section index, or `None` for absolute and imported
    /// symbols.
    pub section: Option<u32>,
    /// Offset within the defining section, or the absolute value.
    pub value: u64,
    /// Element size in bytes.
    pub unit_size: u32,
    /// Number of elements.
    pub unit_count: u32,
    /// Binding.
    pub binding: SymbolBinding,
    /// Type.
    pub sym_type: SymbolType,
    /// Attribute flags.
    pub flags: SymbolFlags,
    /// Register-use mask for r0-r31 when the symbol is a function.
    pub reguse1: u32,
    /// Register-use mask for v0-v31.
    pub reguse2: u32,
}

impl Symbol {
    /// Total size in bytes.
    pub fn size(&self) -> u64 {
        u64::from(self.unit_size) * u64::from(self.unit_count)
    }

    /// A fresh unresolved import.
    pub fn import(name: &str) -> Self {
        Self {
            name: name.to_string(),
            section: None,
            value: 0,
            unit_size: 0,
            unit_count: 0,
            binding: SymbolBinding::Unresolved,
            sym_type: SymbolType::None,
            flags: SymbolFlags::empty(),
            reguse1: 0,
            reguse2: 0,
        }
    }
}

/// Symbol list kept sorted by name.
///
/// Indices into this table are invalidated by every mutation; holders must
/// store the symbol name and re-look it up, never a saved index.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    /// Find a symbol by name.
    pub fn find(&self, name: &str) -> Option<&Symbol> {
        let i = self.position(name)?;
        Some(&self.symbols[i])
    }

    /// Find a symbol by name, mutably.
    pub fn find_mut(&mut self, name: &str) -> Option<&mut Symbol> {
        let i = self.position(name)?;
        Some(&mut self.symbols[i])
    }

    /// Position of a symbol in name order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.symbols
            .binary_search_by(|s| s.name.as_str().cmp(name))
            .ok()
    }

    /// Insert a new symbol. Fails if a symbol of the same name exists.
    pub fn insert(&mut self, symbol: Symbol) -> Result<(), ObjError> {
        match self
            .symbols
            .binary_search_by(|s| s.name.cmp(&symbol.name))
        {
            Ok(_) => Err(ObjError::DuplicateSymbol(symbol.name)),
            Err(pos) => {
                self.symbols.insert(pos, symbol);
                Ok(())
            }
        }
    }

    /// Insert or overwrite.
    pub fn upsert(&mut self, symbol: Symbol) {
        match self
            .symbols
            .binary_search_by(|s| s.name.cmp(&symbol.name))
        {
            Ok(pos) => self.symbols[pos] = symbol,
            Err(pos) => self.symbols.insert(pos, symbol),
        }
    }

    /// Remove a symbol by name.
    pub fn remove(&mut self, name: &str) -> Option<Symbol> {
        let i = self.position(name)?;
        Some(self.symbols.remove(i))
    }

    /// Symbols in name order, as a slice.
    pub fn as_slice(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Mutable access in name order. The caller must not change names.
    pub fn as_mut_slice(&mut self) -> &mut [Symbol] {
        &mut self.symbols
    }
}

impl FromIterator<Symbol> for SymbolTable {
    fn from_iter<T: IntoIterator<Item = Symbol>>(iter: T) -> Self {
        let mut symbols: Vec<Symbol> = iter.into_iter().collect();
        symbols.sort_by(|a, b| a.name.cmp(&b.name));
        Self { symbols }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str) -> Symbol {
        Symbol::import(name)
    }

    #[test]
    fn table_stays_sorted() {
        let mut t = SymbolTable::new();
        for n in ["zeta", "alpha", "mid"] {
            t.insert(sym(n)).unwrap();
        }
        let names: Vec<_> = t.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
        assert!(t.find("mid").is_some());
        assert!(t.find("nope").is_none());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut t = SymbolTable::new();
        t.insert(sym("f")).unwrap();
        assert_eq!(
            t.insert(sym("f")),
            Err(ObjError::DuplicateSymbol("f".into()))
        );
    }

    #[test]
    fn remove_and_upsert() {
        let mut t: SymbolTable = ["a", "b", "c"].into_iter().map(sym).collect();
        assert!(t.remove("b").is_some());
        assert_eq!(t.len(), 2);
        let mut replacement = sym("a");
        replacement.value = 7;
        t.upsert(replacement);
        assert_eq!(t.find("a").unwrap().value, 7);
        assert_eq!(t.len(), 2);
    }
}
