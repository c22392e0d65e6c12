use fcom_types::BasePointer;

/// Section content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[repr(u32)]
pub enum SectionType {
    /// Bytes present in the file.
    Progbits = 1,
    /// Uninitialized; occupies no file storage.
    Nobits = 2,
    /// Communal: duplicates of the same name are merged at link time.
    Comdat = 3,
    /// Symbol table pseudo-section (file layer only).
    Symtab = 4,
    /// Relocation table pseudo-section (file layer only).
    Rela = 5,
    /// String table pseudo-section (file layer only).
    Strtab = 6,
    /// Module-name string table pseudo-section (file layer only).
    Modstr = 7,
}

bitflags::bitflags! {
    /// Section attribute flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SectionFlags: u32 {
        /// Executable.
        const EXEC = 0x1;
        /// Readable.
        const READ = 0x2;
        /// Writable.
        const WRITE = 0x4;
        /// Addressed relative to the instruction pointer.
        const IP = 0x10;
        /// Addressed relative to DATAP.
        const DATAP = 0x20;
        /// Addressed relative to THREADP; thread-local.
        const THREADP = 0x40;
        /// No initialized data.
        const UNINIT = 0x100;
        /// Communal.
        const COMDAT = 0x200;
        /// May be split out and replaced by the relinker.
        const RELINKABLE = 0x400;
        /// Address is frozen; the linker must not move the section.
        const FIXED_ADDR = 0x800;
        /// Event handler table section.
        const EVENT_HAND = 0x1000;
        /// Debug information.
        const DEBUG_INFO = 0x2000;
        /// Comment section.
        const COMMENT = 0x4000;
        /// Generated by the linker.
        const AUTOGEN = 0x8000;
    }
}

impl SectionFlags {
    /// Which base pointer the section is addressed from.
    pub fn base_pointer(self) -> BasePointer {
        if self.contains(Self::THREADP) {
            BasePointer::Threadp
        } else if self.contains(Self::DATAP) {
            BasePointer::Datap
        } else if self.contains(Self::IP) {
            BasePointer::Ip
        } else {
            BasePointer::None
        }
    }
}

/// Scratch mark written by the relinker while splitting an executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RelinkMark {
    /// Not visited.
    #[default]
    None,
    /// Kept as-is.
    Preserved,
    /// Replaced by a user-supplied module.
    Replaced,
    /// Removed on user request.
    Removed,
}

/// An in-memory section.
#[derive(Debug, Clone, Default)]
pub struct Section {
    /// Section name.
    pub name: String,
    /// Content type. `Default` is not meaningful; the object model always
    /// sets it explicitly.
    pub sh_type: Option<SectionType>,
    /// Attribute flags.
    pub flags: SectionFlags,
    /// Assigned address, relative to the section's base pointer.
    pub addr: u64,
    /// Alignment as a power-of-two exponent, at most 12.
    pub align: u32,
    /// Initialized contents. Empty for nobits sections.
    pub data: Vec<u8>,
    /// Size of an uninitialized section; ignored when `data` is non-empty.
    pub nobits_size: u64,
    /// Name of the module this section came from, for relinkable output.
    pub module: String,
    /// Name of the library the module came from.
    pub library: String,
    /// Relinker scratch mark.
    pub relink: RelinkMark,
    /// Register-use mask, registers r0-r31.
    pub reguse1: u32,
    /// Register-use mask, vector registers.
    pub reguse2: u32,
}

impl Section {
    /// Section size in bytes, for either content type.
    pub fn size(&self) -> u64 {
        if self.sh_type == Some(SectionType::Nobits) {
            self.nobits_size
        } else {
            self.data.len() as u64
        }
    }

    /// Alignment in bytes.
    pub fn alignment(&self) -> u64 {
        1u64 << self.align
    }

    /// Whether the section holds code.
    pub fn is_code(&self) -> bool {
        self.flags.contains(SectionFlags::EXEC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_pointer_priority() {
        let f = SectionFlags::IP | SectionFlags::READ;
        assert_eq!(f.base_pointer(), BasePointer::Ip);
        let f = SectionFlags::DATAP | SectionFlags::WRITE;
        assert_eq!(f.base_pointer(), BasePointer::Datap);
        assert_eq!(SectionFlags::empty().base_pointer(), BasePointer::None);
    }

    #[test]
    fn nobits_size() {
        let mut s = Section {
            sh_type: Some(SectionType::Nobits),
            nobits_size: 128,
            ..Section::default()
        };
        assert_eq!(s.size(), 128);
        s.sh_type = Some(SectionType::Progbits);
        s.data = vec![0; 12];
        assert_eq!(s.size(), 12);
    }
}
