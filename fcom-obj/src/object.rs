//! The in-memory object file and its binary codec.

use tracing::debug;

use crate::elf::{
    string_at, FileHeader, FileType, ProgramHeader, RawRelocation, RawSectionHeader, RawSymbol,
    StringPool, FILE_HEADER_SIZE, PROGRAM_HEADER_SIZE, RELOCATION_RECORD_SIZE,
    SECTION_HEADER_SIZE, SYMBOL_RECORD_SIZE,
};
use crate::{
    ObjError, RelinkMark, Relocation, Section, SectionFlags, SectionType, Symbol, SymbolBinding,
    SymbolFlags, SymbolTable, SymbolType,
};

/// A complete object module or executable.
#[derive(Debug, Clone, Default)]
pub struct ObjectFile {
    /// Object or executable.
    pub is_executable: bool,
    /// Entry point, IP-base relative.
    pub entry: u64,
    /// IP base address.
    pub ip_base: u64,
    /// DATAP base address.
    pub datap_base: u64,
    /// THREADP base address.
    pub threadp_base: u64,
    /// The executable needs load-time fixups.
    pub relocate: bool,
    /// The executable carries relink metadata.
    pub relinkable: bool,
    /// Sections, in placement order.
    pub sections: Vec<Section>,
    /// Symbols, sorted by name.
    pub symbols: SymbolTable,
    /// Relocations, grouped by source section at write time.
    pub relocations: Vec<Relocation>,
    /// Program headers; executables only.
    pub program_headers: Vec<ProgramHeader>,
}

impl ObjectFile {
    /// Empty relocatable module.
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a section index by name.
    pub fn section_index(&self, name: &str) -> Option<u32> {
        self.sections
            .iter()
            .position(|s| s.name == name)
            .map(|i| i as u32)
    }

    /// Append a section and return its index.
    pub fn add_section(&mut self, section: Section) -> u32 {
        self.sections.push(section);
        (self.sections.len() - 1) as u32
    }

    /// Relocations whose source is section `index`, in offset order.
    pub fn relocations_of(&self, index: u32) -> Vec<&Relocation> {
        let mut rels: Vec<&Relocation> = self
            .relocations
            .iter()
            .filter(|r| r.section == index)
            .collect();
        rels.sort_by_key(|r| r.offset);
        rels
    }

    /// Parse a file image.
    pub fn read(data: &[u8]) -> Result<Self, ObjError> {
        let header = FileHeader::parse(data)?;
        let sh_count = header.sh_count as usize;
        let sh_base = usize::try_from(header.sh_offset)
            .map_err(|_| ObjError::Malformed("section table offset"))?;
        if sh_base
            .checked_add(sh_count * SECTION_HEADER_SIZE)
            .is_none_or_out_of(data.len())
        {
            return Err(ObjError::Malformed("section table out of range"));
        }

        let mut raws = Vec::with_capacity(sh_count);
        for i in 0..sh_count {
            raws.push(RawSectionHeader::parse(data, sh_base + i * SECTION_HEADER_SIZE)?);
        }

        // string tables first; everything else derives names from them
        let strtab = table_bytes(data, &raws, SectionType::Strtab)?.unwrap_or_default();
        let modstr = table_bytes(data, &raws, SectionType::Modstr)?.unwrap_or_default();

        let mut obj = Self {
            is_executable: header.file_type == FileType::Executable,
            entry: header.entry,
            ip_base: header.ip_base,
            datap_base: header.datap_base,
            threadp_base: header.threadp_base,
            relocate: header.flags & crate::elf::FLAG_RELOCATE != 0,
            relinkable: header.flags & crate::elf::FLAG_RELINKABLE != 0,
            ..Self::default()
        };

        // real sections, remembering the disk index of each
        let mut disk_to_mem = vec![u32::MAX; sh_count];
        for (disk_index, raw) in raws.iter().enumerate() {
            let Some(sh_type) = SectionType::from_repr(raw.sh_type) else {
                return Err(ObjError::Malformed("unknown section type"));
            };
            if !matches!(
                sh_type,
                SectionType::Progbits | SectionType::Nobits | SectionType::Comdat
            ) {
                continue;
            }
            if raw.align > 12 {
                return Err(ObjError::BadAlignment(raw.align));
            }
            let data_bytes = if sh_type == SectionType::Nobits {
                Vec::new()
            } else {
                slice_at(data, raw.offset, raw.size)?.to_vec()
            };
            let section = Section {
                name: string_at(&strtab, raw.name)?,
                sh_type: Some(sh_type),
                flags: SectionFlags::from_bits_truncate(raw.flags),
                addr: raw.addr,
                align: raw.align,
                data: data_bytes,
                nobits_size: if sh_type == SectionType::Nobits {
                    raw.size
                } else {
                    0
                },
                module: string_at(&modstr, raw.module)?,
                library: string_at(&modstr, raw.library)?,
                relink: relink_from_u32(raw.relink),
                reguse1: raw.reguse1,
                reguse2: raw.reguse2,
            };
            disk_to_mem[disk_index] = obj.sections.len() as u32;
            obj.sections.push(section);
        }

        // symbols
        let mut symbol_order: Vec<String> = Vec::new();
        if let Some(bytes) = table_bytes(data, &raws, SectionType::Symtab)? {
            let count = bytes.len() / SYMBOL_RECORD_SIZE;
            for i in 0..count {
                let raw = RawSymbol::parse(bytes, i * SYMBOL_RECORD_SIZE)?;
                let section = match raw.section {
                    0 => None,
                    disk => {
                        let disk = disk as usize - 1;
                        let mem = disk_to_mem
                            .get(disk)
                            .copied()
                            .filter(|&m| m != u32::MAX)
                            .ok_or(ObjError::IndexRange {
                                table: "section",
                                index: disk as u64,
                            })?;
                        Some(mem)
                    }
                };
                let symbol = Symbol {
                    name: string_at(&strtab, raw.name)?,
                    section,
                    value: raw.value,
                    unit_size: raw.unit_size,
                    unit_count: raw.unit_count,
                    binding: SymbolBinding::from_repr(raw.bind)
                        .ok_or(ObjError::Malformed("bad symbol binding"))?,
                    sym_type: SymbolType::from_repr(raw.sym_type)
                        .ok_or(ObjError::Malformed("bad symbol type"))?,
                    flags: SymbolFlags::from_bits_truncate(raw.other),
                    reguse1: raw.reguse1,
                    reguse2: raw.reguse2,
                };
                symbol_order.push(symbol.name.clone());
                obj.symbols.upsert(symbol);
            }
        }

        // relocations
        for raw in &raws {
            if raw.sh_type != SectionType::Rela as u32 {
                continue;
            }
            let target = disk_to_mem
                .get(raw.module as usize)
                .copied()
                .filter(|&m| m != u32::MAX)
                .ok_or(ObjError::IndexRange {
                    table: "section",
                    index: u64::from(raw.module),
                })?;
            let bytes = slice_at(data, raw.offset, raw.size)?;
            let count = bytes.len() / RELOCATION_RECORD_SIZE;
            for i in 0..count {
                let rr = RawRelocation::parse(bytes, i * RELOCATION_RECORD_SIZE)?;
                let sym = symbol_order
                    .get(rr.sym as usize)
                    .cloned()
                    .ok_or(ObjError::IndexRange {
                        table: "symbol",
                        index: u64::from(rr.sym),
                    })?;
                let ref_sym = match rr.ref_sym {
                    0 => None,
                    n => Some(symbol_order.get(n as usize - 1).cloned().ok_or(
                        ObjError::IndexRange {
                            table: "symbol",
                            index: u64::from(n - 1),
                        },
                    )?),
                };
                let (kind, size, scale, load_time) = Relocation::parse_type_field(rr.r_type)?;
                obj.relocations.push(Relocation {
                    section: target,
                    offset: rr.offset,
                    sym,
                    ref_sym,
                    addend: rr.addend,
                    kind,
                    size,
                    scale,
                    load_time,
                });
            }
        }

        // program headers
        let ph_base = usize::try_from(header.ph_offset)
            .map_err(|_| ObjError::Malformed("program table offset"))?;
        for i in 0..header.ph_count as usize {
            obj.program_headers
                .push(ProgramHeader::parse(data, ph_base + i * PROGRAM_HEADER_SIZE)?);
        }

        debug!(
            sections = obj.sections.len(),
            symbols = obj.symbols.len(),
            relocations = obj.relocations.len(),
            "object file read"
        );
        Ok(obj)
    }

    /// Serialize to a file image.
    ///
    /// Sections are written in header order, relocation tables after the
    /// section data, and the string tables last.
    pub fn write(&self) -> Result<Vec<u8>, ObjError> {
        let mut strtab = StringPool::new();
        let mut modstr = StringPool::new();

        // symbol indices on disk follow the sorted in-memory order
        let symbol_index = |name: &str| -> Result<u32, ObjError> {
            self.symbols
                .position(name)
                .map(|p| p as u32)
                .ok_or_else(|| ObjError::SymbolNotFound(name.to_string()))
        };

        // relocations grouped per source section
        let mut rela_groups: Vec<(u32, Vec<&Relocation>)> = Vec::new();
        for (index, _) in self.sections.iter().enumerate() {
            let group = self.relocations_of(index as u32);
            if !group.is_empty() {
                rela_groups.push((index as u32, group));
            }
        }
        for r in &self.relocations {
            if r.section as usize >= self.sections.len() {
                return Err(ObjError::IndexRange {
                    table: "section",
                    index: u64::from(r.section),
                });
            }
        }

        let real = self.sections.len();
        let n_rela = rela_groups.len();
        let has_syms = !self.symbols.is_empty();
        let has_mods = self
            .sections
            .iter()
            .any(|s| !s.module.is_empty() || !s.library.is_empty());
        let sh_count = real + n_rela + usize::from(has_syms) + usize::from(has_mods) + 1;

        let mut headers = vec![RawSectionHeader::default(); sh_count];
        let sh_offset = FILE_HEADER_SIZE;
        let ph_offset = sh_offset + sh_count * SECTION_HEADER_SIZE;
        let mut cursor = (ph_offset + self.program_headers.len() * PROGRAM_HEADER_SIZE) as u64;

        let mut blobs: Vec<(usize, Vec<u8>)> = Vec::new(); // (header index, data)

        // real sections
        for (i, s) in self.sections.iter().enumerate() {
            if s.align > 12 {
                return Err(ObjError::BadAlignment(s.align));
            }
            let h = &mut headers[i];
            h.name = strtab.add(&s.name)?;
            h.sh_type = s.sh_type.unwrap_or(SectionType::Progbits) as u32;
            h.flags = s.flags.bits();
            h.align = s.align;
            h.addr = s.addr;
            h.module = modstr.add(&s.module)?;
            h.library = modstr.add(&s.library)?;
            h.relink = relink_to_u32(s.relink);
            h.reguse1 = s.reguse1;
            h.reguse2 = s.reguse2;
            h.size = s.size();
            if s.sh_type != Some(SectionType::Nobits) {
                cursor = fcom_types::bytes::align_up(cursor, 8);
                h.offset = cursor;
                cursor += s.data.len() as u64;
                blobs.push((i, s.data.clone()));
            }
        }

        // relocation tables
        let mut hi = real;
        for (target, group) in &rela_groups {
            let mut bytes = vec![0u8; group.len() * RELOCATION_RECORD_SIZE];
            for (n, r) in group.iter().enumerate() {
                let raw = RawRelocation {
                    offset: r.offset,
                    r_type: r.type_field(),
                    sym: symbol_index(&r.sym)?,
                    ref_sym: match &r.ref_sym {
                        None => 0,
                        Some(name) => symbol_index(name)? + 1,
                    },
                    addend: r.addend,
                };
                raw.emit(&mut bytes, n * RELOCATION_RECORD_SIZE);
            }
            let h = &mut headers[hi];
            h.name = strtab.add(".rela")?;
            h.sh_type = SectionType::Rela as u32;
            h.module = *target;
            h.size = bytes.len() as u64;
            cursor = fcom_types::bytes::align_up(cursor, 8);
            h.offset = cursor;
            cursor += bytes.len() as u64;
            blobs.push((hi, bytes));
            hi += 1;
        }

        // symbol table
        if has_syms {
            let mut bytes = vec![0u8; self.symbols.len() * SYMBOL_RECORD_SIZE];
            for (n, s) in self.symbols.iter().enumerate() {
                if let Some(sec) = s.section {
                    if sec as usize >= self.sections.len() {
                        return Err(ObjError::IndexRange {
                            table: "section",
                            index: u64::from(sec),
                        });
                    }
                }
                let raw = RawSymbol {
                    name: strtab.add(&s.name)?,
                    section: s.section.map_or(0, |x| x + 1),
                    value: s.value,
                    unit_size: s.unit_size,
                    unit_count: s.unit_count,
                    bind: s.binding as u8,
                    sym_type: s.sym_type as u8,
                    other: s.flags.bits(),
                    reguse1: s.reguse1,
                    reguse2: s.reguse2,
                };
                raw.emit(&mut bytes, n * SYMBOL_RECORD_SIZE);
            }
            let h = &mut headers[hi];
            h.name = strtab.add(".symtab")?;
            h.sh_type = SectionType::Symtab as u32;
            h.size = bytes.len() as u64;
            cursor = fcom_types::bytes::align_up(cursor, 8);
            h.offset = cursor;
            cursor += bytes.len() as u64;
            blobs.push((hi, bytes));
            hi += 1;
        }

        // module-name table
        if has_mods {
            let bytes = std::mem::take(&mut modstr).into_bytes();
            let h = &mut headers[hi];
            h.name = strtab.add(".modstr")?;
            h.sh_type = SectionType::Modstr as u32;
            h.size = bytes.len() as u64;
            cursor = fcom_types::bytes::align_up(cursor, 8);
            h.offset = cursor;
            cursor += bytes.len() as u64;
            blobs.push((hi, bytes));
            hi += 1;
        }

        // string table, last
        {
            let name = strtab.add(".strtab")?;
            let bytes = strtab.into_bytes();
            let h = &mut headers[hi];
            h.name = name;
            h.sh_type = SectionType::Strtab as u32;
            h.size = bytes.len() as u64;
            cursor = fcom_types::bytes::align_up(cursor, 8);
            h.offset = cursor;
            cursor += bytes.len() as u64;
            blobs.push((hi, bytes));
        }

        // assemble the image
        let total = usize::try_from(cursor).map_err(|_| ObjError::Malformed("file too large"))?;
        let mut out = vec![0u8; total];
        let mut flags = 0u16;
        if self.relocate {
            flags |= crate::elf::FLAG_RELOCATE;
        }
        if self.relinkable {
            flags |= crate::elf::FLAG_RELINKABLE;
        }
        let file_header = FileHeader {
            file_type: if self.is_executable {
                FileType::Executable
            } else {
                FileType::Object
            },
            flags,
            entry: self.entry,
            ip_base: self.ip_base,
            datap_base: self.datap_base,
            threadp_base: self.threadp_base,
            sh_offset: sh_offset as u64,
            ph_offset: ph_offset as u64,
            sh_count: sh_count as u16,
            ph_count: self.program_headers.len() as u16,
        };
        file_header.emit(&mut out);
        for (i, h) in headers.iter().enumerate() {
            h.emit(&mut out, sh_offset + i * SECTION_HEADER_SIZE);
        }
        for (i, ph) in self.program_headers.iter().enumerate() {
            ph.emit(&mut out, ph_offset + i * PROGRAM_HEADER_SIZE);
        }
        for (hi, bytes) in &blobs {
            let at = headers[*hi].offset as usize;
            out[at..at + bytes.len()].copy_from_slice(bytes);
        }
        Ok(out)
    }
}

fn relink_from_u32(v: u32) -> RelinkMark {
    match v {
        1 => RelinkMark::Preserved,
        2 => RelinkMark::Replaced,
        3 => RelinkMark::Removed,
        _ => RelinkMark::None,
    }
}

fn relink_to_u32(m: RelinkMark) -> u32 {
    match m {
        RelinkMark::None => 0,
        RelinkMark::Preserved => 1,
        RelinkMark::Replaced => 2,
        RelinkMark::Removed => 3,
    }
}

fn slice_at(data: &[u8], offset: u64, size: u64) -> Result<&[u8], ObjError> {
    let start = usize::try_from(offset).map_err(|_| ObjError::Malformed("blob offset"))?;
    let len = usize::try_from(size).map_err(|_| ObjError::Malformed("blob size"))?;
    let end = start
        .checked_add(len)
        .ok_or(ObjError::Malformed("blob extent"))?;
    data.get(start..end)
        .ok_or(ObjError::Malformed("blob out of range"))
}

/// First table section of the given type, as raw bytes.
fn table_bytes<'d>(
    data: &'d [u8],
    raws: &[RawSectionHeader],
    which: SectionType,
) -> Result<Option<&'d [u8]>, ObjError> {
    for raw in raws {
        if raw.sh_type == which as u32 {
            return Ok(Some(slice_at(data, raw.offset, raw.size)?));
        }
    }
    Ok(None)
}

trait OutOfRange {
    fn is_none_or_out_of(self, limit: usize) -> bool;
}

impl OutOfRange for Option<usize> {
    fn is_none_or_out_of(self, limit: usize) -> bool {
        match self {
            None => true,
            Some(v) => v > limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RelocKind, RelocSize};

    fn sample_object() -> ObjectFile {
        let mut obj = ObjectFile::new();
        let code = obj.add_section(Section {
            name: "code".into(),
            sh_type: Some(SectionType::Progbits),
            flags: SectionFlags::EXEC | SectionFlags::READ | SectionFlags::IP,
            align: 2,
            data: vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88],
            module: "main.ob".into(),
            ..Section::default()
        });
        let data = obj.add_section(Section {
            name: "data".into(),
            sh_type: Some(SectionType::Progbits),
            flags: SectionFlags::READ | SectionFlags::WRITE | SectionFlags::DATAP,
            align: 3,
            data: vec![0; 16],
            module: "main.ob".into(),
            ..Section::default()
        });
        obj.add_section(Section {
            name: "bss".into(),
            sh_type: Some(SectionType::Nobits),
            flags: SectionFlags::READ | SectionFlags::WRITE | SectionFlags::DATAP,
            align: 3,
            nobits_size: 64,
            ..Section::default()
        });
        obj.symbols
            .insert(Symbol {
                name: "main".into(),
                section: Some(code),
                value: 0,
                unit_size: 4,
                unit_count: 2,
                binding: SymbolBinding::Global,
                sym_type: SymbolType::Function,
                flags: SymbolFlags::IP | SymbolFlags::EXEC,
                reguse1: 0x3,
                reguse2: 0,
            })
            .unwrap();
        obj.symbols
            .insert(Symbol {
                name: "x".into(),
                section: Some(data),
                value: 8,
                unit_size: 4,
                unit_count: 1,
                binding: SymbolBinding::Global,
                sym_type: SymbolType::Object,
                flags: SymbolFlags::DATAP | SymbolFlags::READ | SymbolFlags::WRITE,
                reguse1: 0,
                reguse2: 0,
            })
            .unwrap();
        obj.relocations.push(Relocation {
            section: code,
            offset: 4,
            sym: "x".into(),
            ref_sym: None,
            addend: 0,
            kind: RelocKind::DatapBase,
            size: RelocSize::B16,
            scale: 0,
            load_time: false,
        });
        obj
    }

    #[test]
    fn write_read_round_trip() {
        let obj = sample_object();
        let image = obj.write().unwrap();
        let back = ObjectFile::read(&image).unwrap();

        assert!(!back.is_executable);
        assert_eq!(back.sections.len(), 3);
        assert_eq!(back.sections[0].name, "code");
        assert_eq!(back.sections[0].data, obj.sections[0].data);
        assert_eq!(back.sections[0].module, "main.ob");
        assert_eq!(back.sections[2].size(), 64);
        assert_eq!(back.symbols.len(), 2);
        let main = back.symbols.find("main").unwrap();
        assert_eq!(main.sym_type, SymbolType::Function);
        assert_eq!(main.reguse1, 0x3);
        assert_eq!(back.relocations.len(), 1);
        assert_eq!(back.relocations[0].sym, "x");
        assert_eq!(back.relocations[0].kind, RelocKind::DatapBase);
    }

    #[test]
    fn deterministic_output() {
        let obj = sample_object();
        assert_eq!(obj.write().unwrap(), obj.write().unwrap());
    }

    #[test]
    fn reloc_against_missing_symbol_fails() {
        let mut obj = sample_object();
        obj.relocations[0].sym = "ghost".into();
        assert_eq!(
            obj.write(),
            Err(ObjError::SymbolNotFound("ghost".into()))
        );
    }

    #[test]
    fn truncated_image_fails() {
        let image = sample_object().write().unwrap();
        assert!(ObjectFile::read(&image[..image.len() / 2]).is_err());
    }

    #[test]
    fn executable_header_fields_survive() {
        let mut obj = sample_object();
        obj.is_executable = true;
        obj.relinkable = true;
        obj.entry = 0x40;
        obj.ip_base = 0x1_0000;
        obj.datap_base = 0x2_0000;
        obj.program_headers.push(ProgramHeader {
            p_type: 1,
            flags: (SectionFlags::EXEC | SectionFlags::READ).bits(),
            offset: 0,
            vaddr: 0x1_0000,
            file_size: 8,
            mem_size: 8,
        });
        let back = ObjectFile::read(&obj.write().unwrap()).unwrap();
        assert!(back.is_executable && back.relinkable && !back.relocate);
        assert_eq!(back.entry, 0x40);
        assert_eq!(back.ip_base, 0x1_0000);
        assert_eq!(back.program_headers.len(), 1);
        assert_eq!(back.program_headers[0].vaddr, 0x1_0000);
    }
}
