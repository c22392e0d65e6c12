//! Static libraries in Unix `ar` layout.
//!
//! A library is the 8-byte signature followed by records with 60-byte ASCII
//! headers. The first record, `/SYMDEF SORTED/`, is a sorted symbol index;
//! an optional `//` record holds names too long for the header field.
//! Member payloads are aligned to 8 bytes.

use itertools::Itertools;
use tracing::debug;

use fcom_types::bytes::{align_up, read_u32_le, write_u32_le};

use crate::{ObjError, ObjectFile, SymbolBinding};

/// Archive signature.
pub const AR_SIGNATURE: &[u8; 8] = b"!<arch>\n";

/// Name of the symbol index record.
pub const SYMDEF_NAME: &str = "/SYMDEF SORTED/";

/// Name of the long-names record.
pub const LONGNAMES_NAME: &str = "//";

const HEADER_SIZE: usize = 60;
const END_MARKER: [u8; 2] = [0x60, 0x0a];
const MAX_SHORT_NAME: usize = 15;

/// One library member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Member name, typically `module.ob`.
    pub name: String,
    /// Raw object-file image.
    pub data: Vec<u8>,
}

impl Member {
    /// Exported symbol names of this member: globals and weaks.
    pub fn exports(&self) -> Result<Vec<(String, SymbolBinding)>, ObjError> {
        let obj = ObjectFile::read(&self.data)?;
        Ok(obj
            .symbols
            .iter()
            .filter(|s| {
                matches!(s.binding, SymbolBinding::Global | SymbolBinding::Weak)
                    && s.section.is_some()
            })
            .map(|s| (s.name.clone(), s.binding))
            .collect())
    }
}

/// An in-memory library.
#[derive(Debug, Clone, Default)]
pub struct Library {
    members: Vec<Member>,
}

impl Library {
    /// Empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Members in archive order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Find a member by name.
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Add a member, replacing an existing member of the same name.
    pub fn add_member(&mut self, member: Member) {
        match self.members.iter_mut().find(|m| m.name == member.name) {
            Some(slot) => *slot = member,
            None => self.members.push(member),
        }
    }

    /// Delete a member.
    pub fn delete_member(&mut self, name: &str) -> Result<Member, ObjError> {
        let pos = self
            .members
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| ObjError::MemberNotFound(name.to_string()))?;
        Ok(self.members.remove(pos))
    }

    /// The sorted symbol index: (symbol name, member name), sorted by
    /// symbol name. Strong duplicates across members are an error.
    pub fn symbol_index(&self) -> Result<Vec<(String, String)>, ObjError> {
        let mut entries: Vec<(String, SymbolBinding, String)> = Vec::new();
        for m in &self.members {
            for (name, binding) in m.exports()? {
                entries.push((name, binding, m.name.clone()));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.2.cmp(&b.2)));

        let mut index = Vec::with_capacity(entries.len());
        for (_, group) in &entries.iter().group_by(|e| e.0.clone()) {
            let group: Vec<_> = group.collect();
            let strong = group
                .iter()
                .filter(|e| e.1 == SymbolBinding::Global)
                .count();
            if strong > 1 {
                return Err(ObjError::DuplicateSymbol(group[0].0.clone()));
            }
            // prefer the strong definition, else the first weak
            let winner = group
                .iter()
                .find(|e| e.1 == SymbolBinding::Global)
                .unwrap_or(&group[0]);
            index.push((winner.0.clone(), winner.2.clone()));
        }
        Ok(index)
    }

    /// Binary-search the index for the member defining `symbol`.
    pub fn find_symbol(&self, symbol: &str) -> Result<Option<String>, ObjError> {
        let index = self.symbol_index()?;
        Ok(index
            .binary_search_by(|(name, _)| name.as_str().cmp(symbol))
            .ok()
            .map(|i| index[i].1.clone()))
    }

    /// Parse a library image.
    pub fn read(data: &[u8]) -> Result<Self, ObjError> {
        if data.len() < AR_SIGNATURE.len() || &data[..8] != AR_SIGNATURE {
            return Err(ObjError::CorruptLibrary("bad signature"));
        }
        let mut lib = Self::new();
        let mut longnames: Vec<u8> = Vec::new();
        let mut pos = AR_SIGNATURE.len();
        while pos + HEADER_SIZE <= data.len() {
            let header = &data[pos..pos + HEADER_SIZE];
            if header[58..60] != END_MARKER {
                return Err(ObjError::CorruptLibrary("bad member end marker"));
            }
            let raw_name = ascii_field(&header[0..16]);
            let size: usize = ascii_field(&header[48..58])
                .parse()
                .map_err(|_| ObjError::CorruptLibrary("bad member size"))?;
            let body_start = pos + HEADER_SIZE;
            let body = data
                .get(body_start..body_start + size)
                .ok_or(ObjError::CorruptLibrary("member exceeds file"))?;

            if raw_name == SYMDEF_NAME {
                // regenerated on write; skip
            } else if raw_name == LONGNAMES_NAME {
                longnames = body.to_vec();
            } else {
                let name = if let Some(digits) = raw_name.strip_prefix('/') {
                    let offset: usize = digits
                        .parse()
                        .map_err(|_| ObjError::CorruptLibrary("bad long name reference"))?;
                    let tail = longnames
                        .get(offset..)
                        .ok_or(ObjError::CorruptLibrary("long name out of range"))?;
                    let end = tail
                        .iter()
                        .position(|&b| b == b'\n' || b == 0)
                        .unwrap_or(tail.len());
                    String::from_utf8_lossy(&tail[..end])
                        .trim_end_matches('/')
                        .to_string()
                } else {
                    raw_name.trim_end_matches('/').to_string()
                };
                lib.members.push(Member {
                    name,
                    data: body.to_vec(),
                });
            }
            pos = align_up((body_start + size) as u64, 8) as usize;
        }
        debug!(members = lib.members.len(), "library read");
        Ok(lib)
    }

    /// Serialize the library, regenerating the symbol index and long-name
    /// records from the current members.
    pub fn write(&self) -> Result<Vec<u8>, ObjError> {
        // long names record
        fn name_field(name: &str, longnames: &mut Vec<u8>) -> String {
            let decorated = format!("{name}/");
            if decorated.len() <= MAX_SHORT_NAME + 1 {
                decorated
            } else {
                let offset = longnames.len();
                longnames.extend_from_slice(decorated.as_bytes());
                longnames.push(b'\n');
                format!("/{offset}")
            }
        }
        let mut longnames: Vec<u8> = Vec::new();
        let member_fields: Vec<String> = self
            .members
            .iter()
            .map(|m| name_field(&m.name, &mut longnames))
            .collect();

        // member offsets depend on the symdef size, which depends on the
        // index contents only, so the index is built first
        let index = self.symbol_index()?;
        let mut symdef_strings: Vec<u8> = Vec::new();
        let mut name_offsets = Vec::with_capacity(index.len());
        for (symbol, _) in &index {
            name_offsets.push(symdef_strings.len() as u32);
            symdef_strings.extend_from_slice(symbol.as_bytes());
            symdef_strings.push(0);
        }
        let symdef_size = 4 + index.len() * 8 + symdef_strings.len();

        // lay out the file to learn member offsets
        let mut offset = AR_SIGNATURE.len() as u64;
        offset = align_up(offset + (HEADER_SIZE + symdef_size) as u64, 8);
        if !longnames.is_empty() {
            offset = align_up(offset + (HEADER_SIZE + longnames.len()) as u64, 8);
        }
        let mut member_offsets = Vec::with_capacity(self.members.len());
        for m in &self.members {
            member_offsets.push(offset);
            offset = align_up(offset + (HEADER_SIZE + m.data.len()) as u64, 8);
        }
        // symdef payload
        let mut symdef = vec![0u8; symdef_size];
        let _ = write_u32_le(&mut symdef, 0, index.len() as u32);
        for (i, (_, member_name)) in index.iter().enumerate() {
            let member_pos = self
                .members
                .iter()
                .position(|m| &m.name == member_name)
                .ok_or_else(|| ObjError::MemberNotFound(member_name.clone()))?;
            let _ = write_u32_le(&mut symdef, 4 + i * 8, name_offsets[i]);
            let _ = write_u32_le(&mut symdef, 8 + i * 8, member_offsets[member_pos] as u32);
        }
        symdef[4 + index.len() * 8..].copy_from_slice(&symdef_strings);

        // emit
        let mut out = Vec::with_capacity(offset as usize);
        out.extend_from_slice(AR_SIGNATURE);
        emit_record(&mut out, SYMDEF_NAME, &symdef);
        if !longnames.is_empty() {
            emit_record(&mut out, LONGNAMES_NAME, &longnames);
        }
        for (m, field) in self.members.iter().zip(&member_fields) {
            emit_record(&mut out, field, &m.data);
        }
        Ok(out)
    }

    /// Look up a symbol in a serialized library without parsing members:
    /// binary search over the `/SYMDEF SORTED/` record. Returns the file
    /// offset of the defining member's header.
    pub fn search_symdef(image: &[u8], symbol: &str) -> Result<Option<u64>, ObjError> {
        if image.len() < 8 || &image[..8] != AR_SIGNATURE {
            return Err(ObjError::CorruptLibrary("bad signature"));
        }
        let header = image
            .get(8..8 + HEADER_SIZE)
            .ok_or(ObjError::CorruptLibrary("missing symbol index"))?;
        if ascii_field(&header[0..16]) != SYMDEF_NAME {
            return Err(ObjError::CorruptLibrary("missing symbol index"));
        }
        let size: usize = ascii_field(&header[48..58])
            .parse()
            .map_err(|_| ObjError::CorruptLibrary("bad member size"))?;
        let body = image
            .get(8 + HEADER_SIZE..8 + HEADER_SIZE + size)
            .ok_or(ObjError::CorruptLibrary("symbol index exceeds file"))?;
        let count = read_u32_le(body, 0).ok_or(ObjError::CorruptLibrary("short symbol index"))?
            as usize;
        let strings = body
            .get(4 + count * 8..)
            .ok_or(ObjError::CorruptLibrary("short symbol index"))?;

        let name_at = |i: usize| -> Result<&str, ObjError> {
            let off = read_u32_le(body, 4 + i * 8)
                .ok_or(ObjError::CorruptLibrary("short symbol index"))? as usize;
            let tail = strings
                .get(off..)
                .ok_or(ObjError::CorruptLibrary("bad index string"))?;
            let end = tail
                .iter()
                .position(|&b| b == 0)
                .ok_or(ObjError::CorruptLibrary("bad index string"))?;
            std::str::from_utf8(&tail[..end])
                .map_err(|_| ObjError::CorruptLibrary("bad index string"))
        };

        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match name_at(mid)?.cmp(symbol) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => {
                    let off = read_u32_le(body, 8 + mid * 8)
                        .ok_or(ObjError::CorruptLibrary("short symbol index"))?;
                    return Ok(Some(u64::from(off)));
                }
            }
        }
        Ok(None)
    }
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

fn emit_record(out: &mut Vec<u8>, name_field: &str, body: &[u8]) {
    let mut header = [b' '; HEADER_SIZE];
    let name = name_field.as_bytes();
    header[..name.len().min(16)].copy_from_slice(&name[..name.len().min(16)]);
    let date = b"0";
    header[16..16 + date.len()].copy_from_slice(date);
    header[28..28 + 1].copy_from_slice(b"0"); // uid
    header[34..34 + 1].copy_from_slice(b"0"); // gid
    header[40..40 + 3].copy_from_slice(b"644"); // mode
    let size = body.len().to_string();
    header[48..48 + size.len()].copy_from_slice(size.as_bytes());
    header[58..60].copy_from_slice(&END_MARKER);
    out.extend_from_slice(&header);
    out.extend_from_slice(body);
    while out.len() % 8 != 0 {
        out.push(b'\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Section, SectionFlags, SectionType, Symbol, SymbolFlags, SymbolType};

    fn module_exporting(name: &str, symbols: &[&str]) -> Member {
        let mut obj = ObjectFile::new();
        let sec = obj.add_section(Section {
            name: "code".into(),
            sh_type: Some(SectionType::Progbits),
            flags: SectionFlags::EXEC | SectionFlags::READ | SectionFlags::IP,
            align: 2,
            data: vec![0; 8],
            ..Section::default()
        });
        for (i, s) in symbols.iter().enumerate() {
            obj.symbols
                .insert(Symbol {
                    name: (*s).into(),
                    section: Some(sec),
                    value: i as u64 * 4,
                    unit_size: 4,
                    unit_count: 1,
                    binding: SymbolBinding::Global,
                    sym_type: SymbolType::Function,
                    flags: SymbolFlags::IP | SymbolFlags::EXEC,
                    reguse1: 0,
                    reguse2: 0,
                })
                .unwrap();
        }
        Member {
            name: name.into(),
            data: obj.write().unwrap(),
        }
    }

    #[test]
    fn round_trip_and_index_order() {
        let mut lib = Library::new();
        lib.add_member(module_exporting("b.ob", &["g"]));
        lib.add_member(module_exporting("a.ob", &["f", "zeta"]));
        let image = lib.write().unwrap();
        assert_eq!(&image[..8], AR_SIGNATURE);

        let back = Library::read(&image).unwrap();
        let names: Vec<_> = back.members().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["b.ob", "a.ob"]);

        // index is sorted by symbol name
        let index = back.symbol_index().unwrap();
        let syms: Vec<_> = index.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(syms, ["f", "g", "zeta"]);
    }

    #[test]
    fn mutation_scenario() {
        let mut lib = Library::new();
        lib.add_member(module_exporting("a.ob", &["f"]));
        lib.add_member(module_exporting("b.ob", &["g"]));

        lib.delete_member("a.ob").unwrap();
        lib.add_member(module_exporting("c.ob", &["f"]));

        let mut back = Library::read(&lib.write().unwrap()).unwrap();
        let names: Vec<_> = back.members().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["b.ob", "c.ob"]);
        assert_eq!(back.find_symbol("f").unwrap().as_deref(), Some("c.ob"));
        assert!(back.delete_member("a.ob").is_err());
    }

    #[test]
    fn duplicate_strong_symbol_is_rejected() {
        let mut lib = Library::new();
        lib.add_member(module_exporting("a.ob", &["f"]));
        lib.add_member(module_exporting("c.ob", &["f"]));
        assert!(matches!(lib.write(), Err(ObjError::DuplicateSymbol(_))));
    }

    #[test]
    fn long_member_names() {
        let mut lib = Library::new();
        lib.add_member(module_exporting(
            "a_rather_long_module_name_indeed.ob",
            &["f"],
        ));
        let back = Library::read(&lib.write().unwrap()).unwrap();
        assert_eq!(back.members()[0].name, "a_rather_long_module_name_indeed.ob");
    }

    #[test]
    fn symdef_binary_search() {
        let mut lib = Library::new();
        lib.add_member(module_exporting("a.ob", &["f"]));
        lib.add_member(module_exporting("b.ob", &["g"]));
        let image = lib.write().unwrap();
        let g_offset = Library::search_symdef(&image, "g").unwrap().unwrap();
        // the offset must point at a member header with the end marker
        let header = &image[g_offset as usize..g_offset as usize + 60];
        assert_eq!(&header[58..60], &[0x60, 0x0a]);
        assert!(Library::search_symdef(&image, "nope").unwrap().is_none());
    }

    #[test]
    fn corrupt_archives_are_rejected() {
        assert!(Library::read(b"not an archive").is_err());
        let mut lib = Library::new();
        lib.add_member(module_exporting("a.ob", &["f"]));
        let mut image = lib.write().unwrap();
        image[66] = b'X'; // clobber the symdef end marker region
        assert!(Library::read(&image).is_err());
    }
}
