//! Linker core: symbol resolution, section placement, program headers and
//! relocation application.

use std::collections::HashMap;

use itertools::Itertools;
use tracing::debug;

use fcom_obj::{
    Library, ObjError, ObjectFile, ProgramHeader, RelocKind, RelocSize, Relocation, Section,
    SectionFlags, SectionType, Symbol, SymbolBinding, SymbolFlags, SymbolType,
};
use fcom_types::bytes::align_up;

use crate::LinkError;

/// Placement address of the first byte of the image.
const IMAGE_BASE: u64 = 0x1_0000;
/// Alignment between the IP, DATAP and THREADP regions.
const REGION_ALIGN: u64 = 0x1000;

/// Link configuration.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Entry symbol. Defaults to `main`.
    pub entry: String,
    /// Call-stack reservation recorded in the output.
    pub stack_size: u64,
    /// Heap reservation recorded in the output.
    pub heap_size: u64,
    /// Keep per-module metadata so the output can be split again.
    pub relinkable: bool,
    /// Permit unresolved strong imports.
    pub allow_unresolved: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            entry: "main".to_string(),
            stack_size: 0x1_0000,
            heap_size: 0x10_0000,
            relinkable: false,
            allow_unresolved: false,
        }
    }
}

/// Linker input: modules in command-line order plus libraries.
#[derive(Debug, Default)]
pub struct LinkInput {
    /// Named object modules.
    pub modules: Vec<(String, ObjectFile)>,
    /// Named libraries, searched in order.
    pub libraries: Vec<(String, Library)>,
}

/// Link result.
#[derive(Debug)]
pub struct Linked {
    /// The executable.
    pub executable: ObjectFile,
    /// Warnings gathered along the way.
    pub warnings: Vec<String>,
}

struct ModuleIn {
    name: String,
    library: String,
    object: ObjectFile,
}

/// Where one input section landed in the output.
#[derive(Clone, Copy)]
struct Placement {
    out_section: u32,
    /// Offset of the input section within the output section.
    delta: u64,
}

/// Link object modules and libraries into an executable.
pub fn link(input: LinkInput, options: &LinkOptions) -> Result<Linked, LinkError> {
    let mut warnings = Vec::new();
    let mut modules: Vec<ModuleIn> = input
        .modules
        .into_iter()
        .map(|(name, object)| ModuleIn {
            name,
            library: String::new(),
            object,
        })
        .collect();

    resolve_libraries(&mut modules, &input.libraries)?;
    let globals = global_symbols(&modules)?;

    // ---- section placement -----------------------------------------------
    // bucket order: executable, read-only, writable, uninitialized,
    // thread-local; communal sections of one name keep the first copy
    let mut placements: HashMap<(usize, u32), Placement> = HashMap::new();
    let mut out_sections: Vec<Section> = Vec::new();
    let mut comdat_homes: HashMap<String, u32> = HashMap::new();

    let mut ordered: Vec<(usize, u32)> = Vec::new();
    for bucket in 0..5u8 {
        for (mi, module) in modules.iter().enumerate() {
            for (si, section) in module.object.sections.iter().enumerate() {
                if section_bucket(section) == bucket {
                    ordered.push((mi, si as u32));
                }
            }
        }
    }

    for &(mi, si) in &ordered {
        let section = &modules[mi].object.sections[si as usize];
        if section.sh_type == Some(SectionType::Comdat) {
            if let Some(&home) = comdat_homes.get(&section.name) {
                // duplicate communal copy: discard, map into the home
                placements.insert(
                    (mi, si),
                    Placement {
                        out_section: home,
                        delta: 0,
                    },
                );
                continue;
            }
        }
        let mut out = section.clone();
        out.relink = fcom_obj::RelinkMark::None;
        out.module = modules[mi].name.clone();
        out.library = modules[mi].library.clone();
        if !options.relinkable {
            out.module = String::new();
            out.library = String::new();
        }
        let index = out_sections.len() as u32;
        out_sections.push(out);
        if section.sh_type == Some(SectionType::Comdat) {
            comdat_homes.insert(section.name.clone(), index);
        }
        placements.insert(
            (mi, si),
            Placement {
                out_section: index,
                delta: 0,
            },
        );
    }

    // assign addresses region by region
    let mut cursor = IMAGE_BASE;
    let mut ip_base = IMAGE_BASE;
    let mut datap_base = 0u64;
    let mut threadp_base = 0u64;
    let mut prev_bucket = 0u8;
    for s in out_sections.iter_mut() {
        let bucket = section_bucket(s);
        if bucket >= 2 && prev_bucket < 2 {
            cursor = align_up(cursor, REGION_ALIGN);
            datap_base = cursor;
        }
        if bucket >= 4 && prev_bucket < 4 {
            cursor = align_up(cursor, REGION_ALIGN);
            threadp_base = cursor;
        }
        prev_bucket = bucket.max(prev_bucket);
        if s.flags.contains(SectionFlags::FIXED_ADDR) {
            // frozen by the relinker; do not move
            cursor = cursor.max(s.addr + s.size());
            continue;
        }
        cursor = align_up(cursor, s.alignment());
        s.addr = cursor;
        cursor += s.size();
    }
    if datap_base == 0 {
        datap_base = align_up(cursor, REGION_ALIGN);
    }
    if threadp_base == 0 {
        threadp_base = align_up(cursor, REGION_ALIGN);
    }

    // ---- symbol table ----------------------------------------------------
    // every exported symbol gets an absolute value
    let mut out_symbols: HashMap<String, Symbol> = HashMap::new();
    for (name, owner) in &globals {
        let module = &modules[owner.module];
        let sym = module
            .object
            .symbols
            .find(name)
            .ok_or_else(|| ObjError::SymbolNotFound(name.clone()))?;
        let mut out = sym.clone();
        if let Some(sec) = sym.section {
            let place = placements
                .get(&(owner.module, sec))
                .ok_or(ObjError::Malformed("symbol section unplaced"))?;
            out.section = Some(place.out_section);
            out.value = out_sections[place.out_section as usize].addr + place.delta + sym.value;
        }
        out_symbols.insert(name.clone(), out);
    }
    // locals are kept (renamed per module on clash) when relinkable output
    // must be splittable again
    if options.relinkable {
        for (mi, module) in modules.iter().enumerate() {
            for sym in module.object.symbols.iter() {
                if sym.binding != SymbolBinding::Local {
                    continue;
                }
                let mut out = sym.clone();
                if let Some(sec) = sym.section {
                    let Some(place) = placements.get(&(mi, sec)) else {
                        continue;
                    };
                    out.section = Some(place.out_section);
                    out.value =
                        out_sections[place.out_section as usize].addr + place.delta + sym.value;
                }
                if out_symbols.contains_key(&out.name) {
                    out.name = format!("{}@{}", out.name, module.name);
                }
                out_symbols.insert(out.name.clone(), out);
            }
        }
    }

    // automatic base symbols unless user code defines them
    for (name, value) in [
        ("__ip_base", ip_base),
        ("__datap_base", datap_base),
        ("__threadp_base", threadp_base),
    ] {
        out_symbols.entry(name.to_string()).or_insert(Symbol {
            name: name.to_string(),
            section: None,
            value,
            unit_size: 0,
            unit_count: 0,
            binding: SymbolBinding::Global,
            sym_type: SymbolType::Constant,
            flags: SymbolFlags::empty(),
            reguse1: 0,
            reguse2: 0,
        });
    }

    // dummy definitions for unresolved weak imports, one per base class
    let mut dummies = DummySections::default();
    for module in &modules {
        for sym in module.object.symbols.iter() {
            if sym.binding != SymbolBinding::Unresolved || out_symbols.contains_key(&sym.name) {
                continue;
            }
            let is_weak_use = globals.get(&sym.name).is_none();
            if !is_weak_use {
                continue;
            }
            // leave strong failures for the relocation walk; only imports
            // that were declared weak anywhere get dummies
            let weak_anywhere = modules.iter().any(|m| {
                m.object
                    .symbols
                    .find(&sym.name)
                    .is_some_and(|s| s.binding == SymbolBinding::Weak)
            });
            if weak_anywhere {
                let value = dummies.address_for(sym.flags, &mut out_sections, &mut cursor);
                out_symbols.insert(
                    sym.name.clone(),
                    Symbol {
                        name: sym.name.clone(),
                        section: None,
                        value,
                        unit_size: 8,
                        unit_count: 1,
                        binding: SymbolBinding::Weak,
                        sym_type: SymbolType::Object,
                        flags: sym.flags,
                        reguse1: 0,
                        reguse2: 0,
                    },
                );
            }
        }
    }

    // event handler table
    build_event_table(&mut out_sections, &mut warnings);

    // ---- relocation application ------------------------------------------
    let mut out_relocations: Vec<Relocation> = Vec::new();
    for (mi, module) in modules.iter().enumerate() {
        for reloc in &module.object.relocations {
            let Some(place) = placements.get(&(mi, reloc.section)) else {
                continue;
            };
            let out_index = place.out_section;
            let field_addr =
                out_sections[out_index as usize].addr + place.delta + reloc.offset;
            let symbol = match out_symbols.get(&reloc.sym) {
                Some(s) => s.clone(),
                None => {
                    if options.allow_unresolved {
                        warnings.push(format!("unresolved symbol {}", reloc.sym));
                        continue;
                    }
                    return Err(LinkError::Unresolved(reloc.sym.clone()));
                }
            };
            let s_value = symbol.value as i64;
            let mut value = s_value + i64::from(reloc.addend);
            match reloc.kind {
                RelocKind::Abs => {}
                RelocKind::SelfRel => value -= field_addr as i64,
                RelocKind::IpBase => value -= ip_base as i64,
                RelocKind::DatapBase => value -= datap_base as i64,
                RelocKind::ThreadpBase => value -= threadp_base as i64,
                RelocKind::RefPoint => {
                    let r = reloc
                        .ref_sym
                        .as_ref()
                        .and_then(|n| out_symbols.get(n))
                        .map(|s| s.value as i64)
                        .unwrap_or(0);
                    value -= r;
                }
                RelocKind::Sysfunc | RelocKind::Sysmod | RelocKind::Syscall => {
                    // system ids are absolute values carried by the symbol
                }
                RelocKind::DataStack => value = options.stack_size as i64,
                RelocKind::CallStack => value = options.stack_size as i64,
                RelocKind::RegUse => value = i64::from(symbol.reguse1),
            }
            value >>= reloc.scale;
            apply_field(
                &mut out_sections,
                out_index,
                place.delta + reloc.offset,
                reloc.size,
                value,
            )
            .map_err(|_| LinkError::RelocationOverflow {
                symbol: reloc.sym.clone(),
                section: out_sections[out_index as usize].name.clone(),
                value,
            })?;

            // register-use audit on function calls
            if reloc.kind == RelocKind::SelfRel
                && symbol.flags.contains(SymbolFlags::REGUSE)
            {
                let caller = &out_sections[out_index as usize];
                if caller.reguse1 != 0 && (symbol.reguse1 & !caller.reguse1) != 0 {
                    warnings.push(format!(
                        "function {} uses registers its caller in {} does not expect",
                        symbol.name, caller.name
                    ));
                }
            }

            if options.relinkable {
                let mut kept = reloc.clone();
                kept.section = out_index;
                kept.offset = place.delta + reloc.offset;
                out_relocations.push(kept);
            }
        }
    }

    // ---- program headers -------------------------------------------------
    let program_headers = out_sections
        .iter()
        .filter(|s| s.size() > 0)
        .group_by(|s| (s.flags & program_flags_mask(), s.sh_type == Some(SectionType::Nobits)))
        .into_iter()
        .map(|((flags, nobits), group)| {
            let group: Vec<_> = group.collect();
            let start = group.iter().map(|s| s.addr).min().unwrap_or(0);
            let end = group.iter().map(|s| s.addr + s.size()).max().unwrap_or(0);
            ProgramHeader {
                p_type: 1,
                flags: flags.bits(),
                offset: 0,
                vaddr: start,
                file_size: if nobits { 0 } else { end - start },
                mem_size: end - start,
            }
        })
        .collect::<Vec<_>>();

    // ---- entry -----------------------------------------------------------
    let entry_sym = out_symbols
        .get(&options.entry)
        .ok_or_else(|| LinkError::NoEntry(options.entry.clone()))?;
    let entry = entry_sym.value - ip_base;

    let executable = ObjectFile {
        is_executable: true,
        entry,
        ip_base,
        datap_base,
        threadp_base,
        relocate: false,
        relinkable: options.relinkable,
        sections: out_sections,
        symbols: out_symbols.into_values().collect(),
        relocations: out_relocations,
        program_headers,
    };
    debug!(
        sections = executable.sections.len(),
        symbols = executable.symbols.len(),
        entry = executable.entry,
        "link complete"
    );
    Ok(Linked {
        executable,
        warnings,
    })
}

/// Bucket index in placement order.
fn section_bucket(s: &Section) -> u8 {
    if s.flags.contains(SectionFlags::THREADP) {
        4
    } else if s.sh_type == Some(SectionType::Nobits) {
        3
    } else if s.flags.contains(SectionFlags::WRITE) {
        2
    } else if s.flags.contains(SectionFlags::EXEC) {
        0
    } else {
        1
    }
}

fn program_flags_mask() -> SectionFlags {
    SectionFlags::EXEC
        | SectionFlags::READ
        | SectionFlags::WRITE
        | SectionFlags::IP
        | SectionFlags::DATAP
        | SectionFlags::THREADP
}

struct SymbolOwner {
    module: usize,
}

/// Resolve imports against library symbol indexes until the fixpoint.
fn resolve_libraries(
    modules: &mut Vec<ModuleIn>,
    libraries: &[(String, Library)],
) -> Result<(), LinkError> {
    loop {
        let mut wanted: Vec<String> = Vec::new();
        {
            let defined: HashMap<&str, ()> = modules
                .iter()
                .flat_map(|m| m.object.symbols.iter())
                .filter(|s| {
                    matches!(s.binding, SymbolBinding::Global | SymbolBinding::Weak)
                        && s.section.is_some()
                })
                .map(|s| (s.name.as_str(), ()))
                .collect();
            for m in modules.iter() {
                for s in m.object.symbols.iter() {
                    if s.binding == SymbolBinding::Unresolved
                        && !defined.contains_key(s.name.as_str())
                    {
                        wanted.push(s.name.clone());
                    }
                }
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }
        let mut pulled = false;
        for name in wanted {
            for (lib_name, lib) in libraries {
                if let Some(member_name) = lib.find_symbol(&name).map_err(LinkError::Object)? {
                    let already = modules
                        .iter()
                        .any(|m| m.name == member_name && m.library == *lib_name);
                    if already {
                        continue;
                    }
                    let member = lib
                        .member(&member_name)
                        .ok_or_else(|| ObjError::MemberNotFound(member_name.clone()))?;
                    let object = ObjectFile::read(&member.data)?;
                    debug!(member = %member_name, library = %lib_name, symbol = %name, "library member incorporated");
                    modules.push(ModuleIn {
                        name: member_name,
                        library: lib_name.clone(),
                        object,
                    });
                    pulled = true;
                    break;
                }
            }
        }
        if !pulled {
            // remaining imports are either weak or errors; both are decided
            // during symbol resolution
            return Ok(());
        }
    }
}

/// Build the global export map with weak/strong rules.
fn global_symbols(modules: &[ModuleIn]) -> Result<HashMap<String, SymbolOwner>, LinkError> {
    let mut owners: HashMap<String, (usize, SymbolBinding)> = HashMap::new();
    for (mi, module) in modules.iter().enumerate() {
        for sym in module.object.symbols.iter() {
            if sym.section.is_none() {
                continue;
            }
            match sym.binding {
                SymbolBinding::Global => match owners.get(&sym.name) {
                    Some(&(omi, SymbolBinding::Global)) => {
                        return Err(LinkError::DuplicateSymbol {
                            symbol: sym.name.clone(),
                            first: modules[omi].name.clone(),
                            second: module.name.clone(),
                        });
                    }
                    _ => {
                        owners.insert(sym.name.clone(), (mi, SymbolBinding::Global));
                    }
                },
                SymbolBinding::Weak => {
                    // first weak wins; strong always wins
                    owners
                        .entry(sym.name.clone())
                        .or_insert((mi, SymbolBinding::Weak));
                }
                _ => {}
            }
        }
    }
    Ok(owners
        .into_iter()
        .map(|(name, (module, _))| (name, SymbolOwner { module }))
        .collect())
}

/// Zero-filled dummy targets for unresolved weak imports, one section per
/// base-pointer class.
#[derive(Default)]
struct DummySections {
    const_addr: Option<u64>,
    data_addr: Option<u64>,
    thread_addr: Option<u64>,
}

impl DummySections {
    fn address_for(
        &mut self,
        flags: SymbolFlags,
        sections: &mut Vec<Section>,
        cursor: &mut u64,
    ) -> u64 {
        let (slot, sec_flags, name) = if flags.contains(SymbolFlags::THREADP) {
            (
                &mut self.thread_addr,
                SectionFlags::READ | SectionFlags::WRITE | SectionFlags::THREADP,
                "dummy_thread",
            )
        } else if flags.contains(SymbolFlags::WRITE) || flags.contains(SymbolFlags::DATAP) {
            (
                &mut self.data_addr,
                SectionFlags::READ | SectionFlags::WRITE | SectionFlags::DATAP,
                "dummy_data",
            )
        } else {
            (
                &mut self.const_addr,
                SectionFlags::READ | SectionFlags::IP,
                "dummy_const",
            )
        };
        if let Some(addr) = *slot {
            return addr;
        }
        *cursor = align_up(*cursor, 8);
        let addr = *cursor;
        sections.push(Section {
            name: name.to_string(),
            sh_type: Some(SectionType::Progbits),
            flags: sec_flags | SectionFlags::AUTOGEN,
            addr,
            align: 3,
            data: vec![0u8; 8],
            ..Section::default()
        });
        *cursor += 8;
        *slot = Some(addr);
        addr
    }
}

/// Merge `event_hand` sections into one table sorted by event id, then
/// key, then descending priority. Records are 16 bytes:
/// (id, key, priority, target).
fn build_event_table(sections: &mut Vec<Section>, warnings: &mut Vec<String>) {
    let mut records: Vec<[u32; 4]> = Vec::new();
    for s in sections.iter() {
        if !s.flags.contains(SectionFlags::EVENT_HAND) {
            continue;
        }
        if s.data.len() % 16 != 0 {
            warnings.push(format!("event section {} has a partial record", s.name));
        }
        for chunk in s.data.chunks_exact(16) {
            let f = |i: usize| {
                u32::from_le_bytes([chunk[i], chunk[i + 1], chunk[i + 2], chunk[i + 3]])
            };
            records.push([f(0), f(4), f(8), f(12)]);
        }
    }
    if records.is_empty() {
        return;
    }
    records.sort_by(|a, b| {
        a[0].cmp(&b[0])
            .then(a[1].cmp(&b[1]))
            .then(b[2].cmp(&a[2]))
    });
    let mut data = Vec::with_capacity(records.len() * 16);
    for r in &records {
        for v in r {
            data.extend_from_slice(&v.to_le_bytes());
        }
    }
    let addr = sections
        .iter()
        .map(|s| s.addr + s.size())
        .max()
        .unwrap_or(IMAGE_BASE);
    sections.push(Section {
        name: "event_table".to_string(),
        sh_type: Some(SectionType::Progbits),
        flags: SectionFlags::READ | SectionFlags::IP | SectionFlags::AUTOGEN,
        addr: align_up(addr, 8),
        align: 3,
        data,
        ..Section::default()
    });
}

/// Patch a relocated field, checking the range of the size selector.
fn apply_field(
    sections: &mut [Section],
    index: u32,
    offset: u64,
    size: RelocSize,
    value: i64,
) -> Result<(), ObjError> {
    let part = match size {
        RelocSize::B16Lo => value & 0xffff,
        RelocSize::B16Hi => (value >> 16) & 0xffff,
        RelocSize::B32Lo => value & 0xffff_ffff,
        RelocSize::B32Hi => (value >> 32) & 0xffff_ffff,
        _ => value,
    };
    if !size.value_fits(part) {
        return Err(ObjError::RelocationOverflow { value: part, size });
    }
    let data = &mut sections[index as usize].data;
    let at = offset as usize;
    let n = size.byte_count() as usize;
    if at + n > data.len() {
        return Err(ObjError::IndexRange {
            table: "section data",
            index: offset,
        });
    }
    let bytes = part.to_le_bytes();
    data[at..at + n].copy_from_slice(&bytes[..n]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcom_as::assemble;

    fn module(name: &str, src: &str) -> (String, ObjectFile) {
        (
            name.to_string(),
            assemble(src).expect("test module must assemble").object,
        )
    }

    fn main_module() -> (String, ObjectFile) {
        module(
            "main.ob",
            "extern helper\n\
             code section execute\n\
             main: function public\n\
             r0 = 1\n\
             call helper\n\
             return\n\
             main end\n\
             code end\n",
        )
    }

    fn helper_module() -> (String, ObjectFile) {
        module(
            "util.ob",
            "code section execute\n\
             helper: function public\n\
             r0 = add(r0, r0)\n\
             return\n\
             helper end\n\
             code end\n",
        )
    }

    #[test]
    fn two_modules_link_and_entry_resolves() {
        let input = LinkInput {
            modules: vec![main_module(), helper_module()],
            libraries: Vec::new(),
        };
        let linked = link(input, &LinkOptions::default()).expect("link");
        let exe = linked.executable;
        assert!(exe.is_executable);
        assert_eq!(exe.ip_base, IMAGE_BASE);
        let main = exe.symbols.find("main").unwrap();
        assert_eq!(exe.entry, main.value - exe.ip_base);
        assert!(exe.symbols.find("helper").is_some());
        assert!(exe.symbols.find("__ip_base").is_some());
        assert!(!exe.program_headers.is_empty());
    }

    #[test]
    fn unresolved_strong_symbol_fails() {
        let input = LinkInput {
            modules: vec![main_module()],
            libraries: Vec::new(),
        };
        match link(input, &LinkOptions::default()) {
            Err(LinkError::Unresolved(name)) => assert_eq!(name, "helper"),
            other => panic!("expected unresolved error, got {other:?}"),
        }
    }

    #[test]
    fn library_members_pull_in_on_demand() {
        let (_, helper) = helper_module();
        let mut lib = Library::new();
        lib.add_member(fcom_obj::Member {
            name: "util.ob".into(),
            data: helper.write().unwrap(),
        });
        let lib = Library::read(&lib.write().unwrap()).unwrap();

        let input = LinkInput {
            modules: vec![main_module()],
            libraries: vec![("libutil.li".to_string(), lib)],
        };
        let linked = link(input, &LinkOptions::default()).expect("link");
        assert!(linked.executable.symbols.find("helper").is_some());
    }

    #[test]
    fn duplicate_strong_symbols_collide() {
        let input = LinkInput {
            modules: vec![helper_module(), helper_module()],
            libraries: Vec::new(),
        };
        let opts = LinkOptions {
            entry: "helper".to_string(),
            ..LinkOptions::default()
        };
        assert!(matches!(
            link(input, &opts),
            Err(LinkError::DuplicateSymbol { .. })
        ));
    }

    #[test]
    fn relinkable_output_keeps_module_tags_and_relocations() {
        let input = LinkInput {
            modules: vec![main_module(), helper_module()],
            libraries: Vec::new(),
        };
        let opts = LinkOptions {
            relinkable: true,
            ..LinkOptions::default()
        };
        let exe = link(input, &opts).expect("link").executable;
        assert!(exe.relinkable);
        assert!(exe
            .sections
            .iter()
            .any(|s| s.module == "main.ob"));
        assert!(!exe.relocations.is_empty());
    }

    #[test]
    fn placement_orders_code_before_data() {
        let data_mod = module(
            "data.ob",
            "data section read write\n\
             int64 v = 9\n\
             data end\n",
        );
        let input = LinkInput {
            modules: vec![data_mod, main_module(), helper_module()],
            libraries: Vec::new(),
        };
        let exe = link(input, &LinkOptions::default()).expect("link").executable;
        let code_addr = exe
            .sections
            .iter()
            .find(|s| s.flags.contains(SectionFlags::EXEC))
            .map(|s| s.addr)
            .unwrap();
        let data_addr = exe
            .sections
            .iter()
            .find(|s| s.name == "data")
            .map(|s| s.addr)
            .unwrap();
        assert!(code_addr < data_addr);
        assert!(exe.datap_base >= code_addr);
        let v = exe.symbols.find("v").unwrap();
        assert_eq!(v.value, data_addr);
    }
}
