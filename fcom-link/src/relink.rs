//! Relinker: split a relinkable executable back into modules, apply
//! replace/remove/add commands, and relink.

use std::collections::HashMap;

use tracing::debug;

use fcom_obj::{
    ObjectFile, RelinkMark, SectionFlags, Symbol, SymbolBinding,
};

use crate::linker::{link, LinkInput, LinkOptions, Linked};
use crate::LinkError;

/// User commands applied between splitting and relinking.
#[derive(Debug, Default)]
pub struct RelinkCommands {
    /// Replace these modules with new objects of the same name.
    pub replace: Vec<(String, ObjectFile)>,
    /// Drop these modules.
    pub remove: Vec<String>,
    /// Append new modules.
    pub add: Vec<(String, ObjectFile)>,
}

/// Split a relinkable executable into its constituent modules.
///
/// Non-relinkable sections are collected into a synthetic frozen module
/// (index 0) whose sections keep their addresses.
pub fn split_modules(exe: &ObjectFile) -> Result<Vec<(String, ObjectFile)>, LinkError> {
    if !exe.relinkable {
        return Err(LinkError::NotRelinkable);
    }

    // module identity: (library, module) pair from the section headers
    let mut order: Vec<(String, String)> = Vec::new();
    let mut grouping: HashMap<(String, String), Vec<u32>> = HashMap::new();
    for (index, section) in exe.sections.iter().enumerate() {
        if section.flags.contains(SectionFlags::AUTOGEN) {
            // linker-generated content is rebuilt by the next link
            continue;
        }
        let key = if section.flags.contains(SectionFlags::RELINKABLE)
            || !section.module.is_empty()
        {
            (section.library.clone(), section.module.clone())
        } else {
            // frozen
            (String::new(), String::new())
        };
        if !grouping.contains_key(&key) {
            order.push(key.clone());
        }
        grouping.entry(key).or_default().push(index as u32);
    }
    // the frozen module always goes first, the rest keep placement order
    let mut sorted = Vec::with_capacity(order.len());
    if let Some(pos) = order.iter().position(|k| k.0.is_empty() && k.1.is_empty()) {
        sorted.push(order[pos].clone());
    }
    for k in &order {
        if !(k.0.is_empty() && k.1.is_empty()) {
            sorted.push(k.clone());
        }
    }
    let order = sorted;

    let mut modules = Vec::new();
    for key in &order {
        let section_indices = &grouping[key];
        let frozen = key.0.is_empty() && key.1.is_empty();
        let mut module = ObjectFile::new();
        let mut remap: HashMap<u32, u32> = HashMap::new();

        for &si in section_indices {
            let mut section = exe.sections[si as usize].clone();
            section.relink = RelinkMark::Preserved;
            if frozen {
                section.flags |= SectionFlags::FIXED_ADDR;
                // address stays absolute
            } else {
                section.addr = 0;
            }
            remap.insert(si, module.add_section(section));
        }

        // symbols defined in these sections, with section-relative values
        for sym in exe.symbols.iter() {
            let Some(sec) = sym.section else { continue };
            let Some(&new_sec) = remap.get(&sec) else {
                continue;
            };
            let mut out = sym.clone();
            out.section = Some(new_sec);
            if !frozen {
                out.value = sym.value - exe.sections[sec as usize].addr;
            }
            // strip the local-disambiguation suffix added at link time
            if let Some(stripped) = out.name.split('@').next() {
                if out.binding == SymbolBinding::Local && stripped != out.name {
                    out.name = stripped.to_string();
                }
            }
            module.symbols.upsert(out);
        }

        // relocations sourced in these sections; cross-module targets
        // become imports by name
        for reloc in &exe.relocations {
            let Some(&new_sec) = remap.get(&reloc.section) else {
                continue;
            };
            let mut out = reloc.clone();
            out.section = new_sec;
            if module.symbols.find(&out.sym).is_none() {
                module.symbols.upsert(Symbol::import(&out.sym));
            }
            if let Some(ref_sym) = &out.ref_sym {
                if module.symbols.find(ref_sym).is_none() {
                    module.symbols.upsert(Symbol::import(ref_sym));
                }
            }
            module.relocations.push(out);
        }

        let name = if frozen {
            "<frozen>".to_string()
        } else {
            key.1.clone()
        };
        modules.push((name, module));
    }
    debug!(modules = modules.len(), "executable split");
    Ok(modules)
}

/// Split, apply the user's commands, and run the linker again.
pub fn relink(
    exe: &ObjectFile,
    commands: RelinkCommands,
    options: &LinkOptions,
) -> Result<Linked, LinkError> {
    let mut modules = split_modules(exe)?;

    for name in &commands.remove {
        let before = modules.len();
        modules.retain(|(n, _)| n != name);
        if modules.len() == before {
            return Err(LinkError::ModuleNotFound(name.clone()));
        }
    }
    for (name, replacement) in commands.replace {
        let slot = modules
            .iter_mut()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| LinkError::ModuleNotFound(name.clone()))?;
        slot.1 = replacement;
    }
    for (name, object) in commands.add {
        modules.push((name, object));
    }

    let input = LinkInput {
        modules,
        libraries: Vec::new(),
    };
    link(input, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcom_as::assemble;

    fn module(src: &str) -> ObjectFile {
        assemble(src).expect("test module must assemble").object
    }

    fn build_relinkable() -> ObjectFile {
        let main = module(
            "extern helper\n\
             code section execute relinkable\n\
             main: function public\n\
             r0 = 1\n\
             call helper\n\
             return\n\
             main end\n\
             code end\n",
        );
        let util = module(
            "code section execute relinkable\n\
             helper: function public\n\
             r0 = add(r0, r0)\n\
             return\n\
             helper end\n\
             code end\n",
        );
        let opts = LinkOptions {
            relinkable: true,
            ..LinkOptions::default()
        };
        let input = LinkInput {
            modules: vec![
                ("main.ob".to_string(), main),
                ("util.ob".to_string(), util),
            ],
            libraries: Vec::new(),
        };
        link(input, &opts).expect("link").executable
    }

    #[test]
    fn split_recovers_the_modules() {
        let exe = build_relinkable();
        let modules = split_modules(&exe).expect("split");
        let names: Vec<_> = modules.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"main.ob"), "{names:?}");
        assert!(names.contains(&"util.ob"), "{names:?}");

        let main = &modules.iter().find(|(n, _)| n == "main.ob").unwrap().1;
        // the import of helper is preserved by name
        assert!(main.symbols.find("helper").is_some());
        assert!(!main.relocations.is_empty());
    }

    #[test]
    fn split_rejects_non_relinkable() {
        let mut exe = build_relinkable();
        exe.relinkable = false;
        assert!(matches!(
            split_modules(&exe),
            Err(LinkError::NotRelinkable)
        ));
    }

    #[test]
    fn relink_without_changes_reproduces_the_image() {
        let exe = build_relinkable();
        let opts = LinkOptions {
            relinkable: true,
            ..LinkOptions::default()
        };
        let again = relink(&exe, RelinkCommands::default(), &opts)
            .expect("relink")
            .executable;
        assert_eq!(exe.write().unwrap(), again.write().unwrap());
    }

    #[test]
    fn replace_swaps_code_and_keeps_the_rest() {
        let exe = build_relinkable();
        let new_util = module(
            "code section execute relinkable\n\
             helper: function public\n\
             r0 = add(r0, 3)\n\
             r0 = add(r0, r0)\n\
             return\n\
             helper end\n\
             code end\n",
        );
        let opts = LinkOptions {
            relinkable: true,
            ..LinkOptions::default()
        };
        let relinked = relink(
            &exe,
            RelinkCommands {
                replace: vec![("util.ob".to_string(), new_util)],
                ..RelinkCommands::default()
            },
            &opts,
        )
        .expect("relink")
        .executable;

        let old_helper = exe.symbols.find("helper").unwrap().clone();
        let new_helper = relinked.symbols.find("helper").unwrap();
        // the replacement has one more instruction
        let old_code: Vec<_> = exe
            .sections
            .iter()
            .filter(|s| s.module == "util.ob")
            .collect();
        let new_code: Vec<_> = relinked
            .sections
            .iter()
            .filter(|s| s.module == "util.ob")
            .collect();
        assert_eq!(old_code.len(), 1);
        assert_eq!(new_code.len(), 1);
        assert_eq!(new_code[0].data.len(), old_code[0].data.len() + 4);
        assert!(new_helper.value != 0 && old_helper.value != 0);

        // main's code bytes are unchanged except the patched call offset
        let old_main = exe
            .sections
            .iter()
            .find(|s| s.module == "main.ob")
            .unwrap();
        let new_main = relinked
            .sections
            .iter()
            .find(|s| s.module == "main.ob")
            .unwrap();
        assert_eq!(old_main.data.len(), new_main.data.len());

        let removed = relink(
            &exe,
            RelinkCommands {
                remove: vec!["nonexistent.ob".to_string()],
                ..RelinkCommands::default()
            },
            &opts,
        );
        assert!(matches!(removed, Err(LinkError::ModuleNotFound(_))));
    }
}
