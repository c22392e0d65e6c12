//! End-to-end assembly scenarios.

use fcom_as::{assemble, disassemble};
use fcom_obj::{ObjectFile, RelocKind, SectionFlags, SymbolBinding, SymbolType};

#[test]
fn simple_function_produces_expected_object() {
    let src = "code section execute\n\
               main: function public\n\
               r0 = 5\n\
               r1 = 7\n\
               r0 = add(r0, r1)\n\
               return\n\
               main end\n\
               code end\n";
    let out = assemble(src).expect("assembly must succeed");
    let obj = out.object;

    assert_eq!(obj.sections.len(), 1);
    let code = &obj.sections[0];
    assert_eq!(code.name, "code");
    assert!(code.flags.contains(SectionFlags::EXEC | SectionFlags::IP));
    // three one-word instructions plus return
    assert_eq!(code.data.len(), 16);

    let main = obj.symbols.find("main").expect("main must be exported");
    assert_eq!(main.binding, SymbolBinding::Global);
    assert_eq!(main.sym_type, SymbolType::Function);
    assert_eq!(main.value, 0);
    assert!(obj.relocations.is_empty());
    assert_eq!(obj.entry, 0);
}

#[test]
fn data_reference_emits_datap_relocation() {
    let src = "data section read write\n\
               int32 x = 0x100\n\
               data end\n\
               code section execute\n\
               main: function public\n\
               int32 r0 = x\n\
               return\n\
               main end\n\
               code end\n";
    let out = assemble(src).expect("assembly must succeed");
    let obj = out.object;

    let data = obj
        .sections
        .iter()
        .find(|s| s.name == "data")
        .expect("data section");
    assert_eq!(data.data.len(), 4);
    assert_eq!(&data.data[..4], &0x100u32.to_le_bytes());

    assert_eq!(obj.relocations.len(), 1);
    let r = &obj.relocations[0];
    assert_eq!(r.sym, "x");
    assert_eq!(r.kind, RelocKind::DatapBase);
}

#[test]
fn object_files_round_trip_through_the_codec() {
    let src = "data section read write\n\
               int64 counter = 1, limit = 10\n\
               data end\n\
               code section execute\n\
               main: function public\n\
               r0 = counter\n\
               return\n\
               main end\n\
               code end\n";
    let out = assemble(src).expect("assembly must succeed");
    let image = out.object.write().expect("serialize");
    let back = ObjectFile::read(&image).expect("parse");
    assert_eq!(back.sections.len(), out.object.sections.len());
    assert_eq!(back.symbols.len(), out.object.symbols.len());
    assert_eq!(back.relocations.len(), out.object.relocations.len());
}

#[test]
fn loop_converges_and_branches_backwards() {
    let src = "code section execute\n\
               main: function public\n\
               r1 = 10\n\
               loop:\n\
               r0 = add(r0, r1)\n\
               r1 = sub(r1, 1)\n\
               jump_nzero(r1, loop)\n\
               return\n\
               main end\n\
               code end\n";
    let out = assemble(src).expect("assembly must succeed");
    // sub+jump fuse into one two-word instruction
    let text = disassemble(&out.object).expect("disassemble");
    assert!(text.contains("sub_jump_nzero"), "{text}");
}

#[test]
fn while_loop_lowers_to_conditional_jumps() {
    let src = "code section execute\n\
               main: function public\n\
               r1 = 8\n\
               while (r1 > 0)\n\
               {\n\
               r0 = add(r0, r1)\n\
               r1 = sub(r1, 1)\n\
               }\n\
               return\n\
               main end\n\
               code end\n";
    let out = assemble(src).expect("assembly must succeed");
    let text = disassemble(&out.object).expect("disassemble");
    // the loop head tests the inverted condition
    assert!(text.contains("jump_npos") || text.contains("sub_jump"), "{text}");
    assert!(text.contains("jump"), "{text}");
}

#[test]
fn if_else_generates_both_arms() {
    let src = "code section execute\n\
               main: function public\n\
               if (r1 == 0)\n\
               {\n\
               r0 = 1\n\
               }\n\
               else\n\
               {\n\
               r0 = 2\n\
               }\n\
               return\n\
               main end\n\
               code end\n";
    let out = assemble(src).expect("assembly must succeed");
    // 1 cond jump + r0=1 + jump-over + r0=2 + return
    let code = &out.object.sections[0];
    assert!(code.data.len() >= 5 * 4, "len = {}", code.data.len());
}

#[test]
fn meta_variables_fold_into_constants() {
    let src = "%width = 16\n\
               %half = width / 2\n\
               code section execute\n\
               main: function public\n\
               r0 = half\n\
               return\n\
               main end\n\
               code end\n";
    let out = assemble(src).expect("assembly must succeed");
    // r0 = 8 encodes as a one-word move with no relocation
    assert!(out.object.relocations.is_empty());
}

#[test]
fn duplicate_symbols_are_reported() {
    let src = "data section read write\n\
               int32 x = 1\n\
               int32 x = 2\n\
               data end\n";
    let err = assemble(src).expect_err("duplicate must fail");
    assert!(
        err.diagnostics.iter().any(|d| d.message.contains("duplicate")),
        "{err}"
    );
}

#[test]
fn unclosed_section_is_reported() {
    let err = assemble("code section execute\n").expect_err("must fail");
    assert!(
        err.diagnostics.iter().any(|d| d.message.contains("not closed")),
        "{err}"
    );
}

#[test]
fn align_outside_section_is_an_error() {
    let err = assemble("align 8\n").expect_err("must fail");
    assert!(
        err.diagnostics
            .iter()
            .any(|d| d.message.contains("outside a section")),
        "{err}"
    );
}

#[test]
fn uninitialized_section_rejects_values() {
    let src = "bss section read write uninitialized\n\
               int64 buffer[8]\n\
               bss end\n";
    let out = assemble(src).expect("zero-fill must be fine");
    let bss = &out.object.sections[0];
    assert_eq!(bss.size(), 64);
    assert!(bss.data.is_empty());

    let bad = "bss section read write uninitialized\n\
               int64 x = 5\n\
               bss end\n";
    assert!(assemble(bad).is_err());
}
