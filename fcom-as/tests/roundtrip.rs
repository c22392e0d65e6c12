//! Encoding idempotence: disassembling assembler output and assembling
//! the listing again reproduces the same code bytes.

use fcom_as::{assemble, disassemble};

fn code_bytes(src: &str) -> (Vec<u8>, String) {
    let first = assemble(src).expect("first assembly").object;
    let listing = disassemble(&first).expect("disassembly");
    let code = first
        .sections
        .iter()
        .find(|s| s.is_code())
        .expect("code section")
        .data
        .clone();
    (code, listing)
}

#[test]
fn straight_line_code_reassembles_identically() {
    let src = "code section execute\n\
               main: function public\n\
               r0 = 5\n\
               r1 = 7\n\
               r0 = add(r0, r1)\n\
               r2 = sub(r0, 100)\n\
               r3 = and(r2, 0xff)\n\
               return\n\
               main end\n\
               code end\n";
    let (code, listing) = code_bytes(src);
    let second = assemble(&listing).expect("listing must reassemble").object;
    let code2 = &second
        .sections
        .iter()
        .find(|s| s.is_code())
        .expect("code section")
        .data;
    assert_eq!(&code, code2, "listing:\n{listing}");
}

#[test]
fn branches_reassemble_identically() {
    let src = "code section execute\n\
               main: function public\n\
               r0 = 0\n\
               r1 = 10\n\
               loop:\n\
               r0 = add(r0, r1)\n\
               r1 = sub(r1, 1)\n\
               jump_nzero(r1, loop)\n\
               return\n\
               main end\n\
               code end\n";
    let (code, listing) = code_bytes(src);
    let second = assemble(&listing).expect("listing must reassemble").object;
    let code2 = &second
        .sections
        .iter()
        .find(|s| s.is_code())
        .expect("code section")
        .data;
    assert_eq!(&code, code2, "listing:\n{listing}");
}
