//! The disassembler: format lookup by leading bits, operand extraction,
//! symbolic substitution, and list output in assembler syntax.

use std::fmt::Write as _;

use fcom_asm::{
    effective_opj, f16_to_f64, instruction_set, lookup_format, operand_shape, plan_regs,
    Category, Fields, FieldsE, FormatCategory, FormatRecord, InstructionRecord, InstructionSet,
    RegSlot, RuUse, Template,
};
use fcom_obj::{ObjectFile, Relocation, SectionFlags, SectionType};
use fcom_types::bytes::read_u32_le;
use fcom_types::OperandType;

/// Disassembly failure. Individual undecodable words are reported inline
/// as comments; only table loading can fail outright.
#[derive(Debug, thiserror::Error)]
pub enum DisError {
    /// The instruction table failed to load.
    #[error(transparent)]
    Table(#[from] fcom_asm::TableError),
}

/// Disassemble an object or executable into assembler syntax.
pub fn disassemble(obj: &ObjectFile) -> Result<String, DisError> {
    let iset = instruction_set()?;
    let mut out = String::new();
    let _ = writeln!(out, "// disassembly of {} sections", obj.sections.len());

    for (index, section) in obj.sections.iter().enumerate() {
        let index = index as u32;
        let _ = writeln!(out);
        section_header(&mut out, section);
        if section.flags.contains(SectionFlags::EXEC) {
            code_section(&mut out, obj, iset, index);
        } else {
            data_section(&mut out, obj, index);
        }
        let _ = writeln!(out, "{} end", section.name);
    }
    Ok(out)
}

fn section_header(out: &mut String, section: &fcom_obj::Section) {
    let mut attrs = Vec::new();
    if section.flags.contains(SectionFlags::EXEC) {
        attrs.push("execute");
    } else {
        if section.flags.contains(SectionFlags::READ) {
            attrs.push("read");
        }
        if section.flags.contains(SectionFlags::WRITE) {
            attrs.push("write");
        }
    }
    if section.sh_type == Some(SectionType::Nobits) {
        attrs.push("uninitialized");
    }
    if section.flags.contains(SectionFlags::THREADP) {
        attrs.push("threadlocal");
    }
    if section.flags.contains(SectionFlags::COMDAT) {
        attrs.push("communal");
    }
    let _ = writeln!(out, "{} section {}", section.name, attrs.join(" "));
}

/// Symbols of a section sorted by value, for label emission and
/// nearest-preceding lookup.
fn section_symbols(obj: &ObjectFile, section: u32) -> Vec<(u64, &str, u32)> {
    let mut syms: Vec<(u64, &str, u32)> = obj
        .symbols
        .iter()
        .filter(|s| s.section == Some(section))
        .map(|s| (s.value, s.name.as_str(), s.unit_size))
        .collect();
    syms.sort();
    syms
}

fn code_section(out: &mut String, obj: &ObjectFile, iset: &InstructionSet, index: u32) {
    let section = &obj.sections[index as usize];
    let symbols = section_symbols(obj, index);
    let relocs = obj.relocations_of(index);
    let mut offset = 0usize;
    let mut next_sym = 0usize;

    while offset < section.data.len() {
        // labels at this address
        while next_sym < symbols.len() && symbols[next_sym].0 <= offset as u64 {
            if symbols[next_sym].0 < offset as u64 {
                let _ = writeln!(
                    out,
                    "// warning: symbol {} does not fall on an instruction boundary",
                    symbols[next_sym].1
                );
            } else {
                let _ = writeln!(out, "{}:", symbols[next_sym].1);
            }
            next_sym += 1;
        }

        let Some(word0) = read_u32_le(&section.data, offset) else {
            let _ = writeln!(out, "// trailing bytes at {offset:#x}");
            break;
        };
        let Some(fmt) = lookup_format(word0) else {
            let _ = writeln!(out, "// undecodable word {word0:#010x} at {offset:#x}");
            offset += 4;
            continue;
        };
        let mut words = vec![word0];
        for w in 1..fmt.word_size() as usize {
            match read_u32_le(&section.data, offset + 4 * w) {
                Some(v) => words.push(v),
                None => {
                    let _ = writeln!(out, "// truncated instruction at {offset:#x}");
                    break;
                }
            }
        }
        if words.len() != fmt.word_size() as usize {
            break;
        }

        match decode_one(iset, fmt, &words) {
            Some(decoded) => {
                let text = render(&symbols, &relocs, offset, fmt, &decoded);
                let _ = writeln!(out, "    {text}");
            }
            None => {
                let _ = writeln!(
                    out,
                    "// unknown instruction {word0:#010x} at {offset:#x}"
                );
            }
        }
        offset += fmt.byte_size() as usize;
    }
}

/// A decoded instruction before symbol substitution.
struct Decoded<'a> {
    rec: &'a InstructionRecord,
    fields: Fields,
    regs: Vec<(RegSlot, u8)>,
    imm: Option<i64>,
    imm_is_float: bool,
    mem: Option<DecodedMem>,
    jump_offset: Option<i64>,
    fallback: Option<u8>,
}

struct DecodedMem {
    base: u8,
    has_index: bool,
    index: u8,
    offset: i64,
    length: Option<u8>,
}

/// Find the instruction record for a decoded word group.
fn find_record<'a>(
    iset: &'a InstructionSet,
    fmt: &FormatRecord,
    words: &[u32],
) -> Option<&'a InstructionRecord> {
    let fields = Fields::decode(words[0]);
    match fmt.category {
        FormatCategory::Jump => {
            let opj = effective_opj(fmt, words);
            let family = if fmt.tmpl == Template::D {
                fmt.key.mode2
            } else {
                fields.op1
            };
            iset.find_jump(family, opj)
        }
        FormatCategory::Single if fmt.tmpl == Template::E => {
            let e = FieldsE::decode(words[1]);
            iset.find_single(fields.op1, e.op2)
        }
        _ => {
            // multi-format lookup by OP1, falling back to single-format
            // records bound to this format (nop, return, push, pop)
            let fmt_index = fcom_asm::FORMAT_TABLE
                .iter()
                .position(|f| f.key == fmt.key)?;
            iset.find_multi(fields.op1)
                .filter(|r| r.allows_format(fmt_index))
                .or_else(|| {
                    iset.records().iter().find(|r| {
                        r.category == Category::Single
                            && r.op1 == fields.op1
                            && r.allows_format(fmt_index)
                    })
                })
        }
    }
}

fn decode_one<'a>(
    iset: &'a InstructionSet,
    fmt: &FormatRecord,
    words: &[u32],
) -> Option<Decoded<'a>> {
    let rec = find_record(iset, fmt, words)?;
    let fields = Fields::decode(words[0]);
    let shape = operand_shape(rec, fmt)?;
    let plan = plan_regs(fmt, shape.n_regs)?;

    let regs = plan
        .iter()
        .map(|slot| {
            let r = match slot {
                RegSlot::Rd => fields.rd,
                RegSlot::Rs => fmt.rs_of(words[0]),
                RegSlot::Rt => fields.rt,
            };
            (*slot, r)
        })
        .collect();

    let ot = fmt
        .ot_fixed
        .unwrap_or_else(|| OperandType::from_repr(fields.ot).unwrap_or(OperandType::Int64));

    let imm = if shape.has_imm {
        Some(read_field(words, fmt.imm_pos, fmt.imm_size))
    } else {
        None
    };
    let imm_is_float = ot.is_float() && fmt.imm_size >= 2;

    let mem = if shape.mem_source || shape.mem_dest {
        let e = FieldsE::decode(*words.get(1)?);
        let has_index = e.im5 & 1 != 0;
        let raw = read_field(words, fmt.addr_pos, fmt.addr_size);
        let offset = if fmt.scale {
            raw * i64::from(ot.data_size())
        } else {
            raw
        };
        Some(DecodedMem {
            base: fmt.rs_of(words[0]),
            has_index,
            index: fields.rt,
            offset,
            length: if fmt.ru_use == RuUse::Length {
                Some(e.ru)
            } else {
                None
            },
        })
    } else {
        None
    };

    let jump_offset = if rec.category == Category::Jump {
        Some(read_field(words, fmt.jump_pos, fmt.jump_size) << 2)
    } else {
        None
    };

    let fallback = if fmt.ru_use == RuUse::Fallback && words.len() > 1 {
        let e = FieldsE::decode(words[1]);
        if e.ru != 31 {
            Some(e.ru)
        } else {
            None
        }
    } else {
        None
    };

    Some(Decoded {
        rec,
        fields,
        regs,
        imm,
        imm_is_float,
        mem,
        jump_offset,
        fallback,
    })
}

/// Sign-extended little-endian field read.
fn read_field(words: &[u32], pos: u8, size: u8) -> i64 {
    let mut v: u64 = 0;
    for i in 0..size {
        let at = usize::from(pos + i);
        let byte = (words[at / 4] >> ((at % 4) * 8)) & 0xff;
        v |= u64::from(byte) << (8 * i);
    }
    let bits = u32::from(size) * 8;
    if bits == 0 || bits >= 64 {
        return v as i64;
    }
    let shift = 64 - bits;
    ((v << shift) as i64) >> shift
}

fn render(
    symbols: &[(u64, &str, u32)],
    relocs: &[&Relocation],
    offset: usize,
    fmt: &FormatRecord,
    d: &Decoded<'_>,
) -> String {
    let reg_name = |r: u8| -> String {
        if fmt.vector && d.rec.category != Category::Jump {
            format!("v{r}")
        } else if r == 31 {
            "sp".to_string()
        } else {
            format!("r{r}")
        }
    };
    let ot = fmt
        .ot_fixed
        .unwrap_or_else(|| OperandType::from_repr(d.fields.ot).unwrap_or(OperandType::Int64));

    let mut args: Vec<String> = Vec::new();
    for (_, r) in &d.regs {
        args.push(reg_name(*r));
    }
    if let Some(m) = &d.mem {
        let mut inner = base_name(m.base);
        if m.has_index {
            let _ = write!(inner, " + r{}*{}", m.index, ot.data_size());
        }
        // relocation against the address field replaces the literal offset
        if let Some(r) = reloc_at(relocs, offset as u64 + u64::from(fmt.addr_pos)) {
            inner = symbolic(&r.sym, i64::from(r.addend));
        } else if m.offset != 0 {
            let _ = write!(inner, " + {:#x}", m.offset);
        }
        if let Some(len) = m.length {
            let _ = write!(inner, ", length = r{len}");
        }
        args.push(format!("[{inner}]"));
    }
    if let Some(v) = d.imm {
        if let Some(r) = reloc_at(relocs, offset as u64 + u64::from(fmt.imm_pos)) {
            args.push(symbolic(&r.sym, i64::from(r.addend)));
        } else if d.imm_is_float {
            let f = match fmt.imm_size {
                2 => f16_to_f64(v as u16),
                _ => f64::from(f32::from_bits(v as u32)),
            };
            args.push(format!("{f}"));
        } else {
            args.push(format!("{v}"));
        }
    }
    if let Some(j) = d.jump_offset {
        if let Some(r) = reloc_at(relocs, offset as u64 + u64::from(fmt.jump_pos)) {
            args.push(symbolic(&r.sym, 0));
        } else {
            let target = (offset as i64 + fmt.byte_size() as i64) + j;
            let named = symbols
                .iter()
                .find(|(v, _, _)| *v == target as u64)
                .map(|(_, n, _)| (*n).to_string());
            args.push(named.unwrap_or_else(|| format!("{target:#x}")));
        }
    }
    let mut tail = String::new();
    if fmt.has_mask() && d.fields.mask != 7 {
        let _ = write!(tail, ", mask = v{}", d.fields.mask);
    }
    if let Some(fb) = d.fallback {
        let _ = write!(tail, ", fallback = v{fb}");
    }

    let ot_prefix = if fmt.ot_fixed.is_none() && ot != OperandType::Int64 {
        format!("{ot} ")
    } else {
        String::new()
    };
    let has_dest = !d.rec.variant.contains(fcom_asm::VariantFlags::D0)
        && !d.rec.variant.contains(fcom_asm::VariantFlags::M0);
    if has_dest {
        let dest = if fmt.vector && !d.rec.variant.contains(fcom_asm::VariantFlags::D1) {
            format!("v{}", d.fields.rd)
        } else {
            reg_name(d.fields.rd)
        };
        format!(
            "{ot_prefix}{dest} = {}({}{tail})",
            d.rec.name,
            args.join(", ")
        )
    } else if d.rec.num_operands == 0 {
        format!("{ot_prefix}{}", d.rec.name)
    } else {
        format!("{ot_prefix}{}({}{tail})", d.rec.name, args.join(", "))
    }
}

fn base_name(code: u8) -> String {
    match code {
        28 => "ip".to_string(),
        29 => "datap".to_string(),
        30 => "threadp".to_string(),
        31 => "sp".to_string(),
        r => format!("r{r}"),
    }
}

fn reloc_at<'r>(relocs: &[&'r Relocation], offset: u64) -> Option<&'r Relocation> {
    relocs.iter().find(|r| r.offset == offset).copied()
}

fn symbolic(sym: &str, addend: i64) -> String {
    match addend {
        0 => sym.to_string(),
        a if a > 0 => format!("{sym}+{a:#x}"),
        a => format!("{sym}-{:#x}", -a),
    }
}

fn data_section(out: &mut String, obj: &ObjectFile, index: u32) {
    let section = &obj.sections[index as usize];
    let symbols = section_symbols(obj, index);

    if section.sh_type == Some(SectionType::Nobits) {
        for (value, name, unit) in &symbols {
            let _ = writeln!(
                out,
                "    {} {}  // at {value:#x}",
                type_name(*unit),
                name
            );
        }
        if symbols.is_empty() && section.nobits_size > 0 {
            let _ = writeln!(out, "    int8 anonymous[{}]", section.nobits_size);
        }
        return;
    }

    let mut offset = 0usize;
    let mut next_sym = 0usize;
    while offset < section.data.len() {
        // advance to the next symbol; bytes before it dump as int8
        let (unit, label) = if next_sym < symbols.len()
            && symbols[next_sym].0 == offset as u64
        {
            let s = symbols[next_sym];
            next_sym += 1;
            (s.2.max(1), Some(s.1))
        } else {
            (1, None)
        };
        let end = if next_sym < symbols.len() {
            (symbols[next_sym].0 as usize).min(section.data.len())
        } else {
            section.data.len()
        };
        let mut values = Vec::new();
        let mut at = offset;
        while at + unit as usize <= end {
            let v = read_unit(&section.data, at, unit);
            values.push(format!("{v:#x}"));
            at += unit as usize;
        }
        if at < end {
            for b in &section.data[at..end] {
                values.push(format!("{b:#x}"));
            }
            at = end;
        }
        match label {
            Some(name) => {
                let _ = writeln!(
                    out,
                    "    {name}: {} {}",
                    type_name(unit),
                    values.join(", ")
                );
            }
            None => {
                let _ = writeln!(out, "    int8 anonymous_{offset:#x}[] = {}", values.join(", "));
            }
        }
        offset = at.max(offset + 1);
    }
}

fn read_unit(data: &[u8], at: usize, unit: u32) -> u64 {
    let mut v = 0u64;
    for i in 0..unit.min(8) as usize {
        v |= u64::from(data[at + i]) << (8 * i);
    }
    v
}

fn type_name(unit: u32) -> &'static str {
    match unit {
        2 => "int16",
        4 => "int32",
        8 => "int64",
        _ => "int8",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;

    #[test]
    fn disassembles_simple_function() {
        let src = "code section execute\n\
                   main: function public\n\
                   r0 = 5\n\
                   r1 = 7\n\
                   r0 = add(r0, r1)\n\
                   return\n\
                   main end\n\
                   code end\n";
        let assembled = assemble(src).expect("must assemble");
        let text = disassemble(&assembled.object).expect("must disassemble");
        assert!(text.contains("main:"), "{text}");
        assert!(text.contains("add"), "{text}");
        assert!(text.contains("return"), "{text}");
        assert!(text.contains("code section execute"), "{text}");
    }

    #[test]
    fn reloc_annotations_replace_literals() {
        let src = "data section read write\n\
                   int32 x = 0x100\n\
                   data end\n\
                   code section execute\n\
                   main: function public\n\
                   int32 r0 = x\n\
                   return\n\
                   main end\n\
                   code end\n";
        let assembled = assemble(src).expect("must assemble");
        let text = disassemble(&assembled.object).expect("must disassemble");
        assert!(text.contains("[x]"), "{text}");
        assert!(text.contains("x: int32 0x100"), "{text}");
    }

    #[test]
    fn jump_targets_resolve_to_labels() {
        let src = "code section execute\n\
                   main: function public\n\
                   loop:\n\
                   r1 = sub(r1, 1)\n\
                   jump_nzero(r1, loop)\n\
                   return\n\
                   main end\n\
                   code end\n";
        let assembled = assemble(src).expect("must assemble");
        let text = disassemble(&assembled.object).expect("must disassemble");
        assert!(text.contains("loop"), "{text}");
    }
}
