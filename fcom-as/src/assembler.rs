//! The five-pass assembler.
//!
//! 1. lex the whole file;
//! 2. classify lines, build sections, define data and symbols;
//! 3. turn code lines into [`CodeItem`]s (with jump merging and peephole
//!    rewrites) and lower high-level statements;
//! 4. converge instruction sizes against resolved addresses;
//! 5. encode and serialize into an object file.

use std::collections::HashMap;

use tracing::debug;

use fcom_asm::{instruction_set, Category, InstructionSet, VariantFlags};
use fcom_obj::{
    ObjectFile, RelocKind, Relocation, Section, SectionFlags, SectionType, Symbol, SymbolBinding,
    SymbolFlags, SymbolType,
};
use fcom_types::{bytes::align_up, OperandType, MAX_ALIGN};

use crate::code::CodeItem;
use crate::emit::{encode_item, RelocSpot};
use crate::error::{Diagnostic, ErrorSink};
use crate::expr::{evaluate, EvalError, ExprValue, NameResolver, RegClass, RegOperand, SymRef};
use crate::fitter::{fit_code, ImmValue, JumpValue};
use crate::token::{
    attribute, directive, hll, op, option_kw, tokenize, Line, Token, TokenKind,
};

/// Maximum size-convergence iterations in pass 4.
const MAX_CONVERGE: usize = 8;

/// Assembly failed; the diagnostics say why.
#[derive(Debug)]
pub struct AssembleFailure {
    /// Everything reported during the run.
    pub diagnostics: Vec<Diagnostic>,
}

impl std::fmt::Display for AssembleFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for d in &self.diagnostics {
            writeln!(f, "{d}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AssembleFailure {}

/// Result of a successful run: the object plus any warnings.
#[derive(Debug)]
pub struct Assembled {
    /// The output object module.
    pub object: ObjectFile,
    /// Warnings produced along the way.
    pub diagnostics: Vec<Diagnostic>,
}

/// Assemble a source file into an object module.
pub fn assemble(source: &str) -> Result<Assembled, AssembleFailure> {
    let iset = match instruction_set() {
        Ok(s) => s,
        Err(e) => {
            return Err(AssembleFailure {
                diagnostics: vec![Diagnostic {
                    severity: crate::error::Severity::Fatal,
                    message: e.to_string(),
                    line: 0,
                }],
            })
        }
    };
    let mut asm = Assembler::new(source, iset);
    asm.run();
    let errors = asm.sink.error_count();
    if errors > 0 {
        return Err(AssembleFailure {
            diagnostics: asm.sink.diagnostics().to_vec(),
        });
    }
    let object = asm.build_object();
    Ok(Assembled {
        object,
        diagnostics: asm.sink.diagnostics().to_vec(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Code,
    Data,
    Bss,
}

#[derive(Debug)]
struct SectionBuild {
    name: String,
    kind: SectionKind,
    flags: SectionFlags,
    align: u32,
    data: Vec<u8>,
    uninit_size: u64,
    code_size: u64,
}

#[derive(Debug, Clone)]
struct AsmSymbol {
    section: Option<u32>,
    offset: u64,
    /// For code labels: index of the first code item after the label.
    code_index: Option<usize>,
    unit_size: u32,
    unit_count: u32,
    public: bool,
    external: bool,
    is_function: bool,
    line: u32,
}

#[derive(Debug, Clone)]
enum BlockKind {
    Plain,
    Function,
    If { else_done: bool, label: u32 },
    While { label: u32 },
    DoWhile { label: u32 },
    For { label: u32, step: Option<(usize, usize)> },
    Switch { label: u32 },
}

struct Assembler<'s> {
    source: &'s str,
    iset: &'static InstructionSet,
    sink: ErrorSink,
    tokens: Vec<Token>,
    lines: Vec<Line>,
    sections: Vec<SectionBuild>,
    current_section: Option<u32>,
    current_function: Option<String>,
    symbols: HashMap<String, AsmSymbol>,
    metas: HashMap<String, ExprValue>,
    code: Vec<CodeItem>,
    blocks: Vec<BlockKind>,
    pending_block: Option<BlockKind>,
    expect_do_tail: Option<u32>,
    label_counter: u32,
    entry_symbol: Option<String>,
}

/// Name environment handed to the expression evaluator.
struct Env<'a> {
    metas: &'a mut HashMap<String, ExprValue>,
    symbols: &'a HashMap<String, AsmSymbol>,
}

impl NameResolver for Env<'_> {
    fn resolve(&self, name: &str) -> Option<ExprValue> {
        if let Some(v) = self.metas.get(name) {
            return Some(v.clone());
        }
        if self.symbols.contains_key(name) {
            return Some(ExprValue::Sym(SymRef {
                name: name.to_string(),
                addend: 0,
            }));
        }
        None
    }

    fn assign(&mut self, name: &str, value: ExprValue) -> Result<(), EvalError> {
        if self.symbols.contains_key(name) {
            return Err(EvalError::BadAssign(name.to_string()));
        }
        self.metas.insert(name.to_string(), value);
        Ok(())
    }
}

impl<'s> Assembler<'s> {
    fn new(source: &'s str, iset: &'static InstructionSet) -> Self {
        Self {
            source,
            iset,
            sink: ErrorSink::default(),
            tokens: Vec::new(),
            lines: Vec::new(),
            sections: Vec::new(),
            current_section: None,
            current_function: None,
            symbols: HashMap::new(),
            metas: HashMap::new(),
            code: Vec::new(),
            blocks: Vec::new(),
            pending_block: None,
            expect_do_tail: None,
            label_counter: 0,
            entry_symbol: None,
        }
    }

    fn run(&mut self) {
        // pass 1: lex
        let stream = tokenize(self.source, self.iset, &mut self.sink);
        self.tokens = stream.tokens;
        self.lines = stream.lines;
        if self.sink.should_abort() {
            return;
        }
        // passes 2 and 3 share a single walk: data lines act immediately,
        // code lines produce code items in order
        self.classify_and_generate();
        if self.sink.should_abort() {
            return;
        }
        // pass 4: converge
        self.converge();
    }

    fn eval(&mut self, lo: usize, hi: usize) -> Result<ExprValue, EvalError> {
        let mut env = Env {
            metas: &mut self.metas,
            symbols: &self.symbols,
        };
        evaluate(&self.tokens, self.source, lo, hi, &mut env)
    }

    fn label_name(n: u32, suffix: &str) -> String {
        format!("@L{n}_{suffix}")
    }

    fn define_label(&mut self, name: &str, line: u32) {
        if self.symbols.contains_key(name) {
            self.sink.error(line, format!("duplicate symbol {name}"));
            return;
        }
        self.symbols.insert(
            name.to_string(),
            AsmSymbol {
                section: self.current_section,
                offset: 0,
                code_index: Some(self.code.len()),
                unit_size: 0,
                unit_count: 0,
                public: false,
                external: false,
                is_function: false,
                line,
            },
        );
    }

    // ----- passes 2 and 3 ------------------------------------------------

    fn classify_and_generate(&mut self) {
        let mut li = 0usize;
        while li < self.lines.len() {
            let line = self.lines[li];
            li += 1;
            let (first, last) = (line.first as usize, line.last as usize - 1);
            let t0 = self.tokens[first];
            let linenum = line.linenum;

            match t0.kind {
                TokenKind::Operator if t0.id == op::LBRACE => self.open_brace(linenum),
                TokenKind::Operator if t0.id == op::RBRACE => self.close_brace(linenum, &mut li),
                TokenKind::Directive if t0.id == directive::EXTERN => {
                    self.declare_names(first + 1, last, linenum, true)
                }
                TokenKind::Directive if t0.id == directive::PUBLIC => {
                    self.declare_names(first + 1, last, linenum, false)
                }
                TokenKind::Directive if t0.id == directive::ALIGN => {
                    self.align_directive(first + 1, last, linenum)
                }
                TokenKind::HllKeyword => self.hll_line(t0.id, first, last, linenum, li),
                TokenKind::TypeName if self.is_data_section() => {
                    self.data_definition(first, last, linenum)
                }
                TokenKind::TypeName => self.code_line(first, last, linenum),
                TokenKind::Operator if t0.id == op::REM => self.meta_definition(first, last, linenum),
                TokenKind::Name => self.name_line(first, last, linenum),
                TokenKind::Register | TokenKind::Instruction => {
                    self.code_line(first, last, linenum)
                }
                TokenKind::Operator if t0.id == op::LBRACKET => self.code_line(first, last, linenum),
                TokenKind::Eof => {}
                _ => self
                    .sink
                    .error(linenum, format!("cannot parse line starting with {:?}", t0.kind)),
            }
            if self.sink.should_abort() {
                return;
            }
        }
        if let Some(sec) = self.current_section {
            let name = self.sections[sec as usize].name.clone();
            self.sink
                .error(0, format!("section {name} not closed with end"));
        }
    }

    fn is_data_section(&self) -> bool {
        self.current_section
            .map(|s| self.sections[s as usize].kind != SectionKind::Code)
            .unwrap_or(false)
    }

    /// Lines led by a plain name: section start, section/function end,
    /// label, name-first data definition, or a code line.
    fn name_line(&mut self, first: usize, last: usize, linenum: u32) {
        let name = self.tokens[first].text(self.source).to_string();

        // name section <attrs>
        if last > first
            && self.tokens[first + 1].kind == TokenKind::Directive
            && self.tokens[first + 1].id == directive::SECTION
        {
            self.section_start(&name, first + 2, last, linenum);
            return;
        }
        // name end
        if last == first + 1
            && self.tokens[first + 1].kind == TokenKind::Directive
            && self.tokens[first + 1].id == directive::END
        {
            self.end_directive(&name, linenum);
            return;
        }
        // name : ...
        if last > first
            && self.tokens[first + 1].kind == TokenKind::Operator
            && self.tokens[first + 1].id == op::COLON
        {
            // name : function [public]
            if last >= first + 2
                && self.tokens[first + 2].kind == TokenKind::Directive
                && self.tokens[first + 2].id == directive::FUNCTION
            {
                let public = (first + 3..=last).any(|i| {
                    self.tokens[i].kind == TokenKind::Directive
                        && self.tokens[i].id == directive::PUBLIC
                });
                self.function_start(&name, public, linenum);
                return;
            }
            // name : type value, ...  (assembly-style data definition)
            if last >= first + 2 && self.tokens[first + 2].kind == TokenKind::TypeName {
                self.named_data_definition(&name, first + 2, last, linenum);
                return;
            }
            // plain label
            self.define_label(&name, linenum);
            if last > first + 1 {
                self.code_line(first + 2, last, linenum);
            }
            return;
        }
        // meta assignment without %: name = expr outside sections
        if self.current_section.is_none()
            && last > first
            && self.tokens[first + 1].kind == TokenKind::Operator
            && self.tokens[first + 1].id == op::ASSIGN
        {
            if let Err(e) = self.eval(first, last) {
                self.sink.error(linenum, e.to_string());
            }
            return;
        }
        self.code_line(first, last, linenum);
    }

    fn section_start(&mut self, name: &str, attr_first: usize, last: usize, linenum: u32) {
        if self.current_section.is_some() {
            self.sink.error(linenum, "nested sections are not allowed");
            return;
        }
        let mut flags = SectionFlags::empty();
        let mut kind = SectionKind::Data;
        let mut align = 2u32;
        let mut i = attr_first;
        while i <= last {
            let t = self.tokens[i];
            match (t.kind, t.id) {
                (TokenKind::Attribute, attribute::READ) => flags |= SectionFlags::READ,
                (TokenKind::Attribute, attribute::WRITE) => flags |= SectionFlags::WRITE,
                (TokenKind::Attribute, attribute::EXECUTE) => {
                    flags |= SectionFlags::EXEC | SectionFlags::READ;
                    kind = SectionKind::Code;
                }
                (TokenKind::Attribute, attribute::UNINITIALIZED) => {
                    flags |= SectionFlags::UNINIT;
                    kind = SectionKind::Bss;
                }
                (TokenKind::Attribute, attribute::COMMUNAL) => flags |= SectionFlags::COMDAT,
                (TokenKind::Attribute, attribute::RELINKABLE) => {
                    flags |= SectionFlags::RELINKABLE
                }
                (TokenKind::Attribute, attribute::THREADLOCAL) => {
                    flags |= SectionFlags::THREADP
                }
                (TokenKind::Directive, directive::ALIGN) => {
                    // align = N
                    if i + 2 <= last
                        && self.tokens[i + 1].id == op::ASSIGN
                        && self.tokens[i + 2].kind == TokenKind::Int
                    {
                        let v = self.tokens[i + 2].int_value().unwrap_or(0);
                        match alignment_exponent(v) {
                            Some(e) => align = e,
                            None => self.sink.error(
                                linenum,
                                format!("alignment {v} is not a power of two up to {MAX_ALIGN}"),
                            ),
                        }
                        i += 2;
                    } else {
                        self.sink.error(linenum, "expected align = N");
                    }
                }
                _ => self
                    .sink
                    .error(linenum, format!("bad section attribute {:?}", t.kind)),
            }
            i += 1;
        }
        // base pointer by content kind
        if kind == SectionKind::Code {
            flags |= SectionFlags::IP;
        } else if !flags.contains(SectionFlags::THREADP) {
            if flags.contains(SectionFlags::WRITE) {
                flags |= SectionFlags::DATAP;
            } else {
                flags |= SectionFlags::IP;
            }
        }
        self.current_section = Some(self.sections.len() as u32);
        self.sections.push(SectionBuild {
            name: name.to_string(),
            kind,
            flags,
            align,
            data: Vec::new(),
            uninit_size: 0,
            code_size: 0,
        });
    }

    fn end_directive(&mut self, name: &str, linenum: u32) {
        if self.current_function.as_deref() == Some(name) {
            self.current_function = None;
            return;
        }
        match self.current_section {
            Some(sec) if self.sections[sec as usize].name == name => {
                if self.current_function.is_some() {
                    self.sink.error(linenum, "function not closed before section end");
                    self.current_function = None;
                }
                self.current_section = None;
            }
            _ => self
                .sink
                .error(linenum, format!("end does not match an open section or function: {name}")),
        }
    }

    fn function_start(&mut self, name: &str, public: bool, linenum: u32) {
        let Some(sec) = self.current_section else {
            self.sink.error(linenum, "function outside a section");
            return;
        };
        if self.sections[sec as usize].kind != SectionKind::Code {
            self.sink
                .error(linenum, "function in a section without execute attribute");
            return;
        }
        if self.symbols.contains_key(name) {
            self.sink.error(linenum, format!("duplicate symbol {name}"));
            return;
        }
        self.symbols.insert(
            name.to_string(),
            AsmSymbol {
                section: Some(sec),
                offset: 0,
                code_index: Some(self.code.len()),
                unit_size: 4,
                unit_count: 0,
                public,
                external: false,
                is_function: true,
                line: linenum,
            },
        );
        self.current_function = Some(name.to_string());
        if name == "main" {
            self.entry_symbol = Some(name.to_string());
        }
    }

    fn declare_names(&mut self, first: usize, last: usize, linenum: u32, external: bool) {
        if first > last {
            self.sink.error(linenum, "expected symbol names");
            return;
        }
        let mut i = first;
        while i <= last {
            let t = self.tokens[i];
            if t.kind == TokenKind::Name {
                let name = t.text(self.source).to_string();
                if external {
                    self.symbols.entry(name).or_insert(AsmSymbol {
                        section: None,
                        offset: 0,
                        code_index: None,
                        unit_size: 0,
                        unit_count: 0,
                        public: false,
                        external: true,
                        is_function: false,
                        line: linenum,
                    });
                } else if let Some(sym) = self.symbols.get_mut(&name) {
                    sym.public = true;
                } else {
                    // forward public declaration
                    self.symbols.insert(
                        name,
                        AsmSymbol {
                            section: None,
                            offset: 0,
                            code_index: None,
                            unit_size: 0,
                            unit_count: 0,
                            public: true,
                            external: false,
                            is_function: false,
                            line: linenum,
                        },
                    );
                }
            } else if !(t.kind == TokenKind::Operator && t.id == op::COMMA) {
                self.sink.error(linenum, "expected symbol name");
            }
            i += 1;
        }
    }

    fn align_directive(&mut self, first: usize, last: usize, linenum: u32) {
        let Some(sec) = self.current_section else {
            // accepted silently by some assemblers; here it is an error
            self.sink.error(linenum, "align directive outside a section");
            return;
        };
        let value = if first <= last {
            self.eval(first, last).ok().and_then(|v| match v {
                ExprValue::Int(i) => Some(i),
                _ => None,
            })
        } else {
            None
        };
        let Some(v) = value else {
            self.sink.error(linenum, "align needs a constant");
            return;
        };
        match alignment_exponent(v) {
            Some(e) => {
                let s = &mut self.sections[sec as usize];
                s.align = s.align.max(e);
                if s.kind == SectionKind::Bss {
                    s.uninit_size = align_up(s.uninit_size, v as u64);
                } else if s.kind == SectionKind::Data {
                    let target = align_up(s.data.len() as u64, v as u64);
                    s.data.resize(target as usize, 0);
                }
                // code sections align at emission; record only
            }
            None => self.sink.error(
                linenum,
                format!("alignment {v} is not a power of two up to {MAX_ALIGN}"),
            ),
        }
    }

    fn meta_definition(&mut self, first: usize, last: usize, linenum: u32) {
        // % name = expression
        if last < first + 2
            || self.tokens[first + 1].kind != TokenKind::Name
            || self.tokens[first + 2].id != op::ASSIGN
        {
            self.sink.error(linenum, "expected % name = expression");
            return;
        }
        if let Err(e) = self.eval(first + 1, last) {
            self.sink.error(linenum, e.to_string());
        }
    }

    // ----- data definitions ----------------------------------------------

    /// `int32 x = 1, y = 2` or `int32 arr[4]`. Multi-value lists use the
    /// name-first form `v: int32 1, 2, 3`.
    fn data_definition(&mut self, first: usize, last: usize, linenum: u32) {
        let type_id = self.tokens[first].id;
        let Some((ot, _unsigned)) = type_from_id(type_id) else {
            self.sink.error(linenum, "bad data type");
            return;
        };
        let mut i = first + 1;
        while i <= last {
            if self.tokens[i].kind != TokenKind::Name {
                self.sink.error(linenum, "expected a name");
                return;
            }
            let name = self.tokens[i].text(self.source).to_string();
            i += 1;
            let mut count = 1u32;
            // array suffix
            if i <= last && self.tokens[i].id == op::LBRACKET
                && self.tokens[i].kind == TokenKind::Operator
            {
                let close = (i..=last).find(|&k| {
                    self.tokens[k].kind == TokenKind::Operator
                        && self.tokens[k].id == op::RBRACKET
                });
                let Some(close) = close else {
                    self.sink.error(linenum, "missing ]");
                    return;
                };
                if close > i + 1 {
                    match self.eval(i + 1, close - 1) {
                        Ok(ExprValue::Int(n)) if n >= 0 => count = n as u32,
                        _ => {
                            self.sink.error(linenum, "array size must be a constant");
                            return;
                        }
                    }
                } else {
                    count = 0; // deduced from the initializer list
                }
                i = close + 1;
            }
            // initializer
            let mut values: Vec<ExprValue> = Vec::new();
            if i <= last && self.tokens[i].kind == TokenKind::Operator
                && self.tokens[i].id == op::ASSIGN
            {
                i += 1;
                if i > last {
                    self.sink.error(
                        linenum,
                        "brace initializers are not supported; use the name-first list form",
                    );
                    return;
                }
                let end = self.initializer_end(i, last);
                match self.eval(i, end) {
                    Ok(v) => values.push(v),
                    Err(e) => {
                        self.sink.error(linenum, e.to_string());
                        return;
                    }
                }
                i = end + 1;
            }
            if count == 0 {
                count = values.len().max(1) as u32;
            }
            self.define_data(&name, ot, count, &values, linenum);
            // skip a separating comma
            if i <= last && self.tokens[i].kind == TokenKind::Operator
                && self.tokens[i].id == op::COMMA
            {
                i += 1;
            }
        }
    }

    /// `name : type v0, v1, ...` — the value list fills consecutive units.
    fn named_data_definition(&mut self, name: &str, type_at: usize, last: usize, linenum: u32) {
        let Some((ot, _unsigned)) = type_from_id(self.tokens[type_at].id) else {
            self.sink.error(linenum, "bad data type");
            return;
        };
        let mut values = Vec::new();
        let mut i = type_at + 1;
        while i <= last {
            let end = self.initializer_end(i, last);
            match self.eval(i, end) {
                Ok(v) => values.push(v),
                Err(e) => {
                    self.sink.error(linenum, e.to_string());
                    return;
                }
            }
            i = end + 1;
            if i <= last && self.tokens[i].kind == TokenKind::Operator
                && self.tokens[i].id == op::COMMA
            {
                i += 1;
            }
        }
        let count = values.len().max(1) as u32;
        self.define_data(name, ot, count, &values, linenum);
    }

    /// Index of the last token of the value starting at `i`.
    fn initializer_end(&self, i: usize, last: usize) -> usize {
        let mut depth = 0u32;
        for k in i..=last {
            let t = &self.tokens[k];
            if t.kind == TokenKind::Operator {
                match t.id {
                    op::LPAREN | op::LBRACKET => depth += 1,
                    op::RPAREN | op::RBRACKET => depth = depth.saturating_sub(1),
                    op::COMMA if depth == 0 => return k - 1,
                    _ => {}
                }
            }
        }
        last
    }

    fn define_data(
        &mut self,
        name: &str,
        ot: OperandType,
        count: u32,
        values: &[ExprValue],
        linenum: u32,
    ) {
        let Some(sec) = self.current_section else {
            self.sink.error(linenum, "data definition outside a section");
            return;
        };
        if self.symbols.contains_key(name) {
            self.sink.error(linenum, format!("duplicate symbol {name}"));
            return;
        }
        let unit = ot.data_size() as u64;
        let s = &mut self.sections[sec as usize];
        s.align = s.align.max(ot.size_log2());

        if s.kind == SectionKind::Bss {
            if values.iter().any(|v| !matches!(v, ExprValue::Int(0))) {
                self.sink
                    .error(linenum, "uninitialized section cannot hold initializers");
                return;
            }
            let offset = align_up(s.uninit_size, unit);
            s.uninit_size = offset + unit * u64::from(count);
            self.insert_data_symbol(name, sec, offset, ot, count, linenum);
            return;
        }
        if s.kind == SectionKind::Code {
            self.sink.error(linenum, "data definition in a code section");
            return;
        }

        let offset = align_up(s.data.len() as u64, unit);
        s.data.resize(offset as usize, 0);
        let mut written = 0u32;
        for v in values {
            match v {
                ExprValue::Int(x) => {
                    let bytes = x.to_le_bytes();
                    self.sections[sec as usize]
                        .data
                        .extend_from_slice(&bytes[..unit as usize]);
                    written += 1;
                }
                ExprValue::Float(f) => {
                    let s = &mut self.sections[sec as usize];
                    match ot {
                        OperandType::Float => {
                            s.data.extend_from_slice(&(*f as f32).to_le_bytes())
                        }
                        OperandType::Double => s.data.extend_from_slice(&f.to_le_bytes()),
                        OperandType::Float16 => s
                            .data
                            .extend_from_slice(&fcom_asm::f64_to_f16(*f).to_le_bytes()),
                        _ => {
                            self.sink
                                .error(linenum, "float initializer for integer data");
                            return;
                        }
                    }
                    written += 1;
                }
                ExprValue::Str(bytes) => {
                    if ot != OperandType::Int8 {
                        self.sink.error(linenum, "string initializer needs int8");
                        return;
                    }
                    self.sections[sec as usize].data.extend_from_slice(bytes);
                    written += bytes.len() as u32;
                }
                _ => {
                    self.sink
                        .error(linenum, "initializer must be a constant");
                    return;
                }
            }
        }
        let count = count.max(written);
        // zero-fill the remainder of the declared array
        let total = offset + unit * u64::from(count);
        let s = &mut self.sections[sec as usize];
        if (s.data.len() as u64) < total {
            s.data.resize(total as usize, 0);
        }
        self.insert_data_symbol(name, sec, offset, ot, count, linenum);
    }

    fn insert_data_symbol(
        &mut self,
        name: &str,
        sec: u32,
        offset: u64,
        ot: OperandType,
        count: u32,
        linenum: u32,
    ) {
        self.symbols.insert(
            name.to_string(),
            AsmSymbol {
                section: Some(sec),
                offset,
                code_index: None,
                unit_size: ot.data_size(),
                unit_count: count,
                public: false,
                external: false,
                is_function: false,
                line: linenum,
            },
        );
    }

    // ----- high-level statements -----------------------------------------

    fn open_brace(&mut self, _linenum: u32) {
        let block = self.pending_block.take().unwrap_or(BlockKind::Plain);
        self.blocks.push(block);
    }

    fn close_brace(&mut self, linenum: u32, li: &mut usize) {
        let Some(block) = self.blocks.pop() else {
            self.sink.error(linenum, "unmatched }");
            return;
        };
        match block {
            BlockKind::Plain | BlockKind::Function => {}
            BlockKind::If { label, else_done } => {
                // an else arm may follow immediately
                if !else_done && self.next_line_is_else(*li) {
                    *li += 1; // consume the else line
                    let end = Self::label_name(label, "end");
                    self.emit_jump("jump", None, &end, linenum);
                    self.place_label(&Self::label_name(label, "else"), linenum);
                    self.pending_block = Some(BlockKind::If {
                        label,
                        else_done: true,
                    });
                } else {
                    if else_done {
                        self.place_label(&Self::label_name(label, "end"), linenum);
                    } else {
                        self.place_label(&Self::label_name(label, "else"), linenum);
                        self.place_label(&Self::label_name(label, "end"), linenum);
                    }
                }
            }
            BlockKind::While { label } => {
                self.emit_jump("jump", None, &Self::label_name(label, "top"), linenum);
                self.place_label(&Self::label_name(label, "end"), linenum);
            }
            BlockKind::DoWhile { label } => {
                self.expect_do_tail = Some(label);
            }
            BlockKind::For { label, step } => {
                self.place_label(&Self::label_name(label, "step"), linenum);
                if let Some((lo, hi)) = step {
                    self.code_line(lo, hi, linenum);
                }
                self.emit_jump("jump", None, &Self::label_name(label, "top"), linenum);
                self.place_label(&Self::label_name(label, "end"), linenum);
            }
            BlockKind::Switch { label } => {
                self.place_label(&Self::label_name(label, "end"), linenum);
            }
        }
    }

    fn next_line_is_else(&self, li: usize) -> bool {
        self.lines.get(li).is_some_and(|l| {
            let t = &self.tokens[l.first as usize];
            l.len() == 1 && t.kind == TokenKind::HllKeyword && t.id == hll::ELSE
        })
    }

    fn place_label(&mut self, name: &str, linenum: u32) {
        if self.symbols.contains_key(name) {
            // forward-declared synthetic label: update its position
            if let Some(s) = self.symbols.get_mut(name) {
                s.code_index = Some(self.code.len());
                s.section = self.current_section;
            }
        } else {
            self.define_label(name, linenum);
        }
    }

    /// Reference a synthetic label that will be placed later.
    fn forward_label(&mut self, name: &str, linenum: u32) {
        if !self.symbols.contains_key(name) {
            self.symbols.insert(
                name.to_string(),
                AsmSymbol {
                    section: self.current_section,
                    offset: 0,
                    code_index: None,
                    unit_size: 0,
                    unit_count: 0,
                    public: false,
                    external: false,
                    is_function: false,
                    line: linenum,
                },
            );
        }
    }

    fn hll_line(&mut self, keyword: u32, first: usize, last: usize, linenum: u32, next_li: usize) {
        match keyword {
            hll::IF => {
                self.label_counter += 1;
                let label = self.label_counter;
                let else_label = Self::label_name(label, "else");
                self.forward_label(&else_label, linenum);
                self.forward_label(&Self::label_name(label, "end"), linenum);
                self.emit_condition_jump(first + 1, last, linenum, &else_label, true);
                self.pending_block = Some(BlockKind::If {
                    label,
                    else_done: false,
                });
            }
            hll::WHILE => {
                if let Some(label) = self.expect_do_tail.take() {
                    // tail of a do { } while (cond)
                    let top = Self::label_name(label, "top");
                    self.emit_condition_jump(first + 1, last, linenum, &top, false);
                    return;
                }
                self.label_counter += 1;
                let label = self.label_counter;
                self.place_label(&Self::label_name(label, "top"), linenum);
                let end = Self::label_name(label, "end");
                self.forward_label(&end, linenum);
                self.emit_condition_jump(first + 1, last, linenum, &end, true);
                self.pending_block = Some(BlockKind::While { label });
            }
            hll::DO => {
                self.label_counter += 1;
                let label = self.label_counter;
                self.place_label(&Self::label_name(label, "top"), linenum);
                self.pending_block = Some(BlockKind::DoWhile { label });
            }
            hll::FOR => {
                self.for_line(first, last, linenum);
            }
            hll::SWITCH => {
                self.switch_line(first, last, linenum, next_li);
            }
            hll::CASE => {
                // case K :  — the label was planned by switch_line
                let Some(BlockKind::Switch { label }) = self.innermost_switch() else {
                    self.sink.error(linenum, "case outside switch");
                    return;
                };
                let end = (first + 1..=last)
                    .find(|&i| self.tokens[i].id == op::COLON)
                    .unwrap_or(last + 1);
                match self.eval(first + 1, end.saturating_sub(1)) {
                    Ok(ExprValue::Int(k)) => {
                        self.place_label(&Self::label_name(label, &format!("case{k}")), linenum);
                    }
                    _ => self.sink.error(linenum, "case needs a constant"),
                }
            }
            hll::DEFAULT => {
                let Some(BlockKind::Switch { label }) = self.innermost_switch() else {
                    self.sink.error(linenum, "default outside switch");
                    return;
                };
                self.place_label(&Self::label_name(label, "default"), linenum);
            }
            hll::BREAK => match self.innermost_breakable() {
                Some(label) => {
                    let end = Self::label_name(label, "end");
                    self.emit_jump("jump", None, &end, linenum);
                }
                None => self.sink.error(linenum, "break outside loop or switch"),
            },
            hll::CONTINUE => match self.innermost_loop() {
                Some((label, is_for)) => {
                    let target = if is_for {
                        Self::label_name(label, "step")
                    } else {
                        Self::label_name(label, "top")
                    };
                    self.forward_label(&target, linenum);
                    self.emit_jump("jump", None, &target, linenum);
                }
                None => self.sink.error(linenum, "continue outside loop"),
            },
            hll::ELSE => self.sink.error(linenum, "else without matching if"),
            _ => self.sink.error(linenum, "unsupported statement"),
        }
    }

    fn innermost_switch(&self) -> Option<BlockKind> {
        self.blocks
            .iter()
            .rev()
            .find(|b| matches!(b, BlockKind::Switch { .. }))
            .cloned()
    }

    fn innermost_breakable(&self) -> Option<u32> {
        self.blocks.iter().rev().find_map(|b| match b {
            BlockKind::While { label }
            | BlockKind::DoWhile { label }
            | BlockKind::For { label, .. }
            | BlockKind::Switch { label } => Some(*label),
            _ => None,
        })
    }

    fn innermost_loop(&self) -> Option<(u32, bool)> {
        self.blocks.iter().rev().find_map(|b| match b {
            BlockKind::While { label } | BlockKind::DoWhile { label } => Some((*label, false)),
            BlockKind::For { label, .. } => Some((*label, true)),
            _ => None,
        })
    }

    /// `for (init; cond; step)`.
    fn for_line(&mut self, first: usize, last: usize, linenum: u32) {
        // the parenthesized header with two semicolons
        let open = first + 1;
        if open > last || self.tokens[open].id != op::LPAREN {
            self.sink.error(linenum, "expected ( after for");
            return;
        }
        let close = last;
        if self.tokens[close].id != op::RPAREN {
            self.sink.error(linenum, "expected ) at end of for header");
            return;
        }
        let semis: Vec<usize> = (open + 1..close)
            .filter(|&i| self.tokens[i].kind == TokenKind::Operator && self.tokens[i].id == op::SEMI)
            .collect();
        if semis.len() != 2 {
            self.sink.error(linenum, "for header needs two semicolons");
            return;
        }
        self.label_counter += 1;
        let label = self.label_counter;

        // init
        if semis[0] > open + 1 {
            self.code_line(open + 1, semis[0] - 1, linenum);
        }
        self.place_label(&Self::label_name(label, "top"), linenum);
        let end = Self::label_name(label, "end");
        self.forward_label(&end, linenum);
        if semis[1] > semis[0] + 1 {
            self.emit_condition_jump_span(semis[0] + 1, semis[1] - 1, linenum, &end, true);
        }
        let step = if close > semis[1] + 1 {
            Some((semis[1] + 1, close - 1))
        } else {
            None
        };
        self.forward_label(&Self::label_name(label, "step"), linenum);
        self.pending_block = Some(BlockKind::For { label, step });
    }

    /// `switch (reg)`: pre-scan the body for case labels and emit the
    /// dispatch chain.
    fn switch_line(&mut self, first: usize, last: usize, linenum: u32, next_li: usize) {
        let open = first + 1;
        if open > last || self.tokens[open].id != op::LPAREN || self.tokens[last].id != op::RPAREN
        {
            self.sink.error(linenum, "expected switch (register)");
            return;
        }
        let scrutinee = match self.eval(open + 1, last - 1) {
            Ok(ExprValue::Reg(r)) if r.class == RegClass::Gp => r,
            _ => {
                self.sink.error(linenum, "switch needs a general-purpose register");
                return;
            }
        };
        self.label_counter += 1;
        let label = self.label_counter;

        // pre-scan the upcoming block for case constants
        let cases = self.scan_switch_cases(next_li);
        let mut has_default = false;
        for case in &cases {
            match case {
                Some(k) => {
                    let target = Self::label_name(label, &format!("case{k}"));
                    self.forward_label(&target, linenum);
                    self.emit_fused_jump(
                        "compare_jump_equal",
                        scrutinee,
                        *k,
                        &target,
                        linenum,
                    );
                }
                None => has_default = true,
            }
        }
        let fallthrough = if has_default {
            let d = Self::label_name(label, "default");
            self.forward_label(&d, linenum);
            d
        } else {
            let e = Self::label_name(label, "end");
            self.forward_label(&e, linenum);
            e
        };
        self.emit_jump("jump", None, &fallthrough, linenum);
        self.pending_block = Some(BlockKind::Switch { label });
    }

    /// Collect the case constants of the switch block that starts at line
    /// index `here`. `None` marks a default label.
    fn scan_switch_cases(&mut self, here: usize) -> Vec<Option<i64>> {
        let mut spans: Vec<Option<(usize, usize)>> = Vec::new();
        let mut depth = 0i32;
        for l in &self.lines[here..] {
            let t = self.tokens[l.first as usize];
            if t.kind == TokenKind::Operator && t.id == op::LBRACE {
                depth += 1;
            } else if t.kind == TokenKind::Operator && t.id == op::RBRACE {
                depth -= 1;
                if depth <= 0 {
                    break;
                }
            } else if depth == 1 && t.kind == TokenKind::HllKeyword && t.id == hll::CASE {
                let end = (l.first as usize + 1..l.last as usize)
                    .find(|&i| self.tokens[i].id == op::COLON)
                    .unwrap_or(l.last as usize);
                spans.push(Some((l.first as usize + 1, end.saturating_sub(1))));
            } else if depth == 1 && t.kind == TokenKind::HllKeyword && t.id == hll::DEFAULT {
                spans.push(None);
            }
        }
        let mut cases = Vec::with_capacity(spans.len());
        for span in spans {
            match span {
                Some((lo, hi)) => {
                    if let Ok(ExprValue::Int(k)) = self.eval(lo, hi) {
                        cases.push(Some(k));
                    }
                }
                None => cases.push(None),
            }
        }
        cases
    }

    /// Lower `(lhs OP rhs)` into an inverted or direct conditional jump.
    fn emit_condition_jump(
        &mut self,
        first: usize,
        last: usize,
        linenum: u32,
        target: &str,
        invert: bool,
    ) {
        // strip the parentheses
        if first > last || self.tokens[first].id != op::LPAREN || self.tokens[last].id != op::RPAREN
        {
            self.sink.error(linenum, "expected a parenthesized condition");
            return;
        }
        self.emit_condition_jump_span(first + 1, last - 1, linenum, target, invert);
    }

    fn emit_condition_jump_span(
        &mut self,
        lo: usize,
        hi: usize,
        linenum: u32,
        target: &str,
        invert: bool,
    ) {
        // find the comparison operator
        let cmp = (lo..=hi).find(|&i| {
            self.tokens[i].kind == TokenKind::Operator
                && matches!(self.tokens[i].id, op::EQ | op::NE | op::LT | op::GT | op::LE | op::GE)
        });
        let Some(cmp) = cmp else {
            // bare register: nonzero means true
            match self.eval(lo, hi) {
                Ok(ExprValue::Reg(r)) => {
                    let mnemonic = if invert { "jump_zero" } else { "jump_nzero" };
                    self.emit_reg_jump(mnemonic, r, target, linenum);
                }
                _ => self.sink.error(linenum, "unsupported condition"),
            }
            return;
        };
        let lhs = self.eval(lo, cmp - 1);
        let rhs = self.eval(cmp + 1, hi);
        let (Ok(lhs), Ok(rhs)) = (lhs, rhs) else {
            self.sink.error(linenum, "cannot evaluate condition");
            return;
        };
        let ExprValue::Reg(reg) = lhs else {
            self.sink.error(linenum, "condition must compare a register");
            return;
        };
        let opid = self.tokens[cmp].id;
        match rhs {
            ExprValue::Int(0) => {
                let mnemonic = zero_condition_mnemonic(opid, invert);
                match mnemonic {
                    Some(m) => self.emit_reg_jump(m, reg, target, linenum),
                    None => self.sink.error(linenum, "unsupported zero comparison"),
                }
            }
            ExprValue::Int(k) => {
                let mnemonic = compare_condition_mnemonic(opid, invert);
                match mnemonic {
                    Some(m) => self.emit_fused_jump(m, reg, k, target, linenum),
                    None => self.sink.error(
                        linenum,
                        "comparison not expressible as a fused compare-and-jump",
                    ),
                }
            }
            _ => self.sink.error(
                linenum,
                "condition right side must be a constant (register comparisons need an explicit compare)",
            ),
        }
    }

    fn emit_reg_jump(&mut self, mnemonic: &str, reg: RegOperand, target: &str, linenum: u32) {
        let Some(rec) = self.iset.find_name(mnemonic) else {
            self.sink.error(linenum, format!("unknown instruction {mnemonic}"));
            return;
        };
        let Some(sec) = self.current_code_section(linenum) else {
            return;
        };
        let mut item = CodeItem::new(linenum, sec, rec.id, OperandType::Int64);
        item.operands = vec![ExprValue::Reg(reg)];
        item.target = Some(SymRef {
            name: target.to_string(),
            addend: 0,
        });
        self.push_item(item);
    }

    fn emit_fused_jump(
        &mut self,
        mnemonic: &str,
        reg: RegOperand,
        constant: i64,
        target: &str,
        linenum: u32,
    ) {
        let Some(rec) = self.iset.find_name(mnemonic) else {
            self.sink.error(linenum, format!("unknown instruction {mnemonic}"));
            return;
        };
        let Some(sec) = self.current_code_section(linenum) else {
            return;
        };
        let mut item = CodeItem::new(linenum, sec, rec.id, OperandType::Int64);
        item.dest = if rec.variant.contains(VariantFlags::D0) {
            None
        } else {
            Some(reg)
        };
        item.operands = vec![ExprValue::Reg(reg), ExprValue::Int(constant)];
        item.target = Some(SymRef {
            name: target.to_string(),
            addend: 0,
        });
        self.push_item(item);
    }

    fn emit_jump(&mut self, mnemonic: &str, _reg: Option<RegOperand>, target: &str, linenum: u32) {
        let Some(rec) = self.iset.find_name(mnemonic) else {
            self.sink.error(linenum, format!("unknown instruction {mnemonic}"));
            return;
        };
        let Some(sec) = self.current_code_section(linenum) else {
            return;
        };
        self.forward_label(target, linenum);
        let mut item = CodeItem::new(linenum, sec, rec.id, OperandType::Int64);
        item.target = Some(SymRef {
            name: target.to_string(),
            addend: 0,
        });
        self.push_item(item);
    }

    fn current_code_section(&mut self, linenum: u32) -> Option<u32> {
        match self.current_section {
            Some(s) if self.sections[s as usize].kind == SectionKind::Code => Some(s),
            _ => {
                self.sink.error(linenum, "code outside an executable section");
                None
            }
        }
    }

    // ----- code lines ----------------------------------------------------

    fn code_line(&mut self, mut first: usize, last: usize, linenum: u32) {
        let Some(sec) = self.current_code_section(linenum) else {
            return;
        };

        // optional leading operand type
        let mut ot = OperandType::Int64;
        if self.tokens[first].kind == TokenKind::TypeName {
            match type_from_id(self.tokens[first].id) {
                Some((t, _)) => {
                    ot = t;
                    first += 1;
                }
                None => {
                    self.sink.error(linenum, "bad operand type");
                    return;
                }
            }
            if first > last {
                self.sink.error(linenum, "type without a statement");
                return;
            }
        }

        let t0 = self.tokens[first];

        // bare instruction: return / nop / call f / jump L / instr(...)
        if t0.kind == TokenKind::Instruction {
            self.instruction_statement(None, ot, first, last, linenum, sec);
            return;
        }

        // store form: [mem] = value
        if t0.kind == TokenKind::Operator && t0.id == op::LBRACKET {
            let assign = (first..=last).find(|&i| {
                self.tokens[i].kind == TokenKind::Operator && self.tokens[i].id == op::ASSIGN
            });
            let Some(assign) = assign else {
                self.sink.error(linenum, "expected [address] = value");
                return;
            };
            let mem = self.eval(first, assign - 1);
            let value = self.eval(assign + 1, last);
            let (Ok(ExprValue::Mem(mem)), Ok(value)) = (mem, value) else {
                self.sink.error(linenum, "cannot parse store");
                return;
            };
            let Some(rec) = self.iset.find_name("store") else {
                self.sink.error(linenum, "missing store instruction");
                return;
            };
            let ExprValue::Reg(value) = value else {
                self.sink
                    .error(linenum, "store needs a register value; move immediates first");
                return;
            };
            let mut item = CodeItem::new(linenum, sec, rec.id, ot);
            item.operands = vec![ExprValue::Reg(value), ExprValue::Mem(mem)];
            self.push_item(item);
            return;
        }

        // dest = ...
        if t0.kind == TokenKind::Register {
            let Some(dest) = RegOperand::from_token_id(t0.id) else {
                self.sink.error(linenum, "bad destination register");
                return;
            };
            if first == last {
                self.sink.error(linenum, "expected = after register");
                return;
            }
            let t1 = self.tokens[first + 1];
            if t1.kind == TokenKind::Operator && t1.id == op::ASSIGN {
                self.register_assignment(dest, ot, first + 2, last, linenum, sec);
                return;
            }
            // compound assignment r1 += x, and r1++ / r1--
            if t1.kind == TokenKind::Operator
                && matches!(t1.id, op::INC | op::DEC)
                && first + 1 == last
            {
                let mnemonic = if t1.id == op::INC { "add" } else { "sub" };
                self.emit_binary_op(dest, mnemonic, ExprValue::Reg(dest), ExprValue::Int(1), ot, linenum, sec);
                return;
            }
            if t1.kind == TokenKind::Operator {
                if let Some(mnemonic) = compound_mnemonic(t1.id) {
                    match self.eval(first + 2, last) {
                        Ok(rhs) => self.emit_binary_op(
                            dest,
                            mnemonic,
                            ExprValue::Reg(dest),
                            rhs,
                            ot,
                            linenum,
                            sec,
                        ),
                        Err(e) => self.sink.error(linenum, e.to_string()),
                    }
                    return;
                }
            }
            self.sink.error(linenum, "cannot parse register statement");
            return;
        }

        self.sink.error(linenum, "cannot parse code line");
    }

    /// `dest = <rhs>` where rhs is an instruction call, a register
    /// expression or a plain value.
    fn register_assignment(
        &mut self,
        dest: RegOperand,
        ot: OperandType,
        lo: usize,
        hi: usize,
        linenum: u32,
        sec: u32,
    ) {
        if lo > hi {
            self.sink.error(linenum, "missing right-hand side");
            return;
        }
        // dest = instr(args)
        if self.tokens[lo].kind == TokenKind::Instruction {
            self.instruction_statement(Some((dest, lo)), ot, lo, hi, linenum, sec);
            return;
        }
        // dest = a OP b with a register operand: arithmetic statement
        if let Some(k) = top_level_arith_op(&self.tokens, lo, hi) {
            let lhs = self.eval(lo, k - 1);
            let rhs = self.eval(k + 1, hi);
            let (Ok(lhs), Ok(rhs)) = (lhs, rhs) else {
                self.sink.error(linenum, "cannot evaluate operands");
                return;
            };
            let involves_reg =
                matches!(lhs, ExprValue::Reg(_)) || matches!(rhs, ExprValue::Reg(_));
            if involves_reg {
                let Some(mnemonic) = arith_mnemonic(self.tokens[k].id) else {
                    self.sink.error(linenum, "unsupported register operator");
                    return;
                };
                self.emit_binary_op(dest, mnemonic, lhs, rhs, ot, linenum, sec);
                return;
            }
        }
        // dest = value | register | memory | symbol
        match self.eval(lo, hi) {
            Ok(value) => {
                let Some(rec) = self.iset.find_name("move") else {
                    self.sink.error(linenum, "missing move instruction");
                    return;
                };
                let mut item = CodeItem::new(linenum, sec, rec.id, ot);
                item.dest = Some(dest);
                item.operands = vec![normalize_load_operand(value)];
                self.push_item(item);
            }
            Err(e) => self.sink.error(linenum, e.to_string()),
        }
    }

    fn emit_binary_op(
        &mut self,
        dest: RegOperand,
        mnemonic: &str,
        lhs: ExprValue,
        rhs: ExprValue,
        ot: OperandType,
        linenum: u32,
        sec: u32,
    ) {
        // canonical operand order puts the immediate last; swapping a
        // non-commutative operation changes the mnemonic
        let swap = matches!(
            (&lhs, &rhs),
            (ExprValue::Int(_) | ExprValue::Float(_), ExprValue::Reg(_))
        );
        let mnemonic = if swap {
            match mnemonic {
                "add" | "mul" | "and" | "or" | "xor" => mnemonic,
                "sub" => "sub_rev",
                _ => {
                    self.sink
                        .error(linenum, format!("{mnemonic} needs the register on the left"));
                    return;
                }
            }
        } else {
            mnemonic
        };
        let Some(rec) = self.iset.find_name(mnemonic) else {
            self.sink.error(linenum, format!("unknown instruction {mnemonic}"));
            return;
        };
        let mut item = CodeItem::new(linenum, sec, rec.id, ot);
        item.dest = Some(dest);
        let (a, b) = if swap { (rhs, lhs) } else { (lhs, rhs) };
        item.operands = vec![a, b];
        self.push_item(item);
    }

    /// Parse `instr(arg, ..., mask=vK, fallback=vK)` or an instruction
    /// with bare operands, with `dest` already known.
    fn instruction_statement(
        &mut self,
        dest: Option<(RegOperand, usize)>,
        ot: OperandType,
        first: usize,
        last: usize,
        linenum: u32,
        sec: u32,
    ) {
        let instr_at = first;
        let rec_id = self.tokens[instr_at].id;
        let Some(rec) = self.iset.find_id(rec_id) else {
            self.sink.error(linenum, "unknown instruction");
            return;
        };
        let rec_category = rec.category;
        let rec_d0 = rec.variant.contains(VariantFlags::D0);
        let rec_id = rec.id;

        // operand span: inside parentheses when present
        let (alo, ahi) = if instr_at < last
            && self.tokens[instr_at + 1].kind == TokenKind::Operator
            && self.tokens[instr_at + 1].id == op::LPAREN
            && self.tokens[last].kind == TokenKind::Operator
            && self.tokens[last].id == op::RPAREN
        {
            (instr_at + 2, last - 1)
        } else {
            (instr_at + 1, last)
        };

        let mut item = CodeItem::new(linenum, sec, rec_id, ot);
        item.dest = dest.map(|(d, _)| d);

        // split operand list on top-level commas
        if alo <= ahi {
            let mut i = alo;
            while i <= ahi {
                let end = self.initializer_end(i, ahi);
                // option clauses: mask = vK, fallback = vK
                if self.tokens[i].kind == TokenKind::OptionName
                    && end > i + 1
                    && self.tokens[i + 1].id == op::ASSIGN
                {
                    let kw = self.tokens[i].id;
                    match self.eval(i + 2, end) {
                        Ok(ExprValue::Reg(r)) if r.index < 7 => match kw {
                            option_kw::MASK => item.mask = Some(r.index),
                            option_kw::FALLBACK => item.fallback = Some(r.index),
                            _ => self.sink.error(linenum, "unsupported option"),
                        },
                        _ => self
                            .sink
                            .error(linenum, "option value must be a register below 7"),
                    }
                } else {
                    match self.eval(i, end) {
                        Ok(v) => item.operands.push(v),
                        Err(e) => {
                            self.sink.error(linenum, e.to_string());
                            return;
                        }
                    }
                }
                i = end + 1;
                if i <= ahi
                    && self.tokens[i].kind == TokenKind::Operator
                    && self.tokens[i].id == op::COMMA
                {
                    i += 1;
                }
            }
        }

        // jumps: the last operand is the target
        if rec_category == Category::Jump {
            match item.operands.pop() {
                Some(ExprValue::Sym(s)) => item.target = Some(s),
                Some(ExprValue::Unresolved { name }) => {
                    self.forward_label(&name, linenum);
                    item.target = Some(SymRef { name, addend: 0 });
                }
                other => {
                    self.sink.error(
                        linenum,
                        format!("jump needs a label target, found {other:?}"),
                    );
                    return;
                }
            }
            // conditional jumps on a register keep the register operand;
            // the tested register of D0 forms is not a destination
            if !rec_d0 {
                if item.dest.is_none() {
                    if let Some(ExprValue::Reg(r)) = item.operands.first() {
                        item.dest = Some(*r);
                    }
                }
            }
        } else {
            // a bare symbol operand of a load means a memory reference
            for opnd in &mut item.operands {
                let normalized = normalize_load_operand(std::mem::replace(
                    opnd,
                    ExprValue::Int(0),
                ));
                *opnd = normalized;
            }
        }

        self.push_item(item);
    }

    /// Append with jump merging and peephole rewrites.
    fn push_item(&mut self, mut item: CodeItem) {
        // peephole: add/sub with zero, mul by one → move
        if let Some(rec) = self.iset.find_id(item.id) {
            let neutral = match rec.name.as_str() {
                "add" | "sub" => Some(0),
                "mul" => Some(1),
                _ => None,
            };
            if let Some(n) = neutral {
                if item.operands.len() == 2
                    && matches!(item.operands[1], ExprValue::Int(v) if v == n)
                {
                    if let Some(mv) = self.iset.find_name("move") {
                        item.id = mv.id;
                        item.operands.truncate(1);
                    }
                }
            }
        }
        if let Some(fused) = self.try_merge_jump(&item) {
            self.code.pop();
            self.code.push(fused);
            return;
        }
        self.code.push(item);
    }

    /// Fuse `rd = sub(rd, imm8)` followed by `jump_<cond>(rd, L)` into a
    /// single compare-and-branch instruction.
    fn try_merge_jump(&mut self, jump: &CodeItem) -> Option<CodeItem> {
        let jump_rec = self.iset.find_id(jump.id)?;
        if jump_rec.category != Category::Jump || jump_rec.op1 != fcom_asm::op1::JF_CMP_ZERO {
            return None;
        }
        let opj = jump_rec.opj?;
        let prev = self.code.last()?;
        if prev.section != jump.section {
            return None;
        }
        // no label may point between the two instructions
        let boundary = self.code.len();
        if self
            .symbols
            .values()
            .any(|s| s.code_index == Some(boundary))
        {
            return None;
        }
        let prev_rec = self.iset.find_id(prev.id)?;
        let family = match prev_rec.name.as_str() {
            "sub" => fcom_asm::op1::JF_SUB,
            "add" => fcom_asm::op1::JF_ADD,
            "test_bit" => fcom_asm::op1::JF_TEST_BIT,
            _ => return None,
        };
        let fused_rec = self.iset.find_jump(family, opj)?;
        // the jump must test the register the arithmetic wrote
        let tested = match jump.operands.first() {
            Some(ExprValue::Reg(r)) => *r,
            _ => return None,
        };
        if prev.dest != Some(tested) {
            return None;
        }
        // operand shape: register plus a small immediate
        let (ExprValue::Reg(first), ExprValue::Int(k)) =
            (prev.operands.first()?, prev.operands.get(1)?)
        else {
            return None;
        };
        if *first != tested || !(-0x80..0x80).contains(k) {
            return None;
        }
        let mut fused = CodeItem::new(jump.line, jump.section, fused_rec.id, prev.ot);
        fused.dest = Some(tested);
        fused.operands = vec![ExprValue::Reg(tested), ExprValue::Int(*k)];
        fused.target = jump.target.clone();
        Some(fused)
    }

    // ----- pass 4: size convergence --------------------------------------

    /// Address of a symbol used in code, if known this round: section
    /// index plus offset.
    fn symbol_address(&self, name: &str) -> Option<(u32, u64)> {
        let s = self.symbols.get(name)?;
        let sec = s.section?;
        match s.code_index {
            Some(idx) => {
                // address of the item the label points at
                let addr = self
                    .code
                    .get(idx)
                    .map(|c| c.address)
                    .unwrap_or(self.sections[sec as usize].code_size);
                Some((sec, addr))
            }
            None => {
                if s.external {
                    None
                } else {
                    Some((sec, s.offset))
                }
            }
        }
    }

    fn imm_state(&self, item: &CodeItem) -> ImmValue {
        for opnd in &item.operands {
            match opnd {
                ExprValue::Int(v) => return ImmValue::Int(*v),
                ExprValue::Float(v) => return ImmValue::Float(*v),
                ExprValue::Sym(s) => {
                    // assemble-time constants fold; data symbols relocate
                    return match self.symbols.get(&s.name) {
                        Some(sym) if sym.external => ImmValue::Reloc,
                        Some(_) => ImmValue::Reloc,
                        None => ImmValue::Unknown,
                    };
                }
                ExprValue::SymDiff { .. } => return ImmValue::Reloc,
                ExprValue::Unresolved { name } => {
                    return if self.symbols.contains_key(name) {
                        ImmValue::Reloc
                    } else {
                        ImmValue::Unknown
                    };
                }
                _ => {}
            }
        }
        ImmValue::None
    }

    fn jump_state(&self, item: &CodeItem) -> JumpValue {
        let Some(target) = &item.target else {
            return JumpValue::None;
        };
        match self.symbol_address(&target.name) {
            Some((sec, addr)) if sec == item.section => {
                let from = item.address + item.byte_size();
                JumpValue::Offset(addr as i64 + target.addend - from as i64)
            }
            Some(_) => JumpValue::Reloc,
            None => {
                let known = self.symbols.get(&target.name).is_some_and(|s| s.external);
                if known {
                    JumpValue::Reloc
                } else {
                    JumpValue::Unknown
                }
            }
        }
    }

    fn converge(&mut self) {
        let mut iterations = 0usize;
        loop {
            iterations += 1;
            // assign addresses from current sizes
            let mut cursors = vec![0u64; self.sections.len()];
            for item in &mut self.code {
                item.address = cursors[item.section as usize];
                cursors[item.section as usize] += item.byte_size();
            }
            for (i, s) in self.sections.iter_mut().enumerate() {
                if s.kind == SectionKind::Code {
                    s.code_size = cursors[i];
                }
            }

            let mut grew = false;
            for idx in 0..self.code.len() {
                let mut item = self.code[idx].clone();
                let imm = self.imm_state(&item);
                let jump = self.jump_state(&item);
                let old_words = item.words;
                match fit_code(&mut item, self.iset, imm, jump) {
                    Ok(_) => {
                        if item.words < old_words && iterations > 1 {
                            // never shrink once grown; keeps the iteration
                            // monotonic
                            item.words = old_words;
                            item.chosen = self.code[idx].chosen;
                        }
                        if item.words > old_words {
                            grew = true;
                        }
                        self.code[idx] = item;
                    }
                    Err(e) => {
                        self.sink.error(item.line, e.to_string());
                        self.code[idx] = item;
                    }
                }
            }
            if self.sink.should_abort() {
                return;
            }
            if !grew && iterations > 1 {
                break;
            }
            if iterations == MAX_CONVERGE - 1 {
                // force the larger encodings to guarantee convergence
                for idx in 0..self.code.len() {
                    let needs_force = self.code[idx].target.is_some()
                        || self.imm_state(&self.code[idx]) == ImmValue::Unknown;
                    if needs_force {
                        self.code[idx].force_large = true;
                    }
                }
            }
            if iterations >= MAX_CONVERGE {
                self.sink.warn(
                    0,
                    "instruction size assignment did not converge; larger encodings forced",
                );
                break;
            }
        }
        debug!(iterations, instructions = self.code.len(), "sizes converged");
    }

    // ----- pass 5: emit --------------------------------------------------

    fn build_object(&mut self) -> ObjectFile {
        let mut obj = ObjectFile::new();

        // sections
        for build in &self.sections {
            let sh_type = match build.kind {
                SectionKind::Bss => SectionType::Nobits,
                _ if build.flags.contains(SectionFlags::COMDAT) => SectionType::Comdat,
                _ => SectionType::Progbits,
            };
            obj.add_section(Section {
                name: build.name.clone(),
                sh_type: Some(sh_type),
                flags: build.flags,
                addr: 0,
                align: build.align,
                data: build.data.clone(),
                nobits_size: build.uninit_size,
                module: String::new(),
                library: String::new(),
                relink: Default::default(),
                reguse1: 0,
                reguse2: 0,
            });
        }

        // code bytes and relocations
        for idx in 0..self.code.len() {
            let mut item = self.code[idx].clone();
            // symbolic memory operands address from the base pointer of
            // the target symbol's section
            for opnd in &mut item.operands {
                if let ExprValue::Mem(m) = opnd {
                    if m.base.is_none() && m.sym.is_some() {
                        let flags = m
                            .sym
                            .as_deref()
                            .and_then(|n| self.symbols.get(n))
                            .and_then(|s| s.section)
                            .map(|sec| self.sections[sec as usize].flags);
                        let index = match flags {
                            Some(f) if f.contains(SectionFlags::THREADP) => {
                                crate::token::reg_class::SP_THREADP
                            }
                            Some(f)
                                if f.contains(SectionFlags::IP)
                                    && !f.contains(SectionFlags::WRITE) =>
                            {
                                crate::token::reg_class::SP_IP
                            }
                            _ => crate::token::reg_class::SP_DATAP,
                        };
                        m.base = Some(RegOperand {
                            class: crate::expr::RegClass::Special,
                            index: index as u8,
                        });
                    }
                }
            }
            let imm = self.imm_state(&item);
            let jump = match self.jump_state(&item) {
                JumpValue::Unknown => JumpValue::Reloc,
                other => other,
            };
            let imm = match imm {
                ImmValue::Unknown => {
                    self.sink.error(
                        item.line,
                        "unresolved symbol in operand".to_string(),
                    );
                    ImmValue::Reloc
                }
                other => other,
            };
            match encode_item(&item, self.iset, imm, jump) {
                Ok(encoded) => {
                    let base = item.address;
                    let sec = &mut obj.sections[item.section as usize];
                    debug_assert_eq!(sec.data.len() as u64, base);
                    for w in &encoded.words {
                        sec.data.extend_from_slice(&w.to_le_bytes());
                    }
                    for req in encoded.relocs {
                        let reloc = self.build_relocation(&item, &req);
                        obj.relocations.push(reloc);
                    }
                }
                Err(e) => self.sink.error(item.line, e.to_string()),
            }
        }

        // symbols
        for (name, s) in &self.symbols {
            if name.starts_with('@') {
                continue; // synthetic labels stay internal
            }
            let value = match s.code_index {
                Some(idx) => self
                    .code
                    .get(idx)
                    .map(|c| c.address)
                    .unwrap_or_else(|| {
                        s.section
                            .map(|x| self.sections[x as usize].code_size)
                            .unwrap_or(0)
                    }),
                None => s.offset,
            };
            let binding = if s.external {
                SymbolBinding::Unresolved
            } else if s.public {
                SymbolBinding::Global
            } else {
                SymbolBinding::Local
            };
            let sym_type = if s.is_function {
                SymbolType::Function
            } else if s.code_index.is_some() {
                SymbolType::None
            } else if s.external {
                SymbolType::None
            } else {
                SymbolType::Object
            };
            let mut flags = SymbolFlags::empty();
            if let Some(sec) = s.section {
                let sf = self.sections[sec as usize].flags;
                if sf.contains(SectionFlags::IP) {
                    flags |= SymbolFlags::IP;
                }
                if sf.contains(SectionFlags::DATAP) {
                    flags |= SymbolFlags::DATAP;
                }
                if sf.contains(SectionFlags::THREADP) {
                    flags |= SymbolFlags::THREADP;
                }
                if sf.contains(SectionFlags::EXEC) {
                    flags |= SymbolFlags::EXEC;
                }
                if sf.contains(SectionFlags::READ) {
                    flags |= SymbolFlags::READ;
                }
                if sf.contains(SectionFlags::WRITE) {
                    flags |= SymbolFlags::WRITE;
                }
            }
            obj.symbols.upsert(Symbol {
                name: name.clone(),
                section: s.section,
                value,
                unit_size: s.unit_size,
                unit_count: s.unit_count,
                binding,
                sym_type,
                flags,
                reguse1: 0,
                reguse2: 0,
            });
        }

        // every relocation target must resolve in the symbol table; names
        // never declared become imports
        for r in &obj.relocations {
            if obj.symbols.find(&r.sym).is_none() {
                obj.symbols.upsert(Symbol::import(&r.sym));
            }
            if let Some(rs) = &r.ref_sym {
                if obj.symbols.find(rs).is_none() {
                    obj.symbols.upsert(Symbol::import(rs));
                }
            }
        }

        if let Some(entry) = &self.entry_symbol {
            if let Some((_, addr)) = self.symbol_address(entry) {
                obj.entry = addr;
            }
        }
        obj
    }

    fn build_relocation(&self, item: &CodeItem, req: &crate::emit::RelocRequest) -> Relocation {
        let target_flags = self
            .symbols
            .get(&req.sym)
            .and_then(|s| s.section)
            .map(|sec| self.sections[sec as usize].flags);
        let kind = match req.spot {
            RelocSpot::Jump => RelocKind::SelfRel,
            RelocSpot::Imm | RelocSpot::Addr => match target_flags {
                Some(f) if f.contains(SectionFlags::THREADP) => RelocKind::ThreadpBase,
                Some(f) if f.contains(SectionFlags::DATAP) => RelocKind::DatapBase,
                Some(f) if f.contains(SectionFlags::IP) => RelocKind::IpBase,
                // unknown externals default to the data pointer
                _ => RelocKind::DatapBase,
            },
        };
        let addend = match req.spot {
            // jump offsets count from the end of the instruction
            RelocSpot::Jump => req.addend - (item.byte_size() as i64 - i64::from(req.offset)),
            _ => req.addend,
        };
        Relocation {
            section: item.section,
            offset: item.address + u64::from(req.offset),
            sym: req.sym.clone(),
            ref_sym: None,
            addend: addend as i32,
            kind,
            size: req.size,
            scale: req.scale,
            load_time: false,
        }
    }
}

fn alignment_exponent(v: i64) -> Option<u32> {
    if v <= 0 || v > i64::from(MAX_ALIGN) || (v & (v - 1)) != 0 {
        return None;
    }
    Some(v.trailing_zeros())
}

/// Map a type-name token id to an operand type; bit 4 marks unsigned.
fn type_from_id(id: u32) -> Option<(OperandType, bool)> {
    let unsigned = id & 0x10 != 0;
    OperandType::from_repr((id & 0xf) as u8).map(|t| (t, unsigned))
}

/// A bare symbol as a source operand means a memory load.
fn normalize_load_operand(value: ExprValue) -> ExprValue {
    match value {
        ExprValue::Sym(s) => ExprValue::Mem(crate::expr::MemOperand {
            sym: Some(s.name),
            offset: s.addend,
            ..crate::expr::MemOperand::default()
        }),
        ExprValue::Unresolved { name } => ExprValue::Mem(crate::expr::MemOperand {
            sym: Some(name),
            ..crate::expr::MemOperand::default()
        }),
        other => other,
    }
}

fn top_level_arith_op(tokens: &[Token], lo: usize, hi: usize) -> Option<usize> {
    let mut depth = 0u32;
    for k in lo..=hi {
        let t = &tokens[k];
        if t.kind != TokenKind::Operator {
            continue;
        }
        match t.id {
            op::LPAREN | op::LBRACKET => depth += 1,
            op::RPAREN | op::RBRACKET => depth = depth.saturating_sub(1),
            op::ADD | op::SUB | op::MUL | op::DIV | op::AND | op::OR | op::XOR | op::SHL
            | op::SHR
                if depth == 0 && k > lo =>
            {
                return Some(k)
            }
            _ => {}
        }
    }
    None
}

fn arith_mnemonic(id: u32) -> Option<&'static str> {
    Some(match id {
        op::ADD => "add",
        op::SUB => "sub",
        op::MUL => "mul",
        op::DIV => "div",
        op::AND => "and",
        op::OR => "or",
        op::XOR => "xor",
        op::SHL => "shift_left",
        op::SHR => "shift_right_s",
        _ => return None,
    })
}

fn compound_mnemonic(id: u32) -> Option<&'static str> {
    Some(match id {
        op::ADD_ASSIGN => "add",
        op::SUB_ASSIGN => "sub",
        op::MUL_ASSIGN => "mul",
        op::DIV_ASSIGN => "div",
        op::AND_ASSIGN => "and",
        op::OR_ASSIGN => "or",
        op::XOR_ASSIGN => "xor",
        op::SHL_ASSIGN => "shift_left",
        op::SHR_ASSIGN => "shift_right_s",
        _ => return None,
    })
}

/// Mnemonic for `reg <op> 0` conditions, optionally inverted.
fn zero_condition_mnemonic(opid: u32, invert: bool) -> Option<&'static str> {
    let m = match (opid, invert) {
        (op::EQ, false) | (op::NE, true) => "jump_zero",
        (op::NE, false) | (op::EQ, true) => "jump_nzero",
        (op::LT, false) | (op::GE, true) => "jump_neg",
        (op::GE, false) | (op::LT, true) => "jump_nneg",
        (op::GT, false) | (op::LE, true) => "jump_pos",
        (op::LE, false) | (op::GT, true) => "jump_npos",
        _ => return None,
    };
    Some(m)
}

/// Mnemonic for `reg <op> K` fused compare-and-jump conditions.
fn compare_condition_mnemonic(opid: u32, invert: bool) -> Option<&'static str> {
    let m = match (opid, invert) {
        (op::EQ, false) | (op::NE, true) => "compare_jump_equal",
        (op::NE, false) | (op::EQ, true) => "compare_jump_nequal",
        (op::LT, false) | (op::GE, true) => "compare_jump_less",
        (op::GT, false) | (op::LE, true) => "compare_jump_greater",
        (op::GE, false) | (op::LT, true) => "compare_jump_geq",
        (op::LE, false) | (op::GT, true) => "compare_jump_leq",
        _ => return None,
    };
    Some(m)
}
