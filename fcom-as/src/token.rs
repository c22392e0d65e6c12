//! Tokenizer: one linear pass over the source bytes.
//!
//! Produces a flat token vector plus line records. A line ends at a
//! newline; `{` and `}` are emitted as single-token lines so the
//! high-level-language pass can treat blocks uniformly. A `;` outside
//! parentheses starts a comment (and therefore ends the line); inside
//! parentheses it is the `for`-header separator token.

use fcom_asm::InstructionSet;

use crate::error::ErrorSink;

/// Token classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Unclassified identifier.
    Name,
    /// Identifier directly followed by `:`.
    Label,
    /// Meta-variable reference, set during classification.
    Variable,
    /// Section name, set during classification.
    SectionName,
    /// Instruction mnemonic.
    Instruction,
    /// Operator or punctuation.
    Operator,
    /// Integer literal.
    Int,
    /// Floating point literal.
    Float,
    /// Character literal.
    Char,
    /// String literal.
    Str,
    /// Directive keyword (`section`, `end`, ...).
    Directive,
    /// Section attribute keyword (`read`, `execute`, ...).
    Attribute,
    /// Type name (`int32`, `double`, ...).
    TypeName,
    /// Operand option keyword (`mask`, `fallback`, ...).
    OptionName,
    /// Register name.
    Register,
    /// Reference to a known symbol, set during classification.
    SymbolRef,
    /// High-level keyword (`if`, `while`, ...).
    HllKeyword,
    /// End of file.
    Eof,
    /// Tokenization error; a diagnostic was reported.
    Error,
}

/// Literal payload of a token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenValue {
    /// No payload.
    None,
    /// Integer or character value.
    Int(i64),
    /// Float value.
    Float(f64),
}

/// One token. `pos`/`len` span the source bytes; `id` holds the register
/// encoding, operator id or keyword id depending on the kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token {
    /// Classification.
    pub kind: TokenKind,
    /// Kind-specific id.
    pub id: u32,
    /// Byte offset in the source.
    pub pos: u32,
    /// Byte length.
    pub len: u32,
    /// Operator priority; larger binds weaker.
    pub priority: u8,
    /// Literal payload.
    pub value: TokenValue,
}

impl Token {
    /// The source text of the token.
    pub fn text<'s>(&self, source: &'s str) -> &'s str {
        &source[self.pos as usize..(self.pos + self.len) as usize]
    }

    /// Integer payload, if any.
    pub fn int_value(&self) -> Option<i64> {
        match self.value {
            TokenValue::Int(v) => Some(v),
            _ => None,
        }
    }
}

/// A source line: a token span plus provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line {
    /// File-of-origin tag; values at or above [`fcom_types::FILE_META`]
    /// mark meta-generated lines.
    pub file: u32,
    /// Line number in the file of origin, 1-based.
    pub linenum: u32,
    /// First token index.
    pub first: u32,
    /// One past the last token index.
    pub last: u32,
}

impl Line {
    /// Number of tokens on the line.
    pub fn len(&self) -> usize {
        (self.last - self.first) as usize
    }

    /// Whether the line has no tokens.
    pub fn is_empty(&self) -> bool {
        self.first == self.last
    }
}

/// Register class bits in a register token's id.
pub mod reg_class {
    /// General purpose register.
    pub const GP: u32 = 0x100;
    /// Vector register.
    pub const VEC: u32 = 0x200;
    /// Special register.
    pub const SPECIAL: u32 = 0x400;
    /// Mask extracting the index.
    pub const INDEX: u32 = 0xff;

    /// Special register indices.
    pub const SP_IP: u32 = 0;
    /// DATAP special register index.
    pub const SP_DATAP: u32 = 1;
    /// THREADP special register index.
    pub const SP_THREADP: u32 = 2;
    /// NUMCONTR special register index.
    pub const SP_NUMCONTR: u32 = 3;
}

/// Operator ids. The id doubles as an index into [`OPERATORS`].
pub mod op {
    macro_rules! ops {
        ($($name:ident = $val:expr;)*) => { $(
            #[allow(missing_docs)]
            pub const $name: u32 = $val;
        )* };
    }
    ops! {
        SHL_ASSIGN = 0; SHR_ASSIGN = 1;
        SHL = 2; SHR = 3; LE = 4; GE = 5; EQ = 6; NE = 7; AND_AND = 8; OR_OR = 9;
        INC = 10; DEC = 11; ADD_ASSIGN = 12; SUB_ASSIGN = 13; MUL_ASSIGN = 14;
        DIV_ASSIGN = 15; REM_ASSIGN = 16; AND_ASSIGN = 17; OR_ASSIGN = 18;
        XOR_ASSIGN = 19;
        ADD = 20; SUB = 21; MUL = 22; DIV = 23; REM = 24; AND = 25; OR = 26;
        XOR = 27; NOT = 28; LOGNOT = 29; LT = 30; GT = 31; ASSIGN = 32;
        LPAREN = 33; RPAREN = 34; LBRACKET = 35; RBRACKET = 36; LBRACE = 37;
        RBRACE = 38; COMMA = 39; COLON = 40; QUEST = 41; SEMI = 42; PERCENT_DEF = 43;
    }
}

/// Operator table: text, id, priority. Ordered longest-first for maximal
/// munch.
pub const OPERATORS: &[(&str, u32, u8)] = &[
    ("<<=", op::SHL_ASSIGN, 14),
    (">>=", op::SHR_ASSIGN, 14),
    ("<<", op::SHL, 5),
    (">>", op::SHR, 5),
    ("<=", op::LE, 6),
    (">=", op::GE, 6),
    ("==", op::EQ, 7),
    ("!=", op::NE, 7),
    ("&&", op::AND_AND, 11),
    ("||", op::OR_OR, 12),
    ("++", op::INC, 2),
    ("--", op::DEC, 2),
    ("+=", op::ADD_ASSIGN, 14),
    ("-=", op::SUB_ASSIGN, 14),
    ("*=", op::MUL_ASSIGN, 14),
    ("/=", op::DIV_ASSIGN, 14),
    ("%=", op::REM_ASSIGN, 14),
    ("&=", op::AND_ASSIGN, 14),
    ("|=", op::OR_ASSIGN, 14),
    ("^=", op::XOR_ASSIGN, 14),
    ("+", op::ADD, 4),
    ("-", op::SUB, 4),
    ("*", op::MUL, 3),
    ("/", op::DIV, 3),
    ("&", op::AND, 8),
    ("|", op::OR, 10),
    ("^", op::XOR, 9),
    ("~", op::NOT, 2),
    ("!", op::LOGNOT, 2),
    ("<", op::LT, 6),
    (">", op::GT, 6),
    ("=", op::ASSIGN, 14),
    ("(", op::LPAREN, 0),
    (")", op::RPAREN, 0),
    ("[", op::LBRACKET, 0),
    ("]", op::RBRACKET, 0),
    ("{", op::LBRACE, 0),
    ("}", op::RBRACE, 0),
    (",", op::COMMA, 15),
    (":", op::COLON, 13),
    ("?", op::QUEST, 13),
    (";", op::SEMI, 16),
    ("%", op::REM, 3),
];

/// Directive keyword ids.
pub mod directive {
    #[allow(missing_docs)]
    pub const SECTION: u32 = 0;
    #[allow(missing_docs)]
    pub const END: u32 = 1;
    #[allow(missing_docs)]
    pub const FUNCTION: u32 = 2;
    #[allow(missing_docs)]
    pub const PUBLIC: u32 = 3;
    #[allow(missing_docs)]
    pub const EXTERN: u32 = 4;
    #[allow(missing_docs)]
    pub const ALIGN: u32 = 5;
}

/// Attribute keyword ids map to section flag bits.
pub mod attribute {
    #[allow(missing_docs)]
    pub const READ: u32 = 0;
    #[allow(missing_docs)]
    pub const WRITE: u32 = 1;
    #[allow(missing_docs)]
    pub const EXECUTE: u32 = 2;
    #[allow(missing_docs)]
    pub const UNINITIALIZED: u32 = 3;
    #[allow(missing_docs)]
    pub const COMMUNAL: u32 = 4;
    #[allow(missing_docs)]
    pub const RELINKABLE: u32 = 5;
    #[allow(missing_docs)]
    pub const THREADLOCAL: u32 = 6;
}

/// High-level keyword ids.
pub mod hll {
    #[allow(missing_docs)]
    pub const IF: u32 = 0;
    #[allow(missing_docs)]
    pub const ELSE: u32 = 1;
    #[allow(missing_docs)]
    pub const WHILE: u32 = 2;
    #[allow(missing_docs)]
    pub const DO: u32 = 3;
    #[allow(missing_docs)]
    pub const FOR: u32 = 4;
    #[allow(missing_docs)]
    pub const SWITCH: u32 = 5;
    #[allow(missing_docs)]
    pub const CASE: u32 = 6;
    #[allow(missing_docs)]
    pub const DEFAULT: u32 = 7;
    #[allow(missing_docs)]
    pub const BREAK: u32 = 8;
    #[allow(missing_docs)]
    pub const CONTINUE: u32 = 9;
}

/// Option keyword ids.
pub mod option_kw {
    #[allow(missing_docs)]
    pub const MASK: u32 = 0;
    #[allow(missing_docs)]
    pub const FALLBACK: u32 = 1;
    #[allow(missing_docs)]
    pub const LENGTH: u32 = 2;
    #[allow(missing_docs)]
    pub const BROADCAST: u32 = 3;
    #[allow(missing_docs)]
    pub const LIMIT: u32 = 4;
    #[allow(missing_docs)]
    pub const SCALAR: u32 = 5;
    #[allow(missing_docs)]
    pub const OPTIONS: u32 = 6;
}

const DIRECTIVES: &[(&str, u32)] = &[
    ("section", directive::SECTION),
    ("end", directive::END),
    ("function", directive::FUNCTION),
    ("public", directive::PUBLIC),
    ("extern", directive::EXTERN),
    ("align", directive::ALIGN),
];

const ATTRIBUTES: &[(&str, u32)] = &[
    ("read", attribute::READ),
    ("write", attribute::WRITE),
    ("execute", attribute::EXECUTE),
    ("uninitialized", attribute::UNINITIALIZED),
    ("communal", attribute::COMMUNAL),
    ("relinkable", attribute::RELINKABLE),
    ("threadlocal", attribute::THREADLOCAL),
];

const HLL_KEYWORDS: &[(&str, u32)] = &[
    ("if", hll::IF),
    ("else", hll::ELSE),
    ("while", hll::WHILE),
    ("do", hll::DO),
    ("for", hll::FOR),
    ("switch", hll::SWITCH),
    ("case", hll::CASE),
    ("default", hll::DEFAULT),
    ("break", hll::BREAK),
    ("continue", hll::CONTINUE),
];

const OPTION_KEYWORDS: &[(&str, u32)] = &[
    ("mask", option_kw::MASK),
    ("fallback", option_kw::FALLBACK),
    ("length", option_kw::LENGTH),
    ("broadcast", option_kw::BROADCAST),
    ("limit", option_kw::LIMIT),
    ("scalar", option_kw::SCALAR),
    ("options", option_kw::OPTIONS),
];

/// Type names map to an `OperandType` repr; bit 4 marks unsigned.
const TYPE_NAMES: &[(&str, u32)] = &[
    ("int8", 0),
    ("int16", 1),
    ("int32", 2),
    ("int64", 3),
    ("int128", 4),
    ("uint8", 0x10),
    ("uint16", 0x11),
    ("uint32", 0x12),
    ("uint64", 0x13),
    ("float", 5),
    ("double", 6),
    ("float16", 7),
];

/// Tokenizer output.
#[derive(Debug, Default)]
pub struct TokenStream {
    /// All tokens.
    pub tokens: Vec<Token>,
    /// Line records over `tokens`.
    pub lines: Vec<Line>,
}

/// Whether block comments may nest.
const NESTED_COMMENTS: bool = true;

/// Tokenize a whole file.
pub fn tokenize(source: &str, iset: &InstructionSet, sink: &mut ErrorSink) -> TokenStream {
    Tokenizer {
        source,
        bytes: source.as_bytes(),
        pos: 0,
        linenum: 1,
        paren_depth: 0,
        iset,
        out: TokenStream::default(),
        line_start_token: 0,
        line_start_num: 1,
        sink,
    }
    .run()
}

struct Tokenizer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    linenum: u32,
    paren_depth: u32,
    iset: &'a InstructionSet,
    out: TokenStream,
    line_start_token: usize,
    line_start_num: u32,
    sink: &'a mut ErrorSink,
}

impl<'a> Tokenizer<'a> {
    fn run(mut self) -> TokenStream {
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            match b {
                b'\n' => {
                    self.end_line();
                    self.pos += 1;
                    self.linenum += 1;
                    self.line_start_num = self.linenum;
                }
                b' ' | b'\t' | b'\r' => self.pos += 1,
                b';' if self.paren_depth == 0 => self.skip_line_comment(),
                b'/' if self.peek(1) == Some(b'/') => self.skip_line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.skip_block_comment(),
                b'"' => self.string_literal(),
                b'\'' => self.char_literal(),
                b'0'..=b'9' => self.number(),
                b'.' if matches!(self.peek(1), Some(b'0'..=b'9')) => self.number(),
                b'{' | b'}' => self.brace(b),
                _ => {
                    if is_ident_start(self.source[self.pos..].chars().next().unwrap_or('\0')) {
                        self.identifier();
                    } else if !self.operator() {
                        self.sink.error(
                            self.linenum,
                            format!("illegal character {:?}", self.source[self.pos..].chars().next().unwrap_or('\0')),
                        );
                        self.emit(TokenKind::Error, 0, self.pos, 1, 0, TokenValue::None);
                        self.pos += 1;
                    }
                }
            }
        }
        self.end_line();
        let at = self.pos;
        self.emit(TokenKind::Eof, 0, at, 0, 0, TokenValue::None);
        self.out
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn emit(&mut self, kind: TokenKind, id: u32, pos: usize, len: usize, priority: u8, value: TokenValue) {
        if self.out.tokens.len() == self.line_start_token {
            self.line_start_num = self.linenum;
        }
        self.out.tokens.push(Token {
            kind,
            id,
            pos: pos as u32,
            len: len as u32,
            priority,
            value,
        });
    }

    fn end_line(&mut self) {
        if self.out.tokens.len() > self.line_start_token {
            self.out.lines.push(Line {
                file: 0,
                linenum: self.line_start_num,
                first: self.line_start_token as u32,
                last: self.out.tokens.len() as u32,
            });
        }
        self.line_start_token = self.out.tokens.len();
        self.line_start_num = self.linenum;
        self.paren_depth = 0;
    }

    fn brace(&mut self, b: u8) {
        // each brace is a line of its own
        self.end_line();
        let id = if b == b'{' { op::LBRACE } else { op::RBRACE };
        self.emit(TokenKind::Operator, id, self.pos, 1, 0, TokenValue::None);
        self.pos += 1;
        self.end_line();
    }

    fn skip_line_comment(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) {
        let start_line = self.linenum;
        self.pos += 2;
        let mut depth = 1u32;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\n' => {
                    self.linenum += 1;
                    self.pos += 1;
                }
                b'/' if self.peek(1) == Some(b'*') && NESTED_COMMENTS => {
                    depth += 1;
                    self.pos += 2;
                }
                b'*' if self.peek(1) == Some(b'/') => {
                    depth -= 1;
                    self.pos += 2;
                    if depth == 0 {
                        return;
                    }
                }
                _ => self.pos += 1,
            }
        }
        self.sink.error(start_line, "unterminated comment");
    }

    fn string_literal(&mut self) {
        let start = self.pos;
        self.pos += 1;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'"' => {
                    self.pos += 1;
                    self.emit(
                        TokenKind::Str,
                        0,
                        start,
                        self.pos - start,
                        0,
                        TokenValue::None,
                    );
                    return;
                }
                b'\n' => break,
                b'\\' => self.pos += 2,
                _ => self.pos += 1,
            }
        }
        self.sink.error(self.linenum, "unterminated string");
        self.emit(TokenKind::Error, 0, start, self.pos - start, 0, TokenValue::None);
    }

    fn char_literal(&mut self) {
        let start = self.pos;
        self.pos += 1;
        let mut value = 0i64;
        let mut closed = false;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\'' => {
                    self.pos += 1;
                    closed = true;
                    break;
                }
                b'\n' => break,
                b'\\' => {
                    let escaped = self.peek(1).unwrap_or(b'\\');
                    value = (value << 8) | i64::from(unescape_byte(escaped));
                    self.pos += 2;
                }
                b => {
                    value = (value << 8) | i64::from(b);
                    self.pos += 1;
                }
            }
        }
        if closed {
            self.emit(
                TokenKind::Char,
                0,
                start,
                self.pos - start,
                0,
                TokenValue::Int(value),
            );
        } else {
            self.sink.error(self.linenum, "unterminated character literal");
            self.emit(TokenKind::Error, 0, start, self.pos - start, 0, TokenValue::None);
        }
    }

    /// Numeric literal DFA.
    fn number(&mut self) {
        #[derive(PartialEq, Clone, Copy)]
        enum S {
            Start,
            AfterZero,
            Digits,
            Hex,
            BinOct,
            AfterDot,
            AfterE,
            AfterESign,
        }
        let start = self.pos;
        let mut state = S::Start;
        let mut radix = 10;
        let mut is_float = false;
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            let next = match (state, b) {
                (S::Start, b'0') => Some(S::AfterZero),
                (S::Start, b'1'..=b'9') => Some(S::Digits),
                (S::Start, b'.') => {
                    is_float = true;
                    Some(S::AfterDot)
                }
                (S::AfterZero, b'x' | b'X') => {
                    radix = 16;
                    Some(S::Hex)
                }
                (S::AfterZero, b'b' | b'B') => {
                    radix = 2;
                    Some(S::BinOct)
                }
                (S::AfterZero, b'o' | b'O') => {
                    radix = 8;
                    Some(S::BinOct)
                }
                (S::AfterZero | S::Digits, b'0'..=b'9') => Some(S::Digits),
                (S::AfterZero | S::Digits, b'.') => {
                    is_float = true;
                    Some(S::AfterDot)
                }
                (S::AfterZero | S::Digits | S::AfterDot, b'e' | b'E') => {
                    is_float = true;
                    Some(S::AfterE)
                }
                (S::Hex, b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F') => Some(S::Hex),
                (S::BinOct, b'0'..=b'9') => Some(S::BinOct),
                (S::AfterDot, b'0'..=b'9') => Some(S::AfterDot),
                (S::AfterE, b'+' | b'-') => Some(S::AfterESign),
                (S::AfterE | S::AfterESign, b'0'..=b'9') => Some(S::AfterESign),
                _ => None,
            };
            match next {
                Some(s) => {
                    state = s;
                    self.pos += 1;
                }
                None => break,
            }
        }
        let text = &self.source[start..self.pos];
        if is_float {
            match text.parse::<f64>() {
                Ok(v) => self.emit(
                    TokenKind::Float,
                    0,
                    start,
                    self.pos - start,
                    0,
                    TokenValue::Float(v),
                ),
                Err(_) => {
                    self.sink.error(self.linenum, format!("bad float literal {text}"));
                    self.emit(TokenKind::Error, 0, start, self.pos - start, 0, TokenValue::None);
                }
            }
        } else {
            let digits = match radix {
                16 => &text[2..],
                2 | 8 => &text[2..],
                _ => text,
            };
            match u64::from_str_radix(digits, radix) {
                Ok(v) => self.emit(
                    TokenKind::Int,
                    0,
                    start,
                    self.pos - start,
                    0,
                    TokenValue::Int(v as i64),
                ),
                Err(_) => {
                    self.sink.error(self.linenum, format!("bad integer literal {text}"));
                    self.emit(TokenKind::Error, 0, start, self.pos - start, 0, TokenValue::None);
                }
            }
        }
    }

    fn identifier(&mut self) {
        let start = self.pos;
        let tail = &self.source[self.pos..];
        let mut chars = tail.char_indices();
        let mut end = tail.len();
        if let Some((_, first)) = chars.next() {
            debug_assert!(is_ident_start(first));
            for (i, c) in chars {
                if !is_ident_continue(c) {
                    end = i;
                    break;
                }
            }
        }
        self.pos = start + end;
        let text = &self.source[start..start + end];

        // register names
        if let Some(id) = register_id(text) {
            self.emit(
                TokenKind::Register,
                id,
                start,
                end,
                0,
                TokenValue::None,
            );
            return;
        }
        // keyword tables
        if let Some(&(_, id)) = DIRECTIVES.iter().find(|&&(t, _)| t == text) {
            self.emit(TokenKind::Directive, id, start, end, 0, TokenValue::None);
            return;
        }
        if let Some(&(_, id)) = ATTRIBUTES.iter().find(|&&(t, _)| t == text) {
            self.emit(TokenKind::Attribute, id, start, end, 0, TokenValue::None);
            return;
        }
        if let Some(&(_, id)) = HLL_KEYWORDS.iter().find(|&&(t, _)| t == text) {
            self.emit(TokenKind::HllKeyword, id, start, end, 0, TokenValue::None);
            return;
        }
        if let Some(&(_, id)) = TYPE_NAMES.iter().find(|&&(t, _)| t == text) {
            self.emit(TokenKind::TypeName, id, start, end, 0, TokenValue::None);
            return;
        }
        if let Some(&(_, id)) = OPTION_KEYWORDS.iter().find(|&&(t, _)| t == text) {
            self.emit(TokenKind::OptionName, id, start, end, 0, TokenValue::None);
            return;
        }
        if let Some(record) = self.iset.find_name(text) {
            self.emit(
                TokenKind::Instruction,
                record.id,
                start,
                end,
                0,
                TokenValue::None,
            );
            return;
        }
        self.emit(TokenKind::Name, 0, start, end, 0, TokenValue::None);
    }

    fn operator(&mut self) -> bool {
        let tail = &self.source[self.pos..];
        for &(text, id, priority) in OPERATORS {
            if tail.starts_with(text) {
                match id {
                    op::LPAREN | op::LBRACKET => self.paren_depth += 1,
                    op::RPAREN | op::RBRACKET => {
                        self.paren_depth = self.paren_depth.saturating_sub(1)
                    }
                    _ => {}
                }
                self.emit(
                    TokenKind::Operator,
                    id,
                    self.pos,
                    text.len(),
                    priority,
                    TokenValue::None,
                );
                self.pos += text.len();
                return true;
            }
        }
        false
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '@' || !c.is_ascii()
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '@' || !c.is_ascii()
}

fn unescape_byte(b: u8) -> u8 {
    match b {
        b'n' => b'\n',
        b't' => b'\t',
        b'r' => b'\r',
        b'0' => 0,
        other => other,
    }
}

/// Unescape the body of a string literal token (without the quotes).
pub fn unescape_string(body: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.bytes();
    while let Some(b) = bytes.next() {
        if b == b'\\' {
            if let Some(e) = bytes.next() {
                out.push(unescape_byte(e));
            }
        } else {
            out.push(b);
        }
    }
    out
}

/// Recognize a register name: `r0`..`r31`, `v0`..`v31`, `sp`, and the
/// special pointers. Returns the encoded register id.
pub fn register_id(text: &str) -> Option<u32> {
    match text {
        "sp" => return Some(reg_class::GP | 31),
        "ip" => return Some(reg_class::SPECIAL | reg_class::SP_IP),
        "datap" => return Some(reg_class::SPECIAL | reg_class::SP_DATAP),
        "threadp" => return Some(reg_class::SPECIAL | reg_class::SP_THREADP),
        "numcontr" => return Some(reg_class::SPECIAL | reg_class::SP_NUMCONTR),
        _ => {}
    }
    let (class, digits) = if let Some(d) = text.strip_prefix('r') {
        (reg_class::GP, d)
    } else if let Some(d) = text.strip_prefix('v') {
        (reg_class::VEC, d)
    } else {
        return None;
    };
    if digits.is_empty() || digits.len() > 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index: u32 = digits.parse().ok()?;
    if index < 32 {
        Some(class | index)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcom_asm::instruction_set;

    fn lex(src: &str) -> TokenStream {
        let mut sink = ErrorSink::default();
        let stream = tokenize(src, instruction_set().unwrap(), &mut sink);
        assert_eq!(sink.error_count(), 0, "{:?}", sink.diagnostics());
        stream
    }

    #[test]
    fn registers_and_names() {
        let s = lex("r0 v31 sp datap counter");
        let kinds: Vec<_> = s.tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            [
                TokenKind::Register,
                TokenKind::Register,
                TokenKind::Register,
                TokenKind::Register,
                TokenKind::Name,
                TokenKind::Eof
            ]
        );
        assert_eq!(s.tokens[0].id, reg_class::GP);
        assert_eq!(s.tokens[1].id, reg_class::VEC | 31);
        assert_eq!(s.tokens[2].id, reg_class::GP | 31);
        assert_eq!(s.tokens[3].id, reg_class::SPECIAL | reg_class::SP_DATAP);
    }

    #[test]
    fn rejects_out_of_range_registers() {
        assert_eq!(register_id("r32"), None);
        assert_eq!(register_id("v99"), None);
        assert_eq!(register_id("r"), None);
        assert_eq!(register_id("r007"), None);
        assert_eq!(register_id("r7"), Some(reg_class::GP | 7));
    }

    #[test]
    fn numeric_literals() {
        let s = lex("12 0x1f 0b101 0o17 3.5 1e3 2.5e-2 0");
        let vals: Vec<_> = s.tokens.iter().map(|t| t.value).collect();
        assert_eq!(vals[0], TokenValue::Int(12));
        assert_eq!(vals[1], TokenValue::Int(31));
        assert_eq!(vals[2], TokenValue::Int(5));
        assert_eq!(vals[3], TokenValue::Int(15));
        assert_eq!(vals[4], TokenValue::Float(3.5));
        assert_eq!(vals[5], TokenValue::Float(1000.0));
        assert_eq!(vals[6], TokenValue::Float(0.025));
        assert_eq!(vals[7], TokenValue::Int(0));
        assert_eq!(s.tokens[4].kind, TokenKind::Float);
        assert_eq!(s.tokens[7].kind, TokenKind::Int);
    }

    #[test]
    fn comments_and_lines() {
        let s = lex("a = 1 // comment\nb = 2 ; also comment\n/* multi\nline /* nested */ */ c");
        // three lines: a = 1, b = 2, c
        assert_eq!(s.lines.len(), 3);
        assert_eq!(s.lines[0].len(), 3);
        assert_eq!(s.lines[1].len(), 3);
        assert_eq!(s.lines[2].len(), 1);
        assert_eq!(s.lines[2].linenum, 4);
    }

    #[test]
    fn braces_are_single_token_lines() {
        let s = lex("if (r0 == 0) {\nr1 = 2\n}");
        let brace_lines: Vec<_> = s
            .lines
            .iter()
            .filter(|l| {
                l.len() == 1
                    && matches!(
                        s.tokens[l.first as usize].id,
                        op::LBRACE | op::RBRACE
                    )
                    && s.tokens[l.first as usize].kind == TokenKind::Operator
            })
            .collect();
        assert_eq!(brace_lines.len(), 2);
        assert_eq!(s.lines.len(), 4);
    }

    #[test]
    fn semicolon_inside_parens_is_a_token() {
        let s = lex("for (r1 = 0; r1 < 8; r1++)");
        let semis = s
            .tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Operator && t.id == op::SEMI)
            .count();
        assert_eq!(semis, 2);
        assert_eq!(s.lines.len(), 1);
    }

    #[test]
    fn instructions_are_recognized() {
        let s = lex("r0 = add(r0, r1)");
        assert!(s
            .tokens
            .iter()
            .any(|t| t.kind == TokenKind::Instruction));
    }

    #[test]
    fn strings_and_chars() {
        let s = lex(r#""hi\n" 'A' 'ab'"#);
        assert_eq!(s.tokens[0].kind, TokenKind::Str);
        assert_eq!(s.tokens[1].value, TokenValue::Int(65));
        assert_eq!(s.tokens[2].value, TokenValue::Int(0x6162));
        assert_eq!(unescape_string(r"hi\n"), b"hi\n");
    }

    #[test]
    fn token_spans_reconstruct_source() {
        let src = "r0 = add(r0, r1)  // tail";
        let s = lex(src);
        let mut cursor = 0usize;
        for t in &s.tokens {
            if t.kind == TokenKind::Eof {
                break;
            }
            // gap before the token must be whitespace only
            assert!(src[cursor..t.pos as usize]
                .chars()
                .all(|c| c.is_whitespace()));
            cursor = (t.pos + t.len) as usize;
        }
        // remainder is whitespace or a comment
        assert!(src[cursor..].trim_start().is_empty() || src[cursor..].trim_start().starts_with("//"));
    }

    #[test]
    fn utf8_identifiers() {
        let s = lex("größe = 1");
        assert_eq!(s.tokens[0].kind, TokenKind::Name);
        assert_eq!(s.tokens[0].text("größe = 1"), "größe");
    }

    #[test]
    fn unterminated_forms_report_errors() {
        let mut sink = ErrorSink::default();
        tokenize("\"abc", instruction_set().unwrap(), &mut sink);
        assert_eq!(sink.error_count(), 1);
        let mut sink = ErrorSink::default();
        tokenize("/* never closed", instruction_set().unwrap(), &mut sink);
        assert_eq!(sink.error_count(), 1);
    }
}
