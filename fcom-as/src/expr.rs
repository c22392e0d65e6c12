//! Assemble-time expression evaluation.
//!
//! Values are an algebraic sum: integers, floats, strings, registers,
//! memory operands, symbol references and symbol differences, plus an
//! `Unresolved` case for forward references that consumers must tolerate
//! re-evaluating later.
//!
//! Evaluation is recursive descent over an inclusive token span: find the
//! weakest operator outside any bracket, recurse on both halves, then
//! dispatch on the operand kinds.

use crate::token::{op, reg_class, unescape_string, Token, TokenKind};

/// Register class of a register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClass {
    /// General purpose.
    Gp,
    /// Vector.
    Vec,
    /// Special pointer register (ip, datap, threadp, numcontr).
    Special,
}

/// A register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegOperand {
    /// Class.
    pub class: RegClass,
    /// Register index; for specials, the `reg_class::SP_*` index.
    pub index: u8,
}

impl RegOperand {
    /// Decode a register token id.
    pub fn from_token_id(id: u32) -> Option<Self> {
        let index = (id & reg_class::INDEX) as u8;
        if id & reg_class::GP != 0 {
            Some(Self {
                class: RegClass::Gp,
                index,
            })
        } else if id & reg_class::VEC != 0 {
            Some(Self {
                class: RegClass::Vec,
                index,
            })
        } else if id & reg_class::SPECIAL != 0 {
            Some(Self {
                class: RegClass::Special,
                index,
            })
        } else {
            None
        }
    }
}

/// A memory operand under construction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MemOperand {
    /// Base register (GP or a special pointer).
    pub base: Option<RegOperand>,
    /// Index register, scaled.
    pub index: Option<RegOperand>,
    /// Index scale factor.
    pub scale: i8,
    /// Constant offset.
    pub offset: i64,
    /// Symbolic offset; resolved by the fitter or a relocation.
    pub sym: Option<String>,
    /// Vector length register.
    pub length: Option<RegOperand>,
}

/// A reference to a symbol plus a constant addend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymRef {
    /// Symbol name.
    pub name: String,
    /// Addend.
    pub addend: i64,
}

/// Result of evaluating an expression span.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String bytes.
    Str(Vec<u8>),
    /// Register.
    Reg(RegOperand),
    /// Memory operand.
    Mem(MemOperand),
    /// Symbol reference.
    Sym(SymRef),
    /// Difference of two symbols, for difference relocations.
    SymDiff {
        /// Positive symbol.
        plus: String,
        /// Subtracted symbol.
        minus: String,
        /// Addend.
        addend: i64,
    },
    /// Type name; id as in the token table.
    Type(u32),
    /// Not yet resolvable; consumers must re-evaluate later.
    Unresolved {
        /// The name that failed to resolve.
        name: String,
    },
}

impl ExprValue {
    /// Whether the value involves an unresolved name.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved { .. })
            || matches!(self, Self::Mem(m) if m.sym.is_some())
    }
}

/// Evaluation failure.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum EvalError {
    /// Malformed expression.
    #[error("syntax error: {0}")]
    Syntax(String),
    /// Operands have incompatible kinds for the operator.
    #[error("type error: {0}")]
    Type(String),
    /// Assemble-time division by zero.
    #[error("division by zero")]
    DivZero,
    /// Assignment target is not a meta-variable.
    #[error("cannot assign to {0}")]
    BadAssign(String),
}

/// Name environment for evaluation: meta-variables and symbols.
pub trait NameResolver {
    /// Resolve a name to a value. `None` means unknown (a forward
    /// reference), which evaluates to [`ExprValue::Unresolved`].
    fn resolve(&self, name: &str) -> Option<ExprValue>;

    /// Assign a meta-variable.
    fn assign(&mut self, name: &str, value: ExprValue) -> Result<(), EvalError>;
}

/// Evaluate the inclusive token span `[lo, hi]`.
pub fn evaluate(
    tokens: &[Token],
    source: &str,
    lo: usize,
    hi: usize,
    env: &mut dyn NameResolver,
) -> Result<ExprValue, EvalError> {
    if lo > hi || hi >= tokens.len() {
        return Err(EvalError::Syntax("empty expression".into()));
    }

    // strip a fully-enclosing bracket pair
    if tokens[lo].kind == TokenKind::Operator
        && tokens[lo].id == op::LPAREN
        && matching_bracket(tokens, lo, hi) == Some(hi)
    {
        if lo + 1 > hi - 1 {
            return Err(EvalError::Syntax("empty parentheses".into()));
        }
        return evaluate(tokens, source, lo + 1, hi - 1, env);
    }
    if tokens[lo].kind == TokenKind::Operator
        && tokens[lo].id == op::LBRACKET
        && matching_bracket(tokens, lo, hi) == Some(hi)
    {
        return parse_memory(tokens, source, lo + 1, hi - 1, env);
    }

    if let Some(k) = weakest_operator(tokens, lo, hi) {
        let t = tokens[k];
        // ternary
        if t.id == op::QUEST {
            let colon = find_ternary_colon(tokens, k + 1, hi)
                .ok_or_else(|| EvalError::Syntax("? without :".into()))?;
            let cond = evaluate(tokens, source, lo, k - 1, env)?;
            return if truthy(&cond)? {
                evaluate(tokens, source, k + 1, colon - 1, env)
            } else {
                evaluate(tokens, source, colon + 1, hi, env)
            };
        }
        // assignment and compound assignment: meta-variable side effects
        if is_assign_op(t.id) {
            if k != lo + 1 || tokens[lo].kind != TokenKind::Name {
                return Err(EvalError::BadAssign("assignment target".into()));
            }
            let name = tokens[lo].text(source).to_string();
            let rhs = evaluate(tokens, source, k + 1, hi, env)?;
            let value = if t.id == op::ASSIGN {
                rhs
            } else {
                let current = env
                    .resolve(&name)
                    .ok_or_else(|| EvalError::BadAssign(name.clone()))?;
                apply_binary(compound_base(t.id), current, rhs)?
            };
            env.assign(&name, value.clone())?;
            return Ok(value);
        }
        // unary prefix
        if k == lo {
            let rhs = evaluate(tokens, source, lo + 1, hi, env)?;
            return apply_unary(t.id, rhs);
        }
        // unary postfix increment and decrement on meta-variables
        if k == hi && matches!(t.id, op::INC | op::DEC) {
            if tokens[lo].kind != TokenKind::Name || lo != hi - 1 {
                return Err(EvalError::Syntax("postfix operator target".into()));
            }
            let name = tokens[lo].text(source).to_string();
            let current = env
                .resolve(&name)
                .ok_or_else(|| EvalError::BadAssign(name.clone()))?;
            let one = ExprValue::Int(1);
            let next = apply_binary(
                if t.id == op::INC { op::ADD } else { op::SUB },
                current.clone(),
                one,
            )?;
            env.assign(&name, next)?;
            return Ok(current);
        }
        let lhs = evaluate(tokens, source, lo, k - 1, env)?;
        let rhs = evaluate(tokens, source, k + 1, hi, env)?;
        return apply_binary(t.id, lhs, rhs);
    }

    // no operator: a single operand
    if lo == hi {
        return leaf(&tokens[lo], source, env);
    }
    Err(EvalError::Syntax("expected an operator".into()))
}

/// Position of the weakest-binding operator outside brackets, if any.
/// For equal priority the rightmost wins (left associativity), except
/// prefix operators where the leftmost must be chosen.
fn weakest_operator(tokens: &[Token], lo: usize, hi: usize) -> Option<usize> {
    let mut depth = 0u32;
    let mut best: Option<usize> = None;
    let mut best_priority = 0u8;
    for k in lo..=hi {
        let t = &tokens[k];
        if t.kind != TokenKind::Operator {
            continue;
        }
        match t.id {
            op::LPAREN | op::LBRACKET => {
                depth += 1;
                continue;
            }
            op::RPAREN | op::RBRACKET => {
                depth = depth.saturating_sub(1);
                continue;
            }
            _ => {}
        }
        if depth > 0 || t.priority == 0 || t.id == op::COLON {
            // the colon of a ternary is handled by the ? arm
            continue;
        }
        // a minus or plus directly after another operator or at the start
        // is prefix; its effective priority is the unary one
        let is_prefix = k == lo
            || (tokens[k - 1].kind == TokenKind::Operator
                && !matches!(tokens[k - 1].id, op::RPAREN | op::RBRACKET | op::INC | op::DEC));
        let priority = if is_prefix { 2 } else { t.priority };
        // assignment and ?: are right-associative: keep the leftmost of
        // equal priority; everything else keeps the rightmost
        let left_assoc = !is_prefix && t.id != op::QUEST && !is_assign_op(t.id);
        let better = match best {
            None => true,
            Some(_) => priority > best_priority || (priority == best_priority && left_assoc),
        };
        if better {
            best = Some(k);
            best_priority = priority;
        }
    }
    best
}

fn matching_bracket(tokens: &[Token], open: usize, hi: usize) -> Option<usize> {
    let close = match tokens[open].id {
        op::LPAREN => op::RPAREN,
        op::LBRACKET => op::RBRACKET,
        _ => return None,
    };
    let mut depth = 0u32;
    for (k, t) in tokens.iter().enumerate().take(hi + 1).skip(open) {
        if t.kind != TokenKind::Operator {
            continue;
        }
        if t.id == op::LPAREN || t.id == op::LBRACKET {
            depth += 1;
        } else if t.id == op::RPAREN || t.id == op::RBRACKET {
            depth -= 1;
            if depth == 0 {
                return if t.id == close { Some(k) } else { None };
            }
        }
    }
    None
}

fn find_ternary_colon(tokens: &[Token], lo: usize, hi: usize) -> Option<usize> {
    let mut depth = 0u32;
    let mut nested = 0u32;
    for (k, t) in tokens.iter().enumerate().take(hi + 1).skip(lo) {
        if t.kind != TokenKind::Operator {
            continue;
        }
        match t.id {
            op::LPAREN | op::LBRACKET => depth += 1,
            op::RPAREN | op::RBRACKET => depth = depth.saturating_sub(1),
            op::QUEST if depth == 0 => nested += 1,
            op::COLON if depth == 0 => {
                if nested == 0 {
                    return Some(k);
                }
                nested -= 1;
            }
            _ => {}
        }
    }
    None
}

fn is_assign_op(id: u32) -> bool {
    matches!(
        id,
        op::ASSIGN
            | op::ADD_ASSIGN
            | op::SUB_ASSIGN
            | op::MUL_ASSIGN
            | op::DIV_ASSIGN
            | op::REM_ASSIGN
            | op::AND_ASSIGN
            | op::OR_ASSIGN
            | op::XOR_ASSIGN
            | op::SHL_ASSIGN
            | op::SHR_ASSIGN
    )
}

fn compound_base(id: u32) -> u32 {
    match id {
        op::ADD_ASSIGN => op::ADD,
        op::SUB_ASSIGN => op::SUB,
        op::MUL_ASSIGN => op::MUL,
        op::DIV_ASSIGN => op::DIV,
        op::REM_ASSIGN => op::REM,
        op::AND_ASSIGN => op::AND,
        op::OR_ASSIGN => op::OR,
        op::XOR_ASSIGN => op::XOR,
        op::SHL_ASSIGN => op::SHL,
        op::SHR_ASSIGN => op::SHR,
        other => other,
    }
}

fn truthy(v: &ExprValue) -> Result<bool, EvalError> {
    match v {
        ExprValue::Int(i) => Ok(*i != 0),
        ExprValue::Float(f) => Ok(*f != 0.0),
        _ => Err(EvalError::Type("condition must be numeric".into())),
    }
}

fn leaf(
    token: &Token,
    source: &str,
    env: &mut dyn NameResolver,
) -> Result<ExprValue, EvalError> {
    match token.kind {
        TokenKind::Int | TokenKind::Char => Ok(ExprValue::Int(token.int_value().unwrap_or(0))),
        TokenKind::Float => match token.value {
            crate::token::TokenValue::Float(f) => Ok(ExprValue::Float(f)),
            _ => Err(EvalError::Syntax("bad float token".into())),
        },
        TokenKind::Str => {
            let text = token.text(source);
            Ok(ExprValue::Str(unescape_string(
                &text[1..text.len().saturating_sub(1)],
            )))
        }
        TokenKind::Register => RegOperand::from_token_id(token.id)
            .map(ExprValue::Reg)
            .ok_or_else(|| EvalError::Syntax("bad register".into())),
        TokenKind::TypeName => Ok(ExprValue::Type(token.id)),
        TokenKind::Name | TokenKind::SymbolRef | TokenKind::Variable => {
            let name = token.text(source);
            Ok(env.resolve(name).unwrap_or(ExprValue::Unresolved {
                name: name.to_string(),
            }))
        }
        _ => Err(EvalError::Syntax(format!(
            "unexpected token {:?}",
            token.kind
        ))),
    }
}

fn apply_unary(id: u32, rhs: ExprValue) -> Result<ExprValue, EvalError> {
    match (id, rhs) {
        (op::SUB, ExprValue::Int(v)) => Ok(ExprValue::Int(v.wrapping_neg())),
        (op::SUB, ExprValue::Float(v)) => Ok(ExprValue::Float(-v)),
        (op::ADD, v @ (ExprValue::Int(_) | ExprValue::Float(_))) => Ok(v),
        (op::NOT, ExprValue::Int(v)) => Ok(ExprValue::Int(!v)),
        (op::LOGNOT, ExprValue::Int(v)) => Ok(ExprValue::Int(i64::from(v == 0))),
        (op::SUB, ExprValue::Sym(s)) => Err(EvalError::Type(format!(
            "cannot negate address of {}",
            s.name
        ))),
        (_, ExprValue::Unresolved { name }) => Ok(ExprValue::Unresolved { name }),
        _ => Err(EvalError::Type("bad unary operand".into())),
    }
}

fn apply_binary(id: u32, lhs: ExprValue, rhs: ExprValue) -> Result<ExprValue, EvalError> {
    use ExprValue::*;

    // unresolved operands poison the result but are not an error
    if let Unresolved { name } = &lhs {
        return Ok(Unresolved { name: name.clone() });
    }
    if let Unresolved { name } = &rhs {
        return Ok(Unresolved { name: name.clone() });
    }

    match (lhs, rhs) {
        (Int(a), Int(b)) => int_binary(id, a, b),
        (Float(a), Float(b)) => float_binary(id, a, b),
        (Int(a), Float(b)) => float_binary(id, a as f64, b),
        (Float(a), Int(b)) => float_binary(id, a, b as f64),
        (Str(mut a), Str(b)) if id == op::ADD => {
            a.extend_from_slice(&b);
            Ok(Str(a))
        }
        (Str(a), Str(b)) if id == op::EQ => Ok(Int(i64::from(a == b))),
        (Str(a), Str(b)) if id == op::NE => Ok(Int(i64::from(a != b))),

        // register arithmetic builds memory operands
        (Reg(r), Int(v)) if id == op::ADD => Ok(Mem(mem_base(r, v)?)),
        (Int(v), Reg(r)) if id == op::ADD => Ok(Mem(mem_base(r, v)?)),
        (Reg(r), Int(v)) if id == op::SUB => Ok(Mem(mem_base(r, v.wrapping_neg())?)),
        (Reg(r), Int(v)) if id == op::MUL => {
            let scale = i8::try_from(v)
                .ok()
                .filter(|s| matches!(s, 1 | 2 | 4 | 8 | 16))
                .ok_or_else(|| EvalError::Type("index scale must be 1, 2, 4, 8 or 16".into()))?;
            Ok(Mem(MemOperand {
                index: Some(r),
                scale,
                ..MemOperand::default()
            }))
        }
        (Reg(a), Reg(b)) if id == op::ADD => {
            let base = mem_base(a, 0)?;
            Ok(Mem(MemOperand {
                index: Some(b),
                scale: 1,
                ..base
            }))
        }
        (Mem(m), Int(v)) if id == op::ADD => Ok(Mem(MemOperand {
            offset: m.offset.wrapping_add(v),
            ..m
        })),
        (Int(v), Mem(m)) if id == op::ADD => Ok(Mem(MemOperand {
            offset: m.offset.wrapping_add(v),
            ..m
        })),
        (Mem(m), Int(v)) if id == op::SUB => Ok(Mem(MemOperand {
            offset: m.offset.wrapping_sub(v),
            ..m
        })),
        (Reg(r), Mem(m)) if id == op::ADD && m.base.is_none() => Ok(Mem(MemOperand {
            base: Some(r),
            ..m
        })),
        (Mem(m), Reg(r)) if id == op::ADD && m.base.is_none() => Ok(Mem(MemOperand {
            base: Some(r),
            ..m
        })),
        (Mem(a), Mem(b)) if id == op::ADD => merge_mem(a, b),

        // symbol arithmetic
        (Sym(s), Int(v)) if id == op::ADD => Ok(Sym(SymRef {
            addend: s.addend.wrapping_add(v),
            ..s
        })),
        (Int(v), Sym(s)) if id == op::ADD => Ok(Sym(SymRef {
            addend: s.addend.wrapping_add(v),
            ..s
        })),
        (Sym(s), Int(v)) if id == op::SUB => Ok(Sym(SymRef {
            addend: s.addend.wrapping_sub(v),
            ..s
        })),
        (Sym(a), Sym(b)) if id == op::SUB => Ok(SymDiff {
            plus: a.name,
            minus: b.name,
            addend: a.addend.wrapping_sub(b.addend),
        }),
        (SymDiff { plus, minus, addend }, Int(v)) if id == op::ADD => Ok(SymDiff {
            plus,
            minus,
            addend: addend.wrapping_add(v),
        }),

        _ => Err(EvalError::Type("incompatible operands".into())),
    }
}

fn mem_base(reg: RegOperand, offset: i64) -> Result<MemOperand, EvalError> {
    if reg.class == RegClass::Vec {
        return Err(EvalError::Type("vector register cannot address memory".into()));
    }
    Ok(MemOperand {
        base: Some(reg),
        offset,
        ..MemOperand::default()
    })
}

fn merge_mem(a: MemOperand, b: MemOperand) -> Result<ExprValue, EvalError> {
    if a.base.is_some() && b.base.is_some() {
        return Err(EvalError::Type("two base registers".into()));
    }
    if a.index.is_some() && b.index.is_some() {
        return Err(EvalError::Type("two index registers".into()));
    }
    Ok(ExprValue::Mem(MemOperand {
        base: a.base.or(b.base),
        index: a.index.or(b.index),
        scale: if a.index.is_some() { a.scale } else { b.scale },
        offset: a.offset.wrapping_add(b.offset),
        sym: a.sym.or(b.sym),
        length: a.length.or(b.length),
    }))
}

fn int_binary(id: u32, a: i64, b: i64) -> Result<ExprValue, EvalError> {
    let v = match id {
        op::ADD => a.wrapping_add(b),
        op::SUB => a.wrapping_sub(b),
        op::MUL => a.wrapping_mul(b),
        op::DIV => a.checked_div(b).ok_or(EvalError::DivZero)?,
        op::REM => a.checked_rem(b).ok_or(EvalError::DivZero)?,
        op::AND => a & b,
        op::OR => a | b,
        op::XOR => a ^ b,
        op::SHL => a.wrapping_shl(b as u32),
        op::SHR => a.wrapping_shr(b as u32),
        op::EQ => i64::from(a == b),
        op::NE => i64::from(a != b),
        op::LT => i64::from(a < b),
        op::GT => i64::from(a > b),
        op::LE => i64::from(a <= b),
        op::GE => i64::from(a >= b),
        op::AND_AND => i64::from(a != 0 && b != 0),
        op::OR_OR => i64::from(a != 0 || b != 0),
        _ => return Err(EvalError::Type("bad integer operator".into())),
    };
    Ok(ExprValue::Int(v))
}

fn float_binary(id: u32, a: f64, b: f64) -> Result<ExprValue, EvalError> {
    let v = match id {
        op::ADD => a + b,
        op::SUB => a - b,
        op::MUL => a * b,
        op::DIV => a / b,
        op::EQ => return Ok(ExprValue::Int(i64::from(a == b))),
        op::NE => return Ok(ExprValue::Int(i64::from(a != b))),
        op::LT => return Ok(ExprValue::Int(i64::from(a < b))),
        op::GT => return Ok(ExprValue::Int(i64::from(a > b))),
        op::LE => return Ok(ExprValue::Int(i64::from(a <= b))),
        op::GE => return Ok(ExprValue::Int(i64::from(a >= b))),
        _ => return Err(EvalError::Type("bad float operator".into())),
    };
    Ok(ExprValue::Float(v))
}

/// Parse the inside of a `[...]` memory operand, including trailing
/// `, option = value` clauses.
fn parse_memory(
    tokens: &[Token],
    source: &str,
    lo: usize,
    hi: usize,
    env: &mut dyn NameResolver,
) -> Result<ExprValue, EvalError> {
    if lo > hi {
        return Err(EvalError::Syntax("empty memory operand".into()));
    }
    // split on top-level commas
    let mut parts: Vec<(usize, usize)> = Vec::new();
    let mut depth = 0u32;
    let mut start = lo;
    for k in lo..=hi {
        let t = &tokens[k];
        if t.kind == TokenKind::Operator {
            match t.id {
                op::LPAREN | op::LBRACKET => depth += 1,
                op::RPAREN | op::RBRACKET => depth = depth.saturating_sub(1),
                op::COMMA if depth == 0 => {
                    parts.push((start, k - 1));
                    start = k + 1;
                }
                _ => {}
            }
        }
    }
    parts.push((start, hi));

    let mut mem = match evaluate(tokens, source, parts[0].0, parts[0].1, env)? {
        ExprValue::Mem(m) => m,
        ExprValue::Reg(r) => mem_base(r, 0)?,
        ExprValue::Int(v) => MemOperand {
            offset: v,
            ..MemOperand::default()
        },
        ExprValue::Sym(s) => MemOperand {
            sym: Some(s.name),
            offset: s.addend,
            ..MemOperand::default()
        },
        ExprValue::Unresolved { name } => MemOperand {
            sym: Some(name),
            ..MemOperand::default()
        },
        _ => return Err(EvalError::Type("bad memory operand".into())),
    };

    for &(plo, phi) in &parts[1..] {
        // expect: OptionName '=' value
        if phi < plo + 2
            || tokens[plo].kind != TokenKind::OptionName
            || tokens[plo + 1].kind != TokenKind::Operator
            || tokens[plo + 1].id != op::ASSIGN
        {
            return Err(EvalError::Syntax("expected option = value".into()));
        }
        let value = evaluate(tokens, source, plo + 2, phi, env)?;
        match (tokens[plo].id, value) {
            (crate::token::option_kw::LENGTH, ExprValue::Reg(r)) if r.class == RegClass::Gp => {
                mem.length = Some(r);
            }
            _ => return Err(EvalError::Syntax("bad memory option".into())),
        }
    }
    Ok(ExprValue::Mem(mem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorSink;
    use crate::token::tokenize;
    use fcom_asm::instruction_set;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Env {
        vars: HashMap<String, ExprValue>,
    }

    impl NameResolver for Env {
        fn resolve(&self, name: &str) -> Option<ExprValue> {
            self.vars.get(name).cloned()
        }
        fn assign(&mut self, name: &str, value: ExprValue) -> Result<(), EvalError> {
            self.vars.insert(name.to_string(), value);
            Ok(())
        }
    }

    fn eval(src: &str) -> ExprValue {
        eval_with(src, &mut Env::default())
    }

    fn eval_with(src: &str, env: &mut Env) -> ExprValue {
        let mut sink = ErrorSink::default();
        let s = tokenize(src, instruction_set().unwrap(), &mut sink);
        assert_eq!(sink.error_count(), 0);
        let line = s.lines[0];
        evaluate(
            &s.tokens,
            src,
            line.first as usize,
            line.last as usize - 1,
            env,
        )
        .unwrap()
    }

    #[test]
    fn precedence_matches_c() {
        assert_eq!(eval("2 + 3 * 4"), ExprValue::Int(14));
        assert_eq!(eval("(2 + 3) * 4"), ExprValue::Int(20));
        assert_eq!(eval("1 << 4 | 1"), ExprValue::Int(17));
        assert_eq!(eval("10 - 4 - 3"), ExprValue::Int(3));
        assert_eq!(eval("7 & 3 == 3"), ExprValue::Int(7 & 1));
    }

    #[test]
    fn unary_and_ternary() {
        assert_eq!(eval("-5 + 2"), ExprValue::Int(-3));
        assert_eq!(eval("~0"), ExprValue::Int(-1));
        assert_eq!(eval("!3"), ExprValue::Int(0));
        assert_eq!(eval("1 ? 10 : 20"), ExprValue::Int(10));
        assert_eq!(eval("0 ? 10 : 20"), ExprValue::Int(20));
        assert_eq!(eval("2 > 1 ? 1 + 1 : 9"), ExprValue::Int(2));
    }

    #[test]
    fn floats_promote() {
        assert_eq!(eval("1 + 2.5"), ExprValue::Float(3.5));
        assert_eq!(eval("3.0 / 2"), ExprValue::Float(1.5));
    }

    #[test]
    fn strings_concatenate() {
        assert_eq!(eval(r#""ab" + "cd""#), ExprValue::Str(b"abcd".to_vec()));
    }

    #[test]
    fn meta_assignment_side_effect() {
        let mut env = Env::default();
        assert_eq!(eval_with("count = 3", &mut env), ExprValue::Int(3));
        assert_eq!(eval_with("count += 2", &mut env), ExprValue::Int(5));
        assert_eq!(eval_with("count * 10", &mut env), ExprValue::Int(50));
        assert_eq!(eval_with("count++", &mut env), ExprValue::Int(5));
        assert_eq!(env.vars["count"], ExprValue::Int(6));
    }

    #[test]
    fn memory_operands() {
        let v = eval("[r1 + 16]");
        let ExprValue::Mem(m) = v else { panic!() };
        assert_eq!(m.base.unwrap().index, 1);
        assert_eq!(m.offset, 16);
        assert_eq!(m.index, None);

        let v = eval("[r1 + r2*4 + 8]");
        let ExprValue::Mem(m) = v else { panic!() };
        assert_eq!(m.base.unwrap().index, 1);
        assert_eq!(m.index.unwrap().index, 2);
        assert_eq!(m.scale, 4);
        assert_eq!(m.offset, 8);

        let v = eval("[r3, length = r2]");
        let ExprValue::Mem(m) = v else { panic!() };
        assert_eq!(m.base.unwrap().index, 3);
        assert_eq!(m.length.unwrap().index, 2);
    }

    #[test]
    fn unresolved_names_poison() {
        let v = eval("later + 4");
        assert_eq!(
            v,
            ExprValue::Unresolved {
                name: "later".into()
            }
        );
        let v = eval("[x]");
        let ExprValue::Mem(m) = v else { panic!() };
        assert_eq!(m.sym.as_deref(), Some("x"));
    }

    #[test]
    fn symbol_difference() {
        let mut env = Env::default();
        env.vars.insert(
            "a".into(),
            ExprValue::Sym(SymRef {
                name: "a".into(),
                addend: 0,
            }),
        );
        env.vars.insert(
            "b".into(),
            ExprValue::Sym(SymRef {
                name: "b".into(),
                addend: 0,
            }),
        );
        let v = eval_with("a - b + 4", &mut env);
        assert_eq!(
            v,
            ExprValue::SymDiff {
                plus: "a".into(),
                minus: "b".into(),
                addend: 4
            }
        );
        let v = eval_with("a + 8", &mut env);
        assert_eq!(
            v,
            ExprValue::Sym(SymRef {
                name: "a".into(),
                addend: 8
            })
        );
    }

    #[test]
    fn division_by_zero_is_reported() {
        let mut sink = ErrorSink::default();
        let s = tokenize("1 / 0", instruction_set().unwrap(), &mut sink);
        let line = s.lines[0];
        let r = evaluate(
            &s.tokens,
            "1 / 0",
            line.first as usize,
            line.last as usize - 1,
            &mut Env::default(),
        );
        assert_eq!(r, Err(EvalError::DivZero));
    }
}
