//! Stack machine for the inline expressions of a protocol (array lengths,
//! case discriminants, conditions, assertions, bindings).
//!
//! Every expression of a compiled protocol lives in one shared [`Code`]
//! buffer; an [`Expr`] is a `start..end` range into it plus its source text.
//! Evaluation pushes onto the context's operand stack and restores it on exit.

use crate::context::Context;
use crate::ruler::MatchError;
use crate::value::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    AndNot,
    Add,
    Sub,
    BitOr,
    Xor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::BitAnd => "&",
            BinOp::AndNot => "&^",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::BitOr => "|",
            BinOp::Xor => "^",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Plus,
    BitNot,
    Not,
}

impl UnOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Plus => "+",
            UnOp::BitNot => "^",
            UnOp::Not => "!",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Push(Value),
    /// Resolve a name against the context chain, then globals.
    Ref(String),
    Member(String),
    Index,
    Unary(UnOp),
    Binary(BinOp),
    MakeList(usize),
    MakeMap(usize),
    /// `&&`: if the top is false, replace it with `false` and jump.
    AndJump(usize),
    /// `||`: if the top is true, replace it with `true` and jump.
    OrJump(usize),
    ToBool,
}

/// Instruction range of one compiled expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Block {
    pub start: usize,
    pub end: usize,
}

/// Shared instruction buffer of a compiled protocol.
#[derive(Debug, Clone, Default)]
pub struct Code {
    instrs: Vec<Instr>,
}

impl Code {
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn emit(&mut self, instr: Instr) -> usize {
        self.instrs.push(instr);
        self.instrs.len() - 1
    }

    /// Point a previously emitted jump at `target`.
    pub fn patch(&mut self, at: usize, target: usize) {
        match self.instrs.get_mut(at) {
            Some(Instr::AndJump(t)) | Some(Instr::OrJump(t)) => *t = target,
            _ => {}
        }
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    /// Listing of the whole buffer, one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (i, instr) in self.instrs.iter().enumerate() {
            out.push_str(&format!("{:04}  {}\n", i, instr));
        }
        out
    }

    pub fn run(&self, block: Block, ctx: &Context<'_>) -> Result<Value, MatchError> {
        let mut stack = ctx.stack();
        let base = stack.len();
        let res = self.exec(block, ctx, &mut stack, base);
        let out = match res {
            Ok(()) if stack.len() > base => stack.pop().unwrap_or_default(),
            Ok(()) => Value::Nil,
            Err(e) => {
                stack.truncate(base);
                return Err(e);
            }
        };
        stack.truncate(base);
        Ok(out)
    }

    fn exec(
        &self,
        block: Block,
        ctx: &Context<'_>,
        stack: &mut Vec<Value>,
        base: usize,
    ) -> Result<(), MatchError> {
        let mut pc = block.start;
        while pc < block.end {
            let instr = self
                .instrs
                .get(pc)
                .ok_or_else(|| MatchError::Eval(format!("pc {} out of code", pc)))?;
            pc += 1;
            match instr {
                Instr::Push(v) => stack.push(v.clone()),
                Instr::Ref(name) => {
                    let v = ctx
                        .lookup(name)
                        .ok_or_else(|| MatchError::Eval(format!("undefined variable: {}", name)))?;
                    stack.push(v);
                }
                Instr::Member(name) => {
                    let v = pop(stack, base)?;
                    stack.push(member(&v, name)?);
                }
                Instr::Index => {
                    let idx = pop(stack, base)?;
                    let v = pop(stack, base)?;
                    stack.push(index(&v, &idx)?);
                }
                Instr::Unary(op) => {
                    let v = pop(stack, base)?;
                    stack.push(apply_unary(*op, &v)?);
                }
                Instr::Binary(op) => {
                    let rhs = pop(stack, base)?;
                    let lhs = pop(stack, base)?;
                    stack.push(apply_binary(*op, &lhs, &rhs)?);
                }
                Instr::MakeList(n) => {
                    if stack.len() < base + n {
                        return Err(underflow());
                    }
                    let items = stack.split_off(stack.len() - n);
                    stack.push(Value::List(items));
                }
                Instr::MakeMap(n) => {
                    if stack.len() < base + 2 * n {
                        return Err(underflow());
                    }
                    let flat = stack.split_off(stack.len() - 2 * n);
                    let mut map = BTreeMap::new();
                    for pair in flat.chunks(2) {
                        let key = match &pair[0] {
                            Value::String(s) => s.clone(),
                            other => {
                                return Err(MatchError::Eval(format!(
                                    "map key must be string, got {}",
                                    other.type_name()
                                )))
                            }
                        };
                        map.insert(key, pair[1].clone());
                    }
                    stack.push(Value::Map(map));
                }
                Instr::AndJump(target) => {
                    let v = pop(stack, base)?;
                    if !truthy(&v)? {
                        stack.push(Value::Bool(false));
                        pc = *target;
                    }
                }
                Instr::OrJump(target) => {
                    let v = pop(stack, base)?;
                    if truthy(&v)? {
                        stack.push(Value::Bool(true));
                        pc = *target;
                    }
                }
                Instr::ToBool => {
                    let v = pop(stack, base)?;
                    stack.push(Value::Bool(truthy(&v)?));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Push(v) => write!(f, "push {}", v.to_json()),
            Instr::Ref(n) => write!(f, "ref {}", n),
            Instr::Member(n) => write!(f, "member .{}", n),
            Instr::Index => write!(f, "index"),
            Instr::Unary(op) => write!(f, "unary {}", op.symbol()),
            Instr::Binary(op) => write!(f, "binary {}", op.symbol()),
            Instr::MakeList(n) => write!(f, "mklist {}", n),
            Instr::MakeMap(n) => write!(f, "mkmap {}", n),
            Instr::AndJump(t) => write!(f, "andjmp {:04}", t),
            Instr::OrJump(t) => write!(f, "orjmp {:04}", t),
            Instr::ToBool => write!(f, "tobool"),
        }
    }
}

fn underflow() -> MatchError {
    MatchError::Eval("operand stack underflow".to_string())
}

fn pop(stack: &mut Vec<Value>, base: usize) -> Result<Value, MatchError> {
    if stack.len() <= base {
        return Err(underflow());
    }
    stack.pop().ok_or_else(underflow)
}

/// A compiled expression: its code range plus the source text for errors.
#[derive(Debug, Clone)]
pub struct Expr {
    pub block: Block,
    pub text: String,
}

impl Expr {
    pub fn eval(&self, ctx: &Context<'_>) -> Result<Value, MatchError> {
        let program = ctx.program();
        program.code.run(self.block, ctx)
    }

    pub fn eval_int(&self, ctx: &Context<'_>) -> Result<i64, MatchError> {
        let v = self.eval(ctx)?;
        v.as_i64().ok_or_else(|| {
            MatchError::Eval(format!("{}: expected integer, got {}", self.text, v.type_name()))
        })
    }

    /// Evaluate as a non-negative count or length.
    pub fn eval_len(&self, ctx: &Context<'_>) -> Result<usize, MatchError> {
        let n = self.eval_int(ctx)?;
        usize::try_from(n)
            .map_err(|_| MatchError::Eval(format!("{}: negative length {}", self.text, n)))
    }

    pub fn eval_bool(&self, ctx: &Context<'_>) -> Result<bool, MatchError> {
        truthy(&self.eval(ctx)?)
    }
}

/// Condition value: a bool, or an integer compared against zero.
pub fn truthy(v: &Value) -> Result<bool, MatchError> {
    match v {
        Value::Bool(b) => Ok(*b),
        _ => match v.as_i64() {
            Some(i) => Ok(i != 0),
            None => Err(MatchError::Eval(format!("{} is not a condition", v.type_name()))),
        },
    }
}

enum Num {
    Int(i64),
    Float(f64),
}

fn num(v: &Value) -> Option<Num> {
    if let Some(i) = v.as_i64() {
        return Some(Num::Int(i));
    }
    v.as_f64().map(Num::Float)
}

fn member(v: &Value, name: &str) -> Result<Value, MatchError> {
    match v {
        Value::Map(m) => Ok(m.get(name).cloned().unwrap_or_default()),
        other => Err(MatchError::Eval(format!(
            "member .{} of non-map {}",
            name,
            other.type_name()
        ))),
    }
}

fn index(v: &Value, idx: &Value) -> Result<Value, MatchError> {
    if let Value::Map(m) = v {
        return match idx {
            Value::String(k) => Ok(m.get(k).cloned().unwrap_or_default()),
            other => Err(MatchError::Eval(format!("map index must be string, got {}", other.type_name()))),
        };
    }
    let i = idx
        .as_i64()
        .ok_or_else(|| MatchError::Eval(format!("index must be integer, got {}", idx.type_name())))?;
    let out_of_range = || MatchError::Eval(format!("index {} out of range", i));
    let i = usize::try_from(i).map_err(|_| out_of_range())?;
    match v {
        Value::List(items) => items.get(i).cloned().ok_or_else(out_of_range),
        Value::Bytes(b) => b.get(i).map(|x| Value::U8(*x)).ok_or_else(out_of_range),
        Value::String(s) => s.as_bytes().get(i).map(|x| Value::U8(*x)).ok_or_else(out_of_range),
        other => Err(MatchError::Eval(format!("cannot index {}", other.type_name()))),
    }
}

pub fn apply_unary(op: UnOp, v: &Value) -> Result<Value, MatchError> {
    let unsupported = || MatchError::UnsupportedUnary { op: op.symbol(), operand: v.type_name() };
    match op {
        UnOp::Not => match truthy(v) {
            Ok(b) => Ok(Value::Bool(!b)),
            Err(_) => Err(unsupported()),
        },
        UnOp::Neg => match num(v) {
            Some(Num::Int(i)) => Ok(Value::I64(i.wrapping_neg())),
            Some(Num::Float(x)) => Ok(Value::Double(-x)),
            None => Err(unsupported()),
        },
        UnOp::Plus => match num(v) {
            Some(Num::Int(i)) => Ok(Value::I64(i)),
            Some(Num::Float(x)) => Ok(Value::Double(x)),
            None => Err(unsupported()),
        },
        UnOp::BitNot => match v.as_i64() {
            Some(i) => Ok(Value::I64(!i)),
            None => Err(unsupported()),
        },
    }
}

/// Equality defined for every pair; different kinds are unequal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (num(a), num(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => return x == y,
        (Some(x), Some(y)) => return as_float(x) == as_float(y),
        _ => {}
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Bytes(x), Value::Bytes(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Nil, Value::Nil) => true,
        (Value::List(_), Value::List(_)) | (Value::Map(_), Value::Map(_)) => a == b,
        _ => false,
    }
}

fn as_float(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(x) => x,
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Option<Ordering>> {
    match (num(a), num(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => return Some(Some(x.cmp(&y))),
        (Some(x), Some(y)) => return Some(as_float(x).partial_cmp(&as_float(y))),
        _ => {}
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(Some(x.cmp(y))),
        (Value::Bytes(x), Value::Bytes(y)) => Some(Some(x.cmp(y))),
        (Value::Bool(x), Value::Bool(y)) => Some(Some(x.cmp(y))),
        _ => None,
    }
}

pub fn apply_binary(op: BinOp, a: &Value, b: &Value) -> Result<Value, MatchError> {
    let unsupported = || MatchError::UnsupportedOp { op: op.symbol(), lhs: a.type_name(), rhs: b.type_name() };
    match op {
        BinOp::Eq => return Ok(Value::Bool(values_equal(a, b))),
        BinOp::Ne => return Ok(Value::Bool(!values_equal(a, b))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = ordering(a, b).ok_or_else(unsupported)?;
            let r = match ord {
                None => false,
                Some(o) => match op {
                    BinOp::Lt => o == Ordering::Less,
                    BinOp::Le => o != Ordering::Greater,
                    BinOp::Gt => o == Ordering::Greater,
                    _ => o != Ordering::Less,
                },
            };
            return Ok(Value::Bool(r));
        }
        BinOp::And => return Ok(Value::Bool(truthy(a)? && truthy(b)?)),
        BinOp::Or => return Ok(Value::Bool(truthy(a)? || truthy(b)?)),
        _ => {}
    }
    match (num(a), num(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => match int_op(op, x, y) {
            Some(r) => r.map(Value::I64),
            None => Err(unsupported()),
        },
        (Some(x), Some(y)) => {
            let (x, y) = (as_float(x), as_float(y));
            match op {
                BinOp::Add => Ok(Value::Double(x + y)),
                BinOp::Sub => Ok(Value::Double(x - y)),
                BinOp::Mul => Ok(Value::Double(x * y)),
                BinOp::Div => Ok(Value::Double(x / y)),
                _ => Err(unsupported()),
            }
        }
        _ => match (op, a, b) {
            (BinOp::Add, Value::String(x), Value::String(y)) => Ok(Value::String(format!("{}{}", x, y))),
            (BinOp::Add, Value::Bytes(x), Value::Bytes(y)) => {
                let mut out = x.clone();
                out.extend_from_slice(y);
                Ok(Value::Bytes(out))
            }
            _ => Err(unsupported()),
        },
    }
}

/// Integer arithmetic; `None` for operators that have no integer meaning.
fn int_op(op: BinOp, x: i64, y: i64) -> Option<Result<i64, MatchError>> {
    let r = match op {
        BinOp::Add => Ok(x.wrapping_add(y)),
        BinOp::Sub => Ok(x.wrapping_sub(y)),
        BinOp::Mul => Ok(x.wrapping_mul(y)),
        BinOp::Div | BinOp::Mod if y == 0 => Err(MatchError::Eval("integer divide by zero".to_string())),
        BinOp::Div => Ok(x.wrapping_div(y)),
        BinOp::Mod => Ok(x.wrapping_rem(y)),
        BinOp::Shl | BinOp::Shr if !(0..64).contains(&y) => {
            Err(MatchError::Eval(format!("shift count {} out of range", y)))
        }
        BinOp::Shl => Ok(x << y),
        BinOp::Shr => Ok(x >> y),
        BinOp::BitAnd => Ok(x & y),
        BinOp::AndNot => Ok(x & !y),
        BinOp::BitOr => Ok(x | y),
        BinOp::Xor => Ok(x ^ y),
        _ => return None,
    };
    Some(r)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(instrs: Vec<Instr>, ctx: &Context<'_>) -> Result<Value, MatchError> {
        let mut code = Code::default();
        for i in instrs {
            code.emit(i);
        }
        let block = Block { start: 0, end: code.len() };
        code.run(block, ctx)
    }

    fn bin(op: BinOp, a: Value, b: Value) -> Result<Value, MatchError> {
        apply_binary(op, &a, &b)
    }

    #[test]
    fn integer_widths_normalize() {
        assert_eq!(bin(BinOp::Add, Value::U8(200), Value::I32(-1)).unwrap(), Value::I64(199));
        assert_eq!(bin(BinOp::AndNot, Value::I64(0b1110), Value::I64(0b0110)).unwrap(), Value::I64(0b1000));
        assert_eq!(bin(BinOp::Shr, Value::I64(-8), Value::I64(1)).unwrap(), Value::I64(-4));
    }

    #[test]
    fn mixed_numbers_promote_to_double() {
        assert_eq!(bin(BinOp::Mul, Value::I64(2), Value::Float(1.5)).unwrap(), Value::Double(3.0));
        assert!(matches!(bin(BinOp::Mod, Value::I64(2), Value::Double(1.5)), Err(MatchError::UnsupportedOp { op: "%", .. })));
    }

    #[test]
    fn divide_and_shift_errors() {
        assert!(matches!(bin(BinOp::Div, Value::I64(1), Value::I64(0)), Err(MatchError::Eval(_))));
        assert!(matches!(bin(BinOp::Mod, Value::I64(1), Value::I64(0)), Err(MatchError::Eval(_))));
        assert!(matches!(bin(BinOp::Shl, Value::I64(1), Value::I64(64)), Err(MatchError::Eval(_))));
        assert!(matches!(bin(BinOp::Shl, Value::I64(1), Value::I64(-1)), Err(MatchError::Eval(_))));
    }

    #[test]
    fn concat_strings_and_bytes() {
        assert_eq!(bin(BinOp::Add, "ab".into(), "cd".into()).unwrap(), Value::from("abcd"));
        assert_eq!(
            bin(BinOp::Add, Value::Bytes(vec![1]), Value::Bytes(vec![2])).unwrap(),
            Value::Bytes(vec![1, 2])
        );
    }

    #[test]
    fn comparisons_across_kinds() {
        assert_eq!(bin(BinOp::Eq, Value::I64(1), "1".into()).unwrap(), Value::Bool(false));
        assert_eq!(bin(BinOp::Ne, Value::Nil, Value::Nil).unwrap(), Value::Bool(false));
        assert_eq!(bin(BinOp::Lt, "abc".into(), "abd".into()).unwrap(), Value::Bool(true));
        assert_eq!(bin(BinOp::Lt, Value::Bool(false), Value::Bool(true)).unwrap(), Value::Bool(true));
        let err = bin(BinOp::Lt, Value::I64(1), "x".into()).unwrap_err();
        assert_eq!(err.to_string(), "unsupported operator: int < string");
    }

    #[test]
    fn unary_ops() {
        assert_eq!(apply_unary(UnOp::Neg, &Value::U16(3)).unwrap(), Value::I64(-3));
        assert_eq!(apply_unary(UnOp::BitNot, &Value::I64(0)).unwrap(), Value::I64(-1));
        assert_eq!(apply_unary(UnOp::Not, &Value::I64(0)).unwrap(), Value::Bool(true));
        assert!(matches!(apply_unary(UnOp::Neg, &"s".into()), Err(MatchError::UnsupportedUnary { op: "-", operand: "string" })));
    }

    #[test]
    fn short_circuit_skips_rhs() {
        let ctx = Context::new();
        // false && undefined
        let v = run(
            vec![Instr::Push(Value::Bool(false)), Instr::AndJump(4), Instr::Ref("missing".into()), Instr::ToBool],
            &ctx,
        );
        assert_eq!(v.unwrap(), Value::Bool(false));
        let v = run(
            vec![Instr::Push(Value::I64(0)), Instr::OrJump(4), Instr::Push(Value::I64(2)), Instr::ToBool],
            &ctx,
        );
        assert_eq!(v.unwrap(), Value::Bool(true));
    }

    #[test]
    fn member_index_and_literals() {
        let mut ctx = Context::new();
        let mut h = BTreeMap::new();
        h.insert("n".to_string(), Value::I32(2));
        ctx.bind("h", Value::Map(h)).unwrap();
        ctx.bind("xs", Value::List(vec![Value::U8(7), Value::U8(9)])).unwrap();
        let v = run(vec![Instr::Ref("h".into()), Instr::Member("n".into())], &ctx).unwrap();
        assert_eq!(v, Value::I32(2));
        let v = run(vec![Instr::Ref("xs".into()), Instr::Push(Value::I64(1)), Instr::Index], &ctx).unwrap();
        assert_eq!(v, Value::U8(9));
        assert!(run(vec![Instr::Ref("xs".into()), Instr::Push(Value::I64(5)), Instr::Index], &ctx).is_err());
        let v = run(
            vec![Instr::Push("k".into()), Instr::Push(Value::I64(1)), Instr::MakeMap(1)],
            &ctx,
        )
        .unwrap();
        assert_eq!(v.get("k"), Some(&Value::I64(1)));
    }

    #[test]
    fn evaluation_restores_stack() {
        let ctx = Context::new();
        assert!(run(vec![Instr::Push(Value::I64(1)), Instr::Ref("nope".into())], &ctx).is_err());
        assert!(ctx.stack().is_empty());
        assert_eq!(run(vec![], &ctx).unwrap(), Value::Nil);
    }
}
