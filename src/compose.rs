//! Composite matching units: sequences, repetition, and the units whose
//! behaviour is chosen at match time (`case`, `if`, `read`, `eval`, `lzw`).

use crate::context::{Context, Dom};
use crate::input::Input;
use crate::ruler::{MatchError, Ruler, ERROR_CONTEXT};
use crate::value::Value;
use crate::vm::{values_equal, Expr};
use std::io;
use std::sync::Arc;
use weezl::{decode::Decoder, BitOrder};

/// `A B C`: every unit in the same context; yields the context DOM.
#[derive(Debug)]
pub struct And {
    pub rules: Vec<Arc<dyn Ruler>>,
}

impl Ruler for And {
    fn match_in(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        self.match_step(input, ctx)?;
        Ok(ctx.dom())
    }

    fn match_step(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<(), MatchError> {
        for r in &self.rules {
            r.match_step(input, ctx)?;
        }
        Ok(())
    }

    fn size_of(&self) -> Option<usize> {
        self.rules.iter().map(|r| r.size_of()).sum()
    }

    fn full_name(&self) -> String {
        let names: Vec<_> = self.rules.iter().map(|r| r.full_name()).collect();
        names.join(" ")
    }
}

/// `[A B C]`: each unit in a fresh sub-context, results appended to this
/// context's list.
#[derive(Debug)]
pub struct Seq {
    pub rules: Vec<Arc<dyn Ruler>>,
}

impl Ruler for Seq {
    fn match_in(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        self.match_step(input, ctx)?;
        Ok(ctx.dom())
    }

    fn match_step(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<(), MatchError> {
        ctx.require_list()?;
        for r in &self.rules {
            let v = {
                let mut sub = ctx.child();
                r.match_in(input, &mut sub)?
            };
            ctx.push(v)?;
        }
        Ok(())
    }

    fn size_of(&self) -> Option<usize> {
        None
    }

    fn full_name(&self) -> String {
        let names: Vec<_> = self.rules.iter().map(|r| r.full_name()).collect();
        format!("[{}]", names.join(" "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatKind {
    /// `*`
    ZeroOrMore,
    /// `+`
    OneOrMore,
    /// `?`
    ZeroOrOne,
}

impl RepeatKind {
    pub fn symbol(self) -> char {
        match self {
            RepeatKind::ZeroOrMore => '*',
            RepeatKind::OneOrMore => '+',
            RepeatKind::ZeroOrOne => '?',
        }
    }
}

pub(crate) fn eof_error(what: &str) -> MatchError {
    MatchError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("{}: expected at least one item", what),
    ))
}

/// Run `step` until end of input. A step that consumes nothing ends the loop.
pub(crate) fn repeat_until_eof<F>(input: &mut Input<'_>, mut step: F) -> Result<(), MatchError>
where
    F: FnMut(&mut Input<'_>) -> Result<(), MatchError>,
{
    while !input.at_eof()? {
        let before = input.offset();
        step(input)?;
        if input.offset() == before {
            break;
        }
    }
    Ok(())
}

/// Factor-position `*A`, `+A`, `?A`: A is matched in the same context.
#[derive(Debug)]
pub struct Repeat {
    pub kind: RepeatKind,
    pub rule: Arc<dyn Ruler>,
}

impl Ruler for Repeat {
    fn match_in(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        match self.kind {
            RepeatKind::ZeroOrOne => {
                if input.at_eof()? {
                    return Ok(Value::Nil);
                }
                self.rule.match_in(input, ctx)
            }
            RepeatKind::OneOrMore | RepeatKind::ZeroOrMore => {
                self.match_step(input, ctx)?;
                Ok(ctx.dom())
            }
        }
    }

    fn match_step(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<(), MatchError> {
        if input.at_eof()? {
            return match self.kind {
                RepeatKind::OneOrMore => Err(eof_error(&self.full_name())),
                _ => Ok(()),
            };
        }
        match self.kind {
            RepeatKind::ZeroOrOne => self.rule.match_step(input, ctx),
            _ => repeat_until_eof(input, |input| self.rule.match_step(input, ctx)),
        }
    }

    fn size_of(&self) -> Option<usize> {
        None
    }

    fn full_name(&self) -> String {
        format!("{}{}", self.kind.symbol(), self.rule.full_name())
    }
}

/// `case expr { label: R ... default: R }`
#[derive(Debug)]
pub struct Case {
    pub expr: Expr,
    pub arms: Vec<(Value, Arc<dyn Ruler>)>,
    pub default: Option<Arc<dyn Ruler>>,
    /// Record the discriminant as `_type` in the enclosing struct.
    pub case_type: bool,
}

impl Case {
    /// Pick the arm for the current discriminant, tagging `_type` if enabled.
    fn select(&self, ctx: &mut Context<'_>) -> Result<&Arc<dyn Ruler>, MatchError> {
        let key = self.expr.eval(ctx)?;
        let arm = self
            .arms
            .iter()
            .find(|(label, _)| values_equal(label, &key))
            .map(|(_, r)| r)
            .or(self.default.as_ref());
        let rule = match arm {
            Some(r) => r,
            None => {
                return Err(MatchError::CaseNotFound {
                    expr: self.expr.text.clone(),
                    value: key.to_json(),
                })
            }
        };
        if self.case_type && matches!(ctx.dom_ref(), Dom::Map(_)) {
            ctx.let_var("_type", key)?;
        }
        Ok(rule)
    }
}

impl Ruler for Case {
    fn match_in(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        self.select(ctx)?.match_in(input, ctx)
    }

    fn match_step(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<(), MatchError> {
        self.select(ctx)?.match_step(input, ctx)
    }

    fn size_of(&self) -> Option<usize> {
        None
    }

    fn full_name(&self) -> String {
        format!("case {}", self.expr.text)
    }
}

/// `if c1 {..} elif c2 {..} else {..}`; no branch taken yields nil.
#[derive(Debug)]
pub struct If {
    pub branches: Vec<(Expr, Arc<dyn Ruler>)>,
    pub otherwise: Option<Arc<dyn Ruler>>,
}

impl If {
    fn branch(&self, ctx: &Context<'_>) -> Result<Option<&Arc<dyn Ruler>>, MatchError> {
        for (cond, rule) in &self.branches {
            if cond.eval_bool(ctx)? {
                return Ok(Some(rule));
            }
        }
        Ok(self.otherwise.as_ref())
    }
}

impl Ruler for If {
    fn match_in(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        match self.branch(ctx)? {
            Some(rule) => rule.match_in(input, ctx),
            None => Ok(Value::Nil),
        }
    }

    fn match_step(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<(), MatchError> {
        match self.branch(ctx)? {
            Some(rule) => rule.match_step(input, ctx),
            None => Ok(()),
        }
    }

    fn size_of(&self) -> Option<usize> {
        None
    }

    fn full_name(&self) -> String {
        match self.branches.first() {
            Some((cond, _)) => format!("if {}", cond.text),
            None => "if".to_string(),
        }
    }
}

/// `read n do R`: R sees exactly the next n bytes; leftovers are dropped.
/// Error offsets inside R are reported against the enclosing stream.
#[derive(Debug)]
pub struct Read {
    pub len: Expr,
    pub rule: Arc<dyn Ruler>,
}

impl Read {
    fn bounded<T, F>(&self, input: &mut Input<'_>, ctx: &mut Context<'_>, run: F) -> Result<T, MatchError>
    where
        F: FnOnce(&mut Input<'_>, &mut Context<'_>) -> Result<T, MatchError>,
    {
        let n = self.len.eval_len(ctx)?;
        let base = input.offset();
        let bytes = input.take_exact(n)?;
        let mut bounded = Input::from_bytes(&bytes);
        run(&mut bounded, ctx).map_err(|e| e.rebase(base, input.lookahead(ERROR_CONTEXT)))
    }
}

impl Ruler for Read {
    fn match_in(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        self.bounded(input, ctx, |bounded, ctx| self.rule.match_in(bounded, ctx))
    }

    fn match_step(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<(), MatchError> {
        self.bounded(input, ctx, |bounded, ctx| self.rule.match_step(bounded, ctx))
    }

    fn size_of(&self) -> Option<usize> {
        None
    }

    fn full_name(&self) -> String {
        format!("read {} do {}", self.len.text, self.rule.full_name())
    }
}

fn expr_bytes(expr: &Expr, ctx: &Context<'_>) -> Result<Vec<u8>, MatchError> {
    let v = expr.eval(ctx)?;
    match v.as_bytes() {
        Some(b) => Ok(b.to_vec()),
        None => Err(MatchError::Eval(format!(
            "{}: expected bytes or string, got {}",
            expr.text,
            v.type_name()
        ))),
    }
}

/// `eval e do R`: match R against the bytes `e` evaluates to.
#[derive(Debug)]
pub struct Eval {
    pub src: Expr,
    pub rule: Arc<dyn Ruler>,
}

impl Ruler for Eval {
    fn match_in(&self, _input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        let bytes = expr_bytes(&self.src, ctx)?;
        let mut inner = Input::from_bytes(&bytes);
        self.rule.match_in(&mut inner, ctx)
    }

    fn size_of(&self) -> Option<usize> {
        Some(0)
    }

    fn full_name(&self) -> String {
        format!("eval {} do {}", self.src.text, self.rule.full_name())
    }
}

/// `lzw src, order, litWidth do R`: LZW-decode `src` and match R on the result.
#[derive(Debug)]
pub struct Lzw {
    pub src: Expr,
    pub order: Expr,
    pub lit_width: Expr,
    pub rule: Arc<dyn Ruler>,
}

impl Ruler for Lzw {
    fn match_in(&self, _input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        let packed = expr_bytes(&self.src, ctx)?;
        let order = match self.order.eval_int(ctx)? {
            0 => BitOrder::Lsb,
            1 => BitOrder::Msb,
            n => return Err(MatchError::Lzw(format!("unknown bit order {}", n))),
        };
        let width = self.lit_width.eval_int(ctx)?;
        if !(2..=8).contains(&width) {
            return Err(MatchError::Lzw(format!("literal width {} out of range 2..=8", width)));
        }
        let unpacked = Decoder::new(order, width as u8)
            .decode(&packed)
            .map_err(|e| MatchError::Lzw(e.to_string()))?;
        let mut inner = Input::from_bytes(&unpacked);
        self.rule.match_in(&mut inner, ctx)
    }

    fn size_of(&self) -> Option<usize> {
        Some(0)
    }

    fn full_name(&self) -> String {
        format!("lzw {} do {}", self.src.text, self.rule.full_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{BaseType, CString, Primitive};
    use crate::ruler::Program;
    use crate::vm::{Block, Code, Instr};

    fn u8r() -> Arc<dyn Ruler> {
        Arc::new(Primitive::le(BaseType::Uint8))
    }

    /// Install `instrs` as the program code and return an expression over it.
    fn expr(ctx: &Context<'_>, instrs: Vec<Instr>, text: &str) -> Expr {
        let mut code = Code::default();
        for i in instrs {
            code.emit(i);
        }
        let block = Block { start: 0, end: code.len() };
        ctx.set_program(Arc::new(Program { code, slots: Vec::new() }));
        Expr { block, text: text.to_string() }
    }

    #[test]
    fn seq_collects_and_and_discards() {
        let data = [1u8, 2, 3];
        let mut input = Input::from_bytes(&data);
        let mut ctx = Context::new();
        let and = And { rules: vec![u8r(), u8r()] };
        assert_eq!(and.size_of(), Some(2));
        let seq = Seq { rules: vec![Arc::new(and), u8r()] };
        let v = seq.match_in(&mut input, &mut ctx).unwrap();
        assert_eq!(v, Value::List(vec![Value::Nil, Value::U8(3)]));
    }

    #[test]
    fn repeat_kinds_at_eof() {
        let mut ctx = Context::new();
        let star = Repeat { kind: RepeatKind::ZeroOrMore, rule: Arc::new(Seq { rules: vec![u8r()] }) };
        let plus = Repeat { kind: RepeatKind::OneOrMore, rule: u8r() };
        let opt = Repeat { kind: RepeatKind::ZeroOrOne, rule: u8r() };
        let mut empty = Input::from_bytes(&[]);
        assert_eq!(star.match_in(&mut empty, &mut ctx).unwrap(), Value::Nil);
        assert!(plus.match_in(&mut empty, &mut ctx).is_err());
        assert_eq!(opt.match_in(&mut empty, &mut ctx).unwrap(), Value::Nil);

        let mut input = Input::from_bytes(&[4, 5]);
        let v = star.match_in(&mut input, &mut ctx).unwrap();
        assert_eq!(v, Value::List(vec![Value::U8(4), Value::U8(5)]));
    }

    #[test]
    fn case_first_match_and_default() {
        let mut ctx = Context::new();
        ctx.bind("t", Value::I32(2)).unwrap();
        let e = expr(&ctx, vec![Instr::Ref("t".into())], "t");
        let case = Case {
            expr: e.clone(),
            arms: vec![
                (Value::I64(2), u8r()),
                (Value::I64(2), Arc::new(CString) as Arc<dyn Ruler>),
            ],
            default: None,
            case_type: true,
        };
        let mut input = Input::from_bytes(b"A\0");
        assert_eq!(case.match_in(&mut input, &mut ctx).unwrap(), Value::U8(b'A'));
        assert_eq!(ctx.lookup("_type"), Some(Value::I32(2)));

        let missing = Case { expr: e, arms: vec![(Value::I64(1), u8r())], default: None, case_type: false };
        let err = missing.match_in(&mut input, &mut ctx).unwrap_err();
        assert_eq!(err.to_string(), "case not found: t = 2");
    }

    #[test]
    fn read_bounds_the_inner_match() {
        let mut ctx = Context::new();
        let len = expr(&ctx, vec![Instr::Push(Value::I64(3))], "3");
        let read = Read { len, rule: Arc::new(CString) };
        let mut input = Input::from_bytes(b"ab\0cd\0");
        assert_eq!(read.match_in(&mut input, &mut ctx).unwrap(), Value::from("ab"));
        assert_eq!(input.offset(), 3);
        let mut short = Input::from_bytes(b"abcd");
        assert!(read.match_in(&mut short, &mut ctx).is_err());
    }

    #[test]
    fn lzw_round_trip() {
        let plain = b"hello hello hello\0".to_vec();
        let packed = weezl::encode::Encoder::new(BitOrder::Lsb, 8).encode(&plain).unwrap();
        let mut ctx = Context::new();
        ctx.bind("data", Value::Bytes(packed)).unwrap();
        let mut code = Code::default();
        code.emit(Instr::Ref("data".into()));
        code.emit(Instr::Push(Value::I64(0)));
        code.emit(Instr::Push(Value::I64(8)));
        ctx.set_program(Arc::new(Program { code, slots: Vec::new() }));
        let lzw = Lzw {
            src: Expr { block: Block { start: 0, end: 1 }, text: "data".into() },
            order: Expr { block: Block { start: 1, end: 2 }, text: "0".into() },
            lit_width: Expr { block: Block { start: 2, end: 3 }, text: "8".into() },
            rule: Arc::new(CString),
        };
        let mut input = Input::from_bytes(&[]);
        assert_eq!(lzw.match_in(&mut input, &mut ctx).unwrap(), Value::from("hello hello hello"));
    }
}
