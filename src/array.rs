//! Member-position arrays: `[n]T`, `[expr]T`, `*T`, `+T`, `?T`.
//!
//! Elements are matched in fresh sub-contexts and collected into a list.
//! Arrays of primitives skip the per-element dispatch: `char` arrays become a
//! string, `byte`/`uint8` arrays raw bytes, anything else a bulk-decoded list.

use crate::base::BaseType;
use crate::compose::{eof_error, repeat_until_eof, RepeatKind};
use crate::context::Context;
use crate::input::Input;
use crate::ruler::{MatchError, Ruler};
use crate::value::Value;
use crate::vm::Expr;
use std::sync::Arc;

/// Upper bound on speculative list capacity for declared lengths.
const MAX_PREALLOC: usize = 1024;

#[derive(Debug)]
pub enum ArrayLen {
    Fixed(usize),
    /// Evaluated against the context enclosing the array.
    Dynamic(Expr),
}

#[derive(Debug)]
pub struct Array {
    pub elem: Arc<dyn Ruler>,
    pub len: ArrayLen,
}

impl Array {
    fn match_n(&self, n: usize, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        if let Some(prim) = self.elem.as_primitive() {
            let total = n
                .checked_mul(prim.size())
                .ok_or_else(|| MatchError::Eval(format!("array length {} overflows", n)))?;
            let bytes = input.take_exact(total)?;
            return Ok(match prim.kind {
                BaseType::Char => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
                BaseType::Uint8 => Value::Bytes(bytes),
                _ => Value::List(prim.decode_many(&bytes)),
            });
        }
        let mut items = Vec::with_capacity(n.min(MAX_PREALLOC));
        for _ in 0..n {
            let mut sub = ctx.child();
            items.push(self.elem.match_in(input, &mut sub)?);
        }
        Ok(Value::List(items))
    }
}

impl Ruler for Array {
    fn match_in(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        let n = match &self.len {
            ArrayLen::Fixed(n) => *n,
            ArrayLen::Dynamic(expr) => expr.eval_len(ctx.enclosing())?,
        };
        self.match_n(n, input, ctx)
    }

    fn size_of(&self) -> Option<usize> {
        match &self.len {
            ArrayLen::Fixed(n) => self.elem.size_of()?.checked_mul(*n),
            ArrayLen::Dynamic(_) => None,
        }
    }

    fn full_name(&self) -> String {
        match &self.len {
            ArrayLen::Fixed(n) => format!("[{}]{}", n, self.elem.full_name()),
            ArrayLen::Dynamic(e) => format!("[{}]{}", e.text, self.elem.full_name()),
        }
    }
}

/// `*T`, `+T`, `?T` in member position.
#[derive(Debug)]
pub struct ListRepeat {
    pub kind: RepeatKind,
    pub elem: Arc<dyn Ruler>,
}

impl Ruler for ListRepeat {
    fn match_in(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        if input.at_eof()? {
            return match self.kind {
                RepeatKind::ZeroOrMore => Ok(Value::List(Vec::new())),
                RepeatKind::ZeroOrOne => Ok(Value::Nil),
                RepeatKind::OneOrMore => Err(eof_error(&self.full_name())),
            };
        }
        if self.kind == RepeatKind::ZeroOrOne {
            let mut sub = ctx.child();
            return self.elem.match_in(input, &mut sub);
        }
        let mut items = Vec::new();
        repeat_until_eof(input, |input| {
            let mut sub = ctx.child();
            items.push(self.elem.match_in(input, &mut sub)?);
            Ok(())
        })?;
        Ok(Value::List(items))
    }

    fn size_of(&self) -> Option<usize> {
        None
    }

    fn full_name(&self) -> String {
        format!("{}{}", self.kind.symbol(), self.elem.full_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{CString, Primitive};
    use crate::ruler::Program;
    use crate::vm::{Block, Code, Instr};

    fn prim(name: &str) -> Arc<dyn Ruler> {
        Arc::new(Primitive::from_name(name).unwrap())
    }

    fn fixed(elem: Arc<dyn Ruler>, n: usize) -> Array {
        Array { elem, len: ArrayLen::Fixed(n) }
    }

    #[test]
    fn primitive_arrays_use_compact_values() {
        let mut ctx = Context::new();
        let mut input = Input::from_bytes(b"abc\x01\x02\x03\x00\x04\x00");
        assert_eq!(fixed(prim("char"), 3).match_in(&mut input, &mut ctx).unwrap(), Value::from("abc"));
        assert_eq!(
            fixed(prim("byte"), 2).match_in(&mut input, &mut ctx).unwrap(),
            Value::Bytes(vec![1, 2])
        );
        assert_eq!(
            fixed(prim("uint16"), 2).match_in(&mut input, &mut ctx).unwrap(),
            Value::List(vec![Value::U16(3), Value::U16(4)])
        );
        assert_eq!(fixed(prim("uint16"), 4).size_of(), Some(8));
    }

    #[test]
    fn empty_and_short_arrays() {
        let mut ctx = Context::new();
        let mut input = Input::from_bytes(b"x\0");
        let cs: Arc<dyn Ruler> = Arc::new(CString);
        assert_eq!(fixed(cs.clone(), 0).match_in(&mut input, &mut ctx).unwrap(), Value::List(vec![]));
        assert_eq!(input.offset(), 0);
        assert!(fixed(cs, 2).match_in(&mut input, &mut ctx).is_err());
        let mut input = Input::from_bytes(&[1, 2, 3]);
        assert!(fixed(prim("uint32"), 1).match_in(&mut input, &mut ctx).is_err());
    }

    #[test]
    fn dynamic_length_reads_the_enclosing_context() {
        let mut outer = Context::new();
        outer.bind("n", Value::U8(2)).unwrap();
        let mut code = Code::default();
        code.emit(Instr::Ref("n".into()));
        outer.set_program(Arc::new(Program { code, slots: Vec::new() }));
        let arr = Array {
            elem: Arc::new(CString),
            len: ArrayLen::Dynamic(Expr { block: Block { start: 0, end: 1 }, text: "n".into() }),
        };
        let mut input = Input::from_bytes(b"a\0b\0c\0");
        let mut member_ctx = outer.child();
        let v = arr.match_in(&mut input, &mut member_ctx).unwrap();
        assert_eq!(v, Value::List(vec![Value::from("a"), Value::from("b")]));
        assert_eq!(arr.size_of(), None);
        assert_eq!(arr.full_name(), "[n]cstring");
    }

    #[test]
    fn list_repeat_kinds() {
        let mut ctx = Context::new();
        let star = ListRepeat { kind: RepeatKind::ZeroOrMore, elem: prim("uint8") };
        let plus = ListRepeat { kind: RepeatKind::OneOrMore, elem: prim("uint8") };
        let opt = ListRepeat { kind: RepeatKind::ZeroOrOne, elem: prim("uint8") };
        let mut empty = Input::from_bytes(&[]);
        assert_eq!(star.match_in(&mut empty, &mut ctx).unwrap(), Value::List(vec![]));
        assert!(plus.match_in(&mut empty, &mut ctx).is_err());
        assert_eq!(opt.match_in(&mut empty, &mut ctx).unwrap(), Value::Nil);
        let mut input = Input::from_bytes(&[7, 8, 9]);
        assert_eq!(opt.match_in(&mut input, &mut ctx).unwrap(), Value::U8(7));
        assert_eq!(
            plus.match_in(&mut input, &mut ctx).unwrap(),
            Value::List(vec![Value::U8(8), Value::U8(9)])
        );
    }
}
