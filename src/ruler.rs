//! The matching-unit abstraction shared by every compiled construct.
//!
//! A compiled protocol is a tree of [`Ruler`]s. Each one consumes bytes from an
//! [`Input`], records what it matched in a [`Context`] and returns a [`Value`].
//! Forward references are slot indices into the [`Program`], resolved at match
//! time, which keeps the tree acyclic even for recursive grammars.

use crate::base::Primitive;
use crate::context::Context;
use crate::dump::hex_dump;
use crate::input::Input;
use crate::value::Value;
use crate::vm::Code;
use std::fmt;
use std::sync::Arc;

/// Bytes of lookahead captured for positional error reports.
pub(crate) const ERROR_CONTEXT: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("expected end of input")]
    NotEof,
    #[error("case not found: {expr} = {value}")]
    CaseNotFound { expr: String, value: String },
    #[error("assert failed: {0}")]
    AssertFailed(String),
    #[error("unsupported operator: {lhs} {op} {rhs}")]
    UnsupportedOp { op: &'static str, lhs: &'static str, rhs: &'static str },
    #[error("unsupported operator: {op}{operand}")]
    UnsupportedUnary { op: &'static str, operand: &'static str },
    #[error("eval: {0}")]
    Eval(String),
    #[error("variable exists: {0}")]
    VarExists(String),
    #[error("dom type mismatch: expected {expected}")]
    DomType { expected: &'static str },
    #[error("dom already assigned")]
    DomAssigned,
    #[error("lzw: {0}")]
    Lzw(String),
    #[error("panic during match: {0}")]
    Panic(String),
    #[error("match {rule} (line {line}) failed at offset {offset}: {source}\n{}", hex_dump(.buffered))]
    At {
        rule: String,
        line: usize,
        offset: u64,
        buffered: Vec<u8>,
        source: Box<MatchError>,
    },
}

impl MatchError {
    /// The underlying error with positional wrappers removed.
    pub fn root(&self) -> &MatchError {
        match self {
            MatchError::At { source, .. } => source.root(),
            e => e,
        }
    }

    /// Move a positional report from a sub-input that started at `base` in
    /// the enclosing stream; `tail` is the enclosing input's lookahead.
    pub(crate) fn rebase(self, base: u64, tail: &[u8]) -> MatchError {
        match self {
            MatchError::At { rule, line, offset, mut buffered, source } => {
                let room = ERROR_CONTEXT.saturating_sub(buffered.len());
                buffered.extend_from_slice(&tail[..tail.len().min(room)]);
                MatchError::At { rule, line, offset: base + offset, buffered, source }
            }
            e => e,
        }
    }
}

/// A compiled matching unit.
pub trait Ruler: fmt::Debug + Send + Sync {
    fn match_in(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError>;

    /// Match for effect only. Composite units override this to leave their
    /// DOM in the context instead of returning a copy of it.
    fn match_step(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<(), MatchError> {
        self.match_in(input, ctx).map(|_| ())
    }

    /// Encoded size in bytes, `None` when it depends on the input.
    fn size_of(&self) -> Option<usize>;

    fn full_name(&self) -> String;

    /// Scalar type, when this unit is a bare primitive (enables bulk array decode).
    fn as_primitive(&self) -> Option<Primitive> {
        None
    }
}

/// Everything a match needs besides the root: bytecode and rule slots.
#[derive(Debug, Default)]
pub struct Program {
    pub code: Code,
    pub slots: Vec<Arc<dyn Ruler>>,
}

/// Forward reference to a rule defined later in the source.
#[derive(Debug)]
pub struct TypeVar {
    pub name: String,
    pub slot: usize,
}

impl TypeVar {
    fn target(&self, ctx: &Context<'_>) -> Result<Arc<dyn Ruler>, MatchError> {
        ctx.program()
            .slots
            .get(self.slot)
            .cloned()
            .ok_or_else(|| MatchError::Eval(format!("unresolved rule: {}", self.name)))
    }
}

impl Ruler for TypeVar {
    fn match_in(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        self.target(ctx)?.match_in(input, ctx)
    }

    fn match_step(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<(), MatchError> {
        self.target(ctx)?.match_step(input, ctx)
    }

    fn size_of(&self) -> Option<usize> {
        None
    }

    fn full_name(&self) -> String {
        self.name.clone()
    }
}

/// A named rule definition; failures inside it are reported with its name,
/// source line and the bytes at the failure point.
#[derive(Debug)]
pub struct Named {
    pub name: String,
    pub line: usize,
    pub inner: Arc<dyn Ruler>,
}

impl Named {
    fn locate(&self, e: MatchError, input: &mut Input<'_>) -> MatchError {
        match e {
            e @ MatchError::At { .. } => e,
            e => MatchError::At {
                rule: self.name.clone(),
                line: self.line,
                offset: input.offset(),
                buffered: input.lookahead(ERROR_CONTEXT).to_vec(),
                source: Box::new(e),
            },
        }
    }
}

impl Ruler for Named {
    fn match_in(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        self.inner.match_in(input, ctx).map_err(|e| self.locate(e, input))
    }

    fn match_step(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<(), MatchError> {
        self.inner.match_step(input, ctx).map_err(|e| self.locate(e, input))
    }

    fn size_of(&self) -> Option<usize> {
        self.inner.size_of()
    }

    fn full_name(&self) -> String {
        self.name.clone()
    }

    fn as_primitive(&self) -> Option<Primitive> {
        self.inner.as_primitive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::Eof;

    #[test]
    fn named_wraps_errors_with_position() {
        let rule = Named { name: "tail".into(), line: 3, inner: Arc::new(Eof) };
        let data = [0xAAu8, 0xBB];
        let mut input = Input::from_bytes(&data);
        let mut ctx = Context::new();
        let err = rule.match_in(&mut input, &mut ctx).unwrap_err();
        match &err {
            MatchError::At { rule, line, offset, buffered, .. } => {
                assert_eq!(rule, "tail");
                assert_eq!(*line, 3);
                assert_eq!(*offset, 0);
                assert_eq!(buffered, &vec![0xAA, 0xBB]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(err.root(), MatchError::NotEof));
        assert!(err.to_string().contains("aa bb"));
    }

    #[test]
    fn outer_rule_keeps_innermost_position() {
        let inner: Arc<dyn Ruler> = Arc::new(Named { name: "a".into(), line: 1, inner: Arc::new(Eof) });
        let outer = Named { name: "b".into(), line: 2, inner };
        let mut input = Input::from_bytes(&[1]);
        let err = outer.match_in(&mut input, &mut Context::new()).unwrap_err();
        assert!(matches!(err, MatchError::At { ref rule, .. } if rule == "a"));
    }

    #[test]
    fn rebase_shifts_offset_and_appends_outer_bytes() {
        let rule = Named { name: "inner".into(), line: 1, inner: Arc::new(Eof) };
        let block = [7u8];
        let mut sub = Input::from_bytes(&block);
        let err = rule.match_in(&mut sub, &mut Context::new()).unwrap_err();
        match err.rebase(10, &[8, 9]) {
            MatchError::At { offset, buffered, .. } => {
                assert_eq!(offset, 10);
                assert_eq!(buffered, vec![7, 8, 9]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(MatchError::NotEof.rebase(5, &[]), MatchError::NotEof));
    }

    #[test]
    fn typevar_resolves_through_program() {
        let program = Program { code: Code::default(), slots: vec![Arc::new(Eof)] };
        let var = TypeVar { name: "later".into(), slot: 0 };
        let ctx = Context::new();
        ctx.set_program(Arc::new(program));
        let mut ctx = ctx;
        let mut input = Input::from_bytes(&[]);
        assert_eq!(var.match_in(&mut input, &mut ctx).unwrap(), Value::Nil);
        assert_eq!(var.size_of(), None);
    }
}
