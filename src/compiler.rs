//! Lower a parsed BPL grammar into matching units and bytecode.
//!
//! Rules are resolved in source order. A name used before its definition
//! becomes a [`TypeVar`] bound to a numbered slot; the definition later fills
//! the slot. Compile-time constants and `sizeof` are folded into the
//! bytecode, so a compiled [`Protocol`] is immutable and can be shared.

use crate::array::{Array, ArrayLen, ListRepeat};
use crate::ast::*;
use crate::base::{Assert, CString, Done, Dump, Eof, Global, Let, Nil, Primitive};
use crate::compose::{self, Case, If, Lzw, Read, Repeat, Seq};
use crate::context::Context;
use crate::input::Input;
use crate::parser;
use crate::ruler::{MatchError, Named, Program, Ruler, TypeVar};
use crate::structs::{self, Struct};
use crate::value::Value;
use crate::vm::{apply_binary, apply_unary, truthy, BinOp, Block, Code, Expr, Instr};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

/// Name of the entry rule.
pub const DOC: &str = "doc";

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("{file}:{line}:{col}: {message}")]
    Syntax { file: String, line: usize, col: usize, message: String },
    #[error("grammar: {0}")]
    Grammar(String),
    #[error("rule `{0}` is used but never defined")]
    Unassigned(String),
    #[error("rule `{0}` is already defined")]
    Redefined(String),
    #[error("no `doc` rule")]
    NoDoc,
    #[error("sizeof: {0}")]
    SizeOf(String),
    #[error("const: {0}")]
    Const(String),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

/// Compiler switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Record each matched case discriminant as `_type` in the enclosing struct.
    pub case_type: bool,
}

enum Binding {
    Defined(Arc<dyn Ruler>),
    Forward(usize),
}

struct Compiler {
    opts: Options,
    code: Code,
    names: HashMap<String, Binding>,
    slots: Vec<(String, Option<Arc<dyn Ruler>>)>,
    consts: HashMap<String, Value>,
}

fn builtin(name: &str) -> Option<Arc<dyn Ruler>> {
    if let Some(p) = Primitive::from_name(name) {
        return Some(Arc::new(p));
    }
    let r: Arc<dyn Ruler> = match name {
        "cstring" => Arc::new(CString),
        "nil" => Arc::new(Nil),
        "eof" => Arc::new(Eof),
        "done" => Arc::new(Done),
        "dump" => Arc::new(Dump),
        _ => return None,
    };
    Some(r)
}

fn literal(lit: &Literal) -> Value {
    match lit {
        Literal::Int(i) => Value::I64(*i),
        Literal::Float(x) => Value::Double(*x),
        Literal::Str(s) => Value::String(s.clone()),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Nil => Value::Nil,
    }
}

impl Compiler {
    fn new(opts: Options) -> Self {
        Compiler {
            opts,
            code: Code::default(),
            names: HashMap::new(),
            slots: Vec::new(),
            consts: HashMap::new(),
        }
    }

    /// Type-position name: defined rule, pending forward reference, builtin,
    /// or a new forward reference.
    fn resolve(&mut self, name: &str) -> Arc<dyn Ruler> {
        match self.names.get(name) {
            Some(Binding::Defined(r)) => return Arc::clone(r),
            Some(Binding::Forward(slot)) => {
                return Arc::new(TypeVar { name: name.to_string(), slot: *slot })
            }
            None => {}
        }
        if let Some(r) = builtin(name) {
            self.names.insert(name.to_string(), Binding::Defined(Arc::clone(&r)));
            return r;
        }
        let slot = self.slots.len();
        self.slots.push((name.to_string(), None));
        self.names.insert(name.to_string(), Binding::Forward(slot));
        Arc::new(TypeVar { name: name.to_string(), slot })
    }

    fn define(&mut self, def: &RuleDef) -> Result<(), CompileError> {
        if let Some(Binding::Defined(_)) = self.names.get(&def.name) {
            return Err(CompileError::Redefined(def.name.clone()));
        }
        let inner = self.type_expr(&def.body)?;
        let rule: Arc<dyn Ruler> = Arc::new(Named { name: def.name.clone(), line: def.line, inner });
        // the body may have introduced (or used) a forward reference to this very name
        match self.names.get(&def.name) {
            Some(Binding::Defined(_)) => return Err(CompileError::Redefined(def.name.clone())),
            Some(Binding::Forward(slot)) => self.slots[*slot].1 = Some(Arc::clone(&rule)),
            None => {}
        }
        self.names.insert(def.name.clone(), Binding::Defined(rule));
        Ok(())
    }

    fn define_const(&mut self, def: &ConstDef) -> Result<(), CompileError> {
        if self.consts.contains_key(&def.name) {
            return Err(CompileError::Const(format!("`{}` is already defined", def.name)));
        }
        let v = self
            .fold(&def.value.node)?
            .ok_or_else(|| CompileError::Const(format!("`{}` is not a constant expression", def.value.text)))?;
        if !v.is_integer() {
            return Err(CompileError::Const(format!("`{}` must be an integer, got {}", def.name, v.type_name())));
        }
        self.consts.insert(def.name.clone(), v);
        Ok(())
    }

    // ---- scalar expressions ----

    fn sizeof(&mut self, name: &str) -> Result<Value, CompileError> {
        let rule = match self.names.get(name) {
            Some(Binding::Defined(r)) => Arc::clone(r),
            Some(Binding::Forward(_)) => {
                return Err(CompileError::SizeOf(format!("`{}` is not defined yet", name)))
            }
            None => builtin(name).ok_or_else(|| CompileError::SizeOf(format!("unknown type `{}`", name)))?,
        };
        let n = rule
            .size_of()
            .ok_or_else(|| CompileError::SizeOf(format!("`{}` has variable size", name)))?;
        Ok(Value::I64(n as i64))
    }

    /// Constant value of `node`, if it only involves literals, constants and `sizeof`.
    ///
    /// `&&`/`||` fold as soon as the left side decides them. An operator that
    /// faults on constant operands is left to run (and fail) at match time, so
    /// a branch that is never taken never fails.
    fn fold(&mut self, node: &Node) -> Result<Option<Value>, CompileError> {
        let folded = match node {
            Node::Lit(lit) => Some(literal(lit)),
            Node::Ident(name) => self.consts.get(name).cloned(),
            Node::SizeOf(name) => Some(self.sizeof(name)?),
            Node::Unary(op, x) => self.fold(x)?.and_then(|v| apply_unary(*op, &v).ok()),
            Node::Binary(op @ (BinOp::And | BinOp::Or), a, b) => {
                let lhs = match self.fold(a)? {
                    Some(x) => truthy(&x).ok(),
                    None => None,
                };
                match lhs {
                    Some(l) if l == (*op == BinOp::Or) => Some(Value::Bool(l)),
                    Some(_) => self.fold(b)?.and_then(|y| truthy(&y).ok()).map(Value::Bool),
                    None => None,
                }
            }
            Node::Binary(op, a, b) => match (self.fold(a)?, self.fold(b)?) {
                (Some(x), Some(y)) => apply_binary(*op, &x, &y).ok(),
                _ => None,
            },
            Node::Member(..) | Node::Index(..) | Node::List(_) | Node::Map(_) => None,
        };
        Ok(folded)
    }

    fn emit_node(&mut self, node: &Node) -> Result<(), CompileError> {
        if let Some(v) = self.fold(node)? {
            self.code.emit(Instr::Push(v));
            return Ok(());
        }
        match node {
            Node::Lit(_) | Node::SizeOf(_) => {}
            Node::Ident(name) => {
                self.code.emit(Instr::Ref(name.clone()));
            }
            Node::Unary(op, x) => {
                self.emit_node(x)?;
                self.code.emit(Instr::Unary(*op));
            }
            Node::Binary(op @ (BinOp::And | BinOp::Or), a, b) => {
                self.emit_node(a)?;
                let jump = self.code.emit(if *op == BinOp::And { Instr::AndJump(0) } else { Instr::OrJump(0) });
                self.emit_node(b)?;
                self.code.emit(Instr::ToBool);
                let end = self.code.len();
                self.code.patch(jump, end);
            }
            Node::Binary(op, a, b) => {
                self.emit_node(a)?;
                self.emit_node(b)?;
                self.code.emit(Instr::Binary(*op));
            }
            Node::Member(x, name) => {
                self.emit_node(x)?;
                self.code.emit(Instr::Member(name.clone()));
            }
            Node::Index(x, i) => {
                self.emit_node(x)?;
                self.emit_node(i)?;
                self.code.emit(Instr::Index);
            }
            Node::List(items) => {
                for item in items {
                    self.emit_node(item)?;
                }
                self.code.emit(Instr::MakeList(items.len()));
            }
            Node::Map(entries) => {
                for (k, v) in entries {
                    self.emit_node(k)?;
                    self.emit_node(v)?;
                }
                self.code.emit(Instr::MakeMap(entries.len()));
            }
        }
        Ok(())
    }

    fn expr(&mut self, s: &Scalar) -> Result<Expr, CompileError> {
        let start = self.code.len();
        self.emit_node(&s.node)?;
        Ok(Expr { block: Block { start, end: self.code.len() }, text: s.text.clone() })
    }

    // ---- type expressions ----

    fn type_expr(&mut self, t: &TypeExpr) -> Result<Arc<dyn Ruler>, CompileError> {
        let r: Arc<dyn Ruler> = match t {
            TypeExpr::Ref(name) => self.resolve(name),
            TypeExpr::And(items) => Arc::new(compose::And { rules: self.type_list(items)? }),
            TypeExpr::Seq(items) => Arc::new(Seq { rules: self.type_list(items)? }),
            TypeExpr::Repeat(kind, x) => Arc::new(Repeat { kind: *kind, rule: self.type_expr(x)? }),
            TypeExpr::Struct(body) => self.struct_body(body)?,
            TypeExpr::Case(c) => self.case(c)?,
            TypeExpr::If(i) => {
                let mut branches = Vec::with_capacity(i.branches.len());
                for (cond, body) in &i.branches {
                    branches.push((self.expr(cond)?, self.struct_body(body)?));
                }
                let otherwise = match &i.otherwise {
                    Some(body) => Some(self.struct_body(body)?),
                    None => None,
                };
                Arc::new(If { branches, otherwise })
            }
            TypeExpr::Read { len, body } => Arc::new(Read { len: self.expr(len)?, rule: self.type_expr(body)? }),
            TypeExpr::Eval { src, body } => {
                Arc::new(compose::Eval { src: self.expr(src)?, rule: self.type_expr(body)? })
            }
            TypeExpr::Lzw { src, order, lit_width, body } => Arc::new(Lzw {
                src: self.expr(src)?,
                order: self.expr(order)?,
                lit_width: self.expr(lit_width)?,
                rule: self.type_expr(body)?,
            }),
        };
        Ok(r)
    }

    fn type_list(&mut self, items: &[TypeExpr]) -> Result<Vec<Arc<dyn Ruler>>, CompileError> {
        items.iter().map(|t| self.type_expr(t)).collect()
    }

    fn case(&mut self, c: &CaseExpr) -> Result<Arc<dyn Ruler>, CompileError> {
        let expr = self.expr(&c.discr)?;
        let mut arms = Vec::with_capacity(c.arms.len());
        for (label, body) in &c.arms {
            let key = match label {
                CaseLabel::Lit(lit) => literal(lit),
                CaseLabel::Const(name) => self
                    .consts
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CompileError::Const(format!("unknown constant `{}` in case label", name)))?,
            };
            arms.push((key, self.type_expr(body)?));
        }
        let default = match &c.default {
            Some(body) => Some(self.type_expr(body)?),
            None => None,
        };
        Ok(Arc::new(Case { expr, arms, default, case_type: self.opts.case_type }))
    }

    fn member_type(&mut self, m: &MemberType) -> Result<Arc<dyn Ruler>, CompileError> {
        let r: Arc<dyn Ruler> = match m {
            MemberType::Named(name) => self.resolve(name),
            MemberType::Struct(body) => self.struct_body(body)?,
            MemberType::Repeat(kind, elem) => Arc::new(ListRepeat { kind: *kind, elem: self.member_type(elem)? }),
            MemberType::Array(len, elem) => {
                let len = match self.fold(&len.node)? {
                    Some(v) => {
                        let n = v
                            .as_i64()
                            .and_then(|n| usize::try_from(n).ok())
                            .ok_or_else(|| CompileError::Grammar(format!("bad array length `{}`", len.text)))?;
                        ArrayLen::Fixed(n)
                    }
                    None => ArrayLen::Dynamic(self.expr(len)?),
                };
                Arc::new(Array { elem: self.member_type(elem)?, len })
            }
        };
        Ok(r)
    }

    fn struct_body(&mut self, body: &StructBody) -> Result<Arc<dyn Ruler>, CompileError> {
        let mut items = Vec::with_capacity(body.items.len());
        for item in &body.items {
            let it = match item {
                StructItem::Member { name, ty } => {
                    let rule = self.member_type(ty)?;
                    if body.c_layout && rule.size_of().is_none() {
                        return Err(CompileError::Grammar(format!(
                            "{{/C}} member `{}` of type {} has variable size",
                            name,
                            rule.full_name()
                        )));
                    }
                    structs::Item::Member { name: name.clone(), rule }
                }
                StructItem::Assert(cond) => structs::Item::Dynamic(Arc::new(Assert { expr: self.expr(cond)? })),
                StructItem::Let { name, value } => {
                    structs::Item::Dynamic(Arc::new(Let { name: name.clone(), expr: self.expr(value)? }))
                }
                StructItem::Global { name, value } => {
                    structs::Item::Dynamic(Arc::new(Global { name: name.clone(), expr: self.expr(value)? }))
                }
                StructItem::Dynamic(t) => structs::Item::Dynamic(self.type_expr(t)?),
            };
            items.push(it);
        }
        let ret = match &body.ret {
            Some(e) => Some(self.expr(e)?),
            None => None,
        };
        Ok(Arc::new(Struct::new(items, ret)))
    }

    fn finish(self) -> Result<Protocol, CompileError> {
        let root = match self.names.get(DOC) {
            Some(Binding::Defined(r)) => Arc::clone(r),
            Some(Binding::Forward(_)) => return Err(CompileError::Unassigned(DOC.to_string())),
            None => return Err(CompileError::NoDoc),
        };
        let mut slots = Vec::with_capacity(self.slots.len());
        for (name, rule) in self.slots {
            slots.push(rule.ok_or(CompileError::Unassigned(name))?);
        }
        Ok(Protocol { root, program: Arc::new(Program { code: self.code, slots }) })
    }
}

/// A compiled protocol: the `doc` matching unit plus its program.
#[derive(Debug, Clone)]
pub struct Protocol {
    root: Arc<dyn Ruler>,
    program: Arc<Program>,
}

impl Protocol {
    /// Compile BPL source bytes; `fname` is only used in error messages.
    pub fn compile(src: &[u8], fname: &str) -> Result<Self, CompileError> {
        Self::with_options(src, fname, Options::default())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(src: &str, fname: &str) -> Result<Self, CompileError> {
        Self::with_options(src.as_bytes(), fname, Options::default())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CompileError> {
        let path = path.as_ref();
        let src = std::fs::read(path)?;
        Self::compile(&src, &path.display().to_string())
    }

    pub fn with_options(src: &[u8], fname: &str, opts: Options) -> Result<Self, CompileError> {
        let text = std::str::from_utf8(src)
            .map_err(|e| CompileError::Grammar(format!("{}: source is not UTF-8: {}", fname, e)))?;
        let grammar = parser::parse(text).map_err(|e| CompileError::Syntax {
            file: fname.to_string(),
            line: e.line,
            col: e.col,
            message: e.message,
        })?;
        let mut c = Compiler::new(opts);
        for item in &grammar.items {
            match item {
                TopItem::Rule(def) => c.define(def)?,
                TopItem::Const(def) => c.define_const(def)?,
            }
        }
        c.finish()
    }

    pub fn root(&self) -> &Arc<dyn Ruler> {
        &self.root
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Match against `input` using a caller-provided context.
    pub fn match_in(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        ctx.set_program(Arc::clone(&self.program));
        self.root.match_in(input, ctx)
    }

    /// Like [`Protocol::match_in`], but a panic inside matching becomes [`MatchError::Panic`].
    pub fn safe_match(&self, input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        match catch_unwind(AssertUnwindSafe(|| self.match_in(input, ctx))) {
            Ok(res) => res,
            Err(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(MatchError::Panic(msg))
            }
        }
    }

    /// Match a whole stream with a fresh context.
    pub fn match_stream<R: std::io::Read>(&self, reader: R) -> Result<Value, MatchError> {
        let mut input = Input::new(reader);
        let mut ctx = Context::new();
        self.safe_match(&mut input, &mut ctx)
    }

    pub fn match_buffer(&self, bytes: &[u8]) -> Result<Value, MatchError> {
        self.match_stream(bytes)
    }

    /// Bytecode listing of every inline expression.
    pub fn disassemble(&self) -> String {
        self.program.code.disassemble()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> Result<Protocol, CompileError> {
        Protocol::from_str(src, "test.bpl")
    }

    #[test]
    fn missing_doc_and_unassigned() {
        assert!(matches!(compile("a = int8"), Err(CompileError::NoDoc)));
        assert!(matches!(compile("doc = a b"), Err(CompileError::Unassigned(n)) if n == "a"));
    }

    #[test]
    fn redefinition_is_rejected() {
        assert!(matches!(compile("a = int8\na = int16\ndoc = a"), Err(CompileError::Redefined(n)) if n == "a"));
        assert!(matches!(compile("doc = int8\nint8 = uint8"), Err(CompileError::Redefined(n)) if n == "int8"));
    }

    #[test]
    fn syntax_error_names_file() {
        let err = compile("doc = {").unwrap_err();
        assert!(matches!(&err, CompileError::Syntax { file, line: 1, .. } if file == "test.bpl"));
        assert!(err.to_string().starts_with("test.bpl:1:"));
    }

    #[test]
    fn sizeof_folds_to_constant() {
        let p = compile("hdr = {a int8; b uint16; c uint32; d float32}\ndoc = { let n = sizeof(hdr) }").unwrap();
        assert_eq!(p.program().code.instrs(), &[Instr::Push(Value::I64(11))]);
        assert!(matches!(compile("doc = { let n = sizeof(cstring) }"), Err(CompileError::SizeOf(_))));
        assert!(matches!(compile("doc = { let n = sizeof(later) }"), Err(CompileError::SizeOf(_))));
    }

    #[test]
    fn constants_fold_and_label_cases() {
        let p = compile("const ( N = 2 * 3 ) \n doc = { a [N]uint8; let k = N + 1 }").unwrap();
        assert_eq!(p.root().size_of(), Some(6));
        assert!(p.disassemble().contains("push 7"));
        assert!(matches!(compile("const X = y\ndoc = nil"), Err(CompileError::Const(_))));
        assert!(matches!(compile("doc = case 1 { Z: nil }"), Err(CompileError::Const(_))));
    }

    #[test]
    fn constant_short_circuit_and_deferred_faults() {
        let p = compile("doc = { let a = 1 || 1 / 0; let b = 0 && missing; let c = 1 && 0 }").unwrap();
        let code = p.program().code.instrs().to_vec();
        assert_eq!(
            code,
            vec![Instr::Push(Value::Bool(true)), Instr::Push(Value::Bool(false)), Instr::Push(Value::Bool(false))]
        );

        let p = compile("doc = { x uint8; assert x == 0 || 1 / 0 == 1 }").unwrap();
        assert!(p.match_buffer(&[0]).is_ok());
        let err = p.match_buffer(&[1]).unwrap_err();
        assert!(matches!(err.root(), MatchError::Eval(_)));
    }

    #[test]
    fn huge_fixed_members_compile() {
        let p = compile("doc = { a [0x7fffffffffffffff]uint8; b [0x7fffffffffffffff]uint8; c [4]uint8 }").unwrap();
        assert_eq!(p.root().size_of(), None);
        assert!(p.match_buffer(&[0; 4]).is_err());
    }

    #[test]
    fn cstruct_requires_fixed_members() {
        assert!(compile("doc = {/C int8 a; uint32be b}").is_ok());
        assert!(matches!(compile("doc = {/C int8 a; cstring b}"), Err(CompileError::Grammar(_))));
    }

    #[test]
    fn short_circuit_emits_jumps() {
        let p = compile("doc = { a uint8; assert a == 1 || a == 2 }").unwrap();
        let listing = p.disassemble();
        assert!(listing.contains("orjmp"));
        assert!(listing.contains("tobool"));
    }

    #[derive(Debug)]
    struct Boom;

    impl Ruler for Boom {
        fn match_in(&self, _input: &mut Input<'_>, _ctx: &mut Context<'_>) -> Result<Value, MatchError> {
            panic!("boom")
        }

        fn size_of(&self) -> Option<usize> {
            None
        }

        fn full_name(&self) -> String {
            "boom".to_string()
        }
    }

    #[test]
    fn safe_match_turns_panics_into_errors() {
        let p = Protocol { root: Arc::new(Boom), program: Arc::new(Program::default()) };
        let err = p.match_buffer(&[]).unwrap_err();
        assert!(matches!(err, MatchError::Panic(m) if m == "boom"));
    }

    #[test]
    fn forward_reference_resolves() {
        let p = compile("doc = *[item]\nitem = { v uint8 }").unwrap();
        assert_eq!(p.program().slots.len(), 1);
        let v = p.match_buffer(&[1, 2]).unwrap();
        assert_eq!(v.to_json(), r#"[{"v":1},{"v":2}]"#);
    }
}
