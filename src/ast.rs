//! Abstract Syntax Tree for the BPL DSL.
//!
//! Produced by [`crate::parser`], lowered into matching units by
//! [`crate::compiler`]. Every node owns its children.

use crate::compose::RepeatKind;
use crate::vm::{BinOp, UnOp};

/// A whole protocol source file.
#[derive(Debug, Clone, Default)]
pub struct Grammar {
    pub items: Vec<TopItem>,
}

#[derive(Debug, Clone)]
pub enum TopItem {
    Rule(RuleDef),
    Const(ConstDef),
}

/// `name = expr`
#[derive(Debug, Clone)]
pub struct RuleDef {
    pub name: String,
    pub line: usize,
    pub body: TypeExpr,
}

/// `const name = expr` (also one entry of a `const ( ... )` block).
#[derive(Debug, Clone)]
pub struct ConstDef {
    pub name: String,
    pub value: Scalar,
}

/// Type-position expression.
#[derive(Debug, Clone)]
pub enum TypeExpr {
    Ref(String),
    /// `A B C`
    And(Vec<TypeExpr>),
    /// `[A B C]`
    Seq(Vec<TypeExpr>),
    Repeat(RepeatKind, Box<TypeExpr>),
    Struct(StructBody),
    Case(CaseExpr),
    If(IfExpr),
    Read { len: Scalar, body: Box<TypeExpr> },
    Eval { src: Scalar, body: Box<TypeExpr> },
    Lzw { src: Scalar, order: Scalar, lit_width: Scalar, body: Box<TypeExpr> },
}

#[derive(Debug, Clone, Default)]
pub struct StructBody {
    pub items: Vec<StructItem>,
    pub ret: Option<Scalar>,
    /// `{/C ...}`: every member must have a fixed size.
    pub c_layout: bool,
}

#[derive(Debug, Clone)]
pub enum StructItem {
    Member { name: String, ty: MemberType },
    Assert(Scalar),
    Let { name: String, value: Scalar },
    Global { name: String, value: Scalar },
    /// `case`, `if`, `read`, `eval` or `lzw` matched in the struct's context.
    Dynamic(TypeExpr),
}

#[derive(Debug, Clone)]
pub enum MemberType {
    Named(String),
    Array(Scalar, Box<MemberType>),
    Repeat(RepeatKind, Box<MemberType>),
    Struct(StructBody),
}

#[derive(Debug, Clone)]
pub struct CaseExpr {
    pub discr: Scalar,
    pub arms: Vec<(CaseLabel, TypeExpr)>,
    pub default: Option<Box<TypeExpr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaseLabel {
    Lit(Literal),
    Const(String),
}

#[derive(Debug, Clone)]
pub struct IfExpr {
    pub branches: Vec<(Scalar, StructBody)>,
    pub otherwise: Option<StructBody>,
}

/// An inline scalar expression with its source text.
#[derive(Debug, Clone)]
pub struct Scalar {
    pub node: Node,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Lit(Literal),
    Ident(String),
    SizeOf(String),
    Unary(UnOp, Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Member(Box<Node>, String),
    Index(Box<Node>, Box<Node>),
    List(Vec<Node>),
    Map(Vec<(Node, Node)>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Nil,
}
