//! Parse BPL source into AST using PEST.

use crate::ast::*;
use crate::compose::RepeatKind;
use crate::vm::{BinOp, UnOp};
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser as PestParser;
use std::sync::OnceLock;

#[derive(PestParser)]
#[grammar = "grammar.pest"]
struct BplParser;

/// Syntax error with a 1-based source position.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{line}:{col}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

/// Parse protocol source into AST.
pub fn parse(source: &str) -> Result<Grammar, ParseError> {
    let pairs = BplParser::parse(Rule::program, source).map_err(|e| {
        let (line, col) = match e.line_col {
            pest::error::LineColLocation::Pos(p) => p,
            pest::error::LineColLocation::Span(p, _) => p,
        };
        ParseError { line, col, message: e.variant.message().to_string() }
    })?;
    let program = pairs.into_iter().next().ok_or(ParseError {
        line: 1,
        col: 1,
        message: "empty parse".to_string(),
    })?;
    build_program(program)
}

fn build_program(pair: Pair<Rule>) -> Result<Grammar, ParseError> {
    let mut items = Vec::new();
    for inner in pair.into_inner() {
        let (line, col) = inner.as_span().start_pos().line_col();
        let positioned = |message: String| ParseError { line, col, message };
        match inner.as_rule() {
            Rule::rule_def => items.push(TopItem::Rule(build_rule_def(inner).map_err(positioned)?)),
            Rule::const_block => {
                for def in inner.into_inner() {
                    if def.as_rule() == Rule::const_def {
                        items.push(TopItem::Const(build_const_def(def).map_err(positioned)?));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(Grammar { items })
}

fn build_rule_def(pair: Pair<Rule>) -> Result<RuleDef, String> {
    let line = pair.as_span().start_pos().line_col().0;
    let mut it = pair.into_inner();
    let name = it.next().ok_or("rule: missing name")?.as_str().to_string();
    let body = build_expr(it.next().ok_or("rule: missing body")?)?;
    Ok(RuleDef { name, line, body })
}

fn build_const_def(pair: Pair<Rule>) -> Result<ConstDef, String> {
    let mut it = pair.into_inner();
    let name = it.next().ok_or("const: missing name")?.as_str().to_string();
    let value = build_scalar(it.next().ok_or("const: missing value")?)?;
    Ok(ConstDef { name, value })
}

// ==================== Type expressions ====================

fn build_expr(pair: Pair<Rule>) -> Result<TypeExpr, String> {
    let mut factors = pair
        .into_inner()
        .map(build_factor)
        .collect::<Result<Vec<_>, _>>()?;
    match factors.len() {
        0 => Err("empty type expression".to_string()),
        1 => Ok(factors.remove(0)),
        _ => Ok(TypeExpr::And(factors)),
    }
}

fn repeat_kind(rule: Rule) -> Option<RepeatKind> {
    match rule {
        Rule::repeat0 | Rule::mrepeat0 => Some(RepeatKind::ZeroOrMore),
        Rule::repeat1 | Rule::mrepeat1 => Some(RepeatKind::OneOrMore),
        Rule::repeat01 | Rule::mrepeat01 => Some(RepeatKind::ZeroOrOne),
        _ => None,
    }
}

fn first_inner<'i>(pair: Pair<'i, Rule>, what: &str) -> Result<Pair<'i, Rule>, String> {
    pair.into_inner().next().ok_or_else(|| format!("{}: missing operand", what))
}

fn build_factor(pair: Pair<Rule>) -> Result<TypeExpr, String> {
    let rule = pair.as_rule();
    if let Some(kind) = repeat_kind(rule) {
        let inner = first_inner(pair, "repeat")?;
        return Ok(TypeExpr::Repeat(kind, Box::new(build_factor(inner)?)));
    }
    match rule {
        Rule::rule_ref => Ok(TypeExpr::Ref(first_inner(pair, "rule reference")?.as_str().to_string())),
        Rule::group => build_expr(first_inner(pair, "group")?),
        Rule::expr => build_expr(pair),
        Rule::seq => Ok(TypeExpr::Seq(
            pair.into_inner().map(build_factor).collect::<Result<Vec<_>, _>>()?,
        )),
        Rule::struct_type => Ok(TypeExpr::Struct(build_struct(pair)?)),
        Rule::case_expr => Ok(TypeExpr::Case(build_case(pair)?)),
        Rule::if_expr => Ok(TypeExpr::If(build_if(pair)?)),
        Rule::read_expr => {
            let mut it = pair.into_inner();
            let len = build_scalar(it.next().ok_or("read: missing length")?)?;
            let body = build_factor(it.next().ok_or("read: missing body")?)?;
            Ok(TypeExpr::Read { len, body: Box::new(body) })
        }
        Rule::eval_expr => {
            let mut it = pair.into_inner();
            let src = build_scalar(it.next().ok_or("eval: missing source")?)?;
            let body = build_factor(it.next().ok_or("eval: missing body")?)?;
            Ok(TypeExpr::Eval { src, body: Box::new(body) })
        }
        Rule::lzw_expr => {
            let mut it = pair.into_inner();
            let src = build_scalar(it.next().ok_or("lzw: missing source")?)?;
            let order = build_scalar(it.next().ok_or("lzw: missing bit order")?)?;
            let lit_width = build_scalar(it.next().ok_or("lzw: missing literal width")?)?;
            let body = build_factor(it.next().ok_or("lzw: missing body")?)?;
            Ok(TypeExpr::Lzw { src, order, lit_width, body: Box::new(body) })
        }
        other => Err(format!("unexpected {:?} in type expression", other)),
    }
}

fn build_case(pair: Pair<Rule>) -> Result<CaseExpr, String> {
    let mut it = pair.into_inner();
    let discr = build_scalar(it.next().ok_or("case: missing discriminant")?)?;
    let mut arms = Vec::new();
    let mut default = None;
    for arm in it {
        match arm.as_rule() {
            Rule::case_arm => {
                let mut parts = arm.into_inner();
                let label = build_case_label(parts.next().ok_or("case arm: missing label")?)?;
                let body = build_expr(parts.next().ok_or("case arm: missing body")?)?;
                arms.push((label, body));
            }
            Rule::default_arm => {
                let body = build_expr(first_inner(arm, "default")?)?;
                default = Some(Box::new(body));
            }
            _ => {}
        }
    }
    Ok(CaseExpr { discr, arms, default })
}

fn build_case_label(pair: Pair<Rule>) -> Result<CaseLabel, String> {
    let inner = first_inner(pair, "case label")?;
    match inner.as_rule() {
        Rule::ident => Ok(CaseLabel::Const(inner.as_str().to_string())),
        _ => Ok(CaseLabel::Lit(build_literal(inner)?)),
    }
}

fn build_if(pair: Pair<Rule>) -> Result<IfExpr, String> {
    let mut it = pair.into_inner();
    let cond = build_scalar(it.next().ok_or("if: missing condition")?)?;
    let body = build_struct(it.next().ok_or("if: missing body")?)?;
    let mut branches = vec![(cond, body)];
    let mut otherwise = None;
    for clause in it {
        match clause.as_rule() {
            Rule::elif_clause => {
                let mut parts = clause.into_inner();
                let cond = build_scalar(parts.next().ok_or("elif: missing condition")?)?;
                let body = build_struct(parts.next().ok_or("elif: missing body")?)?;
                branches.push((cond, body));
            }
            Rule::else_clause => otherwise = Some(build_struct(first_inner(clause, "else")?)?),
            _ => {}
        }
    }
    Ok(IfExpr { branches, otherwise })
}

// ==================== Structs ====================

fn build_struct(pair: Pair<Rule>) -> Result<StructBody, String> {
    let body = first_inner(pair, "struct")?;
    match body.as_rule() {
        Rule::cstruct_body => {
            let mut items = Vec::new();
            for m in body.into_inner() {
                let mut it = m.into_inner();
                let ty = it.next().ok_or("member: missing type")?.as_str().to_string();
                let name = it.next().ok_or("member: missing name")?.as_str().to_string();
                let ty = match it.next() {
                    Some(len) => MemberType::Array(build_scalar(len)?, Box::new(MemberType::Named(ty))),
                    None => MemberType::Named(ty),
                };
                items.push(StructItem::Member { name, ty });
            }
            Ok(StructBody { items, ret: None, c_layout: true })
        }
        Rule::struct_body => {
            let mut items = Vec::new();
            let mut ret = None;
            for item in body.into_inner() {
                let rule = item.as_rule();
                match rule {
                    Rule::member => {
                        let mut it = item.into_inner();
                        let name = it.next().ok_or("member: missing name")?.as_str().to_string();
                        let ty = build_member_type(it.next().ok_or("member: missing type")?)?;
                        items.push(StructItem::Member { name, ty });
                    }
                    Rule::assert_stmt => items.push(StructItem::Assert(build_scalar(first_inner(item, "assert")?)?)),
                    Rule::let_stmt | Rule::global_stmt => {
                        let mut it = item.into_inner();
                        let name = it.next().ok_or("binding: missing name")?.as_str().to_string();
                        let value = build_scalar(it.next().ok_or("binding: missing value")?)?;
                        items.push(if rule == Rule::let_stmt {
                            StructItem::Let { name, value }
                        } else {
                            StructItem::Global { name, value }
                        });
                    }
                    Rule::return_stmt => ret = Some(build_scalar(first_inner(item, "return")?)?),
                    _ => items.push(StructItem::Dynamic(build_factor(item)?)),
                }
            }
            Ok(StructBody { items, ret, c_layout: false })
        }
        other => Err(format!("unexpected {:?} in struct", other)),
    }
}

fn build_member_type(pair: Pair<Rule>) -> Result<MemberType, String> {
    let rule = pair.as_rule();
    if let Some(kind) = repeat_kind(rule) {
        let inner = first_inner(pair, "repeat")?;
        return Ok(MemberType::Repeat(kind, Box::new(build_member_type(inner)?)));
    }
    match rule {
        Rule::type_name => Ok(MemberType::Named(first_inner(pair, "type")?.as_str().to_string())),
        Rule::struct_type => Ok(MemberType::Struct(build_struct(pair)?)),
        Rule::array_type => {
            let mut it = pair.into_inner();
            let len = build_scalar(it.next().ok_or("array: missing length")?)?;
            let elem = build_member_type(it.next().ok_or("array: missing element type")?)?;
            Ok(MemberType::Array(len, Box::new(elem)))
        }
        other => Err(format!("unexpected {:?} in member type", other)),
    }
}

// ==================== Scalar expressions ====================

fn pratt() -> &'static PrattParser<Rule> {
    static PRATT: OnceLock<PrattParser<Rule>> = OnceLock::new();
    PRATT.get_or_init(|| {
        PrattParser::new()
            .op(Op::infix(Rule::or_op, Assoc::Left))
            .op(Op::infix(Rule::and_op, Assoc::Left))
            .op(Op::infix(Rule::eq_op, Assoc::Left)
                | Op::infix(Rule::ne_op, Assoc::Left)
                | Op::infix(Rule::lt_op, Assoc::Left)
                | Op::infix(Rule::le_op, Assoc::Left)
                | Op::infix(Rule::gt_op, Assoc::Left)
                | Op::infix(Rule::ge_op, Assoc::Left))
            .op(Op::infix(Rule::add_op, Assoc::Left)
                | Op::infix(Rule::sub_op, Assoc::Left)
                | Op::infix(Rule::bitor_op, Assoc::Left)
                | Op::infix(Rule::xor_op, Assoc::Left))
            .op(Op::infix(Rule::mul_op, Assoc::Left)
                | Op::infix(Rule::div_op, Assoc::Left)
                | Op::infix(Rule::mod_op, Assoc::Left)
                | Op::infix(Rule::shl_op, Assoc::Left)
                | Op::infix(Rule::shr_op, Assoc::Left)
                | Op::infix(Rule::bitand_op, Assoc::Left)
                | Op::infix(Rule::andnot_op, Assoc::Left))
            .op(Op::prefix(Rule::neg_op)
                | Op::prefix(Rule::bitnot_op)
                | Op::prefix(Rule::not_op)
                | Op::prefix(Rule::pos_op))
            .op(Op::postfix(Rule::field) | Op::postfix(Rule::index))
    })
}

fn build_scalar(pair: Pair<Rule>) -> Result<Scalar, String> {
    let text = pair.as_str().trim().to_string();
    let node = build_node(pair.into_inner())?;
    Ok(Scalar { node, text })
}

fn binop(rule: Rule) -> Result<BinOp, String> {
    let op = match rule {
        Rule::or_op => BinOp::Or,
        Rule::and_op => BinOp::And,
        Rule::eq_op => BinOp::Eq,
        Rule::ne_op => BinOp::Ne,
        Rule::lt_op => BinOp::Lt,
        Rule::le_op => BinOp::Le,
        Rule::gt_op => BinOp::Gt,
        Rule::ge_op => BinOp::Ge,
        Rule::add_op => BinOp::Add,
        Rule::sub_op => BinOp::Sub,
        Rule::bitor_op => BinOp::BitOr,
        Rule::xor_op => BinOp::Xor,
        Rule::mul_op => BinOp::Mul,
        Rule::div_op => BinOp::Div,
        Rule::mod_op => BinOp::Mod,
        Rule::shl_op => BinOp::Shl,
        Rule::shr_op => BinOp::Shr,
        Rule::bitand_op => BinOp::BitAnd,
        Rule::andnot_op => BinOp::AndNot,
        other => return Err(format!("unknown operator {:?}", other)),
    };
    Ok(op)
}

fn unop(rule: Rule) -> Result<UnOp, String> {
    match rule {
        Rule::neg_op => Ok(UnOp::Neg),
        Rule::bitnot_op => Ok(UnOp::BitNot),
        Rule::not_op => Ok(UnOp::Not),
        Rule::pos_op => Ok(UnOp::Plus),
        other => Err(format!("unknown unary operator {:?}", other)),
    }
}

fn build_node(pairs: Pairs<Rule>) -> Result<Node, String> {
    pratt()
        .map_primary(build_primary)
        .map_prefix(|op, rhs| Ok(Node::Unary(unop(op.as_rule())?, Box::new(rhs?))))
        .map_postfix(|lhs, op| {
            let lhs = Box::new(lhs?);
            match op.as_rule() {
                Rule::field => Ok(Node::Member(lhs, first_inner(op, "field")?.as_str().to_string())),
                _ => Ok(Node::Index(lhs, Box::new(build_node(first_inner(op, "index")?.into_inner())?))),
            }
        })
        .map_infix(|lhs, op, rhs| Ok(Node::Binary(binop(op.as_rule())?, Box::new(lhs?), Box::new(rhs?))))
        .parse(pairs)
}

fn build_primary(pair: Pair<Rule>) -> Result<Node, String> {
    match pair.as_rule() {
        Rule::ident => Ok(Node::Ident(pair.as_str().to_string())),
        Rule::iexpr => build_node(pair.into_inner()),
        Rule::sizeof_expr => Ok(Node::SizeOf(first_inner(pair, "sizeof")?.as_str().to_string())),
        Rule::list_lit => Ok(Node::List(
            pair.into_inner()
                .map(|p| build_node(p.into_inner()))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        Rule::map_lit => {
            let mut entries = Vec::new();
            for entry in pair.into_inner() {
                let mut it = entry.into_inner();
                let k = build_node(it.next().ok_or("map entry: missing key")?.into_inner())?;
                let v = build_node(it.next().ok_or("map entry: missing value")?.into_inner())?;
                entries.push((k, v));
            }
            Ok(Node::Map(entries))
        }
        _ => Ok(Node::Lit(build_literal(pair)?)),
    }
}

fn build_literal(pair: Pair<Rule>) -> Result<Literal, String> {
    let s = pair.as_str();
    match pair.as_rule() {
        Rule::int | Rule::signed_int => parse_int(s).map(Literal::Int),
        Rule::float => s.parse().map(Literal::Float).map_err(|e| format!("bad float {}: {}", s, e)),
        Rule::bool_lit => Ok(Literal::Bool(s == "true")),
        Rule::nil_lit => Ok(Literal::Nil),
        Rule::string => {
            let inner = first_inner(pair, "string")?;
            let bytes = unescape(inner.as_str())?;
            Ok(Literal::Str(String::from_utf8_lossy(&bytes).into_owned()))
        }
        Rule::char_lit => {
            let inner = first_inner(pair, "char")?;
            let raw = inner.as_str();
            if raw.starts_with('\\') {
                let bytes = unescape(raw)?;
                bytes
                    .first()
                    .map(|&b| Literal::Int(b as i64))
                    .ok_or_else(|| "empty char literal".to_string())
            } else {
                raw.chars()
                    .next()
                    .map(|c| Literal::Int(c as i64))
                    .ok_or_else(|| "empty char literal".to_string())
            }
        }
        other => Err(format!("unexpected {:?} in expression", other)),
    }
}

fn parse_int(s: &str) -> Result<i64, String> {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let v = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map(|v| v as i64)
    } else {
        digits.parse::<i64>()
    }
    .map_err(|e| format!("bad integer {}: {}", s, e))?;
    Ok(if neg { v.wrapping_neg() } else { v })
}

/// Resolve backslash escapes of a string or char literal body.
fn unescape(s: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('r') => out.push(b'\r'),
            Some('0') => out.push(0),
            Some('\\') => out.push(b'\\'),
            Some('"') => out.push(b'"'),
            Some('\'') => out.push(b'\''),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                let b = u8::from_str_radix(&hex, 16).map_err(|_| format!("bad escape \\x{}", hex))?;
                out.push(b);
            }
            Some(other) => return Err(format!("unknown escape \\{}", other)),
            None => return Err("dangling backslash".to_string()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(src: &str) -> Node {
        let g = parse(&format!("doc = {{ let x = {} }}", src)).unwrap();
        match &g.items[0] {
            TopItem::Rule(RuleDef { body: TypeExpr::Struct(s), .. }) => match &s.items[0] {
                StructItem::Let { value, .. } => value.node.clone(),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    fn int(i: i64) -> Box<Node> {
        Box::new(Node::Lit(Literal::Int(i)))
    }

    #[test]
    fn precedence_follows_go() {
        assert_eq!(
            scalar("1 + 2 * 3"),
            Node::Binary(BinOp::Add, int(1), Box::new(Node::Binary(BinOp::Mul, int(2), int(3))))
        );
        assert_eq!(
            scalar("1 << 2 + 3"),
            Node::Binary(BinOp::Add, Box::new(Node::Binary(BinOp::Shl, int(1), int(2))), int(3))
        );
        assert!(matches!(scalar("a == 1 && b != 2 || c"), Node::Binary(BinOp::Or, _, _)));
        assert!(matches!(scalar("x &^ 0x0f"), Node::Binary(BinOp::AndNot, _, _)));
    }

    #[test]
    fn postfix_and_literals() {
        assert_eq!(
            scalar("h.n + h.m"),
            Node::Binary(
                BinOp::Add,
                Box::new(Node::Member(Box::new(Node::Ident("h".into())), "n".into())),
                Box::new(Node::Member(Box::new(Node::Ident("h".into())), "m".into())),
            )
        );
        assert!(matches!(scalar("xs[1]"), Node::Index(_, _)));
        assert_eq!(scalar("-5"), Node::Unary(UnOp::Neg, int(5)));
        assert_eq!(scalar("'A'"), Node::Lit(Literal::Int(65)));
        assert_eq!(scalar("\"a\\tb\""), Node::Lit(Literal::Str("a\tb".into())));
        assert_eq!(scalar("sizeof(hdr)"), Node::SizeOf("hdr".into()));
        assert!(matches!(scalar("[1, 2]"), Node::List(v) if v.len() == 2));
        assert!(matches!(scalar("{\"k\": 1}"), Node::Map(v) if v.len() == 1));
        assert_eq!(scalar("nil"), Node::Lit(Literal::Nil));
        assert_eq!(scalar("0x10"), Node::Lit(Literal::Int(16)));
    }

    #[test]
    fn rules_split_on_definitions() {
        let g = parse("a = int8 uint16\nb = { x int8; y [2]cstring }\ndoc = [a b] *[b]").unwrap();
        assert_eq!(g.items.len(), 3);
        match &g.items[2] {
            TopItem::Rule(r) => {
                assert_eq!(r.name, "doc");
                assert_eq!(r.line, 3);
                assert!(matches!(&r.body, TypeExpr::And(v) if v.len() == 2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn case_arms_with_constant_labels() {
        let src = "const ( A = 1; B = 2 )\ndoc = case t { A: int8 B: int16 'c': cstring default: nil }";
        let g = parse(src).unwrap();
        assert_eq!(g.items.len(), 3);
        match &g.items[2] {
            TopItem::Rule(RuleDef { body: TypeExpr::Case(c), .. }) => {
                assert_eq!(c.arms.len(), 3);
                assert_eq!(c.arms[0].0, CaseLabel::Const("A".into()));
                assert_eq!(c.arms[2].0, CaseLabel::Lit(Literal::Int(99)));
                assert!(c.default.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn struct_items_and_cstruct() {
        let src = r#"
            // header
            hdr = {/C int8 a; uint16 b; char tag[4]}
            doc = {
                h hdr
                assert h.a == 1
                let n = h.b * 2
                read n do { body cstring }
                if n > 3 { big int8 } elif n > 1 { mid int8 } else { small int8 }
                return h
            }
        "#;
        let g = parse(src).unwrap();
        let TopItem::Rule(hdr) = &g.items[0] else { panic!("expected rule") };
        let TypeExpr::Struct(c) = &hdr.body else { panic!("expected struct") };
        assert!(c.c_layout);
        assert_eq!(c.items.len(), 3);
        let TopItem::Rule(doc) = &g.items[1] else { panic!("expected rule") };
        let TypeExpr::Struct(s) = &doc.body else { panic!("expected struct") };
        assert_eq!(s.items.len(), 5);
        assert!(matches!(&s.items[1], StructItem::Assert(a) if a.text == "h.a == 1"));
        assert!(matches!(&s.items[3], StructItem::Dynamic(TypeExpr::Read { .. })));
        assert!(matches!(&s.items[4], StructItem::Dynamic(TypeExpr::If(i)) if i.branches.len() == 2 && i.otherwise.is_some()));
        assert!(s.ret.is_some());
    }

    #[test]
    fn syntax_errors_carry_position() {
        let err = parse("doc = {\n  a int8\n  b [\n}").unwrap_err();
        assert!(err.line >= 3);
        assert!(parse("doc = ").is_err());
    }

    #[test]
    fn keywords_are_not_identifiers() {
        assert!(parse("case = int8").is_err());
        assert!(parse("cases = int8\ndoc = cases").is_ok());
        assert!(parse("doc = { readme cstring; iflag uint8; letter int8 }").is_ok());
    }
}
