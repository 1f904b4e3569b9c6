//! Leaf matching units: fixed-size scalars, C strings, and the zero-width
//! units (`nil`, `eof`, `done`, `dump`, `assert`, `let`, `global`).

use crate::context::Context;
use crate::dump::dump_dom;
use crate::input::Input;
use crate::ruler::{MatchError, Ruler};
use crate::value::Value;
use crate::vm::Expr;
use byteorder::{BigEndian, ByteOrder, LittleEndian};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Char,
}

impl BaseType {
    pub fn size(self) -> usize {
        match self {
            BaseType::Int8 | BaseType::Uint8 | BaseType::Char => 1,
            BaseType::Int16 | BaseType::Uint16 => 2,
            BaseType::Int32 | BaseType::Uint32 | BaseType::Float32 => 4,
            BaseType::Int64 | BaseType::Uint64 | BaseType::Float64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BaseType::Int8 => "int8",
            BaseType::Int16 => "int16",
            BaseType::Int32 => "int32",
            BaseType::Int64 => "int64",
            BaseType::Uint8 => "uint8",
            BaseType::Uint16 => "uint16",
            BaseType::Uint32 => "uint32",
            BaseType::Uint64 => "uint64",
            BaseType::Float32 => "float32",
            BaseType::Float64 => "float64",
            BaseType::Char => "char",
        }
    }

    fn from_name(s: &str) -> Option<BaseType> {
        let t = match s {
            "int8" => BaseType::Int8,
            "int16" => BaseType::Int16,
            "int32" => BaseType::Int32,
            "int64" => BaseType::Int64,
            "uint8" | "byte" => BaseType::Uint8,
            "uint16" => BaseType::Uint16,
            "uint32" => BaseType::Uint32,
            "uint64" => BaseType::Uint64,
            "float32" => BaseType::Float32,
            "float64" => BaseType::Float64,
            "char" => BaseType::Char,
            _ => return None,
        };
        Some(t)
    }
}

/// A fixed-size scalar with its byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Primitive {
    pub kind: BaseType,
    pub endian: Endianness,
}

impl Primitive {
    pub fn le(kind: BaseType) -> Self {
        Primitive { kind, endian: Endianness::Little }
    }

    /// Builtin type name, e.g. `uint32`, `int16be`, `float64le`.
    pub fn from_name(name: &str) -> Option<Primitive> {
        if let Some(kind) = BaseType::from_name(name) {
            return Some(Primitive::le(kind));
        }
        let (base, endian) = if let Some(b) = name.strip_suffix("be") {
            (b, Endianness::Big)
        } else if let Some(b) = name.strip_suffix("le") {
            (b, Endianness::Little)
        } else {
            return None;
        };
        let kind = BaseType::from_name(base)?;
        if kind.size() == 1 {
            return None;
        }
        Some(Primitive { kind, endian })
    }

    pub fn size(&self) -> usize {
        self.kind.size()
    }

    pub fn decode(&self, b: &[u8]) -> Value {
        match self.endian {
            Endianness::Little => decode_one::<LittleEndian>(self.kind, b),
            Endianness::Big => decode_one::<BigEndian>(self.kind, b),
        }
    }

    /// Decode `b.len() / size` consecutive values.
    pub fn decode_many(&self, b: &[u8]) -> Vec<Value> {
        match self.endian {
            Endianness::Little => decode_slice::<LittleEndian>(self.kind, b),
            Endianness::Big => decode_slice::<BigEndian>(self.kind, b),
        }
    }
}

fn decode_one<B: ByteOrder>(kind: BaseType, b: &[u8]) -> Value {
    match kind {
        BaseType::Int8 => Value::I8(b[0] as i8),
        BaseType::Uint8 | BaseType::Char => Value::U8(b[0]),
        BaseType::Int16 => Value::I16(B::read_i16(b)),
        BaseType::Uint16 => Value::U16(B::read_u16(b)),
        BaseType::Int32 => Value::I32(B::read_i32(b)),
        BaseType::Uint32 => Value::U32(B::read_u32(b)),
        BaseType::Int64 => Value::I64(B::read_i64(b)),
        BaseType::Uint64 => Value::U64(B::read_u64(b)),
        BaseType::Float32 => Value::Float(B::read_f32(b)),
        BaseType::Float64 => Value::Double(B::read_f64(b)),
    }
}

fn decode_slice<B: ByteOrder>(kind: BaseType, b: &[u8]) -> Vec<Value> {
    let n = b.len() / kind.size();
    let b = &b[..n * kind.size()];
    match kind {
        BaseType::Int8 => b.iter().map(|&x| Value::I8(x as i8)).collect(),
        BaseType::Uint8 | BaseType::Char => b.iter().map(|&x| Value::U8(x)).collect(),
        BaseType::Int16 => {
            let mut out = vec![0i16; n];
            B::read_i16_into(b, &mut out);
            out.into_iter().map(Value::I16).collect()
        }
        BaseType::Uint16 => {
            let mut out = vec![0u16; n];
            B::read_u16_into(b, &mut out);
            out.into_iter().map(Value::U16).collect()
        }
        BaseType::Int32 => {
            let mut out = vec![0i32; n];
            B::read_i32_into(b, &mut out);
            out.into_iter().map(Value::I32).collect()
        }
        BaseType::Uint32 => {
            let mut out = vec![0u32; n];
            B::read_u32_into(b, &mut out);
            out.into_iter().map(Value::U32).collect()
        }
        BaseType::Int64 => {
            let mut out = vec![0i64; n];
            B::read_i64_into(b, &mut out);
            out.into_iter().map(Value::I64).collect()
        }
        BaseType::Uint64 => {
            let mut out = vec![0u64; n];
            B::read_u64_into(b, &mut out);
            out.into_iter().map(Value::U64).collect()
        }
        BaseType::Float32 => {
            let mut out = vec![0f32; n];
            B::read_f32_into(b, &mut out);
            out.into_iter().map(Value::Float).collect()
        }
        BaseType::Float64 => {
            let mut out = vec![0f64; n];
            B::read_f64_into(b, &mut out);
            out.into_iter().map(Value::Double).collect()
        }
    }
}

impl Ruler for Primitive {
    fn match_in(&self, input: &mut Input<'_>, _ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        let size = self.size();
        let v = self.decode(input.peek(size)?);
        input.consume(size);
        Ok(v)
    }

    fn size_of(&self) -> Option<usize> {
        Some(self.size())
    }

    fn full_name(&self) -> String {
        match (self.size(), self.endian) {
            (1, _) | (_, Endianness::Little) => self.kind.name().to_string(),
            (_, Endianness::Big) => format!("{}be", self.kind.name()),
        }
    }

    fn as_primitive(&self) -> Option<Primitive> {
        Some(*self)
    }
}

/// NUL-terminated string.
#[derive(Debug)]
pub struct CString;

impl Ruler for CString {
    fn match_in(&self, input: &mut Input<'_>, _ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        let b = input.read_until(0)?;
        Ok(Value::String(String::from_utf8_lossy(&b).into_owned()))
    }

    fn size_of(&self) -> Option<usize> {
        None
    }

    fn full_name(&self) -> String {
        "cstring".to_string()
    }
}

/// Matches zero bytes.
#[derive(Debug)]
pub struct Nil;

impl Ruler for Nil {
    fn match_in(&self, _input: &mut Input<'_>, _ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        Ok(Value::Nil)
    }

    fn size_of(&self) -> Option<usize> {
        Some(0)
    }

    fn full_name(&self) -> String {
        "nil".to_string()
    }
}

/// Succeeds only at end of input.
#[derive(Debug)]
pub struct Eof;

impl Ruler for Eof {
    fn match_in(&self, input: &mut Input<'_>, _ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        if input.at_eof()? {
            Ok(Value::Nil)
        } else {
            Err(MatchError::NotEof)
        }
    }

    fn size_of(&self) -> Option<usize> {
        None
    }

    fn full_name(&self) -> String {
        "eof".to_string()
    }
}

/// Discards the rest of the input.
#[derive(Debug)]
pub struct Done;

impl Ruler for Done {
    fn match_in(&self, input: &mut Input<'_>, _ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        input.skip_to_end()?;
        Ok(Value::Nil)
    }

    fn size_of(&self) -> Option<usize> {
        None
    }

    fn full_name(&self) -> String {
        "done".to_string()
    }
}

/// Writes the current DOM to the context's dumper, prefixed by the
/// `DUMP_PREFIX` global when set.
#[derive(Debug)]
pub struct Dump;

pub const DUMP_PREFIX: &str = "DUMP_PREFIX";

impl Ruler for Dump {
    fn match_in(&self, _input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        let mut text = match ctx.global(DUMP_PREFIX) {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };
        text.push('\n');
        text.push_str(&dump_dom(&ctx.dom()));
        ctx.write_dump(&text)?;
        Ok(Value::Nil)
    }

    fn size_of(&self) -> Option<usize> {
        Some(0)
    }

    fn full_name(&self) -> String {
        "dump".to_string()
    }
}

#[derive(Debug)]
pub struct Assert {
    pub expr: Expr,
}

impl Ruler for Assert {
    fn match_in(&self, _input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        if self.expr.eval_bool(ctx)? {
            Ok(Value::Nil)
        } else {
            Err(MatchError::AssertFailed(self.expr.text.clone()))
        }
    }

    fn size_of(&self) -> Option<usize> {
        Some(0)
    }

    fn full_name(&self) -> String {
        format!("assert {}", self.expr.text)
    }
}

/// `let name = expr`
#[derive(Debug)]
pub struct Let {
    pub name: String,
    pub expr: Expr,
}

impl Ruler for Let {
    fn match_in(&self, _input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        let v = self.expr.eval(ctx)?;
        ctx.let_var(&self.name, v)?;
        Ok(Value::Nil)
    }

    fn size_of(&self) -> Option<usize> {
        Some(0)
    }

    fn full_name(&self) -> String {
        format!("let {} = {}", self.name, self.expr.text)
    }
}

/// `global name = expr`
#[derive(Debug)]
pub struct Global {
    pub name: String,
    pub expr: Expr,
}

impl Ruler for Global {
    fn match_in(&self, _input: &mut Input<'_>, ctx: &mut Context<'_>) -> Result<Value, MatchError> {
        let v = self.expr.eval(ctx)?;
        ctx.set_global(&self.name, v);
        Ok(Value::Nil)
    }

    fn size_of(&self) -> Option<usize> {
        Some(0)
    }

    fn full_name(&self) -> String {
        format!("global {} = {}", self.name, self.expr.text)
    }
}
