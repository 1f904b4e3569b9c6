//! # BPL: Binary Protocol Layout DSL and Matcher
//!
//! A DSL for describing binary formats (headers, records, tagged unions,
//! length-prefixed payloads) with a PEST grammar, plus a runtime that matches
//! a byte stream against the compiled description and produces a tree of
//! [`Value`]s that can be dumped as text or JSON.
//!
//! ## DSL structure
//!
//! - **Rules**: `name = expr`; the rule named `doc` is the entry point
//! - **Constants**: `const N = 4` or `const ( A = 1; B = 2 )`
//! - **Structs**: `{ name type; ... }`, matched into a map
//! - **Sequences**: `[A B]` collects into a list, `A B` matches in place
//! - **Repetition**: `*T`, `+T`, `?T`
//!
//! ## Member types
//!
//! - Base: `int8` .. `uint64`, `float32`, `float64`, `char`, `byte`, with `le`/`be` suffixes
//! - `cstring`, `nil`, `eof`, `done`, `dump`
//! - Arrays `[n]T` with constant or expression lengths, `*T`/`+T`/`?T` lists
//! - `case e { label: T ... default: T }`, `if c {..} elif c {..} else {..}`
//! - `read n do T`, `eval bytes do T`, `lzw bytes, order, width do T`
//! - `assert`, `let`, `global`, `return`, and `{/C ...}` fixed layouts
//!
//! ## Example DSL
//!
//! ```text
//! const ( TEXT = 1; BLOB = 2 )
//!
//! record = {
//!   kind uint8
//!   len uint16be
//!   case kind {
//!     TEXT: { body cstring }
//!     BLOB: { body [len]byte }
//!   }
//! }
//!
//! doc = *[record]
//! ```
//!
//! ## Usage
//!
//! ```
//! let proto = bpl::Protocol::from_str("doc = { a uint8; b [a]char }", "demo.bpl").unwrap();
//! let v = proto.match_buffer(b"\x02hi").unwrap();
//! assert_eq!(v.to_json(), r#"{"a":2,"b":"hi"}"#);
//! ```

pub mod array;
pub mod ast;
pub mod base;
pub mod compiler;
pub mod compose;
pub mod context;
pub mod dump;
pub mod input;
pub mod parser;
pub mod ruler;
pub mod structs;
pub mod value;
pub mod vm;

pub use compiler::{CompileError, Options, Protocol};
pub use context::Context;
pub use dump::{dump_dom, hex_dump};
pub use input::Input;
pub use parser::{parse, ParseError};
pub use ruler::{MatchError, Ruler};
pub use value::Value;
