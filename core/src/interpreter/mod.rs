//! Embedded guest language
//!
//! A small R-flavoured interpreter. All of its values are `!Send` and live on
//! the interpreter thread; other threads reach them only through the bridge.

pub mod ast;
pub mod builtins;
pub mod env;
pub mod eval;
pub mod format;
pub mod host;
pub mod parser;
pub mod values;

#[cfg(test)]
mod tests;

pub use env::Env;
pub use eval::{Args, EvalResult, GuestError, Interpreter, StackFrame, Unwind};
pub use format::format_value;
pub use host::{
    Boundary, CaptureHost, ChildCommand, Host, OutputChunk, OutputStream, SourcePosition,
};
pub use parser::{parse, parse_program, ParseError};
pub use values::{List, Value};
