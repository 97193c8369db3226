//! Hooks the evaluator calls back into while running guest code

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::eval::{Interpreter, Unwind};
use super::values::Value;

/// Output stream a chunk of guest output belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

/// Location of a statement in guest source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourcePosition {
    pub file: String,
    pub line: u32,
}

impl SourcePosition {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

/// The statement about to be evaluated
#[derive(Debug, Clone)]
pub struct Boundary {
    pub source: Rc<str>,
    pub line: u32,
    /// Number of frames on the call stack, the top-level frame included
    pub depth: usize,
    /// Name of the function whose body contains the statement
    pub function: Option<Rc<str>>,
}

impl Boundary {
    pub fn position(&self) -> SourcePosition {
        SourcePosition::new(self.source.as_ref(), self.line)
    }
}

/// A child process requested by `system()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    pub program: String,
    pub args: Vec<String>,
    /// The child reads its stdin from the client
    pub interactive: bool,
}

pub trait Host {
    /// Called before every statement of a program, block or function body
    fn at_boundary(&self, _interp: &Interpreter, _boundary: &Boundary) -> Result<(), Unwind> {
        Ok(())
    }

    /// Polled by long-running builtins and on every call
    fn check_interrupt(&self) -> Result<(), Unwind> {
        Ok(())
    }

    fn write(&self, stream: OutputStream, text: &str);

    /// `Ok(None)` means end of input
    fn read_line(&self, _interp: &Interpreter, _prompt: &str) -> Result<Option<String>, Unwind> {
        Ok(None)
    }

    fn browser(&self, _interp: &Interpreter) -> Result<(), Unwind> {
        Ok(())
    }

    fn view(&self, _interp: &Interpreter, _value: Value, _title: &str) -> Result<(), Unwind> {
        Ok(())
    }

    fn run_child(&self, interp: &Interpreter, command: ChildCommand) -> Result<i32, Unwind> {
        Err(interp.error(format!(
            "cannot run '{}': child processes are not available here",
            command.program
        )))
    }

    fn quit(&self, interp: &Interpreter) -> Result<(), Unwind> {
        Err(interp.error("quit() is not available here"))
    }
}

/* ===================== Capturing Host ===================== */

/// Host that records output instead of streaming it. Breakpoints and
/// input requests are ignored.
#[derive(Default)]
pub struct CaptureHost {
    chunks: RefCell<Vec<OutputChunk>>,
    interrupt: Option<Arc<AtomicBool>>,
}

impl CaptureHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Honour interrupts raised through `flag`
    pub fn with_interrupt(flag: Arc<AtomicBool>) -> Self {
        Self {
            chunks: RefCell::new(Vec::new()),
            interrupt: Some(flag),
        }
    }

    pub fn take(&self) -> Vec<OutputChunk> {
        std::mem::take(&mut *self.chunks.borrow_mut())
    }

    /// All stdout text concatenated
    pub fn stdout(&self) -> String {
        self.chunks
            .borrow()
            .iter()
            .filter(|c| c.stream == OutputStream::Stdout)
            .map(|c| c.text.as_str())
            .collect()
    }
}

impl Host for CaptureHost {
    fn check_interrupt(&self) -> Result<(), Unwind> {
        match &self.interrupt {
            Some(flag) if flag.swap(false, Ordering::SeqCst) => Err(Unwind::Interrupted),
            _ => Ok(()),
        }
    }

    fn write(&self, stream: OutputStream, text: &str) {
        let mut chunks = self.chunks.borrow_mut();
        match chunks.last_mut() {
            Some(last) if last.stream == stream => last.text.push_str(text),
            _ => chunks.push(OutputChunk {
                stream,
                text: text.to_string(),
            }),
        }
    }
}
