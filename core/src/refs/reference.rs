//! Reference descriptors sent by clients to name interpreter values

use serde::{Deserialize, Serialize};

use super::registry::Handle;

/// Path to a live interpreter value. Compound variants resolve their inner
/// reference first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reference {
    /// Value held by the handle registry
    PersistentHandle { handle: Handle },
    GlobalScope,
    /// Innermost frame while debugging, the global scope otherwise
    CurrentScope,
    /// Frame of the stack captured at the current debugger stop
    StackFrame { index: usize },
    /// Frame of the stack captured at the last uncaught error
    ErrorStackFrame { index: usize },
    /// Binding in the frame of `scope`, not inherited
    Member { scope: Box<Reference>, name: String },
    ParentScope { scope: Box<Reference>, levels: usize },
    /// `code` evaluated in `scope`
    Expression { scope: Box<Reference>, code: String },
    /// Zero-based element of `list`
    ListElement { list: Box<Reference>, index: usize },
    Attributes { value: Box<Reference> },
}

impl Reference {
    pub fn handle(handle: Handle) -> Self {
        Reference::PersistentHandle { handle }
    }

    pub fn stack_frame(index: usize) -> Self {
        Reference::StackFrame { index }
    }

    pub fn error_stack_frame(index: usize) -> Self {
        Reference::ErrorStackFrame { index }
    }

    pub fn member(self, name: impl Into<String>) -> Self {
        Reference::Member {
            scope: Box::new(self),
            name: name.into(),
        }
    }

    pub fn parent(self, levels: usize) -> Self {
        Reference::ParentScope {
            scope: Box::new(self),
            levels,
        }
    }

    pub fn expression(self, code: impl Into<String>) -> Self {
        Reference::Expression {
            scope: Box::new(self),
            code: code.into(),
        }
    }

    pub fn element(self, index: usize) -> Self {
        Reference::ListElement {
            list: Box::new(self),
            index,
        }
    }

    pub fn attributes(self) -> Self {
        Reference::Attributes {
            value: Box::new(self),
        }
    }
}
