//! Inspection requests served on the interpreter thread
//!
//! Everything here runs inside bridge tasks. Evaluation triggered by
//! inspection never stops at breakpoints and never writes to the console.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::EvalError;
use crate::events::{frame_infos, FrameInfo};
use crate::interpreter::{format_value, parse_program, CaptureHost, OutputChunk, Value};
use crate::refs::{self, Handle, Reference};

use super::{Session, CONSOLE_SOURCE};

/// Summary of a value for variable views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub type_name: String,
    pub class: Vec<String>,
    pub length: usize,
    pub preview: String,
}

/// One child of a scope or list in a variable view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Binding or element name; empty for unnamed elements
    pub name: String,
    pub reference: Reference,
    pub value: ValueInfo,
}

/// A page of children together with the number of children in total
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Variables {
    pub total_count: usize,
    pub vars: Vec<Variable>,
}

/// An enclosing scope of a scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentEnv {
    pub name: String,
    pub reference: Reference,
}

/// Outcome of `execute_code`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub output: Vec<OutputChunk>,
    pub error: Option<String>,
}

fn truncate(text: String, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((end, _)) => text[..end].to_string(),
        None => text,
    }
}

impl Session {
    pub fn resolve(&self, reference: &Reference) -> Result<Value, EvalError> {
        let _evaluation = self.control.task_evaluation();
        refs::resolve(self, reference)
    }

    /// `None` when the reference resolves to `NULL`
    pub fn inspect(&self, reference: &Reference) -> Result<Option<ValueInfo>, EvalError> {
        let value = self.resolve(reference)?;
        Ok((!value.is_null()).then(|| self.describe(&value)))
    }

    pub fn value_info(&self, reference: &Reference) -> Result<ValueInfo, EvalError> {
        Ok(self.describe(&self.resolve(reference)?))
    }

    fn describe(&self, value: &Value) -> ValueInfo {
        ValueInfo {
            type_name: value.type_name().to_string(),
            class: value.class(),
            length: value.length(),
            preview: truncate(format_value(value), self.config.eval.preview_limit),
        }
    }

    /// Printed form of the value; evaluation errors come back as text
    pub fn evaluate_as_text(&self, reference: &Reference) -> String {
        let text = match self.resolve(reference) {
            Ok(value) => format_value(&value),
            Err(err) => format!("Error: {}", err.message),
        };
        truncate(text, self.config.eval.text_limit)
    }

    pub fn evaluate_as_boolean(&self, reference: &Reference) -> bool {
        match self.resolve(reference) {
            Ok(value) => value.as_bool().unwrap_or(false),
            Err(err) => {
                debug!(error = %err, "Boolean evaluation failed");
                false
            }
        }
    }

    /// Names bound in the frame of a scope, sorted
    pub fn load_object_names(&self, reference: &Reference) -> Result<Vec<String>, EvalError> {
        Ok(match self.resolve(reference)? {
            Value::Env(env) => env.names(),
            _ => Vec::new(),
        })
    }

    /// Children `start..end` of a scope (sorted bindings) or a list
    /// (elements). Other values have no children.
    pub fn load_variables(
        &self,
        reference: &Reference,
        start: usize,
        end: Option<usize>,
    ) -> Result<Variables, EvalError> {
        let container = self.resolve(reference)?;
        let total_count = match &container {
            Value::Env(env) => env.len(),
            Value::List(list) => list.items.len(),
            _ => 0,
        };
        let end = end.unwrap_or(total_count).min(total_count);
        let start = start.min(end);

        let vars = match &container {
            Value::Env(env) => env.names()[start..end]
                .iter()
                .map(|name| Variable {
                    name: name.clone(),
                    reference: reference.clone().member(name.as_str()),
                    value: self.describe(&env.get_local(name).unwrap_or(Value::Null)),
                })
                .collect(),
            Value::List(list) => {
                let names = list.names().unwrap_or_default();
                (start..end)
                    .map(|index| Variable {
                        name: names.get(index).cloned().unwrap_or_default(),
                        reference: reference.clone().element(index),
                        value: self.describe(&refs::list_element(&container, index)),
                    })
                    .collect()
            }
            _ => Vec::new(),
        };
        Ok(Variables { total_count, vars })
    }

    /// Enclosing scopes of a scope, innermost first, stopping before the
    /// empty environment
    pub fn load_parent_envs(&self, reference: &Reference) -> Result<Vec<ParentEnv>, EvalError> {
        let mut parents = Vec::new();
        let Value::Env(env) = self.resolve(reference)? else {
            return Ok(parents);
        };
        let mut current = env.parent().cloned();
        let mut levels = 1;
        while let Some(env) = current.take().filter(|env| !env.is_empty_env()) {
            parents.push(ParentEnv {
                name: env.name().unwrap_or("<environment>").to_string(),
                reference: reference.clone().parent(levels),
            });
            current = env.parent().cloned();
            levels += 1;
        }
        Ok(parents)
    }

    /// Identity of the resolved value, stable while the value lives. `0` for
    /// scalars and failed resolutions.
    pub fn equality_object(&self, reference: &Reference) -> u64 {
        match self.resolve(reference) {
            Ok(value) => value.identity().unwrap_or(0) as u64,
            Err(err) => {
                debug!(error = %err, "Equality object unavailable");
                0
            }
        }
    }

    /// Distinct strings of a character vector or factor in order of first
    /// appearance, cut off once their total length passes the text limit
    pub fn distinct_strings(&self, reference: &Reference) -> Result<Vec<String>, EvalError> {
        let value = self.resolve(reference)?;
        let strings = match &value {
            Value::List(factor) if value.inherits("factor") => {
                let levels = factor.attr("levels").map(Value::as_strings).unwrap_or_default();
                factor
                    .items
                    .iter()
                    .filter_map(Value::as_number)
                    .filter_map(|code| levels.get((code as usize).checked_sub(1)?).cloned())
                    .collect()
            }
            _ if value.type_name() == "character" => value.as_strings(),
            _ => return Ok(Vec::new()),
        };

        let mut distinct: Vec<String> = Vec::new();
        let mut total = 0;
        for text in strings {
            if distinct.contains(&text) {
                continue;
            }
            total += text.len();
            if total > self.config.eval.text_limit {
                break;
            }
            distinct.push(text);
        }
        Ok(distinct)
    }

    /* ===================== Handles ===================== */

    pub fn register_handle(&self, reference: &Reference) -> Result<Handle, EvalError> {
        let value = self.resolve(reference)?;
        Ok(self.registry.borrow_mut().register(value))
    }

    pub fn has_handle(&self, handle: Handle) -> bool {
        self.registry.borrow().has(handle)
    }

    pub fn remove_handles(&self, handles: &[Handle]) {
        self.registry.borrow_mut().remove_all(handles.iter().copied());
    }

    pub fn handle_count(&self) -> usize {
        self.registry.borrow().len()
    }

    /* ===================== Mutation ===================== */

    /// Store the value of `source` at `target`
    pub fn set_value(&self, target: &Reference, source: &Reference) -> Result<(), EvalError> {
        let value = self.resolve(source)?;
        refs::set_value(self, target, value)
    }

    pub fn clear_environment(&self, reference: &Reference) -> Result<(), EvalError> {
        match self.resolve(reference)? {
            Value::Env(env) => {
                env.clear();
                Ok(())
            }
            other => Err(EvalError::new(format!(
                "cannot clear a value of type '{}'",
                other.type_name()
            ))),
        }
    }

    /// Evaluate `code` in the global scope outside the REPL, capturing output
    pub fn execute_code(&self, code: &str) -> ExecuteResult {
        let program = match parse_program(code, CONSOLE_SOURCE, 0) {
            Ok(program) => program,
            Err(err) => {
                return ExecuteResult {
                    output: Vec::new(),
                    error: Some(err.to_string()),
                }
            }
        };
        let _evaluation = self.control.task_evaluation();
        let host = CaptureHost::with_interrupt(self.control.interrupt_flag());
        let result = self
            .interp
            .eval_toplevel(&program, &self.interp.global_env(), &host);
        ExecuteResult {
            output: host.take(),
            error: result.err().map(|unwind| unwind.message()),
        }
    }

    /* ===================== Stacks ===================== */

    pub fn last_error_stack(&self) -> Vec<FrameInfo> {
        frame_infos(&self.last_error_stack.borrow())
    }

    pub fn debug_stack(&self) -> Vec<FrameInfo> {
        frame_infos(&self.debug_stack.borrow())
    }
}
