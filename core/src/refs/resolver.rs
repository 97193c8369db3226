//! Resolves [`Reference`] descriptors to live values on the interpreter thread
//!
//! Structural mismatches resolve to `NULL`. Only `Expression` can fail.

use crate::errors::EvalError;
use crate::interpreter::eval::element;
use crate::interpreter::{Env, List, Value};

use super::reference::Reference;
use super::registry::Handle;

/// Interpreter state the resolver reads
pub trait ResolveContext {
    fn global_env(&self) -> Env;

    fn current_env(&self) -> Env;

    /// Environment of frame `index` of the current debugger stop
    fn debug_frame(&self, index: usize) -> Option<Env>;

    /// Environment of frame `index` of the last uncaught error
    fn error_frame(&self, index: usize) -> Option<Env>;

    fn handle_value(&self, handle: Handle) -> Option<Value>;

    /// Parse and evaluate `code` in `env`
    fn eval_in(&self, env: &Env, code: &str) -> Result<Value, EvalError>;
}

pub fn resolve(ctx: &dyn ResolveContext, reference: &Reference) -> Result<Value, EvalError> {
    let value = match reference {
        Reference::PersistentHandle { handle } => {
            ctx.handle_value(*handle).unwrap_or(Value::Null)
        }
        Reference::GlobalScope => Value::Env(ctx.global_env()),
        Reference::CurrentScope => Value::Env(ctx.current_env()),
        Reference::StackFrame { index } => {
            ctx.debug_frame(*index).map(Value::Env).unwrap_or(Value::Null)
        }
        Reference::ErrorStackFrame { index } => {
            ctx.error_frame(*index).map(Value::Env).unwrap_or(Value::Null)
        }
        Reference::Member { scope, name } => match resolve(ctx, scope)? {
            Value::Env(env) => env.get_local(name).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        Reference::ParentScope { scope, levels } => {
            let mut current = resolve(ctx, scope)?;
            for _ in 0..*levels {
                current = match &current {
                    Value::Env(env) => match env.parent() {
                        Some(parent) => Value::Env(parent.clone()),
                        None => return Ok(Value::Null),
                    },
                    _ => return Ok(Value::Null),
                };
            }
            current
        }
        Reference::Expression { scope, code } => match resolve(ctx, scope)? {
            Value::Env(env) => ctx.eval_in(&env, code)?,
            _ => return Err(EvalError::new("invalid 'envir' argument")),
        },
        Reference::ListElement { list, index } => list_element(&resolve(ctx, list)?, *index),
        Reference::Attributes { value } => attributes(&resolve(ctx, value)?),
    };
    Ok(value)
}

/// Zero-based element of `container`. Factors keep their class, other
/// classes are dropped.
pub fn list_element(container: &Value, index: usize) -> Value {
    let element = if container.inherits("factor") {
        element(container, index)
    } else {
        element(&container.unclass(), index)
    };
    element.unwrap_or(Value::Null)
}

/// Attributes of `value` as a named list, `NULL` when there are none
pub fn attributes(value: &Value) -> Value {
    let attrs = value.attrs();
    if attrs.is_empty() {
        return Value::Null;
    }
    let mut list = List::new(attrs.iter().map(|(_, v)| v.clone()).collect());
    list.set_attr(
        "names",
        Value::list(List::vector(
            attrs.iter().map(|(k, _)| Value::Str(k.clone())).collect(),
        )),
    );
    Value::list(list)
}

/* ===================== Write-back ===================== */

/// Store `value` at `target`, rebuilding containers on the way back up
pub fn set_value(
    ctx: &dyn ResolveContext,
    target: &Reference,
    value: Value,
) -> Result<(), EvalError> {
    match target {
        Reference::Member { scope, name } => match resolve(ctx, scope)? {
            Value::Env(env) => {
                env.set(name, value);
                Ok(())
            }
            _ => Err(EvalError::new("Invalid reference for setValue")),
        },
        Reference::ListElement { list, index } => {
            let container = resolve(ctx, list)?;
            let rebuilt = replace_element(&container, *index, value)?;
            set_value(ctx, list, rebuilt)
        }
        Reference::Attributes { value: inner } => {
            let container = resolve(ctx, inner)?;
            let rebuilt = replace_attributes(&container, &value)
                .ok_or_else(|| EvalError::new("Invalid reference for setValue"))?;
            set_value(ctx, inner, rebuilt)
        }
        _ => Err(EvalError::new("Invalid reference for setValue")),
    }
}

fn as_list(value: &Value) -> Option<List> {
    match value {
        Value::List(list) => Some((**list).clone()),
        Value::Null => Some(List::new(Vec::new())),
        Value::Logical(_) | Value::Number(_) | Value::Str(_) => {
            Some(List::vector(vec![value.clone()]))
        }
        _ => None,
    }
}

/// Replace element `index`, or append when `index` is one past the end
fn replace_element(container: &Value, index: usize, value: Value) -> Result<Value, EvalError> {
    let mut list =
        as_list(container).ok_or_else(|| EvalError::new("Invalid reference for setValue"))?;
    if index > list.items.len() {
        return Err(EvalError::new("subscript out of bounds"));
    }
    if index == list.items.len() {
        list.items.push(Value::Null);
    }
    if !matches!(value, Value::Logical(_) | Value::Number(_) | Value::Str(_)) {
        list.atomic = false;
    }
    list.items[index] = value;
    Ok(Value::list(list))
}

fn replace_attributes(container: &Value, attrs: &Value) -> Option<Value> {
    let mut list = as_list(container)?;
    list.attrs.clear();
    match attrs {
        Value::Null => {}
        Value::List(new_attrs) => {
            let names = new_attrs.names()?;
            for (name, value) in names.iter().zip(new_attrs.items.iter()) {
                list.set_attr(name, value.clone());
            }
        }
        _ => return None,
    }
    Some(Value::list(list))
}
