//! Guest values
//!
//! Values are reference counted and confined to the interpreter thread.

use std::fmt;
use std::rc::Rc;

use super::ast::Expr;
use super::builtins::BuiltinFn;
use super::env::Env;

#[derive(Clone)]
pub enum Value {
    Null,
    Logical(bool),
    Number(f64),
    Str(String),
    List(Rc<List>),
    Env(Env),
    Closure(Rc<Closure>),
    Builtin(Builtin),
}

/// Ordered collection with attributes. `atomic` marks vectors built by `c()`.
#[derive(Clone, Default)]
pub struct List {
    pub items: Vec<Value>,
    pub attrs: Vec<(String, Value)>,
    pub atomic: bool,
}

pub struct Closure {
    pub params: Vec<String>,
    pub body: Rc<Expr>,
    pub env: Env,
    pub source: Rc<str>,
}

#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
    /// Bare identifiers passed positionally arrive as their names
    pub quoting: bool,
}

/* ===================== Lists ===================== */

impl List {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items,
            attrs: Vec::new(),
            atomic: false,
        }
    }

    pub fn vector(items: Vec<Value>) -> Self {
        Self {
            items,
            attrs: Vec::new(),
            atomic: true,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn set_attr(&mut self, name: &str, value: Value) {
        if matches!(value, Value::Null) {
            self.remove_attr(name);
            return;
        }
        match self.attrs.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name.to_string(), value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) {
        self.attrs.retain(|(k, _)| k != name);
    }

    /// Element names from the `names` attribute
    pub fn names(&self) -> Option<Vec<String>> {
        self.attr("names").map(|names| names.as_strings())
    }

    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.names()?.iter().position(|n| n == name)
    }
}

/* ===================== Values ===================== */

impl Value {
    pub fn str(text: impl Into<String>) -> Self {
        Value::Str(text.into())
    }

    pub fn list(list: List) -> Self {
        Value::List(Rc::new(list))
    }

    /// Character vector from owned strings; a single string stays scalar
    pub fn strings(mut items: Vec<String>) -> Self {
        match items.len() {
            0 => Value::Null,
            1 => Value::Str(items.remove(0)),
            _ => Value::list(List::vector(items.into_iter().map(Value::Str).collect())),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Logical(_) => "logical",
            Value::Number(_) => "double",
            Value::Str(_) => "character",
            Value::List(list) if list.atomic => vector_type(&list.items),
            Value::List(_) => "list",
            Value::Env(_) => "environment",
            Value::Closure(_) => "closure",
            Value::Builtin(_) => "builtin",
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Closure(_) | Value::Builtin(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_env(&self) -> Option<&Env> {
        match self {
            Value::Env(env) => Some(env),
            _ => None,
        }
    }

    /// Attribute pairs; only lists carry attributes
    pub fn attrs(&self) -> &[(String, Value)] {
        match self {
            Value::List(list) => &list.attrs,
            _ => &[],
        }
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        match self {
            Value::List(list) => list.attr(name),
            _ => None,
        }
    }

    /// Explicit `class` attribute, or the implicit class of the value
    pub fn class(&self) -> Vec<String> {
        if let Some(class) = self.attr("class") {
            return class.as_strings();
        }
        let implicit = match self {
            Value::Null => "NULL",
            Value::Logical(_) => "logical",
            Value::Number(_) => "numeric",
            Value::Str(_) => "character",
            Value::List(list) if list.atomic => match vector_type(&list.items) {
                "double" => "numeric",
                other => other,
            },
            Value::List(_) => "list",
            Value::Env(_) => "environment",
            Value::Closure(_) | Value::Builtin(_) => "function",
        };
        vec![implicit.to_string()]
    }

    /// True only for an explicit `class` attribute containing `name`
    pub fn inherits(&self, name: &str) -> bool {
        self.attr("class")
            .map(|class| class.as_strings().iter().any(|c| c == name))
            .unwrap_or(false)
    }

    /// The value without its `class` attribute
    pub fn unclass(&self) -> Value {
        match self {
            Value::List(list) if list.attr("class").is_some() => {
                let mut copy = (**list).clone();
                copy.remove_attr("class");
                Value::list(copy)
            }
            other => other.clone(),
        }
    }

    pub fn length(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::List(list) => list.items.len(),
            Value::Env(env) => env.len(),
            _ => 1,
        }
    }

    /// Logical interpretation of a length-one value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Logical(b) => Some(*b),
            Value::Number(n) if !n.is_nan() => Some(*n != 0.0),
            Value::Str(s) => match s.as_str() {
                "TRUE" | "true" | "T" => Some(true),
                "FALSE" | "false" | "F" => Some(false),
                _ => None,
            },
            Value::List(list) if list.items.len() == 1 => list.items[0].as_bool(),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Logical(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::List(list) if list.items.len() == 1 => list.items[0].as_number(),
            _ => None,
        }
    }

    /// Text used by `cat` and `paste`
    pub fn as_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Logical(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.clone(),
            Value::List(list) => list
                .items
                .iter()
                .map(Value::as_text)
                .collect::<Vec<_>>()
                .join(" "),
            other => format!("{:?}", other),
        }
    }

    /// Elements as strings: a scalar yields one entry, a list one per item
    pub fn as_strings(&self) -> Vec<String> {
        match self {
            Value::Null => Vec::new(),
            Value::List(list) => list.items.iter().map(Value::as_text).collect(),
            other => vec![other.as_text()],
        }
    }

    /// Address of a shared value; scalars have none
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::List(list) => Some(Rc::as_ptr(list) as usize),
            Value::Env(env) => Some(env.address()),
            Value::Closure(closure) => Some(Rc::as_ptr(closure) as usize),
            _ => None,
        }
    }

    /// Identity for shared values, equality for scalars
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Logical(a), Value::Logical(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Env(a), Value::Env(b)) => a.ptr_eq(b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
            _ => false,
        }
    }
}

fn vector_type(items: &[Value]) -> &'static str {
    if items.iter().any(|v| matches!(v, Value::Str(_))) {
        "character"
    } else if items.iter().any(|v| matches!(v, Value::Number(_))) {
        "double"
    } else if items.iter().all(|v| matches!(v, Value::Logical(_))) {
        "logical"
    } else {
        "list"
    }
}

pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Inf" } else { "-Inf" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        let text = format!("{:.7}", n);
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Logical(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(list) => f.debug_list().entries(list.items.iter()).finish(),
            Value::Env(env) => write!(f, "{:?}", env),
            Value::Closure(c) => write!(f, "function({})", c.params.join(", ")),
            Value::Builtin(b) => write!(f, "<builtin {}>", b.name),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Logical(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}
