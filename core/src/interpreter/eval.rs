//! Tree-walking evaluator
//!
//! Keeps the guest call stack and reports every statement to the [`Host`]
//! before evaluating it. Borrows of interpreter state are never held across
//! a host callback, since the host may run nested evaluations.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::ast::{Arg, BinaryOp, Expr, ExprKind, Program};
use super::builtins;
use super::env::Env;
use super::format::format_value;
use super::host::{Boundary, Host, OutputStream, SourcePosition};
use super::values::{Closure, List, Value};

/* ===================== Stack & Errors ===================== */

/// Snapshot of one call frame
#[derive(Clone)]
pub struct StackFrame {
    pub function: Option<String>,
    pub position: Option<SourcePosition>,
    pub env: Env,
}

/// Guest-level error with the stack captured where it was raised
#[derive(Clone)]
pub struct GuestError {
    pub message: String,
    pub stack: Vec<StackFrame>,
}

impl GuestError {
    /// Error with no stack, for faults raised outside evaluation
    pub fn bare(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Vec::new(),
        }
    }
}

impl std::fmt::Debug for GuestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GuestError({:?}, {} frames)", self.message, self.stack.len())
    }
}

/// Non-local exit from evaluation
#[derive(Debug, Clone)]
pub enum Unwind {
    Error(GuestError),
    /// User interrupt
    Interrupted,
    /// Evaluation abandoned by the debugger (stop) or by shutdown
    Aborted,
}

impl Unwind {
    pub fn message(&self) -> String {
        match self {
            Unwind::Error(err) => err.message.clone(),
            Unwind::Interrupted => "interrupted".to_string(),
            Unwind::Aborted => "aborted".to_string(),
        }
    }
}

pub type EvalResult<T = Value> = Result<T, Unwind>;

/* ===================== Arguments ===================== */

/// Evaluated call arguments in call order
#[derive(Debug, Clone, Default)]
pub struct Args {
    pub items: Vec<(Option<String>, Value)>,
}

impl Args {
    pub fn positional(values: Vec<Value>) -> Self {
        Self {
            items: values.into_iter().map(|v| (None, v)).collect(),
        }
    }

    /// Match arguments to `formals`: exact names first, then remaining
    /// positional arguments in order. Returns the offending name on mismatch.
    pub fn bind(self, formals: &[&str]) -> Result<Vec<Option<Value>>, String> {
        let mut bound: Vec<Option<Value>> = vec![None; formals.len()];
        let mut rest = Vec::new();
        for (name, value) in self.items {
            match name {
                Some(name) => match formals.iter().position(|f| *f == name) {
                    Some(i) if bound[i].is_none() => bound[i] = Some(value),
                    _ => return Err(name),
                },
                None => rest.push(value),
            }
        }
        let mut rest = rest.into_iter();
        for slot in bound.iter_mut().filter(|slot| slot.is_none()) {
            match rest.next() {
                Some(value) => *slot = Some(value),
                None => break,
            }
        }
        if let Some(extra) = rest.next() {
            return Err(format_value(&extra));
        }
        Ok(bound)
    }

    /// Remove and return the argument named `name`
    pub fn take_named(&mut self, name: &str) -> Option<Value> {
        let index = self
            .items
            .iter()
            .position(|(n, _)| n.as_deref() == Some(name))?;
        Some(self.items.remove(index).1)
    }
}

/* ===================== Interpreter ===================== */

struct Frame {
    function: Option<Rc<str>>,
    env: Env,
    source: Rc<str>,
    line: u32,
}

/// Call depth at which evaluation gives up with an error
pub const DEFAULT_MAX_DEPTH: usize = 1000;

pub struct Interpreter {
    global: Env,
    base: Env,
    frames: RefCell<Vec<Frame>>,
    visible: Cell<bool>,
    max_depth: usize,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_max_depth(DEFAULT_MAX_DEPTH)
    }

    /// Interpreter whose call stack may hold at most `max_depth` frames
    pub fn with_max_depth(max_depth: usize) -> Self {
        let empty = Env::empty();
        let base = Env::named("base", &empty);
        builtins::install(&base);
        let global = Env::named("R_GlobalEnv", &base);
        Self {
            global,
            base,
            frames: RefCell::new(Vec::new()),
            visible: Cell::new(true),
            max_depth: max_depth.max(1),
        }
    }

    pub fn global_env(&self) -> Env {
        self.global.clone()
    }

    pub fn base_env(&self) -> Env {
        self.base.clone()
    }

    /// Environment of the innermost frame, or the global scope when idle
    pub fn current_env(&self) -> Env {
        self.frames
            .borrow()
            .last()
            .map(|f| f.env.clone())
            .unwrap_or_else(|| self.global.clone())
    }

    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Snapshot of the call stack, outermost frame first
    pub fn stack(&self) -> Vec<StackFrame> {
        self.frames
            .borrow()
            .iter()
            .map(|f| StackFrame {
                function: f.function.as_ref().map(|n| n.to_string()),
                position: (f.line > 0).then(|| SourcePosition::new(f.source.as_ref(), f.line)),
                env: f.env.clone(),
            })
            .collect()
    }

    /// Guest error carrying the current stack
    pub fn error(&self, message: impl Into<String>) -> Unwind {
        Unwind::Error(GuestError {
            message: message.into(),
            stack: self.stack(),
        })
    }

    pub fn set_invisible(&self) {
        self.visible.set(false);
    }

    /// Evaluate a program in `env` and return the value of its last statement
    pub fn eval_program(&self, program: &Program, env: &Env, host: &dyn Host) -> EvalResult {
        self.run(program, env, host, false)
    }

    /// Evaluate a program as console input: visible results are printed
    pub fn eval_toplevel(&self, program: &Program, env: &Env, host: &dyn Host) -> EvalResult {
        self.run(program, env, host, true)
    }

    fn run(&self, program: &Program, env: &Env, host: &dyn Host, print: bool) -> EvalResult {
        let depth = self.push_frame(Frame {
            function: None,
            env: env.clone(),
            source: program.source.clone(),
            line: 0,
        })?;
        let result = self.statements(&program.body, env, host, print);
        self.frames.borrow_mut().truncate(depth - 1);
        result
    }

    fn push_frame(&self, frame: Frame) -> EvalResult<usize> {
        if self.depth() >= self.max_depth {
            return Err(self.error("evaluation nested too deeply: infinite recursion"));
        }
        let mut frames = self.frames.borrow_mut();
        frames.push(frame);
        Ok(frames.len())
    }

    fn statements(&self, body: &[Expr], env: &Env, host: &dyn Host, print: bool) -> EvalResult {
        let mut last = Value::Null;
        for stmt in body {
            let boundary = self.enter_statement(stmt.line);
            host.at_boundary(self, &boundary)?;
            self.visible.set(true);
            last = self.eval(stmt, env, host)?;
            if print && self.visible.get() {
                host.write(OutputStream::Stdout, &format!("{}\n", format_value(&last)));
            }
        }
        Ok(last)
    }

    fn enter_statement(&self, line: u32) -> Boundary {
        let mut frames = self.frames.borrow_mut();
        let depth = frames.len();
        match frames.last_mut() {
            Some(frame) => {
                frame.line = line;
                Boundary {
                    source: frame.source.clone(),
                    line,
                    depth,
                    function: frame.function.clone(),
                }
            }
            None => Boundary {
                source: Rc::from("<text>"),
                line,
                depth,
                function: None,
            },
        }
    }

    fn current_source(&self) -> Rc<str> {
        self.frames
            .borrow()
            .last()
            .map(|f| f.source.clone())
            .unwrap_or_else(|| Rc::from("<text>"))
    }

    /* ===================== Expressions ===================== */

    pub fn eval(&self, expr: &Expr, env: &Env, host: &dyn Host) -> EvalResult {
        match &expr.kind {
            ExprKind::Null => Ok(Value::Null),
            ExprKind::Bool(b) => Ok(Value::Logical(*b)),
            ExprKind::Num(n) => Ok(Value::Number(*n)),
            ExprKind::Str(s) => Ok(Value::Str(s.clone())),
            ExprKind::Ident(name) => env
                .lookup(name)
                .ok_or_else(|| self.error(format!("object '{}' not found", name))),
            ExprKind::Assign { name, value } => {
                let value = self.eval(value, env, host)?;
                env.set(name, value.clone());
                self.visible.set(false);
                Ok(value)
            }
            ExprKind::Function { params, body } => Ok(Value::Closure(Rc::new(Closure {
                params: params.clone(),
                body: body.clone(),
                env: env.clone(),
                source: self.current_source(),
            }))),
            ExprKind::Call { callee, args } => self.eval_call(callee, args, env, host),
            ExprKind::If {
                cond,
                then,
                otherwise,
            } => {
                let test = self.eval(cond, env, host)?;
                let test = test
                    .as_bool()
                    .ok_or_else(|| self.error("argument is not interpretable as logical"))?;
                if test {
                    self.eval(then, env, host)
                } else if let Some(otherwise) = otherwise {
                    self.eval(otherwise, env, host)
                } else {
                    self.visible.set(false);
                    Ok(Value::Null)
                }
            }
            ExprKind::Block(body) => self.statements(body, env, host, false),
            ExprKind::Index2 { target, index } => {
                let target = self.eval(target, env, host)?;
                let index = self.eval(index, env, host)?;
                self.index2(&target, &index)
            }
            ExprKind::Dollar { target, name } => {
                let target = self.eval(target, env, host)?;
                match &target {
                    Value::List(list) => Ok(list
                        .position_of(name)
                        .map(|i| list.items[i].clone())
                        .unwrap_or(Value::Null)),
                    Value::Env(scope) => Ok(scope.get_local(name).unwrap_or(Value::Null)),
                    Value::Null => Ok(Value::Null),
                    _ => Err(self.error("$ operator is invalid for atomic vectors")),
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs, env, host)?;
                let rhs = self.eval(rhs, env, host)?;
                self.binary(*op, &lhs, &rhs)
            }
            ExprKind::Neg(inner) => {
                let value = self.eval(inner, env, host)?;
                self.binary(BinaryOp::Sub, &Value::Number(0.0), &value)
            }
        }
    }

    fn eval_call(&self, callee: &Expr, args: &[Arg], env: &Env, host: &dyn Host) -> EvalResult {
        let (function, name) = match &callee.kind {
            ExprKind::Ident(name) => {
                let function = env
                    .lookup_function(name)
                    .ok_or_else(|| self.error(format!("could not find function \"{}\"", name)))?;
                (function, Some(name.as_str()))
            }
            _ => (self.eval(callee, env, host)?, None),
        };

        let quoting = matches!(&function, Value::Builtin(b) if b.quoting);
        let mut evaluated = Args::default();
        for arg in args {
            let value = match (&arg.value.kind, quoting && arg.name.is_none()) {
                (ExprKind::Ident(ident), true) => Value::Str(ident.clone()),
                _ => self.eval(&arg.value, env, host)?,
            };
            evaluated.items.push((arg.name.clone(), value));
        }
        self.apply(&function, evaluated, env, host, name)
    }

    /// Call `function` with already evaluated arguments
    pub fn apply(
        &self,
        function: &Value,
        args: Args,
        caller: &Env,
        host: &dyn Host,
        name: Option<&str>,
    ) -> EvalResult {
        host.check_interrupt()?;
        match function {
            Value::Builtin(builtin) => {
                self.visible.set(true);
                (builtin.func)(self, host, caller, args)
            }
            Value::Closure(closure) => {
                let formals: Vec<&str> = closure.params.iter().map(String::as_str).collect();
                let bound = args
                    .bind(&formals)
                    .map_err(|arg| self.error(format!("unused argument ({})", arg)))?;
                let env = Env::child(&closure.env);
                for (param, value) in closure.params.iter().zip(bound) {
                    if let Some(value) = value {
                        env.set(param, value);
                    }
                }

                let depth = self.push_frame(Frame {
                    function: Some(Rc::from(name.unwrap_or("<anonymous>"))),
                    env: env.clone(),
                    source: closure.source.clone(),
                    line: closure.body.line,
                })?;
                let body = match &closure.body.kind {
                    ExprKind::Block(body) => body.as_slice(),
                    _ => std::slice::from_ref(closure.body.as_ref()),
                };
                let result = self.statements(body, &env, host, false);
                self.frames.borrow_mut().truncate(depth - 1);
                self.visible.set(true);
                result
            }
            _ => Err(self.error("attempt to apply non-function")),
        }
    }

    /// `target[[index]]` with a one-based numeric index or a name
    pub fn index2(&self, target: &Value, index: &Value) -> EvalResult {
        match index {
            Value::Str(name) => match target {
                Value::List(list) => Ok(list
                    .position_of(name)
                    .map(|i| list.items[i].clone())
                    .unwrap_or(Value::Null)),
                Value::Env(env) => Ok(env.get_local(name).unwrap_or(Value::Null)),
                _ => Err(self.error("subscript out of bounds")),
            },
            _ => {
                let position = index
                    .as_number()
                    .filter(|n| n.fract() == 0.0 && *n >= 1.0)
                    .ok_or_else(|| self.error("invalid subscript"))?;
                element(target, position as usize - 1)
                    .ok_or_else(|| self.error("subscript out of bounds"))
            }
        }
    }

    fn binary(&self, op: BinaryOp, lhs: &Value, rhs: &Value) -> EvalResult {
        let left = elements(lhs);
        let right = elements(rhs);
        if left.is_empty() || right.is_empty() {
            return Ok(Value::Null);
        }
        let len = left.len().max(right.len());
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            out.push(self.scalar_binary(op, &left[i % left.len()], &right[i % right.len()])?);
        }
        if out.len() == 1 {
            Ok(out.remove(0))
        } else {
            Ok(Value::list(List::vector(out)))
        }
    }

    fn scalar_binary(&self, op: BinaryOp, lhs: &Value, rhs: &Value) -> EvalResult {
        if let (Value::Str(a), Value::Str(b)) = (lhs, rhs) {
            let result = match op {
                BinaryOp::Eq => a == b,
                BinaryOp::Ne => a != b,
                BinaryOp::Lt => a < b,
                BinaryOp::Le => a <= b,
                BinaryOp::Gt => a > b,
                BinaryOp::Ge => a >= b,
                _ => return Err(self.error("non-numeric argument to binary operator")),
            };
            return Ok(Value::Logical(result));
        }
        let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) else {
            return Err(self.error(format!(
                "non-numeric argument to binary operator '{}'",
                op.symbol()
            )));
        };
        Ok(match op {
            BinaryOp::Add => Value::Number(a + b),
            BinaryOp::Sub => Value::Number(a - b),
            BinaryOp::Mul => Value::Number(a * b),
            BinaryOp::Div => Value::Number(a / b),
            BinaryOp::Eq => Value::Logical(a == b),
            BinaryOp::Ne => Value::Logical(a != b),
            BinaryOp::Lt => Value::Logical(a < b),
            BinaryOp::Le => Value::Logical(a <= b),
            BinaryOp::Gt => Value::Logical(a > b),
            BinaryOp::Ge => Value::Logical(a >= b),
        })
    }
}

/// Element `index` (zero-based) of a value, `None` when out of range.
/// A classed list keeps its attributes, other than names, on the result.
pub fn element(target: &Value, index: usize) -> Option<Value> {
    match target {
        Value::List(list) => {
            let item = list.items.get(index)?.clone();
            if list.attr("class").is_none() {
                return Some(item);
            }
            let mut single = List {
                items: vec![item],
                attrs: list.attrs.clone(),
                atomic: list.atomic,
            };
            single.remove_attr("names");
            Some(Value::list(single))
        }
        Value::Null | Value::Env(_) => None,
        other if index == 0 => Some(other.clone()),
        _ => None,
    }
}

fn elements(value: &Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::List(list) => list.items.clone(),
        other => vec![other.clone()],
    }
}
