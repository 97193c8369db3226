//! Tests for reference resolution and write-back

use std::cell::RefCell;
use std::collections::BTreeMap;

use maplit::btreemap;
use pretty_assertions::assert_eq;

use super::*;
use crate::errors::EvalError;
use crate::interpreter::{format_value, parse, CaptureHost, Env, Interpreter, Value};

// ============================================================================
// Helper Functions
// ============================================================================

struct TestContext {
    interp: Interpreter,
    registry: RefCell<Registry<Value>>,
    debug_stack: Vec<Env>,
}

impl TestContext {
    fn new(setup: &str) -> Self {
        let ctx = Self {
            interp: Interpreter::new(),
            registry: RefCell::new(Registry::new()),
            debug_stack: Vec::new(),
        };
        ctx.run(setup);
        ctx
    }

    fn run(&self, code: &str) {
        let program = parse(code).unwrap();
        self.interp
            .eval_program(&program, &self.interp.global_env(), &CaptureHost::new())
            .unwrap();
    }

    fn resolve(&self, reference: &Reference) -> Value {
        resolve(self, reference).unwrap()
    }
}

impl ResolveContext for TestContext {
    fn global_env(&self) -> Env {
        self.interp.global_env()
    }

    fn current_env(&self) -> Env {
        self.interp.global_env()
    }

    fn debug_frame(&self, index: usize) -> Option<Env> {
        self.debug_stack.get(index).cloned()
    }

    fn error_frame(&self, _index: usize) -> Option<Env> {
        None
    }

    fn handle_value(&self, handle: Handle) -> Option<Value> {
        self.registry.borrow().get(handle).cloned()
    }

    fn eval_in(&self, env: &Env, code: &str) -> Result<Value, EvalError> {
        let program = parse(code)?;
        Ok(self.interp.eval_program(&program, env, &CaptureHost::new())?)
    }
}

fn global() -> Reference {
    Reference::GlobalScope
}

// ============================================================================
// Scope Tests
// ============================================================================

#[test]
fn test_member_is_not_inherited() {
    let ctx = TestContext::new("x <- 1");

    assert!(matches!(ctx.resolve(&global().member("x")), Value::Number(n) if n == 1.0));
    // `c` lives in the base scope, not the global frame
    assert!(ctx.resolve(&global().member("c")).is_null());
    assert!(ctx.resolve(&global().member("x").member("y")).is_null());
}

#[test]
fn test_parent_scope_zero_is_identity() {
    let ctx = TestContext::new("");
    let scope = ctx.resolve(&global());
    let same = ctx.resolve(&global().parent(0));

    assert!(scope.same(&same));
}

#[test]
fn test_parent_scope_walks_to_empty_then_nil() {
    let ctx = TestContext::new("");

    let base = ctx.resolve(&global().parent(1));
    assert!(base.same(&Value::Env(ctx.interp.base_env())));

    let empty = ctx.resolve(&global().parent(2));
    assert!(matches!(&empty, Value::Env(env) if env.is_empty_env()));

    assert!(ctx.resolve(&global().parent(3)).is_null());
    assert!(ctx.resolve(&global().parent(50)).is_null());
}

#[test]
fn test_parent_scope_of_non_scope_is_nil() {
    let ctx = TestContext::new("x <- 1");
    assert!(ctx.resolve(&global().member("x").parent(1)).is_null());
}

#[test]
fn test_stack_frame_out_of_range_is_nil() {
    let mut ctx = TestContext::new("");
    ctx.debug_stack.push(ctx.interp.global_env());

    assert!(matches!(ctx.resolve(&Reference::stack_frame(0)), Value::Env(_)));
    assert!(ctx.resolve(&Reference::stack_frame(1)).is_null());
    assert!(ctx.resolve(&Reference::error_stack_frame(0)).is_null());
}

// ============================================================================
// Expression Tests
// ============================================================================

#[test]
fn test_expression_evaluates_in_scope() {
    let ctx = TestContext::new("f <- function() { a <- 40; environment() }\ne <- f()");
    let value = ctx.resolve(&global().member("e").expression("a + 2"));

    assert!(matches!(value, Value::Number(n) if n == 42.0));
}

#[test]
fn test_expression_errors_are_reported() {
    let ctx = TestContext::new("x <- 1");

    let err = resolve(&ctx, &global().expression("stop(\"nope\")")).unwrap_err();
    assert_eq!(err.message, "nope");

    let err = resolve(&ctx, &global().member("x").expression("1")).unwrap_err();
    assert_eq!(err.message, "invalid 'envir' argument");

    assert!(resolve(&ctx, &global().expression("(")).is_err());
}

// ============================================================================
// List Element & Attribute Tests
// ============================================================================

#[test]
fn test_list_element_keeps_factor_class() {
    let ctx = TestContext::new("f <- factor(c(\"lo\", \"hi\", \"lo\"))");
    let value = ctx.resolve(&global().member("f").element(2));

    assert!(value.inherits("factor"));
    assert_eq!(format_value(&value), "[1] lo\nLevels: hi lo");
}

#[test]
fn test_list_element_strips_other_classes() {
    let ctx = TestContext::new("x <- structure(list(10, 20), class = \"record\")");
    let value = ctx.resolve(&global().member("x").element(1));

    assert!(matches!(value, Value::Number(n) if n == 20.0));
}

#[test]
fn test_list_element_out_of_range_is_nil() {
    let ctx = TestContext::new("x <- list(1)\ny <- 5");

    assert!(ctx.resolve(&global().member("x").element(1)).is_null());
    assert!(matches!(ctx.resolve(&global().member("y").element(0)), Value::Number(_)));
    assert!(ctx.resolve(&global().element(0)).is_null());
}

#[test]
fn test_attributes_as_named_list() {
    let ctx = TestContext::new("f <- factor(c(\"a\"))\nn <- 3");

    let attrs = ctx.resolve(&global().member("f").attributes());
    assert_eq!(
        attrs.attr("names").map(|n| n.as_strings()),
        Some(vec!["levels".to_string(), "class".to_string()])
    );
    let printed: BTreeMap<String, String> = match &attrs {
        Value::List(list) => list
            .names()
            .unwrap_or_default()
            .into_iter()
            .zip(list.items.iter().map(format_value))
            .collect(),
        other => panic!("expected a list, got {:?}", other),
    };
    assert_eq!(
        printed,
        btreemap! {
            "class".to_string() => "[1] \"factor\"".to_string(),
            "levels".to_string() => "[1] \"a\"".to_string(),
        }
    );
    assert!(ctx.resolve(&global().member("n").attributes()).is_null());
}

// ============================================================================
// Handle Tests
// ============================================================================

#[test]
fn test_handle_keeps_value_alive_after_rm() {
    let ctx = TestContext::new("x <- list(1, 2, 3)");
    let value = ctx.resolve(&global().member("x"));
    let handle = ctx.registry.borrow_mut().register(value);

    ctx.run("rm(x)");

    assert!(ctx.resolve(&global().member("x")).is_null());
    let kept = ctx.resolve(&Reference::handle(handle));
    assert_eq!(kept.length(), 3);

    ctx.registry.borrow_mut().remove(handle);
    assert!(ctx.resolve(&Reference::handle(handle)).is_null());
}

// ============================================================================
// Write-back Tests
// ============================================================================

#[test]
fn test_set_member() {
    let ctx = TestContext::new("");
    set_value(&ctx, &global().member("z"), Value::from("new")).unwrap();

    assert!(matches!(ctx.resolve(&global().member("z")), Value::Str(s) if s == "new"));
}

#[test]
fn test_set_list_element_rebuilds_container() {
    let ctx = TestContext::new("x <- list(a = 1, b = list(2, 3))");
    let target = global().member("x").element(1).element(0);

    set_value(&ctx, &target, Value::from(99.0)).unwrap();

    let inner = ctx.resolve(&global().member("x").element(1).element(0));
    assert!(matches!(inner, Value::Number(n) if n == 99.0));
    let names = ctx.resolve(&global().member("x")).attr("names").map(|n| n.as_strings());
    assert_eq!(names, Some(vec!["a".to_string(), "b".to_string()]));
}

#[test]
fn test_set_attributes() {
    let ctx = TestContext::new("x <- list(1)\nnew <- list(class = \"tagged\")");
    let attrs = ctx.resolve(&global().member("new"));

    set_value(&ctx, &global().member("x").attributes(), attrs).unwrap();

    assert!(ctx.resolve(&global().member("x")).inherits("tagged"));
}

#[test]
fn test_set_invalid_target() {
    let ctx = TestContext::new("");
    let err = set_value(&ctx, &global(), Value::Null).unwrap_err();
    assert_eq!(err.message, "Invalid reference for setValue");
}

#[test]
fn test_set_list_element_appends_one_past_the_end() {
    let ctx = TestContext::new("x <- list(1, 2)");

    set_value(&ctx, &global().member("x").element(2), Value::from(3.0)).unwrap();

    assert_eq!(ctx.resolve(&global().member("x")).length(), 3);
    let last = ctx.resolve(&global().member("x").element(2));
    assert!(matches!(last, Value::Number(n) if n == 3.0));
}

#[test]
fn test_set_list_element_far_out_of_range() {
    let ctx = TestContext::new("x <- list(1, 2)");

    for index in [3, 1_000_000_000_000, usize::MAX] {
        let err = set_value(&ctx, &global().member("x").element(index), Value::from(0.0))
            .unwrap_err();
        assert_eq!(err.message, "subscript out of bounds");
    }
    assert_eq!(ctx.resolve(&global().member("x")).length(), 2);
}
