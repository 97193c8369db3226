//! Tests for the guest language

use std::cell::RefCell;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::*;

// ============================================================================
// Helper Functions
// ============================================================================

/// Evaluate `source` in a fresh interpreter and return the last value
fn eval(source: &str) -> Value {
    let interp = Interpreter::new();
    let host = CaptureHost::new();
    let program = parse(source).unwrap();
    interp
        .eval_program(&program, &interp.global_env(), &host)
        .unwrap()
}

/// Evaluate `source` as console input and return everything printed
fn console(source: &str) -> String {
    let interp = Interpreter::new();
    let host = CaptureHost::new();
    let program = parse(source).unwrap();
    interp
        .eval_toplevel(&program, &interp.global_env(), &host)
        .unwrap();
    host.stdout()
}

fn eval_err(source: &str) -> GuestError {
    let interp = Interpreter::new();
    let host = CaptureHost::new();
    let program = parse(source).unwrap();
    match interp.eval_program(&program, &interp.global_env(), &host) {
        Err(Unwind::Error(err)) => err,
        Err(other) => panic!("expected a guest error, got {:?}", other),
        Ok(value) => panic!("expected a guest error, got {:?}", value),
    }
}

/// Host that records boundaries and answers `readline` from a script
#[derive(Default)]
struct ScriptedHost {
    boundaries: RefCell<Vec<(u32, usize, Option<String>)>>,
    lines: RefCell<Vec<String>>,
    prompts: RefCell<Vec<String>>,
}

impl Host for ScriptedHost {
    fn at_boundary(&self, _interp: &Interpreter, boundary: &Boundary) -> Result<(), Unwind> {
        self.boundaries.borrow_mut().push((
            boundary.line,
            boundary.depth,
            boundary.function.as_ref().map(|f| f.to_string()),
        ));
        Ok(())
    }

    fn write(&self, _stream: OutputStream, _text: &str) {}

    fn read_line(&self, _interp: &Interpreter, prompt: &str) -> Result<Option<String>, Unwind> {
        self.prompts.borrow_mut().push(prompt.to_string());
        let mut lines = self.lines.borrow_mut();
        Ok((!lines.is_empty()).then(|| lines.remove(0)))
    }
}

// ============================================================================
// Parser Tests
// ============================================================================

#[test]
fn test_parse_applies_line_offset() {
    let program = parse_program("x <- 1\n\ny <- 2", "script.R", 10).unwrap();

    assert_eq!(program.source.as_ref(), "script.R");
    let lines: Vec<u32> = program.body.iter().map(|e| e.line).collect();
    assert_eq!(lines, vec![11, 13]);
}

#[test]
fn test_parse_error_reports_line() {
    let err = parse("x <- 1\ny <- (2").unwrap_err();
    assert_eq!(err.line(), Some(2));
}

#[test]
fn test_parse_semicolons_and_comments() {
    let program = parse("a <- 1; b <- 2 # trailing\n# only a comment\n").unwrap();
    assert_eq!(program.body.len(), 2);
}

#[test]
fn test_keyword_prefixed_identifiers() {
    let value = eval("iffy <- 2\nTRUEish <- 3\niffy * TRUEish");
    assert!(matches!(value, Value::Number(n) if n == 6.0));
}

// ============================================================================
// Evaluation Tests
// ============================================================================

#[test]
fn test_arithmetic_precedence() {
    assert!(matches!(eval("1 + 2 * 3"), Value::Number(n) if n == 7.0));
    assert!(matches!(eval("-(4 - 6) / 2"), Value::Number(n) if n == 1.0));
}

#[test]
fn test_if_else() {
    assert!(matches!(eval("if (1 > 2) \"a\" else \"b\""), Value::Str(s) if s == "b"));
}

#[test]
fn test_named_arguments_bind_before_positional() {
    let value = eval("f <- function(a, b) a - b\nf(b = 1, 10)");
    assert!(matches!(value, Value::Number(n) if n == 9.0));
}

#[test]
fn test_unused_argument_is_an_error() {
    let err = eval_err("f <- function(a) a\nf(1, 2)");
    assert!(err.message.starts_with("unused argument"));
}

#[test]
fn test_rm_removes_binding() {
    let err = eval_err("x <- 1\nrm(x)\nx");
    assert_eq!(err.message, "object 'x' not found");
}

#[test]
fn test_environment_builtins() {
    let value = eval(
        "f <- function() environment()\ne <- f()\nidentity <- e$missing\nls(globalenv())",
    );
    assert_eq!(value.as_strings(), vec!["e", "f", "identity"]);
}

#[test]
fn test_error_captures_call_stack() {
    let err = eval_err("f <- function(x) { stop(\"boom \", x) }\ng <- function() f(1)\ng()");

    assert_eq!(err.message, "boom 1");
    let functions: Vec<Option<String>> = err.stack.iter().map(|f| f.function.clone()).collect();
    assert_eq!(
        functions,
        vec![None, Some("g".to_string()), Some("f".to_string())]
    );
    assert_eq!(
        err.stack[2].position,
        Some(SourcePosition::new("<text>", 1))
    );
}

#[test]
fn test_boundaries_report_line_depth_and_function() {
    let interp = Interpreter::new();
    let host = ScriptedHost::default();
    let program = parse("f <- function() {\n  a <- 1\n  a\n}\nf()").unwrap();
    interp
        .eval_program(&program, &interp.global_env(), &host)
        .unwrap();

    assert_eq!(
        host.boundaries.into_inner(),
        vec![
            (1, 1, None),
            (5, 1, None),
            (2, 2, Some("f".to_string())),
            (3, 2, Some("f".to_string())),
        ]
    );
}

#[test]
fn test_readline_uses_host() {
    let interp = Interpreter::new();
    let host = ScriptedHost::default();
    host.lines.borrow_mut().push("hello".to_string());
    let program =
        parse("a <- readline(\"name? \")\nb <- readline()\npaste(a, b, sep = \"|\")").unwrap();
    let value = interp
        .eval_program(&program, &interp.global_env(), &host)
        .unwrap();

    assert!(matches!(value, Value::Str(s) if s == "hello|"));
    assert_eq!(host.prompts.into_inner(), vec!["name? ", ""]);
}

#[test]
fn test_sleep_observes_interrupt() {
    let interp = Interpreter::new();
    let host = CaptureHost::with_interrupt(Arc::new(AtomicBool::new(true)));
    let program = parse("Sys.sleep(30)").unwrap();

    let result = interp.eval_program(&program, &interp.global_env(), &host);
    assert!(matches!(result, Err(Unwind::Interrupted)));
    assert_eq!(interp.depth(), 0);
}

#[test]
fn test_system_without_child_support_fails() {
    let err = eval_err("system(\"echo\", \"hi\")");
    assert!(err.message.contains("child processes are not available"));
}

// ============================================================================
// Classed Values
// ============================================================================

#[test]
fn test_factor_element_keeps_class() {
    let value = eval("f <- factor(c(\"b\", \"a\", \"b\"))\nf[[1]]");

    assert!(value.inherits("factor"));
    assert_eq!(format_value(&value), "[1] b\nLevels: a b");
}

#[test]
fn test_classed_list_element_keeps_attributes() {
    let value = eval("x <- structure(list(1, 2), class = \"foo\")\nx[[2]]");

    assert!(value.inherits("foo"));
    assert!(matches!(&value, Value::List(l) if matches!(l.items[0], Value::Number(n) if n == 2.0)));
}

#[test]
fn test_unclassed_element_is_plain() {
    let value = eval("x <- list(a = 1, b = \"two\")\nx[[\"b\"]]");
    assert!(matches!(value, Value::Str(s) if s == "two"));
}

#[test]
fn test_subscript_out_of_bounds() {
    let err = eval_err("x <- c(1, 2)\nx[[3]]");
    assert_eq!(err.message, "subscript out of bounds");
}

// ============================================================================
// Printing Tests
// ============================================================================

#[test]
fn test_console_prints_visible_results() {
    assert_eq!(
        console("x <- 5\nx\n\"a\"\nTRUE\nNULL"),
        "[1] 5\n[1] \"a\"\n[1] TRUE\nNULL\n"
    );
}

#[test]
fn test_invisible_and_print() {
    assert_eq!(console("invisible(3)\nprint(4)"), "[1] 4\n");
}

#[test]
fn test_cat_writes_raw_text() {
    assert_eq!(console("cat(\"a\", 1, TRUE, sep = \"-\")"), "a-1-TRUE");
}

#[test]
fn test_vector_printing() {
    assert_eq!(console("c(1, 2.5, 3)"), "[1] 1 2.5 3\n");
    assert_eq!(console("c(a = 1, b = 22)"), "a  b\n1 22\n");
}

#[test]
fn test_factor_printing() {
    assert_eq!(
        console("factor(c(\"b\", \"a\", \"b\"))"),
        "[1] b a b\nLevels: a b\n"
    );
}

#[test]
fn test_list_printing() {
    assert_eq!(
        console("list(1, \"a\")"),
        "[[1]]\n[1] 1\n\n[[2]]\n[1] \"a\"\n"
    );
    assert_eq!(console("list(k = TRUE)"), "$k\n[1] TRUE\n");
}

#[test]
fn test_runaway_recursion_is_a_guest_error() {
    let interp = Interpreter::with_max_depth(20);
    let host = CaptureHost::new();
    let program = parse("f <- function() f()\nf()").unwrap();

    let err = match interp.eval_program(&program, &interp.global_env(), &host) {
        Err(Unwind::Error(err)) => err,
        other => panic!("expected a guest error, got {:?}", other.map(|_| ())),
    };
    assert_eq!(err.message, "evaluation nested too deeply: infinite recursion");
    assert_eq!(err.stack.len(), 20);
    assert_eq!(interp.depth(), 0);
}

#[test]
fn test_recursion_within_the_limit_succeeds() {
    let interp = Interpreter::with_max_depth(20);
    let host = CaptureHost::new();
    let program =
        parse("count <- function(n) if (n == 0) 0 else 1 + count(n - 1)\ncount(15)").unwrap();

    let value = interp
        .eval_program(&program, &interp.global_env(), &host)
        .unwrap();
    assert_eq!(value.as_number(), Some(15.0));
}
