//! Printed representation of guest values

use super::values::{format_number, List, Value};

/// Format `value` the way the console prints it, without a trailing newline
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Logical(_) | Value::Number(_) | Value::Str(_) => format!("[1] {}", scalar(value)),
        Value::List(list) if value.inherits("factor") => format_factor(list),
        Value::List(list) if list.atomic => format_vector(list),
        Value::List(list) => format_list(list),
        Value::Env(env) => match env.name() {
            Some(name) => format!("<environment: {}>", name),
            None => "<environment>".to_string(),
        },
        Value::Closure(closure) => format!("function({}) ...", closure.params.join(", ")),
        Value::Builtin(builtin) => format!("function (...) .Primitive(\"{}\")", builtin.name),
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Str(s) => format!("{:?}", s),
        Value::Logical(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Number(n) => format_number(*n),
        Value::Null => "NULL".to_string(),
        Value::List(list) if list.items.len() == 1 => scalar(&list.items[0]),
        other => format!("{:?}", other),
    }
}

fn format_vector(list: &List) -> String {
    let cells: Vec<String> = list.items.iter().map(scalar).collect();
    let mut out = match list.names() {
        Some(names) => {
            let widths: Vec<usize> = names
                .iter()
                .zip(&cells)
                .map(|(n, c)| n.len().max(c.len()))
                .collect();
            let header: Vec<String> = names
                .iter()
                .zip(&widths)
                .map(|(n, w)| format!("{:>w$}", n, w = *w))
                .collect();
            let row: Vec<String> = cells
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:>w$}", c, w = *w))
                .collect();
            format!("{}\n{}", header.join(" "), row.join(" "))
        }
        None if cells.is_empty() => "character(0)".to_string(),
        None => format!("[1] {}", cells.join(" ")),
    };
    append_attributes(&mut out, list, &["names"]);
    out
}

fn format_factor(list: &List) -> String {
    let levels = list.attr("levels").map(Value::as_strings).unwrap_or_default();
    let labels: Vec<String> = list
        .items
        .iter()
        .map(|code| {
            code.as_number()
                .filter(|n| *n >= 1.0)
                .and_then(|n| levels.get(n as usize - 1))
                .cloned()
                .unwrap_or_else(|| "<NA>".to_string())
        })
        .collect();
    format!("[1] {}\nLevels: {}", labels.join(" "), levels.join(" "))
}

fn format_list(list: &List) -> String {
    if list.items.is_empty() {
        return "list()".to_string();
    }
    let names = list.names();
    let mut parts = Vec::with_capacity(list.items.len());
    for (i, item) in list.items.iter().enumerate() {
        let header = match names.as_ref().and_then(|n| n.get(i)).filter(|n| !n.is_empty()) {
            Some(name) => format!("${}", name),
            None => format!("[[{}]]", i + 1),
        };
        parts.push(format!("{}\n{}\n", header, format_value(item)));
    }
    let mut out = parts.join("\n");
    out.pop();
    append_attributes(&mut out, list, &["names"]);
    out
}

fn append_attributes(out: &mut String, list: &List, skip: &[&str]) {
    for (name, value) in &list.attrs {
        if skip.contains(&name.as_str()) {
            continue;
        }
        out.push_str(&format!("\nattr(,\"{}\")\n{}", name, format_value(value)));
    }
}
