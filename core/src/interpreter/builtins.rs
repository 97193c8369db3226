//! Builtin functions installed into the base environment

use std::time::{Duration, Instant};

use super::env::Env;
use super::eval::{Args, EvalResult, Interpreter};
use super::format::format_value;
use super::host::{ChildCommand, Host, OutputStream};
use super::values::{Builtin, List, Value};

pub type BuiltinFn = fn(&Interpreter, &dyn Host, &Env, Args) -> EvalResult;

const SLEEP_POLL: Duration = Duration::from_millis(10);

/// Register every builtin in `base`
pub fn install(base: &Env) {
    let table: &[(&'static str, BuiltinFn)] = &[
        ("c", builtin_c),
        ("list", builtin_list),
        ("print", builtin_print),
        ("cat", builtin_cat),
        ("paste", builtin_paste),
        ("stop", builtin_stop),
        ("length", builtin_length),
        ("names", builtin_names),
        ("factor", builtin_factor),
        ("structure", builtin_structure),
        ("class", builtin_class),
        ("unclass", builtin_unclass),
        ("inherits", builtin_inherits),
        ("invisible", builtin_invisible),
        ("environment", builtin_environment),
        ("new.env", builtin_new_env),
        ("globalenv", builtin_globalenv),
        ("ls", builtin_ls),
        ("readline", builtin_readline),
        ("browser", builtin_browser),
        ("View", builtin_view),
        ("system", builtin_system),
        ("Sys.sleep", builtin_sleep),
        ("quit", builtin_quit),
        ("q", builtin_quit),
    ];
    for (name, func) in table {
        base.set(
            name,
            Value::Builtin(Builtin {
                name: *name,
                func: *func,
                quoting: false,
            }),
        );
    }
    base.set(
        "rm",
        Value::Builtin(Builtin {
            name: "rm",
            func: builtin_rm,
            quoting: true,
        }),
    );
}

/* ===================== Helpers ===================== */

fn bind(interp: &Interpreter, args: Args, formals: &[&str]) -> EvalResult<Vec<Option<Value>>> {
    args.bind(formals)
        .map_err(|arg| interp.error(format!("unused argument ({})", arg)))
}

fn bind_n<const N: usize>(
    interp: &Interpreter,
    args: Args,
    formals: [&str; N],
) -> EvalResult<[Option<Value>; N]> {
    let bound = bind(interp, args, &formals)?;
    <[Option<Value>; N]>::try_from(bound).map_err(|_| interp.error("invalid arguments"))
}

fn string_arg(interp: &Interpreter, value: Option<Value>, what: &str) -> EvalResult<String> {
    match value {
        Some(Value::Str(s)) => Ok(s),
        Some(Value::List(list)) if list.items.len() == 1 => match &list.items[0] {
            Value::Str(s) => Ok(s.clone()),
            _ => Err(interp.error(format!("invalid '{}' argument", what))),
        },
        None => Ok(String::new()),
        _ => Err(interp.error(format!("invalid '{}' argument", what))),
    }
}

fn env_arg(interp: &Interpreter, value: Option<Value>, default: &Env) -> EvalResult<Env> {
    match value {
        None => Ok(default.clone()),
        Some(Value::Env(env)) => Ok(env),
        Some(_) => Err(interp.error("invalid 'envir' argument")),
    }
}

fn named_list(items: Vec<(Option<String>, Value)>, atomic: bool) -> List {
    let has_names = items.iter().any(|(n, _)| n.is_some());
    let (names, values): (Vec<String>, Vec<Value>) = items
        .into_iter()
        .map(|(n, v)| (n.unwrap_or_default(), v))
        .unzip();
    let mut list = List {
        items: values,
        attrs: Vec::new(),
        atomic,
    };
    if has_names {
        list.set_attr(
            "names",
            Value::list(List::vector(names.into_iter().map(Value::Str).collect())),
        );
    }
    list
}

/* ===================== Constructors ===================== */

fn builtin_c(_interp: &Interpreter, _host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    let mut items = Vec::new();
    for (name, value) in args.items {
        match value {
            Value::Null => {}
            Value::List(list) => items.extend(list.items.iter().cloned().map(|v| (None, v))),
            other => items.push((name, other)),
        }
    }
    let atomic = items
        .iter()
        .all(|(_, v)| matches!(v, Value::Logical(_) | Value::Number(_) | Value::Str(_)));
    let named = items.iter().any(|(n, _)| n.is_some());
    match items.len() {
        0 => Ok(Value::Null),
        1 if atomic && !named => Ok(items.remove(0).1),
        _ => Ok(Value::list(named_list(items, atomic))),
    }
}

fn builtin_list(_interp: &Interpreter, _host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    Ok(Value::list(named_list(args.items, false)))
}

fn builtin_factor(interp: &Interpreter, _host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    let [x] = bind_n(interp, args, ["x"])?;
    let labels = x.map(|x| x.as_strings()).unwrap_or_default();
    let mut levels = labels.clone();
    levels.sort();
    levels.dedup();
    let codes = labels
        .iter()
        .map(|label| {
            let code = levels.iter().position(|l| l == label).unwrap_or(0) + 1;
            Value::Number(code as f64)
        })
        .collect();
    let mut factor = List::vector(codes);
    factor.set_attr(
        "levels",
        Value::list(List::vector(levels.into_iter().map(Value::Str).collect())),
    );
    factor.set_attr("class", Value::str("factor"));
    Ok(Value::list(factor))
}

fn builtin_structure(
    interp: &Interpreter,
    _host: &dyn Host,
    _env: &Env,
    mut args: Args,
) -> EvalResult {
    let data = match args.take_named(".Data") {
        Some(data) => data,
        None => {
            let index = args
                .items
                .iter()
                .position(|(n, _)| n.is_none())
                .ok_or_else(|| interp.error("argument \".Data\" is missing"))?;
            args.items.remove(index).1
        }
    };
    let mut list = match data {
        Value::List(list) => (*list).clone(),
        Value::Null => List::new(Vec::new()),
        Value::Env(_) | Value::Closure(_) | Value::Builtin(_) => {
            return Err(interp.error("attributes are only supported on vectors and lists"))
        }
        scalar => List::vector(vec![scalar]),
    };
    for (name, value) in args.items {
        let name = name.ok_or_else(|| interp.error("attributes must be named"))?;
        list.set_attr(&name, value);
    }
    Ok(Value::list(list))
}

/* ===================== Output ===================== */

fn builtin_print(interp: &Interpreter, host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    let [x] = bind_n(interp, args, ["x"])?;
    let x = x.unwrap_or(Value::Null);
    host.write(OutputStream::Stdout, &format!("{}\n", format_value(&x)));
    interp.set_invisible();
    Ok(x)
}

fn builtin_cat(interp: &Interpreter, host: &dyn Host, _env: &Env, mut args: Args) -> EvalResult {
    let sep = match args.take_named("sep") {
        Some(sep) => string_arg(interp, Some(sep), "sep")?,
        None => " ".to_string(),
    };
    let text = args
        .items
        .iter()
        .map(|(_, v)| v.as_text())
        .collect::<Vec<_>>()
        .join(&sep);
    host.write(OutputStream::Stdout, &text);
    interp.set_invisible();
    Ok(Value::Null)
}

fn builtin_paste(interp: &Interpreter, _host: &dyn Host, _env: &Env, mut args: Args) -> EvalResult {
    let sep = match args.take_named("sep") {
        Some(sep) => string_arg(interp, Some(sep), "sep")?,
        None => " ".to_string(),
    };
    let text = args
        .items
        .iter()
        .map(|(_, v)| v.as_text())
        .collect::<Vec<_>>()
        .join(&sep);
    Ok(Value::Str(text))
}

fn builtin_stop(interp: &Interpreter, _host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    let message: String = args.items.iter().map(|(_, v)| v.as_text()).collect();
    Err(interp.error(message))
}

fn builtin_invisible(interp: &Interpreter, _host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    let [x] = bind_n(interp, args, ["x"])?;
    interp.set_invisible();
    Ok(x.unwrap_or(Value::Null))
}

/* ===================== Introspection ===================== */

fn builtin_length(interp: &Interpreter, _host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    let [x] = bind_n(interp, args, ["x"])?;
    Ok(Value::Number(x.map(|x| x.length()).unwrap_or(0) as f64))
}

fn builtin_names(interp: &Interpreter, _host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    let [x] = bind_n(interp, args, ["x"])?;
    Ok(match x {
        Some(Value::Env(env)) => Value::strings(env.names()),
        Some(value) => value.attr("names").cloned().unwrap_or(Value::Null),
        None => Value::Null,
    })
}

fn builtin_class(interp: &Interpreter, _host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    let [x] = bind_n(interp, args, ["x"])?;
    Ok(Value::strings(x.unwrap_or(Value::Null).class()))
}

fn builtin_unclass(interp: &Interpreter, _host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    let [x] = bind_n(interp, args, ["x"])?;
    Ok(x.map(|x| x.unclass()).unwrap_or(Value::Null))
}

fn builtin_inherits(interp: &Interpreter, _host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    let [x, what] = bind_n(interp, args, ["x", "what"])?;
    let what = string_arg(interp, what, "what")?;
    Ok(Value::Logical(
        x.map(|x| x.class().iter().any(|c| *c == what)).unwrap_or(false),
    ))
}

/* ===================== Environments ===================== */

fn builtin_environment(
    interp: &Interpreter,
    _host: &dyn Host,
    env: &Env,
    args: Args,
) -> EvalResult {
    let [fun] = bind_n(interp, args, ["fun"])?;
    Ok(match fun {
        None | Some(Value::Null) => Value::Env(env.clone()),
        Some(Value::Closure(closure)) => Value::Env(closure.env.clone()),
        Some(_) => Value::Null,
    })
}

fn builtin_new_env(interp: &Interpreter, _host: &dyn Host, env: &Env, args: Args) -> EvalResult {
    let [parent] = bind_n(interp, args, ["parent"])?;
    let parent = env_arg(interp, parent, env)?;
    Ok(Value::Env(Env::child(&parent)))
}

fn builtin_globalenv(interp: &Interpreter, _host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    bind(interp, args, &[])?;
    Ok(Value::Env(interp.global_env()))
}

fn builtin_ls(interp: &Interpreter, _host: &dyn Host, env: &Env, args: Args) -> EvalResult {
    let [envir] = bind_n(interp, args, ["envir"])?;
    let envir = env_arg(interp, envir, env)?;
    Ok(Value::strings(envir.names()))
}

fn builtin_rm(interp: &Interpreter, _host: &dyn Host, env: &Env, mut args: Args) -> EvalResult {
    let envir = env_arg(interp, args.take_named("envir"), env)?;
    let mut names = match args.take_named("list") {
        Some(list) => list.as_strings(),
        None => Vec::new(),
    };
    for (name, value) in args.items {
        if name.is_some() {
            return Err(interp.error(format!("unused argument ({})", format_value(&value))));
        }
        names.extend(value.as_strings());
    }
    for name in names {
        envir.remove(&name);
    }
    interp.set_invisible();
    Ok(Value::Null)
}

/* ===================== Interaction ===================== */

fn builtin_readline(interp: &Interpreter, host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    let [prompt] = bind_n(interp, args, ["prompt"])?;
    let prompt = string_arg(interp, prompt, "prompt")?;
    let line = host.read_line(interp, &prompt)?;
    Ok(Value::Str(line.unwrap_or_default()))
}

fn builtin_browser(interp: &Interpreter, host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    bind(interp, args, &[])?;
    host.browser(interp)?;
    interp.set_invisible();
    Ok(Value::Null)
}

fn builtin_view(interp: &Interpreter, host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    let [x, title] = bind_n(interp, args, ["x", "title"])?;
    let x = x.ok_or_else(|| interp.error("argument \"x\" is missing, with no default"))?;
    let title = match title {
        Some(title) => string_arg(interp, Some(title), "title")?,
        None => "View".to_string(),
    };
    host.view(interp, x, &title)?;
    interp.set_invisible();
    Ok(Value::Null)
}

fn builtin_system(interp: &Interpreter, host: &dyn Host, _env: &Env, mut args: Args) -> EvalResult {
    let interactive = match args.take_named("input") {
        Some(flag) => flag
            .as_bool()
            .ok_or_else(|| interp.error("invalid 'input' argument"))?,
        None => false,
    };
    let mut words = Vec::new();
    for (name, value) in args.items {
        if name.is_some() {
            return Err(interp.error(format!("unused argument ({})", format_value(&value))));
        }
        words.extend(value.as_strings());
    }
    if words.is_empty() {
        return Err(interp.error("argument \"command\" is missing, with no default"));
    }
    let program = words.remove(0);
    let status = host.run_child(
        interp,
        ChildCommand {
            program,
            args: words,
            interactive,
        },
    )?;
    interp.set_invisible();
    Ok(Value::Number(status as f64))
}

fn builtin_sleep(interp: &Interpreter, host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    let [time] = bind_n(interp, args, ["time"])?;
    let secs = time
        .and_then(|t| t.as_number())
        .filter(|t| *t >= 0.0 && t.is_finite())
        .ok_or_else(|| interp.error("invalid 'time' value"))?;
    let deadline = Instant::now() + Duration::from_secs_f64(secs);
    loop {
        host.check_interrupt()?;
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(SLEEP_POLL.min(deadline - now));
    }
    interp.set_invisible();
    Ok(Value::Null)
}

fn builtin_quit(interp: &Interpreter, host: &dyn Host, _env: &Env, args: Args) -> EvalResult {
    bind(interp, args, &["save"])?;
    host.quit(interp)?;
    interp.set_invisible();
    Ok(Value::Null)
}
