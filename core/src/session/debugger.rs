//! Breakpoints, debugger commands and stepping policies

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::interpreter::{Boundary, SourcePosition};

/// Source name given to code typed at the prompt
pub const CONSOLE_SOURCE: &str = "<console>";

/* ===================== Breakpoints ===================== */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub position: SourcePosition,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Stop when hit; otherwise only the log expression runs
    #[serde(default = "default_true")]
    pub suspend: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_expression: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Breakpoint {
    pub fn at(file: impl Into<String>, line: u32) -> Self {
        Self {
            position: SourcePosition::new(file, line),
            enabled: true,
            suspend: true,
            condition: None,
            log_expression: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_log(mut self, expression: impl Into<String>) -> Self {
        self.log_expression = Some(expression.into());
        self
    }

    pub fn suspend(mut self, suspend: bool) -> Self {
        self.suspend = suspend;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Breakpoints keyed by source location
#[derive(Debug, Default)]
pub struct BreakpointTable {
    entries: BTreeMap<SourcePosition, Breakpoint>,
}

impl BreakpointTable {
    pub fn add_or_modify(&mut self, breakpoint: Breakpoint) {
        self.entries.insert(breakpoint.position.clone(), breakpoint);
    }

    pub fn remove(&mut self, position: &SourcePosition) -> bool {
        self.entries.remove(position).is_some()
    }

    pub fn get(&self, position: &SourcePosition) -> Option<&Breakpoint> {
        self.entries.get(position)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/* ===================== Commands & Stepping ===================== */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DebugCommand {
    Continue,
    Pause,
    Stop,
    StepOver,
    StepInto,
    /// Step into a call of `function`, or into user source when `None`
    StepIntoTarget { function: Option<String> },
    StepOut,
    RunToLocation { position: SourcePosition },
}

/// Where execution stops next, armed when leaving a debugger stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepPolicy {
    StopNext,
    Over { depth: usize },
    Out { depth: usize },
    RunTo(SourcePosition),
    IntoTarget(Option<String>),
}

impl StepPolicy {
    /// Policy for `command` issued with `depth` frames on the stack.
    /// `None` for commands that do not step.
    pub fn from_command(command: &DebugCommand, depth: usize) -> Option<Self> {
        match command {
            DebugCommand::Continue | DebugCommand::Stop => None,
            DebugCommand::Pause | DebugCommand::StepInto => Some(StepPolicy::StopNext),
            DebugCommand::StepOver => Some(StepPolicy::Over { depth }),
            DebugCommand::StepOut => Some(StepPolicy::Out { depth }),
            DebugCommand::StepIntoTarget { function } => {
                Some(StepPolicy::IntoTarget(function.clone()))
            }
            DebugCommand::RunToLocation { position } => Some(StepPolicy::RunTo(position.clone())),
        }
    }

    pub fn should_stop(&self, boundary: &Boundary) -> bool {
        match self {
            StepPolicy::StopNext => true,
            StepPolicy::Over { depth } => boundary.depth <= *depth,
            StepPolicy::Out { depth } => boundary.depth < *depth,
            StepPolicy::RunTo(position) => {
                boundary.line == position.line && boundary.source.as_ref() == position.file
            }
            StepPolicy::IntoTarget(Some(function)) => {
                boundary.function.as_deref() == Some(function.as_str())
            }
            StepPolicy::IntoTarget(None) => boundary.source.as_ref() != CONSOLE_SOURCE,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    fn boundary(source: &str, line: u32, depth: usize, function: Option<&str>) -> Boundary {
        Boundary {
            source: Rc::from(source),
            line,
            depth,
            function: function.map(Rc::from),
        }
    }

    #[test]
    fn test_step_over_skips_deeper_frames() {
        let policy = StepPolicy::from_command(&DebugCommand::StepOver, 2).unwrap();

        assert!(!policy.should_stop(&boundary("a.R", 5, 3, Some("inner"))));
        assert!(policy.should_stop(&boundary("a.R", 6, 2, Some("outer"))));
        assert!(policy.should_stop(&boundary("a.R", 9, 1, None)));
    }

    #[test]
    fn test_step_out_waits_for_shallower_frame() {
        let policy = StepPolicy::from_command(&DebugCommand::StepOut, 2).unwrap();

        assert!(!policy.should_stop(&boundary("a.R", 6, 2, Some("f"))));
        assert!(policy.should_stop(&boundary("a.R", 9, 1, None)));
    }

    #[test]
    fn test_step_into_target() {
        let named = StepPolicy::from_command(
            &DebugCommand::StepIntoTarget {
                function: Some("g".to_string()),
            },
            1,
        )
        .unwrap();
        assert!(!named.should_stop(&boundary("a.R", 2, 2, Some("f"))));
        assert!(named.should_stop(&boundary("a.R", 4, 3, Some("g"))));

        let user_code =
            StepPolicy::from_command(&DebugCommand::StepIntoTarget { function: None }, 1).unwrap();
        assert!(!user_code.should_stop(&boundary(CONSOLE_SOURCE, 1, 1, None)));
        assert!(user_code.should_stop(&boundary("a.R", 1, 2, Some("f"))));
    }

    #[test]
    fn test_run_to_location() {
        let policy = StepPolicy::from_command(
            &DebugCommand::RunToLocation {
                position: SourcePosition::new("a.R", 7),
            },
            1,
        )
        .unwrap();

        assert!(!policy.should_stop(&boundary("b.R", 7, 1, None)));
        assert!(policy.should_stop(&boundary("a.R", 7, 2, Some("f"))));
    }

    #[test]
    fn test_continue_and_stop_do_not_step() {
        assert_eq!(StepPolicy::from_command(&DebugCommand::Continue, 1), None);
        assert_eq!(StepPolicy::from_command(&DebugCommand::Stop, 1), None);
    }

    #[test]
    fn test_breakpoint_defaults_from_json() {
        let bp: Breakpoint =
            serde_json::from_str(r#"{ "position": { "file": "a.R", "line": 3 } }"#).unwrap();
        assert_eq!(bp, Breakpoint::at("a.R", 3));
    }
}
