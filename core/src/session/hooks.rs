//! Evaluator hooks: breakpoints, stepping, input and notify-and-wait requests

use tracing::debug;

use crate::errors::EvalError;
use crate::events::{frame_infos, AsyncEvent};
use crate::interpreter::{
    parse_program, Boundary, ChildCommand, Env, GuestError, Host, Interpreter, OutputStream, Unwind,
    Value,
};
use crate::refs::{Handle, ResolveContext};

use super::child::RunningChild;
use super::control::ReplState;
use super::debugger::{DebugCommand, StepPolicy, CONSOLE_SOURCE};
use super::{DebugReply, Session};

const INSPECT_SOURCE: &str = "<inspect>";

/// Single-letter commands understood at the debugger prompt
fn browser_command(line: &str) -> Option<DebugCommand> {
    match line.trim() {
        "c" | "cont" => Some(DebugCommand::Continue),
        "n" => Some(DebugCommand::StepOver),
        "s" => Some(DebugCommand::StepInto),
        "f" => Some(DebugCommand::StepOut),
        "Q" => Some(DebugCommand::Stop),
        _ => None,
    }
}

impl Session {
    /// Evaluate `code` in `env` for inspection: no debugging, no output
    pub(crate) fn eval_inspection(&self, env: &Env, code: &str) -> Result<Value, EvalError> {
        Ok(self.run_inspection(env, code)?)
    }

    /// Like [`Session::eval_inspection`], keeping interrupts and aborts apart
    /// from guest errors
    fn run_inspection(&self, env: &Env, code: &str) -> Result<Value, Unwind> {
        let program = parse_program(code, INSPECT_SOURCE, 0)
            .map_err(|err| Unwind::Error(GuestError::bare(err.to_string())))?;
        self.inspecting.set(self.inspecting.get() + 1);
        let result = self.interp.eval_program(&program, env, self);
        self.inspecting.set(self.inspecting.get() - 1);
        result
    }

    fn is_inspecting(&self) -> bool {
        self.inspecting.get() > 0
    }

    /// Whether a breakpoint stops at `boundary`. Runs its log expression.
    fn check_breakpoint(&self, interp: &Interpreter, boundary: &Boundary) -> Result<bool, Unwind> {
        if !self.breakpoints_active.get()
            || self.control.is_muted()
            || self.control.breakpoint_count() == 0
        {
            return Ok(false);
        }
        let Some(breakpoint) = self.control.breakpoint_at(&boundary.position()) else {
            return Ok(false);
        };
        if !breakpoint.enabled {
            return Ok(false);
        }

        let env = interp.current_env();
        if let Some(condition) = &breakpoint.condition {
            let hit = match self.run_inspection(&env, condition) {
                Ok(value) => value.as_bool().unwrap_or(true),
                Err(Unwind::Error(_)) => true,
                Err(other) => return Err(other),
            };
            if !hit {
                return Ok(false);
            }
        }
        if let Some(expression) = &breakpoint.log_expression {
            let text = match self.run_inspection(&env, expression) {
                Ok(value) => value.as_text(),
                Err(Unwind::Error(err)) => format!("Error: {}", err.message),
                Err(other) => return Err(other),
            };
            self.events.push(AsyncEvent::Text {
                stream: OutputStream::Stderr,
                text: format!("{}\n", text),
            });
        }
        Ok(breakpoint.suspend)
    }

    /// Stop in the debugger until a command resumes or aborts evaluation
    fn debug_prompt(&self, interp: &Interpreter) -> Result<(), Unwind> {
        let stack = interp.stack();
        let frames = frame_infos(&stack);
        let mut changed = *self.last_stop.borrow() != frames;
        *self.last_stop.borrow_mut() = frames.clone();
        *self.debug_stack.borrow_mut() = stack;
        let depth = interp.depth();
        debug!(depth, "Stopped in debugger");

        loop {
            self.control.set_state(ReplState::DebugPrompting);
            self.events.push(AsyncEvent::DebugPrompt {
                changed,
                stack: frames.clone(),
            });
            changed = false;

            let reply = self
                .wait_for(|s| s.debug_reply.borrow_mut().take())
                .ok_or(Unwind::Aborted)?;
            let command = match reply {
                DebugReply::Command(command) => command,
                DebugReply::Line(line) => match browser_command(&line) {
                    Some(command) => command,
                    None => {
                        self.set_busy();
                        self.eval_debug_line(interp, &line)?;
                        continue;
                    }
                },
            };

            self.set_busy();
            debug!(?command, "Leaving debugger");
            if command == DebugCommand::Stop {
                return Err(Unwind::Aborted);
            }
            *self.step.borrow_mut() = StepPolicy::from_command(&command, depth);
            return Ok(());
        }
    }

    /// Evaluate a line typed at the debugger prompt in the innermost frame
    fn eval_debug_line(&self, interp: &Interpreter, line: &str) -> Result<(), Unwind> {
        let program = match parse_program(line, CONSOLE_SOURCE, 0) {
            Ok(program) => program,
            Err(err) => {
                self.write_error(&err.to_string());
                return Ok(());
            }
        };
        let saved_stack = self.debug_stack.borrow().clone();
        let saved_stop = self.last_stop.borrow().clone();
        let env = saved_stack
            .last()
            .map(|frame| frame.env.clone())
            .unwrap_or_else(|| interp.global_env());

        let result = interp.eval_toplevel(&program, &env, self);

        *self.debug_stack.borrow_mut() = saved_stack;
        *self.last_stop.borrow_mut() = saved_stop;
        match result {
            Ok(_) => Ok(()),
            Err(Unwind::Error(err)) => {
                self.write_error(&err.message);
                Ok(())
            }
            Err(other) => Err(other),
        }
    }
}

impl Host for Session {
    fn at_boundary(&self, interp: &Interpreter, boundary: &Boundary) -> Result<(), Unwind> {
        self.check_interrupt()?;
        if self.control.terminate_requested() {
            return Err(Unwind::Aborted);
        }
        if self.is_inspecting() {
            return Ok(());
        }

        if let Some(command) = self.control.take_pending_step() {
            debug!(?command, "Applying pending step command");
            match command {
                DebugCommand::Stop => return Err(Unwind::Aborted),
                DebugCommand::Continue => {
                    *self.step.borrow_mut() = None;
                }
                other => {
                    *self.step.borrow_mut() = StepPolicy::from_command(&other, boundary.depth);
                }
            }
        }

        let mut stop = self.check_breakpoint(interp, boundary)?;
        if !stop {
            stop = self
                .step
                .borrow()
                .as_ref()
                .map(|policy| policy.should_stop(boundary))
                .unwrap_or(false);
        }
        if stop {
            *self.step.borrow_mut() = None;
            self.debug_prompt(interp)?;
        }
        Ok(())
    }

    fn check_interrupt(&self) -> Result<(), Unwind> {
        if self.control.take_interrupt() {
            return Err(Unwind::Interrupted);
        }
        Ok(())
    }

    fn write(&self, stream: OutputStream, text: &str) {
        if self.is_inspecting() || text.is_empty() {
            return;
        }
        self.events.push(AsyncEvent::Text {
            stream,
            text: text.to_string(),
        });
    }

    fn read_line(&self, _interp: &Interpreter, prompt: &str) -> Result<Option<String>, Unwind> {
        if self.is_inspecting() {
            return Ok(None);
        }
        let previous = self.state();
        self.control.set_state(ReplState::AwaitingLine);
        self.events.push(AsyncEvent::RequestReadLine {
            prompt: prompt.to_string(),
        });

        let outcome = self
            .wait_for(|s| {
                if s.control.take_interrupt() {
                    return Some(Err(Unwind::Interrupted));
                }
                s.line_reply.borrow_mut().take().map(Ok)
            })
            .unwrap_or(Err(Unwind::Aborted));

        self.control.set_state(previous);
        self.events.push(AsyncEvent::Busy);
        outcome
    }

    fn browser(&self, interp: &Interpreter) -> Result<(), Unwind> {
        if self.is_inspecting() {
            return Ok(());
        }
        self.debug_prompt(interp)
    }

    fn view(&self, _interp: &Interpreter, value: Value, title: &str) -> Result<(), Unwind> {
        if self.is_inspecting() {
            return Ok(());
        }
        let handle = self.registry.borrow_mut().register(value);
        let request_id = self.next_request_id();
        let bridge = self.bridge.clone();
        let waiter = self.events.push_and_wait(
            AsyncEvent::ViewRequest {
                request_id,
                handle,
                title: title.to_string(),
            },
            // Wake the dispatcher so the wait below re-checks the waiter.
            Some(Box::new(move || {
                let _ = bridge.post(|_session| {});
            })),
        );

        self.wait_for(|_| waiter.is_acknowledged().then_some(()))
            .ok_or(Unwind::Aborted)
    }

    fn run_child(&self, interp: &Interpreter, command: ChildCommand) -> Result<i32, Unwind> {
        if self.is_inspecting() {
            return Err(interp.error("system() is not available during inspection"));
        }
        let child = RunningChild::spawn(&command, &self.events, &self.bridge)
            .map_err(|err| interp.error(format!("cannot run '{}': {}", command.program, err)))?;
        let interactive = child.accepts_input();
        *self.child.borrow_mut() = Some(child);
        *self.child_exit.borrow_mut() = None;

        if interactive {
            self.control.set_state(ReplState::ChildProcessAwaitingInput);
            self.events.push(AsyncEvent::ChildProcessInput);
        } else {
            self.control.set_state(ReplState::ChildProcess);
        }

        let exit = self.wait_for(|s| {
            if s.control.take_interrupt() {
                if let Some(child) = s.child.borrow().as_ref() {
                    child.kill();
                }
            }
            s.child_exit.borrow_mut().take()
        });
        let child = self.child.borrow_mut().take();
        self.set_busy();

        match exit {
            Some(exit) if exit.killed => Err(Unwind::Interrupted),
            Some(exit) => Ok(exit.code),
            None => {
                if let Some(child) = child {
                    child.kill();
                }
                Err(Unwind::Aborted)
            }
        }
    }

    fn quit(&self, interp: &Interpreter) -> Result<(), Unwind> {
        if self.is_inspecting() {
            return Err(interp.error("quit() is not available during inspection"));
        }
        debug!("quit() requested termination");
        self.control.request_terminate();
        Err(Unwind::Aborted)
    }
}

impl ResolveContext for Session {
    fn global_env(&self) -> Env {
        self.interp.global_env()
    }

    fn current_env(&self) -> Env {
        self.debug_stack
            .borrow()
            .last()
            .map(|frame| frame.env.clone())
            .unwrap_or_else(|| self.interp.global_env())
    }

    fn debug_frame(&self, index: usize) -> Option<Env> {
        self.debug_stack.borrow().get(index).map(|f| f.env.clone())
    }

    fn error_frame(&self, index: usize) -> Option<Env> {
        self.last_error_stack.borrow().get(index).map(|f| f.env.clone())
    }

    fn handle_value(&self, handle: Handle) -> Option<Value> {
        self.registry.borrow().get(handle).cloned()
    }

    fn eval_in(&self, env: &Env, code: &str) -> Result<Value, EvalError> {
        self.eval_inspection(env, code)
    }
}
