//! Interpreter-thread session
//!
//! Owns the interpreter, the handle registry and the REPL/debugger state. A
//! session lives on the interpreter thread behind an `Rc`; other threads
//! reach it through the bridge and the shared [`Control`] block.
//!
//! Whenever the interpreter waits (prompt, debugger stop, `readline`,
//! notify-and-wait, child process) it keeps serving bridge tasks through
//! [`Session::wait_for`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, info};

use crate::bridge::{Bridge, Dispatcher, Next};
use crate::config::Config;
use crate::events::{frame_infos, AsyncEvent, EventSender, FrameInfo};
use crate::interpreter::{parse_program, Interpreter, OutputStream, StackFrame, Unwind, Value};
use crate::refs::Registry;

pub mod child;
pub mod control;
pub mod debugger;
mod hooks;
pub mod inspect;


pub use control::{Control, ReplState};
pub use debugger::{Breakpoint, DebugCommand, StepPolicy, CONSOLE_SOURCE};
pub use inspect::{ExecuteResult, ParentEnv, ValueInfo, Variable, Variables};

use child::{ChildExit, RunningChild};

/// Source name of the configured startup code
const STARTUP_SOURCE: &str = "<startup>";

/// Code delivered to the top-level prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplInput {
    pub code: String,
    pub source: String,
    /// Honour breakpoints while evaluating
    pub debug: bool,
}

impl ReplInput {
    pub fn console(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            source: CONSOLE_SOURCE.to_string(),
            debug: true,
        }
    }
}

/// What ends a debugger stop
enum DebugReply {
    Line(String),
    Command(DebugCommand),
}

pub struct Session {
    interp: Interpreter,
    config: Config,
    control: Arc<Control>,
    events: EventSender,
    bridge: Bridge<Session>,
    dispatcher: RefCell<Dispatcher<Session>>,
    registry: RefCell<Registry<Value>>,

    input: RefCell<Option<ReplInput>>,
    debug_reply: RefCell<Option<DebugReply>>,
    line_reply: RefCell<Option<Option<String>>>,

    step: RefCell<Option<StepPolicy>>,
    /// Stack captured at the current debugger stop
    debug_stack: RefCell<Vec<StackFrame>>,
    last_stop: RefCell<Vec<FrameInfo>>,
    last_error_stack: RefCell<Vec<StackFrame>>,
    breakpoints_active: Cell<bool>,
    /// Nesting of inspection evaluations; debugging and output are off while > 0
    inspecting: Cell<usize>,

    child: RefCell<Option<RunningChild>>,
    child_exit: RefCell<Option<ChildExit>>,
    next_request_id: Cell<u64>,
}

impl Session {
    pub fn new(
        config: Config,
        control: Arc<Control>,
        events: EventSender,
        bridge: Bridge<Session>,
        dispatcher: Dispatcher<Session>,
    ) -> Self {
        Self {
            interp: Interpreter::with_max_depth(config.interpreter.max_depth),
            config,
            control,
            events,
            bridge,
            dispatcher: RefCell::new(dispatcher),
            registry: RefCell::new(Registry::new()),
            input: RefCell::new(None),
            debug_reply: RefCell::new(None),
            line_reply: RefCell::new(None),
            step: RefCell::new(None),
            debug_stack: RefCell::new(Vec::new()),
            last_stop: RefCell::new(Vec::new()),
            last_error_stack: RefCell::new(Vec::new()),
            breakpoints_active: Cell::new(true),
            inspecting: Cell::new(0),
            child: RefCell::new(None),
            child_exit: RefCell::new(None),
            next_request_id: Cell::new(1),
        }
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interp
    }

    pub fn control(&self) -> &Arc<Control> {
        &self.control
    }

    pub fn state(&self) -> ReplState {
        self.control.state()
    }

    /* ===================== Dispatch Loop ===================== */

    /// Run the REPL on the current thread until termination is requested
    pub fn run(session: Rc<Session>) {
        session.dispatcher.borrow().bind(&session);
        info!("Interpreter thread started");

        if let Some(code) = session.config.interpreter.startup_code.clone() {
            session.evaluate_input(ReplInput {
                code,
                source: STARTUP_SOURCE.to_string(),
                debug: false,
            });
        }

        while !session.control.terminate_requested() {
            session.enter_prompt();
            let Some(input) = session.wait_for(|s| s.input.borrow_mut().take()) else {
                break;
            };
            session.set_busy();
            session.evaluate_input(input);
        }

        session.finish();
        session.dispatcher.borrow().unbind();
    }

    /// Serve bridge tasks until `ready` yields a value. `None` when
    /// termination was requested or every bridge is gone.
    pub(crate) fn wait_for<T>(&self, mut ready: impl FnMut(&Session) -> Option<T>) -> Option<T> {
        loop {
            if let Some(value) = ready(self) {
                return Some(value);
            }
            if self.control.terminate_requested() {
                return None;
            }
            let next = self.dispatcher.borrow_mut().next_job(true);
            match next {
                Next::Job(job) => job.run(self),
                Next::Idle => {}
                Next::Closed => return None,
            }
        }
    }

    fn finish(&self) {
        info!("Interpreter thread shutting down");
        loop {
            let next = self.dispatcher.borrow_mut().next_job(false);
            match next {
                Next::Job(job) => job.run(self),
                Next::Idle | Next::Closed => break,
            }
        }
        if let Some(child) = self.child.borrow().as_ref() {
            child.kill();
        }
        self.registry.borrow_mut().clear();
        self.events.push(AsyncEvent::Termination);
        self.control.acknowledge_terminate();
    }

    fn enter_prompt(&self) {
        // Leftovers from the finished evaluation must not leak into the next one.
        self.control.take_pending_step();
        self.control.take_interrupt();
        *self.step.borrow_mut() = None;
        self.debug_stack.borrow_mut().clear();
        self.last_stop.borrow_mut().clear();

        self.control.set_state(ReplState::Prompting);
        self.events.push(AsyncEvent::Prompt);
    }

    fn set_busy(&self) {
        self.control.set_state(ReplState::Busy);
        self.events.push(AsyncEvent::Busy);
    }

    fn write_error(&self, message: &str) {
        self.events.push(AsyncEvent::Text {
            stream: OutputStream::Stderr,
            text: format!("Error: {}\n", message),
        });
    }

    /// Evaluate top-level input, reporting uncaught errors
    fn evaluate_input(&self, input: ReplInput) {
        let program = match parse_program(&input.code, &input.source, 0) {
            Ok(program) => program,
            Err(err) => {
                let message = err.to_string();
                self.write_error(&message);
                self.events.push(AsyncEvent::Exception {
                    message,
                    interrupted: false,
                    stack: Vec::new(),
                });
                return;
            }
        };

        self.breakpoints_active.set(input.debug);
        let result = self
            .interp
            .eval_toplevel(&program, &self.interp.global_env(), self);
        self.breakpoints_active.set(true);

        match result {
            Ok(_) => {}
            Err(Unwind::Error(err)) => {
                self.write_error(&err.message);
                let stack = frame_infos(&err.stack);
                *self.last_error_stack.borrow_mut() = err.stack;
                self.events.push(AsyncEvent::Exception {
                    message: err.message,
                    interrupted: false,
                    stack,
                });
            }
            Err(Unwind::Interrupted) => {
                self.events.push(AsyncEvent::Exception {
                    message: "interrupted".to_string(),
                    interrupted: true,
                    stack: Vec::new(),
                });
            }
            Err(Unwind::Aborted) => debug!("Evaluation aborted"),
        }
    }

    /* ===================== Client Input ===================== */

    /// A line from the client, routed by the current state
    pub fn accept_line(&self, line: String) {
        match self.state() {
            ReplState::Prompting => *self.input.borrow_mut() = Some(ReplInput::console(line)),
            ReplState::DebugPrompting => {
                *self.debug_reply.borrow_mut() = Some(DebugReply::Line(line))
            }
            ReplState::AwaitingLine => *self.line_reply.borrow_mut() = Some(Some(line)),
            ReplState::ChildProcessAwaitingInput => {
                if let Some(child) = self.child.borrow_mut().as_mut() {
                    child.write_line(&line);
                }
            }
            state => debug!(?state, "Ignoring line: not awaiting input"),
        }
    }

    pub fn accept_end_of_input(&self) {
        match self.state() {
            ReplState::AwaitingLine => *self.line_reply.borrow_mut() = Some(None),
            ReplState::ChildProcessAwaitingInput => {
                if let Some(child) = self.child.borrow_mut().as_mut() {
                    child.close_input();
                }
                self.control.set_state(ReplState::ChildProcess);
            }
            state => debug!(?state, "Ignoring end of input: not awaiting input"),
        }
    }

    /// Source-attributed code for the top-level prompt
    pub fn accept_repl_input(&self, input: ReplInput) {
        match self.state() {
            ReplState::Prompting => *self.input.borrow_mut() = Some(input),
            state => debug!(?state, "Ignoring REPL input: not at the prompt"),
        }
    }

    pub fn accept_debug_command(&self, command: DebugCommand) {
        match (self.state(), &command) {
            (ReplState::DebugPrompting, DebugCommand::Pause) => {
                debug!("Ignoring pause: already stopped")
            }
            (ReplState::DebugPrompting, _) => {
                *self.debug_reply.borrow_mut() = Some(DebugReply::Command(command))
            }
            (ReplState::Busy, _) => self.control.set_pending_step(command),
            (state, _) => debug!(?state, ?command, "Ignoring debug command"),
        }
    }

    pub(crate) fn child_exited(&self, exit: ChildExit) {
        debug!(code = exit.code, killed = exit.killed, "Child process exited");
        *self.child_exit.borrow_mut() = Some(exit);
    }

    fn next_request_id(&self) -> u64 {
        let id = self.next_request_id.get();
        self.next_request_id.set(id + 1);
        id
    }
}
