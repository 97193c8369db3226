//! Thread-safe front door to the interpreter
//!
//! [`InteropService`] owns the interpreter thread. Inspection calls are
//! submitted through the bridge and awaited; REPL and debugger commands are
//! posted and answered through the event stream.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bridge::{self, Bridge, SubmitOptions};
use crate::config::Config;
use crate::errors::{EvalError, InteropResult};
use crate::events::{self, Acknowledger, AsyncEvent, EventStream, FrameInfo};
use crate::interpreter::SourcePosition;
use crate::refs::{Handle, Reference};
use crate::session::{
    Breakpoint, Control, DebugCommand, ExecuteResult, ParentEnv, ReplInput, ReplState, Session,
    ValueInfo, Variables, CONSOLE_SOURCE,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn options(immediate: bool, cancel: Option<CancellationToken>) -> SubmitOptions {
    SubmitOptions { immediate, cancel }
}

pub struct InteropService {
    bridge: Bridge<Session>,
    control: Arc<Control>,
    events: tokio::sync::Mutex<EventStream>,
    /// Notify-and-wait events the client has not finished yet
    pending_acks: Mutex<HashMap<u64, Acknowledger>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl InteropService {
    /// Spawn the interpreter thread and start its REPL loop
    pub fn start(config: Config) -> Result<Self> {
        let (bridge, dispatcher) = bridge::channel::<Session>();
        let (sender, stream) = events::channel();
        let control = Arc::new(Control::new());

        let thread = {
            let bridge = bridge.clone();
            let control = control.clone();
            thread::Builder::new()
                .name(config.interpreter.thread_name.clone())
                .stack_size(config.interpreter.stack_size)
                .spawn(move || {
                    let session =
                        Rc::new(Session::new(config, control, sender, bridge, dispatcher));
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| Session::run(session))) {
                        let message = payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!("Interpreter thread panicked: {}", message);
                        std::process::exit(1);
                    }
                })
                .context("Failed to spawn the interpreter thread")?
        };
        info!("Interop service started");

        Ok(Self {
            bridge,
            control,
            events: tokio::sync::Mutex::new(stream),
            pending_acks: Mutex::new(HashMap::new()),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn control(&self) -> &Arc<Control> {
        &self.control
    }

    pub fn state(&self) -> ReplState {
        self.control.state()
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self.state(),
            ReplState::Busy | ReplState::ChildProcess | ReplState::ChildProcessAwaitingInput
        )
    }

    /* ===================== Bridge ===================== */

    /// Run `f` on the interpreter thread and wait for its result
    pub async fn submit<R, F>(&self, f: F, options: SubmitOptions) -> InteropResult<R>
    where
        F: FnOnce(&Session) -> R + Send + 'static,
        R: Send + 'static,
    {
        Ok(self.bridge.submit(f, options).await?)
    }

    /// Queue `f` on the interpreter thread without waiting
    pub fn post<F>(&self, f: F) -> InteropResult<()>
    where
        F: FnOnce(&Session) + Send + 'static,
    {
        Ok(self.bridge.post(f)?)
    }

    async fn query<R, F>(&self, f: F, options: SubmitOptions) -> InteropResult<R>
    where
        F: FnOnce(&Session) -> Result<R, EvalError> + Send + 'static,
        R: Send + 'static,
    {
        Ok(self.bridge.submit(f, options).await??)
    }

    /// Nudge a waiting interpreter thread so it re-checks shared flags
    fn wake(&self) {
        if self.bridge.post(|_session| {}).is_err() {
            debug!("Interpreter thread is gone, nothing to wake");
        }
    }

    /* ===================== Inspection ===================== */

    pub async fn inspect(
        &self,
        reference: Reference,
        cancel: Option<CancellationToken>,
    ) -> InteropResult<Option<ValueInfo>> {
        self.query(move |s| s.inspect(&reference), options(true, cancel))
            .await
    }

    pub async fn value_info(
        &self,
        reference: Reference,
        cancel: Option<CancellationToken>,
    ) -> InteropResult<ValueInfo> {
        self.query(move |s| s.value_info(&reference), options(true, cancel))
            .await
    }

    pub async fn evaluate_as_text(
        &self,
        reference: Reference,
        cancel: Option<CancellationToken>,
    ) -> InteropResult<String> {
        self.submit(move |s| s.evaluate_as_text(&reference), options(true, cancel))
            .await
    }

    pub async fn evaluate_as_boolean(
        &self,
        reference: Reference,
        cancel: Option<CancellationToken>,
    ) -> InteropResult<bool> {
        self.submit(move |s| s.evaluate_as_boolean(&reference), options(true, cancel))
            .await
    }

    pub async fn load_object_names(
        &self,
        reference: Reference,
        cancel: Option<CancellationToken>,
    ) -> InteropResult<Vec<String>> {
        self.query(move |s| s.load_object_names(&reference), options(true, cancel))
            .await
    }

    pub async fn load_variables(
        &self,
        reference: Reference,
        start: usize,
        end: Option<usize>,
        cancel: Option<CancellationToken>,
    ) -> InteropResult<Variables> {
        self.query(
            move |s| s.load_variables(&reference, start, end),
            options(true, cancel),
        )
        .await
    }

    pub async fn load_parent_envs(
        &self,
        reference: Reference,
        cancel: Option<CancellationToken>,
    ) -> InteropResult<Vec<ParentEnv>> {
        self.query(move |s| s.load_parent_envs(&reference), options(true, cancel))
            .await
    }

    pub async fn equality_object(
        &self,
        reference: Reference,
        cancel: Option<CancellationToken>,
    ) -> InteropResult<u64> {
        self.submit(move |s| s.equality_object(&reference), options(true, cancel))
            .await
    }

    pub async fn distinct_strings(
        &self,
        reference: Reference,
        cancel: Option<CancellationToken>,
    ) -> InteropResult<Vec<String>> {
        self.query(move |s| s.distinct_strings(&reference), options(true, cancel))
            .await
    }

    pub async fn set_value(
        &self,
        target: Reference,
        source: Reference,
        cancel: Option<CancellationToken>,
    ) -> InteropResult<()> {
        self.query(move |s| s.set_value(&target, &source), options(true, cancel))
            .await
    }

    pub async fn clear_environment(
        &self,
        reference: Reference,
        cancel: Option<CancellationToken>,
    ) -> InteropResult<()> {
        self.query(move |s| s.clear_environment(&reference), options(true, cancel))
            .await
    }

    pub async fn execute_code(
        &self,
        code: String,
        cancel: Option<CancellationToken>,
    ) -> InteropResult<ExecuteResult> {
        self.submit(move |s| s.execute_code(&code), options(true, cancel))
            .await
    }

    pub async fn last_error_stack(&self) -> InteropResult<Vec<FrameInfo>> {
        self.submit(|s| s.last_error_stack(), SubmitOptions::immediate())
            .await
    }

    pub async fn debug_stack(&self) -> InteropResult<Vec<FrameInfo>> {
        self.submit(|s| s.debug_stack(), SubmitOptions::immediate())
            .await
    }

    /* ===================== Handles ===================== */

    pub async fn register_handle(
        &self,
        reference: Reference,
        cancel: Option<CancellationToken>,
    ) -> InteropResult<Handle> {
        self.query(move |s| s.register_handle(&reference), options(true, cancel))
            .await
    }

    /// Deferred, so it observes every earlier removal
    pub async fn has_handle(&self, handle: Handle) -> InteropResult<bool> {
        self.submit(move |s| s.has_handle(handle), SubmitOptions::default())
            .await
    }

    pub async fn remove_handles(&self, handles: Vec<Handle>) -> InteropResult<()> {
        self.submit(move |s| s.remove_handles(&handles), SubmitOptions::default())
            .await
    }

    /* ===================== REPL ===================== */

    /// Feed a line to whatever is waiting for one
    pub fn send_line(&self, line: String) {
        match self.state() {
            ReplState::Prompting
            | ReplState::DebugPrompting
            | ReplState::AwaitingLine
            | ReplState::ChildProcessAwaitingInput => {
                self.post_command(move |s| s.accept_line(line))
            }
            state => debug!(?state, "send_line ignored"),
        }
    }

    pub fn send_end_of_input(&self) {
        match self.state() {
            ReplState::AwaitingLine | ReplState::ChildProcessAwaitingInput => {
                self.post_command(|s| s.accept_end_of_input())
            }
            state => debug!(?state, "send_end_of_input ignored"),
        }
    }

    /// Evaluate source-attributed code at the prompt
    pub fn repl_execute(&self, code: String, source: Option<String>, debug: bool) {
        match self.state() {
            ReplState::Prompting => {
                let input = ReplInput {
                    code,
                    source: source.unwrap_or_else(|| CONSOLE_SOURCE.to_string()),
                    debug,
                };
                self.post_command(move |s| s.accept_repl_input(input))
            }
            state => debug!(?state, "repl_execute ignored"),
        }
    }

    /// Interrupt running evaluation, whether REPL input or a bridge task
    pub fn interrupt(&self) {
        let state = self.state();
        if !self.control.accepts_interrupt() {
            debug!(?state, "interrupt ignored");
            return;
        }
        debug!(?state, "Raising interrupt");
        self.control.raise_interrupt();
        self.wake();
    }

    fn post_command<F>(&self, f: F)
    where
        F: FnOnce(&Session) + Send + 'static,
    {
        if self.bridge.post(f).is_err() {
            debug!("Interpreter thread is gone, dropping command");
        }
    }

    /* ===================== Debugger ===================== */

    /// Resume or step a stopped interpreter, or arm a step for a busy one
    pub fn debug_command(&self, command: DebugCommand) {
        match self.state() {
            ReplState::DebugPrompting => {
                self.post_command(move |s| s.accept_debug_command(command))
            }
            ReplState::Busy => self.control.set_pending_step(command),
            state => debug!(?state, ?command, "debug command ignored"),
        }
    }

    pub fn add_or_modify_breakpoint(&self, breakpoint: Breakpoint) {
        self.control.add_or_modify_breakpoint(breakpoint);
    }

    pub fn remove_breakpoint(&self, position: &SourcePosition) -> bool {
        self.control.remove_breakpoint(position)
    }

    pub fn mute_breakpoints(&self, muted: bool) {
        self.control.set_muted(muted);
    }

    /* ===================== Events ===================== */

    /// Next event for the client; `None` once the interpreter thread is gone
    pub async fn next_event(&self) -> Option<AsyncEvent> {
        let delivery = self.events.lock().await.recv().await?;
        if let (AsyncEvent::ViewRequest { request_id, .. }, Some(ack)) =
            (&delivery.event, delivery.ack)
        {
            lock(&self.pending_acks).insert(*request_id, ack);
        }
        Some(delivery.event)
    }

    /// Release a notify-and-wait event; false when `request_id` is unknown
    pub fn client_request_finished(&self, request_id: u64) -> bool {
        match lock(&self.pending_acks).remove(&request_id) {
            Some(ack) => {
                ack.acknowledge();
                true
            }
            None => {
                debug!(request_id, "Unknown client request");
                false
            }
        }
    }

    /* ===================== Shutdown ===================== */

    /// Ask the interpreter thread to stop and wait until it has
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down interop service");
        self.control.request_terminate();
        if self.control.accepts_interrupt() {
            self.control.raise_interrupt();
        }
        lock(&self.pending_acks).clear();
        self.wake();
        self.control.wait_terminated().await;

        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .context("Failed to join the interpreter thread")?
                .map_err(|_| anyhow::anyhow!("Interpreter thread panicked"))?;
        }
        Ok(())
    }
}
