//! State shared between the interpreter thread and request handlers
//!
//! Everything here is `Send + Sync`. The interpreter thread publishes its
//! REPL state; other threads raise interrupts, arm step commands and edit
//! breakpoints without going through the bridge.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::interpreter::SourcePosition;

use super::debugger::{Breakpoint, BreakpointTable, DebugCommand};

/// What the interpreter thread is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ReplState {
    /// Waiting for top-level input
    Prompting,
    /// Stopped in the debugger
    DebugPrompting,
    /// `readline()` waiting for a line
    AwaitingLine,
    Busy,
    ChildProcess,
    ChildProcessAwaitingInput,
}

impl ReplState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReplState::Prompting,
            1 => ReplState::DebugPrompting,
            2 => ReplState::AwaitingLine,
            4 => ReplState::ChildProcess,
            5 => ReplState::ChildProcessAwaitingInput,
            _ => ReplState::Busy,
        }
    }

    /// States in which an interrupt has something to interrupt
    pub fn interruptible(self) -> bool {
        matches!(
            self,
            ReplState::Busy
                | ReplState::AwaitingLine
                | ReplState::ChildProcess
                | ReplState::ChildProcessAwaitingInput
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct Control {
    state: AtomicU8,
    interrupt: Arc<AtomicBool>,
    /// Bridge tasks currently evaluating guest code
    task_evaluations: AtomicUsize,
    pending_step: Mutex<Option<DebugCommand>>,
    breakpoints: Mutex<BreakpointTable>,
    muted: AtomicBool,
    terminate_requested: AtomicBool,
    terminate_acknowledged: watch::Sender<bool>,
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

impl Control {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ReplState::Busy as u8),
            interrupt: Arc::new(AtomicBool::new(false)),
            task_evaluations: AtomicUsize::new(0),
            pending_step: Mutex::new(None),
            breakpoints: Mutex::new(BreakpointTable::default()),
            muted: AtomicBool::new(false),
            terminate_requested: AtomicBool::new(false),
            terminate_acknowledged: watch::Sender::new(false),
        }
    }

    /* ===================== REPL State ===================== */

    pub fn state(&self) -> ReplState {
        ReplState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ReplState) {
        let previous = ReplState::from_u8(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            debug!(?previous, ?state, "REPL state changed");
        }
    }

    /* ===================== Interrupts ===================== */

    pub fn raise_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Read and clear the interrupt flag
    pub fn take_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// Mark guest evaluation inside a bridge task until the guard drops
    pub(crate) fn task_evaluation(&self) -> TaskEvaluation<'_> {
        self.task_evaluations.fetch_add(1, Ordering::SeqCst);
        TaskEvaluation { control: self }
    }

    /// Whether a bridge task is evaluating guest code right now
    pub fn task_evaluating(&self) -> bool {
        self.task_evaluations.load(Ordering::SeqCst) > 0
    }

    /// Whether an interrupt would reach running evaluation
    pub fn accepts_interrupt(&self) -> bool {
        self.state().interruptible() || self.task_evaluating()
    }

    /* ===================== Stepping ===================== */

    /// Arm a command for the next evaluation boundary, replacing any other
    pub fn set_pending_step(&self, command: DebugCommand) {
        *lock(&self.pending_step) = Some(command);
    }

    pub fn take_pending_step(&self) -> Option<DebugCommand> {
        lock(&self.pending_step).take()
    }

    /* ===================== Breakpoints ===================== */

    pub fn add_or_modify_breakpoint(&self, breakpoint: Breakpoint) {
        lock(&self.breakpoints).add_or_modify(breakpoint);
    }

    pub fn remove_breakpoint(&self, position: &SourcePosition) -> bool {
        lock(&self.breakpoints).remove(position)
    }

    pub fn breakpoint_at(&self, position: &SourcePosition) -> Option<Breakpoint> {
        lock(&self.breakpoints).get(position).cloned()
    }

    pub fn breakpoint_count(&self) -> usize {
        lock(&self.breakpoints).len()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /* ===================== Shutdown ===================== */

    pub fn request_terminate(&self) {
        self.terminate_requested.store(true, Ordering::SeqCst);
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn acknowledge_terminate(&self) {
        self.terminate_acknowledged.send_replace(true);
    }

    pub fn terminate_acknowledged(&self) -> bool {
        *self.terminate_acknowledged.borrow()
    }

    /// Wait until the dispatch loop has drained and exited
    pub async fn wait_terminated(&self) {
        let mut rx = self.terminate_acknowledged.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Guard returned by [`Control::task_evaluation`]
pub(crate) struct TaskEvaluation<'a> {
    control: &'a Control,
}

impl Drop for TaskEvaluation<'_> {
    fn drop(&mut self) {
        let remaining = self.control.task_evaluations.fetch_sub(1, Ordering::SeqCst) - 1;
        // Nothing else consumes an interrupt that lands after the task ended.
        if remaining == 0 && !self.control.state().interruptible() {
            self.control.take_interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_busy() {
        assert_eq!(Control::new().state(), ReplState::Busy);
    }

    #[test]
    fn test_state_round_trips_through_atomic() {
        let control = Control::new();
        for state in [
            ReplState::Prompting,
            ReplState::DebugPrompting,
            ReplState::AwaitingLine,
            ReplState::Busy,
            ReplState::ChildProcess,
            ReplState::ChildProcessAwaitingInput,
        ] {
            control.set_state(state);
            assert_eq!(control.state(), state);
        }
    }

    #[test]
    fn test_pending_step_is_read_and_cleared() {
        let control = Control::new();
        control.set_pending_step(DebugCommand::StepOver);
        control.set_pending_step(DebugCommand::Pause);

        assert_eq!(control.take_pending_step(), Some(DebugCommand::Pause));
        assert_eq!(control.take_pending_step(), None);
    }

    #[test]
    fn test_task_evaluation_accepts_interrupts_at_the_prompt() {
        let control = Control::new();
        control.set_state(ReplState::Prompting);
        assert!(!control.accepts_interrupt());

        let guard = control.task_evaluation();
        assert!(control.task_evaluating());
        assert!(control.accepts_interrupt());
        control.raise_interrupt();
        drop(guard);

        assert!(!control.task_evaluating());
        assert!(!control.take_interrupt());
    }

    #[test]
    fn test_task_evaluation_keeps_interrupt_for_waiting_readline() {
        let control = Control::new();
        control.set_state(ReplState::AwaitingLine);

        let guard = control.task_evaluation();
        control.raise_interrupt();
        drop(guard);

        assert!(control.take_interrupt());
    }

    #[tokio::test]
    async fn test_terminate_acknowledgement_wakes_waiter() {
        let control = Arc::new(Control::new());
        control.request_terminate();

        let waiter = tokio::spawn({
            let control = control.clone();
            async move { control.wait_terminated().await }
        });
        control.acknowledge_terminate();

        waiter.await.unwrap();
        assert!(control.terminate_requested());
        assert!(control.terminate_acknowledged());
    }
}
