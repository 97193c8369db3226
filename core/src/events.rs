//! Async event channel from the interpreter thread to the client stream
//!
//! Unbounded and strictly ordered. A producer can attach an acknowledgement
//! to an event and wait until the consumer releases it. Dropping the
//! consumer releases every pending acknowledgement.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::interpreter::{OutputStream, SourcePosition, StackFrame};
use crate::refs::Handle;

/* ===================== Events ===================== */

/// Stack frame as reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub function: Option<String>,
    pub position: Option<SourcePosition>,
}

impl From<&StackFrame> for FrameInfo {
    fn from(frame: &StackFrame) -> Self {
        Self {
            function: frame.function.clone(),
            position: frame.position.clone(),
        }
    }
}

pub fn frame_infos(stack: &[StackFrame]) -> Vec<FrameInfo> {
    stack.iter().map(FrameInfo::from).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AsyncEvent {
    Busy,
    Text {
        stream: OutputStream,
        text: String,
    },
    Prompt,
    DebugPrompt {
        /// The stack differs from the previous stop
        changed: bool,
        stack: Vec<FrameInfo>,
    },
    RequestReadLine {
        prompt: String,
    },
    ChildProcessInput,
    Exception {
        message: String,
        interrupted: bool,
        stack: Vec<FrameInfo>,
    },
    ViewRequest {
        request_id: u64,
        handle: Handle,
        title: String,
    },
    Termination,
}

/* ===================== Acknowledgement ===================== */

pub type AckHook = Box<dyn Fn() + Send + Sync>;

struct AckState {
    done: Mutex<bool>,
    cond: Condvar,
    on_ack: Option<AckHook>,
}

impl AckState {
    fn new(on_ack: Option<AckHook>) -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
            on_ack,
        })
    }

    fn complete(&self) {
        let mut done = match self.done.lock() {
            Ok(done) => done,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *done {
            return;
        }
        *done = true;
        self.cond.notify_all();
        drop(done);
        if let Some(hook) = &self.on_ack {
            hook();
        }
    }

    fn is_done(&self) -> bool {
        match self.done.lock() {
            Ok(done) => *done,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Consumer side of a notify-and-wait event. Acknowledges on drop.
pub struct Acknowledger {
    state: Arc<AckState>,
}

impl Acknowledger {
    pub fn acknowledge(self) {
        // Drop completes the acknowledgement.
    }
}

impl Drop for Acknowledger {
    fn drop(&mut self) {
        self.state.complete();
    }
}

impl fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledger")
            .field("done", &self.state.is_done())
            .finish()
    }
}

/// Producer side of a notify-and-wait event
pub struct AckWaiter {
    state: Arc<AckState>,
}

impl AckWaiter {
    pub fn is_acknowledged(&self) -> bool {
        self.state.is_done()
    }

    /// Block the current thread until acknowledged
    pub fn wait(&self) {
        let mut done = match self.state.done.lock() {
            Ok(done) => done,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*done {
            done = match self.state.cond.wait(done) {
                Ok(done) => done,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

/* ===================== Channel ===================== */

/// A delivered event, with its acknowledgement when the producer waits
#[derive(Debug)]
pub struct Delivery {
    pub event: AsyncEvent,
    pub ack: Option<Acknowledger>,
}

#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Delivery>,
}

pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

pub fn channel() -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventStream { rx })
}

impl EventSender {
    pub fn push(&self, event: AsyncEvent) {
        if self.tx.send(Delivery { event, ack: None }).is_err() {
            debug!("Event stream closed, dropping event");
        }
    }

    /// Push `event` and return a waiter released once the consumer
    /// acknowledges it. `on_ack` runs on the acknowledging thread.
    pub fn push_and_wait(&self, event: AsyncEvent, on_ack: Option<AckHook>) -> AckWaiter {
        let state = AckState::new(on_ack);
        let delivery = Delivery {
            event,
            ack: Some(Acknowledger {
                state: state.clone(),
            }),
        };
        // A closed stream drops the delivery, which releases the waiter.
        if self.tx.send(delivery).is_err() {
            debug!("Event stream closed, releasing notify-and-wait event");
        }
        AckWaiter { state }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl EventStream {
    /// Next event; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn blocking_recv(&mut self) -> Option<Delivery> {
        self.rx.blocking_recv()
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}
