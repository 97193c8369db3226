//! Execution bridge
//!
//! Every thread that needs the interpreter goes through a [`Bridge`]: tasks
//! are queued to the single interpreter thread, which pulls them with its
//! [`Dispatcher`] one at a time. Immediate tasks run before deferred tasks
//! that have not started yet. A task submitted from the interpreter thread
//! itself runs inline.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::BridgeError;

type Task<C> = Box<dyn FnOnce(&C) + Send>;

const QUEUED: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

thread_local! {
    /// Context of the dispatcher bound to this thread, for inline submissions
    static BOUND_CONTEXT: RefCell<Option<Rc<dyn Any>>> = const { RefCell::new(None) };
}

/* ===================== Submission ===================== */

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Run ahead of queued deferred tasks
    pub immediate: bool,
    /// Drops the task if fired before it starts
    pub cancel: Option<CancellationToken>,
}

impl SubmitOptions {
    pub fn immediate() -> Self {
        Self {
            immediate: true,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// A queued unit of work
pub struct Job<C> {
    immediate: bool,
    status: Arc<AtomicU8>,
    task: Task<C>,
}

impl<C> Job<C> {
    fn new(immediate: bool, task: Task<C>) -> Self {
        Self {
            immediate,
            status: Arc::new(AtomicU8::new(QUEUED)),
            task,
        }
    }

    /// Claim the job; false when it was cancelled while queued
    fn start(&self) -> bool {
        self.status
            .compare_exchange(QUEUED, STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn run(self, ctx: &C) {
        (self.task)(ctx)
    }
}

/// Sending side, cheap to clone and usable from any thread
pub struct Bridge<C> {
    tx: mpsc::UnboundedSender<Job<C>>,
    interpreter_thread: Arc<OnceLock<ThreadId>>,
}

impl<C> Clone for Bridge<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            interpreter_thread: self.interpreter_thread.clone(),
        }
    }
}

/// Create a connected bridge and dispatcher
pub fn channel<C: 'static>() -> (Bridge<C>, Dispatcher<C>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let interpreter_thread = Arc::new(OnceLock::new());
    (
        Bridge {
            tx,
            interpreter_thread: interpreter_thread.clone(),
        },
        Dispatcher {
            rx,
            immediate: VecDeque::new(),
            deferred: VecDeque::new(),
            interpreter_thread,
        },
    )
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<C: 'static> Bridge<C> {
    pub fn on_interpreter_thread(&self) -> bool {
        self.interpreter_thread.get() == Some(&thread::current().id())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Run `f` on the interpreter thread and wait for its result.
    ///
    /// Cancellation only takes effect while the task is still queued; once
    /// it has started the caller keeps waiting for the result.
    pub async fn submit<R, F>(&self, f: F, options: SubmitOptions) -> Result<R, BridgeError>
    where
        F: FnOnce(&C) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.on_interpreter_thread() {
            return run_inline(f);
        }

        let (job, status, mut rx) = self.job(f, options.immediate);
        self.tx.send(job).map_err(|_| BridgeError::Terminated)?;

        let outcome = match options.cancel {
            Some(token) => {
                tokio::select! {
                    outcome = &mut rx => outcome,
                    _ = token.cancelled() => {
                        if status
                            .compare_exchange(QUEUED, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                        {
                            debug!("Cancelled queued interpreter task");
                            return Err(BridgeError::Cancelled);
                        }
                        rx.await
                    }
                }
            }
            None => rx.await,
        };

        match outcome {
            Ok(result) => result.map_err(BridgeError::TaskPanicked),
            Err(_) => Err(BridgeError::Terminated),
        }
    }

    /// Blocking variant of [`Bridge::submit`] for callers outside a runtime
    pub fn submit_blocking<R, F>(&self, f: F, immediate: bool) -> Result<R, BridgeError>
    where
        F: FnOnce(&C) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.on_interpreter_thread() {
            return run_inline(f);
        }

        let (job, _status, rx) = self.job(f, immediate);
        self.tx.send(job).map_err(|_| BridgeError::Terminated)?;
        match rx.blocking_recv() {
            Ok(result) => result.map_err(BridgeError::TaskPanicked),
            Err(_) => Err(BridgeError::Terminated),
        }
    }

    /// Queue `f` as a deferred task without waiting for it
    pub fn post<F>(&self, f: F) -> Result<(), BridgeError>
    where
        F: FnOnce(&C) + Send + 'static,
    {
        let task: Task<C> = Box::new(move |ctx| {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(ctx))) {
                warn!(
                    "Posted interpreter task panicked: {}",
                    panic_message(payload)
                );
            }
        });
        self.tx
            .send(Job::new(false, task))
            .map_err(|_| BridgeError::Terminated)
    }

    #[allow(clippy::type_complexity)]
    fn job<R, F>(
        &self,
        f: F,
        immediate: bool,
    ) -> (
        Job<C>,
        Arc<AtomicU8>,
        oneshot::Receiver<Result<R, String>>,
    )
    where
        F: FnOnce(&C) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: Task<C> = Box::new(move |ctx| {
            let result = catch_unwind(AssertUnwindSafe(|| f(ctx))).map_err(panic_message);
            let _ = tx.send(result);
        });
        let job = Job::new(immediate, task);
        let status = job.status.clone();
        (job, status, rx)
    }
}

fn run_inline<C: 'static, R, F>(f: F) -> Result<R, BridgeError>
where
    F: FnOnce(&C) -> R,
{
    let ctx = BOUND_CONTEXT
        .with(|bound| bound.borrow().clone())
        .and_then(|ctx| ctx.downcast::<C>().ok())
        .ok_or(BridgeError::Terminated)?;
    catch_unwind(AssertUnwindSafe(|| f(&ctx)))
        .map_err(|payload| BridgeError::TaskPanicked(panic_message(payload)))
}

/* ===================== Dispatch ===================== */

/// Result of asking the dispatcher for work
pub enum Next<C> {
    Job(Job<C>),
    /// Nothing queued and the caller asked not to wait
    Idle,
    /// Every bridge has been dropped and the queue is empty
    Closed,
}

/// Receiving side, owned by the interpreter thread
pub struct Dispatcher<C> {
    rx: mpsc::UnboundedReceiver<Job<C>>,
    immediate: VecDeque<Job<C>>,
    deferred: VecDeque<Job<C>>,
    interpreter_thread: Arc<OnceLock<ThreadId>>,
}

impl<C: 'static> Dispatcher<C> {
    /// Mark the current thread as the interpreter thread and make `ctx`
    /// available to inline submissions
    pub fn bind(&self, ctx: &Rc<C>) {
        let _ = self.interpreter_thread.set(thread::current().id());
        let ctx: Rc<dyn Any> = ctx.clone();
        BOUND_CONTEXT.with(|bound| *bound.borrow_mut() = Some(ctx));
    }

    /// Drop the bound context from this thread
    pub fn unbind(&self) {
        BOUND_CONTEXT.with(|bound| bound.borrow_mut().take());
    }

    /// Move everything sent so far into the local queues; true once every
    /// bridge is gone
    fn drain(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(job) => self.enqueue(job),
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    fn enqueue(&mut self, job: Job<C>) {
        if job.immediate {
            self.immediate.push_back(job);
        } else {
            self.deferred.push_back(job);
        }
    }

    fn pop(&mut self) -> Option<Job<C>> {
        while let Some(job) = self.immediate.pop_front().or_else(|| self.deferred.pop_front()) {
            if job.start() {
                return Some(job);
            }
        }
        None
    }

    /// Next runnable job. With `wait`, blocks the thread until one arrives.
    pub fn next_job(&mut self, wait: bool) -> Next<C> {
        loop {
            let closed = self.drain();
            if let Some(job) = self.pop() {
                return Next::Job(job);
            }
            if closed {
                return Next::Closed;
            }
            if !wait {
                return Next::Idle;
            }
            match self.rx.blocking_recv() {
                Some(job) => self.enqueue(job),
                None => return Next::Closed,
            }
        }
    }

    /// Run one job; returns false once the bridge is closed
    pub fn run_next(&mut self, ctx: &C, wait: bool) -> bool {
        match self.next_job(wait) {
            Next::Job(job) => {
                job.run(ctx);
                true
            }
            Next::Idle => true,
            Next::Closed => false,
        }
    }

    /// Serve tasks on the current thread until every bridge is dropped
    pub fn run(mut self, ctx: Rc<C>) {
        self.bind(&ctx);
        while self.run_next(&ctx, true) {}
        self.unbind();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct Log {
        entries: RefCell<Vec<String>>,
    }

    impl Log {
        fn push(&self, entry: impl Into<String>) {
            self.entries.borrow_mut().push(entry.into());
        }
    }

    fn spawn_dispatcher() -> Bridge<Log> {
        let (bridge, dispatcher) = channel::<Log>();
        thread::spawn(move || dispatcher.run(Rc::new(Log::default())));
        bridge
    }

    async fn entries(bridge: &Bridge<Log>) -> Vec<String> {
        bridge
            .submit(|log| log.entries.borrow().clone(), SubmitOptions::default())
            .await
            .unwrap()
    }

    /// Post a task that blocks the interpreter thread until the returned
    /// sender fires, and wait until it has started
    fn block_interpreter(bridge: &Bridge<Log>) -> std_mpsc::Sender<()> {
        let (started_tx, started_rx) = std_mpsc::channel();
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        bridge
            .post(move |log| {
                log.push("blocker");
                started_tx.send(()).unwrap();
                gate_rx.recv_timeout(Duration::from_secs(10)).unwrap();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        gate_tx
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_submissions_never_interleave() {
        let bridge = spawn_dispatcher();

        let mut handles = Vec::new();
        for i in 0..32 {
            let bridge = bridge.clone();
            handles.push(tokio::spawn(async move {
                bridge
                    .submit(
                        move |log| {
                            log.push(format!("start {}", i));
                            log.push(format!("end {}", i));
                            i * 2
                        },
                        SubmitOptions::default(),
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results.sort();
        assert_eq!(results, (0..32).map(|i| i * 2).collect::<Vec<_>>());

        let log = entries(&bridge).await;
        assert_eq!(log.len(), 64);
        for pair in log.chunks(2) {
            let id = pair[0].trim_start_matches("start ");
            assert_eq!(pair[1], format!("end {}", id));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_immediate_runs_before_queued_deferred() {
        let bridge = spawn_dispatcher();
        let gate = block_interpreter(&bridge);

        bridge.post(|log| log.push("deferred")).unwrap();
        let mut immediate = tokio_test::task::spawn(bridge.submit(
            |log| log.push("immediate"),
            SubmitOptions::immediate(),
        ));
        assert!(immediate.poll().is_pending());

        gate.send(()).unwrap();
        immediate.await.unwrap();

        assert_eq!(
            entries(&bridge).await,
            vec!["blocker", "immediate", "deferred"]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_before_start_drops_task() {
        let bridge = spawn_dispatcher();
        let gate = block_interpreter(&bridge);

        let token = CancellationToken::new();
        let mut queued = tokio_test::task::spawn(bridge.submit(
            |log| log.push("cancelled task"),
            SubmitOptions::default().with_cancel(token.clone()),
        ));
        assert!(queued.poll().is_pending());

        token.cancel();
        assert_eq!(queued.await, Err(BridgeError::Cancelled));

        gate.send(()).unwrap();
        assert_eq!(entries(&bridge).await, vec!["blocker"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_after_start_is_advisory() {
        let bridge = spawn_dispatcher();
        let (started_tx, started_rx) = std_mpsc::channel();
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let bridge = bridge.clone();
            let token = token.clone();
            async move {
                bridge
                    .submit(
                        move |_log| {
                            started_tx.send(()).unwrap();
                            gate_rx.recv_timeout(Duration::from_secs(10)).unwrap();
                            "finished"
                        },
                        SubmitOptions::default().with_cancel(token),
                    )
                    .await
            }
        });

        tokio::task::spawn_blocking(move || started_rx.recv_timeout(Duration::from_secs(10)))
            .await
            .unwrap()
            .unwrap();
        token.cancel();
        gate_tx.send(()).unwrap();

        assert_eq!(task.await.unwrap(), Ok("finished"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panic_is_returned_and_thread_survives() {
        let bridge = spawn_dispatcher();

        let result: Result<(), _> = bridge
            .submit(|_log| panic!("boom"), SubmitOptions::default())
            .await;
        assert_eq!(result, Err(BridgeError::TaskPanicked("boom".to_string())));

        bridge.post(|_log| panic!("posted boom")).unwrap();
        let value = bridge
            .submit(|_log| 7, SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nested_submission_runs_inline() {
        let bridge = spawn_dispatcher();
        let inner = bridge.clone();

        let value = bridge
            .submit(
                move |log| {
                    log.push("outer");
                    let nested = inner
                        .submit_blocking(
                            |log| {
                                log.push("inner");
                                1
                            },
                            true,
                        )
                        .unwrap();
                    nested + 1
                },
                SubmitOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(entries(&bridge).await, vec!["outer", "inner"]);
    }

    #[test]
    fn test_dropped_dispatcher_reports_terminated() {
        let (bridge, dispatcher) = channel::<Log>();
        drop(dispatcher);

        assert_eq!(
            bridge.submit_blocking(|_log| (), false),
            Err(BridgeError::Terminated)
        );
        assert_eq!(bridge.post(|_log| ()), Err(BridgeError::Terminated));
    }
}
