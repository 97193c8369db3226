//! Child processes started by `system()`
//!
//! Output is streamed as text events from reader threads. A watcher thread
//! waits for the exit (killing the child when asked) and then posts the exit
//! status back to the interpreter thread.

use std::io::{Read, Write};
use std::process::{ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::events::{AsyncEvent, EventSender};
use crate::interpreter::{ChildCommand, OutputStream};

use super::Session;

const EXIT_POLL: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 4096;

/// Outcome of a finished child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: i32,
    pub killed: bool,
}

/// Interpreter-thread side of a running child
pub struct RunningChild {
    stdin: Option<ChildStdin>,
    kill: Arc<AtomicBool>,
}

impl RunningChild {
    /// Spawn `command`. The exit is reported through `Session::child_exited`
    /// once the child and its output readers are done.
    pub fn spawn(
        command: &ChildCommand,
        events: &EventSender,
        bridge: &Bridge<Session>,
    ) -> std::io::Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(if command.interactive {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        debug!(program = %command.program, pid = child.id(), "Spawned child process");

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward(stdout, OutputStream::Stdout, events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward(stderr, OutputStream::Stderr, events.clone()));
        }
        let stdin = child.stdin.take();

        let kill = Arc::new(AtomicBool::new(false));
        let watcher_kill = kill.clone();
        let bridge = bridge.clone();
        thread::Builder::new()
            .name("tether-child-watcher".to_string())
            .spawn(move || {
                let mut killed = false;
                let code = loop {
                    match child.try_wait() {
                        Ok(Some(status)) => break status.code().unwrap_or(-1),
                        Ok(None) => {
                            if watcher_kill.load(Ordering::SeqCst) && !killed {
                                killed = true;
                                if let Err(err) = child.kill() {
                                    warn!("Failed to kill child process: {}", err);
                                }
                            }
                            thread::sleep(EXIT_POLL);
                        }
                        Err(err) => {
                            warn!("Failed to wait for child process: {}", err);
                            break -1;
                        }
                    }
                };
                for reader in readers {
                    let _ = reader.join();
                }
                let exit = ChildExit { code, killed };
                if bridge.post(move |session| session.child_exited(exit)).is_err() {
                    debug!("Interpreter gone before child exit was reported");
                }
            })?;

        Ok(Self { stdin, kill })
    }

    pub fn accepts_input(&self) -> bool {
        self.stdin.is_some()
    }

    pub fn write_line(&mut self, line: &str) {
        if let Some(stdin) = self.stdin.as_mut() {
            let written = stdin
                .write_all(line.as_bytes())
                .and_then(|_| stdin.write_all(b"\n"))
                .and_then(|_| stdin.flush());
            if let Err(err) = written {
                warn!("Failed to write to child stdin: {}", err);
                self.stdin = None;
            }
        }
    }

    /// Close stdin so the child sees end of input
    pub fn close_input(&mut self) {
        self.stdin = None;
    }

    pub fn kill(&self) {
        self.kill.store(true, Ordering::SeqCst);
    }
}

fn forward(
    mut source: impl Read + Send + 'static,
    stream: OutputStream,
    events: EventSender,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buffer = [0u8; READ_CHUNK];
        loop {
            match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => events.push(AsyncEvent::Text {
                    stream,
                    text: String::from_utf8_lossy(&buffer[..n]).into_owned(),
                }),
                Err(err) => {
                    debug!("Child output closed: {}", err);
                    break;
                }
            }
        }
    })
}
