// Worker Process Port
// Abstraction over one sandbox subprocess and its ordered message channel

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{InitMessage, SupervisorMessage, WorkerMessage};

/// How hard to ask the worker to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    /// Polite termination request (SIGTERM on unix)
    Terminate,
    /// Non-catchable kill, used when enforcing limits
    Force,
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Everything a worker incarnation can report
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(WorkerMessage),
    /// Always the last event of an incarnation
    Exited(ExitInfo),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Missing stdio pipe: {0}")]
    MissingPipe(&'static str),

    #[error("Init message could not be sent: {0}")]
    Init(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Worker channel closed")]
    Closed,

    #[error("Message encoding failed: {0}")]
    Encode(String),
}

/// Handle to a live worker incarnation
///
/// Dropping the handle detaches it: the process is killed and its remaining
/// events go nowhere.
pub trait WorkerHandle: Send {
    /// OS process id, if the process is still known
    fn pid(&self) -> Option<u32>;

    /// Queue a message for the worker (non-blocking, order preserving)
    fn send(&self, message: &SupervisorMessage) -> Result<(), ChannelError>;

    /// Request termination; completion is observed as `WorkerEvent::Exited`
    fn kill(&self, mode: KillMode) -> Result<(), ChannelError>;
}

/// A freshly launched incarnation: its handle plus its private event stream
pub struct WorkerChannel {
    pub handle: Box<dyn WorkerHandle>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

/// Starts worker incarnations
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Spawn a worker and send it `init` as its first message
    ///
    /// # Errors
    /// - LaunchError::SpawnFailed if the process cannot be started
    async fn launch(&self, init: InitMessage) -> Result<WorkerChannel, LaunchError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::protocol::{ErrorKind, JobMessage};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Mock script executor behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Reply with `context.data` (or null)
        Echo,
        /// Echo after a delay
        Delayed(Duration),
        /// Never reply
        Hang,
        /// Fail preparation; every job echoes the message
        Fatal(String),
        /// Send a reply with a foreign id before the real one
        StaleThenEcho,
        /// Fail every job at run time
        Fail(String),
    }

    #[derive(Default)]
    struct Counters {
        launches: AtomicUsize,
        jobs: AtomicUsize,
        kills: AtomicUsize,
        pending_launch_failures: AtomicUsize,
    }

    /// Mock WorkerLauncher simulating the script executor in-process
    #[derive(Clone)]
    pub struct MockWorkerLauncher {
        behavior: Arc<Mutex<MockBehavior>>,
        counters: Arc<Counters>,
        current: Arc<Mutex<Option<mpsc::UnboundedSender<WorkerEvent>>>>,
        inits: Arc<Mutex<Vec<InitMessage>>>,
    }

    impl MockWorkerLauncher {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Arc::new(Mutex::new(behavior)),
                counters: Arc::new(Counters::default()),
                current: Arc::new(Mutex::new(None)),
                inits: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn new_echo() -> Self {
            Self::new(MockBehavior::Echo)
        }

        pub fn set_behavior(&self, behavior: MockBehavior) {
            *self.behavior.lock().unwrap_or_else(PoisonError::into_inner) = behavior;
        }

        /// Make the next `count` launches fail
        pub fn fail_next_launches(&self, count: usize) {
            self.counters
                .pending_launch_failures
                .store(count, Ordering::SeqCst);
        }

        pub fn launches(&self) -> usize {
            self.counters.launches.load(Ordering::SeqCst)
        }

        pub fn jobs_sent(&self) -> usize {
            self.counters.jobs.load(Ordering::SeqCst)
        }

        pub fn kills(&self) -> usize {
            self.counters.kills.load(Ordering::SeqCst)
        }

        pub fn inits(&self) -> Vec<InitMessage> {
            self.inits
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Simulate the current worker dying out-of-band
        pub fn crash_current(&self) {
            if let Some(tx) = self
                .current
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
            {
                let _ = tx.send(WorkerEvent::Exited(ExitInfo {
                    code: None,
                    signal: Some(9),
                }));
            }
        }
    }

    #[async_trait]
    impl WorkerLauncher for MockWorkerLauncher {
        async fn launch(&self, init: InitMessage) -> Result<WorkerChannel, LaunchError> {
            let failures = &self.counters.pending_launch_failures;
            if failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(LaunchError::SpawnFailed("mock launch failure".to_string()));
            }

            let generation = self.counters.launches.fetch_add(1, Ordering::SeqCst) + 1;
            self.inits
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(init);

            let (tx, rx) = mpsc::unbounded_channel();
            let behavior = self
                .behavior
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let MockBehavior::Fatal(msg) = &behavior {
                let _ = tx.send(WorkerEvent::Message(WorkerMessage::error(
                    ErrorKind::Preparation,
                    msg.clone(),
                    None,
                )));
            }
            let _ = tx.send(WorkerEvent::Message(WorkerMessage::Ready));
            *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx.clone());

            let handle = MockWorkerHandle {
                pid: 40_000 + generation as u32,
                tx,
                behavior: Arc::clone(&self.behavior),
                counters: Arc::clone(&self.counters),
                exited: Arc::new(AtomicBool::new(false)),
            };
            Ok(WorkerChannel {
                handle: Box::new(handle),
                events: rx,
            })
        }
    }

    struct MockWorkerHandle {
        pid: u32,
        tx: mpsc::UnboundedSender<WorkerEvent>,
        behavior: Arc<Mutex<MockBehavior>>,
        counters: Arc<Counters>,
        exited: Arc<AtomicBool>,
    }

    impl MockWorkerHandle {
        fn reply(&self, job: &JobMessage) {
            let behavior = self
                .behavior
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let echo = WorkerMessage::result(job.id.clone(), job.context.get("data").cloned());
            let reply = |msg: WorkerMessage| {
                let _ = self.tx.send(WorkerEvent::Message(msg));
            };
            match behavior {
                MockBehavior::Echo => reply(echo),
                MockBehavior::Delayed(delay) => {
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(WorkerEvent::Message(echo));
                    });
                }
                MockBehavior::Hang => {}
                MockBehavior::Fatal(msg) => reply(WorkerMessage::error(
                    ErrorKind::Preparation,
                    msg,
                    Some(job.id.clone()),
                )),
                MockBehavior::StaleThenEcho => {
                    reply(WorkerMessage::result("stale", Some(Value::from("wrong"))));
                    reply(echo);
                }
                MockBehavior::Fail(msg) => reply(WorkerMessage::error(
                    ErrorKind::Execution,
                    msg,
                    Some(job.id.clone()),
                )),
            }
        }
    }

    impl WorkerHandle for MockWorkerHandle {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn send(&self, message: &SupervisorMessage) -> Result<(), ChannelError> {
            if self.exited.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            if let SupervisorMessage::Job(job) = message {
                self.counters.jobs.fetch_add(1, Ordering::SeqCst);
                self.reply(job);
            }
            Ok(())
        }

        fn kill(&self, _mode: KillMode) -> Result<(), ChannelError> {
            self.counters.kills.fetch_add(1, Ordering::SeqCst);
            if !self.exited.swap(true, Ordering::SeqCst) {
                let _ = self.tx.send(WorkerEvent::Exited(ExitInfo {
                    code: None,
                    signal: Some(15),
                }));
            }
            Ok(())
        }
    }
}
