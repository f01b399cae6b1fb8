//! Supervisor - runs jobs against one sandbox worker, one at a time
//!
//! The handle is cheap to clone; all state transitions happen on a single
//! supervisor task that reacts to discrete events:
//! - commands from handles (run, kill)
//! - messages and the exit of the current worker incarnation
//! - the job's wall-clock deadline
//! - heartbeat ticks that trigger memory sampling
//!
//! Every job resolves exactly once, from exactly one of: a worker reply, a
//! preparation short-circuit, a timeout, a memory violation, or a crash.
//! After any termination a new worker incarnation is launched, unless the
//! supervisor was killed with `no_restart`.

mod actor;
pub mod constants;
mod ticket;

#[cfg(test)]
mod supervisor_test;

pub use ticket::JobTicket;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::config::SupervisorOptions;
use crate::domain::{Job, JobError, JobId, JobRequest, JobResult};
use crate::error::{AppError, Result};
use crate::port::{IdProvider, ResourceSampler, SequentialIdProvider, WorkerLauncher};
use actor::{Command, SupervisorActor};
use constants::EVENT_CHANNEL_CAPACITY;

/// Lifecycle of a supervisor as seen by callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    /// No job outstanding; accepting work
    Idle,
    /// Exactly one job outstanding
    Busy(JobId),
    /// Previous worker gone, next one being launched
    Restarting,
    /// Killed without restart; rejects all work
    Stopped,
}

/// Notifications for external observers
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// A job finished, successfully or not
    Result { job_id: JobId, outcome: JobResult },
    /// The worker exited unexpectedly or was killed for a limit
    Failed { reason: JobError },
    /// Back to idle; the scheduler's dispatch trigger
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Busy(JobId),
    Restarting,
    Killed,
}

/// A job handed back by `Supervisor::run`; its completion slot never fired
#[derive(Debug)]
pub struct Rejection {
    pub job: Job,
    pub reason: RejectReason,
}

impl From<Rejection> for AppError {
    fn from(rejection: Rejection) -> Self {
        match rejection.reason {
            RejectReason::Busy(id) => AppError::Busy(id),
            RejectReason::Restarting => AppError::Restarting,
            RejectReason::Killed => AppError::Killed,
        }
    }
}

/// State visible to handles without a round-trip to the supervisor task
#[derive(Debug)]
pub(crate) struct Shared {
    state: SupervisorState,
    pid: Option<u32>,
}

impl Shared {
    /// `Stopped` is terminal
    pub(crate) fn set_state(&mut self, state: SupervisorState) {
        if self.state != SupervisorState::Stopped {
            self.state = state;
        }
    }
}

pub(crate) fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a supervisor task
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Mutex<Shared>>,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SupervisorEvent>,
    ids: Arc<dyn IdProvider>,
    options: SupervisorOptions,
}

impl Supervisor {
    /// Create a supervisor for `code` and spawn its task
    ///
    /// The first worker is launched lazily by the first job.
    /// Must be called inside a tokio runtime.
    pub fn new(
        code: impl Into<String>,
        options: SupervisorOptions,
        launcher: Arc<dyn WorkerLauncher>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Result<Self> {
        Self::with_id_provider(
            code,
            options,
            launcher,
            sampler,
            Arc::new(SequentialIdProvider::new()),
        )
    }

    pub fn with_id_provider(
        code: impl Into<String>,
        options: SupervisorOptions,
        launcher: Arc<dyn WorkerLauncher>,
        sampler: Arc<dyn ResourceSampler>,
        ids: Arc<dyn IdProvider>,
    ) -> Result<Self> {
        options.validate()?;

        let shared = Arc::new(Mutex::new(Shared {
            state: SupervisorState::Idle,
            pid: None,
        }));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let actor = SupervisorActor::new(
            code.into(),
            options.clone(),
            launcher,
            sampler,
            Arc::clone(&shared),
            events.clone(),
            commands_rx,
        );
        tokio::spawn(actor.run());

        Ok(Self {
            shared,
            commands: commands_tx,
            events,
            ids,
            options,
        })
    }

    /// Allocate an id and completion slot for `request`
    pub fn prepare(&self, request: JobRequest) -> (Job, JobTicket) {
        let id = self.ids.generate_id();
        let (job, rx) = Job::new(id.clone(), request);
        (job, JobTicket::new(id, rx))
    }

    /// Start `job` if the supervisor is idle
    ///
    /// A rejected job is handed back untouched; its completion slot has not fired.
    pub fn run(&self, job: Job) -> std::result::Result<(), Rejection> {
        {
            let mut shared = lock(&self.shared);
            let reason = match &shared.state {
                SupervisorState::Idle => None,
                SupervisorState::Busy(id) => Some(RejectReason::Busy(id.clone())),
                SupervisorState::Restarting => Some(RejectReason::Restarting),
                SupervisorState::Stopped => Some(RejectReason::Killed),
            };
            if let Some(reason) = reason {
                debug!(job_id = %job.id, reason = ?reason, "Job rejected");
                return Err(Rejection { job, reason });
            }
            shared.state = SupervisorState::Busy(job.id.clone());
        }

        if let Err(mpsc::error::SendError(Command::Run(job))) =
            self.commands.send(Command::Run(job))
        {
            // Supervisor task is gone
            lock(&self.shared).state = SupervisorState::Stopped;
            return Err(Rejection {
                job,
                reason: RejectReason::Killed,
            });
        }
        Ok(())
    }

    /// Prepare and run `request` in one step
    pub fn submit(&self, request: JobRequest) -> Result<JobTicket> {
        let (job, ticket) = self.prepare(request);
        self.run(job)?;
        Ok(ticket)
    }

    /// Terminate the current worker
    ///
    /// With `no_restart` the supervisor stops for good: an outstanding job
    /// resolves as `Killed` and no worker is relaunched. Otherwise this is
    /// treated like any other worker termination, and an idle supervisor
    /// rejects work as `Restarting` until the replacement is launched.
    pub fn kill(&self, no_restart: bool) {
        {
            let mut shared = lock(&self.shared);
            if no_restart {
                shared.set_state(SupervisorState::Stopped);
            } else if shared.state == SupervisorState::Idle {
                shared.set_state(SupervisorState::Restarting);
            }
        }
        // Task already gone means there is nothing left to kill
        let _ = self.commands.send(Command::Kill { no_restart });
    }

    pub fn state(&self) -> SupervisorState {
        lock(&self.shared).state.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.state() == SupervisorState::Idle
    }

    /// PID of the current worker incarnation, if one is running
    pub fn worker_pid(&self) -> Option<u32> {
        lock(&self.shared).pid
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }
}
