// Supervisor task: the only place supervisor state changes

use serde_json::Value;
use std::future::pending;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::{lock, Shared, SupervisorEvent, SupervisorState};
use crate::config::SupervisorOptions;
use crate::domain::{Job, JobError, JobId, JobResult};
use crate::port::{
    ExitInfo, KillMode, LaunchError, ResourceSampler, SamplerError, WorkerEvent, WorkerHandle,
    WorkerLauncher,
};
use crate::protocol::{ErrorKind, InitMessage, JobMessage, SupervisorMessage, WorkerMessage};

pub(super) enum Command {
    Run(Job),
    Kill { no_restart: bool },
}

/// One spawned worker process and everything known about it
struct Incarnation {
    generation: u64,
    handle: Box<dyn WorkerHandle>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    ready: bool,
    /// Preparation failure; sticky until the next incarnation
    fatal: Option<String>,
    /// A limit kill was issued; replies are no longer trusted
    terminating: bool,
    /// A restartable kill was issued; no new job is sent to it
    restarting: bool,
}

/// The single outstanding job
struct InFlight {
    job: Job,
    sent: bool,
    /// Recorded before a limit kill; reported when the exit arrives
    reason: Option<JobError>,
}

struct SampleReport {
    job_id: JobId,
    pid: u32,
    outcome: Result<Option<u64>, SamplerError>,
}

pub(super) struct SupervisorActor {
    code: String,
    options: SupervisorOptions,
    launcher: Arc<dyn WorkerLauncher>,
    sampler: Arc<dyn ResourceSampler>,
    shared: Arc<Mutex<Shared>>,
    events: broadcast::Sender<SupervisorEvent>,
    commands: mpsc::UnboundedReceiver<Command>,

    incarnation: Option<Incarnation>,
    generation: u64,
    in_flight: Option<InFlight>,

    deadline: Option<Instant>,
    heartbeat: Option<Interval>,
    sampling: Option<JobId>,
    samples_tx: mpsc::UnboundedSender<SampleReport>,
    samples_rx: mpsc::UnboundedReceiver<SampleReport>,
}

impl SupervisorActor {
    pub(super) fn new(
        code: String,
        options: SupervisorOptions,
        launcher: Arc<dyn WorkerLauncher>,
        sampler: Arc<dyn ResourceSampler>,
        shared: Arc<Mutex<Shared>>,
        events: broadcast::Sender<SupervisorEvent>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        Self {
            code,
            options,
            launcher,
            sampler,
            shared,
            events,
            commands,
            incarnation: None,
            generation: 0,
            in_flight: None,
            deadline: None,
            heartbeat: None,
            sampling: None,
            samples_tx,
            samples_rx,
        }
    }

    pub(super) async fn run(mut self) {
        debug!(
            timeout_ms = self.options.timeout_ms,
            memory_limit_kb = self.options.memory_limit_kb,
            heartbeat_tick_ms = self.options.heartbeat_tick_ms,
            sampler = self.sampler.name(),
            "Supervisor started"
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Run(job)) => self.on_run(job).await,
                    Some(Command::Kill { no_restart: true }) => break,
                    Some(Command::Kill { no_restart: false }) => self.on_kill(),
                    // Every handle dropped
                    None => break,
                },
                event = next_event(&mut self.incarnation) => match event {
                    WorkerEvent::Message(message) => self.on_message(message),
                    WorkerEvent::Exited(exit) => self.on_exit(exit).await,
                },
                _ = wait_until(self.deadline) => self.on_timeout(),
                _ = next_tick(&mut self.heartbeat) => self.on_heartbeat(),
                Some(report) = self.samples_rx.recv() => self.on_sample(report),
            }
        }

        self.stop();
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn on_run(&mut self, job: Job) {
        if self.incarnation.is_none() {
            if let Err(e) = self.launch().await {
                error!(job_id = %job.id, error = %e, "Worker launch failed");
                self.complete(job, Err(JobError::Launch(e.to_string())));
                return;
            }
        }

        // Fatal incarnations never see the job
        if let Some(fatal) = self.incarnation.as_ref().and_then(|i| i.fatal.clone()) {
            debug!(job_id = %job.id, "Short-circuiting job on fatal incarnation");
            self.complete(job, Err(JobError::Preparation(fatal)));
            return;
        }

        info!(job_id = %job.id, "Dispatching job");
        self.arm_timers();
        self.in_flight = Some(InFlight {
            job,
            sent: false,
            reason: None,
        });
        self.flush_pending();
    }

    /// Restartable kill: the exit path resolves a job already sent and
    /// relaunches; a job not yet sent moves on to the next incarnation.
    /// Timers stay armed so an ignored terminate still ends in a limit kill.
    fn on_kill(&mut self) {
        match self.incarnation.as_mut() {
            Some(incarnation) => {
                incarnation.restarting = true;
                info!(generation = incarnation.generation, "Killing worker for restart");
                if let Err(e) = incarnation.handle.kill(KillMode::Terminate) {
                    warn!(error = %e, "Kill request failed");
                }
            }
            None => {
                debug!("Kill requested with no worker running");
                let reopened = {
                    let mut shared = lock(&self.shared);
                    let reopen = shared.state == SupervisorState::Restarting;
                    if reopen {
                        shared.set_state(SupervisorState::Idle);
                    }
                    reopen
                };
                if reopened {
                    let _ = self.events.send(SupervisorEvent::Completed);
                }
            }
        }
    }

    /// Terminal shutdown: detach the worker, fail the outstanding job
    fn stop(&mut self) {
        self.disarm_timers();
        if let Some(incarnation) = self.incarnation.take() {
            info!(generation = incarnation.generation, "Supervisor stopped; worker detached");
            if let Err(e) = incarnation.handle.kill(KillMode::Terminate) {
                debug!(error = %e, "Worker already gone");
            }
        }
        {
            let mut shared = lock(&self.shared);
            shared.state = SupervisorState::Stopped;
            shared.pid = None;
        }
        if let Some(flight) = self.in_flight.take() {
            self.complete(flight.job, Err(JobError::Killed));
        }
    }

    // ------------------------------------------------------------------
    // Worker events
    // ------------------------------------------------------------------

    fn on_message(&mut self, message: WorkerMessage) {
        let Some(incarnation) = self.incarnation.as_mut() else {
            return;
        };
        if incarnation.terminating {
            debug!(
                generation = incarnation.generation,
                "Ignoring message from terminating worker"
            );
            return;
        }

        match message {
            WorkerMessage::Ready => {
                incarnation.ready = true;
                debug!(generation = incarnation.generation, "Worker ready");
                self.flush_pending();
            }
            WorkerMessage::Result { result, id } => self.on_reply(&id, Ok(result)),
            WorkerMessage::Error { error, id: Some(id), kind } => {
                self.on_reply(&id, Err(kind.into_job_error(error)))
            }
            WorkerMessage::Error { error, id: None, kind } => {
                if kind == ErrorKind::Preparation || !incarnation.ready {
                    warn!(
                        generation = incarnation.generation,
                        error = %error,
                        "Worker failed to prepare code"
                    );
                    incarnation.fatal = Some(error);
                    return;
                }
                // Id-less failure reported for the job being run
                match self.in_flight.take() {
                    Some(flight) if flight.sent => {
                        self.resolve(flight, Err(kind.into_job_error(error)))
                    }
                    other => {
                        self.in_flight = other;
                        warn!(error = %error, "Ignoring id-less error with no job running");
                    }
                }
            }
        }
    }

    fn on_reply(&mut self, id: &str, outcome: JobResult) {
        match self.in_flight.take() {
            Some(flight) if flight.sent && flight.job.id == id => self.resolve(flight, outcome),
            other => {
                warn!(
                    reply_id = %id,
                    current = ?other.as_ref().map(|f| f.job.id.as_str()),
                    "Ignoring reply with stale or unknown id"
                );
                self.in_flight = other;
            }
        }
    }

    async fn on_exit(&mut self, exit: ExitInfo) {
        let (generation, restarting) = match self.incarnation.take() {
            Some(incarnation) => (Some(incarnation.generation), incarnation.restarting),
            None => (None, false),
        };
        self.disarm_timers();

        let (held, flight) = match self.in_flight.take() {
            Some(f) if restarting && !f.sent && f.reason.is_none() => (Some(f), None),
            other => (None, other),
        };
        let reason = flight
            .as_ref()
            .and_then(|f| f.reason.clone())
            .unwrap_or(JobError::ProcessFailed);

        warn!(
            generation = ?generation,
            code = ?exit.code,
            signal = ?exit.signal,
            job_id = ?flight.as_ref().map(|f| f.job.id.as_str()),
            reason = %reason,
            "Worker exited"
        );
        let _ = self.events.send(SupervisorEvent::Failed {
            reason: reason.clone(),
        });

        self.set_state(SupervisorState::Restarting);
        let launched = self.launch().await;
        if let Err(e) = &launched {
            error!(error = %e, "Worker relaunch failed; next job will retry");
        }

        if let Some(held) = held {
            match launched {
                Ok(()) => {
                    debug!(job_id = %held.job.id, "Moving unsent job to the new worker");
                    self.set_state(SupervisorState::Busy(held.job.id.clone()));
                    self.arm_timers();
                    self.in_flight = Some(held);
                    self.flush_pending();
                }
                Err(e) => self.complete(held.job, Err(JobError::Launch(e.to_string()))),
            }
            return;
        }

        match flight {
            Some(flight) => self.complete(flight.job, Err(reason)),
            None => {
                self.set_state(SupervisorState::Idle);
                let _ = self.events.send(SupervisorEvent::Completed);
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn on_timeout(&mut self) {
        self.deadline = None;
        let Some(flight) = self.in_flight.as_mut() else {
            return;
        };
        flight.reason.get_or_insert(JobError::Timedout);
        warn!(
            job_id = %flight.job.id,
            timeout_ms = self.options.timeout_ms,
            "Job timed out; killing worker"
        );
        self.kill_for_limit();
    }

    fn on_heartbeat(&mut self) {
        if self.sampling.is_some() {
            return;
        }
        let Some(flight) = self.in_flight.as_ref() else {
            return;
        };
        let Some(pid) = self
            .incarnation
            .as_ref()
            .filter(|i| !i.terminating && !i.restarting)
            .and_then(|i| i.handle.pid())
        else {
            return;
        };

        let job_id = flight.job.id.clone();
        self.sampling = Some(job_id.clone());
        let sampler = Arc::clone(&self.sampler);
        let reports = self.samples_tx.clone();
        tokio::spawn(async move {
            let outcome = sampler.sample(pid).await;
            let _ = reports.send(SampleReport {
                job_id,
                pid,
                outcome,
            });
        });
    }

    fn on_sample(&mut self, report: SampleReport) {
        if self.sampling.as_deref() == Some(report.job_id.as_str()) {
            self.sampling = None;
        }
        let limit = self.options.memory_limit_bytes();
        let Some(flight) = self
            .in_flight
            .as_mut()
            .filter(|f| f.job.id == report.job_id)
        else {
            trace!(job_id = %report.job_id, "Discarding sample for finished job");
            return;
        };

        match report.outcome {
            Ok(Some(bytes)) if bytes > limit => {
                flight.reason.get_or_insert(JobError::MemoryExceeded);
                warn!(
                    job_id = %flight.job.id,
                    pid = report.pid,
                    bytes,
                    limit,
                    "Memory limit exceeded; killing worker"
                );
                self.kill_for_limit();
            }
            Ok(Some(bytes)) => trace!(pid = report.pid, bytes, "Memory sample"),
            Ok(None) => debug!(pid = report.pid, "Worker not found by sampler"),
            Err(e) => warn!(
                pid = report.pid,
                sampler = self.sampler.name(),
                error = %e,
                "Process memory usage command failed"
            ),
        }
    }

    fn arm_timers(&mut self) {
        let now = Instant::now();
        self.deadline = Some(now + self.options.timeout());

        let tick = self.options.heartbeat_tick();
        let mut heartbeat = interval_at(now + tick, tick);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);
    }

    fn disarm_timers(&mut self) {
        self.deadline = None;
        self.heartbeat = None;
        self.sampling = None;
    }

    // ------------------------------------------------------------------
    // Worker lifecycle
    // ------------------------------------------------------------------

    async fn launch(&mut self) -> Result<(), LaunchError> {
        // Detach the previous incarnation before anything new can report
        if let Some(old) = self.incarnation.take() {
            let _ = old.handle.kill(KillMode::Force);
        }
        lock(&self.shared).pid = None;

        self.generation += 1;
        let init = InitMessage {
            code: self.code.clone(),
            timeout: Some(self.options.engine_timeout_hint_ms()),
        };
        let channel = self.launcher.launch(init).await?;
        let pid = channel.handle.pid();
        info!(generation = self.generation, pid = ?pid, "Worker launched");

        lock(&self.shared).pid = pid;
        self.incarnation = Some(Incarnation {
            generation: self.generation,
            handle: channel.handle,
            events: channel.events,
            ready: false,
            fatal: None,
            terminating: false,
            restarting: false,
        });
        Ok(())
    }

    /// Send the outstanding job once the worker is ready
    fn flush_pending(&mut self) {
        let Some(incarnation) = self.incarnation.as_ref() else {
            return;
        };
        if !incarnation.ready || incarnation.terminating || incarnation.restarting {
            return;
        }
        let fatal = incarnation.fatal.clone();
        let Some(mut flight) = self.in_flight.take() else {
            return;
        };
        if flight.sent {
            self.in_flight = Some(flight);
            return;
        }
        if let Some(fatal) = fatal {
            debug!(job_id = %flight.job.id, "Short-circuiting job on fatal incarnation");
            self.resolve(flight, Err(JobError::Preparation(fatal)));
            return;
        }

        // The worker gets its own copy; nothing is shared with the caller afterwards
        let request = std::mem::take(&mut flight.job.request);
        let libraries = match request.libraries.map(serde_json::to_value).transpose() {
            Ok(libraries) => libraries.unwrap_or(Value::Null),
            Err(e) => {
                self.resolve(flight, Err(JobError::Request(e.to_string())));
                return;
            }
        };
        let message = SupervisorMessage::Job(JobMessage {
            context: Value::Object(request.context),
            libraries,
            id: flight.job.id.clone(),
        });

        if let Err(e) = incarnation.handle.send(&message) {
            // The exit event that follows resolves the job
            warn!(job_id = %flight.job.id, error = %e, "Failed to send job to worker");
        } else {
            debug!(job_id = %flight.job.id, generation = incarnation.generation, "Job sent");
        }
        flight.sent = true;
        self.in_flight = Some(flight);
    }

    fn kill_for_limit(&mut self) {
        self.heartbeat = None;
        self.sampling = None;
        if let Some(incarnation) = self.incarnation.as_mut() {
            if incarnation.terminating {
                return;
            }
            incarnation.terminating = true;
            if let Err(e) = incarnation.handle.kill(KillMode::Force) {
                warn!(error = %e, "Force kill request failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    fn resolve(&mut self, flight: InFlight, outcome: JobResult) {
        self.disarm_timers();
        self.complete(flight.job, outcome);
    }

    /// Fulfil the job's slot, return to idle and notify observers
    fn complete(&mut self, job: Job, outcome: JobResult) {
        match &outcome {
            Ok(_) => info!(job_id = %job.id, "Job completed"),
            Err(e) => info!(job_id = %job.id, error = %e, "Job failed"),
        }
        self.set_state(SupervisorState::Idle);

        let job_id = job.id.clone();
        job.complete(outcome.clone());
        let _ = self.events.send(SupervisorEvent::Result { job_id, outcome });
        let _ = self.events.send(SupervisorEvent::Completed);
    }

    fn set_state(&self, state: SupervisorState) {
        lock(&self.shared).set_state(state);
    }
}

async fn next_event(incarnation: &mut Option<Incarnation>) -> WorkerEvent {
    match incarnation {
        // A closed stream without an exit report still means the worker is gone
        Some(incarnation) => incarnation
            .events
            .recv()
            .await
            .unwrap_or(WorkerEvent::Exited(ExitInfo::default())),
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => pending().await,
    }
}
