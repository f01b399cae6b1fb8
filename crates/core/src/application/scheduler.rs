//! Scheduler - FIFO queue in front of one supervisor
//!
//! Callers submit at any concurrency; the queue head is dispatched whenever
//! the supervisor is idle. Dispatch is retried on every `Completed` event, so
//! jobs run strictly one at a time in submission order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::application::supervisor::{
    JobTicket, RejectReason, Supervisor, SupervisorEvent,
};
use crate::domain::{Job, JobRequest};

enum SchedulerCommand {
    Submit(Job),
    Kill,
}

/// Queueing front-end for a supervisor
pub struct Scheduler {
    commands: mpsc::UnboundedSender<SchedulerCommand>,
    supervisor: Supervisor,
    pending: Arc<AtomicUsize>,
}

impl Scheduler {
    /// Wrap `supervisor` and spawn the dispatch task (requires a tokio runtime)
    pub fn new(supervisor: Supervisor) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let dispatcher = Dispatcher {
            queue: VecDeque::new(),
            supervisor: supervisor.clone(),
            events: supervisor.subscribe(),
            commands: commands_rx,
            killed: false,
            pending: Arc::clone(&pending),
        };
        tokio::spawn(dispatcher.run());

        Self {
            commands: commands_tx,
            supervisor,
            pending,
        }
    }

    /// Queue a job; the ticket resolves once it has run
    pub fn submit(&self, request: JobRequest) -> JobTicket {
        let (job, ticket) = self.supervisor.prepare(request);
        // A closed queue drops the job, which resolves the ticket as Killed
        let _ = self.commands.send(SchedulerCommand::Submit(job));
        ticket
    }

    /// Kill the worker for good and stop dispatching
    ///
    /// Jobs still queued are not run; they resolve as `Killed` once the
    /// scheduler is dropped.
    pub fn kill(&self) {
        self.supervisor.kill(true);
        let _ = self.commands.send(SchedulerCommand::Kill);
    }

    /// Jobs waiting for the supervisor (excluding the one running)
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }
}

struct Dispatcher {
    queue: VecDeque<Job>,
    supervisor: Supervisor,
    events: broadcast::Receiver<SupervisorEvent>,
    commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    killed: bool,
    pending: Arc<AtomicUsize>,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SchedulerCommand::Submit(job)) => {
                        debug!(job_id = %job.id, queued = self.queue.len(), "Job queued");
                        self.queue.push_back(job);
                        self.dispatch();
                    }
                    Some(SchedulerCommand::Kill) => {
                        self.killed = true;
                        info!(queued = self.queue.len(), "Scheduler killed; queued jobs will not run");
                    }
                    None => break,
                },
                event = self.events.recv() => match event {
                    Ok(SupervisorEvent::Completed) => self.dispatch(),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Scheduler lagged behind supervisor events");
                        self.dispatch();
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!(dropped = self.queue.len(), "Scheduler stopped");
    }

    fn dispatch(&mut self) {
        if !self.killed {
            while let Some(job) = self.queue.pop_front() {
                if job.is_abandoned() {
                    debug!(job_id = %job.id, "Skipping job whose ticket was dropped");
                    continue;
                }
                if let Err(rejection) = self.supervisor.run(job) {
                    if rejection.reason == RejectReason::Killed {
                        self.killed = true;
                    }
                    self.queue.push_front(rejection.job);
                }
                break;
            }
        }
        self.pending.store(self.queue.len(), Ordering::SeqCst);
    }
}
