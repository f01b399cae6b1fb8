// Job Ticket - the caller's side of a job's completion slot

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use crate::domain::{JobError, JobId, JobResult};

/// Resolves exactly once with the job's outcome
///
/// A slot dropped without being fulfilled (supervisor or scheduler gone)
/// resolves as `JobError::Killed`.
#[derive(Debug)]
pub struct JobTicket {
    id: JobId,
    rx: oneshot::Receiver<JobResult>,
}

impl JobTicket {
    pub(crate) fn new(id: JobId, rx: oneshot::Receiver<JobResult>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for JobTicket {
    type Output = JobResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(JobError::Killed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Job, JobRequest};
    use serde_json::json;

    #[tokio::test]
    async fn test_ticket_yields_outcome() {
        let (job, rx) = Job::new("9".to_string(), JobRequest::default());
        let ticket = JobTicket::new(job.id.clone(), rx);
        assert_eq!(ticket.id(), "9");
        job.complete(Ok(json!("done")));
        assert_eq!(ticket.await, Ok(json!("done")));
    }

    #[tokio::test]
    async fn test_dropped_slot_resolves_killed() {
        let (job, rx) = Job::new("10".to_string(), JobRequest::default());
        let ticket = JobTicket::new(job.id.clone(), rx);
        drop(job);
        assert_eq!(ticket.await, Err(JobError::Killed));
    }
}
