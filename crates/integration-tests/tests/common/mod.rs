// Shared helpers for end-to-end tests against real worker processes

#![allow(dead_code)]

use pitboss::{JobRequest, JobResult, JobTicket, PitbossConfig, SupervisorOptions, WorkerCommand};
use serde_json::{Map, Value};
use std::time::Duration;

pub fn config(options: SupervisorOptions) -> PitbossConfig {
    PitbossConfig::default()
        .with_options(options)
        .with_worker(WorkerCommand::new(env!("CARGO_BIN_EXE_pitboss-test-worker")))
}

/// Request whose context is the given JSON object
pub fn request(context: Value) -> JobRequest {
    match context {
        Value::Object(map) => JobRequest::new(map),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            JobRequest::new(map)
        }
    }
}

pub async fn outcome(ticket: JobTicket) -> JobResult {
    tokio::time::timeout(Duration::from_secs(15), ticket)
        .await
        .expect("job never resolved")
}
