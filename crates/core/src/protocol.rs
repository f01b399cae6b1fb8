//! Supervisor <-> worker wire protocol
//!
//! One JSON object per line, tagged by `type`:
//! - supervisor -> worker: `init` once per incarnation, then `job` messages
//! - worker -> supervisor: `ready` once after `init`, then one `result` or
//!   `error` per job
//!
//! Payloads are plain JSON values; nothing executable crosses the channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{JobError, JobId};

/// First message of every incarnation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitMessage {
    pub code: String,
    /// Engine-side timeout hint in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// One unit of work for the worker
///
/// `context` and `libraries` stay untyped on the wire so the worker can
/// report malformed shapes itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub libraries: Value,
    pub id: JobId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SupervisorMessage {
    Init(InitMessage),
    Job(JobMessage),
}

/// Classification carried by `error` replies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Code could not be prepared; sticky for the incarnation
    Preparation,
    /// The snippet failed at run time
    #[default]
    Execution,
    /// The job itself was malformed
    Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    Ready,
    Result {
        #[serde(default)]
        result: Value,
        id: JobId,
    },
    Error {
        error: String,
        #[serde(default)]
        id: Option<JobId>,
        #[serde(default)]
        kind: ErrorKind,
    },
}

impl WorkerMessage {
    pub fn result(id: impl Into<JobId>, result: Option<Value>) -> Self {
        // "no return value" is an explicit null, distinct from "not replied"
        WorkerMessage::Result {
            result: result.unwrap_or(Value::Null),
            id: id.into(),
        }
    }

    pub fn error(kind: ErrorKind, error: impl Into<String>, id: Option<JobId>) -> Self {
        WorkerMessage::Error {
            error: error.into(),
            id,
            kind,
        }
    }

    /// Correlation id for replies, `None` for `ready` and id-less errors
    pub fn job_id(&self) -> Option<&str> {
        match self {
            WorkerMessage::Ready => None,
            WorkerMessage::Result { id, .. } => Some(id),
            WorkerMessage::Error { id, .. } => id.as_deref(),
        }
    }
}

impl ErrorKind {
    pub fn into_job_error(self, message: String) -> JobError {
        match self {
            ErrorKind::Preparation => JobError::Preparation(message),
            ErrorKind::Execution => JobError::Execution(message),
            ErrorKind::Request => JobError::Request(message),
        }
    }
}

/// Encode a message as a single protocol line (newline included)
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shapes() {
        let init = SupervisorMessage::Init(InitMessage {
            code: "data".to_string(),
            timeout: Some(600),
        });
        assert_eq!(
            serde_json::to_value(&init).unwrap(),
            json!({"type": "init", "code": "data", "timeout": 600})
        );

        let job = SupervisorMessage::Job(JobMessage {
            context: json!({"data": 1}),
            libraries: json!(["os"]),
            id: "7".to_string(),
        });
        assert_eq!(
            serde_json::to_value(&job).unwrap(),
            json!({"type": "job", "context": {"data": 1}, "libraries": ["os"], "id": "7"})
        );
    }

    #[test]
    fn test_error_kind_defaults_to_execution() {
        let msg: WorkerMessage =
            serde_json::from_str(r#"{"type":"error","error":"boom","id":"3"}"#).unwrap();
        assert_eq!(
            msg,
            WorkerMessage::error(ErrorKind::Execution, "boom", Some("3".to_string()))
        );
        assert_eq!(msg.job_id(), Some("3"));

        let prep: WorkerMessage =
            serde_json::from_str(r#"{"type":"error","error":"bad","id":null,"kind":"preparation"}"#)
                .unwrap();
        assert_eq!(prep.job_id(), None);
    }

    #[test]
    fn test_missing_result_is_null() {
        assert_eq!(
            WorkerMessage::result("1", None),
            WorkerMessage::Result {
                result: Value::Null,
                id: "1".to_string()
            }
        );
        let line = encode_line(&WorkerMessage::Ready).unwrap();
        assert_eq!(line, "{\"type\":\"ready\"}\n");
    }
}
