// Job Domain Model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio::sync::oneshot;

use super::error::{JobError, JobResult};

/// Job ID (correlation only, unique within one supervisor)
pub type JobId = String;

/// Message returned for a `libraries` field of the wrong shape
pub const LIBRARIES_SHAPE_ERROR: &str = "Libraries must be defined by an array or by an object.";

/// Library modules to bind into the execution scope
///
/// List form binds each module under its own name, map form binds
/// `variable -> module`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Libraries {
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

impl Libraries {
    /// `(variable, module)` pairs in binding order
    pub fn bindings(&self) -> Vec<(&str, &str)> {
        match self {
            Libraries::List(names) => names.iter().map(|n| (n.as_str(), n.as_str())).collect(),
            Libraries::Map(map) => map.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
        }
    }
}

impl TryFrom<Value> for Libraries {
    type Error = JobError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let shape_error = || JobError::Request(LIBRARIES_SHAPE_ERROR.to_string());
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    _ => Err(shape_error()),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Libraries::List),
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => Ok((k, s)),
                    _ => Err(shape_error()),
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Libraries::Map),
            _ => Err(shape_error()),
        }
    }
}

/// What a caller submits: the variables visible to the snippet plus optional libraries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libraries: Option<Libraries>,
}

impl JobRequest {
    pub fn new(context: Map<String, Value>) -> Self {
        Self {
            context,
            libraries: None,
        }
    }

    pub fn with_libraries(mut self, libraries: Libraries) -> Self {
        self.libraries = Some(libraries);
        self
    }

    /// Build a request from untyped JSON (`{context, libraries}`)
    ///
    /// Shape errors are local: they are reported here and never reach a worker.
    pub fn from_value(value: Value) -> Result<Self, JobError> {
        let mut object = match value {
            Value::Object(object) => object,
            Value::Null => Map::new(),
            _ => {
                return Err(JobError::Request(
                    "Job request must be a JSON object".to_string(),
                ))
            }
        };

        let context = match object.remove("context") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(context)) => context,
            Some(_) => {
                return Err(JobError::Request(
                    "Context must be a JSON object".to_string(),
                ))
            }
        };

        let libraries = match object.remove("libraries") {
            None | Some(Value::Null) => None,
            Some(value) => Some(Libraries::try_from(value)?),
        };

        Ok(Self { context, libraries })
    }
}

/// A submitted unit of work with its single-use completion slot
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub request: JobRequest,
    completion: oneshot::Sender<JobResult>,
}

impl Job {
    pub fn new(id: JobId, request: JobRequest) -> (Self, oneshot::Receiver<JobResult>) {
        let (completion, rx) = oneshot::channel();
        (
            Self {
                id,
                request,
                completion,
            },
            rx,
        )
    }

    /// Fulfil the completion slot; consuming `self` makes a second call impossible
    pub fn complete(self, outcome: JobResult) {
        // Receiver may already be gone (caller dropped its ticket)
        let _ = self.completion.send(outcome);
    }

    /// True once the caller has dropped its ticket
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }
}
