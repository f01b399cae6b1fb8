//! Worker runtime - per-incarnation protocol state
//!
//! - `init` prepares the code once. A preparation failure is reported
//!   immediately (id-less) and then echoed for every job; the worker still
//!   reports `ready` so the supervisor is never left waiting.
//! - `job` builds a fresh scope from the job's context and libraries and runs
//!   the prepared script in it. Exactly one reply per job.

use serde_json::{Map, Value};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use pitboss_core::domain::Libraries;
use pitboss_core::protocol::{
    encode_line, ErrorKind, InitMessage, JobMessage, SupervisorMessage, WorkerMessage,
};

use crate::engine::ScriptEngine;

pub const NO_CODE_ERROR: &str = "No code to run";
pub const CONTEXT_SHAPE_ERROR: &str = "Context must be an object.";

type Failure = (ErrorKind, String);

pub struct WorkerRuntime<E: ScriptEngine> {
    engine: E,
    script: Option<E::Script>,
    /// Preparation failure; every job of this incarnation reports it
    fatal: Option<String>,
}

impl<E: ScriptEngine> WorkerRuntime<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            script: None,
            fatal: None,
        }
    }

    /// Replies for one supervisor message, in send order
    pub fn handle(&mut self, message: SupervisorMessage) -> Vec<WorkerMessage> {
        match message {
            SupervisorMessage::Init(init) => self.init(init),
            SupervisorMessage::Job(job) => vec![self.run(job)],
        }
    }

    fn init(&mut self, init: InitMessage) -> Vec<WorkerMessage> {
        self.script = None;
        self.fatal = None;

        let mut replies = Vec::with_capacity(2);
        let timeout = init.timeout.map(Duration::from_millis);
        match self.engine.prepare(&init.code, timeout) {
            Ok(script) => {
                debug!(timeout_ms = ?init.timeout, "Code prepared");
                self.script = Some(script);
            }
            Err(e) => {
                let message = format!("Syntax error: {}", e);
                warn!(error = %message, "Code failed to prepare");
                replies.push(WorkerMessage::error(
                    ErrorKind::Preparation,
                    message.clone(),
                    None,
                ));
                self.fatal = Some(message);
            }
        }
        replies.push(WorkerMessage::Ready);
        replies
    }

    fn run(&self, job: JobMessage) -> WorkerMessage {
        let id = job.id.clone();
        match self.execute(job) {
            Ok(result) => WorkerMessage::result(id, result),
            Err((kind, error)) => {
                debug!(job_id = %id, kind = ?kind, error = %error, "Job failed");
                WorkerMessage::error(kind, error, Some(id))
            }
        }
    }

    fn execute(&self, job: JobMessage) -> Result<Option<Value>, Failure> {
        if let Some(fatal) = &self.fatal {
            return Err((ErrorKind::Preparation, fatal.clone()));
        }
        let script = self
            .script
            .as_ref()
            .ok_or_else(|| (ErrorKind::Request, NO_CODE_ERROR.to_string()))?;

        let libraries = match job.libraries {
            Value::Null => None,
            value => Some(
                Libraries::try_from(value).map_err(|e| (ErrorKind::Request, e.to_string()))?,
            ),
        };
        let mut scope = match job.context {
            Value::Object(context) => context,
            Value::Null => Map::new(),
            _ => return Err((ErrorKind::Request, CONTEXT_SHAPE_ERROR.to_string())),
        };

        for (name, module) in libraries.iter().flat_map(Libraries::bindings) {
            let exports = self.engine.load_library(module).map_err(runtime_error)?;
            scope.insert(name.to_string(), exports);
        }

        self.engine.execute(script, scope).map_err(runtime_error)
    }
}

fn runtime_error(e: String) -> Failure {
    (ErrorKind::Execution, format!("Runtime error: {}", e))
}

/// Answer protocol lines from `reader` on `writer` until the supervisor hangs up
///
/// Jobs execute inline; wall-clock limits are the supervisor's business.
pub async fn serve<E, R, W>(runtime: &mut WorkerRuntime<E>, reader: R, mut writer: W) -> io::Result<()>
where
    E: ScriptEngine,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message = match serde_json::from_str::<SupervisorMessage>(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Unparseable supervisor message");
                continue;
            }
        };
        for reply in runtime.handle(message) {
            writer.write_all(encode_line(&reply)?.as_bytes()).await?;
        }
        writer.flush().await?;
    }
    info!("Supervisor closed the channel; exiting");
    Ok(())
}

/// `serve` over the process's own stdin/stdout
pub async fn serve_stdio<E: ScriptEngine>(engine: E) -> io::Result<()> {
    let mut runtime = WorkerRuntime::new(engine);
    serve(
        &mut runtime,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}
