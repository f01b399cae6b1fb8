// Subprocess worker launcher
// reason: tokio::process for async stdio, nix for SIGTERM on unix
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use pitboss_core::port::{
    ChannelError, ExitInfo, KillMode, LaunchError, WorkerChannel, WorkerEvent, WorkerHandle,
    WorkerLauncher,
};
use pitboss_core::protocol::{encode_line, InitMessage, SupervisorMessage, WorkerMessage};

/// Environment passed through to workers unless configured otherwise
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &["PATH", "RUST_LOG", "PITBOSS_LOG_FORMAT", "SYSTEMROOT"];

/// How long an exited worker's stdout may keep draining
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Program and environment for worker processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Variables copied from the supervisor's environment; everything else is cleared
    pub env_allowlist: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            current_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env_allowlist(mut self, allowlist: Vec<String>) -> Self {
        self.env_allowlist = allowlist;
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Filter environment variables to the allowlist only
    fn filter_env<I>(&self, env: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        env.into_iter()
            .filter(|(k, _)| self.env_allowlist.contains(k))
            .collect()
    }
}

/// Launches each worker incarnation as a child process speaking
/// line-delimited JSON over stdin/stdout
pub struct SubprocessLauncher {
    command: WorkerCommand,
}

impl SubprocessLauncher {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    fn spawn(&self) -> Result<Child, LaunchError> {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .env_clear()
            .envs(self.command.filter_env(std::env::vars()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.command.current_dir {
            command.current_dir(dir);
        }

        command.spawn().map_err(|e| {
            LaunchError::SpawnFailed(format!("{}: {}", self.command.program.display(), e))
        })
    }
}

#[async_trait]
impl WorkerLauncher for SubprocessLauncher {
    async fn launch(&self, init: InitMessage) -> Result<WorkerChannel, LaunchError> {
        let mut child = self.spawn()?;
        let pid = child.id();
        let stdin = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(LaunchError::MissingPipe("stderr"))?;

        info!(
            program = %self.command.program.display(),
            pid = ?pid,
            "Worker process spawned"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_lines(stdin, lines_rx, pid));
        tokio::spawn(forward_stderr(stderr, pid));
        let reader = tokio::spawn(read_messages(stdout, events_tx.clone(), pid));
        tokio::spawn(wait_for_exit(child, kill_rx, reader, events_tx, pid));

        let handle = SubprocessHandle {
            pid,
            lines: lines_tx,
            kill: kill_tx,
        };
        // On failure the handle drops here, which kills the child
        handle
            .send(&SupervisorMessage::Init(init))
            .map_err(|e| LaunchError::Init(e.to_string()))?;

        Ok(WorkerChannel {
            handle: Box::new(handle),
            events: events_rx,
        })
    }
}

struct SubprocessHandle {
    pid: Option<u32>,
    lines: mpsc::UnboundedSender<String>,
    kill: mpsc::UnboundedSender<KillMode>,
}

impl WorkerHandle for SubprocessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn send(&self, message: &SupervisorMessage) -> Result<(), ChannelError> {
        let line = encode_line(message).map_err(|e| ChannelError::Encode(e.to_string()))?;
        self.lines.send(line).map_err(|_| ChannelError::Closed)
    }

    fn kill(&self, mode: KillMode) -> Result<(), ChannelError> {
        self.kill.send(mode).map_err(|_| ChannelError::Closed)
    }
}

async fn write_lines(
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
    pid: Option<u32>,
) {
    while let Some(line) = lines.recv().await {
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!(pid = ?pid, error = %e, "Worker stdin closed");
            break;
        }
    }
}

async fn read_messages(
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<WorkerEvent>,
    pid: Option<u32>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkerMessage>(line) {
                    Ok(message) => {
                        trace!(pid = ?pid, message = ?message, "Worker message");
                        // Receiver gone means the incarnation was detached
                        let _ = events.send(WorkerEvent::Message(message));
                    }
                    Err(e) => warn!(pid = ?pid, error = %e, line, "Unparseable worker output"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(pid = ?pid, error = %e, "Worker stdout read failed");
                break;
            }
        }
    }
}

async fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(pid = ?pid, "worker: {}", line);
    }
}

/// Owns the child: applies kill requests and reports the exit last
async fn wait_for_exit(
    mut child: Child,
    mut kill_rx: mpsc::UnboundedReceiver<KillMode>,
    reader: JoinHandle<()>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    pid: Option<u32>,
) {
    let mut detached = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = kill_rx.recv(), if !detached => match request {
                Some(mode) => signal_child(&mut child, mode, pid),
                None => {
                    // Handle dropped: nobody can observe this process any more
                    detached = true;
                    signal_child(&mut child, KillMode::Force, pid);
                }
            },
        }
    };

    // Replies written before exit are delivered ahead of the exit report
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
        debug!(pid = ?pid, "Worker stdout still open after exit; not waiting");
    }

    let exit = match status {
        Ok(status) => exit_info(status),
        Err(e) => {
            warn!(pid = ?pid, error = %e, "Failed to wait for worker");
            ExitInfo::default()
        }
    };
    debug!(pid = ?pid, code = ?exit.code, signal = ?exit.signal, "Worker process exited");
    let _ = events.send(WorkerEvent::Exited(exit));
}

fn signal_child(child: &mut Child, mode: KillMode, pid: Option<u32>) {
    match mode {
        KillMode::Terminate => terminate(child, pid),
        KillMode::Force => {
            if let Err(e) = child.start_kill() {
                debug!(pid = ?pid, error = %e, "Force kill failed; worker already gone?");
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        debug!(pid = ?pid, "Worker already reaped; nothing to terminate");
        return;
    };
    info!(pid = raw, "Sending SIGTERM to worker");
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        warn!(pid = raw, error = %e, "SIGTERM failed; force killing");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, pid: Option<u32>) {
    info!(pid = ?pid, "Terminating worker");
    if let Err(e) = child.start_kill() {
        debug!(pid = ?pid, error = %e, "Terminate failed; worker already gone?");
    }
}

#[cfg(unix)]
fn exit_info(status: ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;
    ExitInfo {
        code: status.code(),
        signal: status.signal(),
    }
}

#[cfg(not(unix))]
fn exit_info(status: ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        signal: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    #[test]
    fn test_env_filtering() {
        let command = WorkerCommand::new("worker")
            .with_env_allowlist(vec!["ALLOWED_VAR".to_string()]);

        let env = vec![
            ("ALLOWED_VAR".to_string(), "value1".to_string()),
            ("BLOCKED_VAR".to_string(), "value2".to_string()),
        ];
        let filtered = command.filter_env(env);

        assert_eq!(filtered, vec![("ALLOWED_VAR".to_string(), "value1".to_string())]);
    }

    #[test]
    fn test_default_allowlist_keeps_path() {
        let command = WorkerCommand::new("worker").with_args(["--quiet"]);
        assert!(command.env_allowlist.iter().any(|k| k == "PATH"));
        assert_eq!(command.args, vec!["--quiet".to_string()]);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let launcher = SubprocessLauncher::new(WorkerCommand::new("/nonexistent/pitboss-worker"));
        let result = launcher
            .launch(InitMessage {
                code: "data".to_string(),
                timeout: None,
            })
            .await;
        assert!(matches!(result, Err(LaunchError::SpawnFailed(_))));
    }

    #[cfg(unix)]
    fn shell_worker(script: &str) -> SubprocessLauncher {
        SubprocessLauncher::new(WorkerCommand::new("sh").with_args(["-c", script]))
    }

    #[cfg(unix)]
    async fn launch_with(launcher: &SubprocessLauncher, timeout: Option<u64>) -> WorkerChannel {
        assert_ok!(
            launcher
                .launch(InitMessage {
                    code: "data".to_string(),
                    timeout,
                })
                .await
        )
    }

    #[cfg(unix)]
    async fn next(channel: &mut WorkerChannel) -> WorkerEvent {
        timeout(Duration::from_secs(5), channel.events.recv())
            .await
            .expect("worker event timed out")
            .expect("event stream closed")
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_messages_then_exit_in_order() {
        let launcher = shell_worker(
            r#"read init; echo '{"type":"ready"}'; echo 'not json'; echo '{"type":"result","result":7,"id":"1"}'; exit 3"#,
        );
        let mut channel = launch_with(&launcher, Some(600)).await;
        assert!(channel.handle.pid().is_some());

        assert_eq!(next(&mut channel).await, WorkerEvent::Message(WorkerMessage::Ready));
        assert_eq!(
            next(&mut channel).await,
            WorkerEvent::Message(WorkerMessage::result("1", Some(serde_json::json!(7))))
        );
        assert_eq!(
            next(&mut channel).await,
            WorkerEvent::Exited(ExitInfo {
                code: Some(3),
                signal: None
            })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_force_kill_reports_signal() {
        let launcher = shell_worker(r#"read init; echo '{"type":"ready"}'; exec sleep 30"#);
        let mut channel = launch_with(&launcher, None).await;
        assert_eq!(next(&mut channel).await, WorkerEvent::Message(WorkerMessage::Ready));

        assert_ok!(channel.handle.kill(KillMode::Force));
        assert_eq!(
            next(&mut channel).await,
            WorkerEvent::Exited(ExitInfo {
                code: None,
                signal: Some(9)
            })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_sends_sigterm() {
        let launcher = shell_worker(r#"read init; echo '{"type":"ready"}'; exec sleep 30"#);
        let mut channel = launch_with(&launcher, None).await;
        assert_eq!(next(&mut channel).await, WorkerEvent::Message(WorkerMessage::Ready));

        assert_ok!(channel.handle.kill(KillMode::Terminate));
        assert_eq!(
            next(&mut channel).await,
            WorkerEvent::Exited(ExitInfo {
                code: None,
                signal: Some(15)
            })
        );
    }
}
