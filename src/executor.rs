use crate::settings::{ExecutorMode, ToolSettings};
use crate::tool_host::{LocalToolHost, SshToolHost, ToolHost, ToolHostError, ToolHostKind};
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How long output readers may lag behind the tool's exit.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpgradeRequest {
    pub task_id: i64,
    pub upgrade_type: String,
    pub work_type: String,
    pub target_address: String,
    pub version_path: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpgradeOutcome {
    Success,
    Failure,
}

/// Shared stop flag for one task. Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum ExecutorEvent {
    Progress(String),
    /// `Err` carries the message of a panic that escaped the executor.
    Finished(Result<UpgradeOutcome, String>),
}

/// Producer side of a task's progress stream.
#[derive(Clone, Debug)]
pub struct ProgressSink {
    tx: Sender<ExecutorEvent>,
}

impl ProgressSink {
    pub fn new(tx: Sender<ExecutorEvent>) -> Self {
        Self { tx }
    }

    /// Emits one progress line. Lines sent after the consumer has gone away
    /// are dropped.
    pub fn emit(&self, line: impl Into<String>) {
        let _ = self.tx.send(ExecutorEvent::Progress(line.into()));
    }
}

/// Boundary to the external device-upgrade tool.
///
/// `execute` blocks for the whole upgrade. Implementations report failures of
/// the tool itself as `UpgradeOutcome::Failure` after emitting a diagnostic
/// line, and should return early once `cancel` is set.
pub trait UpgradeExecutor: Send + Sync {
    fn kind(&self) -> &'static str;

    fn execute(
        &self,
        request: &UpgradeRequest,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> UpgradeOutcome;
}

pub fn tool_argv(program: &str, base_args: &[String], request: &UpgradeRequest) -> Vec<String> {
    let mut argv = Vec::with_capacity(base_args.len() + 9);
    argv.push(program.to_string());
    argv.extend(base_args.iter().cloned());
    argv.push("--upgrade-type".to_string());
    argv.push(request.upgrade_type.clone());
    argv.push("--work-type".to_string());
    argv.push(request.work_type.clone());
    argv.push("--ne-ip".to_string());
    argv.push(request.target_address.clone());
    argv.push("--version-path".to_string());
    argv.push(request.version_path.clone());
    argv
}

/// Picks the executor for the configured mode. An SSH target that fails
/// validation is a start-up error.
pub fn build_executor(
    mode: ExecutorMode,
    tool: &ToolSettings,
) -> Result<Arc<dyn UpgradeExecutor>, ToolHostError> {
    match mode {
        ExecutorMode::DryRun => Ok(Arc::new(DryRunExecutor::new(
            tool.program.clone(),
            tool.base_args.clone(),
            tool.dry_run_step,
        ))),
        ExecutorMode::Command => {
            let host: Box<dyn ToolHost> = match &tool.ssh_target {
                Some(target) => Box::new(SshToolHost::new(target.clone())?),
                None => Box::new(LocalToolHost),
            };
            Ok(Arc::new(CommandExecutor::new(
                host,
                tool.program.clone(),
                tool.base_args.clone(),
                tool.stop_grace,
            )))
        }
    }
}

/// Runs the upgrade CLI as a child process and turns its output lines into
/// progress.
pub struct CommandExecutor {
    host: Box<dyn ToolHost>,
    program: String,
    base_args: Vec<String>,
    stop_grace: Duration,
}

impl CommandExecutor {
    pub fn new(
        host: Box<dyn ToolHost>,
        program: String,
        base_args: Vec<String>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            host,
            program,
            base_args,
            stop_grace,
        }
    }

    fn wait_for_exit(&self, child: &mut Child, cancel: &CancelToken) -> ChildExit {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return ChildExit::Exited(status),
                Ok(None) => {
                    if cancel.is_cancelled() {
                        self.terminate(child);
                        return ChildExit::Cancelled;
                    }
                    thread::sleep(CHILD_POLL_INTERVAL);
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return ChildExit::Lost(err.to_string());
                }
            }
        }
    }

    /// SIGTERM to the tool's process group first so the tool can leave the
    /// device in a sane state, then SIGKILL once the grace period runs out.
    fn terminate(&self, child: &mut Child) {
        let pid = child.id() as libc::pid_t;
        signal_group(pid, libc::SIGTERM);

        let deadline = Instant::now() + self.stop_grace;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            thread::sleep(CHILD_POLL_INTERVAL);
        }

        tracing::warn!(pid, "upgrade tool ignored SIGTERM, killing");
        signal_group(pid, libc::SIGKILL);
        let _ = child.kill();
        let _ = child.wait();
    }

    /// Waits for every output reader to hit EOF. Processes the tool left
    /// behind can keep its pipes open; past the drain window the whole group
    /// is killed and the remaining readers are detached.
    fn drain_output(&self, pid: libc::pid_t, done: &Receiver<()>, readers: usize) {
        let deadline = Instant::now() + OUTPUT_DRAIN;
        for _ in 0..readers {
            match done.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        pid,
                        "upgrade tool left processes holding its output, killing group"
                    );
                    signal_group(pid, libc::SIGKILL);
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

/// The tool runs as the leader of its own group, so the group id is its pid.
fn signal_group(pgid: libc::pid_t, signal: libc::c_int) {
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: the group is already gone.
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, signal, error = %err, "signal-group-failed");
        }
    }
}

enum ChildExit {
    Exited(ExitStatus),
    Cancelled,
    Lost(String),
}

impl UpgradeExecutor for CommandExecutor {
    fn kind(&self) -> &'static str {
        match self.host.kind() {
            ToolHostKind::Local => "command",
            ToolHostKind::Ssh => "command-ssh",
        }
    }

    fn execute(
        &self,
        request: &UpgradeRequest,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> UpgradeOutcome {
        let argv = tool_argv(&self.program, &self.base_args, request);
        let mut command = match self.host.command(&argv) {
            Ok(command) => command,
            Err(err) => {
                progress.emit(format!("upgrade tool invocation rejected: {err}"));
                return UpgradeOutcome::Failure;
            }
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                progress.emit(self.host.redact(&format!(
                    "failed to start upgrade tool {}: {err}",
                    self.program
                )));
                return UpgradeOutcome::Failure;
            }
        };
        tracing::info!(
            task_id = request.task_id,
            pid = child.id(),
            host = self.host.kind().as_str(),
            "upgrade tool started"
        );

        let (done_tx, done_rx) = mpsc::channel();
        let pipes = [
            child.stdout.take().map(|pipe| Box::new(pipe) as Box<dyn Read + Send>),
            child.stderr.take().map(|pipe| Box::new(pipe) as Box<dyn Read + Send>),
        ];
        let mut readers = 0;
        for pipe in pipes.into_iter().flatten() {
            spawn_line_reader(pipe, progress.clone(), done_tx.clone());
            readers += 1;
        }
        drop(done_tx);

        let pid = child.id() as libc::pid_t;
        let exit = self.wait_for_exit(&mut child, cancel);
        self.drain_output(pid, &done_rx, readers);

        match exit {
            ChildExit::Exited(status) if status.success() => UpgradeOutcome::Success,
            ChildExit::Exited(status) => {
                progress.emit(format!(
                    "upgrade tool exited with status {}",
                    exit_code_string(&status)
                ));
                UpgradeOutcome::Failure
            }
            ChildExit::Cancelled => {
                progress.emit("upgrade tool terminated after stop request");
                UpgradeOutcome::Failure
            }
            ChildExit::Lost(err) => {
                progress.emit(format!("lost track of upgrade tool: {err}"));
                UpgradeOutcome::Failure
            }
        }
    }
}

fn spawn_line_reader(pipe: Box<dyn Read + Send>, progress: ProgressSink, done: Sender<()>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']);
                    if !line.trim().is_empty() {
                        progress.emit(line);
                    }
                }
                Err(err) => {
                    progress.emit(format!("failed to read upgrade tool output: {err}"));
                    break;
                }
            }
        }
        let _ = done.send(());
    });
}

pub fn exit_code_string(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

/// Reports what would run without touching any device.
pub struct DryRunExecutor {
    program: String,
    base_args: Vec<String>,
    step_delay: Duration,
}

impl DryRunExecutor {
    pub fn new(program: String, base_args: Vec<String>, step_delay: Duration) -> Self {
        Self {
            program,
            base_args,
            step_delay,
        }
    }
}

impl UpgradeExecutor for DryRunExecutor {
    fn kind(&self) -> &'static str {
        "dry-run"
    }

    fn execute(
        &self,
        request: &UpgradeRequest,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> UpgradeOutcome {
        let steps = [
            format!(
                "dry-run: would run {}",
                tool_argv(&self.program, &self.base_args, request).join(" ")
            ),
            format!("dry-run: connecting to {}", request.target_address),
            format!("dry-run: staging {}", request.version_path),
        ];
        for step in steps {
            if cancel.is_cancelled() {
                return UpgradeOutcome::Failure;
            }
            progress.emit(step);
            if !self.step_delay.is_zero() {
                thread::sleep(self.step_delay);
            }
        }
        UpgradeOutcome::Success
    }
}
