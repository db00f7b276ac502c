//! Runs one OS command under a timeout and makes sure nothing it spawned
//! outlives the timeout.
//!
//! On timeout the whole process tree gets SIGTERM (leaves first), then after
//! a grace period SIGKILL, then after a second grace period the run is
//! declared deadlocked. The tree is enumerated again before every wave since
//! children may fork in between.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use sysinfo::{PidExt, ProcessExt, ProcessRefreshKind, System, SystemExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SIGTERM_GRACE: Duration = Duration::from_secs(3);
pub const DEFAULT_SIGKILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// Run through `/bin/sh -c`.
    Shell(String),
    /// Exec directly, first element is the program.
    Exec(Vec<String>),
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSpec::Shell(line) => f.write_str(line),
            CommandSpec::Exec(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub stdin: Option<Vec<u8>>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("can't execute command {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("command {command} has no program to execute")]
    EmptyCommand { command: String },
    #[error("i/o error while running command {command}: {source}")]
    Io {
        command: String,
        source: std::io::Error,
    },
    #[error("execution timeout after {} seconds", timeout.as_secs_f64())]
    Timeout { timeout: Duration },
    #[error("process {pid} survived SIGKILL, execution deadlocked")]
    Deadlock { pid: u32 },
}

impl ProcessError {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, ProcessError::Deadlock { .. })
    }
}

/// Grace periods of the termination escalation. Fixed per runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    pub sigterm_grace: Duration,
    pub sigkill_grace: Duration,
}

impl Default for Escalation {
    fn default() -> Self {
        Self {
            sigterm_grace: DEFAULT_SIGTERM_GRACE,
            sigkill_grace: DEFAULT_SIGKILL_GRACE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    escalation: Escalation,
}

impl ProcessRunner {
    pub fn new(escalation: Escalation) -> Self {
        Self { escalation }
    }

    pub async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
        opts: ExecOptions,
    ) -> Result<CommandOutput, ProcessError> {
        let cmd_line = spec.to_string();
        let mut command = build_command(spec)?;
        command
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &opts.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &opts.env {
            command.env(key, value);
        }
        if let Some(gid) = opts.gid {
            command.gid(gid);
        }
        if let Some(uid) = opts.uid {
            command.uid(uid);
        }

        debug!(command = %cmd_line, ?timeout, "executing command");
        let started = Instant::now();

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: cmd_line.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| ProcessError::Io {
            command: cmd_line.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "child exited before start"),
        })?;
        let guard = ChildGuard::register(pid);

        if let (Some(payload), Some(mut stdin)) = (opts.stdin, child.stdin.take()) {
            tokio::spawn(async move {
                // A check that never reads stdin closes the pipe early.
                let _ = stdin.write_all(&payload).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let exited = guard.exited.clone();

        let completion = async {
            let (status, out, err) = tokio::join!(
                async {
                    let status = child.wait().await;
                    exited.store(true, Ordering::SeqCst);
                    status
                },
                read_all(stdout),
                read_all(stderr),
            );
            (status, out, err)
        };
        tokio::pin!(completion);

        let (status, out, err) = match timeout {
            None => completion.await,
            Some(limit) => match time::timeout(limit, &mut completion).await {
                Ok(done) => done,
                Err(_) => {
                    info!(command = %cmd_line, pid, "command timed out, terminating process tree");
                    guard.signal(Signal::SIGTERM);
                    if time::timeout(self.escalation.sigterm_grace, &mut completion)
                        .await
                        .is_ok()
                    {
                        guard.release();
                        return Err(ProcessError::Timeout { timeout: limit });
                    }

                    warn!(command = %cmd_line, pid, "process tree ignored SIGTERM, sending SIGKILL");
                    guard.signal(Signal::SIGKILL);
                    if time::timeout(self.escalation.sigkill_grace, &mut completion)
                        .await
                        .is_ok()
                    {
                        guard.release();
                        return Err(ProcessError::Timeout { timeout: limit });
                    }

                    error!(command = %cmd_line, pid, "process tree survived SIGKILL");
                    // The pid may be reused once it finally dies.
                    guard.release();
                    return Err(ProcessError::Deadlock { pid });
                }
            },
        };
        guard.release();

        let status = status.map_err(|source| ProcessError::Io {
            command: cmd_line.clone(),
            source,
        })?;
        let stdout = out.map_err(|source| ProcessError::Io {
            command: cmd_line.clone(),
            source,
        })?;
        let stderr = err.map_err(|source| ProcessError::Io {
            command: cmd_line.clone(),
            source,
        })?;

        debug!(
            command = %cmd_line,
            elapsed_ms = started.elapsed().as_millis() as u64,
            exit_code = ?status.code(),
            "command finished"
        );

        Ok(CommandOutput {
            stdout: stdout.trim().to_string(),
            stderr: stderr.trim().to_string(),
            exit_code: status.code(),
        })
    }
}

fn build_command(spec: &CommandSpec) -> Result<Command, ProcessError> {
    match spec {
        CommandSpec::Shell(line) => {
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(line);
            Ok(command)
        }
        CommandSpec::Exec(argv) => {
            let (program, args) = argv.split_first().ok_or_else(|| ProcessError::EmptyCommand {
                command: spec.to_string(),
            })?;
            let mut command = Command::new(program);
            command.args(args);
            Ok(command)
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(stream: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Descendants of `root`, deepest first, so children are signalled before
/// the parents that would otherwise reap them. `root` itself is not included.
pub fn process_tree(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessRefreshKind::new());

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            let (pid, parent) = (pid.as_u32(), parent.as_u32());
            if pid != parent {
                children.entry(parent).or_default().push(pid);
            }
        }
    }

    let mut ordered = Vec::new();
    let mut seen = HashSet::new();
    collect_subtree(root, &children, &mut seen, &mut ordered);
    ordered
}

fn collect_subtree(
    pid: u32,
    children: &HashMap<u32, Vec<u32>>,
    seen: &mut HashSet<u32>,
    out: &mut Vec<u32>,
) {
    let Some(kids) = children.get(&pid) else {
        return;
    };
    for &child in kids {
        if !seen.insert(child) {
            continue;
        }
        collect_subtree(child, children, seen, out);
        out.push(child);
    }
}

/// Sends `signal` to every descendant of `root`, leaves first, then to `root`.
/// Processes that are already gone are skipped silently.
pub fn signal_tree(root: u32, signal: Signal) {
    let descendants = process_tree(root);
    info!(pid = root, ?signal, children = descendants.len(), "signalling process tree");
    for pid in descendants {
        send_signal(pid, signal);
    }
    send_signal(root, signal);
}

fn send_signal(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match kill(NixPid::from_raw(raw), signal) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => debug!(pid, "process already gone"),
        Err(err) => warn!(pid, ?signal, error = %err, "failed to signal process"),
    }
}

fn cleanup_table() -> &'static Mutex<HashSet<u32>> {
    static TABLE: OnceLock<Mutex<HashSet<u32>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Pids of spawned commands that have not completed yet.
#[cfg(test)]
pub fn registered_children() -> Vec<u32> {
    let table = cleanup_table().lock().unwrap_or_else(PoisonError::into_inner);
    table.iter().copied().collect()
}

/// Kills the trees of every command still registered. Called on daemon exit.
pub fn reap_registered() {
    let pids: Vec<u32> = {
        let mut table = cleanup_table().lock().unwrap_or_else(PoisonError::into_inner);
        table.drain().collect()
    };
    for pid in pids {
        warn!(pid, "killing leftover check process tree");
        signal_tree(pid, Signal::SIGTERM);
        signal_tree(pid, Signal::SIGKILL);
    }
}

/// Registration of one spawned child in the cleanup table. Dropping an
/// unreleased guard (the owning future was cancelled) kills the whole tree.
struct ChildGuard {
    pid: u32,
    exited: Arc<AtomicBool>,
    released: bool,
}

impl ChildGuard {
    fn register(pid: u32) -> Self {
        debug!(pid, "registering cleanup");
        cleanup_table()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid);
        Self {
            pid,
            exited: Arc::new(AtomicBool::new(false)),
            released: false,
        }
    }

    fn signal(&self, signal: Signal) {
        // Once reaped, the pid can belong to an unrelated process.
        if self.exited.load(Ordering::SeqCst) {
            debug!(pid = self.pid, "root already reaped, not signalling");
            return;
        }
        signal_tree(self.pid, signal);
    }

    fn release(mut self) {
        self.unregister();
        self.released = true;
    }

    fn unregister(&self) {
        debug!(pid = self.pid, "unregistering cleanup");
        cleanup_table()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.pid);
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.unregister();
        if !self.exited.load(Ordering::SeqCst) {
            warn!(pid = self.pid, "command abandoned mid-run, killing process tree");
            signal_tree(self.pid, Signal::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_runner() -> ProcessRunner {
        ProcessRunner::new(Escalation {
            sigterm_grace: Duration::from_millis(500),
            sigkill_grace: Duration::from_millis(500),
        })
    }

    fn shell(line: &str) -> CommandSpec {
        CommandSpec::Shell(line.to_string())
    }

    #[tokio::test]
    async fn captures_trimmed_output_and_exit_code() {
        let out = fast_runner()
            .run(
                &shell("echo '  hello  '; echo oops >&2; exit 3"),
                Some(Duration::from_secs(5)),
                ExecOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.stderr, "oops");
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn empty_output_is_empty_string() {
        let out = fast_runner()
            .run(&shell("true"), None, ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(out.stdout, "");
        assert_eq!(out.stderr, "");
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn exec_form_and_stdin_payload() {
        let out = fast_runner()
            .run(
                &CommandSpec::Exec(vec!["cat".to_string()]),
                Some(Duration::from_secs(5)),
                ExecOptions {
                    stdin: Some(b"{\"a\":1}".to_vec()),
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "{\"a\":1}");
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = fast_runner()
            .run(
                &CommandSpec::Exec(vec!["/nonexistent/smokerd-test-binary".to_string()]),
                Some(Duration::from_secs(1)),
                ExecOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }), "{err}");
    }

    #[tokio::test]
    async fn timeout_kills_tree_that_ignores_sigterm() {
        let started = Instant::now();
        let err = fast_runner()
            .run(
                &shell("trap '' TERM; sleep 30 & sleep 30; wait"),
                Some(Duration::from_secs(1)),
                ExecOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_millis(1000 + 500 + 1500));
    }

    #[tokio::test]
    async fn detached_pipe_holder_is_reported_as_deadlock() {
        // The background sleep is reparented away from the tree and keeps
        // stdout open, so output collection can never finish.
        let started = Instant::now();
        let err = fast_runner()
            .run(
                &shell("(sleep 5 &); exec sleep 30"),
                Some(Duration::from_millis(500)),
                ExecOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_deadlock(), "{err}");
        assert!(started.elapsed() < Duration::from_millis(500 + 500 + 500 + 1500));
    }

    #[tokio::test]
    async fn process_tree_lists_descendants_leaves_first() {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("sh -c 'sleep 5' & wait")
            .spawn()
            .unwrap();
        let root = child.id().unwrap();
        time::sleep(Duration::from_millis(300)).await;

        let tree = process_tree(root);
        assert!(!tree.is_empty());
        assert!(!tree.contains(&root));

        signal_tree(root, Signal::SIGKILL);
        let _ = child.wait().await;
    }

    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // state follows the parenthesised command name
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| !matches!(rest.trim_start().chars().next(), Some('Z' | 'X')))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn cancelled_run_kills_its_tree() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let line = format!("echo $$ > {}; exec sleep 30", pid_file.display());

        let handle = tokio::spawn(async move {
            fast_runner()
                .run(&shell(&line), None, ExecOptions::default())
                .await
        });
        let mut pid = None;
        for _ in 0..50 {
            time::sleep(Duration::from_millis(50)).await;
            if let Ok(text) = std::fs::read_to_string(&pid_file) {
                if let Ok(parsed) = text.trim().parse::<u32>() {
                    pid = Some(parsed);
                    break;
                }
            }
        }
        let pid = pid.expect("command wrote its pid");
        assert!(registered_children().contains(&pid));

        handle.abort();
        let _ = handle.await;
        time::sleep(Duration::from_millis(300)).await;

        assert!(!is_running(pid));
        assert!(!registered_children().contains(&pid));
    }
}
