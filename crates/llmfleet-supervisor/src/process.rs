use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::{Mutex, mpsc, watch},
};

use crate::console::ConsoleLog;
use crate::error::SpawnError;

// Upper bound on waiting for the reaper after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to launch one instance process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process was already gone; nothing was signalled.
    AlreadyExited,
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Needed SIGKILL.
    Killed,
    /// The handle does not own the process (the controller itself).
    NotOwned,
}

#[derive(Debug)]
enum Ownership {
    Spawned {
        kill_tx: mpsc::UnboundedSender<()>,
    },
    // Keeps the exit channel open forever; the process is never signalled.
    Attached {
        _exit_tx: watch::Sender<Option<ExitInfo>>,
    },
}

#[derive(Debug)]
struct HandleInner {
    pid: u32,
    pgid: Option<i32>,
    command_line: String,
    cwd: PathBuf,
    ownership: Ownership,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    // Serializes terminate() calls so only one of them ever signals.
    terminate_lock: Mutex<()>,
}

/// One OS child process backing an instance.
///
/// Clones share the same process. A background reaper owns the `Child` and
/// always waits on it, so exited processes never linger as zombies.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> std::io::Result<()> {
    // If the controller dies, the child gets SIGTERM instead of being orphaned.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

impl ProcessHandle {
    /// Spawn `spec` in its own process group, forwarding its output to `console`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(spec: &LaunchSpec, console: ConsoleLog) -> Result<Self, SpawnError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let io_err = |source: std::io::Error| SpawnError::Io {
            program: spec.program.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(io_err)?;
        let Some(pid) = child.id() else {
            return Err(io_err(std::io::Error::other("process exited before its pid was read")));
        };
        #[cfg(unix)]
        let pgid = Some(pid as i32);
        #[cfg(not(unix))]
        let pgid = None;

        if let Some(out) = child.stdout.take() {
            let console = console.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(pid, "{line}");
                    console.emit(format!("[stdout] {line}")).await;
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            let console = console.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(pid, "{line}");
                    console.emit(format!("[stderr] {line}")).await;
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
        tokio::spawn(async move {
            let mut kill_open = true;
            loop {
                let kill_requested = if kill_open {
                    tokio::select! {
                        res = child.wait() => {
                            let info = match res {
                                Ok(status) => ExitInfo::from_status(status),
                                Err(_) => ExitInfo { code: None, signal: None },
                            };
                            let _ = exit_tx.send(Some(info));
                            return;
                        }
                        req = kill_rx.recv() => req.is_some(),
                    }
                } else {
                    false
                };

                if kill_requested {
                    let _ = child.start_kill();
                } else if kill_open {
                    kill_open = false;
                } else {
                    let info = match child.wait().await {
                        Ok(status) => ExitInfo::from_status(status),
                        Err(_) => ExitInfo { code: None, signal: None },
                    };
                    let _ = exit_tx.send(Some(info));
                    return;
                }
            }
        });

        Ok(Self {
            inner: Arc::new(HandleInner {
                pid,
                pgid,
                command_line: spec.command_line(),
                cwd: spec.cwd.clone(),
                ownership: Ownership::Spawned { kill_tx },
                exit_rx,
                terminate_lock: Mutex::new(()),
            }),
        })
    }

    /// Handle for a process this controller did not spawn (typically itself).
    pub fn attached(pid: u32, command_line: impl Into<String>) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            inner: Arc::new(HandleInner {
                pid,
                pgid: None,
                command_line: command_line.into(),
                cwd: std::env::current_dir().unwrap_or_default(),
                ownership: Ownership::Attached { _exit_tx: exit_tx },
                exit_rx,
                terminate_lock: Mutex::new(()),
            }),
        }
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn command_line(&self) -> &str {
        &self.inner.command_line
    }

    pub fn cwd(&self) -> &std::path::Path {
        &self.inner.cwd
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.inner.ownership, Ownership::Spawned { .. })
    }

    /// OS-level liveness. Says nothing about whether the server answers HTTP.
    pub fn is_alive(&self) -> bool {
        self.inner.exit_rx.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.inner.exit_rx.borrow()
    }

    /// Wait until the process has exited and been reaped, or `timeout` elapses.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.exit_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|v| v.is_some()))
            .await
            .is_ok()
    }

    #[cfg(unix)]
    fn signal_group(&self, sig: i32) {
        let target = match self.inner.pgid {
            Some(pgid) => -pgid,
            None => self.inner.pid as i32,
        };
        unsafe {
            libc::kill(target, sig);
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Always waits for the reaper.
    ///
    /// Safe to call any number of times, concurrently or not: only the first
    /// call on a live process sends signals.
    pub async fn terminate(&self, grace: Duration) -> TerminateOutcome {
        let kill_tx = match &self.inner.ownership {
            Ownership::Spawned { kill_tx } => kill_tx,
            Ownership::Attached { .. } => return TerminateOutcome::NotOwned,
        };

        let _guard = self.inner.terminate_lock.lock().await;
        if !self.is_alive() {
            return TerminateOutcome::AlreadyExited;
        }

        #[cfg(unix)]
        {
            self.signal_group(libc::SIGTERM);
            if self.wait_exit(grace).await {
                return TerminateOutcome::Graceful;
            }
            self.signal_group(libc::SIGKILL);
        }
        #[cfg(not(unix))]
        let _ = grace;

        let _ = kill_tx.send(());
        if !self.wait_exit(KILL_REAP_TIMEOUT).await {
            tracing::warn!(pid = self.inner.pid, "process did not exit after SIGKILL");
        }
        TerminateOutcome::Killed
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("sh", vec!["-c".to_string(), script.to_string()], ".")
    }

    #[tokio::test]
    async fn terminate_is_graceful_then_idempotent() {
        let h = ProcessHandle::spawn(&sh("sleep 30"), ConsoleLog::new(100)).unwrap();
        assert!(h.is_alive());
        assert!(h.pid() > 0);

        let first = h.terminate(Duration::from_secs(5)).await;
        assert_eq!(first, TerminateOutcome::Graceful);
        assert!(!h.is_alive());

        let second = h.terminate(Duration::from_secs(5)).await;
        assert_eq!(second, TerminateOutcome::AlreadyExited);
    }

    #[tokio::test]
    async fn concurrent_terminate_signals_once() {
        let h = ProcessHandle::spawn(&sh("sleep 30"), ConsoleLog::new(100)).unwrap();
        let (a, b) = tokio::join!(
            h.terminate(Duration::from_secs(5)),
            h.terminate(Duration::from_secs(5))
        );
        let outcomes = [a, b];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == TerminateOutcome::AlreadyExited)
                .count(),
            1
        );
        assert!(outcomes.contains(&TerminateOutcome::Graceful));
    }

    #[tokio::test]
    async fn escalates_to_sigkill_when_term_is_ignored() {
        let h = ProcessHandle::spawn(&sh("trap '' TERM; sleep 30"), ConsoleLog::new(100)).unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = h.terminate(Duration::from_millis(300)).await;
        assert_eq!(outcome, TerminateOutcome::Killed);
        assert!(!h.is_alive());
        assert_eq!(h.exit_info().and_then(|e| e.signal), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn self_exit_is_reaped_and_reported() {
        let h = ProcessHandle::spawn(&sh("exit 3"), ConsoleLog::new(100)).unwrap();
        assert!(h.wait_exit(Duration::from_secs(5)).await);
        assert!(!h.is_alive());
        assert_eq!(h.exit_info().and_then(|e| e.code), Some(3));
        assert_eq!(
            h.terminate(Duration::from_secs(1)).await,
            TerminateOutcome::AlreadyExited
        );
    }

    #[tokio::test]
    async fn captures_output_into_console() {
        let console = ConsoleLog::new(100);
        let h = ProcessHandle::spawn(&sh("echo hello; echo oops >&2"), console.clone()).unwrap();
        assert!(h.wait_exit(Duration::from_secs(5)).await);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let (lines, _) = console.tail(0, 10).await;
            if lines.iter().any(|l| l == "[stdout] hello") && lines.iter().any(|l| l == "[stderr] oops") {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "output not captured: {lines:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let spec = LaunchSpec::new("/definitely/not/here", vec![], ".");
        let err = ProcessHandle::spawn(&spec, ConsoleLog::new(10)).unwrap_err();
        match err {
            SpawnError::Io { source, .. } => assert_eq!(source.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn attached_handle_is_never_signalled() {
        let h = ProcessHandle::attached(std::process::id(), "controller");
        assert!(h.is_alive());
        assert!(!h.is_owned());
        assert_eq!(h.terminate(Duration::from_millis(10)).await, TerminateOutcome::NotOwned);
        assert!(h.is_alive());
    }
}
