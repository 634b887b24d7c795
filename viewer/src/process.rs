//! Viewer process handle: spawn, exit monitoring, and kill.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use crate::error::{Result, ViewerError};

/// Log target for forwarded viewer stderr.
const STDERR_TARGET: &str = "wavelink.viewer.stderr";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessStatus {
    Running,
    /// Exit code, `None` when terminated by a signal.
    Exited(Option<i32>),
}

pub(crate) struct ProcessSpec<'a> {
    pub executable: &'a str,
    pub args: Vec<String>,
    pub env: &'a HashMap<String, String>,
    pub env_remove: &'a [&'a str],
    pub verbose: bool,
}

/// A running viewer. The child itself is owned by a monitor task that
/// publishes its exit status. Dropping the handle drops `kill_tx`, which the
/// monitor treats as a kill.
pub(crate) struct ViewerProcess {
    pid: Option<u32>,
    status: watch::Receiver<ProcessStatus>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ViewerProcess {
    pub fn start(spec: ProcessSpec<'_>) -> Result<(Self, ChildStdin, ChildStdout)> {
        let resolved = which::which(spec.executable).map_err(|source| {
            ViewerError::ExecutableNotFound {
                command: spec.executable.to_string(),
                source,
            }
        })?;

        let mut cmd = Command::new(&resolved);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if spec.verbose {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        for key in spec.env_remove {
            cmd.env_remove(key);
        }
        cmd.envs(spec.env);

        let mut child = cmd.spawn().map_err(|source| ViewerError::Spawn {
            command: spec.executable.to_string(),
            source,
        })?;

        let missing = |stream: &str| {
            std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("no {stream} from viewer process"),
            )
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        let pid = child.id();
        tracing::info!(
            command = %resolved.display(),
            args = ?spec.args,
            pid = ?pid,
            "Started waveform viewer"
        );

        let (status_tx, status) = watch::channel(ProcessStatus::Running);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let waited = tokio::select! {
                waited = child.wait() => waited,
                // Explicit kill or a dropped handle.
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!("Failed to kill viewer: {e}");
                    }
                    child.wait().await
                }
            };
            let code = match waited {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!("Waiting for viewer exit failed: {e}");
                    None
                }
            };
            tracing::info!(pid = ?pid, code = ?code, "Waveform viewer exited");
            status_tx.send_replace(ProcessStatus::Exited(code));
        });

        let process = Self {
            pid,
            status,
            kill_tx: Some(kill_tx),
        };
        Ok((process, stdin, stdout))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        *self.status.borrow() == ProcessStatus::Running
    }

    /// Exit code once the process has exited with one.
    pub fn exit_code(&self) -> Option<i32> {
        match *self.status.borrow() {
            ProcessStatus::Exited(code) => code,
            ProcessStatus::Running => None,
        }
    }

    /// Independent receiver for exit observers. Every clone sees the exit.
    pub fn status_watch(&self) -> watch::Receiver<ProcessStatus> {
        self.status.clone()
    }

    /// Resolve once the process has exited.
    pub async fn wait_exit(&self) -> Option<i32> {
        wait_for_exit(self.status.clone()).await
    }

    /// Kill the process and wait for it to be reaped.
    pub async fn kill(&mut self) -> Option<i32> {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        self.wait_exit().await
    }
}

/// Wait on a status receiver until the process has exited.
pub(crate) async fn wait_for_exit(mut status: watch::Receiver<ProcessStatus>) -> Option<i32> {
    match status
        .wait_for(|s| matches!(s, ProcessStatus::Exited(_)))
        .await
    {
        Ok(s) => match *s {
            ProcessStatus::Exited(code) => code,
            ProcessStatus::Running => None,
        },
        // Monitor dropped without publishing: treat as gone.
        Err(_) => None,
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::info!(target: STDERR_TARGET, "{line}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Viewer stderr closed: {e}");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn sh<'a>(script: &str, env: &'a HashMap<String, String>) -> ProcessSpec<'a> {
        ProcessSpec {
            executable: "sh",
            args: vec!["-c".to_string(), script.to_string()],
            env,
            env_remove: &[],
            verbose: false,
        }
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let env = HashMap::new();
        let spec = ProcessSpec {
            executable: "wavelink-no-such-viewer",
            args: Vec::new(),
            env: &env,
            env_remove: &[],
            verbose: false,
        };
        assert!(matches!(
            ViewerProcess::start(spec),
            Err(ViewerError::ExecutableNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stdio_is_piped() {
        let env = HashMap::new();
        let (process, mut stdin, mut stdout) =
            ViewerProcess::start(sh("read line; printf '%s!' \"$line\"", &env)).unwrap();
        assert!(process.pid().is_some());

        stdin.write_all(b"ping\n").await.unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "ping!");
        assert_eq!(process.wait_exit().await, Some(0));
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_exit_code_is_published_to_every_waiter() {
        let env = HashMap::new();
        let (process, _stdin, _stdout) = ViewerProcess::start(sh("exit 3", &env)).unwrap();
        let first = wait_for_exit(process.status_watch());
        let second = process.wait_exit();
        let (a, b) = tokio::join!(first, second);
        assert_eq!((a, b), (Some(3), Some(3)));
        assert_eq!(process.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_kill_terminates_a_stuck_process() {
        let env = HashMap::new();
        let (mut process, _stdin, _stdout) =
            ViewerProcess::start(sh("exec sleep 30", &env)).unwrap();
        assert!(process.is_running());
        let code = tokio::time::timeout(Duration::from_secs(5), process.kill())
            .await
            .unwrap();
        assert_eq!(code, None, "killed by signal");
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_env_overrides_and_removals() {
        let env = HashMap::from([("WAVELINK_TEST_VAR".to_string(), "set".to_string())]);
        let spec = ProcessSpec {
            env_remove: &["HOME"],
            ..sh("printf '%s:%s' \"$WAVELINK_TEST_VAR\" \"${HOME-unset}\"", &env)
        };
        let (_process, _stdin, mut stdout) = ViewerProcess::start(spec).unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "set:unset");
    }
}
