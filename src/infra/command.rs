//! # Command Execution Module / 命令执行模块
//!
//! Spawns a test process, captures its combined stdout and stderr, and enforces
//! the wall-time limit and cancellation. Each child gets its own process group so
//! that a timeout or cancellation takes down everything the test started, not
//! only the direct child.
//!
//! 派生测试进程，捕获其合并的 stdout 和 stderr，并强制执行超时与取消。
//! 每个子进程拥有独立的进程组，因此超时或取消会终止测试启动的所有进程。

use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::SplitStream;
use tokio_util::sync::CancellationToken;

/// How long to keep reading output after the main process exited, before
/// assuming leftover background processes are holding the pipes open.
const LEAK_TIMEOUT: Duration = Duration::from_secs(1);

/// A fully resolved command line for one test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            cwd: cwd.into(),
            env: vec![],
        }
    }

    /// Runs `script` through `sh -c`.
    pub fn shell(script: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.into()],
            cwd: cwd.into(),
            env: vec![],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The command line as a user would type it.
    pub fn display(&self) -> String {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        shlex::try_join(words).unwrap_or_else(|_| {
            std::iter::once(self.program.clone())
                .chain(self.args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ")
        })
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    /// Killed by a signal it did not handle.
    Signaled(i32),
    TimedOut,
    Cancelled,
    LaunchFailed(String),
}

/// Everything the harness learned from running one process.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit: ProcessExit,
    pub output: String,
    pub duration: Duration,
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs `launch` to completion, to its time limit, or until `cancel` fires.
///
/// Output from stdout and stderr is merged line by line in arrival order. Bytes
/// that are not valid UTF-8 are kept as replacement characters.
/// On timeout or cancellation the whole process group is killed with SIGKILL.
///
/// 运行 `launch`，直到完成、超时或 `cancel` 被触发。
/// stdout 和 stderr 按到达顺序逐行合并。超时或取消时整个进程组会被 SIGKILL 终止。
pub async fn run_supervised(
    launch: &LaunchCommand,
    max_time: Duration,
    cancel: &CancellationToken,
) -> ProcessOutcome {
    let started = Instant::now();
    let mut cmd = Command::new(&launch.program);
    cmd.args(&launch.args)
        .current_dir(&launch.cwd)
        .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ProcessOutcome {
                exit: ProcessExit::LaunchFailed(format!("{}: {e}", launch.program)),
                output: String::new(),
                duration: started.elapsed(),
            };
        }
    };
    let pid = child.id();
    tracing::debug!(pid, command = %launch.display(), "spawned test process");

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        terminate(&mut child, pid).await;
        return ProcessOutcome {
            exit: ProcessExit::LaunchFailed("failed to capture output".to_string()),
            output: String::new(),
            duration: started.elapsed(),
        };
    };

    let mut reader = tokio::spawn(async move {
        // Raw lines, so bytes that are not UTF-8 never stop the pipes from draining.
        let stdout = SplitStream::new(BufReader::new(stdout).split(b'\n'));
        let stderr = SplitStream::new(BufReader::new(stderr).split(b'\n'));
        let mut merged = stdout.merge(stderr);
        let mut output = String::new();
        while let Some(line) = merged.next().await {
            match line {
                Ok(line) => push_line(&mut output, &line),
                Err(e) => {
                    tracing::debug!("error reading test output: {e}");
                    break;
                }
            }
        }
        output
    });

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = tokio::time::sleep(max_time) => Waited::TimedOut,
        _ = cancel.cancelled() => Waited::Cancelled,
    };

    let exit = match waited {
        Waited::Exited(Ok(status)) => exit_from_status(status),
        Waited::Exited(Err(e)) => ProcessExit::LaunchFailed(format!("wait failed: {e}")),
        Waited::TimedOut => {
            tracing::debug!(pid, "test process timed out");
            terminate(&mut child, pid).await;
            ProcessExit::TimedOut
        }
        Waited::Cancelled => {
            tracing::debug!(pid, "test process cancelled");
            terminate(&mut child, pid).await;
            ProcessExit::Cancelled
        }
    };

    let output = match tokio::time::timeout(LEAK_TIMEOUT, &mut reader).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            tracing::debug!(pid, "test left processes behind, killing its group");
            kill_group(pid);
            match tokio::time::timeout(LEAK_TIMEOUT, &mut reader).await {
                Ok(joined) => joined.unwrap_or_default(),
                Err(_) => {
                    reader.abort();
                    String::new()
                }
            }
        }
    };

    ProcessOutcome {
        exit,
        output,
        duration: started.elapsed(),
    }
}

/// Appends one captured line, replacing invalid UTF-8 and dropping a trailing `\r`.
fn push_line(output: &mut String, line: &[u8]) {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    output.push_str(&String::from_utf8_lossy(line));
    output.push('\n');
}

fn exit_from_status(status: std::process::ExitStatus) -> ProcessExit {
    if let Some(code) = status.code() {
        return ProcessExit::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ProcessExit::Signaled(signal);
        }
    }
    ProcessExit::Exited(-1)
}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);
    if let Err(e) = child.kill().await {
        tracing::trace!("kill after group kill: {e}");
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the child leads its own group.
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}
