use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::process::launcher::{ExitReport, TerminationSignal, WorkerHandle, WorkerLauncher};
use crate::worker::protocol::{decode_line, encode_line};
use crate::worker::{StartMessage, SupervisorMessage, WorkerMessage};

/// How long the stdout reader may lag behind process exit
const OUTPUT_DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Runs every worker as `<executable> worker` in its own process group
pub struct OsProcessLauncher {
    executable: PathBuf,

    /// Extra arguments placed before the `worker` subcommand
    args: Vec<String>,
}

impl OsProcessLauncher {
    pub fn new(executable: PathBuf, args: Vec<String>) -> Self {
        Self { executable, args }
    }

    /// Launcher re-executing the running binary
    pub fn current_exe(args: Vec<String>) -> Result<Self> {
        let executable = std::env::current_exe().context("Failed to locate the running executable")?;
        Ok(Self::new(executable, args))
    }
}

#[async_trait]
impl WorkerLauncher for OsProcessLauncher {
    async fn launch(&self, start: StartMessage) -> Result<WorkerHandle> {
        let task_id = start.task_id;

        let mut command = Command::new(&self.executable);
        command
            .args(&self.args)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .context(format!("Failed to spawn worker: {}", self.executable.display()))?;
        let pid = child.id().context("Spawned worker has no pid")?;
        let mut stdin = child.stdin.take().context("Worker stdin is not piped")?;
        let stdout = child.stdout.take().context("Worker stdout is not piped")?;

        let start_line = encode_line(&SupervisorMessage::Start(start))?;
        stdin
            .write_all(start_line.as_bytes())
            .await
            .context(format!("Failed to hand task {} to worker {}", task_id, pid))?;
        stdin.flush().await?;

        debug!("Worker {} launched for task {}", pid, task_id);

        // Control messages -> stdin; closing stdin asks the worker to stop
        let (control, mut control_rx) = mpsc::unbounded_channel::<SupervisorMessage>();
        tokio::spawn(async move {
            while let Some(message) = control_rx.recv().await {
                let line = match encode_line(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Worker {}: {:#}", pid, e);
                        continue;
                    }
                };
                if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
                    debug!("Worker {} stdin closed", pid);
                    break;
                }
            }
        });

        // stdout -> messages
        let (message_tx, messages) = mpsc::unbounded_channel::<WorkerMessage>();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match decode_line::<WorkerMessage>(&line) {
                        Ok(message) => {
                            if message_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Worker {} wrote an unreadable line: {:#}", pid, e),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Worker {} stdout failed: {}", pid, e);
                        break;
                    }
                }
            }
        });

        // Exit is reported only after buffered output has been forwarded
        let (exit_tx, exit) = oneshot::channel();
        tokio::spawn(async move {
            let report = match child.wait().await {
                Ok(status) => match status.code() {
                    Some(code) => ExitReport::exited(code),
                    None => ExitReport::abnormal(format!("terminated by signal ({})", status)),
                },
                Err(e) => ExitReport::abnormal(format!("failed to wait for worker: {}", e)),
            };
            if tokio::time::timeout(OUTPUT_DRAIN_DEADLINE, reader).await.is_err() {
                warn!("Worker {} output still open after exit", pid);
            }
            let _ = exit_tx.send(report);
        });

        Ok(WorkerHandle {
            pid,
            control,
            messages,
            exit,
        })
    }

    async fn is_alive(&self, pid: u32) -> bool {
        pid_is_alive(pid)
    }

    #[cfg(target_os = "linux")]
    async fn is_worker(&self, pid: u32) -> bool {
        if as_pid(pid).is_none() {
            return false;
        }
        match tokio::fs::read(format!("/proc/{}/cmdline", pid)).await {
            Ok(cmdline) => is_worker_cmdline(&cmdline, &self.executable),
            Err(e) => {
                debug!("Cannot read the command line of pid {}: {}", pid, e);
                false
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    async fn is_worker(&self, _pid: u32) -> bool {
        false
    }

    async fn signal(&self, pid: u32, signal: TerminationSignal) -> Result<bool> {
        signal_pid(pid, signal)
    }

    async fn kill_detached(&self, pid: u32) -> Result<bool> {
        signal_process(pid, TerminationSignal::Kill)
    }
}

/// Whether a NUL separated command line runs `executable` with the `worker` subcommand
#[cfg(target_os = "linux")]
fn is_worker_cmdline(cmdline: &[u8], executable: &Path) -> bool {
    let mut args = cmdline
        .split(|byte| *byte == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy);

    let Some(program) = args.next() else {
        return false;
    };
    let same_binary =
        executable.file_name().is_some() && Path::new(program.as_ref()).file_name() == executable.file_name();
    same_binary && args.any(|arg| arg == "worker")
}

#[cfg(unix)]
fn as_pid(pid: u32) -> Option<libc::pid_t> {
    // 0 and negative values address process groups
    libc::pid_t::try_from(pid).ok().filter(|pid| *pid > 0)
}

/// Whether an OS process with this pid exists
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    let Some(pid) = as_pid(pid) else {
        return false;
    };
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
    false
}

/// Signal the worker's process group, falling back to the pid alone
#[cfg(unix)]
pub fn signal_pid(pid: u32, signal: TerminationSignal) -> Result<bool> {
    send_signal(pid, signal, true)
}

/// Signal one process, leaving its group alone
#[cfg(unix)]
pub fn signal_process(pid: u32, signal: TerminationSignal) -> Result<bool> {
    send_signal(pid, signal, false)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: TerminationSignal, group: bool) -> Result<bool> {
    let Some(pid) = as_pid(pid) else {
        return Ok(false);
    };
    let signal = match signal {
        TerminationSignal::Terminate => libc::SIGTERM,
        TerminationSignal::Kill => libc::SIGKILL,
    };
    let targets: &[libc::pid_t] = if group { &[-pid, pid] } else { &[pid] };

    for &target in targets {
        let result = unsafe { libc::kill(target, signal) };
        if result == 0 {
            return Ok(true);
        }
        let os_error = std::io::Error::last_os_error();
        if os_error.raw_os_error() != Some(libc::ESRCH) {
            anyhow::bail!("failed to send signal {} to {}: {}", signal, target, os_error);
        }
    }

    Ok(false)
}

#[cfg(not(unix))]
pub fn signal_pid(pid: u32, _signal: TerminationSignal) -> Result<bool> {
    anyhow::bail!("signalling process {} is only supported on unix", pid)
}

#[cfg(not(unix))]
pub fn signal_process(pid: u32, signal: TerminationSignal) -> Result<bool> {
    signal_pid(pid, signal)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(pid_is_alive(std::process::id()));
        assert!(!pid_is_alive(0));
    }

    #[tokio::test]
    async fn test_signal_reaches_a_spawned_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        assert!(pid_is_alive(pid));

        assert!(signal_pid(pid, TerminationSignal::Kill).unwrap());
        let status = child.wait().await.unwrap();
        assert!(!status.success());
        assert!(!signal_pid(pid, TerminationSignal::Kill).unwrap());
    }

    #[tokio::test]
    async fn test_terminate_reaches_only_the_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();

        assert!(signal_process(pid, TerminationSignal::Terminate).unwrap());
        assert!(!child.wait().await.unwrap().success());
        assert!(!signal_process(pid, TerminationSignal::Kill).unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_worker_command_lines() {
        let exe = Path::new("/opt/scrape/bin/scrapectl");
        assert!(is_worker_cmdline(b"/opt/scrape/bin/scrapectl\0--verbose\0worker\0", exe));
        assert!(is_worker_cmdline(b"/tmp/build/scrapectl\0worker\0", exe));
        assert!(!is_worker_cmdline(b"/opt/scrape/bin/scrapectl\0run\0", exe));
        assert!(!is_worker_cmdline(b"/usr/bin/bash\0-c\0worker\0", exe));
        assert!(!is_worker_cmdline(b"", exe));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_unrelated_process_is_not_a_worker() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        let launcher = OsProcessLauncher::new(PathBuf::from("/opt/scrape/bin/scrapectl"), Vec::new());

        assert!(launcher.is_alive(pid).await);
        assert!(!launcher.is_worker(pid).await);

        child.kill().await.unwrap();
    }
}
