//! OpenVPN process supervision
//!
//! Runs the OpenVPN client with the temporary credentials file and follows
//! its output until it exits. The only line that is acted on is the
//! `AUTH_FAILED` marker: once OpenVPN prints it the credentials are spent,
//! so the process is stopped and the attempt reported as failed.
//!
//! # Termination
//!
//! Both the failure marker and an operator interrupt go through the same
//! [`Termination`] trigger, so a process gets at most one SIGTERM (and one
//! SIGKILL if it ignores that). Every path waits for the child before
//! returning.

use crate::platform;
use crate::signal;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Printed by OpenVPN when the server rejects the credentials
pub const AUTH_FAILED_MARKER: &str = "AUTH_FAILED";

/// How long OpenVPN gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long to keep reading output once the process has exited
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to start {}: {source}", .binary.display())]
    SpawnError { binary: PathBuf, source: io::Error },
    #[error("Failed to wait for OpenVPN: {0}")]
    WaitError(#[source] io::Error),
}

/// How an OpenVPN run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Exited on its own
    Exited(ExitStatus),
    /// Printed the AUTH_FAILED marker
    AuthFailed,
    /// Stopped because of an operator interrupt
    Interrupted,
}

pub struct ProcessSupervisor {
    binary: PathBuf,
    config_file: PathBuf,
}

impl ProcessSupervisor {
    pub fn new(binary: PathBuf, config_file: PathBuf) -> Self {
        Self {
            binary,
            config_file,
        }
    }

    fn command(&self, credentials: &Path) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--config")
            .arg(&self.config_file)
            .arg("--auth-user-pass")
            .arg(credentials)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Start OpenVPN with the given credentials file
    pub fn spawn(&self, credentials: &Path) -> Result<RunningClient, SupervisorError> {
        let child = self
            .command(credentials)
            .spawn()
            .map_err(|source| SupervisorError::SpawnError {
                binary: self.binary.clone(),
                source,
            })?;
        info!(
            "Started {} (pid {})",
            self.binary.display(),
            child.id().unwrap_or_default()
        );
        Ok(RunningClient { child })
    }

    /// Run OpenVPN until it exits, fails authentication, or is interrupted
    pub async fn run(
        &self,
        credentials: &Path,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ProcessOutcome, SupervisorError> {
        self.spawn(credentials)?.supervise(shutdown).await
    }
}

/// A started OpenVPN process; killed if dropped before it is supervised
pub struct RunningClient {
    child: Child,
}

impl RunningClient {
    /// Follow the process output until it exits, fails authentication, or
    /// is interrupted
    pub async fn supervise(
        self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ProcessOutcome, SupervisorError> {
        let RunningClient { mut child } = self;
        let mut stdout = child.stdout.take().map(|out| BufReader::new(out).lines());
        let mut stderr = child.stderr.take().map(|err| BufReader::new(err).lines());

        let mut termination = Termination::default();
        let mut auth_failed = false;
        let mut interrupted = false;
        // Exit status and how long to keep draining output after it
        let mut exited: Option<(ExitStatus, Instant)> = None;

        let status = loop {
            // Checked every turn so a client that never stops writing can
            // still be stopped and drained
            if let Some((status, drain_until)) = exited {
                if stdout.is_none() && stderr.is_none() {
                    break status;
                }
                if Instant::now() >= drain_until {
                    debug!("OpenVPN output still open after exit, no longer reading it");
                    break status;
                }
            } else {
                if !termination.requested && *shutdown.borrow() {
                    interrupted = true;
                    termination.request(&mut child);
                }
                if termination.kill_at.is_some_and(|at| Instant::now() >= at) {
                    termination.escalate(&mut child);
                }
            }

            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => {
                    if let Some(line) = line {
                        if scan_line(&line) && !auth_failed {
                            auth_failed = true;
                            termination.request(&mut child);
                        }
                    }
                }

                line = next_line(&mut stderr), if stderr.is_some() => {
                    if let Some(line) = line {
                        if scan_line(&line) && !auth_failed {
                            auth_failed = true;
                            termination.request(&mut child);
                        }
                    }
                }

                result = child.wait(), if exited.is_none() => {
                    let status = result.map_err(SupervisorError::WaitError)?;
                    debug!("OpenVPN exited with {}", status);
                    exited = Some((status, Instant::now() + OUTPUT_DRAIN_GRACE));
                }

                _ = signal::interrupted(shutdown), if exited.is_none() && !termination.requested => {
                    interrupted = true;
                    termination.request(&mut child);
                }

                _ = sleep_until(termination.kill_at.unwrap_or_else(Instant::now)),
                    if termination.kill_at.is_some() && exited.is_none() => {
                    termination.escalate(&mut child);
                }

                _ = sleep_until(exited.map_or_else(Instant::now, |(_, drain)| drain)),
                    if exited.is_some() => {}
            }
        };

        // A marker seen while the exit was racing still counts as a failure
        let outcome = if auth_failed {
            ProcessOutcome::AuthFailed
        } else if interrupted {
            ProcessOutcome::Interrupted
        } else {
            ProcessOutcome::Exited(status)
        };
        info!("OpenVPN finished: {:?}", outcome);
        Ok(outcome)
    }
}

/// The single stop request shared by every reason to stop the process
#[derive(Default)]
struct Termination {
    requested: bool,
    /// When to escalate to a hard kill
    kill_at: Option<Instant>,
}

impl Termination {
    fn escalate(&mut self, child: &mut Child) {
        warn!("OpenVPN still running {:?} after SIGTERM, killing it", TERMINATE_GRACE);
        if let Err(e) = child.start_kill() {
            warn!("Failed to kill OpenVPN: {}", e);
        }
        self.kill_at = None;
    }

    fn request(&mut self, child: &mut Child) {
        if self.requested {
            return;
        }
        self.requested = true;

        match platform::terminate(child) {
            Ok(()) => self.kill_at = Some(Instant::now() + TERMINATE_GRACE),
            Err(e) => {
                warn!("Failed to signal OpenVPN ({}), killing it", e);
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill OpenVPN: {}", e);
                }
            }
        }
    }
}

/// Surface an output line and report whether it is the failure marker
fn scan_line(line: &str) -> bool {
    info!(target: "openvpn", "{}", line);
    if line.contains(AUTH_FAILED_MARKER) {
        warn!("OpenVPN reported {}", AUTH_FAILED_MARKER);
        return true;
    }
    false
}

/// Next line from an output stream, or `None` once it is closed
///
/// A closed stream is set to `None`; a `None` stream never yields.
async fn next_line<R>(lines: &mut Option<Lines<R>>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    let Some(reader) = lines.as_mut() else {
        return std::future::pending().await;
    };

    match reader.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) => {
            *lines = None;
            None
        }
        Err(e) => {
            debug!("Stopped reading OpenVPN output: {}", e);
            *lines = None;
            None
        }
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Write an executable shell script standing in for OpenVPN
    ///
    /// The script sees the usual arguments: `$2` is the config file and
    /// `$4` the credentials file.
    pub(crate) fn fake_openvpn(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("openvpn");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn supervisor(dir: &TempDir, body: &str) -> ProcessSupervisor {
        let binary = fake_openvpn(dir.path(), body);
        let config = dir.path().join("client.ovpn");
        std::fs::write(&config, "remote vpn.example.com 443\n").unwrap();
        ProcessSupervisor::new(binary, config)
    }

    async fn run(supervisor: &ProcessSupervisor, dir: &TempDir) -> ProcessOutcome {
        let (_tx, mut shutdown) = watch::channel(false);
        let credentials = dir.path().join("creds");
        tokio::time::timeout(
            Duration::from_secs(10),
            supervisor.run(&credentials, &mut shutdown),
        )
        .await
        .expect("supervisor should finish")
        .unwrap()
    }

    fn process_alive(pid_file: &Path) -> bool {
        use nix::sys::signal;
        use nix::unistd::Pid;

        let pid: i32 = std::fs::read_to_string(pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        signal::kill(Pid::from_raw(pid), None).is_ok()
    }

    #[tokio::test]
    async fn test_natural_exit() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir, "echo 'Initialization Sequence Completed'\nexit 0");

        let outcome = run(&supervisor, &dir).await;

        match outcome {
            ProcessOutcome::Exited(status) => assert!(status.success()),
            other => panic!("Expected Exited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir, "echo 'Exiting due to fatal error' >&2\nexit 3");

        let outcome = run(&supervisor, &dir).await;

        match outcome {
            ProcessOutcome::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("Expected Exited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_arguments_passed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("creds"), "N/A\nsecret\n").unwrap();
        let supervisor = supervisor(
            &dir,
            "[ \"$1\" = --config ] && [ \"$3\" = --auth-user-pass ] || exit 9\n\
             cp \"$4\" \"$(dirname \"$4\")/seen\"",
        );

        let outcome = run(&supervisor, &dir).await;

        assert!(matches!(outcome, ProcessOutcome::Exited(status) if status.success()));
        let seen = std::fs::read_to_string(dir.path().join("seen")).unwrap();
        assert_eq!(seen, "N/A\nsecret\n");
    }

    #[tokio::test]
    async fn test_auth_failed_terminates_process() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        let supervisor = supervisor(
            &dir,
            &format!(
                "echo $$ > {}\n\
                 echo 'AUTH: Received control message: AUTH_FAILED'\n\
                 exec sleep 30",
                pid_file.display()
            ),
        );

        let outcome = run(&supervisor, &dir).await;

        assert_eq!(outcome, ProcessOutcome::AuthFailed);
        assert!(!process_alive(&pid_file));
    }

    #[tokio::test]
    async fn test_auth_failed_on_stderr() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir, "echo 'AUTH_FAILED' >&2\nexec sleep 30");

        let outcome = run(&supervisor, &dir).await;

        assert_eq!(outcome, ProcessOutcome::AuthFailed);
    }

    #[tokio::test]
    async fn test_auth_failed_wins_over_exit() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(
            &dir,
            "echo AUTH_FAILED\n\
             echo 'SIGTERM[soft,auth-failure] received, process exiting'\n\
             exit 0",
        );

        let outcome = run(&supervisor, &dir).await;

        assert_eq!(outcome, ProcessOutcome::AuthFailed);
    }

    #[tokio::test]
    async fn test_interrupt_terminates_process() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        let supervisor = supervisor(
            &dir,
            &format!("echo $$ > {}\nexec sleep 30", pid_file.display()),
        );
        let credentials = dir.path().join("creds");
        let (tx, mut shutdown) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(true);
        });
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            supervisor.run(&credentials, &mut shutdown),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(outcome, ProcessOutcome::Interrupted);
        assert!(!process_alive(&pid_file));
    }

    async fn run_interrupted_after(
        supervisor: &ProcessSupervisor,
        dir: &TempDir,
        delay: Duration,
    ) -> ProcessOutcome {
        let credentials = dir.path().join("creds");
        let (tx, mut shutdown) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(true);
        });
        tokio::time::timeout(
            Duration::from_secs(15),
            supervisor.run(&credentials, &mut shutdown),
        )
        .await
        .expect("interrupt should stop the client")
        .unwrap()
    }

    #[tokio::test]
    async fn test_interrupt_stops_chatty_client() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        let supervisor = supervisor(
            &dir,
            &format!(
                "echo $$ > {}
exec yes 'Data Channel: packet'",
                pid_file.display()
            ),
        );

        let outcome = run_interrupted_after(&supervisor, &dir, Duration::from_millis(200)).await;

        assert_eq!(outcome, ProcessOutcome::Interrupted);
        assert!(!process_alive(&pid_file));
    }

    #[tokio::test]
    async fn test_chatty_client_ignoring_sigterm_is_killed() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(
            &dir,
            "trap '' TERM
while :; do echo 'Data Channel: packet'; done",
        );

        let outcome = run_interrupted_after(&supervisor, &dir, Duration::from_millis(200)).await;

        assert_eq!(outcome, ProcessOutcome::Interrupted);
    }

    #[tokio::test]
    async fn test_spawn_then_supervise() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir, "exit 5");
        let (_tx, mut shutdown) = watch::channel(false);

        let client = supervisor.spawn(&dir.path().join("creds")).unwrap();
        let outcome = client.supervise(&mut shutdown).await.unwrap();

        assert!(matches!(outcome, ProcessOutcome::Exited(status) if status.code() == Some(5)));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let supervisor = ProcessSupervisor::new(
            dir.path().join("missing-openvpn"),
            dir.path().join("client.ovpn"),
        );
        let (_tx, mut shutdown) = watch::channel(false);

        let result = supervisor.run(&dir.path().join("creds"), &mut shutdown).await;

        assert!(matches!(result, Err(SupervisorError::SpawnError { .. })));
    }

    #[test]
    fn test_scan_line() {
        assert!(scan_line("AUTH: Received control message: AUTH_FAILED"));
        assert!(!scan_line("Initialization Sequence Completed"));
    }
}
