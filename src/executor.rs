//! Remote command execution
//!
//! Everything the hub learns about a node comes through [`RemoteExecutor`].
//! The production implementation, [`SshExecutor`], shells out to the system
//! `ssh` client and feeds the script on stdin, so multi-line batch scripts
//! need no quoting.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::SshConfig;

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            identity_file: None,
        }
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Captured result of a completed remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    /// A non-zero exit still counts when the script produced output.
    ///
    /// Batch scripts chain many probes and the last one decides the exit
    /// code, so stdout is the better signal.
    pub fn is_usable(&self) -> bool {
        self.exit_code == Some(0) || !self.stdout.trim().is_empty()
    }
}

/// Errors from running a remote command
#[derive(Debug)]
pub enum ExecError {
    /// The command did not finish within its deadline
    Timeout(Duration),

    /// ssh could not reach or authenticate against the host
    Connection(String),

    /// The local ssh process could not be started or driven
    Spawn(std::io::Error),
}

impl ExecError {
    /// Whether retrying later might succeed without intervention
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::Timeout(_) | ExecError::Connection(_))
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Timeout(d) => write!(f, "command timed out after {}ms", d.as_millis()),
            ExecError::Connection(msg) => write!(f, "ssh connection failed: {}", msg),
            ExecError::Spawn(err) => write!(f, "failed to run ssh: {}", err),
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecError::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        ExecError::Spawn(err)
    }
}

/// Runs a command or script on a remote host
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError>;
}

/// ssh exits with 255 when the connection itself failed
const SSH_CONNECTION_EXIT: i32 = 255;

/// [`RemoteExecutor`] backed by the OpenSSH client binary
#[derive(Debug, Clone)]
pub struct SshExecutor {
    config: SshConfig,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, target: &SshTarget) -> Command {
        let mut cmd = Command::new(&self.config.binary);

        cmd.arg("-p")
            .arg(target.port.to_string())
            .args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs))
            .arg("-o")
            .arg(format!(
                "StrictHostKeyChecking={}",
                if self.config.strict_host_key_checking {
                    "yes"
                } else {
                    "accept-new"
                }
            ));

        if let Some(path) = &self.config.control_path {
            cmd.args(["-o", "ControlMaster=auto"])
                .arg("-o")
                .arg(format!("ControlPath={}", path.display()))
                .arg("-o")
                .arg(format!("ControlPersist={}s", self.config.control_persist_secs));
        }

        if let Some(identity) = &target.identity_file {
            cmd.arg("-i").arg(identity);
        }

        cmd.arg(target.destination())
            .args(["sh", "-s"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd
    }

    async fn exec(&self, target: &SshTarget, script: &str) -> Result<ExecOutput, ExecError> {
        let mut child = self.build_command(target).spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            // closing stdin ends the remote `sh -s`
            drop(stdin);
        }

        let output = child.wait_with_output().await?;

        let result = ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        };

        if result.exit_code == Some(SSH_CONNECTION_EXIT) {
            let msg = result.stderr.trim();
            return Err(ExecError::Connection(if msg.is_empty() {
                format!("ssh exited with status {SSH_CONNECTION_EXIT}")
            } else {
                msg.to_string()
            }));
        }

        Ok(result)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError> {
        let start = Instant::now();
        trace!(%target, "running remote command");

        // dropping the future on timeout kills the ssh child
        let result = match tokio::time::timeout(timeout, self.exec(target, command)).await {
            Ok(result) => result,
            Err(_) => Err(ExecError::Timeout(timeout)),
        };

        debug!(
            %target,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "remote command finished"
        );

        result
    }
}
