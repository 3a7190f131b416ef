// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

mod session;
pub mod pool;

pub use session::SessionManager;

/// Parameters for establishing one authenticated SSH connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    /// Send TCP keepalives to keep long connections healthy.
    pub keepalive_secs: u64,
    /// Expected SHA-256 host key fingerprint; connections to a server
    /// presenting a different key are refused.
    pub host_fingerprint: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    Password(String),
    Identity(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum ShellError {
    /// Connection-level failure; worth retrying with backoff.
    #[error("transport error: {0}")]
    Transport(String),
    /// The remote command ran and reported failure.
    #[error("remote command exited with {exit_code}: {stderr}")]
    Remote { exit_code: i32, stderr: String },
    #[error("{0}")]
    Fatal(String),
}

impl ShellError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ShellError::Transport(_))
    }
}

/// Stateful handle to one authenticated remote account. Carries no policy:
/// callers decide what to run and how failures escalate. `exec` is blocking
/// (one command at a time per session) and reports non-zero exit codes as
/// part of the output, not as an error.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn exec(&self, cmd: &str) -> Result<ExecOutput, ShellError>;

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), ShellError>;

    async fn download(&self, remote: &str, local: &Path) -> Result<(), ShellError>;

    async fn mkdir_p(&self, path: &str) -> Result<(), ShellError>;

    async fn exists(&self, path: &str) -> Result<bool, ShellError>;

    async fn rm_rf(&self, path: &str) -> Result<(), ShellError>;

    /// Unpack a tar.zst archive on the remote into `dest`.
    async fn extract_archive(&self, archive: &str, dest: &str) -> Result<(), ShellError>;

    async fn is_connected(&self) -> bool;

    /// Close the transport. Idempotent.
    async fn dispose(&self);
}

/// Runs a command and maps a non-zero exit code to `ShellError::Remote`.
pub async fn exec_checked(shell: &dyn RemoteShell, cmd: &str) -> Result<ExecOutput, ShellError> {
    let out = shell.exec(cmd).await?;
    if out.success() {
        Ok(out)
    } else {
        Err(ShellError::Remote {
            exit_code: out.exit_code,
            stderr: out.stderr,
        })
    }
}

pub trait ShellFactory: Send + Sync {
    fn build(&self, params: SshParams) -> Arc<dyn RemoteShell>;
}

#[derive(Default)]
pub struct RusshShellFactory;

impl ShellFactory for RusshShellFactory {
    fn build(&self, params: SshParams) -> Arc<dyn RemoteShell> {
        Arc::new(SessionManager::new(params))
    }
}
