// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::ChannelMsg;
use russh::client::{AuthResult, Config, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::HashAlg;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::fs as tokiofs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use super::{AuthMethod, ExecOutput, RemoteShell, ShellError, SshParams};
use crate::util::remote_path::{join_remote, sh_escape};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Per-channel flow control sized for streaming archive uploads.
const CHANNEL_BUFFER: usize = 128;
const CHANNEL_WINDOW: u32 = 2 * 1024 * 1024;

/// Client handler carrying this cluster's host-key policy. A configured
/// fingerprint pins the server key; without one the presented key is
/// accepted and logged so operators can pin it afterwards.
#[derive(Clone, Debug)]
struct ClientHandler {
    host: String,
    pinned_fingerprint: Option<String>,
}

/// Fingerprints are compared without the leading `SHA256:` tag so config
/// files can carry either form.
fn strip_fingerprint_tag(raw: &str) -> &str {
    raw.trim().strip_prefix("SHA256:").unwrap_or(raw.trim())
}

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;
    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let presented = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match &self.pinned_fingerprint {
            Some(pinned) => {
                if strip_fingerprint_tag(pinned) == strip_fingerprint_tag(&presented) {
                    Ok(true)
                } else {
                    tracing::error!(
                        host = %self.host,
                        %presented,
                        "server host key does not match the pinned fingerprint; refusing"
                    );
                    Ok(false)
                }
            }
            None => {
                tracing::warn!(
                    host = %self.host,
                    %presented,
                    "no host key fingerprint pinned for this cluster; accepting presented key"
                );
                Ok(true)
            }
        }
    }
}

fn transport(err: impl std::fmt::Display) -> ShellError {
    ShellError::Transport(err.to_string())
}

/// Accumulated output of one captured remote command.
#[derive(Default)]
struct ExecCollector {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i32,
}

impl ExecCollector {
    /// Feed one channel message; returns true once the channel closed and
    /// the capture is complete.
    fn absorb(&mut self, msg: &ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => self.stdout.extend_from_slice(data),
            // extended stream 1 carries stderr
            ChannelMsg::ExtendedData { data, ext: 1 } => self.stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => self.exit_code = *exit_status as i32,
            ChannelMsg::Close => return true,
            _ => {}
        }
        false
    }

    fn into_output(self) -> ExecOutput {
        ExecOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            exit_code: self.exit_code,
        }
    }
}

fn handle_is_live(handle_field: &Option<Handle<ClientHandler>>) -> bool {
    handle_field.as_ref().is_some_and(|h| !h.is_closed())
}

/// Owns a single long-lived SSH connection to one remote account.
/// Commands are serialized by the handle mutex; the connection is
/// (re)established lazily on first use after a drop.
pub struct SessionManager {
    params: SshParams,
    config: Arc<Config>,
    handle: Arc<Mutex<Option<Handle<ClientHandler>>>>,
}

/// Transport tuning derived from the session parameters: the inactivity
/// cutoff tracks the keepalive cadence so a healthy keepalive never trips
/// it.
fn transport_config(params: &SshParams) -> Config {
    Config {
        inactivity_timeout: Some(Duration::from_secs(params.keepalive_secs.saturating_mul(2))),
        keepalive_interval: Some(Duration::from_secs(params.keepalive_secs)),
        channel_buffer_size: CHANNEL_BUFFER,
        window_size: CHANNEL_WINDOW,
        ..Default::default()
    }
}

impl SessionManager {
    pub fn new(params: SshParams) -> Self {
        let config = Arc::new(transport_config(&params));
        Self {
            params,
            config,
            handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn params(&self) -> &SshParams {
        &self.params
    }

    async fn ensure_connected(
        &self,
        handle_field: &mut Option<Handle<ClientHandler>>,
    ) -> Result<(), ShellError> {
        if handle_is_live(handle_field) {
            return Ok(());
        }
        // a closed handle is as good as none; reconnect from scratch
        handle_field.take();

        tracing::debug!(
            host = %self.params.host,
            username = %self.params.username,
            "establishing SSH connection"
        );
        let handler = ClientHandler {
            host: self.params.host.clone(),
            pinned_fingerprint: self.params.host_fingerprint.clone(),
        };
        let addr = (self.params.host.as_str(), self.params.port);
        let mut handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            russh::client::connect(self.config.clone(), addr, handler),
        )
        .await
        .map_err(|_| transport(format!("connect to {} timed out", self.params.host)))?
        .map_err(transport)?;

        let result = match &self.params.auth {
            AuthMethod::Password(password) => handle
                .authenticate_password(self.params.username.clone(), password.clone())
                .await
                .map_err(transport)?,
            AuthMethod::Identity(path) => {
                let key = russh::keys::load_secret_key(path, None).map_err(|e| {
                    ShellError::Fatal(format!(
                        "failed to load secret key at {}: {e}",
                        path.display()
                    ))
                })?;
                // Prefer SHA-256 for RSA if applicable (ignored for non-RSA keys)
                let pk = PrivateKeyWithHashAlg::new(
                    Arc::new(key),
                    handle
                        .best_supported_rsa_hash()
                        .await
                        .map_err(transport)?
                        .flatten(),
                );
                handle
                    .authenticate_publickey(self.params.username.clone(), pk)
                    .await
                    .map_err(transport)?
            }
        };

        match result {
            AuthResult::Success => {
                *handle_field = Some(handle);
                Ok(())
            }
            AuthResult::Failure { .. } => Err(ShellError::Fatal(format!(
                "authentication failed for {}@{}",
                self.params.username, self.params.host
            ))),
        }
    }

    async fn sftp(&self, handle: &Handle<ClientHandler>) -> Result<SftpSession, ShellError> {
        let channel = handle.channel_open_session().await.map_err(transport)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(transport)?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(transport)
    }

    async fn upload_file(
        &self,
        sftp: &SftpSession,
        local: &Path,
        remote: &str,
    ) -> Result<(), ShellError> {
        let mut lf = tokiofs::File::open(local).await.map_err(transport)?;
        let flags = OpenFlags::WRITE
            .union(OpenFlags::CREATE)
            .union(OpenFlags::TRUNCATE);
        let mut rf = sftp
            .open_with_flags(remote, flags)
            .await
            .map_err(transport)?;
        tokio::io::copy(&mut lf, &mut rf).await.map_err(transport)?;
        rf.flush().await.map_err(transport)?;
        rf.shutdown().await.map_err(transport)?;
        Ok(())
    }

    async fn download_file(
        &self,
        sftp: &SftpSession,
        remote: &str,
        local: &Path,
    ) -> Result<(), ShellError> {
        if let Some(parent) = local.parent() {
            tokiofs::create_dir_all(parent).await.map_err(transport)?;
        }
        let mut rf = sftp.open(remote).await.map_err(transport)?;
        let mut lf = tokiofs::File::create(local).await.map_err(transport)?;
        tokio::io::copy(&mut rf, &mut lf).await.map_err(transport)?;
        lf.flush().await.map_err(transport)?;
        Ok(())
    }

    async fn ensure_remote_dir(&self, sftp: &SftpSession, path: &str) -> Result<(), ShellError> {
        for cur in cumulative_dir_paths(path) {
            match sftp.metadata(&cur).await {
                Ok(meta) => {
                    if !meta.is_dir() {
                        return Err(ShellError::Fatal(format!(
                            "remote path exists but is not a directory: {cur}"
                        )));
                    }
                }
                Err(_) => {
                    let attrs = FileAttributes {
                        permissions: Some(0o700),
                        ..Default::default()
                    };
                    sftp.create_dir(&cur).await.map_err(transport)?;
                    let _ = sftp.set_metadata(&cur, attrs).await;
                }
            }
        }
        Ok(())
    }
}

/// All cumulative prefixes of an absolute remote directory, shallowest first.
fn cumulative_dir_paths(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        cur.push('/');
        cur.push_str(part);
        out.push(cur.clone());
    }
    out
}

#[async_trait]
impl RemoteShell for SessionManager {
    async fn exec(&self, cmd: &str) -> Result<ExecOutput, ShellError> {
        let mut guard = self.handle.lock().await;
        self.ensure_connected(&mut guard).await?;
        let handle = guard
            .as_ref()
            .ok_or_else(|| transport("SSH handle lost after connect"))?;

        tracing::debug!(host = %self.params.host, command = %cmd, "exec");
        let mut chan = handle.channel_open_session().await.map_err(transport)?;
        chan.exec(true, cmd).await.map_err(transport)?;

        let mut collector = ExecCollector::default();
        while let Some(msg) = chan.wait().await {
            if collector.absorb(&msg) {
                break;
            }
        }
        let _ = chan.eof().await;
        let _ = chan.close().await;

        Ok(collector.into_output())
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), ShellError> {
        let mut guard = self.handle.lock().await;
        self.ensure_connected(&mut guard).await?;
        let handle = guard
            .as_ref()
            .ok_or_else(|| transport("SSH handle lost after connect"))?;
        let sftp = self.sftp(handle).await?;

        let meta = tokiofs::metadata(local).await.map_err(transport)?;
        if meta.is_file() {
            return self.upload_file(&sftp, local, remote).await;
        }

        self.ensure_remote_dir(&sftp, remote).await?;
        for entry in WalkDir::new(local).follow_links(false) {
            let entry = entry.map_err(|e| ShellError::Fatal(e.to_string()))?;
            let rel = entry
                .path()
                .strip_prefix(local)
                .map_err(|e| ShellError::Fatal(e.to_string()))?;
            if rel.as_os_str().is_empty() || entry.file_type().is_symlink() {
                continue;
            }
            let remote_child = join_remote(remote, &rel.to_string_lossy());
            if entry.file_type().is_dir() {
                self.ensure_remote_dir(&sftp, &remote_child).await?;
            } else {
                self.upload_file(&sftp, entry.path(), &remote_child).await?;
            }
        }
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), ShellError> {
        let mut guard = self.handle.lock().await;
        self.ensure_connected(&mut guard).await?;
        let handle = guard
            .as_ref()
            .ok_or_else(|| transport("SSH handle lost after connect"))?;
        let sftp = self.sftp(handle).await?;

        let meta = sftp.metadata(remote).await.map_err(transport)?;
        if !meta.is_dir() {
            return self.download_file(&sftp, remote, local).await;
        }

        let mut stack = vec![(remote.trim_end_matches('/').to_string(), local.to_path_buf())];
        while let Some((remote_base, local_base)) = stack.pop() {
            tokiofs::create_dir_all(&local_base)
                .await
                .map_err(transport)?;
            let entries = sftp.read_dir(&remote_base).await.map_err(transport)?;
            for entry in entries {
                let name = entry.file_name();
                let remote_child = format!("{}/{}", remote_base, name);
                let local_child = local_base.join(&name);
                if entry.metadata().is_dir() {
                    stack.push((remote_child, local_child));
                } else {
                    self.download_file(&sftp, &remote_child, &local_child)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn mkdir_p(&self, path: &str) -> Result<(), ShellError> {
        let mut guard = self.handle.lock().await;
        self.ensure_connected(&mut guard).await?;
        let handle = guard
            .as_ref()
            .ok_or_else(|| transport("SSH handle lost after connect"))?;
        let sftp = self.sftp(handle).await?;
        self.ensure_remote_dir(&sftp, path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, ShellError> {
        let mut guard = self.handle.lock().await;
        self.ensure_connected(&mut guard).await?;
        let handle = guard
            .as_ref()
            .ok_or_else(|| transport("SSH handle lost after connect"))?;
        let sftp = self.sftp(handle).await?;
        sftp.try_exists(path).await.map_err(transport)
    }

    async fn rm_rf(&self, path: &str) -> Result<(), ShellError> {
        let out = self.exec(&format!("rm -rf {}", sh_escape(path))).await?;
        if out.success() {
            Ok(())
        } else {
            Err(ShellError::Remote {
                exit_code: out.exit_code,
                stderr: out.stderr,
            })
        }
    }

    async fn extract_archive(&self, archive: &str, dest: &str) -> Result<(), ShellError> {
        let cmd = format!(
            "mkdir -p {dest} && tar --zstd -xf {archive} -C {dest}",
            archive = sh_escape(archive),
            dest = sh_escape(dest),
        );
        let out = self.exec(&cmd).await?;
        if out.success() {
            Ok(())
        } else {
            Err(ShellError::Remote {
                exit_code: out.exit_code,
                stderr: out.stderr,
            })
        }
    }

    async fn is_connected(&self) -> bool {
        handle_is_live(&*self.handle.lock().await)
    }

    async fn dispose(&self) {
        let mut guard = self.handle.lock().await;
        let _ = guard.take();
    }
}
