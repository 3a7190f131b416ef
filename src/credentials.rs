// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::ClusterConfig;
use crate::ssh::{AuthMethod, ShellFactory, SshParams};
use crate::state::models::Credential;
use crate::state::queue::CredentialVault;
use crate::util::random::generate_id;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("unable to check credentials with {hpc}: {reason}")]
    Validation { hpc: String, reason: String },
    #[error("failed to store credential: {0}")]
    Storage(String),
}

/// Validates user-supplied SSH credentials against a cluster with a
/// throwaway connection, then parks them in the short-lived secret store
/// under an opaque id for the supervisor to pick up at admission.
pub struct CredentialGuard {
    factory: Arc<dyn ShellFactory>,
    vault: CredentialVault,
    ttl: Duration,
}

impl CredentialGuard {
    pub fn new(factory: Arc<dyn ShellFactory>, vault: CredentialVault, ttl: Duration) -> Self {
        Self { factory, vault, ttl }
    }

    /// Opens a shell with the supplied credentials, runs a trivial command
    /// and disposes the shell. Any failure along the way surfaces as a
    /// validation error naming the cluster.
    pub async fn validate_private_account(
        &self,
        hpc: &str,
        cluster: &ClusterConfig,
        user: &str,
        password: &str,
    ) -> Result<(), CredentialError> {
        let params = SshParams {
            host: cluster.ip.clone(),
            port: cluster.port,
            username: user.to_string(),
            auth: AuthMethod::Password(password.to_string()),
            keepalive_secs: 60,
            host_fingerprint: cluster.host_key_fingerprint.clone(),
        };
        let shell = self.factory.build(params);
        let probe = shell.exec("echo").await;
        shell.dispose().await;

        match probe {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(CredentialError::Validation {
                hpc: hpc.to_string(),
                reason: format!("probe exited with {}", out.exit_code),
            }),
            Err(err) => Err(CredentialError::Validation {
                hpc: hpc.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    /// Generates an opaque id and writes the credential under it.
    pub async fn register_credential(
        &self,
        user: &str,
        password: &str,
    ) -> Result<String, CredentialError> {
        let credential = Credential {
            id: generate_id(),
            user: user.to_string(),
            password: password.to_string(),
        };
        self.vault
            .put(&credential, self.ttl)
            .await
            .map_err(|e| CredentialError::Storage(e.to_string()))?;
        Ok(credential.id)
    }
}
