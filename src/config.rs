// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::slurm::validate::SlurmRules;
use crate::ssh::{AuthMethod, SshParams};
use crate::state::models::Credential;

const APP_DIR_NAME: &str = "jobsupd";
const CONFIG_FILE_NAME: &str = "jobsupd.toml";
const DATABASE_FILE_NAME: &str = "jobsupd.sqlite";
const DEFAULT_QUEUE_TICK_SECS: u64 = 3;
const DEFAULT_MAINTAIN_TICK_SECS: u64 = 3;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DEFAULT_KEEPALIVE_SECS: u64 = 60;

fn default_ssh_port() -> u16 {
    22
}

fn default_capacity() -> usize {
    5
}

/// One downstream batch cluster.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClusterConfig {
    pub ip: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Remote base path all workspaces and the staging cache live under.
    pub root_path: String,
    #[serde(default = "default_capacity")]
    pub job_pool_capacity: usize,
    #[serde(default)]
    pub is_community_account: bool,
    /// SHA-256 fingerprint the cluster's host key must match; unset means
    /// the first presented key is accepted (and logged, so it can be
    /// pinned).
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    #[serde(default)]
    pub community_login: Option<CommunityLogin>,
    #[serde(default)]
    pub globus: Option<GlobusEndpoint>,
    #[serde(default)]
    pub slurm_input_rules: Option<SlurmRules>,
    #[serde(default)]
    pub slurm_global_cap: Option<SlurmRules>,
    /// Extra bind mounts injected into container wraps.
    #[serde(default)]
    pub mount: Vec<MountPoint>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommunityLogin {
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GlobusEndpoint {
    pub endpoint: String,
    pub root_path: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MountPoint {
    pub from: String,
    pub to: String,
}

/// Container image paths keyed by cluster name.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub hpc_path: HashMap<String, String>,
}

/// Environment bootstrap lines emitted into submission scripts.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub env_init: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    database_path: Option<String>,
    redis_url: Option<String>,
    queue_tick_secs: Option<u64>,
    maintain_tick_secs: Option<u64>,
    shutdown_grace_secs: Option<u64>,
    git_mirror_root: Option<String>,
    scratch_dir: Option<String>,
    #[serde(default)]
    clusters: HashMap<String, ClusterConfig>,
    #[serde(default)]
    containers: HashMap<String, ContainerConfig>,
    #[serde(default)]
    kernels: HashMap<String, KernelConfig>,
}

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub redis_url: Option<String>,
    pub queue_tick_secs: u64,
    pub maintain_tick_secs: u64,
    pub shutdown_grace_secs: u64,
    pub git_mirror_root: PathBuf,
    pub scratch_dir: PathBuf,
    pub clusters: HashMap<String, ClusterConfig>,
    pub containers: HashMap<String, ContainerConfig>,
    pub kernels: HashMap<String, KernelConfig>,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub queue_tick_secs: Option<u64>,
}

pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    let required = config_path_override.is_some();
    let config_path = match config_path_override {
        Some(path) => Some(expand_path(path)),
        None => default_config_path().ok(),
    };

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };

    let base_dir = config_path.as_deref().and_then(|path| path.parent());
    let database_path = match overrides.database_path {
        Some(path) => expand_path(path),
        None => match file_config.database_path {
            Some(raw) => resolve_path(&raw, base_dir),
            None => default_database_path().with_context(|| {
                "failed to resolve default database path; specify --database-path or set database_path in the config file"
            })?,
        },
    };

    let git_mirror_root = match file_config.git_mirror_root {
        Some(raw) => resolve_path(&raw, base_dir),
        None => default_data_dir()?.join("mirrors"),
    };
    let scratch_dir = match file_config.scratch_dir {
        Some(raw) => resolve_path(&raw, base_dir),
        None => std::env::temp_dir().join(APP_DIR_NAME),
    };

    Ok(Config {
        database_path,
        redis_url: overrides.redis_url.or(file_config.redis_url),
        queue_tick_secs: overrides
            .queue_tick_secs
            .or(file_config.queue_tick_secs)
            .unwrap_or(DEFAULT_QUEUE_TICK_SECS),
        maintain_tick_secs: file_config
            .maintain_tick_secs
            .unwrap_or(DEFAULT_MAINTAIN_TICK_SECS),
        shutdown_grace_secs: file_config
            .shutdown_grace_secs
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
        git_mirror_root,
        scratch_dir,
        clusters: file_config.clusters,
        containers: file_config.containers,
        kernels: file_config.kernels,
        config_path,
    })
}

impl ClusterConfig {
    /// Shell parameters for the shared community account, when configured.
    pub fn community_ssh_params(&self) -> Option<SshParams> {
        let login = self.community_login.as_ref()?;
        let auth = match (&login.identity_file, &login.password) {
            (Some(identity), _) => AuthMethod::Identity(identity.clone()),
            (None, Some(password)) => AuthMethod::Password(password.clone()),
            (None, None) => return None,
        };
        Some(SshParams {
            host: self.ip.clone(),
            port: self.port,
            username: login.user.clone(),
            auth,
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            host_fingerprint: self.host_key_fingerprint.clone(),
        })
    }

    /// Shell parameters for a private-account job.
    pub fn private_ssh_params(&self, credential: &Credential) -> SshParams {
        SshParams {
            host: self.ip.clone(),
            port: self.port,
            username: credential.user.clone(),
            auth: AuthMethod::Password(credential.password.clone()),
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            host_fingerprint: self.host_key_fingerprint.clone(),
        }
    }
}

pub fn ensure_database_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    Ok(())
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn default_database_path() -> Result<PathBuf> {
    Ok(default_data_dir()?.join(DATABASE_FILE_NAME))
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data directory")?;
    Ok(base.join(APP_DIR_NAME))
}
