// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Selects the maintainer variant driving a job's remote lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintainerKind {
    BasicSlurm,
    CommunityContribution,
}

impl MaintainerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintainerKind::BasicSlurm => "basic_slurm",
            MaintainerKind::CommunityContribution => "community_contribution",
        }
    }
}

#[derive(Debug)]
pub struct ParseMaintainerKindError(pub String);

impl std::fmt::Display for ParseMaintainerKindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown maintainer kind: {}", self.0)
    }
}

impl std::error::Error for ParseMaintainerKindError {}

impl FromStr for MaintainerKind {
    type Err = ParseMaintainerKindError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic_slurm" => Ok(MaintainerKind::BasicSlurm),
            "community_contribution" => Ok(MaintainerKind::CommunityContribution),
            other => Err(ParseMaintainerKindError(other.to_string())),
        }
    }
}

/// Logical source of a staged folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FolderSource {
    /// A directory on the supervisor host.
    Local { path: PathBuf },
    /// A clone of a registered repository.
    Git { git_id: String },
    /// Remote-to-remote bulk transfer source.
    Globus { endpoint: String, path: String },
    /// Fresh empty directory, no source.
    Empty,
}

/// The unit of work. Mutated by exactly one maintainer worker after
/// admission; before admission only `queued_at` may change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub hpc: String,
    pub maintainer: MaintainerKind,
    pub credential_id: Option<String>,
    pub param: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub slurm: HashMap<String, String>,
    pub local_executable_folder: Option<FolderSource>,
    pub local_data_folder: Option<FolderSource>,
    /// Folder row ids, filled in by the maintainer during init.
    pub remote_data_folder: Option<String>,
    pub remote_executable_folder: Option<String>,
    pub remote_result_folder: Option<String>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub initialized_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub is_failed: bool,
    pub usage: UsageCounters,
}

impl Job {
    pub fn new(user_id: &str, hpc: &str, maintainer: MaintainerKind) -> Self {
        Self {
            id: crate::util::random::generate_id(),
            user_id: user_id.to_string(),
            hpc: hpc.to_string(),
            maintainer,
            credential_id: None,
            param: HashMap::new(),
            env: HashMap::new(),
            slurm: HashMap::new(),
            local_executable_folder: None,
            local_data_folder: None,
            remote_data_folder: None,
            remote_executable_folder: None,
            remote_result_folder: None,
            created_at: Utc::now(),
            queued_at: None,
            initialized_at: None,
            finished_at: None,
            is_failed: false,
            usage: UsageCounters::default(),
        }
    }
}

/// Resource consumption collected from accounting after completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub nodes: Option<i64>,
    pub cpus: Option<i64>,
    pub cpu_time: Option<i64>,
    pub memory: Option<i64>,
    pub memory_usage: Option<i64>,
    pub walltime: Option<i64>,
}

/// Remote workspace descriptor. Persists for audit; soft-deletable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub hpc: String,
    pub user_id: String,
    pub hpc_path: String,
    pub globus_path: Option<String>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Content-addressed record of a staged source. A row exists iff the remote
/// archive exists; staleness is judged against the source's authoritative
/// timestamp where one is defined (git last-commit time).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub hpc: String,
    pub hpc_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registered git repository usable as an executable source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRecord {
    pub id: String,
    pub address: String,
    pub created_at: DateTime<Utc>,
}

/// Ephemeral private-account credential, stored in the keyed secret store
/// for the lifetime of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    JobQueued,
    JobRegistered,
    JobInit,
    JobInitError,
    JobRetry,
    JobFailed,
    JobEnded,
    SlurmUploadExecutable,
    SlurmUploadData,
    SlurmCreateResult,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobQueued => "JOB_QUEUED",
            EventType::JobRegistered => "JOB_REGISTERED",
            EventType::JobInit => "JOB_INIT",
            EventType::JobInitError => "JOB_INIT_ERROR",
            EventType::JobRetry => "JOB_RETRY",
            EventType::JobFailed => "JOB_FAILED",
            EventType::JobEnded => "JOB_ENDED",
            EventType::SlurmUploadExecutable => "SLURM_UPLOAD_EXECUTABLE",
            EventType::SlurmUploadData => "SLURM_UPLOAD_DATA",
            EventType::SlurmCreateResult => "SLURM_CREATE_RESULT",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub job_id: String,
    pub event_type: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub job_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Per-job descriptor bundled with a git source: declares the container,
/// the pre/execution/post stages and the default result file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableManifest {
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub cvmfs: bool,
    #[serde(default)]
    pub pre_processing_stage: Option<String>,
    pub execution_stage: String,
    #[serde(default)]
    pub post_processing_stage: Option<String>,
    #[serde(default)]
    pub default_result_file: Option<String>,
}
