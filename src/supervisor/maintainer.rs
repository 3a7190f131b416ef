// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{ClusterConfig, ContainerConfig, KernelConfig};
use crate::events::EventEmitter;
use crate::slurm::script::{JobPaths, ScriptSpec, render_sbatch, submit_command};
use crate::slurm::status::{
    RemoteJobStatus, classify_status, parse_job_id, parse_sacct_usage, sacct_usage_command,
    scancel_command, squeue_status_command,
};
use crate::slurm::validate::{SlurmRequest, validate_slurm};
use crate::ssh::{ExecOutput, RemoteShell, ShellError};
use crate::staging::{StagingEngine, StagingError};
use crate::state::kv::KvStore;
use crate::state::models::{EventType, Folder, FolderSource, Job, MaintainerKind};
use crate::state::store::SupervisorStore;
use crate::util::remote_path::{join_remote, sh_escape};
use crate::util::retry::{BackoffPolicy, with_backoff};

use super::basic::BasicSlurmMaintainer;
use super::community::CommunityMaintainer;

#[derive(Debug, Error)]
pub enum MaintainerError {
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error("{0}")]
    Submission(String),
    #[error("{0}")]
    Manifest(String),
}

/// Everything a maintainer needs to drive one job. Owned by the worker for
/// the maintainer's lifetime; the shell comes from (and goes back to) the
/// connection pool.
pub struct MaintainerCtx {
    pub job: Job,
    pub cluster: ClusterConfig,
    pub shell: Arc<dyn RemoteShell>,
    pub store: SupervisorStore,
    pub kv: Arc<dyn KvStore>,
    pub emitter: EventEmitter,
    pub staging: Arc<StagingEngine>,
    pub containers: HashMap<String, ContainerConfig>,
    pub kernels: HashMap<String, KernelConfig>,
    pub scratch: PathBuf,
    pub backoff: BackoffPolicy,
}

/// Per-job driver embodying the state machine and remote command sequence.
/// Variants differ only in how `init` builds the submission.
#[async_trait]
pub trait Maintainer: Send {
    /// Stage folders, build and submit the job. Idempotent by guard.
    async fn init(&mut self) -> Result<(), MaintainerError>;

    /// One poll of the remote job; drives completion and collection.
    async fn maintain(&mut self) -> Result<(), MaintainerError>;

    /// Scheduler-invoked cancellation of the remote job.
    async fn on_cancel(&mut self);

    /// Terminal failure: emit the event and stop the worker loop.
    async fn mark_failed(&mut self, reason: &str);

    fn is_init(&self) -> bool;
    fn is_end(&self) -> bool;
    fn job_on_hpc(&self) -> bool;
    fn job_id(&self) -> &str;
}

/// Static registry keyed by the job's maintainer discriminator.
pub fn build_maintainer(ctx: MaintainerCtx) -> Box<dyn Maintainer> {
    match ctx.job.maintainer {
        MaintainerKind::BasicSlurm => Box::new(BasicSlurmMaintainer::new(ctx)),
        MaintainerKind::CommunityContribution => Box::new(CommunityMaintainer::new(ctx)),
    }
}

/// Shared mechanics for Slurm-backed maintainers: script upload, sbatch
/// submission, status polling, result collection and teardown flags.
pub(super) struct SlurmDriver {
    pub ctx: MaintainerCtx,
    pub slurm_id: Option<i64>,
    pub is_init: bool,
    pub is_end: bool,
    pub job_on_hpc: bool,
    pub result_path: Option<String>,
    pub default_result_file: Option<String>,
}

impl SlurmDriver {
    pub fn new(ctx: MaintainerCtx) -> Self {
        Self {
            ctx,
            slurm_id: None,
            is_init: false,
            is_end: false,
            job_on_hpc: false,
            result_path: None,
            default_result_file: None,
        }
    }

    /// Run a remote command under bounded exponential backoff, reporting a
    /// recovery at most once per call site.
    pub async fn exec_with_retry(&self, cmd: &str) -> Result<ExecOutput, ShellError> {
        let shell = self.ctx.shell.clone();
        let command = cmd.to_string();
        let result = with_backoff(
            self.ctx.backoff,
            |e: &ShellError| e.is_transient(),
            move || {
                let shell = shell.clone();
                let command = command.clone();
                async move { shell.exec(&command).await }
            },
        )
        .await;

        match result {
            Ok((out, retries)) => {
                if retries > 0 {
                    self.ctx
                        .emitter
                        .emit_event(
                            &self.ctx.job.id,
                            EventType::JobRetry,
                            &format!("remote call recovered after {retries} retries"),
                        )
                        .await;
                }
                Ok(out)
            }
            Err(err) => Err(err),
        }
    }

    async fn upload_with_retry(&self, local: PathBuf, remote: &str) -> Result<(), ShellError> {
        let shell = self.ctx.shell.clone();
        let remote = remote.to_string();
        let result = with_backoff(
            self.ctx.backoff,
            |e: &ShellError| e.is_transient(),
            move || {
                let shell = shell.clone();
                let local = local.clone();
                let remote = remote.clone();
                async move { shell.upload(&local, &remote).await }
            },
        )
        .await;
        match result {
            Ok((_, retries)) => {
                if retries > 0 {
                    self.ctx
                        .emitter
                        .emit_event(
                            &self.ctx.job.id,
                            EventType::JobRetry,
                            &format!("script upload recovered after {retries} retries"),
                        )
                        .await;
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Write the submission script into the executable workspace and run
    /// `sbatch` against it.
    pub async fn submit(
        &mut self,
        spec: &ScriptSpec<'_>,
        executable_path: &str,
    ) -> Result<(), MaintainerError> {
        let script = render_sbatch(spec);

        std::fs::create_dir_all(&self.ctx.scratch)
            .map_err(|e| MaintainerError::Submission(format!("scratch dir unavailable: {e}")))?;
        let local_script = self.ctx.scratch.join(format!("{}.sbatch", self.ctx.job.id));
        tokio::fs::write(&local_script, &script)
            .await
            .map_err(|e| MaintainerError::Submission(format!("failed to write script: {e}")))?;

        let remote_script = join_remote(executable_path, "job.sbatch");
        let uploaded = self.upload_with_retry(local_script.clone(), &remote_script).await;
        let _ = std::fs::remove_file(&local_script);
        uploaded?;

        let out = self
            .exec_with_retry(&submit_command(&remote_script, executable_path))
            .await?;
        if !out.success() {
            return Err(MaintainerError::Submission(format!(
                "sbatch exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        let slurm_id = parse_job_id(&out.stdout).ok_or_else(|| {
            MaintainerError::Submission(format!(
                "could not parse sbatch response: {}",
                out.stdout.trim()
            ))
        })?;

        self.slurm_id = Some(slurm_id);
        self.job_on_hpc = true;
        self.ctx
            .emitter
            .emit_log(
                &self.ctx.job.id,
                &format!("submitted batch job {slurm_id} on {}", self.ctx.job.hpc),
            )
            .await;
        Ok(())
    }

    pub async fn poll_status(&self) -> Result<RemoteJobStatus, MaintainerError> {
        let slurm_id = self
            .slurm_id
            .ok_or_else(|| MaintainerError::Submission("no remote job to poll".to_string()))?;
        let out = self.exec_with_retry(&squeue_status_command(slurm_id)).await?;
        if !out.success() {
            // A finished job falls out of the queue and squeue reports an
            // unknown id; treated as completion.
            return Ok(RemoteJobStatus::Completed);
        }
        let token = out.stdout.lines().next().unwrap_or("");
        Ok(classify_status(token))
    }

    /// Shared maintain step: poll, then either keep waiting, collect and
    /// end, or fail.
    pub async fn drive_maintain(&mut self) -> Result<(), MaintainerError> {
        match self.poll_status().await? {
            RemoteJobStatus::Running => Ok(()),
            RemoteJobStatus::Failed => {
                self.finish(EventType::JobFailed, "slurm reported job failure")
                    .await;
                Ok(())
            }
            RemoteJobStatus::Completed => {
                if let Err(err) = self.collect().await {
                    tracing::warn!(job_id = %self.ctx.job.id, %err, "result collection incomplete");
                }
                self.finish(EventType::JobEnded, "job completed").await;
                Ok(())
            }
        }
    }

    /// Gather usage counters, output tails and the result-folder listing.
    async fn collect(&mut self) -> Result<(), MaintainerError> {
        let Some(slurm_id) = self.slurm_id else {
            return Ok(());
        };

        let out = self.exec_with_retry(&sacct_usage_command(slurm_id)).await?;
        if out.success() {
            let usage = parse_sacct_usage(&out.stdout);
            self.ctx.job.usage = usage;
            if let Err(err) = self.ctx.store.update_usage(&self.ctx.job.id, &usage).await {
                tracing::warn!(job_id = %self.ctx.job.id, %err, "failed to persist usage counters");
            }
        }

        let Some(result_path) = self.result_path.clone() else {
            return Ok(());
        };
        for name in [
            crate::slurm::script::STDOUT_FILE,
            crate::slurm::script::STDERR_FILE,
        ] {
            let out = self
                .exec_with_retry(&format!(
                    "tail -c 2000 {} 2>/dev/null",
                    sh_escape(&join_remote(&result_path, name))
                ))
                .await?;
            if !out.stdout.trim().is_empty() {
                self.ctx
                    .emitter
                    .emit_log(&self.ctx.job.id, &format!("{name}: {}", out.stdout.trim()))
                    .await;
            }
        }

        let out = self
            .exec_with_retry(&format!("ls -1 {}", sh_escape(&result_path)))
            .await?;
        if out.success() {
            let listing = sort_listing(
                out.stdout
                    .lines()
                    .map(|l| l.trim().trim_end_matches('/').to_string())
                    .filter(|l| !l.is_empty())
                    .collect(),
                self.default_result_file.as_deref(),
            );
            match serde_json::to_string(&listing) {
                Ok(payload) => {
                    let key = format!("job_result_folder_content{}", self.ctx.job.id);
                    if let Err(err) = self.ctx.kv.set(&key, &payload, None).await {
                        tracing::warn!(job_id = %self.ctx.job.id, %err, "failed to publish result listing");
                    }
                }
                Err(err) => {
                    tracing::warn!(job_id = %self.ctx.job.id, %err, "failed to encode result listing");
                }
            }
        }
        Ok(())
    }

    pub async fn finish(&mut self, event_type: EventType, message: &str) {
        self.ctx
            .emitter
            .emit_event(&self.ctx.job.id, event_type, message)
            .await;
        self.is_end = true;
        self.job_on_hpc = false;
    }

    pub async fn cancel_remote(&mut self) {
        let Some(slurm_id) = self.slurm_id else {
            return;
        };
        if let Err(err) = self.ctx.shell.exec(&scancel_command(slurm_id)).await {
            tracing::warn!(job_id = %self.ctx.job.id, %err, "scancel failed");
        }
    }

    pub async fn persist_job(&self) {
        if let Err(err) = self.ctx.store.update_job(&self.ctx.job).await {
            tracing::warn!(job_id = %self.ctx.job.id, %err, "failed to persist job row");
        }
    }

    /// Stage the data folder (if any) and the empty result folder, record
    /// the folder refs on the job and persist it. Returns the paths the
    /// submission script runs against.
    pub async fn stage_supporting_folders(
        &mut self,
        executable: &Folder,
    ) -> Result<JobPaths, MaintainerError> {
        let staging = self.ctx.staging.clone();
        let shell = self.ctx.shell.clone();
        let cluster = self.ctx.cluster.clone();
        let hpc = self.ctx.job.hpc.clone();
        let user = self.ctx.job.user_id.clone();

        self.ctx.job.remote_executable_folder = Some(executable.id.clone());

        let mut data_path = None;
        if let Some(source) = self.ctx.job.local_data_folder.clone() {
            let folder = staging
                .stage(shell.as_ref(), &hpc, &cluster, &user, &source)
                .await?;
            self.ctx
                .emitter
                .emit_event(
                    &self.ctx.job.id,
                    EventType::SlurmUploadData,
                    &format!("staged data folder into {}", folder.hpc_path),
                )
                .await;
            self.ctx.job.remote_data_folder = Some(folder.id.clone());
            data_path = Some(folder.hpc_path);
        }

        let result = staging
            .stage(shell.as_ref(), &hpc, &cluster, &user, &FolderSource::Empty)
            .await?;
        self.ctx
            .emitter
            .emit_event(
                &self.ctx.job.id,
                EventType::SlurmCreateResult,
                &format!("created result folder {}", result.hpc_path),
            )
            .await;
        self.ctx.job.remote_result_folder = Some(result.id.clone());
        self.result_path = Some(result.hpc_path.clone());

        self.persist_job().await;

        Ok(JobPaths {
            executable: executable.hpc_path.clone(),
            data: data_path,
            result: result.hpc_path.clone(),
        })
    }

    /// Re-derive the validated resource request from the job's slurm
    /// mapping; requests are checked at the boundary, so a failure here is
    /// a submission-level defect.
    pub fn parse_request(&self) -> Result<SlurmRequest, MaintainerError> {
        validate_slurm(
            &self.ctx.job.slurm,
            self.ctx.cluster.slurm_input_rules.as_ref(),
            self.ctx.cluster.slurm_global_cap.as_ref(),
        )
        .map_err(|e| MaintainerError::Submission(e.to_string()))
    }
}

/// The result listing keeps the manifest-declared default file first and
/// the rest alphabetical.
pub(super) fn sort_listing(mut names: Vec<String>, default_first: Option<&str>) -> Vec<String> {
    names.sort();
    if let Some(default) = default_first {
        if let Some(pos) = names.iter().position(|n| n == default) {
            let item = names.remove(pos);
            names.insert(0, item);
        }
    }
    names
}
