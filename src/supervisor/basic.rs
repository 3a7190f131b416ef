// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::slurm::script::{ScriptSpec, Stages};
use crate::state::models::{EventType, FolderSource};

use super::maintainer::{Maintainer, MaintainerCtx, MaintainerError, SlurmDriver};

/// Plain Slurm maintainer: stages the job's folders and runs the command
/// from the job parameters unwrapped.
pub struct BasicSlurmMaintainer {
    driver: SlurmDriver,
}

impl BasicSlurmMaintainer {
    pub fn new(ctx: MaintainerCtx) -> Self {
        Self {
            driver: SlurmDriver::new(ctx),
        }
    }
}

#[async_trait]
impl Maintainer for BasicSlurmMaintainer {
    async fn init(&mut self) -> Result<(), MaintainerError> {
        if self.driver.is_init {
            return Ok(());
        }

        let staging = self.driver.ctx.staging.clone();
        let shell = self.driver.ctx.shell.clone();
        let cluster = self.driver.ctx.cluster.clone();
        let hpc = self.driver.ctx.job.hpc.clone();
        let user = self.driver.ctx.job.user_id.clone();

        let source = self
            .driver
            .ctx
            .job
            .local_executable_folder
            .clone()
            .unwrap_or(FolderSource::Empty);
        // Git sources go through the content-addressed cache; everything
        // else is staged directly.
        let executable = match &source {
            FolderSource::Git { .. } => {
                staging
                    .cached_stage(shell.as_ref(), &hpc, &cluster, &user, &source)
                    .await?
            }
            _ => {
                staging
                    .stage(shell.as_ref(), &hpc, &cluster, &user, &source)
                    .await?
            }
        };
        self.driver
            .ctx
            .emitter
            .emit_event(
                &self.driver.ctx.job.id,
                EventType::SlurmUploadExecutable,
                &format!("staged executable folder into {}", executable.hpc_path),
            )
            .await;

        let paths = self.driver.stage_supporting_folders(&executable).await?;

        let command = self
            .driver
            .ctx
            .job
            .param
            .get("command")
            .cloned()
            .ok_or_else(|| {
                MaintainerError::Manifest("job declares no command parameter".to_string())
            })?;
        let request = self.driver.parse_request()?;
        let stages = Stages {
            pre: self.driver.ctx.job.param.get("pre_command").cloned(),
            execution: command,
            post: self.driver.ctx.job.param.get("post_command").cloned(),
        };
        let job = self.driver.ctx.job.clone();
        let spec = ScriptSpec {
            job_id: &job.id,
            request: &request,
            paths: &paths,
            env: &job.env,
            param: &job.param,
            stages: &stages,
            wrap: None,
        };
        self.driver.submit(&spec, &paths.executable).await?;

        self.driver.is_init = true;
        self.driver
            .ctx
            .emitter
            .emit_event(
                &self.driver.ctx.job.id,
                EventType::JobInit,
                &format!("job initialized on {}", self.driver.ctx.job.hpc),
            )
            .await;
        Ok(())
    }

    async fn maintain(&mut self) -> Result<(), MaintainerError> {
        self.driver.drive_maintain().await
    }

    async fn on_cancel(&mut self) {
        self.driver.cancel_remote().await;
    }

    async fn mark_failed(&mut self, reason: &str) {
        self.driver.finish(EventType::JobFailed, reason).await;
    }

    fn is_init(&self) -> bool {
        self.driver.is_init
    }

    fn is_end(&self) -> bool {
        self.driver.is_end
    }

    fn job_on_hpc(&self) -> bool {
        self.driver.job_on_hpc
    }

    fn job_id(&self) -> &str {
        &self.driver.ctx.job.id
    }
}
