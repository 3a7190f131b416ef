// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::slurm::script::{ContainerWrap, ScriptSpec, Stages};
use crate::state::models::{EventType, FolderSource};

use super::maintainer::{Maintainer, MaintainerCtx, MaintainerError, SlurmDriver};

const DEFAULT_KERNEL: &str = "default";

/// Community-contribution maintainer: enforces a registered git source and
/// wraps the manifest's execution stage in a Singularity container, with
/// optional CVMFS-hosted images.
pub struct CommunityMaintainer {
    driver: SlurmDriver,
}

impl CommunityMaintainer {
    pub fn new(ctx: MaintainerCtx) -> Self {
        Self {
            driver: SlurmDriver::new(ctx),
        }
    }
}

#[async_trait]
impl Maintainer for CommunityMaintainer {
    async fn init(&mut self) -> Result<(), MaintainerError> {
        if self.driver.is_init {
            return Ok(());
        }

        let staging = self.driver.ctx.staging.clone();
        let shell = self.driver.ctx.shell.clone();
        let cluster = self.driver.ctx.cluster.clone();
        let hpc = self.driver.ctx.job.hpc.clone();
        let user = self.driver.ctx.job.user_id.clone();

        let Some(FolderSource::Git { git_id }) =
            self.driver.ctx.job.local_executable_folder.clone()
        else {
            return Err(MaintainerError::Manifest(
                "community contributions require a registered git source".to_string(),
            ));
        };
        let source = FolderSource::Git {
            git_id: git_id.clone(),
        };

        let executable = staging
            .cached_stage(shell.as_ref(), &hpc, &cluster, &user, &source)
            .await?;
        self.driver
            .ctx
            .emitter
            .emit_event(
                &self.driver.ctx.job.id,
                EventType::SlurmUploadExecutable,
                &format!("staged executable folder into {}", executable.hpc_path),
            )
            .await;

        let manifest = staging.git().read_manifest(&git_id).await?;
        self.driver.default_result_file = manifest.default_result_file.clone();

        let paths = self.driver.stage_supporting_folders(&executable).await?;

        let container = manifest.container.as_deref().ok_or_else(|| {
            MaintainerError::Manifest(format!("manifest for {git_id} declares no container"))
        })?;
        let image = self
            .driver
            .ctx
            .containers
            .get(container)
            .and_then(|c| c.hpc_path.get(&hpc))
            .cloned()
            .ok_or_else(|| {
                MaintainerError::Manifest(format!(
                    "no {container} container image registered for {hpc}"
                ))
            })?;

        let kernel = self
            .driver
            .ctx
            .job
            .param
            .get("kernel")
            .map(String::as_str)
            .unwrap_or(DEFAULT_KERNEL);
        let env_init = self
            .driver
            .ctx
            .kernels
            .get(kernel)
            .map(|k| k.env_init.clone())
            .unwrap_or_default();

        let wrap = ContainerWrap {
            image,
            binds: cluster
                .mount
                .iter()
                .map(|m| (m.from.clone(), m.to.clone()))
                .collect(),
            cvmfs: manifest.cvmfs,
            env_init,
        };
        let stages = Stages {
            pre: manifest.pre_processing_stage.clone(),
            execution: manifest.execution_stage.clone(),
            post: manifest.post_processing_stage.clone(),
        };

        let request = self.driver.parse_request()?;
        let job = self.driver.ctx.job.clone();
        let spec = ScriptSpec {
            job_id: &job.id,
            request: &request,
            paths: &paths,
            env: &job.env,
            param: &job.param,
            stages: &stages,
            wrap: Some(&wrap),
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
