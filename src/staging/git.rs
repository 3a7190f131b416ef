// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::process::Command;

use crate::state::models::{ExecutableManifest, GitRecord};

use super::StagingError;

const MANIFEST_FILE: &str = "manifest.json";

/// Local mirrors of registered repositories. The staging engine pulls the
/// mirror up to date before archiving it, and reads the executable manifest
/// and last-commit time from it.
pub struct GitMirror {
    root: PathBuf,
}

impl GitMirror {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn mirror_path(&self, git_id: &str) -> PathBuf {
        self.root.join(git_id)
    }

    /// Clone the repository on first use, `git pull` afterwards. A failed
    /// pull on an existing mirror degrades to the stale copy so a flaky
    /// upstream does not take job submission down with it.
    pub async fn ensure_mirror(&self, git: &GitRecord) -> Result<PathBuf, StagingError> {
        let path = self.mirror_path(&git.id);
        if !path.is_dir() {
            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|e| StagingError::Git(format!("failed to create mirror root: {e}")))?;
            run_git(
                &self.root,
                &["clone", git.address.as_str(), git.id.as_str()],
            )
            .await?;
            return Ok(path);
        }

        if let Err(err) = run_git(&path, &["pull", "--ff-only"]).await {
            tracing::warn!(git_id = %git.id, %err, "git pull failed; staging from existing mirror");
        }
        Ok(path)
    }

    /// Authoritative upstream timestamp for cache staleness. `None` when the
    /// mirror cannot report one.
    pub async fn last_commit_time(&self, git_id: &str) -> Option<DateTime<Utc>> {
        let path = self.mirror_path(git_id);
        match run_git(&path, &["log", "-1", "--format=%ct"]).await {
            Ok(stdout) => parse_commit_epoch(&stdout),
            Err(err) => {
                tracing::warn!(git_id, %err, "could not read last commit time");
                None
            }
        }
    }

    /// Read the per-job executable manifest bundled with the repository.
    pub async fn read_manifest(&self, git_id: &str) -> Result<ExecutableManifest, StagingError> {
        let path = self.mirror_path(git_id).join(MANIFEST_FILE);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            StagingError::Git(format!(
                "failed to read manifest at {}: {e}",
                path.display()
            ))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| StagingError::Git(format!("malformed manifest for {git_id}: {e}")))
    }
}

async fn run_git(cwd: &Path, args: &[&str]) -> Result<String, StagingError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| StagingError::Git(format!("failed to spawn git: {e}")))?;
    if !output.status.success() {
        return Err(StagingError::Git(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn parse_commit_epoch(stdout: &str) -> Option<DateTime<Utc>> {
    let epoch: i64 = stdout.trim().parse().ok()?;
    DateTime::<Utc>::from_timestamp(epoch, 0)
}
