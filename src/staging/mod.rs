// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::ClusterConfig;
use crate::ssh::{RemoteShell, ShellError, exec_checked};
use crate::state::kv::KvStore;
use crate::state::models::{Folder, FolderSource};
use crate::state::store::{StoreError, SupervisorStore};
use crate::util::random::{generate_id, generate_scratch_name};
use crate::util::remote_path::{join_remote, sanitize_segment, sh_escape};

pub mod archive;
pub mod git;
pub mod globus;

pub use git::GitMirror;
pub use globus::{GlobusClient, TransferStatus};

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("shell error during staging: {0}")]
    Shell(#[from] ShellError),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("git error: {0}")]
    Git(String),
    #[error("globus error: {0}")]
    Globus(String),
    #[error("store error during staging: {0}")]
    Store(#[from] StoreError),
    #[error("unknown git repository: {0}")]
    UnknownGit(String),
}

/// Cache key derived from a source descriptor. `None` for empty sources,
/// which are never cached.
pub fn fingerprint(source: &FolderSource) -> Option<String> {
    match source {
        FolderSource::Git { git_id } => Some(git_id.clone()),
        FolderSource::Local { path } => Some(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "root".to_string()),
        ),
        FolderSource::Globus { path, .. } => Some(sanitize_segment(path)),
        FolderSource::Empty => None,
    }
}

/// Decide whether a cache entry must be (re)built. An absent remote archive
/// always rebuilds; a present one is invalidated only when the source has an
/// authoritative upstream timestamp that is newer than the registry row (or
/// the row is missing, in which case the archive's age is unknowable).
fn needs_rebuild(
    archive_exists: bool,
    row_updated_at: Option<DateTime<Utc>>,
    upstream: Option<DateTime<Utc>>,
) -> bool {
    if !archive_exists {
        return true;
    }
    match (row_updated_at, upstream) {
        (Some(row), Some(upstream)) => row < upstream,
        (None, Some(_)) => true,
        _ => false,
    }
}

/// Uploads a logical source into a fresh remote workspace, optionally
/// through a content-addressed archive cache under `<root>/cache/`.
pub struct StagingEngine {
    store: SupervisorStore,
    kv: Arc<dyn KvStore>,
    globus: Option<Arc<dyn GlobusClient>>,
    git: GitMirror,
    scratch: PathBuf,
    transfer_poll_interval: Duration,
    // Serializes rebuilds per (cluster, fingerprint).
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StagingEngine {
    pub fn new(
        store: SupervisorStore,
        kv: Arc<dyn KvStore>,
        globus: Option<Arc<dyn GlobusClient>>,
        git_mirror_root: PathBuf,
        scratch: PathBuf,
    ) -> Self {
        Self {
            store,
            kv,
            globus,
            git: GitMirror::new(git_mirror_root),
            scratch,
            transfer_poll_interval: Duration::from_secs(2),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_transfer_poll_interval(mut self, interval: Duration) -> Self {
        self.transfer_poll_interval = interval;
        self
    }

    pub fn git(&self) -> &GitMirror {
        &self.git
    }

    /// Stage `source` into a fresh workspace `<root>/<folder-id>` without
    /// consulting the cache.
    pub async fn stage(
        &self,
        shell: &dyn RemoteShell,
        hpc: &str,
        cluster: &ClusterConfig,
        user_id: &str,
        source: &FolderSource,
    ) -> Result<Folder, StagingError> {
        let folder_id = generate_id();
        let workspace = join_remote(&cluster.root_path, &folder_id);
        let mut globus_path = None;

        match source {
            FolderSource::Empty => {
                shell.mkdir_p(&workspace).await?;
            }
            FolderSource::Local { path } => {
                self.upload_and_extract(shell, path, &cluster.root_path, &workspace)
                    .await?;
            }
            FolderSource::Git { git_id } => {
                let mirror = self.pull_mirror(git_id).await?;
                self.upload_and_extract(shell, &mirror, &cluster.root_path, &workspace)
                    .await?;
            }
            FolderSource::Globus { endpoint, path } => {
                let dst = cluster.globus.as_ref().ok_or_else(|| {
                    StagingError::Globus(format!("cluster {hpc} has no globus endpoint"))
                })?;
                let dst_path = join_remote(&dst.root_path, &folder_id);
                self.run_transfer(endpoint, path, &dst.endpoint, &dst_path, &folder_id)
                    .await?;
                globus_path = Some(dst_path);
            }
        }

        let folder = Folder {
            id: folder_id,
            hpc: hpc.to_string(),
            user_id: user_id.to_string(),
            hpc_path: workspace,
            globus_path,
            is_deleted: false,
            created_at: Utc::now(),
        };
        self.store.insert_folder(&folder).await?;
        Ok(folder)
    }

    /// Stage `source` through the content-addressed cache: build the cached
    /// archive on miss or staleness, then unpack it into a fresh per-job
    /// workspace.
    pub async fn cached_stage(
        &self,
        shell: &dyn RemoteShell,
        hpc: &str,
        cluster: &ClusterConfig,
        user_id: &str,
        source: &FolderSource,
    ) -> Result<Folder, StagingError> {
        let Some(fp) = fingerprint(source) else {
            return self.stage(shell, hpc, cluster, user_id, source).await;
        };
        let cache_rel = format!("cache/{fp}.tar.zst");
        let cache_path = join_remote(&cluster.root_path, &cache_rel);

        let lock = self.lock_for(hpc, &fp).await;
        let _guard = lock.lock().await;

        // For git sources the mirror must be current before both the
        // staleness check and a potential rebuild.
        let local_dir: Option<PathBuf> = match source {
            FolderSource::Local { path } => Some(path.clone()),
            FolderSource::Git { git_id } => Some(self.pull_mirror(git_id).await?),
            _ => None,
        };
        let upstream = match source {
            FolderSource::Git { git_id } => self.git.last_commit_time(git_id).await,
            _ => None,
        };

        let archive_exists = shell.exists(&cache_path).await?;
        let row = match self.store.get_cache(hpc, &cache_path).await {
            Ok(row) => row,
            Err(err) => {
                tracing::warn!(%err, %cache_path, "cache registry read failed; treating as unregistered");
                None
            }
        };

        if needs_rebuild(archive_exists, row.map(|r| r.updated_at), upstream) {
            if archive_exists {
                tracing::info!(%cache_path, "cache stale; invalidating");
                shell.rm_rf(&cache_path).await?;
            }
            if let Err(err) = self.store.delete_cache(hpc, &cache_path).await {
                tracing::warn!(%err, %cache_path, "failed to drop stale cache row");
            }

            shell
                .mkdir_p(&join_remote(&cluster.root_path, "cache"))
                .await?;
            if let Some(local_dir) = local_dir.as_deref() {
                self.upload_archive(shell, local_dir, &cache_path).await?;
            } else if let FolderSource::Globus { endpoint, path } = source {
                self.build_globus_cache(shell, cluster, hpc, endpoint, path, &fp, &cache_path)
                    .await?;
            } else {
                return Err(StagingError::Archive(format!(
                    "source with fingerprint {fp} has no cacheable pipeline"
                )));
            }

            // Registration is best-effort: a successful stage with a failed
            // registry write must still leave the workspace usable.
            if let Err(err) = self.store.upsert_cache(hpc, &cache_path, Utc::now()).await {
                tracing::warn!(%err, %cache_path, "cache registration failed; next stage pays the miss");
            }
        }

        let folder_id = generate_id();
        let workspace = join_remote(&cluster.root_path, &folder_id);
        shell.extract_archive(&cache_path, &workspace).await?;

        let folder = Folder {
            id: folder_id,
            hpc: hpc.to_string(),
            user_id: user_id.to_string(),
            hpc_path: workspace,
            globus_path: None,
            is_deleted: false,
            created_at: Utc::now(),
        };
        self.store.insert_folder(&folder).await?;
        Ok(folder)
    }

    async fn lock_for(&self, hpc: &str, fp: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(format!("{hpc}:{fp}")).or_default().clone()
    }

    async fn pull_mirror(&self, git_id: &str) -> Result<PathBuf, StagingError> {
        let record = self
            .store
            .get_git(git_id)
            .await?
            .ok_or_else(|| StagingError::UnknownGit(git_id.to_string()))?;
        self.git.ensure_mirror(&record).await
    }

    /// Local pipeline: archive locally, upload the archive, unpack on the
    /// remote, delete both archives.
    async fn upload_and_extract(
        &self,
        shell: &dyn RemoteShell,
        local_dir: &Path,
        root_path: &str,
        workspace: &str,
    ) -> Result<(), StagingError> {
        shell.mkdir_p(root_path).await?;
        let remote_archive = format!("{workspace}.tar.zst");
        self.upload_archive(shell, local_dir, &remote_archive).await?;
        shell.extract_archive(&remote_archive, workspace).await?;
        shell.rm_rf(&remote_archive).await?;
        Ok(())
    }

    async fn upload_archive(
        &self,
        shell: &dyn RemoteShell,
        local_dir: &Path,
        remote_archive: &str,
    ) -> Result<(), StagingError> {
        std::fs::create_dir_all(&self.scratch)
            .map_err(|e| StagingError::Archive(format!("failed to create scratch dir: {e}")))?;
        let local_archive = self
            .scratch
            .join(format!("{}.tar.zst", generate_scratch_name("stage")));
        archive::create_archive(local_dir, &local_archive)?;

        let uploaded = shell.upload(&local_archive, remote_archive).await;
        let _ = std::fs::remove_file(&local_archive);
        uploaded?;
        Ok(())
    }

    /// Globus caches are built by transferring into a temporary remote
    /// directory and archiving it in place, so the final unpack step is the
    /// same for every source kind.
    #[allow(clippy::too_many_arguments)]
    async fn build_globus_cache(
        &self,
        shell: &dyn RemoteShell,
        cluster: &ClusterConfig,
        hpc: &str,
        src_endpoint: &str,
        src_path: &str,
        fp: &str,
        cache_path: &str,
    ) -> Result<(), StagingError> {
        let dst = cluster
            .globus
            .as_ref()
            .ok_or_else(|| StagingError::Globus(format!("cluster {hpc} has no globus endpoint")))?;
        let tmp_rel = format!("cache/.globus_{fp}");
        let tmp_globus = join_remote(&dst.root_path, &tmp_rel);
        let tmp_posix = join_remote(&cluster.root_path, &tmp_rel);

        self.run_transfer(src_endpoint, src_path, &dst.endpoint, &tmp_globus, fp)
            .await?;
        exec_checked(
            shell,
            &format!(
                "tar --zstd -cf {} -C {} .",
                sh_escape(cache_path),
                sh_escape(&tmp_posix)
            ),
        )
        .await?;
        shell.rm_rf(&tmp_posix).await?;
        Ok(())
    }

    async fn run_transfer(
        &self,
        src_endpoint: &str,
        src_path: &str,
        dst_endpoint: &str,
        dst_path: &str,
        label: &str,
    ) -> Result<(), StagingError> {
        let client = self
            .globus
            .as_ref()
            .ok_or_else(|| StagingError::Globus("no transfer client configured".to_string()))?;
        let task_id = client
            .init_transfer(src_endpoint, src_path, dst_endpoint, dst_path, label)
            .await?;
        if let Err(err) = self
            .kv
            .set(&format!("globus_task_{label}"), &task_id, None)
            .await
        {
            tracing::warn!(%err, label, "failed to record transfer task label");
        }

        loop {
            match client.query_status(&task_id).await? {
                TransferStatus::Succeeded => return Ok(()),
                TransferStatus::Failed => {
                    return Err(StagingError::Globus(format!("transfer {task_id} failed")));
                }
                TransferStatus::Active => {
                    tokio::time::sleep(self.transfer_poll_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobusEndpoint;
    use crate::ssh::ExecOutput;
    use crate::state::kv::MemoryKv;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Records every operation and simulates remote path existence.
    #[derive(Default)]
    struct FakeShell {
        calls: StdMutex<Vec<String>>,
        existing: StdMutex<HashSet<String>>,
    }

    impl FakeShell {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }
    }

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn exec(&self, cmd: &str) -> Result<ExecOutput, ShellError> {
            self.calls.lock().unwrap().push(format!("exec:{cmd}"));
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
        async fn upload(&self, _local: &Path, remote: &str) -> Result<(), ShellError> {
            self.calls.lock().unwrap().push(format!("upload:{remote}"));
            self.existing.lock().unwrap().insert(remote.to_string());
            Ok(())
        }
        async fn download(&self, remote: &str, _local: &Path) -> Result<(), ShellError> {
            self.calls.lock().unwrap().push(format!("download:{remote}"));
            Ok(())
        }
        async fn mkdir_p(&self, path: &str) -> Result<(), ShellError> {
            self.calls.lock().unwrap().push(format!("mkdir:{path}"));
            self.existing.lock().unwrap().insert(path.to_string());
            Ok(())
        }
        async fn exists(&self, path: &str) -> Result<bool, ShellError> {
            Ok(self.existing.lock().unwrap().contains(path))
        }
        async fn rm_rf(&self, path: &str) -> Result<(), ShellError> {
            self.calls.lock().unwrap().push(format!("rm:{path}"));
            self.existing.lock().unwrap().remove(path);
            Ok(())
        }
        async fn extract_archive(&self, archive: &str, dest: &str) -> Result<(), ShellError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("extract:{archive}->{dest}"));
            self.existing.lock().unwrap().insert(dest.to_string());
            Ok(())
        }
        async fn is_connected(&self) -> bool {
            true
        }
        async fn dispose(&self) {}
    }

    struct FakeGlobus {
        polls_until_done: usize,
        polled: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl GlobusClient for FakeGlobus {
        async fn init_transfer(
            &self,
            _src_endpoint: &str,
            _src_path: &str,
            _dst_endpoint: &str,
            _dst_path: &str,
            label: &str,
        ) -> Result<String, StagingError> {
            Ok(format!("task-{label}"))
        }
        async fn query_status(&self, _task_id: &str) -> Result<TransferStatus, StagingError> {
            let seen = self.polled.fetch_add(1, Ordering::SeqCst);
            if seen + 1 < self.polls_until_done {
                Ok(TransferStatus::Active)
            } else if self.fail {
                Ok(TransferStatus::Failed)
            } else {
                Ok(TransferStatus::Succeeded)
            }
        }
    }

    fn cluster(root: &str) -> ClusterConfig {
        ClusterConfig {
            ip: "cluster.example.org".into(),
            port: 22,
            root_path: root.into(),
            job_pool_capacity: 2,
            is_community_account: true,
            host_key_fingerprint: None,
            community_login: None,
            globus: Some(GlobusEndpoint {
                endpoint: "ep-dst".into(),
                root_path: "/~/jobsup".into(),
            }),
            slurm_input_rules: None,
            slurm_global_cap: None,
            mount: Vec::new(),
        }
    }

    async fn engine_with(
        globus: Option<Arc<dyn GlobusClient>>,
    ) -> (StagingEngine, SupervisorStore, tempfile::TempDir) {
        let store = SupervisorStore::open_memory().await.unwrap();
        let kv = Arc::new(MemoryKv::new());
        let workdir = tempdir().unwrap();
        let engine = StagingEngine::new(
            store.clone(),
            kv,
            globus,
            workdir.path().join("mirrors"),
            workdir.path().join("scratch"),
        )
        .with_transfer_poll_interval(Duration::from_millis(1));
        (engine, store, workdir)
    }

    fn local_source() -> (tempfile::TempDir, FolderSource) {
        let dir = tempdir().unwrap();
        let src = dir.path().join("model");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("main.py"), "print('hi')").unwrap();
        (dir, FolderSource::Local { path: src })
    }

    #[test]
    fn fingerprints_follow_source_kind() {
        assert_eq!(
            fingerprint(&FolderSource::Git {
                git_id: "hello".into()
            })
            .as_deref(),
            Some("hello")
        );
        assert_eq!(
            fingerprint(&FolderSource::Local {
                path: PathBuf::from("/data/models/wrfhydro")
            })
            .as_deref(),
            Some("wrfhydro")
        );
        assert_eq!(
            fingerprint(&FolderSource::Globus {
                endpoint: "ep".into(),
                path: "/shared/data v2".into()
            })
            .as_deref(),
            Some("shared_data_v2")
        );
        assert_eq!(fingerprint(&FolderSource::Empty), None);
    }

    #[test]
    fn rebuild_decision_table() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();

        // missing archive always rebuilds
        assert!(needs_rebuild(false, None, None));
        assert!(needs_rebuild(false, Some(t1), Some(t0)));
        // present archive with no upstream timestamp is reused
        assert!(!needs_rebuild(true, None, None));
        assert!(!needs_rebuild(true, Some(t0), None));
        // upstream newer than the row invalidates
        assert!(needs_rebuild(true, Some(t0), Some(t1)));
        assert!(!needs_rebuild(true, Some(t1), Some(t0)));
        // archive present but unregistered: age unknown, rebuild
        assert!(needs_rebuild(true, None, Some(t0)));
    }

    #[tokio::test]
    async fn local_stage_uploads_extracts_and_cleans_up() {
        let (engine, store, _workdir) = engine_with(None).await;
        let shell = FakeShell::default();
        let (_guard, source) = local_source();

        let folder = engine
            .stage(&shell, "anvil", &cluster("/scratch"), "u1", &source)
            .await
            .unwrap();

        assert!(folder.hpc_path.starts_with("/scratch/"));
        assert_eq!(shell.count("upload:"), 1);
        assert_eq!(shell.count("extract:"), 1);
        // remote archive removed after extraction
        assert_eq!(shell.count(&format!("rm:{}.tar.zst", folder.hpc_path)), 1);
        // folder row persisted
        let row = store.get_folder(&folder.id).await.unwrap().unwrap();
        assert_eq!(row.hpc_path, folder.hpc_path);
    }

    #[tokio::test]
    async fn empty_stage_only_creates_the_workspace() {
        let (engine, _store, _workdir) = engine_with(None).await;
        let shell = FakeShell::default();
        let folder = engine
            .stage(&shell, "anvil", &cluster("/scratch"), "u1", &FolderSource::Empty)
            .await
            .unwrap();
        assert_eq!(shell.count("upload:"), 0);
        assert_eq!(shell.count(&format!("mkdir:{}", folder.hpc_path)), 1);
    }

    #[tokio::test]
    async fn cached_stage_hits_skip_the_upload() {
        let (engine, store, _workdir) = engine_with(None).await;
        let shell = FakeShell::default();
        let cfg = cluster("/scratch");
        let (_guard, source) = local_source();

        let first = engine
            .cached_stage(&shell, "anvil", &cfg, "u1", &source)
            .await
            .unwrap();
        assert_eq!(shell.count("upload:"), 1);
        let cache_path = "/scratch/cache/model.tar.zst";
        assert!(store.get_cache("anvil", cache_path).await.unwrap().is_some());

        let second = engine
            .cached_stage(&shell, "anvil", &cfg, "u2", &source)
            .await
            .unwrap();
        // zero uploads on the second call, one unzip from the cache path
        assert_eq!(shell.count("upload:"), 1);
        assert_eq!(shell.count(&format!("extract:{cache_path}")), 2);
        assert_ne!(first.id, second.id);
        assert_ne!(first.hpc_path, second.hpc_path);
    }

    #[tokio::test]
    async fn unregistered_cache_archive_is_reused_for_local_sources() {
        let (engine, _store, _workdir) = engine_with(None).await;
        let shell = FakeShell::default();
        let cfg = cluster("/scratch");
        let (_guard, source) = local_source();

        // archive exists remotely but no registry row; local sources carry
        // no upstream timestamp, so the archive is trusted
        shell
            .existing
            .lock()
            .unwrap()
            .insert("/scratch/cache/model.tar.zst".to_string());

        engine
            .cached_stage(&shell, "anvil", &cfg, "u1", &source)
            .await
            .unwrap();
        assert_eq!(shell.count("upload:"), 0);
        assert_eq!(shell.count("extract:"), 1);
    }

    #[tokio::test]
    async fn globus_stage_polls_until_success() {
        let client = Arc::new(FakeGlobus {
            polls_until_done: 3,
            polled: AtomicUsize::new(0),
            fail: false,
        });
        let (engine, _store, _workdir) = engine_with(Some(client.clone())).await;
        let shell = FakeShell::default();

        let folder = engine
            .stage(
                &shell,
                "anvil",
                &cluster("/scratch"),
                "u1",
                &FolderSource::Globus {
                    endpoint: "ep-src".into(),
                    path: "/shared/input".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(client.polled.load(Ordering::SeqCst), 3);
        let globus_path = folder.globus_path.unwrap();
        assert!(globus_path.starts_with("/~/jobsup/"));
        assert_eq!(shell.count("upload:"), 0);
    }

    #[tokio::test]
    async fn failed_transfer_surfaces_as_staging_error() {
        let client = Arc::new(FakeGlobus {
            polls_until_done: 1,
            polled: AtomicUsize::new(0),
            fail: true,
        });
        let (engine, _store, _workdir) = engine_with(Some(client)).await;
        let shell = FakeShell::default();

        let err = engine
            .stage(
                &shell,
                "anvil",
                &cluster("/scratch"),
                "u1",
                &FolderSource::Globus {
                    endpoint: "ep-src".into(),
                    path: "/shared/input".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::Globus(_)));
    }

    #[tokio::test]
    async fn globus_stage_without_client_errors() {
        let (engine, _store, _workdir) = engine_with(None).await;
        let shell = FakeShell::default();
        let err = engine
            .stage(
                &shell,
                "anvil",
                &cluster("/scratch"),
                "u1",
                &FolderSource::Globus {
                    endpoint: "ep-src".into(),
                    path: "/shared/input".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::Globus(_)));
    }

    #[tokio::test]
    async fn unknown_git_id_is_rejected() {
        let (engine, _store, _workdir) = engine_with(None).await;
        let shell = FakeShell::default();
        let err = engine
            .stage(
                &shell,
                "anvil",
                &cluster("/scratch"),
                "u1",
                &FolderSource::Git {
                    git_id: "nope".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::UnknownGit(_)));
    }
}
