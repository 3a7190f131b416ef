// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{ClusterConfig, Config, ContainerConfig, KernelConfig};
use crate::events::EventEmitter;
use crate::slurm::validate::{ValidateError, validate_slurm};
use crate::ssh::RemoteShell;
use crate::ssh::pool::ConnectionPool;
use crate::staging::StagingEngine;
use crate::state::kv::KvStore;
use crate::state::models::{EventType, Job};
use crate::state::queue::{CredentialVault, HydratedJob, JobQueue, QueueError};
use crate::state::store::{StoreError, SupervisorStore};
use crate::util::retry::BackoffPolicy;

use super::maintainer::{Maintainer, MaintainerCtx, build_maintainer};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),
    #[error(transparent)]
    Validate(#[from] ValidateError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

enum PoolRelease {
    Shared(String),
    Private(String),
}

#[derive(Default)]
struct ClusterState {
    running: Vec<String>,
    cancel: HashSet<String>,
    /// The slot counter other admission rounds observe; kept alongside
    /// `running` under the same lock.
    pool_count: usize,
    workers: HashMap<String, JoinHandle<()>>,
}

/// Per-cluster shared state: the admission queue plus the running/cancel
/// bookkeeping both the scheduler and the workers touch.
pub struct ClusterRuntime {
    name: String,
    config: ClusterConfig,
    queue: JobQueue,
    state: Mutex<ClusterState>,
}

/// The supervisor scheduler: a periodic admission loop that drains each
/// cluster's queue into worker slots up to the cluster's capacity and
/// launches one maintainer worker per admitted job.
pub struct Supervisor {
    clusters: HashMap<String, Arc<ClusterRuntime>>,
    cluster_order: Vec<String>,
    store: SupervisorStore,
    kv: Arc<dyn KvStore>,
    pool: Arc<ConnectionPool>,
    staging: Arc<StagingEngine>,
    emitter: EventEmitter,
    vault: CredentialVault,
    containers: HashMap<String, ContainerConfig>,
    kernels: HashMap<String, KernelConfig>,
    scratch: PathBuf,
    queue_tick: Duration,
    maintain_tick: Duration,
    backoff: BackoffPolicy,
    ticker: StdMutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        store: SupervisorStore,
        kv: Arc<dyn KvStore>,
        pool: Arc<ConnectionPool>,
        staging: Arc<StagingEngine>,
    ) -> Self {
        let mut clusters = HashMap::new();
        for (name, cluster) in &config.clusters {
            clusters.insert(
                name.clone(),
                Arc::new(ClusterRuntime {
                    name: name.clone(),
                    config: cluster.clone(),
                    queue: JobQueue::new(name, kv.clone(), store.clone()),
                    state: Mutex::new(ClusterState::default()),
                }),
            );
        }
        // Admission processes clusters in a deterministic order.
        let mut cluster_order: Vec<String> = clusters.keys().cloned().collect();
        cluster_order.sort();

        Self {
            clusters,
            cluster_order,
            emitter: EventEmitter::new(store.clone()),
            vault: CredentialVault::new(kv.clone()),
            store,
            kv,
            pool,
            staging,
            containers: config.containers.clone(),
            kernels: config.kernels.clone(),
            scratch: config.scratch_dir.clone(),
            queue_tick: Duration::from_secs(config.queue_tick_secs),
            maintain_tick: Duration::from_secs(config.maintain_tick_secs),
            backoff: BackoffPolicy::default(),
            ticker: StdMutex::new(None),
        }
    }

    /// Shorten the cooperative delays; test harnesses drive ticks manually
    /// and cannot wait out multi-second sleeps.
    pub fn with_maintain_tick(mut self, tick: Duration) -> Self {
        self.maintain_tick = tick;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    pub fn store(&self) -> &SupervisorStore {
        &self.store
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    /// Enqueue a job for admission; transitions it to queued. Validation
    /// failures reject the job before it ever reaches the queue.
    pub async fn push_job(&self, mut job: Job) -> Result<(), SupervisorError> {
        let rt = self
            .clusters
            .get(&job.hpc)
            .ok_or_else(|| SupervisorError::UnknownCluster(job.hpc.clone()))?;
        validate_slurm(
            &job.slurm,
            rt.config.slurm_input_rules.as_ref(),
            rt.config.slurm_global_cap.as_ref(),
        )?;

        let queued_at = Utc::now();
        job.queued_at = Some(queued_at);
        if self.store.get_job(&job.id).await?.is_some() {
            self.store.set_queued_at(&job.id, queued_at).await?;
        } else {
            self.store.insert_job(&job).await?;
        }
        rt.queue.push(&job.id).await?;
        self.emitter
            .emit_event(
                &job.id,
                EventType::JobQueued,
                &format!("job queued on {}", job.hpc),
            )
            .await;
        Ok(())
    }

    /// Mark a running job for cancellation. Queued-but-not-yet-admitted
    /// jobs are not scanned: they run to admission first.
    pub async fn cancel_job(&self, job_id: &str) -> Option<Job> {
        for name in &self.cluster_order {
            let rt = &self.clusters[name];
            let mut state = rt.state.lock().await;
            if state.running.iter().any(|id| id == job_id) {
                state.cancel.insert(job_id.to_string());
                drop(state);
                return self.store.get_job(job_id).await.ok().flatten();
            }
        }
        None
    }

    /// One admission pass over every cluster in configuration order.
    pub async fn tick(&self) {
        for name in &self.cluster_order {
            let rt = self.clusters[name].clone();
            loop {
                {
                    let state = rt.state.lock().await;
                    if state.pool_count >= rt.config.job_pool_capacity {
                        break;
                    }
                }
                let hydrated = match rt.queue.pop().await {
                    Ok(Some(hydrated)) => hydrated,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::error!(cluster = %rt.name, %err, "queue pop failed");
                        break;
                    }
                };
                self.admit(&rt, hydrated).await;
            }
        }
    }

    async fn admit(&self, rt: &Arc<ClusterRuntime>, hydrated: HydratedJob) {
        let HydratedJob { job, credential } = hydrated;
        let job_id = job.id.clone();
        let credential_id = job.credential_id.clone();

        let resolved: Result<(Arc<dyn RemoteShell>, PoolRelease), String> =
            if rt.config.is_community_account {
                match rt.config.community_ssh_params() {
                    Some(params) => Ok((
                        self.pool.acquire_shared(&rt.name, params).await,
                        PoolRelease::Shared(rt.name.clone()),
                    )),
                    None => Err(format!("cluster {} has no community login", rt.name)),
                }
            } else {
                match &credential {
                    Some(cred) => Ok((
                        self.pool
                            .install_private(&job_id, rt.config.private_ssh_params(cred))
                            .await,
                        PoolRelease::Private(job_id.clone()),
                    )),
                    None => Err("private-account job has no stored credential".to_string()),
                }
            };

        let (shell, release) = match resolved {
            Ok(v) => v,
            Err(reason) => {
                self.emitter
                    .emit_event(&job_id, EventType::JobInitError, &reason)
                    .await;
                if let Err(err) = self.store.set_finished(&job_id, Utc::now(), true).await {
                    tracing::warn!(%job_id, %err, "failed to persist init error");
                }
                return;
            }
        };

        let maintainer = build_maintainer(MaintainerCtx {
            job,
            cluster: rt.config.clone(),
            shell,
            store: self.store.clone(),
            kv: self.kv.clone(),
            emitter: self.emitter.clone(),
            staging: self.staging.clone(),
            containers: self.containers.clone(),
            kernels: self.kernels.clone(),
            scratch: self.scratch.clone(),
            backoff: self.backoff,
        });

        {
            let mut state = rt.state.lock().await;
            state.running.push(job_id.clone());
            state.pool_count += 1;
        }
        self.emitter
            .emit_event(
                &job_id,
                EventType::JobRegistered,
                &format!("job admitted on {}", rt.name),
            )
            .await;

        let handle = tokio::spawn(run_worker(
            rt.clone(),
            self.pool.clone(),
            self.vault.clone(),
            maintainer,
            release,
            credential_id,
            self.maintain_tick,
        ));
        // A very fast worker may already have torn itself down; only track
        // the handle while the job is still running.
        let mut state = rt.state.lock().await;
        if state.running.iter().any(|id| id == &job_id) {
            state.workers.insert(job_id, handle);
        }
    }

    /// Start the admission ticker.
    pub fn start(self: Arc<Self>) {
        let supervisor = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(supervisor.queue_tick);
            loop {
                interval.tick().await;
                supervisor.tick().await;
            }
        });
        if let Ok(mut guard) = self.ticker.lock() {
            if let Some(previous) = guard.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Stop the admission ticker; running workers are not interrupted.
    pub fn destroy(&self) {
        if let Ok(mut guard) = self.ticker.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }

    /// Stop admitting, then wait up to `grace` for running workers to end;
    /// workers still alive past the deadline are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.destroy();
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let mut total = 0;
            for rt in self.clusters.values() {
                total += rt.state.lock().await.running.len();
            }
            if total == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        for rt in self.clusters.values() {
            let mut state = rt.state.lock().await;
            for (job_id, handle) in state.workers.drain() {
                tracing::warn!(%job_id, "aborting worker past shutdown deadline");
                handle.abort();
            }
            state.running.clear();
            state.cancel.clear();
            state.pool_count = 0;
        }
    }

    pub async fn running_count(&self, cluster: &str) -> usize {
        match self.clusters.get(cluster) {
            Some(rt) => rt.state.lock().await.pool_count,
            None => 0,
        }
    }

    pub async fn running_jobs(&self, cluster: &str) -> Vec<String> {
        match self.clusters.get(cluster) {
            Some(rt) => rt.state.lock().await.running.clone(),
            None => Vec::new(),
        }
    }

    pub async fn queue_length(&self, cluster: &str) -> usize {
        match self.clusters.get(cluster) {
            Some(rt) => rt.queue.length().await.unwrap_or(0),
            None => 0,
        }
    }

    /// True once every worker spawned for this cluster has returned.
    pub async fn is_idle(&self, cluster: &str) -> bool {
        match self.clusters.get(cluster) {
            Some(rt) => {
                let state = rt.state.lock().await;
                state.running.is_empty() && state.workers.is_empty()
            }
            None => true,
        }
    }
}

/// The cooperative per-job worker loop. Purely sequential: init once, then
/// alternate cancel checks and maintain polls with a tick of sleep between
/// them, and tear down pool/running/cancel bookkeeping on the way out.
async fn run_worker(
    rt: Arc<ClusterRuntime>,
    pool: Arc<ConnectionPool>,
    vault: CredentialVault,
    mut maintainer: Box<dyn Maintainer>,
    release: PoolRelease,
    credential_id: Option<String>,
    maintain_tick: Duration,
) {
    loop {
        if !maintainer.is_init() {
            if let Err(err) = maintainer.init().await {
                maintainer
                    .mark_failed(&format!("initialization failed: {err}"))
                    .await;
            }
        } else {
            let cancelled = {
                rt.state
                    .lock()
                    .await
                    .cancel
                    .contains(maintainer.job_id())
            };
            if cancelled {
                if maintainer.job_on_hpc() {
                    maintainer.on_cancel().await;
                }
                maintainer.mark_failed("job cancelled").await;
                let job_id = maintainer.job_id().to_string();
                rt.state.lock().await.cancel.remove(&job_id);
            } else if let Err(err) = maintainer.maintain().await {
                maintainer
                    .mark_failed(&format!("maintain failed: {err}"))
                    .await;
            }
        }

        if maintainer.is_end() {
            break;
        }
        tokio::time::sleep(maintain_tick).await;
    }

    let job_id = maintainer.job_id().to_string();
    {
        let mut state = rt.state.lock().await;
        state.running.retain(|id| id != &job_id);
        state.cancel.remove(&job_id);
        state.pool_count = state.pool_count.saturating_sub(1);
        state.workers.remove(&job_id);
    }
    match release {
        PoolRelease::Shared(cluster) => pool.release_shared(&cluster).await,
        PoolRelease::Private(id) => pool.remove_private(&id).await,
    }
    if let Some(credential_id) = credential_id {
        if let Err(err) = vault.remove(&credential_id).await {
            tracing::warn!(%job_id, %err, "failed to drop job credential");
        }
    }
    tracing::debug!(%job_id, cluster = %rt.name, "worker finished");
}
