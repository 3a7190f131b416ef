// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! End-to-end scenarios for the supervisor: a scriptable fake remote
//! cluster stands in for SSH + Slurm, with the real stores, staging engine
//! and scheduler in between.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use jobsupd::config::{ClusterConfig, CommunityLogin, Config, ContainerConfig, KernelConfig};
use jobsupd::slurm::validate::SlurmRules;
use jobsupd::ssh::pool::ConnectionPool;
use jobsupd::ssh::{ExecOutput, RemoteShell, ShellError, ShellFactory, SshParams};
use jobsupd::staging::StagingEngine;
use jobsupd::state::kv::{KvStore, MemoryKv};
use jobsupd::state::models::{Credential, FolderSource, Job, MaintainerKind};
use jobsupd::state::store::SupervisorStore;
use jobsupd::supervisor::{Supervisor, SupervisorError};
use jobsupd::util::retry::BackoffPolicy;

/// Shared state of one simulated cluster head node.
#[derive(Default)]
struct RemoteCluster {
    /// Status scripts handed to submissions in order; each entry is the
    /// sequence of squeue tokens the job reports, then it completes.
    scripts: Mutex<VecDeque<Vec<&'static str>>>,
    statuses: Mutex<HashMap<i64, VecDeque<&'static str>>>,
    next_slurm_id: Mutex<i64>,
    execs: Mutex<Vec<String>>,
    uploads: Mutex<Vec<String>>,
    existing: Mutex<HashSet<String>>,
    scancelled: Mutex<Vec<i64>>,
    result_listing: Mutex<String>,
    /// (command substring, remaining failures) transport-error injection.
    flaky: Mutex<Option<(String, usize)>>,
    built_params: Mutex<Vec<SshParams>>,
}

impl RemoteCluster {
    fn new() -> Arc<Self> {
        let cluster = Self::default();
        *cluster.result_listing.lock().unwrap() = "run.log\nsummary.csv".to_string();
        Arc::new(cluster)
    }

    fn push_script(&self, script: Vec<&'static str>) {
        self.scripts.lock().unwrap().push_back(script);
    }

    fn inject_flap(&self, pattern: &str, failures: usize) {
        *self.flaky.lock().unwrap() = Some((pattern.to_string(), failures));
    }

    fn archive_uploads(&self) -> usize {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .filter(|path| path.ends_with(".tar.zst"))
            .count()
    }

    fn submissions(&self) -> i64 {
        *self.next_slurm_id.lock().unwrap()
    }
}

struct FakeShell {
    cluster: Arc<RemoteCluster>,
}

impl FakeShell {
    fn dispatch(&self, cmd: &str) -> ExecOutput {
        let ok = |stdout: &str| ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        };

        if cmd.starts_with("sbatch") {
            let mut next = self.cluster.next_slurm_id.lock().unwrap();
            *next += 1;
            let slurm_id = *next;
            let script = self
                .cluster
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![""]);
            self.cluster
                .statuses
                .lock()
                .unwrap()
                .insert(slurm_id, script.into_iter().collect());
            return ok(&format!("Submitted batch job {slurm_id}\n"));
        }
        if cmd.starts_with("squeue -j") {
            let slurm_id: i64 = cmd
                .split_whitespace()
                .nth(2)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let token = self
                .cluster
                .statuses
                .lock()
                .unwrap()
                .get_mut(&slurm_id)
                .and_then(|q| q.pop_front())
                .unwrap_or("");
            return ok(&format!("{token}\n"));
        }
        if cmd.starts_with("scancel") {
            if let Some(id) = cmd.split_whitespace().nth(1).and_then(|v| v.parse().ok()) {
                self.cluster.scancelled.lock().unwrap().push(id);
            }
            return ok("");
        }
        if cmd.starts_with("sacct -j") {
            return ok("1|2|120|2Gn|204800K|60|\n");
        }
        if cmd.starts_with("ls -1") {
            return ok(&self.cluster.result_listing.lock().unwrap().clone());
        }
        ok("")
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn exec(&self, cmd: &str) -> Result<ExecOutput, ShellError> {
        {
            let mut flaky = self.cluster.flaky.lock().unwrap();
            if let Some((pattern, remaining)) = flaky.as_mut() {
                if cmd.contains(pattern.as_str()) && *remaining > 0 {
                    *remaining -= 1;
                    return Err(ShellError::Transport("connection reset".into()));
                }
            }
        }
        self.cluster.execs.lock().unwrap().push(cmd.to_string());
        Ok(self.dispatch(cmd))
    }

    async fn upload(&self, _local: &Path, remote: &str) -> Result<(), ShellError> {
        self.cluster.uploads.lock().unwrap().push(remote.to_string());
        self.cluster
            .existing
            .lock()
            .unwrap()
            .insert(remote.to_string());
        Ok(())
    }

    async fn download(&self, _remote: &str, _local: &Path) -> Result<(), ShellError> {
        Ok(())
    }

    async fn mkdir_p(&self, path: &str) -> Result<(), ShellError> {
        self.cluster
            .existing
            .lock()
            .unwrap()
            .insert(path.to_string());
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, ShellError> {
        Ok(self.cluster.existing.lock().unwrap().contains(path))
    }

    async fn rm_rf(&self, path: &str) -> Result<(), ShellError> {
        self.cluster.existing.lock().unwrap().remove(path);
        Ok(())
    }

    async fn extract_archive(&self, _archive: &str, dest: &str) -> Result<(), ShellError> {
        self.cluster
            .existing
            .lock()
            .unwrap()
            .insert(dest.to_string());
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn dispose(&self) {}
}

struct FakeFactory {
    cluster: Arc<RemoteCluster>,
}

impl ShellFactory for FakeFactory {
    fn build(&self, params: SshParams) -> Arc<dyn RemoteShell> {
        self.cluster.built_params.lock().unwrap().push(params);
        Arc::new(FakeShell {
            cluster: self.cluster.clone(),
        })
    }
}

struct Harness {
    supervisor: Arc<Supervisor>,
    store: SupervisorStore,
    kv: Arc<MemoryKv>,
    pool: Arc<ConnectionPool>,
    remote: Arc<RemoteCluster>,
    workdir: TempDir,
}

fn community_cluster(capacity: usize) -> ClusterConfig {
    ClusterConfig {
        ip: "cluster.example.org".into(),
        port: 22,
        root_path: "/scratch/jobsup".into(),
        job_pool_capacity: capacity,
        is_community_account: true,
        host_key_fingerprint: None,
        community_login: Some(CommunityLogin {
            user: "community".into(),
            identity_file: None,
            password: Some("shared-secret".into()),
        }),
        globus: None,
        slurm_input_rules: None,
        slurm_global_cap: None,
        mount: Vec::new(),
    }
}

fn private_cluster(capacity: usize, rules: Option<SlurmRules>) -> ClusterConfig {
    ClusterConfig {
        ip: "cluster.example.org".into(),
        port: 22,
        root_path: "/scratch/jobsup".into(),
        job_pool_capacity: capacity,
        is_community_account: false,
        host_key_fingerprint: None,
        community_login: None,
        globus: None,
        slurm_input_rules: rules,
        slurm_global_cap: None,
        mount: Vec::new(),
    }
}

async fn harness(clusters: HashMap<String, ClusterConfig>) -> Harness {
    harness_with_tick(clusters, Duration::from_millis(2)).await
}

async fn harness_with_tick(
    clusters: HashMap<String, ClusterConfig>,
    maintain_tick: Duration,
) -> Harness {
    let workdir = TempDir::new().unwrap();
    let config = Config {
        database_path: workdir.path().join("db.sqlite"),
        redis_url: None,
        queue_tick_secs: 1,
        maintain_tick_secs: 1,
        shutdown_grace_secs: 1,
        git_mirror_root: workdir.path().join("mirrors"),
        scratch_dir: workdir.path().join("scratch"),
        clusters,
        containers: HashMap::from([(
            "python".to_string(),
            ContainerConfig {
                hpc_path: HashMap::from([(
                    "anvil".to_string(),
                    "/containers/python.sif".to_string(),
                )]),
            },
        )]),
        kernels: HashMap::from([(
            "default".to_string(),
            KernelConfig {
                env_init: vec!["module load singularity".to_string()],
            },
        )]),
        config_path: None,
    };

    let store = SupervisorStore::open_memory().await.unwrap();
    let kv = Arc::new(MemoryKv::new());
    let remote = RemoteCluster::new();
    let pool = Arc::new(ConnectionPool::new(Arc::new(FakeFactory {
        cluster: remote.clone(),
    })));
    let staging = Arc::new(StagingEngine::new(
        store.clone(),
        kv.clone(),
        None,
        config.git_mirror_root.clone(),
        config.scratch_dir.clone(),
    ));

    let supervisor = Supervisor::new(
        &config,
        store.clone(),
        kv.clone(),
        pool.clone(),
        staging,
    )
    .with_maintain_tick(maintain_tick)
    .with_backoff(BackoffPolicy {
        initial: Duration::from_millis(1),
        multiplier: 2,
        cap: Duration::from_millis(8),
        max_retries: 5,
    });

    Harness {
        supervisor: Arc::new(supervisor),
        store,
        kv,
        pool,
        remote,
        workdir,
    }
}

impl Harness {
    /// Seed a registered git repository whose mirror already exists on
    /// disk, so staging works without reaching any upstream.
    async fn seed_git_model(&self, git_id: &str) {
        self.store
            .upsert_git(&jobsupd::state::models::GitRecord {
                id: git_id.to_string(),
                address: "https://git.example.org/model.git".to_string(),
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        let mirror = self.workdir.path().join("mirrors").join(git_id);
        std::fs::create_dir_all(&mirror).unwrap();
        std::fs::write(mirror.join("main.py"), "print('hello')").unwrap();
        std::fs::write(
            mirror.join("manifest.json"),
            r#"{
                "container": "python",
                "execution_stage": "python main.py",
                "default_result_file": "summary.csv"
            }"#,
        )
        .unwrap();
    }

    async fn wait_for_idle(&self, cluster: &str) {
        for _ in 0..600 {
            if self.supervisor.is_idle(cluster).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cluster {cluster} did not drain in time");
    }

    async fn event_types(&self, job_id: &str) -> Vec<String> {
        self.store
            .list_events(job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }
}

fn basic_job(hpc: &str) -> Job {
    let mut job = Job::new("user-1", hpc, MaintainerKind::BasicSlurm);
    job.param.insert("command".into(), "echo done".into());
    job.slurm.insert("cpus_per_task".into(), "2".into());
    job.slurm.insert("walltime".into(), "00:30:00".into());
    job
}

#[tokio::test]
async fn happy_path_git_source_private_account() {
    let h = harness(HashMap::from([(
        "anvil".to_string(),
        private_cluster(1, Some(SlurmRules {
            max_cpus_per_task: Some(4),
            max_walltime: Some("01:00:00".into()),
            ..Default::default()
        })),
    )]))
    .await;
    h.seed_git_model("hello").await;

    let credential = Credential {
        id: "cred1".into(),
        user: "alice".into(),
        password: "hunter2".into(),
    };
    h.supervisor
        .vault()
        .put(&credential, Duration::from_secs(3600))
        .await
        .unwrap();

    let mut job = Job::new("user-1", "anvil", MaintainerKind::CommunityContribution);
    job.credential_id = Some("cred1".into());
    job.local_executable_folder = Some(FolderSource::Git {
        git_id: "hello".into(),
    });
    job.slurm.insert("cpus_per_task".into(), "2".into());
    job.slurm.insert("walltime".into(), "00:30:00".into());
    let job_id = job.id.clone();

    h.remote.push_script(vec![""]);
    h.supervisor.push_job(job).await.unwrap();
    assert_eq!(h.supervisor.queue_length("anvil").await, 1);

    h.supervisor.tick().await;
    h.wait_for_idle("anvil").await;

    assert_eq!(
        h.event_types(&job_id).await,
        vec![
            "JOB_QUEUED",
            "JOB_REGISTERED",
            "SLURM_UPLOAD_EXECUTABLE",
            "SLURM_CREATE_RESULT",
            "JOB_INIT",
            "JOB_ENDED",
        ]
    );

    // running slot freed, private shell torn down, credential dropped
    assert_eq!(h.supervisor.running_count("anvil").await, 0);
    assert!(h.pool.get_private(&job_id).await.is_none());
    assert!(h.supervisor.vault().get("cred1").await.unwrap().is_none());

    // the private shell was built with the user's credentials
    let params = h.remote.built_params.lock().unwrap().clone();
    assert!(params.iter().any(|p| p.username == "alice"));

    let job = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert!(job.queued_at.is_some());
    assert!(job.initialized_at.is_some());
    assert!(job.finished_at.is_some());
    assert!(!job.is_failed);
    assert!(job.remote_executable_folder.is_some());
    assert!(job.remote_result_folder.is_some());
    assert_eq!(job.usage.cpus, Some(2));
    assert_eq!(job.usage.walltime, Some(60));

    // folder rows exist for executable and result
    let folder = h
        .store
        .get_folder(job.remote_executable_folder.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(folder.hpc_path.starts_with("/scratch/jobsup/"));

    // result listing published with the manifest default file first
    let listing = h
        .kv
        .get(&format!("job_result_folder_content{job_id}"))
        .await
        .unwrap()
        .expect("result listing published");
    let listing: Vec<String> = serde_json::from_str(&listing).unwrap();
    assert_eq!(listing, vec!["summary.csv", "run.log"]);
}

#[tokio::test]
async fn capacity_cap_holds_excess_jobs_in_queue() {
    // a slower maintain tick keeps both admitted jobs observably running
    let h = harness_with_tick(
        HashMap::from([("anvil".to_string(), community_cluster(2))]),
        Duration::from_millis(150),
    )
    .await;

    // one submission finishes on its first poll, one lingers, the third
    // job waits in the queue (workers race for the scripts; the asserts
    // below do not depend on which job draws which)
    h.remote.push_script(vec![""]);
    h.remote.push_script(vec!["R"; 400]);
    h.remote.push_script(vec![""]);

    let jobs: Vec<Job> = (0..3).map(|_| basic_job("anvil")).collect();
    for job in jobs {
        h.supervisor.push_job(job).await.unwrap();
    }

    h.supervisor.tick().await;
    assert_eq!(h.supervisor.running_count("anvil").await, 2);
    assert_eq!(h.supervisor.queue_length("anvil").await, 1);
    // both running jobs share the community shell
    assert_eq!(h.pool.shared_refcount("anvil").await, 2);

    // a tick while full admits nothing
    h.supervisor.tick().await;
    assert_eq!(h.supervisor.running_count("anvil").await, 2);
    assert_eq!(h.supervisor.queue_length("anvil").await, 1);

    // the fast job completes and frees a slot; the next tick admits the
    // queued job
    for _ in 0..600 {
        if h.supervisor.running_count("anvil").await <= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.supervisor.running_count("anvil").await <= 1);
    h.supervisor.tick().await;
    assert_eq!(h.supervisor.queue_length("anvil").await, 0);
    assert!(h.supervisor.running_count("anvil").await <= 2);

    // cancel whatever is still running so the cluster drains
    for job_id in h.supervisor.running_jobs("anvil").await {
        h.supervisor.cancel_job(&job_id).await;
    }
    h.wait_for_idle("anvil").await;
    assert_eq!(h.supervisor.running_count("anvil").await, 0);
    assert_eq!(h.pool.shared_refcount("anvil").await, 0);
}

#[tokio::test]
async fn cached_stage_uploads_once_across_jobs() {
    let h = harness(HashMap::from([(
        "anvil".to_string(),
        community_cluster(1),
    )]))
    .await;
    h.seed_git_model("hello").await;

    for _ in 0..2 {
        let mut job = basic_job("anvil");
        job.local_executable_folder = Some(FolderSource::Git {
            git_id: "hello".into(),
        });
        h.remote.push_script(vec![""]);
        h.supervisor.push_job(job).await.unwrap();
        h.supervisor.tick().await;
        h.wait_for_idle("anvil").await;
    }

    // one archive upload total: the second job reuses the cached archive
    assert_eq!(h.remote.archive_uploads(), 1);
    assert!(
        h.store
            .get_cache("anvil", "/scratch/jobsup/cache/hello.tar.zst")
            .await
            .unwrap()
            .is_some()
    );
    // both jobs ran to completion
    assert_eq!(h.remote.submissions(), 2);
}

#[tokio::test]
async fn cancellation_of_a_running_job_scancels_and_frees_the_slot() {
    let h = harness(HashMap::from([(
        "anvil".to_string(),
        community_cluster(1),
    )]))
    .await;

    h.remote.push_script(vec!["R"; 400]);
    let job = basic_job("anvil");
    let job_id = job.id.clone();
    h.supervisor.push_job(job).await.unwrap();
    h.supervisor.tick().await;

    // wait until the job is on the hpc
    for _ in 0..600 {
        if h.remote.submissions() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.supervisor.running_count("anvil").await, 1);

    let cancelled = h.supervisor.cancel_job(&job_id).await;
    assert_eq!(cancelled.unwrap().id, job_id);

    h.wait_for_idle("anvil").await;
    assert_eq!(h.remote.scancelled.lock().unwrap().clone(), vec![1]);
    assert_eq!(h.supervisor.running_count("anvil").await, 0);

    let events = h.event_types(&job_id).await;
    assert_eq!(events.last().map(String::as_str), Some("JOB_FAILED"));
    let job = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert!(job.is_failed);
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn cancel_unknown_job_is_a_noop() {
    let h = harness(HashMap::from([(
        "anvil".to_string(),
        community_cluster(1),
    )]))
    .await;
    assert!(h.supervisor.cancel_job("ghost").await.is_none());
    assert_eq!(h.supervisor.running_count("anvil").await, 0);
}

#[tokio::test]
async fn transient_ssh_flap_during_maintain_recovers_without_failure() {
    let h = harness(HashMap::from([(
        "anvil".to_string(),
        community_cluster(1),
    )]))
    .await;

    h.remote.push_script(vec![""]);
    let job = basic_job("anvil");
    let job_id = job.id.clone();

    // the first three status polls hit a dead transport
    h.remote.inject_flap("squeue", 3);

    h.supervisor.push_job(job).await.unwrap();
    h.supervisor.tick().await;
    h.wait_for_idle("anvil").await;

    let events = h.event_types(&job_id).await;
    assert!(!events.iter().any(|e| e == "JOB_FAILED"));
    assert_eq!(events.iter().filter(|e| *e == "JOB_RETRY").count(), 1);
    assert_eq!(events.last().map(String::as_str), Some("JOB_ENDED"));
}

#[tokio::test]
async fn exhausted_retries_fail_the_job() {
    let h = harness(HashMap::from([(
        "anvil".to_string(),
        community_cluster(1),
    )]))
    .await;

    h.remote.push_script(vec!["R"; 400]);
    let job = basic_job("anvil");
    let job_id = job.id.clone();

    // more consecutive failures than the retry budget tolerates
    h.remote.inject_flap("squeue", 50);

    h.supervisor.push_job(job).await.unwrap();
    h.supervisor.tick().await;
    h.wait_for_idle("anvil").await;

    let events = h.event_types(&job_id).await;
    assert_eq!(events.last().map(String::as_str), Some("JOB_FAILED"));
    let job = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert!(job.is_failed);
}

#[tokio::test]
async fn over_ceiling_job_never_reaches_the_queue() {
    let h = harness(HashMap::from([(
        "anvil".to_string(),
        private_cluster(
            1,
            Some(SlurmRules {
                max_memory_per_cpu: Some("10G".into()),
                ..Default::default()
            }),
        ),
    )]))
    .await;

    let mut job = basic_job("anvil");
    job.slurm.insert("memory_per_cpu".into(), "100G".into());
    let job_id = job.id.clone();

    let err = h.supervisor.push_job(job).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Validate(_)));
    assert_eq!(h.supervisor.queue_length("anvil").await, 0);
    assert!(h.store.get_job(&job_id).await.unwrap().is_none());
    assert!(h.event_types(&job_id).await.is_empty());
}

#[tokio::test]
async fn unknown_cluster_is_rejected_at_the_boundary() {
    let h = harness(HashMap::from([(
        "anvil".to_string(),
        community_cluster(1),
    )]))
    .await;
    let job = basic_job("nowhere");
    let err = h.supervisor.push_job(job).await.unwrap_err();
    assert!(matches!(err, SupervisorError::UnknownCluster(_)));
}

#[tokio::test]
async fn zero_capacity_cluster_never_dequeues() {
    let h = harness(HashMap::from([(
        "anvil".to_string(),
        community_cluster(0),
    )]))
    .await;

    h.supervisor.push_job(basic_job("anvil")).await.unwrap();
    for _ in 0..3 {
        h.supervisor.tick().await;
    }
    assert_eq!(h.supervisor.queue_length("anvil").await, 1);
    assert_eq!(h.supervisor.running_count("anvil").await, 0);
}

#[tokio::test]
async fn empty_queue_tick_is_a_noop() {
    let h = harness(HashMap::from([(
        "anvil".to_string(),
        community_cluster(2),
    )]))
    .await;
    h.supervisor.tick().await;
    assert_eq!(h.supervisor.running_count("anvil").await, 0);
    assert!(h.remote.execs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn private_job_without_credential_is_an_init_error() {
    let h = harness(HashMap::from([(
        "anvil".to_string(),
        private_cluster(1, None),
    )]))
    .await;

    let mut job = basic_job("anvil");
    job.credential_id = Some("never-registered".into());
    let job_id = job.id.clone();

    h.supervisor.push_job(job).await.unwrap();
    h.supervisor.tick().await;
    h.wait_for_idle("anvil").await;

    let events = h.event_types(&job_id).await;
    assert_eq!(events.last().map(String::as_str), Some("JOB_INIT_ERROR"));
    assert_eq!(h.supervisor.running_count("anvil").await, 0);
    let job = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert!(job.is_failed);
    assert!(job.finished_at.is_some());
}
