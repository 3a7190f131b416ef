// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{RemoteShell, ShellFactory, SshParams};

struct SharedSlot {
    refcount: usize,
    shell: Arc<dyn RemoteShell>,
}

/// Process-wide bookkeeping of shell sessions. Two indexing disciplines:
/// shared community-account entries are keyed by cluster and ref-counted;
/// private entries are keyed by job id and live exactly as long as the job.
/// The pool is the sole owner of shells: callers must release every
/// acquisition and may not hold a shell past one maintainer iteration.
pub struct ConnectionPool {
    factory: Arc<dyn ShellFactory>,
    shared: Mutex<HashMap<String, SharedSlot>>,
    private: Mutex<HashMap<String, Arc<dyn RemoteShell>>>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ShellFactory>) -> Self {
        Self {
            factory,
            shared: Mutex::new(HashMap::new()),
            private: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the shared shell for `cluster`, creating it on first use.
    pub async fn acquire_shared(&self, cluster: &str, params: SshParams) -> Arc<dyn RemoteShell> {
        let mut shared = self.shared.lock().await;
        let slot = shared.entry(cluster.to_string()).or_insert_with(|| {
            tracing::debug!(cluster, "creating shared shell session");
            SharedSlot {
                refcount: 0,
                shell: self.factory.build(params),
            }
        });
        slot.refcount += 1;
        slot.shell.clone()
    }

    /// Release one reference to the shared shell; the session is disposed
    /// when the last running job on the cluster lets go.
    pub async fn release_shared(&self, cluster: &str) {
        let disposed = {
            let mut shared = self.shared.lock().await;
            match shared.get_mut(cluster) {
                Some(slot) => {
                    slot.refcount = slot.refcount.saturating_sub(1);
                    if slot.refcount == 0 {
                        shared.remove(cluster).map(|slot| slot.shell)
                    } else {
                        None
                    }
                }
                None => {
                    tracing::warn!(cluster, "release on unknown shared pool entry");
                    None
                }
            }
        };
        if let Some(shell) = disposed {
            tracing::debug!(cluster, "disposing shared shell session");
            shell.dispose().await;
        }
    }

    /// Install the per-job shell for a private-account job at admission.
    pub async fn install_private(&self, job_id: &str, params: SshParams) -> Arc<dyn RemoteShell> {
        let shell = self.factory.build(params);
        self.private
            .lock()
            .await
            .insert(job_id.to_string(), shell.clone());
        shell
    }

    pub async fn get_private(&self, job_id: &str) -> Option<Arc<dyn RemoteShell>> {
        self.private.lock().await.get(job_id).cloned()
    }

    /// Destroy the per-job shell at job termination.
    pub async fn remove_private(&self, job_id: &str) {
        let removed = self.private.lock().await.remove(job_id);
        if let Some(shell) = removed {
            shell.dispose().await;
        }
    }

    pub async fn shared_refcount(&self, cluster: &str) -> usize {
        self.shared
            .lock()
            .await
            .get(cluster)
            .map(|slot| slot.refcount)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{AuthMethod, ExecOutput, ShellError};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeShell {
        disposed: AtomicUsize,
    }

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn exec(&self, _cmd: &str) -> Result<ExecOutput, ShellError> {
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
        async fn upload(&self, _local: &Path, _remote: &str) -> Result<(), ShellError> {
            Ok(())
        }
        async fn download(&self, _remote: &str, _local: &Path) -> Result<(), ShellError> {
            Ok(())
        }
        async fn mkdir_p(&self, _path: &str) -> Result<(), ShellError> {
            Ok(())
        }
        async fn exists(&self, _path: &str) -> Result<bool, ShellError> {
            Ok(false)
        }
        async fn rm_rf(&self, _path: &str) -> Result<(), ShellError> {
            Ok(())
        }
        async fn extract_archive(&self, _archive: &str, _dest: &str) -> Result<(), ShellError> {
            Ok(())
        }
        async fn is_connected(&self) -> bool {
            true
        }
        async fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        built: StdMutex<Vec<SshParams>>,
        shells: StdMutex<Vec<Arc<FakeShell>>>,
    }

    impl ShellFactory for RecordingFactory {
        fn build(&self, params: SshParams) -> Arc<dyn RemoteShell> {
            self.built.lock().unwrap().push(params);
            let shell = Arc::new(FakeShell {
                disposed: AtomicUsize::new(0),
            });
            self.shells.lock().unwrap().push(shell.clone());
            shell
        }
    }

    fn params(user: &str) -> SshParams {
        SshParams {
            host: "cluster.example.org".into(),
            port: 22,
            username: user.into(),
            auth: AuthMethod::Password("pw".into()),
            keepalive_secs: 60,
            host_fingerprint: None,
        }
    }

    #[tokio::test]
    async fn shared_entries_are_refcounted_and_disposed_at_zero() {
        let factory = Arc::new(RecordingFactory::default());
        let pool = ConnectionPool::new(factory.clone());

        let a = pool.acquire_shared("anvil", params("community")).await;
        let b = pool.acquire_shared("anvil", params("community")).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.shared_refcount("anvil").await, 2);
        assert_eq!(factory.built.lock().unwrap().len(), 1);

        pool.release_shared("anvil").await;
        assert_eq!(pool.shared_refcount("anvil").await, 1);
        let shell = factory.shells.lock().unwrap()[0].clone();
        assert_eq!(shell.disposed.load(Ordering::SeqCst), 0);

        pool.release_shared("anvil").await;
        assert_eq!(pool.shared_refcount("anvil").await, 0);
        assert_eq!(shell.disposed.load(Ordering::SeqCst), 1);

        // A fresh acquire after full release builds a new session.
        let _c = pool.acquire_shared("anvil", params("community")).await;
        assert_eq!(factory.built.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn private_entries_live_per_job() {
        let factory = Arc::new(RecordingFactory::default());
        let pool = ConnectionPool::new(factory.clone());

        let shell = pool.install_private("job-1", params("alice")).await;
        assert!(pool.get_private("job-1").await.is_some());
        assert!(Arc::ptr_eq(
            &shell,
            &pool.get_private("job-1").await.unwrap()
        ));

        pool.remove_private("job-1").await;
        assert!(pool.get_private("job-1").await.is_none());
        let fake = factory.shells.lock().unwrap()[0].clone();
        assert_eq!(fake.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_on_unknown_cluster_is_harmless() {
        let factory = Arc::new(RecordingFactory::default());
        let pool = ConnectionPool::new(factory);
        pool.release_shared("nowhere").await;
        assert_eq!(pool.shared_refcount("nowhere").await, 0);
    }
}
