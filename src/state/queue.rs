// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::kv::{KvError, KvStore};
use super::models::{Credential, Job};
use super::store::{StoreError, SupervisorStore};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("credential serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A job hydrated at dequeue time: the entity row plus, for private-account
/// jobs, the credential pulled from the secret store.
#[derive(Debug, Clone)]
pub struct HydratedJob {
    pub job: Job,
    pub credential: Option<Credential>,
}

/// Durable FIFO of job ids awaiting admission on one cluster, backed by
/// the keyed store's list primitive. Never blocks callers: an empty list
/// returns `None`, ids with no matching job row are skipped silently.
pub struct JobQueue {
    cluster: String,
    kv: Arc<dyn KvStore>,
    store: SupervisorStore,
    vault: CredentialVault,
}

impl JobQueue {
    pub fn new(cluster: &str, kv: Arc<dyn KvStore>, store: SupervisorStore) -> Self {
        Self {
            cluster: cluster.to_string(),
            kv: kv.clone(),
            store,
            vault: CredentialVault::new(kv),
        }
    }

    fn key(&self) -> String {
        format!("job_queue_{}", self.cluster)
    }

    pub async fn push(&self, job_id: &str) -> Result<(), QueueError> {
        self.kv.list_push(&self.key(), job_id).await?;
        Ok(())
    }

    /// Pop the next admissible job, hydrating its entity and credential.
    /// Ids found in the queue but absent from the store are dropped and the
    /// pop continues with the next entry.
    pub async fn pop(&self) -> Result<Option<HydratedJob>, QueueError> {
        loop {
            let Some(job_id) = self.kv.list_pop(&self.key()).await? else {
                return Ok(None);
            };
            let Some(job) = self.store.get_job(&job_id).await? else {
                tracing::warn!(cluster = %self.cluster, %job_id, "queued job missing from store; skipping");
                continue;
            };
            let credential = match &job.credential_id {
                Some(id) => self.vault.get(id).await?,
                None => None,
            };
            return Ok(Some(HydratedJob { job, credential }));
        }
    }

    pub async fn peek(&self) -> Result<Option<String>, QueueError> {
        Ok(self.kv.list_peek(&self.key()).await?)
    }

    pub async fn length(&self) -> Result<usize, QueueError> {
        Ok(self.kv.list_len(&self.key()).await?)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.length().await? == 0)
    }
}

/// Short-lived secret store for private-account credentials, keyed by
/// opaque credential id. Readable only by the supervisor; TTL matches the
/// job lifetime.
#[derive(Clone)]
pub struct CredentialVault {
    kv: Arc<dyn KvStore>,
}

impl CredentialVault {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(id: &str) -> String {
        format!("credential_{id}")
    }

    pub async fn put(&self, credential: &Credential, ttl: Duration) -> Result<(), QueueError> {
        let payload = serde_json::to_string(credential)?;
        self.kv
            .set(&Self::key(&credential.id), &payload, Some(ttl))
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Credential>, QueueError> {
        let Some(raw) = self.kv.get(&Self::key(id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub async fn remove(&self, id: &str) -> Result<(), QueueError> {
        self.kv.delete(&Self::key(id)).await?;
        Ok(())
    }
}
