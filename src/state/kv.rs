// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::{Config as RedisConfig, Pool, Runtime};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("keyed store backend error: {0}")]
    Backend(String),
}

fn backend(err: impl std::fmt::Display) -> KvError {
    KvError::Backend(err.to_string())
}

/// List + value primitives of the external keyed store. Per-cluster job
/// queues use the list side; credentials, Globus task labels and result
/// listings use the value side.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn list_push(&self, key: &str, value: &str) -> Result<(), KvError>;

    async fn list_pop(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn list_peek(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn list_len(&self, key: &str) -> Result<usize, KvError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

/// In-process keyed store for tests and single-node deployments. TTLs are
/// accepted and ignored; nothing here outlives the process anyway.
#[derive(Default)]
pub struct MemoryKv {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn list_push(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.lists
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self
            .lists
            .lock()
            .await
            .get_mut(key)
            .and_then(|q| q.pop_front()))
    }

    async fn list_peek(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self
            .lists
            .lock()
            .await
            .get(key)
            .and_then(|q| q.front().cloned()))
    }

    async fn list_len(&self, key: &str) -> Result<usize, KvError> {
        Ok(self.lists.lock().await.get(key).map(|q| q.len()).unwrap_or(0))
    }

    async fn set(&self, key: &str, value: &str, _ttl: Option<Duration>) -> Result<(), KvError> {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}

/// Redis-backed keyed store (RPUSH/LPOP queue discipline).
pub struct RedisKv {
    pool: Pool,
}

impl RedisKv {
    pub fn connect(url: &str) -> Result<Self, KvError> {
        let cfg = RedisConfig::from_url(url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1)).map_err(backend)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn list_push(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut con = self.pool.get().await.map_err(backend)?;
        let _: () = con.rpush(key, value).await.map_err(backend)?;
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut con = self.pool.get().await.map_err(backend)?;
        let value: Option<String> = con.lpop(key, None).await.map_err(backend)?;
        Ok(value)
    }

    async fn list_peek(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut con = self.pool.get().await.map_err(backend)?;
        let value: Option<String> = con.lindex(key, 0).await.map_err(backend)?;
        Ok(value)
    }

    async fn list_len(&self, key: &str) -> Result<usize, KvError> {
        let mut con = self.pool.get().await.map_err(backend)?;
        let len: usize = con.llen(key).await.map_err(backend)?;
        Ok(len)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut con = self.pool.get().await.map_err(backend)?;
        match ttl {
            Some(ttl) => {
                let _: () = con
                    .set_ex(key, value, ttl.as_secs().max(1))
                    .await
                    .map_err(backend)?;
            }
            None => {
                let _: () = con.set(key, value).await.map_err(backend)?;
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut con = self.pool.get().await.map_err(backend)?;
        let value: Option<String> = con.get(key).await.map_err(backend)?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut con = self.pool.get().await.map_err(backend)?;
        let _: () = con.del(key).await.map_err(backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_lists_are_fifo() {
        let kv = MemoryKv::new();
        kv.list_push("q", "a").await.unwrap();
        kv.list_push("q", "b").await.unwrap();
        kv.list_push("q", "c").await.unwrap();

        assert_eq!(kv.list_len("q").await.unwrap(), 3);
        assert_eq!(kv.list_peek("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(kv.list_pop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(kv.list_pop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(kv.list_pop("q").await.unwrap().as_deref(), Some("c"));
        assert_eq!(kv.list_pop("q").await.unwrap(), None);
        assert_eq!(kv.list_len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn memory_values_set_get_delete() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        kv.delete("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_list_is_empty_not_error() {
        let kv = MemoryKv::new();
        assert_eq!(kv.list_pop("missing").await.unwrap(), None);
        assert_eq!(kv.list_peek("missing").await.unwrap(), None);
        assert_eq!(kv.list_len("missing").await.unwrap(), 0);
    }
}
