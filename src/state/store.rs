// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use super::models::{
    CacheRecord, EventRecord, Folder, GitRecord, Job, LogRecord, MaintainerKind, UsageCounters,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("bad timestamp in row: {0}")]
    BadTimestamp(String),
    #[error("bad maintainer in row: {0}")]
    BadMaintainer(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Relational store for jobs, folders, caches, events, logs and registered
/// git repositories. All queries are runtime-bound; the schema is created
/// on open.
#[derive(Clone)]
pub struct SupervisorStore {
    pool: SqlitePool,
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::BadTimestamp(raw.to_string()))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

impl SupervisorStore {
    /// Open (or create) a file-backed SQLite DB and run the bootstrap DDL.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let url = format!("sqlite://{}", path.as_ref().to_string_lossy());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Open an in-memory store (handy for tests).
    pub async fn open_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        // Improve concurrency for file DBs.
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
              id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              hpc TEXT NOT NULL,
              maintainer TEXT NOT NULL,
              credential_id TEXT,
              param TEXT NOT NULL,              -- JSON object
              env TEXT NOT NULL,                -- JSON object
              slurm TEXT NOT NULL,              -- JSON object
              local_executable_folder TEXT,     -- JSON FolderSource
              local_data_folder TEXT,           -- JSON FolderSource
              remote_data_folder TEXT,
              remote_executable_folder TEXT,
              remote_result_folder TEXT,
              created_at TEXT NOT NULL,
              queued_at TEXT,
              initialized_at TEXT,
              finished_at TEXT,
              is_failed INTEGER NOT NULL DEFAULT 0,
              nodes INTEGER,
              cpus INTEGER,
              cpu_time INTEGER,
              memory INTEGER,
              memory_usage INTEGER,
              walltime INTEGER
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_hpc ON jobs(hpc)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_user ON jobs(user_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
              id TEXT PRIMARY KEY,
              hpc TEXT NOT NULL,
              user_id TEXT NOT NULL,
              hpc_path TEXT NOT NULL,
              globus_path TEXT,
              is_deleted INTEGER NOT NULL DEFAULT 0,
              created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS caches (
              hpc TEXT NOT NULL,
              hpc_path TEXT NOT NULL,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              PRIMARY KEY (hpc, hpc_path)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              job_id TEXT NOT NULL,
              event_type TEXT NOT NULL,
              message TEXT NOT NULL,
              created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_job_id ON events(job_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS logs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              job_id TEXT NOT NULL,
              message TEXT NOT NULL,
              created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_logs_job_id ON logs(job_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gits (
              id TEXT PRIMARY KEY,
              address TEXT NOT NULL,
              created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // --- jobs ---

    pub async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
              id, user_id, hpc, maintainer, credential_id, param, env, slurm,
              local_executable_folder, local_data_folder,
              remote_data_folder, remote_executable_folder, remote_result_folder,
              created_at, queued_at, initialized_at, finished_at, is_failed,
              nodes, cpus, cpu_time, memory, memory_usage, walltime
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.user_id)
        .bind(&job.hpc)
        .bind(job.maintainer.as_str())
        .bind(&job.credential_id)
        .bind(serde_json::to_string(&job.param)?)
        .bind(serde_json::to_string(&job.env)?)
        .bind(serde_json::to_string(&job.slurm)?)
        .bind(
            job.local_executable_folder
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(
            job.local_data_folder
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&job.remote_data_folder)
        .bind(&job.remote_executable_folder)
        .bind(&job.remote_result_folder)
        .bind(job.created_at.to_rfc3339())
        .bind(job.queued_at.map(|t| t.to_rfc3339()))
        .bind(job.initialized_at.map(|t| t.to_rfc3339()))
        .bind(job.finished_at.map(|t| t.to_rfc3339()))
        .bind(job.is_failed as i64)
        .bind(job.usage.nodes)
        .bind(job.usage.cpus)
        .bind(job.usage.cpu_time)
        .bind(job.usage.memory)
        .bind(job.usage.memory_usage)
        .bind(job.usage.walltime)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(job_from_row).transpose()
    }

    /// Write back the fields a maintainer mutates after admission.
    pub async fn update_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
              remote_data_folder = ?,
              remote_executable_folder = ?,
              remote_result_folder = ?,
              queued_at = ?,
              initialized_at = ?,
              finished_at = ?,
              is_failed = ?,
              nodes = ?, cpus = ?, cpu_time = ?, memory = ?, memory_usage = ?, walltime = ?
            WHERE id = ?
            "#,
        )
        .bind(&job.remote_data_folder)
        .bind(&job.remote_executable_folder)
        .bind(&job.remote_result_folder)
        .bind(job.queued_at.map(|t| t.to_rfc3339()))
        .bind(job.initialized_at.map(|t| t.to_rfc3339()))
        .bind(job.finished_at.map(|t| t.to_rfc3339()))
        .bind(job.is_failed as i64)
        .bind(job.usage.nodes)
        .bind(job.usage.cpus)
        .bind(job.usage.cpu_time)
        .bind(job.usage.memory)
        .bind(job.usage.memory_usage)
        .bind(job.usage.walltime)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_queued_at(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE jobs SET queued_at = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_initialized_at(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE jobs SET initialized_at = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_finished(&self, id: &str, at: DateTime<Utc>, is_failed: bool) -> Result<()> {
        sqlx::query("UPDATE jobs SET finished_at = ?, is_failed = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(is_failed as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_usage(&self, id: &str, usage: &UsageCounters) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET nodes = ?, cpus = ?, cpu_time = ?, memory = ?,
              memory_usage = ?, walltime = ?
            WHERE id = ?
            "#,
        )
        .bind(usage.nodes)
        .bind(usage.cpus)
        .bind(usage.cpu_time)
        .bind(usage.memory)
        .bind(usage.memory_usage)
        .bind(usage.walltime)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- folders ---

    pub async fn insert_folder(&self, folder: &Folder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO folders (id, hpc, user_id, hpc_path, globus_path, is_deleted, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&folder.id)
        .bind(&folder.hpc)
        .bind(&folder.user_id)
        .bind(&folder.hpc_path)
        .bind(&folder.globus_path)
        .bind(folder.is_deleted as i64)
        .bind(folder.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_folder(&self, id: &str) -> Result<Option<Folder>> {
        let row = sqlx::query("SELECT * FROM folders WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(folder_from_row).transpose()
    }

    pub async fn soft_delete_folder(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE folders SET is_deleted = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- caches ---

    pub async fn get_cache(&self, hpc: &str, hpc_path: &str) -> Result<Option<CacheRecord>> {
        let row = sqlx::query("SELECT * FROM caches WHERE hpc = ? AND hpc_path = ?")
            .bind(hpc)
            .bind(hpc_path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(CacheRecord {
                hpc: r.try_get("hpc")?,
                hpc_path: r.try_get("hpc_path")?,
                created_at: parse_ts(&r.try_get::<String, _>("created_at")?)?,
                updated_at: parse_ts(&r.try_get::<String, _>("updated_at")?)?,
            })
        })
        .transpose()
    }

    /// Insert a new row or bump `updated_at` on an existing one.
    pub async fn upsert_cache(&self, hpc: &str, hpc_path: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO caches (hpc, hpc_path, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(hpc, hpc_path) DO UPDATE SET updated_at = excluded.updated_at
            "#,
        )
        .bind(hpc)
        .bind(hpc_path)
        .bind(at.to_rfc3339())
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_cache(&self, hpc: &str, hpc_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM caches WHERE hpc = ? AND hpc_path = ?")
            .bind(hpc)
            .bind(hpc_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- events & logs ---

    pub async fn append_event(&self, event: &EventRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO events (job_id, event_type, message, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&event.job_id)
        .bind(&event.event_type)
        .bind(&event.message)
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_log(&self, log: &LogRecord) -> Result<()> {
        sqlx::query("INSERT INTO logs (job_id, message, created_at) VALUES (?, ?, ?)")
            .bind(&log.job_id)
            .bind(&log.message)
            .bind(log.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_events(&self, job_id: &str) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query("SELECT * FROM events WHERE job_id = ? ORDER BY id")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(EventRecord {
                    job_id: r.try_get("job_id")?,
                    event_type: r.try_get("event_type")?,
                    message: r.try_get("message")?,
                    created_at: parse_ts(&r.try_get::<String, _>("created_at")?)?,
                })
            })
            .collect()
    }

    pub async fn list_logs(&self, job_id: &str) -> Result<Vec<LogRecord>> {
        let rows = sqlx::query("SELECT * FROM logs WHERE job_id = ? ORDER BY id")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(LogRecord {
                    job_id: r.try_get("job_id")?,
                    message: r.try_get("message")?,
                    created_at: parse_ts(&r.try_get::<String, _>("created_at")?)?,
                })
            })
            .collect()
    }

    // --- gits ---

    pub async fn upsert_git(&self, git: &GitRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gits (id, address, created_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET address = excluded.address
            "#,
        )
        .bind(&git.id)
        .bind(&git.address)
        .bind(git.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_git(&self, id: &str) -> Result<Option<GitRecord>> {
        let row = sqlx::query("SELECT * FROM gits WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(GitRecord {
                id: r.try_get("id")?,
                address: r.try_get("address")?,
                created_at: parse_ts(&r.try_get::<String, _>("created_at")?)?,
            })
        })
        .transpose()
    }
}

fn job_from_row(row: SqliteRow) -> Result<Job> {
    let maintainer_raw: String = row.try_get("maintainer")?;
    let maintainer = maintainer_raw
        .parse::<MaintainerKind>()
        .map_err(|e| StoreError::BadMaintainer(e.0))?;

    let param: String = row.try_get("param")?;
    let env: String = row.try_get("env")?;
    let slurm: String = row.try_get("slurm")?;
    let local_executable_folder: Option<String> = row.try_get("local_executable_folder")?;
    let local_data_folder: Option<String> = row.try_get("local_data_folder")?;

    Ok(Job {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        hpc: row.try_get("hpc")?,
        maintainer,
        credential_id: row.try_get("credential_id")?,
        param: serde_json::from_str(&param)?,
        env: serde_json::from_str(&env)?,
        slurm: serde_json::from_str(&slurm)?,
        local_executable_folder: local_executable_folder
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        local_data_folder: local_data_folder
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        remote_data_folder: row.try_get("remote_data_folder")?,
        remote_executable_folder: row.try_get("remote_executable_folder")?,
        remote_result_folder: row.try_get("remote_result_folder")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        queued_at: parse_opt_ts(row.try_get("queued_at")?)?,
        initialized_at: parse_opt_ts(row.try_get("initialized_at")?)?,
        finished_at: parse_opt_ts(row.try_get("finished_at")?)?,
        is_failed: row.try_get::<i64, _>("is_failed")? != 0,
        usage: UsageCounters {
            nodes: row.try_get("nodes")?,
            cpus: row.try_get("cpus")?,
            cpu_time: row.try_get("cpu_time")?,
            memory: row.try_get("memory")?,
            memory_usage: row.try_get("memory_usage")?,
            walltime: row.try_get("walltime")?,
        },
    })
}

fn folder_from_row(row: SqliteRow) -> Result<Folder> {
    Ok(Folder {
        id: row.try_get("id")?,
        hpc: row.try_get("hpc")?,
        user_id: row.try_get("user_id")?,
        hpc_path: row.try_get("hpc_path")?,
        globus_path: row.try_get("globus_path")?,
        is_deleted: row.try_get::<i64, _>("is_deleted")? != 0,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}
