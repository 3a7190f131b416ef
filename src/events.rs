// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use chrono::Utc;

use crate::state::models::{EventRecord, EventType, LogRecord};
use crate::state::store::SupervisorStore;

const LOG_MESSAGE_LIMIT: usize = 500;
const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Funnel from maintainers to the persistent event and log streams. Writes
/// are best-effort: a failed persistence is logged and swallowed so a flaky
/// database never fails a running job. Distinguished event types mutate the
/// job lifecycle timestamps.
#[derive(Clone)]
pub struct EventEmitter {
    store: SupervisorStore,
}

impl EventEmitter {
    pub fn new(store: SupervisorStore) -> Self {
        Self { store }
    }

    pub async fn emit_event(&self, job_id: &str, event_type: EventType, message: &str) {
        let now = Utc::now();
        tracing::info!(job_id, event = %event_type, message, "job event");

        match event_type {
            EventType::JobInit => {
                if let Err(err) = self.store.set_initialized_at(job_id, now).await {
                    tracing::warn!(job_id, %err, "failed to persist initialized_at");
                }
            }
            EventType::JobEnded | EventType::JobFailed => {
                let is_failed = event_type == EventType::JobFailed;
                if let Err(err) = self.store.set_finished(job_id, now, is_failed).await {
                    tracing::warn!(job_id, %err, "failed to persist finished_at");
                }
            }
            _ => {}
        }

        let record = EventRecord {
            job_id: job_id.to_string(),
            event_type: event_type.as_str().to_string(),
            message: message.to_string(),
            created_at: now,
        };
        if let Err(err) = self.store.append_event(&record).await {
            tracing::warn!(job_id, %err, "failed to persist event");
        }
    }

    pub async fn emit_log(&self, job_id: &str, message: &str) {
        let record = LogRecord {
            job_id: job_id.to_string(),
            message: truncate_message(message),
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.append_log(&record).await {
            tracing::warn!(job_id, %err, "failed to persist log");
        }
    }
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= LOG_MESSAGE_LIMIT {
        return message.to_string();
    }
    let head: String = message.chars().take(LOG_MESSAGE_LIMIT).collect();
    format!("{head}{TRUNCATION_SUFFIX}")
}
