use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::db::RuntimeDb;
use crate::types::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub message_id: String,
    pub queue_name: String,
    pub status: EventStatus,
    pub attributes: Value,
    pub body: Value,
    pub error: Option<String>,
    pub job_id: Option<JobId>,
    pub counter: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventUpsert {
    pub message_id: String,
    pub queue_name: String,
    pub status: EventStatus,
    pub attributes: Value,
    pub body: Value,
    pub error: Option<String>,
    pub job_id: Option<JobId>,
}

#[derive(Error, Debug)]
pub enum EventStoreError {
    #[error("db error: {0}")]
    Db(String),
}

/// Idempotency table keyed by external message id (§3, §4.7). `upsert`
/// increments the delivery counter on every call regardless of outcome,
/// which is what makes redelivery visible without duplicating ledger work.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn upsert(&self, event: EventUpsert) -> Result<Event, EventStoreError>;
    async fn get_by_message_id(&self, message_id: &str) -> Result<Option<Event>, EventStoreError>;
}

pub fn memory() -> Arc<dyn EventStore> {
    Arc::new(MemoryEventStore::default())
}

pub fn postgres(db: Arc<RuntimeDb>) -> Arc<dyn EventStore> {
    Arc::new(PostgresEventStore { db })
}

#[derive(Default)]
pub struct MemoryEventStore {
    inner: Mutex<MemoryEventStoreInner>,
}

#[derive(Default)]
struct MemoryEventStoreInner {
    events: HashMap<String, Event>,
    next_id: i64,
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert(&self, event: EventUpsert) -> Result<Event, EventStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        if let Some(existing) = inner.events.get_mut(&event.message_id) {
            existing.status = event.status;
            existing.attributes = event.attributes;
            existing.body = event.body;
            existing.error = event.error;
            existing.job_id = event.job_id.or(existing.job_id);
            existing.counter += 1;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        inner.next_id += 1;
        let stored = Event {
            id: inner.next_id,
            message_id: event.message_id.clone(),
            queue_name: event.queue_name,
            status: event.status,
            attributes: event.attributes,
            body: event.body,
            error: event.error,
            job_id: event.job_id,
            counter: 1,
            created_at: now,
            updated_at: now,
        };
        inner.events.insert(event.message_id, stored.clone());
        Ok(stored)
    }

    async fn get_by_message_id(&self, message_id: &str) -> Result<Option<Event>, EventStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.events.get(message_id).cloned())
    }
}

pub struct PostgresEventStore {
    db: Arc<RuntimeDb>,
}

impl PostgresEventStore {
    fn map_row(row: &tokio_postgres::Row) -> Result<Event, EventStoreError> {
        let status_raw: String = row.try_get("status").map_err(|e| EventStoreError::Db(e.to_string()))?;
        Ok(Event {
            id: row.try_get("id").map_err(|e| EventStoreError::Db(e.to_string()))?,
            message_id: row.try_get("message_id").map_err(|e| EventStoreError::Db(e.to_string()))?,
            queue_name: row.try_get("queue_name").map_err(|e| EventStoreError::Db(e.to_string()))?,
            status: match status_raw.as_str() {
                "COMPLETED" => EventStatus::Completed,
                _ => EventStatus::Failed,
            },
            attributes: row.try_get("attributes").map_err(|e| EventStoreError::Db(e.to_string()))?,
            body: row.try_get("body").map_err(|e| EventStoreError::Db(e.to_string()))?,
            error: row.try_get("error").map_err(|e| EventStoreError::Db(e.to_string()))?,
            job_id: row.try_get("job_id").map_err(|e| EventStoreError::Db(e.to_string()))?,
            counter: row.try_get("counter").map_err(|e| EventStoreError::Db(e.to_string()))?,
            created_at: row.try_get("created_at").map_err(|e| EventStoreError::Db(e.to_string()))?,
            updated_at: row.try_get("updated_at").map_err(|e| EventStoreError::Db(e.to_string()))?,
        })
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn upsert(&self, event: EventUpsert) -> Result<Event, EventStoreError> {
        let client = self.db.get().await.map_err(|error| EventStoreError::Db(error.to_string()))?;
        let row = client
            .query_one(
                "INSERT INTO event (message_id, queue_name, status, attributes, body, error, job_id, counter, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 1, now(), now())
                 ON CONFLICT (message_id) DO UPDATE SET
                   status = EXCLUDED.status,
                   attributes = EXCLUDED.attributes,
                   body = EXCLUDED.body,
                   error = EXCLUDED.error,
                   job_id = COALESCE(EXCLUDED.job_id, event.job_id),
                   counter = event.counter + 1,
                   updated_at = now()
                 RETURNING *",
                &[
                    &event.message_id,
                    &event.queue_name,
                    &event.status.as_str(),
                    &event.attributes,
                    &event.body,
                    &event.error,
                    &event.job_id,
                ],
            )
            .await
            .map_err(|error| EventStoreError::Db(error.to_string()))?;
        Self::map_row(&row)
    }

    async fn get_by_message_id(&self, message_id: &str) -> Result<Option<Event>, EventStoreError> {
        let client = self.db.get().await.map_err(|error| EventStoreError::Db(error.to_string()))?;
        let row = client
            .query_opt("SELECT * FROM event WHERE message_id = $1", &[&message_id])
            .await
            .map_err(|error| EventStoreError::Db(error.to_string()))?;
        row.as_ref().map(Self::map_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn redelivery_increments_counter_without_new_row() {
        let store = memory();
        let first = store
            .upsert(EventUpsert {
                message_id: "msg-1".to_string(),
                queue_name: "oneshot-events".to_string(),
                status: EventStatus::Completed,
                attributes: serde_json::json!({}),
                body: serde_json::json!({}),
                error: None,
                job_id: None,
            })
            .await
            .unwrap();
        assert_eq!(first.counter, 1);

        let second = store
            .upsert(EventUpsert {
                message_id: "msg-1".to_string(),
                queue_name: "oneshot-events".to_string(),
                status: EventStatus::Completed,
                attributes: serde_json::json!({}),
                body: serde_json::json!({}),
                error: None,
                job_id: None,
            })
            .await
            .unwrap();
        assert_eq!(second.counter, 2);
        assert_eq!(second.id, first.id);
    }
}
