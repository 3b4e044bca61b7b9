use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::error::EventError;
use crate::store::{Job, JobUpdate, LedgerStore};
use crate::types::{JobId, ServiceType};

use super::consumer::QueueConsumer;
use super::wire::{validate_timestamp, StorageEvent};

pub struct StorageConsumer {
    ledger: Arc<dyn LedgerStore>,
    max_past_days: i64,
    max_future_seconds: i64,
}

impl StorageConsumer {
    pub fn new(ledger: Arc<dyn LedgerStore>, max_past_days: i64, max_future_seconds: i64) -> Self {
        Self { ledger, max_past_days, max_future_seconds }
    }
}

#[async_trait]
impl QueueConsumer for StorageConsumer {
    fn name(&self) -> &'static str {
        "storage"
    }

    async fn consume(&self, body: &str, now: DateTime<Utc>) -> Result<Option<JobId>, EventError> {
        let event: StorageEvent =
            serde_json::from_str(body).map_err(|error| EventError::Permanent(format!("invalid storage event: {error}")))?;
        let at = validate_timestamp(event.timestamp, now, self.max_past_days, self.max_future_seconds)?;

        let family = self
            .ledger
            .get_account_family_by_proj(event.proj_id)
            .await
            .map_err(|error| EventError::Retriable(error.to_string()))?;

        if let Some(open) = self
            .ledger
            .find_open_storage_job(event.proj_id)
            .await
            .map_err(|error| EventError::Retriable(error.to_string()))?
        {
            self.ledger
                .apply_job_update(open.id, JobUpdate { finished_at: Some(at), ..Default::default() })
                .await
                .map_err(|error| EventError::Retriable(error.to_string()))?;
        }

        let job = Job {
            id: Uuid::new_v4(),
            vlab_id: family.vlab.id,
            proj_id: event.proj_id,
            user_id: None,
            group_id: None,
            service_type: ServiceType::Storage,
            service_subtype: event.subtype,
            reserved_at: None,
            started_at: Some(at),
            last_alive_at: Some(at),
            last_charged_at: None,
            finished_at: None,
            cancelled_at: None,
            reservation_params: json!({}),
            usage_params: json!({ "size": event.size }),
        };
        let job = self.ledger.insert_job(job).await.map_err(|error| EventError::Retriable(error.to_string()))?;
        Ok(Some(job.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;

    #[tokio::test]
    async fn consume_closes_the_previous_open_job_and_opens_a_new_one() {
        let now = Utc::now();
        let ledger = store::memory();
        ledger.create_system_account("system", now).await.unwrap();
        let vlab = ledger.create_vlab("vlab-1", None, now).await.unwrap();
        let (proj, _rsv) = ledger.create_proj(vlab.id, "proj-1", now).await.unwrap();

        let consumer = StorageConsumer::new(ledger.clone(), 30, 60);
        let body = |at: DateTime<Utc>| {
            json!({
                "type": "storage", "subtype": "volume", "proj_id": proj.id, "size": 100, "timestamp": at.timestamp(),
            })
            .to_string()
        };

        let first_id = consumer.consume(&body(now), now).await.unwrap().unwrap();
        let later = now + chrono::Duration::seconds(60);
        let second_id = consumer.consume(&body(later), later).await.unwrap().unwrap();

        assert_ne!(first_id, second_id);
        let first = ledger.get_job(first_id).await.unwrap();
        assert_eq!(first.finished_at, Some(later));
        let second = ledger.get_job(second_id).await.unwrap();
        assert!(second.finished_at.is_none());
    }
}
