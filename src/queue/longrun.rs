use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::error::EventError;
use crate::store::{JobUpdate, LedgerStore};
use crate::types::{JobId, ServiceType};

use super::consumer::{map_ledger_event_error, QueueConsumer};
use super::wire::{validate_timestamp, LongrunEvent, LongrunStatus};

pub struct LongrunConsumer {
    ledger: Arc<dyn LedgerStore>,
    max_past_days: i64,
    max_future_seconds: i64,
}

impl LongrunConsumer {
    pub fn new(ledger: Arc<dyn LedgerStore>, max_past_days: i64, max_future_seconds: i64) -> Self {
        Self { ledger, max_past_days, max_future_seconds }
    }
}

#[async_trait]
impl QueueConsumer for LongrunConsumer {
    fn name(&self) -> &'static str {
        "longrun"
    }

    async fn consume(&self, body: &str, now: DateTime<Utc>) -> Result<Option<JobId>, EventError> {
        let event: LongrunEvent =
            serde_json::from_str(body).map_err(|error| EventError::Permanent(format!("invalid longrun event: {error}")))?;
        let at = validate_timestamp(event.timestamp, now, self.max_past_days, self.max_future_seconds)?;

        let update = match event.status {
            LongrunStatus::Started => JobUpdate {
                started_at: Some(at),
                last_alive_at: Some(at),
                usage_params: Some(json!({
                    "instances": event.instances,
                    "instance_type": event.instance_type,
                })),
                ..Default::default()
            },
            LongrunStatus::Running => JobUpdate {
                last_alive_at: Some(at),
                ..Default::default()
            },
            LongrunStatus::Finished => JobUpdate {
                last_alive_at: Some(at),
                finished_at: Some(at),
                ..Default::default()
            },
        };

        // Locks PROJ+RSV and the job row for the whole check-then-update so a
        // redelivered or racing event can never act on a stale match (§4.7).
        let job = self
            .ledger
            .apply_matched_job_update(event.job_id, event.proj_id, ServiceType::Longrun, &event.subtype, update)
            .await
            .map_err(map_ledger_event_error)?;

        Ok(Some(job.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{self, Job};
    use uuid::Uuid;

    fn job_under(vlab_id: uuid::Uuid, proj_id: uuid::Uuid, at: DateTime<Utc>) -> Job {
        Job {
            id: Uuid::new_v4(),
            vlab_id,
            proj_id,
            user_id: None,
            group_id: None,
            service_type: ServiceType::Longrun,
            service_subtype: "gpu".to_string(),
            reserved_at: Some(at),
            started_at: None,
            last_alive_at: None,
            last_charged_at: None,
            finished_at: None,
            cancelled_at: None,
            reservation_params: json!({}),
            usage_params: json!({}),
        }
    }

    #[tokio::test]
    async fn consume_started_then_finished_updates_the_job() {
        let now = Utc::now();
        let ledger = store::memory();
        ledger.create_system_account("system", now).await.unwrap();
        let vlab = ledger.create_vlab("vlab-1", None, now).await.unwrap();
        let (proj, _rsv) = ledger.create_proj(vlab.id, "proj-1", now).await.unwrap();
        let job = ledger.insert_job(job_under(vlab.id, proj.id, now)).await.unwrap();

        let consumer = LongrunConsumer::new(ledger.clone(), 30, 60);
        let started = json!({
            "type": "longrun", "subtype": "gpu", "proj_id": proj.id, "job_id": job.id,
            "status": "started", "instances": 2, "instance_type": "a100", "timestamp": now.timestamp(),
        })
        .to_string();
        consumer.consume(&started, now).await.unwrap();

        let finished = json!({
            "type": "longrun", "subtype": "gpu", "proj_id": proj.id, "job_id": job.id,
            "status": "finished", "timestamp": now.timestamp(),
        })
        .to_string();
        consumer.consume(&finished, now).await.unwrap();

        let updated = ledger.get_job(job.id).await.unwrap();
        assert_eq!(updated.started_at, Some(now));
        assert_eq!(updated.finished_at, Some(now));
    }

    #[tokio::test]
    async fn consume_rejects_event_for_the_wrong_project() {
        let now = Utc::now();
        let ledger = store::memory();
        ledger.create_system_account("system", now).await.unwrap();
        let vlab = ledger.create_vlab("vlab-1", None, now).await.unwrap();
        let (proj, _rsv) = ledger.create_proj(vlab.id, "proj-1", now).await.unwrap();
        let (other_proj, _rsv) = ledger.create_proj(vlab.id, "proj-2", now).await.unwrap();
        let job = ledger.insert_job(job_under(vlab.id, proj.id, now)).await.unwrap();

        let consumer = LongrunConsumer::new(ledger.clone(), 30, 60);
        let body = json!({
            "type": "longrun", "subtype": "gpu", "proj_id": other_proj.id, "job_id": job.id,
            "status": "started", "timestamp": now.timestamp(),
        })
        .to_string();

        let error = consumer.consume(&body, now).await.unwrap_err();
        assert!(matches!(error, EventError::Permanent(_)));
    }
}
