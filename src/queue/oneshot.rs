use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::error::EventError;
use crate::store::{JobUpdate, LedgerStore};
use crate::types::{JobId, ServiceType};

use super::consumer::{map_ledger_event_error, QueueConsumer};
use super::wire::{validate_timestamp, OneshotEvent};

pub struct OneshotConsumer {
    ledger: Arc<dyn LedgerStore>,
    max_past_days: i64,
    max_future_seconds: i64,
}

impl OneshotConsumer {
    pub fn new(ledger: Arc<dyn LedgerStore>, max_past_days: i64, max_future_seconds: i64) -> Self {
        Self { ledger, max_past_days, max_future_seconds }
    }
}

#[async_trait]
impl QueueConsumer for OneshotConsumer {
    fn name(&self) -> &'static str {
        "oneshot"
    }

    async fn consume(&self, body: &str, now: DateTime<Utc>) -> Result<Option<JobId>, EventError> {
        let event: OneshotEvent =
            serde_json::from_str(body).map_err(|error| EventError::Permanent(format!("invalid oneshot event: {error}")))?;
        let at = validate_timestamp(event.timestamp, now, self.max_past_days, self.max_future_seconds)?;

        // Locks PROJ+RSV and the job row for the whole check-then-update so a
        // redelivered or racing event can never act on a stale match (§4.7).
        let job = self
            .ledger
            .apply_matched_job_update(
                event.job_id,
                event.proj_id,
                ServiceType::Oneshot,
                &event.subtype,
                JobUpdate {
                    started_at: Some(at),
                    last_alive_at: Some(at),
                    finished_at: Some(at),
                    usage_params: Some(json!({ "count": event.count })),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_ledger_event_error)?;

        Ok(Some(job.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{self, Job, TransactionRequest};
    use crate::types::TransactionType;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn wire_body(proj_id: uuid::Uuid, job_id: uuid::Uuid, at: DateTime<Utc>) -> String {
        json!({
            "type": "oneshot",
            "subtype": "cpu",
            "proj_id": proj_id,
            "job_id": job_id,
            "count": 10,
            "timestamp": at.timestamp(),
        })
        .to_string()
    }

    #[tokio::test]
    async fn consume_settles_a_matching_job() {
        let now = Utc::now();
        let ledger = store::memory();
        ledger.create_system_account("system", now).await.unwrap();
        let vlab = ledger.create_vlab("vlab-1", None, now).await.unwrap();
        let (proj, _rsv) = ledger.create_proj(vlab.id, "proj-1", now).await.unwrap();
        ledger
            .post_transaction(TransactionRequest::new(Decimal::new(100, 0), vlab.id, proj.id, now, TransactionType::AssignBudget))
            .await
            .unwrap();
        let job = Job {
            id: Uuid::new_v4(),
            vlab_id: vlab.id,
            proj_id: proj.id,
            user_id: None,
            group_id: None,
            service_type: ServiceType::Oneshot,
            service_subtype: "cpu".to_string(),
            reserved_at: Some(now),
            started_at: None,
            last_alive_at: None,
            last_charged_at: None,
            finished_at: None,
            cancelled_at: None,
            reservation_params: json!({}),
            usage_params: json!({}),
        };
        let job = ledger.reserve(job, Decimal::new(100, 0)).await.unwrap();

        let consumer = OneshotConsumer::new(ledger.clone(), 30, 60);
        let returned = consumer.consume(&wire_body(proj.id, job.id, now), now).await.unwrap();

        assert_eq!(returned, Some(job.id));
        let updated = ledger.get_job(job.id).await.unwrap();
        assert_eq!(updated.finished_at, Some(now));
        assert_eq!(updated.usage_params, json!({ "count": 10 }));
    }

    #[tokio::test]
    async fn consume_rejects_event_when_job_vlab_disagrees_with_account_family() {
        let now = Utc::now();
        let ledger = store::memory();
        ledger.create_system_account("system", now).await.unwrap();
        let vlab = ledger.create_vlab("vlab-1", None, now).await.unwrap();
        let other_vlab = ledger.create_vlab("vlab-2", None, now).await.unwrap();
        let (proj, _rsv) = ledger.create_proj(vlab.id, "proj-1", now).await.unwrap();

        // Job row carries a stale vlab_id that no longer matches proj's real
        // parent vlab - the mismatch the lookup-by-proj family must catch.
        let job = Job {
            id: Uuid::new_v4(),
            vlab_id: other_vlab.id,
            proj_id: proj.id,
            user_id: None,
            group_id: None,
            service_type: ServiceType::Oneshot,
            service_subtype: "cpu".to_string(),
            reserved_at: Some(now),
            started_at: None,
            last_alive_at: None,
            last_charged_at: None,
            finished_at: None,
            cancelled_at: None,
            reservation_params: json!({}),
            usage_params: json!({}),
        };
        let job = ledger.insert_job(job).await.unwrap();

        let consumer = OneshotConsumer::new(ledger.clone(), 30, 60);
        let error = consumer.consume(&wire_body(proj.id, job.id, now), now).await.unwrap_err();

        assert!(matches!(error, EventError::Permanent(_)));
        let unchanged = ledger.get_job(job.id).await.unwrap();
        assert!(unchanged.finished_at.is_none());
    }
}
