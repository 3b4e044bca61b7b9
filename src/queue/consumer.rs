use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use aws_sdk_sqs::Client as SqsClient;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::EventError;
use crate::event_log::{EventStatus, EventStore, EventUpsert};
use crate::store::LedgerStoreError;
use crate::types::JobId;

/// A single message-type handler, given the raw JSON body. Returns the job
/// id touched by this message (if any) for the Event row's job_id column.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn consume(&self, body: &str, now: DateTime<Utc>) -> Result<Option<JobId>, EventError>;
}

/// A mismatch is permanent (redelivery will never make a stale or
/// wrong-identity event match); every other ledger error is transient.
pub fn map_ledger_event_error(error: LedgerStoreError) -> EventError {
    match error {
        LedgerStoreError::Mismatch(message) => EventError::Permanent(message),
        other => EventError::Retriable(other.to_string()),
    }
}

/// Shared resources for one queue's long-poll loop (§4.7, §9 "queue client
/// lifecycle"): one pooled SQS client and one resolved queue URL per
/// process, created at startup and reused across every message.
pub struct QueueRuntime {
    pub client: SqsClient,
    pub queue_name: String,
    pub max_messages: i32,
    pub visibility_timeout_seconds: i32,
    pub wait_time_seconds: i32,
    pub events: Arc<dyn EventStore>,
    pub clock: Arc<dyn Clock>,
}

impl QueueRuntime {
    async fn queue_url(&self) -> Result<String, anyhow::Error> {
        let response = self.client.get_queue_url().queue_name(&self.queue_name).send().await?;
        response.queue_url().map(str::to_string).ok_or_else(|| anyhow::anyhow!("SQS did not return a queue url for {}", self.queue_name))
    }
}

/// Long-poll, consume, UPSERT-the-Event-row, delete-on-success loop (§4.7,
/// §4.8's shared run-loop idiom applied to queue consumption instead of a
/// periodic charger body).
pub async fn run_forever(runtime: Arc<QueueRuntime>, consumer: Arc<dyn QueueConsumer>, initial_delay: StdDuration, error_sleep: StdDuration) {
    info!(consumer = consumer.name(), "starting queue consumer");
    tokio::time::sleep(initial_delay).await;

    let queue_url = match runtime.queue_url().await {
        Ok(url) => url,
        Err(error) => {
            error!(consumer = consumer.name(), reason = %error, "failed to resolve queue url, consumer will not start");
            return;
        }
    };

    loop {
        let received = runtime
            .client
            .receive_message()
            .queue_url(&queue_url)
            .max_number_of_messages(runtime.max_messages)
            .visibility_timeout(runtime.visibility_timeout_seconds)
            .wait_time_seconds(runtime.wait_time_seconds)
            .send()
            .await;

        let messages = match received {
            Ok(response) => response.messages.unwrap_or_default(),
            Err(error) => {
                warn!(consumer = consumer.name(), reason = %error, "receive_message failed");
                tokio::time::sleep(error_sleep).await;
                continue;
            }
        };

        for message in messages {
            let Some(body) = message.body() else { continue };
            let message_id = message.message_id().unwrap_or_default().to_string();
            let now = runtime.clock.now();

            let outcome = consumer.consume(body, now).await;
            let (status, job_id, error_text) = match &outcome {
                Ok(job_id) => (EventStatus::Completed, *job_id, None),
                Err(error) => (EventStatus::Failed, None, Some(error.message())),
            };

            if let Err(error) = runtime
                .events
                .upsert(EventUpsert {
                    message_id: message_id.clone(),
                    queue_name: runtime.queue_name.clone(),
                    status,
                    attributes: serde_json::json!({}),
                    body: serde_json::from_str(body).unwrap_or(serde_json::Value::Null),
                    error: error_text,
                    job_id,
                })
                .await
            {
                error!(consumer = consumer.name(), message_id, reason = %error, "failed to record event");
            }

            if outcome.is_ok() {
                if let Some(receipt_handle) = message.receipt_handle() {
                    if let Err(error) = runtime.client.delete_message().queue_url(&queue_url).receipt_handle(receipt_handle).send().await {
                        warn!(consumer = consumer.name(), message_id, reason = %error, "failed to delete processed message");
                    }
                }
            } else {
                warn!(consumer = consumer.name(), message_id, "leaving message in queue for redelivery");
            }
        }
    }
}
