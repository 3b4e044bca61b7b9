use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::clock::Clock;
use crate::config::ChargerTuning;
use crate::discount::DiscountStore;
use crate::price::PriceStore;
use crate::reservation::map_ledger_error;
use crate::store::{Job, JobUpdate, LedgerStore, TransactionRequest};
use crate::task_registry::PeriodicTask;
use crate::types::TransactionType;
use crate::usage::{calculate_cost, storage_usage_value};

use super::usage_i64;

/// Settles storage jobs, a contiguous sequence of fixed-size intervals with
/// no reservation of their own (§4.6). Billed PROJ -> SYS directly.
pub struct StorageCharger {
    ledger: Arc<dyn LedgerStore>,
    prices: Arc<dyn PriceStore>,
    discounts: Arc<dyn DiscountStore>,
    clock: Arc<dyn Clock>,
    tuning: ChargerTuning,
}

impl StorageCharger {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        prices: Arc<dyn PriceStore>,
        discounts: Arc<dyn DiscountStore>,
        clock: Arc<dyn Clock>,
        tuning: ChargerTuning,
    ) -> Self {
        Self { ledger, prices, discounts, clock, tuning }
    }

    async fn charge_interval(&self, job: &Job, end: DateTime<Utc>, terminal: bool, new_last_charged_at: DateTime<Utc>) -> Result<(), anyhow::Error> {
        let start = job.last_charged_at.or(job.started_at).ok_or_else(|| {
            anyhow::anyhow!("storage job {} has neither last_charged_at nor started_at", job.id)
        })?;
        let seconds = (end - start).num_seconds().max(0);
        if !terminal && seconds < self.tuning.min_charging_interval_seconds {
            return Ok(());
        }

        let size = usage_i64(job, "size")?;
        let usage_value = storage_usage_value(size, seconds);

        let price_at = job.started_at.unwrap_or(end);
        let price = self.prices.get_price(job.vlab_id, job.service_type, &job.service_subtype, price_at).await?;
        let discount = self.discounts.get_current_discount(job.vlab_id, end).await?;
        let total = calculate_cost(&price, discount.as_ref().map(|d| d.discount), usage_value, false);

        if !terminal && total.abs() < self.tuning.min_charging_amount {
            return Ok(());
        }

        let family = self.ledger.get_account_family_by_proj(job.proj_id).await.map_err(map_ledger_error)?;
        let mut postings = Vec::new();
        if total > Decimal::ZERO {
            postings.push(
                TransactionRequest::new(total, family.proj.id, family.sys.id, end, TransactionType::ChargeStorage)
                    .with_job(job.id)
                    .with_price(Some(price.id))
                    .with_discount(discount.as_ref().map(|d| d.id))
                    .with_reason("storage_interval:charge_project"),
            );
        } else if total < Decimal::ZERO {
            postings.push(
                TransactionRequest::new(total.abs(), family.sys.id, family.proj.id, end, TransactionType::Refund)
                    .with_job(job.id)
                    .with_price(Some(price.id))
                    .with_discount(discount.as_ref().map(|d| d.id))
                    .with_reason("storage_interval:refund"),
            );
        }

        self.ledger
            .charge_job(job.id, postings, JobUpdate { last_charged_at: Some(new_last_charged_at), ..Default::default() })
            .await
            .map_err(map_ledger_error)?;
        Ok(())
    }
}

#[async_trait]
impl PeriodicTask for StorageCharger {
    fn name(&self) -> &str {
        "charge_storage"
    }

    async fn run_once_logic(&self) -> Result<(), anyhow::Error> {
        let now = self.clock.now();
        let min_datetime = Some(now - chrono::Duration::seconds(self.tuning.rolling_window_seconds));

        let finished = self.ledger.list_storage_finished_unsettled(min_datetime).await.map_err(map_ledger_error)?;
        let mut failures = 0;
        for job in &finished {
            let end = job.finished_at.expect("finished_unsettled jobs always have finished_at");
            if let Err(error) = self.charge_interval(job, end, true, end).await {
                failures += 1;
                warn!(job_id = %job.id, reason = %error, "storage settlement failed for finished job, continuing batch");
            }
        }

        let running = self.ledger.list_storage_running().await.map_err(map_ledger_error)?;
        for job in &running {
            if let Err(error) = self.charge_interval(job, now, false, now).await {
                failures += 1;
                warn!(job_id = %job.id, reason = %error, "storage settlement failed for running job, continuing batch");
            }
        }

        if failures > 0 {
            warn!(failures, total = finished.len() + running.len(), "storage charging batch finished with failures");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::FixedClock;
    use crate::discount;
    use crate::price::{self, NewPrice};
    use crate::store;
    use crate::types::ServiceType;
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    fn tuning() -> ChargerTuning {
        ChargerTuning {
            loop_sleep_seconds: 5,
            error_sleep_seconds: 30,
            min_charging_interval_seconds: 0,
            min_charging_amount: Decimal::ZERO,
            rolling_window_seconds: 7 * 24 * 3600,
        }
    }

    #[tokio::test]
    async fn scenario_6_bills_closed_interval_by_byte_seconds() {
        let t0 = Utc::now() - Duration::minutes(5);
        let t1 = t0 + Duration::seconds(60);
        let ledger = store::memory();
        let prices = price::memory();
        let discounts = discount::memory();

        ledger.create_system_account("system", t0).await.unwrap();
        let vlab = ledger.create_vlab("vlab-1", None, t0).await.unwrap();
        let (proj, _rsv) = ledger.create_proj(vlab.id, "proj-1", t0).await.unwrap();
        ledger
            .post_transaction(TransactionRequest::new(
                Decimal::new(1000, 0),
                vlab.id,
                proj.id,
                t0,
                crate::types::TransactionType::AssignBudget,
            ))
            .await
            .unwrap();
        prices
            .create_price(NewPrice {
                service_type: ServiceType::Storage,
                service_subtype: "standard".to_string(),
                valid_from: t0 - Duration::days(1),
                valid_to: None,
                fixed_cost: Decimal::new(999, 0),
                multiplier: Decimal::new(1, 9),
                vlab_id: None,
            })
            .await
            .unwrap();

        let one_gib: i64 = 1 << 30;
        let job = Job {
            id: Uuid::new_v4(),
            vlab_id: vlab.id,
            proj_id: proj.id,
            user_id: None,
            group_id: None,
            service_type: ServiceType::Storage,
            service_subtype: "standard".to_string(),
            reserved_at: None,
            started_at: Some(t0),
            last_alive_at: Some(t0),
            last_charged_at: None,
            finished_at: Some(t1),
            cancelled_at: None,
            reservation_params: json!({}),
            usage_params: json!({ "size": one_gib }),
        };
        let job = ledger.insert_job(job).await.unwrap();

        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(t1));
        let charger = StorageCharger::new(ledger.clone(), prices, discounts, clock, tuning());
        charger.run_once_logic().await.unwrap();

        let charged = ledger.get_job(job.id).await.unwrap();
        assert_eq!(charged.last_charged_at, Some(t1));
        // fixed_cost is excluded for storage: only 60s * 1 GiB * 1e-9/byte-second is billed
        let family = ledger.get_account_family_by_proj(proj.id).await.unwrap();
        let expected_charge = Decimal::new(1, 9) * Decimal::from(60i64 * one_gib);
        assert_eq!(family.proj.balance, Decimal::new(1000, 0) - expected_charge);
    }
}
