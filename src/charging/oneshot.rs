use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::clock::Clock;
use crate::config::ChargerTuning;
use crate::discount::DiscountStore;
use crate::price::PriceStore;
use crate::reservation::map_ledger_error;
use crate::store::{Job, JobUpdate, LedgerStore, TransactionRequest};
use crate::task_registry::PeriodicTask;
use crate::types::{ServiceType, TransactionType};
use crate::usage::{calculate_cost, oneshot_usage_value};

use super::{split_charge, usage_i64};

/// Settles finished oneshot jobs against their reservation (§4.4).
pub struct OneshotCharger {
    ledger: Arc<dyn LedgerStore>,
    prices: Arc<dyn PriceStore>,
    discounts: Arc<dyn DiscountStore>,
    clock: Arc<dyn Clock>,
    tuning: ChargerTuning,
}

impl OneshotCharger {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        prices: Arc<dyn PriceStore>,
        discounts: Arc<dyn DiscountStore>,
        clock: Arc<dyn Clock>,
        tuning: ChargerTuning,
    ) -> Self {
        Self { ledger, prices, discounts, clock, tuning }
    }

    async fn charge_one(&self, job: &Job, now: DateTime<Utc>) -> Result<(), anyhow::Error> {
        let family = self.ledger.get_account_family_by_proj(job.proj_id).await.map_err(map_ledger_error)?;
        let price_at = job.reserved_at.or(job.started_at).unwrap_or(now);
        let price = self
            .prices
            .get_price(job.vlab_id, job.service_type, &job.service_subtype, price_at)
            .await?;
        let discount = self.discounts.get_current_discount(job.vlab_id, now).await?;

        let count = usage_i64(job, "count")?;
        let usage_value = oneshot_usage_value(count);
        let total = calculate_cost(&price, discount.as_ref().map(|d| d.discount), usage_value, true);
        if total < Decimal::ZERO {
            return Err(anyhow::anyhow!("oneshot charge for job {} computed a negative total {total}", job.id));
        }

        let remaining = self.ledger.get_remaining_reservation_for_job(job.id, family.rsv.id).await.map_err(map_ledger_error)?;
        let split = split_charge(total, remaining);

        let mut postings = Vec::new();
        if split.from_rsv > Decimal::ZERO {
            postings.push(
                TransactionRequest::new(split.from_rsv, family.rsv.id, family.sys.id, now, TransactionType::ChargeOneshot)
                    .with_job(job.id)
                    .with_price(Some(price.id))
                    .with_discount(discount.as_ref().map(|d| d.id))
                    .with_reason("finished_uncharged:charge_reservation"),
            );
        }
        if split.from_proj > Decimal::ZERO {
            postings.push(
                TransactionRequest::new(split.from_proj, family.proj.id, family.sys.id, now, TransactionType::ChargeOneshot)
                    .with_job(job.id)
                    .with_price(Some(price.id))
                    .with_discount(discount.as_ref().map(|d| d.id))
                    .with_reason("finished_uncharged:charge_project"),
            );
        }
        if split.leftover > Decimal::ZERO {
            postings.push(
                TransactionRequest::new(split.leftover, family.rsv.id, family.proj.id, now, TransactionType::Release)
                    .with_job(job.id)
                    .with_reason("finished_uncharged:release_reservation"),
            );
        }

        self.ledger
            .charge_job(job.id, postings, JobUpdate { last_charged_at: Some(now), ..Default::default() })
            .await
            .map_err(map_ledger_error)?;
        Ok(())
    }
}

#[async_trait]
impl PeriodicTask for OneshotCharger {
    fn name(&self) -> &str {
        "charge_oneshot"
    }

    async fn run_once_logic(&self) -> Result<(), anyhow::Error> {
        let now = self.clock.now();
        let min_datetime = Some(now - Duration::seconds(self.tuning.rolling_window_seconds));
        let jobs = self.ledger.list_oneshot_to_be_charged(min_datetime).await.map_err(map_ledger_error)?;

        let mut failures = 0;
        for job in &jobs {
            if let Err(error) = self.charge_one(job, now).await {
                failures += 1;
                warn!(job_id = %job.id, reason = %error, "oneshot charge failed for job, continuing batch");
            }
        }
        if failures > 0 {
            warn!(failures, total = jobs.len(), "oneshot charging batch finished with failures");
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
    use crate::types::TransactionType as TT;
    use serde_json::json;
    use uuid::Uuid;

    async fn seed(now: DateTime<Utc>) -> (Arc<dyn LedgerStore>, Arc<dyn PriceStore>, Arc<dyn DiscountStore>, Job) {
        let ledger = store::memory();
        let prices = price::memory();
        let discounts = discount::memory();

        ledger.create_system_account("system", now).await.unwrap();
        let vlab = ledger.create_vlab("vlab-1", None, now).await.unwrap();
        let (proj, _rsv) = ledger.create_proj(vlab.id, "proj-1", now).await.unwrap();
        ledger
            .post_transaction(TransactionRequest::new(Decimal::new(400, 0), vlab.id, proj.id, now, TT::AssignBudget))
            .await
            .unwrap();
        prices
            .create_price(NewPrice {
                service_type: ServiceType::Oneshot,
                service_subtype: "cpu".to_string(),
                valid_from: now - Duration::days(1),
                valid_to: None,
                fixed_cost: Decimal::ZERO,
                multiplier: Decimal::new(1, 5),
                vlab_id: None,
            })
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
            reservation_params: json!({ "count": 1_000_000 }),
            usage_params: json!({}),
        };
        let job = ledger.reserve(job, Decimal::new(1000000, 5)).await.unwrap();
        let job = ledger.apply_job_update(
            job.id,
            JobUpdate {
                started_at: Some(now),
                last_alive_at: Some(now),
                finished_at: Some(now),
                usage_params: Some(json!({ "count": 1500 })),
                ..Default::default()
            },
        ).await.unwrap();

        (ledger, prices, discounts, job)
    }

    #[tokio::test]
    async fn scenario_3_settles_reservation_and_releases_remainder() {
        let now = Utc::now();
        let (ledger, prices, discounts, job) = seed(now).await;
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(now));
        let charger = OneshotCharger::new(ledger.clone(), prices, discounts, clock, ChargerTuning {
            loop_sleep_seconds: 5,
            error_sleep_seconds: 30,
            min_charging_interval_seconds: 0,
            min_charging_amount: Decimal::ZERO,
            rolling_window_seconds: 7 * 24 * 3600,
        });

        charger.run_once_logic().await.unwrap();

        let charged = ledger.get_job(job.id).await.unwrap();
        assert_eq!(charged.last_charged_at, Some(now));

        let family = ledger.get_account_family_by_proj(job.proj_id).await.unwrap();
        assert_eq!(family.rsv.balance, Decimal::ZERO);
        // 400 assigned, 10.00000 reserved, 0.01500 charged from RSV, 9.98500 released back
        assert_eq!(family.proj.balance, Decimal::new(39998500, 5));
    }
}
