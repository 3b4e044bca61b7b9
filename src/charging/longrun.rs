use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::warn;

use crate::clock::Clock;
use crate::config::ChargerTuning;
use crate::discount::DiscountStore;
use crate::price::{Price, PriceStore};
use crate::reservation::map_ledger_error;
use crate::store::{Job, JobUpdate, LedgerStore, TransactionRequest};
use crate::task_registry::PeriodicTask;
use crate::types::{ServiceType, TransactionType};
use crate::usage::{calculate_cost, longrun_usage_value};

use super::{split_charge, usage_i64, usage_instance_type};

/// Settles longrun jobs through the seven-state lifecycle table of §4.5.
pub struct LongrunCharger {
    ledger: Arc<dyn LedgerStore>,
    prices: Arc<dyn PriceStore>,
    discounts: Arc<dyn DiscountStore>,
    clock: Arc<dyn Clock>,
    tuning: ChargerTuning,
    expiration_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    UnfinishedUncharged,
    ExpiredUncharged,
    UnfinishedCharged,
    ExpiredCharged,
    FinishedUncharged,
    FinishedCharged,
    FinishedOvercharged,
}

impl State {
    /// Non-terminal states are the only ones subject to the throttling
    /// thresholds; a job that is expiring, finishing, or overcharged must
    /// always settle this tick.
    fn is_terminal(self) -> bool {
        !matches!(self, State::UnfinishedUncharged | State::UnfinishedCharged)
    }
}

fn classify(job: &Job, now: DateTime<Utc>, expiration_interval: Duration) -> State {
    let stale = job.last_alive_at.is_some_and(|last_alive| now - last_alive > expiration_interval);
    match (job.last_charged_at, job.finished_at) {
        (None, None) => if stale { State::ExpiredUncharged } else { State::UnfinishedUncharged },
        (Some(_), None) => if stale { State::ExpiredCharged } else { State::UnfinishedCharged },
        (None, Some(_)) => State::FinishedUncharged,
        (Some(last_charged_at), Some(finished_at)) if last_charged_at < finished_at => State::FinishedCharged,
        (Some(_), Some(_)) => State::FinishedOvercharged,
    }
}

struct Window {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    include_fixed_cost: bool,
    release_leftover: bool,
    mark_expired: bool,
    new_last_charged_at: DateTime<Utc>,
}

fn window_for(state: State, job: &Job, now: DateTime<Utc>) -> Window {
    let started_at = job.started_at.expect("longrun candidate job always has started_at");
    match state {
        State::UnfinishedUncharged => Window {
            start: started_at,
            end: now,
            include_fixed_cost: true,
            release_leftover: false,
            mark_expired: false,
            new_last_charged_at: now,
        },
        State::ExpiredUncharged => Window {
            start: started_at,
            end: now,
            include_fixed_cost: true,
            release_leftover: true,
            mark_expired: true,
            new_last_charged_at: now,
        },
        State::UnfinishedCharged => Window {
            start: job.last_charged_at.unwrap(),
            end: now,
            include_fixed_cost: false,
            release_leftover: false,
            mark_expired: false,
            new_last_charged_at: now,
        },
        State::ExpiredCharged => Window {
            start: job.last_charged_at.unwrap(),
            end: now,
            include_fixed_cost: false,
            release_leftover: true,
            mark_expired: true,
            new_last_charged_at: now,
        },
        State::FinishedUncharged => Window {
            start: started_at,
            end: job.finished_at.unwrap(),
            include_fixed_cost: true,
            release_leftover: true,
            mark_expired: false,
            new_last_charged_at: job.finished_at.unwrap(),
        },
        State::FinishedCharged => Window {
            start: job.last_charged_at.unwrap(),
            end: job.finished_at.unwrap(),
            include_fixed_cost: false,
            release_leftover: true,
            mark_expired: false,
            new_last_charged_at: job.finished_at.unwrap(),
        },
        State::FinishedOvercharged => Window {
            // reversed on purpose: the interval [finished_at, last_charged_at)
            // is exactly the span that was billed but should not have been.
            start: job.finished_at.unwrap(),
            end: job.last_charged_at.unwrap(),
            include_fixed_cost: false,
            release_leftover: true,
            mark_expired: false,
            new_last_charged_at: job.finished_at.unwrap(),
        },
    }
}

impl LongrunCharger {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        prices: Arc<dyn PriceStore>,
        discounts: Arc<dyn DiscountStore>,
        clock: Arc<dyn Clock>,
        tuning: ChargerTuning,
        expiration_interval_seconds: i64,
    ) -> Self {
        Self {
            ledger,
            prices,
            discounts,
            clock,
            tuning,
            expiration_interval: Duration::seconds(expiration_interval_seconds),
        }
    }

    async fn resolve_price(&self, job: &Job, now: DateTime<Utc>) -> Result<Price, anyhow::Error> {
        let at = job.reserved_at.or(job.started_at).unwrap_or(now);
        Ok(self.prices.get_price(job.vlab_id, job.service_type, &job.service_subtype, at).await?)
    }

    async fn charge_one(&self, job: &Job, now: DateTime<Utc>) -> Result<(), anyhow::Error> {
        let state = classify(job, now, self.expiration_interval);
        let window = window_for(state, job, now);

        let seconds = (window.end - window.start).num_seconds().max(0);
        if state.is_terminal() {
            // always settle, even for a zero-width or tiny interval
        } else if seconds < self.tuning.min_charging_interval_seconds {
            return Ok(());
        }

        let instances = usage_i64(job, "instances")?;
        let instance_type = usage_instance_type(job);
        let usage_value = longrun_usage_value(instances, instance_type.as_deref(), seconds);

        let price = self.resolve_price(job, now).await?;
        let discount = self.discounts.get_current_discount(job.vlab_id, now).await?;
        let total = calculate_cost(&price, discount.as_ref().map(|d| d.discount), usage_value, window.include_fixed_cost);

        if !state.is_terminal() && total.abs() < self.tuning.min_charging_amount {
            return Ok(());
        }

        let family = self.ledger.get_account_family_by_proj(job.proj_id).await.map_err(map_ledger_error)?;
        let remaining = self.ledger.get_remaining_reservation_for_job(job.id, family.rsv.id).await.map_err(map_ledger_error)?;

        let mut postings = Vec::new();
        if state == State::FinishedOvercharged {
            if total > Decimal::ZERO {
                postings.push(
                    TransactionRequest::new(total, family.sys.id, family.proj.id, now, TransactionType::Refund)
                        .with_job(job.id)
                        .with_price(Some(price.id))
                        .with_discount(discount.as_ref().map(|d| d.id))
                        .with_reason("finished_overcharged:refund"),
                );
            }
        } else if total > Decimal::ZERO {
            let split = split_charge(total, remaining);
            if split.from_rsv > Decimal::ZERO {
                postings.push(
                    TransactionRequest::new(split.from_rsv, family.rsv.id, family.sys.id, now, TransactionType::ChargeLongrun)
                        .with_job(job.id)
                        .with_price(Some(price.id))
                        .with_discount(discount.as_ref().map(|d| d.id))
                        .with_reason(format!("{}:charge_reservation", state_reason(state))),
                );
            }
            if split.from_proj > Decimal::ZERO {
                postings.push(
                    TransactionRequest::new(split.from_proj, family.proj.id, family.sys.id, now, TransactionType::ChargeLongrun)
                        .with_job(job.id)
                        .with_price(Some(price.id))
                        .with_discount(discount.as_ref().map(|d| d.id))
                        .with_reason(format!("{}:charge_project", state_reason(state))),
                );
            }
        } else if total < Decimal::ZERO {
            postings.push(
                TransactionRequest::new(total.abs(), family.sys.id, family.proj.id, now, TransactionType::Refund)
                    .with_job(job.id)
                    .with_price(Some(price.id))
                    .with_discount(discount.as_ref().map(|d| d.id))
                    .with_reason(format!("{}:refund", state_reason(state))),
            );
        }

        if window.release_leftover {
            let leftover = if state == State::FinishedOvercharged { remaining } else { remaining - total.max(Decimal::ZERO).min(remaining) };
            if leftover > Decimal::ZERO {
                postings.push(
                    TransactionRequest::new(leftover, family.rsv.id, family.proj.id, now, TransactionType::Release)
                        .with_job(job.id)
                        .with_reason(format!("{}:release_reservation", state_reason(state))),
                );
            }
        }

        let update = JobUpdate {
            last_charged_at: Some(window.new_last_charged_at),
            finished_at: if window.mark_expired { Some(now) } else { None },
            cancelled_at: if window.mark_expired { Some(now) } else { None },
            usage_params: Some(json!({
                "instances": instances,
                "instance_type": instance_type,
            })),
            ..Default::default()
        };
        self.ledger.charge_job(job.id, postings, update).await.map_err(map_ledger_error)?;
        Ok(())
    }
}

fn state_reason(state: State) -> &'static str {
    match state {
        State::UnfinishedUncharged => "unfinished_uncharged",
        State::ExpiredUncharged => "expired_uncharged",
        State::UnfinishedCharged => "unfinished_charged",
        State::ExpiredCharged => "expired_charged",
        State::FinishedUncharged => "finished_uncharged",
        State::FinishedCharged => "finished_charged",
        State::FinishedOvercharged => "finished_overcharged",
    }
}

#[async_trait]
impl PeriodicTask for LongrunCharger {
    fn name(&self) -> &str {
        "charge_longrun"
    }

    async fn run_once_logic(&self) -> Result<(), anyhow::Error> {
        let now = self.clock.now();
        let min_datetime = Some(now - Duration::seconds(self.tuning.rolling_window_seconds));
        let jobs = self.ledger.list_longrun_to_be_charged(min_datetime).await.map_err(map_ledger_error)?;

        let mut failures = 0;
        for job in &jobs {
            if let Err(error) = self.charge_one(job, now).await {
                failures += 1;
                warn!(job_id = %job.id, reason = %error, "longrun charge failed for job, continuing batch");
            }
        }
        if failures > 0 {
            warn!(failures, total = jobs.len(), "longrun charging batch finished with failures");
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
    async fn scenario_5_expired_longrun_is_charged_and_released() {
        let now = Utc::now();
        let ledger = store::memory();
        let prices = price::memory();
        let discounts = discount::memory();

        ledger.create_system_account("system", now).await.unwrap();
        let vlab = ledger.create_vlab("vlab-1", None, now).await.unwrap();
        let (proj, _rsv) = ledger.create_proj(vlab.id, "proj-1", now).await.unwrap();
        ledger
            .post_transaction(TransactionRequest::new(Decimal::new(1000, 0), vlab.id, proj.id, now, TT::AssignBudget))
            .await
            .unwrap();
        prices
            .create_price(NewPrice {
                service_type: ServiceType::Longrun,
                service_subtype: "gpu".to_string(),
                valid_from: now - Duration::days(1),
                valid_to: None,
                fixed_cost: Decimal::new(5, 0),
                multiplier: Decimal::new(1, 3),
                vlab_id: None,
            })
            .await
            .unwrap();

        let started_at = now - Duration::hours(1);
        let job = Job {
            id: Uuid::new_v4(),
            vlab_id: vlab.id,
            proj_id: proj.id,
            user_id: None,
            group_id: None,
            service_type: ServiceType::Longrun,
            service_subtype: "gpu".to_string(),
            reserved_at: Some(started_at),
            started_at: None,
            last_alive_at: None,
            last_charged_at: None,
            finished_at: None,
            cancelled_at: None,
            reservation_params: json!({ "instances": 1 }),
            usage_params: json!({}),
        };
        let job = ledger.reserve(job, Decimal::new(1000, 0)).await.unwrap();
        let job = ledger
            .apply_job_update(
                job.id,
                JobUpdate {
                    started_at: Some(started_at),
                    last_alive_at: Some(started_at),
                    usage_params: Some(json!({ "instances": 1 })),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(now));
        let charger = LongrunCharger::new(ledger.clone(), prices, discounts, clock, tuning(), 1800);
        charger.run_once_logic().await.unwrap();

        let charged = ledger.get_job(job.id).await.unwrap();
        assert!(charged.finished_at.is_some());
        assert_eq!(charged.cancelled_at, charged.finished_at);
        assert_eq!(charged.last_charged_at, charged.finished_at);

        let family = ledger.get_account_family_by_proj(job.proj_id).await.unwrap();
        assert_eq!(family.rsv.balance, Decimal::ZERO);
        // fixed 5 + 3600s * 0.001/s = 5 + 3.6 = 8.6 charged from the 1000 reservation
        assert_eq!(family.proj.balance, Decimal::new(99140, 2));
    }
}
