use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AppError;
use crate::price::PriceStore;
use crate::store::{Job, LedgerStore, LedgerStoreError};
use crate::types::{AccountId, JobId, ServiceSubtype, ServiceType};
use crate::usage::{longrun_usage_value, oneshot_usage_value};

pub struct ReservationService {
    ledger: Arc<dyn LedgerStore>,
    prices: Arc<dyn PriceStore>,
    clock: Arc<dyn Clock>,
}

pub struct OneshotReservationRequest {
    pub proj_id: AccountId,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub service_subtype: ServiceSubtype,
    pub count: i64,
}

pub struct LongrunReservationRequest {
    pub proj_id: AccountId,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub service_subtype: ServiceSubtype,
    pub instances: i64,
    pub instance_type: Option<String>,
    pub duration_seconds: i64,
}

pub struct ReservationOutcome {
    pub job_id: JobId,
    pub requested_amount: Decimal,
}

impl ReservationService {
    pub fn new(ledger: Arc<dyn LedgerStore>, prices: Arc<dyn PriceStore>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, prices, clock }
    }

    pub async fn reserve_oneshot(&self, request: OneshotReservationRequest) -> Result<ReservationOutcome, AppError> {
        let usage_value = oneshot_usage_value(request.count);
        let reservation_params = json!({ "count": request.count });
        self.reserve(
            request.proj_id,
            request.user_id,
            request.group_id,
            ServiceType::Oneshot,
            request.service_subtype,
            usage_value,
            reservation_params,
        )
        .await
    }

    pub async fn reserve_longrun(&self, request: LongrunReservationRequest) -> Result<ReservationOutcome, AppError> {
        let usage_value = longrun_usage_value(
            request.instances,
            request.instance_type.as_deref(),
            request.duration_seconds,
        );
        let reservation_params = json!({
            "instances": request.instances,
            "instance_type": request.instance_type,
            "duration": request.duration_seconds,
        });
        self.reserve(
            request.proj_id,
            request.user_id,
            request.group_id,
            ServiceType::Longrun,
            request.service_subtype,
            usage_value,
            reservation_params,
        )
        .await
    }

    async fn reserve(
        &self,
        proj_id: AccountId,
        user_id: Option<String>,
        group_id: Option<String>,
        service_type: ServiceType,
        service_subtype: ServiceSubtype,
        usage_value: i64,
        reservation_params: serde_json::Value,
    ) -> Result<ReservationOutcome, AppError> {
        let now = self.clock.now();
        let family = self
            .ledger
            .get_account_family_by_proj(proj_id)
            .await
            .map_err(map_ledger_error)?;

        let price = self
            .prices
            .get_price(family.vlab.id, service_type, &service_subtype, now)
            .await
            .map_err(|error| AppError::EntityNotFound(error.to_string()))?;

        let cost = crate::usage::calculate_cost(&price, None, usage_value, true);

        let job = Job {
            id: Uuid::new_v4(),
            vlab_id: family.vlab.id,
            proj_id,
            user_id,
            group_id,
            service_type,
            service_subtype,
            reserved_at: Some(now),
            started_at: None,
            last_alive_at: None,
            last_charged_at: None,
            finished_at: None,
            cancelled_at: None,
            reservation_params,
            usage_params: json!({}),
        };

        let job = self.ledger.reserve(job, cost).await.map_err(map_ledger_error)?;

        Ok(ReservationOutcome {
            job_id: job.id,
            requested_amount: cost,
        })
    }
}

pub fn map_ledger_error(error: LedgerStoreError) -> AppError {
    match error {
        LedgerStoreError::NotFound(message) => AppError::EntityNotFound(message),
        LedgerStoreError::AlreadyStarted => AppError::JobAlreadyStarted,
        LedgerStoreError::AlreadyCancelled => AppError::JobAlreadyCancelled,
        LedgerStoreError::InsufficientFunds { requested, available } => AppError::InsufficientFunds {
            requested_amount: requested,
            available_amount: available,
        },
        LedgerStoreError::Invariant(message) => AppError::Internal(message),
        LedgerStoreError::Db(message) => AppError::Internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::FixedClock;
    use crate::price::{self, NewPrice};
    use crate::store;
    use chrono::Utc;

    async fn setup() -> (ReservationService, Arc<dyn LedgerStore>, AccountId) {
        let ledger = store::memory();
        let prices = price::memory();
        let now = Utc::now();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(now));

        ledger.create_system_account("system", now).await.unwrap();
        let vlab = ledger.create_vlab("vlab-1", Some(Decimal::new(1000, 0)), now).await.unwrap();
        let (proj, _rsv) = ledger.create_proj(vlab.id, "proj-1", now).await.unwrap();

        prices
            .create_price(NewPrice {
                service_type: ServiceType::Oneshot,
                service_subtype: "cpu".to_string(),
                valid_from: now - chrono::Duration::days(1),
                valid_to: None,
                fixed_cost: Decimal::ZERO,
                multiplier: Decimal::new(1, 5),
                vlab_id: None,
            })
            .await
            .unwrap();

        let service = ReservationService::new(ledger.clone(), prices, clock);
        (service, ledger, proj.id)
    }

    #[tokio::test]
    async fn scenario_2_assign_then_reserve_oneshot() {
        let (service, ledger, proj_id) = setup().await;
        // assign 400 to the project directly via the ledger (mimics /budget/assign)
        let family = ledger.get_account_family_by_proj(proj_id).await.unwrap();
        ledger
            .post_transaction(crate::store::TransactionRequest::new(
                Decimal::new(400, 0),
                family.vlab.id,
                proj_id,
                Utc::now(),
                crate::types::TransactionType::AssignBudget,
            ))
            .await
            .unwrap();

        let outcome = service
            .reserve_oneshot(OneshotReservationRequest {
                proj_id,
                user_id: None,
                group_id: None,
                service_subtype: "cpu".to_string(),
                count: 1_000_000,
            })
            .await
            .unwrap();

        assert_eq!(outcome.requested_amount, Decimal::new(1000000, 5));
        let proj = ledger.get_account(proj_id).await.unwrap();
        assert_eq!(proj.balance, Decimal::new(39000000, 5));
        let family = ledger.get_account_family_by_proj(proj_id).await.unwrap();
        assert_eq!(family.rsv.balance, Decimal::new(1000000, 5));
    }

    #[tokio::test]
    async fn scenario_4_insufficient_funds() {
        let (service, ledger, proj_id) = setup().await;
        let family = ledger.get_account_family_by_proj(proj_id).await.unwrap();
        ledger
            .post_transaction(crate::store::TransactionRequest::new(
                Decimal::new(400, 0),
                family.vlab.id,
                proj_id,
                Utc::now(),
                crate::types::TransactionType::AssignBudget,
            ))
            .await
            .unwrap();

        let error = service
            .reserve_oneshot(OneshotReservationRequest {
                proj_id,
                user_id: None,
                group_id: None,
                service_subtype: "cpu".to_string(),
                count: 50_000_000,
            })
            .await
            .unwrap_err();

        match error {
            AppError::InsufficientFunds { requested_amount, available_amount } => {
                assert_eq!(requested_amount, Decimal::new(500, 0));
                assert_eq!(available_amount, Decimal::new(400, 0));
            }
            other => panic!("expected insufficient funds, got {other:?}"),
        }
    }
}
