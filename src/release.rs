use std::sync::Arc;

use rust_decimal::Decimal;

use crate::clock::Clock;
use crate::error::AppError;
use crate::reservation::map_ledger_error;
use crate::store::LedgerStore;
use crate::types::{JobId, ServiceType};

pub struct ReleaseService {
    ledger: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl ReleaseService {
    pub fn new(ledger: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    pub async fn release(&self, job_id: JobId, service_type: ServiceType) -> Result<Decimal, AppError> {
        let now = self.clock.now();
        self.ledger.release_job(job_id, service_type, now).await.map_err(map_ledger_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::FixedClock;
    use crate::reservation::{OneshotReservationRequest, ReservationService};
    use crate::price::{self, NewPrice};
    use crate::store;
    use crate::types::TransactionType;
    use chrono::Utc;

    #[tokio::test]
    async fn release_restores_proj_balance() {
        let ledger = store::memory();
        let prices = price::memory();
        let now = Utc::now();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(now));

        ledger.create_system_account("system", now).await.unwrap();
        let vlab = ledger.create_vlab("vlab-1", Some(Decimal::new(1000, 0)), now).await.unwrap();
        let (proj, _rsv) = ledger.create_proj(vlab.id, "proj-1", now).await.unwrap();
        ledger
            .post_transaction(crate::store::TransactionRequest::new(
                Decimal::new(400, 0),
                vlab.id,
                proj.id,
                now,
                TransactionType::AssignBudget,
            ))
            .await
            .unwrap();

        prices
            .create_price(NewPrice {
                service_type: crate::types::ServiceType::Oneshot,
                service_subtype: "cpu".to_string(),
                valid_from: now - chrono::Duration::days(1),
                valid_to: None,
                fixed_cost: Decimal::ZERO,
                multiplier: Decimal::new(1, 5),
                vlab_id: None,
            })
            .await
            .unwrap();

        let reservations = ReservationService::new(ledger.clone(), prices, clock.clone());
        let outcome = reservations
            .reserve_oneshot(OneshotReservationRequest {
                proj_id: proj.id,
                user_id: None,
                group_id: None,
                service_subtype: "cpu".to_string(),
                count: 1_000_000,
            })
            .await
            .unwrap();

        let before = ledger.get_account(proj.id).await.unwrap().balance;
        assert_eq!(before, Decimal::new(39000000, 5));

        let release = ReleaseService::new(ledger.clone(), clock);
        let remaining = release.release(outcome.job_id, ServiceType::Oneshot).await.unwrap();
        assert_eq!(remaining, Decimal::new(1000000, 5));

        let after = ledger.get_account(proj.id).await.unwrap().balance;
        assert_eq!(after, Decimal::new(400, 0));
    }

    #[tokio::test]
    async fn releasing_unknown_job_is_not_found() {
        let ledger = store::memory();
        let now = Utc::now();
        ledger.create_system_account("system", now).await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(now));
        let release = ReleaseService::new(ledger, clock);
        let error = release.release(uuid::Uuid::new_v4(), ServiceType::Oneshot).await.unwrap_err();
        assert!(matches!(error, AppError::EntityNotFound(_)));
    }
}
