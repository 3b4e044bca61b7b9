use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{AccountId, AccountKind, JobId, ServiceSubtype, ServiceType, TransactionType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub kind: AccountKind,
    pub parent_id: Option<AccountId>,
    pub name: String,
    pub balance: Decimal,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The four accounts a PROJ-scoped operation (reservation, release, charge)
/// routinely needs: the project itself, its parent vlab, its reservation
/// holding account, and the single system account.
#[derive(Debug, Clone)]
pub struct AccountFamily {
    pub sys: Account,
    pub vlab: Account,
    pub proj: Account,
    pub rsv: Account,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub vlab_id: AccountId,
    pub proj_id: AccountId,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub service_type: ServiceType,
    pub service_subtype: ServiceSubtype,
    pub reserved_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_alive_at: Option<DateTime<Utc>>,
    pub last_charged_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub reservation_params: Value,
    pub usage_params: Value,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.finished_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
    pub id: i64,
    pub transaction_datetime: DateTime<Utc>,
    pub transaction_type: TransactionType,
    pub job_id: Option<JobId>,
    pub price_id: Option<i64>,
    pub discount_id: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: AccountId,
    pub journal_id: i64,
    pub amount: Decimal,
}

/// Parameters for a single double-entry posting (§4.1).
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    pub amount: Decimal,
    pub debited_from: AccountId,
    pub credited_to: AccountId,
    pub at: DateTime<Utc>,
    pub transaction_type: TransactionType,
    pub job_id: Option<JobId>,
    pub price_id: Option<i64>,
    pub discount_id: Option<i64>,
    pub reason: Option<String>,
}

impl TransactionRequest {
    pub fn new(
        amount: Decimal,
        debited_from: AccountId,
        credited_to: AccountId,
        at: DateTime<Utc>,
        transaction_type: TransactionType,
    ) -> Self {
        Self {
            amount,
            debited_from,
            credited_to,
            at,
            transaction_type,
            job_id: None,
            price_id: None,
            discount_id: None,
            reason: None,
        }
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_price(mut self, price_id: Option<i64>) -> Self {
        self.price_id = price_id;
        self
    }

    pub fn with_discount(mut self, discount_id: Option<i64>) -> Self {
        self.discount_id = discount_id;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

pub fn new_id() -> Uuid {
    Uuid::new_v4()
}
