use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Transaction;
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::RuntimeDb;
use crate::types::{AccountId, AccountKind, JobId, ServiceType, TransactionType};

use super::types::{Account, AccountFamily, Job, Journal, LedgerEntry, TransactionRequest};

#[derive(Error, Debug)]
pub enum LedgerStoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("job already started")]
    AlreadyStarted,
    #[error("job already cancelled")]
    AlreadyCancelled,
    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },
    #[error("ledger invariant violated: {0}")]
    Invariant(String),
    #[error("job does not match reported event: {0}")]
    Mismatch(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Patch applied to a job's lifecycle fields. `None` leaves a field
/// untouched; timestamps are only ever moved forward by callers, never
/// unset, matching the append-only lifecycle in the data model (§3).
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub started_at: Option<DateTime<Utc>>,
    pub last_alive_at: Option<DateTime<Utc>>,
    pub last_charged_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub usage_params: Option<Value>,
}

/// Persistent double-entry journal + ledger + account-balance cache (§4.1),
/// plus the job records whose lifecycle a reservation/release/charge
/// mutates in the same transaction. Account, Job, Journal and LedgerEntry
/// are behind one trait because every core operation here must touch all
/// four atomically; see DESIGN.md for why this departs from the spec's
/// component list, which names them as separate stores.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create_system_account(&self, name: &str, at: DateTime<Utc>) -> Result<Account, LedgerStoreError>;
    async fn create_vlab(
        &self,
        name: &str,
        initial_balance: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Result<Account, LedgerStoreError>;
    async fn create_proj(
        &self,
        vlab_id: AccountId,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<(Account, Account), LedgerStoreError>;

    async fn get_account(&self, id: AccountId) -> Result<Account, LedgerStoreError>;
    async fn get_system_account(&self) -> Result<Account, LedgerStoreError>;
    async fn get_account_family_by_proj(&self, proj_id: AccountId) -> Result<AccountFamily, LedgerStoreError>;
    async fn list_projects_for_vlab(&self, vlab_id: AccountId) -> Result<Vec<Account>, LedgerStoreError>;
    async fn list_vlabs(&self) -> Result<Vec<Account>, LedgerStoreError>;

    /// Direct balance move between two accounts outside the job lifecycle
    /// (top-up, assign, reverse, move - §6 budget endpoints).
    async fn post_transaction(&self, request: TransactionRequest) -> Result<Journal, LedgerStoreError>;

    async fn get_remaining_reservation_for_job(
        &self,
        job_id: JobId,
        rsv_account_id: AccountId,
    ) -> Result<Decimal, LedgerStoreError>;

    /// Atomically checks the PROJ balance, inserts the job row, and posts
    /// the RESERVE transaction (§4.2 steps 2-7). Returns the inserted job.
    async fn reserve(&self, job: Job, cost: Decimal) -> Result<Job, LedgerStoreError>;

    /// Atomically locks the job, validates its state, releases any
    /// remaining reservation, and marks it cancelled (§4.3).
    async fn release_job(&self, job_id: JobId, service_type: ServiceType, at: DateTime<Utc>) -> Result<Decimal, LedgerStoreError>;

    /// Posts zero or more transactions and applies one job update in a
    /// single transaction/savepoint - the per-job atomic unit the charging
    /// engines rely on (§4.4-§4.6, §5).
    async fn charge_job(
        &self,
        job_id: JobId,
        postings: Vec<TransactionRequest>,
        update: JobUpdate,
    ) -> Result<(), LedgerStoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Job, LedgerStoreError>;
    async fn insert_job(&self, job: Job) -> Result<Job, LedgerStoreError>;
    async fn apply_job_update(&self, job_id: JobId, update: JobUpdate) -> Result<Job, LedgerStoreError>;

    /// Locks PROJ+RSV and the job row for the duration of the check, verifies
    /// the job's vlab/proj/service identity still matches a reported usage
    /// event, and applies `update` - all as one atomic unit, so a redelivered
    /// or racing event can never observe (or act on) a half-validated job
    /// (§4.7). Returns `LedgerStoreError::Mismatch` if the job is already
    /// finished or any identity field disagrees with the caller's event.
    async fn apply_matched_job_update(
        &self,
        job_id: JobId,
        expected_proj_id: AccountId,
        expected_service_type: ServiceType,
        expected_service_subtype: &str,
        update: JobUpdate,
    ) -> Result<Job, LedgerStoreError>;

    async fn find_open_storage_job(&self, proj_id: AccountId) -> Result<Option<Job>, LedgerStoreError>;

    async fn list_oneshot_to_be_charged(&self, min_datetime: Option<DateTime<Utc>>) -> Result<Vec<Job>, LedgerStoreError>;
    async fn list_longrun_to_be_charged(&self, min_datetime: Option<DateTime<Utc>>) -> Result<Vec<Job>, LedgerStoreError>;
    async fn list_storage_finished_unsettled(&self, min_datetime: Option<DateTime<Utc>>) -> Result<Vec<Job>, LedgerStoreError>;
    async fn list_storage_running(&self) -> Result<Vec<Job>, LedgerStoreError>;

    /// Paginated per-job report for a single PROJ (§6 GET /report/...),
    /// newest jobs first. `page` is 1-based.
    async fn list_jobs_for_proj(&self, proj_id: AccountId, page: u32, page_size: u32) -> Result<Vec<Job>, LedgerStoreError>;
}

pub fn memory() -> Arc<dyn LedgerStore> {
    Arc::new(MemoryLedgerStore::default())
}

pub fn postgres(db: Arc<RuntimeDb>) -> Arc<dyn LedgerStore> {
    Arc::new(PostgresLedgerStore { db })
}

// ---------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemoryLedgerStoreInner {
    accounts: HashMap<AccountId, Account>,
    jobs: HashMap<JobId, Job>,
    journals: Vec<Journal>,
    ledger_entries: Vec<LedgerEntry>,
    next_journal_id: i64,
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    inner: Mutex<MemoryLedgerStoreInner>,
}

impl MemoryLedgerStoreInner {
    fn post(&mut self, request: TransactionRequest) -> Result<Journal, LedgerStoreError> {
        if request.amount <= Decimal::ZERO {
            warn!(amount = %request.amount, "posting non-positive transaction amount");
        }
        let debited = self
            .accounts
            .get(&request.debited_from)
            .cloned()
            .ok_or_else(|| LedgerStoreError::NotFound(format!("account {}", request.debited_from)))?;
        let credited = self
            .accounts
            .get(&request.credited_to)
            .cloned()
            .ok_or_else(|| LedgerStoreError::NotFound(format!("account {}", request.credited_to)))?;

        self.next_journal_id += 1;
        let journal = Journal {
            id: self.next_journal_id,
            transaction_datetime: request.at,
            transaction_type: request.transaction_type,
            job_id: request.job_id,
            price_id: request.price_id,
            discount_id: request.discount_id,
            reason: request.reason.clone(),
        };

        self.ledger_entries.push(LedgerEntry {
            id: self.ledger_entries.len() as i64 + 1,
            account_id: request.debited_from,
            journal_id: journal.id,
            amount: -request.amount,
        });
        self.ledger_entries.push(LedgerEntry {
            id: self.ledger_entries.len() as i64 + 1,
            account_id: request.credited_to,
            journal_id: journal.id,
            amount: request.amount,
        });

        self.accounts.get_mut(&debited.id).unwrap().balance -= request.amount;
        self.accounts.get_mut(&credited.id).unwrap().balance += request.amount;

        info!(
            journal_id = journal.id,
            amount = %request.amount,
            debited_from = %request.debited_from,
            credited_to = %request.credited_to,
            transaction_type = request.transaction_type.as_str(),
            "posted ledger transaction"
        );

        self.journals.push(journal.clone());
        Ok(journal)
    }

    fn remaining_reservation(&self, job_id: JobId, rsv_account_id: AccountId) -> Result<Decimal, LedgerStoreError> {
        let job_journal_ids: Vec<i64> = self
            .journals
            .iter()
            .filter(|journal| journal.job_id == Some(job_id))
            .map(|journal| journal.id)
            .collect();
        let sum: Decimal = self
            .ledger_entries
            .iter()
            .filter(|entry| entry.account_id == rsv_account_id && job_journal_ids.contains(&entry.journal_id))
            .map(|entry| entry.amount)
            .sum();
        if sum < Decimal::ZERO {
            return Err(LedgerStoreError::Invariant(format!(
                "remaining reservation for job {job_id} is negative: {sum}"
            )));
        }
        Ok(sum)
    }

    fn family_for_proj(&self, proj_id: AccountId) -> Result<AccountFamily, LedgerStoreError> {
        let proj = self
            .accounts
            .get(&proj_id)
            .cloned()
            .ok_or_else(|| LedgerStoreError::NotFound(format!("account {proj_id}")))?;
        let vlab_id = proj
            .parent_id
            .ok_or_else(|| LedgerStoreError::Invariant(format!("proj {proj_id} has no vlab parent")))?;
        let vlab = self
            .accounts
            .get(&vlab_id)
            .cloned()
            .ok_or_else(|| LedgerStoreError::NotFound(format!("account {vlab_id}")))?;
        let rsv = self
            .accounts
            .values()
            .find(|account| account.kind == AccountKind::Rsv && account.parent_id == Some(proj_id))
            .cloned()
            .ok_or_else(|| LedgerStoreError::NotFound(format!("rsv for proj {proj_id}")))?;
        let sys = self
            .accounts
            .values()
            .find(|account| account.kind == AccountKind::Sys)
            .cloned()
            .ok_or_else(|| LedgerStoreError::NotFound("system account".to_string()))?;
        Ok(AccountFamily { sys, vlab, proj, rsv })
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn create_system_account(&self, name: &str, at: DateTime<Utc>) -> Result<Account, LedgerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.accounts.values().any(|account| account.kind == AccountKind::Sys) {
            return Err(LedgerStoreError::Invariant("a system account already exists".to_string()));
        }
        let account = Account {
            id: Uuid::new_v4(),
            kind: AccountKind::Sys,
            parent_id: None,
            name: name.to_string(),
            balance: Decimal::ZERO,
            enabled: true,
            created_at: at,
            updated_at: at,
        };
        inner.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn create_vlab(
        &self,
        name: &str,
        initial_balance: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Result<Account, LedgerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let account = Account {
            id: Uuid::new_v4(),
            kind: AccountKind::Vlab,
            parent_id: None,
            name: name.to_string(),
            balance: Decimal::ZERO,
            enabled: true,
            created_at: at,
            updated_at: at,
        };
        inner.accounts.insert(account.id, account.clone());
        if let Some(amount) = initial_balance {
            if amount > Decimal::ZERO {
                let sys_id = inner
                    .accounts
                    .values()
                    .find(|a| a.kind == AccountKind::Sys)
                    .map(|a| a.id)
                    .ok_or_else(|| LedgerStoreError::NotFound("system account".to_string()))?;
                inner.post(TransactionRequest::new(
                    amount,
                    sys_id,
                    account.id,
                    at,
                    TransactionType::TopUp,
                ))?;
            }
        }
        inner.accounts.get(&account.id).cloned().ok_or_else(|| LedgerStoreError::NotFound(account.id.to_string()))
    }

    async fn create_proj(
        &self,
        vlab_id: AccountId,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<(Account, Account), LedgerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.accounts.contains_key(&vlab_id) {
            return Err(LedgerStoreError::NotFound(format!("account {vlab_id}")));
        }
        let proj = Account {
            id: Uuid::new_v4(),
            kind: AccountKind::Proj,
            parent_id: Some(vlab_id),
            name: name.to_string(),
            balance: Decimal::ZERO,
            enabled: true,
            created_at: at,
            updated_at: at,
        };
        let rsv = Account {
            id: Uuid::new_v4(),
            kind: AccountKind::Rsv,
            parent_id: Some(proj.id),
            name: format!("{name}-reservation"),
            balance: Decimal::ZERO,
            enabled: true,
            created_at: at,
            updated_at: at,
        };
        inner.accounts.insert(proj.id, proj.clone());
        inner.accounts.insert(rsv.id, rsv.clone());
        Ok((proj, rsv))
    }

    async fn get_account(&self, id: AccountId) -> Result<Account, LedgerStoreError> {
        let inner = self.inner.lock().unwrap();
        inner.accounts.get(&id).cloned().ok_or_else(|| LedgerStoreError::NotFound(format!("account {id}")))
    }

    async fn get_system_account(&self) -> Result<Account, LedgerStoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .accounts
            .values()
            .find(|account| account.kind == AccountKind::Sys)
            .cloned()
            .ok_or_else(|| LedgerStoreError::NotFound("system account".to_string()))
    }

    async fn get_account_family_by_proj(&self, proj_id: AccountId) -> Result<AccountFamily, LedgerStoreError> {
        let inner = self.inner.lock().unwrap();
        inner.family_for_proj(proj_id)
    }

    async fn list_projects_for_vlab(&self, vlab_id: AccountId) -> Result<Vec<Account>, LedgerStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .accounts
            .values()
            .filter(|account| account.kind == AccountKind::Proj && account.parent_id == Some(vlab_id))
            .cloned()
            .collect())
    }

    async fn list_vlabs(&self) -> Result<Vec<Account>, LedgerStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.accounts.values().filter(|account| account.kind == AccountKind::Vlab).cloned().collect())
    }

    async fn post_transaction(&self, request: TransactionRequest) -> Result<Journal, LedgerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.post(request)
    }

    async fn get_remaining_reservation_for_job(
        &self,
        job_id: JobId,
        rsv_account_id: AccountId,
    ) -> Result<Decimal, LedgerStoreError> {
        let inner = self.inner.lock().unwrap();
        inner.remaining_reservation(job_id, rsv_account_id)
    }

    async fn reserve(&self, job: Job, cost: Decimal) -> Result<Job, LedgerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let family = inner.family_for_proj(job.proj_id)?;
        if cost > family.proj.balance {
            return Err(LedgerStoreError::InsufficientFunds {
                requested: cost,
                available: family.proj.balance,
            });
        }
        let at = job.reserved_at.unwrap_or_else(Utc::now);
        inner.jobs.insert(job.id, job.clone());
        inner.post(
            TransactionRequest::new(cost, family.proj.id, family.rsv.id, at, TransactionType::Reserve)
                .with_job(job.id),
        )?;
        Ok(job)
    }

    async fn release_job(&self, job_id: JobId, service_type: ServiceType, at: DateTime<Utc>) -> Result<Decimal, LedgerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| LedgerStoreError::NotFound(format!("job {job_id}")))?;
        if job.service_type != service_type {
            return Err(LedgerStoreError::NotFound(format!("job {job_id}")));
        }
        if job.started_at.is_some() {
            return Err(LedgerStoreError::AlreadyStarted);
        }
        if job.cancelled_at.is_some() {
            return Err(LedgerStoreError::AlreadyCancelled);
        }
        let family = inner.family_for_proj(job.proj_id)?;
        let remaining = inner.remaining_reservation(job_id, family.rsv.id)?;
        if remaining > Decimal::ZERO {
            inner.post(
                TransactionRequest::new(remaining, family.rsv.id, family.proj.id, at, TransactionType::Release)
                    .with_job(job_id)
                    .with_reason("job_cancelled:release_reservation"),
            )?;
        }
        let job = inner.jobs.get_mut(&job_id).unwrap();
        job.cancelled_at = Some(at);
        Ok(remaining)
    }

    async fn charge_job(
        &self,
        job_id: JobId,
        postings: Vec<TransactionRequest>,
        update: JobUpdate,
    ) -> Result<(), LedgerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.jobs.contains_key(&job_id) {
            return Err(LedgerStoreError::NotFound(format!("job {job_id}")));
        }
        for posting in postings {
            inner.post(posting)?;
        }
        let job = inner.jobs.get_mut(&job_id).unwrap();
        apply_update(job, update);
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Job, LedgerStoreError> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(&job_id).cloned().ok_or_else(|| LedgerStoreError::NotFound(format!("job {job_id}")))
    }

    async fn insert_job(&self, job: Job) -> Result<Job, LedgerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn apply_job_update(&self, job_id: JobId, update: JobUpdate) -> Result<Job, LedgerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| LedgerStoreError::NotFound(format!("job {job_id}")))?;
        apply_update(job, update);
        Ok(job.clone())
    }

    async fn apply_matched_job_update(
        &self,
        job_id: JobId,
        expected_proj_id: AccountId,
        expected_service_type: ServiceType,
        expected_service_subtype: &str,
        update: JobUpdate,
    ) -> Result<Job, LedgerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let family = inner.family_for_proj(expected_proj_id)?;
        let job = inner.jobs.get(&job_id).cloned().ok_or_else(|| LedgerStoreError::NotFound(format!("job {job_id}")))?;
        if job.finished_at.is_some() {
            return Err(LedgerStoreError::Mismatch(format!("job {job_id} is already finished")));
        }
        if job.vlab_id != family.vlab.id
            || job.proj_id != expected_proj_id
            || job.service_type != expected_service_type
            || job.service_subtype != expected_service_subtype
        {
            return Err(LedgerStoreError::Mismatch(format!("job {job_id} does not match the reported event")));
        }
        let job = inner.jobs.get_mut(&job_id).unwrap();
        apply_update(job, update);
        Ok(job.clone())
    }

    async fn find_open_storage_job(&self, proj_id: AccountId) -> Result<Option<Job>, LedgerStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .find(|job| job.proj_id == proj_id && job.service_type == ServiceType::Storage && job.finished_at.is_none())
            .cloned())
    }

    async fn list_oneshot_to_be_charged(&self, min_datetime: Option<DateTime<Utc>>) -> Result<Vec<Job>, LedgerStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|job| {
                job.service_type == ServiceType::Oneshot
                    && job.started_at.is_some()
                    && job.finished_at.is_some()
                    && job.last_charged_at.is_none()
                    && min_datetime.is_none_or(|min| job.started_at.unwrap() >= min)
            })
            .cloned()
            .collect())
    }

    async fn list_longrun_to_be_charged(&self, min_datetime: Option<DateTime<Utc>>) -> Result<Vec<Job>, LedgerStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|job| {
                job.service_type == ServiceType::Longrun
                    && job.started_at.is_some()
                    && (job.last_charged_at.is_none()
                        || job.finished_at.is_none()
                        || job.last_charged_at != job.finished_at)
                    && min_datetime.is_none_or(|min| job.started_at.unwrap() >= min)
            })
            .cloned()
            .collect())
    }

    async fn list_storage_finished_unsettled(&self, min_datetime: Option<DateTime<Utc>>) -> Result<Vec<Job>, LedgerStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|job| {
                job.service_type == ServiceType::Storage
                    && job.finished_at.is_some()
                    && (job.last_charged_at.is_none() || job.last_charged_at != job.finished_at)
                    && min_datetime.is_none_or(|min| job.started_at.unwrap() >= min)
            })
            .cloned()
            .collect())
    }

    async fn list_storage_running(&self) -> Result<Vec<Job>, LedgerStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.service_type == ServiceType::Storage && job.finished_at.is_none())
            .cloned()
            .collect())
    }

    async fn list_jobs_for_proj(&self, proj_id: AccountId, page: u32, page_size: u32) -> Result<Vec<Job>, LedgerStoreError> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<Job> = inner.jobs.values().filter(|job| job.proj_id == proj_id).cloned().collect();
        jobs.sort_by(|a, b| b.reserved_at.or(b.started_at).cmp(&a.reserved_at.or(a.started_at)));
        let start = (page.saturating_sub(1) as usize) * page_size as usize;
        Ok(jobs.into_iter().skip(start).take(page_size as usize).collect())
    }
}

fn apply_update(job: &mut Job, update: JobUpdate) {
    if let Some(started_at) = update.started_at {
        job.started_at = Some(started_at);
    }
    if let Some(last_alive_at) = update.last_alive_at {
        job.last_alive_at = Some(last_alive_at);
    }
    if let Some(last_charged_at) = update.last_charged_at {
        job.last_charged_at = Some(last_charged_at);
    }
    if let Some(finished_at) = update.finished_at {
        job.finished_at = Some(finished_at);
    }
    if let Some(cancelled_at) = update.cancelled_at {
        job.cancelled_at = Some(cancelled_at);
    }
    if let Some(usage_params) = update.usage_params {
        job.usage_params = usage_params;
    }
}

// ---------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------

pub struct PostgresLedgerStore {
    db: Arc<RuntimeDb>,
}

impl PostgresLedgerStore {
    async fn post_in_tx(tx: &Transaction<'_>, request: &TransactionRequest) -> Result<Journal, LedgerStoreError> {
        if request.amount <= Decimal::ZERO {
            warn!(amount = %request.amount, "posting non-positive transaction amount");
        }
        let row = tx
            .query_one(
                "INSERT INTO journal (transaction_datetime, transaction_type, job_id, price_id, discount_id, properties)
                 VALUES ($1, $2, $3, $4, $5, jsonb_build_object('reason', $6::text))
                 RETURNING id",
                &[
                    &request.at,
                    &request.transaction_type.as_str(),
                    &request.job_id,
                    &request.price_id,
                    &request.discount_id,
                    &request.reason,
                ],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let journal_id: i64 = row.get(0);

        tx.execute(
            "INSERT INTO ledger_entry (account_id, journal_id, amount) VALUES ($1, $2, $3), ($4, $2, $5)",
            &[
                &request.debited_from,
                &journal_id,
                &-request.amount,
                &request.credited_to,
                &request.amount,
            ],
        )
        .await
        .map_err(|error| LedgerStoreError::Db(error.to_string()))?;

        let debited_rows = tx
            .execute(
                "UPDATE account SET balance = balance - $1, updated_at = $2 WHERE id = $3",
                &[&request.amount, &request.at, &request.debited_from],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let credited_rows = tx
            .execute(
                "UPDATE account SET balance = balance + $1, updated_at = $2 WHERE id = $3",
                &[&request.amount, &request.at, &request.credited_to],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        if debited_rows != 1 || credited_rows != 1 {
            return Err(LedgerStoreError::NotFound(
                "debited_from or credited_to account does not exist".to_string(),
            ));
        }

        info!(
            journal_id,
            amount = %request.amount,
            debited_from = %request.debited_from,
            credited_to = %request.credited_to,
            transaction_type = request.transaction_type.as_str(),
            "posted ledger transaction"
        );

        Ok(Journal {
            id: journal_id,
            transaction_datetime: request.at,
            transaction_type: request.transaction_type,
            job_id: request.job_id,
            price_id: request.price_id,
            discount_id: request.discount_id,
            reason: request.reason.clone(),
        })
    }

    async fn remaining_reservation_in_tx(
        tx: &Transaction<'_>,
        job_id: JobId,
        rsv_account_id: AccountId,
    ) -> Result<Decimal, LedgerStoreError> {
        let row = tx
            .query_one(
                "SELECT COALESCE(SUM(le.amount), 0) FROM ledger_entry le
                 JOIN journal j ON j.id = le.journal_id
                 WHERE j.job_id = $1 AND le.account_id = $2",
                &[&job_id, &rsv_account_id],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let sum: Decimal = row.get(0);
        if sum < Decimal::ZERO {
            return Err(LedgerStoreError::Invariant(format!(
                "remaining reservation for job {job_id} is negative: {sum}"
            )));
        }
        Ok(sum)
    }

    fn map_account_row(row: &tokio_postgres::Row) -> Result<Account, LedgerStoreError> {
        let kind_raw: String = row.try_get("kind").map_err(|e| LedgerStoreError::Db(e.to_string()))?;
        Ok(Account {
            id: row.try_get("id").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            kind: kind_raw.parse().map_err(LedgerStoreError::Invariant)?,
            parent_id: row.try_get("parent_id").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            name: row.try_get("name").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            balance: row.try_get("balance").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            enabled: row.try_get("enabled").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            created_at: row.try_get("created_at").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            updated_at: row.try_get("updated_at").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
        })
    }

    fn map_job_row(row: &tokio_postgres::Row) -> Result<Job, LedgerStoreError> {
        let service_type_raw: String = row.try_get("service_type").map_err(|e| LedgerStoreError::Db(e.to_string()))?;
        Ok(Job {
            id: row.try_get("id").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            vlab_id: row.try_get("vlab_id").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            proj_id: row.try_get("proj_id").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            user_id: row.try_get("user_id").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            group_id: row.try_get("group_id").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            service_type: service_type_raw.parse().map_err(LedgerStoreError::Invariant)?,
            service_subtype: row.try_get("service_subtype").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            reserved_at: row.try_get("reserved_at").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            started_at: row.try_get("started_at").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            last_alive_at: row.try_get("last_alive_at").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            last_charged_at: row.try_get("last_charged_at").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            finished_at: row.try_get("finished_at").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            cancelled_at: row.try_get("cancelled_at").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            reservation_params: row.try_get("reservation_params").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
            usage_params: row.try_get("usage_params").map_err(|e| LedgerStoreError::Db(e.to_string()))?,
        })
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn create_system_account(&self, name: &str, at: DateTime<Utc>) -> Result<Account, LedgerStoreError> {
        let mut client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let tx = client.transaction().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let row = tx
            .query_one(
                "INSERT INTO account (id, kind, parent_id, name, balance, enabled, created_at, updated_at)
                 VALUES (gen_random_uuid(), 'SYS', NULL, $1, 0, true, $2, $2) RETURNING *",
                &[&name, &at],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let account = Self::map_account_row(&row)?;
        tx.commit().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        Ok(account)
    }

    async fn create_vlab(
        &self,
        name: &str,
        initial_balance: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Result<Account, LedgerStoreError> {
        let mut client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let tx = client.transaction().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let row = tx
            .query_one(
                "INSERT INTO account (id, kind, parent_id, name, balance, enabled, created_at, updated_at)
                 VALUES (gen_random_uuid(), 'VLAB', NULL, $1, 0, true, $2, $2) RETURNING *",
                &[&name, &at],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let account = Self::map_account_row(&row)?;
        if let Some(amount) = initial_balance {
            if amount > Decimal::ZERO {
                let sys_row = tx
                    .query_one("SELECT id FROM account WHERE kind = 'SYS'", &[])
                    .await
                    .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
                let sys_id: AccountId = sys_row.get(0);
                Self::post_in_tx(
                    &tx,
                    &TransactionRequest::new(amount, sys_id, account.id, at, TransactionType::TopUp),
                )
                .await?;
            }
        }
        tx.commit().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        Ok(account)
    }

    async fn create_proj(
        &self,
        vlab_id: AccountId,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<(Account, Account), LedgerStoreError> {
        let mut client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let tx = client.transaction().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let proj_row = tx
            .query_one(
                "INSERT INTO account (id, kind, parent_id, name, balance, enabled, created_at, updated_at)
                 VALUES (gen_random_uuid(), 'PROJ', $1, $2, 0, true, $3, $3) RETURNING *",
                &[&vlab_id, &name, &at],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let proj = Self::map_account_row(&proj_row)?;
        let rsv_name = format!("{name}-reservation");
        let rsv_row = tx
            .query_one(
                "INSERT INTO account (id, kind, parent_id, name, balance, enabled, created_at, updated_at)
                 VALUES (gen_random_uuid(), 'RSV', $1, $2, 0, true, $3, $3) RETURNING *",
                &[&proj.id, &rsv_name, &at],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let rsv = Self::map_account_row(&rsv_row)?;
        tx.commit().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        Ok((proj, rsv))
    }

    async fn get_account(&self, id: AccountId) -> Result<Account, LedgerStoreError> {
        let client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let row = client
            .query_opt("SELECT * FROM account WHERE id = $1", &[&id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .ok_or_else(|| LedgerStoreError::NotFound(format!("account {id}")))?;
        Self::map_account_row(&row)
    }

    async fn get_system_account(&self) -> Result<Account, LedgerStoreError> {
        let client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let row = client
            .query_opt("SELECT * FROM account WHERE kind = 'SYS'", &[])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .ok_or_else(|| LedgerStoreError::NotFound("system account".to_string()))?;
        Self::map_account_row(&row)
    }

    async fn get_account_family_by_proj(&self, proj_id: AccountId) -> Result<AccountFamily, LedgerStoreError> {
        let client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let proj_row = client
            .query_opt("SELECT * FROM account WHERE id = $1 AND kind = 'PROJ'", &[&proj_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .ok_or_else(|| LedgerStoreError::NotFound(format!("account {proj_id}")))?;
        let proj = Self::map_account_row(&proj_row)?;
        let vlab_id = proj
            .parent_id
            .ok_or_else(|| LedgerStoreError::Invariant(format!("proj {proj_id} has no vlab parent")))?;
        let vlab_row = client
            .query_opt("SELECT * FROM account WHERE id = $1", &[&vlab_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .ok_or_else(|| LedgerStoreError::NotFound(format!("account {vlab_id}")))?;
        let rsv_row = client
            .query_opt("SELECT * FROM account WHERE kind = 'RSV' AND parent_id = $1", &[&proj_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .ok_or_else(|| LedgerStoreError::NotFound(format!("rsv for proj {proj_id}")))?;
        let sys_row = client
            .query_opt("SELECT * FROM account WHERE kind = 'SYS'", &[])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .ok_or_else(|| LedgerStoreError::NotFound("system account".to_string()))?;
        Ok(AccountFamily {
            sys: Self::map_account_row(&sys_row)?,
            vlab: Self::map_account_row(&vlab_row)?,
            proj,
            rsv: Self::map_account_row(&rsv_row)?,
        })
    }

    async fn list_projects_for_vlab(&self, vlab_id: AccountId) -> Result<Vec<Account>, LedgerStoreError> {
        let client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let rows = client
            .query("SELECT * FROM account WHERE kind = 'PROJ' AND parent_id = $1", &[&vlab_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        rows.iter().map(Self::map_account_row).collect()
    }

    async fn list_vlabs(&self) -> Result<Vec<Account>, LedgerStoreError> {
        let client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let rows = client
            .query("SELECT * FROM account WHERE kind = 'VLAB'", &[])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        rows.iter().map(Self::map_account_row).collect()
    }

    async fn post_transaction(&self, request: TransactionRequest) -> Result<Journal, LedgerStoreError> {
        let mut client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let tx = client.transaction().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        tx.execute("SELECT id FROM account WHERE id = ANY($1) FOR UPDATE", &[&vec![request.debited_from, request.credited_to]])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let journal = Self::post_in_tx(&tx, &request).await?;
        tx.commit().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        Ok(journal)
    }

    async fn get_remaining_reservation_for_job(
        &self,
        job_id: JobId,
        rsv_account_id: AccountId,
    ) -> Result<Decimal, LedgerStoreError> {
        let mut client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let tx = client.transaction().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let result = Self::remaining_reservation_in_tx(&tx, job_id, rsv_account_id).await;
        tx.commit().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        result
    }

    async fn reserve(&self, job: Job, cost: Decimal) -> Result<Job, LedgerStoreError> {
        let mut client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let tx = client.transaction().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let proj_row = tx
            .query_one("SELECT * FROM account WHERE id = $1 FOR UPDATE", &[&job.proj_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let proj = Self::map_account_row(&proj_row)?;
        if cost > proj.balance {
            return Err(LedgerStoreError::InsufficientFunds {
                requested: cost,
                available: proj.balance,
            });
        }
        let rsv_row = tx
            .query_one("SELECT * FROM account WHERE kind = 'RSV' AND parent_id = $1", &[&job.proj_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let rsv = Self::map_account_row(&rsv_row)?;

        tx.execute(
            "INSERT INTO job (id, vlab_id, proj_id, user_id, group_id, service_type, service_subtype,
              reserved_at, started_at, last_alive_at, last_charged_at, finished_at, cancelled_at,
              reservation_params, usage_params)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,NULL,NULL,NULL,NULL,NULL,$9,$10)",
            &[
                &job.id,
                &job.vlab_id,
                &job.proj_id,
                &job.user_id,
                &job.group_id,
                &job.service_type.as_str(),
                &job.service_subtype,
                &job.reserved_at,
                &job.reservation_params,
                &job.usage_params,
            ],
        )
        .await
        .map_err(|error| LedgerStoreError::Db(error.to_string()))?;

        let at = job.reserved_at.unwrap_or_else(Utc::now);
        Self::post_in_tx(
            &tx,
            &TransactionRequest::new(cost, proj.id, rsv.id, at, TransactionType::Reserve).with_job(job.id),
        )
        .await?;
        tx.commit().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        Ok(job)
    }

    async fn release_job(&self, job_id: JobId, service_type: ServiceType, at: DateTime<Utc>) -> Result<Decimal, LedgerStoreError> {
        let mut client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let tx = client.transaction().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let job_row = tx
            .query_opt("SELECT * FROM job WHERE id = $1 FOR UPDATE", &[&job_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .ok_or_else(|| LedgerStoreError::NotFound(format!("job {job_id}")))?;
        let job = Self::map_job_row(&job_row)?;
        if job.service_type != service_type {
            return Err(LedgerStoreError::NotFound(format!("job {job_id}")));
        }
        if job.started_at.is_some() {
            return Err(LedgerStoreError::AlreadyStarted);
        }
        if job.cancelled_at.is_some() {
            return Err(LedgerStoreError::AlreadyCancelled);
        }
        let rsv_row = tx
            .query_one("SELECT * FROM account WHERE kind = 'RSV' AND parent_id = $1", &[&job.proj_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let rsv = Self::map_account_row(&rsv_row)?;
        let remaining = Self::remaining_reservation_in_tx(&tx, job_id, rsv.id).await?;
        if remaining > Decimal::ZERO {
            Self::post_in_tx(
                &tx,
                &TransactionRequest::new(remaining, rsv.id, job.proj_id, at, TransactionType::Release)
                    .with_job(job_id)
                    .with_reason("job_cancelled:release_reservation"),
            )
            .await?;
        }
        tx.execute("UPDATE job SET cancelled_at = $1 WHERE id = $2", &[&at, &job_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        tx.commit().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        Ok(remaining)
    }

    async fn charge_job(
        &self,
        job_id: JobId,
        postings: Vec<TransactionRequest>,
        update: JobUpdate,
    ) -> Result<(), LedgerStoreError> {
        let mut client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let tx = client.transaction().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        for posting in &postings {
            Self::post_in_tx(&tx, posting).await?;
        }
        tx.execute(
            "UPDATE job SET
               started_at = COALESCE($2, started_at),
               last_alive_at = COALESCE($3, last_alive_at),
               last_charged_at = COALESCE($4, last_charged_at),
               finished_at = COALESCE($5, finished_at),
               cancelled_at = COALESCE($6, cancelled_at),
               usage_params = COALESCE($7, usage_params)
             WHERE id = $1",
            &[
                &job_id,
                &update.started_at,
                &update.last_alive_at,
                &update.last_charged_at,
                &update.finished_at,
                &update.cancelled_at,
                &update.usage_params,
            ],
        )
        .await
        .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        tx.commit().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Job, LedgerStoreError> {
        let client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let row = client
            .query_opt("SELECT * FROM job WHERE id = $1", &[&job_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .ok_or_else(|| LedgerStoreError::NotFound(format!("job {job_id}")))?;
        Self::map_job_row(&row)
    }

    async fn insert_job(&self, job: Job) -> Result<Job, LedgerStoreError> {
        let client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        client
            .execute(
                "INSERT INTO job (id, vlab_id, proj_id, user_id, group_id, service_type, service_subtype,
                   reserved_at, started_at, last_alive_at, last_charged_at, finished_at, cancelled_at,
                   reservation_params, usage_params)
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
                &[
                    &job.id,
                    &job.vlab_id,
                    &job.proj_id,
                    &job.user_id,
                    &job.group_id,
                    &job.service_type.as_str(),
                    &job.service_subtype,
                    &job.reserved_at,
                    &job.started_at,
                    &job.last_alive_at,
                    &job.last_charged_at,
                    &job.finished_at,
                    &job.cancelled_at,
                    &job.reservation_params,
                    &job.usage_params,
                ],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        Ok(job)
    }

    async fn apply_job_update(&self, job_id: JobId, update: JobUpdate) -> Result<Job, LedgerStoreError> {
        let mut client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let tx = client.transaction().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        tx.execute(
            "UPDATE job SET
               started_at = COALESCE($2, started_at),
               last_alive_at = COALESCE($3, last_alive_at),
               last_charged_at = COALESCE($4, last_charged_at),
               finished_at = COALESCE($5, finished_at),
               cancelled_at = COALESCE($6, cancelled_at),
               usage_params = COALESCE($7, usage_params)
             WHERE id = $1",
            &[
                &job_id,
                &update.started_at,
                &update.last_alive_at,
                &update.last_charged_at,
                &update.finished_at,
                &update.cancelled_at,
                &update.usage_params,
            ],
        )
        .await
        .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let row = tx
            .query_opt("SELECT * FROM job WHERE id = $1", &[&job_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .ok_or_else(|| LedgerStoreError::NotFound(format!("job {job_id}")))?;
        let job = Self::map_job_row(&row)?;
        tx.commit().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        Ok(job)
    }

    async fn apply_matched_job_update(
        &self,
        job_id: JobId,
        expected_proj_id: AccountId,
        expected_service_type: ServiceType,
        expected_service_subtype: &str,
        update: JobUpdate,
    ) -> Result<Job, LedgerStoreError> {
        let mut client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let tx = client.transaction().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;

        let proj_row = tx
            .query_opt("SELECT * FROM account WHERE id = $1 AND kind = 'PROJ' FOR UPDATE", &[&expected_proj_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .ok_or_else(|| LedgerStoreError::NotFound(format!("account {expected_proj_id}")))?;
        let proj = Self::map_account_row(&proj_row)?;
        let vlab_id = proj
            .parent_id
            .ok_or_else(|| LedgerStoreError::Invariant(format!("proj {expected_proj_id} has no vlab parent")))?;
        tx.query_one("SELECT id FROM account WHERE kind = 'RSV' AND parent_id = $1 FOR UPDATE", &[&expected_proj_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;

        let job_row = tx
            .query_opt("SELECT * FROM job WHERE id = $1 FOR UPDATE", &[&job_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .ok_or_else(|| LedgerStoreError::NotFound(format!("job {job_id}")))?;
        let job = Self::map_job_row(&job_row)?;

        if job.finished_at.is_some() {
            return Err(LedgerStoreError::Mismatch(format!("job {job_id} is already finished")));
        }
        if job.vlab_id != vlab_id
            || job.proj_id != expected_proj_id
            || job.service_type != expected_service_type
            || job.service_subtype != expected_service_subtype
        {
            return Err(LedgerStoreError::Mismatch(format!("job {job_id} does not match the reported event")));
        }

        tx.execute(
            "UPDATE job SET
               started_at = COALESCE($2, started_at),
               last_alive_at = COALESCE($3, last_alive_at),
               last_charged_at = COALESCE($4, last_charged_at),
               finished_at = COALESCE($5, finished_at),
               cancelled_at = COALESCE($6, cancelled_at),
               usage_params = COALESCE($7, usage_params)
             WHERE id = $1",
            &[
                &job_id,
                &update.started_at,
                &update.last_alive_at,
                &update.last_charged_at,
                &update.finished_at,
                &update.cancelled_at,
                &update.usage_params,
            ],
        )
        .await
        .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let row = tx
            .query_opt("SELECT * FROM job WHERE id = $1", &[&job_id])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .ok_or_else(|| LedgerStoreError::NotFound(format!("job {job_id}")))?;
        let job = Self::map_job_row(&row)?;
        tx.commit().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        Ok(job)
    }

    async fn find_open_storage_job(&self, proj_id: AccountId) -> Result<Option<Job>, LedgerStoreError> {
        let client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let row = client
            .query_opt(
                "SELECT * FROM job WHERE proj_id = $1 AND service_type = 'STORAGE' AND finished_at IS NULL",
                &[&proj_id],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        row.as_ref().map(Self::map_job_row).transpose()
    }

    async fn list_oneshot_to_be_charged(&self, min_datetime: Option<DateTime<Utc>>) -> Result<Vec<Job>, LedgerStoreError> {
        let client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let rows = client
            .query(
                "SELECT * FROM job WHERE service_type = 'ONESHOT' AND started_at IS NOT NULL
                   AND finished_at IS NOT NULL AND last_charged_at IS NULL
                   AND ($1::timestamptz IS NULL OR started_at >= $1)",
                &[&min_datetime],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        rows.iter().map(Self::map_job_row).collect()
    }

    async fn list_longrun_to_be_charged(&self, min_datetime: Option<DateTime<Utc>>) -> Result<Vec<Job>, LedgerStoreError> {
        let client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let rows = client
            .query(
                "SELECT * FROM job WHERE service_type = 'LONGRUN' AND started_at IS NOT NULL
                   AND (last_charged_at IS NULL OR finished_at IS NULL OR last_charged_at <> finished_at)
                   AND ($1::timestamptz IS NULL OR started_at >= $1)",
                &[&min_datetime],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        rows.iter().map(Self::map_job_row).collect()
    }

    async fn list_storage_finished_unsettled(&self, min_datetime: Option<DateTime<Utc>>) -> Result<Vec<Job>, LedgerStoreError> {
        let client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let rows = client
            .query(
                "SELECT * FROM job WHERE service_type = 'STORAGE' AND finished_at IS NOT NULL
                   AND (last_charged_at IS NULL OR last_charged_at <> finished_at)
                   AND ($1::timestamptz IS NULL OR started_at >= $1)",
                &[&min_datetime],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        rows.iter().map(Self::map_job_row).collect()
    }

    async fn list_storage_running(&self) -> Result<Vec<Job>, LedgerStoreError> {
        let client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let rows = client
            .query("SELECT * FROM job WHERE service_type = 'STORAGE' AND finished_at IS NULL", &[])
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        rows.iter().map(Self::map_job_row).collect()
    }

    async fn list_jobs_for_proj(&self, proj_id: AccountId, page: u32, page_size: u32) -> Result<Vec<Job>, LedgerStoreError> {
        let client = self.db.get().await.map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let offset = i64::from(page.saturating_sub(1)) * i64::from(page_size);
        let rows = client
            .query(
                "SELECT * FROM job WHERE proj_id = $1
                   ORDER BY COALESCE(reserved_at, started_at) DESC NULLS LAST
                   LIMIT $2 OFFSET $3",
                &[&proj_id, &i64::from(page_size), &offset],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        rows.iter().map(Self::map_job_row).collect()
    }
}
