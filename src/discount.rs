use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::RuntimeDb;
use crate::types::AccountId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discount {
    pub id: i64,
    pub vlab_id: AccountId,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub discount: Decimal,
}

#[derive(Debug, Clone)]
pub struct NewDiscount {
    pub vlab_id: AccountId,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub discount: Decimal,
}

#[derive(Error, Debug)]
pub enum DiscountStoreError {
    #[error("db error: {0}")]
    Db(String),
}

/// Time-versioned per-vlab multiplicative discount (§3/§4.9).
#[async_trait]
pub trait DiscountStore: Send + Sync {
    async fn create_discount(&self, discount: NewDiscount) -> Result<Discount, DiscountStoreError>;
    async fn get_current_discount(&self, vlab_id: AccountId, at: DateTime<Utc>) -> Result<Option<Discount>, DiscountStoreError>;
    async fn list_discounts(&self, vlab_id: AccountId) -> Result<Vec<Discount>, DiscountStoreError>;
}

pub fn memory() -> Arc<dyn DiscountStore> {
    Arc::new(MemoryDiscountStore::default())
}

pub fn postgres(db: Arc<RuntimeDb>) -> Arc<dyn DiscountStore> {
    Arc::new(PostgresDiscountStore { db })
}

#[derive(Default)]
pub struct MemoryDiscountStore {
    inner: Mutex<MemoryDiscountStoreInner>,
}

#[derive(Default)]
struct MemoryDiscountStoreInner {
    discounts: HashMap<i64, Discount>,
    next_id: i64,
}

#[async_trait]
impl DiscountStore for MemoryDiscountStore {
    async fn create_discount(&self, discount: NewDiscount) -> Result<Discount, DiscountStoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let stored = Discount {
            id: inner.next_id,
            vlab_id: discount.vlab_id,
            valid_from: discount.valid_from,
            valid_to: discount.valid_to,
            discount: discount.discount,
        };
        inner.discounts.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_current_discount(&self, vlab_id: AccountId, at: DateTime<Utc>) -> Result<Option<Discount>, DiscountStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .discounts
            .values()
            .filter(|discount| {
                discount.vlab_id == vlab_id
                    && discount.valid_from <= at
                    && discount.valid_to.is_none_or(|valid_to| valid_to > at)
            })
            .max_by_key(|discount| (discount.valid_from, discount.id))
            .cloned())
    }

    async fn list_discounts(&self, vlab_id: AccountId) -> Result<Vec<Discount>, DiscountStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.discounts.values().filter(|d| d.vlab_id == vlab_id).cloned().collect())
    }
}

pub struct PostgresDiscountStore {
    db: Arc<RuntimeDb>,
}

impl PostgresDiscountStore {
    fn map_row(row: &tokio_postgres::Row) -> Result<Discount, DiscountStoreError> {
        Ok(Discount {
            id: row.try_get("id").map_err(|e| DiscountStoreError::Db(e.to_string()))?,
            vlab_id: row.try_get("vlab_id").map_err(|e| DiscountStoreError::Db(e.to_string()))?,
            valid_from: row.try_get("valid_from").map_err(|e| DiscountStoreError::Db(e.to_string()))?,
            valid_to: row.try_get("valid_to").map_err(|e| DiscountStoreError::Db(e.to_string()))?,
            discount: row.try_get("discount").map_err(|e| DiscountStoreError::Db(e.to_string()))?,
        })
    }
}

#[async_trait]
impl DiscountStore for PostgresDiscountStore {
    async fn create_discount(&self, discount: NewDiscount) -> Result<Discount, DiscountStoreError> {
        let client = self.db.get().await.map_err(|error| DiscountStoreError::Db(error.to_string()))?;
        let row = client
            .query_one(
                "INSERT INTO discount (vlab_id, valid_from, valid_to, discount) VALUES ($1, $2, $3, $4) RETURNING *",
                &[&discount.vlab_id, &discount.valid_from, &discount.valid_to, &discount.discount],
            )
            .await
            .map_err(|error| DiscountStoreError::Db(error.to_string()))?;
        Self::map_row(&row)
    }

    async fn get_current_discount(&self, vlab_id: AccountId, at: DateTime<Utc>) -> Result<Option<Discount>, DiscountStoreError> {
        let client = self.db.get().await.map_err(|error| DiscountStoreError::Db(error.to_string()))?;
        let row = client
            .query_opt(
                "SELECT * FROM discount WHERE vlab_id = $1 AND valid_from <= $2 AND (valid_to IS NULL OR valid_to > $2)
                 ORDER BY valid_from DESC, id DESC LIMIT 1",
                &[&vlab_id, &at],
            )
            .await
            .map_err(|error| DiscountStoreError::Db(error.to_string()))?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_discounts(&self, vlab_id: AccountId) -> Result<Vec<Discount>, DiscountStoreError> {
        let client = self.db.get().await.map_err(|error| DiscountStoreError::Db(error.to_string()))?;
        let rows = client
            .query("SELECT * FROM discount WHERE vlab_id = $1 ORDER BY valid_from DESC", &[&vlab_id])
            .await
            .map_err(|error| DiscountStoreError::Db(error.to_string()))?;
        rows.iter().map(Self::map_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn newest_valid_from_then_id_wins() {
        let store = memory();
        let vlab_id = uuid::Uuid::new_v4();
        let now = Utc::now();
        store
            .create_discount(NewDiscount {
                vlab_id,
                valid_from: now - chrono::Duration::days(1),
                valid_to: None,
                discount: Decimal::new(10, 2),
            })
            .await
            .unwrap();
        let second = store
            .create_discount(NewDiscount {
                vlab_id,
                valid_from: now - chrono::Duration::days(1),
                valid_to: None,
                discount: Decimal::new(20, 2),
            })
            .await
            .unwrap();

        let resolved = store.get_current_discount(vlab_id, now).await.unwrap().unwrap();
        assert_eq!(resolved.id, second.id);
        assert_eq!(resolved.discount, Decimal::new(20, 2));
    }
}
