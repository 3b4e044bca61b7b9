use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::RuntimeDb;
use crate::types::{AccountId, ServiceSubtype, ServiceType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub id: i64,
    pub service_type: ServiceType,
    pub service_subtype: ServiceSubtype,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub fixed_cost: Decimal,
    pub multiplier: Decimal,
    pub vlab_id: Option<AccountId>,
}

#[derive(Error, Debug)]
pub enum PriceStoreError {
    #[error("no price found for ({service_type:?}, {service_subtype}) at the given time")]
    NotFound {
        service_type: ServiceType,
        service_subtype: ServiceSubtype,
    },
    #[error("db error: {0}")]
    Db(String),
}

/// Time-versioned price records keyed by (service_type, service_subtype,
/// optional vlab). Resolution rule is in §3/§4.9: vlab-specific first,
/// falling back to the default (vlab_id = NULL), newest valid_from wins.
#[async_trait]
pub trait PriceStore: Send + Sync {
    async fn create_price(&self, price: NewPrice) -> Result<Price, PriceStoreError>;
    async fn get_price(
        &self,
        vlab_id: AccountId,
        service_type: ServiceType,
        service_subtype: &str,
        at: DateTime<Utc>,
    ) -> Result<Price, PriceStoreError>;
}

#[derive(Debug, Clone)]
pub struct NewPrice {
    pub service_type: ServiceType,
    pub service_subtype: ServiceSubtype,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub fixed_cost: Decimal,
    pub multiplier: Decimal,
    pub vlab_id: Option<AccountId>,
}

pub fn memory() -> Arc<dyn PriceStore> {
    Arc::new(MemoryPriceStore::default())
}

pub fn postgres(db: Arc<RuntimeDb>) -> Arc<dyn PriceStore> {
    Arc::new(PostgresPriceStore { db })
}

#[derive(Default)]
pub struct MemoryPriceStore {
    inner: Mutex<MemoryPriceStoreInner>,
}

#[derive(Default)]
struct MemoryPriceStoreInner {
    prices: HashMap<i64, Price>,
    next_id: i64,
}

fn resolve_best(
    candidates: impl Iterator<Item = Price>,
    service_type: ServiceType,
    service_subtype: &str,
    at: DateTime<Utc>,
    vlab_id: Option<AccountId>,
) -> Option<Price> {
    candidates
        .filter(|price| {
            price.service_type == service_type
                && price.service_subtype == service_subtype
                && price.vlab_id == vlab_id
                && price.valid_from <= at
                && price.valid_to.is_none_or(|valid_to| valid_to > at)
        })
        .max_by_key(|price| price.valid_from)
}

#[async_trait]
impl PriceStore for MemoryPriceStore {
    async fn create_price(&self, price: NewPrice) -> Result<Price, PriceStoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let stored = Price {
            id: inner.next_id,
            service_type: price.service_type,
            service_subtype: price.service_subtype,
            valid_from: price.valid_from,
            valid_to: price.valid_to,
            fixed_cost: price.fixed_cost,
            multiplier: price.multiplier,
            vlab_id: price.vlab_id,
        };
        inner.prices.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_price(
        &self,
        vlab_id: AccountId,
        service_type: ServiceType,
        service_subtype: &str,
        at: DateTime<Utc>,
    ) -> Result<Price, PriceStoreError> {
        let inner = self.inner.lock().unwrap();
        if let Some(price) = resolve_best(
            inner.prices.values().cloned(),
            service_type,
            service_subtype,
            at,
            Some(vlab_id),
        ) {
            return Ok(price);
        }
        resolve_best(inner.prices.values().cloned(), service_type, service_subtype, at, None).ok_or_else(|| {
            PriceStoreError::NotFound {
                service_type,
                service_subtype: service_subtype.to_string(),
            }
        })
    }
}

pub struct PostgresPriceStore {
    db: Arc<RuntimeDb>,
}

impl PostgresPriceStore {
    fn map_row(row: &tokio_postgres::Row) -> Result<Price, PriceStoreError> {
        let service_type_raw: String = row.try_get("service_type").map_err(|e| PriceStoreError::Db(e.to_string()))?;
        Ok(Price {
            id: row.try_get("id").map_err(|e| PriceStoreError::Db(e.to_string()))?,
            service_type: service_type_raw
                .parse()
                .map_err(|error: String| PriceStoreError::Db(error))?,
            service_subtype: row.try_get("service_subtype").map_err(|e| PriceStoreError::Db(e.to_string()))?,
            valid_from: row.try_get("valid_from").map_err(|e| PriceStoreError::Db(e.to_string()))?,
            valid_to: row.try_get("valid_to").map_err(|e| PriceStoreError::Db(e.to_string()))?,
            fixed_cost: row.try_get("fixed_cost").map_err(|e| PriceStoreError::Db(e.to_string()))?,
            multiplier: row.try_get("multiplier").map_err(|e| PriceStoreError::Db(e.to_string()))?,
            vlab_id: row.try_get("vlab_id").map_err(|e| PriceStoreError::Db(e.to_string()))?,
        })
    }

    async fn query_best(
        &self,
        service_type: ServiceType,
        service_subtype: &str,
        at: DateTime<Utc>,
        vlab_id: Option<AccountId>,
    ) -> Result<Option<Price>, PriceStoreError> {
        let client = self.db.get().await.map_err(|error| PriceStoreError::Db(error.to_string()))?;
        let row = client
            .query_opt(
                "SELECT * FROM price
                 WHERE service_type = $1 AND service_subtype = $2
                   AND vlab_id IS NOT DISTINCT FROM $3
                   AND valid_from <= $4 AND (valid_to IS NULL OR valid_to > $4)
                 ORDER BY valid_from DESC
                 LIMIT 1",
                &[&service_type.as_str(), &service_subtype, &vlab_id, &at],
            )
            .await
            .map_err(|error| PriceStoreError::Db(error.to_string()))?;
        row.as_ref().map(Self::map_row).transpose()
    }
}

#[async_trait]
impl PriceStore for PostgresPriceStore {
    async fn create_price(&self, price: NewPrice) -> Result<Price, PriceStoreError> {
        let client = self.db.get().await.map_err(|error| PriceStoreError::Db(error.to_string()))?;
        let row = client
            .query_one(
                "INSERT INTO price (service_type, service_subtype, valid_from, valid_to, fixed_cost, multiplier, vlab_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
                &[
                    &price.service_type.as_str(),
                    &price.service_subtype,
                    &price.valid_from,
                    &price.valid_to,
                    &price.fixed_cost,
                    &price.multiplier,
                    &price.vlab_id,
                ],
            )
            .await
            .map_err(|error| PriceStoreError::Db(error.to_string()))?;
        Self::map_row(&row)
    }

    async fn get_price(
        &self,
        vlab_id: AccountId,
        service_type: ServiceType,
        service_subtype: &str,
        at: DateTime<Utc>,
    ) -> Result<Price, PriceStoreError> {
        if let Some(price) = self.query_best(service_type, service_subtype, at, Some(vlab_id)).await? {
            return Ok(price);
        }
        self.query_best(service_type, service_subtype, at, None)
            .await?
            .ok_or_else(|| PriceStoreError::NotFound {
                service_type,
                service_subtype: service_subtype.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn newest_valid_from_wins_within_vlab() {
        let store = memory();
        let vlab_id = uuid::Uuid::new_v4();
        let now = Utc::now();
        store
            .create_price(NewPrice {
                service_type: ServiceType::Oneshot,
                service_subtype: "cpu".to_string(),
                valid_from: now - Duration::days(10),
                valid_to: None,
                fixed_cost: Decimal::ZERO,
                multiplier: Decimal::new(1, 5),
                vlab_id: Some(vlab_id),
            })
            .await
            .unwrap();
        store
            .create_price(NewPrice {
                service_type: ServiceType::Oneshot,
                service_subtype: "cpu".to_string(),
                valid_from: now - Duration::days(1),
                valid_to: None,
                fixed_cost: Decimal::ZERO,
                multiplier: Decimal::new(2, 5),
                vlab_id: Some(vlab_id),
            })
            .await
            .unwrap();

        let price = store.get_price(vlab_id, ServiceType::Oneshot, "cpu", now).await.unwrap();
        assert_eq!(price.multiplier, Decimal::new(2, 5));
    }

    #[tokio::test]
    async fn falls_back_to_default_price() {
        let store = memory();
        let vlab_id = uuid::Uuid::new_v4();
        let now = Utc::now();
        store
            .create_price(NewPrice {
                service_type: ServiceType::Storage,
                service_subtype: "standard".to_string(),
                valid_from: now - Duration::days(30),
                valid_to: None,
                fixed_cost: Decimal::ZERO,
                multiplier: Decimal::new(23, 5),
                vlab_id: None,
            })
            .await
            .unwrap();

        let price = store
            .get_price(vlab_id, ServiceType::Storage, "standard", now)
            .await
            .unwrap();
        assert!(price.vlab_id.is_none());
    }

    #[tokio::test]
    async fn missing_price_is_not_found() {
        let store = memory();
        let error = store
            .get_price(uuid::Uuid::new_v4(), ServiceType::Oneshot, "gpu", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(error, PriceStoreError::NotFound { .. }));
    }
}
