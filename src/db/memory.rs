use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{OwnedStrategies, StoreError, StoreResult, StrategyPatch, StrategyState, StrategyStore};
use crate::models::{ExchangeOrdersDetails, NewStrategy, PositionStatus, StrategyRecord};

/// Strategy store kept in process memory, for paper runs and tests
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<Vec<StrategyRecord>>,
    symbols: RwLock<HashMap<String, Vec<String>>>,
    /// Record uuid to the document column that no longer decodes
    unreadable: RwLock<HashMap<Uuid, Column>>,
    writes: AtomicUsize,
}

/// JSON document column of a stored strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Params,
    ExchangeOrdersDetails,
}

impl Column {
    fn overwritten_by(self, patch: &StrategyPatch) -> bool {
        match self {
            Column::Params => patch.params.is_some(),
            Column::ExchangeOrdersDetails => patch.exchange_orders_details.is_some(),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_symbol(&self, exchange: &str, symbol: &str) {
        self.symbols
            .write()
            .await
            .entry(exchange.to_string())
            .or_default()
            .push(symbol.to_string());
    }

    /// Put a record in place as-is, e.g. one the engine has already opened
    pub async fn seed(&self, record: StrategyRecord) {
        let mut records = self.records.write().await;
        records.retain(|r| r.uuid != record.uuid);
        records.push(record);
    }

    pub async fn get(&self, uuid: Uuid) -> Option<StrategyRecord> {
        self.records.read().await.iter().find(|r| r.uuid == uuid).cloned()
    }

    /// Make the record fail to decode until `column` is overwritten
    pub async fn corrupt(&self, uuid: Uuid, column: Column) {
        self.unreadable.write().await.insert(uuid, column);
    }

    async fn check_readable(&self, uuid: Uuid) -> StoreResult<()> {
        match self.unreadable.read().await.get(&uuid) {
            Some(column) => Err(StoreError::Corrupt {
                uuid,
                reason: format!("{:?} does not decode", column),
            }),
            None => Ok(()),
        }
    }

    /// Patch in place, forgetting corruption of the columns the patch overwrites
    async fn patch(&self, uuid: Uuid, patch: &StrategyPatch) -> StoreResult<StrategyRecord> {
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|r| r.uuid == uuid)
            .ok_or(StoreError::NotFound(uuid))?;

        patch.apply_to(record);
        record.updated_at = Utc::now();
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut unreadable = self.unreadable.write().await;
        if unreadable.get(&uuid).is_some_and(|column| column.overwritten_by(patch)) {
            unreadable.remove(&uuid);
        }
        Ok(record.clone())
    }

    /// Number of insert, update and delete statements executed
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StrategyStore for MemoryStore {
    async fn find_owned(&self, owner_uuid: Uuid, uuid: Uuid) -> StoreResult<Option<StrategyRecord>> {
        let found = self
            .records
            .read()
            .await
            .iter()
            .find(|r| r.uuid == uuid && r.owner_uuid == owner_uuid)
            .cloned();
        if found.is_some() {
            self.check_readable(uuid).await?;
        }
        Ok(found)
    }

    async fn list_by_owner(&self, owner_uuid: Uuid) -> StoreResult<OwnedStrategies> {
        let unreadable = self.unreadable.read().await.clone();
        let (mut records, skipped): (Vec<StrategyRecord>, Vec<StrategyRecord>) = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.owner_uuid == owner_uuid)
            .cloned()
            .partition(|r| !unreadable.contains_key(&r.uuid));

        records.sort_by(|a, b| {
            b.enabled
                .cmp(&a.enabled)
                .then(b.position_status.code().cmp(&a.position_status.code()))
                .then(a.id.cmp(&b.id))
        });
        Ok(OwnedStrategies {
            records,
            unreadable: skipped.into_iter().map(|r| r.uuid).collect(),
        })
    }

    async fn find_state(&self, owner_uuid: Uuid, uuid: Uuid) -> StoreResult<Option<StrategyState>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .find(|r| r.uuid == uuid && r.owner_uuid == owner_uuid)
            .map(|r| StrategyState {
                enabled: r.enabled,
                position_status: Some(r.position_status),
            }))
    }

    async fn enabled_symbols(&self, exchange: &str) -> StoreResult<Vec<String>> {
        Ok(self.symbols.read().await.get(exchange).cloned().unwrap_or_default())
    }

    async fn insert(&self, strategy: NewStrategy) -> StoreResult<StrategyRecord> {
        let mut records = self.records.write().await;
        let now = Utc::now();
        let record = StrategyRecord {
            id: records.iter().map(|r| r.id).max().unwrap_or(0) + 1,
            uuid: strategy.uuid,
            owner_uuid: strategy.owner_uuid,
            symbol: strategy.symbol,
            side: strategy.side,
            margin: strategy.margin,
            exchange: strategy.exchange,
            enabled: false,
            position_status: PositionStatus::Closed,
            params: strategy.params,
            exchange_orders_details: ExchangeOrdersDetails::default(),
            comment: strategy.comment,
            pending_action: None,
            last_position_at: None,
            created_at: now,
            updated_at: now,
        };
        records.push(record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn apply(&self, uuid: Uuid, patch: &StrategyPatch) -> StoreResult<StrategyRecord> {
        let record = self.patch(uuid, patch).await?;
        self.check_readable(uuid).await?;
        Ok(record)
    }

    async fn write(&self, uuid: Uuid, patch: &StrategyPatch) -> StoreResult<()> {
        self.patch(uuid, patch).await.map(|_| ())
    }

    async fn delete(&self, uuid: Uuid) -> StoreResult<()> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.uuid != uuid);
        if records.len() == before {
            return Err(StoreError::NotFound(uuid));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
