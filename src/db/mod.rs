// Strategy persistence
pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::contract::ContractParams;
use crate::models::{ExchangeOrdersDetails, NewStrategy, PendingAction, PositionStatus, StrategyRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored row that does not decode into a valid record
    #[error("corrupt strategy {uuid}: {reason}")]
    Corrupt { uuid: Uuid, reason: String },

    #[error("strategy {0} not found")]
    NotFound(Uuid),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Lifecycle columns of a strategy, readable even when its JSON documents are not
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyState {
    pub enabled: bool,
    /// `None` when the stored code is not a known status
    pub position_status: Option<PositionStatus>,
}

impl StrategyState {
    pub fn is_idle(&self) -> bool {
        !self.enabled && self.position_status == Some(PositionStatus::Closed)
    }
}

/// One owner's strategies. Rows that fail to decode are named instead of failing the lot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OwnedStrategies {
    pub records: Vec<StrategyRecord>,
    pub unreadable: Vec<Uuid>,
}

/// Fields to overwrite in a single write. `None` leaves a column as it is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyPatch {
    pub enabled: Option<bool>,
    pub position_status: Option<PositionStatus>,
    pub params: Option<ContractParams>,
    pub exchange_orders_details: Option<ExchangeOrdersDetails>,
    pub margin: Option<Decimal>,
    pub comment: Option<String>,
    /// `Some(None)` clears the marker
    pub pending_action: Option<Option<PendingAction>>,
}

impl StrategyPatch {
    /// Enabled flag only
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }

    pub fn pending_action(action: Option<PendingAction>) -> Self {
        Self {
            pending_action: Some(action),
            ..Self::default()
        }
    }

    /// Disabled, CLOSED, no orders, no marker. `params` is the caller's cleaned
    /// copy when the trendline stop-loss trigger had to be dropped.
    pub fn closed(params: Option<ContractParams>) -> Self {
        Self {
            enabled: Some(false),
            position_status: Some(PositionStatus::Closed),
            params,
            exchange_orders_details: Some(ExchangeOrdersDetails::default()),
            pending_action: Some(None),
            ..Self::default()
        }
    }

    pub fn apply_to(&self, record: &mut StrategyRecord) {
        if let Some(enabled) = self.enabled {
            record.enabled = enabled;
        }
        if let Some(status) = self.position_status {
            record.position_status = status;
        }
        if let Some(params) = &self.params {
            record.params = params.clone();
        }
        if let Some(details) = &self.exchange_orders_details {
            record.exchange_orders_details = details.clone();
        }
        if let Some(margin) = self.margin {
            record.margin = margin;
        }
        if let Some(comment) = &self.comment {
            record.comment = comment.clone();
        }
        if let Some(action) = self.pending_action {
            record.pending_action = action;
        }
    }

    /// Whether writing this patch would change `record`
    pub fn changes(&self, record: &StrategyRecord) -> bool {
        let mut patched = record.clone();
        self.apply_to(&mut patched);
        patched != *record
    }
}

#[async_trait]
pub trait StrategyStore: Send + Sync {
    /// The strategy with `uuid`, if it belongs to `owner_uuid`
    async fn find_owned(&self, owner_uuid: Uuid, uuid: Uuid) -> StoreResult<Option<StrategyRecord>>;

    /// Enabled first, then by position status (UNKNOWN, OPENED, CLOSED)
    async fn list_by_owner(&self, owner_uuid: Uuid) -> StoreResult<OwnedStrategies>;

    /// Like `find_owned`, without decoding params or order details
    async fn find_state(&self, owner_uuid: Uuid, uuid: Uuid) -> StoreResult<Option<StrategyState>>;

    /// Symbols open for new strategies on `exchange`
    async fn enabled_symbols(&self, exchange: &str) -> StoreResult<Vec<String>>;

    async fn insert(&self, strategy: NewStrategy) -> StoreResult<StrategyRecord>;

    /// Apply `patch` in one statement and return the updated record
    async fn apply(&self, uuid: Uuid, patch: &StrategyPatch) -> StoreResult<StrategyRecord>;

    /// Apply `patch` without reading the record back
    async fn write(&self, uuid: Uuid, patch: &StrategyPatch) -> StoreResult<()>;

    async fn delete(&self, uuid: Uuid) -> StoreResult<()>;
}
