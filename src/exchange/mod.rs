// Exchange capability consumed by the control plane
pub mod paper;
pub mod retry;

pub use paper::{PaperConnector, PaperExchange};
pub use retry::{retry, RetryPolicy};

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AccountInfo, Fill, PositionInfo, Side};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    /// Network failure, timeout or 5xx
    #[error("{0}")]
    Transient(String),

    /// The exchange answered and refused the request
    #[error("{0}")]
    Rejected(String),

    #[error("Invalid reduce-only order")]
    InvalidReduceOnly,

    #[error("order not found")]
    NotFound,

    /// The order exists but has no fills yet
    #[error("order {0} has no fills yet")]
    NotSettled(i64),
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Transient(_) | ExchangeError::NotSettled(_))
    }
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Futures account operations for one operator
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    async fn account_info(&self) -> ExchangeResult<AccountInfo>;

    async fn position(&self, symbol: &str) -> ExchangeResult<PositionInfo>;

    /// Reduce-only market order against the open position. `side` is the side of
    /// the position being closed.
    async fn close_position(&self, symbol: &str, side: Side, size: Decimal) -> ExchangeResult<i64>;

    async fn order_fills(&self, order_id: i64) -> ExchangeResult<Vec<Fill>>;

    async fn cancel_stop_order(&self, order_id: i64) -> ExchangeResult<()>;

    /// Reduce-only stop order protecting a position on `side`
    async fn place_stop_order(
        &self,
        symbol: &str,
        side: Side,
        trigger_price: Decimal,
        size: Decimal,
    ) -> ExchangeResult<i64>;
}

/// Hands out an exchange session bound to an operator's credentials
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    async fn connect(&self, exchange: &str, owner_uuid: Uuid) -> ExchangeResult<Arc<dyn Exchange>>;
}
