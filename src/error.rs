use thiserror::Error;

use crate::db::StoreError;
use crate::exchange::ExchangeError;

/// Operator-facing failure of a control action.
///
/// `Display` keeps the full detail for logs. What the operator actually sees comes
/// from [`ControlError::public_message`], which hides engine and internal detail.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The strategy does not exist or belongs to someone else
    #[error("Permission denied")]
    PermissionDenied,

    /// Malformed strategy or order parameters
    #[error("{0}")]
    Validation(String),

    /// A lifecycle precondition is not met (paused, closed, opened...)
    #[error("{0}")]
    InvalidState(String),

    /// The engine is tracking the strategy, or another action holds its lock
    #[error("{0}")]
    Conflict(String),

    /// The engine could not be asked; never assumed safe
    #[error("engine unreachable: {0}")]
    EngineUnreachable(String),

    /// The exchange refused or failed a call and the operator has to look at it
    #[error("{exchange} server responded: '{message}'")]
    Exchange { exchange: String, message: String },

    /// Exchange state is uncertain; confirm it out-of-band, then reset
    #[error("{0}")]
    ManualRecovery(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ControlResult<T> = std::result::Result<T, ControlError>;

pub const PAUSE_FIRST: &str = "pause the strategy first";

impl ControlError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn engine_tracking() -> Self {
        Self::Conflict(PAUSE_FIRST.to_string())
    }

    pub fn exchange(exchange: &str, err: &ExchangeError) -> Self {
        Self::Exchange {
            exchange: exchange.to_string(),
            message: err.to_string(),
        }
    }

    /// Text safe to return to the operator
    pub fn public_message(&self) -> String {
        match self {
            Self::EngineUnreachable(_) | Self::Internal(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Refusals caused by the request itself rather than by a failing dependency
    pub fn is_operator_error(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied | Self::Validation(_) | Self::InvalidState(_) | Self::Conflict(_)
        )
    }

    /// Whether the error leaves exchange state that needs manual confirmation
    pub fn requires_manual_recovery(&self) -> bool {
        matches!(self, Self::ManualRecovery(_))
    }
}

impl From<StoreError> for ControlError {
    fn from(err: StoreError) -> Self {
        tracing::error!("strategy store failure: {}", err);
        Self::Internal(err.to_string())
    }
}
