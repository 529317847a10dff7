use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::contract::{Contract, EntryType, Trigger};
use crate::models::{AccountInfo, PendingAction, PositionStatus, Side, StrategyRecord};

/// One row of the strategy listing
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StrategySummary {
    pub uuid: Uuid,
    pub symbol: String,
    pub side: Side,
    pub exchange: String,
    pub margin: Decimal,
    /// `margin / collateral`, one decimal
    pub leverage: Option<Decimal>,
    pub enabled: bool,
    pub position_status: PositionStatus,
    pub entry_type: Option<EntryType>,
    /// Entry trigger price right now
    pub buy_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    /// Fill price of the open position
    pub entry_price: Option<Decimal>,
    pub pending_action: Option<PendingAction>,
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StrategyListing {
    pub strategies: Vec<StrategySummary>,
    /// Set when the exchange could not be asked for the account
    pub warning: Option<String>,
    /// Strategies whose stored documents do not decode; reset or delete them
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unreadable: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StrategyView {
    #[serde(flatten)]
    pub summary: StrategySummary,
    pub params: Value,
    pub exchange_orders_details: Value,
    pub last_position_opened: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AccountOverview {
    pub exchange: String,
    pub collateral: Decimal,
    pub leverage: Decimal,
    pub total_margin: Decimal,
    pub available_margin: Decimal,
}

impl AccountOverview {
    pub fn new(exchange: &str, account: &AccountInfo) -> Self {
        Self {
            exchange: exchange.to_string(),
            collateral: account.collateral,
            leverage: account.leverage,
            total_margin: account.collateral * account.leverage,
            available_margin: account.free_collateral * account.leverage,
        }
    }
}

/// Raw engine answers; a failed call shows its error text instead
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngineDiagnostics {
    pub ping: String,
    pub status: String,
    pub list: String,
}

pub fn leverage(margin: Decimal, account: Option<&AccountInfo>) -> Option<Decimal> {
    let collateral = account?.collateral;
    if collateral.is_zero() {
        return None;
    }
    Some((margin / collateral).round_dp(1))
}

fn price_now(strategy: &StrategyRecord, trigger: &Trigger, now: DateTime<Utc>) -> Option<Decimal> {
    match trigger.price_at(now) {
        Ok(price) => Some(price),
        Err(e) => {
            tracing::warn!("strategy {}: {}", strategy.uuid, e);
            None
        }
    }
}

pub fn summarize(strategy: &StrategyRecord, account: Option<&AccountInfo>, now: DateTime<Utc>) -> StrategySummary {
    let contract = match Contract::from_params(strategy.side, &strategy.params) {
        Ok(contract) => Some(contract),
        Err(e) => {
            tracing::warn!("strategy {} has invalid params: {}", strategy.uuid, e);
            None
        }
    };
    let entry_price = strategy.exchange_orders_details.entry_price();

    let stop_loss_price = contract.as_ref().and_then(|c| {
        let stop_loss = c.stop_loss_order.as_ref()?;
        match stop_loss.trigger() {
            Some(trigger) => price_now(strategy, trigger, now),
            None => entry_price.and_then(|fill| stop_loss.price_for_fill(strategy.side, fill)),
        }
    });

    StrategySummary {
        uuid: strategy.uuid,
        symbol: strategy.symbol.clone(),
        side: strategy.side,
        exchange: strategy.exchange.clone(),
        margin: strategy.margin,
        leverage: leverage(strategy.margin, account),
        enabled: strategy.enabled,
        position_status: strategy.position_status,
        entry_type: contract.as_ref().map(|c| c.entry_type),
        buy_price: contract
            .as_ref()
            .and_then(|c| price_now(strategy, &c.entry_order.trigger, now)),
        stop_loss_price,
        take_profit_price: contract
            .as_ref()
            .and_then(|c| c.take_profit_order.as_ref())
            .and_then(|tp| price_now(strategy, &tp.trigger, now)),
        entry_price,
        pending_action: strategy.pending_action,
        comment: strategy.comment.clone(),
    }
}

pub fn view(strategy: &StrategyRecord, account: Option<&AccountInfo>, now: DateTime<Utc>) -> StrategyView {
    StrategyView {
        summary: summarize(strategy, account, now),
        params: strategy.params.to_document(),
        exchange_orders_details: serde_json::to_value(&strategy.exchange_orders_details).unwrap_or(Value::Null),
        last_position_opened: strategy
            .last_position_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never opened".to_string()),
        created_at: strategy.created_at,
        updated_at: strategy.updated_at,
    }
}
