use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::contract::ContractParams;

/// Direction of the futures position a strategy opens
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Short,
    Long,
}

impl Side {
    /// Persisted encoding (0: short, 1: long)
    pub fn code(self) -> i16 {
        match self {
            Side::Short => 0,
            Side::Long => 1,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Side::Short),
            1 => Some(Side::Long),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Short => write!(f, "SHORT"),
            Side::Long => write!(f, "LONG"),
        }
    }
}

/// Whether the strategy currently holds a position on the exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Closed,
    Opened,
    /// Exchange state could not be trusted; needs manual confirmation and a reset
    Unknown,
}

impl PositionStatus {
    /// Persisted encoding (0: closed, 1: opened, 2: unknown)
    pub fn code(self) -> i16 {
        match self {
            PositionStatus::Closed => 0,
            PositionStatus::Opened => 1,
            PositionStatus::Unknown => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(PositionStatus::Closed),
            1 => Some(PositionStatus::Opened),
            2 => Some(PositionStatus::Unknown),
            _ => None,
        }
    }
}

/// Intent recorded before exchange calls start, cleared by the commit write.
///
/// A record still carrying one after the request finished means the process died
/// between the exchange calls and the commit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingAction {
    ClosingPosition,
    ReplacingStopLoss,
}

impl PendingAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PendingAction::ClosingPosition => "closing_position",
            PendingAction::ReplacingStopLoss => "replacing_stop_loss",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "closing_position" => Some(PendingAction::ClosingPosition),
            "replacing_stop_loss" => Some(PendingAction::ReplacingStopLoss),
            _ => None,
        }
    }
}

/// Filled entry order as recorded by the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryOrderDetails {
    pub price: Decimal,
    pub size: Decimal,
    /// Keys the engine writes that this crate does not interpret
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Live stop order on the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopOrderDetails {
    pub order_id: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StopOrderDetails {
    pub fn new(order_id: i64) -> Self {
        Self {
            order_id,
            extra: serde_json::Map::new(),
        }
    }
}

/// Orders that actually exist on the exchange for a strategy.
///
/// Empty whenever no position is open.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExchangeOrdersDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_order: Option<EntryOrderDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_order: Option<StopOrderDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_order: Option<serde_json::Value>,
}

impl ExchangeOrdersDetails {
    pub fn is_empty(&self) -> bool {
        self.entry_order.is_none() && self.stop_loss_order.is_none() && self.take_profit_order.is_none()
    }

    pub fn stop_loss_order_id(&self) -> Option<i64> {
        self.stop_loss_order.as_ref().map(|order| order.order_id)
    }

    pub fn entry_price(&self) -> Option<Decimal> {
        self.entry_order.as_ref().map(|order| order.price)
    }
}

/// A persisted strategy
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StrategyRecord {
    pub id: i64,
    pub uuid: Uuid,
    pub owner_uuid: Uuid,
    pub symbol: String, // e.g. BTC-PERP
    pub side: Side,
    pub margin: Decimal,
    pub exchange: String,
    pub enabled: bool,
    pub position_status: PositionStatus,
    pub params: ContractParams,
    pub exchange_orders_details: ExchangeOrdersDetails,
    pub comment: String,
    pub pending_action: Option<PendingAction>,
    pub last_position_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StrategyRecord {
    /// Disabled and closed: the only state in which record-level edits are allowed
    pub fn is_idle(&self) -> bool {
        !self.enabled && self.position_status == PositionStatus::Closed
    }

    /// OPENED must come with a recorded entry fill
    pub fn check_consistency(&self) -> Result<(), String> {
        if self.position_status == PositionStatus::Opened && self.exchange_orders_details.entry_order.is_none() {
            return Err(format!(
                "strategy {} is opened but has no entry order details",
                self.uuid
            ));
        }
        Ok(())
    }
}

/// Data for inserting a strategy
#[derive(Debug, Clone)]
pub struct NewStrategy {
    pub uuid: Uuid,
    pub owner_uuid: Uuid,
    pub symbol: String,
    pub side: Side,
    pub margin: Decimal,
    pub exchange: String,
    pub params: ContractParams,
    pub comment: String,
}

/// Futures account summary from the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountInfo {
    pub collateral: Decimal,
    pub leverage: Decimal,
    pub free_collateral: Decimal,
}

/// Position for one market as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionInfo {
    pub symbol: String,
    pub size: Decimal,
    #[serde(default)]
    pub entry_price: Option<Decimal>,
}

/// One fill of an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    pub order_id: i64,
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_side_and_status_codes() {
        assert_eq!(Side::from_code(Side::Long.code()), Some(Side::Long));
        assert_eq!(Side::from_code(0), Some(Side::Short));
        assert_eq!(Side::from_code(7), None);
        assert_eq!(PositionStatus::from_code(2), Some(PositionStatus::Unknown));
        assert_eq!(PositionStatus::Opened.code(), 1);
    }

    #[test]
    fn test_orders_details_keeps_engine_keys() {
        let raw = serde_json::json!({
            "entry_order": {"price": "20150.5", "size": "2.5", "order_id": 91, "fee": 0.32},
            "stop_loss_order": {"order_id": 555}
        });

        let details: ExchangeOrdersDetails = serde_json::from_value(raw).unwrap();
        assert_eq!(details.entry_price(), Some(Decimal::from_str("20150.5").unwrap()));
        assert_eq!(details.stop_loss_order_id(), Some(555));

        let back = serde_json::to_value(&details).unwrap();
        assert_eq!(back["entry_order"]["order_id"], 91);
        assert_eq!(back["entry_order"]["size"], "2.5");
        assert!(back.get("take_profit_order").is_none());
    }

    #[test]
    fn test_empty_details_serialize_to_empty_object() {
        let details = ExchangeOrdersDetails::default();
        assert!(details.is_empty());
        assert_eq!(serde_json::to_string(&details).unwrap(), "{}");
    }

    #[test]
    fn test_unparseable_entry_price_is_rejected() {
        let raw = serde_json::json!({"entry_order": {"price": "abc", "size": "1"}});
        assert!(serde_json::from_value::<ExchangeOrdersDetails>(raw).is_err());
    }

    #[test]
    fn test_pending_action_round_trip() {
        for action in [PendingAction::ClosingPosition, PendingAction::ReplacingStopLoss] {
            assert_eq!(PendingAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(PendingAction::parse("nope"), None);
    }
}
