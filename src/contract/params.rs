use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;

use super::trigger::{Operator, Trigger, TriggerType};
use crate::error::{ControlError, ControlResult};

const FORM_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Fixed-price trigger as stored in `params`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerParams {
    pub trigger_type: TriggerType,
    pub operator: Operator,
    pub price: Decimal,
}

impl TriggerParams {
    /// Fixed `limit` trigger from operator input
    pub fn limit(operator: &str, price: &str) -> ControlResult<Self> {
        let params = Self {
            trigger_type: TriggerType::Limit,
            operator: operator.parse()?,
            price: parse_decimal("price", price)?,
        };
        params.to_trigger()?;
        Ok(params)
    }

    pub fn to_trigger(&self) -> ControlResult<Trigger> {
        Trigger::fixed(self.trigger_type, self.operator, self.price)
    }
}

/// Two-point trendline trigger as stored in `params`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendlineTriggerParams {
    pub trigger_type: TriggerType,
    pub operator: Operator,
    pub time_1: DateTime<Utc>,
    pub price_1: Decimal,
    pub time_2: DateTime<Utc>,
    pub price_2: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitEntryParams {
    pub trigger: TriggerParams,
    pub flip_operator_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendlineEntryParams {
    pub trendline_trigger: TrendlineTriggerParams,
    /// Fraction, 0.005 = 0.5%
    pub trendline_offset_percent: Decimal,
    pub flip_operator_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixedStopLossParams {
    pub trigger: TriggerParams,
}

/// Stop-loss computed from the fill price of a trendline entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToleranceStopLossParams {
    /// Fraction, 0.02 = 2%
    pub loss_tolerance_percent: Decimal,
    pub trendline_readjustment_enabled: bool,
    /// Concrete trigger once a position is open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TakeProfitParams {
    pub trigger: TriggerParams,
}

/// The stored parameter document of a strategy, one variant per `entry_type`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "entry_type", rename_all = "lowercase")]
pub enum ContractParams {
    Limit {
        entry_order: LimitEntryParams,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_loss_order: Option<FixedStopLossParams>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        take_profit_order: Option<TakeProfitParams>,
    },
    Trendline {
        entry_order: TrendlineEntryParams,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_loss_order: Option<ToleranceStopLossParams>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        take_profit_order: Option<TakeProfitParams>,
    },
}

pub const SUPPORTED_ENTRY_TYPES: [&str; 2] = ["limit", "trendline"];

impl ContractParams {
    /// Decode a raw params document. Only the shape is checked here; trigger
    /// semantics are checked by [`super::Contract::from_params`].
    pub fn from_document(document: &Value) -> ControlResult<Self> {
        let entry_type = document
            .get("entry_type")
            .and_then(Value::as_str)
            .ok_or_else(|| ControlError::validation("entry_type is missing"))?;

        if !SUPPORTED_ENTRY_TYPES.contains(&entry_type) {
            return Err(ControlError::validation(format!(
                "entry type '{}' not supported",
                entry_type
            )));
        }

        serde_json::from_value(document.clone())
            .map_err(|e| ControlError::validation(format!("invalid {} params: {}", entry_type, e)))
    }

    pub fn to_document(&self) -> Value {
        // Plain derive output; cannot fail for these types
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn entry_type_name(&self) -> &'static str {
        match self {
            ContractParams::Limit { .. } => "limit",
            ContractParams::Trendline { .. } => "trendline",
        }
    }

    pub fn take_profit(&self) -> Option<&TakeProfitParams> {
        match self {
            ContractParams::Limit { take_profit_order, .. } => take_profit_order.as_ref(),
            ContractParams::Trendline { take_profit_order, .. } => take_profit_order.as_ref(),
        }
    }

    pub fn set_take_profit(&mut self, take_profit: Option<TakeProfitParams>) {
        match self {
            ContractParams::Limit { take_profit_order, .. } => *take_profit_order = take_profit,
            ContractParams::Trendline { take_profit_order, .. } => *take_profit_order = take_profit,
        }
    }

    /// Unset the computed stop-loss trigger of a trendline entry.
    ///
    /// Returns whether anything changed. Limit entries are left alone.
    pub fn clear_trendline_stop_loss_trigger(&mut self) -> bool {
        match self {
            ContractParams::Trendline {
                stop_loss_order: Some(stop_loss),
                ..
            } => stop_loss.trigger.take().is_some(),
            _ => false,
        }
    }
}

/// Fixed trigger fields typed by an operator
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerForm {
    pub operator: String,
    pub price: String,
}

impl TriggerForm {
    pub fn to_params(&self) -> ControlResult<TriggerParams> {
        TriggerParams::limit(&self.operator, &self.price)
    }

    fn to_document(&self) -> Value {
        json!({
            "trigger_type": "limit",
            "operator": self.operator.trim(),
            "price": self.price.trim(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopLossForm {
    /// Used by limit entries
    pub trigger: Option<TriggerForm>,
    /// Percent, "2" = 2%; used by trendline entries
    pub loss_tolerance_percent: Option<String>,
    pub trendline_readjustment_enabled: bool,
}

/// Operator input for a new strategy, before it becomes a params document
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContractForm {
    pub entry_type: String,
    pub entry_operator: String,
    /// Limit entries
    pub entry_price: Option<String>,
    /// Trendline entries, `YYYY-MM-DD HH:MM` in UTC
    pub time_1: Option<String>,
    pub price_1: Option<String>,
    pub time_2: Option<String>,
    pub price_2: Option<String>,
    /// Percent, "0.5" = 0.5%
    pub trendline_offset_percent: Option<String>,
    pub flip_operator_enabled: bool,
    pub stop_loss: Option<StopLossForm>,
    pub take_profit: Option<TriggerForm>,
}

impl ContractForm {
    /// Build the raw params document the way it is stored
    pub fn to_document(&self) -> ControlResult<Value> {
        let mut document = match self.entry_type.as_str() {
            "limit" => self.limit_document()?,
            "trendline" => self.trendline_document()?,
            other => {
                return Err(ControlError::validation(format!(
                    "entry type '{}' not supported",
                    other
                )))
            }
        };

        if let Some(take_profit) = &self.take_profit {
            document["take_profit_order"] = json!({ "trigger": take_profit.to_document() });
        }

        Ok(document)
    }

    fn limit_document(&self) -> ControlResult<Value> {
        let price = required("entry price", &self.entry_price)?;
        let mut document = json!({
            "entry_type": "limit",
            "entry_order": {
                "trigger": {
                    "trigger_type": "limit",
                    "operator": self.entry_operator.trim(),
                    "price": price,
                },
                "flip_operator_enabled": self.flip_operator_enabled,
            },
        });

        if let Some(stop_loss) = &self.stop_loss {
            let trigger = stop_loss
                .trigger
                .as_ref()
                .ok_or_else(|| ControlError::validation("stop-loss price is missing"))?;
            document["stop_loss_order"] = json!({ "trigger": trigger.to_document() });
        }

        Ok(document)
    }

    fn trendline_document(&self) -> ControlResult<Value> {
        let time_1 = parse_form_time("time_1", required("time_1", &self.time_1)?)?;
        let time_2 = parse_form_time("time_2", required("time_2", &self.time_2)?)?;
        let offset = percent_to_fraction(
            "trendline_offset_percent",
            required("trendline_offset_percent", &self.trendline_offset_percent)?,
        )?;

        let mut document = json!({
            "entry_type": "trendline",
            "entry_order": {
                "trendline_trigger": {
                    "trigger_type": "line",
                    "operator": self.entry_operator.trim(),
                    "time_1": time_1.to_rfc3339(),
                    "price_1": required("price_1", &self.price_1)?,
                    "time_2": time_2.to_rfc3339(),
                    "price_2": required("price_2", &self.price_2)?,
                },
                "trendline_offset_percent": offset.to_string(),
                "flip_operator_enabled": self.flip_operator_enabled,
            },
        });

        if let Some(stop_loss) = &self.stop_loss {
            let tolerance = percent_to_fraction(
                "loss_tolerance_percent",
                required("loss_tolerance_percent", &stop_loss.loss_tolerance_percent)?,
            )?;
            document["stop_loss_order"] = json!({
                "loss_tolerance_percent": tolerance.to_string(),
                "trendline_readjustment_enabled": stop_loss.trendline_readjustment_enabled,
            });
        }

        Ok(document)
    }
}

fn required<'a>(field: &str, value: &'a Option<String>) -> ControlResult<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ControlError::validation(format!("{} is missing", field))),
    }
}

fn parse_decimal(field: &str, value: &str) -> ControlResult<Decimal> {
    Decimal::from_str(value.trim())
        .map_err(|_| ControlError::validation(format!("{} is invalid", field)))
}

/// Operator percent input to the stored fraction, truncated to 4 places
pub fn percent_to_fraction(field: &str, value: &str) -> ControlResult<Decimal> {
    let percent = parse_decimal(field, value)?;
    let scale = Decimal::from(10_000);
    Ok((percent / Decimal::ONE_HUNDRED * scale).trunc() / scale)
}

/// `YYYY-MM-DD HH:MM`, interpreted as UTC
pub fn parse_form_time(field: &str, value: &str) -> ControlResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), FORM_TIME_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| ControlError::validation(format!("{} is invalid", field)))
}
