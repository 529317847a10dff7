// Strategy parameters and their interpretation into orders
pub mod params;
pub mod trigger;

pub use params::{
    ContractForm, ContractParams, FixedStopLossParams, StopLossForm, TakeProfitParams, ToleranceStopLossParams,
    TriggerForm, TriggerParams,
};
pub use trigger::{Operator, Trigger, TriggerType};

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ControlError, ControlResult};
use crate::models::Side;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryType {
    Limit,
    Trendline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryOrder {
    pub trigger: Trigger,
    pub flip_operator_enabled: bool,
    pub trendline_offset_percent: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopLossOrder {
    /// Limit entries: the price is known up front
    Fixed(Trigger),
    /// Trendline entries: derived from the fill price, trigger only exists once a
    /// position is open
    Tolerance {
        loss_tolerance_percent: Decimal,
        trendline_readjustment_enabled: bool,
        trigger: Option<Trigger>,
    },
}

impl StopLossOrder {
    pub fn trigger(&self) -> Option<&Trigger> {
        match self {
            StopLossOrder::Fixed(trigger) => Some(trigger),
            StopLossOrder::Tolerance { trigger, .. } => trigger.as_ref(),
        }
    }

    /// Stop price a tolerance stop-loss implies for a fill at `fill_price`
    pub fn price_for_fill(&self, side: Side, fill_price: Decimal) -> Option<Decimal> {
        match self {
            StopLossOrder::Fixed(_) => None,
            StopLossOrder::Tolerance {
                loss_tolerance_percent,
                ..
            } => Some(match side {
                Side::Long => fill_price * (Decimal::ONE - *loss_tolerance_percent),
                Side::Short => fill_price * (Decimal::ONE + *loss_tolerance_percent),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TakeProfitOrder {
    pub trigger: Trigger,
}

/// Interpreted form of a strategy's params
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    pub side: Side,
    pub entry_type: EntryType,
    pub entry_order: EntryOrder,
    pub stop_loss_order: Option<StopLossOrder>,
    pub take_profit_order: Option<TakeProfitOrder>,
}

impl Contract {
    /// Parse a raw params document
    pub fn parse(side: Side, document: &Value) -> ControlResult<Self> {
        let params = ContractParams::from_document(document)?;
        Self::from_params(side, &params)
    }

    pub fn from_params(side: Side, params: &ContractParams) -> ControlResult<Self> {
        match params {
            ContractParams::Limit {
                entry_order,
                stop_loss_order,
                take_profit_order,
            } => Ok(Self {
                side,
                entry_type: EntryType::Limit,
                entry_order: EntryOrder {
                    trigger: entry_order.trigger.to_trigger()?,
                    flip_operator_enabled: entry_order.flip_operator_enabled,
                    trendline_offset_percent: None,
                },
                stop_loss_order: stop_loss_order
                    .as_ref()
                    .map(|stop_loss| stop_loss.trigger.to_trigger().map(StopLossOrder::Fixed))
                    .transpose()?,
                take_profit_order: take_profit(take_profit_order.as_ref())?,
            }),
            ContractParams::Trendline {
                entry_order,
                stop_loss_order,
                take_profit_order,
            } => {
                let line = &entry_order.trendline_trigger;
                let trigger = Trigger::trendline(
                    line.trigger_type,
                    line.operator,
                    (line.time_1, line.price_1),
                    (line.time_2, line.price_2),
                    entry_order.trendline_offset_percent,
                )?;

                let stop_loss_order = match stop_loss_order {
                    Some(stop_loss) => Some(tolerance_stop_loss(stop_loss)?),
                    None => None,
                };

                Ok(Self {
                    side,
                    entry_type: EntryType::Trendline,
                    entry_order: EntryOrder {
                        trigger,
                        flip_operator_enabled: entry_order.flip_operator_enabled,
                        trendline_offset_percent: Some(entry_order.trendline_offset_percent),
                    },
                    stop_loss_order,
                    take_profit_order: take_profit(take_profit_order.as_ref())?,
                })
            }
        }
    }
}

fn take_profit(params: Option<&TakeProfitParams>) -> ControlResult<Option<TakeProfitOrder>> {
    params
        .map(|take_profit| {
            take_profit
                .trigger
                .to_trigger()
                .map(|trigger| TakeProfitOrder { trigger })
        })
        .transpose()
}

fn tolerance_stop_loss(params: &ToleranceStopLossParams) -> ControlResult<StopLossOrder> {
    let tolerance = params.loss_tolerance_percent;
    if tolerance <= Decimal::ZERO || tolerance >= Decimal::ONE {
        return Err(ControlError::validation(
            "loss_tolerance_percent must be between 0% and 100%",
        ));
    }

    Ok(StopLossOrder::Tolerance {
        loss_tolerance_percent: tolerance,
        trendline_readjustment_enabled: params.trendline_readjustment_enabled,
        trigger: params.trigger.as_ref().map(TriggerParams::to_trigger).transpose()?,
    })
}
