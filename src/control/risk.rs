use chrono::{DateTime, Utc};

use crate::contract::{ContractParams, FixedStopLossParams, TakeProfitParams, Trigger, TriggerForm};
use crate::error::{ControlError, ControlResult};
use crate::exchange::{Exchange, ExchangeError};
use crate::models::{ExchangeOrdersDetails, PositionStatus, StopOrderDetails, StrategyRecord};

/// Operator edit of stop-loss and take-profit.
///
/// `None` removes the take-profit. For limit entries `None` also removes the
/// stop-loss; for trendline entries it leaves the stop-loss descriptor alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskUpdate {
    pub stop_loss: Option<TriggerForm>,
    pub take_profit: Option<TriggerForm>,
    pub comment: Option<String>,
}

/// What has to happen to the live stop order
#[derive(Debug, Clone, PartialEq)]
pub enum StopLossChange {
    Keep,
    Remove,
    Replace(Trigger),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskPlan {
    pub params: ContractParams,
    pub stop_loss: StopLossChange,
}

/// Validate the edit against the strategy and compute the new params.
///
/// No I/O. Exchange work is only planned for OPENED positions.
pub fn plan(strategy: &StrategyRecord, update: &RiskUpdate) -> ControlResult<RiskPlan> {
    let opened = strategy.position_status == PositionStatus::Opened;
    let mut params = strategy.params.clone();

    let stop_loss = match &mut params {
        ContractParams::Limit { stop_loss_order, .. } => match &update.stop_loss {
            Some(form) => {
                let trigger_params = form.to_params()?;
                let trigger = trigger_params.to_trigger()?;
                *stop_loss_order = Some(FixedStopLossParams {
                    trigger: trigger_params,
                });
                if opened {
                    StopLossChange::Replace(trigger)
                } else {
                    StopLossChange::Keep
                }
            }
            None => {
                *stop_loss_order = None;
                if opened {
                    StopLossChange::Remove
                } else {
                    StopLossChange::Keep
                }
            }
        },
        ContractParams::Trendline { stop_loss_order, .. } => match (&update.stop_loss, stop_loss_order) {
            (None, _) => StopLossChange::Keep,
            (Some(form), Some(descriptor)) if opened => {
                let trigger_params = form.to_params()?;
                let trigger = trigger_params.to_trigger()?;
                descriptor.trigger = Some(trigger_params);
                StopLossChange::Replace(trigger)
            }
            (Some(_), _) => {
                return Err(ControlError::validation(
                    "trendline stop-loss can only be changed while a position with a stop-loss is open",
                ))
            }
        },
    };

    let take_profit = update
        .take_profit
        .as_ref()
        .map(|form| form.to_params().map(|trigger| TakeProfitParams { trigger }))
        .transpose()?;
    params.set_take_profit(take_profit);

    Ok(RiskPlan { params, stop_loss })
}

/// The exchange was left in a different state than the record describes
#[derive(Debug)]
pub struct RiskFailure {
    pub error: ControlError,
    /// Order details to persist anyway, when the old stop order is already gone
    pub orders_details: Option<ExchangeOrdersDetails>,
}

impl RiskFailure {
    fn untouched(error: ControlError) -> Self {
        Self {
            error,
            orders_details: None,
        }
    }
}

async fn cancel_stop_loss(exchange: &dyn Exchange, strategy: &StrategyRecord) -> Result<(), RiskFailure> {
    let Some(order_id) = strategy.exchange_orders_details.stop_loss_order_id() else {
        return Ok(());
    };

    match exchange.cancel_stop_order(order_id).await {
        Ok(()) => Ok(()),
        Err(ExchangeError::NotFound) => {
            tracing::warn!("stop-loss order {} of {} was already gone", order_id, strategy.uuid);
            Ok(())
        }
        Err(e) => {
            tracing::error!("failed to cancel stop-loss order {}: {}", order_id, e);
            Err(RiskFailure::untouched(ControlError::exchange(exchange.name(), &e)))
        }
    }
}

/// Bring the live stop order in line with `change`, returning the new order details
pub async fn apply_stop_loss_change(
    exchange: &dyn Exchange,
    strategy: &StrategyRecord,
    change: &StopLossChange,
    as_of: DateTime<Utc>,
) -> Result<ExchangeOrdersDetails, RiskFailure> {
    let mut details = strategy.exchange_orders_details.clone();

    match change {
        StopLossChange::Keep => Ok(details),
        StopLossChange::Remove => {
            cancel_stop_loss(exchange, strategy).await?;
            details.stop_loss_order = None;
            Ok(details)
        }
        StopLossChange::Replace(trigger) => {
            let price = trigger.price_at(as_of).map_err(RiskFailure::untouched)?;
            let position = exchange
                .position(&strategy.symbol)
                .await
                .map_err(|e| RiskFailure::untouched(ControlError::exchange(exchange.name(), &e)))?;
            if position.size.is_zero() {
                tracing::error!("{} position for {} is already closed", strategy.symbol, strategy.uuid);
                return Err(RiskFailure::untouched(ControlError::ManualRecovery(format!(
                    "position is already closed, please confirm on {} and reset the strategy",
                    exchange.name()
                ))));
            }

            cancel_stop_loss(exchange, strategy).await?;
            details.stop_loss_order = None;

            // From here on the old stop order no longer exists
            match exchange
                .place_stop_order(&strategy.symbol, strategy.side, price, position.size.abs())
                .await
            {
                Ok(order_id) => {
                    tracing::info!("Placed stop-loss order {} for {} at {}", order_id, strategy.uuid, price);
                    details.stop_loss_order = Some(StopOrderDetails::new(order_id));
                    Ok(details)
                }
                Err(e) => {
                    tracing::error!("failed to place stop-loss order for {}: {}", strategy.uuid, e);
                    Err(RiskFailure {
                        error: ControlError::exchange(exchange.name(), &e),
                        orders_details: Some(details),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::{PaperCall, PaperOp, PaperStopOrder};
    use crate::exchange::PaperExchange;
    use crate::models::{EntryOrderDetails, Side};
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::str::FromStr;
    use uuid::Uuid;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    fn form(operator: &str, price: &str) -> TriggerForm {
        TriggerForm {
            operator: operator.to_string(),
            price: price.to_string(),
        }
    }

    fn strategy(params: serde_json::Value, status: PositionStatus) -> StrategyRecord {
        let opened = status == PositionStatus::Opened;
        StrategyRecord {
            id: 1,
            uuid: Uuid::new_v4(),
            owner_uuid: Uuid::new_v4(),
            symbol: "BTC-PERP".to_string(),
            side: Side::Long,
            margin: dec("100"),
            exchange: "FTX".to_string(),
            enabled: false,
            position_status: status,
            params: ContractParams::from_document(&params).unwrap(),
            exchange_orders_details: ExchangeOrdersDetails {
                entry_order: opened.then(|| EntryOrderDetails {
                    price: dec("20000"),
                    size: dec("2"),
                    extra: Default::default(),
                }),
                stop_loss_order: opened.then(|| StopOrderDetails::new(555)),
                take_profit_order: None,
            },
            comment: String::new(),
            pending_action: None,
            last_position_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn limit_params() -> serde_json::Value {
        json!({
            "entry_type": "limit",
            "entry_order": {
                "trigger": {"trigger_type": "limit", "operator": "<=", "price": "20000"},
                "flip_operator_enabled": false
            },
            "stop_loss_order": {
                "trigger": {"trigger_type": "limit", "operator": "<=", "price": "19000"}
            },
            "take_profit_order": {
                "trigger": {"trigger_type": "limit", "operator": ">=", "price": "23000"}
            }
        })
    }

    fn trendline_params() -> serde_json::Value {
        json!({
            "entry_type": "trendline",
            "entry_order": {
                "trendline_trigger": {
                    "trigger_type": "line", "operator": ">=",
                    "time_1": "2022-05-01T12:00:00Z", "price_1": "100",
                    "time_2": "2022-05-01T12:10:00Z", "price_2": "110"
                },
                "trendline_offset_percent": "0",
                "flip_operator_enabled": false
            },
            "stop_loss_order": {
                "loss_tolerance_percent": "0.02",
                "trendline_readjustment_enabled": false
            }
        })
    }

    async fn exchange_with_stop() -> PaperExchange {
        let exchange = PaperExchange::new("FTX");
        exchange.set_position("BTC-PERP", dec("2"), dec("20000"), dec("20000")).await;
        exchange
            .insert_stop_order(
                555,
                PaperStopOrder {
                    symbol: "BTC-PERP".to_string(),
                    side: Side::Long,
                    trigger_price: dec("19000"),
                    size: dec("2"),
                },
            )
            .await;
        exchange
    }

    #[test]
    fn test_limit_plan_on_closed_position_is_params_only() {
        let record = strategy(limit_params(), PositionStatus::Closed);
        let update = RiskUpdate {
            stop_loss: Some(form("<=", "18800")),
            take_profit: None,
            comment: None,
        };

        let plan = plan(&record, &update).unwrap();
        assert_eq!(plan.stop_loss, StopLossChange::Keep);
        let document = plan.params.to_document();
        assert_eq!(document["stop_loss_order"]["trigger"]["price"], "18800");
        assert!(document.get("take_profit_order").is_none());
    }

    #[test]
    fn test_limit_plan_removes_stop_loss_when_opened() {
        let record = strategy(limit_params(), PositionStatus::Opened);
        let plan = plan(&record, &RiskUpdate::default()).unwrap();

        assert_eq!(plan.stop_loss, StopLossChange::Remove);
        assert!(plan.params.to_document().get("stop_loss_order").is_none());
    }

    #[test]
    fn test_unknown_position_plans_no_exchange_work() {
        let record = strategy(limit_params(), PositionStatus::Unknown);
        let update = RiskUpdate {
            stop_loss: Some(form("<=", "18800")),
            ..RiskUpdate::default()
        };
        assert_eq!(plan(&record, &update).unwrap().stop_loss, StopLossChange::Keep);
    }

    #[test]
    fn test_trendline_stop_loss_needs_open_position() {
        let record = strategy(trendline_params(), PositionStatus::Closed);
        let update = RiskUpdate {
            stop_loss: Some(form("<=", "95")),
            ..RiskUpdate::default()
        };
        assert!(matches!(plan(&record, &update), Err(ControlError::Validation(_))));

        let untouched = plan(&record, &RiskUpdate::default()).unwrap();
        assert_eq!(untouched.stop_loss, StopLossChange::Keep);
        assert_eq!(untouched.params.to_document()["stop_loss_order"], record.params.to_document()["stop_loss_order"]);
    }

    #[test]
    fn test_trendline_plan_sets_trigger_on_open_position() {
        let record = strategy(trendline_params(), PositionStatus::Opened);
        let update = RiskUpdate {
            stop_loss: Some(form("<=", "95")),
            take_profit: Some(form(">=", "130")),
            comment: None,
        };

        let plan = plan(&record, &update).unwrap();
        assert!(matches!(plan.stop_loss, StopLossChange::Replace(_)));
        let document = plan.params.to_document();
        assert_eq!(document["stop_loss_order"]["trigger"]["price"], "95");
        assert_eq!(document["take_profit_order"]["trigger"]["price"], "130");
    }

    #[test]
    fn test_invalid_take_profit_is_rejected() {
        let record = strategy(limit_params(), PositionStatus::Closed);
        let update = RiskUpdate {
            stop_loss: Some(form("<=", "18800")),
            take_profit: Some(form("=>", "23000")),
            comment: None,
        };
        assert!(matches!(plan(&record, &update), Err(ControlError::Validation(_))));
    }

    #[tokio::test]
    async fn test_replace_cancels_then_places_for_current_size() {
        let exchange = exchange_with_stop().await;
        exchange.set_next_order_id(900).await;
        let record = strategy(limit_params(), PositionStatus::Opened);
        let trigger = form("<=", "18800").to_params().unwrap().to_trigger().unwrap();

        let details = apply_stop_loss_change(&exchange, &record, &StopLossChange::Replace(trigger), Utc::now())
            .await
            .unwrap();

        assert_eq!(details.stop_loss_order_id(), Some(900));
        assert_eq!(details.entry_order, record.exchange_orders_details.entry_order);
        let orders = exchange.stop_orders().await;
        assert!(!orders.contains_key(&555));
        assert_eq!(orders[&900].trigger_price, dec("18800"));
        assert_eq!(orders[&900].size, dec("2"));
    }

    #[tokio::test]
    async fn test_failed_placement_reports_details_without_stale_stop() {
        let exchange = exchange_with_stop().await;
        exchange
            .fail_next(PaperOp::PlaceStopOrder, ExchangeError::Rejected("Trigger price too high".into()), 1)
            .await;
        let record = strategy(limit_params(), PositionStatus::Opened);
        let trigger = form("<=", "18800").to_params().unwrap().to_trigger().unwrap();

        let failure = apply_stop_loss_change(&exchange, &record, &StopLossChange::Replace(trigger), Utc::now())
            .await
            .unwrap_err();

        assert_eq!(
            failure.error.public_message(),
            "FTX server responded: 'Trigger price too high'"
        );
        let details = failure.orders_details.unwrap();
        assert!(details.stop_loss_order.is_none());
        assert!(details.entry_order.is_some());
    }

    #[tokio::test]
    async fn test_failed_cancel_changes_nothing() {
        let exchange = exchange_with_stop().await;
        exchange
            .fail_next(PaperOp::CancelStopOrder, ExchangeError::Transient("timeout".into()), 1)
            .await;
        let record = strategy(limit_params(), PositionStatus::Opened);

        let failure = apply_stop_loss_change(&exchange, &record, &StopLossChange::Remove, Utc::now())
            .await
            .unwrap_err();
        assert!(failure.orders_details.is_none());
        assert_eq!(exchange.calls().await, vec![PaperCall::CancelStopOrder(555)]);
    }

    #[tokio::test]
    async fn test_replace_on_empty_position_needs_manual_recovery() {
        let exchange = exchange_with_stop().await;
        exchange.set_position("BTC-PERP", Decimal::ZERO, dec("20000"), dec("20000")).await;
        let record = strategy(limit_params(), PositionStatus::Opened);
        let trigger = form("<=", "18800").to_params().unwrap().to_trigger().unwrap();

        let failure = apply_stop_loss_change(&exchange, &record, &StopLossChange::Replace(trigger), Utc::now())
            .await
            .unwrap_err();

        assert!(failure.error.requires_manual_recovery());
        assert!(failure.orders_details.is_none());
        assert!(exchange.stop_orders().await.contains_key(&555));
        assert_eq!(exchange.calls().await, vec![PaperCall::Position("BTC-PERP".to_string())]);
    }
}
