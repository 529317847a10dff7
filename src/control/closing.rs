use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{ControlError, ControlResult};
use crate::exchange::{retry, Exchange, ExchangeError, RetryPolicy};
use crate::models::{PositionStatus, StrategyRecord};

/// Retry bounds for each step of a close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosingPolicies {
    pub close_position: RetryPolicy,
    pub confirm_fill: RetryPolicy,
    pub cancel_stop_loss: RetryPolicy,
}

impl Default for ClosingPolicies {
    fn default() -> Self {
        Self {
            close_position: RetryPolicy::CLOSE_POSITION,
            confirm_fill: RetryPolicy::CONFIRM_FILL,
            cancel_stop_loss: RetryPolicy::CANCEL_STOP_LOSS,
        }
    }
}

/// What the operator gets back after a successful close
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClosingReport {
    pub order_id: i64,
    /// Size-weighted average over the fills
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
    /// Stop order cancelled along with the position
    pub cancelled_stop_loss_order_id: Option<i64>,
}

/// Closes the open position of one strategy and removes its stop order.
///
/// The caller has already checked ownership, the engine guard and the action lock,
/// and commits the record afterwards.
pub struct ClosingOrchestrator<'a> {
    exchange: &'a dyn Exchange,
    policies: ClosingPolicies,
}

impl<'a> ClosingOrchestrator<'a> {
    pub fn new(exchange: &'a dyn Exchange, policies: ClosingPolicies) -> Self {
        Self { exchange, policies }
    }

    fn exchange_error(&self, err: &ExchangeError) -> ControlError {
        ControlError::exchange(self.exchange.name(), err)
    }

    pub async fn close(&self, strategy: &StrategyRecord) -> ControlResult<ClosingReport> {
        if strategy.position_status != PositionStatus::Opened {
            return Err(ControlError::invalid_state("position is not opened"));
        }
        if strategy.exchange_orders_details.is_empty() {
            return Err(ControlError::internal(format!(
                "strategy {} is opened without exchange order details",
                strategy.uuid
            )));
        }

        let exchange_name = self.exchange.name();
        let symbol = strategy.symbol.as_str();

        // 1. Current size
        let position = retry(
            "read position",
            self.policies.close_position,
            ExchangeError::is_retryable,
            || self.exchange.position(symbol),
        )
        .await
        .map_err(|e| self.exchange_error(&e))?;
        if position.size.is_zero() {
            tracing::error!("{} position for {} is already closed", symbol, strategy.uuid);
            return Err(ControlError::ManualRecovery(format!(
                "position is already closed, please confirm on {} and reset the strategy",
                exchange_name
            )));
        }
        let size = position.size.abs();

        // 2. Reduce-only close
        let order_id = retry(
            "close position",
            self.policies.close_position,
            ExchangeError::is_retryable,
            || self.exchange.close_position(symbol, strategy.side, size),
        )
        .await
        .map_err(|e| match e {
            ExchangeError::InvalidReduceOnly => {
                tracing::error!("close of {} rejected as invalid reduce-only", strategy.uuid);
                ControlError::ManualRecovery(format!(
                    "the position may already be closed, please confirm on {} and reset the strategy",
                    exchange_name
                ))
            }
            other => {
                tracing::error!("failed to close position of {}: {}", strategy.uuid, other);
                self.exchange_error(&other)
            }
        })?;
        tracing::info!("Submitted close order {} for {} ({} {})", order_id, strategy.uuid, size, symbol);

        // 3. Confirm the fill. The close order exists from here on, so every failure is manual.
        let fills = retry(
            "confirm close fill",
            self.policies.confirm_fill,
            ExchangeError::is_retryable,
            || async move {
                let fills = self.exchange.order_fills(order_id).await?;
                if fills.is_empty() {
                    return Err(ExchangeError::NotSettled(order_id));
                }
                Ok(fills)
            },
        )
        .await
        .map_err(|e| match e {
            ExchangeError::NotSettled(_) => {
                tracing::error!("no fill found for close order {}", order_id);
                ControlError::ManualRecovery(format!(
                    "unknown error, please confirm the position was closed on {} and reset the strategy",
                    exchange_name
                ))
            }
            other => {
                tracing::error!("failed to read fills of close order {}: {}", order_id, other);
                ControlError::ManualRecovery(format!(
                    "close order {} was submitted but its fills could not be read ({}), please confirm on {} and reset the strategy",
                    order_id, other, exchange_name
                ))
            }
        })?;

        let filled: Decimal = fills.iter().map(|f| f.size).sum();
        let notional: Decimal = fills.iter().map(|f| f.price * f.size).sum();
        let fee: Decimal = fills.iter().map(|f| f.fee).sum();
        let price = if filled.is_zero() {
            Decimal::ZERO
        } else {
            notional / filled
        };

        // 4. Stop-loss order
        let stop_loss_order_id = strategy.exchange_orders_details.stop_loss_order_id();
        if let Some(stop_id) = stop_loss_order_id {
            let cancelled = retry(
                "cancel stop-loss order",
                self.policies.cancel_stop_loss,
                ExchangeError::is_retryable,
                || self.exchange.cancel_stop_order(stop_id),
            )
            .await;

            match cancelled {
                Ok(()) => {}
                Err(ExchangeError::NotFound) => {
                    tracing::warn!("stop-loss order {} was already gone", stop_id);
                }
                Err(e) => {
                    tracing::error!("failed to cancel stop-loss order {}: {}", stop_id, e);
                    return Err(ControlError::ManualRecovery(format!(
                        "position closed but stop-loss cancellation failed, {} server error: '{}'",
                        exchange_name, e
                    )));
                }
            }
        }

        Ok(ClosingReport {
            order_id,
            price,
            size: filled,
            fee,
            cancelled_stop_loss_order_id: stop_loss_order_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractParams;
    use crate::exchange::paper::{PaperCall, PaperOp, PaperStopOrder};
    use crate::exchange::PaperExchange;
    use crate::models::{EntryOrderDetails, ExchangeOrdersDetails, Side, StopOrderDetails};
    use chrono::Utc;
    use serde_json::json;
    use std::str::FromStr;
    use tokio::time::Duration;
    use uuid::Uuid;

    const FAST: ClosingPolicies = ClosingPolicies {
        close_position: RetryPolicy::new(3, Duration::ZERO),
        confirm_fill: RetryPolicy::new(3, Duration::ZERO),
        cancel_stop_loss: RetryPolicy::new(2, Duration::ZERO),
    };

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    fn opened_strategy() -> StrategyRecord {
        StrategyRecord {
            id: 1,
            uuid: Uuid::new_v4(),
            owner_uuid: Uuid::new_v4(),
            symbol: "BTC-PERP".to_string(),
            side: Side::Long,
            margin: dec("100"),
            exchange: "FTX".to_string(),
            enabled: false,
            position_status: PositionStatus::Opened,
            params: ContractParams::from_document(&json!({
                "entry_type": "limit",
                "entry_order": {
                    "trigger": {"trigger_type": "limit", "operator": "<=", "price": "19000"},
                    "flip_operator_enabled": false
                }
            }))
            .unwrap(),
            exchange_orders_details: ExchangeOrdersDetails {
                entry_order: Some(EntryOrderDetails {
                    price: dec("19000"),
                    size: dec("2.5"),
                    extra: Default::default(),
                }),
                stop_loss_order: Some(StopOrderDetails::new(555)),
                take_profit_order: None,
            },
            comment: String::new(),
            pending_action: None,
            last_position_at: Some(Utc::now()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn exchange_with_position() -> PaperExchange {
        let exchange = PaperExchange::new("FTX");
        exchange.set_position("BTC-PERP", dec("2.5"), dec("19000"), dec("20000")).await;
        exchange
            .insert_stop_order(
                555,
                PaperStopOrder {
                    symbol: "BTC-PERP".to_string(),
                    side: Side::Long,
                    trigger_price: dec("18500"),
                    size: dec("2.5"),
                },
            )
            .await;
        exchange.set_next_order_id(777).await;
        exchange
    }

    #[tokio::test]
    async fn test_close_success_path() {
        let exchange = exchange_with_position().await;
        let report = ClosingOrchestrator::new(&exchange, FAST)
            .close(&opened_strategy())
            .await
            .unwrap();

        assert_eq!(report.order_id, 777);
        assert_eq!(report.price, dec("20000"));
        assert_eq!(report.size, dec("2.5"));
        assert_eq!(report.cancelled_stop_loss_order_id, Some(555));
        assert!(exchange.stop_orders().await.is_empty());
        assert_eq!(exchange.position_size("BTC-PERP").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_zero_size_needs_manual_recovery_without_close_order() {
        let exchange = PaperExchange::new("FTX");
        let err = ClosingOrchestrator::new(&exchange, FAST)
            .close(&opened_strategy())
            .await
            .unwrap_err();

        assert!(err.requires_manual_recovery());
        let calls = exchange.calls().await;
        assert_eq!(calls, vec![PaperCall::Position("BTC-PERP".to_string())]);
    }

    #[tokio::test]
    async fn test_invalid_reduce_only_is_not_retried() {
        let exchange = exchange_with_position().await;
        exchange
            .fail_next(PaperOp::ClosePosition, ExchangeError::InvalidReduceOnly, 5)
            .await;

        let err = ClosingOrchestrator::new(&exchange, FAST)
            .close(&opened_strategy())
            .await
            .unwrap_err();

        assert!(err.requires_manual_recovery());
        let closes = exchange
            .calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, PaperCall::ClosePosition { .. }))
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_transient_close_failures_are_retried() {
        let exchange = exchange_with_position().await;
        exchange
            .fail_next(PaperOp::ClosePosition, ExchangeError::Transient("502".into()), 2)
            .await;
        exchange.set_fill_delay(2).await;

        let report = ClosingOrchestrator::new(&exchange, FAST)
            .close(&opened_strategy())
            .await
            .unwrap();
        assert_eq!(report.order_id, 777);
    }

    #[tokio::test]
    async fn test_unconfirmed_fill_needs_manual_recovery() {
        let exchange = exchange_with_position().await;
        exchange.set_fill_delay(10).await;

        let err = ClosingOrchestrator::new(&exchange, FAST)
            .close(&opened_strategy())
            .await
            .unwrap_err();
        assert!(err.requires_manual_recovery());
        assert!(exchange.stop_orders().await.contains_key(&555));
    }

    #[tokio::test]
    async fn test_fill_lookup_error_after_submit_needs_manual_recovery() {
        let exchange = exchange_with_position().await;
        exchange.fail_next(PaperOp::OrderFills, ExchangeError::NotFound, 1).await;

        let err = ClosingOrchestrator::new(&exchange, FAST)
            .close(&opened_strategy())
            .await
            .unwrap_err();
        assert!(err.requires_manual_recovery());
        assert!(err.to_string().contains("close order 777"));
        assert_eq!(exchange.position_size("BTC-PERP").await, Decimal::ZERO);
        assert!(exchange.stop_orders().await.contains_key(&555));
    }

    #[tokio::test]
    async fn test_transient_position_read_is_retried() {
        let exchange = exchange_with_position().await;
        exchange
            .fail_next(PaperOp::Position, ExchangeError::Transient("502".into()), 2)
            .await;

        let report = ClosingOrchestrator::new(&exchange, FAST)
            .close(&opened_strategy())
            .await
            .unwrap();
        assert_eq!(report.order_id, 777);
        let reads = exchange
            .calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, PaperCall::Position(_)))
            .count();
        assert_eq!(reads, 3);
    }

    #[tokio::test]
    async fn test_rejected_position_read_stops_before_any_order() {
        let exchange = exchange_with_position().await;
        exchange
            .fail_next(PaperOp::Position, ExchangeError::Rejected("bad key".into()), 1)
            .await;

        let err = ClosingOrchestrator::new(&exchange, FAST)
            .close(&opened_strategy())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Exchange { .. }));
        assert_eq!(exchange.calls().await, vec![PaperCall::Position("BTC-PERP".to_string())]);
    }

    #[tokio::test]
    async fn test_stop_cancel_failure_after_close() {
        let exchange = exchange_with_position().await;
        exchange
            .fail_next(PaperOp::CancelStopOrder, ExchangeError::Rejected("busy".into()), 1)
            .await;

        let err = ClosingOrchestrator::new(&exchange, FAST)
            .close(&opened_strategy())
            .await
            .unwrap_err();
        assert!(err.requires_manual_recovery());
        assert!(err.to_string().contains("stop-loss cancellation failed"));
    }

    #[tokio::test]
    async fn test_missing_stop_order_counts_as_cancelled() {
        let exchange = PaperExchange::new("FTX");
        exchange.set_position("BTC-PERP", dec("2.5"), dec("19000"), dec("20000")).await;

        let report = ClosingOrchestrator::new(&exchange, FAST)
            .close(&opened_strategy())
            .await
            .unwrap();
        assert_eq!(report.cancelled_stop_loss_order_id, Some(555));
    }

    #[tokio::test]
    async fn test_requires_opened_position() {
        let exchange = PaperExchange::new("FTX");
        let mut strategy = opened_strategy();
        strategy.position_status = PositionStatus::Closed;

        let err = ClosingOrchestrator::new(&exchange, FAST).close(&strategy).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidState(_)));
        assert!(exchange.calls().await.is_empty());
    }
}
