//! Operator actions on strategies.
//!
//! Every mutating action follows the same order: ownership, lifecycle
//! preconditions, engine guard, per-strategy lock, exchange work, then one
//! store write.

pub mod closing;
pub mod guard;
pub mod risk;
pub mod views;

pub use closing::{ClosingOrchestrator, ClosingPolicies, ClosingReport};
pub use risk::RiskUpdate;
pub use views::{AccountOverview, EngineDiagnostics, StrategyListing, StrategySummary, StrategyView};

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::engine::{Diagnostic, Engine, EngineEvent};
use crate::contract::{Contract, ContractForm, ContractParams};
use crate::db::{StoreError, StrategyPatch, StrategyState, StrategyStore};
use crate::error::{ControlError, ControlResult};
use crate::exchange::{Exchange, ExchangeConnector};
use crate::lock::ActionLock;
use crate::models::{NewStrategy, PendingAction, Side, StrategyRecord};

pub const MAX_COMMENT_CHARS: usize = 255;

/// Who is asking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operator {
    pub uuid: Uuid,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlSettings {
    /// Exchange new strategies are created on
    pub default_exchange: String,
    pub closing: ClosingPolicies,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            default_exchange: "FTX".to_string(),
            closing: ClosingPolicies::default(),
        }
    }
}

/// Strategy parameters as typed by the operator, or as a ready document
#[derive(Debug, Clone, PartialEq)]
pub enum ContractInput {
    Form(ContractForm),
    Document(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateStrategy {
    pub symbol: String,
    pub side: Side,
    pub margin: String,
    pub contract: ContractInput,
    pub comment: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditStrategy {
    pub margin: Option<String>,
    pub comment: Option<String>,
}

fn parse_margin(value: &str) -> ControlResult<Decimal> {
    match Decimal::from_str(value.trim()) {
        Ok(margin) if margin > Decimal::ZERO => Ok(margin),
        _ => Err(ControlError::validation("margin must be a positive number")),
    }
}

fn check_comment(comment: &str) -> ControlResult<()> {
    if comment.chars().count() > MAX_COMMENT_CHARS {
        return Err(ControlError::validation(format!(
            "comment must be at most {} characters",
            MAX_COMMENT_CHARS
        )));
    }
    Ok(())
}

fn ensure_idle(idle: bool) -> ControlResult<()> {
    if !idle {
        return Err(ControlError::invalid_state(
            "strategy is not paused or position is not closed",
        ));
    }
    Ok(())
}

pub struct StrategyController {
    store: Arc<dyn StrategyStore>,
    engine: Arc<dyn Engine>,
    exchanges: Arc<dyn ExchangeConnector>,
    lock: Arc<dyn ActionLock>,
    settings: ControlSettings,
}

impl StrategyController {
    pub fn new(
        store: Arc<dyn StrategyStore>,
        engine: Arc<dyn Engine>,
        exchanges: Arc<dyn ExchangeConnector>,
        lock: Arc<dyn ActionLock>,
        settings: ControlSettings,
    ) -> Self {
        Self {
            store,
            engine,
            exchanges,
            lock,
            settings,
        }
    }

    /// Ownership check; a foreign or missing strategy looks the same
    async fn owned(&self, operator: &Operator, uuid: Uuid) -> ControlResult<StrategyRecord> {
        self.store
            .find_owned(operator.uuid, uuid)
            .await?
            .ok_or(ControlError::PermissionDenied)
    }

    async fn owned_state(&self, operator: &Operator, uuid: Uuid) -> ControlResult<StrategyState> {
        self.store
            .find_state(operator.uuid, uuid)
            .await?
            .ok_or(ControlError::PermissionDenied)
    }

    async fn exchange_for(&self, exchange: &str, owner_uuid: Uuid) -> ControlResult<Arc<dyn Exchange>> {
        self.exchanges
            .connect(exchange, owner_uuid)
            .await
            .map_err(|e| ControlError::exchange(exchange, &e))
    }

    /// Run `action` while holding the strategy's lock
    async fn locked<T, F, Fut>(&self, uuid: Uuid, action: F) -> ControlResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ControlResult<T>>,
    {
        let token = self
            .lock
            .try_acquire(uuid)
            .await
            .map_err(|e| ControlError::internal(e.to_string()))?
            .ok_or_else(|| ControlError::Conflict("another action is in progress for this strategy".to_string()))?;

        let result = action().await;

        if let Err(e) = self.lock.release(uuid, &token).await {
            tracing::error!("failed to release lock for {}: {}", uuid, e);
        }
        result
    }

    pub async fn list(&self, operator: &Operator) -> ControlResult<StrategyListing> {
        let owned = self.store.list_by_owner(operator.uuid).await?;

        let exchange = self.settings.default_exchange.as_str();
        let account = match self.exchange_for(exchange, operator.uuid).await {
            Ok(session) => session.account_info().await.map_err(|e| ControlError::exchange(exchange, &e)),
            Err(e) => Err(e),
        };
        let (account, warning) = match account {
            Ok(account) => (Some(account), None),
            Err(e) => {
                tracing::warn!("listing without account info: {}", e);
                (None, Some(e.public_message()))
            }
        };

        let now = Utc::now();
        Ok(StrategyListing {
            strategies: owned
                .records
                .iter()
                .map(|s| views::summarize(s, account.as_ref(), now))
                .collect(),
            warning,
            unreadable: owned.unreadable,
        })
    }

    pub async fn show(&self, operator: &Operator, uuid: Uuid) -> ControlResult<StrategyView> {
        let strategy = self.owned(operator, uuid).await?;

        let account = match self.exchange_for(&strategy.exchange, operator.uuid).await {
            Ok(session) => session.account_info().await.ok(),
            Err(_) => None,
        };
        Ok(views::view(&strategy, account.as_ref(), Utc::now()))
    }

    pub async fn account(&self, operator: &Operator) -> ControlResult<AccountOverview> {
        let exchange = self.settings.default_exchange.as_str();
        let session = self.exchange_for(exchange, operator.uuid).await?;
        let account = session
            .account_info()
            .await
            .map_err(|e| ControlError::exchange(exchange, &e))?;
        Ok(AccountOverview::new(exchange, &account))
    }

    pub async fn create(&self, operator: &Operator, request: CreateStrategy) -> ControlResult<StrategyRecord> {
        let exchange = self.settings.default_exchange.clone();
        let symbol = request.symbol.trim().to_string();

        let symbols = self.store.enabled_symbols(&exchange).await?;
        if !symbols.iter().any(|s| *s == symbol) {
            return Err(ControlError::validation(format!("symbol '{}' is not supported", symbol)));
        }

        let margin = parse_margin(&request.margin)?;
        check_comment(&request.comment)?;

        let document = match &request.contract {
            ContractInput::Form(form) => form.to_document()?,
            ContractInput::Document(document) => document.clone(),
        };
        let params = ContractParams::from_document(&document)?;
        Contract::from_params(request.side, &params)?;

        let record = self
            .store
            .insert(NewStrategy {
                uuid: Uuid::new_v4(),
                owner_uuid: operator.uuid,
                symbol,
                side: request.side,
                margin,
                exchange,
                params,
                comment: request.comment,
            })
            .await?;
        Ok(record)
    }

    pub async fn edit(&self, operator: &Operator, uuid: Uuid, request: EditStrategy) -> ControlResult<StrategyRecord> {
        let strategy = self.owned(operator, uuid).await?;
        ensure_idle(strategy.is_idle())?;

        let margin = request.margin.as_deref().map(parse_margin).transpose()?;
        if let Some(comment) = &request.comment {
            check_comment(comment)?;
        }

        guard::ensure_not_tracked(self.engine.as_ref(), uuid).await?;

        self.locked(uuid, || async {
            let patch = StrategyPatch {
                margin,
                comment: request.comment.clone(),
                ..StrategyPatch::default()
            };
            Ok(self.store.apply(uuid, &patch).await?)
        })
        .await
    }

    /// Works on records whose documents no longer decode
    pub async fn delete(&self, operator: &Operator, uuid: Uuid) -> ControlResult<()> {
        let state = self.owned_state(operator, uuid).await?;
        ensure_idle(state.is_idle())?;
        guard::ensure_not_tracked(self.engine.as_ref(), uuid).await?;

        self.locked(uuid, || async {
            self.store.delete(uuid).await?;
            Ok(())
        })
        .await
    }

    pub async fn enable(&self, operator: &Operator, uuid: Uuid) -> ControlResult<StrategyRecord> {
        let strategy = self.owned(operator, uuid).await?;
        Contract::from_params(strategy.side, &strategy.params)?;

        self.engine
            .notify(EngineEvent::Enable, uuid)
            .await
            .map_err(|e| {
                tracing::error!("failed to enable {} on the engine: {}", uuid, e);
                ControlError::EngineUnreachable(e.to_string())
            })?;

        let record = self.store.apply(uuid, &StrategyPatch::enabled(true)).await?;
        tracing::info!("Enabled strategy {}", uuid);
        Ok(record)
    }

    pub async fn disable(&self, operator: &Operator, uuid: Uuid) -> ControlResult<StrategyRecord> {
        self.owned(operator, uuid).await?;

        if let Err(e) = self.engine.notify(EngineEvent::Disable, uuid).await {
            tracing::warn!("engine did not acknowledge disabling {}: {}", uuid, e);
        }

        let record = self.store.apply(uuid, &StrategyPatch::enabled(false)).await?;
        tracing::info!("Disabled strategy {}", uuid);
        Ok(record)
    }

    /// Back to disabled, CLOSED and no orders. Used after the operator confirmed
    /// the exchange state by hand.
    pub async fn reset(&self, operator: &Operator, uuid: Uuid) -> ControlResult<StrategyRecord> {
        let strategy = match self.store.find_owned(operator.uuid, uuid).await {
            Ok(found) => found.ok_or(ControlError::PermissionDenied)?,
            Err(StoreError::Corrupt { reason, .. }) => return self.reset_unreadable(operator, uuid, &reason).await,
            Err(e) => return Err(e.into()),
        };
        guard::ensure_not_tracked(self.engine.as_ref(), uuid).await?;

        self.locked(uuid, || async {
            let mut params = strategy.params.clone();
            let cleared = params.clear_trendline_stop_loss_trigger();
            let patch = StrategyPatch::closed(cleared.then_some(params));

            if !patch.changes(&strategy) {
                return Ok(strategy.clone());
            }
            let record = self.store.apply(uuid, &patch).await?;
            tracing::info!("Reset strategy {}", uuid);
            Ok(record)
        })
        .await
    }

    /// Reset of a record whose documents do not decode. The lifecycle columns are
    /// overwritten without reading the record first.
    async fn reset_unreadable(&self, operator: &Operator, uuid: Uuid, reason: &str) -> ControlResult<StrategyRecord> {
        tracing::warn!("Resetting unreadable strategy {}: {}", uuid, reason);
        self.owned_state(operator, uuid).await?;
        guard::ensure_not_tracked(self.engine.as_ref(), uuid).await?;

        self.locked(uuid, || async {
            self.store.write(uuid, &StrategyPatch::closed(None)).await?;
            tracing::info!("Reset strategy {}", uuid);

            match self.store.find_owned(operator.uuid, uuid).await {
                Ok(found) => found.ok_or(ControlError::PermissionDenied),
                Err(StoreError::Corrupt { .. }) => Err(ControlError::invalid_state(
                    "strategy was reset but its params are unreadable, delete it and create it again",
                )),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn close_position(&self, operator: &Operator, uuid: Uuid) -> ControlResult<ClosingReport> {
        let strategy = self.owned(operator, uuid).await?;
        if strategy.position_status != crate::models::PositionStatus::Opened {
            return Err(ControlError::invalid_state("position is not opened"));
        }
        if strategy.exchange_orders_details.is_empty() {
            return Err(ControlError::internal(format!(
                "strategy {} is opened without exchange order details",
                uuid
            )));
        }
        guard::ensure_not_tracked(self.engine.as_ref(), uuid).await?;

        self.locked(uuid, || async {
            let exchange = self.exchange_for(&strategy.exchange, operator.uuid).await?;
            self.store
                .apply(uuid, &StrategyPatch::pending_action(Some(PendingAction::ClosingPosition)))
                .await?;

            let closed = ClosingOrchestrator::new(exchange.as_ref(), self.settings.closing)
                .close(&strategy)
                .await;

            match closed {
                Ok(report) => {
                    let mut params = strategy.params.clone();
                    let cleared = params.clear_trendline_stop_loss_trigger();
                    self.store
                        .apply(uuid, &StrategyPatch::closed(cleared.then_some(params)))
                        .await?;
                    tracing::info!(
                        "Closed position of {} at {} (fee {}, order {})",
                        uuid,
                        report.price,
                        report.fee,
                        report.order_id
                    );
                    Ok(report)
                }
                Err(e) => {
                    let patch = if e.requires_manual_recovery() {
                        // Exchange state is uncertain: the marker stays until a reset
                        StrategyPatch {
                            position_status: Some(crate::models::PositionStatus::Unknown),
                            ..StrategyPatch::default()
                        }
                    } else {
                        StrategyPatch::pending_action(None)
                    };
                    if let Err(store_err) = self.store.apply(uuid, &patch).await {
                        tracing::error!("failed to record close failure for {}: {}", uuid, store_err);
                    }
                    Err(e)
                }
            }
        })
        .await
    }

    /// Edit stop-loss and take-profit, replacing the live stop order of an open position
    pub async fn update_risk(
        &self,
        operator: &Operator,
        uuid: Uuid,
        update: RiskUpdate,
    ) -> ControlResult<StrategyRecord> {
        let strategy = self.owned(operator, uuid).await?;
        if strategy.enabled {
            return Err(ControlError::invalid_state("strategy is not paused"));
        }
        if let Some(comment) = &update.comment {
            check_comment(comment)?;
        }
        let plan = risk::plan(&strategy, &update)?;
        guard::ensure_not_tracked(self.engine.as_ref(), uuid).await?;

        self.locked(uuid, || async {
            let mut patch = StrategyPatch {
                params: Some(plan.params.clone()),
                comment: update.comment.clone(),
                ..StrategyPatch::default()
            };

            if plan.stop_loss != risk::StopLossChange::Keep {
                let exchange = self.exchange_for(&strategy.exchange, operator.uuid).await?;
                self.store
                    .apply(uuid, &StrategyPatch::pending_action(Some(PendingAction::ReplacingStopLoss)))
                    .await?;

                match risk::apply_stop_loss_change(exchange.as_ref(), &strategy, &plan.stop_loss, Utc::now()).await {
                    Ok(details) => {
                        patch.exchange_orders_details = Some(details);
                        patch.pending_action = Some(None);
                    }
                    Err(failure) => {
                        let recovery = StrategyPatch {
                            exchange_orders_details: failure.orders_details,
                            pending_action: Some(None),
                            ..StrategyPatch::default()
                        };
                        if let Err(store_err) = self.store.apply(uuid, &recovery).await {
                            tracing::error!("failed to record stop-loss failure for {}: {}", uuid, store_err);
                        }
                        return Err(failure.error);
                    }
                }
            }

            let record = self.store.apply(uuid, &patch).await?;
            tracing::info!("Updated stop-loss/take-profit of {}", uuid);
            Ok(record)
        })
        .await
    }

    pub async fn engine_diagnostics(&self, operator: &Operator) -> ControlResult<EngineDiagnostics> {
        if !operator.is_admin {
            return Err(ControlError::PermissionDenied);
        }

        let ask = |endpoint: Diagnostic| async move {
            self.engine
                .diagnostic(endpoint)
                .await
                .unwrap_or_else(|e| e.to_string())
        };
        Ok(EngineDiagnostics {
            ping: ask(Diagnostic::Ping).await,
            status: ask(Diagnostic::Status).await,
            list: ask(Diagnostic::List).await,
        })
    }
}
