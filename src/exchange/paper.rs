//! In-memory exchange for dry runs and tests.
//!
//! Positions, stop orders and fills live in process memory and can be saved to a
//! JSON state file between CLI runs. Failures can be scripted per operation.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Exchange, ExchangeConnector, ExchangeError, ExchangeResult};
use crate::models::{AccountInfo, Fill, PositionInfo, Side};

/// Taker fee charged on simulated closes
const PAPER_TAKER_FEE: Decimal = Decimal::from_parts(7, 0, 0, false, 4); // 0.0007

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    AccountInfo,
    Position,
    ClosePosition,
    OrderFills,
    CancelStopOrder,
    PlaceStopOrder,
}

/// Call log entry, in call order
#[derive(Debug, Clone, PartialEq)]
pub enum PaperCall {
    AccountInfo,
    Position(String),
    ClosePosition { symbol: String, side: Side, size: Decimal },
    OrderFills(i64),
    CancelStopOrder(i64),
    PlaceStopOrder {
        symbol: String,
        side: Side,
        trigger_price: Decimal,
        size: Decimal,
    },
}

impl PaperCall {
    fn op(&self) -> PaperOp {
        match self {
            PaperCall::AccountInfo => PaperOp::AccountInfo,
            PaperCall::Position(_) => PaperOp::Position,
            PaperCall::ClosePosition { .. } => PaperOp::ClosePosition,
            PaperCall::OrderFills(_) => PaperOp::OrderFills,
            PaperCall::CancelStopOrder(_) => PaperOp::CancelStopOrder,
            PaperCall::PlaceStopOrder { .. } => PaperOp::PlaceStopOrder,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaperPosition {
    pub size: Decimal,
    pub entry_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaperStopOrder {
    pub symbol: String,
    pub side: Side,
    pub trigger_price: Decimal,
    pub size: Decimal,
}

/// The part of the paper exchange that survives between runs
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaperBook {
    account: AccountInfo,
    positions: BTreeMap<String, PaperPosition>,
    stop_orders: BTreeMap<i64, PaperStopOrder>,
    fills: BTreeMap<i64, Vec<Fill>>,
    next_order_id: i64,
}

impl Default for PaperBook {
    fn default() -> Self {
        Self {
            account: AccountInfo {
                collateral: Decimal::ZERO,
                leverage: Decimal::ONE,
                free_collateral: Decimal::ZERO,
            },
            positions: BTreeMap::new(),
            stop_orders: BTreeMap::new(),
            fills: BTreeMap::new(),
            next_order_id: 1,
        }
    }
}

#[derive(Debug, Default)]
struct PaperState {
    book: PaperBook,
    failures: HashMap<PaperOp, VecDeque<ExchangeError>>,
    /// Number of fill queries that come back empty before fills show up
    fill_delay: usize,
    calls: Vec<PaperCall>,
}

impl PaperState {
    fn record(&mut self, call: PaperCall) -> ExchangeResult<()> {
        let op = call.op();
        self.calls.push(call);
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_order_id(&mut self) -> i64 {
        let id = self.book.next_order_id;
        self.book.next_order_id += 1;
        id
    }
}

pub struct PaperExchange {
    name: String,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(PaperState::default()),
        }
    }

    /// Load a saved book, or start empty when the file does not exist yet
    pub fn load(name: impl Into<String>, path: &Path) -> crate::Result<Self> {
        let mut state = PaperState::default();
        if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| format!("paper state read failed: {}", e))?;
            state.book = serde_json::from_str(&content)
                .map_err(|e| format!("paper state parse failed: {}", e))?;
        }
        Ok(Self {
            name: name.into(),
            state: Mutex::new(state),
        })
    }

    pub async fn save(&self, path: &Path) -> crate::Result<()> {
        let state = self.state.lock().await;
        let content = serde_json::to_string_pretty(&state.book)?;
        fs::write(path, content).map_err(|e| format!("paper state write failed: {}", e))?;
        Ok(())
    }

    pub async fn set_account(&self, collateral: Decimal, leverage: Decimal, free_collateral: Decimal) {
        self.state.lock().await.book.account = AccountInfo {
            collateral,
            leverage,
            free_collateral,
        };
    }

    /// Open (or replace) a position. `mark_price` is where simulated closes fill.
    pub async fn set_position(&self, symbol: &str, size: Decimal, entry_price: Decimal, mark_price: Decimal) {
        self.state.lock().await.book.positions.insert(
            symbol.to_string(),
            PaperPosition {
                size,
                entry_price: Some(entry_price),
                mark_price: Some(mark_price),
            },
        );
    }

    /// Register a stop order as if the engine had placed it
    pub async fn insert_stop_order(&self, order_id: i64, order: PaperStopOrder) {
        let mut state = self.state.lock().await;
        state.book.next_order_id = state.book.next_order_id.max(order_id + 1);
        state.book.stop_orders.insert(order_id, order);
    }

    pub async fn set_next_order_id(&self, order_id: i64) {
        self.state.lock().await.book.next_order_id = order_id;
    }

    /// Make the next `times` calls of `op` fail with `err`
    pub async fn fail_next(&self, op: PaperOp, err: ExchangeError, times: usize) {
        let mut state = self.state.lock().await;
        let queue = state.failures.entry(op).or_default();
        queue.extend(std::iter::repeat(err).take(times));
    }

    pub async fn set_fill_delay(&self, queries: usize) {
        self.state.lock().await.fill_delay = queries;
    }

    pub async fn calls(&self) -> Vec<PaperCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn stop_orders(&self) -> BTreeMap<i64, PaperStopOrder> {
        self.state.lock().await.book.stop_orders.clone()
    }

    pub async fn position_size(&self, symbol: &str) -> Decimal {
        self.state
            .lock()
            .await
            .book
            .positions
            .get(symbol)
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn account_info(&self) -> ExchangeResult<AccountInfo> {
        let mut state = self.state.lock().await;
        state.record(PaperCall::AccountInfo)?;
        Ok(state.book.account.clone())
    }

    async fn position(&self, symbol: &str) -> ExchangeResult<PositionInfo> {
        let mut state = self.state.lock().await;
        state.record(PaperCall::Position(symbol.to_string()))?;

        let position = state.book.positions.get(symbol);
        Ok(PositionInfo {
            symbol: symbol.to_string(),
            size: position.map(|p| p.size).unwrap_or(Decimal::ZERO),
            entry_price: position.and_then(|p| p.entry_price),
        })
    }

    async fn close_position(&self, symbol: &str, side: Side, size: Decimal) -> ExchangeResult<i64> {
        let mut state = self.state.lock().await;
        state.record(PaperCall::ClosePosition {
            symbol: symbol.to_string(),
            side,
            size,
        })?;

        let position = state
            .book
            .positions
            .get_mut(symbol)
            .filter(|p| size > Decimal::ZERO && p.size >= size)
            .ok_or(ExchangeError::InvalidReduceOnly)?;

        let price = position
            .mark_price
            .or(position.entry_price)
            .ok_or_else(|| ExchangeError::Rejected(format!("no market price for {}", symbol)))?;
        position.size -= size;
        if position.size.is_zero() {
            state.book.positions.remove(symbol);
        }

        let order_id = state.next_order_id();
        state.book.fills.insert(
            order_id,
            vec![Fill {
                order_id,
                price,
                size,
                fee: (price * size * PAPER_TAKER_FEE).round_dp(8),
            }],
        );

        tracing::info!("📄 Paper close {} {} {} @ {} (order {})", side, size, symbol, price, order_id);
        Ok(order_id)
    }

    async fn order_fills(&self, order_id: i64) -> ExchangeResult<Vec<Fill>> {
        let mut state = self.state.lock().await;
        state.record(PaperCall::OrderFills(order_id))?;

        if state.fill_delay > 0 {
            state.fill_delay -= 1;
            return Ok(Vec::new());
        }
        Ok(state.book.fills.get(&order_id).cloned().unwrap_or_default())
    }

    async fn cancel_stop_order(&self, order_id: i64) -> ExchangeResult<()> {
        let mut state = self.state.lock().await;
        state.record(PaperCall::CancelStopOrder(order_id))?;

        state
            .book
            .stop_orders
            .remove(&order_id)
            .map(|_| ())
            .ok_or(ExchangeError::NotFound)
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: Side,
        trigger_price: Decimal,
        size: Decimal,
    ) -> ExchangeResult<i64> {
        let mut state = self.state.lock().await;
        state.record(PaperCall::PlaceStopOrder {
            symbol: symbol.to_string(),
            side,
            trigger_price,
            size,
        })?;

        if trigger_price <= Decimal::ZERO {
            return Err(ExchangeError::Rejected("Invalid trigger price".to_string()));
        }
        let open_size = state.book.positions.get(symbol).map(|p| p.size).unwrap_or(Decimal::ZERO);
        if size <= Decimal::ZERO || size > open_size {
            return Err(ExchangeError::InvalidReduceOnly);
        }

        let order_id = state.next_order_id();
        state.book.stop_orders.insert(
            order_id,
            PaperStopOrder {
                symbol: symbol.to_string(),
                side,
                trigger_price,
                size,
            },
        );
        Ok(order_id)
    }
}

/// Hands every operator the same paper exchange
pub struct PaperConnector {
    exchange: Arc<PaperExchange>,
}

impl PaperConnector {
    pub fn new(exchange: Arc<PaperExchange>) -> Self {
        Self { exchange }
    }
}

#[async_trait]
impl ExchangeConnector for PaperConnector {
    async fn connect(&self, exchange: &str, _owner_uuid: Uuid) -> ExchangeResult<Arc<dyn Exchange>> {
        if !exchange.eq_ignore_ascii_case(&self.exchange.name) {
            return Err(ExchangeError::Rejected(format!("exchange {} is not supported", exchange)));
        }
        Ok(self.exchange.clone())
    }
}
