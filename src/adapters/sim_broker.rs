//! Bar-driven simulated execution engine and cash account.
//!
//! Orders submitted while bar `t` is current become eligible from bar
//! `t + 1`. Market orders fill at the bar open. Limit and stop orders fill
//! at the open when the bar gaps through their price, otherwise at the price
//! itself when the bar's range reaches it. Every status change is queued and
//! handed out by [`ExecutionPort::poll_notifications`].

use std::collections::{HashMap, VecDeque};

use chrono::NaiveDateTime;
use tracing::{debug, info};

use crate::domain::bar::Bar;
use crate::domain::order::{
    Order, OrderKind, OrderNotification, OrderRef, OrderRequest, OrderStatus, Side,
};
use crate::ports::account_port::AccountPort;
use crate::ports::execution_port::{ExecutionError, ExecutionPort};

#[derive(Debug, Clone, PartialEq)]
pub struct SimBrokerConfig {
    pub cash: f64,
    pub commission_per_trade: f64,
    /// Percent of traded value.
    pub commission_pct: f64,
    /// Percent applied against the trader on market and stop fills.
    pub slippage_pct: f64,
    pub margin_rate: f64,
    /// Order sizes are rounded down to a multiple of this.
    pub lot_size: u64,
    pub allow_shorting: bool,
    /// Working orders expire after this many bars without filling.
    pub expire_after_bars: Option<u64>,
}

impl Default for SimBrokerConfig {
    fn default() -> Self {
        SimBrokerConfig {
            cash: 10_000.0,
            commission_per_trade: 0.0,
            commission_pct: 0.1,
            slippage_pct: 0.0,
            margin_rate: 1.0,
            lot_size: 1,
            allow_shorting: false,
            expire_after_bars: None,
        }
    }
}

/// Calculate commission: flat_fee + (trade_value * pct / 100).
pub fn calculate_commission(trade_value: f64, config: &SimBrokerConfig) -> f64 {
    config.commission_per_trade + (trade_value * config.commission_pct / 100.0)
}

/// Price an order would trade at during `bar`, before slippage.
pub fn fill_price(order: &Order, bar: &Bar) -> Option<f64> {
    let price = order.price;
    match (order.kind, order.side, price) {
        (OrderKind::Market, _, _) => Some(bar.open),
        (OrderKind::Limit, Side::Buy, Some(p)) | (OrderKind::Stop, Side::Sell, Some(p)) => {
            if bar.open <= p {
                Some(bar.open)
            } else if bar.low <= p {
                Some(p)
            } else {
                None
            }
        }
        (OrderKind::Limit, Side::Sell, Some(p)) | (OrderKind::Stop, Side::Buy, Some(p)) => {
            if bar.open >= p {
                Some(bar.open)
            } else if bar.high >= p {
                Some(p)
            } else {
                None
            }
        }
        (OrderKind::Limit | OrderKind::Stop, _, None) => None,
    }
}

#[derive(Debug, Clone)]
struct WorkingOrder {
    order: Order,
    eligible_from: u64,
    placed_at: u64,
}

pub struct SimBroker {
    config: SimBrokerConfig,
    cash: f64,
    holdings: HashMap<String, i64>,
    marks: HashMap<String, f64>,
    margin_rates: HashMap<String, f64>,
    working: Vec<WorkingOrder>,
    queue: VecDeque<OrderNotification>,
    next_ref: u64,
    bar_index: u64,
    clock: Option<NaiveDateTime>,
}

impl SimBroker {
    pub fn new(config: SimBrokerConfig) -> Self {
        Self {
            cash: config.cash,
            config,
            holdings: HashMap::new(),
            marks: HashMap::new(),
            margin_rates: HashMap::new(),
            working: Vec::new(),
            queue: VecDeque::new(),
            next_ref: 0,
            bar_index: 0,
            clock: None,
        }
    }

    pub fn with_margin_rate(mut self, symbol: impl Into<String>, rate: f64) -> Self {
        self.margin_rates.insert(symbol.into(), rate);
        self
    }

    pub fn config(&self) -> &SimBrokerConfig {
        &self.config
    }

    /// Signed units held; negative when short.
    pub fn holding(&self, symbol: &str) -> i64 {
        self.holdings.get(symbol).copied().unwrap_or(0)
    }

    /// Orders still waiting to fill.
    pub fn working_orders(&self) -> impl Iterator<Item = &Order> {
        self.working.iter().map(|w| &w.order)
    }

    fn round_to_lot(&self, size: u64) -> u64 {
        let lot = self.config.lot_size.max(1);
        size / lot * lot
    }

    fn slipped(&self, order: &Order, price: f64) -> f64 {
        if order.kind == OrderKind::Limit || self.config.slippage_pct == 0.0 {
            return price;
        }
        match order.side {
            Side::Buy => price * (1.0 + self.config.slippage_pct / 100.0),
            Side::Sell => price * (1.0 - self.config.slippage_pct / 100.0),
        }
    }

    fn execute(&mut self, order: &Order, price: f64, at: NaiveDateTime) {
        let value = price * order.size as f64;
        let commission = calculate_commission(value, &self.config);
        let held = self.holding(&order.symbol);

        match order.side {
            Side::Buy => {
                if value + commission > self.cash {
                    info!(order = %order.id, value, cash = self.cash, "buy exceeds cash");
                    self.queue
                        .push_back(OrderNotification::status(order.id, OrderStatus::MarginCall));
                    return;
                }
                self.cash -= value + commission;
                self.holdings
                    .insert(order.symbol.clone(), held + order.size as i64);
            }
            Side::Sell => {
                if !self.config.allow_shorting && held < order.size as i64 {
                    info!(order = %order.id, held, size = order.size, "sell exceeds holdings");
                    self.queue
                        .push_back(OrderNotification::status(order.id, OrderStatus::Rejected));
                    return;
                }
                self.cash += value - commission;
                self.holdings
                    .insert(order.symbol.clone(), held - order.size as i64);
            }
        }
        self.marks.entry(order.symbol.clone()).or_insert(price);
        info!(order = %order.id, side = ?order.side, price, size = order.size, commission, "order filled");
        self.queue
            .push_back(OrderNotification::filled(order.id, price, order.size, at));
    }
}

impl ExecutionPort for SimBroker {
    fn submit_order(&mut self, request: &OrderRequest) -> Result<Order, ExecutionError> {
        let size = self.round_to_lot(request.size);
        if size == 0 {
            return Err(ExecutionError::RiskRejected {
                reason: format!(
                    "size {} is below one lot of {}",
                    request.size, self.config.lot_size
                ),
            });
        }
        if request.kind != OrderKind::Market && !request.price.is_some_and(|p| p > 0.0) {
            return Err(ExecutionError::RiskRejected {
                reason: format!("{:?} order needs a positive price", request.kind),
            });
        }
        if size != request.size {
            debug!(requested = request.size, size, "order size rounded to lot");
        }

        self.next_ref += 1;
        let adjusted = OrderRequest {
            size,
            ..request.clone()
        };
        let order = Order::from_request(OrderRef(self.next_ref), &adjusted);
        self.working.push(WorkingOrder {
            order: order.clone(),
            eligible_from: self.bar_index + 1,
            placed_at: self.bar_index,
        });
        self.queue
            .push_back(OrderNotification::status(order.id, OrderStatus::Accepted));
        Ok(order)
    }

    fn cancel_order(&mut self, order: OrderRef) {
        match self.working.iter().position(|w| w.order.id == order) {
            Some(index) => {
                self.working.remove(index);
                self.queue
                    .push_back(OrderNotification::status(order, OrderStatus::Canceled));
            }
            None => debug!(order = %order, "cancel for order that is no longer working"),
        }
    }

    fn on_bar(&mut self, bar: &Bar) {
        self.bar_index += 1;
        self.clock = Some(bar.timestamp);

        let pending = std::mem::take(&mut self.working);
        let mut still_working = Vec::with_capacity(pending.len());
        for working in pending {
            let applies = bar
                .symbol
                .as_deref()
                .is_none_or(|s| s == working.order.symbol);
            if !applies || working.eligible_from > self.bar_index {
                still_working.push(working);
                continue;
            }
            match fill_price(&working.order, bar) {
                Some(price) => {
                    let price = self.slipped(&working.order, price);
                    self.execute(&working.order, price, bar.timestamp);
                }
                None => {
                    let expired = self
                        .config
                        .expire_after_bars
                        .is_some_and(|n| self.bar_index - working.placed_at >= n);
                    if expired {
                        debug!(order = %working.order.id, "order expired");
                        self.queue.push_back(OrderNotification::status(
                            working.order.id,
                            OrderStatus::Expired,
                        ));
                    } else {
                        still_working.push(working);
                    }
                }
            }
        }
        self.working = still_working;

        match &bar.symbol {
            Some(symbol) => {
                self.marks.insert(symbol.clone(), bar.close);
            }
            None => {
                for mark in self.marks.values_mut() {
                    *mark = bar.close;
                }
            }
        }
    }

    fn poll_notifications(&mut self) -> Vec<OrderNotification> {
        self.queue.drain(..).collect()
    }
}

impl AccountPort for SimBroker {
    fn cash(&self) -> f64 {
        self.cash
    }

    fn account_value(&self) -> f64 {
        self.cash
            + self
                .holdings
                .iter()
                .map(|(symbol, units)| {
                    *units as f64 * self.marks.get(symbol).copied().unwrap_or(0.0)
                })
                .sum::<f64>()
    }

    fn margin_rate(&self, symbol: &str) -> f64 {
        self.margin_rates
            .get(symbol)
            .copied()
            .unwrap_or(self.config.margin_rate)
    }
}
