//! Orders and execution notifications.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Identifier the execution engine assigns to a submitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderRef(pub u64);

impl fmt::Display for OrderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    Submitted,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    MarginCall,
}

impl OrderStatus {
    /// No further notifications are expected for an order in this status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::MarginCall
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub price: f64,
    pub size: u64,
    pub at: NaiveDateTime,
}

/// What a caller asks the execution engine to place.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub size: u64,
    /// Trigger price for limit and stop orders.
    pub price: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: Side, size: u64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            kind: OrderKind::Market,
            size,
            price: None,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: Side, size: u64, price: f64) -> Self {
        Self {
            kind: OrderKind::Limit,
            price: Some(price),
            ..Self::market(symbol, side, size)
        }
    }

    pub fn stop(symbol: impl Into<String>, side: Side, size: u64, price: f64) -> Self {
        Self {
            kind: OrderKind::Stop,
            price: Some(price),
            ..Self::market(symbol, side, size)
        }
    }
}

/// Local record of an order as last reported by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderRef,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub size: u64,
    pub price: Option<f64>,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<Execution>,
    /// A cancel has been sent and not yet confirmed.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Order {
    pub fn from_request(id: OrderRef, request: &OrderRequest) -> Self {
        Self {
            id,
            symbol: request.symbol.clone(),
            side: request.side,
            kind: request.kind,
            size: request.size,
            price: request.price,
            status: OrderStatus::Submitted,
            execution: None,
            cancel_requested: false,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    /// Record a notification's status and execution details.
    pub fn apply(&mut self, notification: &OrderNotification) {
        self.status = notification.status;
        if let Some(execution) = notification.execution() {
            self.execution = Some(execution);
        }
        if self.status.is_terminal() {
            self.cancel_requested = false;
        }
    }
}

/// Status change reported by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderNotification {
    pub order: OrderRef,
    pub status: OrderStatus,
    pub executed_price: Option<f64>,
    pub executed_size: Option<u64>,
    pub executed_at: Option<NaiveDateTime>,
}

impl OrderNotification {
    pub fn status(order: OrderRef, status: OrderStatus) -> Self {
        Self {
            order,
            status,
            executed_price: None,
            executed_size: None,
            executed_at: None,
        }
    }

    pub fn filled(order: OrderRef, price: f64, size: u64, at: NaiveDateTime) -> Self {
        Self {
            order,
            status: OrderStatus::Filled,
            executed_price: Some(price),
            executed_size: Some(size),
            executed_at: Some(at),
        }
    }

    pub fn execution(&self) -> Option<Execution> {
        match (self.executed_price, self.executed_size, self.executed_at) {
            (Some(price), Some(size), Some(at)) => Some(Execution { price, size, at }),
            _ => None,
        }
    }
}
