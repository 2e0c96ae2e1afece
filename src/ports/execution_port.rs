//! Order execution port.
//!
//! The execution engine owns matching. Callers submit and cancel orders and
//! learn about every status change through [`ExecutionPort::poll_notifications`].

use crate::domain::bar::Bar;
use crate::domain::order::{Order, OrderNotification, OrderRef, OrderRequest};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("order rejected by risk checks: {reason}")]
    RiskRejected { reason: String },
}

pub trait ExecutionPort {
    /// Place an order. `Err` means no order was created at all.
    fn submit_order(&mut self, request: &OrderRequest) -> Result<Order, ExecutionError>;

    /// Ask for cancellation. Confirmation arrives as a notification.
    fn cancel_order(&mut self, order: OrderRef);

    /// Advance the engine to a new bar, matching working orders against it.
    fn on_bar(&mut self, bar: &Bar);

    /// Drain queued status changes in the order they happened.
    fn poll_notifications(&mut self) -> Vec<OrderNotification>;
}
