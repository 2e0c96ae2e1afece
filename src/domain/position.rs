//! Position records tracked by the lifecycle state machine.
//!
//! A position owns its entry order and at most one order in each exit slot
//! (take-profit, stop-loss, close). Exit prices requested while a slot is
//! busy are parked in [`PendingExits`] until the slot frees up.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::order::{Order, OrderRef, Side};

/// Positions are keyed by their entry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionId(pub OrderRef);

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0.0)
    }
}

/// Which slot of a position an order occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderRole {
    Open,
    Close,
    TakeProfit,
    StopLoss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionReason {
    Closed,
    TookProfit,
    StoppedLoss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Completed(CompletionReason),
    Cancelled,
}

/// Exit requests waiting on a cancel confirmation or the next session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingExits {
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub close: bool,
    pub take_profit_next_session: Option<f64>,
    pub stop_loss_next_session: Option<f64>,
}

impl PendingExits {
    pub fn clear(&mut self) {
        *self = PendingExits::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionPhase {
    Opening,
    Open,
    AdjustingExits,
    Closing,
    Completed(CompletionReason),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub entry: Order,
    pub take_profit: Option<Order>,
    pub stop_loss: Option<Order>,
    pub close: Option<Order>,
    pub pending: PendingExits,
    pub outcome: Option<Outcome>,
    /// Exit orders that were cancelled, rejected or expired.
    pub retired: Vec<Order>,
}

impl Position {
    pub fn new(entry: Order) -> Self {
        Self {
            id: PositionId(entry.id),
            entry,
            take_profit: None,
            stop_loss: None,
            close: None,
            pending: PendingExits::default(),
            outcome: None,
            retired: Vec::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.entry.symbol
    }

    pub fn side(&self) -> Side {
        self.entry.side
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, Some(Outcome::Completed(_)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == Some(Outcome::Cancelled)
    }

    pub fn completion_reason(&self) -> Option<CompletionReason> {
        match self.outcome {
            Some(Outcome::Completed(reason)) => Some(reason),
            _ => None,
        }
    }

    pub fn entry_filled(&self) -> bool {
        self.entry.is_filled()
    }

    /// Units held once the entry filled, zero before.
    pub fn filled_size(&self) -> u64 {
        self.entry.execution.map(|e| e.size).unwrap_or(0)
    }

    pub fn entry_date(&self) -> Option<NaiveDate> {
        self.entry.execution.map(|e| e.at.date())
    }

    pub fn is_closing(&self) -> bool {
        self.close.is_some() || self.pending.close
    }

    pub fn slot(&self, role: OrderRole) -> Option<&Order> {
        match role {
            OrderRole::Open => Some(&self.entry),
            OrderRole::Close => self.close.as_ref(),
            OrderRole::TakeProfit => self.take_profit.as_ref(),
            OrderRole::StopLoss => self.stop_loss.as_ref(),
        }
    }

    pub(crate) fn exit_slot_mut(&mut self, role: OrderRole) -> Option<&mut Option<Order>> {
        match role {
            OrderRole::Open => None,
            OrderRole::Close => Some(&mut self.close),
            OrderRole::TakeProfit => Some(&mut self.take_profit),
            OrderRole::StopLoss => Some(&mut self.stop_loss),
        }
    }

    pub(crate) fn order_mut(&mut self, role: OrderRole) -> Option<&mut Order> {
        match role {
            OrderRole::Open => Some(&mut self.entry),
            _ => self.exit_slot_mut(role)?.as_mut(),
        }
    }

    /// Move an exit order out of its slot into the retired list.
    pub(crate) fn retire(&mut self, role: OrderRole) {
        let taken = self.exit_slot_mut(role).and_then(|slot| slot.take());
        if let Some(order) = taken {
            self.retired.push(order);
        }
    }

    pub fn has_outstanding_exit(&self, role: OrderRole) -> bool {
        self.slot(role).is_some_and(|o| o.is_alive())
    }

    pub fn phase(&self) -> PositionPhase {
        match self.outcome {
            Some(Outcome::Completed(reason)) => PositionPhase::Completed(reason),
            Some(Outcome::Cancelled) => PositionPhase::Cancelled,
            None if !self.entry_filled() => PositionPhase::Opening,
            None if self.is_closing() => PositionPhase::Closing,
            None => {
                let cancelling = [OrderRole::TakeProfit, OrderRole::StopLoss]
                    .into_iter()
                    .filter_map(|r| self.slot(r))
                    .any(|o| o.cancel_requested);
                if cancelling || self.pending.take_profit.is_some() || self.pending.stop_loss.is_some()
                {
                    PositionPhase::AdjustingExits
                } else {
                    PositionPhase::Open
                }
            }
        }
    }

    /// The exit order that filled, or the one currently working towards a close.
    fn exit_order(&self) -> Option<&Order> {
        match self.completion_reason() {
            Some(CompletionReason::Closed) => self.close.as_ref(),
            Some(CompletionReason::TookProfit) => self.take_profit.as_ref(),
            Some(CompletionReason::StoppedLoss) => self.stop_loss.as_ref(),
            None => self.close.as_ref(),
        }
    }

    /// Flat summary used for persistence and reporting.
    pub fn to_record(&self) -> PositionRecord {
        let exit = self.exit_order();
        let exit_exec = exit.and_then(|o| o.execution);
        PositionRecord {
            id: self.id,
            symbol: self.entry.symbol.clone(),
            side: self.entry.side,
            entry_price: self.entry.price,
            entry_size: self.entry.size,
            entry_executed_price: self.entry.execution.map(|e| e.price),
            entry_executed_size: self.entry.execution.map(|e| e.size),
            entry_executed_at: self.entry.execution.map(|e| e.at),
            exit_price: exit.and_then(|o| o.price),
            exit_size: exit.map(|o| o.size),
            exit_executed_price: exit_exec.map(|e| e.price),
            exit_executed_size: exit_exec.map(|e| e.size),
            exit_executed_at: exit_exec.map(|e| e.at),
            reason: self.completion_reason(),
            cancelled: self.is_cancelled(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: PositionId,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Option<f64>,
    pub entry_size: u64,
    pub entry_executed_price: Option<f64>,
    pub entry_executed_size: Option<u64>,
    pub entry_executed_at: Option<NaiveDateTime>,
    pub exit_price: Option<f64>,
    pub exit_size: Option<u64>,
    pub exit_executed_price: Option<f64>,
    pub exit_executed_size: Option<u64>,
    pub exit_executed_at: Option<NaiveDateTime>,
    pub reason: Option<CompletionReason>,
    pub cancelled: bool,
}

impl PositionRecord {
    /// Realized profit before commission, when both legs executed.
    pub fn gross_pnl(&self) -> Option<f64> {
        let entry = self.entry_executed_price?;
        let exit = self.exit_executed_price?;
        let size = self.exit_executed_size? as f64;
        Some(match self.side {
            Side::Buy => (exit - entry) * size,
            Side::Sell => (entry - exit) * size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{OrderNotification, OrderRequest, OrderStatus};
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn sample_position() -> Position {
        Position::new(Order::from_request(
            OrderRef(1),
            &OrderRequest::market("000001", Side::Buy, 100),
        ))
    }

    fn filled_position() -> Position {
        let mut p = sample_position();
        p.entry
            .apply(&OrderNotification::filled(OrderRef(1), 10.0, 100, at(9, 35)));
        p
    }

    #[test]
    fn new_position_is_opening() {
        let p = sample_position();
        assert_eq!(p.id, PositionId(OrderRef(1)));
        assert_eq!(p.phase(), PositionPhase::Opening);
        assert_eq!(p.filled_size(), 0);
        assert!(!p.is_finished());
    }

    #[test]
    fn filled_position_is_open() {
        let p = filled_position();
        assert_eq!(p.phase(), PositionPhase::Open);
        assert_eq!(p.filled_size(), 100);
        assert_eq!(p.entry_date(), Some(at(9, 35).date()));
    }

    #[test]
    fn pending_mark_means_adjusting() {
        let mut p = filled_position();
        p.pending.take_profit = Some(11.0);
        assert_eq!(p.phase(), PositionPhase::AdjustingExits);
    }

    #[test]
    fn pending_close_means_closing() {
        let mut p = filled_position();
        p.pending.close = true;
        assert!(p.is_closing());
        assert_eq!(p.phase(), PositionPhase::Closing);
    }

    #[test]
    fn retire_moves_order_to_audit_list() {
        let mut p = filled_position();
        p.take_profit = Some(Order::from_request(
            OrderRef(2),
            &OrderRequest::limit("000001", Side::Sell, 100, 11.0),
        ));
        p.retire(OrderRole::TakeProfit);
        assert!(p.take_profit.is_none());
        assert_eq!(p.retired.len(), 1);
        p.retire(OrderRole::TakeProfit);
        assert_eq!(p.retired.len(), 1);
    }

    #[test]
    fn record_of_take_profit_completion() {
        let mut p = filled_position();
        let mut tp = Order::from_request(
            OrderRef(2),
            &OrderRequest::limit("000001", Side::Sell, 100, 11.0),
        );
        tp.apply(&OrderNotification::filled(OrderRef(2), 11.0, 100, at(10, 0)));
        p.take_profit = Some(tp);
        p.outcome = Some(Outcome::Completed(CompletionReason::TookProfit));

        let record = p.to_record();
        assert_eq!(record.reason, Some(CompletionReason::TookProfit));
        assert_eq!(record.exit_price, Some(11.0));
        assert_eq!(record.exit_executed_at, Some(at(10, 0)));
        assert!(!record.cancelled);
        assert!((record.gross_pnl().unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn record_of_cancelled_entry() {
        let mut p = sample_position();
        p.entry
            .apply(&OrderNotification::status(OrderRef(1), OrderStatus::Canceled));
        p.outcome = Some(Outcome::Cancelled);
        let record = p.to_record();
        assert!(record.cancelled);
        assert_eq!(record.reason, None);
        assert_eq!(record.gross_pnl(), None);
        assert_eq!(p.phase(), PositionPhase::Cancelled);
    }
}
