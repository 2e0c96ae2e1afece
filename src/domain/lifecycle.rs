//! Position lifecycle state machine.
//!
//! [`PositionManager`] turns entry and exit requests into orders on an
//! [`ExecutionPort`] and folds the engine's notifications back into
//! [`Position`] state. Exit orders are replaced cancel-first: a new
//! take-profit or stop-loss is only submitted once the engine confirms the
//! previous one is gone, so two exits of the same kind are never live.
//!
//! Under [`Settlement::T1`] a position cannot place exits on the calendar
//! date its entry filled. Exit prices requested before the fill are parked
//! and promoted by [`PositionManager::promote_next_session`] on a later date.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::bar::Bar;
use super::error::{LifecycleError, UnsupportedExecution};
use super::order::{OrderNotification, OrderRef, OrderRequest, OrderStatus, Side};
use super::position::{
    CompletionReason, OrderRole, Outcome, PendingExits, Position, PositionId, PositionRecord,
};
use super::sizing::{SizingInputs, SizingRule};
use crate::ports::account_port::AccountPort;
use crate::ports::execution_port::ExecutionPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Settlement {
    #[default]
    T0,
    /// Exits are only allowed from the session after the entry fill.
    T1,
}

impl std::str::FromStr for Settlement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "t0" | "t+0" => Ok(Settlement::T0),
            "t1" | "t+1" => Ok(Settlement::T1),
            other => Err(format!("unknown settlement '{other}' (expected t0 or t1)")),
        }
    }
}

/// How an entry order is placed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Market,
    Limit(f64),
    /// Stop order that triggers when price breaks through the level.
    Break(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySize {
    Units(u64),
    Rule(SizingRule),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: Side,
    pub size: EntrySize,
    pub target_price: Option<f64>,
    pub stop_price: Option<f64>,
}

/// Whether an exit order went out now or waits on a cancel confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Submitted(OrderRef),
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitKind {
    TakeProfit,
    StopLoss,
}

impl ExitKind {
    fn role(self) -> OrderRole {
        match self {
            ExitKind::TakeProfit => OrderRole::TakeProfit,
            ExitKind::StopLoss => OrderRole::StopLoss,
        }
    }

    fn from_role(role: OrderRole) -> Option<Self> {
        match role {
            OrderRole::TakeProfit => Some(ExitKind::TakeProfit),
            OrderRole::StopLoss => Some(ExitKind::StopLoss),
            OrderRole::Open | OrderRole::Close => None,
        }
    }

    fn pending(self, pending: &mut PendingExits) -> &mut Option<f64> {
        match self {
            ExitKind::TakeProfit => &mut pending.take_profit,
            ExitKind::StopLoss => &mut pending.stop_loss,
        }
    }

    fn next_session(self, pending: &mut PendingExits) -> &mut Option<f64> {
        match self {
            ExitKind::TakeProfit => &mut pending.take_profit_next_session,
            ExitKind::StopLoss => &mut pending.stop_loss_next_session,
        }
    }

    fn request(self, symbol: &str, side: Side, size: u64, price: f64) -> OrderRequest {
        match self {
            ExitKind::TakeProfit => OrderRequest::limit(symbol, side, size, price),
            ExitKind::StopLoss => OrderRequest::stop(symbol, side, size, price),
        }
    }
}

pub struct PositionManager<B> {
    broker: B,
    settlement: Settlement,
    positions: BTreeMap<PositionId, Position>,
    index: HashMap<OrderRef, (PositionId, OrderRole)>,
    history: Vec<PositionRecord>,
    clock: Option<NaiveDateTime>,
    last_price: Option<f64>,
}

impl<B: ExecutionPort + AccountPort> PositionManager<B> {
    pub fn new(broker: B, settlement: Settlement) -> Self {
        Self {
            broker,
            settlement,
            positions: BTreeMap::new(),
            index: HashMap::new(),
            history: Vec::new(),
            clock: None,
            last_price: None,
        }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    pub fn settlement(&self) -> Settlement {
        self.settlement
    }

    pub fn now(&self) -> Option<NaiveDateTime> {
        self.clock
    }

    /// Move the clock to `bar`, let the engine match against it and apply
    /// every resulting notification.
    pub fn advance(&mut self, bar: &Bar) -> Result<(), UnsupportedExecution> {
        self.clock = Some(bar.timestamp);
        self.last_price = Some(bar.close);
        self.broker.on_bar(bar);
        self.process_notifications()
    }

    /// Apply notifications until the engine has nothing more to report.
    pub fn process_notifications(&mut self) -> Result<(), UnsupportedExecution> {
        loop {
            let batch = self.broker.poll_notifications();
            if batch.is_empty() {
                return Ok(());
            }
            for notification in &batch {
                self.on_order_notification(notification)?;
            }
        }
    }

    pub fn open_market(
        &mut self,
        request: &OpenRequest,
    ) -> Result<Option<PositionId>, LifecycleError> {
        self.open(request, EntryKind::Market)
    }

    pub fn open_limit(
        &mut self,
        request: &OpenRequest,
        price: f64,
    ) -> Result<Option<PositionId>, LifecycleError> {
        self.open(request, EntryKind::Limit(price))
    }

    pub fn open_break(
        &mut self,
        request: &OpenRequest,
        price: f64,
    ) -> Result<Option<PositionId>, LifecycleError> {
        self.open(request, EntryKind::Break(price))
    }

    /// Submit an entry order and start tracking its position.
    ///
    /// Returns `Ok(None)` when the size works out to zero or the engine
    /// refuses to create the order.
    pub fn open(
        &mut self,
        request: &OpenRequest,
        kind: EntryKind,
    ) -> Result<Option<PositionId>, LifecycleError> {
        let reference_price = match kind {
            EntryKind::Market => self.last_price.unwrap_or(0.0),
            EntryKind::Limit(price) | EntryKind::Break(price) => price,
        };
        let size = match request.size {
            EntrySize::Units(units) => units,
            EntrySize::Rule(rule) => {
                let inputs = SizingInputs {
                    account_value: self.broker.account_value(),
                    cash: self.broker.cash(),
                    margin_rate: self.broker.margin_rate(&request.symbol),
                    price: reference_price,
                    stop_price: request.stop_price,
                };
                rule.resolve(&inputs).ok_or(LifecycleError::SizingUndefined)?
            }
        };
        if size == 0 {
            debug!(symbol = %request.symbol, "entry sized to zero units; nothing submitted");
            return Ok(None);
        }

        let order_request = match kind {
            EntryKind::Market => OrderRequest::market(&request.symbol, request.side, size),
            EntryKind::Limit(price) => {
                OrderRequest::limit(&request.symbol, request.side, size, price)
            }
            EntryKind::Break(price) => {
                OrderRequest::stop(&request.symbol, request.side, size, price)
            }
        };
        let order = match self.broker.submit_order(&order_request) {
            Ok(order) => order,
            Err(e) => {
                warn!(symbol = %request.symbol, size, error = %e, "entry order not created");
                return Ok(None);
            }
        };

        let mut position = Position::new(order);
        position.pending.take_profit = request.target_price;
        position.pending.stop_loss = request.stop_price;
        let id = position.id;
        info!(
            position = %id,
            symbol = %request.symbol,
            side = ?request.side,
            ?kind,
            size,
            "entry submitted"
        );
        self.index.insert(id.0, (id, OrderRole::Open));
        self.positions.insert(id, position);
        Ok(Some(id))
    }

    pub fn set_take_profit(
        &mut self,
        id: PositionId,
        price: f64,
    ) -> Result<Placement, LifecycleError> {
        self.set_exit(id, ExitKind::TakeProfit, price)
    }

    pub fn set_stop_loss(&mut self, id: PositionId, price: f64) -> Result<Placement, LifecycleError> {
        self.set_exit(id, ExitKind::StopLoss, price)
    }

    /// Cancel the outstanding take-profit. Returns whether one was outstanding.
    pub fn cancel_take_profit(&mut self, id: PositionId) -> Result<bool, LifecycleError> {
        self.cancel_exit(id, ExitKind::TakeProfit)
    }

    /// Cancel the outstanding stop-loss. Returns whether one was outstanding.
    pub fn cancel_stop_loss(&mut self, id: PositionId) -> Result<bool, LifecycleError> {
        self.cancel_exit(id, ExitKind::StopLoss)
    }

    /// Exit at market once any outstanding take-profit and stop-loss are cancelled.
    pub fn close_position(&mut self, id: PositionId) -> Result<Placement, LifecycleError> {
        self.check_exit_allowed(id)?;
        let position = self
            .positions
            .get_mut(&id)
            .ok_or(LifecycleError::NoSuchPosition(id))?;

        position.pending.clear();
        position.pending.close = true;

        let mut waiting = false;
        let mut cancels = Vec::new();
        for role in [OrderRole::TakeProfit, OrderRole::StopLoss] {
            if let Some(order) = position.order_mut(role).filter(|o| o.is_alive()) {
                waiting = true;
                if !order.cancel_requested {
                    order.cancel_requested = true;
                    cancels.push(order.id);
                }
            }
        }
        for order in cancels {
            self.broker.cancel_order(order);
        }

        if waiting {
            debug!(position = %id, "close waits for exit cancellations");
            return Ok(Placement::Deferred);
        }
        self.submit_close(id)
    }

    /// Cancel an entry that has not filled yet. Returns whether a cancel was sent.
    pub fn cancel_entry(&mut self, id: PositionId) -> Result<bool, LifecycleError> {
        let position = self
            .positions
            .get_mut(&id)
            .ok_or(LifecycleError::NoSuchPosition(id))?;
        if position.is_finished() {
            return Err(LifecycleError::PositionFinished(id));
        }
        let entry = &mut position.entry;
        if !entry.is_alive() {
            return Ok(false);
        }
        if !entry.cancel_requested {
            entry.cancel_requested = true;
            self.broker.cancel_order(entry.id);
        }
        Ok(true)
    }

    /// Place exits parked for the next session once the date has moved past
    /// the entry fill date.
    pub fn promote_next_session(&mut self) {
        let Some(today) = self.clock.map(|c| c.date()) else {
            return;
        };

        let mut due = Vec::new();
        for position in self.positions.values_mut() {
            if position.is_finished() || !position.entry_date().is_some_and(|d| d < today) {
                continue;
            }
            for exit in [ExitKind::TakeProfit, ExitKind::StopLoss] {
                if let Some(price) = exit.next_session(&mut position.pending).take() {
                    due.push((position.id, exit, price));
                }
            }
        }

        for (id, exit, price) in due {
            debug!(position = %id, ?exit, price, "promoting next-session exit");
            if let Err(e) = self.set_exit(id, exit, price) {
                warn!(position = %id, ?exit, error = %e, "next-session exit not placed");
            }
        }
    }

    /// Fold one engine notification into position state.
    ///
    /// A partial fill is unrecoverable and returned as an error.
    pub fn on_order_notification(
        &mut self,
        notification: &OrderNotification,
    ) -> Result<(), UnsupportedExecution> {
        if notification.status == OrderStatus::PartiallyFilled {
            error!(order = %notification.order, "partial fill");
            return Err(UnsupportedExecution::PartialFill(notification.order));
        }

        let Some(&(id, role)) = self.index.get(&notification.order) else {
            debug!(order = %notification.order, status = ?notification.status, "notification for untracked order");
            return Ok(());
        };
        let Some(position) = self.positions.get_mut(&id) else {
            return Ok(());
        };

        match position
            .order_mut(role)
            .filter(|o| o.id == notification.order)
        {
            Some(order) => order.apply(notification),
            None => {
                if let Some(order) = position
                    .retired
                    .iter_mut()
                    .find(|o| o.id == notification.order)
                {
                    order.apply(notification);
                }
                return Ok(());
            }
        }
        if position.is_finished() {
            debug!(position = %id, order = %notification.order, status = ?notification.status, "late notification recorded");
            return Ok(());
        }

        use OrderStatus::*;
        match (role, notification.status) {
            (OrderRole::Open, Filled) => self.on_entry_filled(id),
            (OrderRole::Open, Canceled | Rejected | Expired | MarginCall) => {
                info!(position = %id, status = ?notification.status, "entry did not fill; position cancelled");
                self.finish(id, Outcome::Cancelled);
            }
            (OrderRole::Close, Filled) => self.complete(id, CompletionReason::Closed),
            (OrderRole::TakeProfit, Filled) => self.complete(id, CompletionReason::TookProfit),
            (OrderRole::StopLoss, Filled) => self.complete(id, CompletionReason::StoppedLoss),
            (OrderRole::TakeProfit | OrderRole::StopLoss, Canceled | Rejected | MarginCall) => {
                if notification.status != Canceled {
                    warn!(position = %id, ?role, status = ?notification.status, "exit order lost");
                }
                self.on_exit_gone(id, role);
            }
            (OrderRole::Close, Canceled | Rejected | MarginCall) => {
                warn!(position = %id, status = ?notification.status, "close order did not fill");
                if let Some(position) = self.positions.get_mut(&id) {
                    position.retire(OrderRole::Close);
                }
            }
            (_, Expired) => self.on_exit_expired(id, role),
            (_, Created | Submitted | Accepted | PartiallyFilled) => {}
        }
        Ok(())
    }

    /// The position that is neither completed nor cancelled, if any.
    pub fn running_position(&self) -> Option<&Position> {
        self.positions.values().find(|p| !p.is_finished())
    }

    pub fn position(&self, id: PositionId) -> Option<&Position> {
        self.positions.get(&id)
    }

    /// Remove finished positions, keeping a record of each in the history.
    pub fn take_finished(&mut self) -> Vec<Position> {
        let ids: Vec<PositionId> = self
            .positions
            .values()
            .filter(|p| p.is_finished())
            .map(|p| p.id)
            .collect();
        let mut finished = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(position) = self.positions.remove(&id) {
                self.index.retain(|_, (owner, _)| *owner != id);
                self.history.push(position.to_record());
                finished.push(position);
            }
        }
        finished
    }

    /// Records of every position archived by [`Self::take_finished`].
    pub fn history(&self) -> &[PositionRecord] {
        &self.history
    }

    fn check_exit_allowed(&self, id: PositionId) -> Result<(), LifecycleError> {
        let position = self
            .positions
            .get(&id)
            .ok_or(LifecycleError::NoSuchPosition(id))?;
        if position.is_finished() {
            return Err(LifecycleError::PositionFinished(id));
        }
        if !position.entry_filled() {
            return Err(LifecycleError::EntryNotFilled(id));
        }
        if position.is_closing() {
            return Err(LifecycleError::AlreadyClosing(id));
        }
        if self.settlement == Settlement::T1 {
            let today = self.clock.map(|c| c.date());
            if position.entry_date().is_some() && position.entry_date() == today {
                return Err(LifecycleError::T1Restricted(id));
            }
        }
        Ok(())
    }

    fn set_exit(
        &mut self,
        id: PositionId,
        exit: ExitKind,
        price: f64,
    ) -> Result<Placement, LifecycleError> {
        self.check_exit_allowed(id)?;
        let position = self
            .positions
            .get_mut(&id)
            .ok_or(LifecycleError::NoSuchPosition(id))?;
        let role = exit.role();

        let outstanding = position
            .slot(role)
            .filter(|o| o.is_alive())
            .map(|o| (o.id, o.cancel_requested));
        if let Some((order, cancel_sent)) = outstanding {
            *exit.pending(&mut position.pending) = Some(price);
            if !cancel_sent {
                if let Some(o) = position.order_mut(role) {
                    o.cancel_requested = true;
                }
                self.broker.cancel_order(order);
            }
            debug!(position = %id, ?exit, price, replacing = %order, "exit replacement deferred");
            return Ok(Placement::Deferred);
        }

        position.retire(role);
        *exit.pending(&mut position.pending) = None;
        let request = exit.request(
            position.symbol(),
            position.side().opposite(),
            position.filled_size(),
            price,
        );
        match self.broker.submit_order(&request) {
            Ok(order) => {
                let order_ref = order.id;
                self.index.insert(order_ref, (id, role));
                if let Some(slot) = position.exit_slot_mut(role) {
                    *slot = Some(order);
                }
                info!(position = %id, ?exit, price, order = %order_ref, "exit submitted");
                Ok(Placement::Submitted(order_ref))
            }
            Err(e) => Err(LifecycleError::ExitRejected {
                position: id,
                reason: e.to_string(),
            }),
        }
    }

    fn cancel_exit(&mut self, id: PositionId, exit: ExitKind) -> Result<bool, LifecycleError> {
        let position = self
            .positions
            .get_mut(&id)
            .ok_or(LifecycleError::NoSuchPosition(id))?;
        *exit.pending(&mut position.pending) = None;
        *exit.next_session(&mut position.pending) = None;

        let Some(order) = position.order_mut(exit.role()).filter(|o| o.is_alive()) else {
            return Ok(false);
        };
        if !order.cancel_requested {
            order.cancel_requested = true;
            let order_ref = order.id;
            self.broker.cancel_order(order_ref);
            debug!(position = %id, ?exit, order = %order_ref, "exit cancel requested");
        }
        Ok(true)
    }

    fn submit_close(&mut self, id: PositionId) -> Result<Placement, LifecycleError> {
        let position = self
            .positions
            .get_mut(&id)
            .ok_or(LifecycleError::NoSuchPosition(id))?;
        position.pending.close = false;
        let request = OrderRequest::market(
            position.symbol(),
            position.side().opposite(),
            position.filled_size(),
        );
        match self.broker.submit_order(&request) {
            Ok(order) => {
                let order_ref = order.id;
                self.index.insert(order_ref, (id, OrderRole::Close));
                position.close = Some(order);
                info!(position = %id, order = %order_ref, "close submitted");
                Ok(Placement::Submitted(order_ref))
            }
            Err(e) => Err(LifecycleError::ExitRejected {
                position: id,
                reason: e.to_string(),
            }),
        }
    }

    fn on_entry_filled(&mut self, id: PositionId) {
        let Some(position) = self.positions.get_mut(&id) else {
            return;
        };
        if let Some(execution) = position.entry.execution {
            info!(position = %id, price = execution.price, size = execution.size, "entry filled");
        }

        let mut marks = Vec::new();
        for exit in [ExitKind::TakeProfit, ExitKind::StopLoss] {
            if let Some(price) = exit.pending(&mut position.pending).take() {
                match self.settlement {
                    Settlement::T1 => {
                        *exit.next_session(&mut position.pending) = Some(price);
                        debug!(position = %id, ?exit, price, "exit parked until next session");
                    }
                    Settlement::T0 => marks.push((exit, price)),
                }
            }
        }
        for (exit, price) in marks {
            if let Err(e) = self.set_exit(id, exit, price) {
                warn!(position = %id, ?exit, error = %e, "exit not placed after entry fill");
            }
        }
    }

    fn complete(&mut self, id: PositionId, reason: CompletionReason) {
        let filled_role = match reason {
            CompletionReason::Closed => OrderRole::Close,
            CompletionReason::TookProfit => OrderRole::TakeProfit,
            CompletionReason::StoppedLoss => OrderRole::StopLoss,
        };
        let Some(position) = self.positions.get_mut(&id) else {
            return;
        };
        position.outcome = Some(Outcome::Completed(reason));
        position.pending.clear();

        let mut cancels = Vec::new();
        for role in [OrderRole::TakeProfit, OrderRole::StopLoss, OrderRole::Close] {
            if role == filled_role {
                continue;
            }
            if let Some(order) = position.order_mut(role).filter(|o| o.is_alive()) {
                if !order.cancel_requested {
                    order.cancel_requested = true;
                    cancels.push(order.id);
                }
            }
        }
        for order in cancels {
            self.broker.cancel_order(order);
        }
        info!(position = %id, ?reason, "position completed");
    }

    fn finish(&mut self, id: PositionId, outcome: Outcome) {
        if let Some(position) = self.positions.get_mut(&id) {
            position.outcome = Some(outcome);
            position.pending.clear();
        }
    }

    fn on_exit_gone(&mut self, id: PositionId, role: OrderRole) {
        let Some(exit) = ExitKind::from_role(role) else {
            return;
        };
        let Some(position) = self.positions.get_mut(&id) else {
            return;
        };
        position.retire(role);
        let replacement = exit.pending(&mut position.pending).take();
        if let Some(price) = replacement {
            if let Err(e) = self.set_exit(id, exit, price) {
                warn!(position = %id, ?exit, error = %e, "replacement exit not placed");
            }
        }
        self.try_finish_close(id);
    }

    /// An expired exit is retried as a market close.
    fn on_exit_expired(&mut self, id: PositionId, role: OrderRole) {
        let Some(position) = self.positions.get_mut(&id) else {
            return;
        };
        position.retire(role);
        warn!(position = %id, ?role, "exit order expired");
        if role != OrderRole::Close && position.pending.close {
            self.try_finish_close(id);
            return;
        }
        if let Err(e) = self.close_position(id) {
            warn!(position = %id, error = %e, "close after expiry not placed");
        }
    }

    fn try_finish_close(&mut self, id: PositionId) {
        let Some(position) = self.positions.get(&id) else {
            return;
        };
        let ready = position.pending.close
            && !position.has_outstanding_exit(OrderRole::TakeProfit)
            && !position.has_outstanding_exit(OrderRole::StopLoss);
        if ready {
            if let Err(e) = self.submit_close(id) {
                warn!(position = %id, error = %e, "close not placed");
            }
        }
    }
}
