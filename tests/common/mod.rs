#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::VecDeque;
use std::path::Path;
use steptrader::adapters::csv_adapter;
use steptrader::domain::bar::Bar;
use steptrader::domain::calendar::{Frequency, TradingCalendar};
use steptrader::domain::order::{Order, OrderNotification, OrderRef, OrderRequest};
use steptrader::ports::account_port::AccountPort;
use steptrader::ports::execution_port::{ExecutionError, ExecutionPort};

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

pub fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
    day(d).and_hms_opt(h, m, 0).unwrap()
}

pub fn flat_bar(timestamp: NaiveDateTime, price: f64) -> Bar {
    Bar::new(timestamp, price, price + 0.2, price - 0.2, price, 1_000.0)
}

/// Complete calendar grid for `days`, with a slow upward drift in price.
pub fn grid_series(
    calendar: &TradingCalendar,
    frequency: Frequency,
    days: &[NaiveDate],
) -> Vec<Bar> {
    let mut bars = Vec::new();
    let mut price = 10.0;
    for d in days {
        for t in calendar.grid_for_date(*d, frequency).unwrap() {
            bars.push(flat_bar(t, price));
            price += 0.01;
        }
    }
    bars
}

pub fn write_series(dir: &Path, symbol: &str, bars: &[Bar]) {
    csv_adapter::write_file(&dir.join(format!("{symbol}.csv")), bars).unwrap();
}

/// Engine that accepts everything and only reports what tests inject.
#[derive(Default)]
pub struct ScriptedBroker {
    pub next: u64,
    pub submitted: Vec<Order>,
    pub cancelled: Vec<OrderRef>,
    pub queue: VecDeque<OrderNotification>,
}

impl ScriptedBroker {
    pub fn last_submitted(&self) -> &Order {
        self.submitted.last().unwrap()
    }
}

impl ExecutionPort for ScriptedBroker {
    fn submit_order(&mut self, request: &OrderRequest) -> Result<Order, ExecutionError> {
        self.next += 1;
        let order = Order::from_request(OrderRef(self.next), request);
        self.submitted.push(order.clone());
        Ok(order)
    }

    fn cancel_order(&mut self, order: OrderRef) {
        self.cancelled.push(order);
    }

    fn on_bar(&mut self, _bar: &Bar) {}

    fn poll_notifications(&mut self) -> Vec<OrderNotification> {
        self.queue.drain(..).collect()
    }
}

impl AccountPort for ScriptedBroker {
    fn cash(&self) -> f64 {
        100_000.0
    }

    fn account_value(&self) -> f64 {
        100_000.0
    }

    fn margin_rate(&self, _symbol: &str) -> f64 {
        1.0
    }
}
