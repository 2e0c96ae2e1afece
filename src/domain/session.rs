//! Resumable session state.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::controller::StepInfo;
use super::error::StepTraderError;
use super::metrics::{EquityPoint, Metrics};
use super::position::PositionRecord;

/// What is persisted between runs of a stepping session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub name: String,
    /// Cash the session started with, the base for its returns.
    #[serde(default)]
    pub initial_cash: f64,
    pub cash: f64,
    pub last_bar_timestamp: Option<NaiveDateTime>,
    pub completed: Vec<PositionRecord>,
    pub running: Option<PositionRecord>,
    /// Account value after every bar seen so far.
    #[serde(default)]
    pub equity: Vec<EquityPoint>,
}

impl SessionState {
    pub fn new(name: impl Into<String>, cash: f64) -> Self {
        Self {
            name: name.into(),
            initial_cash: cash,
            cash,
            last_bar_timestamp: None,
            completed: Vec::new(),
            running: None,
            equity: Vec::new(),
        }
    }

    /// Fold one published snapshot into the state.
    pub fn record(&mut self, info: &StepInfo) {
        self.cash = info.cash;
        if let Some(bar) = &info.bar {
            self.last_bar_timestamp = Some(bar.timestamp);
            let point = EquityPoint {
                timestamp: bar.timestamp,
                value: info.account_value,
            };
            // a resumed run republishes the bar it stopped on
            match self.equity.last_mut() {
                Some(last) if last.timestamp == bar.timestamp => *last = point,
                _ => self.equity.push(point),
            }
        }
        self.completed.extend(
            info.finished
                .iter()
                .filter(|p| p.is_completed())
                .map(|p| p.to_record()),
        );
        self.running = info.position.as_ref().map(|p| p.to_record());
    }

    pub fn metrics(&self, risk_free_rate: f64) -> Metrics {
        let base = if self.initial_cash > 0.0 {
            self.initial_cash
        } else {
            self.equity.first().map(|p| p.value).unwrap_or(self.cash)
        };
        Metrics::compute(base, &self.equity, &self.completed, risk_free_rate)
    }

    pub fn to_json(&self) -> Result<String, StepTraderError> {
        serde_json::to_string(self).map_err(|e| StepTraderError::SessionStore {
            reason: format!("failed to encode session state: {e}"),
        })
    }

    pub fn from_json(json: &str) -> Result<Self, StepTraderError> {
        serde_json::from_str(json).map_err(|e| StepTraderError::SessionStore {
            reason: format!("failed to decode session state: {e}"),
        })
    }
}
