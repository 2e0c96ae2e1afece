//! Entry size rules.

use serde::{Deserialize, Serialize};

/// Fraction of the margin-derived buying power actually committed.
pub const MARGIN_HEADROOM: f64 = 0.99;

/// How many units an entry should request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingRule {
    Fixed(u64),
    /// Risk `loss_tolerance` of account value between entry and stop.
    Risk { loss_tolerance: f64 },
    /// Spend a fraction of available cash.
    Percent(f64),
}

/// Account and price facts a sizing rule is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingInputs {
    pub account_value: f64,
    pub cash: f64,
    pub margin_rate: f64,
    pub price: f64,
    pub stop_price: Option<f64>,
}

/// `floor(cash / margin_rate * 0.99 / price)`.
pub fn margin_cap(cash: f64, margin_rate: f64, price: f64) -> u64 {
    if cash <= 0.0 || margin_rate <= 0.0 || price <= 0.0 {
        return 0;
    }
    to_units(cash / margin_rate * MARGIN_HEADROOM / price)
}

/// `floor(account_value * loss_tolerance / |entry - stop|)`, capped by [`margin_cap`].
pub fn risk_size(inputs: &SizingInputs, loss_tolerance: f64, stop_price: f64) -> u64 {
    let cap = margin_cap(inputs.cash, inputs.margin_rate, inputs.price);
    let risk_per_unit = (inputs.price - stop_price).abs();
    if risk_per_unit <= 0.0 {
        return cap;
    }
    to_units(inputs.account_value * loss_tolerance / risk_per_unit).min(cap)
}

fn to_units(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.floor() as u64
    } else {
        0
    }
}

impl SizingRule {
    /// Units to request, or `None` when the rule needs a stop price it was not given.
    pub fn resolve(&self, inputs: &SizingInputs) -> Option<u64> {
        match *self {
            SizingRule::Fixed(size) => Some(size),
            SizingRule::Risk { loss_tolerance } => inputs
                .stop_price
                .map(|stop| risk_size(inputs, loss_tolerance, stop)),
            SizingRule::Percent(fraction) => {
                if inputs.price <= 0.0 {
                    return Some(0);
                }
                Some(to_units(inputs.cash * fraction / inputs.price))
            }
        }
    }
}
