//! OHLCV bar representation.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One aggregated price bar. The timestamp marks the end of the bar window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turnover: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Any further numeric columns. Resampling keeps the latest bar's values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, f64>,
}

impl Bar {
    pub fn new(
        timestamp: NaiveDateTime,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            turnover: None,
            symbol: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_turnover(mut self, turnover: f64) -> Self {
        self.turnover = Some(turnover);
        self
    }

    /// Describe the first structural problem with this bar, if any.
    pub fn sanity_issue(&self) -> Option<String> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Some("prices must be positive".into());
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Some("volume must be non-negative".into());
        }
        if self.high < self.open.max(self.close) || self.low > self.open.min(self.close) {
            return Some(format!(
                "high {} / low {} do not bracket open {} and close {}",
                self.high, self.low, self.open, self.close
            ));
        }
        None
    }

    /// Whether a resting buy limit at `price` would trade during this bar.
    pub fn touches_below(&self, price: f64) -> bool {
        self.low <= price
    }

    /// Whether a resting sell limit at `price` would trade during this bar.
    pub fn touches_above(&self, price: f64) -> bool {
        self.high >= price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_bar() -> Bar {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(9, 35, 0)
            .unwrap();
        Bar::new(ts, 100.0, 110.0, 90.0, 105.0, 50_000.0)
    }

    #[test]
    fn sane_bar_has_no_issue() {
        assert_eq!(sample_bar().sanity_issue(), None);
    }

    #[test]
    fn negative_volume_is_flagged() {
        let mut bar = sample_bar();
        bar.volume = -1.0;
        assert!(bar.sanity_issue().unwrap().contains("volume"));
    }

    #[test]
    fn high_below_close_is_flagged() {
        let mut bar = sample_bar();
        bar.high = 104.0;
        assert!(bar.sanity_issue().is_some());
    }

    #[test]
    fn zero_price_is_flagged() {
        let mut bar = sample_bar();
        bar.low = 0.0;
        assert!(bar.sanity_issue().unwrap().contains("positive"));
    }

    #[test]
    fn touches() {
        let bar = sample_bar();
        assert!(bar.touches_below(90.0));
        assert!(!bar.touches_below(89.99));
        assert!(bar.touches_above(110.0));
        assert!(!bar.touches_above(110.01));
    }

    #[test]
    fn serializes_without_empty_optionals() {
        let json = serde_json::to_string(&sample_bar()).unwrap();
        assert!(json.contains("\"timestamp\":\"2024-01-15T09:35:00\""));
        assert!(!json.contains("turnover"));
        assert!(!json.contains("extra"));

        let back: Bar = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample_bar());
    }
}
