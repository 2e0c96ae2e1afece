//! Account balance port.

pub trait AccountPort {
    fn cash(&self) -> f64;

    /// Cash plus open holdings marked to the latest price.
    fn account_value(&self) -> f64;

    fn margin_rate(&self, symbol: &str) -> f64;
}
