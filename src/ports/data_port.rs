//! Bar data ports: bulk series loading and the bar-by-bar feed.

use crate::domain::bar::Bar;
use crate::domain::error::StepTraderError;

/// Loads a whole raw bar series for one symbol.
pub trait DataPort {
    fn load_bars(&self, symbol: &str) -> Result<Vec<Bar>, StepTraderError>;
}

/// Hands the simulation one bar at a time, oldest first.
pub trait BarFeed {
    fn next_bar(&mut self) -> Option<Bar>;

    /// Bars not yet handed out, when known.
    fn remaining(&self) -> Option<usize> {
        None
    }
}
