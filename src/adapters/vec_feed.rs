//! In-memory bar feed.

use std::collections::VecDeque;

use crate::domain::bar::Bar;
use crate::ports::data_port::BarFeed;

/// Replays a prepared series in timestamp order.
#[derive(Debug, Clone, Default)]
pub struct VecFeed {
    bars: VecDeque<Bar>,
}

impl VecFeed {
    pub fn new(mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|b| b.timestamp);
        Self { bars: bars.into() }
    }
}

impl BarFeed for VecFeed {
    fn next_bar(&mut self) -> Option<Bar> {
        self.bars.pop_front()
    }

    fn remaining(&self) -> Option<usize> {
        Some(self.bars.len())
    }
}
