//! Session persistence port.

use crate::domain::bar::Bar;
use crate::domain::error::StepTraderError;
use crate::domain::session::SessionState;

/// A persisted session: the cleaned bars it replays and its saved state.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub id: i64,
    pub bars: Vec<Bar>,
    pub state: SessionState,
}

pub trait SessionStore {
    fn create(&self, bars: &[Bar], state: &SessionState) -> Result<i64, StepTraderError>;

    fn get(&self, id: i64) -> Result<Option<StoredSession>, StepTraderError>;

    fn update(&self, id: i64, state: &SessionState) -> Result<(), StepTraderError>;

    /// Sessions whose name contains `keyword`, newest first. `None` lists all.
    fn search(&self, keyword: Option<&str>) -> Result<Vec<StoredSession>, StepTraderError>;
}
