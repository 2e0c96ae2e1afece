//! Trading calendars and bar frequencies.
//!
//! A calendar produces, for each date, the ordered grid of bar end
//! timestamps a complete series must contain at a given frequency.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};

use super::error::AggregateError;

/// Widest accepted bar, one year.
pub const MAX_FREQUENCY_SECONDS: i64 = 366 * 86_400;

/// Bar width in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Frequency {
    seconds: i64,
}

impl Frequency {
    pub fn from_seconds(seconds: i64) -> Result<Self, AggregateError> {
        if seconds <= 0 || seconds > MAX_FREQUENCY_SECONDS {
            return Err(AggregateError::InvalidFrequency(format!("{seconds}s")));
        }
        Ok(Self { seconds })
    }

    pub fn minutes(minutes: u32) -> Result<Self, AggregateError> {
        Self::from_seconds(i64::from(minutes) * 60)
    }

    /// Parse `30s`, `5m`, `5min`, `1h` or `1d`.
    pub fn parse(input: &str) -> Result<Self, AggregateError> {
        let trimmed = input.trim().to_ascii_lowercase();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        let value: i64 = digits
            .parse()
            .map_err(|_| AggregateError::InvalidFrequency(input.to_string()))?;
        let scale = match unit {
            "s" | "sec" => 1,
            "m" | "min" | "t" => 60,
            "h" => 3_600,
            "d" => 86_400,
            _ => return Err(AggregateError::InvalidFrequency(input.to_string())),
        };
        let seconds = value
            .checked_mul(scale)
            .ok_or_else(|| AggregateError::InvalidFrequency(input.to_string()))?;
        Self::from_seconds(seconds)
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn duration(&self) -> TimeDelta {
        TimeDelta::try_seconds(self.seconds).unwrap_or(TimeDelta::MAX)
    }

    /// The integer `k` with `coarser = k * self`.
    pub fn ratio_to(&self, coarser: Frequency) -> Result<i64, AggregateError> {
        if coarser.seconds % self.seconds != 0 {
            return Err(AggregateError::InvalidFrequencyRatio {
                from: self.to_string(),
                to: coarser.to_string(),
            });
        }
        Ok(coarser.seconds / self.seconds)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.seconds;
        if s % 86_400 == 0 {
            write!(f, "{}d", s / 86_400)
        } else if s % 3_600 == 0 {
            write!(f, "{}h", s / 3_600)
        } else if s % 60 == 0 {
            write!(f, "{}m", s / 60)
        } else {
            write!(f, "{s}s")
        }
    }
}

/// A trading window within one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SessionWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, AggregateError> {
        if end <= start {
            return Err(AggregateError::InvalidSession {
                window: format!("{}-{}", start.format("%H:%M"), end.format("%H:%M")),
                reason: "end must be after start".into(),
            });
        }
        Ok(Self { start, end })
    }

    /// Parse `HH:MM-HH:MM`.
    pub fn parse(input: &str) -> Result<Self, AggregateError> {
        let invalid = |reason: &str| AggregateError::InvalidSession {
            window: input.to_string(),
            reason: reason.to_string(),
        };
        let (start, end) = input
            .trim()
            .split_once('-')
            .ok_or_else(|| invalid("expected HH:MM-HH:MM"))?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M")
            .map_err(|e| invalid(&e.to_string()))?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M")
            .map_err(|e| invalid(&e.to_string()))?;
        Self::new(start, end)
    }
}

impl fmt::Display for SessionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TradingCalendar {
    /// Ordered, non-overlapping windows repeated on every date.
    Sessions(Vec<SessionWindow>),
    /// One window per date covering `[00:00, next 00:00)`.
    Continuous,
}

impl TradingCalendar {
    /// Morning and afternoon sessions of the Shanghai and Shenzhen exchanges.
    pub fn a_share() -> Self {
        let hm = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);
        TradingCalendar::Sessions(vec![
            SessionWindow {
                start: hm(9, 30),
                end: hm(11, 30),
            },
            SessionWindow {
                start: hm(13, 0),
                end: hm(15, 0),
            },
        ])
    }

    pub fn sessions(windows: Vec<SessionWindow>) -> Result<Self, AggregateError> {
        if windows.is_empty() {
            return Err(AggregateError::InvalidSession {
                window: String::new(),
                reason: "at least one session is required".into(),
            });
        }
        for pair in windows.windows(2) {
            if pair[1].start < pair[0].end {
                return Err(AggregateError::InvalidSession {
                    window: pair[1].to_string(),
                    reason: format!("overlaps or precedes {}", pair[0]),
                });
            }
        }
        Ok(TradingCalendar::Sessions(windows))
    }

    /// Parse a comma separated list of `HH:MM-HH:MM` windows.
    pub fn parse_sessions(input: &str) -> Result<Self, AggregateError> {
        let windows = input
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(SessionWindow::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Self::sessions(windows)
    }

    /// The calendar date whose grid contains a bar ending at `timestamp`.
    pub fn session_date(&self, timestamp: NaiveDateTime, frequency: Frequency) -> NaiveDate {
        match self {
            TradingCalendar::Sessions(_) => timestamp.date(),
            TradingCalendar::Continuous => timestamp
                .checked_sub_signed(frequency.duration())
                .unwrap_or(timestamp)
                .date(),
        }
    }

    /// Expected bar end timestamps for one date, ascending.
    pub fn grid_for_date(
        &self,
        date: NaiveDate,
        frequency: Frequency,
    ) -> Result<Vec<NaiveDateTime>, AggregateError> {
        let step = frequency.duration();
        let out_of_range = || {
            AggregateError::InvalidFrequency(format!("{frequency} steps past the end of {date}"))
        };
        let mut grid = Vec::new();
        match self {
            TradingCalendar::Sessions(windows) => {
                for window in windows {
                    let end = date.and_time(window.end);
                    let mut t = date.and_time(window.start);
                    while t < end {
                        t = t.checked_add_signed(step).ok_or_else(out_of_range)?;
                        grid.push(t);
                    }
                    if t > end {
                        return Err(AggregateError::NonDividingSession {
                            session: window.to_string(),
                            frequency: frequency.to_string(),
                        });
                    }
                }
            }
            TradingCalendar::Continuous => {
                let start = date.and_time(NaiveTime::MIN);
                let end = start
                    .checked_add_signed(TimeDelta::days(1))
                    .ok_or_else(out_of_range)?;
                let mut t = start;
                while t < end {
                    t = t.checked_add_signed(step).ok_or_else(out_of_range)?;
                    grid.push(t);
                }
                if t > end {
                    return Err(AggregateError::NonDividingSession {
                        session: "00:00-24:00".into(),
                        frequency: frequency.to_string(),
                    });
                }
            }
        }
        Ok(grid)
    }

    /// Concatenated grid over a set of dates.
    pub fn grid(
        &self,
        dates: &BTreeSet<NaiveDate>,
        frequency: Frequency,
    ) -> Result<Vec<NaiveDateTime>, AggregateError> {
        let mut grid = Vec::new();
        for date in dates {
            grid.extend(self.grid_for_date(*date, frequency)?);
        }
        Ok(grid)
    }
}

impl fmt::Display for TradingCalendar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingCalendar::Continuous => write!(f, "continuous"),
            TradingCalendar::Sessions(windows) => {
                let parts: Vec<String> = windows.iter().map(|w| w.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}
