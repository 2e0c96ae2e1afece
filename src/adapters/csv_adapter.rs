//! CSV bar file adapter.
//!
//! Columns are matched by header name. `datetime` (or `timestamp`), `open`,
//! `high`, `low`, `close` and `volume` are required; `money` or `turnover`
//! and `symbol` are optional; any other column that parses as a number is
//! kept in [`Bar::extra`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use tracing::debug;

use crate::domain::bar::Bar;
use crate::domain::error::{AggregateError, StepTraderError};
use crate::ports::data_port::DataPort;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

pub struct CsvAdapter {
    base_path: PathBuf,
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, symbol: &str) -> PathBuf {
        self.base_path.join(format!("{}.csv", symbol))
    }
}

impl DataPort for CsvAdapter {
    fn load_bars(&self, symbol: &str) -> Result<Vec<Bar>, StepTraderError> {
        let mut bars = read_file(&self.csv_path(symbol))?;
        for bar in &mut bars {
            if bar.symbol.is_none() {
                bar.symbol = Some(symbol.to_string());
            }
        }
        Ok(bars)
    }
}

/// Parse a timestamp in any of the accepted layouts. A bare date is midnight.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

struct Columns {
    timestamp: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: usize,
    turnover: Option<usize>,
    symbol: Option<usize>,
    extra: Vec<(usize, String)>,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, AggregateError> {
        let names: Vec<String> = headers
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .collect();
        let find = |candidates: &[&str]| names.iter().position(|n| candidates.contains(&n.as_str()));
        let require = |field: &str, candidates: &[&str]| {
            find(candidates).ok_or_else(|| AggregateError::MissingField {
                field: field.to_string(),
                row: 0,
            })
        };

        let timestamp = require("datetime", &["datetime", "timestamp", "date", "time"])?;
        let open = require("open", &["open"])?;
        let high = require("high", &["high"])?;
        let low = require("low", &["low"])?;
        let close = require("close", &["close"])?;
        let volume = require("volume", &["volume", "vol"])?;
        let turnover = find(&["money", "turnover", "amount"]);
        let symbol = find(&["symbol", "code"]);

        let known = [Some(timestamp), Some(open), Some(high), Some(low), Some(close), Some(volume), turnover, symbol];
        let extra = names
            .iter()
            .enumerate()
            .filter(|(i, _)| !known.contains(&Some(*i)))
            .map(|(i, n)| (i, n.clone()))
            .collect();

        Ok(Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            turnover,
            symbol,
            extra,
        })
    }
}

fn number(record: &csv::StringRecord, index: usize, field: &str, row: usize) -> Result<f64, StepTraderError> {
    let raw = record
        .get(index)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AggregateError::MissingField {
            field: field.to_string(),
            row,
        })?;
    raw.parse().map_err(|e| StepTraderError::Data {
        reason: format!("row {row}: invalid {field} value '{raw}': {e}"),
    })
}

/// Read a bar series from any reader producing CSV with a header row.
pub fn read_bars<R: std::io::Read>(reader: R) -> Result<Vec<Bar>, StepTraderError> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr
        .headers()
        .map_err(|e| StepTraderError::Data {
            reason: format!("CSV header error: {}", e),
        })?
        .clone();
    let columns = Columns::from_headers(&headers)?;

    let mut bars = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        let row = i + 1;
        let record = result.map_err(|e| StepTraderError::Data {
            reason: format!("CSV parse error: {}", e),
        })?;

        let raw_ts = record
            .get(columns.timestamp)
            .ok_or_else(|| AggregateError::MissingField {
                field: "datetime".into(),
                row,
            })?;
        let timestamp = parse_timestamp(raw_ts).ok_or_else(|| StepTraderError::Data {
            reason: format!("row {row}: invalid datetime '{raw_ts}'"),
        })?;

        let mut bar = Bar::new(
            timestamp,
            number(&record, columns.open, "open", row)?,
            number(&record, columns.high, "high", row)?,
            number(&record, columns.low, "low", row)?,
            number(&record, columns.close, "close", row)?,
            number(&record, columns.volume, "volume", row)?,
        );
        if let Some(idx) = columns.turnover {
            if record.get(idx).is_some_and(|v| !v.trim().is_empty()) {
                bar.turnover = Some(number(&record, idx, "money", row)?);
            }
        }
        if let Some(idx) = columns.symbol {
            bar.symbol = record
                .get(idx)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from);
        }
        let mut extra = BTreeMap::new();
        for (idx, name) in &columns.extra {
            if let Some(value) = record.get(*idx).and_then(|v| v.trim().parse::<f64>().ok()) {
                extra.insert(name.clone(), value);
            }
        }
        bar.extra = extra;
        bars.push(bar);
    }

    debug!(bars = bars.len(), "CSV bars read");
    Ok(bars)
}

pub fn read_file(path: &Path) -> Result<Vec<Bar>, StepTraderError> {
    let content = fs::read_to_string(path).map_err(|e| StepTraderError::Data {
        reason: format!("failed to read {}: {}", path.display(), e),
    })?;
    read_bars(content.as_bytes())
}

/// Write bars with the same header layout [`read_bars`] accepts.
pub fn write_bars<W: std::io::Write>(writer: W, bars: &[Bar]) -> Result<(), StepTraderError> {
    let to_data = |e: csv::Error| StepTraderError::Data {
        reason: format!("CSV write error: {}", e),
    };
    let extra_names: Vec<String> = bars
        .iter()
        .flat_map(|b| b.extra.keys().cloned())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    let with_turnover = bars.iter().any(|b| b.turnover.is_some());
    let with_symbol = bars.iter().any(|b| b.symbol.is_some());

    let mut wtr = csv::Writer::from_writer(writer);
    let mut header: Vec<String> = ["datetime", "open", "high", "low", "close", "volume"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if with_turnover {
        header.push("money".into());
    }
    if with_symbol {
        header.push("symbol".into());
    }
    header.extend(extra_names.iter().cloned());
    wtr.write_record(&header).map_err(to_data)?;

    for bar in bars {
        let mut row = vec![
            bar.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            bar.open.to_string(),
            bar.high.to_string(),
            bar.low.to_string(),
            bar.close.to_string(),
            bar.volume.to_string(),
        ];
        if with_turnover {
            row.push(bar.turnover.map(|t| t.to_string()).unwrap_or_default());
        }
        if with_symbol {
            row.push(bar.symbol.clone().unwrap_or_default());
        }
        for name in &extra_names {
            row.push(bar.extra.get(name).map(|v| v.to_string()).unwrap_or_default());
        }
        wtr.write_record(&row).map_err(to_data)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_file(path: &Path, bars: &[Bar]) -> Result<(), StepTraderError> {
    let file = fs::File::create(path)?;
    write_bars(file, bars)
}
