//! Bar series validation and resampling.
//!
//! A series is valid for a calendar and frequency when, for every date it
//! touches, it contains exactly the calendar's grid of bar end timestamps.
//! Resampling folds consecutive source bars into coarser bars keyed by the
//! end of the target window.

use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

use super::bar::Bar;
use super::calendar::{Frequency, TradingCalendar};
use super::error::AggregateError;

fn session_dates(
    series: &[Bar],
    calendar: &TradingCalendar,
    frequency: Frequency,
) -> BTreeSet<NaiveDate> {
    series
        .iter()
        .map(|b| calendar.session_date(b.timestamp, frequency))
        .collect()
}

fn ensure_strictly_increasing(series: &[Bar]) -> Result<(), AggregateError> {
    for pair in series.windows(2) {
        if pair[1].timestamp == pair[0].timestamp {
            return Err(AggregateError::Duplicate(pair[1].timestamp));
        }
        if pair[1].timestamp < pair[0].timestamp {
            return Err(AggregateError::Unordered(pair[1].timestamp));
        }
    }
    Ok(())
}

/// Check that `series` matches the calendar grid exactly.
///
/// Grid generation failures are configuration errors and surface before any
/// comparison. A mismatch lists every missing and extra timestamp.
pub fn validate(
    series: &[Bar],
    calendar: &TradingCalendar,
    frequency: Frequency,
) -> Result<(), AggregateError> {
    ensure_strictly_increasing(series)?;

    let dates = session_dates(series, calendar, frequency);
    let expected: BTreeSet<NaiveDateTime> =
        calendar.grid(&dates, frequency)?.into_iter().collect();
    let actual: BTreeSet<NaiveDateTime> = series.iter().map(|b| b.timestamp).collect();

    let missing: Vec<NaiveDateTime> = expected.difference(&actual).copied().collect();
    let extra: Vec<NaiveDateTime> = actual.difference(&expected).copied().collect();
    if missing.is_empty() && extra.is_empty() {
        Ok(())
    } else {
        Err(AggregateError::GridMismatch {
            frequency: frequency.to_string(),
            missing,
            extra,
        })
    }
}

fn fold(window: &[&Bar], timestamp: NaiveDateTime) -> Option<Bar> {
    let first = window.first()?;
    let last = window.last()?;

    let mut high = first.high;
    let mut low = first.low;
    let mut volume = 0.0;
    let mut turnover: Option<f64> = None;
    for bar in window {
        high = high.max(bar.high);
        low = low.min(bar.low);
        volume += bar.volume;
        if let Some(t) = bar.turnover {
            turnover = Some(turnover.unwrap_or(0.0) + t);
        }
    }

    Some(Bar {
        timestamp,
        open: first.open,
        high,
        low,
        close: last.close,
        volume,
        turnover,
        symbol: last.symbol.clone(),
        extra: last.extra.clone(),
    })
}

/// Fold `series` from `from` into `to` bars on the calendar grid.
///
/// Target timestamps whose window holds no source bar are skipped. The input
/// is not validated here; see [`clean_and_resample`].
pub fn resample(
    series: &[Bar],
    from: Frequency,
    to: Frequency,
    calendar: &TradingCalendar,
) -> Result<Vec<Bar>, AggregateError> {
    let ratio = from.ratio_to(to)?;
    if ratio == 1 {
        return Ok(series.to_vec());
    }

    let mut sorted: Vec<&Bar> = series.iter().collect();
    sorted.sort_by_key(|b| b.timestamp);

    let dates = session_dates(series, calendar, from);
    let span: TimeDelta = to.duration();
    let mut out = Vec::new();
    for target in calendar.grid(&dates, to)? {
        let window_start = target - span;
        let lo = sorted.partition_point(|b| b.timestamp <= window_start);
        let hi = sorted.partition_point(|b| b.timestamp <= target);
        if lo >= hi {
            continue;
        }
        if let Some(bar) = fold(&sorted[lo..hi], target) {
            out.push(bar);
        }
    }
    Ok(out)
}

/// Restrict raw bars to `[start, end + 1 day)`, sort them, and validate.
pub fn clean_series(
    mut bars: Vec<Bar>,
    calendar: &TradingCalendar,
    frequency: Frequency,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<Vec<Bar>, AggregateError> {
    bars.retain(|b| {
        let d = b.timestamp.date();
        start.is_none_or(|s| d >= s) && end.is_none_or(|e| d <= e)
    });
    bars.sort_by_key(|b| b.timestamp);

    for bar in &bars {
        if let Some(reason) = bar.sanity_issue() {
            return Err(AggregateError::InvalidBar {
                timestamp: bar.timestamp,
                reason,
            });
        }
    }
    validate(&bars, calendar, frequency)?;
    Ok(bars)
}

/// [`clean_series`] followed by [`resample`].
pub fn clean_and_resample(
    bars: Vec<Bar>,
    calendar: &TradingCalendar,
    from: Frequency,
    to: Frequency,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<Vec<Bar>, AggregateError> {
    from.ratio_to(to)?;
    let cleaned = clean_series(bars, calendar, from, start, end)?;
    resample(&cleaned, from, to, calendar)
}

/// Require every auxiliary series to carry exactly the primary's timestamps.
pub fn ensure_aligned(
    reference: &str,
    primary: &[Bar],
    others: &[(String, Vec<Bar>)],
) -> Result<(), AggregateError> {
    for (name, series) in others {
        let aligned = series.len() == primary.len()
            && series
                .iter()
                .zip(primary)
                .all(|(a, b)| a.timestamp == b.timestamp);
        if !aligned {
            return Err(AggregateError::MisalignedSeries {
                name: name.clone(),
                reference: reference.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn bar(t: NaiveDateTime, price: f64) -> Bar {
        Bar::new(t, price, price + 1.0, price - 1.0, price + 0.5, 100.0)
    }

    fn full_day(day: u32, freq: Frequency) -> Vec<Bar> {
        let date = NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        TradingCalendar::a_share()
            .grid_for_date(date, freq)
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, t)| bar(t, 10.0 + i as f64))
            .collect()
    }

    fn five() -> Frequency {
        Frequency::minutes(5).unwrap()
    }

    #[test]
    fn three_bars_fold_into_one() {
        let series = vec![
            Bar::new(ts(2, 9, 35), 10.0, 11.0, 9.0, 10.0, 100.0),
            Bar::new(ts(2, 9, 40), 10.0, 12.0, 10.0, 11.0, 150.0),
            Bar::new(ts(2, 9, 45), 11.0, 11.0, 10.0, 10.5, 120.0),
        ];
        let fifteen = Frequency::minutes(15).unwrap();
        let out = resample(&series, five(), fifteen, &TradingCalendar::a_share()).unwrap();
        assert_eq!(out, vec![Bar::new(ts(2, 9, 45), 10.0, 12.0, 9.0, 10.5, 370.0)]);
    }

    #[test]
    fn complete_day_validates() {
        let series = full_day(2, five());
        assert!(validate(&series, &TradingCalendar::a_share(), five()).is_ok());
    }

    #[test]
    fn empty_series_validates() {
        assert!(validate(&[], &TradingCalendar::a_share(), five()).is_ok());
    }

    #[test]
    fn missing_interior_bar_is_named() {
        let mut series = full_day(2, five());
        let removed = series.remove(10).timestamp;
        let err = validate(&series, &TradingCalendar::a_share(), five()).unwrap_err();
        match err {
            AggregateError::GridMismatch { missing, extra, .. } => {
                assert_eq!(missing, vec![removed]);
                assert!(extra.is_empty());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn lunch_break_bar_is_extra() {
        let mut series = full_day(2, five());
        series.insert(24, bar(ts(2, 12, 0), 10.0));
        let err = validate(&series, &TradingCalendar::a_share(), five()).unwrap_err();
        match err {
            AggregateError::GridMismatch { missing, extra, .. } => {
                assert!(missing.is_empty());
                assert_eq!(extra, vec![ts(2, 12, 0)]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn duplicate_timestamp_rejected() {
        let mut series = full_day(2, five());
        let copy = series[3].clone();
        series.insert(4, copy);
        assert!(matches!(
            validate(&series, &TradingCalendar::a_share(), five()),
            Err(AggregateError::Duplicate(_))
        ));
    }

    #[test]
    fn non_dividing_frequency_is_configuration_error() {
        let seven = Frequency::minutes(7).unwrap();
        let series = vec![bar(ts(2, 9, 37), 10.0)];
        let err = validate(&series, &TradingCalendar::a_share(), seven).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn resample_to_30m_folds_six_bars() {
        let series = full_day(2, five());
        let thirty = Frequency::minutes(30).unwrap();
        let out = resample(&series, five(), thirty, &TradingCalendar::a_share()).unwrap();
        assert_eq!(out.len(), 8);

        let first = &out[0];
        assert_eq!(first.timestamp, ts(2, 10, 0));
        assert_eq!(first.open, series[0].open);
        assert_eq!(first.close, series[5].close);
        assert_eq!(first.high, series[5].high);
        assert_eq!(first.low, series[0].low);
        assert_eq!(first.volume, 600.0);

        let afternoon = &out[4];
        assert_eq!(afternoon.timestamp, ts(2, 13, 30));
        assert_eq!(afternoon.open, series[24].open);
    }

    #[test]
    fn resample_identity_at_ratio_one() {
        let series = full_day(2, five());
        let out = resample(&series, five(), five(), &TradingCalendar::a_share()).unwrap();
        assert_eq!(out, series);
    }

    #[test]
    fn resample_rejects_non_multiple() {
        let series = full_day(2, five());
        let err = resample(
            &series,
            five(),
            Frequency::minutes(7).unwrap(),
            &TradingCalendar::a_share(),
        )
        .unwrap_err();
        assert!(matches!(err, AggregateError::InvalidFrequencyRatio { .. }));
    }

    #[test]
    fn resample_skips_empty_windows() {
        let series: Vec<Bar> = full_day(2, five()).into_iter().take(6).collect();
        let out = resample(
            &series,
            five(),
            Frequency::minutes(30).unwrap(),
            &TradingCalendar::a_share(),
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp, ts(2, 10, 0));
    }

    #[test]
    fn resample_sums_turnover_and_keeps_latest_extra() {
        let mut series = full_day(2, five());
        for (i, b) in series.iter_mut().enumerate() {
            b.turnover = Some(1_000.0);
            b.extra.insert("open_interest".into(), i as f64);
        }
        let out = resample(
            &series,
            five(),
            Frequency::minutes(30).unwrap(),
            &TradingCalendar::a_share(),
        )
        .unwrap();
        assert_eq!(out[0].turnover, Some(6_000.0));
        assert_eq!(out[0].extra["open_interest"], 5.0);
    }

    #[test]
    fn continuous_resample_keys_last_window_at_midnight() {
        let hour = Frequency::parse("1h").unwrap();
        let day = Frequency::parse("1d").unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let series: Vec<Bar> = TradingCalendar::Continuous
            .grid_for_date(date, hour)
            .unwrap()
            .into_iter()
            .map(|t| bar(t, 50.0))
            .collect();
        assert!(validate(&series, &TradingCalendar::Continuous, hour).is_ok());

        let out = resample(&series, hour, day, &TradingCalendar::Continuous).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp, ts(3, 0, 0));
        assert_eq!(out[0].volume, 2_400.0);
    }

    #[test]
    fn clean_series_filters_and_sorts() {
        let mut raw = full_day(3, five());
        raw.extend(full_day(2, five()));
        raw.extend(full_day(4, five()));
        let start = NaiveDate::from_ymd_opt(2024, 1, 2);
        let end = NaiveDate::from_ymd_opt(2024, 1, 3);
        let cleaned = clean_series(raw, &TradingCalendar::a_share(), five(), start, end).unwrap();
        assert_eq!(cleaned.len(), 96);
        assert_eq!(cleaned[0].timestamp, ts(2, 9, 35));
        assert_eq!(cleaned[95].timestamp, ts(3, 15, 0));
    }

    #[test]
    fn clean_series_rejects_insane_bar() {
        let mut raw = full_day(2, five());
        raw[7].volume = -5.0;
        let err = clean_series(raw, &TradingCalendar::a_share(), five(), None, None).unwrap_err();
        assert!(matches!(err, AggregateError::InvalidBar { .. }));
    }

    #[test]
    fn clean_and_resample_checks_ratio_first() {
        let err = clean_and_resample(
            Vec::new(),
            &TradingCalendar::a_share(),
            five(),
            Frequency::minutes(12).unwrap(),
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, AggregateError::InvalidFrequencyRatio { .. }));
    }

    #[test]
    fn alignment() {
        let primary = full_day(2, five());
        let index = full_day(2, five());
        assert!(ensure_aligned("000001", &primary, &[("index".into(), index)]).is_ok());

        let short: Vec<Bar> = full_day(2, five()).into_iter().skip(1).collect();
        let err = ensure_aligned("000001", &primary, &[("index".into(), short)]).unwrap_err();
        assert!(matches!(err, AggregateError::MisalignedSeries { .. }));
    }
}
