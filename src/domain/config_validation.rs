//! Configuration validation.
//!
//! Validates every field a stepping simulation reads before anything is built.

use crate::domain::calendar::{Frequency, TradingCalendar};
use crate::domain::error::StepTraderError;
use crate::domain::lifecycle::Settlement;
use crate::ports::config_port::ConfigPort;
use chrono::{NaiveDate, NaiveDateTime};

pub fn validate_simulation_config(config: &dyn ConfigPort) -> Result<(), StepTraderError> {
    validate_data(config)?;
    validate_calendar(config)?;
    validate_account(config)?;
    validate_policy(config)?;
    validate_sizing(config)?;
    validate_controller(config)?;
    Ok(())
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> StepTraderError {
    StepTraderError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn required(config: &dyn ConfigPort, section: &str, key: &str) -> Result<String, StepTraderError> {
    match config.get_string(section, key) {
        Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(StepTraderError::ConfigMissing {
            section: section.to_string(),
            key: key.to_string(),
        }),
    }
}

pub fn parse_date(value: &str, section: &str, key: &str) -> Result<NaiveDate, StepTraderError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| invalid(section, key, "invalid date format, expected YYYY-MM-DD"))
}

pub fn parse_timestamp(
    value: &str,
    section: &str,
    key: &str,
) -> Result<NaiveDateTime, StepTraderError> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M"))
        .map_err(|_| {
            invalid(
                section,
                key,
                "invalid timestamp format, expected YYYY-MM-DD HH:MM[:SS]",
            )
        })
}

fn validate_data(config: &dyn ConfigPort) -> Result<(), StepTraderError> {
    required(config, "data", "path")?;
    required(config, "data", "symbol")?;

    let start = config
        .get_string("data", "start_date")
        .map(|s| parse_date(&s, "data", "start_date"))
        .transpose()?;
    let end = config
        .get_string("data", "end_date")
        .map(|s| parse_date(&s, "data", "end_date"))
        .transpose()?;
    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            return Err(invalid(
                "data",
                "start_date",
                "start_date must not be after end_date",
            ));
        }
    }
    Ok(())
}

fn validate_calendar(config: &dyn ConfigPort) -> Result<(), StepTraderError> {
    let calendar = calendar_from_config(config)?;
    let source = frequency_from_config(config, "source_frequency")?;
    let target = match config.get_string("calendar", "target_frequency") {
        Some(_) => frequency_from_config(config, "target_frequency")?,
        None => source,
    };
    source
        .ratio_to(target)
        .map_err(|e| invalid("calendar", "target_frequency", e.to_string()))?;
    // every grid is the same per date, so any date exposes a non-dividing session
    let probe = NaiveDate::from_ymd_opt(2000, 1, 3).unwrap_or_default();
    for (key, frequency) in [("source_frequency", source), ("target_frequency", target)] {
        calendar
            .grid_for_date(probe, frequency)
            .map_err(|e| invalid("calendar", key, e.to_string()))?;
    }
    Ok(())
}

/// Build the trading calendar named by `[calendar] kind` and `sessions`.
pub fn calendar_from_config(config: &dyn ConfigPort) -> Result<TradingCalendar, StepTraderError> {
    let kind = config
        .get_string("calendar", "kind")
        .unwrap_or_else(|| "sessions".to_string());
    match kind.trim().to_ascii_lowercase().as_str() {
        "continuous" => Ok(TradingCalendar::Continuous),
        "sessions" => match config.get_string("calendar", "sessions") {
            Some(sessions) => TradingCalendar::parse_sessions(&sessions)
                .map_err(|e| invalid("calendar", "sessions", e.to_string())),
            None => Ok(TradingCalendar::a_share()),
        },
        other => Err(invalid(
            "calendar",
            "kind",
            format!("unknown calendar kind '{other}' (expected sessions or continuous)"),
        )),
    }
}

pub fn frequency_from_config(
    config: &dyn ConfigPort,
    key: &str,
) -> Result<Frequency, StepTraderError> {
    let raw = required(config, "calendar", key)?;
    Frequency::parse(&raw).map_err(|e| invalid("calendar", key, e.to_string()))
}

fn validate_account(config: &dyn ConfigPort) -> Result<(), StepTraderError> {
    if config.get_double("account", "cash", 0.0) <= 0.0 {
        return Err(invalid("account", "cash", "cash must be positive"));
    }
    for key in ["commission_pct", "commission_per_trade", "slippage_pct"] {
        if config.get_double("account", key, 0.0) < 0.0 {
            return Err(invalid("account", key, format!("{key} must be non-negative")));
        }
    }
    if config.get_double("account", "margin_rate", 1.0) <= 0.0 {
        return Err(invalid("account", "margin_rate", "margin_rate must be positive"));
    }
    if config.get_int("account", "lot_size", 1) < 1 {
        return Err(invalid("account", "lot_size", "lot_size must be at least 1"));
    }
    let risk_free_rate = config.get_double("account", "risk_free_rate", 0.0);
    if !(0.0..=1.0).contains(&risk_free_rate) {
        return Err(invalid(
            "account",
            "risk_free_rate",
            "risk_free_rate must be between 0 and 1",
        ));
    }
    if config.get_int("account", "expire_after_bars", 0) < 0 {
        return Err(invalid(
            "account",
            "expire_after_bars",
            "expire_after_bars must be non-negative",
        ));
    }
    Ok(())
}

fn validate_policy(config: &dyn ConfigPort) -> Result<(), StepTraderError> {
    if let Some(raw) = config.get_string("policy", "settlement") {
        raw.parse::<Settlement>()
            .map_err(|reason| invalid("policy", "settlement", reason))?;
    }
    Ok(())
}

fn validate_sizing(config: &dyn ConfigPort) -> Result<(), StepTraderError> {
    let mode = config
        .get_string("sizing", "mode")
        .unwrap_or_else(|| "fixed".to_string());
    match mode.trim().to_ascii_lowercase().as_str() {
        "fixed" => {
            if config.get_int("sizing", "size", 0) <= 0 {
                return Err(invalid("sizing", "size", "size must be positive"));
            }
        }
        "risk" => {
            let tolerance = config.get_double("sizing", "loss_tolerance", 0.0);
            if tolerance <= 0.0 || tolerance > 1.0 {
                return Err(invalid(
                    "sizing",
                    "loss_tolerance",
                    "loss_tolerance must be in (0, 1]",
                ));
            }
        }
        "percent" => {
            let percent = config.get_double("sizing", "percent", 0.0);
            if percent <= 0.0 || percent > 1.0 {
                return Err(invalid("sizing", "percent", "percent must be in (0, 1]"));
            }
        }
        other => {
            return Err(invalid(
                "sizing",
                "mode",
                format!("unknown sizing mode '{other}' (expected fixed, risk or percent)"),
            ));
        }
    }
    Ok(())
}

fn validate_controller(config: &dyn ConfigPort) -> Result<(), StepTraderError> {
    if let Some(raw) = config.get_string("controller", "from_timestamp") {
        parse_timestamp(&raw, "controller", "from_timestamp")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;

    const VALID: &str = r#"
[data]
path = ./bars
symbol = 000001
start_date = 2024-01-02
end_date = 2024-01-31

[calendar]
kind = sessions
sessions = 09:30-11:30,13:00-15:00
source_frequency = 5m
target_frequency = 15m

[account]
cash = 100000
commission_pct = 0.03
margin_rate = 1.0
lot_size = 100

[policy]
settlement = t1

[sizing]
mode = risk
loss_tolerance = 0.01

[controller]
from_timestamp = 2024-01-03 09:35:00
"#;

    fn make_config(content: &str) -> FileConfigAdapter {
        FileConfigAdapter::from_string(content).unwrap()
    }

    fn with_line(section: &str, line: &str) -> FileConfigAdapter {
        let header = format!("[{section}]\n");
        make_config(&VALID.replacen(&header, &format!("{header}{line}\n"), 1))
    }

    fn invalid_key(result: Result<(), StepTraderError>) -> (String, String) {
        match result {
            Err(StepTraderError::ConfigInvalid { section, key, .. }) => (section, key),
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn valid_config_passes() {
        validate_simulation_config(&make_config(VALID)).unwrap();
    }

    #[test]
    fn missing_symbol_fails() {
        let config = make_config(&VALID.replace("symbol = 000001\n", ""));
        assert!(matches!(
            validate_simulation_config(&config),
            Err(StepTraderError::ConfigMissing { ref key, .. }) if key == "symbol"
        ));
    }

    #[test]
    fn start_after_end_fails() {
        let config = make_config(&VALID.replace("2024-01-02", "2024-02-02"));
        assert_eq!(
            invalid_key(validate_simulation_config(&config)),
            ("data".into(), "start_date".into())
        );
    }

    #[test]
    fn bad_date_format_fails() {
        let config = make_config(&VALID.replace("2024-01-31", "31/01/2024"));
        assert_eq!(
            invalid_key(validate_simulation_config(&config)),
            ("data".into(), "end_date".into())
        );
    }

    #[test]
    fn non_multiple_target_frequency_fails() {
        let config = make_config(&VALID.replace("target_frequency = 15m", "target_frequency = 7m"));
        assert_eq!(
            invalid_key(validate_simulation_config(&config)),
            ("calendar".into(), "target_frequency".into())
        );
    }

    #[test]
    fn non_dividing_session_fails() {
        let config = make_config(
            &VALID
                .replace("source_frequency = 5m", "source_frequency = 7m")
                .replace("target_frequency = 15m", "target_frequency = 7m"),
        );
        assert_eq!(
            invalid_key(validate_simulation_config(&config)),
            ("calendar".into(), "source_frequency".into())
        );
    }

    #[test]
    fn oversized_frequency_fails() {
        let source = make_config(&VALID.replace("source_frequency = 5m", "source_frequency = 200000000000000d"));
        assert_eq!(
            invalid_key(validate_simulation_config(&source)),
            ("calendar".into(), "source_frequency".into())
        );
        let target = make_config(&VALID.replace("target_frequency = 15m", "target_frequency = 9999999999999999s"));
        assert_eq!(
            invalid_key(validate_simulation_config(&target)),
            ("calendar".into(), "target_frequency".into())
        );
    }

    #[test]
    fn unknown_calendar_kind_fails() {
        let config = make_config(&VALID.replace("kind = sessions", "kind = lunar"));
        assert_eq!(
            invalid_key(validate_simulation_config(&config)),
            ("calendar".into(), "kind".into())
        );
    }

    #[test]
    fn continuous_calendar_accepted() {
        let config = make_config(&VALID.replace("kind = sessions", "kind = continuous"));
        validate_simulation_config(&config).unwrap();
        assert_eq!(
            calendar_from_config(&config).unwrap(),
            TradingCalendar::Continuous
        );
    }

    #[test]
    fn default_sessions_are_a_share() {
        let config = make_config("[calendar]\n");
        assert_eq!(
            calendar_from_config(&config).unwrap(),
            TradingCalendar::a_share()
        );
    }

    #[test]
    fn cash_must_be_positive() {
        let config = make_config(&VALID.replace("cash = 100000", "cash = 0"));
        assert_eq!(
            invalid_key(validate_simulation_config(&config)),
            ("account".into(), "cash".into())
        );
    }

    #[test]
    fn negative_commission_fails() {
        let config = with_line("account", "commission_per_trade = -1");
        assert_eq!(
            invalid_key(validate_simulation_config(&config)),
            ("account".into(), "commission_per_trade".into())
        );
    }

    #[test]
    fn risk_free_rate_out_of_range_fails() {
        let config = with_line("account", "risk_free_rate = 1.5");
        assert_eq!(
            invalid_key(validate_simulation_config(&config)),
            ("account".into(), "risk_free_rate".into())
        );
    }

    #[test]
    fn zero_lot_size_fails() {
        let config = make_config(&VALID.replace("lot_size = 100", "lot_size = 0"));
        assert_eq!(
            invalid_key(validate_simulation_config(&config)),
            ("account".into(), "lot_size".into())
        );
    }

    #[test]
    fn unknown_settlement_fails() {
        let config = make_config(&VALID.replace("settlement = t1", "settlement = t2"));
        assert_eq!(
            invalid_key(validate_simulation_config(&config)),
            ("policy".into(), "settlement".into())
        );
    }

    #[test]
    fn risk_tolerance_out_of_range_fails() {
        let config = make_config(&VALID.replace("loss_tolerance = 0.01", "loss_tolerance = 1.5"));
        assert_eq!(
            invalid_key(validate_simulation_config(&config)),
            ("sizing".into(), "loss_tolerance".into())
        );
    }

    #[test]
    fn fixed_sizing_needs_size() {
        let config = make_config(&VALID.replace("mode = risk", "mode = fixed"));
        assert_eq!(
            invalid_key(validate_simulation_config(&config)),
            ("sizing".into(), "size".into())
        );
    }

    #[test]
    fn bad_from_timestamp_fails() {
        let config = make_config(&VALID.replace("2024-01-03 09:35:00", "tomorrow"));
        assert_eq!(
            invalid_key(validate_simulation_config(&config)),
            ("controller".into(), "from_timestamp".into())
        );
    }

    #[test]
    fn timestamps_accept_minutes_only() {
        assert_eq!(
            parse_timestamp("2024-01-03 09:35", "controller", "from_timestamp").unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 3)
                .unwrap()
                .and_hms_opt(9, 35, 0)
                .unwrap()
        );
    }
}
