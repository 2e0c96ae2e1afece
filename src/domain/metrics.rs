//! Run statistics over a session's equity curve and completed positions.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::position::PositionRecord;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Account value at the close of one bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: NaiveDateTime,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_return: f64,
    /// Annualized from daily closing account values.
    pub sharpe_ratio: f64,
    /// Largest peak to trough fall, as a fraction of the peak.
    pub max_drawdown: f64,
    /// Longest run of bars spent below a previous peak.
    pub max_drawdown_bars: usize,
    pub total_trades: usize,
    pub trades_won: usize,
    pub trades_lost: usize,
    pub trades_breakeven: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
}

impl Metrics {
    pub fn compute(
        initial_capital: f64,
        equity: &[EquityPoint],
        trades: &[PositionRecord],
        risk_free_rate: f64,
    ) -> Self {
        let final_equity = equity.last().map(|p| p.value).unwrap_or(initial_capital);
        let total_return = if initial_capital > 0.0 {
            (final_equity - initial_capital) / initial_capital
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_bars) = compute_drawdown(equity);
        let daily = daily_closes(equity);
        let sharpe_ratio = compute_sharpe(&daily, risk_free_rate / TRADING_DAYS_PER_YEAR);

        let mut trades_won = 0usize;
        let mut trades_lost = 0usize;
        let mut trades_breakeven = 0usize;
        let mut total_wins = 0.0_f64;
        let mut total_losses = 0.0_f64;
        let mut largest_win = 0.0_f64;
        let mut largest_loss = 0.0_f64;

        for pnl in trades.iter().filter_map(PositionRecord::gross_pnl) {
            if pnl > 0.0 {
                trades_won += 1;
                total_wins += pnl;
                largest_win = largest_win.max(pnl);
            } else if pnl < 0.0 {
                trades_lost += 1;
                total_losses += pnl.abs();
                largest_loss = largest_loss.max(pnl.abs());
            } else {
                trades_breakeven += 1;
            }
        }

        let total_trades = trades_won + trades_lost + trades_breakeven;
        let win_rate = if total_trades > 0 {
            trades_won as f64 / total_trades as f64
        } else {
            0.0
        };
        let profit_factor = if total_losses > 0.0 {
            total_wins / total_losses
        } else if total_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        let avg_win = if trades_won > 0 {
            total_wins / trades_won as f64
        } else {
            0.0
        };
        let avg_loss = if trades_lost > 0 {
            total_losses / trades_lost as f64
        } else {
            0.0
        };

        Metrics {
            total_return,
            sharpe_ratio,
            max_drawdown,
            max_drawdown_bars,
            total_trades,
            trades_won,
            trades_lost,
            trades_breakeven,
            win_rate,
            profit_factor,
            avg_win,
            avg_loss,
            largest_win,
            largest_loss,
        }
    }
}

fn compute_drawdown(equity: &[EquityPoint]) -> (f64, usize) {
    let Some(first) = equity.first() else {
        return (0.0, 0);
    };
    let mut peak = first.value;
    let mut max_dd = 0.0_f64;
    let mut run = 0usize;
    let mut longest = 0usize;

    for point in equity {
        if point.value >= peak {
            peak = point.value;
            run = 0;
        } else if peak > 0.0 {
            max_dd = max_dd.max((peak - point.value) / peak);
            run += 1;
            longest = longest.max(run);
        }
    }
    (max_dd, longest)
}

/// Last account value of each date, in date order.
fn daily_closes(equity: &[EquityPoint]) -> Vec<f64> {
    let mut closes: Vec<(NaiveDate, f64)> = Vec::new();
    for point in equity {
        let date = point.timestamp.date();
        match closes.last_mut() {
            Some((last, value)) if *last == date => *value = point.value,
            _ => closes.push((date, point.value)),
        }
    }
    closes.into_iter().map(|(_, v)| v).collect()
}

fn compute_sharpe(closes: &[f64], daily_rf: f64) -> f64 {
    if closes.len() < 2 {
        return 0.0;
    }
    let returns: Vec<f64> = closes
        .windows(2)
        .map(|w| if w[0] > 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect();
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    if stddev > 0.0 {
        (mean - daily_rf) / stddev * TRADING_DAYS_PER_YEAR.sqrt()
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{OrderRef, Side};
    use crate::domain::position::{CompletionReason, PositionId};

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn daily_curve(values: &[f64]) -> Vec<EquityPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, &value)| EquityPoint {
                timestamp: at(1, 15) + chrono::Duration::days(i as i64),
                value,
            })
            .collect()
    }

    fn make_trade(id: u64, side: Side, entry: f64, exit: f64) -> PositionRecord {
        PositionRecord {
            id: PositionId(OrderRef(id)),
            symbol: "000001".into(),
            side,
            entry_price: None,
            entry_size: 100,
            entry_executed_price: Some(entry),
            entry_executed_size: Some(100),
            entry_executed_at: Some(at(2, 10)),
            exit_price: None,
            exit_size: Some(100),
            exit_executed_price: Some(exit),
            exit_executed_size: Some(100),
            exit_executed_at: Some(at(3, 10)),
            reason: Some(CompletionReason::Closed),
            cancelled: false,
        }
    }

    #[test]
    fn metrics_empty_session() {
        let metrics = Metrics::compute(100_000.0, &[], &[], 0.0);
        assert!((metrics.total_return - 0.0).abs() < f64::EPSILON);
        assert_eq!(metrics.total_trades, 0);
        assert!((metrics.sharpe_ratio - 0.0).abs() < f64::EPSILON);
        assert!((metrics.max_drawdown - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn metrics_total_return_from_initial_capital() {
        let metrics = Metrics::compute(100_000.0, &daily_curve(&[101_000.0, 110_000.0]), &[], 0.0);
        assert!((metrics.total_return - 0.10).abs() < 1e-9);
    }

    #[test]
    fn metrics_max_drawdown() {
        let curve = daily_curve(&[100.0, 110.0, 90.0, 95.0, 80.0, 100.0]);
        let (dd, bars) = compute_drawdown(&curve);
        assert!((dd - (110.0 - 80.0) / 110.0).abs() < 1e-9);
        assert_eq!(bars, 4);
    }

    #[test]
    fn metrics_sharpe_uses_daily_closes() {
        // intraday dips are ignored, only the last value of each date counts
        let curve = vec![
            EquityPoint { timestamp: at(2, 10), value: 100.0 },
            EquityPoint { timestamp: at(2, 15), value: 100.0 },
            EquityPoint { timestamp: at(3, 10), value: 50.0 },
            EquityPoint { timestamp: at(3, 15), value: 101.0 },
            EquityPoint { timestamp: at(4, 15), value: 103.0 },
        ];
        assert_eq!(daily_closes(&curve), vec![100.0, 101.0, 103.0]);
        let metrics = Metrics::compute(100.0, &curve, &[], 0.0);
        assert!(metrics.sharpe_ratio > 0.0);
        assert!((metrics.max_drawdown - 0.5).abs() < 1e-9);
    }

    #[test]
    fn metrics_flat_curve_has_zero_sharpe() {
        let metrics = Metrics::compute(100.0, &daily_curve(&[100.0, 100.0, 100.0]), &[], 0.0);
        assert!((metrics.sharpe_ratio - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn metrics_trade_stats() {
        let trades = vec![
            make_trade(1, Side::Buy, 10.0, 11.0),
            make_trade(2, Side::Buy, 10.0, 9.5),
            make_trade(3, Side::Sell, 10.0, 8.0),
            make_trade(4, Side::Buy, 10.0, 10.0),
        ];
        let metrics = Metrics::compute(100_000.0, &[], &trades, 0.0);

        assert_eq!(metrics.total_trades, 4);
        assert_eq!(metrics.trades_won, 2);
        assert_eq!(metrics.trades_lost, 1);
        assert_eq!(metrics.trades_breakeven, 1);
        assert!((metrics.win_rate - 0.5).abs() < f64::EPSILON);
        assert!((metrics.avg_win - 150.0).abs() < 1e-9);
        assert!((metrics.avg_loss - 50.0).abs() < 1e-9);
        assert!((metrics.largest_win - 200.0).abs() < 1e-9);
        assert!((metrics.profit_factor - 6.0).abs() < 1e-9);
    }

    #[test]
    fn metrics_skip_unexecuted_records() {
        let mut open = make_trade(1, Side::Buy, 10.0, 11.0);
        open.exit_executed_price = None;
        let metrics = Metrics::compute(100_000.0, &[], &[open], 0.0);
        assert_eq!(metrics.total_trades, 0);
        assert!((metrics.profit_factor - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn metrics_no_losses_gives_infinite_profit_factor() {
        let trades = vec![make_trade(1, Side::Buy, 10.0, 11.0)];
        let metrics = Metrics::compute(100_000.0, &[], &trades, 0.0);
        assert!(metrics.profit_factor.is_infinite());
    }
}
