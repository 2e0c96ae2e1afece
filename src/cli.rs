//! CLI definition and dispatch.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};

use crate::adapters::csv_adapter::{self, CsvAdapter};
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::sim_broker::{SimBroker, SimBrokerConfig};
use crate::adapters::vec_feed::VecFeed;
use crate::domain::aggregator;
use crate::domain::bar::Bar;
use crate::domain::calendar::{Frequency, TradingCalendar};
use crate::domain::config_validation::{
    calendar_from_config, frequency_from_config, parse_date, parse_timestamp,
    validate_simulation_config,
};
use crate::domain::controller::{Controller, OpenArgs, Signal, Simulation, SimulationConfig, StepInfo};
use crate::domain::error::StepTraderError;
use crate::domain::lifecycle::{PositionManager, Settlement};
use crate::domain::metrics::Metrics;
use crate::domain::order::Side;
use crate::domain::session::SessionState;
use crate::domain::sizing::SizingRule;
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataPort;
use crate::ports::session_port::SessionStore;

#[derive(Parser, Debug)]
#[command(name = "steptrader", about = "Bar-stepped trading simulator")]
pub struct Cli {
    /// The log verbosity level
    #[arg(short, long, global = true, default_value = "info")]
    pub verbosity: tracing::Level,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check a bar file against a calendar grid
    Validate {
        #[arg(short, long)]
        input: PathBuf,
        /// `continuous` or a list of `HH:MM-HH:MM` sessions
        #[arg(long, default_value = "09:30-11:30,13:00-15:00")]
        calendar: String,
        #[arg(short, long)]
        freq: String,
    },
    /// Validate a bar file and resample it to a coarser frequency
    Resample {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value = "09:30-11:30,13:00-15:00")]
        calendar: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
    },
    /// Step through a simulation interactively over stdin
    Step {
        #[arg(short, long)]
        config: PathBuf,
        /// Continue a stored session
        #[arg(long)]
        resume: Option<i64>,
    },
    /// Manage stored sessions
    #[cfg(feature = "sqlite")]
    Session {
        #[command(subcommand)]
        action: SessionCommand,
    },
}

#[cfg(feature = "sqlite")]
#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// Clean the configured bars and store them as a new session
    Create {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// List stored sessions, optionally filtered by name
    List {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        keyword: Option<String>,
    },
    /// Print one stored session's state
    Show {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        id: i64,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::Validate {
            input,
            calendar,
            freq,
        } => run_validate(&input, &calendar, &freq),
        Command::Resample {
            input,
            output,
            calendar,
            from,
            to,
            start,
            end,
        } => run_resample(&input, &output, &calendar, &from, &to, start, end),
        Command::Step { config, resume } => run_step(&config, resume),
        #[cfg(feature = "sqlite")]
        Command::Session { action } => run_session(action),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, StepTraderError> {
    let adapter = FileConfigAdapter::from_file(path)?;
    validate_simulation_config(&adapter)?;
    Ok(adapter)
}

pub fn parse_calendar(input: &str) -> Result<TradingCalendar, StepTraderError> {
    if input.trim().eq_ignore_ascii_case("continuous") {
        return Ok(TradingCalendar::Continuous);
    }
    Ok(TradingCalendar::parse_sessions(input)?)
}

fn run_validate(input: &Path, calendar: &str, freq: &str) -> Result<(), StepTraderError> {
    let calendar = parse_calendar(calendar)?;
    let frequency = Frequency::parse(freq)?;
    let mut bars = csv_adapter::read_file(input)?;
    bars.sort_by_key(|b| b.timestamp);
    aggregator::validate(&bars, &calendar, frequency)?;
    println!(
        "{}: {} bars match the {} grid of {}",
        input.display(),
        bars.len(),
        frequency,
        calendar
    );
    Ok(())
}

fn run_resample(
    input: &Path,
    output: &Path,
    calendar: &str,
    from: &str,
    to: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<(), StepTraderError> {
    let calendar = parse_calendar(calendar)?;
    let from = Frequency::parse(from)?;
    let to = Frequency::parse(to)?;
    let bars = csv_adapter::read_file(input)?;
    let count = bars.len();
    let resampled = aggregator::clean_and_resample(bars, &calendar, from, to, start, end)?;
    csv_adapter::write_file(output, &resampled)?;
    info!(input = count, output = resampled.len(), %from, %to, "series resampled");
    println!(
        "wrote {} {} bars to {}",
        resampled.len(),
        to,
        output.display()
    );
    Ok(())
}

pub fn build_broker_config(config: &dyn ConfigPort) -> SimBrokerConfig {
    let defaults = SimBrokerConfig::default();
    let expire = config.get_int("account", "expire_after_bars", 0);
    SimBrokerConfig {
        cash: config.get_double("account", "cash", defaults.cash),
        commission_per_trade: config.get_double(
            "account",
            "commission_per_trade",
            defaults.commission_per_trade,
        ),
        commission_pct: config.get_double("account", "commission_pct", defaults.commission_pct),
        slippage_pct: config.get_double("account", "slippage_pct", defaults.slippage_pct),
        margin_rate: config.get_double("account", "margin_rate", defaults.margin_rate),
        lot_size: config.get_int("account", "lot_size", 1).max(1) as u64,
        allow_shorting: config.get_bool("account", "allow_shorting", defaults.allow_shorting),
        expire_after_bars: (expire > 0).then_some(expire as u64),
    }
}

pub fn build_sizing(config: &dyn ConfigPort) -> Result<SizingRule, StepTraderError> {
    let mode = config
        .get_string("sizing", "mode")
        .unwrap_or_else(|| "fixed".to_string());
    match mode.trim().to_ascii_lowercase().as_str() {
        "fixed" => Ok(SizingRule::Fixed(
            config.get_int("sizing", "size", 0).max(0) as u64,
        )),
        "risk" => Ok(SizingRule::Risk {
            loss_tolerance: config.get_double("sizing", "loss_tolerance", 0.01),
        }),
        "percent" => Ok(SizingRule::Percent(
            config.get_double("sizing", "percent", 1.0),
        )),
        other => Err(StepTraderError::ConfigInvalid {
            section: "sizing".into(),
            key: "mode".into(),
            reason: format!("unknown sizing mode '{other}'"),
        }),
    }
}

pub fn build_settlement(config: &dyn ConfigPort) -> Result<Settlement, StepTraderError> {
    match config.get_string("policy", "settlement") {
        None => Ok(Settlement::default()),
        Some(raw) => raw
            .parse()
            .map_err(|reason| StepTraderError::ConfigInvalid {
                section: "policy".into(),
                key: "settlement".into(),
                reason,
            }),
    }
}

/// Names listed in `[data] auxiliary`.
pub fn auxiliary_symbols(config: &dyn ConfigPort) -> Vec<String> {
    config
        .get_string("data", "auxiliary")
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Load, clean and resample one symbol per the `[data]` and `[calendar]` sections.
pub fn load_series(
    config: &dyn ConfigPort,
    data: &dyn DataPort,
    symbol: &str,
) -> Result<Vec<Bar>, StepTraderError> {
    let calendar = calendar_from_config(config)?;
    let from = frequency_from_config(config, "source_frequency")?;
    let to = match config.get_string("calendar", "target_frequency") {
        Some(_) => frequency_from_config(config, "target_frequency")?,
        None => from,
    };
    let start = config
        .get_string("data", "start_date")
        .map(|s| parse_date(&s, "data", "start_date"))
        .transpose()?;
    let end = config
        .get_string("data", "end_date")
        .map(|s| parse_date(&s, "data", "end_date"))
        .transpose()?;

    let raw = data.load_bars(symbol)?;
    let bars = aggregator::clean_and_resample(raw, &calendar, from, to, start, end)?;
    info!(symbol, bars = bars.len(), frequency = %to, "series ready");
    Ok(bars)
}

/// Load every auxiliary series and require it to share the primary's timestamps.
pub fn load_auxiliary(
    config: &dyn ConfigPort,
    data: &dyn DataPort,
    primary_symbol: &str,
    primary: &[Bar],
) -> Result<Vec<(String, Vec<Bar>)>, StepTraderError> {
    let mut series = Vec::new();
    for name in auxiliary_symbols(config) {
        let bars = load_series(config, data, &name)?;
        series.push((name, bars));
    }
    aggregator::ensure_aligned(primary_symbol, primary, &series)?;
    Ok(series)
}

/// Assemble a simulation over `bars` from config, seeded from `resume` if given.
pub fn build_simulation(
    config: &dyn ConfigPort,
    bars: Vec<Bar>,
    auxiliary: Vec<(String, Vec<Bar>)>,
    resume: Option<&SessionState>,
) -> Result<Simulation<SimBroker, VecFeed>, StepTraderError> {
    let symbol = config
        .get_string("data", "symbol")
        .ok_or_else(|| StepTraderError::ConfigMissing {
            section: "data".into(),
            key: "symbol".into(),
        })?;

    let mut broker_config = build_broker_config(config);
    let mut from_timestamp = config
        .get_string("controller", "from_timestamp")
        .map(|s| parse_timestamp(&s, "controller", "from_timestamp"))
        .transpose()?;
    if let Some(state) = resume {
        broker_config.cash = state.cash;
        if state.last_bar_timestamp.is_some() {
            from_timestamp = state.last_bar_timestamp;
        }
        if let Some(running) = &state.running {
            warn!(position = %running.id, "running position is not restored on resume");
        }
    }

    let manager = PositionManager::new(SimBroker::new(broker_config), build_settlement(config)?);
    let mut sim_config = SimulationConfig::new(symbol, build_sizing(config)?);
    sim_config.from_timestamp = from_timestamp;
    sim_config.auxiliary = auxiliary;
    Ok(Simulation::new(manager, VecFeed::new(bars), sim_config))
}

/// One line of interactive input.
#[derive(Debug, Clone, PartialEq)]
pub enum StepCommand {
    Signal(Signal),
    Stop,
}

/// Parse `open [price=] [target=] [stop=] [size=] [sell] [break]`, `close`,
/// `continue` (or an empty line) and `stop`.
pub fn parse_step_command(line: &str) -> Result<StepCommand, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(StepCommand::Signal(Signal::Continue));
    };
    match head.to_ascii_lowercase().as_str() {
        "c" | "continue" | "next" => Ok(StepCommand::Signal(Signal::Continue)),
        "close" => Ok(StepCommand::Signal(Signal::Close)),
        "stop" | "quit" | "exit" => Ok(StepCommand::Stop),
        "open" => {
            let mut args = OpenArgs::default();
            for word in words {
                let number = |v: &str| {
                    v.parse::<f64>()
                        .map_err(|_| format!("'{word}' is not a number"))
                };
                match word.split_once('=') {
                    Some(("price", v)) => args.price = Some(number(v)?),
                    Some(("target", v)) => args.target_price = Some(number(v)?),
                    Some(("stop", v)) => args.stop_price = Some(number(v)?),
                    Some(("size", v)) => {
                        args.size = Some(
                            v.parse()
                                .map_err(|_| format!("'{word}' is not a whole number"))?,
                        )
                    }
                    None if word == "sell" => args.side = Side::Sell,
                    None if word == "buy" => args.side = Side::Buy,
                    None if word == "break" => args.breakout = true,
                    _ => return Err(format!("unknown open argument '{word}'")),
                }
            }
            if args.breakout && args.price.is_none() {
                return Err("break needs price=".into());
            }
            Ok(StepCommand::Signal(Signal::Open(args)))
        }
        other => Err(format!("unknown command '{other}'")),
    }
}

fn print_info<W: Write>(output: &mut W, info: &StepInfo) -> Result<(), StepTraderError> {
    let json = serde_json::to_string(info).map_err(|e| StepTraderError::Data {
        reason: format!("failed to encode snapshot: {e}"),
    })?;
    writeln!(output, "{json}")?;
    Ok(())
}

/// Where an interactive run saves its state after each step.
pub struct Persistence<'a> {
    pub store: &'a dyn SessionStore,
    pub id: i64,
}

/// Drive `controller` from `input` line by line, printing each snapshot as JSON.
///
/// End of input behaves like `stop`. Returns the final session state.
pub fn run_interactive<R: BufRead, W: Write>(
    mut controller: Controller,
    input: R,
    mut output: W,
    persistence: Option<Persistence<'_>>,
) -> Result<Option<SessionState>, StepTraderError> {
    let save = |state: Option<&SessionState>| -> Result<(), StepTraderError> {
        if let (Some(p), Some(state)) = (&persistence, state) {
            p.store.update(p.id, state)?;
        }
        Ok(())
    };

    let mut printed = controller.snapshot().cloned();
    if let Some(info) = &printed {
        print_info(&mut output, info)?;
    }
    for line in input.lines() {
        if controller.is_finished() {
            break;
        }
        let command = match parse_step_command(&line?) {
            Ok(c) => c,
            Err(reason) => {
                writeln!(output, "error: {reason}")?;
                continue;
            }
        };
        let signal = match command {
            StepCommand::Stop => break,
            StepCommand::Signal(signal) => signal,
        };
        let info = controller.send_signal(signal)?;
        print_info(&mut output, &info)?;
        printed = Some(info);
        save(controller.session_state())?;
    }

    let stopped = controller.stop()?;
    if let Some(info) = &stopped.last {
        if printed.as_ref() != Some(info) {
            print_info(&mut output, info)?;
        }
    }
    save(stopped.session.as_ref())?;
    Ok(stopped.session)
}

fn print_metrics(metrics: &Metrics) {
    eprintln!("\n=== Session Results ===");
    eprintln!("Total Return:     {:.2}%", metrics.total_return * 100.0);
    eprintln!("Sharpe Ratio:     {:.2}", metrics.sharpe_ratio);
    eprintln!("Max Drawdown:     -{:.1}%", metrics.max_drawdown * 100.0);
    eprintln!("Total Trades:     {}", metrics.total_trades);
    eprintln!("Win Rate:         {:.1}%", metrics.win_rate * 100.0);
    eprintln!("Profit Factor:    {:.2}", metrics.profit_factor);
}

#[cfg(feature = "sqlite")]
fn open_store(
    config: &dyn ConfigPort,
) -> Result<Option<crate::adapters::sqlite_session_store::SqliteSessionStore>, StepTraderError> {
    if config.get_string("session", "path").is_none() {
        return Ok(None);
    }
    crate::adapters::sqlite_session_store::SqliteSessionStore::from_config(config).map(Some)
}

fn session_name(config: &dyn ConfigPort, symbol: &str) -> String {
    config
        .get_string("session", "name")
        .unwrap_or_else(|| symbol.to_string())
}

fn run_step(config_path: &Path, resume: Option<i64>) -> Result<(), StepTraderError> {
    eprintln!("Loading config from {}", config_path.display());
    let config = load_config(config_path)?;
    let symbol = config.get_string("data", "symbol").unwrap_or_default();
    let data = CsvAdapter::new(PathBuf::from(
        config.get_string("data", "path").unwrap_or_default(),
    ));

    #[cfg(feature = "sqlite")]
    let store = open_store(&config)?;

    let (bars, state, session_id) = match resume {
        #[cfg(feature = "sqlite")]
        Some(id) => {
            let store = store.as_ref().ok_or_else(|| StepTraderError::ConfigMissing {
                section: "session".into(),
                key: "path".into(),
            })?;
            let stored = store.get(id)?.ok_or(StepTraderError::SessionNotFound(id))?;
            eprintln!("Resuming session {} ({})", id, stored.state.name);
            (stored.bars, Some(stored.state), Some(id))
        }
        #[cfg(not(feature = "sqlite"))]
        Some(_) => {
            return Err(StepTraderError::SessionStore {
                reason: "built without session support".into(),
            });
        }
        None => {
            let bars = load_series(&config, &data, &symbol)?;
            #[cfg(feature = "sqlite")]
            let session_id = match &store {
                Some(store) => {
                    let state = SessionState::new(
                        session_name(&config, &symbol),
                        build_broker_config(&config).cash,
                    );
                    Some(store.create(&bars, &state)?)
                }
                None => None,
            };
            #[cfg(not(feature = "sqlite"))]
            let session_id: Option<i64> = None;
            (bars, None, session_id)
        }
    };

    let auxiliary = load_auxiliary(&config, &data, &symbol, &bars)?;
    let simulation = build_simulation(&config, bars, auxiliary, state.as_ref())?;
    let base_state = state.unwrap_or_else(|| {
        SessionState::new(session_name(&config, &symbol), build_broker_config(&config).cash)
    });
    let controller = Controller::start(simulation)?.with_session(base_state);

    #[cfg(feature = "sqlite")]
    let persistence = match (&store, session_id) {
        (Some(store), Some(id)) => Some(Persistence { store, id }),
        _ => None,
    };
    #[cfg(not(feature = "sqlite"))]
    let persistence = {
        let _ = session_id;
        None
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    let final_state = run_interactive(controller, stdin.lock(), stdout.lock(), persistence)?;
    if let Some(state) = final_state {
        eprintln!(
            "Finished with cash {:.2} and {} completed positions",
            state.cash,
            state.completed.len()
        );
        print_metrics(&state.metrics(config.get_double("account", "risk_free_rate", 0.0)));
    }
    Ok(())
}

#[cfg(feature = "sqlite")]
fn run_session(action: SessionCommand) -> Result<(), StepTraderError> {
    let require_store = |config: &FileConfigAdapter| {
        open_store(config)?.ok_or_else(|| StepTraderError::ConfigMissing {
            section: "session".into(),
            key: "path".into(),
        })
    };
    match action {
        SessionCommand::Create { config, name } => {
            let config = load_config(&config)?;
            let store = require_store(&config)?;
            let symbol = config.get_string("data", "symbol").unwrap_or_default();
            let data = CsvAdapter::new(PathBuf::from(
                config.get_string("data", "path").unwrap_or_default(),
            ));
            let bars = load_series(&config, &data, &symbol)?;
            let state = SessionState::new(
                name.unwrap_or_else(|| session_name(&config, &symbol)),
                build_broker_config(&config).cash,
            );
            let id = store.create(&bars, &state)?;
            println!("created session {id} ({} bars)", bars.len());
        }
        SessionCommand::List { config, keyword } => {
            let config = FileConfigAdapter::from_file(&config)?;
            let store = require_store(&config)?;
            for session in store.search(keyword.as_deref())? {
                let last = session
                    .state
                    .last_bar_timestamp
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:>5}  {:<24} bars={:<6} last={} cash={:.2}",
                    session.id,
                    session.state.name,
                    session.bars.len(),
                    last,
                    session.state.cash
                );
            }
        }
        SessionCommand::Show { config, id } => {
            let config = FileConfigAdapter::from_file(&config)?;
            let store = require_store(&config)?;
            let session = store.get(id)?.ok_or(StepTraderError::SessionNotFound(id))?;
            let json = serde_json::to_string_pretty(&session.state).map_err(|e| {
                StepTraderError::SessionStore {
                    reason: e.to_string(),
                }
            })?;
            println!("{json}");
            print_metrics(
                &session
                    .state
                    .metrics(config.get_double("account", "risk_free_rate", 0.0)),
            );
        }
    }
    Ok(())
}
