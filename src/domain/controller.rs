//! Step-synchronized simulation controller.
//!
//! The simulation runs on its own thread and talks to the caller over two
//! single-slot channels. Each bar it publishes a [`StepInfo`] and then
//! blocks until the caller answers with one [`Signal`], so caller and
//! simulation strictly alternate.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use super::bar::Bar;
use super::error::{ControllerError, UnsupportedExecution};
use super::lifecycle::{EntrySize, OpenRequest, PositionManager};
use super::order::Side;
use super::position::Position;
use super::session::SessionState;
use super::sizing::SizingRule;
use crate::ports::account_port::AccountPort;
use crate::ports::data_port::BarFeed;
use crate::ports::execution_port::ExecutionPort;

/// Arguments of an [`Signal::Open`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenArgs {
    pub side: Side,
    /// Limit price, or break level when `breakout` is set. Market when absent.
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub breakout: bool,
    #[serde(default)]
    pub target_price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    /// Explicit units; the configured sizing rule applies when absent.
    #[serde(default)]
    pub size: Option<u64>,
}

impl Default for OpenArgs {
    fn default() -> Self {
        OpenArgs {
            side: Side::Buy,
            price: None,
            breakout: false,
            target_price: None,
            stop_price: None,
            size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    Open(OpenArgs),
    Close,
    Continue,
}

/// Immutable view of the simulation at one bar boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub bar: Option<Bar>,
    /// Auxiliary series bars at the same timestamp, by series name.
    pub auxiliary: BTreeMap<String, Bar>,
    pub position: Option<Position>,
    /// Positions that completed or were cancelled since the previous snapshot.
    pub finished: Vec<Position>,
    pub cash: f64,
    pub account_value: f64,
    /// Why the previous signal was refused.
    pub rejection: Option<String>,
    pub stop: bool,
}

/// Per-bar decision logic that runs before the caller is asked for a signal.
pub trait BarStrategy<B>: Send {
    fn on_bar(&mut self, bar: &Bar, positions: &mut PositionManager<B>);
}

/// Leaves every decision to the external caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualStrategy;

impl<B> BarStrategy<B> for ManualStrategy {
    fn on_bar(&mut self, _bar: &Bar, _positions: &mut PositionManager<B>) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub symbol: String,
    pub sizing: SizingRule,
    /// Bars before this timestamp are stepped through without asking the caller.
    pub from_timestamp: Option<NaiveDateTime>,
    pub auxiliary: Vec<(String, Vec<Bar>)>,
}

impl SimulationConfig {
    pub fn new(symbol: impl Into<String>, sizing: SizingRule) -> Self {
        Self {
            symbol: symbol.into(),
            sizing,
            from_timestamp: None,
            auxiliary: Vec::new(),
        }
    }
}

/// The bar loop, owned by the simulation thread.
pub struct Simulation<B, F, S = ManualStrategy> {
    manager: PositionManager<B>,
    feed: F,
    strategy: S,
    symbol: String,
    sizing: SizingRule,
    from_timestamp: Option<NaiveDateTime>,
    auxiliary: BTreeMap<NaiveDateTime, BTreeMap<String, Bar>>,
}

impl<B, F> Simulation<B, F, ManualStrategy>
where
    B: ExecutionPort + AccountPort,
    F: BarFeed,
{
    pub fn new(manager: PositionManager<B>, feed: F, config: SimulationConfig) -> Self {
        let mut auxiliary: BTreeMap<NaiveDateTime, BTreeMap<String, Bar>> = BTreeMap::new();
        for (name, bars) in config.auxiliary {
            for bar in bars {
                auxiliary
                    .entry(bar.timestamp)
                    .or_default()
                    .insert(name.clone(), bar);
            }
        }
        Self {
            manager,
            feed,
            strategy: ManualStrategy,
            symbol: config.symbol,
            sizing: config.sizing,
            from_timestamp: config.from_timestamp,
            auxiliary,
        }
    }
}

impl<B, F, S> Simulation<B, F, S>
where
    B: ExecutionPort + AccountPort,
    F: BarFeed,
    S: BarStrategy<B>,
{
    pub fn with_strategy<T: BarStrategy<B>>(self, strategy: T) -> Simulation<B, F, T> {
        Simulation {
            manager: self.manager,
            feed: self.feed,
            strategy,
            symbol: self.symbol,
            sizing: self.sizing,
            from_timestamp: self.from_timestamp,
            auxiliary: self.auxiliary,
        }
    }

    /// Drive the bar loop until the feed is exhausted or the caller hangs up.
    pub fn run(
        mut self,
        signals: Receiver<Signal>,
        infos: SyncSender<StepInfo>,
    ) -> Result<(), UnsupportedExecution> {
        let mut rejection = None;
        let mut last_bar = None;

        while let Some(bar) = self.feed.next_bar() {
            let span = info_span!("bar", bar_time = %bar.timestamp);
            let _entered = span.enter();

            self.manager.advance(&bar)?;
            self.manager.promote_next_session();
            self.manager.process_notifications()?;
            self.strategy.on_bar(&bar, &mut self.manager);
            self.manager.process_notifications()?;

            if self.from_timestamp.is_some_and(|from| bar.timestamp < from) {
                last_bar = Some(bar);
                continue;
            }

            let info = self.snapshot(Some(bar.clone()), rejection.take(), false);
            if infos.send(info).is_err() {
                debug!("controller hung up");
                return Ok(());
            }
            let Ok(signal) = signals.recv() else {
                debug!("controller hung up");
                return Ok(());
            };
            rejection = self.apply(signal);
            self.manager.process_notifications()?;
            last_bar = Some(bar);
        }

        info!("bar stream exhausted");
        let last = self.snapshot(last_bar, rejection, true);
        if infos.send(last).is_err() {
            debug!("controller hung up before final snapshot");
        }
        Ok(())
    }

    fn snapshot(&mut self, bar: Option<Bar>, rejection: Option<String>, stop: bool) -> StepInfo {
        let finished = self.manager.take_finished();
        let auxiliary = bar
            .as_ref()
            .and_then(|b| self.auxiliary.get(&b.timestamp))
            .cloned()
            .unwrap_or_default();
        StepInfo {
            bar,
            auxiliary,
            position: self.manager.running_position().cloned(),
            finished,
            cash: self.manager.broker().cash(),
            account_value: self.manager.broker().account_value(),
            rejection,
            stop,
        }
    }

    /// Carry out one signal, returning why it was refused if it was.
    fn apply(&mut self, signal: Signal) -> Option<String> {
        match signal {
            Signal::Continue => None,
            Signal::Open(args) => {
                if let Some(running) = self.manager.running_position() {
                    let reason = format!("position {} is still running", running.id);
                    warn!(%reason, "open refused");
                    return Some(reason);
                }
                let request = OpenRequest {
                    symbol: self.symbol.clone(),
                    side: args.side,
                    size: args
                        .size
                        .map(EntrySize::Units)
                        .unwrap_or(EntrySize::Rule(self.sizing)),
                    target_price: args.target_price,
                    stop_price: args.stop_price,
                };
                let result = match (args.price, args.breakout) {
                    (None, _) => self.manager.open_market(&request),
                    (Some(price), false) => self.manager.open_limit(&request, price),
                    (Some(price), true) => self.manager.open_break(&request, price),
                };
                match result {
                    Ok(Some(_)) => None,
                    Ok(None) => {
                        info!("entry not placed");
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "open refused");
                        Some(e.to_string())
                    }
                }
            }
            Signal::Close => {
                let Some(id) = self.manager.running_position().map(|p| p.id) else {
                    warn!("close refused: no running position");
                    return Some("no running position to close".into());
                };
                match self.manager.close_position(id) {
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "close refused");
                        Some(e.to_string())
                    }
                }
            }
        }
    }
}

/// What is left once a controller has been stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct Stopped {
    pub last: Option<StepInfo>,
    pub session: Option<SessionState>,
}

/// Caller side of a running simulation.
pub struct Controller {
    signals: Option<SyncSender<Signal>>,
    infos: Receiver<StepInfo>,
    handle: Option<JoinHandle<Result<(), UnsupportedExecution>>>,
    last: Option<StepInfo>,
    state: Option<SessionState>,
}

impl Controller {
    /// Spawn the simulation thread and wait for its first snapshot.
    pub fn start<B, F, S>(simulation: Simulation<B, F, S>) -> Result<Self, ControllerError>
    where
        B: ExecutionPort + AccountPort + Send + 'static,
        F: BarFeed + Send + 'static,
        S: BarStrategy<B> + 'static,
    {
        let (signal_tx, signal_rx) = mpsc::sync_channel(1);
        let (info_tx, info_rx) = mpsc::sync_channel(1);
        let handle = thread::Builder::new()
            .name("simulation".into())
            .spawn(move || simulation.run(signal_rx, info_tx))
            .map_err(ControllerError::Spawn)?;

        let mut controller = Controller {
            signals: Some(signal_tx),
            infos: info_rx,
            handle: Some(handle),
            last: None,
            state: None,
        };
        controller.receive()?;
        Ok(controller)
    }

    /// Track a [`SessionState`] updated from every snapshot received.
    pub fn with_session(mut self, mut state: SessionState) -> Self {
        if let Some(info) = &self.last {
            state.record(info);
        }
        self.state = Some(state);
        self
    }

    /// Send one signal and wait for the snapshot of the next bar.
    pub fn send_signal(&mut self, signal: Signal) -> Result<StepInfo, ControllerError> {
        if self.is_finished() {
            return Err(ControllerError::SimulationEnded);
        }
        let sent = match &self.signals {
            Some(sender) => sender.send(signal).is_ok(),
            None => false,
        };
        if !sent {
            return Err(self.abort_reason());
        }
        self.receive()
    }

    /// The last snapshot received, without blocking.
    pub fn snapshot(&self) -> Option<&StepInfo> {
        self.last.as_ref()
    }

    pub fn session_state(&self) -> Option<&SessionState> {
        self.state.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.last.as_ref().is_some_and(|info| info.stop)
    }

    /// Close any running position, step until it is flat or the stream ends,
    /// then shut the simulation thread down.
    pub fn stop(mut self) -> Result<Stopped, ControllerError> {
        loop {
            let Some(info) = &self.last else { break };
            if info.stop {
                break;
            }
            let Some(position) = &info.position else {
                break;
            };
            let signal = if position.is_closing() || !position.entry_filled() {
                Signal::Continue
            } else {
                Signal::Close
            };
            let info = self.send_signal(signal)?;
            if let Some(reason) = &info.rejection {
                debug!(%reason, "signal refused while stopping");
            }
        }
        self.shutdown()?;
        Ok(Stopped {
            last: self.last.take(),
            session: self.state.take(),
        })
    }

    fn receive(&mut self) -> Result<StepInfo, ControllerError> {
        match self.infos.recv() {
            Ok(info) => {
                if let Some(state) = &mut self.state {
                    state.record(&info);
                }
                self.last = Some(info.clone());
                Ok(info)
            }
            Err(_) => Err(self.abort_reason()),
        }
    }

    /// Hang up both channels and join the simulation thread.
    fn shutdown(&mut self) -> Result<(), ControllerError> {
        self.signals = None;
        while self.infos.recv().is_ok() {}
        match self.handle.take().map(|h| h.join()) {
            None | Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(e))) => Err(ControllerError::SimulationAborted {
                reason: e.to_string(),
            }),
            Some(Err(_)) => Err(ControllerError::SimulationAborted {
                reason: "simulation thread panicked".into(),
            }),
        }
    }

    fn abort_reason(&mut self) -> ControllerError {
        match self.shutdown() {
            Ok(()) => ControllerError::SimulationEnded,
            Err(e) => e,
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sim_broker::{SimBroker, SimBrokerConfig};
    use crate::adapters::vec_feed::VecFeed;
    use crate::domain::lifecycle::Settlement;
    use chrono::NaiveDate;
    use std::sync::mpsc::TrySendError;

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn bars(n: u32) -> Vec<Bar> {
        (0..n)
            .map(|i| Bar::new(ts(10, i * 5), 10.0, 10.5, 9.5, 10.0, 1_000.0))
            .collect()
    }

    fn simulation(bars: Vec<Bar>) -> Simulation<SimBroker, VecFeed> {
        let broker = SimBroker::new(SimBrokerConfig {
            cash: 100_000.0,
            commission_pct: 0.0,
            ..SimBrokerConfig::default()
        });
        Simulation::new(
            PositionManager::new(broker, Settlement::T0),
            VecFeed::new(bars),
            SimulationConfig::new("X", SizingRule::Fixed(100)),
        )
    }

    #[test]
    fn signal_serde_shape() {
        let json = serde_json::to_string(&Signal::Continue).unwrap();
        assert_eq!(json, r#"{"signal":"continue"}"#);
        let open: Signal =
            serde_json::from_str(r#"{"signal":"open","side":"sell","price":9.5}"#).unwrap();
        assert_eq!(
            open,
            Signal::Open(OpenArgs {
                side: Side::Sell,
                price: Some(9.5),
                ..OpenArgs::default()
            })
        );
    }

    #[test]
    fn publishes_one_snapshot_per_bar() {
        let mut controller = Controller::start(simulation(bars(4))).unwrap();
        let mut seen = vec![controller.snapshot().unwrap().bar.clone().unwrap().timestamp];
        loop {
            let info = controller.send_signal(Signal::Continue).unwrap();
            if info.stop {
                break;
            }
            seen.push(info.bar.unwrap().timestamp);
        }
        assert_eq!(seen, vec![ts(10, 0), ts(10, 5), ts(10, 10), ts(10, 15)]);
        assert!(controller.is_finished());
        assert!(matches!(
            controller.send_signal(Signal::Continue),
            Err(ControllerError::SimulationEnded)
        ));
    }

    #[test]
    fn empty_feed_stops_immediately() {
        let controller = Controller::start(simulation(Vec::new())).unwrap();
        let info = controller.snapshot().unwrap();
        assert!(info.stop);
        assert!(info.bar.is_none());
    }

    #[test]
    fn second_signal_waits_for_snapshot_consumption() {
        let (signal_tx, signal_rx) = mpsc::sync_channel(1);
        let (info_tx, info_rx) = mpsc::sync_channel(1);
        let handle = thread::spawn(move || simulation(bars(3)).run(signal_rx, info_tx));

        let first = info_rx.recv().unwrap();
        assert_eq!(first.bar.unwrap().timestamp, ts(10, 0));
        signal_tx.send(Signal::Continue).unwrap();

        // the simulation parks the next snapshot and waits for a signal
        let second = info_rx.recv().unwrap();
        assert_eq!(second.bar.unwrap().timestamp, ts(10, 5));
        signal_tx.send(Signal::Continue).unwrap();
        // one slot holds a signal at most while the third snapshot is unread
        let mut blocked = false;
        for _ in 0..3 {
            match signal_tx.try_send(Signal::Continue) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    blocked = true;
                    break;
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        assert!(blocked);

        drop(signal_tx);
        while info_rx.recv().is_ok() {}
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn from_timestamp_skips_early_bars() {
        let mut sim = simulation(bars(4));
        sim.from_timestamp = Some(ts(10, 10));
        let mut controller = Controller::start(sim).unwrap();
        assert_eq!(
            controller.snapshot().unwrap().bar.as_ref().unwrap().timestamp,
            ts(10, 10)
        );
        let info = controller.send_signal(Signal::Continue).unwrap();
        assert_eq!(info.bar.unwrap().timestamp, ts(10, 15));
    }

    #[test]
    fn open_then_close_round_trip() {
        let mut controller = Controller::start(simulation(bars(5))).unwrap();
        let info = controller
            .send_signal(Signal::Open(OpenArgs::default()))
            .unwrap();
        let position = info.position.unwrap();
        assert!(position.entry_filled());

        let info = controller.send_signal(Signal::Close).unwrap();
        assert!(info.position.is_none());
        assert_eq!(info.finished.len(), 1);
        assert!(info.finished[0].is_completed());
    }

    #[test]
    fn guards_report_rejections() {
        let mut controller = Controller::start(simulation(bars(5))).unwrap();
        let info = controller.send_signal(Signal::Close).unwrap();
        assert_eq!(info.rejection.as_deref(), Some("no running position to close"));

        controller
            .send_signal(Signal::Open(OpenArgs::default()))
            .unwrap();
        let info = controller
            .send_signal(Signal::Open(OpenArgs::default()))
            .unwrap();
        assert!(info.rejection.unwrap().contains("still running"));
    }

    #[test]
    fn stop_closes_running_position() {
        let mut controller = Controller::start(simulation(bars(6))).unwrap();
        controller
            .send_signal(Signal::Open(OpenArgs::default()))
            .unwrap();
        let last = controller.stop().unwrap().last.unwrap();
        assert!(last.position.is_none());
        assert!(!last.stop);
    }

    #[test]
    fn auxiliary_bars_attached_by_timestamp() {
        let mut config = SimulationConfig::new("X", SizingRule::Fixed(100));
        config.auxiliary = vec![("index".into(), bars(2))];
        let sim = Simulation::new(
            PositionManager::new(SimBroker::new(SimBrokerConfig::default()), Settlement::T0),
            VecFeed::new(bars(2)),
            config,
        );
        let controller = Controller::start(sim).unwrap();
        let info = controller.snapshot().unwrap();
        assert_eq!(info.auxiliary["index"].timestamp, ts(10, 0));
    }
}
