//! Single owner of the synchronisation state.
//!
//! [`CoordinatorService`] is a cheap handle; the state lives in an event loop
//! task that serialises commands, fetch results and socket events, and
//! publishes an immutable [`MarketSnapshot`] after each one.
use crate::{
    config::SyncConfig,
    error::SyncError,
    growth::GrowthCalculator,
    history::{HistoricalDataFetcher, HistoryBatch},
    series::{LiveUpdate, SeriesStore},
    stream::{
        ConnectionState, StreamConnection, StreamConnector, StreamEvent, StreamPlan, StreamUpdate,
        TungsteniteConnector,
    },
    subscription::SubscriptionManager,
    types::{Candle, Symbol, TickerSnapshot},
};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Immutable view of everything the coordinator tracks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketSnapshot {
    /// Active chart symbol
    pub symbol: Option<Symbol>,
    pub candles: Arc<Vec<Candle>>,
    pub tickers: HashMap<Symbol, TickerSnapshot>,
    /// Rolling growth percentage per watched symbol
    pub growth: HashMap<Symbol, f64>,
    /// Streamed ticker symbols, priority first
    pub subscriptions: Vec<Symbol>,
    pub connection: ConnectionState,
    pub history_source: Option<&'static str>,
    pub history_error: Option<SyncError>,
    pub stream_error: Option<SyncError>,
    pub loading: bool,
    pub loading_more: bool,
    pub has_more_history: bool,
}

#[derive(Debug)]
enum Command {
    SetWatched {
        symbols: Vec<Symbol>,
        priority: Option<Symbol>,
    },
    LoadMore,
    SwitchSymbol(Symbol),
    Stop(oneshot::Sender<()>),
}

/// Handle to the running coordinator.
///
/// Dropping it aborts the event loop, which releases the socket, timers and
/// fetch tasks.
#[derive(Debug)]
pub struct CoordinatorService {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<Arc<MarketSnapshot>>,
    task: Option<JoinHandle<()>>,
}

impl CoordinatorService {
    /// Start with the default providers and a live WebSocket connector.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: SyncConfig, initial_symbol: Symbol) -> Self {
        let fetcher = HistoricalDataFetcher::from_config(&config.history, config.interval);
        let connector = Arc::new(TungsteniteConnector::new(&config.stream));
        Self::start_with(config, fetcher, connector, initial_symbol)
    }

    /// Start with injected history providers and socket connector.
    pub fn start_with(
        config: SyncConfig,
        fetcher: HistoricalDataFetcher,
        connector: Arc<dyn StreamConnector>,
        initial_symbol: Symbol,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let (history_tx, history_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(MarketSnapshot::default()));

        let stream = StreamConnection::new(config.stream.clone(), config.interval, connector, stream_tx);
        let engine = Engine::new(config, Arc::new(fetcher), stream, history_tx, snapshot_tx);

        info!(symbol = %initial_symbol, "starting market sync coordinator");
        let task = tokio::spawn(engine.run(initial_symbol, command_rx, stream_rx, history_rx));

        Self {
            commands: command_tx,
            snapshots: snapshot_rx,
            task: Some(task),
        }
    }

    /// Replace the watched ticker symbols; `priority` takes slot 0 when present.
    pub fn set_watched_symbols(
        &self,
        symbols: Vec<Symbol>,
        priority: Option<Symbol>,
    ) -> Result<(), SyncError> {
        self.send(Command::SetWatched { symbols, priority })
    }

    /// Fetch the page before the earliest loaded candle.
    ///
    /// Ignored while a load is in flight or once history is exhausted.
    pub fn load_more_history(&self) -> Result<(), SyncError> {
        self.send(Command::LoadMore)
    }

    /// Move the chart to another symbol, superseding any in-flight loads.
    pub fn switch_symbol(&self, symbol: Symbol) -> Result<(), SyncError> {
        self.send(Command::SwitchSymbol(symbol))
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<MarketSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every publish.
    pub fn updates(&self) -> watch::Receiver<Arc<MarketSnapshot>> {
        self.snapshots.clone()
    }

    /// Invoke `on_update` with each newly published snapshot until the
    /// returned subscription is dropped. Bursts may be coalesced into the
    /// latest snapshot.
    pub fn subscribe<F>(&self, mut on_update: F) -> UpdateSubscription
    where
        F: FnMut(&MarketSnapshot) + Send + 'static,
    {
        let mut updates = self.snapshots.clone();
        let task = tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let snapshot = updates.borrow_and_update().clone();
                on_update(&snapshot);
            }
        });

        UpdateSubscription { task }
    }

    /// Dispose the stream, cancel pending work and wait for the loop to exit.
    pub async fn stop(mut self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Stop(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), SyncError> {
        self.commands.send(command).map_err(|_| SyncError::Stopped)
    }
}

impl Drop for CoordinatorService {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Detaches the callback registered with [`CoordinatorService::subscribe`] when dropped.
#[derive(Debug)]
pub struct UpdateSubscription {
    task: JoinHandle<()>,
}

impl UpdateSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for UpdateSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    Initial,
    Older,
}

#[derive(Debug)]
struct HistoryOutcome {
    generation: u64,
    kind: FetchKind,
    result: Result<HistoryBatch, SyncError>,
}

/// In-flight fetch, aborted when dropped.
#[derive(Debug)]
struct FetchTask(JoinHandle<()>);

impl Drop for FetchTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug)]
struct HistoryState {
    generation: u64,
    initial: Option<FetchTask>,
    older: Option<FetchTask>,
    source: Option<&'static str>,
    error: Option<SyncError>,
    has_more: bool,
}

impl HistoryState {
    /// Invalidate anything in flight.
    fn supersede(&mut self) {
        self.generation += 1;
        self.initial = None;
        self.older = None;
    }
}

struct Engine {
    fetcher: Arc<HistoricalDataFetcher>,
    history_tx: mpsc::UnboundedSender<HistoryOutcome>,
    snapshots: watch::Sender<Arc<MarketSnapshot>>,
    symbol: Option<Symbol>,
    series: SeriesStore,
    subscriptions: SubscriptionManager,
    growth: GrowthCalculator,
    stream: StreamConnection,
    tickers: HashMap<Symbol, TickerSnapshot>,
    history: HistoryState,
    /// Stream connect waits for the first history load of a new symbol
    awaiting_initial: bool,
    published_revision: u64,
    published_candles: Arc<Vec<Candle>>,
}

impl Engine {
    fn new(
        config: SyncConfig,
        fetcher: Arc<HistoricalDataFetcher>,
        stream: StreamConnection,
        history_tx: mpsc::UnboundedSender<HistoryOutcome>,
        snapshots: watch::Sender<Arc<MarketSnapshot>>,
    ) -> Self {
        Self {
            fetcher,
            history_tx,
            snapshots,
            symbol: None,
            series: SeriesStore::new(config.merge_exhausted_threshold),
            subscriptions: SubscriptionManager::new(config.subscription_capacity),
            growth: GrowthCalculator::new(config.growth_window),
            stream,
            tickers: HashMap::new(),
            history: HistoryState {
                generation: 0,
                initial: None,
                older: None,
                source: None,
                error: None,
                has_more: true,
            },
            awaiting_initial: false,
            published_revision: 0,
            published_candles: Arc::new(Vec::new()),
        }
    }

    async fn run(
        mut self,
        initial_symbol: Symbol,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut stream_events: mpsc::UnboundedReceiver<StreamEvent>,
        mut history: mpsc::UnboundedReceiver<HistoryOutcome>,
    ) {
        self.select_symbol(initial_symbol);
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Stop(ack)) => {
                        self.shutdown();
                        self.publish();
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("coordinator handle dropped");
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = stream_events.recv() => self.on_stream_event(event),
                Some(outcome) = history.recv() => self.on_history(outcome),
            }

            self.publish();
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SetWatched { symbols, priority } => self.set_watched(symbols, priority),
            Command::LoadMore => self.load_more(),
            Command::SwitchSymbol(symbol) => self.select_symbol(symbol),
            Command::Stop(_) => {}
        }
    }

    fn select_symbol(&mut self, symbol: Symbol) {
        info!(%symbol, "selecting chart symbol");

        self.history.supersede();
        self.history.source = None;
        self.history.error = None;
        self.history.has_more = true;
        self.series.clear();

        if self.subscriptions.active().is_empty() {
            let diff = self
                .subscriptions
                .set_watch_list(std::slice::from_ref(&symbol), Some(&symbol));
            debug!(?diff, "seeded watch list with chart symbol");
        }

        self.symbol = Some(symbol);
        self.awaiting_initial = true;
        self.spawn_fetch(FetchKind::Initial, None);
    }

    fn set_watched(&mut self, symbols: Vec<Symbol>, priority: Option<Symbol>) {
        let diff = self.subscriptions.set_watch_list(&symbols, priority.as_ref());

        for symbol in &diff.unsubscribe {
            self.growth.clear_symbol(symbol);
            self.tickers.remove(symbol);
        }

        if !diff.is_empty() {
            self.sync_stream();
        } else if self.stream.is_exhausted() {
            info!("watch list unchanged, retrying exhausted stream");
            self.sync_stream();
        }
    }

    fn load_more(&mut self) {
        if self.history.initial.is_some() || self.history.older.is_some() {
            debug!("history load already in flight");
            return;
        }
        if !self.history.has_more {
            debug!("no more history available");
            return;
        }
        let Some(earliest) = self.series.earliest_time() else {
            debug!("no candles loaded, nothing to extend");
            return;
        };

        self.spawn_fetch(FetchKind::Older, Some(earliest));
    }

    fn sync_stream(&mut self) {
        if self.awaiting_initial {
            return;
        }

        let plan = StreamPlan::new(self.subscriptions.active().to_vec(), self.symbol.clone());
        self.stream.rebuild(plan);
    }

    fn spawn_fetch(&mut self, kind: FetchKind, end_time: Option<i64>) {
        let Some(symbol) = self.symbol.clone() else {
            return;
        };

        let fetcher = Arc::clone(&self.fetcher);
        let results = self.history_tx.clone();
        let generation = self.history.generation;

        let task = FetchTask(tokio::spawn(async move {
            let result = fetcher.fetch(&symbol, end_time).await;
            let _ = results.send(HistoryOutcome {
                generation,
                kind,
                result,
            });
        }));

        match kind {
            FetchKind::Initial => self.history.initial = Some(task),
            FetchKind::Older => self.history.older = Some(task),
        }
    }

    fn on_history(&mut self, outcome: HistoryOutcome) {
        if outcome.generation != self.history.generation {
            debug!(
                outcome_generation = outcome.generation,
                generation = self.history.generation,
                "discarding superseded history result"
            );
            return;
        }

        match outcome.kind {
            FetchKind::Initial => {
                self.history.initial = None;
                self.on_initial(outcome.result);

                if self.awaiting_initial {
                    self.awaiting_initial = false;
                    self.sync_stream();
                }
            }
            FetchKind::Older => {
                self.history.older = None;
                self.on_older(outcome.result);
            }
        }
    }

    fn on_initial(&mut self, result: Result<HistoryBatch, SyncError>) {
        let batch = match result {
            Ok(batch) => batch,
            Err(error) => {
                warn!(%error, "initial history load failed");
                self.history.error = Some(error);
                return;
            }
        };

        match self.series.initialize_with(batch.candles) {
            Ok(len) => {
                info!(source = batch.source, candles = len, "history loaded");
                self.history.source = Some(batch.source);
                self.history.error = None;
                self.history.has_more = len > 0;
            }
            Err(error) => self.history.error = Some(error),
        }
    }

    fn on_older(&mut self, result: Result<HistoryBatch, SyncError>) {
        let batch = match result {
            Ok(batch) => batch,
            Err(error) => {
                warn!(%error, "older history load failed");
                self.history.error = Some(error);
                return;
            }
        };

        match self.series.merge_older(batch.candles) {
            Ok(outcome) => {
                info!(
                    source = batch.source,
                    added = outcome.added,
                    total = outcome.total,
                    exhausted = outcome.exhausted,
                    "older history merged"
                );
                self.history.source = Some(batch.source);
                self.history.error = None;
                self.history.has_more = !outcome.exhausted;
            }
            Err(error) => self.reload(error),
        }
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        for update in self.stream.handle(event) {
            match update {
                StreamUpdate::Ticker(ticker) => self.on_ticker(ticker),
                StreamUpdate::Kline { symbol, candle, .. } => self.on_kline(symbol, candle),
            }
        }
    }

    fn on_ticker(&mut self, ticker: TickerSnapshot) {
        if !self.subscriptions.contains(&ticker.symbol) {
            debug!(symbol = %ticker.symbol, "ticker for unwatched symbol");
            return;
        }

        self.growth.add_sample(
            &ticker.symbol,
            ticker.price,
            ticker.timestamp.timestamp_millis(),
        );
        self.tickers.insert(ticker.symbol.clone(), ticker);
    }

    fn on_kline(&mut self, symbol: Symbol, candle: Candle) {
        if self.symbol.as_ref() != Some(&symbol) {
            debug!(%symbol, "kline for inactive symbol");
            return;
        }

        match self.series.apply_live_update(candle) {
            Ok(LiveUpdate::Stale) => debug!(time = candle.time, "stale kline dropped"),
            Ok(_) => {}
            Err(error) => self.reload(error),
        }
    }

    /// Recover from a rejected mutation with a full initial load.
    fn reload(&mut self, error: SyncError) {
        warn!(%error, "series rejected update, reloading history");
        self.history.supersede();
        self.history.error = Some(error);
        self.spawn_fetch(FetchKind::Initial, None);
    }

    fn shutdown(&mut self) {
        self.stream.dispose();
        self.history.supersede();
        self.history.source = None;
        self.history.error = None;
        self.awaiting_initial = false;
        self.series.clear();
        self.subscriptions.clear();
        self.growth.clear();
        self.tickers.clear();
        self.symbol = None;
        info!("coordinator stopped");
    }

    fn publish(&mut self) {
        if self.published_revision != self.series.revision() {
            self.published_candles = Arc::new(self.series.candles().to_vec());
            self.published_revision = self.series.revision();
        }

        let snapshot = MarketSnapshot {
            symbol: self.symbol.clone(),
            candles: Arc::clone(&self.published_candles),
            tickers: self.tickers.clone(),
            growth: self.growth.growth_all(),
            subscriptions: self.subscriptions.active().to_vec(),
            connection: self.stream.state(),
            history_source: self.history.source,
            history_error: self.history.error.clone(),
            stream_error: self.stream.error().cloned(),
            loading: self.history.initial.is_some(),
            loading_more: self.history.older.is_some(),
            has_more_history: self.history.has_more,
        };

        self.snapshots.send_replace(Arc::new(snapshot));
    }
}
