use super::{
    CloseInfo, ConnectionState, SocketEvent, StreamEvent, StreamPlan, StreamUpdate,
    protocol::{ParseError, StreamProtocol, fit_url},
    socket::{ConnectRequest, SocketHandle, StreamConnector},
};
use crate::{config::StreamConfig, error::SyncError, types::Interval};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Backoff before reconnect attempt number `attempt` (zero based).
///
/// `min(base * 2^attempt, cap)`, where the base is longer after an abnormal close.
pub fn reconnect_delay(config: &StreamConfig, attempt: u32, close: &CloseInfo) -> Duration {
    let base = if close.is_abnormal() {
        config.abnormal_reconnect_base_delay
    } else {
        config.reconnect_base_delay
    };

    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(config.max_reconnect_delay)
        .min(config.max_reconnect_delay)
}

/// Pending reconnect, aborted when dropped.
#[derive(Debug)]
struct ReconnectTimer {
    delay: Duration,
    task: JoinHandle<()>,
}

impl Drop for ReconnectTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// State machine for the single multiplexed market data socket.
///
/// All socket and timer activity arrives through [`StreamConnection::handle`].
/// The connection must be driven from inside a tokio runtime.
pub struct StreamConnection {
    config: StreamConfig,
    interval: Interval,
    protocol: Arc<dyn StreamProtocol>,
    connector: Arc<dyn StreamConnector>,
    events: mpsc::UnboundedSender<StreamEvent>,
    state: ConnectionState,
    plan: StreamPlan,
    streams: Vec<String>,
    generation: u64,
    attempts: u32,
    disposed: bool,
    error: Option<SyncError>,
    socket: Option<SocketHandle>,
    reconnect: Option<ReconnectTimer>,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("venue", &self.protocol.venue())
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("attempts", &self.attempts)
            .field("streams", &self.streams)
            .field("error", &self.error)
            .finish()
    }
}

impl StreamConnection {
    pub fn new(
        config: StreamConfig,
        interval: Interval,
        connector: Arc<dyn StreamConnector>,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        Self {
            protocol: config.venue.protocol(),
            config,
            interval,
            connector,
            events,
            state: ConnectionState::Disconnected,
            plan: StreamPlan::default(),
            streams: Vec::new(),
            generation: 0,
            attempts: 0,
            disposed: false,
            error: None,
            socket: None,
            reconnect: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Standing failure: exhausted reconnects or an unusable stream URL.
    ///
    /// Closes that are still being retried are not reported here.
    pub fn error(&self) -> Option<&SyncError> {
        self.error.as_ref()
    }

    pub fn plan(&self) -> &StreamPlan {
        &self.plan
    }

    /// Stream identifiers of the current connection, after URL truncation.
    pub fn streams(&self) -> &[String] {
        &self.streams
    }

    /// Delay of the scheduled reconnect, if one is pending.
    pub fn pending_reconnect(&self) -> Option<Duration> {
        self.reconnect.as_ref().map(|timer| timer.delay)
    }

    /// Reconnection was abandoned after too many attempts.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.error, Some(SyncError::MaxReconnectExceeded { .. }))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Replace the streamed set: tear down, reset the attempt counter and connect afresh.
    pub fn rebuild(&mut self, plan: StreamPlan) {
        if self.disposed {
            debug!("ignoring rebuild of disposed stream");
            return;
        }

        self.teardown();
        self.plan = plan;
        self.attempts = 0;
        self.error = None;

        if self.plan.is_empty() {
            info!("stream plan empty, staying disconnected");
            self.state = ConnectionState::Disconnected;
            self.streams.clear();
            return;
        }

        self.connect();
    }

    /// Apply one socket or timer event, returning decoded market data.
    ///
    /// Events tagged with a previous generation are discarded.
    pub fn handle(&mut self, event: StreamEvent) -> Vec<StreamUpdate> {
        if self.disposed || event.generation != self.generation {
            debug!(
                event_generation = event.generation,
                generation = self.generation,
                "discarding stale stream event"
            );
            return Vec::new();
        }

        match event.kind {
            SocketEvent::Opened => {
                info!(generation = self.generation, streams = self.streams.len(), "stream open");
                self.state = ConnectionState::Connected;
                self.attempts = 0;
                self.error = None;
            }
            SocketEvent::Message(text) => match self.protocol.parse(&text) {
                Ok(updates) => return updates,
                Err(ParseError::Rejected(reason)) => {
                    warn!(%reason, "stream subscription rejected");
                }
                Err(error) => {
                    let payload: String = text.chars().take(100).collect();
                    debug!(%error, %payload, "dropping unparseable frame");
                }
            },
            SocketEvent::Errored(reason) => {
                warn!(generation = self.generation, %reason, "stream error");
                self.state = ConnectionState::Disconnected;
            }
            SocketEvent::Closed(close) => self.on_close(close),
            SocketEvent::ReconnectDue => {
                self.reconnect = None;
                if self.state == ConnectionState::Reconnecting {
                    info!(attempt = self.attempts, "reconnecting stream");
                    self.connect();
                }
            }
        }

        Vec::new()
    }

    /// Close for good. Later events and rebuilds are ignored.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }

        self.disposed = true;
        self.state = ConnectionState::Disposed;
        self.teardown();
        info!("stream disposed");
    }

    fn on_close(&mut self, close: CloseInfo) {
        // The socket task ends right after reporting its close
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        self.state = ConnectionState::Disconnected;

        if close.is_clean() {
            info!(code = close.code, intentional = close.intentional, "stream closed cleanly");
            return;
        }

        if self.attempts >= self.config.max_reconnect_attempts {
            error!(
                attempts = self.attempts,
                code = close.code,
                "stream reconnect attempts exhausted"
            );
            self.error = Some(SyncError::MaxReconnectExceeded {
                attempts: self.attempts,
            });
            return;
        }

        let delay = reconnect_delay(&self.config, self.attempts, &close);
        self.attempts += 1;
        self.state = ConnectionState::Reconnecting;

        // Transient, only surfaced once the attempt budget runs out
        let lost = SyncError::ConnectionLost {
            code: close.code,
            reason: if close.is_abnormal() {
                "connection dropped".to_string()
            } else {
                "closed by server".to_string()
            },
        };
        warn!(
            error = %lost,
            attempt = self.attempts,
            max_attempts = self.config.max_reconnect_attempts,
            ?delay,
            "stream closed unexpectedly, scheduling reconnect"
        );
        self.schedule_reconnect(delay);
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        let events = self.events.clone();
        let generation = self.generation;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(StreamEvent::new(generation, SocketEvent::ReconnectDue));
        });

        self.reconnect = Some(ReconnectTimer { delay, task });
    }

    fn connect(&mut self) {
        self.generation += 1;

        let (url, streams) =
            match fit_url(self.protocol.as_ref(), &self.config, &self.plan, self.interval) {
                Ok(fitted) => fitted,
                Err(error) => {
                    error!(url = %self.config.url, %error, "invalid stream url");
                    self.state = ConnectionState::Disconnected;
                    self.error = Some(SyncError::ConnectionLost {
                        code: super::CLOSE_ABNORMAL,
                        reason: format!("invalid stream url: {error}"),
                    });
                    return;
                }
            };

        let request = ConnectRequest {
            generation: self.generation,
            url,
            subscribe: self.protocol.subscribe_messages(&streams),
            ping: self.protocol.ping_message(),
        };

        debug!(generation = self.generation, streams = ?streams, "opening stream");
        self.streams = streams;
        self.state = ConnectionState::Connecting;
        self.socket = Some(self.connector.open(request, self.events.clone()));
    }

    /// Invalidate everything in flight and release the socket and timer.
    fn teardown(&mut self) {
        self.generation += 1;
        self.reconnect = None;
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::StreamVenue, types::Symbol};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// Records every connect request without touching the network.
    #[derive(Default)]
    struct RecordingConnector {
        requests: Mutex<Vec<ConnectRequest>>,
    }

    impl RecordingConnector {
        fn opened(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn last(&self) -> ConnectRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl StreamConnector for RecordingConnector {
        fn open(&self, request: ConnectRequest, _: mpsc::UnboundedSender<StreamEvent>) -> SocketHandle {
            self.requests.lock().unwrap().push(request);
            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            SocketHandle::new(
                shutdown_tx,
                tokio::spawn(async move {
                    let _ = shutdown_rx.await;
                }),
            )
        }
    }

    fn plan(names: &[&str]) -> StreamPlan {
        let tickers: Vec<Symbol> = names.iter().map(|n| Symbol::parse(n).unwrap()).collect();
        StreamPlan::new(tickers.clone(), tickers.first().cloned())
    }

    fn connection(
        config: StreamConfig,
    ) -> (
        StreamConnection,
        Arc<RecordingConnector>,
        mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(RecordingConnector::default());
        let connection =
            StreamConnection::new(config, Interval::OneMinute, connector.clone(), events_tx);
        (connection, connector, events_rx)
    }

    fn event(connection: &StreamConnection, kind: SocketEvent) -> StreamEvent {
        StreamEvent::new(connection.generation(), kind)
    }

    #[test]
    fn test_reconnect_delay_schedule() {
        struct TestCase {
            attempt: u32,
            close: CloseInfo,
            expected: Duration,
        }

        let config = StreamConfig::default();
        let tests = vec![
            TestCase {
                // TC0: first retry after abnormal close
                attempt: 0,
                close: CloseInfo::abnormal(),
                expected: Duration::from_secs(5),
            },
            TestCase {
                // TC1: doubles
                attempt: 2,
                close: CloseInfo::abnormal(),
                expected: Duration::from_secs(20),
            },
            TestCase {
                // TC2: capped
                attempt: 3,
                close: CloseInfo::abnormal(),
                expected: Duration::from_secs(30),
            },
            TestCase {
                // TC3: server close frame uses the shorter base
                attempt: 1,
                close: CloseInfo::remote(1011),
                expected: Duration::from_secs(6),
            },
            TestCase {
                // TC4: overflow saturates to the cap
                attempt: 40,
                close: CloseInfo::remote(1001),
                expected: Duration::from_secs(30),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = reconnect_delay(&config, test.attempt, &test.close);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[tokio::test]
    async fn test_rebuild_connects_with_plan() {
        let (mut connection, connector, _events) = connection(StreamConfig::default());

        connection.rebuild(plan(&["BTCUSDT", "ETHUSDT"]));

        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert_eq!(connector.opened(), 1);
        let request = connector.last();
        assert_eq!(request.generation, connection.generation());
        assert_eq!(
            request.url.as_str(),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@kline_1m/btcusdt@ticker/ethusdt@ticker"
        );

        connection.handle(event(&connection, SocketEvent::Opened));
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_bybit_rebuild_sends_subscribe_messages() {
        let (mut connection, connector, _events) =
            connection(StreamConfig::new(StreamVenue::Bybit));

        connection.rebuild(plan(&["SOLUSDT"]));

        let request = connector.last();
        assert_eq!(request.url.as_str(), "wss://stream.bybit.com/v5/public/spot");
        assert_eq!(
            request.subscribe,
            vec![r#"{"args":["kline.1.SOLUSDT","tickers.SOLUSDT"],"op":"subscribe"}"#.to_string()]
        );
        assert!(request.ping.is_some());
    }

    #[tokio::test]
    async fn test_reconnects_stop_after_max_attempts() {
        let (mut connection, connector, _events) = connection(StreamConfig::default());
        connection.rebuild(plan(&["BTCUSDT"]));

        let expected_delays = [5, 10, 20, 30, 30];
        for (attempt, secs) in expected_delays.into_iter().enumerate() {
            connection.handle(event(&connection, SocketEvent::Closed(CloseInfo::abnormal())));

            assert_eq!(connection.state(), ConnectionState::Reconnecting);
            assert_eq!(connection.attempts(), attempt as u32 + 1);
            assert_eq!(connection.pending_reconnect(), Some(Duration::from_secs(secs)));
            assert_eq!(connection.error(), None);

            connection.handle(event(&connection, SocketEvent::ReconnectDue));
            assert_eq!(connection.state(), ConnectionState::Connecting);
            assert_eq!(connection.pending_reconnect(), None);
        }

        connection.handle(event(&connection, SocketEvent::Closed(CloseInfo::abnormal())));

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.pending_reconnect(), None);
        assert_eq!(
            connection.error(),
            Some(&SyncError::MaxReconnectExceeded { attempts: 5 })
        );
        assert!(connection.is_exhausted());
        assert_eq!(connector.opened(), 6);

        // A new watch list starts over
        connection.rebuild(plan(&["BTCUSDT"]));
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert_eq!(connection.attempts(), 0);
        assert_eq!(connection.error(), None);
        assert_eq!(connector.opened(), 7);
    }

    #[tokio::test]
    async fn test_successful_open_resets_attempts() {
        let (mut connection, _connector, _events) = connection(StreamConfig::default());
        connection.rebuild(plan(&["BTCUSDT"]));

        connection.handle(event(&connection, SocketEvent::Closed(CloseInfo::abnormal())));
        connection.handle(event(&connection, SocketEvent::ReconnectDue));
        connection.handle(event(&connection, SocketEvent::Opened));

        assert_eq!(connection.attempts(), 0);
        assert_eq!(connection.error(), None);

        connection.handle(event(&connection, SocketEvent::Closed(CloseInfo::abnormal())));
        assert_eq!(connection.pending_reconnect(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_clean_close_and_error_do_not_reconnect() {
        let (mut connection, connector, _events) = connection(StreamConfig::default());
        connection.rebuild(plan(&["BTCUSDT"]));
        connection.handle(event(&connection, SocketEvent::Opened));

        connection.handle(event(&connection, SocketEvent::Errored("reset".to_string())));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.pending_reconnect(), None);

        connection.handle(event(&connection, SocketEvent::Closed(CloseInfo::remote(1000))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.pending_reconnect(), None);
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let (mut connection, connector, _events) = connection(StreamConfig::default());
        connection.rebuild(plan(&["BTCUSDT"]));
        let stale = connection.generation();

        connection.handle(event(&connection, SocketEvent::Closed(CloseInfo::abnormal())));
        assert_eq!(connection.state(), ConnectionState::Reconnecting);

        // Watch list changes before the timer fires
        connection.rebuild(plan(&["ETHUSDT"]));
        assert_eq!(connection.pending_reconnect(), None);
        let opened = connector.opened();

        connection.handle(StreamEvent::new(stale, SocketEvent::ReconnectDue));
        connection.handle(StreamEvent::new(stale, SocketEvent::Closed(CloseInfo::abnormal())));

        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert_eq!(connection.attempts(), 0);
        assert_eq!(connector.opened(), opened);
    }

    #[tokio::test]
    async fn test_message_routing() {
        let (mut connection, _connector, _events) = connection(StreamConfig::default());
        connection.rebuild(plan(&["BTCUSDT"]));
        connection.handle(event(&connection, SocketEvent::Opened));

        let kline = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","E":1700000030000,"s":"BTCUSDT","k":{"t":1700000000000,"o":"1","c":"2","h":"2","l":"1","v":"3","x":false}}}"#;
        let updates = connection.handle(event(&connection, SocketEvent::Message(kline.to_string())));
        assert_eq!(updates.len(), 1);

        let garbage = connection.handle(event(&connection, SocketEvent::Message("{}".to_string())));
        assert!(garbage.is_empty());
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_dispose_is_terminal() {
        let (mut connection, connector, _events) = connection(StreamConfig::default());
        connection.rebuild(plan(&["BTCUSDT"]));
        connection.handle(event(&connection, SocketEvent::Closed(CloseInfo::abnormal())));

        connection.dispose();

        assert_eq!(connection.state(), ConnectionState::Disposed);
        assert_eq!(connection.pending_reconnect(), None);

        connection.handle(event(&connection, SocketEvent::ReconnectDue));
        connection.rebuild(plan(&["ETHUSDT"]));
        assert_eq!(connection.state(), ConnectionState::Disposed);
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_timer_fires_tagged_event() {
        let config = StreamConfig {
            abnormal_reconnect_base_delay: Duration::from_millis(10),
            ..StreamConfig::default()
        };
        let (mut connection, _connector, mut events) = connection(config);
        connection.rebuild(plan(&["BTCUSDT"]));

        connection.handle(event(&connection, SocketEvent::Closed(CloseInfo::abnormal())));

        let fired = events.recv().await.unwrap();
        assert_eq!(fired, event(&connection, SocketEvent::ReconnectDue));
    }
}
