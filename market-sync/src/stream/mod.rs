//! Live market data over a single multiplexed WebSocket.
//!
//! [`StreamConnection`] owns the connection state machine. Socket I/O runs in
//! a task behind the [`StreamConnector`] seam and reports back through
//! generation-tagged [`StreamEvent`]s, so events from a torn-down socket or a
//! superseded reconnect timer are recognised and dropped.
use crate::types::{Candle, Symbol, TickerSnapshot};
use derive_more::Display;

pub mod connection;
pub mod protocol;
pub mod socket;
pub mod timeout;

pub use connection::{StreamConnection, reconnect_delay};
pub use protocol::{BinanceCombined, BybitSpot, ParseError, StreamProtocol};
pub use socket::{ConnectRequest, SocketHandle, StreamConnector, TungsteniteConnector};

/// WebSocket close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Lifecycle of the stream connection. `Disposed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disposed,
}

/// Symbols to stream: tickers for the watch list, klines for the chart symbol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamPlan {
    pub tickers: Vec<Symbol>,
    pub kline: Option<Symbol>,
}

impl StreamPlan {
    pub fn new(tickers: Vec<Symbol>, kline: Option<Symbol>) -> Self {
        Self { tickers, kline }
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty() && self.kline.is_none()
    }
}

/// Decoded market data frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Ticker(TickerSnapshot),
    Kline {
        symbol: Symbol,
        candle: Candle,
        /// Bucket is final and will not be updated again
        closed: bool,
    },
}

/// How a socket ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    /// We asked for the close ourselves
    pub intentional: bool,
}

impl CloseInfo {
    pub fn intentional() -> Self {
        Self {
            code: CLOSE_NORMAL,
            intentional: true,
        }
    }

    pub fn abnormal() -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            intentional: false,
        }
    }

    pub fn remote(code: u16) -> Self {
        Self {
            code,
            intentional: false,
        }
    }

    /// Clean closes never trigger a reconnect.
    pub fn is_clean(&self) -> bool {
        self.intentional || self.code == CLOSE_NORMAL
    }

    pub fn is_abnormal(&self) -> bool {
        self.code == CLOSE_ABNORMAL
    }
}

/// Something that happened on a socket or its reconnect timer.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Opened,
    Message(String),
    Errored(String),
    Closed(CloseInfo),
    ReconnectDue,
}

/// [`SocketEvent`] tagged with the connection generation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub generation: u64,
    pub kind: SocketEvent,
}

impl StreamEvent {
    pub fn new(generation: u64, kind: SocketEvent) -> Self {
        Self { generation, kind }
    }
}
