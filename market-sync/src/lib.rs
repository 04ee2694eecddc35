/// Market Sync - real-time candle synchronisation
///
/// Keeps a client-side view of a crypto market live:
/// - historical candles from REST providers tried in failover order
/// - a bounded set of ticker streams plus klines for the chart symbol over one WebSocket
/// - reconnects with exponential backoff and a capped attempt budget
/// - rolling per-symbol price growth over a short time window
///
/// [`CoordinatorService`] wires the pieces together and publishes immutable
/// [`MarketSnapshot`]s.
pub mod config;
pub mod coordinator;
pub mod error;
pub mod growth;
pub mod history;
pub mod series;
pub mod stream;
pub mod subscription;
pub mod types;

pub(crate) mod de;

// Re-export commonly used types for convenience
pub use config::{HistoryConfig, ProviderConfig, StreamConfig, StreamVenue, SyncConfig};
pub use coordinator::{CoordinatorService, MarketSnapshot, UpdateSubscription};
pub use error::{ProviderFailure, SyncError};
pub use growth::GrowthCalculator;
pub use history::{HistoricalDataFetcher, HistoryBatch, HistoryProvider};
pub use series::{LiveUpdate, MergeOutcome, SeriesStore};
pub use stream::{ConnectionState, StreamConnection};
pub use subscription::{SubscriptionDiff, SubscriptionManager};
pub use types::{Candle, Interval, PriceSample, Symbol, TickerSnapshot};
