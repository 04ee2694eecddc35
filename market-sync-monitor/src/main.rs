use market_sync::{CoordinatorService, MarketSnapshot, Symbol, SyncConfig};
use rustls::crypto::ring::default_provider;
use std::{error::Error, time::Duration};
use tracing::{debug, error, info, warn};

const DEFAULT_SYMBOLS: &str = "BTCUSDT,ETHUSDT,SOLUSDT";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = default_provider().install_default();

    // Initialize logging
    init_logging();

    let config = SyncConfig::from_env();

    // Watch list via MARKET_SYNC_SYMBOLS (default: BTCUSDT,ETHUSDT,SOLUSDT)
    let symbols = parse_symbols(
        &std::env::var("MARKET_SYNC_SYMBOLS").unwrap_or_else(|_| DEFAULT_SYMBOLS.to_string()),
    );
    let Some(chart) = symbols.first().cloned() else {
        return Err("MARKET_SYNC_SYMBOLS contains no valid symbols".into());
    };
    let priority = std::env::var("MARKET_SYNC_PRIORITY")
        .ok()
        .and_then(|raw| Symbol::parse(&raw).ok())
        .or_else(|| Some(chart.clone()));

    info!(
        %chart,
        watched = symbols.len(),
        venue = ?config.stream.venue,
        interval = %config.interval,
        "starting market-sync monitor"
    );

    let service = CoordinatorService::start(config, chart);
    service.set_watched_symbols(symbols, priority)?;

    let _subscription = service.subscribe(|snapshot| {
        debug!(
            candles = snapshot.candles.len(),
            connection = %snapshot.connection,
            "snapshot published"
        );
    });

    let mut report = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = report.tick() => log_snapshot(&service.snapshot()),
            result = tokio::signal::ctrl_c() => {
                if let Err(error) = result {
                    warn!(%error, "failed to listen for ctrl-c");
                }
                break;
            }
        }
    }

    info!("shutting down");
    service.stop().await;

    Ok(())
}

fn parse_symbols(raw: &str) -> Vec<Symbol> {
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .filter_map(|part| match Symbol::parse(part) {
            Ok(symbol) => Some(symbol),
            Err(error) => {
                warn!(%error, "skipping symbol");
                None
            }
        })
        .collect()
}

fn log_snapshot(snapshot: &MarketSnapshot) {
    let latest = snapshot.candles.last();
    info!(
        symbol = ?snapshot.symbol,
        connection = %snapshot.connection,
        candles = snapshot.candles.len(),
        close = ?latest.map(|candle| candle.close),
        source = ?snapshot.history_source,
        has_more = snapshot.has_more_history,
        "market state"
    );

    for symbol in &snapshot.subscriptions {
        let price = snapshot.tickers.get(symbol).map(|ticker| ticker.price);
        let growth = snapshot.growth.get(symbol).copied().unwrap_or_default();
        info!(%symbol, ?price, growth = format!("{growth:+.3}%"), "ticker");
    }

    for error in [&snapshot.history_error, &snapshot.stream_error].into_iter().flatten() {
        if error.is_transient() {
            warn!(%error, "market data degraded");
        } else {
            error!(%error, terminal = error.is_terminal(), "market data unavailable");
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
