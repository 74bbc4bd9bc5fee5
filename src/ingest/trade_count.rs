// =============================================================================
// Trade-Count Pipeline — per-symbol kline REST fan-out, bounded concurrency
// =============================================================================
//
// The kline endpoint is the only source for per-minute trade counts, so this
// pipeline polls it symbol by symbol under a concurrency semaphore and the
// pipeline's own rate limiter. Only closed minutes are persisted; the upsert
// key makes re-fetching overlapping minutes harmless.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::binance::{ApiStatusError, ExchangeClient, RateLimiter, SymbolBlacklist};
use crate::ingest::BackoffPolicy;
use crate::store::{MetricStore, TradeCountRow};

/// Parallel in-flight kline requests.
const CONCURRENT_REQUESTS: usize = 10;

/// Symbols per REST burst, with a pause in between.
const REST_BATCH_SIZE: usize = 50;
const INTER_BATCH_PAUSE: Duration = Duration::from_secs(1);

/// Klines fetched per symbol; enough to cover a missed cycle.
const KLINE_FETCH_LIMIT: u32 = 3;

/// Poll trade counts for the whole universe every `cadence`. Runs until
/// aborted.
pub async fn run_trade_count_pipeline(
    client: Arc<ExchangeClient>,
    store: Arc<MetricStore>,
    cadence: Duration,
) {
    info!(cadence_secs = cadence.as_secs(), "trade-count pipeline starting");
    let limiter = Arc::new(RateLimiter::default_rest());
    let blacklist = Arc::new(SymbolBlacklist::default_ttl());
    let semaphore = Arc::new(Semaphore::new(CONCURRENT_REQUESTS));
    let mut backoff = BackoffPolicy::new(cadence);

    loop {
        match run_cycle(&client, &store, &limiter, &blacklist, &semaphore).await {
            Ok(count) => {
                debug!(count, blacklisted = blacklist.len(), "trade counts persisted");
                backoff.on_success();
                tokio::time::sleep(cadence).await;
            }
            Err(e) => {
                let delay = backoff.on_error();
                error!(
                    error = %e,
                    streak = backoff.consecutive_errors(),
                    delay_secs = delay.as_secs(),
                    "trade-count cycle failed — backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn run_cycle(
    client: &Arc<ExchangeClient>,
    store: &Arc<MetricStore>,
    limiter: &Arc<RateLimiter>,
    blacklist: &Arc<SymbolBlacklist>,
    semaphore: &Arc<Semaphore>,
) -> anyhow::Result<usize> {
    let symbols = client.trading_symbols().await?;
    let mut rows: Vec<TradeCountRow> = Vec::new();

    for batch in symbols.chunks(REST_BATCH_SIZE) {
        let mut handles = Vec::with_capacity(batch.len());
        for symbol in batch {
            let client = client.clone();
            let limiter = limiter.clone();
            let blacklist = blacklist.clone();
            let semaphore = semaphore.clone();
            let symbol = symbol.clone();
            handles.push(tokio::spawn(async move {
                fetch_one(&client, &limiter, &blacklist, &semaphore, &symbol).await
            }));
        }
        for handle in handles {
            if let Ok(Some(mut symbol_rows)) = handle.await {
                rows.append(&mut symbol_rows);
            }
        }
        if batch.len() == REST_BATCH_SIZE {
            tokio::time::sleep(INTER_BATCH_PAUSE).await;
        }
    }

    let count = rows.len();
    store.upsert_trade_counts(&rows)?;
    Ok(count)
}

/// Fetch the recent closed minutes for one symbol. Per-symbol failures are
/// absorbed here so the rest of the batch is unaffected.
async fn fetch_one(
    client: &ExchangeClient,
    limiter: &RateLimiter,
    blacklist: &SymbolBlacklist,
    semaphore: &Semaphore,
    symbol: &str,
) -> Option<Vec<TradeCountRow>> {
    if blacklist.contains(symbol) {
        return None;
    }
    let _permit = semaphore.acquire().await.ok()?;
    limiter.acquire().await;

    match client.klines_1m(symbol, KLINE_FETCH_LIMIT).await {
        Ok(klines) => {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let rows: Vec<TradeCountRow> = klines
                .into_iter()
                .filter(|k| k.close_time <= now_ms)
                .map(|k| TradeCountRow {
                    ts: k.open_time,
                    symbol: symbol.to_string(),
                    trade_count: k.trade_count,
                })
                .collect();
            Some(rows)
        }
        Err(e) => {
            if let Some(api) = e.downcast_ref::<ApiStatusError>() {
                match api.status {
                    429 => {
                        error!(symbol, "rate limit hit on klines — sleeping the window");
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    400 | 404 => {
                        blacklist.insert(symbol);
                        warn!(symbol, status = api.status, "symbol rejected — blacklisted");
                    }
                    status => warn!(symbol, status, "klines request failed"),
                }
            } else {
                warn!(symbol, error = %e, "klines request failed");
            }
            None
        }
    }
}
