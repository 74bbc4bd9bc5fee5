// =============================================================================
// Open-Interest Pipeline — per-symbol REST fan-out, normalized to USD
// =============================================================================
//
// The openInterest endpoint reports raw contract counts, which are useless
// for cross-symbol thresholds. Each tick is multiplied by the symbol's latest
// stored price (if fresh) before persisting, so the open_interest table is
// uniformly quote-currency.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::binance::{ApiStatusError, ExchangeClient, RateLimiter, SymbolBlacklist};
use crate::ingest::BackoffPolicy;
use crate::store::{MetricFamily, MetricStore, OpenInterestRow};

/// Parallel in-flight OI requests.
const CONCURRENT_REQUESTS: usize = 10;

/// Symbols per REST burst, with a pause in between.
const REST_BATCH_SIZE: usize = 50;
const INTER_BATCH_PAUSE: Duration = Duration::from_secs(1);

/// Stored prices older than this are not trusted for USD conversion.
const PRICE_FRESHNESS_MS: i64 = 120_000;

/// Poll open interest for the whole universe every `cadence`. Runs until
/// aborted.
pub async fn run_open_interest_pipeline(
    client: Arc<ExchangeClient>,
    store: Arc<MetricStore>,
    cadence: Duration,
) {
    info!(cadence_secs = cadence.as_secs(), "open-interest pipeline starting");
    let limiter = Arc::new(RateLimiter::default_rest());
    let blacklist = Arc::new(SymbolBlacklist::default_ttl());
    let semaphore = Arc::new(Semaphore::new(CONCURRENT_REQUESTS));
    let mut backoff = BackoffPolicy::new(cadence);

    loop {
        match run_cycle(&client, &store, &limiter, &blacklist, &semaphore).await {
            Ok(count) => {
                debug!(count, blacklisted = blacklist.len(), "open interest persisted");
                backoff.on_success();
                tokio::time::sleep(cadence).await;
            }
            Err(e) => {
                let delay = backoff.on_error();
                error!(
                    error = %e,
                    streak = backoff.consecutive_errors(),
                    delay_secs = delay.as_secs(),
                    "open-interest cycle failed — backing off"
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

    // Latest stored prices, kept only while fresh enough to convert with.
    let now_ms = chrono::Utc::now().timestamp_millis();
    let prices: HashMap<String, f64> = store
        .query_latest_per_symbol(MetricFamily::Price)?
        .into_iter()
        .filter(|row| now_ms - row.ts <= PRICE_FRESHNESS_MS)
        .map(|row| (row.symbol, row.value))
        .collect();

    let mut rows: Vec<OpenInterestRow> = Vec::new();
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
            let Ok(Some(tick)) = handle.await else {
                continue;
            };
            let Some(price) = prices.get(&tick.symbol) else {
                warn!(symbol = %tick.symbol, "no fresh price for USD conversion — skipping");
                continue;
            };
            rows.push(OpenInterestRow {
                ts: tick.ts,
                symbol: tick.symbol,
                oi_usd: tick.oi_coins * price,
            });
        }
        if batch.len() == REST_BATCH_SIZE {
            tokio::time::sleep(INTER_BATCH_PAUSE).await;
        }
    }

    let count = rows.len();
    store.upsert_open_interest(&rows)?;
    Ok(count)
}

/// Fetch one symbol's OI. Per-symbol failures are absorbed here.
async fn fetch_one(
    client: &ExchangeClient,
    limiter: &RateLimiter,
    blacklist: &SymbolBlacklist,
    semaphore: &Semaphore,
    symbol: &str,
) -> Option<crate::binance::client::OpenInterestTick> {
    if blacklist.contains(symbol) {
        return None;
    }
    let _permit = semaphore.acquire().await.ok()?;
    limiter.acquire().await;

    match client.open_interest(symbol).await {
        Ok(tick) => Some(tick),
        Err(e) => {
            if let Some(api) = e.downcast_ref::<ApiStatusError>() {
                match api.status {
                    429 => {
                        error!(symbol, "rate limit hit on openInterest — sleeping the window");
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    400 | 404 => {
                        blacklist.insert(symbol);
                        warn!(symbol, status = api.status, "symbol rejected — blacklisted");
                    }
                    status => warn!(symbol, status, "openInterest request failed"),
                }
            } else {
                warn!(symbol, error = %e, "openInterest request failed");
            }
            None
        }
    }
}
