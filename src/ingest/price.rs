// =============================================================================
// Price Pipeline — full-universe REST snapshot, immediate upsert
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::binance::{ExchangeClient, RateLimiter};
use crate::ingest::BackoffPolicy;
use crate::store::{MetricStore, PriceRow};

/// Poll the full-symbol price snapshot every `cadence` and upsert the batch.
/// Runs until the task is aborted.
pub async fn run_price_pipeline(
    client: Arc<ExchangeClient>,
    store: Arc<MetricStore>,
    cadence: Duration,
) {
    info!(cadence_secs = cadence.as_secs(), "price pipeline starting");
    let limiter = RateLimiter::default_rest();
    let mut backoff = BackoffPolicy::new(cadence);

    loop {
        limiter.acquire().await;

        let result = async {
            // The universe call is served from a 60 s cache.
            let trading = client.trading_symbols().await?;
            let ticks = client.price_snapshot().await?;

            let rows: Vec<PriceRow> = ticks
                .into_iter()
                .filter(|t| trading.iter().any(|s| s == &t.symbol))
                .map(|t| PriceRow {
                    ts: t.ts,
                    symbol: t.symbol,
                    price: t.price,
                })
                .collect();

            let count = rows.len();
            store.upsert_prices(&rows)?;
            anyhow::Ok(count)
        }
        .await;

        match result {
            Ok(count) => {
                debug!(count, "price snapshot persisted");
                backoff.on_success();
                tokio::time::sleep(cadence).await;
            }
            Err(e) => {
                let delay = backoff.on_error();
                error!(
                    error = %e,
                    streak = backoff.consecutive_errors(),
                    delay_secs = delay.as_secs(),
                    "price pipeline cycle failed — backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
