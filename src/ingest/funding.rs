// =============================================================================
// Funding Pipeline — premium index batch poll
// =============================================================================
//
// One request covers the whole universe, so this is the simplest loop of the
// five: fetch, normalize, upsert.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::binance::{ExchangeClient, RateLimiter};
use crate::ingest::BackoffPolicy;
use crate::store::{FundingRow, MetricStore};

/// Poll funding rates every `cadence`. Runs until aborted.
pub async fn run_funding_pipeline(
    client: Arc<ExchangeClient>,
    store: Arc<MetricStore>,
    cadence: Duration,
) {
    info!(cadence_secs = cadence.as_secs(), "funding pipeline starting");
    let limiter = RateLimiter::default_rest();
    let mut backoff = BackoffPolicy::new(cadence);

    loop {
        limiter.acquire().await;

        let result = async {
            let ticks = client.premium_index().await?;
            let rows: Vec<FundingRow> = ticks
                .into_iter()
                .map(|t| FundingRow {
                    ts: t.ts,
                    symbol: t.symbol,
                    rate: t.rate,
                    next_funding_ts: t.next_funding_ts,
                })
                .collect();
            let count = rows.len();
            store.upsert_funding_rates(&rows)?;
            anyhow::Ok(count)
        }
        .await;

        match result {
            Ok(count) => {
                debug!(count, "funding rates persisted");
                backoff.on_success();
                tokio::time::sleep(cadence).await;
            }
            Err(e) => {
                let delay = backoff.on_error();
                error!(
                    error = %e,
                    streak = backoff.consecutive_errors(),
                    delay_secs = delay.as_secs(),
                    "funding cycle failed — backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
