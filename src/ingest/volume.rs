// =============================================================================
// Volume Pipeline — kline WebSocket consumer with periodic flush
// =============================================================================
//
// Subscribes to `{symbol}@kline_1m` for the whole universe (in socket groups)
// and buffers the quote volume of every minute that closes. A flusher task
// drains the buffer into the store every few seconds so a socket hiccup never
// loses more than one flush window.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::binance::stream::{chunk_streams, run_stream_group, GROUP_SIZE};
use crate::binance::ExchangeClient;
use crate::store::{MetricStore, VolumeRow};

/// Buffer flush cadence.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Reconnect backoff after a socket error.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Spawn the kline stream consumers and the flush task. Runs until aborted.
pub async fn run_volume_pipeline(client: Arc<ExchangeClient>, store: Arc<MetricStore>) {
    let buffer: Arc<Mutex<Vec<VolumeRow>>> = Arc::new(Mutex::new(Vec::new()));

    // Flusher: drain whatever accumulated since the last pass.
    {
        let store = store.clone();
        let buffer = buffer.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                interval.tick().await;
                let rows: Vec<VolumeRow> = std::mem::take(&mut *buffer.lock());
                if rows.is_empty() {
                    continue;
                }
                if let Err(e) = store.upsert_volumes(&rows) {
                    error!(error = %e, dropped = rows.len(), "volume flush failed — batch dropped");
                } else {
                    debug!(count = rows.len(), "volume batch flushed");
                }
            }
        });
    }

    // Symbol universe, retried until the exchange answers.
    let symbols = loop {
        match client.trading_symbols().await {
            Ok(s) if !s.is_empty() => break s,
            Ok(_) => warn!("empty symbol universe — retrying"),
            Err(e) => warn!(error = %e, "failed to fetch symbol universe — retrying"),
        }
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    };

    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@kline_1m", s.to_lowercase()))
        .collect();
    let groups = chunk_streams(&streams, GROUP_SIZE);
    info!(
        symbols = symbols.len(),
        sockets = groups.len(),
        "volume pipeline starting kline streams"
    );

    for group in groups {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            loop {
                let result = run_stream_group(&group, |_stream, data| {
                    if let Some(row) = parse_closed_kline(data) {
                        buffer.lock().push(row);
                    }
                })
                .await;

                if let Err(e) = result {
                    error!(error = %e, "kline socket error — reconnecting");
                }
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        });
    }
}

/// Extract a volume row from a kline event, but only once the minute closes.
fn parse_closed_kline(data: &serde_json::Value) -> Option<VolumeRow> {
    let kline = &data["k"];
    if !kline["x"].as_bool().unwrap_or(false) {
        return None;
    }
    let symbol = data["s"].as_str()?;
    let quote_volume: f64 = kline["q"].as_str()?.parse().ok()?;
    let close_time = kline["T"].as_i64()?;
    Some(VolumeRow {
        ts: close_time,
        symbol: symbol.to_string(),
        quote_volume,
    })
}
