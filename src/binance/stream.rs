// =============================================================================
// Multiplexed WebSocket Streams — combined-stream consumer with reconnects
// =============================================================================
//
// Binance caps the number of streams per combined socket, so subscriptions
// are split into groups of ~50. Each socket is torn down pre-emptively after
// one hour (the exchange disconnects at 24 h anyway; rotating early keeps the
// reconnects spread out) and immediately on read errors — the caller loops
// with a short backoff.
// =============================================================================

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

const STREAM_BASE_URL: &str = "wss://fstream.binance.com/stream";

/// Pre-emptive reconnect interval per socket.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(3600);

/// Streams per combined socket.
pub const GROUP_SIZE: usize = 50;

/// Split stream names into groups of [`GROUP_SIZE`].
pub fn chunk_streams(streams: &[String], group_size: usize) -> Vec<Vec<String>> {
    streams
        .chunks(group_size.max(1))
        .map(|c| c.to_vec())
        .collect()
}

/// Combined-stream URL for one group.
fn multiplex_url(streams: &[String]) -> String {
    format!("{}?streams={}", STREAM_BASE_URL, streams.join("/"))
}

/// Consume one socket until the hourly rotation point, the stream ends, or a
/// read error occurs. Every payload is handed to `on_event` as
/// `(stream_name, data)` from the combined-stream envelope.
///
/// Returns `Ok(())` on a clean rotation/end so the caller can reconnect
/// without logging noise; read errors bubble up as `Err`.
pub async fn run_stream_group<F>(streams: &[String], mut on_event: F) -> Result<()>
where
    F: FnMut(&str, &serde_json::Value),
{
    let url = multiplex_url(streams);
    let (ws, _response) = connect_async(&url)
        .await
        .context("failed to connect combined stream socket")?;
    info!(streams = streams.len(), "combined stream connected");

    let (_write, mut read) = ws.split();
    let deadline = Instant::now() + RECONNECT_INTERVAL;

    loop {
        if Instant::now() >= deadline {
            info!("hourly rotation point reached — reconnecting");
            return Ok(());
        }

        // Bounded read so the rotation deadline is checked on idle sockets.
        let msg = match tokio::time::timeout(Duration::from_secs(5), read.next()).await {
            Err(_) => continue,
            Ok(None) => {
                warn!("combined stream ended");
                return Ok(());
            }
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(msg))) => msg,
        };

        if let Message::Text(text) = msg {
            let envelope: serde_json::Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "unparseable stream frame — skipping");
                    continue;
                }
            };
            let Some(stream_name) = envelope["stream"].as_str() else {
                continue;
            };
            let data = &envelope["data"];
            if data.is_null() {
                continue;
            }
            on_event(stream_name, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_splits_evenly_with_remainder() {
        let streams: Vec<String> = (0..120).map(|i| format!("s{i}@depth")).collect();
        let groups = chunk_streams(&streams, 50);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 50);
        assert_eq!(groups[2].len(), 20);
    }

    #[test]
    fn url_joins_streams_with_slash() {
        let url = multiplex_url(&["btcusdt@depth".into(), "btcusdt@bookTicker".into()]);
        assert!(url.ends_with("?streams=btcusdt@depth/btcusdt@bookTicker"));
    }
}
