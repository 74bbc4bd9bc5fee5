// =============================================================================
// Depth Stream Consumer — feeds the density book from live order-book data
// =============================================================================
//
// Each symbol contributes two interleaved streams on the same socket:
// `{symbol}@bookTicker` keeps the mid-price reference current, and
// `{symbol}@depth` delivers the level deltas the book tracks. Bids map to
// LONG, asks to SHORT.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::binance::stream::{chunk_streams, run_stream_group};
use crate::binance::ExchangeClient;
use crate::density::book::{DensityBook, Side};

/// Symbols per socket: each symbol carries two streams, so 25 symbols keeps a
/// socket at the ~50-stream mark.
const SYMBOLS_PER_SOCKET: usize = 25;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Subscribe the whole universe and feed depth updates into `book`.
/// Spawns one task per socket group; runs until the process stops.
pub async fn run_density_stream(client: Arc<ExchangeClient>, book: Arc<DensityBook>) {
    let symbols = loop {
        match client.trading_symbols().await {
            Ok(s) if !s.is_empty() => break s,
            Ok(_) => warn!("empty symbol universe for density stream — retrying"),
            Err(e) => warn!(error = %e, "failed to fetch density stream universe — retrying"),
        }
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    };

    let lower: Vec<String> = symbols.iter().map(|s| s.to_lowercase()).collect();
    let groups = chunk_streams(&lower, SYMBOLS_PER_SOCKET);
    info!(
        symbols = lower.len(),
        sockets = groups.len(),
        "density stream starting depth sockets"
    );

    for group in groups {
        let streams: Vec<String> = group
            .iter()
            .flat_map(|s| [format!("{s}@depth"), format!("{s}@bookTicker")])
            .collect();
        let book = book.clone();
        tokio::spawn(async move {
            loop {
                let result = run_stream_group(&streams, |stream, data| {
                    handle_event(&book, stream, data);
                })
                .await;
                if let Err(e) = result {
                    error!(error = %e, "depth socket error — reconnecting");
                }
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        });
    }
}

/// Route one combined-stream event into the book.
fn handle_event(book: &DensityBook, stream: &str, data: &serde_json::Value) {
    if stream.ends_with("@bookTicker") {
        let Some(symbol) = data["s"].as_str() else {
            return;
        };
        let bid = parse_f64_ref(&data["b"]);
        let ask = parse_f64_ref(&data["a"]);
        let ts = data["E"]
            .as_i64()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        if let (Some(bid), Some(ask)) = (bid, ask) {
            book.update_mid(symbol, bid, ask, ts);
        }
        return;
    }

    if !stream.ends_with("@depth") {
        return;
    }
    let Some(symbol) = data["s"].as_str() else {
        return;
    };
    let now_ms = chrono::Utc::now().timestamp_millis();

    // Prefer the fresh bookTicker mid; fall back to the frame's own best
    // levels when the ticker cache is cold.
    let reference = book
        .reference_mid(symbol, now_ms)
        .or_else(|| frame_mid(data));
    let Some(reference) = reference else {
        warn!(symbol, "no usable reference mid — depth frame skipped");
        return;
    };

    apply_levels(book, symbol, Side::Long, data["b"].as_array(), reference, now_ms);
    apply_levels(book, symbol, Side::Short, data["a"].as_array(), reference, now_ms);
}

fn apply_levels(
    book: &DensityBook,
    symbol: &str,
    side: Side,
    levels: Option<&Vec<serde_json::Value>>,
    reference: f64,
    now_ms: i64,
) {
    let Some(levels) = levels else {
        return;
    };
    for level in levels {
        let (Some(price), Some(qty)) = (
            level.get(0).and_then(parse_f64_ref),
            level.get(1).and_then(parse_f64_ref),
        ) else {
            warn!(symbol, "malformed depth level — skipped");
            continue;
        };
        book.apply_level(symbol, side, price, qty, reference, now_ms);
    }
}

/// Mid computed from the depth frame itself (best bid / best ask).
fn frame_mid(data: &serde_json::Value) -> Option<f64> {
    let best = |key: &str| -> Option<f64> {
        data[key]
            .as_array()?
            .first()?
            .get(0)
            .and_then(parse_f64_ref)
    };
    match (best("b"), best("a")) {
        (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
        (Some(bid), None) => Some(bid),
        (None, Some(ask)) => Some(ask),
        (None, None) => None,
    }
}

fn parse_f64_ref(val: &serde_json::Value) -> Option<f64> {
    if let Some(s) = val.as_str() {
        s.parse().ok()
    } else {
        val.as_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_ticker_updates_mid() {
        let book = DensityBook::new();
        let data = serde_json::json!({"s": "BTCUSDT", "b": "99990", "a": "100010", "E": 1_000i64});
        handle_event(&book, "btcusdt@bookTicker", &data);
        assert_eq!(book.reference_mid("BTCUSDT", 2_000), Some(100_000.0));
    }

    #[test]
    fn depth_frame_creates_density_via_frame_mid_fallback() {
        let book = DensityBook::new();
        // No bookTicker yet: the frame's own best levels supply the mid.
        let data = serde_json::json!({
            "s": "BTCUSDT",
            "E": 1_000i64,
            "b": [["99000", "3.0"]],
            "a": [["101000", "0.001"]]
        });
        handle_event(&book, "btcusdt@depth", &data);
        // 99000 x 3.0 = $297k resting within band → tracked; the tiny ask is not.
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn unknown_streams_are_ignored() {
        let book = DensityBook::new();
        let data = serde_json::json!({"s": "BTCUSDT"});
        handle_event(&book, "btcusdt@aggTrade", &data);
        assert!(book.is_empty());
    }
}
