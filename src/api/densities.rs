// =============================================================================
// Density Live-Feed — snapshot + deltas over WebSocket, JSON or MessagePack
// =============================================================================
//
// Consumers connect to `/ws/densities?format=json|msgpack`, receive a full
// snapshot, then a delta every 2 seconds computed against the last broadcast
// state. Noise suppression: a record only enters `update` when its size moved
// more than $1000, its age moved more than 10 s, `touched` flipped, or the
// eaten amount moved more than $1000. Slow or dead consumers are dropped;
// they reconcile via the snapshot on reconnect.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::density::book::DensityBook;
use crate::density::Side;

/// Broadcast cadence.
const BROADCAST_INTERVAL: Duration = Duration::from_secs(2);

/// Delta thresholds.
const SIZE_DELTA_USD: f64 = 1_000.0;
const DURATION_DELTA_SEC: i64 = 10;
const REDUCTION_DELTA_USD: f64 = 1_000.0;

/// Wire format negotiated per consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    Msgpack,
}

/// Compact density record as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DensityWire {
    /// Symbol, uppercase.
    pub s: String,
    /// Side: "L" or "S".
    pub t: &'static str,
    /// Price level.
    pub p: f64,
    /// Current resting size, USD.
    pub u: f64,
    /// All-time max size, USD.
    pub max_u: f64,
    pub touched: bool,
    pub reduction_usd: f64,
    /// Percent from market, rounded.
    pub pct: f64,
    /// Age in seconds.
    pub d: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DensityDelta {
    pub add: Vec<DensityWire>,
    pub update: Vec<DensityWire>,
    pub remove: Vec<String>,
}

impl DensityDelta {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }
}

#[derive(Serialize)]
struct FeedMessage<T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    ts: i64,
    data: T,
}

struct Consumer {
    tx: mpsc::UnboundedSender<Message>,
    format: WireFormat,
}

/// Hub of density-feed consumers.
pub struct DensityFeed {
    book: Arc<DensityBook>,
    consumers: Mutex<HashMap<Uuid, Consumer>>,
    last_snapshot: Mutex<HashMap<String, DensityWire>>,
}

impl DensityFeed {
    pub fn new(book: Arc<DensityBook>) -> Self {
        Self {
            book,
            consumers: Mutex::new(HashMap::new()),
            last_snapshot: Mutex::new(HashMap::new()),
        }
    }

    /// Register a consumer and queue the initial snapshot in its format.
    pub fn register(&self, format: WireFormat) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let snapshot = self.prepare_snapshot(chrono::Utc::now().timestamp_millis());
        let message = FeedMessage {
            kind: "snapshot",
            ts: chrono::Utc::now().timestamp_millis(),
            data: snapshot.values().cloned().collect::<Vec<_>>(),
        };
        if let Some(encoded) = encode(&message, format) {
            let _ = tx.send(encoded);
        }

        self.consumers.lock().insert(id, Consumer { tx, format });
        info!(consumer = %id, ?format, total = self.consumer_count(), "density consumer connected");
        (id, rx)
    }

    pub fn unregister(&self, id: Uuid) {
        if self.consumers.lock().remove(&id).is_some() {
            info!(consumer = %id, total = self.consumer_count(), "density consumer disconnected");
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Current book state keyed by `SYMBOL:side:price`.
    fn prepare_snapshot(&self, now_ms: i64) -> HashMap<String, DensityWire> {
        let mut out = HashMap::new();
        for record in self.book.snapshot() {
            let side_tag = match record.side {
                Side::Long => "L",
                Side::Short => "S",
            };
            let symbol = record.symbol.to_uppercase();
            let key = format!("{symbol}:{side_tag}:{}", record.price);
            out.insert(
                key,
                DensityWire {
                    s: symbol,
                    t: side_tag,
                    p: record.price,
                    u: record.current_size_usd,
                    max_u: record.max_size_usd,
                    touched: record.touched,
                    reduction_usd: record.reduction_usd,
                    pct: (record.percent_from_market * 100.0).round() / 100.0,
                    d: (now_ms - record.first_seen).max(0) / 1000,
                },
            );
        }
        out
    }

    /// Delta between two snapshots, threshold-filtered for `update`.
    fn calculate_delta(
        old: &HashMap<String, DensityWire>,
        new: &HashMap<String, DensityWire>,
    ) -> DensityDelta {
        let mut delta = DensityDelta::default();

        for (key, wire) in new {
            match old.get(key) {
                None => delta.add.push(wire.clone()),
                Some(prev) => {
                    let changed = (prev.u - wire.u).abs() > SIZE_DELTA_USD
                        || (prev.d - wire.d).abs() > DURATION_DELTA_SEC
                        || prev.touched != wire.touched
                        || (prev.reduction_usd - wire.reduction_usd).abs() > REDUCTION_DELTA_USD;
                    if changed {
                        delta.update.push(wire.clone());
                    }
                }
            }
        }
        for key in old.keys() {
            if !new.contains_key(key) {
                delta.remove.push(key.clone());
            }
        }
        delta
    }

    /// The 2-second broadcast loop. Runs until aborted.
    pub async fn run_broadcast_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(BROADCAST_INTERVAL);
        loop {
            interval.tick().await;

            let now_ms = chrono::Utc::now().timestamp_millis();
            let current = self.prepare_snapshot(now_ms);
            let delta = {
                let last = self.last_snapshot.lock();
                Self::calculate_delta(&last, &current)
            };

            if !delta.is_empty() && self.consumer_count() > 0 {
                let message = FeedMessage {
                    kind: "delta",
                    ts: now_ms,
                    data: &delta,
                };
                let mut dead: Vec<Uuid> = Vec::new();
                {
                    let consumers = self.consumers.lock();
                    for (id, consumer) in consumers.iter() {
                        let Some(encoded) = encode(&message, consumer.format) else {
                            continue;
                        };
                        if consumer.tx.send(encoded).is_err() {
                            dead.push(*id);
                        }
                    }
                }
                for id in dead {
                    self.unregister(id);
                }
                debug!(
                    add = delta.add.len(),
                    update = delta.update.len(),
                    remove = delta.remove.len(),
                    "density delta broadcast"
                );
            }

            *self.last_snapshot.lock() = current;
        }
    }
}

/// Serialize a feed message in the consumer's wire format.
fn encode<T: Serialize>(message: &T, format: WireFormat) -> Option<Message> {
    match format {
        WireFormat::Json => match serde_json::to_string(message) {
            Ok(json) => Some(Message::Text(json)),
            Err(e) => {
                error!(error = %e, "density feed JSON serialization failed");
                None
            }
        },
        WireFormat::Msgpack => match rmp_serde::to_vec_named(message) {
            Ok(bytes) => Some(Message::Binary(bytes)),
            Err(e) => {
                error!(error = %e, "density feed msgpack serialization failed");
                None
            }
        },
    }
}

// =============================================================================
// WebSocket endpoint
// =============================================================================

#[derive(Deserialize)]
pub struct FormatQuery {
    #[serde(default)]
    format: Option<String>,
}

/// `GET /ws/densities?format=json|msgpack`.
pub async fn densities_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<FormatQuery>,
) -> impl IntoResponse {
    let format = match query.format.as_deref() {
        None | Some("json") => WireFormat::Json,
        Some("msgpack") => WireFormat::Msgpack,
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("unknown format \"{other}\" (use json or msgpack)"),
            )
                .into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_density_socket(socket, state, format))
        .into_response()
}

async fn handle_density_socket(socket: WebSocket, state: Arc<AppState>, format: WireFormat) {
    let feed = state.density_feed.clone();
    let (id, mut rx) = feed.register(format);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        if let Err(e) = sender.send(msg).await {
                            debug!(consumer = %id, error = %e, "density send failed — dropping consumer");
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    // Liveness probe, answered in kind.
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        if sender.send(Message::Text("pong".into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) if data == b"ping" => {
                        if sender.send(Message::Binary(b"pong".to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(consumer = %id, error = %e, "density socket receive error");
                        break;
                    }
                }
            }
        }
    }

    feed.unregister(id);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(key_sym: &str, u: f64, d: i64, touched: bool, reduction: f64) -> DensityWire {
        DensityWire {
            s: key_sym.to_string(),
            t: "L",
            p: 100.0,
            u,
            max_u: u.max(200_000.0),
            touched,
            reduction_usd: reduction,
            pct: 0.5,
            d,
        }
    }

    fn map(entries: &[(&str, DensityWire)]) -> HashMap<String, DensityWire> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn delta_detects_adds_and_removes() {
        let old = map(&[("A:L:100", wire("A", 200_000.0, 30, false, 0.0))]);
        let new = map(&[("B:L:100", wire("B", 300_000.0, 5, false, 0.0))]);

        let delta = DensityFeed::calculate_delta(&old, &new);
        assert_eq!(delta.add.len(), 1);
        assert_eq!(delta.add[0].s, "B");
        assert_eq!(delta.remove, vec!["A:L:100".to_string()]);
        assert!(delta.update.is_empty());
    }

    #[test]
    fn delta_suppresses_sub_threshold_noise() {
        let old = map(&[("A:L:100", wire("A", 200_000.0, 30, false, 0.0))]);
        // $500 and 2 s of drift: below every threshold.
        let new = map(&[("A:L:100", wire("A", 200_500.0, 32, false, 0.0))]);
        assert!(DensityFeed::calculate_delta(&old, &new).is_empty());
    }

    #[test]
    fn delta_reports_significant_changes() {
        let old = map(&[("A:L:100", wire("A", 200_000.0, 30, false, 0.0))]);

        // Size moved by more than $1000.
        let new = map(&[("A:L:100", wire("A", 150_000.0, 30, false, 0.0))]);
        assert_eq!(DensityFeed::calculate_delta(&old, &new).update.len(), 1);

        // `touched` flipped.
        let new = map(&[("A:L:100", wire("A", 200_000.0, 30, true, 500.0))]);
        assert_eq!(DensityFeed::calculate_delta(&old, &new).update.len(), 1);

        // Age moved by more than 10 s.
        let new = map(&[("A:L:100", wire("A", 200_000.0, 45, false, 0.0))]);
        assert_eq!(DensityFeed::calculate_delta(&old, &new).update.len(), 1);
    }

    #[test]
    fn applying_delta_reconstructs_new_state_modulo_thresholds() {
        // Invariant: delta(S0, S1) applied to S0 equals S1 restricted to
        // entries whose change crossed a threshold.
        let s0 = map(&[
            ("A:L:100", wire("A", 200_000.0, 30, false, 0.0)),
            ("B:L:100", wire("B", 500_000.0, 60, false, 0.0)),
            ("C:L:100", wire("C", 300_000.0, 10, false, 0.0)),
        ]);
        let s1 = map(&[
            // A changed significantly, B drifted sub-threshold, C is gone,
            // D is new.
            ("A:L:100", wire("A", 150_000.0, 32, true, 50_000.0)),
            ("B:L:100", wire("B", 500_200.0, 62, false, 0.0)),
            ("D:L:100", wire("D", 400_000.0, 2, false, 0.0)),
        ]);

        let delta = DensityFeed::calculate_delta(&s0, &s1);
        let mut applied = s0.clone();
        for key in &delta.remove {
            applied.remove(key);
        }
        for wire in delta.add.iter().chain(delta.update.iter()) {
            applied.insert(format!("{}:{}:{}", wire.s, wire.t, wire.p), wire.clone());
        }

        // Every key of S1 is present, and threshold-crossing entries carry
        // exactly the S1 values.
        assert_eq!(
            applied.keys().collect::<std::collections::HashSet<_>>(),
            s1.keys().collect::<std::collections::HashSet<_>>()
        );
        assert_eq!(applied["A:L:100"], s1["A:L:100"]);
        assert_eq!(applied["D:L:100"], s1["D:L:100"]);
        // B stayed at its S0 value (drift was suppressed).
        assert_eq!(applied["B:L:100"], s0["B:L:100"]);
    }

    #[test]
    fn snapshot_reflects_book_contents() {
        let book = Arc::new(DensityBook::new());
        book.apply_level("BTCUSDT", Side::Long, 100_000.0, 2.0, 100_000.0, 1_000);
        let feed = DensityFeed::new(book);

        let snapshot = feed.prepare_snapshot(11_000);
        assert_eq!(snapshot.len(), 1);
        let wire = snapshot.values().next().unwrap();
        assert_eq!(wire.s, "BTCUSDT");
        assert_eq!(wire.t, "L");
        assert_eq!(wire.u, 200_000.0);
        assert_eq!(wire.d, 10);
    }

    #[test]
    fn msgpack_and_json_both_encode() {
        let msg = FeedMessage {
            kind: "delta",
            ts: 0,
            data: DensityDelta::default(),
        };
        assert!(matches!(
            encode(&msg, WireFormat::Json),
            Some(Message::Text(_))
        ));
        assert!(matches!(
            encode(&msg, WireFormat::Msgpack),
            Some(Message::Binary(_))
        ));
    }
}
