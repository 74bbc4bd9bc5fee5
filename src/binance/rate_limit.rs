// =============================================================================
// Rate Limiter & Symbol Blacklist — per-pipeline request budgeting
// =============================================================================
//
// Binance enforces 1200 weight/minute on the futures REST API; we hard-cap
// ourselves below that with a sliding-window counter. Each ingestion pipeline
// owns its own limiter and blacklist; they are never shared across pipelines.
//
// The blacklist holds symbols the exchange rejected with HTTP 400/404
// (delisted or in settlement); entries expire after a TTL so a symbol that
// resumes trading is picked up again.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Sliding-window request limiter. `acquire` suspends until a slot is free.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    times: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            times: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    /// Default limiter: 1000 requests per 60-second window.
    pub fn default_rest() -> Self {
        Self::new(1000, Duration::from_secs(60))
    }

    /// Wait until a request slot is available, then claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut times = self.times.lock();
                let now = Instant::now();
                while let Some(front) = times.front() {
                    if now.duration_since(*front) > self.window {
                        times.pop_front();
                    } else {
                        break;
                    }
                }
                if times.len() < self.max_requests {
                    times.push_back(now);
                    None
                } else {
                    // Oldest entry decides how long until a slot frees up.
                    let oldest = *times.front().expect("non-empty at capacity");
                    Some(
                        self.window.saturating_sub(now.duration_since(oldest))
                            + Duration::from_secs(1),
                    )
                }
            };

            match wait {
                None => return,
                Some(delay) => {
                    warn!(delay_secs = delay.as_secs(), "rate limit window full — waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Number of requests currently counted inside the window.
    pub fn in_flight(&self) -> usize {
        let mut times = self.times.lock();
        let now = Instant::now();
        while let Some(front) = times.front() {
            if now.duration_since(*front) > self.window {
                times.pop_front();
            } else {
                break;
            }
        }
        times.len()
    }
}

// =============================================================================
// TTL symbol blacklist
// =============================================================================

/// Symbols the exchange permanently rejects are parked here for a TTL
/// (default 1 hour) instead of being retried every cycle.
pub struct SymbolBlacklist {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl SymbolBlacklist {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Default TTL of one hour.
    pub fn default_ttl() -> Self {
        Self::new(Duration::from_secs(3600))
    }

    pub fn insert(&self, symbol: &str) {
        self.entries
            .lock()
            .insert(symbol.to_string(), Instant::now() + self.ttl);
        debug!(symbol, "symbol added to temporary blacklist");
    }

    /// Check membership, expiring stale entries as a side effect.
    pub fn contains(&self, symbol: &str) -> bool {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, expires| *expires > now);
        entries.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, expires| *expires > now);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
