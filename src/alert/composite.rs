// =============================================================================
// Composite Alert — a Boolean combination of leaves with per-ticker cooldown
// =============================================================================
//
// Owns its subscriber set and cooldown map exclusively; leaves are shared and
// only read. Ticks are serialized by an internal async mutex, so two
// overlapping scheduler passes can never interleave one composite's state.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::alert::leaf::{Leaf, LeafSpec, ResolveError};
use crate::alert::leaf_manager::LeafManager;
use crate::alert::parser::{collect_conditions, expr_fingerprint, render, Expr};
use crate::alert::plan::{compile_plan, Context, PlanFn};
use crate::broadcast::UserHub;

struct TickState {
    last_fired: HashMap<String, Instant>,
    next_deadline: Instant,
}

/// One registered composite expression and everything needed to tick it.
pub struct CompositeAlert {
    /// Deterministic id: fingerprint of the canonical expression text
    /// (cooldown suffix included).
    pub id: String,
    /// Canonical expression text, shown in notifications and listings.
    pub expression: String,
    cooldown: Option<Duration>,
    plan: PlanFn,
    leaves: Vec<(String, Arc<dyn Leaf>)>,
    period: Duration,
    subscribers: RwLock<HashSet<i64>>,
    tick_state: Mutex<TickState>,
}

impl CompositeAlert {
    /// Build a composite from a parsed expression, resolving every leaf
    /// condition through the manager (leaves are created lazily and shared).
    pub fn build(expr: Expr, leaf_manager: &LeafManager) -> Result<Self, ResolveError> {
        let id = expr_fingerprint(&expr);
        let expression = render(&expr);

        let (root, cooldown) = match expr {
            Expr::Cooldown(inner, seconds) => (*inner, Some(Duration::from_secs(seconds))),
            other => (other, None),
        };

        let plan = compile_plan(&root)?;

        let mut leaves: Vec<(String, Arc<dyn Leaf>)> = Vec::new();
        for cond in collect_conditions(&root) {
            let spec = LeafSpec::from_condition(cond)?;
            let fingerprint = spec.fingerprint();
            // The same leaf may back two conditions of one expression; it
            // still gets one entry (and one reference) per condition so the
            // release path stays symmetric.
            let leaf = leaf_manager.acquire(spec);
            leaves.push((fingerprint, leaf));
        }

        let period = leaves
            .iter()
            .map(|(_, leaf)| leaf.poll_interval())
            .min()
            .unwrap_or(Duration::from_secs(60));

        Ok(Self {
            id,
            expression,
            cooldown,
            plan,
            leaves,
            period,
            subscribers: RwLock::new(HashSet::new()),
            tick_state: Mutex::new(TickState {
                last_fired: HashMap::new(),
                next_deadline: Instant::now(),
            }),
        })
    }

    // -------------------------------------------------------------------------
    // Subscribers
    // -------------------------------------------------------------------------

    /// Add a subscriber; `false` when already subscribed.
    pub fn add_subscriber(&self, user_id: i64) -> bool {
        self.subscribers.write().insert(user_id)
    }

    /// Remove a subscriber; `false` when not subscribed.
    pub fn remove_subscriber(&self, user_id: i64) -> bool {
        self.subscribers.write().remove(&user_id)
    }

    pub fn has_subscriber(&self, user_id: i64) -> bool {
        self.subscribers.read().contains(&user_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn subscribers(&self) -> Vec<i64> {
        self.subscribers.read().iter().copied().collect()
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Fingerprints of the referenced leaves, one per condition.
    pub fn leaf_fingerprints(&self) -> Vec<String> {
        self.leaves.iter().map(|(fp, _)| fp.clone()).collect()
    }

    /// Tick period: the minimum of the leaves' poll intervals.
    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn cooldown_secs(&self) -> u64 {
        self.cooldown.map(|d| d.as_secs()).unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------------

    /// Evaluate once if the deadline passed, notifying subscribers of any
    /// survivors. `now` is injected so cooldown behavior is testable.
    pub async fn tick_at(&self, now: Instant, hub: &UserHub) {
        let mut state = self.tick_state.lock().await;
        if now < state.next_deadline {
            return;
        }

        // Each leaf snapshot is immutable; the context is consistent even
        // while leaves keep updating concurrently.
        let mut ctx = Context::new();
        for (fingerprint, leaf) in &self.leaves {
            ctx.insert(fingerprint.clone(), leaf.matched_symbols());
        }

        let mut triggered = (self.plan)(&ctx);
        debug!(alert = %self.id, raw = triggered.len(), "plan evaluated");

        if let Some(cooldown) = self.cooldown {
            triggered.retain(|symbol| {
                state
                    .last_fired
                    .get(symbol)
                    .map_or(true, |fired| now.duration_since(*fired) >= cooldown)
            });
            for symbol in &triggered {
                state.last_fired.insert(symbol.clone(), now);
            }
        }

        if !triggered.is_empty() {
            let mut symbols: Vec<String> = triggered.into_iter().collect();
            symbols.sort();
            info!(alert = %self.id, tickers = ?symbols, "composite alert fired");

            let message = format!(
                "⚡ Composite alert\nTickers: {}\nCondition: {}",
                symbols.join(", "),
                self.expression
            );
            for user_id in self.subscribers() {
                hub.send_chunked(user_id, &message);
            }
        }

        state.next_deadline = now + self.period;
    }

    /// Scheduler entry point.
    pub async fn maybe_tick(&self, hub: &UserHub) {
        self.tick_at(Instant::now(), hub).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::parser::parse_expression;
    use crate::store::{MetricStore, PriceRow};

    async fn fired_symbols(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> Option<String> {
        rx.try_recv().ok()
    }

    fn seed_price_rise(store: &MetricStore) {
        store
            .upsert_prices(&[
                PriceRow {
                    ts: 0,
                    symbol: "BTCUSDT".into(),
                    price: 100.0,
                },
                PriceRow {
                    ts: 310_000,
                    symbol: "BTCUSDT".into(),
                    price: 106.0,
                },
            ])
            .unwrap();
    }

    #[tokio::test]
    async fn triggered_composite_notifies_subscribers() {
        let store = Arc::new(MetricStore::open_in_memory().unwrap());
        seed_price_rise(&store);
        let manager = LeafManager::new(store);
        let hub = UserHub::new();
        let mut rx = hub.register(7);

        let expr = parse_expression("price > 5 300").unwrap();
        let alert = CompositeAlert::build(expr, &manager).unwrap();
        alert.add_subscriber(7);

        manager.refresh_all().await;
        alert.tick_at(Instant::now(), &hub).await;

        let msg = fired_symbols(&mut rx).await.expect("notification expected");
        assert!(msg.contains("BTCUSDT"));
        assert!(msg.contains("price > 5 300"));
    }

    #[tokio::test]
    async fn cooldown_suppresses_within_window() {
        let store = Arc::new(MetricStore::open_in_memory().unwrap());
        seed_price_rise(&store);
        let manager = LeafManager::new(store);
        let hub = UserHub::new();
        let mut rx = hub.register(7);

        // 30-second poll so consecutive evaluations 30 s apart are due;
        // 60-second cooldown so the second one must be suppressed.
        let expr = parse_expression("price > 5 300 30 @60").unwrap();
        let alert = CompositeAlert::build(expr, &manager).unwrap();
        alert.add_subscriber(7);
        manager.refresh_all().await;

        let t0 = Instant::now();
        alert.tick_at(t0, &hub).await;
        assert!(fired_symbols(&mut rx).await.is_some(), "first tick fires");

        alert.tick_at(t0 + Duration::from_secs(30), &hub).await;
        assert!(
            fired_symbols(&mut rx).await.is_none(),
            "second tick suppressed by cooldown"
        );

        alert.tick_at(t0 + Duration::from_secs(90), &hub).await;
        assert!(
            fired_symbols(&mut rx).await.is_some(),
            "fires again after the cooldown elapses"
        );
    }

    #[tokio::test]
    async fn deadline_gates_evaluation() {
        let store = Arc::new(MetricStore::open_in_memory().unwrap());
        seed_price_rise(&store);
        let manager = LeafManager::new(store);
        let hub = UserHub::new();
        let mut rx = hub.register(7);

        let expr = parse_expression("price > 5 300").unwrap();
        let alert = CompositeAlert::build(expr, &manager).unwrap();
        alert.add_subscriber(7);
        assert_eq!(alert.period(), Duration::from_secs(300));
        manager.refresh_all().await;

        let t0 = Instant::now();
        alert.tick_at(t0, &hub).await;
        assert!(fired_symbols(&mut rx).await.is_some());

        // Next deadline is t0 + 300s; an earlier tick is a no-op.
        alert.tick_at(t0 + Duration::from_secs(100), &hub).await;
        assert!(fired_symbols(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn subscriber_set_is_deduplicated() {
        let store = Arc::new(MetricStore::open_in_memory().unwrap());
        let manager = LeafManager::new(store);
        let expr = parse_expression("price > 5 300").unwrap();
        let alert = CompositeAlert::build(expr, &manager).unwrap();

        assert!(alert.add_subscriber(1));
        assert!(!alert.add_subscriber(1));
        assert_eq!(alert.subscriber_count(), 1);
    }
}
