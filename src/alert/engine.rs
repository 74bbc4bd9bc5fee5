// =============================================================================
// Composite Engine — registry, dedup, and the global tick scheduler
// =============================================================================
//
// One composite per canonical expression, shared by every user who registers
// it. The tick loop wakes on a fixed base step, partitions the registry into
// population-scaled batches, and bounds in-flight ticks with a semaphore
// whose capacity follows the registry size.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::alert::composite::CompositeAlert;
use crate::alert::leaf::ResolveError;
use crate::alert::leaf_manager::LeafManager;
use crate::alert::parser::{expr_fingerprint, Expr};
use crate::broadcast::UserHub;

/// Semaphore capacity bounds: clamp(composites / 40, 50, 500).
const SEMAPHORE_MIN: usize = 50;
const SEMAPHORE_MAX: usize = 500;

/// Resize only when the optimal capacity drifts >20% from the current one.
const SEMAPHORE_DRIFT: f64 = 0.2;

struct TickSemaphore {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Registry of live composites plus the scheduling machinery.
pub struct CompositeEngine {
    leaf_manager: Arc<LeafManager>,
    hub: Arc<UserHub>,
    composites: RwLock<HashMap<String, Arc<CompositeAlert>>>,
    tick_semaphore: RwLock<TickSemaphore>,
}

impl CompositeEngine {
    pub fn new(leaf_manager: Arc<LeafManager>, hub: Arc<UserHub>) -> Self {
        Self {
            leaf_manager,
            hub,
            composites: RwLock::new(HashMap::new()),
            tick_semaphore: RwLock::new(TickSemaphore {
                semaphore: Arc::new(Semaphore::new(SEMAPHORE_MIN)),
                capacity: SEMAPHORE_MIN,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Subscribe `user_id` to the composite for `expr`, creating it (and its
    /// leaves) on first reference.
    pub fn subscribe(
        &self,
        expr: Expr,
        user_id: i64,
    ) -> Result<Arc<CompositeAlert>, ResolveError> {
        let id = expr_fingerprint(&expr);

        if let Some(existing) = self.composites.read().get(&id) {
            existing.add_subscriber(user_id);
            info!(alert = %id, user_id, "subscribed to existing composite");
            return Ok(existing.clone());
        }

        // Built outside the lock: leaf resolution can spawn tasks.
        let alert = Arc::new(CompositeAlert::build(expr, &self.leaf_manager)?);
        alert.add_subscriber(user_id);

        let alert = {
            let mut composites = self.composites.write();
            match composites.get(&id) {
                // Lost the race: someone registered the same expression
                // in between. Use theirs and roll back our leaf references.
                Some(existing) => {
                    existing.add_subscriber(user_id);
                    for fp in alert.leaf_fingerprints() {
                        self.leaf_manager.release(&fp);
                    }
                    existing.clone()
                }
                None => {
                    composites.insert(id.clone(), alert.clone());
                    info!(alert = %id, user_id, expression = %alert.expression, "composite created");
                    alert
                }
            }
        };

        self.resize_semaphore_if_needed();
        Ok(alert)
    }

    /// Unsubscribe a user; destroying the composite when the last one leaves.
    /// `false` when the alert does not exist or the user was not subscribed.
    pub fn unsubscribe(&self, alert_id: &str, user_id: i64) -> bool {
        let Some(alert) = self.composites.read().get(alert_id).cloned() else {
            return false;
        };
        if !alert.remove_subscriber(user_id) {
            return false;
        }
        info!(alert = %alert_id, user_id, "unsubscribed");
        if alert.subscriber_count() == 0 {
            self.remove_composite(alert_id);
        }
        true
    }

    /// Unsubscribe a user from everything. Returns how many alerts they left.
    pub fn unsubscribe_all(&self, user_id: i64) -> usize {
        let subscribed: Vec<String> = {
            let composites = self.composites.read();
            composites
                .values()
                .filter(|a| a.has_subscriber(user_id))
                .map(|a| a.id.clone())
                .collect()
        };
        let mut removed = 0;
        for id in subscribed {
            if self.unsubscribe(&id, user_id) {
                removed += 1;
            }
        }
        removed
    }

    fn remove_composite(&self, alert_id: &str) {
        let removed = self.composites.write().remove(alert_id);
        if let Some(alert) = removed {
            for fp in alert.leaf_fingerprints() {
                self.leaf_manager.release(&fp);
            }
            info!(alert = %alert_id, "composite destroyed (no subscribers left)");
            self.resize_semaphore_if_needed();
        }
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    pub fn get(&self, alert_id: &str) -> Option<Arc<CompositeAlert>> {
        self.composites.read().get(alert_id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<CompositeAlert>> {
        self.composites.read().values().cloned().collect()
    }

    pub fn user_subscriptions(&self, user_id: i64) -> Vec<Arc<CompositeAlert>> {
        self.composites
            .read()
            .values()
            .filter(|a| a.has_subscriber(user_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.composites.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    fn resize_semaphore_if_needed(&self) {
        let population = self.len();
        let optimal = (population / 40).clamp(SEMAPHORE_MIN, SEMAPHORE_MAX);

        let mut sem = self.tick_semaphore.write();
        let drift = (optimal as f64 - sem.capacity as f64).abs();
        if drift > sem.capacity as f64 * SEMAPHORE_DRIFT {
            info!(
                from = sem.capacity,
                to = optimal,
                composites = population,
                "tick semaphore resized"
            );
            // Replaced wholesale; in-flight permits on the old semaphore
            // drain out naturally.
            sem.semaphore = Arc::new(Semaphore::new(optimal));
            sem.capacity = optimal;
        }
    }

    /// Batch size and inter-batch pause, scaled with the population.
    fn batch_plan(total: usize) -> (usize, Duration) {
        let batch_size = if total <= 1_000 {
            500
        } else if total <= 5_000 {
            1_000
        } else if total <= 15_000 {
            1_500
        } else {
            2_000
        };
        let pause = if total > 5_000 {
            Duration::from_millis(20)
        } else if total > 1_000 {
            Duration::from_millis(50)
        } else {
            Duration::from_millis(100)
        };
        (batch_size, pause)
    }

    /// One scheduler pass: every composite whose deadline passed is ticked,
    /// batched and bounded by the semaphore. Waits for all batches.
    pub async fn tick(&self) {
        let snapshot: Vec<Arc<CompositeAlert>> = self.all();
        let total = snapshot.len();
        if total == 0 {
            return;
        }

        let (batch_size, pause) = Self::batch_plan(total);
        let semaphore = self.tick_semaphore.read().semaphore.clone();
        debug!(total, batch_size, "tick pass starting");

        let batch_count = total.div_ceil(batch_size);
        for (i, batch) in snapshot.chunks(batch_size).enumerate() {
            let mut handles = Vec::with_capacity(batch.len());
            for alert in batch {
                let alert = alert.clone();
                let hub = self.hub.clone();
                let semaphore = semaphore.clone();
                handles.push(tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    alert.maybe_tick(&hub).await;
                }));
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    // A panicking tick must not take the scheduler down.
                    error!(error = %e, "composite tick task failed");
                }
            }
            if i + 1 < batch_count {
                tokio::time::sleep(pause).await;
            }
        }
    }

    /// The global tick loop: wake every `base_step`, run one pass.
    pub async fn run_tick_loop(self: Arc<Self>, base_step: Duration) {
        info!(base_step_secs = base_step.as_secs(), "composite tick loop starting");
        let mut interval = tokio::time::interval(base_step);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::parser::parse_expression;
    use crate::store::{MetricStore, PriceRow};

    fn setup() -> (Arc<MetricStore>, Arc<LeafManager>, Arc<UserHub>, CompositeEngine) {
        let store = Arc::new(MetricStore::open_in_memory().unwrap());
        let leaf_manager = Arc::new(LeafManager::new(store.clone()));
        let hub = Arc::new(UserHub::new());
        let engine = CompositeEngine::new(leaf_manager.clone(), hub.clone());
        (store, leaf_manager, hub, engine)
    }

    #[tokio::test]
    async fn identical_expressions_share_one_composite() {
        // Scenario S2: two users, one composite, one leaf per condition.
        let (_store, leaf_manager, _hub, engine) = setup();
        let expr = || parse_expression("price > 5 300 & oi < 100").unwrap();

        let a = engine.subscribe(expr(), 1).unwrap();
        let b = engine.subscribe(expr(), 2).unwrap();

        assert_eq!(engine.len(), 1);
        assert_eq!(a.id, b.id);
        assert_eq!(a.subscriber_count(), 2);
        assert_eq!(leaf_manager.len(), 2);
    }

    #[tokio::test]
    async fn last_unsubscribe_destroys_composite_and_releases_leaves() {
        // Scenario S4.
        let (_store, leaf_manager, _hub, engine) = setup();
        let expr = || parse_expression("price > 5 300 & oi < 100").unwrap();

        let alert = engine.subscribe(expr(), 1).unwrap();
        engine.subscribe(expr(), 2).unwrap();
        let id = alert.id.clone();

        assert!(engine.unsubscribe(&id, 2));
        assert_eq!(engine.len(), 1);
        assert_eq!(alert.subscriber_count(), 1);
        assert_eq!(leaf_manager.len(), 2);

        assert!(engine.unsubscribe(&id, 1));
        assert!(engine.get(&id).is_none());
        assert_eq!(leaf_manager.len(), 0);
    }

    #[tokio::test]
    async fn shared_leaves_survive_one_composites_death() {
        let (_store, leaf_manager, _hub, engine) = setup();

        let a = engine
            .subscribe(parse_expression("price > 5 300").unwrap(), 1)
            .unwrap();
        engine
            .subscribe(parse_expression("price > 5 300 & oi < 100").unwrap(), 2)
            .unwrap();
        assert_eq!(leaf_manager.len(), 2);

        // Destroying the first composite must keep the shared price leaf.
        assert!(engine.unsubscribe(&a.id, 1));
        assert_eq!(engine.len(), 1);
        assert_eq!(leaf_manager.len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_all_covers_every_subscription() {
        let (_store, _lm, _hub, engine) = setup();
        engine
            .subscribe(parse_expression("price > 5 300").unwrap(), 1)
            .unwrap();
        engine
            .subscribe(parse_expression("oi < 100").unwrap(), 1)
            .unwrap();
        engine
            .subscribe(parse_expression("oi < 100").unwrap(), 2)
            .unwrap();

        assert_eq!(engine.unsubscribe_all(1), 2);
        // User 2's subscription keeps one composite alive.
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.unsubscribe_all(1), 0);
    }

    #[tokio::test]
    async fn tick_delivers_notifications_end_to_end() {
        // Scenario S1, driven through the engine's tick pass.
        let (store, leaf_manager, hub, engine) = setup();
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

        let mut rx = hub.register(7);
        engine
            .subscribe(parse_expression("price > 5 300").unwrap(), 7)
            .unwrap();

        leaf_manager.refresh_all().await;
        engine.tick().await;

        let msg = rx.try_recv().expect("user 7 should be notified");
        assert!(msg.contains("BTCUSDT"));
        assert!(msg.contains("price > 5 300"));
    }

    #[tokio::test]
    async fn unknown_alert_or_user_unsubscribe_is_false() {
        let (_store, _lm, _hub, engine) = setup();
        assert!(!engine.unsubscribe("deadbeef", 1));

        let alert = engine
            .subscribe(parse_expression("price > 5 300").unwrap(), 1)
            .unwrap();
        assert!(!engine.unsubscribe(&alert.id, 999));
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn batch_plan_scales_with_population() {
        assert_eq!(
            CompositeEngine::batch_plan(800),
            (500, Duration::from_millis(100))
        );
        assert_eq!(
            CompositeEngine::batch_plan(4_000),
            (1_000, Duration::from_millis(50))
        );
        assert_eq!(
            CompositeEngine::batch_plan(10_000),
            (1_500, Duration::from_millis(20))
        );
        assert_eq!(
            CompositeEngine::batch_plan(20_000),
            (2_000, Duration::from_millis(20))
        );
    }
}
