// =============================================================================
// Application State — everything the API surface reaches through one Arc
// =============================================================================
//
// Subsystems manage their own interior mutability; AppState just ties them
// together for the axum handlers and the spawning code in main.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use crate::alert::{AlertCommands, CompositeEngine, LeafManager};
use crate::api::DensityFeed;
use crate::binance::ExchangeClient;
use crate::broadcast::UserHub;
use crate::density::DensityBook;
use crate::runtime_config::RuntimeConfig;
use crate::store::MetricStore;

pub struct AppState {
    pub config: RuntimeConfig,
    pub store: Arc<MetricStore>,
    pub exchange: Arc<ExchangeClient>,
    pub density_book: Arc<DensityBook>,
    pub density_feed: Arc<DensityFeed>,
    pub user_hub: Arc<UserHub>,
    pub leaf_manager: Arc<LeafManager>,
    pub engine: Arc<CompositeEngine>,
    pub commands: AlertCommands,
    pub start_time: Instant,
}

impl AppState {
    /// Wire up every subsystem around an already-open store.
    pub fn new(config: RuntimeConfig, store: Arc<MetricStore>) -> Self {
        let exchange = Arc::new(ExchangeClient::new(config.ticker_blacklist.clone()));
        let density_book = Arc::new(DensityBook::new());
        let density_feed = Arc::new(DensityFeed::new(density_book.clone()));
        let user_hub = Arc::new(UserHub::new());
        let leaf_manager = Arc::new(LeafManager::new(store.clone()));
        let engine = Arc::new(CompositeEngine::new(leaf_manager.clone(), user_hub.clone()));
        let commands = AlertCommands::new(engine.clone());

        Self {
            config,
            store,
            exchange,
            density_book,
            density_feed,
            user_hub,
            leaf_manager,
            engine,
            commands,
            start_time: Instant::now(),
        }
    }
}
