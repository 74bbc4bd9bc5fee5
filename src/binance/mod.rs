pub mod client;
pub mod rate_limit;
pub mod stream;

pub use client::{ApiStatusError, ExchangeClient};
pub use rate_limit::{RateLimiter, SymbolBlacklist};
