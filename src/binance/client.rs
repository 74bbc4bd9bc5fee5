// =============================================================================
// Exchange REST Client — Binance USD-M futures public market data
// =============================================================================
//
// Every endpoint here is public (no request signing). The client caches the
// "currently trading" symbol universe with a short TTL so the pipelines do
// not hammer exchangeInfo on every cycle, and parses Binance's stringly-typed
// numeric fields into concrete row values.
// =============================================================================

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

/// TTL of the symbol-universe cache.
const UNIVERSE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Price ticks older than this are dropped at ingestion.
const MAX_TICK_AGE_MS: i64 = 30_000;

/// Error carrying the HTTP status so callers can route 429 / 400 / 404
/// through their own policy (back off, blacklist, skip).
#[derive(Debug, thiserror::Error)]
#[error("exchange returned HTTP {status}: {body}")]
pub struct ApiStatusError {
    pub status: u16,
    pub body: String,
}

/// One entry from the price snapshot endpoint.
#[derive(Debug, Clone)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
    pub ts: i64,
}

/// One closed-minute kline reduced to what the pipelines consume.
#[derive(Debug, Clone)]
pub struct KlineSummary {
    pub open_time: i64,
    pub close_time: i64,
    pub quote_volume: f64,
    pub trade_count: i64,
}

/// Raw open interest in contracts, not yet normalized to USD.
#[derive(Debug, Clone)]
pub struct OpenInterestTick {
    pub symbol: String,
    pub oi_coins: f64,
    pub ts: i64,
}

/// One entry from the premium index batch endpoint.
#[derive(Debug, Clone)]
pub struct FundingTick {
    pub symbol: String,
    pub rate: f64,
    pub next_funding_ts: i64,
    pub ts: i64,
}

struct UniverseCache {
    symbols: Vec<String>,
    fetched_at: Instant,
}

/// REST client for the futures API with a TTL-cached symbol universe.
pub struct ExchangeClient {
    http: reqwest::Client,
    base_url: String,
    ticker_blacklist: Vec<String>,
    universe: RwLock<Option<UniverseCache>>,
}

impl ExchangeClient {
    /// Build a client with the default 10-second request timeout.
    ///
    /// `ticker_blacklist` filters symbols by substring (e.g. "USDC" drops
    /// every USDC-quoted pair).
    pub fn new(ticker_blacklist: Vec<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            base_url: "https://fapi.binance.com".to_string(),
            ticker_blacklist,
            universe: RwLock::new(None),
        }
    }

    /// Override the REST base URL (tests, alternate deployments).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn is_blacklisted(&self, symbol: &str) -> bool {
        let lower = symbol.to_lowercase();
        self.ticker_blacklist
            .iter()
            .any(|b| lower.contains(&b.to_lowercase()))
    }

    /// GET a JSON body, converting non-2xx statuses into [`ApiStatusError`].
    async fn get_json(&self, path_and_query: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path_and_query} request failed"))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path_and_query} response"))?;

        if !status.is_success() {
            return Err(ApiStatusError {
                status: status.as_u16(),
                body: body.to_string(),
            }
            .into());
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Symbol universe
    // -------------------------------------------------------------------------

    /// Currently trading perpetual symbols, minus the ticker blacklist.
    /// Cached for 60 seconds.
    pub async fn trading_symbols(&self) -> Result<Vec<String>> {
        {
            let cache = self.universe.read();
            if let Some(c) = cache.as_ref() {
                if c.fetched_at.elapsed() < UNIVERSE_CACHE_TTL {
                    return Ok(c.symbols.clone());
                }
            }
        }

        let body = self.get_json("/fapi/v1/exchangeInfo").await?;
        let raw = body["symbols"]
            .as_array()
            .context("exchangeInfo response missing 'symbols' array")?;

        let mut symbols = Vec::with_capacity(raw.len());
        for entry in raw {
            let symbol = entry["symbol"].as_str().unwrap_or_default();
            if symbol.is_empty() {
                continue;
            }
            if entry["status"].as_str() != Some("TRADING") {
                continue;
            }
            // contractType is absent on some entries; only reject an explicit
            // non-perpetual value.
            if let Some(ct) = entry["contractType"].as_str() {
                if ct != "PERPETUAL" {
                    continue;
                }
            }
            if self.is_blacklisted(symbol) {
                continue;
            }
            symbols.push(symbol.to_string());
        }

        debug!(count = symbols.len(), "symbol universe refreshed");
        *self.universe.write() = Some(UniverseCache {
            symbols: symbols.clone(),
            fetched_at: Instant::now(),
        });
        Ok(symbols)
    }

    // -------------------------------------------------------------------------
    // Market data endpoints
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/ticker/price — snapshot of every symbol's last price.
    /// Stale ticks (older than 30 s) are dropped here.
    pub async fn price_snapshot(&self) -> Result<Vec<PriceTick>> {
        let body = self.get_json("/fapi/v1/ticker/price").await?;
        let raw = body
            .as_array()
            .context("ticker/price response is not an array")?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut ticks = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(symbol) = entry["symbol"].as_str() else {
                warn!("price tick missing symbol — skipping");
                continue;
            };
            if self.is_blacklisted(symbol) {
                continue;
            }
            let Some(price) = parse_str_f64(&entry["price"]) else {
                warn!(symbol, "price tick has unparseable price — skipping");
                continue;
            };
            let ts = entry["time"].as_i64().unwrap_or(now_ms);
            if now_ms - ts > MAX_TICK_AGE_MS {
                continue;
            }
            ticks.push(PriceTick {
                symbol: symbol.to_string(),
                price,
                ts,
            });
        }
        Ok(ticks)
    }

    /// GET /fapi/v1/klines — recent 1-minute klines for one symbol.
    ///
    /// Array indices: [0] openTime, [5] volume, [6] closeTime,
    /// [7] quoteAssetVolume, [8] numberOfTrades.
    pub async fn klines_1m(&self, symbol: &str, limit: u32) -> Result<Vec<KlineSummary>> {
        let body = self
            .get_json(&format!(
                "/fapi/v1/klines?symbol={symbol}&interval=1m&limit={limit}"
            ))
            .await?;
        let raw = body.as_array().context("klines response is not an array")?;

        let mut out = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(arr) = entry.as_array() else {
                warn!(symbol, "kline entry is not an array — skipping");
                continue;
            };
            if arr.len() < 9 {
                warn!(symbol, len = arr.len(), "malformed kline entry — skipping");
                continue;
            }
            let Some(quote_volume) = parse_str_f64(&arr[7]) else {
                warn!(symbol, "kline quote volume unparseable — skipping");
                continue;
            };
            out.push(KlineSummary {
                open_time: arr[0].as_i64().unwrap_or(0),
                close_time: arr[6].as_i64().unwrap_or(0),
                quote_volume,
                trade_count: arr[8].as_i64().unwrap_or(0),
            });
        }
        Ok(out)
    }

    /// GET /fapi/v1/openInterest — current OI in contracts for one symbol.
    pub async fn open_interest(&self, symbol: &str) -> Result<OpenInterestTick> {
        let body = self
            .get_json(&format!("/fapi/v1/openInterest?symbol={symbol}"))
            .await?;

        let oi_coins = parse_str_f64(&body["openInterest"])
            .with_context(|| format!("openInterest missing for {symbol}"))?;
        let ts = body["time"]
            .as_i64()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        Ok(OpenInterestTick {
            symbol: symbol.to_string(),
            oi_coins,
            ts,
        })
    }

    /// GET /fapi/v1/premiumIndex — funding rates for every symbol in one call.
    pub async fn premium_index(&self) -> Result<Vec<FundingTick>> {
        let body = self.get_json("/fapi/v1/premiumIndex").await?;
        let raw = body
            .as_array()
            .context("premiumIndex response is not an array")?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut out = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(symbol) = entry["symbol"].as_str() else {
                warn!("premium index entry missing symbol — skipping");
                continue;
            };
            if self.is_blacklisted(symbol) {
                continue;
            }
            let Some(rate) = parse_str_f64(&entry["lastFundingRate"]) else {
                // Delivery contracts report no funding rate; not an error.
                continue;
            };
            let Some(next_funding_ts) = entry["nextFundingTime"].as_i64() else {
                warn!(symbol, "premium index entry missing nextFundingTime — skipping");
                continue;
            };
            out.push(FundingTick {
                symbol: symbol.to_string(),
                rate,
                next_funding_ts,
                ts: now_ms,
            });
        }
        Ok(out)
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &Value) -> Option<f64> {
    if let Some(s) = val.as_str() {
        s.parse().ok()
    } else {
        val.as_f64()
    }
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("base_url", &self.base_url)
            .field("ticker_blacklist", &self.ticker_blacklist)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_matches_substrings_case_insensitively() {
        let client = ExchangeClient::new(vec!["USDC".into(), "BUSD".into()]);
        assert!(client.is_blacklisted("BTCUSDC"));
        assert!(client.is_blacklisted("ethbusd"));
        assert!(!client.is_blacklisted("BTCUSDT"));
    }

    #[test]
    fn parse_str_f64_accepts_both_shapes() {
        assert_eq!(parse_str_f64(&serde_json::json!("1.5")), Some(1.5));
        assert_eq!(parse_str_f64(&serde_json::json!(2.5)), Some(2.5));
        assert_eq!(parse_str_f64(&serde_json::json!("nope")), None);
        assert_eq!(parse_str_f64(&serde_json::json!(null)), None);
    }
}
