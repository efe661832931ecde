//! HTTP venue client.
//!
//! Both venues sit behind the same REST shape:
//!   GET  {base}/markets
//!   GET  {base}/markets/{id}
//!   GET  {base}/markets/{id}/price
//!   POST {base}/quote
//! Every call is bounded by a timeout and retried a few times with
//! exponential backoff; exhausting the attempts surfaces as
//! `AdapterUnavailable`, never as a default value.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::decimal::{complement, value_to_micros};
use super::{validate_market_id, Market, MarketAdapter, Quote, QuoteRequest, Venue};
use crate::fund::error::{FundError, FundResult};

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_attempts: 3,
        }
    }
}

pub struct HttpMarketAdapter {
    venue: Venue,
    base_url: String,
    client: Client,
    settings: AdapterSettings,
}

impl HttpMarketAdapter {
    pub fn new(venue: Venue, base_url: &str, settings: AdapterSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("predfund/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            venue,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            settings,
        })
    }

    async fn get_json(&self, path: &str, what: &str) -> FundResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        self.execute_with_retry(what, || self.client.get(&url)).await
    }

    async fn execute_with_retry<F>(&self, what: &str, build: F) -> FundResult<Value>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let attempts = self.settings.max_attempts.max(1);
        let mut backoff = INITIAL_BACKOFF_MS;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match timeout(self.settings.timeout, build().send()).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<Value>().await.map_err(|e| {
                            FundError::AdapterUnavailable(format!(
                                "{} returned malformed JSON: {e}",
                                self.venue
                            ))
                        });
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(FundError::not_found(what.to_string()));
                    }
                    let text = response.text().await.unwrap_or_default();
                    last_error = format!("{} API error {status}: {text}", self.venue);
                    if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                        warn!(venue = %self.venue, %status, "adapter request rejected");
                        return Err(FundError::AdapterUnavailable(last_error));
                    }
                    warn!(venue = %self.venue, %status, attempt = attempt + 1, "adapter request failed");
                }
                Ok(Err(e)) => {
                    last_error = format!("{} request failed: {e}", self.venue);
                    warn!(venue = %self.venue, attempt = attempt + 1, error = %e, "adapter request failed");
                }
                Err(_) => {
                    last_error = format!(
                        "{} request timed out after {}ms",
                        self.venue,
                        self.settings.timeout.as_millis()
                    );
                    warn!(venue = %self.venue, attempt = attempt + 1, "adapter request timeout");
                }
            }

            if attempt + 1 < attempts {
                debug!("Retrying in {}ms", backoff);
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
        }

        Err(FundError::AdapterUnavailable(last_error))
    }

    fn parse_market(&self, value: Value) -> FundResult<Market> {
        let Value::Object(obj) = value else {
            return Err(FundError::AdapterUnavailable(format!(
                "{} returned a non-object market",
                self.venue
            )));
        };
        let id = pick(&obj, &["id", "conditionId", "ticker", "slug"])
            .and_then(id_to_string)
            .ok_or_else(|| {
                FundError::AdapterUnavailable(format!("{} market without id", self.venue))
            })?;
        let text = |keys: &[&str]| pick(&obj, keys).and_then(|v| v.as_str().map(str::to_string));
        let flag = |key: &str| obj.get(key).and_then(Value::as_bool);

        let yes_price = pick(&obj, &["yes_price", "yesPrice", "yes_ask"])
            .and_then(value_to_micros)
            .or_else(|| first_outcome_price(obj.get("outcomePrices")));
        let no_price = pick(&obj, &["no_price", "noPrice", "no_ask"])
            .and_then(value_to_micros)
            .or_else(|| yes_price.and_then(complement));

        Ok(Market {
            id,
            venue: self.venue,
            title: text(&["title", "question"]).unwrap_or_default(),
            active: flag("active").unwrap_or(true) && !flag("closed").unwrap_or(false),
            yes_price,
            no_price,
            description: text(&["description"]),
            end_date: text(&["end_date", "endDate", "close_time"]),
        })
    }

    fn parse_quote(&self, value: Value) -> FundResult<Quote> {
        let Value::Object(obj) = value else {
            return Err(FundError::AdapterUnavailable(format!(
                "{} returned a non-object quote",
                self.venue
            )));
        };
        let required = |keys: &[&str]| {
            pick(&obj, keys).and_then(value_to_micros).ok_or_else(|| {
                FundError::AdapterUnavailable(format!(
                    "{} quote has no valid {}",
                    self.venue, keys[0]
                ))
            })
        };
        let optional = |keys: &[&str]| pick(&obj, keys).and_then(value_to_micros).unwrap_or(0);

        Ok(Quote {
            input_amount: required(&["input_amount", "inputAmount", "inAmount"])?,
            output_amount: required(&["output_amount", "outputAmount", "outAmount"])?,
            price: required(&["price"])?,
            fee: optional(&["fee"]),
            price_impact: optional(&["price_impact", "priceImpact", "priceImpactPct"]),
        })
    }
}

/// First non-null value among `keys`.
fn pick<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn id_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The Polygon venue encodes outcome prices as a JSON string holding an array.
fn first_outcome_price(v: Option<&Value>) -> Option<u64> {
    let arr = match v? {
        Value::Array(a) => a.clone(),
        Value::String(s) => serde_json::from_str::<Vec<Value>>(s).ok()?,
        _ => return None,
    };
    arr.first().and_then(value_to_micros)
}

fn market_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("markets").or_else(|| obj.remove("data")) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[async_trait]
impl MarketAdapter for HttpMarketAdapter {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn get_markets(&self) -> FundResult<Vec<Market>> {
        let value = self.get_json("/markets", "markets").await?;
        let markets: Vec<Market> = market_list(value)
            .into_iter()
            .filter_map(|m| self.parse_market(m).ok())
            .collect();
        debug!(venue = %self.venue, count = markets.len(), "fetched markets");
        Ok(markets)
    }

    async fn get_market(&self, market_id: &str) -> FundResult<Market> {
        let id = validate_market_id(market_id)?;
        let value = self
            .get_json(&format!("/markets/{id}"), &format!("market {id}"))
            .await?;
        self.parse_market(value)
    }

    async fn get_price(&self, market_id: &str) -> FundResult<u64> {
        let id = validate_market_id(market_id)?;
        let value = self
            .get_json(&format!("/markets/{id}/price"), &format!("market {id}"))
            .await?;
        let price = match &value {
            Value::Object(obj) => obj
                .get("price")
                .or_else(|| obj.get("yes_price"))
                .and_then(value_to_micros),
            other => value_to_micros(other),
        };
        price.ok_or_else(|| {
            FundError::AdapterUnavailable(format!("{} returned no price for {id}", self.venue))
        })
    }

    async fn get_quote(&self, request: &QuoteRequest) -> FundResult<Quote> {
        validate_market_id(&request.market_id)?;
        if request.amount == 0 {
            return Err(FundError::validation("quote amount must be greater than zero"));
        }
        let url = format!("{}/quote", self.base_url);
        let value = self
            .execute_with_retry(&format!("market {}", request.market_id), || {
                self.client.post(&url).json(request)
            })
            .await?;

        self.parse_quote(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fund::trade_ledger::{OutcomeSide, TradeDirection};
    use axum::{
        extract::Path,
        http::StatusCode as AxumStatus,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn spawn_stub(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fast_settings() -> AdapterSettings {
        AdapterSettings {
            timeout: Duration::from_millis(300),
            max_attempts: 2,
        }
    }

    #[tokio::test]
    async fn parses_markets_and_prices() {
        let router = Router::new()
            .route(
                "/markets",
                get(|| async {
                    Json(json!([
                        {"conditionId": "0xabc", "question": "Rain?", "active": true,
                         "outcomePrices": "[\"0.42\", \"0.58\"]"},
                        {"question": "no id"}
                    ]))
                }),
            )
            .route(
                "/markets/:id/price",
                get(|Path(id): Path<String>| async move {
                    if id == "0xabc" {
                        (AxumStatus::OK, Json(json!({"price": 0.42})))
                    } else {
                        (AxumStatus::NOT_FOUND, Json(json!({})))
                    }
                }),
            );
        let base = spawn_stub(router).await;
        let adapter = HttpMarketAdapter::new(Venue::Polygon, &base, fast_settings()).unwrap();

        let markets = adapter.get_markets().await.unwrap();
        assert_eq!(markets.len(), 1);
        assert_eq!(markets[0].id, "0xabc");
        assert_eq!(markets[0].yes_price, Some(420_000));
        assert_eq!(markets[0].no_price, Some(580_000));

        assert_eq!(adapter.get_price("0xabc").await.unwrap(), 420_000);
        let err = adapter.get_price("0xdef").await.unwrap_err();
        assert!(matches!(err, FundError::NotFound(_)));
    }

    #[tokio::test]
    async fn quote_is_posted_and_parsed() {
        let router = Router::new().route(
            "/quote",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["side"], "YES");
                assert_eq!(body["direction"], "BUY");
                Json(json!({
                    "inAmount": "100",
                    "outAmount": "200",
                    "price": "0.5",
                    "fee": 0.2,
                    "priceImpactPct": "0.001"
                }))
            }),
        );
        let base = spawn_stub(router).await;
        let adapter = HttpMarketAdapter::new(Venue::Solana, &base, fast_settings()).unwrap();

        let quote = adapter
            .get_quote(&QuoteRequest {
                market_id: "KXRAIN".to_string(),
                side: OutcomeSide::Yes,
                direction: TradeDirection::Buy,
                amount: 100_000_000,
                user_public_key: None,
            })
            .await
            .unwrap();
        assert_eq!(quote.input_amount, 100_000_000);
        assert_eq!(quote.output_amount, 200_000_000);
        assert_eq!(quote.price, 500_000);
        assert_eq!(quote.fee, 200_000);
        assert_eq!(quote.price_impact, 1_000);
    }

    #[tokio::test]
    async fn timeouts_surface_as_unavailable() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/markets",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Json(json!([]))
                }
            }),
        );
        let base = spawn_stub(router).await;
        let adapter = HttpMarketAdapter::new(Venue::Polygon, &base, fast_settings()).unwrap();

        let err = adapter.get_markets().await.unwrap_err();
        assert!(matches!(err, FundError::AdapterUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/markets",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::BAD_REQUEST
                }
            }),
        );
        let base = spawn_stub(router).await;
        let adapter = HttpMarketAdapter::new(Venue::Polygon, &base, fast_settings()).unwrap();

        assert!(adapter.get_markets().await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
