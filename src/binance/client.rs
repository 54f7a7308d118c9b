// =============================================================================
// Binance USDT-M Futures REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and the exchange.
//
// Retry policy:
//   - Read-only calls retry transport failures and 5xx responses up to three
//     attempts with exponential backoff. The signed query (timestamp) is
//     rebuilt on each attempt.
//   - Order-mutating calls retry ONLY when the previous attempt failed during
//     connection setup (the request never reached the exchange). After an
//     ambiguous send the caller must consult open orders / positions instead
//     of resubmitting blindly.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::filters::{round_to_step, round_to_tick, FilterCache, SymbolFilters};
use super::rate_limit::RateLimitTracker;
use crate::types::OrderSide;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Maximum attempts for retryable calls.
const MAX_ATTEMPTS: u32 = 3;
/// Base backoff between attempts.
const BACKOFF_BASE_MS: u64 = 250;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Failure modes of the exchange gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connection, DNS, or timeout failure. The request may or may not have
    /// reached the exchange.
    #[error("transport error: {0}")]
    Transport(String),

    /// The exchange (or our own pre-flight tracker) indicated throttling.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The exchange answered with a non-2xx status carrying a provider code,
    /// or a 2xx body that could not be interpreted (code -1).
    #[error("protocol error (status {status}, code {code}): {message}")]
    Protocol {
        status: u16,
        code: i64,
        message: String,
    },
}

pub type GatewayResult<T> = Result<T, GatewayError>;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// 24h rolling-window statistics for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker24h {
    pub symbol: String,
    pub last_price: Decimal,
    pub price_change_pct: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub quote_volume: Decimal,
}

/// One kline. Statistical fields stay floating point; indicators consume
/// these directly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// Futures account totals (USDT-margined).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub total_wallet_balance: Decimal,
    pub available_balance: Decimal,
    pub total_unrealized_pnl: Decimal,
}

/// An order as reported by the exchange (open order, order query, or the
/// acknowledgement of a freshly placed order).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub symbol: String,
    pub order_id: u64,
    pub client_order_id: String,
    pub side: Option<OrderSide>,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    pub avg_price: Decimal,
    pub status: String,
    pub reduce_only: bool,
}

impl ExchangeOrder {
    /// Parse one order object from the exchange. Numeric fields arrive as
    /// strings; tolerate both forms.
    pub fn from_value(v: &serde_json::Value) -> GatewayResult<Self> {
        Ok(Self {
            symbol: str_field(v, "symbol")?.to_string(),
            order_id: v
                .get("orderId")
                .and_then(|x| x.as_u64())
                .ok_or_else(|| malformed("order missing orderId"))?,
            client_order_id: v
                .get("clientOrderId")
                .and_then(|x| x.as_str())
                .unwrap_or("")
                .to_string(),
            side: v
                .get("side")
                .and_then(|x| x.as_str())
                .and_then(OrderSide::parse),
            price: dec_field(v, "price").unwrap_or(Decimal::ZERO),
            orig_qty: dec_field(v, "origQty").unwrap_or(Decimal::ZERO),
            executed_qty: dec_field(v, "executedQty").unwrap_or(Decimal::ZERO),
            avg_price: dec_field(v, "avgPrice").unwrap_or(Decimal::ZERO),
            status: v
                .get("status")
                .and_then(|x| x.as_str())
                .unwrap_or("NEW")
                .to_string(),
            reduce_only: v
                .get("reduceOnly")
                .and_then(|x| x.as_bool())
                .unwrap_or(false),
        })
    }

    pub fn is_filled(&self) -> bool {
        self.status == "FILLED"
    }
}

/// One row of the positionRisk response. `position_amt` is signed: positive
/// for long exposure, negative for short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
    pub liquidation_price: Decimal,
    pub mark_price: Decimal,
}

impl ExchangePosition {
    pub fn from_value(v: &serde_json::Value) -> GatewayResult<Self> {
        Ok(Self {
            symbol: str_field(v, "symbol")?.to_string(),
            position_amt: dec_field(v, "positionAmt").unwrap_or(Decimal::ZERO),
            entry_price: dec_field(v, "entryPrice").unwrap_or(Decimal::ZERO),
            unrealized_pnl: dec_field(v, "unRealizedProfit").unwrap_or(Decimal::ZERO),
            leverage: dec_field(v, "leverage").and_then(|d| d.to_u32()).unwrap_or(1),
            liquidation_price: dec_field(v, "liquidationPrice").unwrap_or(Decimal::ZERO),
            mark_price: dec_field(v, "markPrice").unwrap_or(Decimal::ZERO),
        })
    }

    pub fn is_open(&self) -> bool {
        !self.position_amt.is_zero()
    }
}

// ---------------------------------------------------------------------------
// Order request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopMarket,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::Stop => "STOP",
            Self::StopMarket => "STOP_MARKET",
        }
    }
}

/// Parameters of a new order. `client_order_id` is mandatory: every order
/// this engine emits carries an attribution tag.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: Option<String>,
    pub reduce_only: bool,
    pub close_position: bool,
    pub stop_price: Option<Decimal>,
    pub client_order_id: String,
}

impl OrderRequest {
    /// A market order.
    pub fn market(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        client_order_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            time_in_force: None,
            reduce_only: false,
            close_position: false,
            stop_price: None,
            client_order_id: client_order_id.into(),
        }
    }

    /// A GTC limit order.
    pub fn limit(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        client_order_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            time_in_force: Some("GTC".to_string()),
            reduce_only: false,
            close_position: false,
            stop_price: None,
            client_order_id: client_order_id.into(),
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    /// Serialise to the exchange query-string form. Parameter order is fixed;
    /// the signature is computed over exactly this string (plus timestamp and
    /// recvWindow appended by the signer).
    fn to_query(&self) -> String {
        let mut q = format!(
            "symbol={}&side={}&type={}&quantity={}",
            self.symbol,
            self.side,
            self.order_type.as_str(),
            self.quantity.normalize(),
        );
        if let Some(p) = self.price {
            q.push_str(&format!("&price={}", p.normalize()));
        }
        if let Some(tif) = &self.time_in_force {
            q.push_str(&format!("&timeInForce={tif}"));
        }
        if self.reduce_only {
            q.push_str("&reduceOnly=true");
        }
        if self.close_position {
            q.push_str("&closePosition=true");
        }
        if let Some(sp) = self.stop_price {
            q.push_str(&format!("&stopPrice={}", sp.normalize()));
        }
        q.push_str(&format!("&newClientOrderId={}", self.client_order_id));
        q
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Signed futures REST client. Cheap to clone; share via `Arc`.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    api_key: String,
    secret: String,
    base_url: String,
    http: reqwest::Client,
    limits: Arc<RateLimitTracker>,
    filters: Arc<FilterCache>,
}

impl BinanceFuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client against `base_url` (live or testnet).
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();
        let base_url = base_url.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "BinanceFuturesClient initialised");

        Self {
            api_key,
            secret,
            base_url,
            http,
            limits: Arc::new(RateLimitTracker::new()),
            filters: Arc::new(FilterCache::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build the full query string for a signed request: appends timestamp
    /// and recvWindow, with the signature as the final parameter.
    fn signed_query(&self, params: &str) -> String {
        let ts = crate::types::now_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport core
    // -------------------------------------------------------------------------

    /// Perform one HTTP exchange and classify the outcome.
    async fn send_once(
        &self,
        method: Method,
        path: &str,
        query: &str,
    ) -> Result<GatewayResult<serde_json::Value>, reqwest::Error> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self.http.request(method, &url).send().await?;
        self.limits.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                return Ok(Err(GatewayError::Protocol {
                    status: status.as_u16(),
                    code: -1,
                    message: format!("unparseable response body: {e}"),
                }))
            }
        };

        if status.is_success() {
            return Ok(Ok(body));
        }

        let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(-1);
        let message = body
            .get("msg")
            .and_then(|v| v.as_str())
            .unwrap_or("no message")
            .to_string();

        if status.as_u16() == 429 || status.as_u16() == 418 {
            Ok(Err(GatewayError::RateLimited(format!(
                "status {status}: {message}"
            ))))
        } else {
            Ok(Err(GatewayError::Protocol {
                status: status.as_u16(),
                code,
                message,
            }))
        }
    }

    /// Read-only request with bounded retry. `params` excludes the signature;
    /// signed queries are rebuilt per attempt so the timestamp stays fresh.
    async fn get_with_retry(
        &self,
        path: &str,
        params: &str,
        signed: bool,
        weight: u32,
    ) -> GatewayResult<serde_json::Value> {
        let mut last_err = GatewayError::Transport("no attempt made".to_string());

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = BACKOFF_BASE_MS * (1 << attempt);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            if !self.limits.can_send_request(weight) {
                return Err(GatewayError::RateLimited(
                    "local weight budget exhausted".to_string(),
                ));
            }

            let query = if signed {
                self.signed_query(params)
            } else {
                params.to_string()
            };

            match self.send_once(Method::GET, path, &query).await {
                Ok(Ok(body)) => return Ok(body),
                Ok(Err(e)) => {
                    // 5xx is retryable; 4xx and rate limits are not.
                    let retryable =
                        matches!(&e, GatewayError::Protocol { status, .. } if *status >= 500);
                    last_err = e;
                    if !retryable {
                        return Err(last_err);
                    }
                    warn!(path, attempt, error = %last_err, "retryable gateway error");
                }
                Err(e) => {
                    last_err = GatewayError::Transport(e.to_string());
                    warn!(path, attempt, error = %last_err, "transport error — retrying");
                }
            }
        }

        Err(last_err)
    }

    /// Order-mutating request. Retries only connect-phase failures; any
    /// error after the request may have been sent is surfaced unchanged so
    /// the caller can reconcile against exchange truth.
    async fn mutate(
        &self,
        method: Method,
        path: &str,
        params: &str,
    ) -> GatewayResult<serde_json::Value> {
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = BACKOFF_BASE_MS * (1 << attempt);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            let query = self.signed_query(params);
            match self.send_once(method.clone(), path, &query).await {
                Ok(result) => return result,
                Err(e) if e.is_connect() => {
                    // The connection was never established; the exchange did
                    // not see this request, so a retry cannot double-execute.
                    warn!(path, attempt, error = %e, "connect failure — safe to retry");
                }
                Err(e) => return Err(GatewayError::Transport(e.to_string())),
            }
        }

        Err(GatewayError::Transport(format!(
            "{path}: connect failed after {MAX_ATTEMPTS} attempts"
        )))
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/ticker/price — last traded price for `symbol`.
    #[instrument(skip(self), name = "binance::ticker_price")]
    pub async fn get_ticker_price(&self, symbol: &str) -> GatewayResult<Decimal> {
        let body = self
            .get_with_retry("/fapi/v1/ticker/price", &format!("symbol={symbol}"), false, 1)
            .await?;
        dec_field(&body, "price").ok_or_else(|| malformed("ticker response missing price"))
    }

    /// GET /fapi/v1/ticker/24hr — rolling 24h statistics for `symbol`.
    #[instrument(skip(self), name = "binance::ticker_24h")]
    pub async fn get_ticker_24h(&self, symbol: &str) -> GatewayResult<Ticker24h> {
        let body = self
            .get_with_retry("/fapi/v1/ticker/24hr", &format!("symbol={symbol}"), false, 1)
            .await?;

        Ok(Ticker24h {
            symbol: str_field(&body, "symbol")?.to_string(),
            last_price: dec_field(&body, "lastPrice")
                .ok_or_else(|| malformed("24h ticker missing lastPrice"))?,
            price_change_pct: dec_field(&body, "priceChangePercent").unwrap_or(Decimal::ZERO),
            high_24h: dec_field(&body, "highPrice").unwrap_or(Decimal::ZERO),
            low_24h: dec_field(&body, "lowPrice").unwrap_or(Decimal::ZERO),
            quote_volume: dec_field(&body, "quoteVolume").unwrap_or(Decimal::ZERO),
        })
    }

    /// GET /fapi/v1/klines (public — no signature required).
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime
    #[instrument(skip(self), name = "binance::klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> GatewayResult<Vec<Kline>> {
        let body = self
            .get_with_retry(
                "/fapi/v1/klines",
                &format!("symbol={symbol}&interval={interval}&limit={limit}"),
                false,
                5,
            )
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| malformed("klines response is not an array"))?;

        let mut klines = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 7 => a,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };
            klines.push(Kline {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: f64_elem(&arr[1]),
                high: f64_elem(&arr[2]),
                low: f64_elem(&arr[3]),
                close: f64_elem(&arr[4]),
                volume: f64_elem(&arr[5]),
                close_time: arr[6].as_i64().unwrap_or(0),
            });
        }

        debug!(symbol, interval, count = klines.len(), "klines fetched");
        Ok(klines)
    }

    // -------------------------------------------------------------------------
    // Account / positions (signed)
    // -------------------------------------------------------------------------

    /// GET /fapi/v2/account — futures account totals.
    #[instrument(skip(self), name = "binance::account")]
    pub async fn get_account(&self) -> GatewayResult<AccountInfo> {
        let body = self.get_with_retry("/fapi/v2/account", "", true, 5).await?;
        Ok(AccountInfo {
            total_wallet_balance: dec_field(&body, "totalWalletBalance").unwrap_or(Decimal::ZERO),
            available_balance: dec_field(&body, "availableBalance").unwrap_or(Decimal::ZERO),
            total_unrealized_pnl: dec_field(&body, "totalUnrealizedProfit")
                .unwrap_or(Decimal::ZERO),
        })
    }

    /// GET /fapi/v2/positionRisk — all position rows (flat rows included).
    #[instrument(skip(self), name = "binance::position_risk")]
    pub async fn get_positions(&self) -> GatewayResult<Vec<ExchangePosition>> {
        let body = self
            .get_with_retry("/fapi/v2/positionRisk", "", true, 5)
            .await?;
        let raw = body
            .as_array()
            .ok_or_else(|| malformed("positionRisk response is not an array"))?;
        raw.iter().map(ExchangePosition::from_value).collect()
    }

    /// GET /fapi/v1/openOrders — open orders, optionally for one symbol.
    #[instrument(skip(self), name = "binance::open_orders")]
    pub async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> GatewayResult<Vec<ExchangeOrder>> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let weight = if symbol.is_some() { 1 } else { 40 };
        let body = self
            .get_with_retry("/fapi/v1/openOrders", &params, true, weight)
            .await?;
        let raw = body
            .as_array()
            .ok_or_else(|| malformed("openOrders response is not an array"))?;

        let orders: GatewayResult<Vec<_>> = raw.iter().map(ExchangeOrder::from_value).collect();
        let orders = orders?;
        debug!(count = orders.len(), "open orders retrieved");
        Ok(orders)
    }

    /// GET /fapi/v1/order — query one order by exchange id.
    #[instrument(skip(self), name = "binance::get_order")]
    pub async fn get_order(&self, symbol: &str, order_id: u64) -> GatewayResult<ExchangeOrder> {
        let body = self
            .get_with_retry(
                "/fapi/v1/order",
                &format!("symbol={symbol}&orderId={order_id}"),
                true,
                1,
            )
            .await?;
        ExchangeOrder::from_value(&body)
    }

    // -------------------------------------------------------------------------
    // Order mutation (signed)
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order — submit a new order.
    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = %req.side, client_order_id = %req.client_order_id), name = "binance::create_order")]
    pub async fn create_order(&self, req: &OrderRequest) -> GatewayResult<ExchangeOrder> {
        if !self.limits.can_place_order() {
            return Err(GatewayError::RateLimited(
                "local order budget exhausted".to_string(),
            ));
        }

        let body = self
            .mutate(Method::POST, "/fapi/v1/order", &req.to_query())
            .await?;
        self.limits.record_order_sent();

        let ack = ExchangeOrder::from_value(&body)?;
        debug!(order_id = ack.order_id, status = %ack.status, "order placed");
        Ok(ack)
    }

    /// DELETE /fapi/v1/order — cancel an order by exchange id.
    #[instrument(skip(self), name = "binance::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> GatewayResult<()> {
        self.mutate(
            Method::DELETE,
            "/fapi/v1/order",
            &format!("symbol={symbol}&orderId={order_id}"),
        )
        .await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(())
    }

    /// DELETE /fapi/v1/allOpenOrders — cancel every open order on `symbol`.
    #[instrument(skip(self), name = "binance::cancel_all")]
    pub async fn cancel_all(&self, symbol: &str) -> GatewayResult<()> {
        self.mutate(
            Method::DELETE,
            "/fapi/v1/allOpenOrders",
            &format!("symbol={symbol}"),
        )
        .await?;
        debug!(symbol, "all open orders cancelled");
        Ok(())
    }

    /// POST /fapi/v1/leverage — set leverage for `symbol`.
    #[instrument(skip(self), name = "binance::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()> {
        self.mutate(
            Method::POST,
            "/fapi/v1/leverage",
            &format!("symbol={symbol}&leverage={leverage}"),
        )
        .await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Symbol filters
    // -------------------------------------------------------------------------

    /// Fetch (and cache) the trading filters for `symbol`.
    pub async fn symbol_filters(&self, symbol: &str) -> GatewayResult<SymbolFilters> {
        if let Some(f) = self.filters.get(symbol) {
            return Ok(f);
        }

        let body = self
            .get_with_retry("/fapi/v1/exchangeInfo", &format!("symbol={symbol}"), false, 1)
            .await?;

        let entry = body
            .get("symbols")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .ok_or_else(|| malformed("symbol not found in exchangeInfo response"))?;

        let filters = SymbolFilters::from_exchange_info(entry)
            .ok_or_else(|| malformed("exchangeInfo entry missing LOT_SIZE/PRICE_FILTER"))?;

        self.filters.insert(symbol, filters);
        Ok(filters)
    }

    /// Floor `qty` to the symbol's quantity step.
    pub async fn round_step(&self, symbol: &str, qty: Decimal) -> GatewayResult<Decimal> {
        let f = self.symbol_filters(symbol).await?;
        Ok(round_to_step(qty, f.step_size))
    }

    /// Floor `price` to the symbol's price tick.
    pub async fn round_tick(&self, symbol: &str, price: Decimal) -> GatewayResult<Decimal> {
        let f = self.symbol_filters(symbol).await?;
        Ok(round_to_tick(price, f.tick_size))
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn malformed(msg: &str) -> GatewayError {
    GatewayError::Protocol {
        status: 200,
        code: -1,
        message: msg.to_string(),
    }
}

/// Extract a Decimal from a field that may be a JSON string or number.
fn dec_field(v: &serde_json::Value, key: &str) -> Option<Decimal> {
    match v.get(key)? {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

fn str_field<'a>(v: &'a serde_json::Value, key: &str) -> GatewayResult<&'a str> {
    v.get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| malformed(&format!("missing string field '{key}'")))
}

/// Kline array elements are strings for prices/volumes.
fn f64_elem(v: &serde_json::Value) -> f64 {
    match v {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_client() -> BinanceFuturesClient {
        BinanceFuturesClient::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
            "https://testnet.binancefuture.com",
        )
    }

    #[test]
    fn hmac_signature_matches_reference_vector() {
        // Reference vector from the exchange API documentation.
        let client = test_client();
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            client.sign(query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn signed_query_puts_signature_last() {
        let client = test_client();
        let q = client.signed_query("symbol=ETHUSDT");
        assert!(q.starts_with("symbol=ETHUSDT&timestamp="));
        assert!(q.contains("&recvWindow=5000&signature="));
        // Signature must be the final parameter.
        let sig_pos = q.find("signature=").unwrap();
        assert!(!q[sig_pos..].contains('&'));
    }

    #[test]
    fn order_request_query_market() {
        let req = OrderRequest::market("ETHUSDT", OrderSide::Buy, dec!(0.50), "LLM-A_ETHUSDT_1");
        assert_eq!(
            req.to_query(),
            "symbol=ETHUSDT&side=BUY&type=MARKET&quantity=0.5&newClientOrderId=LLM-A_ETHUSDT_1"
        );
    }

    #[test]
    fn order_request_query_limit_with_flags() {
        let req = OrderRequest::limit(
            "BNBUSDT",
            OrderSide::Sell,
            dec!(1.25),
            dec!(612.40),
            "GRID_LLM-B_BNBUSDT_a1b2c3d4_SELL_4",
        )
        .reduce_only();
        assert_eq!(
            req.to_query(),
            "symbol=BNBUSDT&side=SELL&type=LIMIT&quantity=1.25&price=612.4&timeInForce=GTC\
             &reduceOnly=true&newClientOrderId=GRID_LLM-B_BNBUSDT_a1b2c3d4_SELL_4"
        );
    }

    #[test]
    fn exchange_order_parses_string_numbers() {
        let v = serde_json::json!({
            "symbol": "ETHUSDT",
            "orderId": 283194212u64,
            "clientOrderId": "LLM-A_ETHUSDT_1728394875123",
            "side": "BUY",
            "price": "2500.10",
            "origQty": "0.500",
            "executedQty": "0.500",
            "avgPrice": "2500.05",
            "status": "FILLED",
            "reduceOnly": false
        });
        let o = ExchangeOrder::from_value(&v).unwrap();
        assert_eq!(o.order_id, 283194212);
        assert_eq!(o.price, dec!(2500.10));
        assert_eq!(o.avg_price, dec!(2500.05));
        assert_eq!(o.side, Some(OrderSide::Buy));
        assert!(o.is_filled());
    }

    #[test]
    fn exchange_order_missing_order_id_is_error() {
        let v = serde_json::json!({ "symbol": "ETHUSDT" });
        assert!(ExchangeOrder::from_value(&v).is_err());
    }

    #[test]
    fn exchange_position_parses_signed_amount() {
        let v = serde_json::json!({
            "symbol": "BNBUSDT",
            "positionAmt": "-2.400",
            "entryPrice": "610.0",
            "unRealizedProfit": "-1.25",
            "leverage": "5",
            "liquidationPrice": "735.10",
            "markPrice": "612.00"
        });
        let p = ExchangePosition::from_value(&v).unwrap();
        assert!(p.is_open());
        assert_eq!(p.position_amt, dec!(-2.400));
        assert_eq!(p.leverage, 5);
    }

    #[test]
    fn flat_position_row_is_not_open() {
        let v = serde_json::json!({
            "symbol": "XRPUSDT",
            "positionAmt": "0",
            "entryPrice": "0.0",
            "leverage": "20"
        });
        let p = ExchangePosition::from_value(&v).unwrap();
        assert!(!p.is_open());
    }

    #[test]
    fn dec_field_accepts_string_and_number() {
        let v = serde_json::json!({ "a": "1.5", "b": 2.5, "c": true });
        assert_eq!(dec_field(&v, "a"), Some(dec!(1.5)));
        assert_eq!(dec_field(&v, "b"), Some(dec!(2.5)));
        assert_eq!(dec_field(&v, "c"), None);
        assert_eq!(dec_field(&v, "missing"), None);
    }
}
