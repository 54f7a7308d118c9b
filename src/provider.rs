// =============================================================================
// Decision providers — opaque (context) -> (structured decision) functions
// =============================================================================
//
// The core imposes no transport: a provider receives the per-trader context
// bundle and returns raw text plus whatever JSON object it could carve out of
// it, along with usage accounting. Parsing into the closed `Decision` shape
// happens downstream in `decision.rs`, so malformed output still produces an
// auditable record with the raw payload intact.
//
// `ChatCompletionsProvider` speaks the OpenAI-compatible chat wire format,
// which covers every endpoint the default roster uses.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::account::{AccountSnapshot, Position, Trade};
use crate::config::{Settings, TraderSettings};
use crate::grid::GridSummary;
use crate::market::SymbolContext;

// ---------------------------------------------------------------------------
// Context bundle
// ---------------------------------------------------------------------------

/// Everything a trader sees before deciding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    pub trader_id: String,
    pub account: AccountSnapshot,
    pub market: Vec<SymbolContext>,
    pub open_positions: Vec<Position>,
    pub grids: Vec<GridSummary>,
    pub recent_trades: Vec<Trade>,
}

impl DecisionContext {
    /// SHA-256 over the serialised bundle; stored on the decision record so
    /// any decision can be traced back to the exact inputs it saw.
    pub fn digest(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Render the prompt text sent to chat-style providers.
    fn to_prompt(&self) -> String {
        let context_json = serde_json::to_string_pretty(self).unwrap_or_default();
        format!(
            "You are {trader}, an autonomous crypto futures trader competing on a shared \
             exchange. Review your account, the market, your open positions, active grids, \
             and recent trades, then reply with EXACTLY ONE JSON object and nothing else:\n\
             {{\n  \"action\": \"HOLD\" | \"BUY\" | \"SELL\" | \"CLOSE\" | \"SETUP_GRID\" | \
             \"UPDATE_GRID\" | \"STOP_GRID\",\n  \"symbol\": \"<symbol or omit for HOLD>\",\n  \
             \"quantity_usd\": <number, BUY/SELL only>,\n  \"leverage\": <integer, BUY/SELL only>,\n  \
             \"stop_loss_pct\": <number, optional>,\n  \"take_profit_pct\": <number, optional>,\n  \
             \"grid_config\": {{\"upper_limit\", \"lower_limit\", \"grid_levels\", \"spacing_type\", \
             \"leverage\", \"investment_usd\", \"stop_loss_pct\"}} for SETUP_GRID/UPDATE_GRID,\n  \
             \"reasoning\": \"<your analysis>\",\n  \"confidence\": <0.0-1.0>\n}}\n\n\
             CONTEXT:\n{context}",
            trader = self.trader_id,
            context = context_json,
        )
    }
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(String),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider returned no content")]
    NoContent,
}

/// Raw provider output plus usage accounting.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    /// Verbatim text of the provider's answer.
    pub raw: String,
    /// The first JSON object found in the answer, or Null when none was.
    pub value: serde_json::Value,
    pub tokens_prompt: u32,
    pub tokens_completion: u32,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

/// An opaque decision function. Implementations must be cheap to share.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn decide(&self, ctx: &DecisionContext) -> Result<ProviderReply, ProviderError>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat adapter
// ---------------------------------------------------------------------------

pub struct ChatCompletionsProvider {
    name: String,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f64,
    http: reqwest::Client,
}

impl ChatCompletionsProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        temperature: f64,
        timeout_seconds: u64,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .expect("failed to build reqwest client");

        Self {
            name: name.into(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
            temperature,
            http,
        }
    }
}

#[async_trait]
impl DecisionProvider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn decide(&self, ctx: &DecisionContext) -> Result<ProviderReply, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": ctx.to_prompt() }],
        });

        let started = Instant::now();
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Http(format!("unparseable response: {e}")))?;

        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: payload.to_string(),
            });
        }

        let latency_ms = started.elapsed().as_millis() as u64;

        let raw = payload
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or(ProviderError::NoContent)?
            .to_string();

        let tokens_prompt = payload
            .pointer("/usage/prompt_tokens")
            .and_then(|t| t.as_u64())
            .unwrap_or(0) as u32;
        let tokens_completion = payload
            .pointer("/usage/completion_tokens")
            .and_then(|t| t.as_u64())
            .unwrap_or(0) as u32;

        let value = extract_json_object(&raw)
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(serde_json::Value::Null);

        debug!(
            provider = %self.name,
            latency_ms,
            tokens_prompt,
            tokens_completion,
            "provider replied"
        );

        Ok(ProviderReply {
            raw,
            value,
            tokens_prompt,
            tokens_completion,
            cost_usd: 0.0,
            latency_ms,
        })
    }
}

impl std::fmt::Debug for ChatCompletionsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Find the first balanced JSON object in `text`, string-aware so braces
/// inside quoted values do not truncate the scan.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Build one provider per enabled trader from settings.
///
/// With `strict_provider_validation` a missing API key is fatal at boot;
/// otherwise the trader is skipped for the session with a warning.
pub fn build_providers(
    settings: &Settings,
) -> anyhow::Result<HashMap<String, Arc<dyn DecisionProvider>>> {
    let mut providers: HashMap<String, Arc<dyn DecisionProvider>> = HashMap::new();

    for trader in settings.traders.iter().filter(|t| t.enabled) {
        match build_one(trader, settings.provider_timeout_seconds) {
            Ok(provider) => {
                info!(
                    trader_id = %trader.trader_id,
                    model = %trader.model,
                    "decision provider ready"
                );
                providers.insert(trader.trader_id.clone(), provider);
            }
            Err(e) if settings.strict_provider_validation => {
                anyhow::bail!("provider for {} unavailable: {e}", trader.trader_id);
            }
            Err(e) => {
                warn!(
                    trader_id = %trader.trader_id,
                    error = %e,
                    "provider unavailable — trader skipped for this session"
                );
            }
        }
    }

    Ok(providers)
}

fn build_one(
    trader: &TraderSettings,
    timeout_seconds: u64,
) -> anyhow::Result<Arc<dyn DecisionProvider>> {
    let api_key = std::env::var(&trader.api_key_env)
        .map_err(|_| anyhow::anyhow!("environment variable {} not set", trader.api_key_env))?;
    if api_key.is_empty() {
        anyhow::bail!("environment variable {} is empty", trader.api_key_env);
    }

    Ok(Arc::new(ChatCompletionsProvider::new(
        trader.trader_id.clone(),
        trader.base_url.clone(),
        trader.model.clone(),
        api_key,
        trader.temperature,
        timeout_seconds,
    )))
}
