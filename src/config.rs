// =============================================================================
// Settings — arena configuration with atomic save
// =============================================================================
//
// Central configuration for the arena engine: trader roster, exchange
// endpoints, risk limits, grid bounds, and job cadences.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_live_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_testnet_base_url() -> String {
    "https://testnet.binancefuture.com".to_string()
}

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
        "DOGEUSDT".to_string(),
        "ADAUSDT".to_string(),
        "AVAXUSDT".to_string(),
    ]
}

fn default_traders() -> Vec<TraderSettings> {
    vec![
        TraderSettings {
            trader_id: "LLM-A".to_string(),
            base_url: "https://api.deepseek.com/v1".to_string(),
            model: "deepseek-chat".to_string(),
            api_key_env: "DEEPSEEK_API_KEY".to_string(),
            temperature: 0.5,
            enabled: true,
        },
        TraderSettings {
            trader_id: "LLM-B".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.7,
            enabled: true,
        },
        TraderSettings {
            trader_id: "LLM-C".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.9,
            enabled: true,
        },
    ]
}

fn default_initial_balance() -> Decimal {
    Decimal::new(100, 0)
}

fn default_min_trade() -> Decimal {
    Decimal::new(5, 0)
}

fn default_max_trade() -> Decimal {
    Decimal::new(40, 0)
}

fn default_max_open_positions() -> u32 {
    3
}

fn default_max_positions_per_symbol() -> u32 {
    1
}

fn default_max_leverage() -> u32 {
    10
}

fn default_decision_interval() -> u64 {
    300
}

fn default_reconcile_interval() -> u64 {
    300
}

fn default_grid_monitor_interval() -> u64 {
    60
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_fee_rate() -> Decimal {
    // 0.05% taker fee.
    Decimal::new(5, 4)
}

fn default_stop_loss_range() -> PctRange {
    PctRange {
        min: Decimal::new(1, 0),
        max: Decimal::new(20, 0),
    }
}

fn default_take_profit_range() -> PctRange {
    PctRange {
        min: Decimal::new(2, 0),
        max: Decimal::new(50, 0),
    }
}

fn default_grid_level_min() -> usize {
    5
}

fn default_grid_level_max() -> usize {
    8
}

fn default_grid_investment_min() -> Decimal {
    Decimal::new(30, 0)
}

fn default_grid_investment_max() -> Decimal {
    Decimal::new(300, 0)
}

fn default_grid_leverage_max() -> u32 {
    5
}

fn default_grid_stop_loss_range() -> PctRange {
    PctRange {
        min: Decimal::new(10, 0),
        max: Decimal::new(15, 0),
    }
}

fn default_liquidation_warning_pct() -> Decimal {
    Decimal::new(90, 0)
}

fn default_provider_timeout() -> u64 {
    60
}

fn default_decision_concurrency() -> usize {
    3
}

fn default_shutdown_grace() -> u64 {
    10
}

// =============================================================================
// TraderSettings
// =============================================================================

/// One competing trader: identity plus the chat-completions endpoint that
/// produces its decisions. The API key itself stays in the environment; only
/// the variable name is configured here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderSettings {
    pub trader_id: String,
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Inclusive percentage band used for stop-loss / take-profit validation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PctRange {
    pub min: Decimal,
    pub max: Decimal,
}

impl PctRange {
    pub fn contains(&self, v: Decimal) -> bool {
        v >= self.min && v <= self.max
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level configuration for the arena engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // --- Exchange -----------------------------------------------------------
    /// Trade against the futures testnet instead of live.
    #[serde(default = "default_true")]
    pub use_testnet: bool,

    #[serde(default = "default_live_base_url")]
    pub binance_base_url: String,

    #[serde(default = "default_testnet_base_url")]
    pub binance_testnet_base_url: String,

    // --- Traders ------------------------------------------------------------
    #[serde(default = "default_traders")]
    pub traders: Vec<TraderSettings>,

    /// Starting virtual balance for every trader, in USDT.
    #[serde(default = "default_initial_balance")]
    pub initial_balance_per_trader: Decimal,

    /// When true, a trader whose provider cannot be constructed (missing API
    /// key, bad endpoint) is fatal at boot; otherwise the trader is skipped.
    #[serde(default)]
    pub strict_provider_validation: bool,

    // --- Symbols & trade limits ----------------------------------------------
    #[serde(default = "default_symbols")]
    pub allowed_symbols: Vec<String>,

    #[serde(default = "default_min_trade")]
    pub min_trade: Decimal,

    #[serde(default = "default_max_trade")]
    pub max_trade: Decimal,

    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,

    #[serde(default = "default_max_positions_per_symbol")]
    pub max_positions_per_symbol: u32,

    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,

    #[serde(default = "default_stop_loss_range")]
    pub stop_loss_range_pct: PctRange,

    #[serde(default = "default_take_profit_range")]
    pub take_profit_range_pct: PctRange,

    /// Warn when a position is within this percentage of its liquidation
    /// price.
    #[serde(default = "default_liquidation_warning_pct")]
    pub liquidation_warning_pct: Decimal,

    // --- Grid bounds ---------------------------------------------------------
    #[serde(default = "default_grid_level_min")]
    pub grid_level_min: usize,

    #[serde(default = "default_grid_level_max")]
    pub grid_level_max: usize,

    #[serde(default = "default_grid_investment_min")]
    pub grid_investment_min: Decimal,

    #[serde(default = "default_grid_investment_max")]
    pub grid_investment_max: Decimal,

    #[serde(default = "default_grid_leverage_max")]
    pub grid_leverage_max: u32,

    #[serde(default = "default_grid_stop_loss_range")]
    pub grid_stop_loss_range_pct: PctRange,

    // --- Fees ----------------------------------------------------------------
    /// Taker fee rate applied on each ladder fill (0.0005 = 0.05%).
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,

    // --- Cadences ------------------------------------------------------------
    #[serde(default = "default_decision_interval")]
    pub decision_interval_seconds: u64,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_seconds: u64,

    #[serde(default = "default_grid_monitor_interval")]
    pub grid_monitor_interval_seconds: u64,

    #[serde(default = "default_cache_ttl")]
    pub market_cache_ttl_seconds: u64,

    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_seconds: u64,

    /// Maximum number of concurrent provider calls per cycle.
    #[serde(default = "default_decision_concurrency")]
    pub decision_concurrency: usize,

    /// Seconds granted to in-flight jobs on shutdown before cancellation.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_testnet: true,
            binance_base_url: default_live_base_url(),
            binance_testnet_base_url: default_testnet_base_url(),
            traders: default_traders(),
            initial_balance_per_trader: default_initial_balance(),
            strict_provider_validation: false,
            allowed_symbols: default_symbols(),
            min_trade: default_min_trade(),
            max_trade: default_max_trade(),
            max_open_positions: default_max_open_positions(),
            max_positions_per_symbol: default_max_positions_per_symbol(),
            max_leverage: default_max_leverage(),
            stop_loss_range_pct: default_stop_loss_range(),
            take_profit_range_pct: default_take_profit_range(),
            liquidation_warning_pct: default_liquidation_warning_pct(),
            grid_level_min: default_grid_level_min(),
            grid_level_max: default_grid_level_max(),
            grid_investment_min: default_grid_investment_min(),
            grid_investment_max: default_grid_investment_max(),
            grid_leverage_max: default_grid_leverage_max(),
            grid_stop_loss_range_pct: default_grid_stop_loss_range(),
            fee_rate: default_fee_rate(),
            decision_interval_seconds: default_decision_interval(),
            reconcile_interval_seconds: default_reconcile_interval(),
            grid_monitor_interval_seconds: default_grid_monitor_interval(),
            market_cache_ttl_seconds: default_cache_ttl(),
            provider_timeout_seconds: default_provider_timeout(),
            decision_concurrency: default_decision_concurrency(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

impl Settings {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;

        settings.validate()?;

        info!(
            path = %path.display(),
            traders = settings.traders.len(),
            symbols = ?settings.allowed_symbols,
            testnet = settings.use_testnet,
            "settings loaded"
        );

        Ok(settings)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise settings to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        info!(path = %path.display(), "settings saved (atomic)");
        Ok(())
    }

    /// Reject configurations that cannot possibly run. These are fatal at
    /// boot; nothing else in the engine halts the process.
    pub fn validate(&self) -> Result<()> {
        if self.traders.is_empty() {
            anyhow::bail!("no traders configured");
        }
        let mut seen = std::collections::HashSet::new();
        for t in &self.traders {
            if t.trader_id.is_empty() {
                anyhow::bail!("trader with empty trader_id");
            }
            if !seen.insert(t.trader_id.as_str()) {
                anyhow::bail!("duplicate trader_id: {}", t.trader_id);
            }
        }
        if self.allowed_symbols.is_empty() {
            anyhow::bail!("allowed_symbols is empty");
        }
        if self.min_trade > self.max_trade {
            anyhow::bail!("min_trade exceeds max_trade");
        }
        if self.grid_level_min < 2 || self.grid_level_min > self.grid_level_max {
            anyhow::bail!(
                "invalid grid level bounds: {}..{}",
                self.grid_level_min,
                self.grid_level_max
            );
        }
        if self.initial_balance_per_trader <= Decimal::ZERO {
            anyhow::bail!("initial_balance_per_trader must be positive");
        }
        Ok(())
    }

    /// The exchange base URL for the configured environment.
    pub fn exchange_base_url(&self) -> &str {
        if self.use_testnet {
            &self.binance_testnet_base_url
        } else {
            &self.binance_base_url
        }
    }

    /// Apply environment overrides (symbols list) after loading.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("ARENA_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.allowed_symbols = parsed;
            }
        }
    }
}
