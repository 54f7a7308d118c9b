// =============================================================================
// Binance USDT-M futures gateway
// =============================================================================

pub mod client;
pub mod filters;
pub mod rate_limit;

pub use client::{
    AccountInfo, BinanceFuturesClient, ExchangeOrder, ExchangePosition, GatewayError,
    GatewayResult, Kline, OrderRequest, OrderType, Ticker24h,
};
pub use filters::{round_to_step, round_to_tick, SymbolFilters};
