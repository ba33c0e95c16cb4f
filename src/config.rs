// =============================================================================
// Monitor Configuration — startup settings with env + JSON overlay
// =============================================================================
//
// Central configuration hub for the Orca Watch engine.  Values are resolved
// in three layers: built-in defaults, an optional JSON file, then environment
// variables (which win).  Every field carries `#[serde(default)]` so that a
// partial config file never breaks loading.
//
// Validation is fail-fast: a config that cannot drive the engine (no venues,
// nonsense thresholds) is rejected at startup per the error-handling policy.
// Threshold-type fields can additionally be overridden at runtime through the
// hot-config layer; this struct holds the boot-time values.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_venues() -> Vec<String> {
    vec!["binance".to_string()]
}

fn default_market_selector() -> String {
    "all".to_string()
}

fn default_slippage_low() -> f64 {
    0.5
}

fn default_slippage_medium() -> f64 {
    2.0
}

fn default_slippage_high() -> f64 {
    10.0
}

fn default_min_notional_spot() -> f64 {
    50_000.0
}

fn default_min_notional_futures() -> f64 {
    20_000.0
}

fn default_trade_cooldown_secs() -> f64 {
    120.0
}

fn default_pump_threshold_pct() -> f64 {
    10.0
}

fn default_dump_threshold_pct() -> f64 {
    -10.0
}

fn default_price_window_secs() -> f64 {
    60.0
}

fn default_price_cooldown_secs() -> f64 {
    300.0
}

fn default_orderbook_depth() -> usize {
    50
}

fn default_skip_top_levels() -> usize {
    1
}

fn default_min_depth_levels() -> usize {
    10
}

fn default_metrics_port() -> u16 {
    9184
}

fn default_aggregation_window_secs() -> f64 {
    60.0
}

fn default_shard_fail_policy() -> ShardFailPolicy {
    ShardFailPolicy::Restart
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_symbols_per_conn_spot() -> usize {
    60
}

fn default_symbols_per_conn_futures() -> usize {
    25
}

fn default_max_connections_per_egress() -> usize {
    280
}

fn default_max_symbols() -> usize {
    0 // 0 = no cap, subscribe everything the venue lists
}

// =============================================================================
// ShardFailPolicy
// =============================================================================

/// What the supervisor does when a stream shard exhausts its reconnect budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardFailPolicy {
    /// Policy A: respawn the shard with a fresh budget.
    Restart,
    /// Policy B: shut the whole process down cleanly with exit code 2.
    Shutdown,
}

impl std::fmt::Display for ShardFailPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Restart => write!(f, "restart"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

// =============================================================================
// PushConfig
// =============================================================================

/// Credentials for one push channel (bot token + chat id).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushChannelConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

impl PushChannelConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

// =============================================================================
// MonitorConfig
// =============================================================================

/// Top-level boot configuration for the surveillance engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    // --- Venues & markets ----------------------------------------------------

    /// Venues to monitor (currently "binance"-shaped endpoints).
    #[serde(default = "default_venues")]
    pub venues: Vec<String>,

    /// Market selector: "all", "spot", "perp", or a comma list of symbols.
    #[serde(default = "default_market_selector")]
    pub markets: String,

    /// Hard cap on symbols per (venue, market). 0 means no cap.
    #[serde(default = "default_max_symbols")]
    pub max_symbols: usize,

    // --- Slippage severity tiers --------------------------------------------

    #[serde(default = "default_slippage_low")]
    pub slippage_threshold_low: f64,

    #[serde(default = "default_slippage_medium")]
    pub slippage_threshold_medium: f64,

    #[serde(default = "default_slippage_high")]
    pub slippage_threshold_high: f64,

    // --- Notional gates ------------------------------------------------------

    /// Minimum trade notional considered on spot markets (USD).
    #[serde(default = "default_min_notional_spot")]
    pub min_notional_spot: f64,

    /// Minimum trade notional considered on perpetual markets (USD).
    #[serde(default = "default_min_notional_futures")]
    pub min_notional_futures: f64,

    // --- Cooldowns & windows -------------------------------------------------

    /// Per-(symbol, price-bucket) trade alert cooldown.
    #[serde(default = "default_trade_cooldown_secs")]
    pub trade_cooldown_secs: f64,

    #[serde(default = "default_pump_threshold_pct")]
    pub pump_threshold_pct: f64,

    #[serde(default = "default_dump_threshold_pct")]
    pub dump_threshold_pct: f64,

    #[serde(default = "default_price_window_secs")]
    pub price_window_secs: f64,

    #[serde(default = "default_price_cooldown_secs")]
    pub price_cooldown_secs: f64,

    #[serde(default = "default_aggregation_window_secs")]
    pub aggregation_window_secs: f64,

    // --- Depth handling ------------------------------------------------------

    /// Ladder levels retained per side.
    #[serde(default = "default_orderbook_depth")]
    pub orderbook_depth: usize,

    /// Levels skipped at the top of the book when computing sweep VWAP
    /// (blunts spoof-tip artifacts).
    #[serde(default = "default_skip_top_levels")]
    pub skip_top_levels: usize,

    /// Minimum levels required past the skip for a VWAP to count.
    #[serde(default = "default_min_depth_levels")]
    pub min_depth_levels: usize,

    // --- Connections ---------------------------------------------------------

    /// Symbols multiplexed onto one spot connection.
    #[serde(default = "default_symbols_per_conn_spot")]
    pub symbols_per_conn_spot: usize,

    /// Symbols multiplexed onto one futures connection (heavier streams).
    #[serde(default = "default_symbols_per_conn_futures")]
    pub symbols_per_conn_futures: usize,

    /// Dial budget per egress identity per five minutes.
    #[serde(default = "default_max_connections_per_egress")]
    pub max_connections_per_egress: usize,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Comma-separated proxy URLs; empty means direct dialing.
    #[serde(default)]
    pub proxy_list: String,

    // --- Feature flags -------------------------------------------------------

    #[serde(default = "default_true")]
    pub monitor_spot: bool,

    #[serde(default = "default_true")]
    pub monitor_futures: bool,

    /// Treat configured stablecoin quotes as interchangeable when matching
    /// symbols across venues.
    #[serde(default = "default_true")]
    pub auto_convert_stable: bool,

    // --- Push channels -------------------------------------------------------

    #[serde(default)]
    pub push_normal: PushChannelConfig,

    #[serde(default)]
    pub push_urgent: PushChannelConfig,

    // --- Persistence & observability -----------------------------------------

    /// Path of the SQLite alert store.
    #[serde(default)]
    pub alert_db_path: String,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Optional log file (stdout only when empty).
    #[serde(default)]
    pub log_file: String,

    // --- Supervisor ----------------------------------------------------------

    #[serde(default = "default_shard_fail_policy")]
    pub shard_fail_policy: ShardFailPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        // Round-trips through serde so the default helpers stay the single
        // source of truth.
        serde_json::from_str("{}").expect("empty config deserialises")
    }
}

impl MonitorConfig {
    /// Load configuration: defaults <- optional JSON file <- environment.
    pub fn load(json_path: Option<&Path>) -> Result<Self> {
        let mut config = match json_path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config from {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse config from {}", path.display()))?
            }
            _ => Self::default(),
        };

        config.apply_env();
        config.validate()?;

        info!(
            venues = ?config.venues,
            markets = %config.markets,
            policy = %config.shard_fail_policy,
            "monitor config loaded"
        );
        Ok(config)
    }

    /// Overlay recognised environment variables onto the current values.
    fn apply_env(&mut self) {
        fn env_str(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        }
        fn env_f64(key: &str) -> Option<f64> {
            env_str(key).and_then(|v| v.parse().ok())
        }
        fn env_usize(key: &str) -> Option<usize> {
            env_str(key).and_then(|v| v.parse().ok())
        }
        fn env_bool(key: &str) -> Option<bool> {
            env_str(key).map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        }

        if let Some(v) = env_str("MONITOR_VENUES") {
            self.venues = v
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = env_str("MONITOR_MARKETS") {
            self.markets = v;
        }
        if let Some(v) = env_usize("MONITOR_MAX_SYMBOLS") {
            self.max_symbols = v;
        }
        if let Some(v) = env_f64("SLIPPAGE_THRESHOLD_LOW") {
            self.slippage_threshold_low = v;
        }
        if let Some(v) = env_f64("SLIPPAGE_THRESHOLD_MED") {
            self.slippage_threshold_medium = v;
        }
        if let Some(v) = env_f64("SLIPPAGE_THRESHOLD_HIGH") {
            self.slippage_threshold_high = v;
        }
        if let Some(v) = env_f64("MIN_ORDER_VALUE_SPOT") {
            self.min_notional_spot = v;
        }
        if let Some(v) = env_f64("MIN_ORDER_VALUE_FUTURES") {
            self.min_notional_futures = v;
        }
        if let Some(v) = env_f64("PRICE_PUMP_THRESHOLD") {
            self.pump_threshold_pct = v;
        }
        if let Some(v) = env_f64("PRICE_DUMP_THRESHOLD") {
            self.dump_threshold_pct = v;
        }
        if let Some(v) = env_f64("PRICE_COOLDOWN") {
            self.price_cooldown_secs = v;
        }
        if let Some(v) = env_str("PROXY_LIST") {
            self.proxy_list = v;
        }
        if let Some(v) = env_bool("MONITOR_SPOT") {
            self.monitor_spot = v;
        }
        if let Some(v) = env_bool("MONITOR_FUTURES") {
            self.monitor_futures = v;
        }
        if let Some(v) = env_str("TELEGRAM_BOT_TOKEN") {
            self.push_normal.bot_token = v;
        }
        if let Some(v) = env_str("TELEGRAM_CHAT_ID") {
            self.push_normal.chat_id = v;
        }
        if let Some(v) = env_str("TELEGRAM_URGENT_BOT_TOKEN") {
            self.push_urgent.bot_token = v;
        }
        if let Some(v) = env_str("TELEGRAM_URGENT_CHAT_ID") {
            self.push_urgent.chat_id = v;
        }
        if let Some(v) = env_str("ALERT_DB_PATH") {
            self.alert_db_path = v;
        }
        if let Some(v) = env_str("METRICS_PORT").and_then(|v| v.parse().ok()) {
            self.metrics_port = v;
        }
        if let Some(v) = env_str("LOG_FILE") {
            self.log_file = v;
        }
        if let Some(v) = env_str("SHARD_FAIL_POLICY") {
            match v.to_lowercase().as_str() {
                "restart" => self.shard_fail_policy = ShardFailPolicy::Restart,
                "shutdown" => self.shard_fail_policy = ShardFailPolicy::Shutdown,
                _ => {}
            }
        }
    }

    /// Reject configs the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.venues.is_empty() {
            bail!("no venues configured");
        }
        if self.slippage_threshold_low <= 0.0
            || self.slippage_threshold_medium < self.slippage_threshold_low
            || self.slippage_threshold_high < self.slippage_threshold_medium
        {
            bail!(
                "slippage tiers must satisfy 0 < low <= medium <= high (got {} / {} / {})",
                self.slippage_threshold_low,
                self.slippage_threshold_medium,
                self.slippage_threshold_high
            );
        }
        if self.min_notional_spot < 0.0 || self.min_notional_futures < 0.0 {
            bail!("min notional thresholds must be non-negative");
        }
        if self.pump_threshold_pct <= 0.0 {
            bail!("pump threshold must be positive");
        }
        if self.dump_threshold_pct >= 0.0 {
            bail!("dump threshold must be negative");
        }
        if self.symbols_per_conn_spot == 0 || self.symbols_per_conn_futures == 0 {
            bail!("symbols-per-connection must be at least 1");
        }
        if !self.monitor_spot && !self.monitor_futures {
            bail!("at least one of spot/futures monitoring must be enabled");
        }
        Ok(())
    }

    /// Minimum notional gate for a market type.
    pub fn min_notional(&self, market: crate::types::MarketType) -> f64 {
        match market {
            crate::types::MarketType::Spot => self.min_notional_spot,
            crate::types::MarketType::Futures => self.min_notional_futures,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.venues, vec!["binance"]);
        assert_eq!(cfg.markets, "all");
        assert!((cfg.slippage_threshold_low - 0.5).abs() < f64::EPSILON);
        assert!((cfg.slippage_threshold_medium - 2.0).abs() < f64::EPSILON);
        assert!((cfg.slippage_threshold_high - 10.0).abs() < f64::EPSILON);
        assert!((cfg.min_notional_spot - 50_000.0).abs() < f64::EPSILON);
        assert!((cfg.min_notional_futures - 20_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.shard_fail_policy, ShardFailPolicy::Restart);
        assert_eq!(cfg.max_reconnect_attempts, 10);
        assert!(cfg.monitor_spot);
        assert!(cfg.monitor_futures);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "venues": ["binance"], "markets": "spot", "metrics_port": 9999 }"#;
        let cfg: MonitorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.markets, "spot");
        assert_eq!(cfg.metrics_port, 9999);
        assert_eq!(cfg.orderbook_depth, 50);
        assert_eq!(cfg.skip_top_levels, 1);
    }

    #[test]
    fn validate_rejects_inverted_tiers() {
        let mut cfg = MonitorConfig::default();
        cfg.slippage_threshold_medium = 0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_venues() {
        let mut cfg = MonitorConfig::default();
        cfg.venues.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_positive_dump_threshold() {
        let mut cfg = MonitorConfig::default();
        cfg.dump_threshold_pct = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn min_notional_by_market() {
        let cfg = MonitorConfig::default();
        assert!((cfg.min_notional(MarketType::Spot) - 50_000.0).abs() < f64::EPSILON);
        assert!((cfg.min_notional(MarketType::Futures) - 20_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = MonitorConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: MonitorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.venues, cfg2.venues);
        assert_eq!(cfg.metrics_port, cfg2.metrics_port);
        assert_eq!(cfg.shard_fail_policy, cfg2.shard_fail_policy);
    }
}
