// =============================================================================
// Engine Configuration — flat, hot-loadable settings with atomic save
// =============================================================================
//
// Every tunable parameter of the engine lives here. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading
// an older config file.
//
// `validate()` returns the precise list of violations; startup fails fast
// when the list is non-empty.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_instrument() -> String {
    "MES".to_string()
}

fn default_account_size() -> f64 {
    50_000.0
}

fn default_max_contracts() -> u32 {
    3
}

fn default_risk_per_trade() -> f64 {
    0.01
}

fn default_min_risk_reward() -> f64 {
    1.5
}

fn default_daily_loss_limit() -> f64 {
    1_000.0
}

fn default_true() -> bool {
    true
}

fn default_max_trades_per_day() -> u32 {
    10
}

fn default_confidence_threshold() -> f64 {
    0.60
}

fn default_exploration_rate() -> f64 {
    0.05
}

fn default_session_start_et() -> String {
    "18:00".to_string()
}

fn default_maintenance_start_et() -> String {
    "16:45".to_string()
}

fn default_flatten_forced_et() -> String {
    "17:00".to_string()
}

fn default_friday_cutoff_et() -> String {
    "16:30".to_string()
}

fn default_entry_slippage_alert_ticks() -> f64 {
    2.0
}

fn default_passive_order_timeout_s() -> u64 {
    10
}

fn default_queue_price_move_cancel_ticks() -> f64 {
    2.0
}

fn default_imbalance_threshold() -> f64 {
    3.0
}

fn default_min_bid_ask_size() -> u32 {
    5
}

fn default_max_acceptable_spread() -> f64 {
    2.0
}

fn default_normal_hours_slippage_ticks() -> f64 {
    1.0
}

fn default_illiquid_hours_slippage_ticks() -> f64 {
    2.0
}

fn default_illiquid_hours_start_et() -> String {
    "00:00".to_string()
}

fn default_illiquid_hours_end_et() -> String {
    "09:30".to_string()
}

fn default_broker_type() -> String {
    "sim".to_string()
}

fn default_cloud_api_url() -> String {
    "https://api.meridian-trading.io".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_tick_size() -> f64 {
    0.25
}

fn default_tick_value() -> f64 {
    1.25
}

fn default_commission_per_contract() -> f64 {
    0.62
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for one engine instance (one symbol).
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Instrument -----------------------------------------------------------

    /// Symbol traded by this instance (e.g. "MES", "MNQ").
    #[serde(default = "default_instrument")]
    pub instrument: String,

    /// Minimum price increment for the instrument.
    #[serde(default = "default_tick_size")]
    pub tick_size: f64,

    /// Dollar value of one tick for one contract.
    #[serde(default = "default_tick_value")]
    pub tick_value: f64,

    /// Round-turn commission per contract, deducted from realized PnL.
    #[serde(default = "default_commission_per_contract")]
    pub commission_per_contract: f64,

    // --- Account & risk -------------------------------------------------------

    /// Session-reset starting equity in dollars.
    #[serde(default = "default_account_size")]
    pub account_size: f64,

    /// Hard cap on position size in contracts.
    #[serde(default = "default_max_contracts")]
    pub max_contracts: u32,

    /// Fraction of equity risked per trade.
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,

    /// Minimum risk/reward ratio required at entry.
    #[serde(default = "default_min_risk_reward")]
    pub min_risk_reward: f64,

    /// Maximum cumulative daily loss in dollars.
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,

    /// true = block new entries at 80% of the daily loss limit (safe mode).
    /// false = recovery mode: keep trading with raised confidence thresholds
    /// and scaled-down size.
    #[serde(default = "default_true")]
    pub stop_on_approach: bool,

    /// Maximum number of entries per trading day.
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,

    // --- Signal gating --------------------------------------------------------

    /// Minimum scorer confidence required to take a candidate.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Fraction of candidates the scorer may flag as exploration (sized to
    /// one contract).
    #[serde(default = "default_exploration_rate")]
    pub exploration_rate: f64,

    // --- Session calendar (ET wall-clock, "HH:MM") ----------------------------

    /// Futures session boundary; SessionState resets here.
    #[serde(default = "default_session_start_et")]
    pub session_start_et: String,

    /// Start of the daily maintenance window; positions are flattened.
    #[serde(default = "default_maintenance_start_et")]
    pub maintenance_start_et: String,

    /// Hard flatten deadline inside the maintenance window.
    #[serde(default = "default_flatten_forced_et")]
    pub flatten_forced_et: String,

    /// No new entries after this time on Fridays.
    #[serde(default = "default_friday_cutoff_et")]
    pub friday_cutoff_et: String,

    /// Enable the economic-event blackout window.
    #[serde(default = "default_true")]
    pub fomc_block_enabled: bool,

    // --- Order routing --------------------------------------------------------

    /// Entry fill slippage (ticks) at which a warning is emitted.
    #[serde(default = "default_entry_slippage_alert_ticks")]
    pub entry_slippage_alert_ticks: f64,

    /// How long a passive limit order may rest before switching aggressive.
    #[serde(default = "default_passive_order_timeout_s")]
    pub passive_order_timeout_s: u64,

    /// Adverse mid move (ticks) that cancels a resting passive order.
    #[serde(default = "default_queue_price_move_cancel_ticks")]
    pub queue_price_move_cancel_ticks: f64,

    /// bid_size/ask_size ratio above which the book is STRONG_BID (and
    /// below whose reciprocal it is STRONG_ASK).
    #[serde(default = "default_imbalance_threshold")]
    pub imbalance_threshold: f64,

    /// Minimum size on both sides of the book for an entry to pass the gate.
    #[serde(default = "default_min_bid_ask_size")]
    pub min_bid_ask_size: u32,

    /// Maximum spread in ticks accepted for entries.
    #[serde(default = "default_max_acceptable_spread")]
    pub max_acceptable_spread: f64,

    /// Expected slippage in ticks during liquid hours.
    #[serde(default = "default_normal_hours_slippage_ticks")]
    pub normal_hours_slippage_ticks: f64,

    /// Expected slippage in ticks during illiquid hours.
    #[serde(default = "default_illiquid_hours_slippage_ticks")]
    pub illiquid_hours_slippage_ticks: f64,

    /// Start of the illiquid window (ET).
    #[serde(default = "default_illiquid_hours_start_et")]
    pub illiquid_hours_start_et: String,

    /// End of the illiquid window (ET).
    #[serde(default = "default_illiquid_hours_end_et")]
    pub illiquid_hours_end_et: String,

    // --- Infrastructure -------------------------------------------------------

    /// Broker gateway implementation to load ("sim" or a live adapter name).
    #[serde(default = "default_broker_type")]
    pub broker_type: String,

    /// Simulate fills locally; no orders reach the broker.
    #[serde(default)]
    pub dry_run: bool,

    /// Base URL of the license / session-lock service.
    #[serde(default = "default_cloud_api_url")]
    pub cloud_api_url: String,

    /// Log level filter (overridden by RUST_LOG when set).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Root directory for persisted state and experience files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instrument: default_instrument(),
            tick_size: default_tick_size(),
            tick_value: default_tick_value(),
            commission_per_contract: default_commission_per_contract(),
            account_size: default_account_size(),
            max_contracts: default_max_contracts(),
            risk_per_trade: default_risk_per_trade(),
            min_risk_reward: default_min_risk_reward(),
            daily_loss_limit: default_daily_loss_limit(),
            stop_on_approach: true,
            max_trades_per_day: default_max_trades_per_day(),
            confidence_threshold: default_confidence_threshold(),
            exploration_rate: default_exploration_rate(),
            session_start_et: default_session_start_et(),
            maintenance_start_et: default_maintenance_start_et(),
            flatten_forced_et: default_flatten_forced_et(),
            friday_cutoff_et: default_friday_cutoff_et(),
            fomc_block_enabled: true,
            entry_slippage_alert_ticks: default_entry_slippage_alert_ticks(),
            passive_order_timeout_s: default_passive_order_timeout_s(),
            queue_price_move_cancel_ticks: default_queue_price_move_cancel_ticks(),
            imbalance_threshold: default_imbalance_threshold(),
            min_bid_ask_size: default_min_bid_ask_size(),
            max_acceptable_spread: default_max_acceptable_spread(),
            normal_hours_slippage_ticks: default_normal_hours_slippage_ticks(),
            illiquid_hours_slippage_ticks: default_illiquid_hours_slippage_ticks(),
            illiquid_hours_start_et: default_illiquid_hours_start_et(),
            illiquid_hours_end_et: default_illiquid_hours_end_et(),
            broker_type: default_broker_type(),
            dry_run: false,
            cloud_api_url: default_cloud_api_url(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            instrument = %config.instrument,
            dry_run = config.dry_run,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Validate the configuration, returning every violation found.
    ///
    /// An empty vector means the config is usable. Callers are expected to
    /// fail fast and print the full list otherwise.
    pub fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();

        if self.instrument.trim().is_empty() {
            violations.push("instrument must not be empty".to_string());
        }
        if self.tick_size <= 0.0 {
            violations.push(format!("tick_size must be > 0 (got {})", self.tick_size));
        }
        if self.tick_value <= 0.0 {
            violations.push(format!("tick_value must be > 0 (got {})", self.tick_value));
        }
        if self.account_size <= 0.0 {
            violations.push(format!(
                "account_size must be > 0 (got {})",
                self.account_size
            ));
        }
        if self.max_contracts == 0 {
            violations.push("max_contracts must be >= 1".to_string());
        }
        if !(0.0..=0.10).contains(&self.risk_per_trade) {
            violations.push(format!(
                "risk_per_trade must be in [0, 0.10] (got {})",
                self.risk_per_trade
            ));
        }
        if self.min_risk_reward < 0.5 {
            violations.push(format!(
                "min_risk_reward must be >= 0.5 (got {})",
                self.min_risk_reward
            ));
        }
        if self.daily_loss_limit <= 0.0 {
            violations.push(format!(
                "daily_loss_limit must be > 0 (got {})",
                self.daily_loss_limit
            ));
        }
        if self.max_trades_per_day == 0 {
            violations.push("max_trades_per_day must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            violations.push(format!(
                "confidence_threshold must be in [0, 1] (got {})",
                self.confidence_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.exploration_rate) {
            violations.push(format!(
                "exploration_rate must be in [0, 1] (got {})",
                self.exploration_rate
            ));
        }
        if self.passive_order_timeout_s == 0 {
            violations.push("passive_order_timeout_s must be >= 1".to_string());
        }
        if self.max_acceptable_spread <= 0.0 {
            violations.push(format!(
                "max_acceptable_spread must be > 0 (got {})",
                self.max_acceptable_spread
            ));
        }
        if self.imbalance_threshold <= 1.0 {
            violations.push(format!(
                "imbalance_threshold must be > 1 (got {})",
                self.imbalance_threshold
            ));
        }
        if self.data_dir.trim().is_empty() {
            violations.push("data_dir must not be empty".to_string());
        }

        // Every "HH:MM" field must parse.
        for (name, value) in [
            ("session_start_et", &self.session_start_et),
            ("maintenance_start_et", &self.maintenance_start_et),
            ("flatten_forced_et", &self.flatten_forced_et),
            ("friday_cutoff_et", &self.friday_cutoff_et),
            ("illiquid_hours_start_et", &self.illiquid_hours_start_et),
            ("illiquid_hours_end_et", &self.illiquid_hours_end_et),
        ] {
            if parse_et_time(value).is_none() {
                violations.push(format!("{name} must be \"HH:MM\" (got {value:?})"));
            }
        }

        violations
    }

    // --- Parsed time accessors ------------------------------------------------

    pub fn session_start(&self) -> NaiveTime {
        parse_et_time(&self.session_start_et).unwrap_or_else(|| time_of(18, 0))
    }

    pub fn maintenance_start(&self) -> NaiveTime {
        parse_et_time(&self.maintenance_start_et).unwrap_or_else(|| time_of(16, 45))
    }

    pub fn flatten_forced(&self) -> NaiveTime {
        parse_et_time(&self.flatten_forced_et).unwrap_or_else(|| time_of(17, 0))
    }

    pub fn friday_cutoff(&self) -> NaiveTime {
        parse_et_time(&self.friday_cutoff_et).unwrap_or_else(|| time_of(16, 30))
    }

    pub fn illiquid_start(&self) -> NaiveTime {
        parse_et_time(&self.illiquid_hours_start_et).unwrap_or_else(|| time_of(0, 0))
    }

    pub fn illiquid_end(&self) -> NaiveTime {
        parse_et_time(&self.illiquid_hours_end_et).unwrap_or_else(|| time_of(9, 30))
    }

    /// Convert a tick count to dollars for `contracts` contracts.
    pub fn ticks_to_dollars(&self, ticks: f64, contracts: u32) -> f64 {
        ticks * self.tick_value * contracts as f64
    }

    /// Convert a price distance to whole-number-of-ticks units.
    pub fn price_to_ticks(&self, price_distance: f64) -> f64 {
        price_distance / self.tick_size
    }
}

/// Parse "HH:MM" into a NaiveTime. Returns None on any malformation.
pub fn parse_et_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

fn time_of(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default()
}
