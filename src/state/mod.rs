pub mod migrate;
pub mod store;

pub use store::{StateStore, StoreOptions};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown pair '{0}'")]
    NotFound(String),

    /// Legacy import could not complete. Fatal at startup; the process must
    /// not continue with a half-migrated store.
    #[error("legacy state migration failed: {0}")]
    Migration(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Metadata describing a tracked liquidity pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairMetadata {
    pub pair_key: String,
    pub symbols: String,
    #[serde(default)]
    pub base_symbol: String,
    #[serde(default)]
    pub quote_symbol: String,
    #[serde(default)]
    pub base_address: Option<String>,
    #[serde(default)]
    pub quote_address: Option<String>,
    #[serde(default)]
    pub dex_id: Option<String>,
    #[serde(default)]
    pub fee_tiers: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Market health floors used to gate whether a pair's updates are broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub min_liquidity_usd: f64,
    pub min_volume_24h_usd: f64,
    pub min_txns_24h: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_liquidity_usd: 50_000.0,
            min_volume_24h_usd: 100_000.0,
            min_txns_24h: 50,
        }
    }
}

/// Per-pair threshold overrides. A set field fully replaces the global
/// value; unset fields fall back to the global thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_liquidity_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_volume_24h_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_txns_24h: Option<u32>,
}

impl ThresholdOverride {
    pub fn is_empty(&self) -> bool {
        self.min_liquidity_usd.is_none()
            && self.min_volume_24h_usd.is_none()
            && self.min_txns_24h.is_none()
    }

    /// Resolve the effective thresholds given the global base values.
    pub fn apply(&self, base: Thresholds) -> Thresholds {
        Thresholds {
            min_liquidity_usd: self.min_liquidity_usd.unwrap_or(base.min_liquidity_usd),
            min_volume_24h_usd: self
                .min_volume_24h_usd
                .unwrap_or(base.min_volume_24h_usd),
            min_txns_24h: self.min_txns_24h.unwrap_or(base.min_txns_24h),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertDirection {
    Below,
    Above,
}

impl std::fmt::Display for AlertDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertDirection::Below => write!(f, "below"),
            AlertDirection::Above => write!(f, "above"),
        }
    }
}

impl std::str::FromStr for AlertDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "below" => Ok(AlertDirection::Below),
            "above" => Ok(AlertDirection::Above),
            other => Err(format!("direction must be 'below' or 'above', got '{other}'")),
        }
    }
}

/// One-shot, chat-scoped condition on the fast gas tier. Consumed exactly
/// once upon firing, never re-armed automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasAlert {
    pub chat_id: i64,
    pub network: String,
    pub direction: AlertDirection,
    pub threshold: f64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl GasAlert {
    /// Alerts are evaluated against the "fast" gas tier for responsiveness.
    pub fn triggers(&self, fast_gwei: f64) -> bool {
        match self.direction {
            AlertDirection::Below => fast_gwei <= self.threshold,
            AlertDirection::Above => fast_gwei >= self.threshold,
        }
    }

    pub fn describe(&self) -> String {
        let comparator = match self.direction {
            AlertDirection::Below => "<=",
            AlertDirection::Above => ">=",
        };
        format!(
            "fast gas {comparator} {:.2} gwei on {}",
            self.threshold, self.network
        )
    }
}

/// Process-wide arbitrage evaluation settings, mutable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArbSettings {
    pub min_net_bps: f64,
    pub test_size_eur: f64,
    pub slippage_cap_bps: f64,
    pub mev_bps: f64,
}

impl Default for ArbSettings {
    fn default() -> Self {
        Self {
            min_net_bps: 20.0,
            test_size_eur: 500.0,
            slippage_cap_bps: 150.0,
            mev_bps: 10.0,
        }
    }
}

/// Partial update for the settings singleton.
#[derive(Debug, Clone, Copy, Default)]
pub struct SettingsUpdate {
    pub min_net_bps: Option<f64>,
    pub test_size_eur: Option<f64>,
    pub slippage_cap_bps: Option<f64>,
    pub mev_bps: Option<f64>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.min_net_bps.is_none()
            && self.test_size_eur.is_none()
            && self.slippage_cap_bps.is_none()
            && self.mev_bps.is_none()
    }

    pub fn apply(&self, mut settings: ArbSettings) -> ArbSettings {
        if let Some(value) = self.min_net_bps {
            settings.min_net_bps = value;
        }
        if let Some(value) = self.test_size_eur {
            settings.test_size_eur = value;
        }
        if let Some(value) = self.slippage_cap_bps {
            settings.slippage_cap_bps = value;
        }
        if let Some(value) = self.mev_bps {
            settings.mev_bps = value;
        }
        settings
    }
}

/// Snapshot of a single chat's subscription state.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSubscription {
    pub chat_id: i64,
    pub all: bool,
    pub pair_keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_precedence_shadows_per_field() {
        let global = Thresholds {
            min_liquidity_usd: 50_000.0,
            min_volume_24h_usd: 100_000.0,
            min_txns_24h: 50,
        };
        let override_ = ThresholdOverride {
            min_liquidity_usd: Some(10_000.0),
            ..Default::default()
        };
        let effective = override_.apply(global);
        assert_eq!(effective.min_liquidity_usd, 10_000.0);
        assert_eq!(effective.min_volume_24h_usd, 100_000.0);
        assert_eq!(effective.min_txns_24h, 50);
    }

    #[test]
    fn gas_alert_trigger_directions() {
        let below = GasAlert {
            chat_id: 42,
            network: "base".to_string(),
            direction: AlertDirection::Below,
            threshold: 20.0,
            created_at: Utc::now(),
        };
        assert!(below.triggers(18.0));
        assert!(below.triggers(20.0));
        assert!(!below.triggers(25.0));

        let above = GasAlert {
            direction: AlertDirection::Above,
            ..below
        };
        assert!(above.triggers(25.0));
        assert!(!above.triggers(18.0));
    }

    #[test]
    fn settings_update_partial_apply() {
        let update = SettingsUpdate {
            mev_bps: Some(25.0),
            ..Default::default()
        };
        let settings = update.apply(ArbSettings::default());
        assert_eq!(settings.mev_bps, 25.0);
        assert_eq!(settings.min_net_bps, ArbSettings::default().min_net_bps);
    }
}
