// One-time import of the legacy flat-file snapshot into the canonical store.
//
// The legacy format was a single JSON object with loosely-typed sections
// (`pair_meta`, `subs_by_user`, `subs_all`, `tokens`, `global_thresholds`,
// `mev_buffer_bps`, `default_profile`, `gas_alerts`). Every section is
// optional; chat ids appear as JSON strings in `subs_by_user`. Anything the
// file does not carry keeps the configured defaults. A file that fails to
// parse as JSON aborts startup with `StoreError::Migration`.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::store::StoreData;
use super::{AlertDirection, GasAlert, PairMetadata, StoreError, ThresholdOverride};

#[derive(Debug, Default, Deserialize)]
struct LegacySnapshot {
    #[serde(default)]
    pair_meta: Vec<PairMetadata>,
    #[serde(default)]
    subs_all: Vec<i64>,
    #[serde(default)]
    subs_by_user: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    tokens: BTreeMap<String, LegacyTokenRecord>,
    #[serde(default)]
    global_thresholds: Option<ThresholdOverride>,
    #[serde(default)]
    mev_buffer_bps: Option<f64>,
    #[serde(default)]
    default_profile: BTreeMap<String, f64>,
    #[serde(default)]
    gas_alerts: Vec<LegacyGasAlert>,
    // Other legacy sections (scan_set, profiles) have no counterpart and are
    // ignored.
    #[serde(flatten)]
    _rest: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyTokenRecord {
    #[serde(default)]
    metadata: Option<PairMetadata>,
    #[serde(default)]
    thresholds: Option<ThresholdOverride>,
}

#[derive(Debug, Deserialize)]
struct LegacyGasAlert {
    chat_id: i64,
    network: String,
    price_threshold: f64,
    direction: String,
}

/// Counts reported to the startup log.
#[derive(Debug, Default)]
pub(crate) struct LegacyImportStats {
    pub pairs: usize,
    pub overrides: usize,
    pub subscriptions: usize,
    pub alerts: usize,
}

/// Merge a legacy snapshot into `data`. The caller has already verified the
/// store is empty and the migration marker is unset.
pub(crate) fn import_legacy(
    raw: &str,
    data: &mut StoreData,
) -> Result<LegacyImportStats, StoreError> {
    if raw.trim().is_empty() {
        return Ok(LegacyImportStats::default());
    }
    let snapshot: LegacySnapshot = serde_json::from_str(raw)
        .map_err(|e| StoreError::Migration(format!("legacy snapshot is not valid JSON: {e}")))?;

    let mut stats = LegacyImportStats::default();

    for meta in snapshot.pair_meta {
        data.pairs.insert(meta.pair_key.clone(), meta);
        stats.pairs += 1;
    }

    for (pair_key, record) in snapshot.tokens {
        if let Some(meta) = record.metadata {
            if !data.pairs.contains_key(&pair_key) {
                data.pairs.insert(pair_key.clone(), meta);
                stats.pairs += 1;
            }
        }
        if let Some(thresholds) = record.thresholds.filter(|t| !t.is_empty()) {
            if data.pairs.contains_key(&pair_key) {
                data.pair_overrides.insert(pair_key, thresholds);
                stats.overrides += 1;
            } else {
                warn!(pair = %pair_key, "Skipping legacy override for untracked pair");
            }
        }
    }

    if let Some(global) = snapshot.global_thresholds {
        data.global_thresholds = global.apply(data.global_thresholds);
    }

    data.subs_all.extend(snapshot.subs_all.iter().copied());

    for (chat_key, pairs) in snapshot.subs_by_user {
        let chat_id: i64 = chat_key.trim().parse().map_err(|_| {
            StoreError::Migration(format!("legacy chat id '{chat_key}' is not an integer"))
        })?;
        for pair_key in pairs {
            if !data.pairs.contains_key(&pair_key) {
                warn!(chat_id, pair = %pair_key, "Skipping legacy subscription to untracked pair");
                continue;
            }
            data.subs_by_chat
                .entry(chat_id)
                .or_default()
                .insert(pair_key);
            stats.subscriptions += 1;
        }
    }

    if let Some(mev) = snapshot.mev_buffer_bps {
        data.settings.mev_bps = mev;
    }
    for (field, value) in snapshot.default_profile {
        match field.as_str() {
            "min_net_bps" => data.settings.min_net_bps = value,
            "test_size_eur" => data.settings.test_size_eur = value,
            "slippage_cap_bps" => data.settings.slippage_cap_bps = value,
            "mev_bps" => data.settings.mev_bps = value,
            other => warn!(field = other, "Ignoring unknown legacy profile field"),
        }
    }

    for alert in snapshot.gas_alerts {
        let direction: AlertDirection = alert.direction.parse().map_err(|e: String| {
            StoreError::Migration(format!("legacy gas alert for chat {}: {e}", alert.chat_id))
        })?;
        data.gas_alerts.retain(|existing| {
            !(existing.chat_id == alert.chat_id
                && existing.network == alert.network
                && existing.direction == direction)
        });
        data.gas_alerts.push(GasAlert {
            chat_id: alert.chat_id,
            network: alert.network,
            direction,
            threshold: alert.price_threshold,
            created_at: Utc::now(),
        });
        stats.alerts += 1;
    }

    Ok(stats)
}
