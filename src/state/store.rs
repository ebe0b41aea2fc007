// Durable state store for pairs, thresholds, subscriptions, gas alerts and
// runtime settings.
//
// The store keeps everything in memory behind a single RwLock and writes a
// JSON snapshot atomically (tmp + rename) after every mutation. All mutating
// operations hold the write lock for the duration of the read-modify-write,
// so the admin console, chat handlers and the poller interleave safely
// without lost updates. No store operation performs network I/O under the
// lock.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::migrate;
use super::{
    AlertDirection, ArbSettings, ChatSubscription, GasAlert, PairMetadata, SettingsUpdate,
    StoreError, Thresholds, ThresholdOverride,
};

/// Serialized snapshot layout. Field names are the on-disk schema.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct StoreData {
    #[serde(default)]
    pub migrated_from_legacy: bool,
    #[serde(default)]
    pub pairs: BTreeMap<String, PairMetadata>,
    #[serde(default)]
    pub global_thresholds: Thresholds,
    #[serde(default)]
    pub pair_overrides: BTreeMap<String, ThresholdOverride>,
    #[serde(default)]
    pub subs_all: BTreeSet<i64>,
    #[serde(default)]
    pub subs_by_chat: BTreeMap<i64, BTreeSet<String>>,
    #[serde(default)]
    pub gas_alerts: Vec<GasAlert>,
    #[serde(default)]
    pub settings: ArbSettings,
}

impl StoreData {
    fn has_state(&self) -> bool {
        !self.pairs.is_empty()
            || !self.pair_overrides.is_empty()
            || !self.subs_all.is_empty()
            || !self.subs_by_chat.is_empty()
            || !self.gas_alerts.is_empty()
    }
}

/// Options controlling how the store is opened.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Path of the canonical JSON snapshot.
    pub path: PathBuf,
    /// Optional legacy flat-file snapshot imported once on first open.
    pub legacy_path: Option<PathBuf>,
    /// Configuration defaults applied when the store starts empty.
    pub default_thresholds: Thresholds,
    pub default_settings: ArbSettings,
}

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    baseline_settings: ArbSettings,
    inner: RwLock<StoreData>,
}

impl StateStore {
    /// Open the canonical store, running the one-time legacy migration when
    /// the store is empty, the migration marker is unset and a legacy
    /// snapshot exists. The marker is persisted after the first open either
    /// way, so the import never runs against a store that has already been
    /// live. A malformed legacy file is a fatal `StoreError::Migration`.
    pub async fn open(options: StoreOptions) -> Result<Self, StoreError> {
        let mut data = if options.path.exists() {
            let raw = tokio::fs::read_to_string(&options.path).await?;
            serde_json::from_str::<StoreData>(&raw)?
        } else {
            StoreData {
                global_thresholds: options.default_thresholds,
                settings: options.default_settings,
                ..StoreData::default()
            }
        };

        if !data.migrated_from_legacy {
            if !data.has_state() {
                if let Some(legacy_path) = options
                    .legacy_path
                    .as_deref()
                    .filter(|path| path.exists())
                {
                    let raw = tokio::fs::read_to_string(legacy_path)
                        .await
                        .map_err(|e| {
                            StoreError::Migration(format!("reading legacy snapshot: {e}"))
                        })?;
                    let stats = migrate::import_legacy(&raw, &mut data)?;
                    info!(
                        legacy = %legacy_path.display(),
                        pairs = stats.pairs,
                        overrides = stats.overrides,
                        subscriptions = stats.subscriptions,
                        alerts = stats.alerts,
                        "Imported legacy state snapshot"
                    );
                }
            }
            // The import decision is made once. Marking it even when no
            // legacy file was found keeps a snapshot that appears at a
            // later restart from overwriting live state.
            data.migrated_from_legacy = true;
        }

        let store = Self {
            path: options.path,
            baseline_settings: options.default_settings,
            inner: RwLock::new(data),
        };
        {
            let data = store.inner.read().await;
            store.persist(&data).await?;
        }
        Ok(store)
    }

    /// Whether the one-time legacy-import decision has been made for this
    /// store (set on first open whether or not a legacy file was found).
    pub async fn migration_complete(&self) -> bool {
        self.inner.read().await.migrated_from_legacy
    }

    // ------------------------------------------------------------------
    // Pairs
    // ------------------------------------------------------------------

    pub async fn upsert_pair(&self, metadata: PairMetadata) -> Result<(), StoreError> {
        self.mutate(|data| {
            debug!(pair = %metadata.pair_key, "Upserting pair");
            data.pairs.insert(metadata.pair_key.clone(), metadata);
            Ok(())
        })
        .await
    }

    /// Remove a tracked pair. Cascades: the pair is dropped from every
    /// chat's explicit subscription list and its threshold override is
    /// deleted. Returns whether the pair was tracked.
    pub async fn remove_pair(&self, pair_key: &str) -> Result<bool, StoreError> {
        self.mutate(|data| {
            let existed = data.pairs.remove(pair_key).is_some();
            data.pair_overrides.remove(pair_key);
            let mut emptied = Vec::new();
            for (chat_id, pairs) in data.subs_by_chat.iter_mut() {
                pairs.remove(pair_key);
                if pairs.is_empty() {
                    emptied.push(*chat_id);
                }
            }
            for chat_id in emptied {
                data.subs_by_chat.remove(&chat_id);
            }
            Ok(existed)
        })
        .await
    }

    pub async fn get_pair(&self, pair_key: &str) -> Option<PairMetadata> {
        self.inner.read().await.pairs.get(pair_key).cloned()
    }

    pub async fn list_pairs(&self) -> Vec<PairMetadata> {
        self.inner.read().await.pairs.values().cloned().collect()
    }

    pub async fn pair_count(&self) -> usize {
        self.inner.read().await.pairs.len()
    }

    // ------------------------------------------------------------------
    // Thresholds
    // ------------------------------------------------------------------

    pub async fn set_global_thresholds(&self, thresholds: Thresholds) -> Result<(), StoreError> {
        self.mutate(|data| {
            data.global_thresholds = thresholds;
            Ok(())
        })
        .await
    }

    pub async fn global_thresholds(&self) -> Thresholds {
        self.inner.read().await.global_thresholds
    }

    /// Set or clear a per-pair override. Setting an override for an unknown
    /// pair is `NotFound`; clearing is always accepted.
    pub async fn set_pair_threshold_override(
        &self,
        pair_key: &str,
        override_: Option<ThresholdOverride>,
    ) -> Result<(), StoreError> {
        self.mutate(|data| match override_ {
            Some(value) if !value.is_empty() => {
                if !data.pairs.contains_key(pair_key) {
                    return Err(StoreError::NotFound(pair_key.to_string()));
                }
                data.pair_overrides.insert(pair_key.to_string(), value);
                Ok(())
            }
            _ => {
                data.pair_overrides.remove(pair_key);
                Ok(())
            }
        })
        .await
    }

    pub async fn pair_threshold_override(&self, pair_key: &str) -> Option<ThresholdOverride> {
        self.inner.read().await.pair_overrides.get(pair_key).copied()
    }

    /// Effective thresholds for a pair: the override, where present, shadows
    /// the global value field by field.
    pub async fn effective_thresholds(&self, pair_key: &str) -> Thresholds {
        let data = self.inner.read().await;
        match data.pair_overrides.get(pair_key) {
            Some(override_) => override_.apply(data.global_thresholds),
            None => data.global_thresholds,
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe a chat to a pair's updates. Unknown pairs are rejected.
    pub async fn subscribe(&self, chat_id: i64, pair_key: &str) -> Result<(), StoreError> {
        self.mutate(|data| {
            if !data.pairs.contains_key(pair_key) {
                return Err(StoreError::NotFound(pair_key.to_string()));
            }
            data.subs_by_chat
                .entry(chat_id)
                .or_default()
                .insert(pair_key.to_string());
            Ok(())
        })
        .await
    }

    /// Subscribe with a per-chat cap, checked and applied under one write
    /// lock so concurrent subscribes cannot land a chat over the limit.
    /// Returns `false` when the cap would be exceeded; re-subscribing to an
    /// already followed pair always succeeds.
    pub async fn subscribe_capped(
        &self,
        chat_id: i64,
        pair_key: &str,
        max_subs: usize,
    ) -> Result<bool, StoreError> {
        self.mutate(|data| {
            if !data.pairs.contains_key(pair_key) {
                return Err(StoreError::NotFound(pair_key.to_string()));
            }
            let current = data.subs_by_chat.get(&chat_id);
            let already = current.is_some_and(|pairs| pairs.contains(pair_key));
            if !already && current.map_or(0, BTreeSet::len) >= max_subs {
                return Ok(false);
            }
            data.subs_by_chat
                .entry(chat_id)
                .or_default()
                .insert(pair_key.to_string());
            Ok(true)
        })
        .await
    }

    pub async fn unsubscribe(&self, chat_id: i64, pair_key: &str) -> Result<bool, StoreError> {
        self.mutate(|data| {
            let removed = match data.subs_by_chat.get_mut(&chat_id) {
                Some(pairs) => {
                    let removed = pairs.remove(pair_key);
                    if pairs.is_empty() {
                        data.subs_by_chat.remove(&chat_id);
                    }
                    removed
                }
                None => false,
            };
            Ok(removed)
        })
        .await
    }

    pub async fn set_subscribe_all(&self, chat_id: i64, enabled: bool) -> Result<(), StoreError> {
        self.mutate(|data| {
            if enabled {
                data.subs_all.insert(chat_id);
            } else {
                data.subs_all.remove(&chat_id);
            }
            Ok(())
        })
        .await
    }

    /// Chats that should receive an update for `pair_key`: the union of
    /// all-mode chats and explicit subscribers.
    pub async fn subscribers_for(&self, pair_key: &str) -> Vec<i64> {
        let data = self.inner.read().await;
        let mut chats: BTreeSet<i64> = data.subs_all.iter().copied().collect();
        for (chat_id, pairs) in &data.subs_by_chat {
            if pairs.contains(pair_key) {
                chats.insert(*chat_id);
            }
        }
        chats.into_iter().collect()
    }

    pub async fn subscription_for_chat(&self, chat_id: i64) -> ChatSubscription {
        let data = self.inner.read().await;
        ChatSubscription {
            chat_id,
            all: data.subs_all.contains(&chat_id),
            pair_keys: data
                .subs_by_chat
                .get(&chat_id)
                .map(|pairs| pairs.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    // ------------------------------------------------------------------
    // Gas alerts
    // ------------------------------------------------------------------

    /// Arm a gas alert. Alerts are keyed by (chat, network, direction); a
    /// second registration replaces the threshold.
    pub async fn add_gas_alert(&self, alert: GasAlert) -> Result<(), StoreError> {
        self.mutate(|data| {
            data.gas_alerts.retain(|existing| {
                !(existing.chat_id == alert.chat_id
                    && existing.network == alert.network
                    && existing.direction == alert.direction)
            });
            data.gas_alerts.push(alert);
            Ok(())
        })
        .await
    }

    /// Delete a fired alert. Returns whether the alert was still armed; a
    /// `false` result means another task consumed it first and the caller
    /// must not notify.
    pub async fn consume_gas_alert(
        &self,
        chat_id: i64,
        network: &str,
        direction: AlertDirection,
    ) -> Result<bool, StoreError> {
        self.mutate(|data| {
            let before = data.gas_alerts.len();
            data.gas_alerts.retain(|alert| {
                !(alert.chat_id == chat_id
                    && alert.network == network
                    && alert.direction == direction)
            });
            Ok(data.gas_alerts.len() < before)
        })
        .await
    }

    pub async fn list_gas_alerts(&self) -> Vec<GasAlert> {
        self.inner.read().await.gas_alerts.clone()
    }

    pub async fn gas_alerts_for_network(&self, network: &str) -> Vec<GasAlert> {
        self.inner
            .read()
            .await
            .gas_alerts
            .iter()
            .filter(|alert| alert.network == network)
            .cloned()
            .collect()
    }

    pub async fn gas_alerts_for_chat(&self, chat_id: i64) -> Vec<GasAlert> {
        self.inner
            .read()
            .await
            .gas_alerts
            .iter()
            .filter(|alert| alert.chat_id == chat_id)
            .cloned()
            .collect()
    }

    /// Distinct networks referenced by any armed alert. The poller fetches
    /// gas data once per network, never once per alert.
    pub async fn alert_networks(&self) -> Vec<String> {
        let data = self.inner.read().await;
        let networks: BTreeSet<String> = data
            .gas_alerts
            .iter()
            .map(|alert| alert.network.clone())
            .collect();
        networks.into_iter().collect()
    }

    pub async fn clear_gas_alerts_for_chat(&self, chat_id: i64) -> Result<usize, StoreError> {
        self.mutate(|data| {
            let before = data.gas_alerts.len();
            data.gas_alerts.retain(|alert| alert.chat_id != chat_id);
            Ok(before - data.gas_alerts.len())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn settings(&self) -> ArbSettings {
        self.inner.read().await.settings
    }

    pub async fn update_settings(&self, update: SettingsUpdate) -> Result<ArbSettings, StoreError> {
        self.mutate(|data| {
            data.settings = update.apply(data.settings);
            Ok(data.settings)
        })
        .await
    }

    pub async fn reset_settings(&self) -> Result<ArbSettings, StoreError> {
        let baseline = self.baseline_settings;
        self.mutate(move |data| {
            data.settings = baseline;
            Ok(data.settings)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn mutate<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut StoreData) -> Result<T, StoreError>,
    {
        let mut data = self.inner.write().await;
        let out = f(&mut data)?;
        self.persist(&data).await?;
        Ok(out)
    }

    /// Write the snapshot atomically: serialize to a sibling tmp file, then
    /// rename over the canonical path.
    async fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let serialized = serde_json::to_string_pretty(data)?;
        let tmp_path = tmp_path_for(&self.path);
        tokio::fs::write(&tmp_path, serialized.as_bytes()).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            warn!(path = %self.path.display(), "Failed to swap snapshot into place: {e}");
            return Err(e.into());
        }
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
