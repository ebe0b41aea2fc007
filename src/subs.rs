// Subscription policy layer over the state store. Holds no state of its
// own; it enforces the configured limits and delegates everything else.

use std::sync::Arc;

use thiserror::Error;

use crate::config::SubscriptionConfig;
use crate::state::{ChatSubscription, StateStore, StoreError};

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("chat {chat_id} already follows {limit} pairs")]
    LimitReached { chat_id: i64, limit: usize },

    #[error("subscribe-all is disabled")]
    AllDisabled,
}

pub struct SubscriptionManager {
    store: Arc<StateStore>,
    policy: SubscriptionConfig,
}

impl SubscriptionManager {
    pub fn new(store: Arc<StateStore>, policy: SubscriptionConfig) -> Self {
        Self { store, policy }
    }

    /// Explicitly follow one pair. Unknown pairs are rejected by the store;
    /// the per-chat cap is checked and applied in a single store mutation so
    /// racing subscribes cannot push a chat over it. Re-subscribing to an
    /// already followed pair never counts against the cap.
    pub async fn subscribe(&self, chat_id: i64, pair_key: &str) -> Result<(), SubscribeError> {
        let accepted = self
            .store
            .subscribe_capped(chat_id, pair_key, self.policy.max_chat_subs)
            .await?;
        if !accepted {
            return Err(SubscribeError::LimitReached {
                chat_id,
                limit: self.policy.max_chat_subs,
            });
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, chat_id: i64, pair_key: &str) -> Result<bool, SubscribeError> {
        Ok(self.store.unsubscribe(chat_id, pair_key).await?)
    }

    /// Toggle firehose mode. The explicit pair list is retained so turning
    /// `all` off restores the previous selection.
    pub async fn set_all(&self, chat_id: i64, enabled: bool) -> Result<(), SubscribeError> {
        if enabled && !self.policy.allow_sub_all {
            return Err(SubscribeError::AllDisabled);
        }
        self.store.set_subscribe_all(chat_id, enabled).await?;
        Ok(())
    }

    pub async fn subscribers_for(&self, pair_key: &str) -> Vec<i64> {
        self.store.subscribers_for(pair_key).await
    }

    pub async fn subscription_for_chat(&self, chat_id: i64) -> ChatSubscription {
        self.store.subscription_for_chat(chat_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ArbSettings, PairMetadata, StoreOptions, Thresholds};
    use chrono::Utc;
    use tempfile::TempDir;

    fn pair(key: &str) -> PairMetadata {
        PairMetadata {
            pair_key: key.to_string(),
            symbols: key.to_uppercase(),
            base_symbol: String::new(),
            quote_symbol: String::new(),
            base_address: None,
            quote_address: None,
            dex_id: None,
            fee_tiers: Vec::new(),
            created_at: Utc::now(),
        }
    }

    async fn manager(dir: &TempDir, policy: SubscriptionConfig) -> SubscriptionManager {
        let store = StateStore::open(StoreOptions {
            path: dir.path().join("state.json"),
            legacy_path: None,
            default_thresholds: Thresholds::default(),
            default_settings: ArbSettings::default(),
        })
        .await
        .unwrap();
        SubscriptionManager::new(Arc::new(store), policy)
    }

    #[tokio::test]
    async fn enforces_per_chat_cap() {
        let dir = TempDir::new().unwrap();
        let manager = manager(
            &dir,
            SubscriptionConfig {
                allow_sub_all: true,
                max_chat_subs: 2,
            },
        )
        .await;
        for key in ["a", "b", "c"] {
            manager.store.upsert_pair(pair(key)).await.unwrap();
        }

        manager.subscribe(7, "a").await.unwrap();
        manager.subscribe(7, "b").await.unwrap();
        assert!(matches!(
            manager.subscribe(7, "c").await.unwrap_err(),
            SubscribeError::LimitReached { limit: 2, .. }
        ));
        // Idempotent re-subscribe at the cap is fine.
        manager.subscribe(7, "a").await.unwrap();
    }

    #[tokio::test]
    async fn sub_all_honors_policy() {
        let dir = TempDir::new().unwrap();
        let manager = manager(
            &dir,
            SubscriptionConfig {
                allow_sub_all: false,
                max_chat_subs: 10,
            },
        )
        .await;
        assert!(matches!(
            manager.set_all(7, true).await.unwrap_err(),
            SubscribeError::AllDisabled
        ));
        // Turning it off is always allowed.
        manager.set_all(7, false).await.unwrap();
    }
}
