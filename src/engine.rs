// Background poller: evaluates armed gas alerts and broadcasts pair health
// updates to subscribed chats on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::market::{meets_thresholds, MarketData, PairSnapshot};
use crate::notify::Notifier;
use crate::state::{PairMetadata, StateStore, StoreError};

pub struct AlertEngine<M, N> {
    store: Arc<StateStore>,
    market: M,
    notifier: N,
    interval: Duration,
}

impl<M: MarketData, N: Notifier> AlertEngine<M, N> {
    pub fn new(store: Arc<StateStore>, market: M, notifier: N, interval: Duration) -> Self {
        Self {
            store,
            market,
            notifier,
            interval,
        }
    }

    /// Poll until cancelled. A failed cycle is logged and the next tick
    /// proceeds; only store persistence failures surface here.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "Poller started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!("Poll cycle aborted: {e}");
                    }
                }
            }
        }
        info!("Poller stopped");
    }

    /// One full evaluation pass: gas alerts first, then pair broadcasts.
    pub async fn run_cycle(&self) -> Result<(), StoreError> {
        self.evaluate_gas_alerts().await?;
        self.broadcast_pair_updates().await?;
        Ok(())
    }

    /// Fetch gas once per distinct network, then test every armed alert of
    /// that network against the fast tier. A triggered alert is consumed
    /// from the store before its notification is emitted, so a crash between
    /// the two steps drops a message rather than duplicating one.
    async fn evaluate_gas_alerts(&self) -> Result<(), StoreError> {
        for network in self.store.alert_networks().await {
            let stats = match self.market.gas_stats(&network).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(network = %network, "Skipping gas alerts this cycle: {e}");
                    continue;
                }
            };
            for alert in self.store.gas_alerts_for_network(&network).await {
                if !alert.triggers(stats.fast) {
                    continue;
                }
                let consumed = self
                    .store
                    .consume_gas_alert(alert.chat_id, &alert.network, alert.direction)
                    .await?;
                if !consumed {
                    continue;
                }
                info!(chat_id = alert.chat_id, network = %network, "Gas alert fired");
                self.notifier.notify(
                    alert.chat_id,
                    format!(
                        "Gas alert: {} (now {:.2} gwei). This alert has been removed.",
                        alert.describe(),
                        stats.fast
                    ),
                );
            }
        }
        Ok(())
    }

    /// Snapshot every pair someone follows, gate on effective thresholds,
    /// and fan eligible updates out to the union of subscribers. One pair's
    /// failure never blocks the rest.
    async fn broadcast_pair_updates(&self) -> Result<(), StoreError> {
        for pair in self.store.list_pairs().await {
            let subscribers = self.store.subscribers_for(&pair.pair_key).await;
            if subscribers.is_empty() {
                continue;
            }
            let snapshot = match self.market.pair_snapshot(&pair).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(pair = %pair.pair_key, "Skipping pair update this cycle: {e}");
                    continue;
                }
            };
            let thresholds = self.store.effective_thresholds(&pair.pair_key).await;
            if !meets_thresholds(&snapshot, &thresholds) {
                debug!(
                    pair = %pair.pair_key,
                    liquidity = snapshot.liquidity_usd,
                    volume = snapshot.volume_24h_usd,
                    txns = snapshot.txns_24h,
                    "Update suppressed below thresholds"
                );
                continue;
            }
            let text = format_pair_update(&pair, &snapshot);
            for chat_id in subscribers {
                self.notifier.notify(chat_id, text.clone());
            }
        }
        Ok(())
    }
}

fn format_pair_update(pair: &PairMetadata, snapshot: &PairSnapshot) -> String {
    format!(
        "{}: price ${:.4}, liquidity ${:.0}, 24h volume ${:.0}, 24h txns {}",
        pair.symbols,
        snapshot.price_usd,
        snapshot.liquidity_usd,
        snapshot.volume_24h_usd,
        snapshot.txns_24h
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendErrorKind};
    use crate::market::GasStats;
    use crate::notify::testing::RecordingNotifier;
    use crate::state::{
        AlertDirection, ArbSettings, GasAlert, StoreOptions, Thresholds, ThresholdOverride,
    };
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct StubMarket {
        fast_by_network: Mutex<HashMap<String, f64>>,
        snapshots: Mutex<HashMap<String, PairSnapshot>>,
    }

    impl StubMarket {
        fn new() -> Self {
            Self {
                fast_by_network: Mutex::new(HashMap::new()),
                snapshots: Mutex::new(HashMap::new()),
            }
        }

        fn set_fast(&self, network: &str, fast: f64) {
            self.fast_by_network
                .lock()
                .unwrap()
                .insert(network.to_string(), fast);
        }

        fn set_snapshot(&self, snapshot: PairSnapshot) {
            self.snapshots
                .lock()
                .unwrap()
                .insert(snapshot.pair_key.clone(), snapshot);
        }
    }

    impl MarketData for StubMarket {
        async fn gas_stats(&self, network: &str) -> Result<GasStats, BackendError> {
            let fast = self
                .fast_by_network
                .lock()
                .unwrap()
                .get(network)
                .copied()
                .ok_or_else(|| {
                    BackendError::new(BackendErrorKind::Transport, "stub", "gas", "down")
                })?;
            Ok(GasStats {
                safe: fast * 0.8,
                standard: fast * 0.9,
                fast,
                base_fee: fast * 0.7,
                block_lag_seconds: 2.0,
            })
        }

        async fn pair_snapshot(&self, pair: &PairMetadata) -> Result<PairSnapshot, BackendError> {
            self.snapshots
                .lock()
                .unwrap()
                .get(&pair.pair_key)
                .cloned()
                .ok_or_else(|| {
                    BackendError::new(BackendErrorKind::Transport, "stub", "pairs", "down")
                })
        }
    }

    fn pair(key: &str) -> PairMetadata {
        PairMetadata {
            pair_key: key.to_string(),
            symbols: "WETH/USDC".to_string(),
            base_symbol: "WETH".to_string(),
            quote_symbol: "USDC".to_string(),
            base_address: Some("0x4200".to_string()),
            quote_address: None,
            dex_id: None,
            fee_tiers: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn snapshot(key: &str, liquidity: f64) -> PairSnapshot {
        PairSnapshot {
            pair_key: key.to_string(),
            price_usd: 3000.0,
            liquidity_usd: liquidity,
            volume_24h_usd: 150_000.0,
            txns_24h: 80,
        }
    }

    async fn engine(
        dir: &TempDir,
    ) -> AlertEngine<StubMarket, Arc<RecordingNotifier>> {
        let store = StateStore::open(StoreOptions {
            path: dir.path().join("state.json"),
            legacy_path: None,
            default_thresholds: Thresholds::default(),
            default_settings: ArbSettings::default(),
        })
        .await
        .unwrap();
        AlertEngine::new(
            Arc::new(store),
            StubMarket::new(),
            Arc::new(RecordingNotifier::default()),
            Duration::from_secs(60),
        )
    }

    impl<M: MarketData> AlertEngine<M, Arc<RecordingNotifier>> {
        fn sent(&self) -> Vec<(i64, String)> {
            self.notifier.sent.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn below_alert_fires_once_and_disarms() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        engine
            .store
            .add_gas_alert(GasAlert {
                chat_id: 42,
                network: "base".to_string(),
                direction: AlertDirection::Below,
                threshold: 20.0,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        engine.market.set_fast("base", 18.0);

        engine.run_cycle().await.unwrap();
        let sent = engine.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 42);
        assert!(engine.store.gas_alerts_for_chat(42).await.is_empty());

        // Condition still true on the next cycle, but the alert is gone.
        engine.run_cycle().await.unwrap();
        assert_eq!(engine.sent().len(), 1);
    }

    #[tokio::test]
    async fn below_alert_stays_armed_above_threshold() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        engine
            .store
            .add_gas_alert(GasAlert {
                chat_id: 42,
                network: "base".to_string(),
                direction: AlertDirection::Below,
                threshold: 20.0,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        engine.market.set_fast("base", 25.0);

        engine.run_cycle().await.unwrap();
        assert!(engine.sent().is_empty());
        assert_eq!(engine.store.gas_alerts_for_chat(42).await.len(), 1);
    }

    #[tokio::test]
    async fn gas_failure_on_one_network_isolates_others() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        for network in ["base", "optimism"] {
            engine
                .store
                .add_gas_alert(GasAlert {
                    chat_id: 42,
                    network: network.to_string(),
                    direction: AlertDirection::Below,
                    threshold: 20.0,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        // "base" has no stub data, so its fetch fails; "optimism" still fires.
        engine.market.set_fast("optimism", 10.0);

        engine.run_cycle().await.unwrap();
        assert_eq!(engine.sent().len(), 1);
        assert_eq!(engine.store.gas_alerts_for_chat(42).await.len(), 1);
        assert_eq!(
            engine.store.gas_alerts_for_chat(42).await[0].network,
            "base"
        );
    }

    #[tokio::test]
    async fn broadcast_gated_by_effective_thresholds() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        engine.store.upsert_pair(pair("base:weth/usdc")).await.unwrap();
        engine.store.subscribe(7, "base:weth/usdc").await.unwrap();

        // Liquidity 60k clears the 50k default floor.
        engine
            .market
            .set_snapshot(snapshot("base:weth/usdc", 60_000.0));
        engine.run_cycle().await.unwrap();
        assert_eq!(engine.sent().len(), 1);

        // 40k is suppressed, but the subscription survives.
        engine
            .market
            .set_snapshot(snapshot("base:weth/usdc", 40_000.0));
        engine.run_cycle().await.unwrap();
        assert_eq!(engine.sent().len(), 1);
        assert_eq!(engine.store.subscribers_for("base:weth/usdc").await, vec![7]);

        // An override lowering the floor lets it through again.
        engine
            .store
            .set_pair_threshold_override(
                "base:weth/usdc",
                Some(ThresholdOverride {
                    min_liquidity_usd: Some(10_000.0),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        engine.run_cycle().await.unwrap();
        assert_eq!(engine.sent().len(), 2);
    }

    #[tokio::test]
    async fn all_mode_chat_receives_every_eligible_pair() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        engine.store.set_subscribe_all(99, true).await.unwrap();
        engine.store.upsert_pair(pair("base:weth/usdc")).await.unwrap();
        engine
            .market
            .set_snapshot(snapshot("base:weth/usdc", 60_000.0));

        engine.run_cycle().await.unwrap();
        assert_eq!(engine.sent().len(), 1);
        assert_eq!(engine.sent()[0].0, 99);

        // A pair added later is covered without re-subscribing.
        engine.store.upsert_pair(pair("base:aero/usdc")).await.unwrap();
        engine
            .market
            .set_snapshot(snapshot("base:aero/usdc", 70_000.0));
        engine.run_cycle().await.unwrap();
        assert_eq!(engine.sent().len(), 3);
    }
}
