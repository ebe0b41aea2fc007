// Registry of backend clients, built once from config and read-only after
// construction.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::config::{BackendKind, Config};

use super::client::BackendClient;
use super::{BackendError, BackendErrorKind};

pub struct BackendRegistry {
    clients: HashMap<String, Arc<BackendClient>>,
    primaries: HashMap<BackendKind, String>,
}

impl BackendRegistry {
    pub fn from_config(config: &Config) -> Self {
        let http_client = reqwest::Client::new();
        let clients: HashMap<String, Arc<BackendClient>> = config
            .backends
            .iter()
            .map(|descriptor| {
                (
                    descriptor.key.clone(),
                    Arc::new(BackendClient::new(
                        descriptor,
                        &http_client,
                        config.poller.invoke_timeout,
                    )),
                )
            })
            .collect();

        let mut primaries = HashMap::new();
        primaries.insert(BackendKind::Evm, config.primary_evm.clone());
        if let Some(key) = &config.primary_dex {
            primaries.insert(BackendKind::DexData, key.clone());
        }
        if let Some(key) = &config.primary_price {
            primaries.insert(BackendKind::Price, key.clone());
        }

        Self { clients, primaries }
    }

    pub fn resolve(&self, key: &str) -> Result<Arc<BackendClient>, BackendError> {
        self.clients.get(key).cloned().ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::NotFound,
                key,
                "-",
                "no backend registered under this key",
            )
        })
    }

    /// The designated primary for a kind, fixed at config time.
    pub fn primary(&self, kind: BackendKind) -> Result<Arc<BackendClient>, BackendError> {
        let key = self.primaries.get(&kind).ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::NotFound,
                format!("primary:{kind}"),
                "-",
                "no primary backend configured for this kind",
            )
        })?;
        self.resolve(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.clients.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Eagerly start every stdio backend so the first poll cycle does not
    /// pay spawn latency. A backend that fails to start is logged and left
    /// to lazy respawn.
    pub async fn start_all(&self) {
        let starts = self.clients.values().map(|client| async move {
            if let Err(e) = client.start().await {
                warn!(backend = %client.key(), "Backend failed to start eagerly: {e}");
            } else {
                info!(backend = %client.key(), "Backend ready");
            }
        });
        join_all(starts).await;
    }

    /// Shut every backend down; awaited on every exit path so no subprocess
    /// is orphaned.
    pub async fn shutdown_all(&self) {
        join_all(self.clients.values().map(|client| client.shutdown())).await;
    }
}
