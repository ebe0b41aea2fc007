// Market data access for the poller: gas tiers from the primary EVM backend
// and pair snapshots from the DEX-data backend.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use crate::backend::{BackendClient, BackendError, BackendErrorKind};
use crate::config::BackendProtocol;
use crate::state::{PairMetadata, Thresholds};

const WEI_PER_GWEI: f64 = 1_000_000_000.0;

/// Suggested gas tiers in gwei, plus the raw base fee and the freshness of
/// the block they were derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasStats {
    pub safe: f64,
    pub standard: f64,
    pub fast: f64,
    pub base_fee: f64,
    pub block_lag_seconds: f64,
}

/// Health snapshot of one tracked pair at its deepest eligible venue.
#[derive(Debug, Clone, PartialEq)]
pub struct PairSnapshot {
    pub pair_key: String,
    pub price_usd: f64,
    pub liquidity_usd: f64,
    pub volume_24h_usd: f64,
    pub txns_24h: u32,
}

/// Broadcast eligibility gate: every floor must be met.
pub fn meets_thresholds(snapshot: &PairSnapshot, thresholds: &Thresholds) -> bool {
    snapshot.liquidity_usd >= thresholds.min_liquidity_usd
        && snapshot.volume_24h_usd >= thresholds.min_volume_24h_usd
        && snapshot.txns_24h >= thresholds.min_txns_24h
}

/// The poller's data seam. Production uses `MarketDataFetcher`; tests stub
/// this trait.
pub trait MarketData: Send + Sync {
    fn gas_stats(
        &self,
        network: &str,
    ) -> impl std::future::Future<Output = Result<GasStats, BackendError>> + Send;

    fn pair_snapshot(
        &self,
        pair: &PairMetadata,
    ) -> impl std::future::Future<Output = Result<PairSnapshot, BackendError>> + Send;
}

impl<M: MarketData + ?Sized> MarketData for Arc<M> {
    async fn gas_stats(&self, network: &str) -> Result<GasStats, BackendError> {
        (**self).gas_stats(network).await
    }

    async fn pair_snapshot(&self, pair: &PairMetadata) -> Result<PairSnapshot, BackendError> {
        (**self).pair_snapshot(pair).await
    }
}

pub struct MarketDataFetcher {
    evm: Arc<BackendClient>,
    dex: Option<Arc<BackendClient>>,
}

impl MarketDataFetcher {
    pub fn new(evm: Arc<BackendClient>, dex: Option<Arc<BackendClient>>) -> Self {
        Self { evm, dex }
    }

    /// Gas tiers from a stdio tool backend: heuristic multiples of the
    /// latest base fee.
    async fn gas_stats_tool(&self, network: &str) -> Result<GasStats, BackendError> {
        let block = self
            .evm
            .invoke("get_latest_block", json!({"network": network}))
            .await?;
        let base_fee = hex_field_gwei(&self.evm, &block, "baseFeePerGas")?;
        Ok(GasStats {
            safe: base_fee * 1.05,
            standard: base_fee * 1.15,
            fast: base_fee * 1.25,
            base_fee,
            block_lag_seconds: block_lag(&block),
        })
    }

    /// Gas tiers from a raw JSON-RPC node: anchored on eth_gasPrice.
    async fn gas_stats_rpc(&self) -> Result<GasStats, BackendError> {
        let price_hex = self.evm.invoke("eth_gasPrice", json!([])).await?;
        let price = hex_value_gwei(&self.evm, &price_hex, "eth_gasPrice")?;
        let block = self
            .evm
            .invoke("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        let base_fee = hex_field_gwei(&self.evm, &block, "baseFeePerGas")?;
        Ok(GasStats {
            safe: base_fee.max(price * 0.9),
            standard: price,
            fast: price * 1.1,
            base_fee,
            block_lag_seconds: block_lag(&block),
        })
    }
}

impl MarketData for MarketDataFetcher {
    async fn gas_stats(&self, network: &str) -> Result<GasStats, BackendError> {
        match self.evm.protocol() {
            BackendProtocol::StdioRpc => self.gas_stats_tool(network).await,
            BackendProtocol::HttpRpc => self.gas_stats_rpc().await,
        }
    }

    async fn pair_snapshot(&self, pair: &PairMetadata) -> Result<PairSnapshot, BackendError> {
        let dex = self.dex.as_ref().ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::NotFound,
                "primary:dex_data",
                "get_pairs_by_token",
                "no DEX-data backend configured",
            )
        })?;
        let base_address = pair.base_address.as_deref().ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::Protocol,
                dex.key(),
                "get_pairs_by_token",
                format!("pair '{}' has no base token address", pair.pair_key),
            )
        })?;

        let payload = dex
            .invoke("get_pairs_by_token", json!({"tokenAddress": base_address}))
            .await?;
        let rows = payload
            .get("pairs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // Among venues trading the right quote token (and dex, when pinned),
        // report the deepest one.
        let mut best: Option<PairSnapshot> = None;
        for row in &rows {
            if !venue_matches(row, pair) {
                continue;
            }
            let price_usd = safe_float(row.get("priceUsd"));
            if price_usd <= 0.0 {
                continue;
            }
            let snapshot = PairSnapshot {
                pair_key: pair.pair_key.clone(),
                price_usd,
                liquidity_usd: safe_float(row.get("liquidity").and_then(|l| l.get("usd"))),
                volume_24h_usd: safe_float(row.get("volume").and_then(|v| v.get("h24"))),
                txns_24h: extract_txns_24h(row.get("txns")),
            };
            if best
                .as_ref()
                .map(|b| snapshot.liquidity_usd > b.liquidity_usd)
                .unwrap_or(true)
            {
                best = Some(snapshot);
            }
        }

        best.ok_or_else(|| {
            debug!(pair = %pair.pair_key, venues = rows.len(), "No eligible venue rows");
            BackendError::new(
                BackendErrorKind::Protocol,
                dex.key(),
                "get_pairs_by_token",
                format!("no venue with usable price data for '{}'", pair.pair_key),
            )
        })
    }
}

fn venue_matches(row: &Value, pair: &PairMetadata) -> bool {
    if let Some(expected) = pair.quote_address.as_deref() {
        let quote = row
            .get("quoteToken")
            .and_then(|q| q.get("address"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if !quote.eq_ignore_ascii_case(expected) {
            return false;
        }
    }
    if let Some(dex_id) = pair.dex_id.as_deref() {
        let row_dex = row.get("dexId").and_then(Value::as_str).unwrap_or("");
        if !row_dex.eq_ignore_ascii_case(dex_id) {
            return false;
        }
    }
    true
}

/// Tolerant float extraction: numbers or numeric strings, anything else 0.
fn safe_float(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    };
    if parsed.is_finite() {
        parsed
    } else {
        0.0
    }
}

/// The 24h transaction count comes in two shapes: `{"total": n}` or
/// `{"buys": a, "sells": b}`.
fn extract_txns_24h(txns: Option<&Value>) -> u32 {
    let Some(h24) = txns.and_then(|t| t.get("h24")) else {
        return 0;
    };
    let total = safe_float(h24.get("total"));
    if total > 0.0 {
        return total as u32;
    }
    let aggregate = safe_float(h24.get("buys")) + safe_float(h24.get("sells"));
    if aggregate > 0.0 {
        aggregate as u32
    } else {
        safe_float(Some(h24)).max(0.0) as u32
    }
}

fn parse_hex_quantity(raw: &str) -> Option<u128> {
    u128::from_str_radix(raw.trim().trim_start_matches("0x"), 16).ok()
}

fn hex_field_gwei(
    client: &BackendClient,
    block: &Value,
    field: &str,
) -> Result<f64, BackendError> {
    let raw = block.get(field).and_then(Value::as_str).unwrap_or("0x0");
    let wei = parse_hex_quantity(raw).ok_or_else(|| {
        BackendError::new(
            BackendErrorKind::Protocol,
            client.key(),
            field,
            format!("'{raw}' is not a hex quantity"),
        )
    })?;
    Ok(wei as f64 / WEI_PER_GWEI)
}

fn hex_value_gwei(
    client: &BackendClient,
    value: &Value,
    context: &str,
) -> Result<f64, BackendError> {
    let raw = value.as_str().ok_or_else(|| {
        BackendError::new(
            BackendErrorKind::Protocol,
            client.key(),
            context,
            format!("expected hex string, got {value}"),
        )
    })?;
    let wei = parse_hex_quantity(raw).ok_or_else(|| {
        BackendError::new(
            BackendErrorKind::Protocol,
            client.key(),
            context,
            format!("'{raw}' is not a hex quantity"),
        )
    })?;
    Ok(wei as f64 / WEI_PER_GWEI)
}

fn block_lag(block: &Value) -> f64 {
    let timestamp = block
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_hex_quantity)
        .unwrap_or(0);
    if timestamp == 0 {
        return 0.0;
    }
    (Utc::now().timestamp() as f64 - timestamp as f64).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(liquidity: f64, volume: f64, txns: u32) -> PairSnapshot {
        PairSnapshot {
            pair_key: "base:weth/usdc".to_string(),
            price_usd: 3000.0,
            liquidity_usd: liquidity,
            volume_24h_usd: volume,
            txns_24h: txns,
        }
    }

    #[test]
    fn threshold_gate_requires_every_floor() {
        let thresholds = Thresholds {
            min_liquidity_usd: 50_000.0,
            min_volume_24h_usd: 100_000.0,
            min_txns_24h: 50,
        };
        assert!(meets_thresholds(&snapshot(60_000.0, 150_000.0, 80), &thresholds));
        assert!(!meets_thresholds(&snapshot(40_000.0, 150_000.0, 80), &thresholds));
        assert!(!meets_thresholds(&snapshot(60_000.0, 90_000.0, 80), &thresholds));
        assert!(!meets_thresholds(&snapshot(60_000.0, 150_000.0, 10), &thresholds));
    }

    #[test]
    fn hex_quantities_parse_with_and_without_prefix() {
        assert_eq!(parse_hex_quantity("0x3b9aca00"), Some(1_000_000_000));
        assert_eq!(parse_hex_quantity("3b9aca00"), Some(1_000_000_000));
        assert_eq!(parse_hex_quantity("0xzz"), None);
    }

    #[test]
    fn txns_shapes_total_and_buys_sells() {
        assert_eq!(
            extract_txns_24h(Some(&serde_json::json!({"h24": {"total": 120}}))),
            120
        );
        assert_eq!(
            extract_txns_24h(Some(&serde_json::json!({"h24": {"buys": 70, "sells": 40}}))),
            110
        );
        assert_eq!(extract_txns_24h(Some(&serde_json::json!({"h24": 35}))), 35);
        assert_eq!(extract_txns_24h(None), 0);
    }

    #[test]
    fn safe_float_tolerates_strings_and_garbage() {
        assert_eq!(safe_float(Some(&serde_json::json!("123.5"))), 123.5);
        assert_eq!(safe_float(Some(&serde_json::json!(42))), 42.0);
        assert_eq!(safe_float(Some(&serde_json::json!("wat"))), 0.0);
        assert_eq!(safe_float(None), 0.0);
    }
}
