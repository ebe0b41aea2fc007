// Line-oriented admin console on stdin. Runs concurrently with the poller
// against the same store; every command is a single store call so the two
// never observe half-applied state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::logbuf::LogBuffer;
use crate::state::{
    PairMetadata, SettingsUpdate, StateStore, StoreError, Thresholds, ThresholdOverride,
};

const HELP: &str = "\
Commands:
  token list
  token add <pair_key> <symbols> [--base-address A] [--quote-address A]
            [--base SYM] [--quote SYM] [--dex ID] [--fee-tiers T1,T2]
  token set-thresholds <pair_key> [--min-liquidity N] [--min-volume N] [--min-txns N]
  token clear-thresholds <pair_key>
  token remove <pair_key>
  settings show
  settings set-global [--min-liquidity N] [--min-volume N] [--min-txns N]
  settings set-mev <bps>
  arb-profile show
  arb-profile set [--min-net-bps N] [--test-size-eur N] [--slippage-cap-bps N] [--mev-bps N]
  arb-profile reset
  log [n]
  help
  quit";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct AdminConsole {
    store: Arc<StateStore>,
    logs: LogBuffer,
    cancel: CancellationToken,
}

impl AdminConsole {
    pub fn new(store: Arc<StateStore>, logs: LogBuffer, cancel: CancellationToken) -> Self {
        Self {
            store,
            logs,
            cancel,
        }
    }

    /// Read commands from stdin until `quit`, EOF, or cancellation.
    pub async fn run(&self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if trimmed == "quit" || trimmed == "exit" {
                        break;
                    }
                    match self.execute(trimmed).await {
                        Ok(output) => println!("{output}"),
                        Err(e) => println!("error: {e}"),
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        info!("Admin console closed, shutting down");
        self.cancel.cancel();
    }

    /// Execute one command line and render its response.
    pub async fn execute(&self, line: &str) -> Result<String, CommandError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["help"] => Ok(HELP.to_string()),
            ["token", rest @ ..] => self.token_command(rest).await,
            ["settings", rest @ ..] => self.settings_command(rest).await,
            ["arb-profile", rest @ ..] => self.profile_command(rest).await,
            ["log", rest @ ..] => self.log_command(rest),
            [other, ..] => Err(CommandError::Unknown(other.to_string())),
            [] => Err(CommandError::Unknown(String::new())),
        }
    }

    async fn token_command(&self, args: &[&str]) -> Result<String, CommandError> {
        match args {
            ["list"] => {
                let pairs = self.store.list_pairs().await;
                if pairs.is_empty() {
                    return Ok("no pairs tracked".to_string());
                }
                let mut out = Vec::with_capacity(pairs.len());
                for pair in pairs {
                    let marker = match self.store.pair_threshold_override(&pair.pair_key).await {
                        Some(_) => " [custom thresholds]",
                        None => "",
                    };
                    out.push(format!("{} ({}){}", pair.pair_key, pair.symbols, marker));
                }
                Ok(out.join("\n"))
            }
            ["add", pair_key, symbols, flags @ ..] => {
                let flags = parse_flags(flags)?;
                let metadata = PairMetadata {
                    pair_key: pair_key.to_string(),
                    symbols: symbols.to_string(),
                    base_symbol: flags
                        .get("base")
                        .cloned()
                        .unwrap_or_else(|| first_symbol(symbols)),
                    quote_symbol: flags
                        .get("quote")
                        .cloned()
                        .unwrap_or_else(|| second_symbol(symbols)),
                    base_address: flags.get("base-address").cloned(),
                    quote_address: flags.get("quote-address").cloned(),
                    dex_id: flags.get("dex").cloned(),
                    fee_tiers: flags
                        .get("fee-tiers")
                        .map(|raw| raw.split(',').map(str::to_string).collect())
                        .unwrap_or_default(),
                    created_at: Utc::now(),
                };
                self.store.upsert_pair(metadata).await?;
                Ok(format!("tracking {pair_key}"))
            }
            ["set-thresholds", pair_key, flags @ ..] => {
                let flags = parse_flags(flags)?;
                let override_ = ThresholdOverride {
                    min_liquidity_usd: parse_flag_f64(&flags, "min-liquidity")?,
                    min_volume_24h_usd: parse_flag_f64(&flags, "min-volume")?,
                    min_txns_24h: parse_flag_u32(&flags, "min-txns")?,
                };
                if override_.is_empty() {
                    return Err(CommandError::Usage(
                        "token set-thresholds <pair_key> needs at least one --min-* flag".to_string(),
                    ));
                }
                self.store
                    .set_pair_threshold_override(pair_key, Some(override_))
                    .await?;
                Ok(format!("thresholds overridden for {pair_key}"))
            }
            ["clear-thresholds", pair_key] => {
                self.store.set_pair_threshold_override(pair_key, None).await?;
                Ok(format!("thresholds cleared for {pair_key}"))
            }
            ["remove", pair_key] => {
                if self.store.remove_pair(pair_key).await? {
                    Ok(format!("removed {pair_key} and its subscriptions"))
                } else {
                    Ok(format!("{pair_key} was not tracked"))
                }
            }
            _ => Err(CommandError::Usage(
                "token list|add|set-thresholds|clear-thresholds|remove".to_string(),
            )),
        }
    }

    async fn settings_command(&self, args: &[&str]) -> Result<String, CommandError> {
        match args {
            ["show"] => {
                let thresholds = self.store.global_thresholds().await;
                let settings = self.store.settings().await;
                Ok(format!(
                    "global thresholds: min_liquidity_usd={:.0} min_volume_24h_usd={:.0} min_txns_24h={}\n\
                     mev buffer: {:.1} bps",
                    thresholds.min_liquidity_usd,
                    thresholds.min_volume_24h_usd,
                    thresholds.min_txns_24h,
                    settings.mev_bps
                ))
            }
            ["set-global", flags @ ..] => {
                let flags = parse_flags(flags)?;
                let current = self.store.global_thresholds().await;
                let updated = Thresholds {
                    min_liquidity_usd: parse_flag_f64(&flags, "min-liquidity")?
                        .unwrap_or(current.min_liquidity_usd),
                    min_volume_24h_usd: parse_flag_f64(&flags, "min-volume")?
                        .unwrap_or(current.min_volume_24h_usd),
                    min_txns_24h: parse_flag_u32(&flags, "min-txns")?
                        .unwrap_or(current.min_txns_24h),
                };
                self.store.set_global_thresholds(updated).await?;
                Ok("global thresholds updated".to_string())
            }
            ["set-mev", bps] => {
                let mev: f64 = bps.parse().map_err(|_| {
                    CommandError::Usage("settings set-mev <bps> takes a number".to_string())
                })?;
                self.store
                    .update_settings(SettingsUpdate {
                        mev_bps: Some(mev),
                        ..Default::default()
                    })
                    .await?;
                Ok(format!("mev buffer set to {mev:.1} bps"))
            }
            _ => Err(CommandError::Usage(
                "settings show|set-global|set-mev".to_string(),
            )),
        }
    }

    async fn profile_command(&self, args: &[&str]) -> Result<String, CommandError> {
        match args {
            ["show"] => {
                let settings = self.store.settings().await;
                Ok(format!(
                    "min_net_bps={:.1} test_size_eur={:.0} slippage_cap_bps={:.1} mev_bps={:.1}",
                    settings.min_net_bps,
                    settings.test_size_eur,
                    settings.slippage_cap_bps,
                    settings.mev_bps
                ))
            }
            ["set", flags @ ..] => {
                let flags = parse_flags(flags)?;
                let update = SettingsUpdate {
                    min_net_bps: parse_flag_f64(&flags, "min-net-bps")?,
                    test_size_eur: parse_flag_f64(&flags, "test-size-eur")?,
                    slippage_cap_bps: parse_flag_f64(&flags, "slippage-cap-bps")?,
                    mev_bps: parse_flag_f64(&flags, "mev-bps")?,
                };
                if update.is_empty() {
                    return Err(CommandError::Usage(
                        "arb-profile set needs at least one flag".to_string(),
                    ));
                }
                let settings = self.store.update_settings(update).await?;
                Ok(format!(
                    "profile updated: min_net_bps={:.1} test_size_eur={:.0} slippage_cap_bps={:.1} mev_bps={:.1}",
                    settings.min_net_bps,
                    settings.test_size_eur,
                    settings.slippage_cap_bps,
                    settings.mev_bps
                ))
            }
            ["reset"] => {
                self.store.reset_settings().await?;
                Ok("profile reset to defaults".to_string())
            }
            _ => Err(CommandError::Usage("arb-profile show|set|reset".to_string())),
        }
    }

    fn log_command(&self, args: &[&str]) -> Result<String, CommandError> {
        let count = match args {
            [] => 20,
            [n] => n.parse().map_err(|_| {
                CommandError::Usage("log [n] takes a line count".to_string())
            })?,
            _ => return Err(CommandError::Usage("log [n]".to_string())),
        };
        let lines = self.logs.tail(count);
        if lines.is_empty() {
            Ok("log buffer is empty".to_string())
        } else {
            Ok(lines.join("\n"))
        }
    }
}

/// Parse `--flag value` pairs.
fn parse_flags(args: &[&str]) -> Result<HashMap<String, String>, CommandError> {
    let mut flags = HashMap::new();
    let mut iter = args.iter();
    while let Some(token) = iter.next() {
        let name = token.strip_prefix("--").ok_or_else(|| {
            CommandError::Usage(format!("expected a --flag, got '{token}'"))
        })?;
        let value = iter.next().ok_or_else(|| {
            CommandError::Usage(format!("--{name} needs a value"))
        })?;
        flags.insert(name.to_string(), value.to_string());
    }
    Ok(flags)
}

fn parse_flag_f64(
    flags: &HashMap<String, String>,
    name: &str,
) -> Result<Option<f64>, CommandError> {
    flags
        .get(name)
        .map(|raw| {
            raw.parse().map_err(|_| {
                CommandError::Usage(format!("--{name} takes a number, got '{raw}'"))
            })
        })
        .transpose()
}

fn parse_flag_u32(
    flags: &HashMap<String, String>,
    name: &str,
) -> Result<Option<u32>, CommandError> {
    flags
        .get(name)
        .map(|raw| {
            raw.parse().map_err(|_| {
                CommandError::Usage(format!("--{name} takes an integer, got '{raw}'"))
            })
        })
        .transpose()
}

fn first_symbol(symbols: &str) -> String {
    symbols.split('/').next().unwrap_or(symbols).to_string()
}

fn second_symbol(symbols: &str) -> String {
    symbols.split('/').nth(1).unwrap_or_default().to_string()
}
