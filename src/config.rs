use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::state::{ArbSettings, Thresholds};

/// Configuration errors. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse {key}: {message}")]
    InvalidEnv { key: String, message: String },

    #[error("BACKENDS is not valid JSON: {0}")]
    InvalidBackends(String),

    #[error("duplicate backend key '{0}'")]
    DuplicateKey(String),

    #[error("stdio backend '{0}' has no command")]
    MissingCommand(String),

    #[error("http backend '{0}' has no base_url")]
    MissingBaseUrl(String),

    #[error("no EVM backend configured")]
    NoEvmBackend,

    #[error("multiple {kind} backends configured, set {env} to pick a primary")]
    NoPrimaryConfigured { kind: String, env: String },

    #[error("{env} references unknown backend '{key}'")]
    UnknownPrimary { env: String, key: String },
}

/// Functional role of a backend. Drives primary selection and which tools
/// the fetcher calls against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Evm,
    DexData,
    Price,
    #[serde(other)]
    Other,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Evm => write!(f, "evm"),
            BackendKind::DexData => write!(f, "dex_data"),
            BackendKind::Price => write!(f, "price"),
            BackendKind::Other => write!(f, "other"),
        }
    }
}

/// Wire protocol a backend speaks. Closed set; selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendProtocol {
    StdioRpc,
    HttpRpc,
}

/// Subprocess command, accepted either as a whitespace-split string or an
/// argv array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    fn into_argv(self) -> Vec<String> {
        match self {
            CommandSpec::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            CommandSpec::Argv(argv) => argv,
        }
    }
}

/// One backend as declared in the BACKENDS JSON list.
#[derive(Debug, Clone, Deserialize)]
struct RawBackend {
    key: String,
    #[serde(default = "default_kind")]
    kind: BackendKind,
    protocol: BackendProtocol,
    #[serde(default)]
    command: Option<CommandSpec>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
}

fn default_kind() -> BackendKind {
    BackendKind::Other
}

/// BACKENDS accepts either a bare list or a `{"servers": [...]}` wrapper.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBackends {
    List(Vec<RawBackend>),
    Wrapped { servers: Vec<RawBackend> },
}

/// Validated backend descriptor handed to the registry.
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub key: String,
    pub kind: BackendKind,
    pub protocol: BackendProtocol,
    pub command: Vec<String>,
    pub base_url: Option<String>,
    pub network: Option<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Poller behavior knobs.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub invoke_timeout: Duration,
}

/// Subscription policy knobs.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub allow_sub_all: bool,
    pub max_chat_subs: usize,
}

/// Main configuration struct for the gateway process.
#[derive(Debug, Clone)]
pub struct Config {
    pub backends: Vec<BackendDescriptor>,
    pub primary_evm: String,
    pub primary_dex: Option<String>,
    pub primary_price: Option<String>,
    pub poller: PollerConfig,
    pub subscriptions: SubscriptionConfig,
    pub default_thresholds: Thresholds,
    pub default_settings: ArbSettings,
    pub store_path: PathBuf,
    pub legacy_state_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let backends = match std::env::var("BACKENDS") {
            Ok(raw) => parse_backends(&raw)?,
            Err(_) => build_legacy_backends()?,
        };
        if backends.is_empty() {
            return Err(ConfigError::NoEvmBackend);
        }

        let primary_evm = resolve_primary(&backends, BackendKind::Evm, "PRIMARY_EVM")?
            .ok_or(ConfigError::NoEvmBackend)?;
        let primary_dex = resolve_primary(&backends, BackendKind::DexData, "PRIMARY_DEX")?;
        let primary_price = resolve_primary(&backends, BackendKind::Price, "PRIMARY_PRICE")?;

        let poller = PollerConfig {
            interval: Duration::from_secs(get_u64_env("POLL_INTERVAL_SECS", 60)?),
            invoke_timeout: Duration::from_secs(get_u64_env("INVOKE_TIMEOUT_SECS", 10)?),
        };

        let subscriptions = SubscriptionConfig {
            allow_sub_all: get_bool_env("ALLOW_SUB_ALL", true),
            max_chat_subs: get_u64_env("MAX_CHAT_SUBS", 10)? as usize,
        };

        let default_thresholds = Thresholds {
            min_liquidity_usd: get_f64_env("MIN_LIQUIDITY_USD", 50_000.0)?,
            min_volume_24h_usd: get_f64_env("MIN_VOLUME_24H_USD", 100_000.0)?,
            min_txns_24h: get_u64_env("MIN_TXNS_24H", 50)? as u32,
        };

        let default_settings = ArbSettings {
            min_net_bps: get_f64_env("ARB_MIN_NET_BPS", 20.0)?,
            test_size_eur: get_f64_env("ARB_TEST_SIZE_EUR", 500.0)?,
            slippage_cap_bps: get_f64_env("ARB_SLIPPAGE_CAP_BPS", 150.0)?,
            mev_bps: get_f64_env("ARB_MEV_BPS", 10.0)?,
        };

        Ok(Config {
            backends,
            primary_evm,
            primary_dex,
            primary_price,
            poller,
            subscriptions,
            default_thresholds,
            default_settings,
            store_path: PathBuf::from(get_env_or_default(
                "STORE_PATH",
                "data/chaingate_state.json",
            )),
            legacy_state_path: PathBuf::from(get_env_or_default(
                "LEGACY_STATE_PATH",
                "data/state_legacy.json",
            )),
        })
    }
}

fn parse_backends(raw: &str) -> Result<Vec<BackendDescriptor>, ConfigError> {
    let parsed: RawBackends =
        serde_json::from_str(raw).map_err(|e| ConfigError::InvalidBackends(e.to_string()))?;
    let raw_backends = match parsed {
        RawBackends::List(list) => list,
        RawBackends::Wrapped { servers } => servers,
    };

    let mut backends = Vec::with_capacity(raw_backends.len());
    for raw in raw_backends {
        let command = raw.command.map(CommandSpec::into_argv).unwrap_or_default();
        match raw.protocol {
            BackendProtocol::StdioRpc if command.is_empty() => {
                return Err(ConfigError::MissingCommand(raw.key));
            }
            BackendProtocol::HttpRpc if raw.base_url.is_none() => {
                return Err(ConfigError::MissingBaseUrl(raw.key));
            }
            _ => {}
        }
        if backends
            .iter()
            .any(|existing: &BackendDescriptor| existing.key == raw.key)
        {
            return Err(ConfigError::DuplicateKey(raw.key));
        }
        backends.push(BackendDescriptor {
            key: raw.key,
            kind: raw.kind,
            protocol: raw.protocol,
            command,
            base_url: raw.base_url,
            network: raw.network,
            env: raw.env,
            cwd: raw.cwd.map(PathBuf::from),
        });
    }
    Ok(backends)
}

/// Build descriptors from the single-backend env vars used before BACKENDS
/// existed. EVM_BACKEND_COMMAND takes precedence over EVM_RPC_URL.
fn build_legacy_backends() -> Result<Vec<BackendDescriptor>, ConfigError> {
    let network = std::env::var("EVM_NETWORK").ok();
    let mut backends = Vec::new();

    if let Ok(command) = std::env::var("EVM_BACKEND_COMMAND") {
        backends.push(legacy_stdio("evm", BackendKind::Evm, &command, network.clone()));
    } else if let Ok(url) = std::env::var("EVM_RPC_URL") {
        backends.push(BackendDescriptor {
            key: "evm".to_string(),
            kind: BackendKind::Evm,
            protocol: BackendProtocol::HttpRpc,
            command: Vec::new(),
            base_url: Some(url),
            network: network.clone(),
            env: HashMap::new(),
            cwd: None,
        });
    }
    if let Ok(command) = std::env::var("DEX_BACKEND_COMMAND") {
        backends.push(legacy_stdio("dex", BackendKind::DexData, &command, None));
    }
    if let Ok(command) = std::env::var("PRICE_BACKEND_COMMAND") {
        backends.push(legacy_stdio("price", BackendKind::Price, &command, None));
    }

    Ok(backends)
}

fn legacy_stdio(
    key: &str,
    kind: BackendKind,
    command: &str,
    network: Option<String>,
) -> BackendDescriptor {
    BackendDescriptor {
        key: key.to_string(),
        kind,
        protocol: BackendProtocol::StdioRpc,
        command: command.split_whitespace().map(str::to_string).collect(),
        base_url: None,
        network,
        env: HashMap::new(),
        cwd: None,
    }
}

/// Pick the primary backend key for a kind: the env override when set (must
/// name a backend of that kind), otherwise the sole candidate. More than one
/// candidate without an override is an error; zero candidates is `None`.
fn resolve_primary(
    backends: &[BackendDescriptor],
    kind: BackendKind,
    env_key: &str,
) -> Result<Option<String>, ConfigError> {
    let candidates: Vec<&BackendDescriptor> =
        backends.iter().filter(|b| b.kind == kind).collect();

    if let Ok(chosen) = std::env::var(env_key) {
        return match candidates.iter().find(|b| b.key == chosen) {
            Some(found) => Ok(Some(found.key.clone())),
            None => Err(ConfigError::UnknownPrimary {
                env: env_key.to_string(),
                key: chosen,
            }),
        };
    }

    match candidates.as_slice() {
        [] => Ok(None),
        [sole] => Ok(Some(sole.key.clone())),
        _ => Err(ConfigError::NoPrimaryConfigured {
            kind: kind.to_string(),
            env: env_key.to_string(),
        }),
    }
}

fn get_env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_bool_env(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn get_u64_env(key: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|e: std::num::ParseIntError| {
            ConfigError::InvalidEnv {
                key: key.to_string(),
                message: e.to_string(),
            }
        }),
        Err(_) => Ok(default),
    }
}

fn get_f64_env(key: &str, default: f64) -> Result<f64, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|e: std::num::ParseFloatError| {
            ConfigError::InvalidEnv {
                key: key.to_string(),
                message: e.to_string(),
            }
        }),
        Err(_) => Ok(default),
    }
}
