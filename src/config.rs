use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::signers::local::PrivateKeySigner;
use clap::Parser;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use tracing::Level;
use url::Url;

use st0x_fixed_point::Band;

use crate::cctp::CctpConfig;
use crate::lifi::LiFiConfig;
use crate::token::{ChainId, Token, TokenConfig};

const BPS_PER_UNIT: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

#[derive(Parser, Debug)]
pub struct Env {
    /// Path to plaintext TOML configuration file
    #[clap(long)]
    pub config: PathBuf,
    /// Path to TOML secrets file
    #[clap(long)]
    pub secrets: PathBuf,
}

/// Non-secret settings deserialized from the plaintext config TOML.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    database_url: String,
    log_level: Option<LogLevel>,
    wallet: Address,
    check_balances_interval_secs: Option<u64>,
    workers: Option<usize>,
    worker_idle_poll_ms: Option<u64>,
    rebalancing: RebalancingConfig,
    tokens: Vec<TokenEntry>,
    chains: Vec<ChainEntry>,
    cctp: Option<CctpConfig>,
    lifi: Option<LiFiConfig>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RebalancingConfig {
    surplus_threshold: Decimal,
    deficit_threshold: Decimal,
    max_quote_slippage: Option<Decimal>,
    min_trade: Option<Decimal>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TokenEntry {
    chain_id: ChainId,
    address: Address,
    decimals: u8,
    target_balance: Decimal,
    min_balance: Option<Decimal>,
    surplus_threshold: Option<Decimal>,
    deficit_threshold: Option<Decimal>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ChainEntry {
    chain_id: ChainId,
    rpc_url: Url,
}

/// Secret credentials deserialized from the secrets TOML.
#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Secrets {
    evm_private_key: Option<B256>,
    lifi_api_key: Option<String>,
}

/// Runtime context for the server, assembled from config and secrets.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub(crate) database_url: String,
    pub log_level: LogLevel,
    pub(crate) wallet: Address,
    pub(crate) check_balances_interval: Duration,
    pub(crate) workers: usize,
    pub(crate) worker_idle_poll: Duration,
    pub(crate) band: Band,
    pub(crate) max_quote_slippage_bps: u64,
    pub(crate) min_trade: Option<Decimal>,
    pub(crate) tokens: Vec<TokenConfig>,
    pub(crate) rpc_urls: BTreeMap<ChainId, Url>,
    pub(crate) cctp: Option<CctpConfig>,
    pub(crate) lifi: Option<LiFiConfig>,
    /// `None` runs the service in quote-only mode.
    pub(crate) signer: Option<PrivateKeySigner>,
    pub(crate) lifi_api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        (*log_level).into()
    }
}

pub(crate) async fn configure_sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;

    // WAL lets status readers proceed while a worker holds the write lock.
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    // Workers contend for the single writer when claiming jobs; wait instead
    // of failing with "database is locked".
    sqlx::query("PRAGMA busy_timeout = 10000")
        .execute(&pool)
        .await?;

    Ok(pool)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML")]
    Toml(#[from] toml::de::Error),
    #[error("no tokens configured")]
    NoTokens,
    #[error("token {0} is configured twice")]
    DuplicateToken(Token),
    #[error("no RPC URL configured for chain {0}")]
    MissingRpcUrl(ChainId),
    #[error("CCTP chain {0} has no tracked tokens")]
    UntrackedCctpChain(ChainId),
    #[error("{name} must be {expected}, got {value}")]
    InvalidThreshold {
        name: &'static str,
        expected: &'static str,
        value: Decimal,
    },
    #[error("interval {name} must be positive")]
    ZeroInterval { name: &'static str },
    #[error("failed to derive address from evm_private_key")]
    PrivateKeyDerivation(#[source] alloy::signers::k256::ecdsa::Error),
    #[error("evm_private_key controls {signer}, not the configured wallet {configured}")]
    SignerMismatch { configured: Address, signer: Address },
}

impl Ctx {
    pub fn load_files(config: &Path, secrets: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(config)?;
        let secrets_str = std::fs::read_to_string(secrets)?;
        Self::from_toml(&config_str, &secrets_str)
    }

    pub fn from_toml(config_toml: &str, secrets_toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_toml)?;
        let secrets: Secrets = toml::from_str(secrets_toml)?;

        let band = Band {
            up: check_surplus("rebalancing.surplus_threshold", config.rebalancing.surplus_threshold)?,
            down: check_deficit("rebalancing.deficit_threshold", config.rebalancing.deficit_threshold)?,
        };

        let max_quote_slippage = config
            .rebalancing
            .max_quote_slippage
            .unwrap_or_else(|| Decimal::new(5, 3));
        let max_quote_slippage_bps = slippage_bps("rebalancing.max_quote_slippage", max_quote_slippage)?;

        let rpc_urls: BTreeMap<ChainId, Url> = config
            .chains
            .into_iter()
            .map(|chain| (chain.chain_id, chain.rpc_url))
            .collect();

        let tokens = assemble_tokens(config.tokens, band, &rpc_urls)?;

        if let Some(cctp) = &config.cctp {
            let tracked: HashSet<ChainId> = tokens.iter().map(|config| config.token.chain_id).collect();

            if let Some(chain) = cctp.chains.iter().find(|chain| !tracked.contains(&chain.chain_id)) {
                return Err(ConfigError::UntrackedCctpChain(chain.chain_id));
            }
        }

        if let Some(lifi) = &config.lifi {
            slippage_bps("lifi.max_slippage", lifi.max_slippage)?;
        }

        let signer = secrets
            .evm_private_key
            .map(|key| PrivateKeySigner::from_bytes(&key).map_err(ConfigError::PrivateKeyDerivation))
            .transpose()?;

        if let Some(signer) = &signer
            && signer.address() != config.wallet
        {
            return Err(ConfigError::SignerMismatch {
                configured: config.wallet,
                signer: signer.address(),
            });
        }

        let check_balances_interval_secs = config.check_balances_interval_secs.unwrap_or(300);
        if check_balances_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval {
                name: "check_balances_interval_secs",
            });
        }

        Ok(Self {
            database_url: config.database_url,
            log_level: config.log_level.unwrap_or(LogLevel::Debug),
            wallet: config.wallet,
            check_balances_interval: Duration::from_secs(check_balances_interval_secs),
            workers: config.workers.unwrap_or(4).max(1),
            worker_idle_poll: Duration::from_millis(config.worker_idle_poll_ms.unwrap_or(500)),
            band,
            max_quote_slippage_bps,
            min_trade: config.rebalancing.min_trade,
            tokens,
            rpc_urls,
            cctp: config.cctp,
            lifi: config.lifi,
            signer,
            lifi_api_key: secrets.lifi_api_key,
        })
    }

    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        configure_sqlite_pool(&self.database_url).await
    }

    pub(crate) fn rpc_urls(&self) -> impl Iterator<Item = (ChainId, &Url)> {
        self.rpc_urls.iter().map(|(chain_id, url)| (*chain_id, url))
    }
}

fn assemble_tokens(
    entries: Vec<TokenEntry>,
    default_band: Band,
    rpc_urls: &BTreeMap<ChainId, Url>,
) -> Result<Vec<TokenConfig>, ConfigError> {
    if entries.is_empty() {
        return Err(ConfigError::NoTokens);
    }

    let mut seen = HashSet::new();

    entries
        .into_iter()
        .map(|entry| {
            let token = Token {
                chain_id: entry.chain_id,
                address: entry.address,
                decimals: entry.decimals,
            };

            if !seen.insert(token.id()) {
                return Err(ConfigError::DuplicateToken(token));
            }

            if !rpc_urls.contains_key(&token.chain_id) {
                return Err(ConfigError::MissingRpcUrl(token.chain_id));
            }

            let band = match (entry.surplus_threshold, entry.deficit_threshold) {
                (None, None) => None,
                (up, down) => Some(Band {
                    up: check_surplus("tokens.surplus_threshold", up.unwrap_or(default_band.up))?,
                    down: check_deficit(
                        "tokens.deficit_threshold",
                        down.unwrap_or(default_band.down),
                    )?,
                }),
            };

            Ok(TokenConfig {
                token,
                target_balance: entry.target_balance,
                min_balance: entry.min_balance,
                band,
            })
        })
        .collect()
}

fn check_surplus(name: &'static str, value: Decimal) -> Result<Decimal, ConfigError> {
    if value.is_sign_negative() {
        return Err(ConfigError::InvalidThreshold {
            name,
            expected: "non-negative",
            value,
        });
    }

    Ok(value)
}

fn check_deficit(name: &'static str, value: Decimal) -> Result<Decimal, ConfigError> {
    if value.is_sign_negative() || value > Decimal::ONE {
        return Err(ConfigError::InvalidThreshold {
            name,
            expected: "between 0 and 1",
            value,
        });
    }

    Ok(value)
}

fn slippage_bps(name: &'static str, fraction: Decimal) -> Result<u64, ConfigError> {
    let fraction = check_deficit(name, fraction)?;

    (fraction * BPS_PER_UNIT)
        .round()
        .to_u64()
        .ok_or(ConfigError::InvalidThreshold {
            name,
            expected: "between 0 and 1",
            value: fraction,
        })
}

pub fn setup_tracing(log_level: &LogLevel) {
    let level: Level = log_level.into();
    let default_filter =
        format!("st0x_rebalancer={level},st0x_bridge={level},st0x_fixed_point={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
