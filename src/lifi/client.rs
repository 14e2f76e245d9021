//! HTTP client for the LiFi REST API.
//!
//! `/v1/quote` returns a single executable route. `/v1/chains` and
//! `/v1/tokens` feed the LiFi [`AssetSupportCache`](crate::asset_cache::AssetSupportCache).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use alloy::primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{LiFiContext, LiFiQuoteRequest};
use crate::asset_cache::{AssetCacheError, AssetDirectory, AssetListing, ChainInfo};
use crate::token::ChainId;
use crate::wallet::Call;

#[derive(Debug, thiserror::Error)]
pub(crate) enum LiFiError {
    #[error("LiFi request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("LiFi returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid LiFi API base URL: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),
    #[error("invalid LiFi API key header: {0}")]
    InvalidApiKey(#[from] InvalidHeaderValue),
    #[error("LiFi returned unparseable amount {field}: {value}")]
    InvalidAmount { field: &'static str, value: String },
    #[error("LiFi route {tool} yields zero output")]
    ZeroOutput { tool: String },
}

impl LiFiError {
    /// Rate limits, server errors and transport failures may clear up.
    pub(crate) const fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidBaseUrl(_)
            | Self::InvalidApiKey(_)
            | Self::InvalidAmount { .. }
            | Self::ZeroOutput { .. } => false,
        }
    }
}

#[async_trait]
pub(crate) trait LiFiApi: Send + Sync + 'static {
    async fn quote(&self, request: &LiFiQuoteRequest) -> Result<LiFiContext, LiFiError>;
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    tool: String,
    estimate: Estimate,
    transaction_request: TransactionRequest,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Estimate {
    from_amount: String,
    to_amount: String,
    to_amount_min: String,
    #[serde(default)]
    approval_address: Option<Address>,
}

#[derive(Deserialize, Debug)]
struct TransactionRequest {
    to: Address,
    data: Bytes,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChainsResponse {
    chains: Vec<ChainEntry>,
}

#[derive(Deserialize, Debug)]
struct ChainEntry {
    id: ChainId,
    name: String,
}

#[derive(Deserialize, Debug)]
struct TokensResponse {
    tokens: HashMap<String, Vec<TokenEntry>>,
}

#[derive(Deserialize, Debug)]
struct TokenEntry {
    address: Address,
}

/// LiFi amounts arrive as decimal strings, except `value`, which is hex.
fn parse_amount(field: &'static str, value: &str) -> Result<U256, LiFiError> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(value, 10),
    };

    parsed.map_err(|_| LiFiError::InvalidAmount {
        field,
        value: value.to_string(),
    })
}

#[derive(Debug, Clone)]
pub(crate) struct LiFiClient {
    http_client: reqwest::Client,
    api_base: String,
    integrator: String,
}

impl LiFiClient {
    pub(crate) fn new(
        api_base: &str,
        integrator: &str,
        api_key: Option<&str>,
    ) -> Result<Self, LiFiError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            headers.insert("x-lifi-api-key", HeaderValue::from_str(key)?);
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .default_headers(headers)
            .build()?;

        let api_base = url::Url::parse(api_base)?
            .as_str()
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            http_client,
            api_base,
            integrator: integrator.to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, LiFiError> {
        let url = format!("{}{path}", self.api_base);
        let response = self.http_client.get(&url).query(query).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%url, status = status.as_u16(), %body, "LiFi request failed");
            return Err(LiFiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl LiFiApi for LiFiClient {
    async fn quote(&self, request: &LiFiQuoteRequest) -> Result<LiFiContext, LiFiError> {
        let query = [
            ("fromChain", request.token_in.chain_id.to_string()),
            ("toChain", request.token_out.chain_id.to_string()),
            ("fromToken", request.token_in.address.to_string()),
            ("toToken", request.token_out.address.to_string()),
            ("fromAmount", request.from_amount.to_string()),
            ("fromAddress", request.wallet.to_string()),
            ("slippage", request.slippage.to_string()),
            ("integrator", self.integrator.clone()),
        ];

        let response: QuoteResponse = self.get_json("/v1/quote", &query).await?;

        let to_amount = parse_amount("toAmount", &response.estimate.to_amount)?;
        if to_amount.is_zero() {
            return Err(LiFiError::ZeroOutput {
                tool: response.tool,
            });
        }

        let value = response
            .transaction_request
            .value
            .as_deref()
            .map(|value| parse_amount("value", value))
            .transpose()?
            .unwrap_or(U256::ZERO);

        debug!(tool = %response.tool, %to_amount, "Retrieved LiFi quote");

        Ok(LiFiContext {
            tool: response.tool,
            token_in: request.token_in,
            token_out: request.token_out,
            from_amount: parse_amount("fromAmount", &response.estimate.from_amount)?,
            to_amount,
            to_amount_min: parse_amount("toAmountMin", &response.estimate.to_amount_min)?,
            approval_address: response.estimate.approval_address.unwrap_or(Address::ZERO),
            transaction: Call {
                to: response.transaction_request.to,
                data: response.transaction_request.data,
                value,
            },
        })
    }
}

#[async_trait]
impl AssetListing for LiFiClient {
    fn provider(&self) -> &'static str {
        "LiFi"
    }

    async fn fetch(&self) -> Result<AssetDirectory, AssetCacheError> {
        let chains: ChainsResponse = self.listing("/v1/chains").await?;
        let tokens: TokensResponse = self.listing("/v1/tokens").await?;

        let chains = chains
            .chains
            .into_iter()
            .map(|chain| {
                (
                    chain.id,
                    ChainInfo {
                        chain_id: chain.id,
                        name: chain.name,
                    },
                )
            })
            .collect();

        let tokens_by_chain = tokens
            .tokens
            .into_iter()
            .filter_map(|(chain_id, entries)| {
                let Ok(chain_id) = chain_id.parse::<ChainId>() else {
                    debug!(chain_id, "Skipping LiFi token list with non-numeric chain key");
                    return None;
                };

                let addresses: HashSet<Address> =
                    entries.into_iter().map(|entry| entry.address).collect();
                Some((chain_id, addresses))
            })
            .collect();

        Ok(AssetDirectory {
            chains,
            tokens_by_chain,
        })
    }
}

impl LiFiClient {
    async fn listing<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, AssetCacheError> {
        let url = format!("{}{path}", self.api_base);
        let response = self.http_client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AssetCacheError::Status {
                status: status.as_u16(),
            });
        }

        Ok(response.json().await?)
    }
}
