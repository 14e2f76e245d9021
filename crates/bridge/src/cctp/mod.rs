//! Circle CCTP V2 boundary: fee tiers, attestation lookups and calldata.
//!
//! CCTP moves native USDC by burning on the source chain and minting on the
//! destination chain once Circle's attestation service (Iris) has signed the
//! burn message:
//!
//! 1. **Burn**: `TokenMessengerV2.depositForBurn()` on the source chain
//! 2. **Attest**: poll `GET /v2/messages/{sourceDomain}?transactionHash=..`
//! 3. **Mint**: `MessageTransmitterV2.receiveMessage()` on the destination chain
//!
//! This module only talks HTTP and builds calldata. Signing and submission
//! belong to the caller's wallet, and the polling cadence belongs to the
//! caller's job queue: [`CircleApi::attestation`] performs exactly one fetch.
//!
//! ## Fee tiers
//!
//! `GET /v2/burn/USDC/fees/{source}/{dest}` returns one entry per finality
//! threshold. `1000` is a fast transfer (soft finality, fee premium), `2000`
//! is a standard transfer.

mod evm;

pub use evm::{
    approve_calldata, decode_used_nonce, deposit_for_burn_calldata, receive_message_calldata,
    used_nonces_calldata, DepositForBurn,
};

use std::mem::size_of;
use std::time::Duration;

use alloy::primitives::{Bytes, FixedBytes, TxHash};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{Attestation, AttestationStatus, Domain, FeeOption};

/// Production Iris endpoint.
pub const CIRCLE_API_BASE: &str = "https://iris-api.circle.com";

/// Iris returns this literal in the `attestation` field until signing is done.
const ATTESTATION_PLACEHOLDER: &str = "PENDING";

const COMPLETE_STATUS: &str = "complete";

const FAILED_STATUS: &str = "failed";

/// Errors from the Circle HTTP boundary that callers may want to act on.
///
/// Attestation lookups never produce these: they fold every transport
/// problem into [`AttestationStatus::Pending`].
#[derive(Debug, thiserror::Error)]
pub enum CctpError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid Circle API base URL: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),
    #[error("fee endpoint returned HTTP {status} for {source_domain} -> {destination_domain}")]
    FeeEndpoint {
        status: u16,
        source_domain: Domain,
        destination_domain: Domain,
    },
    #[error("message too short for nonce extraction: got {length} bytes, need at least 44")]
    MessageTooShort { length: usize },
}

/// HTTP operations offered by a CCTP attestation service.
#[async_trait]
pub trait CircleApi: Send + Sync + 'static {
    /// Fee tiers for burning on `source` and minting on `destination`.
    async fn fee_options(
        &self,
        source: Domain,
        destination: Domain,
    ) -> Result<Vec<FeeOption>, CctpError>;

    /// One bounded lookup of the attestation for `burn_tx`.
    async fn attestation(&self, source: Domain, burn_tx: TxHash) -> AttestationStatus;
}

/// Fee entry from Circle's `/v2/burn/USDC/fees/{source}/{dest}` API.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct FeeEntry {
    finality_threshold: u32,
    minimum_fee: u64,
}

#[derive(Deserialize, Debug)]
struct MessageEntry {
    attestation: Option<String>,
    message: Option<String>,
    status: String,
}

#[derive(Deserialize, Debug)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<MessageEntry>,
}

/// reqwest-backed [`CircleApi`] client.
#[derive(Debug, Clone)]
pub struct CircleClient {
    http_client: reqwest::Client,
    api_base: String,
}

impl CircleClient {
    pub fn new(api_base: &str) -> Result<Self, CctpError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let api_base = url::Url::parse(api_base)?
            .as_str()
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            http_client,
            api_base,
        })
    }
}

#[async_trait]
impl CircleApi for CircleClient {
    async fn fee_options(
        &self,
        source: Domain,
        destination: Domain,
    ) -> Result<Vec<FeeOption>, CctpError> {
        let url = format!("{}/v2/burn/USDC/fees/{source}/{destination}", self.api_base);
        let response = self.http_client.get(&url).send().await?;

        if !response.status().is_success() {
            warn!(
                url,
                status = response.status().as_u16(),
                "Fee endpoint failed"
            );
            return Err(CctpError::FeeEndpoint {
                status: response.status().as_u16(),
                source_domain: source,
                destination_domain: destination,
            });
        }

        let entries: Vec<FeeEntry> = response.json().await?;

        debug!(%source, %destination, ?entries, "Retrieved CCTP fee options");

        Ok(entries
            .into_iter()
            .map(|entry| FeeOption {
                finality_threshold: entry.finality_threshold,
                fee_bps: entry.minimum_fee,
            })
            .collect())
    }

    async fn attestation(&self, source: Domain, burn_tx: TxHash) -> AttestationStatus {
        let url = format!(
            "{}/v2/messages/{source}?transactionHash={burn_tx}",
            self.api_base
        );

        let response = match self.http_client.get(&url).send().await {
            Ok(response) => response,
            Err(error) => {
                debug!(%url, %error, "Attestation request failed");
                return AttestationStatus::pending(format!("request failed: {error}"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            debug!(%url, status = status.as_u16(), "Attestation API non-success");
            return AttestationStatus::pending(format!("HTTP {}", status.as_u16()));
        }

        let body: MessagesResponse = match response.json().await {
            Ok(body) => body,
            Err(error) => {
                warn!(%url, %error, "Malformed attestation response");
                return AttestationStatus::pending(format!("malformed response: {error}"));
            }
        };

        parse_message_entry(body.messages.into_iter().next())
    }
}

fn parse_message_entry(entry: Option<MessageEntry>) -> AttestationStatus {
    let Some(entry) = entry else {
        return AttestationStatus::pending("no messages indexed yet");
    };

    match entry.status.as_str() {
        COMPLETE_STATUS => {}
        FAILED_STATUS => {
            return AttestationStatus::Failed {
                reason: format!("attestation service reported status {}", entry.status),
            };
        }
        other => return AttestationStatus::pending(other),
    }

    let (Some(message_hex), Some(attestation_hex)) = (entry.message, entry.attestation) else {
        return AttestationStatus::pending("complete without message or attestation");
    };

    if attestation_hex == ATTESTATION_PLACEHOLDER {
        return AttestationStatus::pending("attestation not yet signed");
    }

    let (message, attestation) = match (
        alloy::hex::decode(&message_hex),
        alloy::hex::decode(&attestation_hex),
    ) {
        (Ok(message), Ok(attestation)) => (Bytes::from(message), Bytes::from(attestation)),
        (Err(error), _) | (_, Err(error)) => {
            return AttestationStatus::pending(format!("undecodable hex: {error}"));
        }
    };

    match extract_nonce_from_message(&message) {
        Ok(nonce) => AttestationStatus::Complete(Attestation {
            message,
            attestation,
            nonce,
        }),
        Err(error) => AttestationStatus::Failed {
            reason: error.to_string(),
        },
    }
}

// CCTP V2 message layout:
// - Bytes 0-3: version
// - Bytes 4-7: source domain
// - Bytes 8-11: destination domain
// - Bytes 12-43: nonce
// - Bytes 44+: remaining message data
const NONCE_INDEX: usize = 12;
const NONCE_SIZE: usize = size_of::<FixedBytes<32>>();
const MIN_MESSAGE_LENGTH: usize = NONCE_INDEX + NONCE_SIZE;

/// Extracts the 32-byte nonce from an attested CCTP V2 message.
pub fn extract_nonce_from_message(message: &[u8]) -> Result<FixedBytes<32>, CctpError> {
    if message.len() < MIN_MESSAGE_LENGTH {
        return Err(CctpError::MessageTooShort {
            length: message.len(),
        });
    }

    Ok(FixedBytes::<32>::from_slice(
        &message[NONCE_INDEX..MIN_MESSAGE_LENGTH],
    ))
}
