//! Calldata for the CCTP V2 contracts.

use alloy::primitives::{Address, Bytes, FixedBytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;

use crate::Domain;

sol! {
    interface IERC20 {
        function approve(address spender, uint256 amount) external returns (bool);
    }

    interface ITokenMessengerV2 {
        function depositForBurn(
            uint256 amount,
            uint32 destinationDomain,
            bytes32 mintRecipient,
            address burnToken,
            bytes32 destinationCaller,
            uint256 maxFee,
            uint32 minFinalityThreshold
        ) external;
    }

    interface IMessageTransmitterV2 {
        function receiveMessage(bytes message, bytes attestation) external returns (bool success);
        function usedNonces(bytes32 nonce) external view returns (uint256);
    }
}

/// Parameters of a `depositForBurn` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositForBurn {
    pub amount: U256,
    pub destination_domain: Domain,
    pub recipient: Address,
    pub burn_token: Address,
    pub max_fee: U256,
    pub min_finality_threshold: u32,
}

pub fn approve_calldata(spender: Address, amount: U256) -> Bytes {
    Bytes::from(IERC20::approveCall { spender, amount }.abi_encode())
}

pub fn deposit_for_burn_calldata(deposit: &DepositForBurn) -> Bytes {
    // bytes32(0) lets any address relay receiveMessage() on the destination.
    let destination_caller = FixedBytes::<32>::ZERO;

    let call = ITokenMessengerV2::depositForBurnCall {
        amount: deposit.amount,
        destinationDomain: deposit.destination_domain.0,
        mintRecipient: FixedBytes::<32>::left_padding_from(deposit.recipient.as_slice()),
        burnToken: deposit.burn_token,
        destinationCaller: destination_caller,
        maxFee: deposit.max_fee,
        minFinalityThreshold: deposit.min_finality_threshold,
    };

    Bytes::from(call.abi_encode())
}

pub fn receive_message_calldata(message: Bytes, attestation: Bytes) -> Bytes {
    Bytes::from(
        IMessageTransmitterV2::receiveMessageCall {
            message,
            attestation,
        }
        .abi_encode(),
    )
}

/// `usedNonces(nonce)` lookup. Nonzero means the message was already received.
pub fn used_nonces_calldata(nonce: FixedBytes<32>) -> Bytes {
    Bytes::from(IMessageTransmitterV2::usedNoncesCall { nonce }.abi_encode())
}

pub fn decode_used_nonce(output: &[u8]) -> Result<bool, alloy::sol_types::Error> {
    let used = IMessageTransmitterV2::usedNoncesCall::abi_decode_returns(output)?;
    Ok(!used.is_zero())
}
