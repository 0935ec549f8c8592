// Calldata for the payment-request contract's relay entry point
use alloy_primitives::{Bytes, U256};
use alloy_sol_types::{sol, SolCall};

use crate::store::RelayMessage;

sol! {
    /// Accepts a payment request relayed from another chain. The contract
    /// checks the caller against its trusted relayer and rejects a
    /// `messageHash` it has already processed.
    #[derive(Debug, PartialEq, Eq)]
    function relayMessage(
        uint256 requestId,
        bytes32 messageHash,
        address requester,
        address target,
        uint256 amount,
        string token,
        uint256 originChainId,
        string message,
        uint256 timestamp,
        uint256 expiryTime
    ) external;
}

/// ABI-encode a delivery of `message`
pub fn encode_relay_message(message: &RelayMessage) -> Bytes {
    let call = relayMessageCall {
        requestId: message.request_id,
        messageHash: message.message_hash,
        requester: message.requester,
        target: message.target,
        amount: message.amount,
        token: message.token.clone(),
        originChainId: U256::from(message.origin_chain),
        message: message.message.clone(),
        timestamp: U256::from(message.timestamp.timestamp().max(0) as u64),
        expiryTime: U256::from(message.expiry_time.timestamp().max(0) as u64),
    };
    Bytes::from(call.abi_encode())
}
