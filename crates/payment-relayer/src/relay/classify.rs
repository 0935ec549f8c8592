// Failure classification for delivery attempts
//
// Transient failures are recognised by message signature; anything else that
// comes back from the target chain is treated as permanent.
use std::fmt;

use crate::chains::ChainError;

/// Kinds of transient failure worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// Submission or receipt wait ran past its deadline
    Timeout,
    /// Network connectivity issues
    Network,
    /// Rate limiting from the RPC provider
    RateLimited,
    /// 502/503/504 from a gateway
    ServiceUnavailable,
    /// Gas price too low or replacement rejected
    Underpriced,
    /// Nonce conflicts and duplicate broadcasts
    Nonce,
    /// Relayer account cannot pay for gas right now
    InsufficientFunds,
    /// Mempool full or similar transient node state
    Mempool,
}

impl TransientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransientKind::Timeout => "timeout",
            TransientKind::Network => "network",
            TransientKind::RateLimited => "rate_limited",
            TransientKind::ServiceUnavailable => "service_unavailable",
            TransientKind::Underpriced => "underpriced",
            TransientKind::Nonce => "nonce",
            TransientKind::InsufficientFunds => "insufficient_funds",
            TransientKind::Mempool => "mempool",
        }
    }
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable(TransientKind),
    Fatal,
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Retryable(_))
    }
}

/// JSON-RPC error code for "limit exceeded" (EIP-1474)
const RPC_LIMIT_EXCEEDED: i64 = -32005;

/// Match a transport-level failure (HTTP status, socket, DNS) against the
/// known transient signatures. Never applied to node or contract messages.
pub fn classify_transport_message(message: &str) -> FailureClass {
    let msg = message.to_lowercase();

    if msg.contains("timeout") || msg.contains("timed out") || msg.contains("deadline exceeded") {
        return FailureClass::Retryable(TransientKind::Timeout);
    }

    if msg.contains("rate limit") || msg.contains("too many requests") || msg.contains("429") {
        return FailureClass::Retryable(TransientKind::RateLimited);
    }

    if msg.contains("service unavailable")
        || msg.contains("bad gateway")
        || msg.contains("gateway timeout")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("504")
    {
        return FailureClass::Retryable(TransientKind::ServiceUnavailable);
    }

    if msg.contains("connection")
        || msg.contains("network")
        || msg.contains("dns")
        || msg.contains("unreachable")
        || msg.contains("broken pipe")
    {
        return FailureClass::Retryable(TransientKind::Network);
    }

    FailureClass::Fatal
}

/// Match an EVM node error or revert reason against the transaction-pool
/// signatures that clear up on their own
pub fn classify_node_message(message: &str) -> FailureClass {
    let msg = message.to_lowercase();

    if msg.contains("underpriced")
        || msg.contains("replacement transaction")
        || msg.contains("fee too low")
        || msg.contains("max fee per gas less than block base fee")
    {
        return FailureClass::Retryable(TransientKind::Underpriced);
    }

    if msg.contains("nonce too low")
        || msg.contains("nonce too high")
        || msg.contains("nonce has already been used")
        || msg.contains("already known")
        || msg.contains("known transaction")
    {
        return FailureClass::Retryable(TransientKind::Nonce);
    }

    if msg.contains("insufficient funds") {
        return FailureClass::Retryable(TransientKind::InsufficientFunds);
    }

    if msg.contains("mempool is full")
        || msg.contains("txpool is full")
        || msg.contains("transaction pool is full")
    {
        return FailureClass::Retryable(TransientKind::Mempool);
    }

    FailureClass::Fatal
}

/// Classify a provider error
pub fn classify(error: &ChainError) -> FailureClass {
    match error {
        ChainError::Timeout { .. } => FailureClass::Retryable(TransientKind::Timeout),
        ChainError::Transport(message) => match classify_transport_message(message) {
            FailureClass::Fatal => FailureClass::Retryable(TransientKind::Network),
            class => class,
        },
        ChainError::NotReady(_) => FailureClass::Retryable(TransientKind::Network),
        ChainError::UnknownChain(_) => FailureClass::Fatal,
        // Revert data is never inspected, only the node's message
        ChainError::Rpc { code, .. } if *code == RPC_LIMIT_EXCEEDED => {
            FailureClass::Retryable(TransientKind::RateLimited)
        }
        ChainError::Rpc { message, .. } => classify_node_message(message),
        ChainError::Reverted { reason, .. } => classify_node_message(reason),
        ChainError::InvalidResponse(_) => FailureClass::Fatal,
    }
}
