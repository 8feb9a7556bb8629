// ── Chainpilot Atoms: Error Types ──────────────────────────────────────────
// Canonical error enums for the engine, built with `thiserror`.
//
// Design rules:
//   • `EngineError` variants are coarse-grained by domain (I/O, JSON,
//     network, provider, wallet, operation, config…).
//   • Wallet failures get their own `WalletError` enum because the
//     orchestrator must tell rejection, timeout and cancellation apart
//     programmatically, not by string matching.
//   • The `#[from]` attribute wires std/external error conversions
//     automatically.
//   • No variant carries secret material (API keys, private keys) in its
//     message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Chat endpoint HTTP or API-level failure.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Wallet connection / provider RPC failure.
    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    /// Operation lookup, validation, or execution failure.
    #[error("Operation error: {operation}: {message}")]
    Operation { operation: String, message: String },

    /// Engine configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create an operation error with name and message.
    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

// ── Wallet failure taxonomy ────────────────────────────────────────────────
// User-visible conditions are distinct variants: a declined connection and
// a timed-out one must never collapse into the same message.

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WalletError {
    /// The operation requires a wallet but none is connected.
    #[error("wallet required: no wallet connection")]
    NotConnected,

    /// A wallet is connected but its provider kind is not accepted
    /// by the operation.
    #[error("wallet required: connected provider does not match ({required})")]
    WrongProvider { required: String },

    /// No announced provider matches the requested id.
    #[error("unknown wallet provider: {0}")]
    UnknownProvider(String),

    /// The user declined the connection or signing prompt (EIP-1193 4001).
    #[error("wallet request rejected by user")]
    Rejected,

    /// The provider did not answer within the allotted time.
    #[error("wallet request timed out")]
    Timeout,

    /// A pending connection wait was cancelled (user dismissed the
    /// prompt, or a newer call superseded it).
    #[error("wallet connection wait cancelled")]
    Cancelled,

    /// The wallet does not know the requested chain (EIP-1193 4902);
    /// callers fall back to an add-chain request.
    #[error("wallet does not recognize chain {0}")]
    UnrecognizedChain(String),

    /// The target network name is not in the network catalog.
    #[error("unknown network: {0}")]
    UnknownNetwork(String),

    /// Any other provider RPC failure.
    #[error("wallet rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The provider does not implement the requested RPC method.
    #[error("wallet method not supported: {0}")]
    UnsupportedMethod(String),
}

impl WalletError {
    /// Map a raw EIP-1193 error code onto the typed taxonomy.
    pub fn from_rpc(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            4001 => WalletError::Rejected,
            4902 => WalletError::UnrecognizedChain(message),
            _ => WalletError::Rpc { code, message },
        }
    }
}

// ── Chat endpoint failure taxonomy ─────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProviderError {
    /// 401 / 403 — never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// 429 — retried with backoff, surfaced with the server's delay hint.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Any other non-success API status.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Connection-level failure (DNS, TLS, mid-stream read error).
    #[error("transport error: {0}")]
    Transport(String),
}

// ── Migration bridge: String → EngineError ─────────────────────────────────
// Allows `?` on functions still returning `Result<T, String>` inside
// functions that return `EngineResult<T>`.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations should return this type.
pub type EngineResult<T> = Result<T, EngineError>;

// ── Conversion: EngineError → String ──────────────────────────────────────
// Lets embedding layers with `Result<T, String>` boundaries call
// `.map_err(EngineError::into)` directly.

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_code_mapping() {
        assert_eq!(WalletError::from_rpc(4001, "denied"), WalletError::Rejected);
        assert_eq!(
            WalletError::from_rpc(4902, "0x2105"),
            WalletError::UnrecognizedChain("0x2105".into())
        );
        assert_eq!(
            WalletError::from_rpc(-32000, "busy"),
            WalletError::Rpc { code: -32000, message: "busy".into() }
        );
    }

    #[test]
    fn wallet_error_nests_into_engine_error() {
        let e: EngineError = WalletError::Timeout.into();
        assert!(e.to_string().contains("timed out"));
    }
}
