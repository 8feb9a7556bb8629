// Chainpilot Engine — Wallet provider capability interface
//
// A `WalletProvider` is the capability handle a wallet extension
// announces: a JSON-RPC `request` surface plus an event stream for
// externally-driven account and chain changes. Subscribing via `events()`
// is the `on` half of the protocol; dropping the receiver is `off`.

use crate::atoms::error::WalletError;
use crate::engine::types::ChainNamespace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

// ── RPC method names (EIP-1193 / wallet-extension surface) ─────────────

pub const ETH_REQUEST_ACCOUNTS: &str = "eth_requestAccounts";
pub const ETH_ACCOUNTS: &str = "eth_accounts";
pub const ETH_CHAIN_ID: &str = "eth_chainId";
pub const WALLET_SWITCH_CHAIN: &str = "wallet_switchEthereumChain";
pub const WALLET_ADD_CHAIN: &str = "wallet_addEthereumChain";
pub const ETH_SEND_TRANSACTION: &str = "eth_sendTransaction";
pub const PERSONAL_SIGN: &str = "personal_sign";

// ── Provider families ──────────────────────────────────────────────────

/// The wallet-extension family a provider belongs to. Operations declare
/// which families satisfy them via `required_wallet_providers`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WalletProviderKind {
    /// EIP-1193 injected provider (EVM extensions).
    Eip1193,
    /// Wallet-standard provider (Solana extensions).
    SolanaStandard,
}

impl WalletProviderKind {
    /// The chain namespace this provider family natively switches within.
    pub fn native_namespace(&self) -> ChainNamespace {
        match self {
            WalletProviderKind::Eip1193 => ChainNamespace::Eip155,
            WalletProviderKind::SolanaStandard => ChainNamespace::Solana,
        }
    }
}

// ── External change notifications ──────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// The active account set changed; empty means the user disconnected
    /// the site from inside the extension.
    AccountsChanged(Vec<String>),
    /// The active chain changed (hex or decimal id).
    ChainChanged(String),
}

// ── Capability trait ───────────────────────────────────────────────────

#[async_trait]
pub trait WalletProvider: Send + Sync {
    fn kind(&self) -> WalletProviderKind;

    /// Perform one JSON-RPC request against the extension.
    async fn request(&self, method: &str, params: Value) -> Result<Value, WalletError>;

    /// Subscribe to account/chain change notifications.
    fn events(&self) -> broadcast::Receiver<ProviderEvent>;
}

// ── Chain id normalization ─────────────────────────────────────────────

/// Normalize a provider-reported chain id ("0x1", "1") to decimal text.
/// Non-numeric ids (Solana cluster names) pass through unchanged.
pub fn normalize_chain_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        if let Ok(n) = u64::from_str_radix(hex, 16) {
            return n.to_string();
        }
    }
    trimmed.to_string()
}

/// Format a decimal chain id the way switch/add requests expect it.
/// Non-numeric ids pass through unchanged.
pub fn hex_chain_id(decimal: &str) -> String {
    match decimal.parse::<u64>() {
        Ok(n) => format!("0x{:x}", n),
        Err(_) => decimal.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_normalization() {
        assert_eq!(normalize_chain_id("0x1"), "1");
        assert_eq!(normalize_chain_id("0x2105"), "8453");
        assert_eq!(normalize_chain_id("137"), "137");
        assert_eq!(normalize_chain_id("mainnet-beta"), "mainnet-beta");
    }

    #[test]
    fn chain_id_hex_formatting() {
        assert_eq!(hex_chain_id("1"), "0x1");
        assert_eq!(hex_chain_id("8453"), "0x2105");
        assert_eq!(hex_chain_id("mainnet-beta"), "mainnet-beta");
    }

    #[test]
    fn provider_kind_namespaces() {
        assert_eq!(
            WalletProviderKind::Eip1193.native_namespace(),
            ChainNamespace::Eip155
        );
        assert_eq!(
            WalletProviderKind::SolanaStandard.native_namespace(),
            ChainNamespace::Solana
        );
    }
}
