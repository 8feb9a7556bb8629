// Chainpilot Engine — Wallet Connection Store
//
// One canonical wallet-connection snapshot per session, swapped wholesale
// on every transition and observed through a watch channel. The store
// discovers announced providers, connects to one, tracks externally
// driven account/network changes, and lets gated executions block on a
// connection that may arrive seconds later, be rejected, or time out.

pub mod discovery;
pub mod provider;

use crate::atoms::error::{EngineResult, WalletError};
use crate::engine::types::NetworkCatalog;
use discovery::{AnnouncedProvider, DiscoveryBus, ProviderInfo};
use log::{info, warn};
use parking_lot::Mutex;
use provider::{
    hex_chain_id, normalize_chain_id, ProviderEvent, WalletProvider, WalletProviderKind,
    ETH_CHAIN_ID, ETH_REQUEST_ACCOUNTS, WALLET_ADD_CHAIN, WALLET_SWITCH_CHAIN,
};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ── Connection snapshot ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// Immutable snapshot of the session's wallet connection. Never mutated
/// in place — every transition publishes a fresh value, so readers never
/// observe a torn state.
#[derive(Clone)]
pub struct WalletConnection {
    pub phase: ConnectionPhase,
    pub address: Option<String>,
    /// Normalized decimal chain id (or cluster name).
    pub network_id: Option<String>,
    pub provider_kind: Option<WalletProviderKind>,
    /// Reverse-DNS namespace of the connected extension.
    pub provider_rdns: Option<String>,
    /// Opaque capability handle of the connected extension.
    pub provider: Option<Arc<dyn WalletProvider>>,
}

impl WalletConnection {
    pub fn disconnected() -> Self {
        WalletConnection {
            phase: ConnectionPhase::Disconnected,
            address: None,
            network_id: None,
            provider_kind: None,
            provider_rdns: None,
            provider: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    /// Does this connection satisfy an operation's provider requirement?
    pub fn satisfies(&self, required: &[WalletProviderKind]) -> bool {
        self.is_connected()
            && self
                .provider_kind
                .map(|kind| required.contains(&kind))
                .unwrap_or(false)
    }
}

impl fmt::Debug for WalletConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletConnection")
            .field("phase", &self.phase)
            .field("address", &self.address)
            .field("network_id", &self.network_id)
            .field("provider_kind", &self.provider_kind)
            .field("provider_rdns", &self.provider_rdns)
            .finish_non_exhaustive()
    }
}

// ── Store ──────────────────────────────────────────────────────────────

/// Default cap on a single account/connect prompt.
const DEFAULT_REQUEST_SECS: u64 = 60;

pub struct WalletStore {
    catalog: NetworkCatalog,
    discovery: Arc<DiscoveryBus>,
    /// Announced-provider catalog — purely additive during a session.
    providers: Arc<Mutex<HashMap<String, AnnouncedProvider>>>,
    tx: Arc<watch::Sender<WalletConnection>>,
    /// Task consuming the active provider's change events.
    listener: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl WalletStore {
    pub fn new(catalog: NetworkCatalog, discovery: Arc<DiscoveryBus>) -> Self {
        let (tx, _) = watch::channel(WalletConnection::disconnected());
        let providers: Arc<Mutex<HashMap<String, AnnouncedProvider>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Passively collect announcements, including ones that arrive
        // after the initial discovery sweep.
        let catalog_clone = Arc::clone(&providers);
        discovery.add_listener(move |announced| {
            let mut map = catalog_clone.lock();
            if !map.contains_key(&announced.info.id) {
                info!(
                    "[wallet] Registered provider {} ({})",
                    announced.info.name, announced.info.rdns
                );
            }
            map.insert(announced.info.id.clone(), announced);
        });

        WalletStore {
            catalog,
            discovery,
            providers,
            tx: Arc::new(tx),
            listener: Mutex::new(None),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_SECS),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Broadcast the discovery signal. Idempotent and purely additive —
    /// call it as often as the UI likes.
    pub fn discover_providers(&self) {
        self.discovery.broadcast_request();
    }

    /// Identities of every provider announced so far.
    pub fn announced_providers(&self) -> Vec<ProviderInfo> {
        let mut infos: Vec<ProviderInfo> =
            self.providers.lock().values().map(|p| p.info.clone()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Current connection snapshot.
    pub fn snapshot(&self) -> WalletConnection {
        self.tx.borrow().clone()
    }

    /// Observe connection changes. Every transition publishes exactly one
    /// new snapshot; no-op external events are suppressed.
    pub fn subscribe(&self) -> watch::Receiver<WalletConnection> {
        self.tx.subscribe()
    }

    /// Connect to an announced provider and optionally steer it onto a
    /// desired network. On rejection or timeout the state reverts to
    /// Disconnected and the error propagates; a failed network switch is
    /// logged and the connection proceeds on whatever network resulted.
    pub async fn connect(
        &self,
        provider_id: &str,
        desired_network: Option<&str>,
    ) -> EngineResult<WalletConnection> {
        let announced = self
            .providers
            .lock()
            .get(provider_id)
            .cloned()
            .ok_or_else(|| WalletError::UnknownProvider(provider_id.to_string()))?;
        let handle = Arc::clone(&announced.handle);

        let mut connecting = WalletConnection::disconnected();
        connecting.phase = ConnectionPhase::Connecting;
        self.tx.send_replace(connecting);

        match self.request_accounts(&handle).await {
            Ok((address, network_id)) => {
                info!(
                    "[wallet] Connected {} address={} network={}",
                    announced.info.rdns, address, network_id
                );
                let snapshot = WalletConnection {
                    phase: ConnectionPhase::Connected,
                    address: Some(address),
                    network_id: Some(network_id),
                    provider_kind: Some(handle.kind()),
                    provider_rdns: Some(announced.info.rdns.clone()),
                    provider: Some(Arc::clone(&handle)),
                };
                self.tx.send_replace(snapshot);
                self.attach_listeners(&handle);

                if let Some(network) = desired_network {
                    if let Err(e) = self.switch_network(network).await {
                        warn!("[wallet] Network switch to '{}' failed: {}", network, e);
                    }
                }
                Ok(self.snapshot())
            }
            Err(e) => {
                warn!("[wallet] Connection to {} failed: {}", provider_id, e);
                self.tx.send_replace(WalletConnection::disconnected());
                Err(e.into())
            }
        }
    }

    async fn request_accounts(
        &self,
        handle: &Arc<dyn WalletProvider>,
    ) -> Result<(String, String), WalletError> {
        let accounts = tokio::time::timeout(
            self.request_timeout,
            handle.request(ETH_REQUEST_ACCOUNTS, json!([])),
        )
        .await
        .map_err(|_| WalletError::Timeout)??;

        let address = accounts
            .as_array()
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .map(str::to_string)
            // An empty account list means the user granted nothing.
            .ok_or(WalletError::Rejected)?;

        let chain = handle.request(ETH_CHAIN_ID, json!([])).await?;
        let network_id = normalize_chain_id(chain.as_str().unwrap_or_default());
        Ok((address, network_id))
    }

    /// Ask the connected wallet to change its active network. Resolves
    /// the name through the catalog within the wallet's native namespace;
    /// an "unrecognized chain" response falls back to an add-network
    /// request before retrying the switch once.
    pub async fn switch_network(&self, network: &str) -> EngineResult<()> {
        let current = self.snapshot();
        let handle = current
            .provider
            .clone()
            .ok_or(WalletError::NotConnected)?;
        let native = current
            .provider_kind
            .ok_or(WalletError::NotConnected)?
            .native_namespace();
        let target = self
            .catalog
            .resolve(network, native)
            .ok_or_else(|| WalletError::UnknownNetwork(network.to_string()))?
            .clone();

        if current.network_id.as_deref() == Some(target.chain_id.as_str()) {
            return Ok(());
        }

        let chain_hex = hex_chain_id(&target.chain_id);
        let switch_params = json!([{ "chainId": chain_hex.clone() }]);
        match handle.request(WALLET_SWITCH_CHAIN, switch_params.clone()).await {
            Ok(_) => {}
            Err(WalletError::UnrecognizedChain(_)) => {
                info!(
                    "[wallet] Chain {} unknown to wallet — requesting add-network",
                    target.chain_id
                );
                let add_params = json!([{
                    "chainId": chain_hex.clone(),
                    "chainName": target.name,
                    "rpcUrls": target.rpc_url.as_ref().map(|u| vec![u.clone()]).unwrap_or_default(),
                }]);
                handle.request(WALLET_ADD_CHAIN, add_params).await?;
                handle.request(WALLET_SWITCH_CHAIN, switch_params).await?;
            }
            Err(e) => return Err(e.into()),
        }

        // The provider will usually also emit ChainChanged; updating here
        // keeps the snapshot fresh even when it doesn't. Suppressed if
        // identical.
        self.tx.send_if_modified(|conn| {
            if conn.network_id.as_deref() != Some(target.chain_id.as_str()) {
                conn.network_id = Some(target.chain_id.clone());
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Clear the snapshot and detach listeners. Purely local bookkeeping:
    /// wallet-extension protocols offer no revoke call, so the provider
    /// keeps whatever access the user granted.
    pub fn disconnect(&self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
        info!("[wallet] Disconnected");
        self.tx.send_replace(WalletConnection::disconnected());
    }

    fn attach_listeners(&self, handle: &Arc<dyn WalletProvider>) {
        let mut rx = handle.events();
        let tx = Arc::clone(&self.tx);
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => Self::apply_external_event(&tx, event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let mut guard = self.listener.lock();
        if let Some(old) = guard.replace(task) {
            old.abort();
        }
    }

    /// Recompute the snapshot from an external change, emitting only when
    /// the address or network actually differs (no-op suppression).
    fn apply_external_event(tx: &watch::Sender<WalletConnection>, event: ProviderEvent) {
        tx.send_if_modified(|conn| {
            // Events racing a local disconnect are stale — ignore them.
            if conn.phase != ConnectionPhase::Connected {
                return false;
            }
            match event {
                ProviderEvent::AccountsChanged(accounts) => match accounts.first() {
                    None => {
                        info!("[wallet] Provider reported no accounts — disconnected externally");
                        *conn = WalletConnection::disconnected();
                        true
                    }
                    Some(addr) if conn.address.as_deref() != Some(addr.as_str()) => {
                        info!("[wallet] Active account changed to {}", addr);
                        conn.address = Some(addr.clone());
                        true
                    }
                    Some(_) => false,
                },
                ProviderEvent::ChainChanged(raw) => {
                    let normalized = normalize_chain_id(&raw);
                    if conn.network_id.as_deref() != Some(normalized.as_str()) {
                        info!("[wallet] Active network changed to {}", normalized);
                        conn.network_id = Some(normalized);
                        true
                    } else {
                        false
                    }
                }
            }
        });
    }
}

// ── Test support ───────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::testing::MockWalletProvider;
    use super::*;
    use crate::atoms::error::EngineError;
    use std::time::Duration;

    fn store_with_mock(mock: Arc<MockWalletProvider>) -> WalletStore {
        let bus = Arc::new(DiscoveryBus::new());
        let store = WalletStore::new(NetworkCatalog::default(), Arc::clone(&bus))
            .with_request_timeout(Duration::from_millis(200));
        let handle: Arc<dyn WalletProvider> = mock;
        bus.register_responder(move || {
            vec![AnnouncedProvider {
                info: ProviderInfo {
                    id: "mock".into(),
                    name: "Mock Wallet".into(),
                    icon: "data:,".into(),
                    rdns: "com.example.mock".into(),
                },
                handle: Arc::clone(&handle),
            }]
        });
        store.discover_providers();
        store
    }

    #[tokio::test]
    async fn discovery_is_additive_and_idempotent() {
        let mock = Arc::new(MockWalletProvider::new(
            WalletProviderKind::Eip1193,
            &["0xabc"],
            "0x1",
        ));
        let store = store_with_mock(mock);
        store.discover_providers();
        store.discover_providers();
        assert_eq!(store.announced_providers().len(), 1);
    }

    #[tokio::test]
    async fn connect_publishes_connected_snapshot() {
        let mock = Arc::new(MockWalletProvider::new(
            WalletProviderKind::Eip1193,
            &["0xabc"],
            "0x1",
        ));
        let store = store_with_mock(mock);

        let conn = store.connect("mock", None).await.expect("connect");
        assert!(conn.is_connected());
        assert_eq!(conn.address.as_deref(), Some("0xabc"));
        assert_eq!(conn.network_id.as_deref(), Some("1"));
        assert_eq!(conn.provider_rdns.as_deref(), Some("com.example.mock"));
        assert!(store.snapshot().is_connected());
    }

    #[tokio::test]
    async fn rejected_connect_reverts_to_disconnected() {
        let mock = Arc::new(MockWalletProvider::new(
            WalletProviderKind::Eip1193,
            &["0xabc"],
            "0x1",
        ));
        mock.reject_connect();
        let store = store_with_mock(mock);

        let err = store.connect("mock", None).await.expect_err("rejection");
        assert!(matches!(err, EngineError::Wallet(WalletError::Rejected)));
        assert_eq!(store.snapshot().phase, ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn hanging_connect_times_out_distinctly() {
        let mock = Arc::new(MockWalletProvider::new(
            WalletProviderKind::Eip1193,
            &["0xabc"],
            "0x1",
        ));
        mock.hang_connect();
        let store = store_with_mock(mock);

        let err = store.connect("mock", None).await.expect_err("timeout");
        assert!(matches!(err, EngineError::Wallet(WalletError::Timeout)));
        assert_eq!(store.snapshot().phase, ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn unknown_provider_id_errors() {
        let mock = Arc::new(MockWalletProvider::new(
            WalletProviderKind::Eip1193,
            &["0xabc"],
            "0x1",
        ));
        let store = store_with_mock(mock);
        let err = store.connect("nope", None).await.expect_err("unknown");
        assert!(matches!(
            err,
            EngineError::Wallet(WalletError::UnknownProvider(_))
        ));
    }

    #[tokio::test]
    async fn desired_network_triggers_switch() {
        let mock = Arc::new(MockWalletProvider::new(
            WalletProviderKind::Eip1193,
            &["0xabc"],
            "0x1",
        ));
        let store = store_with_mock(mock);
        let conn = store.connect("mock", Some("base")).await.expect("connect");
        assert_eq!(conn.network_id.as_deref(), Some("8453"));
    }

    #[tokio::test]
    async fn unrecognized_chain_falls_back_to_add_network() {
        let mock = Arc::new(MockWalletProvider::new(
            WalletProviderKind::Eip1193,
            &["0xabc"],
            "0x1",
        ));
        mock.mark_chain_unknown("0x2105");
        let store = store_with_mock(Arc::clone(&mock));

        store.connect("mock", None).await.expect("connect");
        store.switch_network("base").await.expect("switch after add");
        assert_eq!(mock.added_chains.lock().clone(), vec!["0x2105"]);
        assert_eq!(store.snapshot().network_id.as_deref(), Some("8453"));
    }

    #[tokio::test]
    async fn switch_failure_is_reported_but_connection_survives() {
        let mock = Arc::new(MockWalletProvider::new(
            WalletProviderKind::Eip1193,
            &["0xabc"],
            "0x1",
        ));
        let store = store_with_mock(mock);
        // Connect with a desired network that is not in the catalog:
        // the switch fails, the connection proceeds on its own network.
        let conn = store.connect("mock", Some("atlantis")).await.expect("connect");
        assert!(conn.is_connected());
        assert_eq!(conn.network_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn external_account_change_emits_new_snapshot() {
        let mock = Arc::new(MockWalletProvider::new(
            WalletProviderKind::Eip1193,
            &["0xabc"],
            "0x1",
        ));
        let store = store_with_mock(Arc::clone(&mock));
        store.connect("mock", None).await.expect("connect");

        let mut rx = store.subscribe();
        rx.borrow_and_update();
        mock.emit_accounts_changed(&["0xdef"]);
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("change within deadline")
            .expect("sender alive");
        assert_eq!(rx.borrow().address.as_deref(), Some("0xdef"));
    }

    #[tokio::test]
    async fn noop_external_changes_are_suppressed() {
        let mock = Arc::new(MockWalletProvider::new(
            WalletProviderKind::Eip1193,
            &["0xabc"],
            "0x1",
        ));
        let store = store_with_mock(Arc::clone(&mock));
        store.connect("mock", None).await.expect("connect");

        let mut rx = store.subscribe();
        rx.borrow_and_update();
        // Same account, same chain — nothing should be published.
        mock.emit_accounts_changed(&["0xabc"]);
        mock.emit_chain_changed("0x1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!rx.has_changed().expect("sender alive"));
    }

    #[tokio::test]
    async fn empty_account_list_is_external_disconnect() {
        let mock = Arc::new(MockWalletProvider::new(
            WalletProviderKind::Eip1193,
            &["0xabc"],
            "0x1",
        ));
        let store = store_with_mock(Arc::clone(&mock));
        store.connect("mock", None).await.expect("connect");

        let mut rx = store.subscribe();
        rx.borrow_and_update();
        mock.emit_accounts_changed(&[]);
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("change within deadline")
            .expect("sender alive");
        assert_eq!(rx.borrow().phase, ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_is_local_bookkeeping() {
        let mock = Arc::new(MockWalletProvider::new(
            WalletProviderKind::Eip1193,
            &["0xabc"],
            "0x1",
        ));
        let store = store_with_mock(Arc::clone(&mock));
        store.connect("mock", None).await.expect("connect");

        store.disconnect();
        assert_eq!(store.snapshot().phase, ConnectionPhase::Disconnected);
        // Provider catalog is untouched — reconnect works.
        store.connect("mock", None).await.expect("reconnect");
        assert!(store.snapshot().is_connected());
    }
}
