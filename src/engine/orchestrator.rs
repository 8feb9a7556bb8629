// Chainpilot Engine — Wallet-Gated Execution Orchestrator
//
// Executes a named tool call end-to-end even when the wallet connection
// it needs does not exist yet: the call parks on a pending wait that
// resolves on the first satisfying connection snapshot, rejects on user
// cancellation, or times out. At most one pending wait exists at a time —
// a newer call cancels the stale one before parking its own.

use crate::atoms::error::{EngineError, EngineResult, WalletError};
use crate::engine::events::{EngineEvent, EventBus};
use crate::engine::operations::{
    check_wallet_requirement, dispatch_capability, OperationRegistry,
};
use crate::engine::types::EngineConfig;
use crate::engine::wallet::provider::WalletProviderKind;
use crate::engine::wallet::{WalletConnection, WalletStore};
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

struct PendingWait {
    id: u64,
    cancel: oneshot::Sender<()>,
}

pub struct Orchestrator {
    registry: Arc<OperationRegistry>,
    wallet: Arc<WalletStore>,
    events: EventBus,
    config: EngineConfig,
    /// The single outstanding connection wait, if any.
    pending: Mutex<Option<PendingWait>>,
    next_wait_id: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<OperationRegistry>,
        wallet: Arc<WalletStore>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        Orchestrator {
            registry,
            wallet,
            events,
            config,
            pending: Mutex::new(None),
            next_wait_id: AtomicU64::new(1),
        }
    }

    /// Resolve and run one tool call, pausing for wallet connection and
    /// network alignment as the operation demands.
    pub async fn execute(
        &self,
        run_id: &str,
        tool_call_id: &str,
        name: &str,
        params: &Value,
    ) -> EngineResult<String> {
        let op = self
            .registry
            .get(name)
            .ok_or_else(|| EngineError::operation(name, "unknown operation"))?;

        // Target network implied by the call, default when unspecified.
        let target_network = params
            .get("network")
            .and_then(Value::as_str)
            .unwrap_or(&self.config.default_network)
            .to_string();

        // ── 1. Wallet gate ────────────────────────────────────────────
        let required = op.required_wallet_providers().unwrap_or_default();
        if !required.is_empty() && !self.wallet.snapshot().satisfies(&required) {
            info!(
                "[orchestrator] '{}' needs a wallet connection — signalling connect",
                name
            );
            self.events.emit(EngineEvent::ConnectRequired {
                run_id: run_id.to_string(),
                tool_call_id: tool_call_id.to_string(),
                operation: name.to_string(),
                required: required.clone(),
            });
            self.wait_for_connection(&required).await?;
        }

        // ── 2. Network alignment ──────────────────────────────────────
        // The switch resolves the target *name* within the wallet's
        // native namespace, so an operation declared on a foreign
        // namespace never sends its own chain id to the provider. A
        // failed switch is non-fatal; validate is the gate that decides
        // whether the resulting network is acceptable.
        if op.network_must_match() {
            if let Err(e) = self.wallet.switch_network(&target_network).await {
                warn!(
                    "[orchestrator] Network switch to '{}' failed for '{}': {}",
                    target_network, name, e
                );
            }
        }

        // ── 3. Validate, then execute ─────────────────────────────────
        let connection = self.wallet.snapshot();
        // Re-check: the connection may have changed while we waited.
        check_wallet_requirement(op.as_ref(), &connection)?;
        if !op.validate(params, &connection).await? {
            return Err(EngineError::operation(name, "invalid parameters"));
        }
        self.events.emit(EngineEvent::ToolValidated {
            run_id: run_id.to_string(),
            tool_call_id: tool_call_id.to_string(),
        });

        dispatch_capability(op.as_ref(), params, &connection).await
    }

    /// Park until a connection snapshot satisfies `required`. Rejects on
    /// explicit cancellation (user dismissed the prompt, or a newer call
    /// superseded this one) or on the configured timeout. The stale
    /// wait's cleanup runs before the new one is installed, so waits
    /// never leak.
    async fn wait_for_connection(
        &self,
        required: &[WalletProviderKind],
    ) -> Result<WalletConnection, WalletError> {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let wait_id = self.next_wait_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending.lock();
            if let Some(stale) = pending.take() {
                warn!("[orchestrator] Superseding pending connection wait");
                let _ = stale.cancel.send(());
            }
            *pending = Some(PendingWait {
                id: wait_id,
                cancel: cancel_tx,
            });
        }

        let mut rx = self.wallet.subscribe();
        let satisfied = async {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if snapshot.satisfies(required) {
                    return Ok(snapshot);
                }
                if rx.changed().await.is_err() {
                    return Err(WalletError::Cancelled);
                }
            }
        };

        let timeout = Duration::from_secs(self.config.connect_wait_secs);
        let result = tokio::select! {
            outcome = tokio::time::timeout(timeout, satisfied) => match outcome {
                Ok(inner) => inner,
                Err(_) => Err(WalletError::Timeout),
            },
            _ = cancel_rx => Err(WalletError::Cancelled),
        };

        // Clear our own entry only — a superseding call may already have
        // installed its wait.
        {
            let mut pending = self.pending.lock();
            if pending.as_ref().map(|p| p.id) == Some(wait_id) {
                *pending = None;
            }
        }
        result
    }

    /// User closed the connect prompt: reject the pending wait without
    /// touching the outer chat turn.
    pub fn cancel_pending_connect(&self) {
        if let Some(wait) = self.pending.lock().take() {
            info!("[orchestrator] Pending connection wait cancelled");
            let _ = wait.cancel.send(());
        }
    }

    /// Whether a gated call is currently waiting for a connection.
    pub fn has_pending_connect(&self) -> bool {
        self.pending.lock().is_some()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::operations::{Operation, OperationKind, ParameterSpec};
    use crate::engine::types::{ChainNamespace, NetworkCatalog};
    use crate::engine::wallet::discovery::{AnnouncedProvider, DiscoveryBus, ProviderInfo};
    use crate::engine::wallet::provider::WalletProvider;
    use crate::engine::wallet::testing::MockWalletProvider;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    /// Wallet-gated query that records whether validate ran.
    struct GatedQuery {
        validated: Arc<AtomicBool>,
        must_match_network: bool,
    }

    #[async_trait]
    impl Operation for GatedQuery {
        fn name(&self) -> &str {
            "gated-query"
        }
        fn description(&self) -> &str {
            "Query that needs an EVM wallet."
        }
        fn parameters(&self) -> Vec<ParameterSpec> {
            vec![ParameterSpec::string("network", "Target network", false)]
        }
        fn kind(&self) -> OperationKind {
            OperationKind::Query
        }
        fn chain_namespace(&self) -> ChainNamespace {
            ChainNamespace::Eip155
        }
        fn required_wallet_providers(&self) -> Option<Vec<WalletProviderKind>> {
            Some(vec![WalletProviderKind::Eip1193])
        }
        fn network_must_match(&self) -> bool {
            self.must_match_network
        }
        async fn validate(&self, _p: &Value, _c: &WalletConnection) -> EngineResult<bool> {
            self.validated.store(true, Ordering::SeqCst);
            Ok(true)
        }
        async fn execute_query(
            &self,
            _p: &Value,
            conn: &WalletConnection,
        ) -> EngineResult<String> {
            Ok(format!("ok on {}", conn.network_id.clone().unwrap_or_default()))
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        wallet: Arc<WalletStore>,
        events: EventBus,
        validated: Arc<AtomicBool>,
    }

    fn harness(connect_wait_secs: u64, must_match_network: bool) -> Harness {
        let bus = Arc::new(DiscoveryBus::new());
        let wallet = Arc::new(WalletStore::new(NetworkCatalog::default(), Arc::clone(&bus)));
        let mock = Arc::new(MockWalletProvider::new(
            WalletProviderKind::Eip1193,
            &["0xabc"],
            "0x1",
        ));
        let handle: Arc<dyn WalletProvider> = mock.clone();
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
        wallet.discover_providers();

        let registry = Arc::new(OperationRegistry::new());
        let validated = Arc::new(AtomicBool::new(false));
        registry.register(Arc::new(GatedQuery {
            validated: Arc::clone(&validated),
            must_match_network,
        }));

        let events = EventBus::new();
        let config = EngineConfig {
            connect_wait_secs,
            ..EngineConfig::default()
        };
        let orchestrator = Arc::new(Orchestrator::new(
            registry,
            Arc::clone(&wallet),
            events.clone(),
            config,
        ));
        Harness {
            orchestrator,
            wallet,
            events,
            validated,
        }
    }

    fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn satisfied_connection_never_signals_connect() {
        let h = harness(300, false);
        h.wallet.connect("mock", None).await.expect("connect");
        let mut rx = h.events.subscribe();

        let result = h
            .orchestrator
            .execute("r1", "call_1", "gated-query", &json!({}))
            .await
            .expect("execute");
        assert_eq!(result, "ok on 1");

        let events = drain_events(&mut rx);
        assert!(!events
            .iter()
            .any(|e| matches!(e, EngineEvent::ConnectRequired { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::ToolValidated { .. })));
    }

    #[tokio::test]
    async fn pending_call_resumes_when_connection_arrives() {
        let h = harness(300, false);
        let orchestrator = Arc::clone(&h.orchestrator);
        let task = tokio::spawn(async move {
            orchestrator
                .execute("r1", "call_1", "gated-query", &json!({}))
                .await
        });

        // Let the call park, then satisfy it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.orchestrator.has_pending_connect());
        h.wallet.connect("mock", None).await.expect("connect");

        let result = task.await.expect("join").expect("execute");
        assert_eq!(result, "ok on 1");
        assert!(!h.orchestrator.has_pending_connect());
    }

    #[tokio::test]
    async fn newer_call_cancels_the_stale_wait() {
        let h = harness(300, false);
        let o1 = Arc::clone(&h.orchestrator);
        let first = tokio::spawn(async move {
            o1.execute("r1", "call_1", "gated-query", &json!({})).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let o2 = Arc::clone(&h.orchestrator);
        let second = tokio::spawn(async move {
            o2.execute("r1", "call_2", "gated-query", &json!({})).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // First wait was superseded and rejected.
        let err = first.await.expect("join").expect_err("superseded");
        assert!(matches!(
            err,
            EngineError::Wallet(WalletError::Cancelled)
        ));

        // The second wait is still live and resolves on connect.
        h.wallet.connect("mock", None).await.expect("connect");
        second.await.expect("join").expect("execute");
    }

    #[tokio::test]
    async fn timeout_rejects_without_validating() {
        let h = harness(0, false);
        let err = h
            .orchestrator
            .execute("r1", "call_1", "gated-query", &json!({}))
            .await
            .expect_err("timeout");
        assert!(matches!(err, EngineError::Wallet(WalletError::Timeout)));
        assert!(!h.validated.load(Ordering::SeqCst));
        assert!(!h.orchestrator.has_pending_connect());
    }

    #[tokio::test]
    async fn user_cancellation_rejects_the_wait() {
        let h = harness(300, false);
        let orchestrator = Arc::clone(&h.orchestrator);
        let task = tokio::spawn(async move {
            orchestrator
                .execute("r1", "call_1", "gated-query", &json!({}))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.orchestrator.cancel_pending_connect();
        let err = task.await.expect("join").expect_err("cancelled");
        assert!(matches!(
            err,
            EngineError::Wallet(WalletError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn network_must_match_switches_before_validate() {
        let h = harness(300, true);
        h.wallet.connect("mock", None).await.expect("connect");

        let result = h
            .orchestrator
            .execute("r1", "call_1", "gated-query", &json!({"network": "base"}))
            .await
            .expect("execute");
        assert_eq!(result, "ok on 8453");
    }

    #[tokio::test]
    async fn unknown_operation_is_an_error() {
        let h = harness(300, false);
        let err = h
            .orchestrator
            .execute("r1", "call_1", "no-such-op", &json!({}))
            .await
            .expect_err("unknown");
        assert!(err.to_string().contains("unknown operation"));
    }
}
