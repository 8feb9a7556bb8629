// engine/state.rs — Shared engine state and the abort signal.
// The engine never reaches for ambient globals: everything a turn needs
// is carried in an explicitly constructed `EngineState`, so tests can
// instantiate isolated instances per case.

use crate::engine::assembler::ToolCallAssembler;
use crate::engine::events::EventBus;
use crate::engine::operations::OperationRegistry;
use crate::engine::orchestrator::Orchestrator;
use crate::engine::types::EngineConfig;
use crate::engine::wallet::discovery::DiscoveryBus;
use crate::engine::wallet::WalletStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cancellation token shared across a whole recursive chat turn.
/// Checked at every suspension point: the SSE read, each tool execution,
/// and the top of each round.
#[derive(Clone)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Request the turn to stop. Partial streamed content is still
    /// committed to history by the loop's cleanup path.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Reset the signal (called when starting a new turn).
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The engine's dependency-injection context: one registry, one wallet
/// store, one orchestrator, one assembler, one event bus per session.
pub struct EngineState {
    pub config: EngineConfig,
    pub registry: Arc<OperationRegistry>,
    pub wallet: Arc<WalletStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub assembler: Arc<ToolCallAssembler>,
    pub events: EventBus,
}

impl EngineState {
    /// Wire up a complete engine. The discovery bus is passed in so the
    /// host can register wallet-extension responders before or after
    /// construction.
    pub fn new(config: EngineConfig, discovery: Arc<DiscoveryBus>) -> Self {
        let events = EventBus::new();
        let registry = Arc::new(OperationRegistry::new());
        let wallet = Arc::new(
            WalletStore::new(config.networks.clone(), discovery)
                .with_request_timeout(Duration::from_secs(config.connect_request_secs)),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&wallet),
            events.clone(),
            config.clone(),
        ));
        EngineState {
            config,
            registry,
            wallet,
            orchestrator,
            assembler: Arc::new(ToolCallAssembler::new()),
            events,
        }
    }
}
