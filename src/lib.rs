//! Chainpilot — wallet-aware AI chat orchestration core.
//!
//! Lets a user converse with an LLM chat endpoint while the model
//! autonomously invokes blockchain operations mid-conversation. Three
//! tightly coupled subsystems do the heavy lifting:
//!
//! * the streaming chat loop ([`engine::agent_loop`]) reconstructs
//!   tool-call requests out of partial network chunks and recursively
//!   resumes the conversation after executing them;
//! * the operation registry ([`engine::operations`]) gives every tool a
//!   uniform validate-then-execute contract;
//! * the wallet connection store ([`engine::wallet`]) discovers browser
//!   wallet providers, connects to one, tracks external account/network
//!   changes, and lets in-flight executions block on a connection that
//!   may arrive seconds later, be rejected, or time out.
//!
//! The crate is UI-agnostic: anything that subscribes to the
//! [`engine::events::EventBus`] can render a live turn.

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult, ProviderError, WalletError};
pub use engine::agent_loop::run_chat_turn;
pub use engine::assembler::{ToolCallAssembler, ToolCallStream};
pub use engine::events::{EngineEvent, EventBus};
pub use engine::operations::{
    Operation, OperationKind, OperationRegistry, ParamKind, ParameterSpec,
};
pub use engine::orchestrator::Orchestrator;
pub use engine::providers::{AnyProvider, ChatProvider};
pub use engine::state::{AbortSignal, EngineState};
pub use engine::types::{ChainNamespace, EngineConfig, Message, NetworkCatalog, Role};
pub use engine::wallet::discovery::{AnnouncedProvider, DiscoveryBus, ProviderInfo};
pub use engine::wallet::provider::{ProviderEvent, WalletProvider, WalletProviderKind};
pub use engine::wallet::{ConnectionPhase, WalletConnection, WalletStore};
