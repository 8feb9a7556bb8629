// Chainpilot Engine — Operation Contract & Registry
//
// Every tool the model can invoke is an `Operation`: shared metadata and
// a validate-then-execute contract, with exactly one live capability
// selected by a sealed kind tag (transaction / query / wallet action).
// The registry maps names to live operations and derives the model's
// function-calling schemas from the current set on every call — tools
// registered mid-session appear on the very next model turn.

use crate::atoms::error::{EngineError, EngineResult, WalletError};
use crate::engine::types::{ChainNamespace, FunctionDefinition, ToolDefinition};
use crate::engine::wallet::provider::WalletProviderKind;
use crate::engine::wallet::WalletConnection;
use async_trait::async_trait;
use log::{info, warn};
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

// ── Parameter schema ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamKind {
    fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
        }
    }
}

/// Declarative description of one operation parameter; the JSON schema
/// the model sees is derived from these.
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
    pub allowed_values: Option<Vec<String>>,
}

impl ParameterSpec {
    pub fn new(
        name: impl Into<String>,
        kind: ParamKind,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        ParameterSpec {
            name: name.into(),
            kind,
            description: description.into(),
            required,
            allowed_values: None,
        }
    }

    pub fn string(name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        Self::new(name, ParamKind::String, description, required)
    }

    /// Restrict the parameter to an enumerated value set.
    pub fn with_allowed(mut self, values: &[&str]) -> Self {
        self.allowed_values = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }
}

// ── Operation contract ─────────────────────────────────────────────────

/// Sealed capability tag. Dispatch matches on this exhaustively, so a
/// mis-tagged operation fails loudly instead of silently no-opping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Builds and signs a transaction through the wallet; returns the
    /// signed result id (tx hash).
    Transaction,
    /// Read-only lookup; returns result text.
    Query,
    /// Wallet-local action (sign a message, add an asset); returns
    /// result text.
    WalletAction,
}

#[async_trait]
pub trait Operation: Send + Sync {
    /// Unique key in the registry.
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Vec<ParameterSpec>;
    fn kind(&self) -> OperationKind;
    fn chain_namespace(&self) -> ChainNamespace;

    /// Provider families that must be connected before this operation
    /// may run. `None` (or empty) means no wallet is needed.
    fn required_wallet_providers(&self) -> Option<Vec<WalletProviderKind>> {
        None
    }

    /// Whether the wallet's active network must match the call's target
    /// network before execution.
    fn network_must_match(&self) -> bool {
        false
    }

    /// Precondition check. Returning `Ok(false)` means "invalid
    /// parameters"; returning a descriptive error is the canonical way
    /// to tell the model *why* the call can't proceed. Must be free of
    /// side effects.
    async fn validate(&self, params: &Value, connection: &WalletConnection)
        -> EngineResult<bool>;

    async fn build_transaction(
        &self,
        _params: &Value,
        _connection: &WalletConnection,
    ) -> EngineResult<String> {
        Err(EngineError::operation(
            self.name(),
            "operation does not support build_transaction",
        ))
    }

    async fn execute_query(
        &self,
        _params: &Value,
        _connection: &WalletConnection,
    ) -> EngineResult<String> {
        Err(EngineError::operation(
            self.name(),
            "operation does not support execute_query",
        ))
    }

    async fn execute_request(&self, _params: &Value) -> EngineResult<String> {
        Err(EngineError::operation(
            self.name(),
            "operation does not support execute_request",
        ))
    }
}

// ── Schema derivation ──────────────────────────────────────────────────

/// Derive the model-facing function schema for one operation.
pub fn tool_definition_for(op: &dyn Operation) -> ToolDefinition {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in op.parameters() {
        let mut schema = Map::new();
        schema.insert("type".into(), json!(param.kind.as_str()));
        schema.insert("description".into(), json!(param.description));
        if let Some(values) = &param.allowed_values {
            schema.insert("enum".into(), json!(values));
        }
        if param.required {
            required.push(param.name.clone());
        }
        properties.insert(param.name.clone(), Value::Object(schema));
    }
    ToolDefinition {
        tool_type: "function".into(),
        function: FunctionDefinition {
            name: op.name().to_string(),
            description: op.description().to_string(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        },
    }
}

// ── Dispatch helpers ───────────────────────────────────────────────────

/// Enforce an operation's provider requirement against the connection.
pub fn check_wallet_requirement(
    op: &dyn Operation,
    connection: &WalletConnection,
) -> Result<(), WalletError> {
    let required = match op.required_wallet_providers() {
        Some(r) if !r.is_empty() => r,
        _ => return Ok(()),
    };
    if !connection.is_connected() {
        return Err(WalletError::NotConnected);
    }
    if !connection.satisfies(&required) {
        let names: Vec<String> = required
            .iter()
            .map(|k| format!("{:?}", k).to_lowercase())
            .collect();
        return Err(WalletError::WrongProvider {
            required: names.join(", "),
        });
    }
    Ok(())
}

/// Invoke the single capability an operation's kind selects.
pub async fn dispatch_capability(
    op: &dyn Operation,
    params: &Value,
    connection: &WalletConnection,
) -> EngineResult<String> {
    match op.kind() {
        OperationKind::Transaction => op.build_transaction(params, connection).await,
        OperationKind::Query => op.execute_query(params, connection).await,
        OperationKind::WalletAction => op.execute_request(params).await,
    }
}

// ── Registry ───────────────────────────────────────────────────────────

pub struct OperationRegistry {
    ops: RwLock<HashMap<String, Arc<dyn Operation>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        OperationRegistry {
            ops: RwLock::new(HashMap::new()),
        }
    }

    /// Insert an operation, overwriting any previous one with the same
    /// name — names are unique in the registry at all times.
    pub fn register(&self, op: Arc<dyn Operation>) {
        let name = op.name().to_string();
        let previous = self.ops.write().insert(name.clone(), op);
        if previous.is_some() {
            warn!("[registry] Operation '{}' re-registered (overwritten)", name);
        } else {
            info!("[registry] Operation '{}' registered", name);
        }
    }

    /// Remove an operation by name. No-op if absent.
    pub fn deregister(&self, name: &str) {
        if self.ops.write().remove(name).is_some() {
            info!("[registry] Operation '{}' deregistered", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.ops.read().get(name).cloned()
    }

    /// Registered operation names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ops.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Derive the model's tool-definition array from the live set.
    /// Regenerated on every call, never cached, so mid-session
    /// registrations are reflected on the very next turn.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let ops = self.ops.read();
        let mut defs: Vec<ToolDefinition> =
            ops.values().map(|op| tool_definition_for(op.as_ref())).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// The single dispatch entry point: lookup → wallet check → validate
    /// → capability. Side-effect-free until validate has passed.
    pub async fn execute_tool_call(
        &self,
        name: &str,
        params: &Value,
        connection: &WalletConnection,
    ) -> EngineResult<String> {
        let op = self
            .get(name)
            .ok_or_else(|| EngineError::operation(name, "unknown operation"))?;
        check_wallet_requirement(op.as_ref(), connection)?;
        if !op.validate(params, connection).await? {
            return Err(EngineError::operation(name, "invalid parameters"));
        }
        dispatch_capability(op.as_ref(), params, connection).await
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Read-only balance lookup — no wallet needed.
    struct BalanceQuery;

    #[async_trait]
    impl Operation for BalanceQuery {
        fn name(&self) -> &str {
            "get-balance"
        }
        fn description(&self) -> &str {
            "Look up the balance of an address."
        }
        fn parameters(&self) -> Vec<ParameterSpec> {
            vec![
                ParameterSpec::string("address", "Address to inspect", true),
                ParameterSpec::string("network", "Network name", false)
                    .with_allowed(&["ethereum", "base"]),
            ]
        }
        fn kind(&self) -> OperationKind {
            OperationKind::Query
        }
        fn chain_namespace(&self) -> ChainNamespace {
            ChainNamespace::Eip155
        }
        async fn validate(&self, params: &Value, _conn: &WalletConnection) -> EngineResult<bool> {
            Ok(params["address"].is_string())
        }
        async fn execute_query(
            &self,
            _params: &Value,
            _conn: &WalletConnection,
        ) -> EngineResult<String> {
            Ok("12.5 ETH".into())
        }
    }

    /// Token transfer — needs an EVM wallet, validates funds.
    struct TransferOp;

    #[async_trait]
    impl Operation for TransferOp {
        fn name(&self) -> &str {
            "transfer-token"
        }
        fn description(&self) -> &str {
            "Transfer tokens to another address."
        }
        fn parameters(&self) -> Vec<ParameterSpec> {
            vec![
                ParameterSpec::string("to", "Recipient address", true),
                ParameterSpec::new("amount", ParamKind::Number, "Amount to send", true),
            ]
        }
        fn kind(&self) -> OperationKind {
            OperationKind::Transaction
        }
        fn chain_namespace(&self) -> ChainNamespace {
            ChainNamespace::Eip155
        }
        fn required_wallet_providers(&self) -> Option<Vec<WalletProviderKind>> {
            Some(vec![WalletProviderKind::Eip1193])
        }
        async fn validate(&self, params: &Value, _conn: &WalletConnection) -> EngineResult<bool> {
            if params["amount"].as_f64().unwrap_or(0.0) > 100.0 {
                return Err(EngineError::operation(self.name(), "insufficient funds"));
            }
            Ok(params["to"].is_string())
        }
        async fn build_transaction(
            &self,
            _params: &Value,
            _conn: &WalletConnection,
        ) -> EngineResult<String> {
            Ok("0xsigned".into())
        }
    }

    fn connected_evm() -> WalletConnection {
        use crate::engine::wallet::ConnectionPhase;
        let mut conn = WalletConnection::disconnected();
        conn.phase = ConnectionPhase::Connected;
        conn.address = Some("0xabc".into());
        conn.network_id = Some("1".into());
        conn.provider_kind = Some(WalletProviderKind::Eip1193);
        conn
    }

    #[test]
    fn schema_carries_required_and_enum() {
        let def = tool_definition_for(&BalanceQuery);
        assert_eq!(def.function.name, "get-balance");
        let params = &def.function.parameters;
        assert_eq!(params["required"], json!(["address"]));
        assert_eq!(params["properties"]["network"]["enum"], json!(["ethereum", "base"]));
        assert_eq!(params["properties"]["address"]["type"], "string");
    }

    #[test]
    fn register_deregister_round_trips() {
        let registry = OperationRegistry::new();
        registry.register(Arc::new(BalanceQuery));
        let before = serde_json::to_string(&registry.tool_definitions()).expect("json");

        registry.register(Arc::new(TransferOp));
        assert_eq!(registry.list(), vec!["get-balance", "transfer-token"]);

        registry.deregister("transfer-token");
        let after = serde_json::to_string(&registry.tool_definitions()).expect("json");
        assert_eq!(before, after);

        // Deregistering an absent name is a no-op.
        registry.deregister("transfer-token");
        assert_eq!(registry.list(), vec!["get-balance"]);
    }

    #[test]
    fn reregistration_overwrites() {
        let registry = OperationRegistry::new();
        registry.register(Arc::new(BalanceQuery));
        registry.register(Arc::new(BalanceQuery));
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn unknown_operation_errors() {
        let registry = OperationRegistry::new();
        let err = registry
            .execute_tool_call("nope", &json!({}), &WalletConnection::disconnected())
            .await
            .expect_err("unknown");
        assert!(err.to_string().contains("unknown operation"));
    }

    #[tokio::test]
    async fn query_dispatches_without_wallet() {
        let registry = OperationRegistry::new();
        registry.register(Arc::new(BalanceQuery));
        let result = registry
            .execute_tool_call(
                "get-balance",
                &json!({"address": "0xabc"}),
                &WalletConnection::disconnected(),
            )
            .await
            .expect("query");
        assert_eq!(result, "12.5 ETH");
    }

    #[tokio::test]
    async fn wallet_requirement_blocks_before_validate() {
        let registry = OperationRegistry::new();
        registry.register(Arc::new(TransferOp));
        let err = registry
            .execute_tool_call(
                "transfer-token",
                // Would also fail validation — the wallet check must win.
                &json!({"to": 5, "amount": 1.0}),
                &WalletConnection::disconnected(),
            )
            .await
            .expect_err("wallet required");
        assert!(matches!(
            err,
            EngineError::Wallet(WalletError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn invalid_parameters_never_reach_the_capability() {
        let registry = OperationRegistry::new();
        registry.register(Arc::new(TransferOp));
        let err = registry
            .execute_tool_call(
                "transfer-token",
                &json!({"to": 5, "amount": 1.0}),
                &connected_evm(),
            )
            .await
            .expect_err("invalid");
        assert!(err.to_string().contains("invalid parameters"));
    }

    #[tokio::test]
    async fn validation_errors_propagate_verbatim() {
        let registry = OperationRegistry::new();
        registry.register(Arc::new(TransferOp));
        let err = registry
            .execute_tool_call(
                "transfer-token",
                &json!({"to": "0xdef", "amount": 500.0}),
                &connected_evm(),
            )
            .await
            .expect_err("insufficient");
        assert!(err.to_string().contains("insufficient funds"));
    }

    #[tokio::test]
    async fn transaction_capability_dispatches() {
        let registry = OperationRegistry::new();
        registry.register(Arc::new(TransferOp));
        let result = registry
            .execute_tool_call(
                "transfer-token",
                &json!({"to": "0xdef", "amount": 1.0}),
                &connected_evm(),
            )
            .await
            .expect("transaction");
        assert_eq!(result, "0xsigned");
    }

    #[tokio::test]
    async fn mistagged_capability_fails_loudly() {
        /// Declares Transaction but only implements execute_query.
        struct Broken;
        #[async_trait]
        impl Operation for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn description(&self) -> &str {
                "mis-tagged"
            }
            fn parameters(&self) -> Vec<ParameterSpec> {
                vec![]
            }
            fn kind(&self) -> OperationKind {
                OperationKind::Transaction
            }
            fn chain_namespace(&self) -> ChainNamespace {
                ChainNamespace::Eip155
            }
            async fn validate(&self, _p: &Value, _c: &WalletConnection) -> EngineResult<bool> {
                Ok(true)
            }
        }
        let registry = OperationRegistry::new();
        registry.register(Arc::new(Broken));
        let err = registry
            .execute_tool_call("broken", &json!({}), &connected_evm())
            .await
            .expect_err("unsupported");
        assert!(err.to_string().contains("does not support build_transaction"));
    }
}
