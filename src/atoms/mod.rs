// ── Chainpilot Atoms Layer ─────────────────────────────────────────────────
// Leaf types with no engine dependencies: error enums and aliases.

pub mod error;
