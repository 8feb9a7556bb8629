// ── Chainpilot Engine: HTTP Retry, Circuit-Breaker, TLS Pinning & Audit ────
//
// Transport utilities shared by the chat endpoint client:
//   • exponential backoff with jitter, honoring `Retry-After`
//   • retryable-status classification (429 / 5xx family)
//   • circuit breaker that fails fast after repeated errors
//   • a certificate-pinned reqwest::Client for provider traffic
//   • SHA-256 signing of outbound request bodies into an audit trail

use log::{info, warn};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Default maximum number of retry attempts per request.
pub const MAX_RETRIES: u32 = 3;

/// First backoff step; doubles per attempt up to [`BACKOFF_CAP`].
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Longest server-provided Retry-After we will honor.
const RETRY_AFTER_CAP_SECS: u64 = 60;

// ── Retryable status detection ─────────────────────────────────────────────

/// Whether an HTTP status is transient enough to retry.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

// ── Backoff ────────────────────────────────────────────────────────────────

/// Compute the backoff for a 0-based attempt. A server-sent Retry-After
/// wins over the computed step when it is longer (capped at 60s).
fn backoff_duration(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let step = BACKOFF_BASE
        .saturating_mul(1u32 << attempt.min(16))
        .min(BACKOFF_CAP);
    let base = match retry_after_secs {
        Some(secs) => step.max(Duration::from_secs(secs.min(RETRY_AFTER_CAP_SECS))),
        None => step,
    };
    jittered(base)
}

/// Scale a duration by a pseudo-random factor in [0.75, 1.25], floored at
/// 100ms. Clock nanos are randomness enough to de-synchronize clients.
fn jittered(base: Duration) -> Duration {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let factor_milli = 750 + (nanos % 501); // 750..=1250
    let scaled = base.as_millis() as u64 * factor_milli / 1000;
    Duration::from_millis(scaled.max(100))
}

/// Sleep out the backoff for `attempt`, returning the delay that was
/// actually applied so callers can log it.
pub async fn retry_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let delay = backoff_duration(attempt, retry_after_secs);
    tokio::time::sleep(delay).await;
    delay
}

/// Parse a Retry-After header value (integer seconds only; HTTP-date
/// format falls back to the computed backoff).
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}

// ── Circuit Breaker ────────────────────────────────────────────────────────

struct BreakerState {
    consecutive_failures: u32,
    tripped_at: Option<Instant>,
}

/// Trips open after N consecutive failures and rejects requests for a
/// cooldown period; after the cooldown one probe request is let through
/// (half-open), and any success closes the circuit again.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown_secs: u64) -> Self {
        CircuitBreaker {
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                tripped_at: None,
            }),
            threshold,
            cooldown: Duration::from_secs(cooldown_secs),
        }
    }

    /// `Ok(())` if a request may proceed, `Err(message)` while open.
    pub fn check(&self) -> Result<(), String> {
        let state = self.state.lock();
        if state.consecutive_failures < self.threshold {
            return Ok(());
        }
        match state.tripped_at {
            Some(tripped) if tripped.elapsed() < self.cooldown => Err(format!(
                "Circuit breaker open: {} consecutive failures, cooling down for {}s",
                state.consecutive_failures,
                (self.cooldown - tripped.elapsed()).as_secs()
            )),
            // Cooldown expired — half-open, allow one probe through.
            _ => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.tripped_at = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.tripped_at = Some(Instant::now());
            warn!(
                "[circuit-breaker] Tripped after {} consecutive failures — cooling down {}s",
                state.consecutive_failures,
                self.cooldown.as_secs()
            );
        }
    }
}

// ── Certificate-Pinned Client Factory ──────────────────────────────────────
//
// The chat endpoint is resolved through a rustls root store holding only
// the Mozilla roots, so a CA installed on the user's OS cannot MITM the
// traffic. One shared client, one connection pool.

use reqwest::Client;
use rustls::ClientConfig;
use std::sync::LazyLock;

/// Build a `rustls::ClientConfig` pinned to the Mozilla root certificates.
///
/// Uses an explicit `ring` CryptoProvider rather than the process-level
/// default so the config works in unit-test binaries where no global
/// provider has been installed.
fn pinned_tls_config() -> ClientConfig {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("Failed to set default TLS protocol versions")
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

static PINNED_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .use_preconfigured_tls(pinned_tls_config())
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .build()
        .expect("Failed to build certificate-pinned reqwest::Client")
});

/// The shared certificate-pinned HTTP client. Providers call this instead
/// of `Client::builder().build()`.
pub fn pinned_client() -> Client {
    PINNED_CLIENT.clone()
}

// ── Outbound Request Signing & Audit ───────────────────────────────────────
//
// Every chat request body is hashed (`provider || model || timestamp ||
// body`) into a bounded in-memory log before send: tamper detection for
// proxied traffic plus an exportable audit trail. Timestamps make each
// hash unique.

#[derive(Debug, Clone)]
pub struct RequestAuditEntry {
    /// ISO-8601 timestamp of the outbound request.
    pub timestamp: String,
    pub provider: String,
    pub model: String,
    /// SHA-256 hex digest of `provider || model || timestamp || body`.
    pub hash: String,
    /// HTTP status of the response (0 until one arrives).
    pub status: u16,
}

const AUDIT_LOG_CAPACITY: usize = 500;

/// Bounded FIFO of recent outbound requests, newest at the back.
pub struct RequestAuditLog {
    entries: VecDeque<RequestAuditEntry>,
    total: u64,
}

impl RequestAuditLog {
    pub fn new() -> Self {
        RequestAuditLog {
            entries: VecDeque::with_capacity(AUDIT_LOG_CAPACITY),
            total: 0,
        }
    }

    /// Append an entry, evicting the oldest once at capacity.
    pub fn push(&mut self, entry: RequestAuditEntry) {
        if self.entries.len() == AUDIT_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.total += 1;
    }

    /// Up to `limit` recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RequestAuditEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    /// Total entries ever written (including evicted ones).
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl Default for RequestAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

static AUDIT_LOG: LazyLock<Mutex<RequestAuditLog>> =
    LazyLock::new(|| Mutex::new(RequestAuditLog::new()));

/// Hash an outbound request into the audit log. Call immediately before
/// `.send()`. Returns the hex digest for debug logging.
pub fn sign_and_log_request(provider: &str, model: &str, body_bytes: &[u8]) -> String {
    let now = chrono::Utc::now().to_rfc3339();
    let mut hasher = Sha256::new();
    for part in [provider.as_bytes(), model.as_bytes(), now.as_bytes(), body_bytes] {
        hasher.update(part);
    }
    let hash_hex: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    info!(
        "[security] Outbound request signed: provider={} model={} hash={}",
        provider,
        model,
        &hash_hex[..16]
    );

    AUDIT_LOG.lock().push(RequestAuditEntry {
        timestamp: now,
        provider: provider.to_string(),
        model: model.to_string(),
        hash: hash_hex.clone(),
        status: 0,
    });
    hash_hex
}

/// Stamp the response status onto the newest audit entry.
pub fn update_last_audit_status(status: u16) {
    if let Some(entry) = AUDIT_LOG.lock().entries.back_mut() {
        entry.status = status;
    }
}

/// Recent audit entries, newest first.
pub fn recent_audit_entries(limit: usize) -> Vec<RequestAuditEntry> {
    AUDIT_LOG.lock().recent(limit)
}

// ── Tests ──────────────────────────────────────────────────────────────────
