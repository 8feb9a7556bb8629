// Chainpilot Engine — Provider discovery handshake
//
// Wallet extensions and the client never hold direct references to each
// other: the client broadcasts a "request providers" signal and passively
// accumulates "provider announced" responses. Extensions register a
// responder (answered on every request) and may also announce late,
// after the initial sweep. The catalog built from announcements is
// purely additive for the life of a session.

use crate::engine::wallet::provider::WalletProvider;
use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity a wallet extension announces about itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderInfo {
    /// Stable id unique within the session.
    pub id: String,
    /// Display name ("Example Wallet").
    pub name: String,
    /// Data-URI or URL of the wallet's icon.
    pub icon: String,
    /// Reverse-DNS namespace ("com.example.wallet") — used to re-identify
    /// the same extension across reconnects.
    pub rdns: String,
}

/// One announcement: identity plus the capability handle.
#[derive(Clone)]
pub struct AnnouncedProvider {
    pub info: ProviderInfo,
    pub handle: Arc<dyn WalletProvider>,
}

impl fmt::Debug for AnnouncedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnnouncedProvider")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

type Responder = Box<dyn Fn() -> Vec<AnnouncedProvider> + Send + Sync>;
type Listener = Box<dyn Fn(AnnouncedProvider) + Send + Sync>;

/// The broadcast/announce rendezvous point.
pub struct DiscoveryBus {
    responders: Mutex<Vec<Responder>>,
    listeners: Mutex<Vec<Listener>>,
}

impl DiscoveryBus {
    pub fn new() -> Self {
        DiscoveryBus {
            responders: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Extension side: answer every future `broadcast_request`.
    pub fn register_responder<F>(&self, responder: F)
    where
        F: Fn() -> Vec<AnnouncedProvider> + Send + Sync + 'static,
    {
        self.responders.lock().push(Box::new(responder));
    }

    /// Client side: be told about every announcement, including late ones.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(AnnouncedProvider) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Box::new(listener));
    }

    /// Push one announcement to all listeners (an extension announcing
    /// outside the request/response sweep).
    pub fn announce(&self, provider: AnnouncedProvider) {
        info!(
            "[wallet] Provider announced: {} ({})",
            provider.info.name, provider.info.rdns
        );
        for listener in self.listeners.lock().iter() {
            listener(provider.clone());
        }
    }

    /// Broadcast the discovery signal; every registered responder answers
    /// through `announce`. Safe to call repeatedly.
    pub fn broadcast_request(&self) {
        let announced: Vec<AnnouncedProvider> = self
            .responders
            .lock()
            .iter()
            .flat_map(|r| r())
            .collect();
        for provider in announced {
            self.announce(provider);
        }
    }
}

impl Default for DiscoveryBus {
    fn default() -> Self {
        Self::new()
    }
}
