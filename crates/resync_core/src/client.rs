//! Authorized client handles.
//!
//! A [`ClientHandle`] is what the pool hands out: the backend address, an
//! access token obtained once at pool construction, and per-request
//! transport settings. Handles are immutable after construction.

use crate::config::ProviderConfig;
use crate::error::{SyncError, SyncResult};
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// OAuth client credentials.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    /// Client id.
    pub client_id: String,
    /// Client secret. Wiped on drop.
    pub client_secret: String,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Per-request transport settings shared by every handle of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// User agent header.
    pub user_agent: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agent: format!("resync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// An authorized, immutable backend client.
#[derive(Clone)]
pub struct ClientHandle {
    slot: usize,
    base_url: String,
    access_token: String,
    settings: TransportSettings,
}

impl ClientHandle {
    /// Creates a handle.
    pub fn new(
        slot: usize,
        base_url: impl Into<String>,
        access_token: impl Into<String>,
        settings: TransportSettings,
    ) -> Self {
        Self {
            slot,
            base_url: base_url.into(),
            access_token: access_token.into(),
            settings,
        }
    }

    /// Pool slot this handle was built for.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Backend base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Bearer token.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Transport settings.
    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Returns a pool factory that authorizes one handle per slot.
    pub fn factory(
        config: &ProviderConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> impl Fn(usize) -> SyncResult<ClientHandle> + Send + Sync + 'static {
        let base_url = config.base_url.clone();
        let credentials = config.credentials.clone();
        let settings = TransportSettings {
            request_timeout: config.request_timeout,
            user_agent: config.user_agent.clone(),
        };

        move |slot| {
            let token = authenticator.authenticate(&base_url, &credentials)?;
            debug!(slot, base_url = %base_url, "authorized pool client");
            Ok(ClientHandle::new(slot, base_url.clone(), token, settings.clone()))
        }
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("slot", &self.slot)
            .field("base_url", &self.base_url)
            .field("access_token", &"<redacted>")
            .field("settings", &self.settings)
            .finish()
    }
}

/// Obtains an access token for a set of credentials.
pub trait Authenticator: Send + Sync {
    /// Exchanges credentials for a bearer token.
    fn authenticate(&self, base_url: &str, credentials: &Credentials) -> SyncResult<String>;
}

/// Authenticator that hands out a fixed token.
///
/// Used by tests and the simulator; can be told to fail or to stall.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    token: String,
    delay: Duration,
    fail_after: Option<usize>,
    calls: AtomicUsize,
}

impl StaticTokenAuthenticator {
    /// Creates an authenticator returning `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }

    /// Sleeps this long before every token exchange.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fails every exchange after the first `n` succeed.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Number of exchanges attempted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, _base_url: &str, credentials: &Credentials) -> SyncResult<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail_after.is_some_and(|n| call >= n) {
            return Err(SyncError::Authentication(format!(
                "client '{}' rejected",
                credentials.client_id
            )));
        }
        Ok(self.token.clone())
    }
}
