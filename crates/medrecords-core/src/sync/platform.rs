//! Ports to the host platform: connectivity, credentials and app lifecycle.
//!
//! The host app implements these (or feeds the provided value-backed
//! implementations) and injects them into the scheduler.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;

/// Reports whether the device can reach the network.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Supplies the bearer token for remote calls.
///
/// `None` means not authenticated.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Option<String>;
}

/// Foreground/background state of the host app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycle {
    Foreground,
    Background,
}

/// Source of lifecycle transitions.
///
/// Each subscriber gets its own receiver; dropping it detaches the
/// subscriber without affecting others.
pub trait LifecycleSource: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<AppLifecycle>;
}

/// Connectivity flag set by the host.
#[derive(Debug)]
pub struct StaticConnectivity {
    online: AtomicBool,
}

impl StaticConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for StaticConnectivity {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Token held in memory and replaced by the host on refresh or sign-out.
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Option<String> {
        self.token
            .read()
            .clone()
            .filter(|token| !token.trim().is_empty())
    }
}

/// Lifecycle source driven by explicit notifications.
#[derive(Debug)]
pub struct ManualLifecycle {
    sender: watch::Sender<AppLifecycle>,
}

impl ManualLifecycle {
    pub fn new(initial: AppLifecycle) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Publish a transition. Repeating the current state is not a transition.
    pub fn set(&self, state: AppLifecycle) {
        self.sender.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    pub fn current(&self) -> AppLifecycle {
        *self.sender.borrow()
    }
}

impl LifecycleSource for ManualLifecycle {
    fn subscribe(&self) -> watch::Receiver<AppLifecycle> {
        self.sender.subscribe()
    }
}
