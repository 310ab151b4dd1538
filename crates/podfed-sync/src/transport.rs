//! Transport abstraction for federation messages.
//!
//! The transport layer handles message serialization and delivery.
//! The server uses HTTP; tests use the in-memory [`memory::MemoryNetwork`].

use async_trait::async_trait;

use podfed_core::PodHost;

use crate::error::Result;
use crate::messages::{PodMessage, PodReply};

/// Transport trait for request/reply messaging between pods.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to a pod and wait for its reply.
    ///
    /// Any error (connection failure, timeout, non-success status) is a
    /// transient delivery failure from the caller's point of view.
    async fn send(&self, to: &PodHost, message: PodMessage) -> Result<PodReply>;

    /// The host this transport sends from.
    fn local_host(&self) -> &PodHost;
}

/// Receiving side of a transport.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: PodMessage) -> PodReply;
}

/// A simple in-memory transport for testing.
///
/// Delivery is a direct call into the destination's handler. Hosts can be
/// marked unreachable to simulate outages.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Weak};
    use tokio::sync::RwLock;

    use crate::error::SyncError;

    /// Shared state for the memory transport network.
    #[derive(Default)]
    pub struct MemoryNetwork {
        handlers: RwLock<HashMap<PodHost, Weak<dyn MessageHandler>>>,
        unreachable: RwLock<HashSet<PodHost>>,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a transport sending from `host`.
        pub fn transport(self: &Arc<Self>, host: PodHost) -> MemoryTransport {
            MemoryTransport {
                host,
                network: Arc::clone(self),
            }
        }

        /// Attach the handler receiving messages for `host`.
        ///
        /// Held weakly: a pod owns its transport, so a strong reference here
        /// would keep every pod alive for the lifetime of the network.
        pub async fn register(&self, host: PodHost, handler: Weak<dyn MessageHandler>) {
            self.handlers.write().await.insert(host, handler);
        }

        /// Take a host off (or put it back on) the network.
        pub async fn set_reachable(&self, host: &PodHost, reachable: bool) {
            let mut unreachable = self.unreachable.write().await;
            if reachable {
                unreachable.remove(host);
            } else {
                unreachable.insert(host.clone());
            }
        }

        async fn deliver(&self, from: &PodHost, to: &PodHost, message: PodMessage) -> Result<PodReply> {
            {
                let unreachable = self.unreachable.read().await;
                if unreachable.contains(to) || unreachable.contains(from) {
                    return Err(SyncError::Delivery {
                        host: to.to_string(),
                        reason: "host unreachable".into(),
                    });
                }
            }

            let handler = self.handlers.read().await.get(to).and_then(Weak::upgrade);
            match handler {
                Some(handler) => Ok(handler.handle_message(message).await),
                None => Err(SyncError::Delivery {
                    host: to.to_string(),
                    reason: "no such host".into(),
                }),
            }
        }
    }

    /// In-memory transport implementation.
    pub struct MemoryTransport {
        host: PodHost,
        network: Arc<MemoryNetwork>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, to: &PodHost, message: PodMessage) -> Result<PodReply> {
            self.network.deliver(&self.host, to, message).await
        }

        fn local_host(&self) -> &PodHost {
            &self.host
        }
    }
}
