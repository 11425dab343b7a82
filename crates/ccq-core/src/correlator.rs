//! Routes inbound responses to the listener registered for their request id.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::{
    domain::RequestId,
    protocol::{Response, WireError},
};

/// Receives every response correlated to one request id.
pub type Handler = Arc<dyn Fn(Response) + Send + Sync>;

/// Listener registry shared by the transport reader and request issuers.
///
/// Handlers are invoked outside the map's shard locks, so a handler may call back into
/// the registry.
#[derive(Default)]
pub struct Correlator {
    listeners: DashMap<RequestId, Handler>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `id`, replacing any previous handler for it.
    pub fn register_listener(&self, id: RequestId, handler: Handler) {
        if self.listeners.insert(id.clone(), handler).is_some() {
            debug!(request_id = %id, "replaced existing listener");
        }
    }

    /// Register and return a guard that deregisters when dropped.
    pub fn register_scoped(self: &Arc<Self>, id: RequestId, handler: Handler) -> ListenerGuard {
        self.register_listener(id.clone(), handler);
        ListenerGuard {
            correlator: Arc::clone(self),
            id,
        }
    }

    /// Deliver `response` to its listener. Terminal kinds release the listener first.
    ///
    /// Returns `false` when no listener exists; the response is dropped.
    pub fn dispatch(&self, response: Response) -> bool {
        let handler = if response.is_terminal() {
            self.listeners.remove(&response.id).map(|(_, h)| h)
        } else {
            self.listeners.get(&response.id).map(|h| Arc::clone(h.value()))
        };

        match handler {
            Some(handler) => {
                handler(response);
                true
            }
            None => {
                debug!(request_id = %response.id, kind = ?response.kind, "dropping response without listener");
                false
            }
        }
    }

    pub fn deregister(&self, id: &RequestId) -> bool {
        self.listeners.remove(id).is_some()
    }

    /// Terminate every in-flight request with `error` (used when the channel is lost).
    pub fn fail_all(&self, error: WireError) -> usize {
        let ids: Vec<RequestId> = self.listeners.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if self.dispatch(Response::error(id, error.clone())) {
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.listeners.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Scoped registration: the listener is released when the guard goes away, whether the
/// request completed, failed, or was abandoned by its consumer.
pub struct ListenerGuard {
    correlator: Arc<Correlator>,
    id: RequestId,
}

impl ListenerGuard {
    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if self.correlator.deregister(&self.id) {
            debug!(request_id = %self.id, "released listener of abandoned request");
        }
    }
}
