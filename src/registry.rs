use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::envelope::{Direction, MessageEnvelope, MessageKind};

/// Handler invoked on dispatch. Handlers receive a borrowed envelope and must
/// not assume ownership of payload buffers beyond the call.
pub type EnvelopeHandler = Arc<dyn Fn(&MessageEnvelope) + Send + Sync>;

/// Mapping of `(kind, direction)` to at most one handler. Populated once
/// during subsystem init and effectively read-only at runtime;
/// re-registration replaces the prior handler (last writer wins).
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<(MessageKind, Direction), EnvelopeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register<F>(&self, kind: MessageKind, direction: Direction, handler: F)
    where
        F: Fn(&MessageEnvelope) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.lock() {
            if handlers.insert((kind, direction), Arc::new(handler)).is_some() {
                warn!("Replacing handler for {:?}/{:?}", kind, direction);
            } else {
                debug!("Registered handler for {:?}/{:?}", kind, direction);
            }
        }
    }

    pub fn unregister(&self, kind: MessageKind, direction: Direction) {
        if let Ok(mut handlers) = self.handlers.lock() {
            if handlers.remove(&(kind, direction)).is_some() {
                debug!("Unregistered handler for {:?}/{:?}", kind, direction);
            }
        }
    }

    /// Clone out the handler so it is invoked without holding the map lock.
    pub fn lookup(&self, kind: MessageKind, direction: Direction) -> Option<EnvelopeHandler> {
        self.handlers
            .lock()
            .ok()
            .and_then(|handlers| handlers.get(&(kind, direction)).cloned())
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_register_and_lookup() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicU32::new(0));

        let counter = hits.clone();
        registry.register(MessageKind::Trace, Direction::Rx, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let handler = registry
            .lookup(MessageKind::Trace, Direction::Rx)
            .expect("handler registered");
        handler(&MessageEnvelope::user_data(vec![]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(registry.lookup(MessageKind::Trace, Direction::Tx).is_none());
    }

    #[test]
    fn test_reregistration_replaces() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicU32::new(0));

        registry.register(MessageKind::UserData, Direction::Rx, |_| {});
        let counter = hits.clone();
        registry.register(MessageKind::UserData, Direction::Rx, move |_| {
            counter.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(registry.len(), 1);

        let handler = registry
            .lookup(MessageKind::UserData, Direction::Rx)
            .unwrap();
        handler(&MessageEnvelope::user_data(vec![]));
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_unregister() {
        let registry = HandlerRegistry::new();
        registry.register(MessageKind::Command, Direction::Rx, |_| {});
        registry.unregister(MessageKind::Command, Direction::Rx);
        assert!(registry.lookup(MessageKind::Command, Direction::Rx).is_none());
        assert!(registry.is_empty());
    }
}
