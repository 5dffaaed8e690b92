//! Cancel-request registry.
//!
//! Maps the `(ProcessID, SecretKey)` a client received in its synthetic
//! BackendKeyData to the backend coordinates of the pooled connection that
//! key belongs to. The synthetic key IS the backend's own key for that
//! connection, so a CancelRequest can be replayed verbatim.

use std::collections::HashMap;

use parking_lot::RwLock;

pub type ProcessId = i32;
pub type SecretKey = i32;

/// Where to deliver a cancel for one registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelEntry {
    pub host: String,
    pub port: u16,
    pub process_id: ProcessId,
    pub secret_key: SecretKey,
}

/// Process-wide map of live sessions by their cancel key. Entries are
/// inserted after the handshake completes and removed on session teardown;
/// teardown's unregister always precedes the next register of the same key,
/// because a pool connection is only handed to one session at a time.
#[derive(Default)]
pub struct CancelRegistry {
    entries: RwLock<HashMap<(ProcessId, SecretKey), CancelEntry>>,
}

impl CancelRegistry {
    pub fn new() -> CancelRegistry {
        CancelRegistry::default()
    }

    pub fn register(&self, process_id: ProcessId, secret_key: SecretKey, entry: CancelEntry) {
        self.entries
            .write()
            .insert((process_id, secret_key), entry);
    }

    pub fn lookup(&self, process_id: ProcessId, secret_key: SecretKey) -> Option<CancelEntry> {
        self.entries
            .read()
            .get(&(process_id, secret_key))
            .cloned()
    }

    pub fn unregister(&self, process_id: ProcessId, secret_key: SecretKey) {
        self.entries.write().remove(&(process_id, secret_key));
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(process_id: i32, secret_key: i32) -> CancelEntry {
        CancelEntry {
            host: "db.internal".into(),
            port: 5432,
            process_id,
            secret_key,
        }
    }

    #[test]
    fn lookup_returns_entry_iff_registered() {
        let registry = CancelRegistry::new();
        assert_eq!(registry.lookup(7, 13), None);

        registry.register(7, 13, entry(7, 13));
        assert_eq!(registry.lookup(7, 13), Some(entry(7, 13)));
        assert_eq!(registry.lookup(7, 14), None);

        registry.unregister(7, 13);
        assert_eq!(registry.lookup(7, 13), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_then_register_replaces_cleanly() {
        let registry = CancelRegistry::new();

        // Two sessions using the same pool connection sequentially share a
        // key; the teardown of the first must precede the second.
        registry.register(7, 13, entry(7, 13));
        registry.unregister(7, 13);
        registry.register(7, 13, entry(7, 13));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(7, 13), Some(entry(7, 13)));
    }

    #[test]
    fn unregister_of_unknown_key_is_a_noop() {
        let registry = CancelRegistry::new();
        registry.register(1, 2, entry(1, 2));
        registry.unregister(3, 4);
        assert_eq!(registry.len(), 1);
    }
}
