use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use reef_store::CapabilityStore;

/// Shared negative-set mirror (Redis in a multi-process deployment). The
/// in-memory implementation serves single-process runs and tests.
pub trait CapabilityCache: Send + Sync {
    fn contains(&self, model: &str) -> bool;
    fn add(&self, model: &str);
    fn remove(&self, model: &str);
}

#[derive(Default)]
pub struct InMemoryCapabilityCache {
    set: Mutex<HashSet<String>>,
}

impl CapabilityCache for InMemoryCapabilityCache {
    fn contains(&self, model: &str) -> bool {
        self.set.lock().unwrap().contains(model)
    }

    fn add(&self, model: &str) {
        self.set.lock().unwrap().insert(model.to_string());
    }

    fn remove(&self, model: &str) {
        self.set.lock().unwrap().remove(model);
    }
}

/// Three-layer memory of models that do not support tool calls: an
/// in-process set in front of the shared cache in front of the durable
/// table. The durable table is authoritative.
pub struct CapabilityMemory {
    local: Mutex<HashSet<String>>,
    shared: Arc<dyn CapabilityCache>,
    store: Arc<CapabilityStore>,
}

impl CapabilityMemory {
    pub fn new(shared: Arc<dyn CapabilityCache>, store: Arc<CapabilityStore>) -> Self {
        Self {
            local: Mutex::new(HashSet::new()),
            shared,
            store,
        }
    }

    /// Warm every layer from the durable table.
    pub fn initialize(&self) {
        match self.store.unsupported_models() {
            Ok(models) => {
                let mut local = self.local.lock().unwrap();
                for model in &models {
                    local.insert(model.clone());
                    self.shared.add(model);
                }
                if !models.is_empty() {
                    info!(count = models.len(), "capability memory warmed");
                }
            }
            Err(e) => warn!("capability warm-up failed: {e}"),
        }
    }

    /// Unknown models return `true` so the caller gets to try.
    pub fn check_supports_tools(&self, model: &str) -> bool {
        if self.local.lock().unwrap().contains(model) {
            debug!(model, "tool support denied by in-process set");
            return false;
        }
        if self.shared.contains(model) {
            // Promote into the in-process layer for the next check.
            self.local.lock().unwrap().insert(model.to_string());
            debug!(model, "tool support denied by shared cache");
            return false;
        }
        true
    }

    pub fn mark_unsupported(&self, model: &str, error: Option<&str>) {
        if let Err(e) = self.store.mark_unsupported(
            model,
            error,
            Some("auto-detected: tool call rejected by provider"),
        ) {
            warn!(model, "durable capability record failed: {e}");
        }
        self.shared.add(model);
        self.local.lock().unwrap().insert(model.to_string());
    }

    /// Manual antidote.
    pub fn mark_supported(&self, model: &str) {
        if let Err(e) = self.store.mark_supported(model) {
            warn!(model, "durable capability update failed: {e}");
        }
        self.shared.remove(model);
        self.local.lock().unwrap().remove(model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_store::db::init_db;
    use rusqlite::Connection;

    fn memory() -> CapabilityMemory {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        CapabilityMemory::new(
            Arc::new(InMemoryCapabilityCache::default()),
            Arc::new(CapabilityStore::new(conn)),
        )
    }

    #[test]
    fn unknown_models_are_optimistic() {
        let mem = memory();
        assert!(mem.check_supports_tools("fresh-model"));
    }

    #[test]
    fn mark_unsupported_hits_all_layers() {
        let mem = memory();
        mem.mark_unsupported("old-model", Some("NotImplemented"));
        assert!(!mem.check_supports_tools("old-model"));
        mem.mark_supported("old-model");
        assert!(mem.check_supports_tools("old-model"));
    }

    #[test]
    fn shared_cache_hit_promotes_to_local() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let shared = Arc::new(InMemoryCapabilityCache::default());
        shared.add("remote-known");
        let mem = CapabilityMemory::new(shared.clone(), Arc::new(CapabilityStore::new(conn)));
        assert!(!mem.check_supports_tools("remote-known"));
        // Second check is answered by the in-process layer even if the
        // shared cache forgets.
        shared.remove("remote-known");
        assert!(!mem.check_supports_tools("remote-known"));
    }

    #[test]
    fn initialize_warms_from_durable_table() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let store = Arc::new(CapabilityStore::new(conn));
        store.mark_unsupported("legacy", None, None).unwrap();
        let mem = CapabilityMemory::new(Arc::new(InMemoryCapabilityCache::default()), store);
        mem.initialize();
        assert!(!mem.check_supports_tools("legacy"));
    }
}
