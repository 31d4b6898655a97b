use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

/// Keys that should be collected whenever someone is watching: the resolved
/// config targets plus the ones added through the control surface.
#[derive(Debug, Default)]
pub struct Targets {
    sets: RwLock<Sets>,
}

#[derive(Debug, Default)]
struct Sets {
    configured: BTreeSet<String>,
    manual: BTreeSet<String>,
}

impl Targets {
    pub fn new(configured: BTreeSet<String>) -> Self {
        Self {
            sets: RwLock::new(Sets {
                configured,
                manual: BTreeSet::new(),
            }),
        }
    }

    /// Replace the config-derived keys; manual keys are kept.
    pub fn set_configured(&self, keys: BTreeSet<String>) {
        self.sets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .configured = keys;
    }

    pub fn add(&self, key: &str) -> bool {
        self.sets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .manual
            .insert(key.to_string())
    }

    /// Drop `key` from both sets until the next reload re-adds it from config.
    pub fn remove(&self, key: &str) -> bool {
        let mut sets = self.sets.write().unwrap_or_else(PoisonError::into_inner);
        let configured = sets.configured.remove(key);
        sets.manual.remove(key) || configured
    }

    pub fn desired(&self) -> BTreeSet<String> {
        let sets = self.sets.read().unwrap_or_else(PoisonError::into_inner);
        sets.configured.union(&sets.manual).cloned().collect()
    }
}
