//! In-memory spec storage.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use mcpgate_core::ServerSpec;

use crate::store::{Result, SpecStore};

/// Spec store backed by a map. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemorySpecStore {
    specs: RwLock<BTreeMap<String, ServerSpec>>,
}

impl MemorySpecStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with specs.
    pub fn with_specs(specs: impl IntoIterator<Item = ServerSpec>) -> Self {
        let map = specs.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self {
            specs: RwLock::new(map),
        }
    }

    /// Look up one spec without going through the async trait.
    pub fn get(&self, id: &str) -> Option<ServerSpec> {
        self.specs.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.specs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.read().is_empty()
    }
}

#[async_trait]
impl SpecStore for MemorySpecStore {
    async fn save(&self, spec: &ServerSpec) -> Result<()> {
        self.specs.write().insert(spec.id.clone(), spec.clone());
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<ServerSpec>> {
        Ok(self.specs.read().values().cloned().collect())
    }

    async fn exists_by_id(&self, id: &str) -> Result<bool> {
        Ok(self.specs.read().contains_key(id))
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        Ok(self.specs.write().remove(id).is_some())
    }
}
