use dashmap::DashMap;
use std::sync::Arc;
use crate::err::StoreErr;
use crate::store::{Manifest, StateStore};

/// Manifests held in process.  Clones share the same map
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    manifests: Arc<DashMap<String, Manifest>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, name: &str, manifest: &Manifest) -> Result<(), StoreErr> {
        self.manifests.insert(name.to_string(), manifest.clone());
        Ok(())
    }

    async fn load(&self, name: &str) -> Result<Manifest, StoreErr> {
        self.manifests
            .get(name)
            .map(|manifest| manifest.value().clone())
            .ok_or_else(|| StoreErr::not_found(name))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreErr> {
        self.manifests.remove(name);
        Ok(())
    }
}
