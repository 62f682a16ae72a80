use dashmap::DashMap;
use std::sync::Arc;
use crate::err::{ComputeErr, StoreErr};
use crate::store::{LockTable, Manifest, StateStore};

/// the provider's object storage: opaque bytes keyed by container and blob
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, container: &str, blob: &str, data: Vec<u8>) -> Result<(), ComputeErr>;

    /// fails with [ComputeErr::BlobNotFound] when nothing is stored under the key
    async fn get(&self, container: &str, blob: &str) -> Result<Vec<u8>, ComputeErr>;

    async fn delete(&self, container: &str, blob: &str) -> Result<(), ComputeErr>;
}

#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<DashMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(container: &str, blob: &str) -> (String, String) {
        (container.to_string(), blob.to_string())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, container: &str, blob: &str, data: Vec<u8>) -> Result<(), ComputeErr> {
        self.blobs.insert(Self::key(container, blob), data);
        Ok(())
    }

    async fn get(&self, container: &str, blob: &str) -> Result<Vec<u8>, ComputeErr> {
        self.blobs
            .get(&Self::key(container, blob))
            .map(|data| data.value().clone())
            .ok_or_else(|| ComputeErr::BlobNotFound(format!("{}/{}", container, blob)))
    }

    async fn delete(&self, container: &str, blob: &str) -> Result<(), ComputeErr> {
        self.blobs.remove(&Self::key(container, blob));
        Ok(())
    }
}

/// One blob per cluster in `container`.  A save is a single object overwrite.
/// The blob is named `stratus-<cluster>` unless the topology names one.
pub struct BlobStateStore {
    blobs: Arc<dyn BlobStore>,
    container: String,
    blob: Option<String>,
    locks: LockTable,
}

impl BlobStateStore {
    pub fn new(blobs: Arc<dyn BlobStore>, container: impl ToString, blob: Option<String>) -> Self {
        Self {
            blobs,
            container: container.to_string(),
            blob,
            locks: LockTable::new(),
        }
    }

    pub fn blob_name(&self, name: &str) -> String {
        match &self.blob {
            Some(blob) => blob.clone(),
            None => format!("stratus-{}", name),
        }
    }
}

#[async_trait]
impl StateStore for BlobStateStore {
    async fn save(&self, name: &str, manifest: &Manifest) -> Result<(), StoreErr> {
        let json = manifest.to_json()?;
        let _lock = self.locks.lock(name).await;
        let blob = self.blob_name(name);
        self.blobs
            .put(self.container.as_str(), blob.as_str(), json.into_bytes())
            .await
            .map_err(|err| StoreErr::write_failed(name, err))?;
        debug!("saved cluster '{}' to blob {}/{}", name, self.container, blob);
        Ok(())
    }

    async fn load(&self, name: &str) -> Result<Manifest, StoreErr> {
        let blob = self.blob_name(name);
        let data = match self.blobs.get(self.container.as_str(), blob.as_str()).await {
            Ok(data) => data,
            Err(ComputeErr::BlobNotFound(_)) => return Err(StoreErr::not_found(name)),
            Err(err) => return Err(StoreErr::corrupt(name, err)),
        };
        let json = String::from_utf8(data).map_err(|err| StoreErr::corrupt(name, err))?;
        Manifest::from_json(name, json.as_str())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreErr> {
        let lock = self.locks.lock(name).await;
        let blob = self.blob_name(name);
        let rtn = self
            .blobs
            .delete(self.container.as_str(), blob.as_str())
            .await
            .map_err(|err| StoreErr::write_failed(name, err));
        self.locks.release(name, lock);
        rtn
    }
}
