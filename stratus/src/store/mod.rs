//! Persistence of cluster manifests between process invocations.

pub mod blob;
pub mod local;
pub mod memory;
pub mod none;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use crate::cluster::{Addresses, Cluster, Instance};
use crate::compute::NodeHandle;
use crate::env::StratusEnv;
use crate::err::{ConfigErr, StoreErr};
use crate::store::blob::{BlobStateStore, BlobStore, MemoryBlobStore};
use crate::store::local::LocalStateStore;
use crate::store::memory::MemoryStateStore;
use crate::store::none::NoStateStore;
use crate::topology::{RoleSet, StateStoreKind, Topology};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub roles: RoleSet,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub public_host: Option<String>,
    pub private_host: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl From<&Instance> for InstanceRecord {
    fn from(instance: &Instance) -> Self {
        let hosts = instance.cached_addresses().cloned().unwrap_or_default();
        let node = instance.node();
        Self {
            id: node.id.clone(),
            roles: instance.roles().clone(),
            public_ip: node.public_ip.clone(),
            private_ip: node.private_ip.clone(),
            public_host: hosts.public,
            private_host: hosts.private,
            metadata: node.metadata.clone(),
        }
    }
}

impl From<InstanceRecord> for Instance {
    fn from(record: InstanceRecord) -> Self {
        let hosts = match (&record.public_host, &record.private_host) {
            (None, None) => None,
            _ => Some(Addresses::new(record.public_host, record.private_host)),
        };
        let node = NodeHandle {
            id: record.id,
            public_ip: record.public_ip,
            private_ip: record.private_ip,
            metadata: record.metadata,
        };
        Instance::restore(node, record.roles, hosts)
    }
}

/// the serialised form of a [Cluster]
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub cluster_name: String,
    pub instances: Vec<InstanceRecord>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub saved_at: DateTime<Utc>,
}

impl Manifest {
    pub fn to_json(&self) -> Result<String, StoreErr> {
        serde_json::to_string_pretty(self)
            .map_err(|err| StoreErr::write_failed(&self.cluster_name, err))
    }

    pub fn from_json(cluster: &str, json: &str) -> Result<Self, StoreErr> {
        serde_json::from_str(json).map_err(|err| StoreErr::corrupt(cluster, err))
    }

    pub fn into_cluster(self) -> Cluster {
        let instances = self.instances.into_iter().map(Instance::from);
        let mut cluster = Cluster::with_instances(self.cluster_name, instances);
        cluster.set_properties(self.properties);
        cluster
    }
}

impl From<&Cluster> for Manifest {
    fn from(cluster: &Cluster) -> Self {
        Self {
            cluster_name: cluster.name().to_string(),
            instances: cluster.instances().iter().map(InstanceRecord::from).collect(),
            properties: cluster.properties().clone(),
            saved_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, name: &str, manifest: &Manifest) -> Result<(), StoreErr>;

    async fn load(&self, name: &str) -> Result<Manifest, StoreErr>;

    /// forget a cluster.  Deleting a cluster that was never saved is not an error
    async fn delete(&self, name: &str) -> Result<(), StoreErr>;

    async fn save_cluster(&self, cluster: &Cluster) -> Result<(), StoreErr> {
        let manifest = Manifest::from(cluster);
        self.save(cluster.name(), &manifest).await
    }

    async fn load_cluster(&self, name: &str) -> Result<Cluster, StoreErr> {
        Ok(self.load(name).await?.into_cluster())
    }
}

/// one writer per cluster name; different names never contend
#[derive(Clone, Default)]
pub struct LockTable {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        lock.lock_owned().await
    }

    /// give up `guard` and drop the entry for `name` unless another task still
    /// holds or waits on it
    pub fn release(&self, name: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// picks the [StateStore] backend a topology asks for
#[derive(Clone)]
pub struct StateStoreFactory {
    env: StratusEnv,
    blobs: Option<Arc<dyn BlobStore>>,
}

impl StateStoreFactory {
    pub fn new(env: StratusEnv) -> Self {
        Self { env, blobs: None }
    }

    /// the collaborator used by the blob backend
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn create(&self, topology: &Topology) -> Result<Arc<dyn StateStore>, ConfigErr> {
        let store: Arc<dyn StateStore> = match topology.state_store {
            StateStoreKind::Local => Arc::new(LocalStateStore::new(self.env.home().clone())),
            StateStoreKind::Memory => Arc::new(MemoryStateStore::new()),
            StateStoreKind::None => Arc::new(NoStateStore::new()),
            StateStoreKind::Blob => {
                let container = topology
                    .state_store_container
                    .clone()
                    .ok_or_else(|| ConfigErr::missing("state-store-container"))?;
                let blobs: Arc<dyn BlobStore> = match &self.blobs {
                    Some(blobs) => blobs.clone(),
                    None if topology.is_stub() => Arc::new(MemoryBlobStore::new()),
                    None => {
                        let provider = topology
                            .blob_store
                            .provider
                            .clone()
                            .unwrap_or_else(|| topology.provider.clone());
                        return Err(ConfigErr::provider_not_available(provider));
                    }
                };
                Arc::new(BlobStateStore::new(blobs, container, topology.state_store_blob.clone()))
            }
        };
        debug!(
            "cluster '{}' uses the {} state store",
            topology.cluster_name, topology.state_store
        );
        Ok(store)
    }
}
