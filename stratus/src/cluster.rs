use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::OnceCell;
use crate::compute::{ComputeService, NodeHandle};
use crate::err::ComputeErr;
use crate::topology::RoleSet;

/// host names of an [Instance] as resolved by the compute provider
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Addresses {
    pub public: Option<String>,
    pub private: Option<String>,
}

impl Addresses {
    pub fn new(public: Option<String>, private: Option<String>) -> Self {
        Self { public, private }
    }
}

/// One machine of a [Cluster].  Instances are only ever created by the
/// provisioning engine (or restored from a saved manifest) and never change
/// afterwards, except that resolved host names are memoized on first success.
#[derive(Clone, Debug)]
pub struct Instance {
    node: NodeHandle,
    roles: RoleSet,
    hosts: Arc<OnceCell<Addresses>>,
}

impl Instance {
    pub(crate) fn new(node: NodeHandle, roles: RoleSet) -> Self {
        Self {
            node,
            roles,
            hosts: Arc::new(OnceCell::new()),
        }
    }

    pub(crate) fn restore(node: NodeHandle, roles: RoleSet, hosts: Option<Addresses>) -> Self {
        Self {
            node,
            roles,
            hosts: Arc::new(OnceCell::new_with(hosts)),
        }
    }

    pub fn id(&self) -> &str {
        self.node.id.as_str()
    }

    pub fn roles(&self) -> &RoleSet {
        &self.roles
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    pub fn public_ip(&self) -> Option<&str> {
        self.node.public_ip.as_deref()
    }

    pub fn private_ip(&self) -> Option<&str> {
        self.node.private_ip.as_deref()
    }

    /// the address other parties should use to reach this instance
    pub fn address(&self) -> &str {
        self.public_ip()
            .or(self.private_ip())
            .unwrap_or(self.id())
    }

    /// resolve the public and private host names through the compute provider.
    /// A successful lookup is cached; a failure is not so the next call retries.
    /// Each instance resolves independently of its siblings.
    pub async fn addresses(&self, compute: &dyn ComputeService) -> Result<Addresses, ComputeErr> {
        let hosts = self
            .hosts
            .get_or_try_init(|| compute.resolve_addresses(&self.node))
            .await?;
        Ok(hosts.clone())
    }

    /// host names if they have already been resolved
    pub fn cached_addresses(&self) -> Option<&Addresses> {
        self.hosts.get()
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.node.id == other.node.id
    }
}

impl Eq for Instance {}

impl Display for Instance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] {}", self.id(), self.roles, self.address())
    }
}

/// The manifest of one named deployment: its instances in launch order
/// (deduplicated by id) and the properties produced by the lifecycle phases
#[derive(Clone, Debug, Default)]
pub struct Cluster {
    name: String,
    instances: Vec<Instance>,
    properties: BTreeMap<String, String>,
}

impl Cluster {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            instances: vec![],
            properties: BTreeMap::new(),
        }
    }

    pub(crate) fn with_instances<I>(name: impl ToString, instances: I) -> Self
    where
        I: IntoIterator<Item = Instance>,
    {
        let mut rtn = Self::new(name);
        for instance in instances {
            rtn.add(instance);
        }
        rtn
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn instances(&self) -> &Vec<Instance> {
        &self.instances
    }

    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|instance| instance.id() == id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// add an instance unless one with the same id is already present
    pub(crate) fn add(&mut self, instance: Instance) -> bool {
        if self.instance(instance.id()).is_some() {
            return false;
        }
        self.instances.push(instance);
        true
    }

    /// the only way instances leave a cluster: an explicit terminate
    pub(crate) fn remove_instances(&mut self, ids: &[String]) -> Vec<Instance> {
        let ids: HashSet<&String> = ids.iter().collect();
        let (removed, kept): (Vec<Instance>, Vec<Instance>) = std::mem::take(&mut self.instances)
            .into_iter()
            .partition(|instance| ids.contains(&instance.node.id));
        self.instances = kept;
        removed
    }

    pub fn instances_matching<P>(&self, predicate: P) -> Vec<&Instance>
    where
        P: Fn(&Instance) -> bool,
    {
        self.instances
            .iter()
            .filter(|instance| predicate(instance))
            .collect()
    }

    pub fn role_names(&self) -> BTreeSet<String> {
        self.instances
            .iter()
            .flat_map(|instance| instance.roles().iter().cloned())
            .collect()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|value| value.as_str())
    }

    /// replace the properties wholesale
    pub fn set_properties(&mut self, properties: BTreeMap<String, String>) {
        self.properties = properties;
    }

    pub fn set_property(&mut self, key: impl ToString, value: impl ToString) {
        self.properties.insert(key.to_string(), value.to_string());
    }
}
