pub mod config;
pub mod defaults;
pub mod parse;

use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use crate::err::ConfigErr;
use crate::topology::config::ProtoTopology;
use crate::topology::defaults::BlobStoreDefaults;

/// accounts a cluster user may never be mapped onto
pub const RESERVED_USERS: [&'static str; 1] = ["root"];

pub const DEFAULT_MAX_STARTUP_RETRIES: u32 = 1;
pub const DEFAULT_MAX_CONCURRENT_LAUNCHES: usize = 10;
pub const DEFAULT_MIN_PERCENT_SUCCESS: u8 = 100;

static CLUSTER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,62}$").unwrap());

static CONTAINER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").unwrap());

/// A set of role names.  Two [RoleSet]s are equal when they hold the same
/// roles regardless of the order they were declared in.  The text form is the
/// sorted roles joined with `+`
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleSet(BTreeSet<String>);

impl RoleSet {
    pub fn new<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self(roles.into_iter().map(|role| role.to_string()).collect())
    }

    pub fn contains(&self, role: &str) -> bool {
        self.0.contains(role)
    }

    pub fn intersects(&self, other: &RoleSet) -> bool {
        self.0.iter().any(|role| other.contains(role))
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for RoleSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.iter().join("+").as_str())
    }
}

impl FromStr for RoleSet {
    type Err = ConfigErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse::roles(s)
    }
}

impl<'a> IntoIterator for &'a RoleSet {
    type Item = &'a String;
    type IntoIter = std::collections::btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// `ceil(count * percent / 100)`
pub fn ceil_percent(count: u32, percent: u8) -> u32 {
    let scaled = count as u64 * percent as u64;
    ((scaled + 99) / 100) as u32
}

/// one row of the topology: launch `target` machines that each run every
/// role in `roles`
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub roles: RoleSet,
    pub target: u32,
    pub min_percent_success: u8,
    pub min_instances: u32,
}

impl InstanceGroup {
    pub fn new(roles: RoleSet, target: u32) -> Self {
        Self {
            roles,
            target,
            min_percent_success: DEFAULT_MIN_PERCENT_SUCCESS,
            min_instances: target,
        }
    }

    pub fn with_min_percent_success(mut self, percent: u8) -> Self {
        self.min_percent_success = percent;
        self
    }

    pub fn with_min_instances(mut self, min: u32) -> Self {
        self.min_instances = min;
        self
    }

    /// the number of healthy instances this group needs to be considered
    /// launched: `max(min_instances, ceil(target * min_percent_success / 100))`
    pub fn required(&self) -> u32 {
        self.min_instances
            .max(ceil_percent(self.target, self.min_percent_success))
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn validate(&self) -> Result<(), ConfigErr> {
        if self.roles.is_empty() {
            return Err(ConfigErr::group(&self.roles, "declares no roles"));
        }
        if self.target < 1 {
            return Err(ConfigErr::group(
                &self.roles,
                "instance count must be at least 1",
            ));
        }
        if self.min_percent_success > 100 {
            return Err(ConfigErr::group(
                &self.roles,
                format!(
                    "minimum success percentage {} is not within 0..=100",
                    self.min_percent_success
                ),
            ));
        }
        if self.min_instances > self.target {
            return Err(ConfigErr::group(
                &self.roles,
                format!(
                    "minimum number of instances {} exceeds the instance count {}",
                    self.min_instances, self.target
                ),
            ));
        }
        Ok(())
    }
}

impl Display for InstanceGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.target, self.roles)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StateStoreKind {
    #[default]
    Local,
    Blob,
    Memory,
    None,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlobStoreSettings {
    pub provider: Option<String>,
    pub endpoint: Option<String>,
    pub identity: Option<String>,
    pub credential: Option<String>,
    pub location_id: Option<String>,
    pub cache_container: Option<String>,
}

/// configuration scoped to one role
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RoleConfig {
    /// exported into the environment of every instance carrying the role
    pub env: BTreeMap<String, String>,
    /// free form properties interpreted by the role's handler
    pub properties: BTreeMap<String, String>,
    /// roles that must never share an instance with this role
    pub disallow_colocation: Vec<String>,
}

impl RoleConfig {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|value| value.as_str())
    }
}

/// The validated description of one cluster.  A [Topology] is built once by
/// [Topology::parse] or [ProtoTopology::create] and only ever changed on a
/// clone: every field is owned so `clone()` is a deep copy.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub cluster_name: String,
    pub service_name: Option<String>,
    pub cluster_user: Option<String>,
    pub groups: Vec<InstanceGroup>,
    pub max_startup_retries: u32,
    pub max_concurrent_launches: usize,
    pub terminate_all_on_launch_failure: bool,
    pub provider: String,
    pub endpoint: Option<String>,
    pub identity: Option<String>,
    pub credential: Option<String>,
    pub blob_store: BlobStoreSettings,
    pub state_store: StateStoreKind,
    pub state_store_container: Option<String>,
    pub state_store_blob: Option<String>,
    pub client_cidrs: Vec<String>,
    pub firewall_rules: BTreeMap<String, Vec<u16>>,
    pub env: BTreeMap<String, String>,
    pub roles: BTreeMap<String, RoleConfig>,
    pub auto_hostname_prefix: Option<String>,
    pub auto_hostname_suffix: Option<String>,
    pub jdk_install_url: Option<String>,
    pub kerberos_realm: Option<String>,
}

impl Topology {
    /// parse and validate a yaml topology using the built in blob store defaults
    pub fn parse(yaml: &str) -> Result<Self, ConfigErr> {
        Self::parse_with(yaml, &BlobStoreDefaults::default())
    }

    pub fn parse_with(yaml: &str, defaults: &BlobStoreDefaults) -> Result<Self, ConfigErr> {
        ProtoTopology::from_yaml(yaml)?.create(defaults)
    }

    pub fn validate(&self) -> Result<(), ConfigErr> {
        if !CLUSTER_NAME.is_match(self.cluster_name.as_str()) {
            return Err(ConfigErr::invalid(
                "cluster-name",
                format!(
                    "'{}' must be 1-63 letters, digits, '-' or '_' and start with a letter or digit",
                    self.cluster_name
                ),
            ));
        }

        if let Some(user) = &self.cluster_user {
            if RESERVED_USERS.contains(&user.as_str()) {
                return Err(ConfigErr::invalid(
                    "cluster-user",
                    format!("'{}' is a reserved account; cluster-user must not be a privileged user", user),
                ));
            }
        }

        if self.groups.is_empty() {
            return Err(ConfigErr::missing("instance-templates"));
        }

        let mut seen = HashSet::new();
        for group in &self.groups {
            group.validate()?;
            if !seen.insert(&group.roles) {
                return Err(ConfigErr::DuplicateRoleSet(group.roles.clone()));
            }
        }

        if self.max_concurrent_launches < 1 {
            return Err(ConfigErr::invalid(
                "max-concurrent-launches",
                "must be at least 1",
            ));
        }

        if self.provider.trim().is_empty() {
            return Err(ConfigErr::missing("provider"));
        }

        if let Some(container) = &self.state_store_container {
            if !CONTAINER_NAME.is_match(container.as_str()) {
                return Err(ConfigErr::invalid(
                    "state-store-container",
                    format!("'{}' is not a valid 3-63 character dns name", container),
                ));
            }
        }

        if self.state_store == StateStoreKind::Blob && self.state_store_container.is_none() {
            return Err(ConfigErr::missing("state-store-container"));
        }

        Ok(())
    }

    /// return a copy of this topology for a different cluster name
    pub fn with_cluster_name(&self, cluster_name: impl ToString) -> Result<Self, ConfigErr> {
        let mut rtn = self.clone();
        rtn.cluster_name = cluster_name.to_string();
        rtn.validate()?;
        Ok(rtn)
    }

    pub fn group(&self, roles: &RoleSet) -> Option<&InstanceGroup> {
        self.groups.iter().find(|group| &group.roles == roles)
    }

    pub fn group_mut(&mut self, roles: &RoleSet) -> Option<&mut InstanceGroup> {
        self.groups.iter_mut().find(|group| &group.roles == roles)
    }

    /// every distinct role declared by any group
    pub fn role_names(&self) -> BTreeSet<String> {
        self.groups
            .iter()
            .flat_map(|group| group.roles.iter().cloned())
            .collect()
    }

    pub fn role_config(&self, role: &str) -> Option<&RoleConfig> {
        self.roles.get(role)
    }

    pub fn total_target(&self) -> u32 {
        self.groups.iter().map(|group| group.target).sum()
    }

    pub fn is_stub(&self) -> bool {
        self.provider == "stub"
    }

    pub fn blob_store_identity(&self) -> Option<&String> {
        self.blob_store.identity.as_ref().or(self.identity.as_ref())
    }

    pub fn blob_store_credential(&self) -> Option<&String> {
        self.blob_store.credential.as_ref().or(self.credential.as_ref())
    }

    /// the blob name used by the blob state store.  Defaults to
    /// `stratus-<cluster-name>`
    pub fn state_store_blob(&self) -> String {
        match &self.state_store_blob {
            Some(blob) => blob.clone(),
            None => format!("stratus-{}", self.cluster_name),
        }
    }
}

#[cfg(test)]
pub mod test {
    use crate::err::ConfigErr;
    use crate::topology::{ceil_percent, InstanceGroup, RoleSet, StateStoreKind, Topology};

    pub fn hadoop_yaml() -> &'static str {
        r#"
cluster-name: hadoopcluster
service-name: hadoop
provider: aws-ec2
instance-templates: "1 hadoop-namenode+hadoop-jobtracker, 10 hadoop-datanode+hadoop-tasktracker"
instance-templates-min-percent-success: "60 hadoop-datanode+hadoop-tasktracker"
instance-templates-minimum-number-of-instances: "7 hadoop-tasktracker+hadoop-datanode"
max-startup-retries: 2
"#
    }

    #[test]
    pub fn test_parse() -> Result<(), ConfigErr> {
        let topology = Topology::parse(hadoop_yaml())?;
        assert_eq!(topology.cluster_name, "hadoopcluster");
        assert_eq!(topology.groups.len(), 2);
        assert_eq!(topology.max_startup_retries, 2);
        assert!(topology.terminate_all_on_launch_failure);
        assert_eq!(topology.state_store, StateStoreKind::Local);
        assert_eq!(topology.blob_store.provider, Some("aws-s3".to_string()));

        let master = RoleSet::new(["hadoop-namenode", "hadoop-jobtracker"]);
        let master = topology.group(&master).unwrap();
        assert_eq!(master.target, 1);
        assert_eq!(master.required(), 1);

        let workers = RoleSet::new(["hadoop-datanode", "hadoop-tasktracker"]);
        let workers = topology.group(&workers).unwrap();
        assert_eq!(workers.target, 10);
        assert_eq!(workers.min_percent_success, 60);
        assert_eq!(workers.min_instances, 7);
        assert_eq!(workers.required(), 7);
        Ok(())
    }

    #[test]
    pub fn test_duplicate_role_sets() {
        let yaml = r#"
cluster-name: zk
provider: stub
instance-templates: "1 zookeeper+monitor, 2 monitor+zookeeper"
"#;
        match Topology::parse(yaml) {
            Err(ConfigErr::DuplicateRoleSet(roles)) => {
                assert_eq!(roles, RoleSet::new(["monitor", "zookeeper"]))
            }
            other => panic!("expected DuplicateRoleSet, got {:?}", other),
        }
    }

    #[test]
    pub fn test_invalid_groups() {
        let roles = RoleSet::new(["zookeeper"]);
        assert!(InstanceGroup::new(roles.clone(), 0).validate().is_err());
        assert!(InstanceGroup::new(roles.clone(), 3)
            .with_min_percent_success(101)
            .validate()
            .is_err());
        assert!(InstanceGroup::new(roles.clone(), 3)
            .with_min_instances(4)
            .validate()
            .is_err());
        assert!(InstanceGroup::new(roles, 3)
            .with_min_percent_success(0)
            .with_min_instances(0)
            .validate()
            .is_ok());
    }

    #[test]
    pub fn test_reserved_user() {
        let yaml = r#"
cluster-name: zk
provider: stub
cluster-user: root
instance-templates: "1 zookeeper"
"#;
        assert!(matches!(
            Topology::parse(yaml),
            Err(ConfigErr::Invalid { .. })
        ));
    }

    #[test]
    pub fn test_required() {
        assert_eq!(ceil_percent(10, 60), 6);
        assert_eq!(ceil_percent(3, 50), 2);
        assert_eq!(ceil_percent(7, 0), 0);
        assert_eq!(ceil_percent(7, 100), 7);

        let group = InstanceGroup::new(RoleSet::new(["worker"]), 10)
            .with_min_percent_success(60)
            .with_min_instances(0);
        assert_eq!(group.required(), 6);
        let group = group.with_min_instances(7);
        assert_eq!(group.required(), 7);
    }

    #[test]
    pub fn test_copy_is_independent() -> Result<(), ConfigErr> {
        let original = Topology::parse(hadoop_yaml())?;
        let mut copy = original.clone();
        copy.groups[0].target = 5;
        copy.groups.pop();
        copy.env.insert("FOO".to_string(), "bar".to_string());

        assert_eq!(original.groups.len(), 2);
        assert_eq!(original.groups[0].target, 1);
        assert!(original.env.is_empty());
        Ok(())
    }

    #[test]
    pub fn test_with_cluster_name() -> Result<(), ConfigErr> {
        let topology = Topology::parse(hadoop_yaml())?;
        let renamed = topology.with_cluster_name("other")?;
        assert_eq!(renamed.cluster_name, "other");
        assert_eq!(topology.cluster_name, "hadoopcluster");
        assert!(topology.with_cluster_name("not a name").is_err());
        Ok(())
    }
}
