use itertools::Itertools;
use std::collections::BTreeMap;
use crate::cluster::Instance;
use crate::compute::{ComputeService, Statement};
use crate::topology::{RoleSet, Topology};

pub const DEFAULT_KERBEROS_REALM: &'static str = "STRATUSCLUSTER.COM";

/// Statements contributed by handlers during one phase, keyed by role, plus
/// per instance environment exports
#[derive(Clone, Debug, Default)]
pub struct StatementQueue {
    by_role: BTreeMap<String, Vec<Statement>>,
    exports: BTreeMap<String, Vec<(String, String)>>,
}

impl StatementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, role: impl ToString, statement: Statement) {
        self.by_role
            .entry(role.to_string())
            .or_default()
            .push(statement);
    }

    /// export `key=value` on one instance only
    pub fn export(&mut self, instance_id: impl ToString, key: impl ToString, value: impl ToString) {
        let exports = self.exports.entry(instance_id.to_string()).or_default();
        put(exports, key.to_string(), value.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.by_role.values().all(|statements| statements.is_empty())
    }

    /// what an instance carrying `roles` runs: each role's statements in role
    /// order, a statement queued by more than one role only once
    pub fn for_roles(&self, roles: &RoleSet) -> Vec<Statement> {
        roles
            .iter()
            .filter_map(|role| self.by_role.get(role))
            .flatten()
            .unique()
            .cloned()
            .collect()
    }

    pub fn exports_for(&self, instance_id: &str) -> Option<&Vec<(String, String)>> {
        self.exports.get(instance_id)
    }
}

/// insert or replace in place so the first position of a key is kept
fn put(exports: &mut Vec<(String, String)>, key: String, value: String) {
    match exports.iter_mut().find(|(k, _)| *k == key) {
        Some(entry) => entry.1 = value,
        None => exports.push((key, value)),
    }
}

/// the exports every script for `roles` starts with: the topology `env`, the
/// cluster defaults, then the `env` of each role
pub fn environment(topology: &Topology, roles: &RoleSet) -> Vec<(String, String)> {
    let mut rtn = vec![];
    for (key, value) in &topology.env {
        put(&mut rtn, key.clone(), value.clone());
    }

    put(&mut rtn, "CLUSTER_NAME".to_string(), topology.cluster_name.clone());
    if let Some(user) = &topology.cluster_user {
        put(&mut rtn, "CLUSTER_USER".to_string(), user.clone());
    }
    put(&mut rtn, "CLOUD_PROVIDER".to_string(), topology.provider.clone());
    if let Some(suffix) = topology.auto_hostname_suffix.as_ref().filter(|s| !s.is_empty()) {
        put(&mut rtn, "AUTO_HOSTNAME_SUFFIX".to_string(), suffix.clone());
        if let Some(prefix) = topology.auto_hostname_prefix.as_ref().filter(|p| !p.is_empty()) {
            put(&mut rtn, "AUTO_HOSTNAME_PREFIX".to_string(), prefix.clone());
        }
    }
    if let Some(url) = &topology.jdk_install_url {
        put(&mut rtn, "JDK_INSTALL_URL".to_string(), url.clone());
    }
    let realm = topology
        .kerberos_realm
        .clone()
        .unwrap_or_else(|| DEFAULT_KERBEROS_REALM.to_string());
    put(&mut rtn, "KERBEROS_REALM".to_string(), realm);
    put(&mut rtn, "ROLES".to_string(), roles.iter().join(","));

    for role in roles {
        if let Some(config) = topology.role_config(role) {
            for (key, value) in &config.env {
                put(&mut rtn, key.clone(), value.clone());
            }
        }
    }
    rtn
}

/// [environment] plus what is known about a running instance: its addresses,
/// its resolved host names and the exports handlers queued for it.  A host
/// name that cannot be resolved is skipped.
pub async fn instance_environment(
    topology: &Topology,
    instance: &Instance,
    compute: &dyn ComputeService,
    queue: &StatementQueue,
) -> Vec<(String, String)> {
    let mut rtn = environment(topology, instance.roles());
    if let Some(ip) = instance.public_ip() {
        put(&mut rtn, "PUBLIC_IP".to_string(), ip.to_string());
    }
    if let Some(ip) = instance.private_ip() {
        put(&mut rtn, "PRIVATE_IP".to_string(), ip.to_string());
    }
    match instance.addresses(compute).await {
        Ok(hosts) => {
            if let Some(host) = hosts.public {
                put(&mut rtn, "PUBLIC_HOST_NAME".to_string(), host);
            }
            if let Some(host) = hosts.private {
                put(&mut rtn, "PRIVATE_HOST_NAME".to_string(), host);
            }
        }
        Err(err) => warn!("could not resolve host names of {}: {}", instance.id(), err),
    }
    if let Some(exports) = queue.exports_for(instance.id()) {
        for (key, value) in exports {
            put(&mut rtn, key.clone(), value.clone());
        }
    }
    rtn
}

#[cfg(test)]
pub mod test {
    use crate::cluster::test::instance;
    use crate::compute::stub::StubCompute;
    use crate::compute::Statement;
    use crate::lifecycle::statements::{environment, instance_environment, StatementQueue};
    use crate::topology::{RoleSet, Topology};

    fn topology() -> Topology {
        Topology::parse(
            r#"
cluster-name: hadoop
provider: stub
cluster-user: hadoop
instance-templates: "1 namenode+jobtracker"
auto-hostname-prefix: node-
env:
  java_home: /usr/lib/jvm
roles:
  namenode:
    env:
      HDFS_DIR: /data
      JAVA_HOME: /opt/java
"#,
        )
        .unwrap()
    }

    fn keys(exports: &Vec<(String, String)>) -> Vec<&str> {
        exports.iter().map(|(key, _)| key.as_str()).collect()
    }

    #[test]
    pub fn test_for_roles_dedupes() {
        let mut queue = StatementQueue::new();
        queue.add("namenode", Statement::function("retry_helpers"));
        queue.add("namenode", Statement::function("install_namenode"));
        queue.add("jobtracker", Statement::function("retry_helpers"));
        queue.add("jobtracker", Statement::function("install_jobtracker"));

        let statements = queue.for_roles(&RoleSet::new(["namenode", "jobtracker"]));
        let names: Vec<String> = statements.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            vec!["retry_helpers", "install_jobtracker", "install_namenode"]
        );
        assert!(queue.for_roles(&RoleSet::new(["datanode"])).is_empty());
    }

    #[test]
    pub fn test_environment_order() {
        let topology = topology();
        let exports = environment(&topology, &RoleSet::new(["namenode", "jobtracker"]));
        assert_eq!(
            keys(&exports),
            vec![
                "JAVA_HOME",
                "CLUSTER_NAME",
                "CLUSTER_USER",
                "CLOUD_PROVIDER",
                "KERBEROS_REALM",
                "ROLES",
                "HDFS_DIR"
            ]
        );
        // a role's env overrides the global value in place
        assert_eq!(exports[0].1, "/opt/java");
        assert_eq!(exports[4].1, "STRATUSCLUSTER.COM");
        assert_eq!(exports[5].1, "jobtracker,namenode");
    }

    #[tokio::test]
    pub async fn test_instance_environment() {
        let topology = topology();
        let compute = StubCompute::new();
        let instance = instance("i-1", &["namenode"]);
        let mut queue = StatementQueue::new();
        queue.export("i-1", "NAMENODE_PORT", "8020");
        queue.export("i-2", "OTHER", "x");

        let exports = instance_environment(&topology, &instance, &compute, &queue).await;
        let keys = keys(&exports);
        assert!(keys.ends_with(&[
            "PUBLIC_IP",
            "PRIVATE_IP",
            "PUBLIC_HOST_NAME",
            "PRIVATE_HOST_NAME",
            "NAMENODE_PORT"
        ]));
        assert!(!keys.contains(&"OTHER"));

        compute.fail_resolve(true);
        let other = crate::cluster::test::instance("i-2", &["namenode"]);
        let exports = instance_environment(&topology, &other, &compute, &queue).await;
        assert!(!exports.iter().any(|(key, _)| key == "PUBLIC_HOST_NAME"));
    }
}
