use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt::{Display, Formatter};
use crate::cluster::{Cluster, Instance};
use crate::topology::{RoleSet, Topology};

/// the source used when a topology names no client CIDRs
pub const WORLD: &'static str = "0.0.0.0/0";

/// the config `firewall-rules` keys that expose ports on every instance
pub const ALL_KEYS: [&'static str; 2] = ["all", ""];

/// which instances of a cluster a [FirewallRule] opens ports on
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Destination {
    All,
    /// every instance carrying any role of the set
    Roles(RoleSet),
    Instance(String),
}

impl Destination {
    pub fn matches(&self, instance: &Instance) -> bool {
        match self {
            Destination::All => true,
            Destination::Roles(roles) => instance.roles().intersects(roles),
            Destination::Instance(id) => instance.id() == id,
        }
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::All => f.write_str("all"),
            Destination::Roles(roles) => write!(f, "roles({})", roles),
            Destination::Instance(id) => write!(f, "instance({})", id),
        }
    }
}

/// Open `ports` on `destination` to `sources`.  An empty source list means the
/// topology's client CIDRs (or [WORLD] when there are none)
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub destination: Destination,
    pub ports: BTreeSet<u16>,
    pub sources: Vec<String>,
}

impl FirewallRule {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            ports: BTreeSet::new(),
            sources: vec![],
        }
    }

    pub fn all() -> Self {
        Self::new(Destination::All)
    }

    pub fn roles(roles: RoleSet) -> Self {
        Self::new(Destination::Roles(roles))
    }

    pub fn role(role: impl ToString) -> Self {
        Self::roles(RoleSet::new([role.to_string()]))
    }

    pub fn instance(id: impl ToString) -> Self {
        Self::new(Destination::Instance(id.to_string()))
    }

    pub fn port(mut self, port: u16) -> Self {
        self.ports.insert(port);
        self
    }

    pub fn ports<I>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.ports.extend(ports);
        self
    }

    pub fn source(mut self, cidr: impl ToString) -> Self {
        let cidr = cidr.to_string();
        if !self.sources.contains(&cidr) {
            self.sources.push(cidr);
        }
        self
    }
}

impl Display for FirewallRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ports {:?} from {:?}",
            self.destination, self.ports, self.sources
        )
    }
}

/// one concrete ingress permission: `cidr` may reach `port` on an instance
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct IngressTarget {
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    pub cidr: String,
}

impl Display for IngressTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}:{} ({})",
            self.cidr, self.address, self.port, self.instance_id
        )
    }
}

/// Accumulates the rules contributed by configuration and by handlers and
/// expands them against a cluster.  Remembers what has been authorized so a
/// retried phase only applies what is new.
#[derive(Clone, Debug)]
pub struct FirewallManager {
    rules: Vec<FirewallRule>,
    default_sources: Vec<String>,
    applied: HashSet<IngressTarget>,
}

impl FirewallManager {
    pub fn new(client_cidrs: &[String]) -> Self {
        let default_sources = if client_cidrs.is_empty() {
            vec![WORLD.to_string()]
        } else {
            client_cidrs.to_vec()
        };
        Self {
            rules: vec![],
            default_sources,
            applied: HashSet::new(),
        }
    }

    pub fn for_topology(topology: &Topology) -> Self {
        Self::new(topology.client_cidrs.as_slice())
    }

    /// rules are additive; adding an identical rule again changes nothing
    pub fn add_rule(&mut self, rule: FirewallRule) {
        if rule.ports.is_empty() {
            return;
        }
        if !self.rules.contains(&rule) {
            trace!("firewall rule added: {}", rule);
            self.rules.push(rule);
        }
    }

    /// the `firewall-rules` section of the topology
    pub fn add_config_rules(&mut self, topology: &Topology) {
        for (key, ports) in &topology.firewall_rules {
            let rule = if ALL_KEYS.contains(&key.as_str()) {
                FirewallRule::all()
            } else {
                FirewallRule::role(key)
            };
            self.add_rule(rule.ports(ports.iter().cloned()));
        }
    }

    pub fn rules(&self) -> &Vec<FirewallRule> {
        &self.rules
    }

    /// expand every rule against the cluster's current instances in rule
    /// insertion order.  Each `(instance, port, cidr)` appears once.
    pub fn resolve(&self, cluster: &Cluster) -> Vec<IngressTarget> {
        let mut seen = HashSet::new();
        let mut rtn = vec![];
        for rule in &self.rules {
            let sources = if rule.sources.is_empty() {
                &self.default_sources
            } else {
                &rule.sources
            };
            for instance in cluster.instances_matching(|instance| rule.destination.matches(instance)) {
                for port in &rule.ports {
                    for cidr in sources {
                        let target = IngressTarget {
                            instance_id: instance.id().to_string(),
                            address: instance.address().to_string(),
                            port: *port,
                            cidr: cidr.clone(),
                        };
                        if seen.insert(target.clone()) {
                            rtn.push(target);
                        }
                    }
                }
            }
        }
        rtn
    }

    /// the resolved targets that have not been applied yet
    pub fn pending(&self, cluster: &Cluster) -> Vec<IngressTarget> {
        self.resolve(cluster)
            .into_iter()
            .filter(|target| !self.applied.contains(target))
            .collect()
    }

    pub fn mark_applied(&mut self, targets: &[IngressTarget]) {
        self.applied.extend(targets.iter().cloned());
    }
}
