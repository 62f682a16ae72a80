//! Cardinality and co-location checks over the roles of a cluster.

use crate::cluster::{Cluster, Instance};
use crate::err::TopologyErr;
use crate::topology::Topology;

/// the one instance carrying `role`.  Fails when no instance or more than one
/// instance carries it.
pub fn locate_unique<'a>(cluster: &'a Cluster, role: &str) -> Result<&'a Instance, TopologyErr> {
    let mut matches = match_all(cluster, role);
    match matches.len() {
        0 => Err(TopologyErr::not_found(cluster.name(), role)),
        1 => Ok(matches.remove(0)),
        count => Err(TopologyErr::ambiguous(cluster.name(), role, count)),
    }
}

/// every instance carrying `role`, in cluster order
pub fn match_all<'a>(cluster: &'a Cluster, role: &str) -> Vec<&'a Instance> {
    cluster.instances_matching(|instance| instance.has_role(role))
}

/// fail if any instance carries both `a` and `b`
pub fn assert_disjoint(cluster: &Cluster, a: &str, b: &str) -> Result<(), TopologyErr> {
    match cluster
        .instances()
        .iter()
        .find(|instance| instance.has_role(a) && instance.has_role(b))
    {
        None => Ok(()),
        Some(instance) => Err(TopologyErr::conflict(
            a,
            b,
            format!("instance '{}'", instance.id()),
        )),
    }
}

/// the same check against the declared groups, before anything is launched
pub fn assert_topology_disjoint(topology: &Topology, a: &str, b: &str) -> Result<(), TopologyErr> {
    match topology
        .groups
        .iter()
        .find(|group| group.has_role(a) && group.has_role(b))
    {
        None => Ok(()),
        Some(group) => Err(TopologyErr::conflict(
            a,
            b,
            format!("instance group [{}]", group.roles),
        )),
    }
}
