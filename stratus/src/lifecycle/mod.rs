//! The phase lifecycle.  A cluster moves through
//! [Phase::Bootstrap] -> [Phase::Configure] -> [Phase::Start] and later
//! [Phase::Stop] and [Phase::Cleanup].  For every phase the
//! [LifecycleDispatcher] invokes the `before` hook of each role's handler,
//! performs the phase's side effect and then invokes every `after` hook.

pub mod handler;
pub mod script;
pub mod statements;

use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use crate::cluster::Cluster;
use crate::compute::{ComputeService, Script, Statement};
use crate::err::{HandlerErr, ProvisionErr, StratusErr};
use crate::firewall::{FirewallManager, FirewallRule};
use crate::lifecycle::handler::{ClusterActionHandler, HandlerRegistry};
use crate::lifecycle::statements::{environment, instance_environment, StatementQueue};
use crate::provision::{LaunchOptions, ProvisionEngine};
use crate::roles::{assert_disjoint, assert_topology_disjoint};
use crate::topology::{RoleConfig, RoleSet, Topology};

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Phase {
    Bootstrap,
    Configure,
    Start,
    Stop,
    Cleanup,
}

impl Phase {
    /// the verb used to name a role's default script function for this phase
    pub fn verb(&self) -> &'static str {
        match self {
            Phase::Bootstrap => "install",
            Phase::Configure => "configure",
            Phase::Start => "start",
            Phase::Stop => "stop",
            Phase::Cleanup => "cleanup",
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum Hook {
    Before,
    After,
}

/// What a hook sees of the phase in progress.  Before BOOTSTRAP the cluster
/// has no instances yet.
pub struct PhaseEvent<'a> {
    pub phase: Phase,
    pub topology: &'a Topology,
    pub cluster: &'a mut Cluster,
    pub firewall: &'a mut FirewallManager,
    pub statements: &'a mut StatementQueue,
    pub compute: &'a dyn ComputeService,
}

impl<'a> PhaseEvent<'a> {
    pub fn add_statement(&mut self, role: impl ToString, statement: Statement) {
        self.statements.add(role, statement);
    }

    pub fn add_firewall_rule(&mut self, rule: FirewallRule) {
        self.firewall.add_rule(rule);
    }

    pub fn role_config(&self, role: &str) -> Option<&RoleConfig> {
        self.topology.role_config(role)
    }
}

/// Drives the handlers of a cluster's roles through each phase.  Firewall
/// rules and what has been authorized persist across phases so a retried
/// CONFIGURE only authorizes what is new.
pub struct LifecycleDispatcher {
    compute: Arc<dyn ComputeService>,
    handlers: HandlerRegistry,
    firewall: FirewallManager,
    options: LaunchOptions,
}

impl LifecycleDispatcher {
    pub fn new(compute: Arc<dyn ComputeService>, handlers: HandlerRegistry, topology: &Topology) -> Self {
        Self {
            compute,
            handlers,
            firewall: FirewallManager::for_topology(topology),
            options: LaunchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LaunchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn firewall(&self) -> &FirewallManager {
        &self.firewall
    }

    /// run BOOTSTRAP and return the launched cluster
    pub async fn bootstrap(&mut self, topology: &Topology) -> Result<Cluster, StratusErr> {
        let mut cluster = Cluster::new(topology.cluster_name.as_str());
        self.run(Phase::Bootstrap, topology, &mut cluster).await?;
        Ok(cluster)
    }

    pub async fn run(
        &mut self,
        phase: Phase,
        topology: &Topology,
        cluster: &mut Cluster,
    ) -> Result<(), StratusErr> {
        let roles = match phase {
            Phase::Bootstrap => topology.role_names(),
            _ => cluster.role_names(),
        };
        let handlers = self.handlers.resolve(&roles)?;
        self.check_colocations(phase, topology, cluster, &handlers)?;
        info!(
            "[{}] cluster '{}' with roles {:?}",
            phase,
            cluster.name(),
            roles
        );

        if phase == Phase::Configure {
            self.firewall.add_config_rules(topology);
        }

        let mut statements = StatementQueue::new();
        {
            let mut event = PhaseEvent {
                phase,
                topology,
                cluster: &mut *cluster,
                firewall: &mut self.firewall,
                statements: &mut statements,
                compute: self.compute.as_ref(),
            };
            for handler in &handlers {
                trace!("[{}] before hook of role '{}'", phase, handler.role());
                handler
                    .before(&mut event)
                    .await
                    .map_err(|err| HandlerErr::new(handler.role(), phase, Hook::Before, err))?;
            }
        }

        match phase {
            Phase::Bootstrap => {
                let mut launched = self.provision(topology, &statements).await?;
                launched.set_properties(cluster.properties().clone());
                *cluster = launched;
            }
            Phase::Configure => {
                self.authorize(phase, cluster).await?;
                self.run_statements(phase, topology, cluster, &statements).await?;
            }
            Phase::Start | Phase::Stop => {
                self.run_statements(phase, topology, cluster, &statements).await?;
            }
            Phase::Cleanup => {
                self.run_statements(phase, topology, cluster, &statements).await?;
                self.destroy(phase, cluster).await?;
            }
        }

        {
            let mut event = PhaseEvent {
                phase,
                topology,
                cluster: &mut *cluster,
                firewall: &mut self.firewall,
                statements: &mut statements,
                compute: self.compute.as_ref(),
            };
            for handler in &handlers {
                trace!("[{}] after hook of role '{}'", phase, handler.role());
                handler
                    .after(&mut event)
                    .await
                    .map_err(|err| HandlerErr::new(handler.role(), phase, Hook::After, err))?;
            }
        }
        info!("[{}] cluster '{}' done", phase, cluster.name());
        Ok(())
    }

    /// exclusions declared by handlers and by the `disallow-colocation` of
    /// each role's config.  Checked against the groups before anything is
    /// launched and against the instances afterwards
    fn check_colocations(
        &self,
        phase: Phase,
        topology: &Topology,
        cluster: &Cluster,
        handlers: &Vec<Arc<dyn ClusterActionHandler>>,
    ) -> Result<(), StratusErr> {
        for handler in handlers {
            let role = handler.role();
            let mut others: BTreeSet<String> = handler.disallowed_colocations().into_iter().collect();
            if let Some(config) = topology.role_config(role) {
                others.extend(config.disallow_colocation.iter().cloned());
            }
            for other in &others {
                let checked = match phase {
                    Phase::Bootstrap => assert_topology_disjoint(topology, role, other),
                    _ => assert_disjoint(cluster, role, other),
                };
                checked.map_err(|err| err.in_phase(phase))?;
            }
        }
        Ok(())
    }

    async fn provision(&self, topology: &Topology, statements: &StatementQueue) -> Result<Cluster, StratusErr> {
        let mut bootstrap = BTreeMap::new();
        for group in &topology.groups {
            let script = Script::new(
                environment(topology, &group.roles),
                statements.for_roles(&group.roles),
            );
            bootstrap.insert(group.roles.clone(), script);
        }
        let engine = ProvisionEngine::new(self.compute.clone());
        let (cluster, report) = engine.provision(topology, &bootstrap, &self.options).await?;
        debug!("{}", report);
        Ok(cluster)
    }

    async fn authorize(&mut self, phase: Phase, cluster: &Cluster) -> Result<(), StratusErr> {
        let pending = self.firewall.pending(cluster);
        if pending.is_empty() {
            return Ok(());
        }
        debug!("authorizing {} ingress rule(s)", pending.len());
        self.compute
            .authorize_ingress(pending.as_slice())
            .await
            .map_err(|err| ProvisionErr::ProviderError {
                phase,
                roles: RoleSet::new(cluster.role_names()),
                msg: err.to_string(),
            })?;
        self.firewall.mark_applied(pending.as_slice());
        Ok(())
    }

    /// run each instance's statements with at most `max-concurrent-launches`
    /// instances in flight.  The first failure is returned once every
    /// instance has finished
    async fn run_statements(
        &self,
        phase: Phase,
        topology: &Topology,
        cluster: &Cluster,
        statements: &StatementQueue,
    ) -> Result<(), StratusErr> {
        if statements.is_empty() {
            return Ok(());
        }
        let compute = self.compute.as_ref();
        let results: Vec<Result<(), StratusErr>> = stream::iter(cluster.instances())
            .map(|instance| async move {
                let body = statements.for_roles(instance.roles());
                if body.is_empty() {
                    return Ok(());
                }
                let exports = instance_environment(topology, instance, compute, statements).await;
                let script = Script::new(exports, body);
                compute
                    .run_statements(instance.node(), &script)
                    .await
                    .map_err(|err| {
                        StratusErr::from(ProvisionErr::ProviderError {
                            phase,
                            roles: instance.roles().clone(),
                            msg: err.to_string(),
                        })
                    })
            })
            .buffer_unordered(
                self.options
                    .max_concurrent_launches
                    .unwrap_or(topology.max_concurrent_launches)
                    .max(1),
            )
            .collect()
            .await;
        results.into_iter().collect()
    }

    async fn destroy(&self, phase: Phase, cluster: &mut Cluster) -> Result<(), StratusErr> {
        let ids: Vec<String> = cluster
            .instances()
            .iter()
            .map(|instance| instance.id().to_string())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.compute
            .destroy_instances(ids.as_slice())
            .await
            .map_err(|err| ProvisionErr::ProviderError {
                phase,
                roles: RoleSet::new(cluster.role_names()),
                msg: err.to_string(),
            })?;
        cluster.remove_instances(ids.as_slice());
        info!("destroyed {} instance(s) of cluster '{}'", ids.len(), cluster.name());
        Ok(())
    }
}
