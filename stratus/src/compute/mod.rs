//! The boundary to the cloud.  Everything provider specific lives behind
//! [ComputeService]; this crate only ever sees opaque [NodeHandle]s.

pub mod stub;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use crate::cluster::Addresses;
use crate::compute::stub::StubCompute;
use crate::err::{ComputeErr, ConfigErr};
use crate::firewall::IngressTarget;
use crate::topology::{RoleSet, Topology};

/// the provider's view of a machine it created
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeHandle {
    pub id: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    /// opaque provider metadata (image, hardware, location...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// an opaque unit of remote configuration work contributed by a handler
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Statement {
    /// call a function from the provider's script library
    Call { function: String, args: Vec<String> },
    Raw(String),
}

impl Statement {
    pub fn call<F, I, A>(function: F, args: I) -> Self
    where
        F: ToString,
        I: IntoIterator<Item = A>,
        A: ToString,
    {
        let function = function.to_string();
        let args = args.into_iter().map(|arg| arg.to_string()).collect();
        Statement::Call { function, args }
    }

    pub fn function(function: impl ToString) -> Self {
        Statement::call(function, Vec::<String>::new())
    }

    pub fn raw(line: impl ToString) -> Self {
        Statement::Raw(line.to_string())
    }
}

impl Display for Statement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Statement::Call { function, args } if args.is_empty() => f.write_str(function),
            Statement::Call { function, args } => {
                write!(f, "{} {}", function, args.iter().join(" "))
            }
            Statement::Raw(line) => f.write_str(line),
        }
    }
}

/// everything one instance runs in one phase: the exported environment
/// followed by the statements
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub exports: Vec<(String, String)>,
    pub statements: Vec<Statement>,
}

impl Script {
    pub fn new(exports: Vec<(String, String)>, statements: Vec<Statement>) -> Self {
        Self {
            exports,
            statements,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn render(&self) -> String {
        let mut rtn = String::new();
        for (key, value) in &self.exports {
            rtn.push_str(format!("export {}=\"{}\"\n", key, value.replace('"', "\\\"")).as_str());
        }
        for statement in &self.statements {
            rtn.push_str(statement.to_string().as_str());
            rtn.push('\n');
        }
        rtn
    }
}

/// what the provisioning engine asks the provider for: one machine carrying
/// `roles` that runs `bootstrap` on first boot
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSpec {
    pub cluster_name: String,
    pub roles: RoleSet,
    pub bootstrap: Script,
}

#[async_trait]
pub trait ComputeService: Send + Sync {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<NodeHandle, ComputeErr>;

    /// Batch form of [ComputeService::create_instance] for collaborators that
    /// want `count` nodes in one call, with one result per slot.  The
    /// provisioning engine does not use it.  It launches each slot on its own
    /// so launches stay bounded by its permits and cancellation.
    async fn create_instances(
        &self,
        spec: &InstanceSpec,
        count: usize,
    ) -> Vec<Result<NodeHandle, ComputeErr>> {
        let calls = (0..count).map(|_| self.create_instance(spec));
        futures::future::join_all(calls).await
    }

    /// post boot readiness check. Providers without one report ready at once
    async fn await_ready(&self, node: &NodeHandle) -> Result<(), ComputeErr> {
        Ok(())
    }

    async fn destroy_instances(&self, ids: &[String]) -> Result<(), ComputeErr>;

    async fn resolve_addresses(&self, node: &NodeHandle) -> Result<Addresses, ComputeErr>;

    async fn run_statements(&self, node: &NodeHandle, script: &Script) -> Result<(), ComputeErr>;

    async fn authorize_ingress(&self, targets: &[IngressTarget]) -> Result<(), ComputeErr>;
}

/// select the compute provider named by the topology
pub fn create(topology: &Topology) -> Result<Arc<dyn ComputeService>, ConfigErr> {
    match topology.provider.as_str() {
        "stub" => Ok(Arc::new(StubCompute::new())),
        other => Err(ConfigErr::provider_not_available(other)),
    }
}
