use std::fmt::Display;
use thiserror::Error;
use crate::lifecycle::{Hook, Phase};
use crate::provision::ProvisionReport;
use crate::topology::RoleSet;

pub const EXIT_OTHER: i32 = 1;
pub const EXIT_CONFIG: i32 = 10;
pub const EXIT_TOPOLOGY: i32 = 11;
pub const EXIT_PARTIAL_FAILURE: i32 = 20;
pub const EXIT_TIMEOUT: i32 = 21;
pub const EXIT_PROVIDER: i32 = 22;
pub const EXIT_CANCELLED: i32 = 23;
pub const EXIT_HANDLER: i32 = 30;
pub const EXIT_STATE_NOT_FOUND: i32 = 40;
pub const EXIT_STATE_CORRUPT: i32 = 41;
pub const EXIT_STATE_WRITE_FAILED: i32 = 42;

/// the umbrella error returned by every public operation of the crate.
#[derive(Error, Clone, Debug)]
pub enum StratusErr {
    #[error("{0}")]
    Config(#[from] ConfigErr),
    #[error("{0}")]
    Topology(#[from] TopologyErr),
    #[error("{0}")]
    Provision(#[from] ProvisionErr),
    #[error("{0}")]
    Handler(#[from] HandlerErr),
    #[error("{0}")]
    Store(#[from] StoreErr),
    #[error("{0}")]
    Compute(#[from] ComputeErr),
    #[error("{0}")]
    Msg(String),
}

impl StratusErr {
    pub fn msg(err: impl Display) -> Self {
        Self::Msg(err.to_string())
    }

    /// process exit code for the cli; each error family owns its own range
    pub fn exit_code(&self) -> i32 {
        match self {
            StratusErr::Config(_) => EXIT_CONFIG,
            StratusErr::Topology(_) => EXIT_TOPOLOGY,
            StratusErr::Provision(err) => err.exit_code(),
            StratusErr::Handler(_) => EXIT_HANDLER,
            StratusErr::Store(err) => err.exit_code(),
            StratusErr::Compute(_) => EXIT_PROVIDER,
            StratusErr::Msg(_) => EXIT_OTHER,
        }
    }

    /// a fatal error stops the current operation and must not be retried
    /// without operator intervention
    pub fn is_fatal(&self) -> bool {
        match self {
            StratusErr::Config(_) => true,
            StratusErr::Topology(_) => true,
            StratusErr::Store(StoreErr::NotFound { .. }) => false,
            StratusErr::Store(_) => true,
            _ => false,
        }
    }
}

#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum ConfigErr {
    #[error("topology config could not be parsed: '{0}'")]
    Parse(String),
    #[error("invalid instance template string '{template}': {msg}")]
    Template { template: String, msg: String },
    #[error("instance group [{0}] is declared more than once")]
    DuplicateRoleSet(RoleSet),
    #[error("instance group [{roles}]: {msg}")]
    Group { roles: RoleSet, msg: String },
    #[error("illegal value for '{key}': {msg}")]
    Invalid { key: String, msg: String },
    #[error("missing required property '{0}'")]
    Missing(String),
    #[error("no handler is registered for role '{0}'")]
    NoHandler(String),
    #[error("provider: '{0}' is recognized but is not available on this build of Stratus")]
    ProviderNotAvailable(String),
}

impl ConfigErr {
    pub fn parse(err: impl Display) -> Self {
        Self::Parse(err.to_string())
    }

    pub fn template<T, M>(template: T, msg: M) -> Self
    where
        T: AsRef<str>,
        M: AsRef<str>,
    {
        let template = template.as_ref().to_string();
        let msg = msg.as_ref().to_string();
        Self::Template { template, msg }
    }

    pub fn group<M>(roles: &RoleSet, msg: M) -> Self
    where
        M: AsRef<str>,
    {
        let roles = roles.clone();
        let msg = msg.as_ref().to_string();
        Self::Group { roles, msg }
    }

    pub fn invalid<K, M>(key: K, msg: M) -> Self
    where
        K: AsRef<str>,
        M: AsRef<str>,
    {
        let key = key.as_ref().to_string();
        let msg = msg.as_ref().to_string();
        Self::Invalid { key, msg }
    }

    pub fn missing(key: impl AsRef<str>) -> Self {
        Self::Missing(key.as_ref().to_string())
    }

    pub fn no_handler(role: impl AsRef<str>) -> Self {
        Self::NoHandler(role.as_ref().to_string())
    }

    pub fn provider_not_available(provider: impl AsRef<str>) -> Self {
        Self::ProviderNotAvailable(provider.as_ref().to_string())
    }
}

#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum TopologyErr {
    #[error("cluster '{cluster}' has no instance with role '{role}'")]
    NotFound { cluster: String, role: String },
    #[error("cluster '{cluster}' has {count} instances with role '{role}' where exactly one is required")]
    Ambiguous {
        cluster: String,
        role: String,
        count: usize,
    },
    #[error("roles '{a}' and '{b}' must not share an instance but {location} carries both")]
    Conflict {
        a: String,
        b: String,
        location: String,
    },
    #[error("[{phase}] {err}")]
    InPhase { phase: Phase, err: Box<TopologyErr> },
}

impl TopologyErr {
    pub fn not_found(cluster: impl ToString, role: impl ToString) -> Self {
        let cluster = cluster.to_string();
        let role = role.to_string();
        Self::NotFound { cluster, role }
    }

    pub fn ambiguous(cluster: impl ToString, role: impl ToString, count: usize) -> Self {
        let cluster = cluster.to_string();
        let role = role.to_string();
        Self::Ambiguous {
            cluster,
            role,
            count,
        }
    }

    pub fn conflict(a: impl ToString, b: impl ToString, location: impl ToString) -> Self {
        let a = a.to_string();
        let b = b.to_string();
        let location = location.to_string();
        Self::Conflict { a, b, location }
    }

    /// tag with the lifecycle phase whose checks failed
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            Self::InPhase { err, .. } => Self::InPhase { phase, err },
            err => Self::InPhase {
                phase,
                err: Box::new(err),
            },
        }
    }
}

#[derive(Error, Clone, Debug)]
pub enum ProvisionErr {
    #[error("[{phase}] launch failed: {report}")]
    PartialFailure { phase: Phase, report: ProvisionReport },
    #[error("[{phase}] launch deadline elapsed: {report}")]
    Timeout { phase: Phase, report: ProvisionReport },
    #[error("[{phase}] launch cancelled: {report}")]
    Cancelled { phase: Phase, report: ProvisionReport },
    #[error("[{phase}] provider error for instance group [{roles}]: '{msg}'")]
    ProviderError {
        phase: Phase,
        roles: RoleSet,
        msg: String,
    },
}

impl ProvisionErr {
    pub fn report(&self) -> Option<&ProvisionReport> {
        match self {
            ProvisionErr::PartialFailure { report, .. } => Some(report),
            ProvisionErr::Timeout { report, .. } => Some(report),
            ProvisionErr::Cancelled { report, .. } => Some(report),
            ProvisionErr::ProviderError { .. } => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionErr::PartialFailure { .. } => EXIT_PARTIAL_FAILURE,
            ProvisionErr::Timeout { .. } => EXIT_TIMEOUT,
            ProvisionErr::Cancelled { .. } => EXIT_CANCELLED,
            ProvisionErr::ProviderError { .. } => EXIT_PROVIDER,
        }
    }
}

/// a hook of a [crate::lifecycle::ClusterActionHandler] failed.  The phase
/// that was running is aborted; phases that already completed are left alone.
#[derive(Error, Clone, Debug)]
#[error("[{phase}] {hook} hook of role '{role}' failed: {cause}")]
pub struct HandlerErr {
    pub role: String,
    pub phase: Phase,
    pub hook: Hook,
    pub cause: Box<StratusErr>,
}

impl HandlerErr {
    pub fn new(role: impl ToString, phase: Phase, hook: Hook, cause: StratusErr) -> Self {
        let role = role.to_string();
        let cause = Box::new(cause);
        Self {
            role,
            phase,
            hook,
            cause,
        }
    }
}

#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum StoreErr {
    #[error("no saved state for cluster '{cluster}'")]
    NotFound { cluster: String },
    #[error("saved state for cluster '{cluster}' is corrupt: '{msg}'")]
    Corrupt { cluster: String, msg: String },
    #[error("could not write state for cluster '{cluster}': '{msg}'")]
    WriteFailed { cluster: String, msg: String },
}

impl StoreErr {
    pub fn not_found(cluster: impl ToString) -> Self {
        let cluster = cluster.to_string();
        Self::NotFound { cluster }
    }

    pub fn corrupt(cluster: impl ToString, err: impl Display) -> Self {
        let cluster = cluster.to_string();
        let msg = err.to_string();
        Self::Corrupt { cluster, msg }
    }

    pub fn write_failed(cluster: impl ToString, err: impl Display) -> Self {
        let cluster = cluster.to_string();
        let msg = err.to_string();
        Self::WriteFailed { cluster, msg }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreErr::NotFound { .. })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            StoreErr::NotFound { .. } => EXIT_STATE_NOT_FOUND,
            StoreErr::Corrupt { .. } => EXIT_STATE_CORRUPT,
            StoreErr::WriteFailed { .. } => EXIT_STATE_WRITE_FAILED,
        }
    }
}

/// errors reported by a [crate::compute::ComputeService] or a
/// [crate::store::blob::BlobStore] collaborator
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum ComputeErr {
    #[error("provider error: '{0}'")]
    Provider(String),
    #[error("instance '{id}' did not become ready: '{msg}'")]
    NotReady { id: String, msg: String },
    #[error("could not resolve addresses of instance '{id}': '{msg}'")]
    Resolve { id: String, msg: String },
    #[error("statements failed on instance '{id}': '{msg}'")]
    Statements { id: String, msg: String },
    #[error("instance creation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("blob '{0}' not found")]
    BlobNotFound(String),
}

impl ComputeErr {
    pub fn provider(err: impl Display) -> Self {
        Self::Provider(err.to_string())
    }

    pub fn not_ready(id: impl ToString, err: impl Display) -> Self {
        let id = id.to_string();
        let msg = err.to_string();
        Self::NotReady { id, msg }
    }

    pub fn resolve(id: impl ToString, err: impl Display) -> Self {
        let id = id.to_string();
        let msg = err.to_string();
        Self::Resolve { id, msg }
    }

    pub fn statements(id: impl ToString, err: impl Display) -> Self {
        let id = id.to_string();
        let msg = err.to_string();
        Self::Statements { id, msg }
    }
}
