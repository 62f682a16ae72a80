#[macro_use]
extern crate async_trait;
#[macro_use]
extern crate tracing;

pub mod err;

pub mod env;

pub mod logging;

pub mod topology;

pub mod cluster;

pub mod roles;

pub mod firewall;

pub mod compute;

pub mod store;

pub mod provision;

pub mod lifecycle;

pub mod controller;

#[cfg(feature = "cli")]
pub mod cli;

pub use cluster::{Cluster, Instance};
pub use controller::ClusterController;
pub use err::StratusErr;
pub use lifecycle::Phase;
pub use topology::{InstanceGroup, RoleSet, Topology};

pub static VERSION: &'static str = env!("CARGO_PKG_VERSION");
