//! The provisioning and retry engine.
//!
//! Every attempt launches the shortfall of each unsettled instance group at
//! once.  Creations share one semaphore so no more than
//! `max-concurrent-launches` provider calls are ever in flight, and every
//! creation reports over a single channel.  A group settles as soon as it has
//! its required number of healthy instances; settled groups are never
//! relaunched.  Groups still short after `max-startup-retries + 1` attempts
//! fail the whole launch.

use derive_builder::Builder;
use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::cluster::{Cluster, Instance};
use crate::compute::{ComputeService, InstanceSpec, Script};
use crate::err::{ComputeErr, ProvisionErr};
use crate::lifecycle::Phase;
use crate::topology::{InstanceGroup, RoleSet, Topology};

/// what happened to one instance group during a provisioning call
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct GroupOutcome {
    pub roles: RoleSet,
    pub target: u32,
    pub required: u32,
    /// attempts in which this group launched instances
    pub attempts: u32,
    /// instance creations started
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub causes: Vec<String>,
}

impl GroupOutcome {
    fn new(group: &InstanceGroup) -> Self {
        Self {
            roles: group.roles.clone(),
            target: group.target,
            required: group.required(),
            attempts: 0,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            causes: vec![],
        }
    }

    pub fn is_success(&self) -> bool {
        self.succeeded >= self.required
    }

    pub fn shortfall(&self) -> u32 {
        self.target.saturating_sub(self.succeeded)
    }
}

impl Display for GroupOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}/{} healthy with {} required after {} attempt(s)",
            self.roles, self.succeeded, self.target, self.required, self.attempts
        )?;
        if let Some(cause) = self.causes.last() {
            write!(f, " (last error: {})", cause)?;
        }
        Ok(())
    }
}

/// The result of a provisioning call, attached to every [ProvisionErr]
#[derive(Clone, Debug, Default)]
pub struct ProvisionReport {
    pub groups: Vec<GroupOutcome>,
    /// healthy instances still running when the call returned
    pub instances: Vec<Instance>,
    /// ids destroyed by the engine: instances that failed readiness and,
    /// when the launch failed with terminate-all set, every healthy instance
    pub destroyed: Vec<String>,
    /// ids of created instances the engine failed to destroy
    pub orphaned: Vec<String>,
}

impl ProvisionReport {
    pub fn group(&self, roles: &RoleSet) -> Option<&GroupOutcome> {
        self.groups.iter().find(|outcome| &outcome.roles == roles)
    }

    pub fn failed_groups(&self) -> Vec<&GroupOutcome> {
        self.groups
            .iter()
            .filter(|outcome| !outcome.is_success())
            .collect()
    }
}

impl Display for ProvisionReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.groups.iter().join(", "))?;
        if !self.instances.is_empty() {
            write!(f, "; {} instance(s) left running", self.instances.len())?;
        }
        Ok(())
    }
}

/// Per call knobs.  Everything defaults to the topology's settings with no
/// deadline and a token that is never cancelled
#[derive(Builder, Clone, Debug, Default)]
#[builder(default)]
pub struct LaunchOptions {
    /// overrides `max-concurrent-launches`
    #[builder(setter(strip_option))]
    pub max_concurrent_launches: Option<usize>,
    /// the whole call fails with [ProvisionErr::Timeout] once this elapses
    #[builder(setter(strip_option))]
    pub deadline: Option<Duration>,
    /// a single instance creation that takes longer than this fails
    #[builder(setter(strip_option))]
    pub instance_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

enum LaunchResult {
    Healthy(Instance),
    Failed {
        cause: String,
        destroyed: Option<String>,
        orphaned: Option<String>,
    },
}

impl LaunchResult {
    fn failed(cause: impl Display) -> Self {
        LaunchResult::Failed {
            cause: cause.to_string(),
            destroyed: None,
            orphaned: None,
        }
    }
}

struct Launched {
    group: usize,
    result: LaunchResult,
}

/// Sends exactly one [Launched] for its slot, even when the launch task
/// panics or is aborted
struct Reporter {
    group: usize,
    tx: mpsc::UnboundedSender<Launched>,
    sent: bool,
}

impl Reporter {
    fn report(mut self, result: LaunchResult) {
        self.sent = true;
        let group = self.group;
        self.tx.send(Launched { group, result }).unwrap_or_default();
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        if !self.sent {
            let group = self.group;
            let result = LaunchResult::failed("launch task ended without reporting");
            self.tx.send(Launched { group, result }).unwrap_or_default();
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Stop {
    Cancelled,
    Timeout,
}

pub struct ProvisionEngine {
    compute: Arc<dyn ComputeService>,
}

impl ProvisionEngine {
    pub fn new(compute: Arc<dyn ComputeService>) -> Self {
        Self { compute }
    }

    /// Launch every instance group of `topology`.  Each machine of a group
    /// runs that group's entry of `bootstrap` on first boot.
    pub async fn provision(
        &self,
        topology: &Topology,
        bootstrap: &BTreeMap<RoleSet, Script>,
        options: &LaunchOptions,
    ) -> Result<(Cluster, ProvisionReport), ProvisionErr> {
        let max_attempts = topology.max_startup_retries + 1;
        let permits = options
            .max_concurrent_launches
            .unwrap_or(topology.max_concurrent_launches)
            .max(1);
        let permits = Arc::new(Semaphore::new(permits));

        let specs: Vec<Arc<InstanceSpec>> = topology
            .groups
            .iter()
            .map(|group| {
                Arc::new(InstanceSpec {
                    cluster_name: topology.cluster_name.clone(),
                    roles: group.roles.clone(),
                    bootstrap: bootstrap.get(&group.roles).cloned().unwrap_or_default(),
                })
            })
            .collect();
        let mut outcomes: Vec<GroupOutcome> = topology.groups.iter().map(GroupOutcome::new).collect();
        let mut healthy: Vec<Vec<Instance>> = topology.groups.iter().map(|_| vec![]).collect();
        let mut destroyed = vec![];
        let mut orphaned = vec![];

        let token = options.cancel.child_token();
        let deadline = options.deadline.map(|deadline| Instant::now() + deadline);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        let mut stop: Option<Stop> = None;

        for attempt in 1..=max_attempts {
            let unsettled = outcomes
                .iter()
                .enumerate()
                // every group launches once; only groups below their threshold retry
                .filter(|(_, outcome)| {
                    outcome.shortfall() > 0 && (outcome.attempts == 0 || !outcome.is_success())
                })
                .map(|(index, _)| index)
                .collect_vec();
            if unsettled.is_empty() {
                break;
            }

            let mut outstanding = 0u32;
            for index in unsettled {
                let outcome = &mut outcomes[index];
                let shortfall = outcome.shortfall();
                outcome.attempts += 1;
                outcome.attempted += shortfall;
                info!(
                    "attempt {}/{}: launching {} instance(s) of [{}]",
                    attempt, max_attempts, shortfall, outcome.roles
                );
                for _ in 0..shortfall {
                    let reporter = Reporter {
                        group: index,
                        tx: tx.clone(),
                        sent: false,
                    };
                    let compute = self.compute.clone();
                    let spec = specs[index].clone();
                    let permits = permits.clone();
                    let token = token.clone();
                    let timeout = options.instance_timeout;
                    tasks.spawn(async move {
                        let result = launch(compute, spec, permits, token, timeout).await;
                        reporter.report(result);
                    });
                    outstanding += 1;
                }
            }

            while outstanding > 0 {
                let expired = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    launched = rx.recv() => {
                        let launched = match launched {
                            Some(launched) => launched,
                            None => break,
                        };
                        outstanding -= 1;
                        let outcome = &mut outcomes[launched.group];
                        match launched.result {
                            LaunchResult::Healthy(instance) => {
                                debug!("instance {} of [{}] is healthy", instance.id(), outcome.roles);
                                outcome.succeeded += 1;
                                healthy[launched.group].push(instance);
                            }
                            LaunchResult::Failed { cause, destroyed: gone, orphaned: lost } => {
                                warn!("instance of [{}] failed to launch: {}", outcome.roles, cause);
                                outcome.failed += 1;
                                outcome.causes.push(cause);
                                destroyed.extend(gone);
                                orphaned.extend(lost);
                            }
                        }
                    }
                    _ = token.cancelled(), if stop.is_none() => {
                        stop = Some(Stop::Cancelled);
                    }
                    _ = expired, if stop.is_none() => {
                        stop = Some(Stop::Timeout);
                        token.cancel();
                    }
                }
            }

            // every slot may have reported before the cancellation was observed
            if stop.is_none() && token.is_cancelled() {
                stop = Some(Stop::Cancelled);
            }
            if stop.is_some() {
                break;
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!("launch task failed: {}", err);
            }
        }

        let failed = outcomes.iter().any(|outcome| !outcome.is_success());
        if stop.is_none() && !failed {
            let mut cluster = Cluster::new(topology.cluster_name.as_str());
            for instance in healthy.into_iter().flatten() {
                cluster.add(instance);
            }
            let report = ProvisionReport {
                groups: outcomes,
                instances: cluster.instances().clone(),
                destroyed,
                orphaned,
            };
            info!(
                "launched {} instance(s) for cluster '{}'",
                cluster.len(),
                cluster.name()
            );
            return Ok((cluster, report));
        }

        let mut instances: Vec<Instance> = healthy.into_iter().flatten().collect();
        if topology.terminate_all_on_launch_failure && !instances.is_empty() {
            let ids: Vec<String> = instances.iter().map(|i| i.id().to_string()).collect();
            warn!(
                "terminating all {} instance(s) of cluster '{}'",
                ids.len(),
                topology.cluster_name
            );
            match self.compute.destroy_instances(ids.as_slice()).await {
                Ok(()) => destroyed.extend(ids),
                Err(err) => {
                    error!("could not terminate instances {:?}: {}", ids, err);
                    orphaned.extend(ids);
                }
            }
            instances.clear();
        }

        let report = ProvisionReport {
            groups: outcomes,
            instances,
            destroyed,
            orphaned,
        };
        let phase = Phase::Bootstrap;
        Err(match stop {
            Some(Stop::Cancelled) => ProvisionErr::Cancelled { phase, report },
            Some(Stop::Timeout) => ProvisionErr::Timeout { phase, report },
            None => ProvisionErr::PartialFailure { phase, report },
        })
    }
}

/// one creation slot: wait for a permit, create, wait for readiness.  A
/// machine that was created but is not ready is destroyed again
async fn launch(
    compute: Arc<dyn ComputeService>,
    spec: Arc<InstanceSpec>,
    permits: Arc<Semaphore>,
    token: CancellationToken,
    timeout: Option<Duration>,
) -> LaunchResult {
    let _permit = tokio::select! {
        biased;
        _ = token.cancelled() => return LaunchResult::failed("cancelled before launch"),
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(err) => return LaunchResult::failed(err),
        },
    };

    let create = async {
        match timeout {
            None => compute.create_instance(&spec).await,
            Some(timeout) => tokio::time::timeout(timeout, compute.create_instance(&spec))
                .await
                .unwrap_or_else(|_| Err(ComputeErr::Timeout(timeout))),
        }
    };
    let node = tokio::select! {
        biased;
        _ = token.cancelled() => return LaunchResult::failed("cancelled while launching"),
        node = create => match node {
            Ok(node) => node,
            Err(err) => return LaunchResult::failed(err),
        },
    };

    let ready = tokio::select! {
        biased;
        _ = token.cancelled() => Err(ComputeErr::not_ready(&node.id, "cancelled")),
        ready = compute.await_ready(&node) => ready,
    };
    match ready {
        Ok(()) => LaunchResult::Healthy(Instance::new(node, spec.roles.clone())),
        Err(err) => {
            let cause = err.to_string();
            match compute.destroy_instances(&[node.id.clone()]).await {
                Ok(()) => LaunchResult::Failed {
                    cause,
                    destroyed: Some(node.id),
                    orphaned: None,
                },
                Err(destroy) => {
                    error!("could not destroy unready instance {}: {}", node.id, destroy);
                    LaunchResult::Failed {
                        cause,
                        destroyed: None,
                        orphaned: Some(node.id),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub mod test {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use crate::compute::stub::StubCompute;
    use crate::compute::{Script, Statement};
    use crate::err::ProvisionErr;
    use crate::provision::{LaunchOptions, LaunchOptionsBuilder, ProvisionEngine};
    use crate::topology::{RoleSet, Topology};

    pub fn topology(templates: &str, extra: &str) -> Topology {
        let yaml = format!(
            "cluster-name: test\nprovider: stub\ninstance-templates: \"{}\"\n{}",
            templates, extra
        );
        Topology::parse(yaml.as_str()).unwrap()
    }

    fn engine(compute: &StubCompute) -> ProvisionEngine {
        ProvisionEngine::new(Arc::new(compute.clone()))
    }

    #[tokio::test]
    pub async fn test_one_attempt() {
        let compute = StubCompute::new();
        let topology = topology("3 zookeeper, 2 web", "");
        let (cluster, report) = engine(&compute)
            .provision(&topology, &BTreeMap::new(), &LaunchOptions::default())
            .await
            .unwrap();
        assert_eq!(cluster.len(), 5);
        assert_eq!(compute.created().len(), 5);
        assert!(report.groups.iter().all(|outcome| outcome.attempts == 1));
        assert_eq!(report.instances.len(), 5);
    }

    #[tokio::test]
    pub async fn test_partial_success_without_retry() {
        let compute = StubCompute::new();
        let topology = topology(
            "10 worker",
            "instance-templates-min-percent-success: \"60 worker\"\n",
        );
        let worker = RoleSet::new(["worker"]);
        compute.fail_next(&worker, 4);
        let (cluster, report) = engine(&compute)
            .provision(&topology, &BTreeMap::new(), &LaunchOptions::default())
            .await
            .unwrap();
        assert_eq!(cluster.len(), 6);
        assert_eq!(compute.attempts(&worker), 10);
        let outcome = report.group(&worker).unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.required, 6);
        assert_eq!(outcome.failed, 4);
    }

    #[tokio::test]
    pub async fn test_zero_percent_group_is_launched() {
        let compute = StubCompute::new();
        let topology = topology(
            "10 worker",
            "instance-templates-min-percent-success: \"0 worker\"\n",
        );
        let worker = RoleSet::new(["worker"]);
        compute.fail_next(&worker, 3);
        let (cluster, report) = engine(&compute)
            .provision(&topology, &BTreeMap::new(), &LaunchOptions::default())
            .await
            .unwrap();
        assert_eq!(compute.attempts(&worker), 10);
        assert_eq!(cluster.len(), 7);
        let outcome = report.group(&worker).unwrap();
        assert_eq!(outcome.required, 0);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.failed, 3);
    }

    #[tokio::test]
    pub async fn test_min_instances_dominates() {
        let compute = StubCompute::new();
        let topology = topology(
            "10 worker",
            "instance-templates-min-percent-success: \"60 worker\"\ninstance-templates-minimum-number-of-instances: \"7 worker\"\n",
        );
        let worker = RoleSet::new(["worker"]);
        compute.fail_next(&worker, 4);
        let (cluster, report) = engine(&compute)
            .provision(&topology, &BTreeMap::new(), &LaunchOptions::default())
            .await
            .unwrap();
        // the second attempt launches exactly the shortfall of 4
        assert_eq!(compute.attempts(&worker), 14);
        assert_eq!(cluster.len(), 10);
        let outcome = report.group(&worker).unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.attempted, 14);
    }

    #[tokio::test]
    pub async fn test_always_failing_group() {
        let compute = StubCompute::new();
        let topology = topology("2 zookeeper, 3 web", "max-startup-retries: 1\n");
        let zookeeper = RoleSet::new(["zookeeper"]);
        compute.fail_always(&zookeeper);
        let err = engine(&compute)
            .provision(&topology, &BTreeMap::new(), &LaunchOptions::default())
            .await
            .unwrap_err();
        let report = match &err {
            ProvisionErr::PartialFailure { report, .. } => report,
            other => panic!("expected PartialFailure, got {:?}", other),
        };
        let outcome = report.group(&zookeeper).unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(compute.attempts(&zookeeper), 4);
        assert_eq!(report.failed_groups().len(), 1);

        // the healthy web group is settled after its first attempt and then terminated
        assert_eq!(compute.attempts(&RoleSet::new(["web"])), 3);
        assert!(report.instances.is_empty());
        assert_eq!(report.destroyed.len(), 3);
        assert!(compute.running().is_empty());
    }

    #[tokio::test]
    pub async fn test_failure_without_terminate() {
        let compute = StubCompute::new();
        let topology = topology(
            "1 zookeeper, 3 web",
            "terminate-all-on-launch-failure: false\n",
        );
        compute.fail_always(&RoleSet::new(["zookeeper"]));
        let err = engine(&compute)
            .provision(&topology, &BTreeMap::new(), &LaunchOptions::default())
            .await
            .unwrap_err();
        let report = err.report().unwrap();
        assert_eq!(report.instances.len(), 3);
        assert_eq!(compute.running().len(), 3);
    }

    #[tokio::test]
    pub async fn test_readiness_failure_is_destroyed() {
        let compute = StubCompute::new();
        let topology = topology("3 zookeeper", "");
        let zookeeper = RoleSet::new(["zookeeper"]);
        compute.fail_ready(&zookeeper, 1);
        let (cluster, report) = engine(&compute)
            .provision(&topology, &BTreeMap::new(), &LaunchOptions::default())
            .await
            .unwrap();
        assert_eq!(cluster.len(), 3);
        assert_eq!(report.destroyed.len(), 1);
        assert_eq!(compute.created().len(), 4);
        assert_eq!(compute.running().len(), 3);
        assert!(cluster.instance(report.destroyed[0].as_str()).is_none());
    }

    #[tokio::test(start_paused = true)]
    pub async fn test_bounded_concurrency() {
        let compute = StubCompute::new();
        compute.set_delay(Duration::from_millis(10));
        let topology = topology("4 zookeeper, 4 web", "max-concurrent-launches: 3\n");
        let (cluster, _) = engine(&compute)
            .provision(&topology, &BTreeMap::new(), &LaunchOptions::default())
            .await
            .unwrap();
        assert_eq!(cluster.len(), 8);
        assert_eq!(compute.max_in_flight(), 3);
    }

    #[tokio::test]
    pub async fn test_bootstrap_script() {
        let compute = StubCompute::new();
        let topology = topology("2 zookeeper", "");
        let zookeeper = RoleSet::new(["zookeeper"]);
        let mut bootstrap = BTreeMap::new();
        bootstrap.insert(
            zookeeper.clone(),
            Script::new(vec![], vec![Statement::function("install_zookeeper")]),
        );
        engine(&compute)
            .provision(&topology, &bootstrap, &LaunchOptions::default())
            .await
            .unwrap();
        let scripts = compute.scripts();
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[0].1.render(), "install_zookeeper\n");
    }

    #[tokio::test(start_paused = true)]
    pub async fn test_cancel_keeps_completed() {
        let compute = StubCompute::new();
        compute.set_delay(Duration::from_millis(50));
        let topology = topology(
            "4 zookeeper",
            "max-concurrent-launches: 1\nterminate-all-on-launch-failure: false\n",
        );
        let options = LaunchOptions::default();
        let cancel = options.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            cancel.cancel();
        });
        let err = engine(&compute)
            .provision(&topology, &BTreeMap::new(), &options)
            .await
            .unwrap_err();
        let report = match &err {
            ProvisionErr::Cancelled { report, .. } => report,
            other => panic!("expected Cancelled, got {:?}", other),
        };
        // every machine the provider created is accounted for
        assert_eq!(report.instances.len(), 2);
        assert_eq!(compute.created().len(), 2);
        assert!(report.orphaned.is_empty());
        assert_eq!(err.exit_code(), crate::err::EXIT_CANCELLED);
    }

    #[tokio::test(start_paused = true)]
    pub async fn test_deadline() {
        let compute = StubCompute::new();
        compute.set_delay(Duration::from_millis(50));
        let topology = topology("3 zookeeper", "max-concurrent-launches: 1\n");
        let options = LaunchOptionsBuilder::default()
            .deadline(Duration::from_millis(75))
            .build()
            .unwrap();
        let err = engine(&compute)
            .provision(&topology, &BTreeMap::new(), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionErr::Timeout { .. }));
        let report = err.report().unwrap();
        assert_eq!(report.group(&RoleSet::new(["zookeeper"])).unwrap().succeeded, 1);
        // terminate-all is on by default
        assert_eq!(report.destroyed.len(), 1);
        assert!(compute.running().is_empty());
    }

    #[tokio::test(start_paused = true)]
    pub async fn test_instance_timeout() {
        let compute = StubCompute::new();
        compute.set_delay(Duration::from_millis(50));
        let topology = topology("2 zookeeper", "max-startup-retries: 0\n");
        let options = LaunchOptionsBuilder::default()
            .instance_timeout(Duration::from_millis(10))
            .build()
            .unwrap();
        let err = engine(&compute)
            .provision(&topology, &BTreeMap::new(), &options)
            .await
            .unwrap_err();
        let report = err.report().unwrap();
        let outcome = report.group(&RoleSet::new(["zookeeper"])).unwrap();
        assert_eq!(outcome.failed, 2);
        assert!(outcome.causes[0].contains("timed out"));
    }
}
