//! An in process compute provider.  Machines are simulated, nothing leaves the
//! process.  Used by `provider: stub` for dry runs and throughout the tests,
//! where its failure injection drives the retry engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use crate::cluster::Addresses;
use crate::compute::{ComputeService, InstanceSpec, NodeHandle, Script};
use crate::err::ComputeErr;
use crate::firewall::IngressTarget;
use crate::topology::RoleSet;

#[derive(Clone, Debug, Default)]
struct Failures {
    /// the next `n` creations fail
    create: usize,
    create_always: bool,
    /// the next `n` created machines fail their readiness check
    ready: usize,
}

#[derive(Default)]
struct StubState {
    failures: HashMap<RoleSet, Failures>,
    statement_failures: Vec<String>,
    roles: HashMap<String, RoleSet>,
    created: Vec<NodeHandle>,
    destroyed: Vec<String>,
    scripts: Vec<(String, Script)>,
    authorized: Vec<IngressTarget>,
    attempts: HashMap<RoleSet, usize>,
}

#[derive(Clone, Default)]
pub struct StubCompute {
    state: Arc<Mutex<StubState>>,
    sequence: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    resolve_calls: Arc<AtomicUsize>,
    fail_resolve: Arc<AtomicBool>,
    delay: Arc<Mutex<Option<Duration>>>,
}

/// keeps the in flight gauge honest when a creation future is dropped
struct InFlight<'a> {
    gauge: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a AtomicUsize, watermark: &AtomicUsize) -> Self {
        let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
        watermark.fetch_max(now, Ordering::SeqCst);
        Self { gauge }
    }
}

impl<'a> Drop for InFlight<'a> {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StubCompute {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// fail the next `count` creations for `roles`
    pub fn fail_next(&self, roles: &RoleSet, count: usize) {
        self.state()
            .failures
            .entry(roles.clone())
            .or_default()
            .create = count;
    }

    /// fail every creation for `roles`
    pub fn fail_always(&self, roles: &RoleSet) {
        self.state()
            .failures
            .entry(roles.clone())
            .or_default()
            .create_always = true;
    }

    /// the next `count` machines created for `roles` fail their readiness check
    pub fn fail_ready(&self, roles: &RoleSet, count: usize) {
        self.state()
            .failures
            .entry(roles.clone())
            .or_default()
            .ready = count;
    }

    /// statements fail on any instance carrying `role`
    pub fn fail_statements(&self, role: impl ToString) {
        self.state().statement_failures.push(role.to_string());
    }

    pub fn fail_resolve(&self, fail: bool) {
        self.fail_resolve.store(fail, Ordering::SeqCst);
    }

    /// every creation takes at least `delay`
    pub fn set_delay(&self, delay: Duration) {
        let mut guard = self.delay.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(delay);
    }

    pub fn created(&self) -> Vec<NodeHandle> {
        self.state().created.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state().destroyed.clone()
    }

    /// machines created and not destroyed
    pub fn running(&self) -> Vec<NodeHandle> {
        let state = self.state();
        state
            .created
            .iter()
            .filter(|node| !state.destroyed.contains(&node.id))
            .cloned()
            .collect()
    }

    pub fn scripts(&self) -> Vec<(String, Script)> {
        self.state().scripts.clone()
    }

    pub fn authorized(&self) -> Vec<IngressTarget> {
        self.state().authorized.clone()
    }

    /// number of creation calls made for `roles`
    pub fn attempts(&self, roles: &RoleSet) -> usize {
        self.state().attempts.get(roles).cloned().unwrap_or_default()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    fn next_node(&self, spec: &InstanceSpec) -> NodeHandle {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("provider".to_string(), "stub".to_string());
        metadata.insert("cluster".to_string(), spec.cluster_name.clone());
        NodeHandle {
            id: format!("stub-{:05}", seq),
            public_ip: Some(format!("203.0.{}.{}", seq / 250, seq % 250 + 1)),
            private_ip: Some(format!("10.0.{}.{}", seq / 250, seq % 250 + 1)),
            metadata,
        }
    }
}

#[async_trait]
impl ComputeService for StubCompute {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<NodeHandle, ComputeErr> {
        let _in_flight = InFlight::enter(&self.in_flight, &self.max_in_flight);

        let delay = *self.delay.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        *state.attempts.entry(spec.roles.clone()).or_default() += 1;
        if let Some(failures) = state.failures.get_mut(&spec.roles) {
            if failures.create_always {
                return Err(ComputeErr::provider(format!(
                    "injected failure creating [{}]",
                    spec.roles
                )));
            }
            if failures.create > 0 {
                failures.create -= 1;
                return Err(ComputeErr::provider(format!(
                    "injected failure creating [{}]",
                    spec.roles
                )));
            }
        }

        let node = self.next_node(spec);
        state.roles.insert(node.id.clone(), spec.roles.clone());
        state.created.push(node.clone());
        if !spec.bootstrap.is_empty() {
            state.scripts.push((node.id.clone(), spec.bootstrap.clone()));
        }
        Ok(node)
    }

    async fn await_ready(&self, node: &NodeHandle) -> Result<(), ComputeErr> {
        let mut state = self.state();
        let roles = match state.roles.get(&node.id) {
            Some(roles) => roles.clone(),
            None => return Err(ComputeErr::not_ready(&node.id, "unknown machine")),
        };
        if let Some(failures) = state.failures.get_mut(&roles) {
            if failures.ready > 0 {
                failures.ready -= 1;
                return Err(ComputeErr::not_ready(&node.id, "injected readiness failure"));
            }
        }
        Ok(())
    }

    async fn destroy_instances(&self, ids: &[String]) -> Result<(), ComputeErr> {
        let mut state = self.state();
        for id in ids {
            if !state.destroyed.contains(id) {
                state.destroyed.push(id.clone());
            }
        }
        Ok(())
    }

    async fn resolve_addresses(&self, node: &NodeHandle) -> Result<Addresses, ComputeErr> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_resolve.load(Ordering::SeqCst) {
            return Err(ComputeErr::resolve(&node.id, "injected resolver failure"));
        }
        Ok(Addresses::new(
            Some(format!("{}.public.stub", node.id)),
            Some(format!("{}.private.stub", node.id)),
        ))
    }

    async fn run_statements(&self, node: &NodeHandle, script: &Script) -> Result<(), ComputeErr> {
        let mut state = self.state();
        let failing = match state.roles.get(&node.id) {
            Some(roles) => state
                .statement_failures
                .iter()
                .any(|role| roles.contains(role)),
            None => false,
        };
        if failing {
            return Err(ComputeErr::statements(&node.id, "injected statement failure"));
        }
        state.scripts.push((node.id.clone(), script.clone()));
        Ok(())
    }

    async fn authorize_ingress(&self, targets: &[IngressTarget]) -> Result<(), ComputeErr> {
        self.state().authorized.extend(targets.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
pub mod test {
    use crate::compute::stub::StubCompute;
    use crate::compute::{ComputeService, InstanceSpec, Script};
    use crate::topology::RoleSet;

    fn spec(roles: &RoleSet) -> InstanceSpec {
        InstanceSpec {
            cluster_name: "test".to_string(),
            roles: roles.clone(),
            bootstrap: Script::default(),
        }
    }

    #[tokio::test]
    pub async fn test_fail_next() {
        let compute = StubCompute::new();
        let roles = RoleSet::new(["worker"]);
        compute.fail_next(&roles, 2);
        let results = compute.create_instances(&spec(&roles), 3).await;
        assert_eq!(results.iter().filter(|result| result.is_err()).count(), 2);
        assert_eq!(compute.created().len(), 1);
        assert_eq!(compute.attempts(&roles), 3);
    }

    #[tokio::test]
    pub async fn test_destroy() {
        let compute = StubCompute::new();
        let roles = RoleSet::new(["worker"]);
        let node = compute.create_instance(&spec(&roles)).await.unwrap();
        assert_eq!(compute.running().len(), 1);
        compute.destroy_instances(&[node.id.clone()]).await.unwrap();
        assert!(compute.running().is_empty());
    }
}
