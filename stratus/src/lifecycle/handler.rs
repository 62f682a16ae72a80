use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use crate::err::{ConfigErr, StratusErr};
use crate::lifecycle::script::ScriptRoleHandler;
use crate::lifecycle::{Phase, PhaseEvent};
use crate::topology::Topology;

/// The per role capability driven through every lifecycle phase.  Every hook
/// defaults to doing nothing.  `before_*` hooks contribute statements and
/// firewall rules, `after_*` hooks may read and replace the cluster
/// properties.
#[async_trait]
pub trait ClusterActionHandler: Send + Sync {
    fn role(&self) -> &str;

    /// roles that must never share an instance with [ClusterActionHandler::role]
    fn disallowed_colocations(&self) -> Vec<String> {
        vec![]
    }

    async fn before_bootstrap(&self, _event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        Ok(())
    }

    async fn after_bootstrap(&self, _event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        Ok(())
    }

    async fn before_configure(&self, _event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        Ok(())
    }

    async fn after_configure(&self, _event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        Ok(())
    }

    async fn before_start(&self, _event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        Ok(())
    }

    async fn after_start(&self, _event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        Ok(())
    }

    async fn before_stop(&self, _event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        Ok(())
    }

    async fn after_stop(&self, _event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        Ok(())
    }

    async fn before_cleanup(&self, _event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        Ok(())
    }

    async fn after_cleanup(&self, _event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        Ok(())
    }

    async fn before(&self, event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        match event.phase {
            Phase::Bootstrap => self.before_bootstrap(event).await,
            Phase::Configure => self.before_configure(event).await,
            Phase::Start => self.before_start(event).await,
            Phase::Stop => self.before_stop(event).await,
            Phase::Cleanup => self.before_cleanup(event).await,
        }
    }

    async fn after(&self, event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        match event.phase {
            Phase::Bootstrap => self.after_bootstrap(event).await,
            Phase::Configure => self.after_configure(event).await,
            Phase::Start => self.after_start(event).await,
            Phase::Stop => self.after_stop(event).await,
            Phase::Cleanup => self.after_cleanup(event).await,
        }
    }
}

/// role name -> handler, built once at startup
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn ClusterActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// register `handler` for its role, replacing any earlier registration
    pub fn register<H>(&mut self, handler: H)
    where
        H: ClusterActionHandler + 'static,
    {
        self.handlers
            .insert(handler.role().to_string(), Arc::new(handler));
    }

    /// a [ScriptRoleHandler] for every role of `topology` that has no handler yet
    pub fn with_script_handlers(mut self, topology: &Topology) -> Self {
        for role in topology.role_names() {
            if !self.handlers.contains_key(&role) {
                self.register(ScriptRoleHandler::new(role));
            }
        }
        self
    }

    pub fn get(&self, role: &str) -> Option<Arc<dyn ClusterActionHandler>> {
        self.handlers.get(role).cloned()
    }

    pub fn roles(&self) -> Vec<&String> {
        self.handlers.keys().collect()
    }

    /// one handler per role in sorted role order
    pub fn resolve(
        &self,
        roles: &BTreeSet<String>,
    ) -> Result<Vec<Arc<dyn ClusterActionHandler>>, ConfigErr> {
        roles
            .iter()
            .map(|role| self.get(role).ok_or_else(|| ConfigErr::no_handler(role)))
            .collect()
    }
}

#[cfg(test)]
pub mod test {
    use std::collections::BTreeSet;
    use crate::err::ConfigErr;
    use crate::lifecycle::handler::{ClusterActionHandler, HandlerRegistry};
    use crate::lifecycle::script::ScriptRoleHandler;
    use crate::topology::Topology;

    #[test]
    pub fn test_resolve() {
        let mut registry = HandlerRegistry::new();
        registry.register(ScriptRoleHandler::new("zookeeper"));
        registry.register(ScriptRoleHandler::new("web"));

        let roles: BTreeSet<String> = ["zookeeper", "web"].iter().map(|r| r.to_string()).collect();
        let handlers = registry.resolve(&roles).unwrap();
        let names: Vec<&str> = handlers.iter().map(|handler| handler.role()).collect();
        assert_eq!(names, vec!["web", "zookeeper"]);

        let roles: BTreeSet<String> = ["kafka"].iter().map(|r| r.to_string()).collect();
        assert_eq!(
            registry.resolve(&roles).err(),
            Some(ConfigErr::no_handler("kafka"))
        );
    }

    #[test]
    pub fn test_script_fallback() {
        let topology = Topology::parse(
            "cluster-name: zk\nprovider: stub\ninstance-templates: \"1 zookeeper+monitor, 2 web\"",
        )
        .unwrap();
        let registry = HandlerRegistry::new().with_script_handlers(&topology);
        assert_eq!(registry.roles(), vec!["monitor", "web", "zookeeper"]);
    }
}
