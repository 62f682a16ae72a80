use itertools::Itertools;
use crate::compute::Statement;
use crate::err::{ConfigErr, StratusErr};
use crate::firewall::FirewallRule;
use crate::lifecycle::handler::ClusterActionHandler;
use crate::lifecycle::PhaseEvent;
use crate::roles::match_all;

/// role config property listing the ports to open on the role's instances
pub const PORTS_PROPERTY: &'static str = "ports";

/// role config property that turns the `retry_helpers` preamble off
pub const RETRY_HELPERS_PROPERTY: &'static str = "retry-helpers";

pub const RETRY_HELPERS_FUNCTION: &'static str = "retry_helpers";

/// A handler driven entirely by the role's config.  Every phase queues the
/// role's script function for that phase: the `<phase>-function` property, or
/// `<verb>_<role>` (for instance `install_hadoop_namenode`).  CONFIGURE also
/// opens the role's `ports` and passes the private addresses of every
/// instance of the role to the function, then publishes them as the
/// `<role>.hosts` cluster property.
#[derive(Clone, Debug)]
pub struct ScriptRoleHandler {
    role: String,
}

impl ScriptRoleHandler {
    pub fn new(role: impl ToString) -> Self {
        Self {
            role: role.to_string(),
        }
    }

    pub fn function(&self, event: &PhaseEvent<'_>) -> String {
        let key = format!("{}-function", event.phase.to_string().to_lowercase());
        match event
            .role_config(self.role.as_str())
            .and_then(|config| config.property(key.as_str()))
        {
            Some(function) => function.to_string(),
            None => format!("{}_{}", event.phase.verb(), self.role.replace('-', "_")),
        }
    }

    fn ports(&self, event: &PhaseEvent<'_>) -> Result<Vec<u16>, ConfigErr> {
        let ports = match event
            .role_config(self.role.as_str())
            .and_then(|config| config.property(PORTS_PROPERTY))
        {
            None => return Ok(vec![]),
            Some(ports) => ports,
        };
        ports
            .split(',')
            .map(|port| port.trim())
            .filter(|port| !port.is_empty())
            .map(|port| {
                port.parse::<u16>().map_err(|_| {
                    ConfigErr::invalid(
                        format!("roles.{}.properties.{}", self.role, PORTS_PROPERTY),
                        format!("'{}' is not a port", port),
                    )
                })
            })
            .collect()
    }

    fn retry_helpers(&self, event: &PhaseEvent<'_>) -> bool {
        event
            .role_config(self.role.as_str())
            .and_then(|config| config.property(RETRY_HELPERS_PROPERTY))
            .map(|value| value != "false")
            .unwrap_or(true)
    }

    /// private addresses of the role's instances in cluster order
    fn hosts(&self, event: &PhaseEvent<'_>) -> Vec<String> {
        match_all(&*event.cluster, self.role.as_str())
            .into_iter()
            .map(|instance| instance.private_ip().unwrap_or(instance.address()).to_string())
            .collect()
    }

    fn queue(&self, event: &mut PhaseEvent<'_>, args: Vec<String>) {
        if self.retry_helpers(event) {
            event.add_statement(self.role.as_str(), Statement::function(RETRY_HELPERS_FUNCTION));
        }
        let function = self.function(event);
        event.add_statement(self.role.as_str(), Statement::call(function, args));
    }
}

#[async_trait]
impl ClusterActionHandler for ScriptRoleHandler {
    fn role(&self) -> &str {
        self.role.as_str()
    }

    async fn before_bootstrap(&self, event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        self.queue(event, vec![]);
        Ok(())
    }

    async fn before_configure(&self, event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        let ports = self.ports(event)?;
        if !ports.is_empty() {
            event.add_firewall_rule(FirewallRule::role(self.role.as_str()).ports(ports));
        }
        let hosts = self.hosts(event);
        self.queue(event, hosts);
        Ok(())
    }

    async fn after_configure(&self, event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        let hosts = self.hosts(event).into_iter().join(",");
        debug!("{} hosts: {}", self.role, hosts);
        event.cluster.set_property(format!("{}.hosts", self.role), hosts);
        Ok(())
    }

    async fn before_start(&self, event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        self.queue(event, vec![]);
        Ok(())
    }

    async fn before_stop(&self, event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        self.queue(event, vec![]);
        Ok(())
    }

    async fn before_cleanup(&self, event: &mut PhaseEvent<'_>) -> Result<(), StratusErr> {
        self.queue(event, vec![]);
        Ok(())
    }
}

#[cfg(test)]
pub mod test {
    use std::sync::Arc;
    use crate::compute::stub::StubCompute;
    use crate::err::{ConfigErr, StratusErr};
    use crate::firewall::WORLD;
    use crate::lifecycle::handler::HandlerRegistry;
    use crate::lifecycle::{LifecycleDispatcher, Phase};
    use crate::topology::Topology;

    fn topology(extra: &str) -> Topology {
        let yaml = format!(
            "cluster-name: zk\nprovider: stub\ninstance-templates: \"3 zookeeper, 1 hadoop-namenode\"\n{}",
            extra
        );
        Topology::parse(yaml.as_str()).unwrap()
    }

    fn dispatcher(compute: &StubCompute, topology: &Topology) -> LifecycleDispatcher {
        let registry = HandlerRegistry::new().with_script_handlers(topology);
        LifecycleDispatcher::new(Arc::new(compute.clone()), registry, topology)
    }

    #[tokio::test]
    pub async fn test_default_functions() -> Result<(), StratusErr> {
        let compute = StubCompute::new();
        let topology = topology("");
        let mut dispatcher = dispatcher(&compute, &topology);
        let cluster = dispatcher.bootstrap(&topology).await?;
        let namenode = cluster
            .instances()
            .iter()
            .find(|instance| instance.has_role("hadoop-namenode"))
            .unwrap();
        let scripts = compute.scripts();
        let (_, script) = scripts.iter().find(|(id, _)| id == namenode.id()).unwrap();
        let body: Vec<String> = script.statements.iter().map(|s| s.to_string()).collect();
        assert_eq!(body, vec!["retry_helpers", "install_hadoop_namenode"]);
        Ok(())
    }

    #[tokio::test]
    pub async fn test_configure() -> Result<(), StratusErr> {
        let compute = StubCompute::new();
        let topology = topology(
            r#"
roles:
  zookeeper:
    properties:
      ports: "2181, 2888,3888"
      configure-function: configure_zk
      retry-helpers: "false"
"#,
        );
        let mut dispatcher = dispatcher(&compute, &topology);
        let mut cluster = dispatcher.bootstrap(&topology).await?;
        dispatcher.run(Phase::Configure, &topology, &mut cluster).await?;

        let authorized = compute.authorized();
        assert_eq!(authorized.len(), 9);
        assert!(authorized.iter().all(|target| target.cidr == WORLD));

        let hosts = cluster.property("zookeeper.hosts").unwrap().to_string();
        assert_eq!(hosts.split(',').count(), 3);

        let zk = cluster
            .instances()
            .iter()
            .find(|instance| instance.has_role("zookeeper"))
            .unwrap();
        let scripts = compute.scripts();
        let (_, script) = scripts
            .iter()
            .rev()
            .find(|(id, _)| id == zk.id())
            .unwrap();
        assert_eq!(
            script.statements[0].to_string(),
            format!("configure_zk {}", hosts.replace(',', " "))
        );
        assert_eq!(script.statements.len(), 1);
        Ok(())
    }

    #[tokio::test]
    pub async fn test_bad_ports() -> Result<(), StratusErr> {
        let compute = StubCompute::new();
        let topology = topology(
            r#"
roles:
  zookeeper:
    properties:
      ports: "2181,zk"
"#,
        );
        let mut dispatcher = dispatcher(&compute, &topology);
        let mut cluster = dispatcher.bootstrap(&topology).await?;
        match dispatcher.run(Phase::Configure, &topology, &mut cluster).await {
            Err(StratusErr::Handler(err)) => {
                assert_eq!(err.role, "zookeeper");
                assert!(matches!(
                    *err.cause,
                    StratusErr::Config(ConfigErr::Invalid { .. })
                ));
            }
            other => panic!("expected a handler error, got {:?}", other),
        }
        Ok(())
    }
}
