use std::sync::Arc;
use crate::cluster::Cluster;
use crate::compute::ComputeService;
use crate::env::StratusEnv;
use crate::err::StratusErr;
use crate::lifecycle::handler::{ClusterActionHandler, HandlerRegistry};
use crate::lifecycle::{LifecycleDispatcher, Phase};
use crate::provision::LaunchOptions;
use crate::store::{StateStore, StateStoreFactory};
use crate::topology::Topology;

/// The entry point for every cluster operation.  Chains the lifecycle phases
/// and persists the cluster manifest after each of them, so a later process
/// can pick the cluster up by name.
pub struct ClusterController {
    topology: Topology,
    env: StratusEnv,
    compute: Arc<dyn ComputeService>,
    store: Arc<dyn StateStore>,
    handlers: HandlerRegistry,
    options: LaunchOptions,
}

impl ClusterController {
    pub fn new(
        topology: Topology,
        env: StratusEnv,
        compute: Arc<dyn ComputeService>,
        store: Arc<dyn StateStore>,
        handlers: HandlerRegistry,
    ) -> Self {
        let handlers = handlers.with_script_handlers(&topology);
        Self {
            topology,
            env,
            compute,
            store,
            handlers,
            options: LaunchOptions::default(),
        }
    }

    /// the compute provider and state store the topology names, with a
    /// script handler for every role
    pub fn create(topology: Topology, env: StratusEnv) -> Result<Self, StratusErr> {
        let compute = crate::compute::create(&topology)?;
        let store = StateStoreFactory::new(env.clone()).create(&topology)?;
        Ok(Self::new(topology, env, compute, store, HandlerRegistry::new()))
    }

    pub fn with_options(mut self, options: LaunchOptions) -> Self {
        self.options = options;
        self
    }

    /// replace the handler of the handler's role
    pub fn register<H>(&mut self, handler: H)
    where
        H: ClusterActionHandler + 'static,
    {
        self.handlers.register(handler);
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn env(&self) -> &StratusEnv {
        &self.env
    }

    fn dispatcher(&self) -> LifecycleDispatcher {
        LifecycleDispatcher::new(self.compute.clone(), self.handlers.clone(), &self.topology)
            .with_options(self.options.clone())
    }

    async fn save(&self, cluster: &Cluster) -> Result<(), StratusErr> {
        if let Err(err) = self.store.save_cluster(cluster).await {
            error!(
                "manifest of cluster '{}' could not be saved, running instances: {:?}",
                cluster.name(),
                cluster
                    .instances()
                    .iter()
                    .map(|instance| instance.id())
                    .collect::<Vec<&str>>()
            );
            return Err(err.into());
        }
        Ok(())
    }

    async fn load(&self) -> Result<Cluster, StratusErr> {
        Ok(self
            .store
            .load_cluster(self.topology.cluster_name.as_str())
            .await?)
    }

    /// BOOTSTRAP, CONFIGURE and START, saving the manifest after each
    pub async fn launch(&self) -> Result<Cluster, StratusErr> {
        info!(
            "launching cluster '{}' on provider '{}'",
            self.topology.cluster_name, self.topology.provider
        );
        let mut dispatcher = self.dispatcher();
        let mut cluster = dispatcher.bootstrap(&self.topology).await?;
        self.save(&cluster).await?;
        for phase in [Phase::Configure, Phase::Start] {
            dispatcher.run(phase, &self.topology, &mut cluster).await?;
            self.save(&cluster).await?;
        }
        info!(
            "cluster '{}' launched with {} instance(s)",
            cluster.name(),
            cluster.len()
        );
        Ok(cluster)
    }

    async fn transition(&self, phase: Phase) -> Result<Cluster, StratusErr> {
        let mut cluster = self.load().await?;
        let mut dispatcher = self.dispatcher();
        dispatcher.run(phase, &self.topology, &mut cluster).await?;
        self.save(&cluster).await?;
        Ok(cluster)
    }

    pub async fn configure(&self) -> Result<Cluster, StratusErr> {
        self.transition(Phase::Configure).await
    }

    pub async fn start(&self) -> Result<Cluster, StratusErr> {
        self.transition(Phase::Start).await
    }

    pub async fn stop(&self) -> Result<Cluster, StratusErr> {
        self.transition(Phase::Stop).await
    }

    /// CLEANUP, then forget the cluster
    pub async fn destroy(&self) -> Result<(), StratusErr> {
        let mut cluster = self.load().await?;
        let mut dispatcher = self.dispatcher();
        dispatcher
            .run(Phase::Cleanup, &self.topology, &mut cluster)
            .await?;
        self.store.delete(cluster.name()).await?;
        info!("cluster '{}' destroyed", cluster.name());
        Ok(())
    }

    pub async fn list_instances(&self) -> Result<Cluster, StratusErr> {
        self.load().await
    }
}

#[cfg(test)]
pub mod test {
    use std::sync::Arc;
    use tempdir::TempDir;
    use crate::compute::stub::StubCompute;
    use crate::controller::ClusterController;
    use crate::env::StratusEnv;
    use crate::err::{ConfigErr, StoreErr, StratusErr, EXIT_STATE_NOT_FOUND};
    use crate::lifecycle::handler::HandlerRegistry;
    use crate::store::local::LocalStateStore;
    use crate::store::memory::MemoryStateStore;
    use crate::store::StateStore;
    use crate::topology::Topology;

    fn topology(store: &str) -> Topology {
        let yaml = format!(
            "cluster-name: zk\nprovider: stub\nstate-store: {}\ninstance-templates: \"3 zookeeper, 1 web\"\n",
            store
        );
        Topology::parse(yaml.as_str()).unwrap()
    }

    fn controller(
        topology: Topology,
        compute: &StubCompute,
        store: Arc<dyn StateStore>,
    ) -> ClusterController {
        ClusterController::new(
            topology,
            StratusEnv::new("/tmp/stratus-test"),
            Arc::new(compute.clone()),
            store,
            HandlerRegistry::new(),
        )
    }

    fn functions(compute: &StubCompute) -> Vec<String> {
        compute
            .scripts()
            .iter()
            .flat_map(|(_, script)| script.statements.iter().map(|s| s.to_string()))
            .filter(|statement| statement != "retry_helpers")
            .collect()
    }

    #[tokio::test]
    pub async fn test_launch() -> Result<(), StratusErr> {
        let compute = StubCompute::new();
        let store = Arc::new(MemoryStateStore::new());
        let controller = controller(topology("memory"), &compute, store.clone());

        let cluster = controller.launch().await?;
        assert_eq!(cluster.len(), 4);
        assert_eq!(store.len(), 1);

        let listed = controller.list_instances().await?;
        assert_eq!(listed.instances(), cluster.instances());
        let hosts = listed.property("zookeeper.hosts").unwrap();
        assert_eq!(hosts.split(',').count(), 3);

        let functions = functions(&compute);
        assert!(functions.contains(&"install_zookeeper".to_string()));
        assert!(functions.contains(&"start_web".to_string()));
        assert!(functions.iter().any(|f| f.starts_with("configure_zookeeper ")));
        Ok(())
    }

    #[tokio::test]
    pub async fn test_reload_from_local_store() -> Result<(), StratusErr> {
        let dir = TempDir::new("stratus").unwrap();
        let first = StubCompute::new();
        let launched = controller(
            topology("local"),
            &first,
            Arc::new(LocalStateStore::new(dir.path())),
        )
        .launch()
        .await?;

        // a later process only has the manifest to go on
        let second = StubCompute::new();
        let controller = controller(
            topology("local"),
            &second,
            Arc::new(LocalStateStore::new(dir.path())),
        );
        let stopped = controller.stop().await?;
        assert_eq!(stopped.instances(), launched.instances());
        assert_eq!(second.scripts().len(), 4);
        assert!(functions(&second).contains(&"stop_zookeeper".to_string()));
        assert!(second.created().is_empty());

        controller.destroy().await?;
        assert_eq!(second.destroyed().len(), 4);
        match controller.list_instances().await {
            Err(StratusErr::Store(StoreErr::NotFound { .. })) => {}
            other => panic!("expected the manifest to be gone, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    pub async fn test_none_store() -> Result<(), StratusErr> {
        let compute = StubCompute::new();
        let topology = topology("none");
        let controller = ClusterController::new(
            topology.clone(),
            StratusEnv::new("/tmp/stratus-test"),
            Arc::new(compute.clone()),
            crate::store::StateStoreFactory::new(StratusEnv::new("/tmp/stratus-test"))
                .create(&topology)?,
            HandlerRegistry::new(),
        );
        controller.launch().await?;
        let err = controller.start().await.unwrap_err();
        assert_eq!(err.exit_code(), EXIT_STATE_NOT_FOUND);
        assert!(!err.is_fatal());
        Ok(())
    }

    #[test]
    pub fn test_create() {
        let env = StratusEnv::new("/tmp/stratus-test");
        assert!(ClusterController::create(topology("memory"), env.clone()).is_ok());

        let topology = Topology::parse(
            "cluster-name: zk\nprovider: aws-ec2\ninstance-templates: \"1 zookeeper\"",
        )
        .unwrap();
        match ClusterController::create(topology, env) {
            Err(StratusErr::Config(ConfigErr::ProviderNotAvailable(provider))) => {
                assert_eq!(provider, "aws-ec2")
            }
            Err(err) => panic!("unexpected error {}", err),
            Ok(_) => panic!("aws-ec2 should not be available"),
        }
    }
}
