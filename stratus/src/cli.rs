use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use crate::cluster::Cluster;
use crate::controller::ClusterController;
use crate::env::StratusEnv;
use crate::err::{ConfigErr, StratusErr};
use crate::provision::LaunchOptions;
use crate::topology::Topology;

#[derive(Clone, Debug, Parser)]
#[command(name = "stratus", version, about, long_about = None)]
pub struct Cli {
    /// raise log verbosity (`-v` debug, `-vv` trace); `RUST_LOG` wins
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Debug, Subcommand, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Commands {
    /// bootstrap, configure and start a new cluster
    Launch(ClusterArgs),
    Configure(ClusterArgs),
    Start(ClusterArgs),
    Stop(ClusterArgs),
    /// destroy every instance and forget the cluster
    Destroy(ClusterArgs),
    ListInstances(ClusterArgs),
}

impl Commands {
    pub fn args(&self) -> &ClusterArgs {
        match self {
            Commands::Launch(args) => args,
            Commands::Configure(args) => args,
            Commands::Start(args) => args,
            Commands::Stop(args) => args,
            Commands::Destroy(args) => args,
            Commands::ListInstances(args) => args,
        }
    }
}

#[derive(Clone, Debug, Args)]
pub struct ClusterArgs {
    /// the topology YAML
    #[arg(short, long)]
    pub config: PathBuf,

    /// overrides `cluster-name` of the topology
    #[arg(long)]
    pub cluster_name: Option<String>,
}

impl ClusterArgs {
    pub async fn topology(&self) -> Result<Topology, StratusErr> {
        let yaml = tokio::fs::read_to_string(&self.config)
            .await
            .map_err(|err| ConfigErr::invalid("--config", format!("{}: {}", self.config.display(), err)))?;
        let topology = Topology::parse(yaml.as_str())?;
        match &self.cluster_name {
            None => Ok(topology),
            Some(name) => Ok(topology.with_cluster_name(name)?),
        }
    }
}

pub async fn run(cli: Cli, cancel: CancellationToken) -> Result<(), StratusErr> {
    let topology = cli.command.args().topology().await?;
    debug!("{} cluster '{}'", cli.command, topology.cluster_name);
    let options = LaunchOptions {
        cancel,
        ..Default::default()
    };
    let controller = ClusterController::create(topology, StratusEnv::default())?.with_options(options);

    match &cli.command {
        Commands::Launch(_) => {
            let cluster = controller.launch().await?;
            print_cluster(&cluster);
        }
        Commands::Configure(_) => {
            controller.configure().await?;
        }
        Commands::Start(_) => {
            controller.start().await?;
        }
        Commands::Stop(_) => {
            controller.stop().await?;
        }
        Commands::Destroy(_) => {
            controller.destroy().await?;
            println!("{}", "destroyed".green());
        }
        Commands::ListInstances(_) => {
            let cluster = controller.list_instances().await?;
            print_cluster(&cluster);
        }
    }
    Ok(())
}

pub fn print_cluster(cluster: &Cluster) {
    println!(
        "{} {}",
        cluster.name().bold(),
        format!("({} instances)", cluster.len()).dimmed()
    );
    for instance in cluster.instances() {
        println!(
            "  {}  {}  {}  {}",
            instance.id().cyan(),
            instance.roles().to_string().yellow(),
            instance.public_ip().unwrap_or("-"),
            instance.private_ip().unwrap_or("-")
        );
    }
}

pub fn print_err(err: &StratusErr) {
    eprintln!("{} {}", "err!".red().bold(), err);
    if let StratusErr::Provision(err) = err {
        if let Some(report) = err.report() {
            eprintln!("{}", report);
        }
    }
}

#[cfg(test)]
pub mod test {
    use clap::Parser;
    use std::io::Write;
    use tempdir::TempDir;
    use crate::cli::{Cli, Commands};
    use crate::err::{StratusErr, EXIT_CONFIG};

    #[test]
    pub fn test_parse() {
        let cli = Cli::parse_from([
            "stratus",
            "-vv",
            "list-instances",
            "--config",
            "zk.yaml",
            "--cluster-name",
            "zk2",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.command.to_string(), "list-instances");
        match &cli.command {
            Commands::ListInstances(args) => {
                assert_eq!(args.config.to_str(), Some("zk.yaml"));
                assert_eq!(args.cluster_name.as_deref(), Some("zk2"));
            }
            other => panic!("unexpected command {}", other),
        }
        assert!(Cli::try_parse_from(["stratus", "launch"]).is_err());
    }

    #[tokio::test]
    pub async fn test_topology() -> Result<(), StratusErr> {
        let dir = TempDir::new("stratus").unwrap();
        let path = dir.path().join("zk.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "cluster-name: zk\nprovider: stub\ninstance-templates: \"3 zookeeper\""
        )
        .unwrap();

        let path = path.display().to_string();
        let cli = Cli::parse_from(["stratus", "launch", "-c", path.as_str(), "--cluster-name", "zk2"]);
        let topology = cli.command.args().topology().await?;
        assert_eq!(topology.cluster_name, "zk2");

        let cli = Cli::parse_from(["stratus", "start", "--config", "/no/such/file.yaml"]);
        let err = cli.command.args().topology().await.unwrap_err();
        assert_eq!(err.exit_code(), EXIT_CONFIG);
        Ok(())
    }
}
