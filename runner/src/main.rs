use clap::{ArgAction, Parser, Subcommand};
use hpcac_runner::{
    cluster::ActiveCluster,
    config::RunnerConfig,
    database::{StorageAdapters, Store},
    executors::RemoteExecutor,
    health::HealthProber,
    job::JobState,
    pipeline::{Pipeline, PipelineSettings},
    provision::command::CommandProvisioner,
    reconciler::{Reconciler, ReconcilerSettings},
    shutdown::cancel_on_signals,
    sync::CancellationToken,
    transport::{ssh::SshTransport, Transport},
};
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

#[derive(Parser, Debug)]
#[command(author, version, about = "Fault tolerant MPI job runner for cloud clusters")]
struct Cli {
    /// path to the YAML config
    #[arg(short, long, default_value = "hpcac.yaml")]
    config: PathBuf,

    /// raise the log level, repeat for trace output
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Persist the configured cluster as online
    Register,
    /// Run the configured job queue on the active cluster
    Run {
        #[arg(long)]
        cluster: Option<String>,
        /// replace jobs whose tag already exists
        #[arg(long)]
        overwrite: bool,
    },
    /// Probe every node of the active cluster
    Health {
        #[arg(long)]
        cluster: Option<String>,
    },
    /// Restore the active cluster to its desired node count
    Repair {
        #[arg(long)]
        cluster: Option<String>,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .init();
}

/// shared collaborators every command is built from
struct Context {
    config: RunnerConfig,
    store: Arc<StorageAdapters>,
    transport: Arc<dyn Transport>,
    token: CancellationToken,
}

impl Context {
    fn executor(&self) -> RemoteExecutor {
        RemoteExecutor::load(self.transport.clone(), &self.config.transport)
    }

    fn prober(&self) -> HealthProber {
        HealthProber::new(self.transport.clone(), self.config.transport.probe_timeout())
    }

    fn reconciler(&self) -> Reconciler {
        let provisioner = self
            .config
            .provisioner()
            .expect_or_log("Repairs need a provisioner");

        Reconciler::new(
            self.prober(),
            self.executor(),
            Arc::new(CommandProvisioner::load(provisioner)),
            self.store.clone(),
            ReconcilerSettings::from(&self.config.reconciler),
            self.token.clone(),
        )
    }

    fn active_cluster(&self, tag: Option<&str>) -> ActiveCluster {
        ActiveCluster::resolve(self.store.as_ref(), tag).expect_or_log("Failed to find a cluster")
    }
}

fn register(context: &Context) -> bool {
    let cluster = context
        .config
        .cluster()
        .expect_or_log("Nothing to register")
        .to_cluster();

    context
        .store
        .save_cluster(&cluster.to_record())
        .expect_or_log("Failed to store cluster");
    info!(cluster = %cluster.tag, nodes = cluster.node_count, "Registered cluster");

    true
}

fn health(context: &Context, tag: Option<&str>) -> bool {
    let cluster = context.active_cluster(tag);
    let report = context
        .prober()
        .check(&cluster)
        .expect_or_log("Failed to probe cluster");

    for (node, alive) in report.probes.iter() {
        println!(
            "{}\t{}",
            node.address,
            if *alive { "healthy" } else { "unreachable" }
        );
    }

    report.is_healthy()
}

fn repair(context: &Context, tag: Option<&str>) -> bool {
    let cluster = context.active_cluster(tag);

    match context.reconciler().reconcile(&cluster) {
        Ok(report) => {
            info!(
                rounds = report.rounds,
                replaced = report.replaced.len(),
                "Cluster is at full strength"
            );

            true
        }
        Err(error) => {
            error!(error = %error, "Failed to repair cluster");

            false
        }
    }
}

fn run(context: &Context, tag: Option<&str>, overwrite: bool) -> bool {
    let cluster = context.active_cluster(tag);
    let pipeline = Pipeline::new(
        context.executor(),
        context.reconciler(),
        context.store.clone(),
        PipelineSettings::load(&context.config),
        context.token.clone(),
    );

    let records = match pipeline.run_queue(
        &cluster,
        &context.config.jobs,
        overwrite || context.config.overwrite_jobs,
    ) {
        Ok(records) => records,
        Err(error) => {
            error!(error = %error, "Run failed");

            return false;
        }
    };

    let aborted = records
        .iter()
        .filter(|record| record.state == JobState::Aborted)
        .count();
    if aborted > 0 {
        warn!(aborted, total = records.len(), "Some jobs aborted");
    } else {
        info!(total = records.len(), "All jobs succeeded");
    }

    aborted == 0
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = RunnerConfig::load(&cli.config).expect_or_log("Failed to load config");
    if config.preflight_checks() {
        error!("Config contains errors, refusing to continue");

        return ExitCode::FAILURE;
    }

    if matches!(cli.command, Commands::Run { .. }) && config.run_checks() {
        error!("Workspace is not ready, refusing to run");

        return ExitCode::FAILURE;
    }

    let token = CancellationToken::new();
    if let Err(error) = cancel_on_signals(token.clone()) {
        warn!(error = %error, "Failed to install signal handler, Ctrl-C will not persist running jobs");
    }

    let context = Context {
        store: Arc::new(
            StorageAdapters::load(&config.database).expect_or_log("Failed to open database"),
        ),
        transport: Arc::new(SshTransport::load(&config.transport)),
        token,
        config,
    };

    let succeeded = match &cli.command {
        Commands::Register => register(&context),
        Commands::Health { cluster } => health(&context, cluster.as_deref()),
        Commands::Repair { cluster } => repair(&context, cluster.as_deref()),
        Commands::Run { cluster, overwrite } => run(&context, cluster.as_deref(), *overwrite),
    };

    match Arc::try_unwrap(context.store) {
        Ok(store) => {
            if let Err(error) = store.close() {
                error!(error = %error, "Failed to close database");
            }
        }
        Err(_) => warn!("Database still in use, skipping close"),
    }

    if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
