//! tidepool - multi-process worker pool

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{
    OwoColorize,
    Stream::{Stderr, Stdout},
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

use cli::{Cli, Commands, MetricsArgs, ServeArgs};
use tidepool::logging::{self, LOG_FILTER_ENV, LogConfig};
use tidepool::worker::signals::{EXIT_BIND_FAILED, EXIT_FAILURE};
use tidepool::worker::{HelloApp, WorkerBootstrap, WorkerExit, WorkerLauncher, run_worker};
use tidepool::{
    ClusterConfig, ClusterError, ClusterManager, LatencyRingBuffer, MetricsSnapshot,
    SharedCounterStore, paths,
};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let code = match &cli.command {
        Commands::Serve(args) => report(cmd_serve(&cli, args)),
        Commands::Metrics(args) => report(cmd_metrics(args)),
        Commands::Worker => cmd_worker(&cli),
    };
    std::process::exit(code);
}

/// Print an error and its causes; returns the exit code.
fn report(result: Result<()>) -> i32 {
    let Err(e) = result else {
        return 0;
    };
    eprintln!(
        "{}: {}",
        "error"
            .if_supports_color(Stderr, |text| text.red())
            .if_supports_color(Stderr, |text| text.bold()),
        e
    );
    for cause in e.chain().skip(1) {
        eprintln!(
            "  {}: {}",
            "caused by".if_supports_color(Stderr, |text| text.yellow()),
            cause
        );
    }
    1
}

fn cmd_serve(cli: &Cli, args: &ServeArgs) -> Result<()> {
    logging::init(
        LogConfig::for_manager()
            .with_verbosity(cli.verbose, cli.quiet)
            .with_env_overrides(),
    );

    let mut launcher = WorkerLauncher::current_exe()?;
    // Workers only see the environment, so pass `-v`/`-q` along.
    if let Some(filter) = LogConfig::new().with_verbosity(cli.verbose, cli.quiet).filter {
        launcher = launcher.env(LOG_FILTER_ENV, filter);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;
    runtime.block_on(serve(args.to_config(), launcher, &args.bind, cli.quiet))
}

async fn serve(config: ClusterConfig, launcher: WorkerLauncher, bind: &str, quiet: bool) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    let mut manager = ClusterManager::start(config, launcher)
        .await
        .context("Failed to start worker pool")?;
    let addr = manager
        .listen(bind)
        .await
        .with_context(|| format!("Failed to listen on {}", bind))?;

    if !quiet {
        println!(
            "{} {}",
            "Listening on".if_supports_color(Stdout, |text| text.green()),
            addr
        );
        println!("State directory: {}", manager.state_dir().display());
    }

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Terminated; shutting down");
            Ok(())
        }
        err = manager.closed() => Err(err),
    };

    manager.stop().await?;
    outcome.context("Worker pool closed")
}

fn cmd_metrics(args: &MetricsArgs) -> Result<()> {
    let counters_path = paths::counters_path(&args.state_dir);
    let store = SharedCounterStore::open(&counters_path)
        .with_context(|| format!("Failed to open {}", counters_path.display()))?;
    let latency_path = paths::latency_path(&args.state_dir);
    let ring = LatencyRingBuffer::open(&latency_path)
        .with_context(|| format!("Failed to open {}", latency_path.display()))?;

    let snapshot = MetricsSnapshot::capture(&store, &ring);
    let json = if args.compact {
        serde_json::to_string(&snapshot)?
    } else {
        serde_json::to_string_pretty(&snapshot)?
    };
    println!("{}", json);
    Ok(())
}

/// Worker entry point. Exit codes tell the manager whether to respawn.
fn cmd_worker(cli: &Cli) -> i32 {
    logging::init(
        LogConfig::for_worker()
            .with_verbosity(cli.verbose, cli.quiet)
            .with_env_overrides(),
    );

    match run_worker_process() {
        Ok(exit) => {
            info!(?exit, "Worker exiting");
            exit.code()
        }
        Err(e @ ClusterError::Bind { .. }) => {
            error!(error = %e, "Worker could not bind");
            EXIT_BIND_FAILED
        }
        Err(e) => {
            error!(error = %e, "Worker failed");
            EXIT_FAILURE
        }
    }
}

fn run_worker_process() -> tidepool::Result<WorkerExit> {
    let bootstrap = WorkerBootstrap::from_env()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_worker(bootstrap, HelloApp))
}
