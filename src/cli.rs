//! Command-line interface definitions using clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use tidepool::cluster::RestartPolicy;
use tidepool::config::{ClusterConfig, WorkerTransport, default_pool_size};
use tidepool::worker::WorkerId;

/// Multi-process worker pool with power-of-two-choices connection balancing.
#[derive(Parser, Debug)]
#[command(name = "tidepool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(
        long,
        global = true,
        env = "NO_COLOR",
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a worker pool behind a public TCP listener.
    Serve(ServeArgs),

    /// Print the metrics snapshot of a running pool.
    Metrics(MetricsArgs),

    /// Run as a pool worker (launched by `serve`).
    #[command(hide = true)]
    Worker,
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Public address to accept connections on.
    #[arg(short, long, env = "TIDEPOOL_BIND", default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// Number of worker processes (default: available parallelism - 1).
    #[arg(short, long, env = "TIDEPOOL_WORKERS", default_value_t = default_pool_size())]
    pub workers: usize,

    /// How workers expose their private listener: unix or tcp.
    #[arg(long, env = "TIDEPOOL_WORKER_TRANSPORT", default_value_t = WorkerTransport::Unix)]
    pub worker_transport: WorkerTransport,

    /// Parent directory for the pool's state (default: runtime dir).
    #[arg(long, env = "TIDEPOOL_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Seconds to wait for every worker to report listening.
    #[arg(long, env = "TIDEPOOL_STARTUP_TIMEOUT", default_value_t = 30)]
    pub startup_timeout: u64,

    /// Failed starts allowed per worker before giving up.
    #[arg(long, default_value_t = 3)]
    pub startup_retries: u32,

    /// Crash restarts allowed per worker per minute.
    #[arg(long, env = "TIDEPOOL_MAX_RESTARTS", default_value_t = 5)]
    pub max_restarts: u32,

    /// Seconds workers get to exit on shutdown before being signalled.
    #[arg(long, env = "TIDEPOOL_SHUTDOWN_TIMEOUT", default_value_t = 5)]
    pub shutdown_timeout: u64,

    /// Slots in the shared counter table.
    #[arg(long, default_value_t = 4096)]
    pub counter_capacity: usize,

    /// Samples kept in the shared latency ring.
    #[arg(long, default_value_t = 10_000)]
    pub latency_capacity: usize,

    /// Worker that hosts the metrics aggregator.
    #[arg(long, default_value_t = 0)]
    pub aggregator: usize,
}

impl ServeArgs {
    pub fn to_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            pool_size: self.workers,
            transport: self.worker_transport,
            state_dir: self.state_dir.clone(),
            counter_capacity: self.counter_capacity,
            latency_capacity: self.latency_capacity,
            startup_retries: self.startup_retries,
            startup_timeout: Duration::from_secs(self.startup_timeout),
            restart: RestartPolicy {
                max_restarts: self.max_restarts,
                ..defaults.restart.clone()
            },
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout),
            aggregator: WorkerId(self.aggregator),
            ..defaults
        }
    }
}

#[derive(Parser, Debug)]
pub struct MetricsArgs {
    /// State directory of the running pool (logged by `serve` at startup).
    #[arg(long, env = "TIDEPOOL_POOL_DIR")]
    pub state_dir: PathBuf,

    /// Print compact JSON on one line.
    #[arg(long)]
    pub compact: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_defaults() {
        let args = Cli::try_parse_from(["tidepool", "serve"]).unwrap();
        match args.command {
            Commands::Serve(serve) => {
                assert_eq!(serve.bind, "127.0.0.1:8080");
                assert_eq!(serve.worker_transport, WorkerTransport::Unix);
                let config = serve.to_config();
                assert_eq!(config.startup_timeout, Duration::from_secs(30));
                assert_eq!(config.restart, RestartPolicy::default());
                config.validate().unwrap();
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_options() {
        let args = Cli::try_parse_from([
            "tidepool",
            "serve",
            "--bind",
            "0.0.0.0:9000",
            "-w",
            "3",
            "--worker-transport",
            "tcp",
            "--max-restarts",
            "2",
            "--aggregator",
            "2",
        ])
        .unwrap();
        match args.command {
            Commands::Serve(serve) => {
                let config = serve.to_config();
                assert_eq!(serve.bind, "0.0.0.0:9000");
                assert_eq!(config.pool_size, 3);
                assert_eq!(config.transport, WorkerTransport::Tcp);
                assert_eq!(config.restart.max_restarts, 2);
                assert_eq!(config.aggregator, WorkerId(2));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_metrics_requires_state_dir() {
        let args =
            Cli::try_parse_from(["tidepool", "metrics", "--state-dir", "/tmp/tidepool-x"]).unwrap();
        match args.command {
            Commands::Metrics(metrics) => {
                assert_eq!(metrics.state_dir, PathBuf::from("/tmp/tidepool-x"));
                assert!(!metrics.compact);
            }
            _ => panic!("Expected Metrics command"),
        }
    }

    #[test]
    fn test_worker_is_hidden() {
        let args = Cli::try_parse_from(["tidepool", "worker"]).unwrap();
        assert!(matches!(args.command, Commands::Worker));
        let help = Cli::command().render_help().to_string();
        assert!(!help.contains("\n  worker"));
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["tidepool", "-v", "-q", "serve"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_no_color_accepts_any_value() {
        let cmd = Cli::command();
        let no_color = cmd
            .get_arguments()
            .find(|arg| arg.get_id() == "no_color")
            .unwrap();
        assert_eq!(no_color.get_env(), Some(std::ffi::OsStr::new("NO_COLOR")));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Cli::try_parse_from(["tidepool", "serve", "-vv", "--no-color"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert!(args.no_color);
    }
}
