//! daq_master command-line interface
//!
//! ```text
//! daq_master master [--config config/master.toml]
//! daq_master worker                      # spawned by the master
//! daq_master submit flopping --args '{"npoints": 11}'
//! daq_master submit noop --at 1767225600
//! daq_master cancel queued 3
//! daq_master watch 127.0.0.1:3252       # the run queue
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use daq_master::config::{Settings, DEFAULT_CONFIG_PATH};
use daq_master::control::ControlClient;
use daq_master::master::Master;
use daq_master::messages::RunParams;
use daq_master::protocol::Value;
use daq_master::sync_struct::{NotifyCallback, Subscriber};
use daq_master::worker::{ParentLink, WorkerHost};

#[derive(Parser)]
#[command(name = "daq_master")]
#[command(about = "Experiment run scheduler with sandboxed workers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the master
    Master {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Serve runs over stdin/stdout (started by the master)
    Worker,
    /// Submit a run
    Submit {
        /// Experiment name
        experiment: String,
        /// Experiment arguments as a JSON mapping
        #[arg(long, default_value = "{}")]
        args: String,
        /// Abort the run after this many seconds
        #[arg(long)]
        timeout: Option<f64>,
        /// Schedule as a timed run at this Unix time
        #[arg(long, conflicts_with = "timed")]
        at: Option<f64>,
        /// Schedule as a timed run, due now
        #[arg(long)]
        timed: bool,
        /// Control server address
        #[arg(long, default_value = "127.0.0.1:3251")]
        server: String,
    },
    /// Cancel a queued or timed run
    Cancel {
        #[arg(value_enum)]
        kind: RunKind,
        /// rid or trid
        id: u64,
        #[arg(long, default_value = "127.0.0.1:3251")]
        server: String,
    },
    /// Print a published structure every time it changes
    Watch {
        /// Publisher address, e.g. 127.0.0.1:3252 for the queue
        #[arg(default_value = "127.0.0.1:3252")]
        server: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RunKind {
    Queued,
    Timed,
}

/// Logs go to stderr: a worker's stdout is its pipe to the master.
fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Master { config } => {
            let settings = Settings::load_from(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            init_logging(&settings.application.log_level);
            let master = Master::start(&settings).await?;
            master.run_until_signal().await?;
        }
        Command::Worker => {
            init_logging("info");
            WorkerHost::default().serve(ParentLink::stdio()?).await?;
        }
        Command::Submit {
            experiment,
            args,
            timeout,
            at,
            timed,
            server,
        } => {
            init_logging("warn");
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be a JSON mapping")?;
            let run_params = RunParams::new(experiment).with_arguments(arguments);
            let mut client = ControlClient::connect(&server).await?;
            if timed || at.is_some() {
                let trid = client.submit_timed(run_params, timeout, at).await?;
                println!("TRID {trid}");
            } else {
                let rid = client.submit_queued(run_params, timeout).await?;
                println!("RID {rid}");
            }
        }
        Command::Cancel { kind, id, server } => {
            init_logging("warn");
            let mut client = ControlClient::connect(&server).await?;
            match kind {
                RunKind::Queued => client.cancel_queued(id).await?,
                RunKind::Timed => client.cancel_timed(id).await?,
            }
        }
        Command::Watch { server } => {
            init_logging("warn");
            let print: NotifyCallback<Value> = Box::new(|v: &Value| println!("{v}"));
            let subscriber = Subscriber::connect(&server, |v: Value| v, Some(print)).await?;
            info!("Watching {}", server);
            tokio::signal::ctrl_c().await?;
            subscriber.close().await?;
        }
    }
    Ok(())
}
