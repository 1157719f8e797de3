use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use dagsync::dag::{Dag, DagConfig};
use dagsync::merkle::MerkleDag;
use dagsync::observable;
use dagsync::observer::Observer;

#[derive(Parser, Debug)]
#[command(name = "dagsync", about = "Differential Merkle-DAG synchronization", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a payload DAG as a Merkle DAG over HTTP, rederiving on change.
    Observable {
        /// Source-of-truth DAG file to watch.
        #[arg(long, default_value = ".dag/from.json")]
        path: PathBuf,
        #[arg(long, default_value_t = observable::DEFAULT_PORT)]
        port: u16,
    },
    /// Follow an observable and mirror its DAG locally.
    Observer {
        /// Base URL of the observable.
        #[arg(long, default_value = "http://127.0.0.1:3633")]
        endpoint: Url,
        /// Reference DAG to compare every completed sync against.
        #[arg(long, default_value = ".dag/from.json")]
        from: PathBuf,
        /// Where to write each reconstructed DAG.
        #[arg(long, default_value = ".dag/to.json")]
        to: PathBuf,
    },
    /// Fixture tooling for synthetic DAG files.
    #[command(subcommand)]
    Dag(DagCommand),
}

#[derive(Subcommand, Debug)]
enum DagCommand {
    /// Generate a random DAG file.
    Generate {
        #[arg(long, default_value = ".dag/from.json")]
        path: PathBuf,
        #[arg(long, default_value_t = 100)]
        num_nodes: usize,
        #[arg(long, default_value_t = 5)]
        num_sources: usize,
        #[arg(long, default_value_t = 5)]
        random_degree: usize,
        #[arg(long, default_value_t = 10)]
        payload_size: usize,
    },
    /// Insert random nodes.
    Insert {
        #[arg(long, default_value = ".dag/from.json")]
        path: PathBuf,
        #[arg(long, default_value_t = 1)]
        times: usize,
    },
    /// Replace the payload of random non-source nodes.
    Update {
        #[arg(long, default_value = ".dag/from.json")]
        path: PathBuf,
        #[arg(long, default_value_t = 1)]
        times: usize,
    },
    /// Delete random non-source nodes, preserving reachability.
    Delete {
        #[arg(long, default_value = ".dag/from.json")]
        path: PathBuf,
        #[arg(long, default_value_t = 1)]
        times: usize,
    },
    /// Apply a few rounds of random insert/update/delete mutations.
    Mutate {
        #[arg(long, default_value = ".dag/from.json")]
        path: PathBuf,
    },
    /// Validate a DAG file.
    Check {
        #[arg(long, default_value = ".dag/from.json")]
        path: PathBuf,
    },
    /// Compare two DAG files structurally.
    Equal {
        #[arg(long, default_value = ".dag/from.json")]
        left: PathBuf,
        #[arg(long, default_value = ".dag/to.json")]
        right: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Observable { path, port } => run_observable(path, port).await,
        Command::Observer { endpoint, from, to } => run_observer(endpoint, from, to).await,
        Command::Dag(command) => run_dag(command),
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            trigger.cancel();
        }
    });
    cancel
}

async fn run_observable(path: PathBuf, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    observable::run(path, addr, cancel_on_ctrl_c()).await
}

async fn run_observer(endpoint: Url, from: PathBuf, to: PathBuf) -> Result<()> {
    let observer = Observer::new(endpoint)?;
    let mut done = observer.subscribe();
    tokio::spawn(async move {
        loop {
            match done.recv().await {
                Ok(dag) => on_sync_done(&dag, &from, &to),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    observer.run(cancel_on_ctrl_c()).await;
    Ok(())
}

/// Write the reconstructed DAG back and compare it against the reference
/// file, mirroring what an operator would check by hand.
fn on_sync_done(merkle: &MerkleDag, from: &Path, to: &Path) {
    let mut dag = merkle.to_dag();
    if let Err(err) = dag.validate() {
        warn!("reconstructed DAG is invalid: {err:#}");
        return;
    }
    if let Err(err) = dag.write_to(to) {
        warn!("failed to write reconstructed DAG: {err:#}");
    }
    match Dag::read_from(from) {
        Ok(reference) => {
            if reference.sorted() == dag {
                info!("reconstructed DAG matches {}", from.display());
            } else {
                warn!("reconstructed DAG differs from {}", from.display());
            }
        }
        Err(err) => warn!("failed to read reference DAG: {err:#}"),
    }
}

fn run_dag(command: DagCommand) -> Result<()> {
    match command {
        DagCommand::Generate {
            path,
            num_nodes,
            num_sources,
            random_degree,
            payload_size,
        } => {
            let config = DagConfig {
                num_nodes,
                num_sources,
                random_degree,
                payload_size,
            };
            let mut dag = Dag::generate(&config)?;
            dag.validate()?;
            dag.write_to(&path)?;
            info!(
                "DAG with {} nodes and {} sources saved to {}",
                dag.nodes.len(),
                dag.sources.len(),
                path.display()
            );
            Ok(())
        }
        DagCommand::Insert { path, times } => mutate(&path, |dag| {
            dag.add_random_nodes(times, &DagConfig::default())
        }),
        DagCommand::Update { path, times } => mutate(&path, |dag| {
            dag.update_random_nodes(times, &DagConfig::default())
        }),
        DagCommand::Delete { path, times } => mutate(&path, |dag| dag.delete_random_nodes(times)),
        DagCommand::Mutate { path } => {
            let mut rng = rand::thread_rng();
            let rounds = rng.gen_range(3..6);
            mutate(&path, |dag| {
                for round in 1..=rounds {
                    let times = rng.gen_range(1..5);
                    match rng.gen_range(0..3) {
                        0 => {
                            dag.add_random_nodes(times, &DagConfig::default())?;
                            info!("round {round}: added {times} nodes");
                        }
                        1 => {
                            dag.delete_random_nodes(times)?;
                            info!("round {round}: deleted {times} nodes");
                        }
                        _ => {
                            dag.update_random_nodes(times, &DagConfig::default())?;
                            info!("round {round}: updated {times} nodes");
                        }
                    }
                }
                Ok(())
            })
        }
        DagCommand::Check { path } => {
            let dag = Dag::read_from(&path)?;
            dag.validate()
                .with_context(|| format!("{} is not a valid DAG", path.display()))?;
            info!("{} is a valid DAG", path.display());
            Ok(())
        }
        DagCommand::Equal { left, right } => {
            let left = Dag::read_from(&left)?.sorted();
            let right = Dag::read_from(&right)?.sorted();
            println!("{}", left == right);
            Ok(())
        }
    }
}

fn mutate(path: &Path, apply: impl FnOnce(&mut Dag) -> Result<()>) -> Result<()> {
    let mut dag = Dag::read_from(path)?;
    apply(&mut dag)?;
    dag.validate()?;
    dag.write_to(path)?;
    info!("DAG updated at {}", path.display());
    Ok(())
}
