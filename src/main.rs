use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use swarmshare::{
    config::Config,
    download::AcquisitionEngine,
    peers::PeerServer,
    splitter::ContentSplitter,
    store::ChunkStore,
    tracker::{TrackerClient, TrackerServer},
};

#[derive(Parser)]
#[command(name = "swarmshare", version, about = "Share one file across a swarm of peers")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the rendezvous tracker
    Tracker {
        #[arg(long)]
        listen: Option<String>,
    },
    /// Split a file, register it and serve its chunks
    Seed {
        file: PathBuf,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Download the swarm's file and become a source for it
    Fetch {
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// name of the reconstructed file, instead of the original one
        #[arg(long)]
        output_name: Option<String>,
        #[arg(long)]
        workers: Option<usize>,
        /// delete the chunk directory after reconstruction
        #[arg(long)]
        cleanup: bool,
        /// keep serving chunks after the download until interrupted
        #[arg(long)]
        linger: bool,
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Print tracker counters
    Stats {
        #[arg(long)]
        tracker: Option<String>,
        /// repeat every N seconds
        #[arg(long, value_name = "SECS")]
        monitor: Option<u64>,
    },
}

#[derive(Args)]
struct NodeArgs {
    /// tracker address, host:port
    #[arg(long)]
    tracker: Option<String>,
    /// address for this node's peer server
    #[arg(long)]
    listen: Option<String>,
    /// host other peers should dial
    #[arg(long)]
    advertise_host: Option<String>,
    #[arg(long)]
    chunk_dir: Option<PathBuf>,
}

impl NodeArgs {
    fn apply(self, config: &mut Config) {
        if let Some(tracker) = self.tracker {
            config.tracker.address = tracker;
        }
        if let Some(listen) = self.listen {
            config.peer.listen = listen;
        }
        if let Some(host) = self.advertise_host {
            config.peer.advertise_host = host;
        }
        if let Some(dir) = self.chunk_dir {
            config.peer.chunk_dir = dir;
        }
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Binds this node's peer server and returns the endpoint to advertise.
async fn start_peer_server(
    config: &Config,
    store: Arc<ChunkStore>,
) -> Result<(String, JoinHandle<()>)> {
    let server = PeerServer::bind(&config.peer.listen, store, config.peer_server())
        .await
        .with_context(|| format!("failed to bind peer server on {}", config.peer.listen))?;
    let port = server.local_addr()?.port();
    let endpoint = format!("{}:{}", config.peer.advertise_host, port);
    let handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "peer server stopped");
        }
    });
    Ok((endpoint, handle))
}

async fn run_tracker(config: Config, listen: Option<String>) -> Result<()> {
    let listen = listen.unwrap_or(config.tracker.listen.clone());
    let server = TrackerServer::bind(&listen, config.tracker_server())
        .await
        .with_context(|| format!("failed to bind tracker on {listen}"))?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("tracker stopped"),
    }
    Ok(())
}

async fn run_seed(config: Config, file: PathBuf) -> Result<()> {
    let store = Arc::new(ChunkStore::open(&config.peer.chunk_dir).await?);
    let manifest = ContentSplitter::with_chunk_size(config.transfer.chunk_size)?
        .split(&file, &store)
        .await
        .with_context(|| format!("failed to split {}", file.display()))?;

    let (endpoint, server) = start_peer_server(&config, store).await?;
    let chunks = manifest.chunks.iter().map(|c| c.name.clone()).collect();
    let tracker = TrackerClient::new(config.tracker.address.clone(), config.io_timeout());
    tracker
        .register(&endpoint, chunks)
        .await
        .context("failed to register with the tracker")?;
    info!(%endpoint, chunks = manifest.chunks.len(), "seeding");

    tokio::select! {
        _ = server => {}
        _ = tokio::signal::ctrl_c() => info!("seeder stopped"),
    }
    Ok(())
}

async fn run_fetch(config: Config, output_name: Option<String>, linger: bool) -> Result<()> {
    let store = Arc::new(ChunkStore::open(&config.peer.chunk_dir).await?);
    let (endpoint, server) = start_peer_server(&config, store.clone()).await?;

    let mut engine_config = config.engine(endpoint);
    engine_config.output_name = output_name;
    let report = AcquisitionEngine::new(engine_config, store)
        .run()
        .await
        .context("acquisition failed")?;
    info!(
        fetched = report.fetched,
        present = report.already_present,
        failed = report.failed.len(),
        total = report.total_chunks,
        "summary"
    );

    if linger {
        info!("serving chunks until interrupted");
        tokio::select! {
            _ = server => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    let path = report.into_result()?;
    info!(output = %path.display(), "done");
    Ok(())
}

async fn run_stats(config: Config, tracker: Option<String>, monitor: Option<u64>) -> Result<()> {
    let addr = tracker.unwrap_or(config.tracker.address.clone());
    let client = TrackerClient::new(addr, config.io_timeout());
    loop {
        match client.stats().await {
            Ok(stats) => println!("{}", serde_json::to_string_pretty(&stats)?),
            Err(e) if monitor.is_some() => error!(error = %e, "stats request failed"),
            Err(e) => return Err(e.into()),
        }
        match monitor {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs.max(1))).await,
            None => return Ok(()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Tracker { listen } => {
            config.validate()?;
            init_logging(&config);
            run_tracker(config, listen).await
        }
        Command::Seed {
            file,
            chunk_size,
            node,
        } => {
            node.apply(&mut config);
            if let Some(size) = chunk_size {
                config.transfer.chunk_size = size;
            }
            config.validate()?;
            init_logging(&config);
            run_seed(config, file).await
        }
        Command::Fetch {
            output_dir,
            output_name,
            workers,
            cleanup,
            linger,
            node,
        } => {
            node.apply(&mut config);
            if let Some(dir) = output_dir {
                config.transfer.output_dir = dir;
            }
            if workers.is_some() {
                config.transfer.workers = workers;
            }
            config.transfer.cleanup |= cleanup;
            config.validate()?;
            init_logging(&config);
            run_fetch(config, output_name, linger).await
        }
        Command::Stats { tracker, monitor } => {
            init_logging(&config);
            run_stats(config, tracker, monitor).await
        }
    }
}
