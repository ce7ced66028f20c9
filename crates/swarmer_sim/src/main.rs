use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};
use swarmer::{
    config::Config,
    error::Error,
    hash_tree::HashTree,
    host::{HostContext, Urn},
    ranker::{
        select_ranker,
        udp::{deliver_pongs, UdpPinger},
        MeshHandler, NetworkState, SourceRanker,
    },
    swarm::{Swarm, SwarmOutcome},
    verifying::{MemoryStorage, VerifyingFile},
};
use time::macros::format_description;
use tokio::{spawn, time::interval};
use tracing::{debug, info, warn, Level};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::LevelFilter, fmt, fmt::time::UtcTime, layer::SubscriberExt,
    util::SubscriberInitExt, FmtSubscriber, Layer,
};

use args::Args;
use peers::SimTransport;

mod args;
mod peers;

/// Logs what the ranker learns about the swarm.
struct LoggingMesh;

impl MeshHandler for LoggingMesh {
    fn inform_mesh(&self, host: &HostContext, good: bool) {
        if !good {
            info!("{host} does not have the file");
        }
    }

    fn add_possible_sources(&self, hosts: Vec<HostContext>) {
        debug!("learned {} sources", hosts.len());
    }
}

/// Console logs at `level`, plus debug logs in `swarmsim.log` when a
/// directory is given. The guard must live until the program exits.
fn init_logging(level: Level, dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    let timer = UtcTime::new(format_description!(
        "[hour]:[minute]:[second].[subsecond digits:3]"
    ));

    let Some(dir) = dir else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_timer(timer)
            .finish();
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("a tracing subscriber is already set");
        }
        return None;
    };

    let (writer, guard) = tracing_appender::non_blocking(rolling::never(dir, "swarmsim.log"));
    let console = fmt::layer()
        .with_target(false)
        .with_timer(timer.clone())
        .with_filter(LevelFilter::from_level(level));
    let file = fmt::layer()
        .with_ansi(false)
        .with_timer(timer)
        .with_writer(writer)
        .with_filter(LevelFilter::DEBUG);

    if tracing_subscriber::registry().with(console).with(file).try_init().is_err() {
        eprintln!("a tracing subscriber is already set");
    }
    Some(guard)
}

async fn report_progress(file: VerifyingFile) {
    let mut tick = interval(Duration::from_secs(1));
    loop {
        tick.tick().await;
        info!(
            "{} of {} bytes verified, {} on disk, {} lost",
            file.verified_block_size(),
            file.total_size(),
            file.block_size(),
            file.amount_lost()
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    let _guard = init_logging(args.log_level, args.log_dir.as_deref());

    let config = match &args.config {
        Some(path) => Config::load_from(path).await?,
        None => Config::load().await.unwrap_or_else(|e| {
            warn!("using the default configuration: {e}");
            Config::default()
        }),
    };

    let seed = args.seed.unwrap_or_else(|| rand::thread_rng().gen());
    info!("seed {seed}");

    let mut data = vec![0u8; args.size as usize];
    StdRng::seed_from_u64(seed).fill(&mut data[..]);
    let tree = Arc::new(HashTree::create(&data));
    let urn = Urn(tree.root_hash());
    info!("{urn}, {} chunks of {} bytes", tree.num_chunks(), tree.node_size());

    let peers = peers::spawn_peers(&peers::roster(&args), args.size).await?;

    let network = Arc::new(NetworkState::new(true, false, args.probe));
    let (pinger, pongs) = UdpPinger::bind("127.0.0.1:0").await?;
    let ranker = select_ranker(
        network,
        Arc::new(pinger),
        &config.ranker,
        None,
        Some(Arc::new(LoggingMesh)),
    );
    spawn(deliver_pongs(pongs, ranker.clone()));
    ranker.add_to_pool(
        peers
            .iter()
            .map(|p| HostContext::new(p.addr, Some(urn), args.size))
            .collect(),
    );
    info!("{:?} ranker with {} hosts", ranker.kind(), ranker.num_known_hosts());

    let storage = Arc::new(MemoryStorage::new(args.size as usize));
    let file = VerifyingFile::new(args.size, &config);
    file.open(storage.clone())?;
    file.set_hash_tree(tree)?;

    let transport = Arc::new(SimTransport::new(data.clone(), &peers, seed));
    let progress = spawn(report_progress(file.clone()));
    let started = Instant::now();

    let outcome = Swarm::new(file.clone(), ranker, transport, args.workers)
        .with_busy_retry(Duration::from_millis(200))
        .run()
        .await?;
    progress.abort();
    file.close();

    let elapsed = started.elapsed();
    println!(
        "{outcome:?} in {:.2}s: {} of {} bytes verified, {} lost to corruption",
        elapsed.as_secs_f64(),
        file.verified_block_size(),
        file.total_size(),
        file.amount_lost()
    );

    if outcome == SwarmOutcome::Complete && storage.to_vec() != data {
        warn!("the downloaded file does not match the original");
    }

    Ok(())
}
