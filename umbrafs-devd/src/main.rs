//! UmbraFS device server
//!
//! Serves GET_BLOCK / WRITE_BLOCK requests from a local device or image
//! file through a block cache, and optionally answers GET_MANIFEST from a
//! configured snapshot.

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use umbrafs_lib::constants::BLOCK_SIZE;
use umbrafs_lib::{BlockServer, CacheTuning, ManifestSnapshot, Messenger, Mount};

#[derive(Parser)]
#[command(name = "umbrafs-devd")]
#[command(about = "UmbraFS device server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8420")]
    listen: SocketAddrV4,

    /// Backing device or image file
    #[arg(long)]
    device: PathBuf,

    /// Grow the image to this many blocks before serving
    #[arg(long)]
    blocks: Option<u64>,

    /// JSON manifest snapshot to answer GET_MANIFEST from
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Seconds between background syncs of dirty blocks
    #[arg(long, default_value = "1")]
    sync_interval: u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if let Some(blocks) = args.blocks {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&args.device)
            .with_context(|| format!("opening {}", args.device.display()))?;
        let wanted = blocks * BLOCK_SIZE as u64;
        if file.metadata()?.len() < wanted {
            file.set_len(wanted)?;
            info!("sized {} to {} blocks", args.device.display(), blocks);
        }
    }

    let mount = Mount::local(&args.device, CacheTuning::default())
        .context("starting block cache")?;

    let messenger = Messenger::new();
    let mut server = BlockServer::new(messenger.clone(), mount.cache_handle())
        .context("installing block handlers")?;

    if let Some(path) = &args.manifest {
        let snapshot = ManifestSnapshot::load_json(path)
            .with_context(|| format!("loading manifest {}", path.display()))?;
        server.serve_manifest(snapshot)?;
    }

    messenger
        .listen(args.listen)
        .with_context(|| format!("listening on {}", args.listen))?;
    info!("serving {} on {}", args.device.display(), args.listen);

    // Background flusher; the cache acknowledges writes once cached
    let interval = Duration::from_secs(args.sync_interval.max(1));
    loop {
        std::thread::sleep(interval);
        if let Err(e) = mount.cache().sync() {
            error!("background sync failed: {}", e);
        }
        let stats = server.stats();
        log::debug!(
            "served gets={} writes={} manifests={} failures={}",
            stats.gets,
            stats.writes,
            stats.manifests,
            stats.failures
        );
    }
}
