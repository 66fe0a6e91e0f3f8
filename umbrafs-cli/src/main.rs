//! UmbraFS CLI - command-line tool for managing block images and servers

use std::net::{SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;

use umbrafs_lib::constants::BLOCK_SIZE;
use umbrafs_lib::{read_block, write_block, CacheTuning, ManifestSnapshot, Mount};

#[derive(Parser)]
#[command(name = "umbrafs")]
#[command(about = "UmbraFS block image and server management tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or grow a block image
    Mkfs {
        /// Image file
        image: PathBuf,
        /// Number of blocks
        #[arg(default_value = "1024")]
        blocks: u64,
    },
    /// Show image information
    Info {
        /// Image file
        image: PathBuf,
    },
    /// Read one block and hex-dump its head
    Get {
        /// Block number
        bnr: u64,
        /// Local image file
        #[arg(long, conflicts_with = "server")]
        device: Option<PathBuf>,
        /// Remote device server
        #[arg(long)]
        server: Option<SocketAddrV4>,
        /// Bytes of the dump
        #[arg(short, long, default_value = "64")]
        length: usize,
    },
    /// Fill one block with a byte pattern
    Put {
        /// Block number
        bnr: u64,
        /// Pattern byte (decimal or 0x-prefixed)
        pattern: String,
        /// Local image file
        #[arg(long, conflicts_with = "server")]
        device: Option<PathBuf>,
        /// Remote device server
        #[arg(long)]
        server: Option<SocketAddrV4>,
    },
    /// Sequential write-sync-read loop through the cache
    Bench {
        /// Local image file
        #[arg(long, conflicts_with = "server")]
        device: Option<PathBuf>,
        /// Remote device server
        #[arg(long)]
        server: Option<SocketAddrV4>,
        /// Blocks touched per pass
        #[arg(long, default_value = "256")]
        blocks: u64,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Mkfs { image, blocks } => cmd_mkfs(&image, blocks),
        Commands::Info { image } => cmd_info(&image),
        Commands::Get {
            bnr,
            device,
            server,
            length,
        } => cmd_get(bnr, device, server, length),
        Commands::Put {
            bnr,
            pattern,
            device,
            server,
        } => cmd_put(bnr, &pattern, device, server),
        Commands::Bench {
            device,
            server,
            blocks,
        } => cmd_bench(device, server, blocks),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn open_mount(device: Option<PathBuf>, server: Option<SocketAddrV4>) -> Result<Mount> {
    match (device, server) {
        (Some(path), None) => {
            Mount::local(&path, CacheTuning::default()).context("mounting image")
        }
        (None, Some(server)) => {
            let snapshot = ManifestSnapshot::new(1, vec![SocketAddr::V4(server)]);
            Mount::network(snapshot, CacheTuning::default()).context("mounting server")
        }
        _ => bail!("exactly one of --device or --server is required"),
    }
}

fn cmd_mkfs(image: &Path, blocks: u64) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(image)
        .with_context(|| format!("creating {}", image.display()))?;
    file.set_len(blocks * BLOCK_SIZE as u64)?;
    println!(
        "{} {} ({} blocks, {} bytes)",
        "created".green().bold(),
        image.display(),
        blocks,
        blocks * BLOCK_SIZE as u64
    );
    Ok(())
}

fn cmd_info(image: &Path) -> Result<()> {
    let metadata = std::fs::metadata(image)
        .with_context(|| format!("reading {}", image.display()))?;
    let size = metadata.len();
    println!("{}", image.display().to_string().bold());
    println!("  Size:       {} bytes", size);
    println!("  Block size: {} bytes", BLOCK_SIZE);
    println!("  Blocks:     {}", size / BLOCK_SIZE as u64);
    if size % BLOCK_SIZE as u64 != 0 {
        println!(
            "  {} image size is not block-aligned",
            "warning:".yellow().bold()
        );
    }
    Ok(())
}

fn cmd_get(
    bnr: u64,
    device: Option<PathBuf>,
    server: Option<SocketAddrV4>,
    length: usize,
) -> Result<()> {
    let mount = open_mount(device, server)?;
    let data = read_block(mount.cache(), bnr)?;
    println!("{} {}", "block".bold(), bnr);
    for (row, chunk) in data[..length.min(data.len())].chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("  {:08x}  {}", row * 16, hex.join(" "));
    }
    Ok(())
}

fn cmd_put(
    bnr: u64,
    pattern: &str,
    device: Option<PathBuf>,
    server: Option<SocketAddrV4>,
) -> Result<()> {
    let byte = parse_byte(pattern)?;
    let mount = open_mount(device, server)?;
    write_block(mount.cache(), bnr, &[byte; BLOCK_SIZE])?;
    mount.cache().sync()?;
    println!(
        "{} block {} with 0x{:02x}",
        "wrote".green().bold(),
        bnr,
        byte
    );
    Ok(())
}

fn cmd_bench(device: Option<PathBuf>, server: Option<SocketAddrV4>, blocks: u64) -> Result<()> {
    let mount = open_mount(device, server)?;

    let start = Instant::now();
    for bnr in 0..blocks {
        write_block(mount.cache(), bnr, &[(bnr & 0xFF) as u8; BLOCK_SIZE])?;
    }
    mount.cache().sync()?;
    let write_time = start.elapsed();

    let start = Instant::now();
    for bnr in 0..blocks {
        let data = read_block(mount.cache(), bnr)?;
        if data[0] != (bnr & 0xFF) as u8 {
            bail!("verification failed on block {}", bnr);
        }
    }
    let read_time = start.elapsed();

    let stats = mount.cache().stats();
    println!("{}", "bench results".bold());
    println!(
        "  write+sync: {} blocks in {:?} ({:.0} blocks/s)",
        blocks,
        write_time,
        blocks as f64 / write_time.as_secs_f64()
    );
    println!(
        "  read:       {} blocks in {:?} ({:.0} blocks/s)",
        blocks,
        read_time,
        blocks as f64 / read_time.as_secs_f64()
    );
    println!(
        "  cache:      {} blocks resident, dirty_seq {}",
        stats.cached_blocks, stats.dirty_seq
    );
    Ok(())
}

fn parse_byte(s: &str) -> Result<u8> {
    let value = if let Some(hex) = s.strip_prefix("0x") {
        u8::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    value.with_context(|| format!("invalid pattern byte '{}'", s))
}
