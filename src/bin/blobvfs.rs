//! blobvfs Binary
//!
//! Runs the open/write/read/close scenario against the in-memory engine,
//! or prints the devices a topology file declares.

use std::path::PathBuf;

use blobvfs::{posix, Config, Topology, Vfs};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// blobvfs
#[derive(Parser, Debug)]
#[command(name = "blobvfs")]
#[command(about = "Blocking file facade over a polled blob storage engine")]
#[command(version)]
struct Args {
    /// Device topology JSON (defaults to the embedded single malloc device)
    #[arg(short, long)]
    topology: Option<PathBuf>,

    /// Poll attempts before an engine operation times out
    #[arg(short, long, default_value = "100000")]
    poll_budget: u32,

    /// Clusters per blob (defaults to every free cluster)
    #[arg(short, long)]
    blob_clusters: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a file, write text, read it back and close it
    Demo {
        /// File label
        #[arg(default_value = "a.txt")]
        path: String,

        /// Text to write
        #[arg(default_value = "hello")]
        text: String,
    },

    /// List the malloc devices of the topology
    Topology,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,blobvfs=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("blobvfs v{}", blobvfs::VERSION);

    let topology = match &args.topology {
        Some(path) => match Topology::from_path(path) {
            Ok(topology) => topology,
            Err(e) => {
                tracing::error!("Failed to load topology {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => Topology::default(),
    };

    match args.command {
        Commands::Demo { ref path, ref text } => {
            let mut builder = Config::builder()
                .topology(topology)
                .poll_budget(args.poll_budget);
            if let Some(clusters) = args.blob_clusters {
                builder = builder.blob_clusters(clusters);
            }

            let vfs = match Vfs::in_memory(builder.build()) {
                Ok(vfs) => vfs,
                Err(e) => {
                    tracing::error!("Invalid configuration: {}", e);
                    std::process::exit(1);
                }
            };

            if let Err(message) = run_demo(&vfs, path, text) {
                tracing::error!("{}", message);
                std::process::exit(1);
            }
        }
        Commands::Topology => match topology.malloc_devices() {
            Ok(devices) => {
                for device in devices {
                    println!(
                        "{}: {} blocks x {} bytes ({} bytes)",
                        device.name,
                        device.num_blocks,
                        device.block_size,
                        device.capacity().unwrap_or_default()
                    );
                }
            }
            Err(e) => {
                tracing::error!("Invalid topology: {}", e);
                std::process::exit(1);
            }
        },
    }
}

/// The four-call scenario, through the C-shaped entry points
fn run_demo(vfs: &Vfs, path: &str, text: &str) -> Result<(), String> {
    let fd = posix::open(vfs, path, libc::O_CREAT | libc::O_RDWR);
    if fd < 0 {
        return Err(format!("open({}) failed: errno {}", path, posix::last_errno()));
    }
    println!("open({}) = {}", path, fd);

    let written = posix::write(vfs, fd, text.as_bytes());
    if written < 0 {
        return Err(format!("write({}) failed: errno {}", fd, posix::last_errno()));
    }
    println!("write({}, {:?}) = {}", fd, text, written);

    let mut buf = vec![0u8; text.len()];
    let read = posix::read(vfs, fd, &mut buf);
    if read < 0 {
        return Err(format!("read({}) failed: errno {}", fd, posix::last_errno()));
    }
    println!("read({}) = {} {:?}", fd, read, String::from_utf8_lossy(&buf));

    if posix::close(vfs, fd) < 0 {
        return Err(format!("close({}) failed: errno {}", fd, posix::last_errno()));
    }
    println!("close({}) = 0", fd);
    Ok(())
}

