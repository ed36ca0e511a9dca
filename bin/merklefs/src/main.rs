//! merklefs - mount a read-only content-addressed tree.
//!
//! Loads a metadata document, resolves the blob pool and fetcher from the
//! system configuration, and serves the tree through the kernel until
//! unmount. Writes are expected to be layered above by a union filesystem.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use merklefs_fuse::{mount, MerkleFs, MountOpts, DEFAULT_TIMEOUT};
use merklefs_meta::FileSystem;
use merklefs_pool::{Config, Fetcher, Pool};

/// Mount a read-only content-addressed tree.
#[derive(Parser)]
#[command(name = "merklefs", version, about, long_about = None)]
struct Cli {
    /// Enable filesystem debug messages
    #[arg(long)]
    debug: bool,

    /// Enable kernel-protocol debug messages
    #[arg(long)]
    debug_fuse: bool,

    /// Disable all caching
    #[arg(long)]
    nocache: bool,

    /// Do not use splice(2) to transfer data
    #[arg(long)]
    nosplice: bool,

    /// Run single-threaded
    #[arg(long)]
    single: bool,

    /// FUSE mount option (repeatable)
    #[arg(short = 'o', value_name = "OPTION")]
    options: Vec<String>,

    /// Metadata document describing the tree
    metadata: PathBuf,

    /// Where to mount the filesystem
    mountpoint: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    // One pool descriptor is held per concurrently open file; the default
    // soft limit is far too small for a well-populated kernel cache.
    maximize_fd_limit();

    let config = Config::load_default().context("loading configuration")?;
    let meta = load_metadata(&cli.metadata)
        .with_context(|| format!("loading metadata from {}", cli.metadata.display()))?;
    info!(
        inodes = meta.len(),
        pool = %config.pool,
        remote = %config.remote,
        "metadata loaded"
    );

    let pool = Pool::new(&config.pool, Fetcher::new(&config.fetcher));
    let opts = MountOpts {
        timeout: if cli.nocache {
            Duration::ZERO
        } else {
            DEFAULT_TIMEOUT
        },
        nosplice: cli.nosplice,
        uid: process_uid(),
        gid: process_gid(),
    };
    if cli.single {
        info!("session dispatch runs on a single thread");
    }

    let fs = MerkleFs::new(meta, pool, opts);
    mount(fs, &cli.mountpoint, &cli.options).context("mounting filesystem")?;
    Ok(())
}

fn load_metadata(path: &PathBuf) -> Result<FileSystem> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn init_logging(cli: &Cli) {
    let mut directives = vec![
        "warn".to_owned(),
        "merklefs=info".to_owned(),
        "merklefs_fuse=info".to_owned(),
        "merklefs_pool=info".to_owned(),
    ];
    if cli.debug {
        directives.extend([
            "merklefs=debug".to_owned(),
            "merklefs_fuse=debug".to_owned(),
            "merklefs_meta=debug".to_owned(),
            "merklefs_pool=debug".to_owned(),
        ]);
    }
    if cli.debug_fuse {
        // The kernel-protocol library logs through the `log` facade, which
        // the subscriber picks up.
        directives.push("fuser=debug".to_owned());
    }
    let filter = EnvFilter::new(directives.join(","));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Raises the open-file soft limit to the hard limit.
fn maximize_fd_limit() {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } != 0 {
        warn!("getrlimit failed: {}", io::Error::last_os_error());
        return;
    }
    lim.rlim_cur = lim.rlim_max;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lim) } != 0 {
        warn!("setrlimit failed: {}", io::Error::last_os_error());
    }
}

fn process_uid() -> u32 {
    unsafe { libc::getuid() }
}

fn process_gid() -> u32 {
    unsafe { libc::getgid() }
}

/// 1 for runtime failures, 3 when session setup ran out of memory.
/// Argument errors exit 2 through the parser.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.raw_os_error() == Some(libc::ENOMEM) {
                return 3;
            }
        }
    }
    1
}
