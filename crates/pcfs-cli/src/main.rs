use clap::Parser;
#[cfg(unix)]
use daemonize::Daemonize;
#[cfg(unix)]
use fuser::MountOption;
use pcfs_backend::PosixBackend;
#[cfg(unix)]
use pcfs_fuse::PassThroughFs;
use pcfs_models::{BackendPath, CacheConfig};
use serde::Deserialize;
use signal_hook::consts::signal::*;
use signal_hook::iterator::Signals;
use std::fs::create_dir_all;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

const DEFAULT_CACHE_ROOT: &str = "/var/cache/pcfs";

#[derive(Parser, Debug)]
#[command(name = "pcfs", version = "0.1.0", about = "Pass-through cache filesystem")]
struct Cli {
    /// Directory to mount the cached view at
    #[arg(short, long)]
    mount_point: Option<String>,

    /// Directory being cached and passed through
    #[arg(short, long)]
    backend_root: Option<String>,

    /// Optional TOML config file; CLI flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where the cache's metadata.db and block files live
    #[arg(long)]
    cache_root: Option<PathBuf>,

    /// Block size in bytes, must be a power of two >= 4096
    #[arg(long)]
    block_size_bytes: Option<u32>,

    /// Maximum total bytes the block store may hold on disk
    #[arg(long)]
    max_cache_size_bytes: Option<u64>,

    /// Attribute cache TTL in seconds
    #[arg(long)]
    meta_ttl_seconds: Option<u64>,

    /// Directory listing cache TTL in seconds
    #[arg(long)]
    dir_ttl_seconds: Option<u64>,

    /// Negative-entry cache TTL in seconds
    #[arg(long)]
    neg_ttl_seconds: Option<u64>,

    /// Run in the foreground instead of daemonizing
    #[arg(long, action = clap::ArgAction::SetTrue)]
    foreground: bool,

    /// Emit debug-level cache-hit/miss logging
    #[arg(long, action = clap::ArgAction::SetTrue)]
    cache_debug: bool,
}

/// Shape of an on-disk `--config` file. Every field is optional so a config
/// file can set only what it cares about, leaving the rest to defaults or
/// CLI flags.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    mount_point: Option<String>,
    backend_root: Option<String>,
    cache_root: Option<PathBuf>,
    block_size_bytes: Option<u32>,
    max_cache_size_bytes: Option<u64>,
    meta_ttl_seconds: Option<u64>,
    dir_ttl_seconds: Option<u64>,
    neg_ttl_seconds: Option<u64>,
    cache_debug: Option<bool>,
}

fn load_file_config(path: &PathBuf) -> FileConfig {
    let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("failed to read config file {path:?}: {e}");
        std::process::exit(1);
    });
    toml::from_str(&text).unwrap_or_else(|e| {
        eprintln!("failed to parse config file {path:?}: {e}");
        std::process::exit(1);
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let file_config = cli.config.as_ref().map(load_file_config).unwrap_or_default();

    let mount_point = cli.mount_point.clone().or(file_config.mount_point.clone()).unwrap_or_else(|| {
        eprintln!("mount point required: pass --mount-point or set it in --config");
        std::process::exit(1);
    });
    let backend_root = cli.backend_root.clone().or(file_config.backend_root.clone()).unwrap_or_else(|| {
        eprintln!("backend root required: pass --backend-root or set it in --config");
        std::process::exit(1);
    });

    let mut cache_config = CacheConfig {
        cache_root: cli
            .cache_root
            .clone()
            .or(file_config.cache_root.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_ROOT)),
        ..CacheConfig::default()
    };
    if let Some(v) = cli.block_size_bytes.or(file_config.block_size_bytes) {
        cache_config.block_size_bytes = v;
    }
    if let Some(v) = cli.max_cache_size_bytes.or(file_config.max_cache_size_bytes) {
        cache_config.max_cache_size_bytes = v;
    }
    if let Some(v) = cli.meta_ttl_seconds.or(file_config.meta_ttl_seconds) {
        cache_config.meta_ttl_seconds = v;
    }
    if let Some(v) = cli.dir_ttl_seconds.or(file_config.dir_ttl_seconds) {
        cache_config.dir_ttl_seconds = v;
    }
    if let Some(v) = cli.neg_ttl_seconds.or(file_config.neg_ttl_seconds) {
        cache_config.neg_ttl_seconds = v;
    }
    cache_config.cache_debug = cli.cache_debug || file_config.cache_debug.unwrap_or(false);

    if let Err(e) = cache_config.validate() {
        eprintln!("invalid cache configuration: {e}");
        std::process::exit(1);
    }

    create_dir_all(&mount_point).expect("mount point does not exist and cannot be created");
    create_dir_all(&cache_config.cache_root).expect("cache root cannot be created");

    #[cfg(unix)]
    run(mount_point, backend_root, cache_config, cli.foreground);

    #[cfg(not(unix))]
    {
        eprintln!("pcfs only supports POSIX hosts");
        std::process::exit(1);
    }
}

#[cfg(unix)]
fn run(mount_point: String, backend_root: String, cache_config: CacheConfig, foreground: bool) {
    if !foreground {
        let daemonize = Daemonize::new()
            .pid_file("/tmp/pcfs.pid")
            .working_directory("/")
            .umask(0o027);
        if let Err(e) = daemonize.start() {
            eprintln!("daemonization failed: {e}");
            std::process::exit(1);
        }
    }

    let backend = match PosixBackend::new(&backend_root, &cache_config.cache_root) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize backend adapter");
            std::process::exit(1);
        }
    };

    let root_path = BackendPath::new(backend.root().to_string_lossy().into_owned());
    let fs = PassThroughFs::new(backend, cache_config, root_path);

    let options = vec![MountOption::FSName("pcfs".to_string()), MountOption::RW];
    let session = fuser::spawn_mount2(fs, &mount_point, &options).expect("failed to mount");

    let pair = Arc::new((Mutex::new(false), Condvar::new()));
    let pair_clone = pair.clone();

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT, SIGHUP]).expect("unable to register signal handlers");
    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGINT | SIGTERM | SIGQUIT | SIGHUP => {
                    let (lock, cvar) = &*pair_clone;
                    let mut stop = lock.lock().unwrap();
                    *stop = true;
                    cvar.notify_one();
                    tracing::info!("shutdown signal received");
                    break;
                }
                other => tracing::warn!(signal = other, "unhandled signal"),
            }
        }
    });

    tracing::info!(mount_point = %mount_point, backend_root = %backend_root, "pcfs mounted");

    let (lock, cvar) = &*pair;
    let _stop = cvar.wait_while(lock.lock().unwrap(), |s| !*s).expect("mutex poisoned");
    tracing::info!("unmounting");
    drop(session);
    tracing::info!("unmounted");
}
