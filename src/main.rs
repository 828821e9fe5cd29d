//! fs-mount daemon entry point

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use fs_mount::backend::local::LocalBackend;
use fs_mount::backend::memory::MemoryBackend;
use fs_mount::backend::s3::S3Backend;
use fs_mount::backend::Backend;
use fs_mount::config::{Config, MountConfig, S3Settings, Source};
use fs_mount::mount::MountManager;
use fs_mount::translator::{MkdirPolicy, Translator};

#[derive(Parser, Debug)]
#[command(
    name = "fs-mount",
    version,
    about = "Mount a storage backend as a FUSE filesystem",
    after_help = "Examples:\n  fs-mount --src s3://bucket/prefix --dst /mnt/data\n  fs-mount --config /etc/fs-mount/config.yaml"
)]
struct Cli {
    /// Backend to expose: s3://bucket[/prefix], memory://, file:///path or a plain path
    #[arg(long, requires = "dst", required_unless_present = "config")]
    src: Option<Source>,

    /// Directory to mount on (created if missing)
    #[arg(long, requires = "src")]
    dst: Option<PathBuf>,

    /// YAML file describing one or more mounts
    #[arg(long, short = 'c', env = "FS_MOUNT_CONFIG", conflicts_with_all = ["src", "dst"])]
    config: Option<PathBuf>,

    /// Reject every modification
    #[arg(long)]
    read_only: bool,

    /// How mkdir is carried out: marker or probe
    #[arg(long, default_value_t = MkdirPolicy::Marker)]
    mkdir: MkdirPolicy,

    /// Let other users access the mount
    #[arg(long)]
    allow_other: bool,

    /// Log filter (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn into_config(self) -> Result<(Config, Option<String>), Box<dyn std::error::Error>> {
        let config = match (self.config, self.src, self.dst) {
            (Some(path), _, _) => Config::from_file(&path)?,
            (None, Some(src), Some(dst)) => {
                let mut mount = MountConfig::new(dst, src);
                mount.read_only = self.read_only;
                mount.mkdir = self.mkdir;
                mount.allow_other = self.allow_other;
                Config::single(mount)
            }
            _ => return Err("either --config or both --src and --dst are required".into()),
        };
        Ok((config, self.log_level))
    }
}

/// Construct the backend a mount's source points at
async fn open_backend(
    source: &Source,
    s3: &S3Settings,
) -> Result<Arc<dyn Backend>, Box<dyn std::error::Error>> {
    let backend: Arc<dyn Backend> = match source {
        Source::Local(path) => {
            if !path.is_dir() {
                return Err(format!("source directory {:?} does not exist", path).into());
            }
            Arc::new(LocalBackend::new())
        }
        Source::S3 { bucket, .. } => Arc::new(S3Backend::new(bucket.clone(), s3).await?),
        Source::Memory => Arc::new(MemoryBackend::new()),
    };
    Ok(backend)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let (config, log_level) = match cli.into_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Initialize logging
    let level = log_level.unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("fs-mount starting");

    // Backend clients are built here; each adapter drives requests on its own runtime
    let setup = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let manager = Arc::new(MountManager::new());

    // Set up signal handling for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    let m = manager.clone();

    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
        m.unmount_all();
    })?;

    for mount_config in &config.mounts {
        info!(
            "Setting up mount of {} at {:?}",
            mount_config.source, mount_config.path
        );

        let backend = match setup.block_on(open_backend(&mount_config.source, &mount_config.s3)) {
            Ok(b) => b,
            Err(e) => {
                error!("Failed to open {}: {}", mount_config.source, e);
                continue;
            }
        };

        let translator = Translator::new(backend, mount_config.source.mount_root())
            .with_read_only(mount_config.read_only)
            .with_mkdir_policy(mount_config.mkdir);

        // Create mount point directory if it doesn't exist
        if !mount_config.path.exists() {
            debug!("Creating mount point directory {:?}", mount_config.path);
            if let Err(e) = std::fs::create_dir_all(&mount_config.path) {
                error!(
                    "Failed to create mount point {:?}: {}",
                    mount_config.path, e
                );
                continue;
            }
        }

        if let Err(e) = manager.mount(
            mount_config.path.clone(),
            Arc::new(translator),
            &mount_config.mount_options(),
        ) {
            error!("Failed to mount {:?}: {}", mount_config.path, e);
            continue;
        }
    }

    if manager.count() == 0 {
        error!("No filesystems were mounted successfully");
        std::process::exit(1);
    }

    info!("{} filesystem(s) mounted successfully", manager.count());
    info!("Press Ctrl+C to unmount and exit");

    // Wait for shutdown signal
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));
    }

    info!("Shutting down");
    manager.unmount_all();
    info!("All filesystems unmounted, exiting");

    Ok(())
}
