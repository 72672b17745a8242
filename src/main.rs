//! Mount one or more object-store prefixes as a single filesystem.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod app_config;

use app_config::{Config, TargetConfig};
use muxfs::mount::{Mount, RemoteSpec};
use muxfs::remote::local::LocalAccessor;
use muxfs::remote::s3::{S3Accessor, S3Config};

#[derive(Parser)]
#[command(version, about = "Mount object-store prefixes as a filesystem.")]
struct Args {
    /// Path to a muxfs config TOML (default: search the usual locations).
    #[arg(short, long, value_parser)]
    config_path: Option<PathBuf>,

    /// Override the configured mount point.
    #[arg(short, long)]
    mount_point: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("muxfs=info,warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_spec(target: &TargetConfig) -> Result<RemoteSpec, muxfs::RemoteError> {
    let accessor: Box<dyn muxfs::remote::RemoteAccessor> = if target.target.starts_with("http") {
        Box::new(
            S3Accessor::new(&S3Config {
                target: target.target.clone(),
                region: target.region.clone(),
                access_key: target.access_key.clone(),
                secret_key: target.secret_key.clone(),
            })
            .await?,
        )
    } else {
        let root = target
            .target
            .strip_prefix("file://")
            .unwrap_or(&target.target);
        Box::new(LocalAccessor::new(root))
    };
    Ok(RemoteSpec {
        accessor,
        options: target.remote_options(),
    })
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(args.config_path.as_deref())?;

    let mut options = config.mount_options();
    if let Some(mount_point) = args.mount_point {
        options.mount_point = mount_point;
    }

    let mut specs = Vec::with_capacity(config.targets.len());
    for target in &config.targets {
        specs.push(build_spec(target).await?);
    }

    let mount = Arc::new(Mount::new(options, specs)?);
    if config.verbose {
        mount.set_log_sink(Box::new(|record| {
            tracing::debug!(target: "muxfs::calls", "{record}");
        }));
    }
    mount.mount()?;
    mount.unmount_on_death();

    // The signal task owns shutdown (unmount, then exit); nothing left to
    // do here but keep the runtime alive.
    std::future::pending::<()>().await;
    Ok(())
}

fn main() {
    init_tracing();
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| panic!("failed to create tokio runtime: {e}"));

    if let Err(e) = runtime.block_on(run(args)) {
        error!("{e}");
        std::process::exit(1);
    }
}
