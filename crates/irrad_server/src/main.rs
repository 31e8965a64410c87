use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use irrad_core::{CoreConfig, LogPublisher, OrphanPolicy, ProcessCore};
use irrad_server::daq::MockCurrentSource;
use irrad_server::stage::{MockAxis, TrackedAxis};
use irrad_server::{DeviceServer, ScanStage};

#[derive(Parser, Debug)]
#[command(name = "irrad_server", about = "Irradiation device server")]
struct Args {
    /// Process name used in the descriptor, replies and telemetry.
    #[arg(long, default_value = "server")]
    name: String,

    /// Directory holding the discovery descriptor.
    #[arg(long)]
    run_dir: Option<PathBuf>,

    /// Terminate an orphaned previous instance instead of refusing to start.
    #[arg(long)]
    replace: bool,

    /// Upstream event channel addresses (host:port) to subscribe to.
    #[arg(long = "events-from")]
    events_from: Vec<String>,

    /// Beam current sample interval in milliseconds.
    #[arg(long, default_value_t = 500)]
    sample_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = CoreConfig::new(&args.name);
    if let Some(run_dir) = args.run_dir {
        config.run_dir = run_dir;
    }
    if args.replace {
        config.orphan_policy = OrphanPolicy::Kill;
    }
    config.upstream_events = args.events_from;

    let core = ProcessCore::bind(config).await?;

    // Console log plus mirroring onto the process' log channel.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(LogPublisher::new(core.log_publisher()))
        .init();

    let stage = ScanStage::new(
        Arc::new(TrackedAxis::new(
            Arc::new(MockAxis::new('x', 6400.0)),
            "x",
            args.name.clone(),
            core.data_publisher(),
        )),
        Arc::new(TrackedAxis::new(
            Arc::new(MockAxis::new('y', 6400.0)),
            "y",
            args.name.clone(),
            core.data_publisher(),
        )),
    );

    let role = Arc::new(DeviceServer::new(
        args.name,
        core.cancellation_token(),
        stage,
        core.data_publisher(),
        core.event_publisher(),
        Arc::new(MockCurrentSource { baseline: 100.0 }),
        Duration::from_millis(args.sample_ms),
    ));

    core.run(role).await?;
    Ok(())
}
