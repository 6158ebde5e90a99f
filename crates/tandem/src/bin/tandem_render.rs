//! # TANDEM Render Node
//!
//! Finds the master through the static directory table, consumes its
//! frames and holds at the barrier until every render node has drawn.
//!
//! ```bash
//! tandem_render --config cluster.toml --label render-left
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tandem::networking::{ClusterConfig, NetError, NetResult};
use tandem::shared::ClientMode;
use tandem::{FrameLog, FrameTally};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pause between frames while nothing paces the loop.
const IDLE_FRAME: Duration = Duration::from_millis(16);

/// Time between progress lines.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "tandem_render")]
#[command(about = "TANDEM render node - consumes frames in lock-step with the master", long_about = None)]
struct Args {
    /// Cluster configuration file with a `[[directory.services]]` table
    #[arg(short, long)]
    config: PathBuf,

    /// Overrides `node.label`
    #[arg(short, long)]
    label: Option<String>,

    /// Frames to consume before stopping (0 runs until killed)
    #[arg(short, long, default_value_t = 0)]
    frames: u64,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "render node failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> NetResult<()> {
    let mut config = ClusterConfig::load(&args.config)?;
    if let Some(label) = &args.label {
        config.node.label.clone_from(label);
    }
    if config.directory.services.is_empty() {
        // An in-process directory would never see the master.
        return Err(NetError::Config(
            "a render node needs a [[directory.services]] table; use tandem_master --renders for a single process".into(),
        ));
    }

    println!("═══════════════════════════════════════════════════════════════════");
    println!("                 TANDEM RENDER NODE v{}", env!("CARGO_PKG_VERSION"));
    println!("═══════════════════════════════════════════════════════════════════");
    println!("  Label:    {}", config.node.label);
    println!("  Service:  {}", config.data_service_name());
    println!("  Networks: {}", config.networks());
    println!("  Mode:     {:?}", config.sync.client_mode);
    println!();

    let tally = Arc::new(FrameTally::default());
    let consumer = FrameLog::new(config.node.label.clone(), Arc::clone(&tally));
    let client = tandem::render(&config, Box::new(consumer), tandem::directory(&config))?;

    let paced = config.sync.client_mode == ClientMode::Sync;
    let mut last_report = Instant::now();
    loop {
        client.consume();
        let seen = tally.snapshot();
        if args.frames > 0 && seen.frames >= args.frames {
            break;
        }
        if !paced || !client.is_connected() {
            thread::sleep(IDLE_FRAME);
        }
        if last_report.elapsed() >= REPORT_INTERVAL {
            last_report = Instant::now();
            tracing::info!(
                label = %config.node.label,
                frames = seen.frames,
                gaps = seen.gaps,
                frame_us = client.frame_time(),
                recv_us = client.recv_time(),
                send_size = client.server_send_size(),
                "progress"
            );
        }
    }

    client.stop()?;
    let seen = tally.snapshot();
    println!("  Consumed {} frames in {} buffers, {} gaps", seen.frames, seen.buffers, seen.gaps);
    Ok(())
}
