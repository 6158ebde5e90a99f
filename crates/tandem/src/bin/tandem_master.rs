//! # TANDEM Master
//!
//! Produces one frame record per tick and serves it to every render node
//! through the sync data server. The barrier paces the whole cluster.
//!
//! ```bash
//! # Single host: master plus two in-process render nodes
//! tandem_master --renders 2 --frames 600
//!
//! # Multi host: every node reads the same static directory table
//! RUST_LOG=tandem=debug tandem_master --config cluster.toml
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tandem::networking::{ClusterConfig, NetResult, ServiceDirectory, SyncDataClient};
use tandem::shared::{ClientMode, ServerMode};
use tandem::{frame_dictionary, FrameLog, FrameSource, FrameTally};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Frames between progress lines.
const REPORT_EVERY: i32 = 300;

#[derive(Parser, Debug)]
#[command(name = "tandem_master")]
#[command(about = "TANDEM master - serves frames to a frame-locked cluster", long_about = None)]
struct Args {
    /// Cluster configuration file (defaults apply without one)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `node.label`
    #[arg(short, long)]
    label: Option<String>,

    /// Frames to produce before stopping (0 runs until killed)
    #[arg(short, long, default_value_t = 0)]
    frames: u64,

    /// Target frames per second
    #[arg(long, default_value_t = 60.0)]
    fps: f64,

    /// Render nodes to run in this process over loopback
    #[arg(long, default_value_t = 0)]
    renders: usize,
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
            tracing::error!(error = %e, "master failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> NetResult<()> {
    let mut config = match &args.config {
        Some(path) => ClusterConfig::load(path)?,
        None => ClusterConfig::default(),
    };
    if let Some(label) = &args.label {
        config.node.label.clone_from(label);
    }

    println!("═══════════════════════════════════════════════════════════════════");
    println!("                    TANDEM MASTER v{}", env!("CARGO_PKG_VERSION"));
    println!("═══════════════════════════════════════════════════════════════════");
    println!("  Label:    {}", config.node.label);
    println!("  Service:  {}", config.data_service_name());
    println!("  Mode:     {:?}", config.sync.server_mode);
    println!();

    let directory = tandem::directory(&config);
    if config.directory.services.is_empty() && args.renders == 0 {
        tracing::warn!(label = %config.node.label, "no static directory table: only in-process render nodes can join");
    }
    let server = tandem::master(&config, frame_dictionary(), Arc::clone(&directory))?;
    let renders = spawn_renders(&config, &directory, args.renders)?;

    let mut source = FrameSource::new(frame_dictionary(), config.node.label.clone())?;
    let period = Duration::from_secs_f64(1.0 / args.fps.max(1.0));
    let manual = config.sync.server_mode != ServerMode::SyncAuto;
    let mut produced = 0_u64;
    while args.frames == 0 || produced < args.frames {
        let tick = Instant::now();
        let mut record = source.next_record()?;
        if !server.receive_message(&mut record) {
            tracing::warn!(label = %config.node.label, frame = source.produced(), "frame rejected by producer callback");
        }
        if manual {
            server.swap_buffers();
        }
        produced += 1;

        if source.produced() % REPORT_EVERY == 0 {
            tracing::info!(
                label = %config.node.label,
                frame = source.produced(),
                clients = server.number_connected(),
                active = server.number_connected_active(),
                releases = server.barrier().release_count(),
                "progress"
            );
        }
        if let Some(rest) = period.checked_sub(tick.elapsed()) {
            thread::sleep(rest);
        }
    }

    renders.stop();
    server.stop();
    println!("  Produced {produced} frames, {} barrier releases", server.barrier().release_count());
    Ok(())
}

/// In-process render nodes and the threads driving them.
struct Renders {
    running: Arc<AtomicBool>,
    nodes: Vec<(Arc<SyncDataClient>, Arc<FrameTally>, thread::JoinHandle<()>)>,
}

impl Renders {
    fn stop(self) {
        self.running.store(false, Ordering::Release);
        for (client, tally, handle) in self.nodes {
            client.skip_consumption();
            if let Err(e) = client.stop() {
                tracing::error!(error = %e, "render node stop failed");
            }
            if handle.join().is_err() {
                tracing::error!("render thread panicked");
            }
            let tally = tally.snapshot();
            println!(
                "  Render:   {} frames in {} buffers, {} gaps, {} reconnects",
                tally.frames,
                tally.buffers,
                tally.gaps,
                tally.connects.saturating_sub(1)
            );
        }
    }
}

fn spawn_renders(config: &ClusterConfig, directory: &Arc<dyn ServiceDirectory>, count: usize) -> NetResult<Renders> {
    let running = Arc::new(AtomicBool::new(true));
    let mut nodes = Vec::with_capacity(count);
    for index in 0..count {
        let mut node_config = config.clone();
        node_config.node.label = format!("{}-render{index}", config.node.label);
        let tally = Arc::new(FrameTally::default());
        let consumer = FrameLog::new(node_config.node.label.clone(), Arc::clone(&tally));
        let client = Arc::new(tandem::render(&node_config, Box::new(consumer), Arc::clone(directory))?);

        let driven = Arc::clone(&client);
        let keep_going = Arc::clone(&running);
        let pace = config.sync.client_mode == ClientMode::NoSync;
        let handle = thread::Builder::new()
            .name(node_config.node.label.clone())
            .spawn(move || {
                while keep_going.load(Ordering::Acquire) {
                    driven.consume();
                    if pace || !driven.is_connected() {
                        thread::sleep(Duration::from_millis(5));
                    }
                }
            })?;
        nodes.push((client, tally, handle));
    }
    Ok(Renders { running, nodes })
}
