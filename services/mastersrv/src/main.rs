//! Master service entry point
//!
//! Loads the channel configuration, starts the transport worker and the
//! input poller, and routes node replies to the operator surface until
//! a shutdown signal arrives.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use mastersrv::display::ResultRouter;
use mastersrv::poller::InputPoller;
use mastersrv::sender::SenderManager;
use loopsim_model::MasterConfig;

/// Command line arguments for the master service
#[derive(Parser)]
#[command(
    name = "mastersrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Master controller for the distributed current-loop simulator"
)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/loopsim.json", env = "LOOPSIM_CONFIG")]
    config: String,

    /// Node host
    #[arg(long, default_value = "192.168.80.1", env = "LOOPSIM_NODE_HOST")]
    host: String,

    /// Node port
    #[arg(long, default_value_t = 5000, env = "LOOPSIM_NODE_PORT")]
    port: u16,

    /// Transport worker poll cadence in milliseconds
    #[arg(long, default_value_t = 100)]
    loop_delay_ms: u64,

    /// Log directory; console-only when omitted
    #[arg(long)]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match MasterConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            // A missing or broken file degrades to defaults so the
            // operator still gets a running (if empty) surface.
            eprintln!("failed to load {}: {e}; continuing with defaults", args.config);
            MasterConfig::default()
        },
    };
    let settings = config.settings();

    let _guard = match &args.log_dir {
        Some(dir) => Some(common::logging::init_with_file(
            "mastersrv",
            dir,
            settings.enable_verbose_logging,
        )?),
        None => {
            common::logging::init_console(settings.enable_verbose_logging);
            None
        },
    };

    info!(
        "mastersrv starting: node={}:{}, {} signals configured",
        args.host,
        args.port,
        config.signals.len()
    );
    if config.signals.is_empty() {
        warn!("no signals configured; only manual raw commands will work");
    }

    let catalog = Arc::new(config.catalog());
    let (gui_tx, gui_rx) = mpsc::unbounded_channel();

    let sender = SenderManager::new(
        &args.host,
        args.port,
        settings.socket_timeout(),
        std::time::Duration::from_millis(args.loop_delay_ms),
        gui_tx,
    );
    sender.probe_connection().await;
    Arc::clone(&sender).start();

    let poller = Arc::new(InputPoller::new(
        Arc::clone(&catalog),
        Arc::clone(&sender),
        settings.poll_period(),
        settings.ai_lpf_boxcar_length,
    ));
    Arc::clone(&poller).start();

    let router = ResultRouter::new(Arc::clone(&catalog), settings.error_stack_max_len);
    let router_task = tokio::spawn(router.run(gui_rx));

    common::shutdown::wait_for_shutdown().await;
    info!("shutdown signal received");

    poller.shutdown().await;
    sender.shutdown().await;
    router_task.abort();

    info!("mastersrv stopped cleanly");
    Ok(())
}
