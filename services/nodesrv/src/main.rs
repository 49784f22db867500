//! Node service entry point
//!
//! Brings up the module registry against real hardware when present
//! (sysfs GPIO plus the SPI bus) or the simulation backends otherwise,
//! starts the executor and the dispatch server, and turns on the status
//! indicator once the listener is up. A failed bind is fatal and exits
//! non-zero; everything after that degrades gracefully.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use nodesrv::drivers::{IndicatorMode, ModuleDriver};
use nodesrv::executor::Executor;
use nodesrv::gpio::{GpioBackend, SimGpioBackend, SysfsGpioBackend};
use nodesrv::registry::ModuleRegistry;
use nodesrv::server::DispatchServer;
use nodesrv::spi::{SimSpiBus, SpiBus};
use nodesrv::state::NodeState;
use loopsim_model::SignalKind;

/// Command line arguments for the node service
#[derive(Parser)]
#[command(
    name = "nodesrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Node gateway for the distributed current-loop simulator"
)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "192.168.80.1", env = "LOOPSIM_NODE_HOST")]
    host: String,

    /// Listen port
    #[arg(long, default_value_t = 5000, env = "LOOPSIM_NODE_PORT")]
    port: u16,

    /// Per-connection read timeout in seconds
    #[arg(long, default_value_t = 5)]
    read_timeout_s: u64,

    /// Sysfs GPIO base path
    #[arg(long, default_value = "/sys/class/gpio")]
    gpio_base: String,

    /// SPI bus device (requires the spi-hw build)
    #[arg(long, default_value = "/dev/spidev0.0")]
    spi_device: String,

    /// SPI clock in Hz
    #[arg(long, default_value_t = 10_000)]
    spi_speed_hz: u32,

    /// Pin driving the enclosure status lamp
    #[arg(long, default_value = "GPIO20")]
    indicator_pin: String,

    /// Force the simulation backends even when hardware is present
    #[arg(long)]
    simulate: bool,

    /// Log directory; console-only when omitted
    #[arg(long)]
    log_dir: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Pick real or simulated backends based on the flags and what the
/// machine actually has.
fn build_backends(args: &Args) -> (Arc<dyn SpiBus>, Arc<dyn GpioBackend>) {
    if args.simulate {
        info!("simulation mode forced from the command line");
        return (
            Arc::new(SimSpiBus::new()),
            Arc::new(SimGpioBackend::new()),
        );
    }

    let sysfs = SysfsGpioBackend::new(&args.gpio_base);
    let gpio: Arc<dyn GpioBackend> = if sysfs.is_available() {
        Arc::new(sysfs)
    } else {
        warn!(
            "{} not present, running with simulated GPIO",
            args.gpio_base
        );
        Arc::new(SimGpioBackend::new())
    };

    let bus: Arc<dyn SpiBus> = build_spi_bus(args);
    (bus, gpio)
}

#[cfg(feature = "spi-hw")]
fn build_spi_bus(args: &Args) -> Arc<dyn SpiBus> {
    match nodesrv::spi::SpidevBus::open(&args.spi_device, args.spi_speed_hz) {
        Ok(bus) => {
            info!("opened SPI bus {}", args.spi_device);
            Arc::new(bus)
        },
        Err(e) => {
            warn!(
                "could not open {}: {e}; running with simulated SPI",
                args.spi_device
            );
            Arc::new(SimSpiBus::new())
        },
    }
}

#[cfg(not(feature = "spi-hw"))]
fn build_spi_bus(args: &Args) -> Arc<dyn SpiBus> {
    info!(
        "built without spi-hw, {} ignored; using simulated SPI",
        args.spi_device
    );
    Arc::new(SimSpiBus::new())
}

/// Drive the enclosure lamp directly through the registry; the indicator
/// channel never takes commands from the network.
async fn set_indicator(
    registry: &Arc<Mutex<ModuleRegistry>>,
    pin: &str,
    mode: IndicatorMode,
) {
    let mut registry = registry.lock().await;
    match registry.get_or_create(pin, SignalKind::In) {
        Ok(ModuleDriver::Indicator(light)) => {
            if let Err(e) = light.set_mode(mode) {
                warn!("indicator update failed: {e}");
            }
        },
        Ok(_) => warn!("pin {} is not an indicator", pin),
        Err(e) => warn!("could not reach the indicator on {}: {e}", pin),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _guard = match &args.log_dir {
        Some(dir) => Some(common::logging::init_with_file(
            "nodesrv",
            dir,
            args.verbose,
        )?),
        None => {
            common::logging::init_console(args.verbose);
            None
        },
    };

    let (bus, gpio) = build_backends(&args);
    let registry = Arc::new(Mutex::new(ModuleRegistry::new(bus, gpio)));
    if !registry.lock().await.hardware_available() {
        warn!("no carrier board hardware reachable; module I/O is simulated");
    }

    let state = Arc::new(NodeState::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let executor = Executor::new(Arc::clone(&state), Arc::clone(&registry));
    let executor_task = tokio::spawn(executor.run(shutdown_rx.clone()));

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address: {e}"))?;
    let listener = match DispatchServer::bind(addr) {
        Ok(listener) => listener,
        Err(e) => {
            // Nothing works without the listener; bail out non-zero.
            error!("failed to bind {}: {e}", addr);
            return Err(e.into());
        },
    };

    let server = DispatchServer::new(
        Arc::clone(&state),
        Arc::clone(&registry),
        std::time::Duration::from_secs(args.read_timeout_s),
    );
    let server_task = tokio::spawn(server.run(listener, shutdown_rx));

    // Lamp on: the box is reachable.
    set_indicator(&registry, &args.indicator_pin, IndicatorMode::Solid).await;

    common::shutdown::wait_for_shutdown().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = server_task.await;
    let _ = executor_task.await;

    set_indicator(&registry, &args.indicator_pin, IndicatorMode::Off).await;

    info!("closing all modules and releasing pins");
    registry.lock().await.release_all();

    info!("nodesrv stopped cleanly");
    Ok(())
}
