//! Periodic input polling
//!
//! Analog and digital inputs are read by the node only when asked, so a
//! background task enqueues one poll entry per input channel every poll
//! period. The value of an AI poll is the boxcar length: the number of
//! samples the node averages before replying.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use loopsim_model::{epoch_now, ChannelCatalog, SignalKind};

use crate::sender::SenderManager;

/// Background poll planner for AI/DI channels.
pub struct InputPoller {
    catalog: Arc<ChannelCatalog>,
    sender: Arc<SenderManager>,
    period: std::time::Duration,
    boxcar_length: u32,
    shutdown_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl InputPoller {
    pub fn new(
        catalog: Arc<ChannelCatalog>,
        sender: Arc<SenderManager>,
        period: std::time::Duration,
        boxcar_length: u32,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            catalog,
            sender,
            period,
            boxcar_length,
            shutdown_tx,
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Enqueue one poll entry for every resolvable input channel.
    /// Channels with unresolved pins are skipped silently; the catalog
    /// already warned about them at load.
    pub fn poll_once(&self) {
        let now = epoch_now();
        for channel in self.catalog.of_kind(SignalKind::Ai) {
            if channel.pin.is_none() {
                continue;
            }
            // The wire value of an AI poll is the averaging count.
            if let Err(e) = self
                .sender
                .place_single_ma(channel, f64::from(self.boxcar_length), now)
            {
                debug!("skipping AI poll for {}: {e}", channel.name);
            }
        }
        for channel in self.catalog.of_kind(SignalKind::Di) {
            if channel.pin.is_none() {
                continue;
            }
            if let Err(e) = self.sender.place_single_eng(channel, 0.0, now) {
                debug!("skipping DI poll for {}: {e}", channel.name);
            }
        }
    }

    /// Spawn the poll loop.
    pub fn start(self: Arc<Self>) {
        let poller = Arc::clone(&self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            info!(
                "input poller started with period {:?} and boxcar length {}",
                poller.period, poller.boxcar_length
            );
            let mut ticker = tokio::time::interval(poller.period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => poller.poll_once(),
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    },
                }
            }
            info!("input poller stopped");
        });
        *self.task.lock() = Some(handle);
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
