//! Transport worker and enqueue API
//!
//! [`SenderManager`] is the seam between the operator surface and the
//! network: commands are placed through it (single-shot values or
//! ramp-expanded sweeps), held in the shared [`CommandScheduler`], and
//! shipped by a background worker that opens one single-use connection
//! per due batch. Everything the node reports back lands on the result
//! queue handed to the constructor.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use loopsim_model::channel::Channel;
use loopsim_model::{epoch_now, DataEntry, DataPacket, ErrorEntry, Severity, SignalKind};

use crate::error::{MasterError, Result};
use crate::scheduler::CommandScheduler;

/// One item on the result queue: a reading/echo or a fault report.
#[derive(Debug, Clone)]
pub enum GuiEvent {
    Data(DataEntry),
    Error(ErrorEntry),
}

/// Pin name used for the synthetic link-status entry pushed by the
/// startup connectivity probe.
pub const LINK_STATUS_PIN: &str = "link";

/// Shared handle for placing commands and running the transport worker.
pub struct SenderManager {
    host: String,
    port: u16,
    socket_timeout: Duration,
    loop_delay: Duration,
    scheduler: Arc<Mutex<CommandScheduler>>,
    gui_tx: mpsc::UnboundedSender<GuiEvent>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SenderManager {
    /// Create a manager talking to `host:port`. `loop_delay` is the
    /// worker poll cadence (100 ms in deployments); `socket_timeout`
    /// bounds connect and reply reads.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        socket_timeout: Duration,
        loop_delay: Duration,
        gui_tx: mpsc::UnboundedSender<GuiEvent>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            host: host.into(),
            port,
            socket_timeout,
            loop_delay,
            scheduler: Arc::new(Mutex::new(CommandScheduler::new())),
            gui_tx,
            shutdown_tx,
            worker: Mutex::new(None),
        })
    }

    // ------------------------------------------------------------------
    // Enqueue API
    // ------------------------------------------------------------------

    /// Place a single command given in engineering units. Conversion to
    /// the wire value happens here; out-of-range analog values are
    /// rejected before anything is enqueued.
    pub fn place_single_eng(&self, channel: &Channel, eng_value: f64, due_time: f64) -> Result<()> {
        let pin = channel.require_pin()?;
        if channel.kind.is_analog() && !channel.valid_eng(eng_value) {
            return Err(MasterError::validation(format!(
                "{} {} is outside the range of {} ({}..{})",
                eng_value,
                channel.units.as_deref().unwrap_or(""),
                channel.name,
                channel.eng_low,
                channel.eng_high
            )));
        }
        let value = channel.to_wire_value(eng_value)?;
        let entry = DataEntry::new(channel.kind, pin, value, due_time);
        debug!("place_single_eng: {:?}", entry);
        self.scheduler.lock().put(entry);
        Ok(())
    }

    /// Place a single command carrying a raw wire value. For AI channels
    /// the value is the sample count the node averages per poll, not a
    /// current; no range check applies.
    pub fn place_single_ma(&self, channel: &Channel, ma_value: f64, due_time: f64) -> Result<()> {
        let pin = channel.require_pin()?;
        let entry = DataEntry::new(channel.kind, pin, ma_value, due_time);
        debug!("place_single_ma: {:?}", entry);
        self.scheduler.lock().put(entry);
        Ok(())
    }

    /// Expand a linear milliamp sweep into one entry per second and
    /// enqueue the whole sequence, stop value included. The expansion is
    /// validated before anything is enqueued: a zero step or any value
    /// outside the 4-20 mA window aborts the ramp.
    pub fn place_ramp_ma(
        &self,
        channel: &Channel,
        start_ma: f64,
        stop_ma: f64,
        step_ma_per_s: f64,
    ) -> Result<usize> {
        let pin = channel.require_pin()?.to_string();
        if step_ma_per_s == 0.0 {
            return Err(MasterError::validation(format!(
                "zero step requested for a ramp on {}",
                channel.name
            )));
        }

        // A step fighting the sweep direction is assumed to be a sign
        // slip; invert it rather than refusing.
        let mut step = step_ma_per_s;
        if stop_ma != start_ma && step.signum() != (stop_ma - start_ma).signum() {
            step = -step;
            info!(
                "ramp step sign inverted to {} for start={} stop={}",
                step, start_ma, stop_ma
            );
        }

        let mut values = Vec::new();
        let mut v = start_ma;
        while (step > 0.0 && v < stop_ma) || (step < 0.0 && v > stop_ma) {
            values.push(v);
            v += step;
        }
        values.push(stop_ma);

        if let Some(bad) = values.iter().find(|v| !Channel::valid_ma(**v)) {
            return Err(MasterError::validation(format!(
                "ramp value {bad} mA on {} is outside the 4-20 mA loop window",
                channel.name
            )));
        }

        let now = epoch_now();
        let entries: Vec<DataEntry> = values
            .iter()
            .enumerate()
            .map(|(i, v)| DataEntry::new(channel.kind, pin.clone(), *v, now + i as f64))
            .collect();
        let count = entries.len();
        self.scheduler.lock().put_all(entries);
        info!(
            "placed ramp for {}: start={} stop={} step={} ({} entries)",
            channel.name, start_ma, stop_ma, step, count
        );
        Ok(count)
    }

    /// Ramp given in engineering units: bounds and rate are converted
    /// through the channel before delegating to [`Self::place_ramp_ma`].
    pub fn place_ramp_eng(
        &self,
        channel: &Channel,
        start_eng: f64,
        stop_eng: f64,
        step_eng_per_s: f64,
    ) -> Result<usize> {
        let start = channel.eng_to_ma(start_eng)?;
        let stop = channel.eng_to_ma(stop_eng)?;
        let step = channel.rate_eng_to_ma(step_eng_per_s)?;
        self.place_ramp_ma(channel, start, stop, step)
    }

    /// Cancel every pending entry for `pin`. Entries already shipped
    /// cannot be recalled.
    pub fn cancel_by_pin(&self, pin: &str) -> usize {
        let removed = self.scheduler.lock().remove_by_pin(pin);
        if removed > 0 {
            info!("cancelled {} pending entries for {}", removed, pin);
        }
        removed
    }

    /// Number of entries still waiting in the scheduler.
    pub fn pending(&self) -> usize {
        self.scheduler.lock().len()
    }

    // ------------------------------------------------------------------
    // Transport worker
    // ------------------------------------------------------------------

    /// Probe the node once and report the outcome on the result queue.
    /// Run at startup so the operator sees link state before the first
    /// command.
    pub async fn probe_connection(&self) {
        let addr = (self.host.clone(), self.port);
        match tokio::time::timeout(self.socket_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {
                info!("connectivity probe reached {}:{}", self.host, self.port);
                let _ = self.gui_tx.send(GuiEvent::Data(DataEntry::stamped_now(
                    SignalKind::Ao,
                    LINK_STATUS_PIN,
                    1.0,
                )));
            },
            Ok(Err(e)) => {
                let _ = self.gui_tx.send(GuiEvent::Error(ErrorEntry::new(
                    "Ethernet Socket",
                    Severity::High,
                    format!("Could not reach {}:{}: {e}", self.host, self.port),
                )));
            },
            Err(_) => {
                let _ = self.gui_tx.send(GuiEvent::Error(ErrorEntry::new(
                    "Ethernet Socket",
                    Severity::High,
                    format!(
                        "Could not reach {}:{} within {:?}",
                        self.host, self.port, self.socket_timeout
                    ),
                )));
            },
        }
    }

    /// Spawn the background transport worker.
    pub fn start(self: Arc<Self>) {
        let manager = Arc::clone(&self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            info!("transport worker started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(manager.loop_delay) => {},
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    },
                }

                let due = manager.scheduler.lock().pop_all_due();
                if due.is_empty() {
                    continue;
                }
                manager.ship_batch(due).await;
            }
            info!("transport worker stopped");
        });
        *self.worker.lock() = Some(handle);
    }

    /// Signal the worker to stop and wait for it. Entries scheduled for
    /// the future are discarded.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.scheduler.lock().clear();
    }

    /// Send one batch over a fresh connection and route the reply. On
    /// any transport failure the output entries are re-queued with their
    /// original due times; input polls are dropped (the next poll tick
    /// re-issues them).
    async fn ship_batch(&self, batch: Vec<DataEntry>) {
        let started = std::time::Instant::now();
        match self.exchange(&batch).await {
            Ok(reply) => {
                debug!(
                    "received reply in {:?} with {} entries and {} errors",
                    started.elapsed(),
                    reply.entries.len(),
                    reply.errors.len()
                );
                for entry in reply.entries {
                    let _ = self.gui_tx.send(GuiEvent::Data(entry));
                }
                for error in reply.errors {
                    let _ = self.gui_tx.send(GuiEvent::Error(error));
                }
            },
            Err(e) => {
                warn!("batch exchange failed: {e}");
                let _ = self.gui_tx.send(GuiEvent::Error(ErrorEntry::new(
                    "Ethernet Client Socket",
                    Severity::High,
                    format!(
                        "Could not complete an exchange with {}:{} within timeout={:?}. {e}",
                        self.host, self.port, self.socket_timeout
                    ),
                )));

                let requeue: Vec<DataEntry> = batch
                    .into_iter()
                    .filter(|entry| entry.kind.is_output())
                    .collect();
                if !requeue.is_empty() {
                    debug!("re-queueing {} output entries", requeue.len());
                    self.scheduler.lock().put_all(requeue);
                }
            },
        }
    }

    /// One request/response cycle: connect, send the encoded batch in a
    /// single write, read exactly one reply frame, close.
    async fn exchange(&self, batch: &[DataEntry]) -> Result<DataPacket> {
        let mut packet = DataPacket::data(batch.to_vec());
        packet.time = Some(epoch_now());
        let bytes = packet.encode()?;

        let addr = (self.host.clone(), self.port);
        let mut stream = tokio::time::timeout(self.socket_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MasterError::transport("connect timed out"))??;
        stream.set_nodelay(true)?;

        stream.write_all(&bytes).await?;

        let reply = tokio::time::timeout(self.socket_timeout, DataPacket::decode(&mut stream))
            .await
            .map_err(|_| MasterError::transport("reply timed out"))??;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopsim_model::channel::ChannelKind;

    fn test_channel(kind: ChannelKind) -> Channel {
        Channel {
            name: "SPT".to_string(),
            slot: 14,
            pin: Some("GPIO13".to_string()),
            kind,
            units: Some("PSI".to_string()),
            eng_low: 97.0,
            eng_high: 200.0,
            show_on_gui: true,
            calibration: None,
        }
    }

    fn manager() -> (Arc<SenderManager>, mpsc::UnboundedReceiver<GuiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let m = SenderManager::new(
            "127.0.0.1",
            1,
            Duration::from_millis(200),
            Duration::from_millis(10),
            tx,
        );
        (m, rx)
    }

    #[tokio::test]
    async fn single_eng_converts_to_wire_current() {
        let (m, _rx) = manager();
        let ch = test_channel(ChannelKind::Ao);
        m.place_single_eng(&ch, 148.5, epoch_now() - 1.0).unwrap();

        let due = m.scheduler.lock().pop_all_due();
        assert_eq!(due.len(), 1);
        let ma = due[0].value.as_number().unwrap();
        assert!((ma - 12.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn out_of_range_eng_value_is_rejected() {
        let (m, _rx) = manager();
        let ch = test_channel(ChannelKind::Ao);
        let err = m.place_single_eng(&ch, 500.0, epoch_now()).unwrap_err();
        assert!(matches!(err, MasterError::Validation(_)));
        assert_eq!(m.pending(), 0);
    }

    #[tokio::test]
    async fn unresolved_pin_is_rejected_with_message() {
        let (m, _rx) = manager();
        let mut ch = test_channel(ChannelKind::Ao);
        ch.pin = None;
        ch.slot = 99;
        let err = m.place_single_eng(&ch, 148.5, epoch_now()).unwrap_err();
        assert!(err.to_string().contains("slot 99"));
    }

    #[tokio::test]
    async fn ramp_expands_to_one_entry_per_second_including_stop() {
        let (m, _rx) = manager();
        let ch = test_channel(ChannelKind::Ao);
        let count = m.place_ramp_ma(&ch, 4.0, 20.0, 2.0).unwrap();
        assert_eq!(count, 9);

        let mut sched = m.scheduler.lock();

        // Only the first step is due now; the rest are spaced one
        // second apart into the future.
        let due = sched.pop_all_due();
        assert_eq!(due.len(), 1);
        assert!((due[0].value.as_number().unwrap() - 4.0).abs() < 1e-9);
        assert_eq!(sched.len(), 8);

        // The remaining steps sweep to the stop value inclusive.
        let rest = sched.pop_all();
        let values: Vec<f64> = rest
            .iter()
            .map(|e| e.value.as_number().unwrap())
            .collect();
        assert_eq!(values, vec![6.0, 8.0, 10.0, 12.0, 14.0, 16.0, 18.0, 20.0]);
        // One-second spacing between consecutive due times.
        for pair in rest.windows(2) {
            assert!((pair[1].time - pair[0].time - 1.0).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn ramp_step_sign_is_corrected() {
        let (m, _rx) = manager();
        let ch = test_channel(ChannelKind::Ao);
        // Downward sweep with a positive step: silently inverted.
        let count = m.place_ramp_ma(&ch, 20.0, 4.0, 2.0).unwrap();
        assert_eq!(count, 9);
    }

    #[tokio::test]
    async fn ramp_zero_step_fails() {
        let (m, _rx) = manager();
        let ch = test_channel(ChannelKind::Ao);
        assert!(m.place_ramp_ma(&ch, 4.0, 20.0, 0.0).is_err());
        assert_eq!(m.pending(), 0);
    }

    #[tokio::test]
    async fn ramp_with_out_of_window_value_enqueues_nothing() {
        let (m, _rx) = manager();
        let ch = test_channel(ChannelKind::Ao);
        let err = m.place_ramp_ma(&ch, 4.0, 22.0, 2.0).unwrap_err();
        assert!(matches!(err, MasterError::Validation(_)));
        assert_eq!(m.pending(), 0);
    }

    #[tokio::test]
    async fn ramp_in_engineering_units_converts_rate() {
        let (m, _rx) = manager();
        let mut ch = test_channel(ChannelKind::Ao);
        ch.eng_low = 0.0;
        ch.eng_high = 100.0;
        // 0..100 units at 12.5 units/s is 4..20 mA at 2 mA/s.
        let count = m.place_ramp_eng(&ch, 0.0, 100.0, 12.5).unwrap();
        assert_eq!(count, 9);
    }

    #[tokio::test]
    async fn cancel_by_pin_removes_pending_ramp() {
        let (m, _rx) = manager();
        let ch = test_channel(ChannelKind::Ao);
        m.place_ramp_ma(&ch, 4.0, 20.0, 0.2).unwrap();
        assert!(m.pending() > 50);
        let removed = m.cancel_by_pin("GPIO13");
        assert_eq!(removed, m.pending() + removed);
        assert_eq!(m.pending(), 0);
    }

    #[tokio::test]
    async fn failed_exchange_requeues_outputs_only() {
        // Port 1 refuses connections, so the worker path fails fast.
        let (m, mut rx) = manager();
        let batch = vec![
            DataEntry::stamped_now(SignalKind::Ao, "GPIO13", 12.0),
            DataEntry::stamped_now(SignalKind::Ai, "GPIO5", 8.0),
            DataEntry::stamped_now(SignalKind::Do, "GPIO6", 1.0),
        ];
        m.ship_batch(batch).await;

        // One transport error surfaced.
        match rx.recv().await {
            Some(GuiEvent::Error(e)) => assert_eq!(e.severity, Severity::High),
            other => panic!("expected error event, got {other:?}"),
        }

        // AO and DO came back; the AI poll was discarded.
        let requeued = m.scheduler.lock().pop_all_due();
        assert_eq!(requeued.len(), 2);
        assert!(requeued.iter().all(|e| e.kind.is_output()));
    }
}
