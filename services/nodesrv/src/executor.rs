//! Command executor
//!
//! A single long-lived task consumes batches from the shared command
//! queue and runs every entry, in wire order, against the module
//! registry. Responses and faults are collected for the connection
//! handler's reply; clearing the command queue is what releases the
//! handler. One batch is in flight at a time, so bus access needs no
//! extra locking.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use loopsim_model::{DataEntry, ErrorEntry, EntryValue, Severity, SignalKind};

use crate::drivers::ModuleDriver;
use crate::error::NodeError;
use crate::registry::ModuleRegistry;
use crate::state::NodeState;

/// Node-side batch executor.
pub struct Executor {
    state: Arc<NodeState>,
    registry: Arc<Mutex<ModuleRegistry>>,
}

impl Executor {
    pub fn new(state: Arc<NodeState>, registry: Arc<Mutex<ModuleRegistry>>) -> Self {
        Self { state, registry }
    }

    /// Run until the shutdown flag flips.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("executor started");
        loop {
            tokio::select! {
                batch = self.state.wait_for_commands() => {
                    self.process_batch(batch).await;
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                },
            }
        }
        info!("executor stopped");
    }

    /// Execute one batch in order, then clear the queue to release the
    /// waiting handler.
    pub async fn process_batch(&self, batch: Vec<DataEntry>) {
        for entry in &batch {
            let (value_response, errors) = self.execute_entry(entry).await;
            let refused = !errors.is_empty();

            for error in errors {
                self.state.record_error(error).await;
            }

            match value_response {
                Some(response) => self.state.record_response(response).await,
                None => {
                    // Echo the command so the master can tell execution
                    // from silence; a NAK value marks a failed entry.
                    let value = if refused { EntryValue::Nak } else { entry.value };
                    let echo = DataEntry::stamped_now(entry.kind, entry.pin.clone(), value);
                    self.state.record_response(echo).await;
                },
            }
        }
        self.state.finish_batch().await;
    }

    /// Run one entry through its driver. Faults never abort the batch:
    /// every failure path produces error entries and execution moves on.
    async fn execute_entry(&self, entry: &DataEntry) -> (Option<DataEntry>, Vec<ErrorEntry>) {
        // The indicator channel is reserved for local control.
        if entry.kind == SignalKind::In {
            return (
                None,
                vec![ErrorEntry::new(
                    "module registry",
                    Severity::Medium,
                    "The indicator light channel is reserved. Commands from the master are ignored.",
                )],
            );
        }

        let mut registry = self.registry.lock().await;
        let driver = match registry.get_or_create(&entry.pin, entry.kind) {
            Ok(driver) => driver,
            Err(e) => {
                return (
                    None,
                    vec![ErrorEntry::new(
                        "module registry",
                        Severity::High,
                        e.to_string(),
                    )],
                );
            },
        };

        match (entry.kind, driver) {
            (SignalKind::Ao, ModuleDriver::AnalogOut(transmitter)) => {
                let mut errors = Vec::new();

                match entry.value.as_number() {
                    Some(ma) => match transmitter.write_ma(ma) {
                        Ok(()) => {},
                        Err(NodeError::OutOfRange(msg)) => {
                            // The master screens ranges; a refusal here is
                            // logged but the status check still runs.
                            warn!("transmitter refused command: {msg}");
                        },
                        Err(e) => {
                            errors.push(ErrorEntry::new("ao", Severity::High, e.to_string()));
                        },
                    },
                    None => {
                        errors.push(ErrorEntry::new(
                            "ao",
                            Severity::Medium,
                            format!("non-numeric value for output on {}", entry.pin),
                        ));
                    },
                }

                match transmitter.read_status() {
                    Ok(status) => {
                        if status.loop_fault() {
                            errors.push(ErrorEntry::new(
                                "ao",
                                Severity::High,
                                format!("Loop error detected:{}", entry.pin),
                            ));
                        }
                        if !status.link_ok() {
                            errors.push(ErrorEntry::new(
                                "ao",
                                Severity::High,
                                format!("SPI communication error detected:{}", entry.pin),
                            ));
                        }
                    },
                    Err(e) => {
                        errors.push(ErrorEntry::new("ao", Severity::High, e.to_string()));
                    },
                }

                (None, errors)
            },

            (SignalKind::Ai, ModuleDriver::AnalogIn(receiver)) => {
                // The command value is the boxcar length: readings are
                // noisy, so average that many samples.
                let samples = entry
                    .value
                    .as_number()
                    .map(|v| (v as i64).max(1) as u32)
                    .unwrap_or(1);

                let mut sum = 0.0;
                for _ in 0..samples {
                    match receiver.read_ma() {
                        Ok(ma) => sum += ma,
                        Err(e) => {
                            return (
                                None,
                                vec![ErrorEntry::new("ai", Severity::High, e.to_string())],
                            );
                        },
                    }
                }
                let mean = sum / f64::from(samples);

                let mut errors = Vec::new();
                if mean == 0.0 {
                    // Ambient noise always shows on a live ADC; a flat
                    // zero means the chip never answered.
                    errors.push(ErrorEntry::new(
                        "ai",
                        Severity::High,
                        format!("SPI communication error detected:{}", entry.pin),
                    ));
                }

                let response = DataEntry::stamped_now(SignalKind::Ai, entry.pin.clone(), mean);
                (Some(response), errors)
            },

            (SignalKind::Do, ModuleDriver::DigitalOut(relay)) => {
                match entry.value.as_number() {
                    Some(v) => match relay.write_state(v != 0.0) {
                        Ok(()) => (None, Vec::new()),
                        Err(e) => (
                            None,
                            vec![ErrorEntry::new("do", Severity::High, e.to_string())],
                        ),
                    },
                    None => (
                        None,
                        vec![ErrorEntry::new(
                            "do",
                            Severity::Medium,
                            format!("non-numeric value for output on {}", entry.pin),
                        )],
                    ),
                }
            },

            (SignalKind::Di, ModuleDriver::DigitalIn(input)) => match input.read_state() {
                Ok(level) => {
                    let response = DataEntry::stamped_now(
                        SignalKind::Di,
                        entry.pin.clone(),
                        f64::from(u8::from(level)),
                    );
                    (Some(response), Vec::new())
                },
                Err(e) => (
                    None,
                    vec![ErrorEntry::new("di", Severity::High, e.to_string())],
                ),
            },

            // get_or_create guarantees kind/driver agreement; anything
            // else is a programming error worth reporting upstream.
            (kind, driver) => (
                None,
                vec![ErrorEntry::new(
                    "module registry",
                    Severity::High,
                    format!(
                        "driver mismatch on {}: entry is {kind}, module is {}",
                        entry.pin,
                        driver.kind()
                    ),
                )],
            ),
        }
    }
}
