//! Status indicator light
//!
//! The lamp on the simulator enclosure. The node drives it locally
//! (network up, shutting down); commands arriving from the master for
//! this channel are refused upstream. Blinking runs as a background
//! task that is stopped whenever the mode changes.

use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{NodeError, Result};
use crate::gpio::PinHandle;

/// Rapid-blink half period.
const BLINK_INTERVAL_MS: u64 = 300;

/// Indication modes selected by value: 0 off, 1 solid on, 2 rapid blink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorMode {
    Off,
    Solid,
    Blink,
}

impl IndicatorMode {
    /// Interpret a wire value as a mode.
    pub fn from_value(value: f64) -> Option<Self> {
        match value as i64 {
            0 => Some(IndicatorMode::Off),
            1 => Some(IndicatorMode::Solid),
            2 => Some(IndicatorMode::Blink),
            _ => None,
        }
    }
}

/// Driver for the indicator lamp.
pub struct IndicatorLight {
    pin: PinHandle,
    blink_task: Option<JoinHandle<()>>,
}

impl IndicatorLight {
    pub fn new(pin: PinHandle) -> Self {
        Self {
            pin,
            blink_task: None,
        }
    }

    /// Switch the lamp mode, stopping any blink task first.
    pub fn set_mode(&mut self, mode: IndicatorMode) -> Result<()> {
        self.stop_blink();
        match mode {
            IndicatorMode::Off => self.pin.write(false).map_err(NodeError::Driver),
            IndicatorMode::Solid => self.pin.write(true).map_err(NodeError::Driver),
            IndicatorMode::Blink => {
                let pin = self.pin.clone();
                let handle = tokio::spawn(async move {
                    let mut lit = false;
                    let mut ticker = tokio::time::interval(
                        std::time::Duration::from_millis(BLINK_INTERVAL_MS),
                    );
                    loop {
                        ticker.tick().await;
                        lit = !lit;
                        if pin.write(lit).is_err() {
                            break;
                        }
                    }
                });
                self.blink_task = Some(handle);
                Ok(())
            },
        }
    }

    fn stop_blink(&mut self) {
        if let Some(handle) = self.blink_task.take() {
            handle.abort();
            debug!("blink task stopped for {}", self.pin.name());
        }
    }

    /// Turn the lamp off and stop blinking.
    pub fn close(&mut self) {
        self.stop_blink();
        let _ = self.pin.write(false);
    }
}
