//! Module registry
//!
//! Lazily instantiates the driver for each `(pin, direction)` pair the
//! first time a command references it, and owns pin acquisition through
//! the [`PinBank`]. Directions must not be mixed on a pin; a conflicting
//! request is refused.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use loopsim_model::SignalKind;

use crate::drivers::{
    CurrentReceiver, CurrentTransmitter, DigitalInput, IndicatorLight, ModuleDriver, RelayChannel,
};
use crate::error::{NodeError, Result};
use crate::gpio::{GpioBackend, PinBank};
use crate::spi::SpiBus;

/// Registry of live modules, keyed by pin name.
pub struct ModuleRegistry {
    bus: Arc<dyn SpiBus>,
    pins: PinBank,
    modules: HashMap<String, ModuleDriver>,
}

impl ModuleRegistry {
    pub fn new(bus: Arc<dyn SpiBus>, gpio_backend: Arc<dyn GpioBackend>) -> Self {
        Self {
            bus,
            pins: PinBank::new(gpio_backend),
            modules: HashMap::new(),
        }
    }

    /// True when both the bus and the GPIO backend reach real hardware.
    pub fn hardware_available(&self) -> bool {
        self.bus.is_available() && self.pins.backend_available()
    }

    /// Fetch the driver for a pin, creating it on first reference.
    pub fn get_or_create(&mut self, pin: &str, kind: SignalKind) -> Result<&mut ModuleDriver> {
        if let Some(existing) = self.modules.get(pin) {
            if existing.kind() != kind {
                return Err(NodeError::registry(format!(
                    "pin {pin} is registered as {}; refusing to treat it as {kind}",
                    existing.kind()
                )));
            }
        } else {
            info!("creating a module entry for {} as {}", pin, kind);
            let handle = self.pins.acquire(pin, kind)?;
            let driver = match kind {
                SignalKind::Ao => {
                    ModuleDriver::AnalogOut(CurrentTransmitter::new(handle, Arc::clone(&self.bus))?)
                },
                SignalKind::Ai => {
                    ModuleDriver::AnalogIn(CurrentReceiver::new(handle, Arc::clone(&self.bus)))
                },
                SignalKind::Do => ModuleDriver::DigitalOut(RelayChannel::new(handle)),
                SignalKind::Di => ModuleDriver::DigitalIn(DigitalInput::new(handle)),
                SignalKind::In => ModuleDriver::Indicator(IndicatorLight::new(handle)),
            };
            self.modules.insert(pin.to_string(), driver);
        }

        self.modules
            .get_mut(pin)
            .ok_or_else(|| NodeError::Internal(format!("module entry for {pin} vanished")))
    }

    /// Pins currently registered as inputs, for poll synthesis.
    pub fn registered_inputs(&self) -> Vec<(String, SignalKind)> {
        self.modules
            .iter()
            .filter(|(_, driver)| driver.kind().is_input())
            .map(|(pin, driver)| (pin.clone(), driver.kind()))
            .collect()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Close every driver and return all pins to the operating system.
    pub fn release_all(&mut self) {
        for (pin, driver) in self.modules.iter_mut() {
            info!("closing module on {}", pin);
            driver.close();
        }
        self.modules.clear();
        self.pins.release_all();
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.modules.len())
            .finish()
    }
}
