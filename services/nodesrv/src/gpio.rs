//! GPIO pin access
//!
//! Pins are addressed by name (`"GPIO13"`) and reach hardware through a
//! [`GpioBackend`]: the sysfs implementation for Linux targets, or an
//! in-memory simulation backend for development machines and tests.
//! The [`PinBank`] owns every acquisition; nothing else may release a
//! pin.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use loopsim_model::SignalKind;

use crate::error::{NodeError, Result};

/// Requested electrical direction for a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    /// Input (digital sense lines; hardware provides the pull-up)
    Input,
    /// Output with an initial level
    Output { initial_high: bool },
}

/// GPIO backend abstraction
pub trait GpioBackend: Send + Sync {
    /// Read a pin level
    fn read(&self, pin_number: u32) -> std::result::Result<bool, String>;

    /// Write a pin level
    fn write(&self, pin_number: u32, value: bool) -> std::result::Result<(), String>;

    /// Export and configure a pin
    fn setup(&self, pin_number: u32, direction: PinDirection) -> std::result::Result<(), String>;

    /// Return a pin to the operating system
    fn release(&self, pin_number: u32);

    /// Check if the backend is usable on this machine
    fn is_available(&self) -> bool;
}

/// Sysfs GPIO backend for Linux
pub struct SysfsGpioBackend {
    base_path: String,
}

impl SysfsGpioBackend {
    pub fn new(base_path: &str) -> Self {
        Self {
            base_path: base_path.to_string(),
        }
    }
}

impl Default for SysfsGpioBackend {
    fn default() -> Self {
        Self::new("/sys/class/gpio")
    }
}

impl GpioBackend for SysfsGpioBackend {
    fn read(&self, pin_number: u32) -> std::result::Result<bool, String> {
        let path = format!("{}/gpio{}/value", self.base_path, pin_number);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(content.trim() == "1"),
            Err(e) => {
                debug!("Failed to read GPIO {}: {}", pin_number, e);
                Err(format!("GPIO {pin_number} read failed: {e}"))
            },
        }
    }

    fn write(&self, pin_number: u32, value: bool) -> std::result::Result<(), String> {
        let path = format!("{}/gpio{}/value", self.base_path, pin_number);
        let content = if value { "1" } else { "0" };
        std::fs::write(&path, content).map_err(|e| {
            warn!("Failed to write GPIO {}: {}", pin_number, e);
            format!("GPIO {pin_number} write failed: {e}")
        })
    }

    fn setup(&self, pin_number: u32, direction: PinDirection) -> std::result::Result<(), String> {
        let export_path = format!("{}/export", self.base_path);
        let gpio_path = format!("{}/gpio{}", self.base_path, pin_number);

        if !Path::new(&gpio_path).exists() {
            if let Err(e) = std::fs::write(&export_path, pin_number.to_string()) {
                // "Device or resource busy" means already exported
                if !e.to_string().contains("Device or resource busy") {
                    warn!("Failed to export GPIO {}: {}", pin_number, e);
                }
            }
        }

        let direction_path = format!("{gpio_path}/direction");
        let dir_value = match direction {
            PinDirection::Input => "in",
            PinDirection::Output { .. } => "out",
        };
        if let Err(e) = std::fs::write(&direction_path, dir_value) {
            warn!(
                "Failed to set GPIO {} direction to {}: {}",
                pin_number, dir_value, e
            );
        }

        if let PinDirection::Output { initial_high } = direction {
            self.write(pin_number, initial_high)?;
        }
        Ok(())
    }

    fn release(&self, pin_number: u32) {
        let unexport_path = format!("{}/unexport", self.base_path);
        if let Err(e) = std::fs::write(&unexport_path, pin_number.to_string()) {
            debug!("Failed to unexport GPIO {}: {}", pin_number, e);
        }
    }

    fn is_available(&self) -> bool {
        Path::new(&self.base_path).exists()
    }
}

/// In-memory GPIO backend for simulation and tests
#[derive(Default)]
pub struct SimGpioBackend {
    levels: Mutex<HashMap<u32, bool>>,
}

impl SimGpioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force an input level from test code.
    pub fn set_level(&self, pin_number: u32, value: bool) {
        self.levels.lock().insert(pin_number, value);
    }

    /// Observe the last written level.
    pub fn level(&self, pin_number: u32) -> Option<bool> {
        self.levels.lock().get(&pin_number).copied()
    }
}

impl GpioBackend for SimGpioBackend {
    fn read(&self, pin_number: u32) -> std::result::Result<bool, String> {
        Ok(*self.levels.lock().get(&pin_number).unwrap_or(&false))
    }

    fn write(&self, pin_number: u32, value: bool) -> std::result::Result<(), String> {
        self.levels.lock().insert(pin_number, value);
        Ok(())
    }

    fn setup(&self, pin_number: u32, direction: PinDirection) -> std::result::Result<(), String> {
        if let PinDirection::Output { initial_high } = direction {
            self.levels.lock().insert(pin_number, initial_high);
        }
        Ok(())
    }

    fn release(&self, pin_number: u32) {
        self.levels.lock().remove(&pin_number);
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Parse a `GPIO<n>` pin name into its sysfs number.
pub fn parse_pin_number(pin_name: &str) -> Result<u32> {
    let digits = pin_name
        .strip_prefix("GPIO")
        .or_else(|| pin_name.strip_prefix("gpio"))
        .ok_or_else(|| {
            NodeError::pin(format!(
                "pin name `{pin_name}` does not follow the GPIO<n> convention"
            ))
        })?;
    digits
        .parse::<u32>()
        .map_err(|_| NodeError::pin(format!("pin name `{pin_name}` has a non-numeric suffix")))
}

/// Handle to one acquired pin. Cloneable; all clones share the backend.
#[derive(Clone)]
pub struct PinHandle {
    name: String,
    number: u32,
    backend: Arc<dyn GpioBackend>,
}

impl PinHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn read(&self) -> std::result::Result<bool, String> {
        self.backend.read(self.number)
    }

    pub fn write(&self, value: bool) -> std::result::Result<(), String> {
        self.backend.write(self.number, value)
    }

    /// Pull the chip-select line low to open a bus transaction.
    pub fn select(&self) -> std::result::Result<(), String> {
        self.write(false)
    }

    /// Raise the chip-select line to close a bus transaction.
    pub fn deselect(&self) -> std::result::Result<(), String> {
        self.write(true)
    }
}

impl std::fmt::Debug for PinHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinHandle")
            .field("name", &self.name)
            .field("number", &self.number)
            .finish()
    }
}

/// Tracks every acquired pin; owns pin lifecycle for the whole node.
pub struct PinBank {
    backend: Arc<dyn GpioBackend>,
    acquired: Mutex<HashMap<String, u32>>,
}

impl PinBank {
    pub fn new(backend: Arc<dyn GpioBackend>) -> Self {
        Self {
            backend,
            acquired: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_available(&self) -> bool {
        self.backend.is_available()
    }

    /// Acquire and configure a pin for the given signal direction.
    ///
    /// Direction policy: digital inputs become inputs; the indicator
    /// starts low (lamp off); every other pin is an output idling high
    /// (chip-select lines are active-low).
    pub fn acquire(&self, pin_name: &str, kind: SignalKind) -> Result<PinHandle> {
        let number = parse_pin_number(pin_name)?;
        let direction = match kind {
            SignalKind::Di => PinDirection::Input,
            SignalKind::In => PinDirection::Output {
                initial_high: false,
            },
            _ => PinDirection::Output { initial_high: true },
        };
        self.backend
            .setup(number, direction)
            .map_err(NodeError::Pin)?;
        self.acquired.lock().insert(pin_name.to_string(), number);
        debug!("acquired {} as {:?}", pin_name, direction);
        Ok(PinHandle {
            name: pin_name.to_string(),
            number,
            backend: Arc::clone(&self.backend),
        })
    }

    /// Release every acquired pin back to the operating system.
    pub fn release_all(&self) {
        let mut acquired = self.acquired.lock();
        for (name, number) in acquired.drain() {
            debug!("releasing {}", name);
            self.backend.release(number);
        }
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_names_parse_to_numbers() {
        assert_eq!(parse_pin_number("GPIO13").unwrap(), 13);
        assert_eq!(parse_pin_number("gpio5").unwrap(), 5);
        assert!(parse_pin_number("13").is_err());
        assert!(parse_pin_number("GPIOx").is_err());
    }

    #[test]
    fn sim_backend_round_trips_levels() {
        let backend = SimGpioBackend::new();
        backend.write(13, true).unwrap();
        assert!(backend.read(13).unwrap());
        assert!(!backend.read(99).unwrap());
    }

    #[test]
    fn bank_applies_direction_policy() {
        let backend = Arc::new(SimGpioBackend::new());
        let bank = PinBank::new(backend.clone() as Arc<dyn GpioBackend>);

        let cs = bank.acquire("GPIO13", SignalKind::Ao).unwrap();
        // Chip-select idles high.
        assert_eq!(backend.level(13), Some(true));

        let lamp = bank.acquire("GPIO20", SignalKind::In).unwrap();
        assert_eq!(backend.level(20), Some(false));

        cs.select().unwrap();
        assert_eq!(backend.level(13), Some(false));
        cs.deselect().unwrap();
        assert_eq!(backend.level(13), Some(true));

        lamp.write(true).unwrap();
        assert_eq!(backend.level(20), Some(true));

        assert_eq!(bank.acquired_count(), 2);
        bank.release_all();
        assert_eq!(bank.acquired_count(), 0);
    }

    #[test]
    fn sysfs_backend_reads_and_writes_value_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap().to_string();
        std::fs::write(dir.path().join("export"), "").unwrap();
        std::fs::write(dir.path().join("unexport"), "").unwrap();
        let gpio_dir = dir.path().join("gpio13");
        std::fs::create_dir_all(&gpio_dir).unwrap();
        std::fs::write(gpio_dir.join("direction"), "out").unwrap();
        std::fs::write(gpio_dir.join("value"), "0").unwrap();

        let backend = SysfsGpioBackend::new(&base);
        assert!(backend.is_available());

        backend
            .setup(13, PinDirection::Output { initial_high: true })
            .unwrap();
        assert!(backend.read(13).unwrap());

        backend.write(13, false).unwrap();
        assert!(!backend.read(13).unwrap());

        // Reading a pin that was never exported fails with a message.
        assert!(backend.read(99).is_err());
    }
}
