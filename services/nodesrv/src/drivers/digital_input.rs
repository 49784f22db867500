//! Digital input module

use crate::error::{NodeError, Result};
use crate::gpio::PinHandle;

/// Driver for one digital sense line.
pub struct DigitalInput {
    pin: PinHandle,
}

impl DigitalInput {
    pub fn new(pin: PinHandle) -> Self {
        Self { pin }
    }

    /// Sample the line level.
    pub fn read_state(&self) -> Result<bool> {
        self.pin.read().map_err(NodeError::Driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{GpioBackend, PinBank, SimGpioBackend};
    use loopsim_model::SignalKind;
    use std::sync::Arc;

    #[test]
    fn input_reflects_the_pin_level() {
        let backend = Arc::new(SimGpioBackend::new());
        let bank = PinBank::new(backend.clone() as Arc<dyn GpioBackend>);
        let input = DigitalInput::new(bank.acquire("GPIO16", SignalKind::Di).unwrap());

        assert!(!input.read_state().unwrap());
        backend.set_level(16, true);
        assert!(input.read_state().unwrap());
    }
}
