//! Relay output module

use crate::error::{NodeError, Result};
use crate::gpio::PinHandle;

/// Driver for one relay channel.
pub struct RelayChannel {
    pin: PinHandle,
}

impl RelayChannel {
    pub fn new(pin: PinHandle) -> Self {
        Self { pin }
    }

    /// Energize or release the relay coil.
    pub fn write_state(&self, state: bool) -> Result<()> {
        self.pin.write(state).map_err(NodeError::Driver)
    }
}
