//! Signal module drivers
//!
//! One driver variant per module direction. The registry owns driver
//! instances; the executor is the only caller, so drivers are plain
//! synchronous code over the shared bus and pin handles.

pub mod digital_input;
pub mod indicator;
pub mod receiver;
pub mod relay;
pub mod transmitter;

pub use digital_input::DigitalInput;
pub use indicator::{IndicatorLight, IndicatorMode};
pub use receiver::CurrentReceiver;
pub use relay::RelayChannel;
pub use transmitter::CurrentTransmitter;

use loopsim_model::SignalKind;

/// The module attached to one pin.
pub enum ModuleDriver {
    AnalogOut(CurrentTransmitter),
    AnalogIn(CurrentReceiver),
    DigitalOut(RelayChannel),
    DigitalIn(DigitalInput),
    Indicator(IndicatorLight),
}

impl ModuleDriver {
    pub fn kind(&self) -> SignalKind {
        match self {
            ModuleDriver::AnalogOut(_) => SignalKind::Ao,
            ModuleDriver::AnalogIn(_) => SignalKind::Ai,
            ModuleDriver::DigitalOut(_) => SignalKind::Do,
            ModuleDriver::DigitalIn(_) => SignalKind::Di,
            ModuleDriver::Indicator(_) => SignalKind::In,
        }
    }

    /// Quiesce the module before its pin is released.
    pub fn close(&mut self) {
        match self {
            ModuleDriver::AnalogOut(t) => t.close(),
            ModuleDriver::Indicator(l) => l.close(),
            // Receivers, relays and digital inputs hold no chip state.
            _ => {},
        }
    }
}

impl std::fmt::Debug for ModuleDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ModuleDriver::{}", self.kind())
    }
}
