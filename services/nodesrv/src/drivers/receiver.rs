//! 4-20 mA receiver module (12-bit ADC over a shunt resistor)
//!
//! The loop current flows through a shunt; the ADC samples the drop and
//! ships a 12-bit count in a 2-byte read framed by the chip-select pin.

use std::sync::Arc;

use crate::error::{NodeError, Result};
use crate::gpio::PinHandle;
use crate::spi::SpiBus;

/// ADC voltage reference, volts.
const V_REF: f64 = 2.048;
/// Shunt resistance carrying the loop current, ohms.
const R_SHUNT: f64 = 4.99;
/// ADC count full scale (12 bits).
const FULL_SCALE: f64 = 4096.0;
/// The 12-bit result sits in bits 12..1 of the 16-bit word.
const COUNT_MASK: u16 = 0x1FFE;

/// Convert a raw 2-byte ADC word to milliamps.
pub(crate) fn word_to_ma(bytes: &[u8]) -> std::result::Result<f64, String> {
    if bytes.len() != 2 {
        return Err(format!(
            "expected a 2-byte ADC word, received {} bytes",
            bytes.len()
        ));
    }
    let combined = (u16::from(bytes[0]) << 8) | u16::from(bytes[1]);
    let counts = (combined & COUNT_MASK) >> 1;
    Ok(counts_to_ma(counts))
}

fn counts_to_ma(counts: u16) -> f64 {
    // Gain derivation: count = 20 * I * R_shunt / V_ref * full_scale,
    // with current in amps and the amplifier gain of 20.
    1000.0 * V_REF * f64::from(counts) / (R_SHUNT * FULL_SCALE * 20.0)
}

/// Inverse of [`word_to_ma`], used by the simulated bus.
pub(crate) fn word_for_ma(ma: f64) -> [u8; 2] {
    let counts = (ma * R_SHUNT * FULL_SCALE * 20.0 / (1000.0 * V_REF))
        .round()
        .clamp(0.0, FULL_SCALE - 1.0) as u16;
    let word = (counts << 1) & COUNT_MASK;
    [(word >> 8) as u8, word as u8]
}

/// Driver for one receiver module.
pub struct CurrentReceiver {
    cs: PinHandle,
    bus: Arc<dyn SpiBus>,
}

impl CurrentReceiver {
    pub fn new(cs: PinHandle, bus: Arc<dyn SpiBus>) -> Self {
        Self { cs, bus }
    }

    /// Take one sample of the loop current.
    pub fn read_ma(&self) -> Result<f64> {
        self.cs.select().map_err(NodeError::Driver)?;
        let raw = self.bus.read(2);
        self.cs.deselect().map_err(NodeError::Driver)?;
        word_to_ma(&raw.map_err(NodeError::Driver)?).map_err(NodeError::Driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{GpioBackend, PinBank, SimGpioBackend};
    use crate::spi::SimSpiBus;
    use loopsim_model::SignalKind;

    #[test]
    fn word_conversion_round_trips() {
        for ma in [0.0, 4.0, 8.5, 12.0, 20.0] {
            let word = word_for_ma(ma);
            let back = word_to_ma(&word).unwrap();
            assert!((back - ma).abs() < 0.01, "ma={ma} back={back}");
        }
    }

    #[test]
    fn zero_current_reads_exactly_zero() {
        let word = word_for_ma(0.0);
        assert_eq!(word_to_ma(&word).unwrap(), 0.0);
    }

    #[test]
    fn malformed_word_is_rejected() {
        assert!(word_to_ma(&[1, 2, 3]).is_err());
    }

    #[test]
    fn read_ma_frames_the_transaction() {
        let backend = Arc::new(SimGpioBackend::new());
        let bank = PinBank::new(backend.clone() as Arc<dyn GpioBackend>);
        let cs = bank.acquire("GPIO5", SignalKind::Ai).unwrap();

        let bus = Arc::new(SimSpiBus::new());
        bus.set_loop_ma(12.0);
        let receiver = CurrentReceiver::new(cs, bus as Arc<dyn SpiBus>);

        let ma = receiver.read_ma().unwrap();
        assert!((ma - 12.0).abs() < 0.01);
        // Chip-select is back high after the read.
        assert_eq!(backend.level(5), Some(true));
    }
}
