//! Shared synchronous bus
//!
//! All analog modules sit on one SPI bus, framed by per-module
//! chip-select pins. Bus access is naturally serialized because only
//! the executor task touches drivers. The [`SpiBus`] trait hides the
//! hardware so the node can run against a simulated bus on machines
//! without `/dev/spidev` (and in tests).

use parking_lot::Mutex;
use rand::Rng;

use crate::drivers::receiver;
use crate::drivers::transmitter;

/// Bus abstraction: full-duplex transfer and plain reads.
pub trait SpiBus: Send + Sync {
    /// Write `tx` while capturing the same number of shifted-out bytes.
    fn transfer(&self, tx: &[u8]) -> std::result::Result<Vec<u8>, String>;

    /// Read `len` bytes while clocking out dummy data.
    fn read(&self, len: usize) -> std::result::Result<Vec<u8>, String>;

    /// Check if the bus is usable on this machine
    fn is_available(&self) -> bool;
}

/// Simulated bus used when no SPI hardware is present.
///
/// Behaves like a healthy carrier board: receiver reads return the
/// configured loop current (plus optional noise), transmitter status
/// reads return the configured status byte, and DAC code writes are
/// remembered so tests can observe the asserted current.
pub struct SimSpiBus {
    loop_ma: Mutex<f64>,
    noise_ma: Mutex<f64>,
    status_byte: Mutex<u8>,
    last_dac_code: Mutex<Option<u16>>,
}

/// Healthy DAC status: resolution bits read back as 7, no fault flags.
pub const STATUS_BYTE_OK: u8 = 0xE0;
/// Status byte with the current-loop fault flag raised.
pub const STATUS_BYTE_LOOP_FAULT: u8 = 0xE1;
/// Status byte of an unreachable chip (all zeros on the bus).
pub const STATUS_BYTE_DEAD: u8 = 0x00;

impl SimSpiBus {
    pub fn new() -> Self {
        Self {
            loop_ma: Mutex::new(4.0),
            noise_ma: Mutex::new(0.0),
            status_byte: Mutex::new(STATUS_BYTE_OK),
            last_dac_code: Mutex::new(None),
        }
    }

    /// Current presented to receiver modules.
    pub fn set_loop_ma(&self, ma: f64) {
        *self.loop_ma.lock() = ma;
    }

    /// Uniform noise amplitude added to each receiver sample.
    pub fn set_noise_ma(&self, ma: f64) {
        *self.noise_ma.lock() = ma;
    }

    /// Status byte returned to transmitter status reads.
    pub fn set_status_byte(&self, byte: u8) {
        *self.status_byte.lock() = byte;
    }

    /// DAC code most recently written by a transmitter, if any.
    pub fn last_dac_code(&self) -> Option<u16> {
        *self.last_dac_code.lock()
    }

    /// Current corresponding to the last DAC code write.
    pub fn last_write_ma(&self) -> Option<f64> {
        self.last_dac_code()
            .map(|code| f64::from(code) / 65536.0 * 24.0)
    }
}

impl Default for SimSpiBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SpiBus for SimSpiBus {
    fn transfer(&self, tx: &[u8]) -> std::result::Result<Vec<u8>, String> {
        if tx.len() != 3 {
            return Ok(vec![0; tx.len()]);
        }
        let reg = tx[0];
        if reg == transmitter::REG_DACCODE {
            let code = (u16::from(tx[1]) << 8) | u16::from(tx[2]);
            *self.last_dac_code.lock() = Some(code);
        }
        if reg == transmitter::REG_STATUS | transmitter::READ_PREFIX {
            return Ok(vec![tx[0], 0x00, *self.status_byte.lock()]);
        }
        Ok(vec![0; tx.len()])
    }

    fn read(&self, len: usize) -> std::result::Result<Vec<u8>, String> {
        if len != 2 {
            return Ok(vec![0; len]);
        }
        let noise = *self.noise_ma.lock();
        let mut ma = *self.loop_ma.lock();
        if noise > 0.0 {
            ma += rand::thread_rng().gen_range(-noise..=noise);
        }
        Ok(receiver::word_for_ma(ma).to_vec())
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Real SPI bus over `/dev/spidev` (Linux only).
#[cfg(feature = "spi-hw")]
pub struct SpidevBus {
    device: Mutex<spidev::Spidev>,
}

#[cfg(feature = "spi-hw")]
impl SpidevBus {
    /// Open and configure the bus device, e.g. `/dev/spidev0.0`.
    ///
    /// The built-in chip-select stays unused: modules are framed by
    /// GPIO chip-select pins so multi-byte words stay contiguous.
    pub fn open(path: &str, max_speed_hz: u32) -> std::io::Result<Self> {
        use spidev::{SpiModeFlags, Spidev, SpidevOptions};

        let mut device = Spidev::open(path)?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(max_speed_hz)
            .mode(SpiModeFlags::SPI_MODE_0 | SpiModeFlags::SPI_NO_CS)
            .build();
        device.configure(&options)?;
        Ok(Self {
            device: Mutex::new(device),
        })
    }
}

#[cfg(feature = "spi-hw")]
impl SpiBus for SpidevBus {
    fn transfer(&self, tx: &[u8]) -> std::result::Result<Vec<u8>, String> {
        use spidev::SpidevTransfer;

        let mut rx = vec![0u8; tx.len()];
        let mut transfer = SpidevTransfer::read_write(tx, &mut rx);
        self.device
            .lock()
            .transfer(&mut transfer)
            .map_err(|e| format!("SPI transfer failed: {e}"))?;
        Ok(rx)
    }

    fn read(&self, len: usize) -> std::result::Result<Vec<u8>, String> {
        use spidev::SpidevTransfer;

        let mut rx = vec![0u8; len];
        let mut transfer = SpidevTransfer::read(&mut rx);
        self.device
            .lock()
            .transfer(&mut transfer)
            .map_err(|e| format!("SPI read failed: {e}"))?;
        Ok(rx)
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_bus_presents_configured_current() {
        let bus = SimSpiBus::new();
        bus.set_loop_ma(12.0);
        let word = bus.read(2).unwrap();
        let ma = receiver::word_to_ma(&word).unwrap();
        assert!((ma - 12.0).abs() < 0.01, "got {ma}");
    }

    #[test]
    fn sim_bus_records_dac_writes() {
        let bus = SimSpiBus::new();
        let code: u16 = (12.0_f64 / 24.0 * 65536.0) as u16;
        bus.transfer(&[transmitter::REG_DACCODE, (code >> 8) as u8, code as u8])
            .unwrap();
        let asserted = bus.last_write_ma().unwrap();
        assert!((asserted - 12.0).abs() < 0.001);
    }

    #[test]
    fn sim_bus_answers_status_reads() {
        let bus = SimSpiBus::new();
        bus.set_status_byte(STATUS_BYTE_LOOP_FAULT);
        let resp = bus
            .transfer(&[
                transmitter::REG_STATUS | transmitter::READ_PREFIX,
                0xFF,
                0xFF,
            ])
            .unwrap();
        assert_eq!(resp[2], STATUS_BYTE_LOOP_FAULT);
    }
}
