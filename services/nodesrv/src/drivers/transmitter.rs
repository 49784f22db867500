//! 4-20 mA transmitter module (DAC161S997-class loop DAC)
//!
//! Each register transaction is a 24-bit word (8-bit register address
//! followed by 16 bits of data) framed by the module's chip-select pin;
//! the built-in SPI chip-select would split the word, so framing is done
//! manually. Register map and status bit layout follow the chip
//! datasheet.

use std::sync::Arc;

use tracing::debug;

use crate::error::{NodeError, Result};
use crate::gpio::PinHandle;
use crate::spi::SpiBus;

pub(crate) const REG_NOP: u8 = 0x02;
pub(crate) const REG_DACCODE: u8 = 0x04;
pub(crate) const REG_ERR_CONFIG: u8 = 0x05;
pub(crate) const REG_ERR_LOW: u8 = 0x06;
pub(crate) const REG_RESET: u8 = 0x08;
pub(crate) const REG_STATUS: u8 = 0x09;
/// ORed onto the register address for read transactions.
pub(crate) const READ_PREFIX: u8 = 0x80;

/// 16 bits of dummy data used to flush register reads.
const DUMMY: u16 = 0xFFFF;
/// Magic word that returns all writable registers to defaults.
const RESET_WORD: u16 = 0xC33C;

// Status bit masks
const STATUS_DAC_RES_MASK: u8 = 0xE0;
const STATUS_ERRLVL_PIN_MASK: u8 = 0x10;
const STATUS_FERR_STS_MASK: u8 = 0x08;
const STATUS_SPI_TIMEOUT_ERR_MASK: u8 = 0x04;
const STATUS_LOOP_STS_MASK: u8 = 0x02;
const STATUS_CURR_LOOP_STS_MASK: u8 = 0x01;

/// DAC resolution readback expected from a reachable chip.
const DAC_RES_EXPECTED: u8 = 7;

/// Output current limits of the transmitter itself (wider than the
/// healthy 4-20 loop window).
const OUTPUT_RANGE_MIN_MA: f64 = 3.9;
const OUTPUT_RANGE_MAX_MA: f64 = 20.0;

/// Parsed 8-bit STATUS word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DacStatus {
    pub dac_res: u8,
    pub errlvl_pin: u8,
    pub frame_err: u8,
    pub spi_timeout_err: u8,
    pub loop_sts: u8,
    pub curr_loop_sts: u8,
}

impl DacStatus {
    pub fn from_status_byte(byte: u8) -> Self {
        Self {
            dac_res: (byte & STATUS_DAC_RES_MASK) >> 5,
            errlvl_pin: (byte & STATUS_ERRLVL_PIN_MASK) >> 4,
            frame_err: (byte & STATUS_FERR_STS_MASK) >> 3,
            spi_timeout_err: (byte & STATUS_SPI_TIMEOUT_ERR_MASK) >> 2,
            loop_sts: (byte & STATUS_LOOP_STS_MASK) >> 1,
            curr_loop_sts: byte & STATUS_CURR_LOOP_STS_MASK,
        }
    }

    /// A loop fault is being reported right now.
    pub fn loop_fault(&self) -> bool {
        self.curr_loop_sts == 1
    }

    /// The chip answered over SPI: its resolution bits read back as the
    /// datasheet constant.
    pub fn link_ok(&self) -> bool {
        self.dac_res == DAC_RES_EXPECTED
    }
}

/// Driver for one transmitter module.
pub struct CurrentTransmitter {
    cs: PinHandle,
    bus: Arc<dyn SpiBus>,
    status: DacStatus,
}

impl CurrentTransmitter {
    /// Bring up the module and configure it to hold its output
    /// indefinitely: without this the chip falls back to its error
    /// current when SPI traffic pauses between batches.
    pub fn new(cs: PinHandle, bus: Arc<dyn SpiBus>) -> Result<Self> {
        let mut transmitter = Self {
            cs,
            bus,
            status: DacStatus::default(),
        };
        transmitter.set_error_config(50, true, false, false, true, 100, true)?;
        Ok(transmitter)
    }

    /// Last status word read from the chip.
    pub fn status(&self) -> DacStatus {
        self.status
    }

    /// One 24-bit register transaction; returns the 3 bytes shifted out
    /// of the chip (the previous shift-register contents).
    fn write_data(&self, reg: u8, data: u16) -> Result<Vec<u8>> {
        let word = [reg, (data >> 8) as u8, data as u8];
        self.cs.select().map_err(NodeError::Driver)?;
        let resp = self.bus.transfer(&word);
        // Close the frame even when the transfer failed.
        self.cs.deselect().map_err(NodeError::Driver)?;
        resp.map_err(NodeError::Driver)
    }

    /// Assert a loop current.
    pub fn write_ma(&self, ma: f64) -> Result<()> {
        if !(OUTPUT_RANGE_MIN_MA..=OUTPUT_RANGE_MAX_MA).contains(&ma) {
            return Err(NodeError::OutOfRange(format!(
                "requested current of {ma} mA is outside the transmitter range on {}",
                self.cs.name()
            )));
        }
        self.write_data(REG_DACCODE, dac_code_for_ma(ma))?;
        debug!("asserted {:.3} mA on {}", ma, self.cs.name());
        Ok(())
    }

    /// Read and parse the STATUS register.
    ///
    /// Two transactions: the first shifts in the read command and moves
    /// the register contents into the FIFO, the second flushes them out.
    pub fn read_status(&mut self) -> Result<DacStatus> {
        self.write_data(REG_STATUS | READ_PREFIX, DUMMY)?;
        let contents = self.write_data(REG_STATUS | READ_PREFIX, DUMMY)?;
        let byte = *contents
            .last()
            .ok_or_else(|| NodeError::driver("empty status response"))?;
        self.status = DacStatus::from_status_byte(byte);
        Ok(self.status)
    }

    /// Keep-alive: tells the chip the SPI link is functioning.
    pub fn write_nop(&self) -> Result<()> {
        self.write_data(REG_NOP, DUMMY)?;
        Ok(())
    }

    /// Configure error behavior (retry loop timing, masking, SPI
    /// timeout). Times are quantized to the chip's 50 ms code steps and
    /// clipped to the 3-bit field.
    #[allow(clippy::too_many_arguments)]
    pub fn set_error_config(
        &mut self,
        retry_loop_time_ms: u32,
        enable_retry_loop: bool,
        mask_loop_err: bool,
        dis_loop_err_errb: bool,
        mask_spi_err: bool,
        spi_timeout_ms: u32,
        mask_spi_timeout: bool,
    ) -> Result<()> {
        let code_retry = ((retry_loop_time_ms / 50).saturating_sub(1)).min(7) as u16;
        let code_timeout = ((spi_timeout_ms / 50).saturating_sub(1)).min(7) as u16;

        let mut word: u16 = 0;
        word |= code_retry << 7;
        word |= u16::from(enable_retry_loop) << 6;
        word |= u16::from(mask_loop_err) << 5;
        word |= u16::from(dis_loop_err_errb) << 4;
        word |= code_timeout << 3;
        word |= u16::from(mask_spi_err) << 1;
        word |= u16::from(mask_spi_timeout);

        self.write_data(REG_ERR_CONFIG, word)?;
        Ok(())
    }

    /// Current asserted while the chip is in its error state. The chip
    /// accepts 0-12 mA here.
    pub fn set_err_low_current(&self, ma: f64) -> Result<()> {
        let code = (ma * 10.666).floor() as u16;
        self.write_data(REG_ERR_LOW, code << 8)?;
        Ok(())
    }

    /// Return all writable registers to their defaults.
    pub fn reset(&self) -> Result<()> {
        self.write_data(REG_RESET, RESET_WORD)?;
        self.write_nop()
    }

    /// Quiesce before pin release; a failed reset is not worth
    /// propagating during shutdown.
    pub fn close(&mut self) {
        if let Err(e) = self.reset() {
            debug!("transmitter reset on close failed: {e}");
        }
    }
}

/// DAC code for a current: `I_loop = 24 mA * code / 2^16`.
pub(crate) fn dac_code_for_ma(ma: f64) -> u16 {
    ((ma / 24.0) * 65536.0) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{GpioBackend, PinBank, SimGpioBackend};
    use crate::spi::{SimSpiBus, STATUS_BYTE_DEAD, STATUS_BYTE_LOOP_FAULT, STATUS_BYTE_OK};
    use loopsim_model::SignalKind;

    fn transmitter_with_bus() -> (CurrentTransmitter, Arc<SimSpiBus>) {
        let backend = Arc::new(SimGpioBackend::new());
        let bank = PinBank::new(backend as Arc<dyn GpioBackend>);
        let cs = bank.acquire("GPIO13", SignalKind::Ao).unwrap();
        let bus = Arc::new(SimSpiBus::new());
        let t = CurrentTransmitter::new(cs, bus.clone() as Arc<dyn SpiBus>).unwrap();
        (t, bus)
    }

    #[test]
    fn write_ma_asserts_the_expected_dac_code() {
        let (t, bus) = transmitter_with_bus();
        t.write_ma(12.0).unwrap();
        let asserted = bus.last_write_ma().unwrap();
        assert!((asserted - 12.0).abs() < 0.001);
    }

    #[test]
    fn out_of_range_current_is_refused() {
        let (t, _bus) = transmitter_with_bus();
        assert!(matches!(t.write_ma(25.0), Err(NodeError::OutOfRange(_))));
        assert!(matches!(t.write_ma(1.0), Err(NodeError::OutOfRange(_))));
    }

    #[test]
    fn healthy_status_parses_clean() {
        let (mut t, bus) = transmitter_with_bus();
        bus.set_status_byte(STATUS_BYTE_OK);
        let status = t.read_status().unwrap();
        assert!(status.link_ok());
        assert!(!status.loop_fault());
    }

    #[test]
    fn loop_fault_bit_is_detected() {
        let (mut t, bus) = transmitter_with_bus();
        bus.set_status_byte(STATUS_BYTE_LOOP_FAULT);
        let status = t.read_status().unwrap();
        assert!(status.loop_fault());
        assert!(status.link_ok());
    }

    #[test]
    fn dead_bus_fails_the_link_check() {
        let (mut t, bus) = transmitter_with_bus();
        bus.set_status_byte(STATUS_BYTE_DEAD);
        let status = t.read_status().unwrap();
        assert!(!status.link_ok());
    }

    #[test]
    fn status_byte_decomposition() {
        let status = DacStatus::from_status_byte(0b1110_0101);
        assert_eq!(status.dac_res, 7);
        assert_eq!(status.spi_timeout_err, 1);
        assert_eq!(status.curr_loop_sts, 1);
        assert_eq!(status.loop_sts, 0);
    }

    #[test]
    fn dac_code_scaling() {
        // Float-to-int casts saturate, so full scale clips to u16::MAX.
        assert_eq!(dac_code_for_ma(24.0), u16::MAX);
        assert_eq!(dac_code_for_ma(12.0), 32768);
    }
}
