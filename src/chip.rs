//! SX1262 command-level control.
//!
//! Wraps the subset of the datasheet's command set this link layer needs,
//! following the teacher's `configure.rs`/`eratta.rs` register-sequencing
//! style, and the original firmware's `SX1262_Ext.cpp` for the
//! output-power override and the raw IRQ-status read.

use crate::config::RadioConfig;
use crate::errors::LinkError;
use crate::hal::Hal;

// DS opcodes this crate issues. Only the subset `begin`/`transmit`/`receive`
// touch; the full command set is out of this link layer's scope.
#[allow(dead_code)]
mod opcode {
    pub const SET_STANDBY: u8 = 0x80;
    pub const SET_RF_FREQUENCY: u8 = 0x86;
    pub const SET_PACKET_TYPE: u8 = 0x8A;
    pub const SET_MODULATION_PARAMS: u8 = 0x8B;
    pub const SET_PACKET_PARAMS: u8 = 0x8C;
    pub const SET_TX_PARAMS: u8 = 0x8E;
    pub const SET_BUFFER_BASE_ADDRESS: u8 = 0x8F;
    pub const SET_PA_CONFIG: u8 = 0x95;
    pub const SET_SYNC_WORD: u8 = 0x0D; // write-register, sync word at 0x0740
    pub const SET_DIO_IRQ_PARAMS: u8 = 0x08;
    pub const CLEAR_IRQ_STATUS: u8 = 0x02;
    pub const GET_IRQ_STATUS: u8 = 0x12;
    pub const SET_RX: u8 = 0x82;
    pub const SET_TX: u8 = 0x83;
    pub const SET_CAD: u8 = 0xC5;
    pub const GET_RX_BUFFER_STATUS: u8 = 0x13;
    pub const WRITE_BUFFER: u8 = 0x0E;
    pub const READ_BUFFER: u8 = 0x1E;
    pub const GET_STATUS: u8 = 0xC0;
}

/// IRQ bit positions this crate cares about (DS table 13-42).
pub mod irq {
    pub const TX_DONE: u16 = 1 << 0;
    pub const RX_DONE: u16 = 1 << 1;
    pub const PREAMBLE_DETECTED: u16 = 1 << 2;
    pub const HEADER_VALID: u16 = 1 << 4;
    pub const HEADER_ERR: u16 = 1 << 5;
    pub const CRC_ERR: u16 = 1 << 6;
    pub const CAD_DONE: u16 = 1 << 7;
    pub const CAD_DETECTED: u16 = 1 << 8;
    pub const TIMEOUT: u16 = 1 << 9;
}

const STANDBY_RC: u8 = 0x00;
const RAMP_200U: u8 = 0x04;
const PACKET_TYPE_LORA: u8 = 0x01;
const MAX_LORA_PACKET: usize = 255;

/// Thin command-level wrapper over a [`Hal`]; owns no buffering beyond the
/// scratch space callers pass in.
pub struct ChipRadio<H: Hal> {
    hal: H,
}

impl<H: Hal> ChipRadio<H> {
    pub fn new(hal: H) -> Self {
        Self { hal }
    }

    fn command(&mut self, opcode: u8, params: &[u8]) -> Result<(), LinkError> {
        self.wait_on_busy()?;
        let mut buf = [0u8; 16];
        buf[0] = opcode;
        buf[1..1 + params.len()].copy_from_slice(params);
        self.hal
            .spi_transfer(&mut buf[..1 + params.len()])
            .map_err(|_| LinkError::Spi)
    }

    fn wait_on_busy(&mut self) -> Result<(), LinkError> {
        const MAX_ITERS: u32 = 10_000;
        for _ in 0..MAX_ITERS {
            if !self.hal.read_busy() {
                return Ok(());
            }
            self.hal.delay_us(1);
        }
        Err(LinkError::BusyTimeout)
    }

    /// Full init sequence: standby, LoRa packet type, RF params, then the
    /// power-override path from the original's `SX1262_Ext::begin`.
    pub fn begin(&mut self, config: &RadioConfig) -> Result<(), LinkError> {
        self.hal.set_reset(false);
        self.hal.delay_ms(1);
        self.hal.set_reset(true);
        self.hal.delay_ms(5);

        self.command(opcode::SET_STANDBY, &[STANDBY_RC])?;
        self.command(opcode::SET_PACKET_TYPE, &[PACKET_TYPE_LORA])?;
        self.command(opcode::SET_BUFFER_BASE_ADDRESS, &[0x00, 0x00])?;
        self.set_rf_frequency(config.freq_mhz)?;
        self.set_modulation_params(config.spreading_factor, config.bw_khz, config.coding_rate)?;
        self.set_sync_word(config.sync_word)?;
        self.set_output_power_optimized(config.power_dbm, config.pa_duty, config.hp_max)?;
        // Max-size payload params so the chip can receive before the first
        // transmit (which re-sets this per frame) has run.
        self.set_packet_params(config.preamble_length, MAX_LORA_PACKET as u8)?;

        Ok(())
    }

    /// Writes `data` into the chip's TX buffer starting at offset 0, the
    /// base address fixed by `begin`'s `SetBufferBaseAddress` call.
    pub fn write_buffer(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.wait_on_busy()?;
        let mut header = [opcode::WRITE_BUFFER, 0x00];
        self.hal.spi_transfer(&mut header).map_err(|_| LinkError::Spi)?;
        let mut payload = [0u8; MAX_LORA_PACKET];
        payload[..data.len()].copy_from_slice(data);
        self.hal
            .spi_transfer(&mut payload[..data.len()])
            .map_err(|_| LinkError::Spi)
    }

    fn set_rf_frequency(&mut self, freq_mhz: f32) -> Result<(), LinkError> {
        // DS 13.4.1: freq register = freq_hz * 2^25 / 32e6.
        let raw = ((freq_mhz * 1_000_000.0) * (1u64 << 25) as f32 / 32_000_000.0) as u32;
        self.command(opcode::SET_RF_FREQUENCY, &raw.to_be_bytes())
    }

    fn set_modulation_params(&mut self, sf: u8, bw_khz: f32, cr: u8) -> Result<(), LinkError> {
        let bw_code = bw_code_for_khz(bw_khz);
        self.command(opcode::SET_MODULATION_PARAMS, &[sf, bw_code, cr, 0])
    }

    fn set_sync_word(&mut self, sync_word: u8) -> Result<(), LinkError> {
        self.command(opcode::SET_SYNC_WORD, &[0x07, 0x40, sync_word])
    }

    /// DS 13.4.7/13.4.8 override path, following the original's
    /// `setOutputPowerOptimized`: PA config with a fixed LUT selection, then
    /// TX params with a 200µs ramp, bypassing any library default ramp time.
    pub fn set_output_power_optimized(
        &mut self,
        power_dbm: i8,
        pa_duty: u8,
        hp_max: u8,
    ) -> Result<(), LinkError> {
        const DEVICE_SEL_SX1262: u8 = 0x00;
        const PA_LUT: u8 = 0x01;
        self.command(
            opcode::SET_PA_CONFIG,
            &[pa_duty, hp_max, DEVICE_SEL_SX1262, PA_LUT],
        )?;
        self.command(opcode::SET_TX_PARAMS, &[power_dbm as u8, RAMP_200U])
    }

    pub fn set_packet_params(&mut self, preamble_len: u16, payload_len: u8) -> Result<(), LinkError> {
        let [pl_hi, pl_lo] = preamble_len.to_be_bytes();
        const HEADER_EXPLICIT: u8 = 0x00;
        const CRC_ON: u8 = 0x01;
        const IQ_STANDARD: u8 = 0x00;
        self.command(
            opcode::SET_PACKET_PARAMS,
            &[pl_hi, pl_lo, HEADER_EXPLICIT, payload_len, CRC_ON, IQ_STANDARD],
        )
    }

    pub fn set_dio_irq_params(&mut self, mask: u16) -> Result<(), LinkError> {
        let [hi, lo] = mask.to_be_bytes();
        self.command(opcode::SET_DIO_IRQ_PARAMS, &[hi, lo, hi, lo, 0, 0, 0, 0])
    }

    pub fn clear_irq_flags(&mut self, mask: u16) -> Result<(), LinkError> {
        let [hi, lo] = mask.to_be_bytes();
        self.command(opcode::CLEAR_IRQ_STATUS, &[hi, lo])
    }

    /// Raw big-endian IRQ status read, mirroring the original's
    /// `getIrqFlagsSafe` (a direct SPI transaction rather than a decoded
    /// status struct, so a crashed link in the middle of a transaction
    /// can't desync the higher-level decode).
    pub fn get_irq_flags_safe(&mut self) -> Result<u16, LinkError> {
        self.wait_on_busy()?;
        let mut buf = [opcode::GET_IRQ_STATUS, 0, 0, 0];
        self.hal.spi_transfer(&mut buf).map_err(|_| LinkError::Spi)?;
        Ok(u16::from_be_bytes([buf[2], buf[3]]))
    }

    pub fn start_receive(&mut self, timeout: RxTimeout) -> Result<(), LinkError> {
        self.set_dio_irq_params(irq::RX_DONE | irq::CRC_ERR | irq::TIMEOUT)?;
        self.command(opcode::SET_RX, &timeout.to_bytes())
    }

    pub fn start_transmit(&mut self, timeout_ms: u32) -> Result<(), LinkError> {
        self.set_dio_irq_params(irq::TX_DONE | irq::TIMEOUT)?;
        let ticks = (timeout_ms * 1000 / 61) & 0x00FF_FFFF; // 15.625us steps
        self.command(opcode::SET_TX, &ticks.to_be_bytes()[1..])
    }

    /// Performs a CAD (channel-activity-detection) scan, used by the
    /// driver's Listen-Before-Talk gate. Issues `SetCad`, then polls the IRQ
    /// status until `CAD_DONE` latches (the chip itself decides when the
    /// scan finishes; there's no fixed scan duration to sleep for), and
    /// returns whether `CAD_DETECTED` came with it.
    pub fn scan_channel(&mut self) -> Result<bool, LinkError> {
        const MAX_ITERS: u32 = 2_000;

        self.set_dio_irq_params(irq::CAD_DONE | irq::CAD_DETECTED)?;
        self.command(opcode::SET_CAD, &[])?;

        for _ in 0..MAX_ITERS {
            let flags = self.get_irq_flags_safe()?;
            if flags & irq::CAD_DONE != 0 {
                self.clear_irq_flags(flags)?;
                return Ok(flags & irq::CAD_DETECTED != 0);
            }
            self.hal.delay_us(100);
        }
        Err(LinkError::BusyTimeout)
    }

    pub fn get_rx_buffer_status(&mut self) -> Result<(u8, u8), LinkError> {
        self.wait_on_busy()?;
        let mut buf = [opcode::GET_RX_BUFFER_STATUS, 0, 0, 0];
        self.hal.spi_transfer(&mut buf).map_err(|_| LinkError::Spi)?;
        Ok((buf[2], buf[3])) // (payload_len, rx_start_buf_pointer)
    }

    pub fn read_buffer(&mut self, start: u8, out: &mut [u8]) -> Result<(), LinkError> {
        self.wait_on_busy()?;
        let mut header = [opcode::READ_BUFFER, start, 0];
        self.hal.spi_transfer(&mut header).map_err(|_| LinkError::Spi)?;
        self.hal.spi_transfer(out).map_err(|_| LinkError::Spi)
    }

    pub fn micros(&mut self) -> u32 {
        self.hal.micros()
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.hal.delay_ms(ms);
    }

    pub fn enable_dio1_interrupt(&mut self) {
        self.hal.enable_dio1_interrupt();
    }

    pub fn disable_dio1_interrupt(&mut self) {
        self.hal.disable_dio1_interrupt();
    }

    pub fn read_dio1(&mut self) -> bool {
        self.hal.read_dio1()
    }
}

/// SX1262 RX timeout encoding: continuous, single-shot, or a bounded number
/// of 15.625µs ticks.
#[allow(dead_code)]
pub enum RxTimeout {
    Continuous,
    Single,
    Ticks(u32),
}

impl RxTimeout {
    fn to_bytes(&self) -> [u8; 3] {
        let ticks: u32 = match self {
            RxTimeout::Continuous => 0xFFFFFF,
            RxTimeout::Single => 0x000000,
            RxTimeout::Ticks(t) => *t & 0x00FF_FFFF,
        };
        let b = ticks.to_be_bytes();
        [b[1], b[2], b[3]]
    }
}

fn bw_code_for_khz(bw_khz: f32) -> u8 {
    if bw_khz <= 7.8 {
        0x00
    } else if bw_khz <= 15.6 {
        0x08
    } else if bw_khz <= 31.25 {
        0x01
    } else if bw_khz <= 62.5 {
        0x02
    } else if bw_khz <= 125.0 {
        0x03
    } else if bw_khz <= 250.0 {
        0x04
    } else {
        0x05
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    #[test]
    fn bandwidth_code_picks_250khz() {
        assert_eq!(bw_code_for_khz(250.0), 0x04);
    }

    #[test]
    fn rx_timeout_continuous_encodes_all_ones() {
        assert_eq!(RxTimeout::Continuous.to_bytes(), [0xFF, 0xFF, 0xFF]);
    }

    /// Answers `GET_IRQ_STATUS` with a scripted sequence of flag words and
    /// succeeds every other command, so `scan_channel`'s polling loop can be
    /// exercised without real hardware.
    struct ScriptedHal(VecDeque<u16>);

    impl Hal for ScriptedHal {
        fn set_reset(&mut self, _high: bool) {}
        fn read_busy(&mut self) -> bool {
            false
        }
        fn read_dio1(&mut self) -> bool {
            false
        }
        fn enable_dio1_interrupt(&mut self) {}
        fn disable_dio1_interrupt(&mut self) {}
        fn spi_transfer(&mut self, buf: &mut [u8]) -> Result<(), ()> {
            if buf[0] == opcode::GET_IRQ_STATUS && buf.len() >= 4 {
                let [hi, lo] = self.0.pop_front().unwrap_or(0).to_be_bytes();
                buf[2] = hi;
                buf[3] = lo;
            }
            Ok(())
        }
        fn delay_us(&mut self, _us: u32) {}
        fn delay_ms(&mut self, _ms: u32) {}
        fn micros(&mut self) -> u32 {
            0
        }
    }

    #[test]
    fn scan_channel_polls_until_cad_done_then_reports_detection() {
        let mut radio = ChipRadio::new(ScriptedHal(
            [0, 0, irq::CAD_DONE | irq::CAD_DETECTED].into_iter().collect(),
        ));
        assert_eq!(radio.scan_channel().unwrap(), true);
    }

    #[test]
    fn scan_channel_reports_clear_channel() {
        let mut radio = ChipRadio::new(ScriptedHal([irq::CAD_DONE].into_iter().collect()));
        assert_eq!(radio.scan_channel().unwrap(), false);
    }
}
