//! ADS1115 16-bit ADC over I2C, read as a single moisture probe.
//!
//! Single-shot conversions at PGA ±4.096 V and 128 SPS. With a capacitive
//! probe on 3.3 V that gives roughly 26000 dry and 12000 wet.

use anyhow::{ensure, Result};
use rppal::i2c::I2c;
use std::{thread, time::Duration};

use crate::sensor::MoistureSource;

const REG_CONVERSION: u8 = 0x00;
const REG_CONFIG: u8 = 0x01;

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot), DR=100 (128 SPS),
/// COMP_QUE=11 (comparator off). MUX is OR-ed in per channel.
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// Single-ended MUX codes, AIN0..AIN3 against GND.
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];
const MUX_SHIFT: u8 = 12;

pub const MAX_CHANNEL: u8 = 3;

/// One conversion at 128 SPS takes ~7.8 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);
const OS_READY_BIT: u16 = 1 << 15;

fn config_for_channel(channel: u8) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[usize::from(channel)] << MUX_SHIFT)
}

pub struct Ads1115 {
    i2c: I2c,
    channel: u8,
}

impl Ads1115 {
    /// Open I2C bus 1 and address the converter at `addr`.
    pub fn new(addr: u16, channel: u8) -> Result<Self> {
        ensure!(
            channel <= MAX_CHANNEL,
            "ADS1115 channel {channel} out of range (0-{MAX_CHANNEL})"
        );

        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;

        tracing::info!(
            addr = format_args!("0x{addr:02x}"),
            channel,
            "ads1115 initialised"
        );

        Ok(Self { i2c, channel })
    }

    fn convert(&mut self) -> Result<i16> {
        self.i2c
            .block_write(REG_CONFIG, &config_for_channel(self.channel).to_be_bytes())?;
        thread::sleep(CONVERSION_WAIT);

        // One wait is normally enough; poll OS a few times before giving up on it.
        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }
}

impl MoistureSource for Ads1115 {
    fn read_raw(&mut self) -> Result<i32> {
        // Single-ended results are never negative unless the bus garbled them.
        Ok(i32::from(self.convert()?).clamp(0, 32767))
    }
}
