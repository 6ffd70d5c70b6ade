//! Pump relay output. The `gpio` feature drives a real BCM pin through
//! rppal; without it a mock keeps the state in memory and logs changes.

use anyhow::Result;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO relay (Raspberry Pi)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct Pump {
    pin: OutputPin,
    active_low: bool, // many relay boards switch on LOW
    on: bool,
}

#[cfg(feature = "gpio")]
impl Pump {
    /// Claim `pin` and drive it to the OFF level straight away.
    pub fn new(pin: u8, active_low: bool) -> Result<Self> {
        let pin = Gpio::new()?.get(pin)?.into_output();
        let mut pump = Self {
            pin,
            active_low,
            on: false,
        };
        pump.drive(false);
        info!(pin = pump.pin.pin(), active_low, "pump relay initialised");
        Ok(pump)
    }

    fn drive(&mut self, on: bool) {
        // active-low: LOW = ON; active-high: HIGH = ON
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
    }

    pub fn set(&mut self, on: bool) {
        self.drive(on);
        if self.on != on {
            info!(on, "pump {}", if on { "ON" } else { "OFF" });
        }
        self.on = on;
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct Pump {
    on: bool,
}

#[cfg(not(feature = "gpio"))]
impl Pump {
    pub fn new(pin: u8, _active_low: bool) -> Result<Self> {
        info!(pin, "[mock-gpio] pump relay registered (not wired)");
        Ok(Self { on: false })
    }

    pub fn set(&mut self, on: bool) {
        if self.on != on {
            info!(on, "[mock-gpio] pump {}", if on { "ON" } else { "OFF" });
        }
        self.on = on;
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}
