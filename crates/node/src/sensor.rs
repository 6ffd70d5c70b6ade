//! Moisture sensing: raw ADC values in, whole percentages out.

use anyhow::Result;

use crate::config::SensorSettings;

/// Soil moisture as a whole percentage, `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MoistureReading(u8);

impl MoistureReading {
    pub fn from_percent(percent: u8) -> Self {
        Self(percent.min(100))
    }

    /// Map a raw ADC value onto `0..=100` using the dry/wet endpoints.
    /// Readings past either endpoint clamp to it.
    pub fn from_raw(raw: i32, cal: Calibration) -> Self {
        let range = i64::from(cal.raw_dry) - i64::from(cal.raw_wet);
        if range == 0 {
            return Self(0);
        }
        let scaled = (i64::from(cal.raw_dry) - i64::from(raw)) * 100 / range;
        Self(scaled.clamp(0, 100) as u8)
    }

    pub fn percent(self) -> u8 {
        self.0
    }
}

/// Raw readings for bone-dry soil and for a saturated probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub raw_dry: i32,
    pub raw_wet: i32,
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

pub trait MoistureSource {
    fn read_raw(&mut self) -> Result<i32>;

    /// Tell the source whether the pump is running. Only the simulator cares.
    fn set_watering(&mut self, _on: bool) {}
}

#[cfg(feature = "adc")]
pub fn open(settings: &SensorSettings) -> Result<Box<dyn MoistureSource>> {
    let adc = crate::adc::Ads1115::new(settings.adc_address, settings.adc_channel)?;
    Ok(Box::new(adc))
}

#[cfg(all(feature = "sim", not(feature = "adc")))]
pub fn open(settings: &SensorSettings) -> Result<Box<dyn MoistureSource>> {
    use crate::sim::{Scenario, SoilMoistureSim};

    let scenario = Scenario::from_str_lossy(&settings.sim_scenario);
    tracing::info!(%scenario, "using simulated moisture sensor");
    Ok(Box::new(SoilMoistureSim::new(
        scenario,
        settings.raw_dry as f64,
        settings.raw_wet as f64,
    )))
}

#[cfg(not(any(feature = "sim", feature = "adc")))]
compile_error!("enable the `sim` or `adc` feature to select a moisture source");
