//! Stateful soil moisture simulator for running the node without hardware.
//!
//! One probe, modelled as a random walk with mean reversion plus slow
//! evaporation drift, ADC noise and the occasional spike. While the pump is
//! running the soil wets up, which closes the loop for auto mode.

use std::fmt;

use crate::sensor::MoistureSource;

/// Approximate N(0,1) with the Irwin-Hall method: twelve uniforms minus 6.
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

/// Simulation profiles, selected with `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries steadily. Crosses a 30% threshold within
    /// a few minutes at one sample per second.
    Drying,
    /// Hovers near the centre with little noise.
    Stable,
    /// Noisy probe with frequent spikes.
    Flaky,
    /// Starts near saturation and barely dries.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Drying => "drying",
            Self::Stable => "stable",
            Self::Flaky => "flaky",
            Self::Wet => "wet",
        })
    }
}

pub struct SoilMoistureSim {
    /// Current "true" soil state in ADC units.
    base: f64,
    /// +1.0 when drier soil reads higher, -1.0 for inverted probes.
    dry_dir: f64,
    lo: f64,
    hi: f64,
    center: f64,

    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    spike_prob: f32,
    spike_sigma: f64,

    watering: bool,
    wet_rate: f64,
}

impl SoilMoistureSim {
    pub fn new(scenario: Scenario, raw_dry: f64, raw_wet: f64) -> Self {
        let range = (raw_dry - raw_wet).abs();
        let dry_dir = if raw_dry >= raw_wet { 1.0 } else { -1.0 };

        // start_frac: 0.0 = saturated, 1.0 = bone dry
        let (drift, walk_sigma, mean_rev, noise_sigma, spike_prob, spike_sigma, start_frac) =
            match scenario {
                Scenario::Drying => (15.0, 150.0, 0.002, 80.0, 0.03_f32, 2000.0, 0.5),
                Scenario::Stable => (0.0, 60.0, 0.05, 40.0, 0.005, 1000.0, 0.5),
                Scenario::Flaky => (10.0, 250.0, 0.02, 200.0, 0.10, 3000.0, 0.5),
                Scenario::Wet => (3.0, 80.0, 0.02, 60.0, 0.02, 1500.0, 0.15),
            };

        let base = raw_wet + dry_dir * start_frac * range;

        Self {
            base,
            dry_dir,
            lo: raw_dry.min(raw_wet),
            hi: raw_dry.max(raw_wet),
            center: base,
            drift_per_sample: drift,
            walk_sigma,
            mean_reversion: mean_rev,
            noise_sigma,
            spike_prob,
            spike_sigma,
            watering: false,
            wet_rate: range * 0.02,
        }
    }

    /// Advance the model one step and return an ADC reading.
    pub fn sample(&mut self) -> i32 {
        let pull = self.mean_reversion * (self.center - self.base);
        let walk = gaussian(0.0, self.walk_sigma);
        let drift = self.dry_dir * self.drift_per_sample;
        let wet = if self.watering {
            -self.dry_dir * self.wet_rate
        } else {
            0.0
        };

        self.base = (self.base + drift + pull + walk + wet).clamp(self.lo - 500.0, self.hi + 500.0);

        let noise = gaussian(0.0, self.noise_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        // ADS1115 single-ended range
        (self.base + noise + spike).round().clamp(0.0, 32767.0) as i32
    }
}

impl MoistureSource for SoilMoistureSim {
    fn read_raw(&mut self) -> anyhow::Result<i32> {
        Ok(self.sample())
    }

    fn set_watering(&mut self, on: bool) {
        self.watering = on;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
