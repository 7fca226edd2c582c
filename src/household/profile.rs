//! Uncontrolled household load and solar production over the day.

use chrono::{NaiveDateTime, Timelike};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Position in the day in `[0, 1)`.
fn day_fraction(at: NaiveDateTime) -> f64 {
    f64::from(at.num_seconds_from_midnight()) / 86_400.0
}

/// Gaussian noise with mean 0 via the Box-Muller transform.
pub fn gaussian_noise(rng: &mut StdRng, std_dev: f64) -> f64 {
    if std_dev <= 0.0 {
        return 0.0;
    }

    let u1: f64 = rng.random::<f64>().clamp(1e-9, 1.0);
    let u2: f64 = rng.random::<f64>();
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    z0 * std_dev
}

/// Sinusoidal daily base load with Gaussian noise, never negative.
///
/// # Examples
///
/// ```
/// use chrono::NaiveDate;
/// use peak_guard::household::profile::BaseLoadProfile;
///
/// let mut load = BaseLoadProfile::new(600.0, 300.0, 0.0, 0.0, 42);
/// let midnight = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
/// assert_eq!(load.demand_w(midnight), 600.0);
/// ```
#[derive(Debug, Clone)]
pub struct BaseLoadProfile {
    /// Average demand (W).
    pub base_w: f64,
    /// Daily swing (W).
    pub amp_w: f64,
    /// Phase offset of the sinus (radians).
    pub phase_rad: f64,
    /// Noise standard deviation (W).
    pub noise_std_w: f64,
    rng: StdRng,
}

impl BaseLoadProfile {
    pub fn new(base_w: f64, amp_w: f64, phase_rad: f64, noise_std_w: f64, seed: u64) -> Self {
        Self {
            base_w,
            amp_w,
            phase_rad,
            noise_std_w: noise_std_w.max(0.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn demand_w(&mut self, at: NaiveDateTime) -> f64 {
        let angle = 2.0 * std::f64::consts::PI * day_fraction(at) + self.phase_rad;
        let noise = gaussian_noise(&mut self.rng, self.noise_std_w);
        (self.base_w + self.amp_w * angle.sin() + noise).max(0.0)
    }
}

/// Half-cosine solar production between sunrise and sunset.
#[derive(Debug, Clone)]
pub struct SolarProfile {
    /// Production at solar noon under a clear sky (W).
    pub peak_w: f64,
    /// Sunrise, hours since midnight.
    pub sunrise_hour: f64,
    /// Sunset, hours since midnight.
    pub sunset_hour: f64,
    /// Relative noise standard deviation (0.05 = ±5%).
    pub noise_std: f64,
    rng: StdRng,
}

impl SolarProfile {
    /// # Panics
    ///
    /// Panics if `sunrise_hour >= sunset_hour` or either is outside `[0, 24]`.
    pub fn new(
        peak_w: f64,
        sunrise_hour: f64,
        sunset_hour: f64,
        noise_std: f64,
        seed: u64,
    ) -> Self {
        assert!(sunrise_hour < sunset_hour);
        assert!((0.0..=24.0).contains(&sunrise_hour) && (0.0..=24.0).contains(&sunset_hour));

        Self {
            peak_w: peak_w.max(0.0),
            sunrise_hour,
            sunset_hour,
            noise_std: noise_std.max(0.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Fraction of peak production at `at`, 0 outside daylight.
    pub fn daylight_fraction(&self, at: NaiveDateTime) -> f64 {
        let hour = day_fraction(at) * 24.0;
        if hour < self.sunrise_hour || hour >= self.sunset_hour {
            return 0.0;
        }
        let x = (hour - self.sunrise_hour) / (self.sunset_hour - self.sunrise_hour);
        (std::f64::consts::PI * (x - 0.5)).cos().max(0.0)
    }

    /// Production in watts (positive).
    pub fn production_w(&mut self, at: NaiveDateTime) -> f64 {
        let frac = self.daylight_fraction(at);
        if frac <= 0.0 {
            return 0.0;
        }
        let noise = 1.0 + gaussian_noise(&mut self.rng, self.noise_std);
        (self.peak_w * frac * noise).max(0.0)
    }
}
