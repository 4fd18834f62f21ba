use crate::Positive;
use num_traits::Float;
use uom::si::f64::Time;
use uom::si::ratio::ratio;

/// Single-photoelectron response of a SiPM, `exp(-x)`, where `x` is the time
/// elapsed since the photon arrived in units of the decay time constant.
///
/// # Panics
///
/// Panics if `elapsed` is negative or NaN. A photon never contributes before
/// it arrives.
///
/// # Examples
///
/// ```
/// use smallbox::kernel::single_photoelectron_response;
///
/// assert_eq!(single_photoelectron_response(0.0f64), 1.0);
/// assert!((single_photoelectron_response(1.0f32) - 0.367_879_44).abs() < 1e-6);
/// ```
pub fn single_photoelectron_response<F: Float>(elapsed: F) -> F {
    assert!(
        elapsed >= F::zero(),
        "single-photoelectron response evaluated before the photon arrival"
    );
    (-elapsed).exp()
}

/// Exponentially decaying response with a configurable time constant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResponseKernel {
    time_constant: Positive,
}

impl ResponseKernel {
    pub fn new(time_constant: Positive) -> Self {
        Self { time_constant }
    }

    pub fn time_constant(&self) -> Time {
        self.time_constant.inner()
    }

    fn scaled(&self, elapsed: Time) -> f64 {
        (elapsed / self.time_constant.inner()).get::<ratio>()
    }

    /// Amplitude, in photoelectrons, of one photon's response `elapsed` after
    /// its arrival.
    ///
    /// # Panics
    ///
    /// Panics if `elapsed` is negative.
    pub fn response(&self, elapsed: Time) -> f64 {
        single_photoelectron_response(self.scaled(elapsed))
    }

    /// Integral of one photon's response from its arrival until `elapsed`
    /// later, i.e. `tau * (1 - exp(-elapsed / tau))`.
    ///
    /// # Panics
    ///
    /// Panics if `elapsed` is negative.
    pub fn charge(&self, elapsed: Time) -> Time {
        let remaining = single_photoelectron_response(self.scaled(elapsed));
        self.time_constant.inner() * (1.0 - remaining)
    }
}
