use crate::adapter::{PaddleId, Particle, SensorMap, Step, Volume};
use crate::hit::Channel;
use crate::Positive;
use bon::bon;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Exp, Poisson};
use thiserror::Error;
use uom::si::f64::Time;
use uom::si::time::nanosecond;

/// Whatever delivers the steps of an event: a particle transport engine, a
/// replay of recorded steps, or a [`MuonSource`].
pub trait Transport {
    /// Returns all the steps of one event, in the order in which they reach
    /// the sensitive detectors. No particular time ordering is implied.
    fn transport(&mut self, event: u64) -> Vec<Step>;
}

impl<F> Transport for F
where
    F: FnMut(u64) -> Vec<Step>,
{
    fn transport(&mut self, event: u64) -> Vec<Step> {
        self(event)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid mean number of photons")]
    Photons(#[from] rand_distr::PoissonError),
    #[error("invalid scintillation decay time")]
    Decay(#[from] rand_distr::ExpError),
    #[error("{name} must be a probability, got {value}")]
    Probability { name: &'static str, value: f64 },
}

fn probability(name: &'static str, value: f64) -> Result<f64, SourceError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(SourceError::Probability { name, value })
    }
}

/// Synthetic transport environment for vertical cosmic muons.
///
/// Each event is a single muon that crosses the upper paddle, then the lower
/// paddle `flight_time` later. Every crossing emits a Poisson-distributed
/// number of scintillation photons, each delayed by an exponentially
/// distributed decay time, that reach the SiPM of the paddle. The steps of an
/// event are returned in random order.
#[derive(Clone, Debug)]
pub struct MuonSource<R> {
    rng: R,
    sensors: SensorMap,
    // `None` for dark runs: `Poisson` rejects a zero mean.
    photons: Option<Poisson<f64>>,
    // [`Time`] doesn't implement `num_traits::Float`, so decay times are
    // sampled in nanoseconds and converted afterwards.
    decay: Exp<f64>,
    flight_time: Time,
    entry_spread: Time,
    mu_plus_fraction: f64,
    stray_probability: f64,
}

#[bon]
impl<R: Rng> MuonSource<R> {
    #[builder]
    pub fn new(
        rng: R,
        #[builder(default)] sensors: SensorMap,
        /// Mean number of photons detected per paddle crossing. Zero is a
        /// dark run.
        mean_photons: f64,
        /// Scintillation decay time constant.
        decay_time: Positive,
        /// Time between the two paddle crossings.
        flight_time: Positive,
        /// Entry times into the upper paddle are uniform in
        /// `[0, entry_spread)`.
        entry_spread: Positive,
        /// Probability for the muon to be positive.
        #[builder(default = 0.545)]
        mu_plus_fraction: f64,
        /// Probability for the muon to also step through each SiPM.
        #[builder(default = 0.0)]
        stray_probability: f64,
    ) -> Result<Self, SourceError> {
        let rate = 1.0 / decay_time.inner().get::<nanosecond>();

        Ok(Self {
            rng,
            sensors,
            photons: (mean_photons != 0.0)
                .then(|| Poisson::new(mean_photons))
                .transpose()?,
            decay: Exp::new(rate)?,
            flight_time: flight_time.inner(),
            entry_spread: entry_spread.inner(),
            mu_plus_fraction: probability("mu_plus_fraction", mu_plus_fraction)?,
            stray_probability: probability("stray_probability", stray_probability)?,
        })
    }
}

impl<R: Rng> Transport for MuonSource<R> {
    fn transport(&mut self, _event: u64) -> Vec<Step> {
        let muon = if self.rng.random::<f64>() < self.mu_plus_fraction {
            Particle::MuonPlus
        } else {
            Particle::MuonMinus
        };
        let entry = self.entry_spread * self.rng.random::<f64>();

        let mut steps = Vec::new();
        for (paddle, channel) in Channel::ALL.into_iter().enumerate() {
            let crossing = entry + self.flight_time * paddle as f64;
            // `paddle < 2`.
            let paddle = PaddleId(paddle as u32);
            steps.push(Step {
                particle: muon,
                volume: Volume::Scintillator(paddle),
                time: crossing,
            });

            let sensor = self.sensors.sensor(channel);
            let n = match &self.photons {
                Some(photons) => photons.sample(&mut self.rng) as u64,
                None => 0,
            };
            for _ in 0..n {
                let delay = Time::new::<nanosecond>(self.decay.sample(&mut self.rng));
                steps.push(Step {
                    particle: Particle::OpticalPhoton,
                    volume: Volume::Sipm(sensor),
                    time: crossing + delay,
                });
            }

            if self.rng.random_bool(self.stray_probability) {
                steps.push(Step {
                    particle: muon,
                    volume: Volume::Sipm(sensor),
                    time: crossing,
                });
            }
        }
        steps.shuffle(&mut self.rng);

        steps
    }
}
