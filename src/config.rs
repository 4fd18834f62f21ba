//! Run configuration.
//!
//! A run is described by a TOML file. Every section and field has a default,
//! so an empty file describes a valid run:
//!
//! ```toml
//! events = 1000
//! workers = 4
//! seed = 7
//! output = "sipm.csv"
//! columns = "position,channel,hits,charge,peak"
//!
//! [response]
//! time_constant_ns = 1.0
//! window_ns = 100.0
//! sample_period_ns = 0.5
//!
//! [sensors]
//! upper = 0
//! lower = 1
//!
//! [source]
//! mean_photons = 40.0
//! decay_time_ns = 2.1
//! ```

use crate::adapter::SensorMap;
use crate::hit::SensorId;
use crate::schema::{self, Schema};
use crate::source::{MuonSource, SourceError};
use crate::synth::{waveform_len, Synthesizer, MAX_WAVEFORM_SAMPLES};
use crate::Positive;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uom::si::f64::Time;
use uom::si::time::nanosecond;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid output columns:\n{0}")]
    Columns(#[from] schema::ParseError),

    #[error("invalid muon source: {0}")]
    Source(#[from] SourceError),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Root of the configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of events to simulate.
    pub events: u64,
    /// Number of worker threads.
    pub workers: usize,
    /// Seed of the random number generators. Worker `w` uses `seed + w`.
    /// Without a seed every run is different.
    pub seed: Option<u64>,
    /// Output file. Rows go to stdout when absent.
    pub output: Option<PathBuf>,
    /// Comma-separated output columns.
    pub columns: String,
    /// Log progress every this many events.
    pub progress_interval: u64,
    pub response: ResponseConfig,
    pub sensors: SensorConfig,
    pub source: SourceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            events: 1000,
            workers: 1,
            seed: None,
            output: None,
            columns: Schema::default().to_string(),
            progress_interval: 1000,
            response: ResponseConfig::default(),
            sensors: SensorConfig::default(),
            source: SourceConfig::default(),
        }
    }
}

/// SiPM response and observation window.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResponseConfig {
    pub time_constant_ns: f64,
    pub window_ns: f64,
    /// Keep a sampled waveform in each summary.
    pub sample_period_ns: Option<f64>,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            time_constant_ns: 1.0,
            window_ns: 100.0,
            sample_period_ns: None,
        }
    }
}

/// Copy numbers of the SiPM volumes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensorConfig {
    pub upper: u32,
    pub lower: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self { upper: 0, lower: 1 }
    }
}

/// Parameters of the synthetic muon source.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub mean_photons: f64,
    pub decay_time_ns: f64,
    pub flight_time_ns: f64,
    pub entry_spread_ns: f64,
    pub mu_plus_fraction: f64,
    pub stray_probability: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            mean_photons: 40.0,
            decay_time_ns: 2.1,
            flight_time_ns: 1.0,
            entry_spread_ns: 10.0,
            mu_plus_fraction: 0.545,
            stray_probability: 0.0,
        }
    }
}

fn positive(name: &str, ns: f64) -> Result<Positive, ConfigError> {
    Positive::new(Time::new::<nanosecond>(ns)).ok_or_else(|| {
        ConfigError::Validation(format!("{name} must be positive, got {ns}"))
    })
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        content.parse()
    }

    /// Checks everything that can be checked without running.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Validation("workers must be at least 1".into()));
        }
        if self.progress_interval == 0 {
            return Err(ConfigError::Validation(
                "progress_interval must be at least 1".into(),
            ));
        }
        self.schema()?;
        self.synthesizer()?;
        // Distribution parameters are only checked by building a source.
        self.source(0)?;

        Ok(())
    }

    pub fn schema(&self) -> Result<Schema, ConfigError> {
        Ok(self.columns.parse()?)
    }

    pub fn synthesizer(&self) -> Result<Synthesizer, ConfigError> {
        let response = &self.response;
        let window = positive("response.window_ns", response.window_ns)?;
        let sample_period = response
            .sample_period_ns
            .map(|ns| positive("response.sample_period_ns", ns))
            .transpose()?;
        if let Some(period) = sample_period {
            let samples = waveform_len(window.inner(), period.inner());
            if samples > MAX_WAVEFORM_SAMPLES {
                return Err(ConfigError::Validation(format!(
                    "response.sample_period_ns gives {samples} samples per waveform, \
                     at most {MAX_WAVEFORM_SAMPLES} are allowed"
                )));
            }
        }

        Ok(Synthesizer::builder()
            .time_constant(positive("response.time_constant_ns", response.time_constant_ns)?)
            .window(window)
            .maybe_sample_period(sample_period)
            .build())
    }

    pub fn sensor_map(&self) -> Result<SensorMap, ConfigError> {
        SensorMap::new(SensorId(self.sensors.upper), SensorId(self.sensors.lower)).ok_or_else(
            || ConfigError::Validation("sensors.upper and sensors.lower must differ".into()),
        )
    }

    /// Muon source of worker `worker`.
    pub fn source(&self, worker: usize) -> Result<MuonSource<StdRng>, ConfigError> {
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(worker as u64)),
            None => StdRng::from_os_rng(),
        };
        let source = &self.source;

        Ok(MuonSource::builder()
            .rng(rng)
            .sensors(self.sensor_map()?)
            .mean_photons(source.mean_photons)
            .decay_time(positive("source.decay_time_ns", source.decay_time_ns)?)
            .flight_time(positive("source.flight_time_ns", source.flight_time_ns)?)
            .entry_spread(positive("source.entry_spread_ns", source.entry_spread_ns)?)
            .mu_plus_fraction(source.mu_plus_fraction)
            .stray_probability(source.stray_probability)
            .build()?)
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;

        Ok(config)
    }
}
