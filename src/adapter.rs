use crate::hit::{Channel, ChannelPair, HitCollection, SensorId, SipmHit};
use crate::ledger::{EventLedger, LedgerError, LedgerPosition, RecordSink};
use crate::synth::{SignalSummary, Synthesizer};
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace};
use uom::si::f64::Time;
use uom::si::time::nanosecond;

/// Particle species as reported by the transport environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Particle {
    OpticalPhoton,
    MuonPlus,
    MuonMinus,
    Electron,
    Positron,
    Gamma,
    /// Anything else, identified by its PDG code.
    Other(i32),
}

impl Particle {
    pub fn is_muon(self) -> bool {
        matches!(self, Particle::MuonPlus | Particle::MuonMinus)
    }
}

impl fmt::Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Particle::OpticalPhoton => write!(f, "opticalphoton"),
            Particle::MuonPlus => write!(f, "mu+"),
            Particle::MuonMinus => write!(f, "mu-"),
            Particle::Electron => write!(f, "e-"),
            Particle::Positron => write!(f, "e+"),
            Particle::Gamma => write!(f, "gamma"),
            Particle::Other(pdg) => write!(f, "pdg {pdg}"),
        }
    }
}

/// Copy number of a scintillator paddle volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PaddleId(pub u32);

/// The volume in which a step starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Volume {
    Sipm(SensorId),
    Scintillator(PaddleId),
    World,
}

/// A step of a particle through the detector, as delivered by the transport
/// environment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Step {
    pub particle: Particle,
    pub volume: Volume,
    /// Time of the pre-step point, measured from the start of the event.
    pub time: Time,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("step received outside of an event")]
    NoActiveEvent,
    #[error("event started while the previous one is still open")]
    EventInProgress,
    #[error("step in {0:?} delivered to the wrong sensitive detector")]
    UnexpectedVolume(Volume),
    #[error("{0} is not one of the SiPMs of the detector")]
    UnknownSensor(SensorId),
    #[error("invalid hit time {0} ns")]
    InvalidTime(f64),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// The callback protocol of a sensitive detector.
///
/// For every event the transport environment calls `on_event_start` once,
/// `on_step` any number of times, and `on_event_end` once. Calls are
/// synchronous and never re-entrant.
pub trait SensitiveDetector {
    type Hit;
    type Output;

    fn on_event_start(&mut self) -> Result<(), AdapterError>;
    /// Returns the hit created by the step, if any.
    fn on_step(&mut self, step: &Step) -> Result<Option<Self::Hit>, AdapterError>;
    fn on_event_end(&mut self) -> Result<Self::Output, AdapterError>;
}

/// Maps the copy numbers of the two SiPM volumes to their channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SensorMap {
    sensors: ChannelPair<SensorId>,
}

impl SensorMap {
    /// Returns `None` if both channels are given the same sensor.
    pub fn new(upper: SensorId, lower: SensorId) -> Option<Self> {
        (upper != lower).then_some(Self {
            sensors: ChannelPair { upper, lower },
        })
    }

    pub fn sensor(&self, channel: Channel) -> SensorId {
        *self.sensors.get(channel)
    }

    pub fn channel(&self, sensor: SensorId) -> Option<Channel> {
        self.sensors
            .iter()
            .find(|(_, s)| **s == sensor)
            .map(|(c, _)| c)
    }
}

impl Default for SensorMap {
    /// Upper channel on copy number 0, lower on 1.
    fn default() -> Self {
        Self {
            sensors: ChannelPair {
                upper: SensorId(0),
                lower: SensorId(1),
            },
        }
    }
}

/// An event after it went through the ledger.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub position: LedgerPosition,
    pub summaries: ChannelPair<SignalSummary>,
}

/// Sensitive detector of the SiPMs.
///
/// Collects the optical photons of an event, one [`HitCollection`] per
/// channel, and at the end of the event synthesizes both channels and
/// records them in the ledger.
#[derive(Debug)]
pub struct SipmSd<'r, S> {
    sensors: SensorMap,
    synthesizer: &'r Synthesizer,
    ledger: &'r EventLedger<S>,
    hits: Option<ChannelPair<HitCollection>>,
}

impl<'r, S> SipmSd<'r, S> {
    pub fn new(
        sensors: SensorMap,
        synthesizer: &'r Synthesizer,
        ledger: &'r EventLedger<S>,
    ) -> Self {
        Self {
            sensors,
            synthesizer,
            ledger,
            hits: None,
        }
    }
}

impl<S: RecordSink> SensitiveDetector for SipmSd<'_, S> {
    type Hit = SipmHit;
    type Output = RecordedEvent;

    fn on_event_start(&mut self) -> Result<(), AdapterError> {
        if self.hits.is_some() {
            return Err(AdapterError::EventInProgress);
        }
        self.hits = Some(ChannelPair::from_fn(HitCollection::new));

        Ok(())
    }

    fn on_step(&mut self, step: &Step) -> Result<Option<SipmHit>, AdapterError> {
        let hits = self.hits.as_mut().ok_or(AdapterError::NoActiveEvent)?;
        if step.particle != Particle::OpticalPhoton {
            trace!(particle = %step.particle, "ignoring step in SiPM");
            return Ok(None);
        }
        let Volume::Sipm(sensor) = step.volume else {
            return Err(AdapterError::UnexpectedVolume(step.volume));
        };
        let channel = self
            .sensors
            .channel(sensor)
            .ok_or(AdapterError::UnknownSensor(sensor))?;
        let hit = SipmHit::new(channel, sensor, step.time)
            .ok_or(AdapterError::InvalidTime(step.time.get::<nanosecond>()))?;

        hits.get_mut(channel).insert(hit);
        Ok(Some(hit))
    }

    fn on_event_end(&mut self) -> Result<RecordedEvent, AdapterError> {
        let hits = self.hits.take().ok_or(AdapterError::NoActiveEvent)?;
        let summaries = hits.map(|collection| self.synthesizer.synthesize(&collection));
        let position = self.ledger.record_event(&summaries)?;

        Ok(RecordedEvent {
            position,
            summaries,
        })
    }
}

/// A muon crossing a scintillator paddle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MuonHit {
    pub paddle: PaddleId,
    /// Either [`Particle::MuonPlus`] or [`Particle::MuonMinus`].
    pub particle: Particle,
    pub time: Time,
}

/// Sensitive detector of the scintillator paddles. Keeps track of the muons
/// crossing them.
#[derive(Debug, Default)]
pub struct ScintillatorSd {
    hits: Option<Vec<MuonHit>>,
}

impl ScintillatorSd {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SensitiveDetector for ScintillatorSd {
    type Hit = MuonHit;
    type Output = Vec<MuonHit>;

    fn on_event_start(&mut self) -> Result<(), AdapterError> {
        if self.hits.is_some() {
            return Err(AdapterError::EventInProgress);
        }
        self.hits = Some(Vec::new());

        Ok(())
    }

    fn on_step(&mut self, step: &Step) -> Result<Option<MuonHit>, AdapterError> {
        let hits = self.hits.as_mut().ok_or(AdapterError::NoActiveEvent)?;
        if !step.particle.is_muon() {
            return Ok(None);
        }
        let Volume::Scintillator(paddle) = step.volume else {
            return Err(AdapterError::UnexpectedVolume(step.volume));
        };

        let hit = MuonHit {
            paddle,
            particle: step.particle,
            time: step.time,
        };
        debug!(particle = %hit.particle, paddle = paddle.0, "muon hit scintillator");
        hits.push(hit);

        Ok(Some(hit))
    }

    fn on_event_end(&mut self) -> Result<Vec<MuonHit>, AdapterError> {
        self.hits.take().ok_or(AdapterError::NoActiveEvent)
    }
}
