//! Readout simulation of a two-paddle cosmic muon detector.
//!
//! Optical photons reaching the two SiPMs of the detector are collected per
//! event, turned into a superposition of single-photoelectron responses, and
//! summarized into one row per event and channel of a shared output stream.
use crate::adapter::{MuonHit, RecordedEvent, Step};
use crate::hit::SipmHit;
use uom::si::f64::Time;

/// Sensitive detectors receiving steps from the transport environment.
pub mod adapter;
/// Loading of run configuration files.
pub mod config;
/// Photon arrivals at the SiPMs.
pub mod hit;
/// Single-photoelectron response.
pub mod kernel;
/// Event ledger shared by all workers.
pub mod ledger;
/// Multi-threaded event loop.
pub mod run;
/// Column layout of the output rows.
pub mod schema;
/// Synthetic transport environment.
pub mod source;
/// SiPM signal synthesis.
pub mod synth;

/// A strictly positive and finite [`Time`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Positive(Time);

impl Positive {
    /// Returns `None` unless `value` is finite and greater than zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use smallbox::Positive;
    /// use uom::si::f64::Time;
    /// use uom::si::time::nanosecond;
    ///
    /// assert!(Positive::new(Time::new::<nanosecond>(2.1)).is_some());
    /// assert!(Positive::new(Time::new::<nanosecond>(0.0)).is_none());
    /// ```
    pub fn new(value: Time) -> Option<Self> {
        (value.value.is_finite() && value.value > 0.0).then_some(Self(value))
    }

    pub fn inner(&self) -> Time {
        self.0
    }
}

/// A trait that defines the interface for an observer of a worker.
///
/// Every worker owns its own observer, so methods take `&mut self` and are
/// never called concurrently. The default implementation of all methods is a
/// no-op. Users are expected to override the methods they are interested in.
#[allow(unused_variables)]
pub trait Observer {
    /// Called when an optical photon is recorded by a SiPM.
    fn on_photon_hit(&mut self, hit: &SipmHit) {}
    /// Called when a step is discarded by a sensitive detector because of
    /// its particle.
    fn on_step_filtered(&mut self, step: &Step) {}
    /// Called when a muon crosses a scintillator paddle.
    fn on_muon_hit(&mut self, hit: &MuonHit) {}
    /// Called after an event has been written to the ledger.
    fn on_event_recorded(&mut self, event: &RecordedEvent) {}
}

impl Observer for () {}
