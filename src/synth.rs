use crate::hit::{Channel, HitCollection};
use crate::kernel::ResponseKernel;
use crate::Positive;
use bon::bon;
use uom::si::f64::Time;
use uom::si::ratio::ratio;
use uom::si::time::second;

/// The response of a channel sampled at a fixed period, starting at the
/// beginning of the event.
#[derive(Clone, Debug, PartialEq)]
pub struct Waveform {
    pub period: Time,
    pub samples: Vec<f64>,
}

/// Per-event summary of the signal of one channel.
#[derive(Clone, Debug, PartialEq)]
pub struct SignalSummary {
    pub channel: Channel,
    /// Number of photons that reached the SiPM, including photons arriving
    /// after the observation window.
    pub hit_count: usize,
    /// Time integral of the response over the observation window.
    pub charge: Time,
    /// Maximum of the response, in photoelectrons.
    pub peak: f64,
    pub peak_time: Option<Time>,
    pub first_hit: Option<Time>,
    pub waveform: Option<Waveform>,
}

impl SignalSummary {
    /// The summary of a channel that saw no photons.
    pub fn empty(channel: Channel) -> Self {
        Self {
            channel,
            hit_count: 0,
            charge: Time::new::<second>(0.0),
            peak: 0.0,
            peak_time: None,
            first_hit: None,
            waveform: None,
        }
    }
}

/// Arrival times of one channel, sorted, together with the kernel that turns
/// them into a continuous response.
#[derive(Clone, Debug)]
pub struct PulseTrain {
    kernel: ResponseKernel,
    // Ascending. Equal times keep their insertion order.
    arrivals: Vec<Time>,
}

impl PulseTrain {
    fn new(kernel: ResponseKernel, hits: &HitCollection) -> Self {
        let mut arrivals: Vec<Time> = hits.hits().iter().map(|h| h.time()).collect();
        // `sort_by` is stable.
        arrivals.sort_by(|a, b| a.value.total_cmp(&b.value));

        Self { kernel, arrivals }
    }

    pub fn arrivals(&self) -> &[Time] {
        &self.arrivals
    }

    /// Superposition of the responses of every photon that arrived at or
    /// before `time`. Exactly zero before the first arrival.
    pub fn amplitude_at(&self, time: Time) -> f64 {
        let arrived = self.arrivals.partition_point(|&t| t <= time);
        self.arrivals[..arrived]
            .iter()
            .map(|&t| self.kernel.response(time - t))
            .sum()
    }

    /// Largest amplitude reached up to and including `end`, and when.
    ///
    /// Between arrivals the response only decays, so the maximum sits on an
    /// arrival. Sweeping over the sorted arrivals, the amplitude just after
    /// arrival `k` is the amplitude after `k - 1` decayed over the gap, plus
    /// one photoelectron.
    fn peak(&self, end: Time) -> Option<(f64, Time)> {
        let mut peak: Option<(f64, Time)> = None;
        let mut amplitude = 0.0;
        let mut previous: Option<Time> = None;

        for &t in self.arrivals.iter().take_while(|&&t| t <= end) {
            if let Some(p) = previous {
                amplitude *= self.kernel.response(t - p);
            }
            amplitude += 1.0;
            previous = Some(t);

            if peak.map_or(true, |(a, _)| amplitude > a) {
                peak = Some((amplitude, t));
            }
        }

        peak
    }

    /// Integral of the response from the start of the event until `end`.
    fn charge(&self, end: Time) -> Time {
        self.arrivals
            .iter()
            .take_while(|&&t| t <= end)
            .fold(Time::new::<second>(0.0), |acc, &t| acc + self.kernel.charge(end - t))
    }

    fn sample(&self, period: Time, end: Time) -> Waveform {
        let n = waveform_len(end, period).min(MAX_WAVEFORM_SAMPLES);
        let samples = (0..n)
            .map(|i| self.amplitude_at(period * i as f64))
            .collect();

        Waveform { period, samples }
    }
}

/// Longest waveform kept in a [`SignalSummary`]. Later samples are dropped.
pub const MAX_WAVEFORM_SAMPLES: usize = 1 << 20;

/// Number of samples at `0, period, 2 * period, ...` up to and including
/// `end`. Saturates at `usize::MAX`.
pub fn waveform_len(end: Time, period: Time) -> usize {
    ((end / period).get::<ratio>().floor() as usize).saturating_add(1)
}

/// Turns the photons collected by a channel during an event into a
/// [`SignalSummary`].
///
/// The response is observed over the window `[0, window]` of event time.
#[derive(Clone, Copy, Debug)]
pub struct Synthesizer {
    kernel: ResponseKernel,
    window: Positive,
    sample_period: Option<Positive>,
}

#[bon]
impl Synthesizer {
    #[builder]
    pub fn new(
        time_constant: Positive,
        window: Positive,
        /// Keep the response sampled at this period, truncated to
        /// [`MAX_WAVEFORM_SAMPLES`].
        sample_period: Option<Positive>,
    ) -> Self {
        Self {
            kernel: ResponseKernel::new(time_constant),
            window,
            sample_period,
        }
    }
}

impl Synthesizer {
    pub fn kernel(&self) -> &ResponseKernel {
        &self.kernel
    }

    pub fn window(&self) -> Time {
        self.window.inner()
    }

    /// Sorts the hits of a collection by arrival time.
    pub fn pulse_train(&self, hits: &HitCollection) -> PulseTrain {
        PulseTrain::new(self.kernel, hits)
    }

    /// Computes the summary of one channel for one event.
    ///
    /// The result only depends on the arrival times in the collection, not on
    /// the order in which they were inserted. An empty collection produces
    /// [`SignalSummary::empty`].
    ///
    /// # Examples
    ///
    /// ```
    /// use smallbox::hit::{Channel, HitCollection, SensorId, SipmHit};
    /// use smallbox::synth::Synthesizer;
    /// use smallbox::Positive;
    /// use uom::si::f64::Time;
    /// use uom::si::time::nanosecond;
    ///
    /// let ns = |t| Time::new::<nanosecond>(t);
    /// let synthesizer = Synthesizer::builder()
    ///     .time_constant(Positive::new(ns(1.0)).unwrap())
    ///     .window(Positive::new(ns(10.0)).unwrap())
    ///     .build();
    ///
    /// let mut hits = HitCollection::new(Channel::Upper);
    /// hits.insert(SipmHit::new(Channel::Upper, SensorId(0), ns(2.0)).unwrap());
    ///
    /// let summary = synthesizer.synthesize(&hits);
    /// assert_eq!(summary.hit_count, 1);
    /// assert_eq!(summary.peak, 1.0);
    /// ```
    pub fn synthesize(&self, hits: &HitCollection) -> SignalSummary {
        if hits.is_empty() {
            return SignalSummary::empty(hits.channel());
        }

        let train = self.pulse_train(hits);
        let end = self.window.inner();
        let (peak, peak_time) = match train.peak(end) {
            Some((amplitude, time)) => (amplitude, Some(time)),
            None => (0.0, None),
        };

        SignalSummary {
            channel: hits.channel(),
            hit_count: hits.len(),
            charge: train.charge(end),
            peak,
            peak_time,
            first_hit: train.arrivals.first().copied(),
            waveform: self
                .sample_period
                .map(|period| train.sample(period.inner(), end)),
        }
    }
}
