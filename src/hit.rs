use std::fmt;
use uom::si::f64::Time;

/// One of the two readout channels of the detector.
///
/// Channel `Upper` reads out the upper scintillator paddle, `Lower` the
/// lower one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Upper,
    Lower,
}

impl Channel {
    /// Both channels, in output order.
    pub const ALL: [Channel; 2] = [Channel::Upper, Channel::Lower];

    /// Index of the channel as written to the output rows.
    ///
    /// # Examples
    ///
    /// ```
    /// use smallbox::hit::Channel;
    ///
    /// assert_eq!(Channel::Upper.index(), 0);
    /// assert_eq!(Channel::Lower.index(), 1);
    /// ```
    pub fn index(self) -> usize {
        match self {
            Channel::Upper => 0,
            Channel::Lower => 1,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Upper => write!(f, "upper"),
            Channel::Lower => write!(f, "lower"),
        }
    }
}

/// Copy number of a physical SiPM volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SensorId(pub u32);

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sipm#{}", self.0)
    }
}

/// A value for each of the two channels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelPair<T> {
    pub upper: T,
    pub lower: T,
}

impl<T> ChannelPair<T> {
    /// Creates a pair by calling `f` once per channel, upper first.
    pub fn from_fn<F>(mut f: F) -> Self
    where
        F: FnMut(Channel) -> T,
    {
        Self {
            upper: f(Channel::Upper),
            lower: f(Channel::Lower),
        }
    }

    pub fn get(&self, channel: Channel) -> &T {
        match channel {
            Channel::Upper => &self.upper,
            Channel::Lower => &self.lower,
        }
    }

    pub fn get_mut(&mut self, channel: Channel) -> &mut T {
        match channel {
            Channel::Upper => &mut self.upper,
            Channel::Lower => &mut self.lower,
        }
    }

    /// Applies `f` to both values, upper first.
    pub fn map<U, F>(self, mut f: F) -> ChannelPair<U>
    where
        F: FnMut(T) -> U,
    {
        ChannelPair {
            upper: f(self.upper),
            lower: f(self.lower),
        }
    }

    /// Iterates over both values together with their channel, upper first.
    pub fn iter(&self) -> impl Iterator<Item = (Channel, &T)> {
        Channel::ALL.into_iter().map(move |c| (c, self.get(c)))
    }
}

/// A [`SipmHit`] represents a single optical photon reaching the sensitive
/// surface of a SiPM.
///
/// The time is measured from the start of the event that produced the photon
/// and is never negative.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SipmHit {
    channel: Channel,
    sensor: SensorId,
    time: Time,
}

impl SipmHit {
    /// Returns `None` if `time` is negative or not finite.
    pub fn new(channel: Channel, sensor: SensorId, time: Time) -> Option<Self> {
        (time.value.is_finite() && time.value >= 0.0).then_some(Self {
            channel,
            sensor,
            time,
        })
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn sensor(&self) -> SensorId {
        self.sensor
    }

    pub fn time(&self) -> Time {
        self.time
    }
}

/// The photons collected by one channel during one event.
#[derive(Clone, Debug, PartialEq)]
pub struct HitCollection {
    channel: Channel,
    hits: Vec<SipmHit>,
}

impl HitCollection {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            hits: Vec::new(),
        }
    }

    /// Adds a hit to the collection.
    ///
    /// # Panics
    ///
    /// Panics if the hit belongs to a different channel.
    pub fn insert(&mut self, hit: SipmHit) {
        assert_eq!(
            hit.channel, self.channel,
            "hit on {} inserted into the {} collection",
            hit.channel, self.channel
        );
        self.hits.push(hit);
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Hits in insertion order.
    pub fn hits(&self) -> &[SipmHit] {
        &self.hits
    }
}
