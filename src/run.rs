use crate::adapter::{
    AdapterError, RecordedEvent, ScintillatorSd, SensitiveDetector, SensorMap, SipmSd, Volume,
};
use crate::ledger::{EventLedger, LedgerError, RecordSink};
use crate::source::Transport;
use crate::synth::Synthesizer;
use crate::Observer;
use bon::bon;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use thiserror::Error;
use tracing::{debug, debug_span, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("the run has no workers")]
    NoWorkers,
    #[error("event {event} failed on worker {worker}")]
    Event {
        worker: usize,
        event: u64,
        #[source]
        source: AdapterError,
    },
    #[error("failed to finish the output")]
    Ledger(#[from] LedgerError),
}

impl RunError {
    // Workers that find the ledger already halted only report the
    // consequence of another worker's failure.
    fn is_halted_ledger(&self) -> bool {
        matches!(
            self,
            RunError::Event {
                source: AdapterError::Ledger(LedgerError::Halted),
                ..
            }
        )
    }
}

/// What a worker did during a run.
#[derive(Debug)]
pub struct WorkerReport<O> {
    pub worker: usize,
    pub events: u64,
    pub photons: u64,
    pub filtered_steps: u64,
    pub muon_hits: u64,
    pub observer: O,
}

/// Result of a successful run.
#[derive(Debug)]
pub struct RunOutput<S, O> {
    /// The ledger's sink, flushed.
    pub sink: S,
    /// Number of events written to the sink.
    pub recorded: u64,
    /// One report per worker, ordered by worker index.
    pub workers: Vec<WorkerReport<O>>,
}

/// A simulation run: a fixed number of events distributed over worker
/// threads that all record into the same [`EventLedger`].
pub struct Run<S> {
    events: u64,
    workers: usize,
    synthesizer: Synthesizer,
    sensors: SensorMap,
    ledger: EventLedger<S>,
    progress_interval: u64,
}

#[bon]
impl<S> Run<S> {
    #[builder]
    pub fn new(
        events: u64,
        #[builder(default = 1)] workers: usize,
        synthesizer: Synthesizer,
        #[builder(default)] sensors: SensorMap,
        ledger: EventLedger<S>,
        /// Log progress every time this many events have been recorded.
        #[builder(default = 1000)]
        progress_interval: u64,
    ) -> Self {
        Self {
            events,
            workers,
            synthesizer,
            sensors,
            ledger,
            progress_interval,
        }
    }
}

impl<S> Run<S>
where
    S: RecordSink + Send,
{
    /// Runs all the events. Worker `w` gets its transport environment from
    /// `transport(w)`.
    pub fn run<T, F>(self, transport: F) -> Result<RunOutput<S, ()>, RunError>
    where
        T: Transport,
        F: Fn(usize) -> T + Sync,
    {
        self.run_observed(transport, |_| ())
    }

    /// Same as [`Run::run`], but worker `w` also reports to the observer
    /// returned by `observer(w)`.
    ///
    /// Events are handed out one at a time to whichever worker is free. Once
    /// an event has started it always runs to completion. If any event fails,
    /// the other workers stop at their next event boundary and the error that
    /// stopped the run is returned.
    pub fn run_observed<T, F, O, G>(
        self,
        transport: F,
        observer: G,
    ) -> Result<RunOutput<S, O>, RunError>
    where
        T: Transport,
        F: Fn(usize) -> T + Sync,
        O: Observer + Send,
        G: Fn(usize) -> O + Sync,
    {
        if self.workers == 0 {
            return Err(RunError::NoWorkers);
        }
        info!(events = self.events, workers = self.workers, "starting run");

        let next_event = AtomicU64::new(0);
        let halt = AtomicBool::new(false);
        let results: Vec<Result<WorkerReport<O>, RunError>> = thread::scope(|s| {
            let handles: Vec<_> = (0..self.workers)
                .map(|worker| {
                    let (this, next_event, halt) = (&self, &next_event, &halt);
                    let (transport, observer) = (&transport, &observer);
                    s.spawn(move || {
                        this.work(worker, transport(worker), observer(worker), next_event, halt)
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        });

        let mut workers = Vec::with_capacity(results.len());
        let mut failure: Option<RunError> = None;
        for result in results {
            match result {
                Ok(report) => workers.push(report),
                Err(e) if failure.as_ref().map_or(true, RunError::is_halted_ledger) => {
                    failure = Some(e)
                }
                Err(_) => {}
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        let recorded = self.ledger.recorded();
        let sink = self.ledger.finish()?;
        info!(recorded, "run finished");

        Ok(RunOutput {
            sink,
            recorded,
            workers,
        })
    }

    fn work<T, O>(
        &self,
        worker: usize,
        mut transport: T,
        observer: O,
        next_event: &AtomicU64,
        halt: &AtomicBool,
    ) -> Result<WorkerReport<O>, RunError>
    where
        T: Transport,
        O: Observer,
    {
        let mut sipm = SipmSd::new(self.sensors, &self.synthesizer, &self.ledger);
        let mut scintillator = ScintillatorSd::new();
        let mut report = WorkerReport {
            worker,
            events: 0,
            photons: 0,
            filtered_steps: 0,
            muon_hits: 0,
            observer,
        };

        while !halt.load(Ordering::Acquire) {
            let event = next_event.fetch_add(1, Ordering::Relaxed);
            if event >= self.events {
                break;
            }
            let _span = debug_span!("event", worker, event).entered();

            let recorded = self
                .process(&mut transport, event, &mut sipm, &mut scintillator, &mut report)
                .map_err(|source| {
                    halt.store(true, Ordering::Release);
                    warn!(error = %source, "event failed, stopping the run");
                    RunError::Event {
                        worker,
                        event,
                        source,
                    }
                })?;
            report.events += 1;
            report.observer.on_event_recorded(&recorded);

            if (recorded.position.get() + 1) % self.progress_interval.max(1) == 0 {
                info!(recorded = self.ledger.recorded(), total = self.events, "progress");
            }
        }
        debug!(worker, events = report.events, "worker done");

        Ok(report)
    }

    fn process<T, O>(
        &self,
        transport: &mut T,
        event: u64,
        sipm: &mut SipmSd<'_, S>,
        scintillator: &mut ScintillatorSd,
        report: &mut WorkerReport<O>,
    ) -> Result<RecordedEvent, AdapterError>
    where
        T: Transport,
        O: Observer,
    {
        sipm.on_event_start()?;
        scintillator.on_event_start()?;

        for step in transport.transport(event) {
            match step.volume {
                Volume::Sipm(_) => match sipm.on_step(&step)? {
                    Some(hit) => {
                        report.photons += 1;
                        report.observer.on_photon_hit(&hit);
                    }
                    None => {
                        report.filtered_steps += 1;
                        report.observer.on_step_filtered(&step);
                    }
                },
                Volume::Scintillator(_) => match scintillator.on_step(&step)? {
                    Some(hit) => {
                        report.muon_hits += 1;
                        report.observer.on_muon_hit(&hit);
                    }
                    None => {
                        report.filtered_steps += 1;
                        report.observer.on_step_filtered(&step);
                    }
                },
                Volume::World => {}
            }
        }

        scintillator.on_event_end()?;
        sipm.on_event_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MuonHit, PaddleId, Particle, Step};
    use crate::hit::{Channel, SensorId, SipmHit};
    use crate::ledger::{CsvSink, MemorySink};
    use std::io::{self, Write};
    use crate::schema::Schema;
    use crate::source::MuonSource;
    use crate::Positive;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::str::FromStr;
    use uom::si::f64::Time;
    use uom::si::time::nanosecond;

    fn ns(t: f64) -> Time {
        Time::new::<nanosecond>(t)
    }

    fn synthesizer() -> Synthesizer {
        Synthesizer::builder()
            .time_constant(Positive::new(ns(1.0)).unwrap())
            .window(Positive::new(ns(100.0)).unwrap())
            .build()
    }

    fn photon(sensor: u32, t: f64) -> Step {
        Step {
            particle: Particle::OpticalPhoton,
            volume: Volume::Sipm(SensorId(sensor)),
            time: ns(t),
        }
    }

    /// Fails every write once `limit` lines went through.
    #[derive(Debug)]
    struct FailingWriter {
        limit: usize,
        lines: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.lines >= self.limit {
                return Err(io::Error::other("disk full"));
            }
            self.lines += buf.iter().filter(|&&b| b == b'\n').count();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestObserver {
        photons: Vec<SipmHit>,
        filtered: Vec<Step>,
        muons: Vec<MuonHit>,
        recorded: Vec<RecordedEvent>,
    }

    impl Observer for TestObserver {
        fn on_photon_hit(&mut self, hit: &SipmHit) {
            self.photons.push(*hit);
        }

        fn on_step_filtered(&mut self, step: &Step) {
            self.filtered.push(*step);
        }

        fn on_muon_hit(&mut self, hit: &MuonHit) {
            self.muons.push(*hit);
        }

        fn on_event_recorded(&mut self, event: &RecordedEvent) {
            self.recorded.push(event.clone());
        }
    }

    #[test]
    fn run_scripted() {
        // Event `n` has `n % 4` photons on the upper channel and one on the
        // lower channel, plus a muon going through both paddles.
        let script = |event: u64| {
            let mut steps: Vec<Step> = (0..event % 4).map(|i| photon(0, i as f64)).collect();
            steps.push(photon(1, 2.0));
            for paddle in 0..2 {
                steps.push(Step {
                    particle: Particle::MuonMinus,
                    volume: Volume::Scintillator(PaddleId(paddle)),
                    time: ns(0.0),
                });
            }
            steps.push(Step {
                particle: Particle::Gamma,
                volume: Volume::Sipm(SensorId(1)),
                time: ns(1.0),
            });
            steps
        };

        let output = Run::builder()
            .events(40)
            .workers(4)
            .synthesizer(synthesizer())
            .ledger(EventLedger::new(Schema::default(), MemorySink::new()))
            .build()
            .run_observed(|_| script, |_| TestObserver::default())
            .unwrap();

        assert_eq!(output.recorded, 40);
        assert_eq!(output.workers.len(), 4);
        assert_eq!(output.workers.iter().map(|w| w.events).sum::<u64>(), 40);
        assert_eq!(
            output.workers.iter().map(|w| w.filtered_steps).sum::<u64>(),
            40
        );
        assert_eq!(output.workers.iter().map(|w| w.muon_hits).sum::<u64>(), 80);

        let photons: usize = output
            .workers
            .iter()
            .map(|w| w.observer.photons.len())
            .sum();
        // 10 cycles of 0 + 1 + 2 + 3 upper photons, plus one lower per event.
        assert_eq!(photons, 60 + 40);

        let rows = output.sink.into_rows();
        assert_eq!(rows.len(), 80);
        let upper_hits: usize = rows
            .iter()
            .filter(|r| r.row.channel() == Channel::Upper)
            .map(|r| r.row.hit_count())
            .sum();
        assert_eq!(upper_hits, 60);
        assert!(rows
            .iter()
            .filter(|r| r.row.channel() == Channel::Lower)
            .all(|r| r.row.hit_count() == 1));

        let positions: HashSet<u64> = rows.iter().map(|r| r.position.get()).collect();
        assert_eq!(positions, (0..40).collect::<HashSet<u64>>());

        let mut observed: Vec<u64> = output
            .workers
            .iter()
            .flat_map(|w| w.observer.recorded.iter().map(|e| e.position.get()))
            .collect();
        observed.sort_unstable();
        assert_eq!(observed, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn run_empty_events() {
        let schema = Schema::from_str("position,channel,hits,charge").unwrap();
        let sink = CsvSink::new(Vec::new(), &schema).unwrap();

        let output = Run::builder()
            .events(3)
            .synthesizer(synthesizer())
            .ledger(EventLedger::new(schema, sink))
            .build()
            .run(|_| |_: u64| Vec::<Step>::new())
            .unwrap();

        let out = String::from_utf8(output.sink.into_inner()).unwrap();
        assert_eq!(
            out,
            "position,channel,hits,charge\n\
             0,0,0,0\n0,1,0,0\n\
             1,0,0,0\n1,1,0,0\n\
             2,0,0,0\n2,1,0,0\n"
        );
    }

    #[test]
    fn run_muon_source() {
        let output = Run::builder()
            .events(500)
            .workers(3)
            .synthesizer(synthesizer())
            .ledger(EventLedger::new(Schema::default(), MemorySink::new()))
            .progress_interval(100)
            .build()
            .run(|worker| {
                MuonSource::builder()
                    .rng(StdRng::seed_from_u64(worker as u64))
                    .mean_photons(15.0)
                    .decay_time(Positive::new(ns(2.1)).unwrap())
                    .flight_time(Positive::new(ns(1.0)).unwrap())
                    .entry_spread(Positive::new(ns(10.0)).unwrap())
                    .stray_probability(0.5)
                    .build()
                    .unwrap()
            })
            .unwrap();

        assert_eq!(output.recorded, 500);
        let rows = output.sink.into_rows();
        assert_eq!(rows.len(), 1000);

        let mut positions: Vec<u64> = rows.iter().map(|r| r.position.get()).collect();
        positions.dedup();
        assert_eq!(positions, (0..500).collect::<Vec<_>>());

        let photons: u64 = output.workers.iter().map(|w| w.photons).sum();
        let hits: usize = rows.iter().map(|r| r.row.hit_count()).sum();
        assert_eq!(photons, hits as u64);
        assert_eq!(output.workers.iter().map(|w| w.muon_hits).sum::<u64>(), 1000);
    }

    #[test]
    fn run_stops_on_error() {
        // Event 5 has a photon on a sensor that doesn't exist.
        let result = Run::builder()
            .events(100)
            .workers(2)
            .synthesizer(synthesizer())
            .ledger(EventLedger::new(Schema::default(), MemorySink::new()))
            .build()
            .run(|_| {
                |event: u64| {
                    if event == 5 {
                        vec![photon(9, 1.0)]
                    } else {
                        vec![photon(0, 1.0)]
                    }
                }
            });

        match result {
            Err(RunError::Event { event, source, .. }) => {
                assert_eq!(event, 5);
                assert!(matches!(source, AdapterError::UnknownSensor(SensorId(9))));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn run_sink_failure() {
        // The header and five events fit, the sixth event fails. Workers that
        // find the ledger halted afterwards must not hide the write error.
        for _ in 0..20 {
            let writer = FailingWriter {
                limit: 10,
                lines: 0,
            };
            let sink = CsvSink::new(writer, &Schema::default()).unwrap();

            let result = Run::builder()
                .events(100)
                .workers(4)
                .synthesizer(synthesizer())
                .ledger(EventLedger::new(Schema::default(), sink))
                .build()
                .run(|_| |_: u64| vec![photon(0, 1.0)]);

            match result {
                Err(RunError::Event {
                    source: AdapterError::Ledger(LedgerError::Io(_)),
                    ..
                }) => {}
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    #[test]
    fn run_no_workers() {
        let result = Run::builder()
            .events(1)
            .workers(0)
            .synthesizer(synthesizer())
            .ledger(EventLedger::new(Schema::default(), MemorySink::new()))
            .build()
            .run(|_| |_: u64| Vec::<Step>::new());

        assert!(matches!(result, Err(RunError::NoWorkers)));
    }
}
