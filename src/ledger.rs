use crate::hit::{Channel, ChannelPair};
use crate::schema::{EncodedRow, Schema};
use crate::synth::SignalSummary;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::error;

/// Position of an event in the output.
///
/// Positions are assigned by the [`EventLedger`]: they start at zero, are
/// unique, and have no gaps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerPosition(u64);

impl LedgerPosition {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LedgerPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to write to the output")]
    Io(#[from] io::Error),
    #[error("the ledger stopped accepting events after an earlier write failure")]
    Halted,
    #[error("a worker panicked while holding the ledger")]
    Poisoned,
}

/// Destination of the rows recorded by an [`EventLedger`].
///
/// Calls are serialized by the ledger; implementations don't need any
/// synchronization of their own.
pub trait RecordSink {
    /// Appends all the rows of one event.
    fn append(&mut self, position: LedgerPosition, rows: &[EncodedRow]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes rows as comma-separated lines, preceded by a header.
///
/// Every call to [`RecordSink::append`] writes directly to the inner writer;
/// wrap it in a [`std::io::BufWriter`] when it is a file.
#[derive(Debug)]
pub struct CsvSink<W> {
    out: W,
    line: String,
}

impl<W: Write> CsvSink<W> {
    /// Creates the sink and writes the header line of `schema`.
    pub fn new(mut out: W, schema: &Schema) -> io::Result<Self> {
        writeln!(out, "{schema}")?;

        Ok(Self {
            out,
            line: String::new(),
        })
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> RecordSink for CsvSink<W> {
    fn append(&mut self, position: LedgerPosition, rows: &[EncodedRow]) -> io::Result<()> {
        self.line.clear();
        for row in rows {
            row.render(position.get(), &mut self.line);
            self.line.push('\n');
        }

        self.out.write_all(self.line.as_bytes())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// A row kept by a [`MemorySink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRow {
    pub position: LedgerPosition,
    pub row: EncodedRow,
}

/// Keeps every row in memory, in the order they were recorded.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    rows: Vec<StoredRow>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[StoredRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<StoredRow> {
        self.rows
    }
}

impl RecordSink for MemorySink {
    fn append(&mut self, position: LedgerPosition, rows: &[EncodedRow]) -> io::Result<()> {
        self.rows.extend(rows.iter().map(|row| StoredRow {
            position,
            row: row.clone(),
        }));
        Ok(())
    }
}

#[derive(Debug)]
struct LedgerState<S> {
    next: u64,
    halted: bool,
    sink: S,
}

/// Process-wide record of finished events.
///
/// All workers share one ledger. Recording an event takes the ledger's lock
/// for as long as it takes to append the already formatted rows to the sink.
#[derive(Debug)]
pub struct EventLedger<S> {
    schema: Schema,
    state: Mutex<LedgerState<S>>,
    // Copy of `state.next` that can be read without the lock.
    recorded: AtomicU64,
}

impl<S: RecordSink> EventLedger<S> {
    pub fn new(schema: Schema, sink: S) -> Self {
        Self {
            schema,
            state: Mutex::new(LedgerState {
                next: 0,
                halted: false,
                sink,
            }),
            recorded: AtomicU64::new(0),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Writes one row per channel for an event and returns the position
    /// assigned to it.
    ///
    /// If the sink fails, the ledger halts: the error is returned and every
    /// later call returns [`LedgerError::Halted`]. Nothing is retried, so no
    /// event is ever written twice.
    pub fn record_event(
        &self,
        summaries: &ChannelPair<SignalSummary>,
    ) -> Result<LedgerPosition, LedgerError> {
        let rows: Vec<EncodedRow> = Channel::ALL
            .iter()
            .map(|&c| self.schema.encode(summaries.get(c)))
            .collect();

        let mut state = self.state.lock().map_err(|_| LedgerError::Poisoned)?;
        if state.halted {
            return Err(LedgerError::Halted);
        }

        let position = LedgerPosition(state.next);
        if let Err(e) = state.sink.append(position, &rows) {
            state.halted = true;
            error!(%position, error = %e, "output write failed, halting the ledger");
            return Err(e.into());
        }
        state.next += 1;
        self.recorded.store(state.next, Ordering::Release);

        Ok(position)
    }

    /// Number of events recorded so far.
    ///
    /// Doesn't take the ledger's lock, so the value may already be behind by
    /// the time it is returned.
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Acquire)
    }

    /// Flushes the sink and returns it.
    pub fn finish(self) -> Result<S, LedgerError> {
        let mut state = self.state.into_inner().map_err(|_| LedgerError::Poisoned)?;
        if state.halted {
            return Err(LedgerError::Halted);
        }
        state.sink.flush()?;

        Ok(state.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use std::collections::HashSet;
    use std::str::FromStr;
    use std::thread;

    fn summaries(upper_hits: usize) -> ChannelPair<SignalSummary> {
        ChannelPair::from_fn(|c| {
            let mut summary = SignalSummary::empty(c);
            if c == Channel::Upper {
                summary.hit_count = upper_hits;
            }
            summary
        })
    }

    /// Fails every write once `limit` lines went through.
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

    #[test]
    fn record_event_positions() {
        let ledger = EventLedger::new(Schema::default(), MemorySink::new());

        for i in 0..5 {
            assert_eq!(ledger.record_event(&summaries(i)).unwrap().get(), i as u64);
            assert_eq!(ledger.recorded(), i as u64 + 1);
        }

        let rows = ledger.finish().unwrap().into_rows();
        assert_eq!(rows.len(), 10);
        for (i, pair) in rows.chunks(2).enumerate() {
            assert_eq!(pair[0].position.get(), i as u64);
            assert_eq!(pair[0].row.channel(), Channel::Upper);
            assert_eq!(pair[0].row.hit_count(), i);
            assert_eq!(pair[1].position.get(), i as u64);
            assert_eq!(pair[1].row.channel(), Channel::Lower);
            assert_eq!(pair[1].row.hit_count(), 0);
        }
    }

    #[test]
    fn csv_sink_output() {
        let schema = Schema::from_str("position,channel,hits").unwrap();
        let sink = CsvSink::new(Vec::new(), &schema).unwrap();
        let ledger = EventLedger::new(schema, sink);
        assert_eq!(ledger.schema().to_string(), "position,channel,hits");

        ledger.record_event(&summaries(4)).unwrap();
        ledger.record_event(&summaries(0)).unwrap();

        let out = String::from_utf8(ledger.finish().unwrap().into_inner()).unwrap();
        assert_eq!(
            out,
            "position,channel,hits\n0,0,4\n0,1,0\n1,0,0\n1,1,0\n"
        );
    }

    #[test]
    fn empty_event_row() {
        let sink = CsvSink::new(Vec::new(), &Schema::default()).unwrap();
        let ledger = EventLedger::new(Schema::default(), sink);

        ledger.record_event(&summaries(0)).unwrap();

        let out = String::from_utf8(ledger.finish().unwrap().into_inner()).unwrap();
        assert_eq!(
            out,
            "position,channel,hits,charge,peak\n0,0,0,0,0\n0,1,0,0,0\n"
        );
    }

    #[test]
    fn sink_failure_halts() {
        let writer = FailingWriter {
            // Header and both rows of one event.
            limit: 3,
            lines: 0,
        };
        let sink = CsvSink::new(writer, &Schema::new(vec![Column::Position])).unwrap();
        let ledger = EventLedger::new(Schema::new(vec![Column::Position]), sink);

        assert_eq!(ledger.record_event(&summaries(1)).unwrap().get(), 0);
        assert!(matches!(
            ledger.record_event(&summaries(1)),
            Err(LedgerError::Io(_))
        ));
        assert!(matches!(
            ledger.record_event(&summaries(1)),
            Err(LedgerError::Halted)
        ));
        assert_eq!(ledger.recorded(), 1);
        assert!(matches!(ledger.finish(), Err(LedgerError::Halted)));
    }

    #[test]
    fn record_event_concurrent() {
        const WORKERS: usize = 8;
        const EVENTS: usize = 250;

        let ledger = EventLedger::new(Schema::default(), MemorySink::new());
        thread::scope(|s| {
            for worker in 0..WORKERS {
                let ledger = &ledger;
                s.spawn(move || {
                    for _ in 0..EVENTS {
                        ledger.record_event(&summaries(worker)).unwrap();
                    }
                });
            }
        });
        assert_eq!(ledger.recorded(), (WORKERS * EVENTS) as u64);

        let rows = ledger.finish().unwrap().into_rows();
        assert_eq!(rows.len(), WORKERS * EVENTS * 2);

        let positions: Vec<u64> = rows.iter().step_by(2).map(|r| r.position.get()).collect();
        assert_eq!(positions, (0..(WORKERS * EVENTS) as u64).collect::<Vec<_>>());

        let mut seen = HashSet::new();
        for pair in rows.chunks(2) {
            assert_eq!(pair[0].position, pair[1].position);
            assert_eq!(pair[0].row.channel(), Channel::Upper);
            assert_eq!(pair[1].row.channel(), Channel::Lower);
            assert!(seen.insert(pair[0].position));
        }
        // Every worker got all of its events in.
        for worker in 0..WORKERS {
            let count = rows
                .iter()
                .filter(|r| r.row.channel() == Channel::Upper && r.row.hit_count() == worker)
                .count();
            assert_eq!(count, EVENTS);
        }
    }
}
