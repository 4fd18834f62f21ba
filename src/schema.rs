use crate::hit::Channel;
use crate::synth::SignalSummary;
use std::fmt;
use uom::si::f64::Time;
use uom::si::time::nanosecond;
use winnow::ascii::space0;
use winnow::combinator::{delimited, separated};
use winnow::error::ContextError;
use winnow::stream::Offset;
use winnow::token::take_till;
use winnow::Parser;

/// A column of the output rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Column {
    /// Ledger position of the event.
    Position,
    /// Channel index (`0` upper, `1` lower).
    Channel,
    /// Number of photons.
    Hits,
    /// Integrated response over the observation window, in ns.
    Charge,
    /// Peak amplitude, in photoelectrons.
    Peak,
    /// Time of the peak, in ns.
    PeakTime,
    /// Arrival time of the first photon, in ns.
    FirstHit,
}

impl Column {
    pub const ALL: [Column; 7] = [
        Column::Position,
        Column::Channel,
        Column::Hits,
        Column::Charge,
        Column::Peak,
        Column::PeakTime,
        Column::FirstHit,
    ];

    pub fn from_name(name: &str) -> Option<Column> {
        Column::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Column::Position => "position",
            Column::Channel => "channel",
            Column::Hits => "hits",
            Column::Charge => "charge",
            Column::Peak => "peak",
            Column::PeakTime => "peak_time",
            Column::FirstHit => "first_hit",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered set of [`Column`]s written for every row.
///
/// The schema is the contract with whoever reads the output. It is written as
/// the header line of the output and parsed back from the same format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// # Examples
    ///
    /// ```
    /// use smallbox::schema::{Column, Schema};
    ///
    /// let schema = Schema::new(vec![Column::Position, Column::Hits]);
    /// assert_eq!(schema.to_string(), "position,hits");
    /// ```
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Formats every cell of a summary except the ledger position, which is
    /// only known once the event is recorded.
    pub fn encode(&self, summary: &SignalSummary) -> EncodedRow {
        let cells = self
            .columns
            .iter()
            .map(|column| match column {
                Column::Position => Cell::Position,
                Column::Channel => Cell::Text(summary.channel.index().to_string()),
                Column::Hits => Cell::Text(summary.hit_count.to_string()),
                Column::Charge => Cell::Text(nanoseconds(summary.charge)),
                Column::Peak => Cell::Text(summary.peak.to_string()),
                Column::PeakTime => optional(summary.peak_time),
                Column::FirstHit => optional(summary.first_hit),
            })
            .collect();

        EncodedRow {
            channel: summary.channel,
            hit_count: summary.hit_count,
            cells,
        }
    }
}

fn nanoseconds(time: Time) -> String {
    time.get::<nanosecond>().to_string()
}

// Missing values are empty cells.
fn optional(time: Option<Time>) -> Cell {
    Cell::Text(time.map(nanoseconds).unwrap_or_default())
}

impl Default for Schema {
    /// `position,channel,hits,charge,peak`
    fn default() -> Self {
        Self::new(vec![
            Column::Position,
            Column::Channel,
            Column::Hits,
            Column::Charge,
            Column::Peak,
        ])
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self
            .columns
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join(",");

        write!(f, "{text}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Cell {
    Position,
    Text(String),
}

/// A row formatted ahead of time, waiting for its ledger position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedRow {
    channel: Channel,
    hit_count: usize,
    cells: Vec<Cell>,
}

impl EncodedRow {
    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn hit_count(&self) -> usize {
        self.hit_count
    }

    /// Appends the comma-separated row, without a line terminator, to `out`.
    pub fn render(&self, position: u64, out: &mut String) {
        for (i, cell) in self.cells.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            match cell {
                Cell::Position => out.push_str(&position.to_string()),
                Cell::Text(text) => out.push_str(text),
            }
        }
    }
}

fn parse_name<'a>(input: &mut &'a str) -> winnow::Result<&'a str> {
    take_till(1.., |c: char| c == ',' || c.is_whitespace()).parse_next(input)
}

/// The error type returned when parsing a [`Schema`] fails.
///
/// Renders the header with the offending part underlined, followed by the
/// list of known column names.
#[derive(Debug)]
pub struct ParseError {
    header: String,
    span: std::ops::Range<usize>,
    label: &'static str,
}

impl ParseError {
    fn from_parse(error: winnow::error::ParseError<&str, ContextError>) -> Self {
        let header = error.input().to_string();
        let start = error.char_span().start;
        let end = (start + 1).min(header.len());

        Self {
            header,
            span: start..end,
            label: "expected a column name",
        }
    }

    fn unknown_column(header: &str, span: std::ops::Range<usize>) -> Self {
        Self {
            header: header.to_string(),
            span,
            label: "unknown column",
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let known = Column::ALL
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join(", ");
        let help = format!("known columns: {known}");

        let message = annotate_snippets::Level::Error
            .title("invalid output schema")
            .snippet(
                annotate_snippets::Snippet::source(&self.header).annotation(
                    annotate_snippets::Level::Error
                        .span(self.span.clone())
                        .label(self.label),
                ),
            )
            .footer(annotate_snippets::Level::Help.title(&help));
        let renderer = annotate_snippets::Renderer::plain();
        let rendered = renderer.render(message);
        fmt::Display::fmt(&rendered, f)
    }
}

impl std::error::Error for ParseError {}

impl std::str::FromStr for Schema {
    type Err = ParseError;

    /// Parse a [`Schema`] from a comma-separated list of column names, e.g. a
    /// header line written by [`Schema`]'s `Display` implementation. Blanks
    /// around the names are ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// # use smallbox::schema::{Column, Schema};
    /// # use std::str::FromStr;
    /// let schema = Schema::from_str("position, channel, peak_time")?;
    /// assert_eq!(
    ///     schema.columns(),
    ///     &[Column::Position, Column::Channel, Column::PeakTime]
    /// );
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let names: Vec<&str> = separated(1.., delimited(space0, parse_name, space0), ',')
            .parse(input)
            .map_err(ParseError::from_parse)?;

        let columns = names
            .into_iter()
            .map(|name| {
                Column::from_name(name).ok_or_else(|| {
                    let start = name.offset_from(&input);
                    ParseError::unknown_column(input, start..start + name.len())
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { columns })
    }
}
