//! State reports published for external dashboards.

use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::rc::Rc;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::devices::ConsumerState;

/// Per-consumer part of a [`StateReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerReport {
    pub name: String,
    pub state: String,
    pub started_at: Option<NaiveDateTime>,
    pub last_run: Option<NaiveDateTime>,
}

/// `(name, state, started_at, last_run)` of one consumer.
pub type ReportRow<'a> = (
    &'a str,
    ConsumerState,
    Option<NaiveDateTime>,
    Option<NaiveDateTime>,
);

/// Snapshot of the whole installation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateReport {
    pub at: NaiveDateTime,
    /// Most urgent consumer state.
    pub state: String,
    pub consumers: Vec<ConsumerReport>,
    pub running: Vec<String>,
    pub needs: Vec<String>,
    pub critically_needs: Vec<String>,
}

impl StateReport {
    /// Builds a report from `(name, state, started_at, last_run)` rows.
    pub fn new<'a>(
        at: NaiveDateTime,
        aggregate: ConsumerState,
        rows: impl IntoIterator<Item = ReportRow<'a>>,
    ) -> Self {
        let mut report = Self {
            at,
            state: aggregate.to_string(),
            consumers: Vec::new(),
            running: Vec::new(),
            needs: Vec::new(),
            critically_needs: Vec::new(),
        };

        for (name, state, started_at, last_run) in rows {
            match state {
                s if s.is_running() => report.running.push(name.to_string()),
                ConsumerState::NeedsEnergy => report.needs.push(name.to_string()),
                ConsumerState::CriticallyNeedsEnergy => {
                    report.critically_needs.push(name.to_string())
                }
                _ => {}
            }
            report.consumers.push(ConsumerReport {
                name: name.to_string(),
                state: state.to_string(),
                started_at,
                last_run,
            });
        }
        report
    }
}

/// A report could not be delivered.
#[derive(Debug)]
pub struct SinkError {
    pub message: String,
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "report sink: {}", self.message)
    }
}

impl std::error::Error for SinkError {}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(e: serde_json::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

/// Destination for state reports. Failures are logged by the caller and
/// never retried.
pub trait ReportSink {
    fn publish(&mut self, report: &StateReport) -> Result<(), SinkError>;
}

/// Keeps every report in memory; clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct MemoryReportSink {
    reports: Rc<RefCell<Vec<StateReport>>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<StateReport> {
        self.reports.borrow().clone()
    }

    pub fn last(&self) -> Option<StateReport> {
        self.reports.borrow().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.reports.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.borrow().is_empty()
    }
}

impl ReportSink for MemoryReportSink {
    fn publish(&mut self, report: &StateReport) -> Result<(), SinkError> {
        self.reports.borrow_mut().push(report.clone());
        Ok(())
    }
}

/// Writes one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ReportSink for JsonLinesSink<W> {
    fn publish(&mut self, report: &StateReport) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, report)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

/// Discards every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn publish(&mut self, _report: &StateReport) -> Result<(), SinkError> {
        Ok(())
    }
}
