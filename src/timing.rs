//! Reaction and positioning timing for each trial.
//!
//! # Timing model
//!
//! A trial runs `start -> select -> stop`:
//! - **selection time** is `select - start`, how long the subject took to pick
//!   up the target;
//! - **positioning time** is `stop - select`, how long it took to bring the
//!   target to its final value.
//!
//! The order is expected, not enforced. A `stop` with no `select` since the
//! last `start` measures against a stale (or missing) selection instant and
//! produces a meaningless, possibly negative, value. Such values are recorded
//! as measured and never clamped.
//!
//! Each completed trial is persisted through a [`RecordSink`] before `stop`
//! returns. Once the configured budget of trials has been recorded further
//! trials are not stored, but every `stop` keeps reporting completion.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, info};

use crate::clock::Clock;
use crate::errors::{HarnessError, Result};

/// One completed trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialRecord {
    pub subject_id: String,
    pub selection_seconds: f64,
    pub positioning_seconds: f64,
}

impl TrialRecord {
    /// The record as a single CSV line, without terminator.
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{}",
            self.subject_id,
            format_seconds(self.selection_seconds),
            format_seconds(self.positioning_seconds)
        )
    }
}

impl fmt::Display for TrialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_csv_line())
    }
}

/// Format seconds so the value always reads as a decimal (`2.0`, not `2`).
fn format_seconds(secs: f64) -> String {
    let s = secs.to_string();
    if secs.is_finite() && !s.contains('.') {
        format!("{s}.0")
    } else {
        s
    }
}

/// Seconds from `from` to `to`, negative if `to` is earlier.
fn signed_seconds(from: Instant, to: Instant) -> f64 {
    match to.checked_duration_since(from) {
        Some(d) => d.as_secs_f64(),
        None => -from.duration_since(to).as_secs_f64(),
    }
}

/// Destination for completed trial records.
pub trait RecordSink {
    fn append(&mut self, record: &TrialRecord) -> Result<()>;
}

/// Append-only CSV file, reopened and closed for every record.
#[derive(Debug, Clone)]
pub struct CsvFileSink {
    path: PathBuf,
}

impl CsvFileSink {
    /// Create `<dir>/<label>.csv` (and `dir`) if missing. Existing content is
    /// kept and no header is written.
    pub fn create(dir: impl AsRef<Path>, label: &str) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{label}.csv"));
        open_append(&path)?;
        info!("trial results: {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| HarnessError::Persist {
            path: path.to_path_buf(),
            source,
        })
}

impl RecordSink for CsvFileSink {
    fn append(&mut self, record: &TrialRecord) -> Result<()> {
        let mut file = open_append(&self.path)?;
        writeln!(file, "{}", record.to_csv_line())
            .and_then(|_| file.flush())
            .map_err(|source| HarnessError::Persist {
                path: self.path.clone(),
                source,
            })
    }
}

/// Keeps records in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub records: Vec<TrialRecord>,
}

impl RecordSink for MemorySink {
    fn append(&mut self, record: &TrialRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }
}

impl<T: RecordSink + ?Sized> RecordSink for Box<T> {
    fn append(&mut self, record: &TrialRecord) -> Result<()> {
        (**self).append(record)
    }
}

/// Result of [`TimingLog::stop`].
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// No trial was running; nothing happened.
    NotRunning,
    /// A record was persisted. `complete` is set when this record reached
    /// the budget.
    Recorded { record: TrialRecord, complete: bool },
    /// The budget was already reached; nothing was recorded.
    BudgetExhausted,
}

impl StopOutcome {
    /// Whether this stop raised the completion signal.
    pub fn fires_completion(&self) -> bool {
        match self {
            StopOutcome::NotRunning => false,
            StopOutcome::Recorded { complete, .. } => *complete,
            StopOutcome::BudgetExhausted => true,
        }
    }

    pub fn record(&self) -> Option<&TrialRecord> {
        match self {
            StopOutcome::Recorded { record, .. } => Some(record),
            _ => None,
        }
    }
}

pub struct TimingLog<C: Clock, K: RecordSink> {
    clock: C,
    sink: K,
    start_time: Option<Instant>,
    selection_time: Option<Instant>,
    running: bool,
    completed: usize,
    target: usize,
    total_recorded: usize,
    last_record: Option<TrialRecord>,
}

impl<C: Clock, K: RecordSink> TimingLog<C, K> {
    pub fn new(clock: C, sink: K, target: usize) -> Self {
        Self {
            clock,
            sink,
            start_time: None,
            selection_time: None,
            running: false,
            completed: 0,
            target,
            total_recorded: 0,
            last_record: None,
        }
    }

    /// Start (or restart) a trial.
    pub fn start(&mut self) {
        self.start_time = Some(self.clock.now());
        self.running = true;
        debug!("timer started");
    }

    /// Mark the moment the subject selected the target. Ignored unless a
    /// trial is running.
    pub fn select(&mut self) {
        if !self.running {
            return;
        }
        self.selection_time = Some(self.clock.now());
        debug!("timer selected");
    }

    /// Finish the running trial and persist it while under budget.
    ///
    /// On a persist failure the trial still ends, nothing is counted and the
    /// error is returned.
    pub fn stop(&mut self, subject_id: &str) -> Result<StopOutcome> {
        if !self.running {
            return Ok(StopOutcome::NotRunning);
        }

        let mut recorded = None;
        if self.completed < self.target {
            let now = self.clock.now();
            let start = self.start_time.unwrap_or(now);
            let selection = self.selection_time.unwrap_or(start);
            let record = TrialRecord {
                subject_id: subject_id.to_string(),
                selection_seconds: signed_seconds(start, selection),
                positioning_seconds: signed_seconds(selection, now),
            };

            if let Err(e) = self.sink.append(&record) {
                self.running = false;
                return Err(e);
            }
            self.completed += 1;
            self.total_recorded += 1;
            info!("trial {}/{} recorded: {}", self.completed, self.target, record);
            self.last_record = Some(record.clone());
            recorded = Some(record);
        }

        let complete = self.completed >= self.target;
        if complete {
            info!("trial budget reached ({})", self.target);
        }
        self.running = false;
        debug!("timer stopped");

        Ok(match recorded {
            Some(record) => StopOutcome::Recorded { record, complete },
            None => StopOutcome::BudgetExhausted,
        })
    }

    /// Start a new block: the count returns to zero, persisted records stay.
    pub fn reset(&mut self) {
        self.completed = 0;
        debug!("trial count reset");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Records persisted by this log, across resets. The sink holds the
    /// records themselves.
    pub fn total_recorded(&self) -> usize {
        self.total_recorded
    }

    pub fn last_record(&self) -> Option<&TrialRecord> {
        self.last_record.as_ref()
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }
}
