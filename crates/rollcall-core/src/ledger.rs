//! Attendance ledger: one append-only CSV partition per calendar day.
//!
//! Each partition is `attendance_YYYY-MM-DD.csv` under the records directory
//! with the header `identity_id,display_name,timestamp`. A record is written as
//! one complete line with a single `write_all` followed by `sync_data`, so a
//! crash can at worst leave a torn final line; torn lines are skipped on load
//! and fenced off with a newline before the next append.
//!
//! The in-memory "already marked" set is rebuilt from the partition whenever a
//! day is opened, which is what makes restarts idempotent.

use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const HEADER: &str = "identity_id,display_name,timestamp";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("cannot open attendance partition {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot write attendance record to {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Wall-clock source; swapped for a fixed clock in tests.
pub trait Clock: Send {
    fn now(&self) -> NaiveDateTime;
}

/// Local time of the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// One persisted attendance line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub identity_id: String,
    pub display_name: String,
    pub timestamp: NaiveDateTime,
}

impl AttendanceRecord {
    fn to_line(&self) -> String {
        let timestamp = self.timestamp.format(TIMESTAMP_FORMAT).to_string();
        let mut line = [
            escape_field(&self.identity_id),
            escape_field(&self.display_name),
            timestamp,
        ]
        .join(",");
        line.push('\n');
        line
    }

    fn from_line(line: &str) -> Option<Self> {
        let fields = split_line(line)?;
        let [identity_id, display_name, timestamp] = <[String; 3]>::try_from(fields).ok()?;
        let timestamp = NaiveDateTime::parse_from_str(&timestamp, TIMESTAMP_FORMAT).ok()?;
        if identity_id.is_empty() {
            return None;
        }
        Some(Self {
            identity_id,
            display_name,
            timestamp,
        })
    }
}

/// Result of a [`AttendanceLedger::mark`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// A new record was persisted.
    Marked,
    /// The identity already has a record in this day's partition.
    AlreadyMarked,
}

/// Path of the partition for `date` under `dir`.
pub fn partition_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("attendance_{}.csv", date.format("%Y-%m-%d")))
}

/// Read every committed record of one day's partition. A missing file is an empty day.
pub fn read_partition(dir: &Path, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
    let path = partition_path(dir, date);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut contents = String::new();
    File::open(&path)
        .and_then(|mut f| f.read_to_string(&mut contents))
        .map_err(|source| LedgerError::Open {
            path: path.clone(),
            source,
        })?;
    Ok(parse_partition(&contents, &path))
}

fn parse_partition(contents: &str, path: &Path) -> Vec<AttendanceRecord> {
    let mut records = Vec::new();
    // Only newline-terminated lines were committed.
    let committed = match contents.rfind('\n') {
        Some(end) => &contents[..end],
        None => "",
    };
    for (lineno, line) in committed.lines().enumerate() {
        if line.is_empty() || (lineno == 0 && line == HEADER) {
            continue;
        }
        match AttendanceRecord::from_line(line) {
            Some(record) => records.push(record),
            None => tracing::warn!(
                path = %path.display(),
                line = lineno + 1,
                "skipping malformed attendance line"
            ),
        }
    }
    records
}

/// The active day partition plus its deduplication set.
struct Partition {
    date: NaiveDate,
    path: PathBuf,
    file: File,
    marked: HashSet<String>,
    /// The file does not end in '\n' (torn write); fence before appending.
    needs_newline: bool,
}

impl Partition {
    fn open(dir: &Path, date: NaiveDate) -> Result<Self, LedgerError> {
        let path = partition_path(dir, date);
        let open_err = |source| LedgerError::Open {
            path: path.clone(),
            source,
        };

        let mut contents = String::new();
        if path.exists() {
            File::open(&path)
                .and_then(|mut f| f.read_to_string(&mut contents))
                .map_err(open_err)?;
        }
        let marked: HashSet<String> = parse_partition(&contents, &path)
            .into_iter()
            .map(|r| r.identity_id)
            .collect();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;

        let mut needs_newline = !contents.is_empty() && !contents.ends_with('\n');
        if contents.is_empty() {
            file.write_all(format!("{HEADER}\n").as_bytes())
                .and_then(|_| file.sync_data())
                .map_err(open_err)?;
            needs_newline = false;
        }

        tracing::info!(
            path = %path.display(),
            already_marked = marked.len(),
            "attendance partition opened"
        );

        Ok(Self {
            date,
            path,
            file,
            marked,
            needs_newline,
        })
    }

    fn append(&mut self, record: &AttendanceRecord) -> std::io::Result<()> {
        let mut line = record.to_line();
        if self.needs_newline {
            line.insert(0, '\n');
        }
        // Any failure may leave a partial line behind.
        self.needs_newline = true;
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        self.needs_newline = false;
        Ok(())
    }
}

/// Deduplicating, crash-safe attendance store.
///
/// Single writer: only the owner calls [`mark`](Self::mark). Share it across
/// sources behind a `Mutex` if several cameras feed one ledger.
pub struct AttendanceLedger<C: Clock = SystemClock> {
    dir: PathBuf,
    clock: C,
    partition: Partition,
}

impl AttendanceLedger<SystemClock> {
    pub fn open(dir: &Path) -> Result<Self, LedgerError> {
        Self::with_clock(dir, SystemClock)
    }
}

impl<C: Clock> AttendanceLedger<C> {
    /// Open today's partition (per `clock`), creating `dir` if needed.
    pub fn with_clock(dir: &Path, clock: C) -> Result<Self, LedgerError> {
        fs::create_dir_all(dir).map_err(|source| LedgerError::Open {
            path: dir.to_path_buf(),
            source,
        })?;
        let today = clock.now().date();
        let partition = Partition::open(dir, today)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            clock,
            partition,
        })
    }

    pub fn records_directory(&self) -> &Path {
        &self.dir
    }

    /// Date of the active partition.
    pub fn active_date(&self) -> NaiveDate {
        self.partition.date
    }

    pub fn active_path(&self) -> &Path {
        &self.partition.path
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    /// Number of identities recorded in the active partition.
    pub fn marked_count(&self) -> usize {
        self.partition.marked.len()
    }

    /// Whether `identity_id` is already recorded today. Rolls over first if
    /// the date changed.
    pub fn already_marked(&mut self, identity_id: &str) -> Result<bool, LedgerError> {
        let today = self.clock.now().date();
        self.switch_to(today)?;
        Ok(self.partition.marked.contains(identity_id))
    }

    /// Record `identity_id` in the partition of `timestamp`'s date unless it
    /// is already there.
    ///
    /// The record is persisted before the in-memory set is updated; on a
    /// write error the identity stays unmarked so the next detection retries.
    pub fn mark(
        &mut self,
        identity_id: &str,
        display_name: &str,
        timestamp: NaiveDateTime,
    ) -> Result<MarkOutcome, LedgerError> {
        self.switch_to(timestamp.date())?;
        if self.partition.marked.contains(identity_id) {
            return Ok(MarkOutcome::AlreadyMarked);
        }

        let record = AttendanceRecord {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
            timestamp,
        };
        self.partition
            .append(&record)
            .map_err(|source| LedgerError::Write {
                path: self.partition.path.clone(),
                source,
            })?;
        self.partition.marked.insert(record.identity_id);

        tracing::info!(
            identity = identity_id,
            name = display_name,
            at = %timestamp.format(TIMESTAMP_FORMAT),
            "attendance marked"
        );
        Ok(MarkOutcome::Marked)
    }

    /// [`mark`](Self::mark) stamped with the ledger's clock.
    pub fn mark_now(
        &mut self,
        identity_id: &str,
        display_name: &str,
    ) -> Result<MarkOutcome, LedgerError> {
        let now = self.clock.now();
        self.mark(identity_id, display_name, now)
    }

    /// Flush the active partition to disk.
    pub fn flush(&mut self) -> Result<(), LedgerError> {
        self.partition
            .file
            .sync_all()
            .map_err(|source| LedgerError::Write {
                path: self.partition.path.clone(),
                source,
            })
    }

    fn switch_to(&mut self, date: NaiveDate) -> Result<(), LedgerError> {
        if date == self.partition.date {
            return Ok(());
        }
        tracing::info!(from = %self.partition.date, to = %date, "attendance day rollover");
        self.partition = Partition::open(&self.dir, date)?;
        Ok(())
    }
}

/// Quote a CSV field if it contains a delimiter or quote.
///
/// Control characters become spaces: one record is always one physical line.
fn escape_field(field: &str) -> String {
    let field: String = field
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if field.contains([',', '"']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field
    }
}

/// Split one CSV line into fields; `None` on an unterminated quote.
fn split_line(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if field.is_empty() => in_quotes = true,
            (',', false) => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    if in_quotes {
        return None;
    }
    fields.push(field);
    Some(fields)
}
