//! Attendance persistence: one CSV artifact per finalized session.
//!
//! Layout: `<root>/<subject>/<subject>_<YYYY-MM-DD>_<HH-MM-SS>.csv`, with a
//! numeric suffix when two sessions of a subject end in the same second.
//! Artifacts are written once and never rewritten.

use chrono::{NaiveDate, NaiveTime};
use rollcall_core::EnrollmentId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const HEADER: [&str; 6] = ["enrollment_id", "display_name", "subject", "date", "time", "present"];
const REPORT_HEADER: [&str; 5] =
    ["enrollment_id", "display_name", "sessions_present", "sessions_total", "attendance"];
const REPORT_FILE: &str = "attendance.csv";
const MAX_NAME_COLLISIONS: u32 = 100;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("invalid subject name: {0:?}")]
    InvalidSubject(String),
    #[error("no attendance sessions recorded for subject {0:?}")]
    NoSessions(String),
    #[error("attendance artifact already exists: {0}")]
    ArtifactExists(String),
    #[error("attendance CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("attendance I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// One identity's presence in one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub enrollment_id: EnrollmentId,
    pub display_name: String,
    pub subject: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub present: bool,
}

/// Aggregated presence of one identity across a subject's sessions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceSummary {
    pub enrollment_id: EnrollmentId,
    pub display_name: String,
    pub sessions_present: usize,
    pub ratio: f64,
}

impl PresenceSummary {
    /// Presence ratio as a whole percentage.
    pub fn percent(&self) -> u32 {
        (self.ratio * 100.0).round() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectReport {
    pub subject: String,
    pub sessions: usize,
    pub rows: Vec<PresenceSummary>,
}

/// Trim a subject name and check that it is usable as a directory name.
pub fn validate_subject(subject: &str) -> Result<&str, AttendanceError> {
    let trimmed = subject.trim();
    let invalid = trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\'])
        || trimmed.chars().any(char::is_control);
    if invalid {
        return Err(AttendanceError::InvalidSubject(subject.to_string()));
    }
    Ok(trimmed)
}

pub struct AttendanceStore {
    root: PathBuf,
}

impl AttendanceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn subject_dir(&self, subject: &str) -> PathBuf {
        self.root.join(subject)
    }

    /// Persist one session's records as a new artifact and return its path.
    ///
    /// The file is fully written to a temporary name first and then moved
    /// into place without replacing anything already there. An empty
    /// `records` slice still produces an artifact (header only).
    pub fn append_batch(
        &self,
        subject: &str,
        date: NaiveDate,
        session_time: NaiveTime,
        records: &[AttendanceRecord],
    ) -> Result<PathBuf, AttendanceError> {
        let subject = validate_subject(subject)?;
        let dir = self.subject_dir(subject);
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::Builder::new().prefix(".batch-").suffix(".tmp").tempfile_in(&dir)?;
        {
            let mut writer =
                csv::WriterBuilder::new().has_headers(false).from_writer(tmp.as_file_mut());
            writer.write_record(HEADER)?;
            for record in records {
                writer.serialize(record)?;
            }
            writer.flush()?;
        }
        tmp.as_file_mut().flush()?;
        tmp.as_file().sync_all()?;

        let stem = format!("{subject}_{date}_{}", session_time.format("%H-%M-%S"));
        for attempt in 0..MAX_NAME_COLLISIONS {
            let name = match attempt {
                0 => format!("{stem}.csv"),
                n => format!("{stem}_{n}.csv"),
            };
            let path = dir.join(name);
            match tmp.persist_noclobber(&path) {
                Ok(_) => {
                    tracing::info!(
                        subject,
                        %date,
                        records = records.len(),
                        path = %path.display(),
                        "attendance batch persisted"
                    );
                    return Ok(path);
                }
                Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => tmp = e.file,
                Err(e) => return Err(e.error.into()),
            }
        }
        Err(AttendanceError::ArtifactExists(stem))
    }

    /// Every session artifact of `subject`, oldest first.
    pub fn sessions(&self, subject: &str) -> Result<Vec<PathBuf>, AttendanceError> {
        let subject = validate_subject(subject)?;
        self.artifacts(subject, &format!("{subject}_"))
    }

    fn artifacts(&self, subject: &str, prefix: &str) -> Result<Vec<PathBuf>, AttendanceError> {
        let dir = self.subject_dir(subject);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(prefix) && name.ends_with(".csv") && name != REPORT_FILE {
                paths.push(path);
            }
        }
        paths.sort_by_cached_key(|path| artifact_order(path));
        Ok(paths)
    }

    /// All records of `subject` on `date`, in the order they were written.
    pub fn read_batch(
        &self,
        subject: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        let subject = validate_subject(subject)?;
        let mut records = Vec::new();
        for path in self.artifacts(subject, &format!("{subject}_{date}_"))? {
            records.extend(read_artifact(&path)?);
        }
        Ok(records)
    }

    /// Per-identity presence ratio over every session of `subject`.
    ///
    /// Each artifact counts as one session, including empty ones.
    pub fn merge_subject(&self, subject: &str) -> Result<SubjectReport, AttendanceError> {
        let subject = validate_subject(subject)?;
        let sessions = self.sessions(subject)?;
        if sessions.is_empty() {
            return Err(AttendanceError::NoSessions(subject.to_string()));
        }

        let mut present: BTreeMap<EnrollmentId, (String, usize)> = BTreeMap::new();
        for path in &sessions {
            let mut seen = BTreeSet::new();
            for record in read_artifact(path)? {
                if !record.present || !seen.insert(record.enrollment_id) {
                    continue;
                }
                present
                    .entry(record.enrollment_id)
                    .or_insert_with(|| (record.display_name.clone(), 0))
                    .1 += 1;
            }
        }

        let total = sessions.len();
        let rows = present
            .into_iter()
            .map(|(enrollment_id, (display_name, sessions_present))| PresenceSummary {
                enrollment_id,
                display_name,
                sessions_present,
                ratio: sessions_present as f64 / total as f64,
            })
            .collect();

        Ok(SubjectReport { subject: subject.to_string(), sessions: total, rows })
    }

    /// Write the merged report for `subject` next to its session artifacts.
    pub fn write_report(&self, subject: &str) -> Result<PathBuf, AttendanceError> {
        let report = self.merge_subject(subject)?;
        let path = self.subject_dir(&report.subject).join(REPORT_FILE);

        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(REPORT_HEADER)?;
        for row in &report.rows {
            writer.write_record([
                row.enrollment_id.to_string(),
                row.display_name.clone(),
                row.sessions_present.to_string(),
                report.sessions.to_string(),
                format!("{}%", row.percent()),
            ])?;
        }
        writer.flush()?;

        tracing::info!(
            subject = %report.subject,
            sessions = report.sessions,
            path = %path.display(),
            "attendance report written"
        );
        Ok(path)
    }
}

/// Sort key for session artifacts: the name without its collision suffix,
/// then the suffix as a number, so `_10` follows `_9`.
fn artifact_order(path: &Path) -> (String, u32) {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    match stem.rsplit_once('_') {
        Some((base, suffix)) => match suffix.parse() {
            Ok(n) => (base.to_string(), n),
            Err(_) => (stem.to_string(), 0),
        },
        None => (stem.to_string(), 0),
    }
}

fn read_artifact(path: &Path) -> Result<Vec<AttendanceRecord>, AttendanceError> {
    let mut reader = csv::Reader::from_path(path)?;
    reader.deserialize().collect::<Result<Vec<_>, _>>().map_err(Into::into)
}
