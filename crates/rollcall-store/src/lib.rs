//! rollcall-store — Durable state for attendance capture.
//!
//! The identity registry lives in SQLite, enrollment face samples are PNG
//! files grouped per identity, and each finalized session becomes one CSV
//! artifact under its subject's directory.

pub mod attendance;
pub mod registry;
pub mod samples;

pub use attendance::{
    validate_subject, AttendanceError, AttendanceRecord, AttendanceStore, PresenceSummary,
    SubjectReport,
};
pub use registry::{IdentityRegistry, RegistryError};
pub use samples::{EnrollmentWriter, SampleStore, SampleStoreError};
