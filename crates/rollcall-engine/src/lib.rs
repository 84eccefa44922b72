//! rollcall-engine — Capture sessions, enrollment and training orchestration.
//!
//! Ties the frame sources, the recognizer and the stores together: a
//! [`CaptureSession`] turns one time-boxed window of frames into one
//! attendance batch, [`Enroller`] collects samples for a new identity, and
//! [`train`] rebuilds the live model from every stored sample.

pub mod clock;
pub mod config;
pub mod enroll;
pub mod services;
pub mod session;
pub mod train;

#[cfg(test)]
mod testing;

pub use clock::{CancelToken, Clock, SystemClock};
pub use config::{Config, ConfigError};
pub use enroll::{EnrollError, EnrollOutcome, EnrollStop, Enroller};
pub use services::{Services, ServicesError, Status};
pub use session::{
    AttendanceBatch, CaptureSession, SessionContext, SessionEnd, SessionError, SessionSettings,
    SessionState, StepReport,
};
pub use train::{load_model, train, TrainError};
