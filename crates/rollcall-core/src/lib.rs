//! rollcall-core — Face recognition model and per-session bookkeeping.
//!
//! Provides an LBPH (local binary pattern histogram) recognizer with an
//! atomic model slot, the face detector seam, and the per-session
//! deduplication tracker used by attendance capture.

pub mod dedup;
pub mod detector;
pub mod recognizer;
pub mod slot;
pub mod types;

pub use dedup::SessionTracker;
pub use detector::{Detection, DetectorError, FaceDetector, WholeFrameDetector};
pub use recognizer::{LbphModel, ModelStats, Recognizer, RecognizerError};
pub use slot::ModelSlot;
pub use types::{EnrollmentId, FaceSample, Identity, PixelGrid, Prediction, Region};
