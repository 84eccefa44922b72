//! Capture session controller.
//!
//! One session runs for a fixed window: it pulls frames one at a time,
//! detects faces, classifies each crop, and records every newly recognized
//! identity once. When the window ends (or the caller cancels, or the frame
//! source fails) the accumulated records are written as a single batch.
//!
//! ```text
//! INITIALIZING ──► ACTIVE ──► FINALIZING ──► COMPLETE
//!                    │             ▲
//!                    └─► ABORTED ──┘   (source failure / cancellation)
//! ```

use crate::clock::{CancelToken, Clock};
use chrono::{NaiveDate, NaiveTime, Timelike};
use rollcall_core::{EnrollmentId, FaceDetector, ModelSlot, PixelGrid, Recognizer, SessionTracker};
use rollcall_hw::{Frame, FrameSource, FrameSourceError};
use rollcall_store::{
    validate_subject, AttendanceError, AttendanceRecord, AttendanceStore, IdentityRegistry,
    RegistryError,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid subject name: {0:?}")]
    InvalidSubject(String),
    #[error("recognition model not trained; enroll faces and run training first")]
    ModelNotTrained,
    #[error("identity registry unavailable: {0}")]
    Registry(#[from] RegistryError),
    #[error("frame source failed to open: {0}")]
    SourceOpen(#[source] FrameSourceError),
    #[error(
        "frame source failed mid-session ({} records persisted): {source}",
        .batch.records.len()
    )]
    FrameSource {
        source: FrameSourceError,
        batch: Box<AttendanceBatch>,
    },
    #[error("failed to persist attendance batch: {0}")]
    Persist(#[source] AttendanceError),
    #[error("session already finalized")]
    AlreadyFinalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Active,
    Finalizing,
    Complete,
    Aborted,
}

/// Why the ACTIVE phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    DeadlineReached,
    Cancelled,
    FrameSourceFailed,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub window: Duration,
    pub match_threshold: f64,
    pub write_empty_batches: bool,
    /// Back-off after a pull that produced no frame.
    pub idle_poll: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(20),
            match_threshold: 70.0,
            write_empty_batches: true,
            idle_poll: Duration::from_millis(15),
        }
    }
}

/// The finalized, immutable result of one session.
#[derive(Debug, Clone)]
pub struct AttendanceBatch {
    pub session_id: Uuid,
    pub subject: String,
    pub date: NaiveDate,
    pub started_at: NaiveTime,
    pub records: Vec<AttendanceRecord>,
    pub end: SessionEnd,
    /// Artifact path, or `None` when an empty batch was not written.
    pub location: Option<PathBuf>,
}

/// Shared collaborators a session binds to at start.
pub struct SessionContext<'a> {
    pub registry: &'a IdentityRegistry,
    pub models: &'a ModelSlot,
    pub store: &'a AttendanceStore,
    pub clock: Arc<dyn Clock>,
    pub settings: SessionSettings,
}

/// What one iteration of the ACTIVE loop did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StepReport {
    pub frame_received: bool,
    pub faces: usize,
    pub recorded: Vec<EnrollmentId>,
}

pub struct CaptureSession<'a, S: FrameSource, D: FaceDetector> {
    id: Uuid,
    subject: String,
    date: NaiveDate,
    started_at: NaiveTime,
    deadline: Instant,
    state: SessionState,
    settings: SessionSettings,
    model: Arc<dyn Recognizer>,
    names: HashMap<EnrollmentId, String>,
    tracker: SessionTracker,
    records: Vec<AttendanceRecord>,
    source: S,
    detector: D,
    clock: Arc<dyn Clock>,
    store: &'a AttendanceStore,
    frames: u64,
}

impl<'a, S: FrameSource, D: FaceDetector> CaptureSession<'a, S, D> {
    /// INITIALIZING: check preconditions, bind the current model, open the
    /// frame source. On error nothing has been created or written.
    pub fn begin(
        ctx: SessionContext<'a>,
        subject: &str,
        mut source: S,
        detector: D,
    ) -> Result<Self, SessionError> {
        let subject = validate_subject(subject)
            .map_err(|_| SessionError::InvalidSubject(subject.to_string()))?
            .to_string();
        let model = ctx.models.current().map_err(|_| SessionError::ModelNotTrained)?;
        let names = ctx.registry.names()?;
        source.open().map_err(SessionError::SourceOpen)?;

        let start = ctx.clock.now();
        let wall = ctx.clock.local_now();
        let session = Self {
            id: Uuid::new_v4(),
            subject,
            date: wall.date_naive(),
            started_at: truncate_to_seconds(wall.time()),
            deadline: start + ctx.settings.window,
            state: SessionState::Active,
            settings: ctx.settings,
            model,
            names,
            tracker: SessionTracker::new(),
            records: Vec::new(),
            source,
            detector,
            clock: ctx.clock,
            store: ctx.store,
            frames: 0,
        };

        tracing::info!(
            session = %session.id,
            subject = %session.subject,
            window_secs = session.settings.window.as_secs_f32(),
            threshold = session.settings.match_threshold,
            identities = session.names.len(),
            "capture session active"
        );
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Provisional records so far, in first-seen order.
    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }

    fn is_expired(&self) -> bool {
        self.clock.now() >= self.deadline
    }

    /// Process exactly one frame.
    ///
    /// A frame source failure finalizes the session through ABORTED and is
    /// returned as [`SessionError::FrameSource`] carrying the persisted
    /// batch. Once finalized, further calls fail with `AlreadyFinalized`.
    pub fn step(&mut self) -> Result<StepReport, SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::AlreadyFinalized);
        }

        let frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(StepReport::default()),
            Err(e) => return Err(self.abort(e)),
        };
        match frame.to_grid() {
            Ok(grid) => Ok(self.process(&frame, &grid)),
            Err(e) => Err(self.abort(e.into())),
        }
    }

    fn process(&mut self, frame: &Frame, grid: &PixelGrid) -> StepReport {
        self.frames += 1;
        let detections = match self.detector.detect(grid) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(
                    session = %self.id,
                    seq = frame.sequence,
                    error = %e,
                    "face detection failed; frame skipped"
                );
                return StepReport { frame_received: true, ..StepReport::default() };
            }
        };

        let mut report =
            StepReport { frame_received: true, faces: detections.len(), recorded: Vec::new() };
        for detection in &detections {
            let prediction = match self.model.predict(&detection.face) {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!(
                        session = %self.id,
                        region = ?detection.region,
                        error = %e,
                        "face not classifiable"
                    );
                    continue;
                }
            };

            if !prediction.is_match(self.settings.match_threshold) {
                tracing::trace!(confidence = prediction.confidence, "unknown face");
                continue;
            }
            let id = prediction.enrollment_id;
            if self.tracker.contains(id) {
                continue;
            }
            let Some(name) = self.names.get(&id) else {
                tracing::warn!(
                    session = %self.id,
                    enrollment_id = id,
                    "matched identity is not registered; ignored"
                );
                continue;
            };

            self.tracker.try_record(id);
            let time = truncate_to_seconds(self.clock.local_now().time());
            self.records.push(AttendanceRecord {
                enrollment_id: id,
                display_name: name.clone(),
                subject: self.subject.clone(),
                date: self.date,
                time,
                present: true,
            });
            report.recorded.push(id);

            tracing::info!(
                session = %self.id,
                enrollment_id = id,
                name = %name,
                confidence = prediction.confidence,
                "attendance recorded"
            );
        }

        report
    }

    /// Drive the ACTIVE loop until the deadline, cancellation, or a frame
    /// source failure, then finalize.
    ///
    /// A source failure still persists what was recorded and is then
    /// returned as [`SessionError::FrameSource`] carrying the batch.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<AttendanceBatch, SessionError> {
        loop {
            if cancel.is_cancelled() {
                return self.finish(SessionEnd::Cancelled);
            }
            if self.is_expired() {
                return self.finish(SessionEnd::DeadlineReached);
            }
            if !self.step()?.frame_received {
                self.idle();
            }
        }
    }

    /// Wait before the next pull, never past the deadline.
    fn idle(&self) {
        let remaining = self.deadline.saturating_duration_since(self.clock.now());
        self.clock.sleep(self.settings.idle_poll.min(remaining));
    }

    /// Finalize after the deadline or a cancellation.
    pub fn finish(&mut self, end: SessionEnd) -> Result<AttendanceBatch, SessionError> {
        self.finalize(end)
    }

    /// Finalize after a frame source failure. Returns the error to surface:
    /// the source failure with the persisted batch, or the persistence
    /// failure if the batch could not be written.
    fn abort(&mut self, error: FrameSourceError) -> SessionError {
        tracing::error!(
            session = %self.id,
            error = %error,
            recorded = self.records.len(),
            "frame source failed; saving partial attendance"
        );
        match self.finalize(SessionEnd::FrameSourceFailed) {
            Ok(batch) => SessionError::FrameSource { source: error, batch: Box::new(batch) },
            Err(e) => e,
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(session = %self.id, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    fn finalize(&mut self, end: SessionEnd) -> Result<AttendanceBatch, SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::AlreadyFinalized);
        }
        let abnormal = end != SessionEnd::DeadlineReached;
        if abnormal {
            self.transition(SessionState::Aborted);
        }
        self.transition(SessionState::Finalizing);
        self.source.close();

        let records = std::mem::take(&mut self.records);
        let location = if records.is_empty() && !self.settings.write_empty_batches {
            tracing::info!(
                session = %self.id,
                subject = %self.subject,
                "no attendance captured; empty batch not written"
            );
            None
        } else {
            match self.store.append_batch(&self.subject, self.date, self.started_at, &records) {
                Ok(path) => Some(path),
                Err(e) => {
                    self.records = records;
                    self.transition(SessionState::Aborted);
                    return Err(SessionError::Persist(e));
                }
            }
        };

        self.transition(if abnormal { SessionState::Aborted } else { SessionState::Complete });
        tracing::info!(
            session = %self.id,
            subject = %self.subject,
            ?end,
            frames = self.frames,
            recorded = records.len(),
            "capture session finished"
        );

        Ok(AttendanceBatch {
            session_id: self.id,
            subject: self.subject.clone(),
            date: self.date,
            started_at: self.started_at,
            records,
            end,
            location,
        })
    }
}

fn truncate_to_seconds(time: NaiveTime) -> NaiveTime {
    time.with_nanosecond(0).unwrap_or(time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SleepClock, StepClock};
    use crate::testing::{frame_with, EmptySource, ScriptedSource, TagDetector, TagRecognizer};
    use std::sync::atomic::Ordering;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: IdentityRegistry,
        models: ModelSlot,
        store: AttendanceStore,
        clock: Arc<dyn Clock>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let registry = IdentityRegistry::open_in_memory().unwrap();
            registry.register(7, "Ana").unwrap();
            registry.register(9, "Bruno").unwrap();
            registry.register(11, "Chen").unwrap();

            let models = ModelSlot::new();
            // tag 1 → Ana at 40, tag 2 → Bruno at 12.5, tag 3 → Chen at 69.9,
            // tag 4 → Ana but too far, tag 5 → unregistered id.
            models.install(TagRecognizer::new(&[
                (1, 7, 40.0),
                (2, 9, 12.5),
                (3, 11, 69.9),
                (4, 7, 70.0),
                (5, 42, 10.0),
            ]));

            let store = AttendanceStore::new(dir.path().join("attendance"));
            let clock = Arc::new(StepClock::new(Duration::from_secs(1)));
            Self { _dir: dir, registry, models, store, clock }
        }

        fn ctx(&self) -> SessionContext<'_> {
            self.ctx_with(SessionSettings::default())
        }

        fn ctx_with(&self, settings: SessionSettings) -> SessionContext<'_> {
            SessionContext {
                registry: &self.registry,
                models: &self.models,
                store: &self.store,
                clock: self.clock.clone(),
                settings,
            }
        }

        fn begin(&self, tags: &[&[u8]]) -> CaptureSession<'_, ScriptedSource, TagDetector> {
            CaptureSession::begin(self.ctx(), "Math", ScriptedSource::frames(tags), TagDetector)
                .unwrap()
        }
    }

    fn ids(records: &[AttendanceRecord]) -> Vec<EnrollmentId> {
        records.iter().map(|r| r.enrollment_id).collect()
    }

    #[test]
    fn test_single_identity_recorded_once() {
        let fx = Fixture::new();
        let mut session = fx.begin(&[&[1], &[1], &[1, 1]]);
        assert_eq!(session.state(), SessionState::Active);

        let batch = session.run(&CancelToken::new()).unwrap();
        assert_eq!(session.state(), SessionState::Complete);
        assert_eq!(batch.end, SessionEnd::DeadlineReached);
        assert_eq!(batch.records.len(), 1);

        let r = &batch.records[0];
        assert_eq!(
            (r.enrollment_id, r.display_name.as_str(), r.subject.as_str()),
            (7, "Ana", "Math")
        );
        assert!(r.present);
        assert_eq!(r.date, batch.date);
        // First-seen wins: the first frame was processed right after start.
        assert_eq!(r.time.format("%H:%M:%S").to_string(), "09:00:02");

        let persisted = fx.store.read_batch("Math", batch.date).unwrap();
        assert_eq!(persisted, batch.records);
        assert!(batch.location.unwrap().exists());
    }

    #[test]
    fn test_second_frame_with_same_face_adds_nothing() {
        let fx = Fixture::new();
        let mut session = fx.begin(&[&[1], &[1]]);

        let first = session.step().unwrap();
        assert_eq!(first.recorded, vec![7]);
        let second = session.step().unwrap();
        assert_eq!(second.faces, 1);
        assert!(second.recorded.is_empty());
        assert_eq!(session.records().len(), 1);
    }

    #[test]
    fn test_threshold_and_unknowns() {
        let fx = Fixture::new();
        // 4 is exactly at the threshold, 5 is unregistered, 6 is unknown.
        let mut session = fx.begin(&[&[4, 5, 6], &[3], &[2, 1]]);
        let batch = session.run(&CancelToken::new()).unwrap();
        assert_eq!(ids(&batch.records), vec![11, 9, 7]);
    }

    #[test]
    fn test_empty_subject_rejected_without_writing() {
        let fx = Fixture::new();
        let source = ScriptedSource::frames(&[&[1]]);
        let result = CaptureSession::begin(fx.ctx(), "", source, TagDetector);
        assert!(matches!(result, Err(SessionError::InvalidSubject(_))));

        let source = ScriptedSource::frames(&[]);
        let result = CaptureSession::begin(fx.ctx(), "   ", source, TagDetector);
        assert!(matches!(result, Err(SessionError::InvalidSubject(_))));
        assert!(!fx.store.root().exists());
    }

    #[test]
    fn test_untrained_model_rejected() {
        let mut fx = Fixture::new();
        fx.models = ModelSlot::new();
        let source = ScriptedSource::frames(&[&[1]]);
        let closed = source.closed_flag();
        let result = CaptureSession::begin(fx.ctx(), "Math", source, TagDetector);
        assert!(matches!(result, Err(SessionError::ModelNotTrained)));
        assert!(!closed.load(Ordering::SeqCst));
        assert!(!fx.store.root().exists());
    }

    #[test]
    fn test_source_open_failure() {
        let fx = Fixture::new();
        let mut source = ScriptedSource::frames(&[]);
        source.fail_open = true;
        let result = CaptureSession::begin(fx.ctx(), "Math", source, TagDetector);
        assert!(matches!(result, Err(SessionError::SourceOpen(_))));
        assert!(!fx.store.root().exists());
    }

    #[test]
    fn test_source_failure_persists_partial_batch() {
        let fx = Fixture::new();
        let source = ScriptedSource::new(vec![
            Ok(Some(frame_with(&[1]))),
            Ok(None),
            Ok(Some(frame_with(&[2]))),
            Err(FrameSourceError::Failed("usb disconnect".into())),
            Ok(Some(frame_with(&[3]))),
        ]);
        let closed = source.closed_flag();
        let mut session = CaptureSession::begin(fx.ctx(), "Math", source, TagDetector).unwrap();

        let (source, batch) = match session.run(&CancelToken::new()) {
            Err(SessionError::FrameSource { source, batch }) => (source, batch),
            other => panic!("expected a frame source error, got {other:?}"),
        };
        assert!(matches!(source, FrameSourceError::Failed(_)));
        assert_eq!(batch.end, SessionEnd::FrameSourceFailed);
        assert_eq!(session.state(), SessionState::Aborted);
        assert!(closed.load(Ordering::SeqCst));

        let persisted = fx.store.read_batch("Math", batch.date).unwrap();
        assert_eq!(ids(&persisted), vec![7, 9]);
    }

    #[test]
    fn test_step_finalizes_on_source_failure() {
        let fx = Fixture::new();
        let source = ScriptedSource::new(vec![
            Ok(Some(frame_with(&[2]))),
            Err(FrameSourceError::Failed("usb disconnect".into())),
        ]);
        let mut session = CaptureSession::begin(fx.ctx(), "Math", source, TagDetector).unwrap();

        session.step().unwrap();
        let err = session.step().unwrap_err();
        assert!(matches!(
            &err,
            SessionError::FrameSource { batch, .. } if batch.records.len() == 1
        ));
        assert_eq!(session.state(), SessionState::Aborted);
        assert!(matches!(session.step(), Err(SessionError::AlreadyFinalized)));
    }

    #[test]
    fn test_cancellation_finalizes_through_aborted() {
        let fx = Fixture::new();
        let mut session = fx.begin(&[&[1], &[2]]);
        session.step().unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let batch = session.run(&cancel).unwrap();
        assert_eq!(batch.end, SessionEnd::Cancelled);
        assert_eq!(session.state(), SessionState::Aborted);
        assert_eq!(batch.records.len(), 1);
        assert!(batch.location.is_some());
    }

    #[test]
    fn test_empty_session_writes_empty_batch() {
        let fx = Fixture::new();
        let source = ScriptedSource::frames(&[&[6], &[]]);
        let mut session =
            CaptureSession::begin(fx.ctx(), "History", source, TagDetector).unwrap();
        let batch = session.run(&CancelToken::new()).unwrap();

        assert!(batch.records.is_empty());
        let location = batch.location.expect("empty batch is still written");
        assert!(location.exists());
        assert_eq!(fx.store.sessions("History").unwrap().len(), 1);
    }

    #[test]
    fn test_empty_session_skipped_when_configured() {
        let fx = Fixture::new();
        let settings = SessionSettings { write_empty_batches: false, ..SessionSettings::default() };
        let source = ScriptedSource::frames(&[]);
        let mut session =
            CaptureSession::begin(fx.ctx_with(settings), "History", source, TagDetector).unwrap();
        let batch = session.run(&CancelToken::new()).unwrap();

        assert!(batch.records.is_empty());
        assert!(batch.location.is_none());
        assert!(fx.store.sessions("History").unwrap().is_empty());
    }

    #[test]
    fn test_non_empty_batch_written_even_when_empty_skipped() {
        let fx = Fixture::new();
        let settings = SessionSettings { write_empty_batches: false, ..SessionSettings::default() };
        let source = ScriptedSource::frames(&[&[2]]);
        let mut session =
            CaptureSession::begin(fx.ctx_with(settings), "History", source, TagDetector).unwrap();
        let batch = session.run(&CancelToken::new()).unwrap();
        assert!(batch.location.is_some());
    }

    #[test]
    fn test_window_bounds_frames_processed() {
        let fx = Fixture::new();
        let settings =
            SessionSettings { window: Duration::from_secs(3), ..SessionSettings::default() };
        // Only the first two frames fit inside a three-tick window.
        let source = ScriptedSource::frames(&[&[1], &[2], &[3], &[3]]);
        let mut session =
            CaptureSession::begin(fx.ctx_with(settings), "Math", source, TagDetector).unwrap();
        let batch = session.run(&CancelToken::new()).unwrap();
        assert_eq!(ids(&batch.records), vec![7, 9]);
    }

    #[test]
    fn test_empty_source_backs_off_until_deadline() {
        let mut fx = Fixture::new();
        let clock = Arc::new(SleepClock::default());
        fx.clock = clock.clone();
        let settings = SessionSettings {
            window: Duration::from_secs(1),
            idle_poll: Duration::from_millis(50),
            ..SessionSettings::default()
        };
        let source = EmptySource::default();
        let pulls = source.pulls.clone();

        let start = clock.now();
        let mut session =
            CaptureSession::begin(fx.ctx_with(settings), "Math", source, TagDetector).unwrap();
        let batch = session.run(&CancelToken::new()).unwrap();

        assert_eq!(batch.end, SessionEnd::DeadlineReached);
        assert_eq!(pulls.load(Ordering::SeqCst), 20);
        // The last back-off is cut short at the deadline.
        assert_eq!(clock.now() - start, Duration::from_secs(1));
    }

    #[test]
    fn test_persist_failure_is_surfaced() {
        let fx = Fixture::new();
        std::fs::write(fx.store.root(), "blocks the directory").unwrap();
        let mut session = fx.begin(&[&[1]]);
        let err = session.run(&CancelToken::new()).unwrap_err();
        assert!(matches!(err, SessionError::Persist(_)));
        assert_eq!(session.records().len(), 1);
    }

    #[test]
    fn test_finalized_session_is_read_only() {
        let fx = Fixture::new();
        let mut session = fx.begin(&[&[1]]);
        session.run(&CancelToken::new()).unwrap();

        assert!(matches!(session.step(), Err(SessionError::AlreadyFinalized)));
        assert!(matches!(
            session.finish(SessionEnd::DeadlineReached),
            Err(SessionError::AlreadyFinalized)
        ));
    }

    #[test]
    fn test_new_session_can_record_same_identity_again() {
        let fx = Fixture::new();
        for _ in 0..2 {
            let batch = fx.begin(&[&[1]]).run(&CancelToken::new()).unwrap();
            assert_eq!(batch.records.len(), 1);
        }
        assert_eq!(fx.store.merge_subject("Math").unwrap().rows[0].sessions_present, 2);
    }

    #[test]
    fn test_retrain_does_not_affect_running_session() {
        let fx = Fixture::new();
        let mut session = fx.begin(&[&[1]]);
        // Swap in a model that no longer recognizes tag 1.
        fx.models.install(TagRecognizer::new(&[]));

        let batch = session.run(&CancelToken::new()).unwrap();
        assert_eq!(batch.records.len(), 1);
    }
}
