//! Enrollment capture: collect face crops for a new identity, then register it.

use crate::clock::{CancelToken, Clock};
use rollcall_core::{EnrollmentId, FaceDetector, Identity};
use rollcall_hw::{FrameSource, FrameSourceError};
use rollcall_store::{IdentityRegistry, RegistryError, SampleStore, SampleStoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("display name must not be empty")]
    InvalidName,
    #[error("enrollment id {0} is already registered")]
    DuplicateIdentity(EnrollmentId),
    #[error("enrollment id {0} already has face samples; reset it before re-enrolling")]
    AlreadyEnrolled(EnrollmentId),
    #[error("no face captured for enrollment id {0}")]
    NoFaceCaptured(EnrollmentId),
    #[error("sample store: {0}")]
    Samples(#[source] SampleStoreError),
    #[error("identity registry: {0}")]
    Registry(#[source] RegistryError),
    #[error("frame source: {0}")]
    Source(#[from] FrameSourceError),
}

impl From<SampleStoreError> for EnrollError {
    fn from(e: SampleStoreError) -> Self {
        match e {
            SampleStoreError::AlreadyEnrolled(id) => EnrollError::AlreadyEnrolled(id),
            other => EnrollError::Samples(other),
        }
    }
}

impl From<RegistryError> for EnrollError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DuplicateIdentity(id) => EnrollError::DuplicateIdentity(id),
            RegistryError::InvalidName => EnrollError::InvalidName,
            other => EnrollError::Registry(other),
        }
    }
}

/// Why the capture loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollStop {
    SampleCapReached,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    pub identity: Identity,
    pub samples: usize,
    pub frames: u64,
    pub stopped: EnrollStop,
}

pub struct Enroller<'a> {
    registry: &'a IdentityRegistry,
    samples: &'a SampleStore,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    idle_poll: Duration,
}

impl<'a> Enroller<'a> {
    pub fn new(
        registry: &'a IdentityRegistry,
        samples: &'a SampleStore,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self { registry, samples, clock, timeout, idle_poll: Duration::from_millis(15) }
    }

    /// Back-off after a pull that produced no frame.
    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// Capture face samples for `id` and register it under `display_name`.
    ///
    /// Stops at the sample cap, the timeout, or cancellation. The identity
    /// is registered only if at least one sample was stored; on any failure
    /// the samples written so far are removed.
    pub fn enroll<S: FrameSource, D: FaceDetector>(
        &self,
        id: EnrollmentId,
        display_name: &str,
        mut source: S,
        mut detector: D,
        cancel: &CancelToken,
    ) -> Result<EnrollOutcome, EnrollError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(EnrollError::InvalidName);
        }
        if self.registry.lookup(id)?.is_some() {
            return Err(EnrollError::DuplicateIdentity(id));
        }

        let mut writer = self.samples.open_enrollment(id)?;
        source.open()?;
        tracing::info!(
            enrollment_id = id,
            name = %display_name,
            max = self.samples.max_samples(),
            "enrollment capture started"
        );

        let deadline = self.clock.now() + self.timeout;
        let mut frames = 0u64;
        let captured = loop {
            if writer.is_full() {
                break Ok(EnrollStop::SampleCapReached);
            }
            if cancel.is_cancelled() {
                break Ok(EnrollStop::Cancelled);
            }
            if self.clock.now() >= deadline {
                break Ok(EnrollStop::TimedOut);
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    let remaining = deadline.saturating_duration_since(self.clock.now());
                    self.clock.sleep(self.idle_poll.min(remaining));
                    continue;
                }
                Err(e) => break Err(EnrollError::Source(e)),
            };
            frames += 1;
            let grid = match frame.to_grid() {
                Ok(grid) => grid,
                Err(e) => break Err(EnrollError::Source(e.into())),
            };

            let detections = match detector.detect(&grid) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(
                        enrollment_id = id,
                        seq = frame.sequence,
                        error = %e,
                        "face detection failed; frame skipped"
                    );
                    continue;
                }
            };
            // Largest face only; anyone else in frame is not being enrolled.
            let Some(face) = detections.into_iter().max_by_key(|d| d.region.area()) else {
                continue;
            };
            if let Err(e) = writer.add_sample(&face.face) {
                break Err(e.into());
            }
        };
        source.close();

        let count = writer.count();
        drop(writer);

        let stopped = match captured {
            Ok(stopped) if count > 0 => stopped,
            Ok(_) => {
                tracing::warn!(enrollment_id = id, frames, "no face captured; nothing enrolled");
                self.discard(id);
                return Err(EnrollError::NoFaceCaptured(id));
            }
            Err(e) => {
                self.discard(id);
                return Err(e);
            }
        };

        if let Err(e) = self.registry.register(id, display_name) {
            self.discard(id);
            return Err(e.into());
        }

        if stopped != EnrollStop::SampleCapReached {
            tracing::warn!(
                enrollment_id = id,
                samples = count,
                ?stopped,
                "enrollment ended before the sample cap"
            );
        }
        tracing::info!(
            enrollment_id = id,
            name = %display_name,
            samples = count,
            frames,
            "identity enrolled"
        );

        Ok(EnrollOutcome {
            identity: Identity { enrollment_id: id, display_name: display_name.to_string() },
            samples: count,
            frames,
            stopped,
        })
    }

    fn discard(&self, id: EnrollmentId) {
        match self.samples.reset(id) {
            Ok(removed) => {
                tracing::debug!(enrollment_id = id, removed, "partial enrollment discarded")
            }
            Err(e) => {
                tracing::error!(enrollment_id = id, error = %e, "failed to discard partial samples")
            }
        }
    }
}
