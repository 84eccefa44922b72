//! The frame source contract used by enrollment and capture sessions.

use crate::camera::CameraError;
use crate::frame::{Frame, FrameError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameSourceError {
    #[error("frame source is not open")]
    NotOpen,
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("frame source I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame source failed: {0}")]
    Failed(String),
}

/// A sequence of grayscale frames.
///
/// `next_frame` may block briefly while waiting for the device. `Ok(None)`
/// means no usable frame this time (dark frame, nothing queued); callers
/// skip the iteration and ask again. An `Err` means the source has failed.
pub trait FrameSource {
    fn open(&mut self) -> Result<(), FrameSourceError>;
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError>;
    fn close(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn open(&mut self) -> Result<(), FrameSourceError> {
        (**self).open()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
        (**self).next_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
