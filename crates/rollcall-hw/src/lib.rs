//! rollcall-hw — Frame sources for attendance capture.
//!
//! Provides the `FrameSource` contract, V4L2 camera capture, and a replay
//! source that reads image files from a directory.

pub mod camera;
pub mod frame;
pub mod replay;
pub mod source;

pub use camera::{Camera, CameraError, CameraSource, PixelFormat};
pub use frame::Frame;
pub use replay::ReplaySource;
pub use source::{FrameSource, FrameSourceError};
