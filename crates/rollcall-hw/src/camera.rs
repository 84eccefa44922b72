//! V4L2 camera capture via the `v4l` crate.
//!
//! [`CameraSource`] opens the device and its mmap stream once, in
//! [`FrameSource::open`], and keeps both until [`FrameSource::close`].

use crate::frame::{self, Frame, FrameError, DARK_FRAME_THRESHOLD};
use crate::source::{FrameSource, FrameSourceError};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const MMAP_BUFFERS: u32 = 4;
const MAX_DEVICE_INDEX: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("{0} is not a video capture device")]
    NotCaptureDevice(String),
    #[error("format negotiation failed: {0}")]
    Format(String),
    #[error("cannot start streaming: {0}")]
    Stream(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

/// A V4L2 capture device found by [`Camera::list_devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
}

/// Pixel layouts the camera can deliver and how each becomes grayscale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2, luma on even bytes.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " => Some(Self::Y16),
            _ => None,
        }
    }

    /// Reduce one raw buffer of `width` x `height` pixels to 8-bit luma.
    pub fn to_grayscale(self, raw: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_grayscale(raw, width, height),
            Self::Y16 => frame::y16_to_grayscale(raw, width, height),
            Self::Grey => {
                let pixels = (width as usize) * (height as usize);
                raw.get(..pixels)
                    .map(<[u8]>::to_vec)
                    .ok_or(FrameError::InvalidLength { expected: pixels, actual: raw.len() })
            }
        }
    }
}

/// An opened V4L2 device with its negotiated capture format.
pub struct Camera {
    device: Device,
    path: String,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Camera {
    /// Open `path` (e.g. `/dev/video0`) and negotiate a grayscale-convertible
    /// format, preferring YUYV at 640x480.
    pub fn open(path: &str) -> Result<Self, CameraError> {
        if !Path::new(path).exists() {
            return Err(CameraError::DeviceNotFound(path.to_string()));
        }
        let device = Device::with_path(path).map_err(|e| match e.raw_os_error() {
            Some(16) => CameraError::DeviceBusy(path.to_string()),
            _ => CameraError::DeviceNotFound(format!("{path}: {e}")),
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(path.to_string()));
        }

        let mut wanted = device.format().map_err(|e| CameraError::Format(e.to_string()))?;
        wanted.fourcc = FourCC::new(b"YUYV");
        wanted.width = REQUESTED_WIDTH;
        wanted.height = REQUESTED_HEIGHT;
        let got = device.set_format(&wanted).map_err(|e| CameraError::Format(e.to_string()))?;
        let format = PixelFormat::from_fourcc(got.fourcc).ok_or_else(|| {
            CameraError::Format(format!("driver chose {}, need YUYV, GREY or Y16", got.fourcc))
        })?;

        tracing::info!(
            device = path,
            card = %caps.card,
            width = got.width,
            height = got.height,
            ?format,
            "camera opened"
        );
        Ok(Self { device, path: path.to_string(), width: got.width, height: got.height, format })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Map the capture buffers and start streaming.
    fn start_stream(&self) -> Result<MmapStream<'static>, CameraError> {
        MmapStream::with_buffers(&self.device, BufType::VideoCapture, MMAP_BUFFERS)
            .map_err(|e| CameraError::Stream(e.to_string()))
    }

    /// Dequeue the next buffer from `stream` as a grayscale frame.
    fn grab(&self, stream: &mut MmapStream<'static>) -> Result<Frame, CameraError> {
        let (raw, meta) =
            stream.next().map_err(|e| CameraError::CaptureFailed(format!("dequeue: {e}")))?;
        let gray = self
            .format
            .to_grayscale(raw, self.width, self.height)
            .map_err(|e| CameraError::CaptureFailed(format!("{:?} buffer: {e}", self.format)))?;
        Ok(Frame {
            is_dark: frame::is_dark_frame(&gray, DARK_FRAME_THRESHOLD),
            data: gray,
            width: self.width,
            height: self.height,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }

    /// Every `/dev/videoN` node that answers as a capture device.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_DEVICE_INDEX)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities.contains(Flags::VIDEO_CAPTURE).then(|| DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                })
            })
            .collect()
    }
}

struct LiveCamera {
    // Declared first so the buffers are unmapped before the device closes.
    stream: MmapStream<'static>,
    camera: Camera,
    dark_frames: usize,
}

/// Frame source backed by a V4L2 camera. Dark frames come back as `Ok(None)`.
pub struct CameraSource {
    device_path: String,
    live: Option<LiveCamera>,
}

impl CameraSource {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self { device_path: device_path.into(), live: None }
    }
}

impl FrameSource for CameraSource {
    fn open(&mut self) -> Result<(), FrameSourceError> {
        if self.live.is_none() {
            let camera = Camera::open(&self.device_path)?;
            let stream = camera.start_stream()?;
            self.live = Some(LiveCamera { stream, camera, dark_frames: 0 });
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
        let live = self.live.as_mut().ok_or(FrameSourceError::NotOpen)?;
        let frame = live.camera.grab(&mut live.stream)?;
        if frame.is_dark {
            live.dark_frames += 1;
            tracing::trace!(seq = frame.sequence, "dark frame dropped");
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn close(&mut self) {
        if let Some(live) = self.live.take() {
            tracing::info!(
                device = live.camera.path(),
                dark_frames = live.dark_frames,
                "camera released"
            );
        }
    }
}
