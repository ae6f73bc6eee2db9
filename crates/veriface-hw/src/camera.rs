//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, FrameError};
use image::RgbImage;
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;
use veriface_core::source::{CaptureError, Frame, FrameSource};

/// Fraction of near-black pixels above which a frame is flagged dark.
const DARK_FRAME_THRESHOLD: f32 = 0.95;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("video capture not supported by {0}")]
    CaptureNotSupported(String),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 24-bit RGB.
    Rgb24,
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            _ => None,
        }
    }

    fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
        match self {
            PixelFormat::Rgb24 => frame::rgb24_to_rgb(buf, width, height),
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            PixelFormat::Grey => frame::grey_to_rgb(buf, width, height),
            PixelFormat::Y16 => frame::y16_to_rgb(buf, width, height),
        }
    }
}

/// V4L2 camera device handle.
///
/// Streaming starts on the first [`FrameSource::next_frame`] and stops on
/// [`FrameSource::release`]; the device itself closes on drop.
pub struct Camera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(libc::EBUSY) {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::CaptureNotSupported(device_path.to_string()));
        }

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        // Prefer RGB3, then YUYV; otherwise keep whatever the driver reports.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        for wanted in [b"RGB3", b"YUYV"] {
            if PixelFormat::from_fourcc(fmt.fourcc) == Some(PixelFormat::Rgb24) {
                break;
            }
            let mut request = fmt;
            request.fourcc = FourCC::new(wanted);
            // The driver may substitute another format; track what it actually applied.
            if let Ok(negotiated) = device.set_format(&request) {
                fmt = negotiated;
                if fmt.fourcc == request.fourcc {
                    break;
                }
            }
        }

        let pixel_format = PixelFormat::from_fourcc(fmt.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need RGB3, YUYV, GREY, or Y16)",
                fmt.fourcc
            ))
        })?;

        tracing::info!(
            width = fmt.width,
            height = fmt.height,
            fourcc = ?fmt.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            stream: None,
            width: fmt.width,
            height: fmt.height,
            device_path: device_path.to_string(),
            fourcc: fmt.fourcc,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    fn start_stream(&mut self) -> Result<(), CaptureError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| classify_io_error("failed to create mmap stream", &e))?;
            tracing::debug!(device = %self.device_path, "stream started");
            self.stream = Some(stream);
        }
        Ok(())
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let dev = Device::with_path(&path).ok()?;
                let caps = dev.query_caps().ok()?;
                if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    path,
                    name: caps.card.clone(),
                    driver: caps.driver.clone(),
                    bus: caps.bus.clone(),
                })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        self.start_stream()?;
        let (pixel_format, width, height) = (self.pixel_format, self.width, self.height);
        let Some(stream) = self.stream.as_mut() else {
            return Err(CaptureError::SourceUnavailable("stream not started".into()));
        };

        let (buf, meta) = stream
            .next()
            .map_err(|e| classify_io_error("failed to dequeue buffer", &e))?;
        let sequence = meta.sequence;

        let image = pixel_format
            .to_rgb(buf, width, height)
            .map_err(|e| CaptureError::Dropped(format!("{pixel_format:?} conversion failed: {e}")))?;

        let mut frame = Frame::new(image, sequence);
        frame.is_dark = frame::is_dark_frame(&frame.image, DARK_FRAME_THRESHOLD);
        Ok(frame)
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(device = %self.device_path, "stream stopped");
        }
    }
}

/// Errors that mean the device is gone are fatal; anything else costs one frame.
fn classify_io_error(context: &str, e: &io::Error) -> CaptureError {
    match e.raw_os_error() {
        Some(libc::ENODEV) | Some(libc::ENXIO) | Some(libc::EIO) | Some(libc::ESHUTDOWN) => {
            CaptureError::SourceUnavailable(format!("{context}: {e}"))
        }
        _ => CaptureError::Dropped(format!("{context}: {e}")),
    }
}
