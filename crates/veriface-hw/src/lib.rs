//! veriface-hw: V4L2 camera capture for the live-match loop.
//!
//! [`Camera`] negotiates an RGB-convertible pixel format and implements
//! [`veriface_core::FrameSource`].

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
