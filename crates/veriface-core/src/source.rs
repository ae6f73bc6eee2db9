//! Frame-source capability consumed by the live-match loop.

use image::RgbImage;
use std::ops::{Deref, DerefMut};
use std::time::Instant;
use thiserror::Error;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub sequence: u32,
    pub timestamp: Instant,
    /// Set by the source when nearly every pixel is black (emitter off, lens covered).
    pub is_dark: bool,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            sequence,
            timestamp: Instant::now(),
            is_dark: false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// A single frame was lost; the device is still usable.
    #[error("frame dropped: {0}")]
    Dropped(String),
    /// The device cannot be read any more (unplugged, revoked, I/O failure).
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
}

impl CaptureError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::SourceUnavailable(_))
    }
}

/// A live frame source, exclusively owned by one match loop at a time.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Stop streaming and give the device back. Called exactly once per loop run.
    fn release(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for &mut S {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        (**self).next_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Scoped ownership of a [`FrameSource`]; releases it on drop on every exit path.
pub struct SourceGuard<S: FrameSource> {
    source: S,
}

impl<S: FrameSource> SourceGuard<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: FrameSource> Deref for SourceGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.source
    }
}

impl<S: FrameSource> DerefMut for SourceGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

impl<S: FrameSource> Drop for SourceGuard<S> {
    fn drop(&mut self) {
        self.source.release();
        tracing::debug!("frame source released");
    }
}
