//! Bounded live-match loop.
//!
//! Polls a [`FrameSource`] one frame at a time, extracts descriptors with a
//! [`FaceMatcher`], and stops on the first descriptor that crosses the
//! similarity threshold or when the attempt/time budget runs out.
//!
//! Every frame read consumes one attempt, including frames that are dropped,
//! dark, or contain no face. The loop therefore never reads more than
//! `max_attempts` frames after warmup.

use crate::cancel::CancelToken;
use crate::matcher::{crosses_threshold, ExtractError, FaceMatcher};
use crate::source::{CaptureError, FrameSource, SourceGuard};
use crate::types::{MatchDecision, ReferenceDescriptor};
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(2);
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.40;
pub const DEFAULT_WARMUP_FRAMES: usize = 4;

#[derive(Error, Debug)]
pub enum LiveMatchError {
    #[error("camera error: {0}")]
    Device(CaptureError),
    #[error("matcher error: {0}")]
    Extractor(#[from] ExtractError),
    #[error("descriptor length {actual} does not match reference length {expected}")]
    DescriptorMismatch { expected: usize, actual: usize },
}

/// Budget and threshold for one live-match run.
#[derive(Debug, Clone)]
pub struct LiveMatchSettings {
    pub max_attempts: u32,
    /// Wall-clock limit, checked before each frame and measured from the end
    /// of warmup. `None` = attempts only.
    pub time_budget: Option<Duration>,
    pub threshold: f32,
    /// Frames read and thrown away before the first attempt (camera AGC/AE settling).
    pub warmup_frames: usize,
}

impl Default for LiveMatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            time_budget: Some(DEFAULT_TIME_BUDGET),
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            warmup_frames: DEFAULT_WARMUP_FRAMES,
        }
    }
}

/// Why the loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Matched,
    AttemptsExhausted,
    TimeBudgetElapsed,
    Cancelled,
}

/// Summary of a completed run. Carries the decision, never a score.
#[derive(Debug, Clone, Serialize)]
pub struct LiveMatchReport {
    pub decision: MatchDecision,
    pub stop: StopReason,
    /// Frames read, 1-based index of the matching frame when verified.
    pub attempts: u32,
    pub frames_without_face: u32,
    pub frames_dark: u32,
    pub frames_dropped: u32,
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct Tally {
    attempts: u32,
    frames_without_face: u32,
    frames_dark: u32,
    frames_dropped: u32,
}

/// Run the bounded live-match loop against `reference`.
///
/// `source` is owned for the duration of the call and released on every exit
/// path. Pass `&mut camera` to keep the device open for a later run.
pub fn run_live_match<S, M>(
    reference: &ReferenceDescriptor,
    source: S,
    matcher: &mut M,
    settings: &LiveMatchSettings,
    cancel: &CancelToken,
) -> Result<LiveMatchReport, LiveMatchError>
where
    S: FrameSource,
    M: FaceMatcher + ?Sized,
{
    let mut source = SourceGuard::new(source);

    discard_warmup(&mut *source, settings.warmup_frames, cancel)?;
    let started = Instant::now();

    let mut tally = Tally::default();

    let stop = 'poll: loop {
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }
        if tally.attempts >= settings.max_attempts {
            break StopReason::AttemptsExhausted;
        }
        if let Some(budget) = settings.time_budget {
            if started.elapsed() >= budget {
                break StopReason::TimeBudgetElapsed;
            }
        }

        tally.attempts += 1;
        let attempt = tally.attempts;

        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) if e.is_fatal() => {
                tracing::warn!(attempt, error = %e, "live match: camera lost");
                return Err(LiveMatchError::Device(e));
            }
            Err(e) => {
                tally.frames_dropped += 1;
                tracing::debug!(attempt, error = %e, "live match: frame dropped");
                continue;
            }
        };

        if frame.is_dark {
            tally.frames_dark += 1;
            tracing::debug!(attempt, seq = frame.sequence, "live match: dark frame");
            continue;
        }

        let faces = matcher.extract(&frame.image)?;
        if faces.is_empty() {
            tally.frames_without_face += 1;
            tracing::debug!(attempt, seq = frame.sequence, "live match: no face");
            continue;
        }

        for (face_idx, face) in faces.iter().enumerate() {
            if face.len() != reference.dimension() {
                return Err(LiveMatchError::DescriptorMismatch {
                    expected: reference.dimension(),
                    actual: face.len(),
                });
            }
            let similarity = matcher.compare(reference.descriptor(), face);
            tracing::debug!(attempt, face = face_idx, similarity, "live match: compared");
            if crosses_threshold(similarity, settings.threshold) {
                break 'poll StopReason::Matched;
            }
        }
    };

    let decision = MatchDecision::from(stop == StopReason::Matched);
    let report = LiveMatchReport {
        decision,
        stop,
        attempts: tally.attempts,
        frames_without_face: tally.frames_without_face,
        frames_dark: tally.frames_dark,
        frames_dropped: tally.frames_dropped,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };

    tracing::info!(
        decision = ?report.decision,
        stop = ?report.stop,
        attempts = report.attempts,
        no_face = report.frames_without_face,
        dark = report.frames_dark,
        dropped = report.frames_dropped,
        "live match finished"
    );

    Ok(report)
}

/// Read and drop `count` frames. Stops early on cancellation; the poll loop then reports it.
fn discard_warmup<S: FrameSource + ?Sized>(
    source: &mut S,
    count: usize,
    cancel: &CancelToken,
) -> Result<(), LiveMatchError> {
    if count == 0 {
        return Ok(());
    }
    tracing::debug!(count, "discarding warmup frames");
    for _ in 0..count {
        if cancel.is_cancelled() {
            break;
        }
        match source.next_frame() {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(LiveMatchError::Device(e)),
            Err(_) => {}
        }
    }
    Ok(())
}
