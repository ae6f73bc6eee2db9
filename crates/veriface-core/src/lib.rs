//! veriface-core: Reference enrollment and bounded live face matching.
//!
//! The live-match loop and session state machine are written against two
//! capabilities, [`FaceMatcher`] and [`FrameSource`]. [`OnnxFaceMatcher`]
//! provides the production matcher (SCRFD detection + ArcFace descriptors on
//! ONNX Runtime).

pub mod alignment;
pub mod cancel;
pub mod detector;
pub mod enroll;
pub mod live;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod session;
pub mod source;
pub mod types;

#[cfg(test)]
mod testing;

pub use cancel::CancelToken;
pub use enroll::{enroll_reference, enroll_reference_file, verify_pair, EnrollError};
pub use live::{run_live_match, LiveMatchError, LiveMatchReport, LiveMatchSettings, StopReason};
pub use matcher::{ExtractError, FaceMatcher, Metric};
pub use pipeline::{default_model_dir, OnnxFaceMatcher};
pub use session::{SessionError, SessionState, VerificationOutcome, VerificationSession};
pub use source::{CaptureError, Frame, FrameSource};
pub use types::{BoundingBox, Descriptor, MatchDecision, ReferenceDescriptor};
