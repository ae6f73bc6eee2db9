//! Verification session state machine.
//!
//! ```text
//! Idle --enroll--> Enrolled --begin_matching--> Matching --complete--> Verified
//!   ^                 |  ^                         |  \--complete/abort--> Failed
//!   |                 |  '--enroll (replace)       |                         |
//!   '------------------------- try_again ----------+-------------------------'
//! ```
//!
//! `Verified` is terminal until `try_again`; a positive decision is never re-evaluated.

use crate::cancel::CancelToken;
use crate::enroll::{enroll_reference, EnrollError};
use crate::live::{run_live_match, LiveMatchError, LiveMatchReport, LiveMatchSettings, StopReason};
use crate::matcher::FaceMatcher;
use crate::source::FrameSource;
use crate::types::{MatchDecision, ReferenceDescriptor};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Enrolled,
    Matching,
    Verified,
    Failed,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("cannot {action} while session is {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: SessionState,
    },
    #[error(transparent)]
    Input(#[from] EnrollError),
    #[error(transparent)]
    Live(#[from] LiveMatchError),
}

/// Tagged result handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Verified,
    NotVerified(StopReason),
    /// Offline two-photo comparison: no probe face crossed the threshold.
    PairMismatch,
    InputRejected(String),
    DeviceFailure(String),
    MatcherFailure(String),
}

impl VerificationOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationOutcome::Verified)
    }

    pub fn from_live_error(error: &LiveMatchError) -> Self {
        match error {
            LiveMatchError::Device(e) => VerificationOutcome::DeviceFailure(e.to_string()),
            other => VerificationOutcome::MatcherFailure(other.to_string()),
        }
    }

    pub fn from_enroll_error(error: &EnrollError) -> Self {
        match error {
            EnrollError::Extractor(e) => VerificationOutcome::MatcherFailure(e.to_string()),
            EnrollError::DescriptorMismatch { .. } => VerificationOutcome::MatcherFailure(error.to_string()),
            other => VerificationOutcome::InputRejected(other.to_string()),
        }
    }

    /// Outcome of an offline comparison, which reads no frames.
    pub fn from_pair_decision(decision: MatchDecision) -> Self {
        match decision {
            MatchDecision::Verified => VerificationOutcome::Verified,
            MatchDecision::NotVerified => VerificationOutcome::PairMismatch,
        }
    }
}

pub struct VerificationSession {
    id: Uuid,
    state: SessionState,
    reference: Option<ReferenceDescriptor>,
    outcome: Option<VerificationOutcome>,
}

impl Default for VerificationSession {
    fn default() -> Self {
        Self::new()
    }
}

impl VerificationSession {
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(session = %id, "session created");
        Self {
            id,
            state: SessionState::Idle,
            reference: None,
            outcome: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn reference(&self) -> Option<&ReferenceDescriptor> {
        self.reference.as_ref()
    }

    /// Last terminal outcome, or the input error that kept the session from enrolling.
    pub fn outcome(&self) -> Option<&VerificationOutcome> {
        self.outcome.as_ref()
    }

    /// Install the reference descriptor. Replaces an earlier one while still `Enrolled`.
    pub fn enroll(&mut self, reference: ReferenceDescriptor) -> Result<(), SessionError> {
        self.expect_state("enroll", &[SessionState::Idle, SessionState::Enrolled])?;
        if self.reference.is_some() {
            tracing::info!(session = %self.id, "replacing reference descriptor");
        }
        self.reference = Some(reference);
        self.outcome = None;
        self.state = SessionState::Enrolled;
        Ok(())
    }

    /// Decode an upload, extract its descriptor, and enroll it.
    ///
    /// On failure the session keeps its state and records an input outcome.
    pub fn enroll_upload<M: FaceMatcher + ?Sized>(
        &mut self,
        matcher: &mut M,
        bytes: &[u8],
        max_bytes: u64,
    ) -> Result<(), SessionError> {
        self.expect_state("enroll", &[SessionState::Idle, SessionState::Enrolled])?;
        match enroll_reference(matcher, bytes, max_bytes) {
            Ok(reference) => self.enroll(reference),
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "enrollment rejected");
                self.outcome = Some(VerificationOutcome::from_enroll_error(&e));
                Err(e.into())
            }
        }
    }

    /// Enter `Matching` and hand out the reference the loop compares against.
    pub fn begin_matching(&mut self) -> Result<&ReferenceDescriptor, SessionError> {
        self.expect_state("begin matching", &[SessionState::Enrolled])?;
        let missing = SessionError::InvalidTransition {
            action: "begin matching",
            state: self.state,
        };
        if self.reference.is_none() {
            return Err(missing);
        }
        self.state = SessionState::Matching;
        tracing::info!(session = %self.id, "matching started");
        self.reference.as_ref().ok_or(missing)
    }

    /// Record the loop's decision and move to `Verified` or `Failed`.
    pub fn complete(&mut self, report: &LiveMatchReport) -> Result<SessionState, SessionError> {
        self.expect_state("complete", &[SessionState::Matching])?;
        let (state, outcome) = match report.decision {
            MatchDecision::Verified => (SessionState::Verified, VerificationOutcome::Verified),
            MatchDecision::NotVerified => (
                SessionState::Failed,
                VerificationOutcome::NotVerified(report.stop),
            ),
        };
        self.state = state;
        self.outcome = Some(outcome);
        tracing::info!(session = %self.id, state = ?state, attempts = report.attempts, "session finished");
        Ok(state)
    }

    /// Move to `Failed` after a loop error, keeping the error class in the outcome.
    pub fn abort(&mut self, error: &LiveMatchError) -> Result<SessionState, SessionError> {
        self.expect_state("abort", &[SessionState::Matching])?;
        self.state = SessionState::Failed;
        self.outcome = Some(VerificationOutcome::from_live_error(error));
        tracing::warn!(session = %self.id, error = %error, "session aborted");
        Ok(self.state)
    }

    /// Drop the reference and all results, returning to `Idle` under a fresh session id.
    pub fn try_again(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Matching {
            return Err(SessionError::InvalidTransition {
                action: "try again",
                state: self.state,
            });
        }
        let previous = self.id;
        *self = Self::new();
        tracing::info!(previous = %previous, session = %self.id, "session reset");
        Ok(())
    }

    /// Run the live-match loop for this session: `Enrolled -> Matching -> Verified | Failed`.
    pub fn run_live<S, M>(
        &mut self,
        source: S,
        matcher: &mut M,
        settings: &LiveMatchSettings,
        cancel: &CancelToken,
    ) -> Result<LiveMatchReport, SessionError>
    where
        S: FrameSource,
        M: FaceMatcher + ?Sized,
    {
        let reference = self.begin_matching()?;
        let result = run_live_match(reference, source, matcher, settings, cancel);
        match result {
            Ok(report) => {
                self.complete(&report)?;
                Ok(report)
            }
            Err(e) => {
                self.abort(&e)?;
                Err(e.into())
            }
        }
    }

    fn expect_state(&self, action: &'static str, allowed: &[SessionState]) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                action,
                state: self.state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CaptureError;
    use crate::testing::{desc, ScriptedMatcher, ScriptedSource, Step};
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;

    fn settings(max_attempts: u32) -> LiveMatchSettings {
        LiveMatchSettings {
            max_attempts,
            time_budget: None,
            threshold: 0.5,
            warmup_frames: 0,
        }
    }

    fn png() -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(4, 4))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn enrolled(values: &[f32]) -> VerificationSession {
        let mut session = VerificationSession::new();
        session
            .enroll(ReferenceDescriptor::new(desc(values), "d".into()))
            .unwrap();
        session
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut session = VerificationSession::new();
        assert_eq!(session.state(), SessionState::Idle);

        let mut matcher = ScriptedMatcher::new()
            .faces(vec![desc(&[1.0, 0.0])])
            .faces(vec![desc(&[1.0, 0.0])]);
        session
            .enroll_upload(&mut matcher, &png(), crate::enroll::DEFAULT_MAX_UPLOAD_BYTES)
            .unwrap();
        assert_eq!(session.state(), SessionState::Enrolled);

        let report = session
            .run_live(ScriptedSource::new(), &mut matcher, &settings(3), &CancelToken::new())
            .unwrap();
        assert!(report.decision.is_verified());
        assert_eq!(session.state(), SessionState::Verified);
        assert_eq!(session.outcome(), Some(&VerificationOutcome::Verified));
    }

    #[test]
    fn test_exhaustion_fails_session() {
        let mut session = enrolled(&[1.0, 0.0]);
        let mut matcher = ScriptedMatcher::new();
        session
            .run_live(ScriptedSource::new(), &mut matcher, &settings(2), &CancelToken::new())
            .unwrap();
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(
            session.outcome(),
            Some(&VerificationOutcome::NotVerified(StopReason::AttemptsExhausted))
        );
    }

    #[test]
    fn test_device_error_is_tagged() {
        let mut session = enrolled(&[1.0, 0.0]);
        let source = ScriptedSource::new().step(Step::Fail(CaptureError::SourceUnavailable("unplugged".into())));
        let mut matcher = ScriptedMatcher::new();

        let err = session
            .run_live(source, &mut matcher, &settings(5), &CancelToken::new())
            .unwrap_err();

        assert!(matches!(err, SessionError::Live(LiveMatchError::Device(_))));
        assert_eq!(session.state(), SessionState::Failed);
        let outcome = session.outcome().unwrap();
        assert!(matches!(outcome, VerificationOutcome::DeviceFailure(_)));
        assert!(!outcome.is_verified());
    }

    #[test]
    fn test_input_error_keeps_session_idle() {
        let mut session = VerificationSession::new();
        let mut matcher = ScriptedMatcher::new().no_face();
        let err = session
            .enroll_upload(&mut matcher, &png(), crate::enroll::DEFAULT_MAX_UPLOAD_BYTES)
            .unwrap_err();
        assert!(matches!(err, SessionError::Input(EnrollError::NoFaceDetected)));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(matches!(
            session.outcome(),
            Some(VerificationOutcome::InputRejected(_))
        ));
    }

    #[test]
    fn test_cannot_match_without_reference() {
        let mut session = VerificationSession::new();
        let mut matcher = ScriptedMatcher::new();
        let err = session
            .run_live(ScriptedSource::new(), &mut matcher, &settings(1), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition {
                state: SessionState::Idle,
                ..
            }
        ));
    }

    #[test]
    fn test_verified_is_not_reevaluated() {
        let mut session = enrolled(&[1.0, 0.0]);
        let mut matcher = ScriptedMatcher::new().faces(vec![desc(&[1.0, 0.0])]);
        session
            .run_live(ScriptedSource::new(), &mut matcher, &settings(1), &CancelToken::new())
            .unwrap();
        assert_eq!(session.state(), SessionState::Verified);

        assert!(session.begin_matching().is_err());
        assert!(session
            .enroll(ReferenceDescriptor::new(desc(&[0.0, 1.0]), "x".into()))
            .is_err());
        assert_eq!(session.state(), SessionState::Verified);
    }

    #[test]
    fn test_reenroll_replaces_reference() {
        let mut session = enrolled(&[1.0, 0.0]);
        session
            .enroll(ReferenceDescriptor::new(desc(&[0.0, 1.0]), "second".into()))
            .unwrap();
        assert_eq!(session.reference().unwrap().digest(), "second");
        assert_eq!(session.state(), SessionState::Enrolled);
    }

    #[test]
    fn test_try_again_discards_previous_session() {
        let mut session = enrolled(&[1.0, 0.0]);
        let first_id = session.id();
        let mut matcher = ScriptedMatcher::new().faces(vec![desc(&[1.0, 0.0])]);
        session
            .run_live(ScriptedSource::new(), &mut matcher, &settings(1), &CancelToken::new())
            .unwrap();
        assert_eq!(session.state(), SessionState::Verified);

        session.try_again().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.reference().is_none());
        assert!(session.outcome().is_none());
        assert_ne!(session.id(), first_id);

        // The new reference is unrelated to the old one; the old face must not verify.
        session
            .enroll(ReferenceDescriptor::new(desc(&[0.0, 1.0]), "fresh".into()))
            .unwrap();
        let mut matcher = ScriptedMatcher::new()
            .faces(vec![desc(&[1.0, 0.0])])
            .faces(vec![desc(&[1.0, 0.0])]);
        let report = session
            .run_live(ScriptedSource::new(), &mut matcher, &settings(2), &CancelToken::new())
            .unwrap();
        assert!(!report.decision.is_verified());
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_cancelled_run_fails() {
        let mut session = enrolled(&[1.0, 0.0]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut matcher = ScriptedMatcher::new().faces(vec![desc(&[1.0, 0.0])]);
        session
            .run_live(ScriptedSource::new(), &mut matcher, &settings(3), &cancel)
            .unwrap();
        assert_eq!(
            session.outcome(),
            Some(&VerificationOutcome::NotVerified(StopReason::Cancelled))
        );
    }

    #[test]
    fn test_outcome_json_shape() {
        let json = serde_json::to_value(VerificationOutcome::NotVerified(StopReason::TimeBudgetElapsed)).unwrap();
        assert_eq!(json["outcome"], "not_verified");
        assert_eq!(json["detail"], "time_budget_elapsed");

        let json = serde_json::to_value(VerificationOutcome::Verified).unwrap();
        assert_eq!(json["outcome"], "verified");
    }

    #[test]
    fn test_pair_decision_outcomes() {
        assert_eq!(
            VerificationOutcome::from_pair_decision(MatchDecision::Verified),
            VerificationOutcome::Verified
        );
        let mismatch = VerificationOutcome::from_pair_decision(MatchDecision::NotVerified);
        assert_eq!(mismatch, VerificationOutcome::PairMismatch);
        assert!(!mismatch.is_verified());

        let json = serde_json::to_value(&mismatch).unwrap();
        assert_eq!(json["outcome"], "pair_mismatch");
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn test_pair_errors_name_the_right_input() {
        assert_eq!(
            VerificationOutcome::from_enroll_error(&EnrollError::NoFaceInProbe),
            VerificationOutcome::InputRejected("no face detected in probe photo".into())
        );
        let mismatch = EnrollError::DescriptorMismatch { expected: 2, actual: 3 };
        assert!(matches!(
            VerificationOutcome::from_enroll_error(&mismatch),
            VerificationOutcome::MatcherFailure(_)
        ));
    }
}
