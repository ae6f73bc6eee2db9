//! Terminal rendering for session outcomes and the try-again prompt.

use std::io::{self, BufRead, Write};
use veriface_core::{StopReason, VerificationOutcome};

const RULE: &str = "==========================================";

fn banner(title: &str, lines: &[String]) -> String {
    let mut out = format!("{RULE}\n  {title}\n{RULE}");
    for line in lines {
        out.push_str("\n  ");
        out.push_str(line);
    }
    out
}

fn stop_reason_line(reason: StopReason) -> &'static str {
    match reason {
        StopReason::Matched => "Face matched",
        StopReason::AttemptsExhausted => "No matching face found in the captured frames",
        StopReason::TimeBudgetElapsed => "Time ran out before a matching face was found",
        StopReason::Cancelled => "Verification was cancelled",
    }
}

/// Render the banner shown once a session reaches a terminal outcome.
pub fn outcome_banner(outcome: &VerificationOutcome, support_contact: &str) -> String {
    let contact = format!("Please try again or contact support: {support_contact}");
    match outcome {
        VerificationOutcome::Verified => banner("Verified Successfully! You may now proceed", &[]),
        VerificationOutcome::NotVerified(reason) => banner(
            "Verification Failed",
            &[stop_reason_line(*reason).to_string(), contact],
        ),
        VerificationOutcome::PairMismatch => banner(
            "Verification Failed",
            &["The two photos do not show the same person".to_string(), contact],
        ),
        VerificationOutcome::InputRejected(detail) => banner(
            "Photo Rejected",
            &[
                detail.clone(),
                "Upload a clear JPEG or PNG showing your face".to_string(),
            ],
        ),
        VerificationOutcome::DeviceFailure(detail) => banner(
            "Verification Failed",
            &[format!("Camera unavailable: {detail}"), contact],
        ),
        VerificationOutcome::MatcherFailure(detail) => banner(
            "Verification Failed",
            &[format!("Face matcher error: {detail}"), contact],
        ),
    }
}

/// Ask whether to start a new session. EOF or anything but y/yes means no.
pub fn prompt_try_again<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> io::Result<bool> {
    write!(output, "Try again? [y/N] ")?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        writeln!(output)?;
        return Ok(false);
    }
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
