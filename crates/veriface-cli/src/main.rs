mod config;
mod ui;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use veriface_core::{
    enroll_reference_file, verify_pair, CancelToken, FrameSource, LiveMatchReport, LiveMatchSettings,
    OnnxFaceMatcher, SessionError, VerificationOutcome, VerificationSession,
};
use veriface_hw::frame::avg_brightness;
use veriface_hw::Camera;

#[derive(Parser)]
#[command(name = "veriface", about = "Verify a live camera face against a reference photo")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/veriface/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Camera device, overrides the config file
    #[arg(long, global = true)]
    device: Option<String>,
    /// Print machine-readable JSON instead of banners
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a reference photo and match it against the live camera
    Verify {
        /// Reference photo (JPEG or PNG)
        #[arg(short, long)]
        reference: PathBuf,
        /// Do not offer to try again after a failure
        #[arg(long)]
        no_retry: bool,
    },
    /// Check that a reference photo is usable and print its summary
    Enroll {
        #[arg(short, long)]
        reference: PathBuf,
    },
    /// Decide whether two photos show the same person
    Compare { reference: PathBuf, probe: PathBuf },
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics
    Test {
        /// Number of frames to capture
        #[arg(short, long, default_value_t = 10)]
        frames: u32,
        /// Save the last frame as PNG
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct VerifyRecord<'a> {
    session: String,
    result: &'a VerificationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a LiveMatchReport>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::load(cli.config.as_deref())?;
    if let Some(device) = cli.device {
        cfg.camera_device = device;
    }
    tracing::debug!(?cfg, "configuration loaded");

    match cli.command {
        Commands::Verify { reference, no_retry } => {
            let cancel = CancelToken::new();
            let matching = Arc::new(AtomicBool::new(false));
            let (watcher, watched) = (cancel.clone(), matching.clone());
            tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    match on_interrupt(watched.load(Ordering::SeqCst), &watcher) {
                        Interrupt::Cancel => {
                            tracing::info!("interrupt received, cancelling verification");
                            watcher.cancel();
                        }
                        Interrupt::Exit => std::process::exit(130),
                    }
                }
            });

            let json = cli.json;
            // V4L2 streams are driven from a blocking thread.
            let verified = tokio::task::spawn_blocking(move || {
                run_verify(&cfg, &reference, json, !no_retry, &cancel, &matching)
            })
            .await
            .context("verification task panicked")??;
            Ok(exit_code(verified))
        }
        Commands::Enroll { reference } => run_enroll(&cfg, &reference, cli.json),
        Commands::Compare { reference, probe } => run_compare(&cfg, &reference, &probe, cli.json),
        Commands::Devices => {
            run_devices(cli.json);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Test { frames, save } => run_camera_test(&cfg, frames, save.as_deref()),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    /// Let the live loop stop at its next frame and release the camera.
    Cancel,
    /// Nothing to unwind: model loading, the try-again prompt, or a second Ctrl-C.
    Exit,
}

fn on_interrupt(matching: bool, cancel: &CancelToken) -> Interrupt {
    if matching && !cancel.is_cancelled() {
        Interrupt::Cancel
    } else {
        Interrupt::Exit
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn load_matcher(cfg: &Config) -> Result<OnnxFaceMatcher> {
    OnnxFaceMatcher::load(&cfg.model_dir, cfg.metric)
        .with_context(|| format!("loading face models from {}", cfg.model_dir.display()))
}

fn read_reference(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading reference photo {}", path.display()))
}

fn run_verify(
    cfg: &Config,
    reference: &Path,
    json: bool,
    interactive: bool,
    cancel: &CancelToken,
    matching: &AtomicBool,
) -> Result<bool> {
    let bytes = read_reference(reference)?;
    let mut matcher = load_matcher(cfg)?;
    let settings = cfg.live_settings();

    let mut camera = match Camera::open(&cfg.camera_device) {
        Ok(camera) => camera,
        Err(e) => {
            tracing::error!(device = %cfg.camera_device, error = %e, "camera open failed");
            let outcome = VerificationOutcome::DeviceFailure(e.to_string());
            print_outcome(cfg, None, &outcome, None, json)?;
            return Ok(false);
        }
    };

    let mut session = VerificationSession::new();
    loop {
        let (outcome, report) = run_session(
            &mut session,
            &mut matcher,
            &mut camera,
            &bytes,
            cfg,
            &settings,
            cancel,
            matching,
        );
        print_outcome(cfg, Some(&session), &outcome, report.as_ref(), json)?;

        if outcome.is_verified() {
            return Ok(true);
        }
        if !interactive || json || cancel.is_cancelled() {
            return Ok(false);
        }
        let again = ui::prompt_try_again(&mut std::io::stdin().lock(), &mut std::io::stderr())?;
        if !again {
            return Ok(false);
        }
        session.try_again()?;
    }
}

/// One pass through a session: enroll the upload, then run the live loop.
fn run_session(
    session: &mut VerificationSession,
    matcher: &mut OnnxFaceMatcher,
    camera: &mut Camera,
    bytes: &[u8],
    cfg: &Config,
    settings: &LiveMatchSettings,
    cancel: &CancelToken,
    matching: &AtomicBool,
) -> (VerificationOutcome, Option<LiveMatchReport>) {
    if let Err(e) = session.enroll_upload(matcher, bytes, cfg.max_upload_bytes) {
        return (recorded_outcome(session, &e), None);
    }
    matching.store(true, Ordering::SeqCst);
    let result = session.run_live(&mut *camera, matcher, settings, cancel);
    matching.store(false, Ordering::SeqCst);
    match result {
        Ok(report) => {
            let outcome = session
                .outcome()
                .cloned()
                .unwrap_or(VerificationOutcome::NotVerified(report.stop));
            (outcome, Some(report))
        }
        Err(e) => (recorded_outcome(session, &e), None),
    }
}

fn recorded_outcome(session: &VerificationSession, error: &SessionError) -> VerificationOutcome {
    session
        .outcome()
        .cloned()
        .unwrap_or_else(|| VerificationOutcome::MatcherFailure(error.to_string()))
}

fn print_outcome(
    cfg: &Config,
    session: Option<&VerificationSession>,
    outcome: &VerificationOutcome,
    report: Option<&LiveMatchReport>,
    json: bool,
) -> Result<()> {
    if json {
        let record = VerifyRecord {
            session: session.map(|s| s.id().to_string()).unwrap_or_default(),
            result: outcome,
            report,
        };
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        if let Some(report) = report {
            println!(
                "Checked {} frame(s) in {} ms ({} without a face, {} dark, {} dropped)",
                report.attempts,
                report.elapsed_ms,
                report.frames_without_face,
                report.frames_dark,
                report.frames_dropped
            );
        }
        println!("{}", ui::outcome_banner(outcome, &cfg.support_contact));
    }
    Ok(())
}

fn run_enroll(cfg: &Config, reference: &Path, json: bool) -> Result<ExitCode> {
    let mut matcher = load_matcher(cfg)?;
    match enroll_reference_file(&mut matcher, reference, cfg.max_upload_bytes) {
        Ok(enrolled) => {
            if json {
                let value = json!({
                    "outcome": "enrolled",
                    "digest": enrolled.digest(),
                    "dimension": enrolled.dimension(),
                    "enrolled_at": enrolled.enrolled_at().to_rfc3339(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Reference accepted: {}", reference.display());
                println!("  SHA-256:    {}", enrolled.digest());
                println!("  Descriptor: {} dimensions", enrolled.dimension());
                println!("  Enrolled:   {}", enrolled.enrolled_at().to_rfc3339());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            tracing::warn!(path = %reference.display(), error = %e, "reference rejected");
            let outcome = VerificationOutcome::from_enroll_error(&e);
            print_outcome(cfg, None, &outcome, None, json)?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_compare(cfg: &Config, reference: &Path, probe: &Path, json: bool) -> Result<ExitCode> {
    let reference_bytes = read_reference(reference)?;
    let probe_bytes = std::fs::read(probe).with_context(|| format!("reading probe photo {}", probe.display()))?;
    let mut matcher = load_matcher(cfg)?;

    let outcome = match verify_pair(
        &mut matcher,
        &reference_bytes,
        &probe_bytes,
        cfg.similarity_threshold,
        cfg.max_upload_bytes,
    ) {
        Ok(decision) => VerificationOutcome::from_pair_decision(decision),
        Err(e) => {
            tracing::warn!(error = %e, "comparison rejected");
            VerificationOutcome::from_enroll_error(&e)
        }
    };

    if json {
        let value = json!({
            "reference": reference.display().to_string(),
            "probe": probe.display().to_string(),
            "result": outcome,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", ui::outcome_banner(&outcome, &cfg.support_contact));
    }
    Ok(exit_code(outcome.is_verified()))
}

fn run_devices(json: bool) {
    let devices = Camera::list_devices();
    if json {
        let list: Vec<_> = devices
            .iter()
            .map(|d| json!({ "path": d.path, "name": d.name, "driver": d.driver, "bus": d.bus }))
            .collect();
        println!("{}", serde_json::Value::Array(list));
        return;
    }
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for d in &devices {
        println!("{:<14} {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
}

fn run_camera_test(cfg: &Config, frames: u32, save: Option<&Path>) -> Result<ExitCode> {
    println!("Running camera diagnostics on {}...", cfg.camera_device);
    let mut camera = Camera::open(&cfg.camera_device)
        .with_context(|| format!("opening {}", cfg.camera_device))?;
    println!(
        "  Format: {:?} {}x{} ({:?})",
        camera.pixel_format(),
        camera.width,
        camera.height,
        camera.fourcc
    );

    let start = Instant::now();
    let mut captured = 0u32;
    let mut dark = 0u32;
    let mut dropped = 0u32;
    let mut brightness_sum = 0.0f32;
    let mut last = None;

    for _ in 0..frames {
        match camera.next_frame() {
            Ok(frame) => {
                let brightness = avg_brightness(&frame.image);
                println!(
                    "  frame seq={:<6} brightness={:>6.1}{}",
                    frame.sequence,
                    brightness,
                    if frame.is_dark { "  (dark)" } else { "" }
                );
                captured += 1;
                brightness_sum += brightness;
                if frame.is_dark {
                    dark += 1;
                }
                last = Some(frame);
            }
            Err(e) if e.is_fatal() => {
                camera.release();
                return Err(e).context("camera stopped responding");
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame dropped");
                dropped += 1;
            }
        }
    }
    camera.release();

    let elapsed = start.elapsed();
    println!("Captured {captured}/{frames} frames in {:.2}s", elapsed.as_secs_f32());
    if captured > 0 {
        println!(
            "  Mean brightness {:.1}, {dark} dark, {dropped} dropped, {:.1} fps",
            brightness_sum / captured as f32,
            captured as f32 / elapsed.as_secs_f32().max(f32::EPSILON)
        );
    }

    if let (Some(path), Some(frame)) = (save, last.as_ref()) {
        frame
            .image
            .save(path)
            .with_context(|| format!("saving frame to {}", path.display()))?;
        println!("  Saved last frame to {}", path.display());
    }

    Ok(exit_code(captured > 0))
}
