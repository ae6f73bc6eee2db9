//! Scripted matcher and frame source doubles shared by unit tests.

use crate::cancel::CancelToken;
use crate::matcher::{ExtractError, FaceMatcher};
use crate::source::{CaptureError, Frame, FrameSource};
use crate::types::Descriptor;
use image::RgbImage;
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

pub fn desc(values: &[f32]) -> Descriptor {
    Descriptor::new(values.to_vec())
}

/// Returns one scripted extraction result per call; empty (no face) once the script runs out.
#[derive(Default)]
pub struct ScriptedMatcher {
    script: VecDeque<Result<Vec<Descriptor>, String>>,
    pub extract_calls: usize,
}

impl ScriptedMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faces(mut self, faces: Vec<Descriptor>) -> Self {
        self.script.push_back(Ok(faces));
        self
    }

    pub fn no_face(self) -> Self {
        self.faces(Vec::new())
    }

    pub fn no_faces(mut self, n: usize) -> Self {
        for _ in 0..n {
            self = self.no_face();
        }
        self
    }

    pub fn failure(mut self, msg: &str) -> Self {
        self.script.push_back(Err(msg.to_string()));
        self
    }
}

impl FaceMatcher for ScriptedMatcher {
    fn extract(&mut self, _image: &RgbImage) -> Result<Vec<Descriptor>, ExtractError> {
        self.extract_calls += 1;
        match self.script.pop_front() {
            Some(Ok(faces)) => Ok(faces),
            Some(Err(msg)) => Err(ExtractError::Other(msg)),
            None => Ok(Vec::new()),
        }
    }

    fn compare(&self, a: &Descriptor, b: &Descriptor) -> f32 {
        a.similarity(b)
    }
}

pub enum Step {
    Frame,
    Dark,
    Fail(CaptureError),
}

/// Plays back scripted capture steps, then yields plain frames forever.
pub struct ScriptedSource {
    steps: VecDeque<Step>,
    delay: Option<Duration>,
    cancel_at: Option<(u32, CancelToken)>,
    sequence: u32,
    pub reads: Rc<Cell<u32>>,
    pub released: Rc<Cell<u32>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            steps: VecDeque::new(),
            delay: None,
            cancel_at: None,
            sequence: 0,
            reads: Rc::new(Cell::new(0)),
            released: Rc::new(Cell::new(0)),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push_back(step);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Trip `token` while serving the `read`-th frame (1-based).
    pub fn cancel_on_read(mut self, read: u32, token: CancelToken) -> Self {
        self.cancel_at = Some((read, token));
        self
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        self.reads.set(self.reads.get() + 1);
        if let Some((read, token)) = &self.cancel_at {
            if self.reads.get() == *read {
                token.cancel();
            }
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.sequence += 1;
        let mut frame = Frame::new(RgbImage::new(4, 4), self.sequence);
        match self.steps.pop_front() {
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Dark) => {
                frame.is_dark = true;
                Ok(frame)
            }
            Some(Step::Frame) | None => Ok(frame),
        }
    }

    fn release(&mut self) {
        self.released.set(self.released.get() + 1);
    }
}
