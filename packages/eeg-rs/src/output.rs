// Per-stage output (audio cue playback) seam

use crate::protocol::Stage;
use parking_lot::Mutex;
use std::sync::Arc;

pub trait StageOutput: Send + Sync {
    /// Begin the cue for a stage; `cue` is the configured file name, if any
    fn begin_stage(&self, stage: Stage, cue: Option<&str>);

    fn stop(&self);
}

/// Output that plays nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentOutput;

impl StageOutput for SilentOutput {
    fn begin_stage(&self, stage: Stage, cue: Option<&str>) {
        log::debug!("Stage {} cue {:?} (silent output)", stage, cue);
    }

    fn stop(&self) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputCall {
    Begin { stage: Stage, cue: Option<String> },
    Stop,
}

/// Records output calls for inspection
#[derive(Clone, Default)]
pub struct RecordingOutput {
    calls: Arc<Mutex<Vec<OutputCall>>>,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<OutputCall> {
        self.calls.lock().clone()
    }
}

impl StageOutput for RecordingOutput {
    fn begin_stage(&self, stage: Stage, cue: Option<&str>) {
        self.calls.lock().push(OutputCall::Begin {
            stage,
            cue: cue.map(str::to_string),
        });
    }

    fn stop(&self) {
        self.calls.lock().push(OutputCall::Stop);
    }
}
