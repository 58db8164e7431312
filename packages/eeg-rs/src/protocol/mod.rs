// Timed four-stage recording protocol

pub mod machine;
pub mod stage;

pub use machine::{MachineState, RecordingSession, RecordingStageMachine, SessionEvent};
pub use stage::{MachineSettings, Stage, StageDurations};
