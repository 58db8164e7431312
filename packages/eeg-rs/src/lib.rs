pub mod bridge;
pub mod buffer;
pub mod config;
pub mod error;
pub mod ingest;
pub mod maintenance;
pub mod message;
pub mod output;
pub mod pipeline;
pub mod protocol;
pub mod scheduler;

pub use bridge::{BackendBridge, BridgeError, ChannelBridge, DisconnectedBridge, RecordingBridge};
pub use buffer::{BufferRegistry, ChannelReader, ChannelRingBuffer, CompactableBuffer};
pub use config::{NormalizationConfig, PipelineConfig};
pub use error::{EegError, EegResult};
pub use ingest::{FlushReport, FrameCadence, IngestReport, IngestionStager};
pub use maintenance::{BufferMaintainer, MaintenanceReport};
pub use message::{
    ChannelPayload, ControlAction, ControlCommand, EvaluationResult, InboundEnvelope, Prediction,
    SensorFrame,
};
pub use output::{SilentOutput, StageOutput};
pub use pipeline::{AcquisitionPipeline, PipelineStatus};
pub use protocol::{
    MachineSettings, MachineState, RecordingSession, RecordingStageMachine, SessionEvent, Stage,
    StageDurations,
};
pub use scheduler::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler};
