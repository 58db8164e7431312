// Acquisition pipeline - wires buffers, stager, maintainer and stage machine
//
// Host integration points:
// - `on_message` for every inbound sensor frame (arrival callback)
// - `on_frame` on every render frame; flushes on the configured cadence
// - `on_evaluation_result` when the backend answers an evaluate command
// - `status` for a serializable snapshot to drive the UI

use crate::bridge::BackendBridge;
use crate::buffer::{BufferRegistry, ChannelBufferStats};
use crate::config::PipelineConfig;
use crate::error::EegResult;
use crate::ingest::{FlushReport, FrameCadence, IngestionStager};
use crate::maintenance::BufferMaintainer;
use crate::message::{EvaluationResult, InboundEnvelope, SensorFrame};
use crate::output::StageOutput;
use crate::protocol::{MachineSettings, MachineState, RecordingSession, RecordingStageMachine, Stage};
use crate::scheduler::Scheduler;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Snapshot of the pipeline for UI consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub state: MachineState,
    pub session: Option<RecordingSession>,
    pub latest_values: BTreeMap<String, f64>,
    pub aggregates: BTreeMap<String, BTreeMap<String, f64>>,
    pub channels: Vec<ChannelBufferStats>,
    pub frames_received: u64,
    pub frames_rejected: u64,
    pub has_new_data: bool,
    pub last_error: Option<String>,
    pub last_evaluation: Option<EvaluationResult>,
}

pub struct AcquisitionPipeline {
    config: PipelineConfig,
    registry: Arc<BufferRegistry>,
    stager: Arc<IngestionStager>,
    maintainer: Arc<BufferMaintainer>,
    machine: RecordingStageMachine,
    scheduler: Arc<dyn Scheduler>,
    cadence: Mutex<FrameCadence>,
    diagnosis_id: AtomicI64,
    frames_received: AtomicU64,
    frames_rejected: AtomicU64,
    parse_error: Mutex<Option<String>>,
}

impl AcquisitionPipeline {
    pub fn new(
        config: PipelineConfig,
        scheduler: Arc<dyn Scheduler>,
        bridge: Arc<dyn BackendBridge>,
        output: Arc<dyn StageOutput>,
    ) -> EegResult<Self> {
        config.validate()?;

        let registry = Arc::new(BufferRegistry::new(
            config.capacity,
            config.display_window,
            &config.channels,
        )?);
        let stager = Arc::new(
            IngestionStager::new(Arc::clone(&registry), config.normalization.clone())
                .with_aggregate_channels(config.aggregate_channels.iter().cloned()),
        );
        let maintainer = Arc::new(BufferMaintainer::new(
            Duration::from_millis(config.maintenance_interval_ms),
            config.compaction_slack,
        ));

        let machine = RecordingStageMachine::new(
            MachineSettings::from_config(&config),
            Arc::clone(&scheduler),
            bridge,
            output,
        );
        {
            let maintainer = Arc::clone(&maintainer);
            let stager = Arc::clone(&stager);
            machine.set_reset_hook(move || maintainer.reset(&stager));
        }
        {
            let stager = Arc::clone(&stager);
            machine.set_intake_hook(move |open| stager.set_accepting(open));
        }

        log::info!(
            "Acquisition pipeline ready: {} channel(s), capacity {}, flush every {} frame(s)",
            config.channels.len(),
            config.capacity,
            config.flush_divisor
        );

        Ok(Self {
            cadence: Mutex::new(FrameCadence::new(config.flush_divisor)),
            config,
            registry,
            stager,
            maintainer,
            machine,
            scheduler,
            diagnosis_id: AtomicI64::new(0),
            frames_received: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
            parse_error: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BufferRegistry> {
        &self.registry
    }

    pub fn stager(&self) -> &Arc<IngestionStager> {
        &self.stager
    }

    pub fn machine(&self) -> &RecordingStageMachine {
        &self.machine
    }

    /// Diagnosis used for recordings started automatically on data
    pub fn set_diagnosis_id(&self, diagnosis_id: i64) {
        self.diagnosis_id.store(diagnosis_id, Ordering::Relaxed);
    }

    /// Start a recording at stage 1
    pub fn start(&self, diagnosis_id: i64) -> EegResult<()> {
        self.set_diagnosis_id(diagnosis_id);
        self.machine.start(diagnosis_id, Stage::One)
    }

    pub fn stop(&self) {
        self.machine.stop();
    }

    /// Handle one inbound sensor frame; false when it was dropped
    pub fn on_message(&self, frame: &SensorFrame) -> bool {
        self.frames_received.fetch_add(1, Ordering::Relaxed);

        if !self.machine.accept_inbound() {
            self.frames_rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if self.config.auto_start_on_data && self.machine.state() == MachineState::Idle {
            let diagnosis_id = self.diagnosis_id.load(Ordering::Relaxed);
            log::info!("Data arrived while idle, starting recording for diagnosis {}", diagnosis_id);
            // A rejected start is recorded as the machine's last error
            let _ = self.machine.start(diagnosis_id, Stage::One);
        }

        let report = self.stager.ingest(frame);
        self.maintainer.maintain(&self.registry, self.scheduler.now());

        if !report.accepted() {
            self.frames_rejected.fetch_add(1, Ordering::Relaxed);
        }
        report.accepted()
    }

    /// Parse a raw bridge message (with or without envelope) and handle it
    pub fn on_raw_message(&self, json: &str) -> bool {
        match InboundEnvelope::parse(json) {
            Ok(frame) => self.on_message(&frame),
            Err(e) => {
                log::warn!("Discarding unparseable inbound message: {}", e);
                *self.parse_error.lock() = Some(e.to_string());
                self.frames_received.fetch_add(1, Ordering::Relaxed);
                self.frames_rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Count a render frame and flush when the cadence is due
    pub fn on_frame(&self) -> Option<FlushReport> {
        let due = self.cadence.lock().tick();
        due.then(|| self.stager.flush())
    }

    pub fn on_evaluation_result(&self, result: EvaluationResult) {
        self.machine.deliver_evaluation(result);
    }

    /// Chart-sized window for every channel
    pub fn display_windows(&self) -> BTreeMap<String, Vec<f64>> {
        self.registry
            .channel_names()
            .into_iter()
            .filter_map(|name| {
                let window = self.registry.display_window(&name)?;
                Some((name, window))
            })
            .collect()
    }

    pub fn last_error(&self) -> Option<String> {
        self.machine
            .last_error()
            .or_else(|| self.stager.last_error())
            .or_else(|| self.parse_error.lock().clone())
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            state: self.machine.state(),
            session: self.machine.session(),
            latest_values: self.registry.latest_values(),
            aggregates: self.stager.aggregates(),
            channels: self.registry.stats(),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            has_new_data: self.stager.has_new_data(),
            last_error: self.last_error(),
            last_evaluation: self.machine.last_evaluation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::RecordingBridge;
    use crate::message::ControlAction;
    use crate::output::SilentOutput;
    use crate::scheduler::ManualScheduler;

    fn pipeline(config: PipelineConfig) -> (AcquisitionPipeline, Arc<ManualScheduler>, RecordingBridge) {
        let scheduler = Arc::new(ManualScheduler::new());
        let bridge = RecordingBridge::new();
        let pipeline = AcquisitionPipeline::new(
            config,
            scheduler.clone(),
            Arc::new(bridge.clone()),
            Arc::new(SilentOutput),
        )
        .unwrap();
        (pipeline, scheduler, bridge)
    }

    fn frame(fp1: Vec<f64>) -> SensorFrame {
        SensorFrame::new("ads1299").with_series("fp1", fp1)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.flush_divisor = 0;
        let result = AcquisitionPipeline::new(
            config,
            Arc::new(ManualScheduler::new()),
            Arc::new(RecordingBridge::new()),
            Arc::new(SilentOutput),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_frames_flush_on_cadence() {
        let (pipeline, _, _) = pipeline(PipelineConfig::default());
        assert!(pipeline.on_message(&frame(vec![1.0, 2.0])));

        let report = pipeline.on_frame().unwrap();
        assert_eq!(report.channels, vec!["fp1"]);

        pipeline.on_message(&frame(vec![3.0]));
        assert!(pipeline.on_frame().is_none());
        assert!(pipeline.on_frame().is_none());
        assert!(pipeline.on_frame().is_none());
        assert_eq!(pipeline.registry().latest("fp1"), Some(2.0));

        assert!(pipeline.on_frame().unwrap().had_data);
        assert_eq!(pipeline.registry().latest("fp1"), Some(3.0));
    }

    #[test]
    fn test_start_resets_buffers() {
        let (pipeline, _, _) = pipeline(PipelineConfig::default());
        pipeline.on_message(&frame(vec![5.0]));
        pipeline.on_frame();
        pipeline.on_message(&frame(vec![6.0]));

        pipeline.start(3).unwrap();
        assert_eq!(pipeline.registry().latest("fp1"), Some(0.0));
        assert_eq!(pipeline.stager().pending_len("fp1"), 0);
    }

    #[test]
    fn test_auto_start_on_data() {
        let mut config = PipelineConfig::default();
        config.auto_start_on_data = true;
        let (pipeline, _, bridge) = pipeline(config);
        pipeline.set_diagnosis_id(21);

        assert!(pipeline.on_message(&frame(vec![1.0])));
        assert_eq!(pipeline.machine().current_stage(), Some(Stage::One));
        assert_eq!(bridge.commands()[0].diagnosis_id, 21);
        assert_eq!(pipeline.stager().pending_len("fp1"), 1);
    }

    #[test]
    fn test_no_auto_start_by_default() {
        let (pipeline, _, bridge) = pipeline(PipelineConfig::default());
        pipeline.on_message(&frame(vec![1.0]));
        assert_eq!(pipeline.machine().state(), MachineState::Idle);
        assert!(bridge.commands().is_empty());
    }

    #[test]
    fn test_raw_messages_and_status() {
        let (pipeline, _, _) = pipeline(PipelineConfig::default());
        assert!(pipeline.on_raw_message(
            r#"{"payload": {"eeg": {"channels": ["fp1", "snr"], "data": {"fp1": [2.5], "snr": {"fp1": 15.0}}}}}"#
        ));
        assert!(!pipeline.on_raw_message("{broken"));
        pipeline.on_frame();

        let status = pipeline.status();
        assert_eq!(status.latest_values["fp1"], 2.5);
        assert_eq!(status.aggregates["snr"]["fp1"], 15.0);
        assert_eq!(status.frames_received, 2);
        assert_eq!(status.frames_rejected, 1);
        assert!(status.has_new_data);
        assert!(status.last_error.is_some());
        assert_eq!(pipeline.display_windows()["fp1"].len(), 125);
    }

    #[test]
    fn test_shutdown_rejects_frames() {
        let (pipeline, scheduler, bridge) = pipeline(PipelineConfig::default());
        pipeline.start(1).unwrap();
        pipeline.stop();

        assert!(!pipeline.on_message(&frame(vec![9.0])));
        assert_eq!(bridge.count(ControlAction::Stop), 2);

        scheduler.advance_ms(1_000);
        pipeline.on_frame();
        assert_eq!(pipeline.registry().latest("fp1"), Some(0.0));
    }

    #[test]
    fn test_direct_enqueue_dropped_during_grace() {
        let (pipeline, scheduler, _) = pipeline(PipelineConfig::default());
        pipeline.start(1).unwrap();
        pipeline.stop();

        assert!(!pipeline.stager().enqueue("fp1", &[9.0]));
        scheduler.advance_ms(1_000);
        for _ in 0..4 {
            pipeline.on_frame();
        }
        assert_eq!(pipeline.machine().state(), MachineState::Idle);
        assert_eq!(pipeline.registry().latest("fp1"), Some(0.0));

        assert!(pipeline.stager().enqueue("fp1", &[2.0]));
    }

    #[test]
    fn test_only_configured_aggregates_kept() {
        let (pipeline, _, _) = pipeline(PipelineConfig::default());
        let frame = SensorFrame::new("ads1299")
            .with_aggregate("snr", BTreeMap::from([("fp1".to_string(), 15.0)]))
            .with_aggregate("quality", BTreeMap::from([("fp1".to_string(), 1.0)]));

        assert!(pipeline.on_message(&frame));
        assert_eq!(
            pipeline.status().aggregates.keys().cloned().collect::<Vec<_>>(),
            vec!["snr".to_string()]
        );
    }
}
