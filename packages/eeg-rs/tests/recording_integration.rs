use eeg_rs::{
    AcquisitionPipeline, ChannelBridge, ControlAction, EvaluationResult, MachineState,
    ManualScheduler, PipelineConfig, Prediction, RecordingBridge, SensorFrame, SessionEvent,
    SilentOutput, Stage, TokioScheduler,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Helper to build a pipeline on a deterministic clock
fn manual_pipeline(
    config: PipelineConfig,
) -> (AcquisitionPipeline, Arc<ManualScheduler>, RecordingBridge) {
    let scheduler = Arc::new(ManualScheduler::new());
    let bridge = RecordingBridge::new();
    let pipeline = AcquisitionPipeline::new(
        config,
        scheduler.clone(),
        Arc::new(bridge.clone()),
        Arc::new(SilentOutput),
    )
    .expect("Failed to create pipeline");
    (pipeline, scheduler, bridge)
}

/// One 40 ms burst of 10 samples per channel plus SNR
fn burst(offset: f64) -> SensorFrame {
    let samples = |base: f64| (0..10).map(|i| base + offset + i as f64 * 0.01).collect();
    SensorFrame::new("ads1299")
        .with_series("fp1", samples(1.0))
        .with_series("fpz", samples(2.0))
        .with_series("fp2", samples(3.0))
        .with_aggregate(
            "snr",
            BTreeMap::from([
                ("fp1".to_string(), 15.2),
                ("fpz".to_string(), 14.8),
                ("fp2".to_string(), 15.5),
            ]),
        )
}

/// Feed bursts every 40 ms and render frames every ~16 ms for `ms`
fn run_for(pipeline: &AcquisitionPipeline, scheduler: &ManualScheduler, ms: u64) {
    let mut elapsed = 0;
    while elapsed < ms {
        if elapsed % 40 == 0 {
            pipeline.on_message(&burst(0.0));
        }
        if elapsed % 16 == 0 {
            pipeline.on_frame();
        }
        scheduler.advance_ms(8);
        elapsed += 8;
    }
}

#[test]
fn test_full_protocol_run() {
    let (pipeline, scheduler, bridge) = manual_pipeline(PipelineConfig::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    pipeline
        .machine()
        .set_event_callback(move |event| sink.lock().push(event));

    pipeline.start(17).expect("start failed");
    run_for(&pipeline, &scheduler, 100_000);

    assert!(pipeline.machine().is_shutting_down());
    let actions: Vec<(ControlAction, u8)> = bridge
        .commands()
        .iter()
        .take(6)
        .map(|c| (c.action, c.diagnosis_stage))
        .collect();
    assert_eq!(
        actions,
        vec![
            (ControlAction::Start, 1),
            (ControlAction::Stage, 2),
            (ControlAction::Stage, 3),
            (ControlAction::Evaluate, 3),
            (ControlAction::Stage, 4),
            (ControlAction::Stop, 4),
        ]
    );
    assert!(bridge.commands().iter().all(|c| c.diagnosis_id == 17));

    // Data keeps arriving during the grace period and each frame repeats stop
    run_for(&pipeline, &scheduler, 1_200);
    assert_eq!(pipeline.machine().state(), MachineState::Idle);
    assert!(bridge.count(ControlAction::Stop) > 1);

    let stages: Vec<Stage> = events
        .lock()
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StageChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(stages, vec![Stage::Two, Stage::Three, Stage::Four]);

    let status = pipeline.status();
    assert_eq!(status.aggregates["snr"]["fpz"], 14.8);
    assert!((status.latest_values["fp1"] - 1.09).abs() < 1e-9);

    println!("✓ Full protocol run passed");
}

#[test]
fn test_auto_evaluation_fires_once_despite_many_flushes() {
    let (pipeline, scheduler, bridge) = manual_pipeline(PipelineConfig::default());
    pipeline.start(5).expect("start failed");

    run_for(&pipeline, &scheduler, 90_000);
    assert_eq!(pipeline.machine().current_stage(), Some(Stage::Four));
    run_for(&pipeline, &scheduler, 9_000);

    let evaluations: Vec<u8> = bridge
        .commands()
        .iter()
        .filter(|c| c.action == ControlAction::Evaluate)
        .map(|c| c.diagnosis_stage)
        .collect();
    assert_eq!(evaluations, vec![3]);
}

#[test]
fn test_shutdown_drops_data_until_idle() {
    let (pipeline, scheduler, _) = manual_pipeline(PipelineConfig::default());
    pipeline.start(1).expect("start failed");
    pipeline.on_message(&burst(0.0));
    pipeline.on_frame();
    let before = pipeline.registry().window("fp1", 500).expect("fp1 registered");

    pipeline.stop();
    assert!(!pipeline.on_message(&burst(100.0)));
    assert!(!pipeline.stager().enqueue("nope", &[1.0]));

    scheduler.advance_ms(1_000);
    for _ in 0..8 {
        pipeline.on_frame();
    }

    assert_eq!(pipeline.machine().state(), MachineState::Idle);
    assert_eq!(pipeline.registry().window("fp1", 500), Some(before));
}

#[test]
fn test_stager_closed_until_grace_elapses() {
    let (pipeline, scheduler, _) = manual_pipeline(PipelineConfig::default());
    pipeline.start(2).expect("start failed");
    pipeline.stop();

    assert!(!pipeline.stager().enqueue("fp1", &[9.0]));
    assert!(!pipeline.stager().ingest(&burst(0.0)).accepted());

    scheduler.advance_ms(1_000);
    for _ in 0..4 {
        pipeline.on_frame();
    }
    assert_eq!(pipeline.registry().latest("fp1"), Some(0.0));
    assert!(pipeline.stager().is_accepting());
    println!("✓ Direct enqueue during grace test passed");
}

#[test]
fn test_wraparound_under_sustained_load() {
    let mut config = PipelineConfig::default();
    config.capacity = 50;
    config.display_window = 20;
    let (pipeline, _, _) = manual_pipeline(config);

    // Amplitudes stay below the normalization threshold
    for i in 0..30 {
        let samples: Vec<f64> = (0..10).map(|j| (i * 10 + j) as f64 * 0.1).collect();
        pipeline.on_message(&SensorFrame::new("ads1299").with_series("fp1", samples));
        pipeline.stager().flush();
    }

    let window = pipeline.registry().window("fp1", 50).expect("fp1 registered");
    let expected: Vec<f64> = (250..300).map(|v| v as f64 * 0.1).collect();
    assert_eq!(window, expected);
    assert_eq!(pipeline.display_windows()["fp1"].len(), 20);
    assert!(pipeline.registry().stats()[0].storage_len <= 55);
}

#[test]
fn test_evaluation_result_is_recorded() {
    let (pipeline, _, _) = manual_pipeline(PipelineConfig::default());
    pipeline.start(8).expect("start failed");

    pipeline.on_evaluation_result(EvaluationResult {
        diagnosis_id: 8,
        diagnosis_stage: 3,
        prediction_id: 1,
        prediction: Prediction {
            label: "Normal".to_string(),
            probability: 0.8,
            raw_output: vec![0.8, 0.15, 0.05],
        },
        num_records: 12,
        timestamp: 1_700_000_000,
    });

    let status = pipeline.status();
    assert_eq!(
        status.last_evaluation.map(|r| r.prediction.label),
        Some("Normal".to_string())
    );
}

#[tokio::test]
async fn test_tokio_scheduler_drives_short_protocol() {
    let mut config = PipelineConfig::default();
    config.stage_durations_ms = BTreeMap::from([(1, 20), (2, 20), (3, 20), (4, 20)]);
    config.shutdown_grace_ms = 20;

    let scheduler = Arc::new(TokioScheduler::current().expect("inside a runtime"));
    let (bridge, mut rx) = ChannelBridge::new();
    let pipeline = AcquisitionPipeline::new(config, scheduler, Arc::new(bridge), Arc::new(SilentOutput))
        .expect("Failed to create pipeline");

    pipeline.start(2).expect("start failed");

    let mut actions = Vec::new();
    while let Ok(Some(command)) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        actions.push(command.action);
        if command.action == ControlAction::Stop {
            break;
        }
    }

    assert_eq!(
        actions,
        vec![
            ControlAction::Start,
            ControlAction::Stage,
            ControlAction::Stage,
            ControlAction::Evaluate,
            ControlAction::Stage,
            ControlAction::Stop,
        ]
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pipeline.machine().state(), MachineState::Idle);
}
