use crate::cli::SimulateArgs;
use crate::commands::load_config;
use crate::exit_codes;
use crate::output;
use crate::synthetic::{SignalGenerator, SimulatedBackend};
use eeg_rs::config::parse_stage_durations;
use eeg_rs::{
    AcquisitionPipeline, ChannelBridge, ControlCommand, EvaluationResult, MachineState,
    PipelineConfig, SessionEvent, Stage, StageOutput, TokioScheduler,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stage output for a headless run: cues are only logged
struct CueLog;

impl StageOutput for CueLog {
    fn begin_stage(&self, stage: Stage, cue: Option<&str>) {
        log::info!("Stage {} cue: {}", stage, cue.unwrap_or("(none)"));
    }

    fn stop(&self) {
        log::info!("Cue playback stopped");
    }
}

#[derive(Serialize)]
struct SimulationSummary {
    diagnosis_id: i64,
    session_id: Option<String>,
    elapsed_ms: u64,
    bursts_sent: u64,
    bursts_rejected: u64,
    frames_rendered: u64,
    flushes_with_data: u64,
    commands: Vec<ControlCommand>,
    events: Vec<SessionEvent>,
    evaluation: Option<EvaluationResult>,
    latest_values: BTreeMap<String, f64>,
    aggregates: BTreeMap<String, BTreeMap<String, f64>>,
    display_windows: BTreeMap<String, Vec<f64>>,
    last_error: Option<String>,
}

fn effective_config(args: &SimulateArgs) -> Result<PipelineConfig, String> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(ref list) = args.stage_ms {
        let durations = parse_stage_durations(list).map_err(|e| e.to_string())?;
        config.stage_durations_ms.extend(durations);
    }
    if let Some(grace_ms) = args.grace_ms {
        config.shutdown_grace_ms = grace_ms;
    }
    config.validate().map_err(|e| e.to_string())?;

    if let Some(stage) = config.stage_durations_ms.iter().find(|(_, ms)| **ms == 0) {
        return Err(format!(
            "Stage {} has no duration; a simulated run needs every stage timed",
            stage.0
        ));
    }
    if args.frame_ms == 0 || args.burst_ms == 0 {
        return Err("--frame-ms and --burst-ms must be at least 1".to_string());
    }
    Ok(config)
}

/// Upper bound on wall time for a full run
fn run_deadline(config: &PipelineConfig, eval_delay_ms: u64) -> Duration {
    let total_ms = config
        .stage_durations_ms
        .values()
        .fold(0, |acc: u64, ms| acc.saturating_add(*ms));
    Duration::from_millis(
        total_ms
            .saturating_add(config.shutdown_grace_ms)
            .saturating_add(eval_delay_ms)
            .saturating_add(5_000),
    )
}

pub async fn execute(args: SimulateArgs) -> i32 {
    let config = match effective_config(&args) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };

    let scheduler = match TokioScheduler::current() {
        Ok(scheduler) => Arc::new(scheduler),
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    };

    let seed = args.seed.unwrap_or_else(rand::random);
    let deadline = run_deadline(&config, args.eval_delay_ms);
    let total_ms = config
        .stage_durations_ms
        .values()
        .fold(0, |acc: u64, ms| acc.saturating_add(*ms));

    let records = Arc::new(AtomicU64::new(0));
    let (bridge, commands_rx) = ChannelBridge::new();
    let mut backend = SimulatedBackend::spawn(
        commands_rx,
        Duration::from_millis(args.eval_delay_ms),
        seed,
        Arc::clone(&records),
    );

    let mut generator = SignalGenerator::new(
        &config.sensor_id,
        &config.channels,
        config.aggregate_channels.first().map(String::as_str),
        seed,
    );

    let pipeline = match AcquisitionPipeline::new(config, scheduler, Arc::new(bridge), Arc::new(CueLog)) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        let quiet = args.quiet;
        pipeline.machine().set_event_callback(move |event| {
            if !quiet {
                match &event {
                    SessionEvent::StageChanged { to, .. } => eprintln!("  Stage {}", to),
                    SessionEvent::EvaluationRequested { stage, .. } => {
                        eprintln!("  Evaluation requested for stage {}", stage)
                    }
                    SessionEvent::ShuttingDown { stage, .. } => {
                        eprintln!("  Stopping after stage {}", stage)
                    }
                    SessionEvent::Warning { message } => eprintln!("  Warning: {}", message),
                    _ => {}
                }
            }
            events.lock().push(event);
        });
    }

    if !args.quiet {
        eprintln!(
            "Simulating recording for diagnosis {} ({} ms of stages, seed {})...",
            args.diagnosis_id, total_ms, seed
        );
        eprintln!("  Stage 1");
    }

    let started = Instant::now();
    let session_id = match pipeline.start(args.diagnosis_id) {
        Ok(()) => pipeline.machine().session().map(|s| s.session_id),
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    };

    let mut burst_tick = tokio::time::interval(Duration::from_millis(args.burst_ms));
    let mut frame_tick = tokio::time::interval(Duration::from_millis(args.frame_ms));
    let mut bursts_rejected = 0u64;
    let mut frames_rendered = 0u64;
    let mut flushes_with_data = 0u64;
    let mut evaluation_requested = false;
    let mut evaluation = None;

    loop {
        tokio::select! {
            _ = burst_tick.tick() => {
                let frame = generator.next_frame();
                records.store(generator.bursts(), Ordering::Relaxed);
                if !pipeline.on_message(&frame) {
                    bursts_rejected += 1;
                }
            }
            _ = frame_tick.tick() => {
                frames_rendered += 1;
                if let Some(report) = pipeline.on_frame() {
                    if report.had_data {
                        flushes_with_data += 1;
                    }
                }
            }
            Some(result) = backend.next_result() => {
                pipeline.on_evaluation_result(result.clone());
                evaluation = Some(result);
            }
        }

        if !evaluation_requested {
            evaluation_requested = events
                .lock()
                .iter()
                .any(|e| matches!(e, SessionEvent::EvaluationRequested { .. }));
        }
        let finished = pipeline.machine().state() == MachineState::Idle;
        if finished && (evaluation.is_some() || !evaluation_requested) {
            break;
        }
        if started.elapsed() > deadline {
            eprintln!("Error: simulation did not finish within {:?}", deadline);
            return exit_codes::EXECUTION_ERROR;
        }
    }

    let status = pipeline.status();
    let summary = SimulationSummary {
        diagnosis_id: args.diagnosis_id,
        session_id,
        elapsed_ms: started.elapsed().as_millis() as u64,
        bursts_sent: generator.bursts(),
        bursts_rejected,
        frames_rendered,
        flushes_with_data,
        commands: backend.commands(),
        events: events.lock().clone(),
        evaluation,
        latest_values: status.latest_values,
        aggregates: status.aggregates,
        display_windows: pipeline.display_windows(),
        last_error: status.last_error,
    };

    if args.json || args.output.is_some() {
        if let Err(e) = output::emit_json(&summary, args.compact, args.output.as_deref()) {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
        if !args.quiet {
            if let Some(ref path) = args.output {
                eprintln!("Summary written to {}", path);
            }
        }
    } else {
        print_summary(&summary);
    }

    exit_codes::SUCCESS
}

fn print_summary(summary: &SimulationSummary) {
    println!(
        "Recording {} for diagnosis {} finished in {} ms",
        summary.session_id.as_deref().unwrap_or("-"),
        summary.diagnosis_id,
        summary.elapsed_ms
    );
    println!(
        "Bursts: {} sent, {} rejected; frames: {} rendered, {} flushes with data",
        summary.bursts_sent,
        summary.bursts_rejected,
        summary.frames_rendered,
        summary.flushes_with_data
    );
    println!();
    println!("Backend commands:");
    for command in &summary.commands {
        println!("  {:<9} stage {}", command.action, command.diagnosis_stage);
    }

    if let Some(ref result) = summary.evaluation {
        println!();
        println!(
            "Evaluation: {} (p={:.2}, stage {}, {} records)",
            result.prediction.label,
            result.prediction.probability,
            result.diagnosis_stage,
            result.num_records
        );
    }

    println!();
    println!("Latest values:");
    for (channel, value) in &summary.latest_values {
        println!("  {:<5} {:>8.4}", channel, value);
    }

    if let Some(ref error) = summary.last_error {
        println!();
        println!("Last warning: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SimulateArgs {
        SimulateArgs {
            config: None,
            diagnosis_id: 1,
            stage_ms: Some("1:50,2:50,3:50,4:50".to_string()),
            grace_ms: Some(20),
            frame_ms: 16,
            burst_ms: 40,
            eval_delay_ms: 10,
            seed: Some(1),
            json: false,
            compact: false,
            output: None,
            quiet: true,
        }
    }

    #[test]
    fn test_effective_config_applies_overrides() {
        let config = effective_config(&args()).unwrap();
        assert_eq!(config.stage_durations_ms[&3], 50);
        assert_eq!(config.shutdown_grace_ms, 20);
    }

    #[test]
    fn test_effective_config_rejects_untimed_stage() {
        let mut args = args();
        args.stage_ms = Some("2:0".to_string());
        assert!(effective_config(&args).unwrap_err().contains("Stage 2"));
    }

    #[test]
    fn test_run_deadline_saturates() {
        let mut config = effective_config(&args()).unwrap();
        assert_eq!(run_deadline(&config, 10), Duration::from_millis(200 + 20 + 10 + 5_000));

        config.stage_durations_ms.insert(1, u64::MAX);
        config.shutdown_grace_ms = u64::MAX;
        assert_eq!(run_deadline(&config, u64::MAX), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_effective_config_rejects_bad_stage_list() {
        let mut args = args();
        args.stage_ms = Some("one:50".to_string());
        assert!(effective_config(&args).is_err());
    }

    #[tokio::test]
    async fn test_short_simulation_succeeds() {
        assert_eq!(execute(args()).await, exit_codes::SUCCESS);
    }
}
