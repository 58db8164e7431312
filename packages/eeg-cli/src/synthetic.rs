// Synthetic acquisition: signal generator and simulated backend
//
// The generator produces alpha/beta sinusoids with noise and a slow per-channel
// modulation, 10 samples per burst at 250 Hz. The backend records every
// control command and answers `evaluate` with a random prediction after a
// delay, the way the device firmware does in demo mode.

use eeg_rs::{ControlAction, ControlCommand, EvaluationResult, Prediction, SensorFrame};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const SAMPLE_RATE_HZ: f64 = 250.0;
pub const SAMPLES_PER_BURST: usize = 10;

const LABELS: [&str; 3] = ["Normal", "Abnormal", "Inconclusive"];

/// Rhythm parameters for one electrode
struct ChannelProfile {
    alpha_hz: f64,
    beta_hz: f64,
    modulation_depth: f64,
    modulation_rate: f64,
    snr_base: f64,
}

fn profile(channel: &str) -> ChannelProfile {
    match channel {
        "fpz" => ChannelProfile {
            alpha_hz: 11.0,
            beta_hz: 22.0,
            modulation_depth: 0.25,
            modulation_rate: 0.7,
            snr_base: 14.8,
        },
        "fp2" => ChannelProfile {
            alpha_hz: 9.0,
            beta_hz: 18.0,
            modulation_depth: 0.35,
            modulation_rate: 0.3,
            snr_base: 15.5,
        },
        _ => ChannelProfile {
            alpha_hz: 10.0,
            beta_hz: 20.0,
            modulation_depth: 0.3,
            modulation_rate: 0.5,
            snr_base: 15.2,
        },
    }
}

pub struct SignalGenerator {
    sensor: String,
    channels: Vec<String>,
    aggregate_channel: Option<String>,
    rng: StdRng,
    /// Seconds of signal generated so far
    t: f64,
    bursts: u64,
}

impl SignalGenerator {
    pub fn new(sensor: &str, channels: &[String], aggregate_channel: Option<&str>, seed: u64) -> Self {
        Self {
            sensor: sensor.to_string(),
            channels: channels.to_vec(),
            aggregate_channel: aggregate_channel.map(str::to_string),
            rng: StdRng::seed_from_u64(seed),
            t: 0.0,
            bursts: 0,
        }
    }

    pub fn bursts(&self) -> u64 {
        self.bursts
    }

    fn sample(&mut self, profile: &ChannelProfile, t: f64) -> f64 {
        let alpha = 0.5 * (TAU * profile.alpha_hz * t).sin();
        let beta = 0.2 * (TAU * profile.beta_hz * t).sin();
        let noise = (self.rng.random::<f64>() - 0.5) * 0.1;
        let modulation = profile.modulation_depth * (profile.modulation_rate * t).sin();
        alpha + beta + noise + modulation
    }

    /// Next burst for every channel, plus the SNR aggregate
    pub fn next_frame(&mut self) -> SensorFrame {
        let mut frame = SensorFrame::new(self.sensor.clone());
        let start = self.t;

        for channel in self.channels.clone() {
            let profile = profile(&channel);
            let samples = (0..SAMPLES_PER_BURST)
                .map(|i| self.sample(&profile, start + i as f64 / SAMPLE_RATE_HZ))
                .collect();
            frame = frame.with_series(&channel, samples);
        }

        if let Some(aggregate) = self.aggregate_channel.clone() {
            let snr: BTreeMap<String, f64> = self
                .channels
                .iter()
                .map(|channel| {
                    let value = profile(channel).snr_base + 0.5 * (start * 0.5).sin();
                    (channel.clone(), value)
                })
                .collect();
            frame = frame.with_aggregate(&aggregate, snr);
        }

        self.t += SAMPLES_PER_BURST as f64 / SAMPLE_RATE_HZ;
        self.bursts += 1;
        frame
    }
}

fn prediction(rng: &mut StdRng) -> Prediction {
    let label = LABELS[rng.random_range(0..LABELS.len())].to_string();
    let probability = rng.random_range(0.5..1.0);

    let raw: Vec<f64> = (0..3).map(|_| rng.random::<f64>() + f64::EPSILON).collect();
    let total: f64 = raw.iter().sum();
    Prediction {
        label,
        probability,
        raw_output: raw.iter().map(|v| v / total).collect(),
    }
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Backend task that consumes control commands from a `ChannelBridge`
pub struct SimulatedBackend {
    commands: Arc<Mutex<Vec<ControlCommand>>>,
    results: mpsc::UnboundedReceiver<EvaluationResult>,
    task: JoinHandle<()>,
}

impl SimulatedBackend {
    /// `records` is read when an evaluation is answered, as the record count
    pub fn spawn(
        mut commands_rx: mpsc::UnboundedReceiver<ControlCommand>,
        evaluation_delay: Duration,
        seed: u64,
        records: Arc<AtomicU64>,
    ) -> Self {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let (results_tx, results) = mpsc::unbounded_channel();

        let seen = Arc::clone(&commands);
        let task = tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut next_prediction_id = 1;

            while let Some(command) = commands_rx.recv().await {
                log::info!(
                    "Backend received '{}' for diagnosis {} stage {}",
                    command.action,
                    command.diagnosis_id,
                    command.diagnosis_stage
                );
                seen.lock().push(command.clone());

                if command.action != ControlAction::Evaluate {
                    continue;
                }

                let result = EvaluationResult {
                    diagnosis_id: command.diagnosis_id,
                    diagnosis_stage: command.diagnosis_stage,
                    prediction_id: next_prediction_id,
                    prediction: prediction(&mut rng),
                    num_records: records.load(Ordering::Relaxed),
                    timestamp: unix_timestamp(),
                };
                next_prediction_id += 1;

                let tx = results_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(evaluation_delay).await;
                    let _ = tx.send(result);
                });
            }
        });

        Self {
            commands,
            results,
            task,
        }
    }

    pub fn commands(&self) -> Vec<ControlCommand> {
        self.commands.lock().clone()
    }

    /// Wait for the next evaluation result
    pub async fn next_result(&mut self) -> Option<EvaluationResult> {
        self.results.recv().await
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}
