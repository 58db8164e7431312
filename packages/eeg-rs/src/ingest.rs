// Ingestion staging between bursty arrival and the steady render tick
//
// Arrival callbacks enqueue bursts into per-channel pending queues. The render
// loop calls `flush` on a fixed cadence, which normalizes the whole batch with
// one shared scale factor and writes it through to the ring buffers.

use crate::buffer::BufferRegistry;
use crate::config::NormalizationConfig;
use crate::error::EegError;
use crate::message::{ChannelPayload, SensorFrame};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Outcome of a flush, for UI and consumer bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Channels that received samples, in registry order
    pub channels: Vec<String>,
    pub had_data: bool,
    /// Factor applied to every sample of this batch (1.0 when not normalized)
    pub scale_factor: f64,
    pub samples_written: usize,
}

impl FlushReport {
    fn empty() -> Self {
        Self {
            channels: Vec::new(),
            had_data: false,
            scale_factor: 1.0,
            samples_written: 0,
        }
    }
}

/// How a sensor frame was split up during ingestion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Channels whose bursts were queued
    pub series: Vec<String>,
    /// Channels stored as aggregates
    pub aggregates: Vec<String>,
    /// Channels dropped as unknown or malformed
    pub rejected: Vec<String>,
}

impl IngestReport {
    pub fn accepted(&self) -> bool {
        !self.series.is_empty() || !self.aggregates.is_empty()
    }
}

#[derive(Default)]
struct StagerState {
    pending: BTreeMap<String, Vec<f64>>,
    aggregates: BTreeMap<String, BTreeMap<String, f64>>,
    last_error: Option<String>,
}

pub struct IngestionStager {
    registry: Arc<BufferRegistry>,
    normalization: NormalizationConfig,
    aggregate_channels: BTreeSet<String>,
    state: Mutex<StagerState>,
    has_new_data: AtomicBool,
    accepting: AtomicBool,
}

impl IngestionStager {
    pub fn new(registry: Arc<BufferRegistry>, normalization: NormalizationConfig) -> Self {
        Self {
            registry,
            normalization,
            aggregate_channels: BTreeSet::new(),
            state: Mutex::new(StagerState::default()),
            has_new_data: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
        }
    }

    /// Channels whose keyed payloads are stored as aggregates
    pub fn with_aggregate_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aggregate_channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Open or close intake; closed while a recording is shutting down
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn registry(&self) -> &Arc<BufferRegistry> {
        &self.registry
    }

    /// Queue a burst for a channel
    ///
    /// Returns false (and records the reason) when the channel is not
    /// registered, the burst contains non-finite samples, or intake is
    /// closed for shutdown.
    pub fn enqueue(&self, channel: &str, samples: &[f64]) -> bool {
        if !self.is_accepting() {
            log::error!("Dropping burst for {}: recording is shutting down", channel);
            return false;
        }
        if !self.registry.contains(channel) {
            self.reject(EegError::UnknownChannel(channel.to_string()));
            return false;
        }
        if samples.iter().any(|s| !s.is_finite()) {
            self.reject(EegError::MalformedBurst {
                channel: channel.to_string(),
                reason: "burst contains non-finite samples".to_string(),
            });
            return false;
        }

        self.state
            .lock()
            .pending
            .entry(channel.to_string())
            .or_default()
            .extend_from_slice(samples);
        true
    }

    /// Split a sensor frame into queued bursts and stored aggregates
    pub fn ingest(&self, frame: &SensorFrame) -> IngestReport {
        let mut report = IngestReport::default();

        if !self.is_accepting() {
            log::error!("Dropping frame from {}: recording is shutting down", frame.sensor);
            report.rejected = frame.consumed_channels();
            return report;
        }

        for channel in frame.consumed_channels() {
            match frame.data.get(&channel) {
                Some(ChannelPayload::Series(samples)) => {
                    if self.enqueue(&channel, samples) {
                        report.series.push(channel);
                    } else {
                        report.rejected.push(channel);
                    }
                }
                Some(ChannelPayload::Aggregate(values)) => {
                    if self.aggregate_channels.contains(&channel) {
                        self.state
                            .lock()
                            .aggregates
                            .insert(channel.clone(), values.clone());
                        report.aggregates.push(channel);
                    } else {
                        self.reject(EegError::UnknownChannel(channel.clone()));
                        report.rejected.push(channel);
                    }
                }
                Some(ChannelPayload::Malformed(value)) => {
                    self.reject(EegError::MalformedBurst {
                        channel: channel.clone(),
                        reason: format!("expected a sample array or keyed metrics, got {}", value),
                    });
                    report.rejected.push(channel);
                }
                None => {
                    log::debug!("Channel {} listed without data", channel);
                }
            }
        }

        report
    }

    /// Normalize and write every pending queue through to the ring buffers
    pub fn flush(&self) -> FlushReport {
        let batch: Vec<(String, Vec<f64>)> = {
            let mut state = self.state.lock();
            let pending = std::mem::take(&mut state.pending);
            pending
                .into_iter()
                .filter(|(_, samples)| !samples.is_empty())
                .collect()
        };

        if batch.is_empty() {
            return FlushReport::empty();
        }

        let scale_factor = self.scale_factor(&batch);
        if scale_factor != 1.0 {
            log::debug!("Normalizing EEG batch with scale factor {:.3}", scale_factor);
        }

        let mut written: BTreeMap<String, usize> = BTreeMap::new();
        for (channel, mut samples) in batch {
            if scale_factor != 1.0 {
                for sample in samples.iter_mut() {
                    *sample *= scale_factor;
                }
            }
            if self.registry.write_samples(&channel, &samples) {
                written.insert(channel, samples.len());
            } else {
                self.reject(EegError::UnknownChannel(channel));
            }
        }

        if written.is_empty() {
            return FlushReport {
                scale_factor,
                ..FlushReport::empty()
            };
        }

        self.has_new_data.store(true, Ordering::Release);

        let channels: Vec<String> = self
            .registry
            .channel_names()
            .into_iter()
            .filter(|name| written.contains_key(name))
            .collect();

        FlushReport {
            samples_written: written.values().sum(),
            channels,
            had_data: true,
            scale_factor,
        }
    }

    /// One factor for the whole batch: target / peak when any channel
    /// exceeds the threshold, otherwise 1.0
    fn scale_factor(&self, batch: &[(String, Vec<f64>)]) -> f64 {
        let peak = batch
            .iter()
            .flat_map(|(_, samples)| samples.iter())
            .fold(0.0_f64, |acc, s| acc.max(s.abs()));

        if peak > self.normalization.threshold && peak > 0.0 {
            self.normalization.target_scale / peak
        } else {
            1.0
        }
    }

    pub fn has_new_data(&self) -> bool {
        self.has_new_data.load(Ordering::Acquire)
    }

    /// Read and clear the new-data flag
    pub fn take_new_data(&self) -> bool {
        self.has_new_data.swap(false, Ordering::AcqRel)
    }

    pub fn pending_len(&self, channel: &str) -> usize {
        self.state
            .lock()
            .pending
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn aggregates(&self) -> BTreeMap<String, BTreeMap<String, f64>> {
        self.state.lock().aggregates.clone()
    }

    pub fn aggregate(&self, channel: &str) -> Option<BTreeMap<String, f64>> {
        self.state.lock().aggregates.get(channel).cloned()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    /// Drop pending samples and aggregates
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.aggregates.clear();
        state.last_error = None;
        self.has_new_data.store(false, Ordering::Release);
    }

    fn reject(&self, error: EegError) {
        log::warn!("Dropping inbound data: {}", error);
        self.state.lock().last_error = Some(error.to_string());
    }
}

/// Decides which render frames trigger a flush
#[derive(Debug, Clone)]
pub struct FrameCadence {
    divisor: u32,
    frame: u64,
}

impl FrameCadence {
    pub fn new(divisor: u32) -> Self {
        Self {
            divisor: divisor.max(1),
            frame: 0,
        }
    }

    /// Count a frame; true on frames 0, N, 2N, ...
    pub fn tick(&mut self) -> bool {
        let due = self.frame % u64::from(self.divisor) == 0;
        self.frame += 1;
        due
    }

    pub fn frames(&self) -> u64 {
        self.frame
    }

    pub fn reset(&mut self) {
        self.frame = 0;
    }
}
