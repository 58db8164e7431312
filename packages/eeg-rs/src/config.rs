use crate::error::{EegError, EegResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;

/// Amplitude normalization applied to each flush batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    /// Absolute amplitude above which a batch is rescaled
    pub threshold: f64,
    /// Peak amplitude a rescaled batch is brought down to
    pub target_scale: f64,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            threshold: 100.0,
            target_scale: 50.0,
        }
    }
}

/// Every externally overridable constant of the acquisition pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Samples kept per channel ring buffer
    pub capacity: usize,
    /// Samples handed to the chart per channel
    pub display_window: usize,
    /// Flush on every Nth render frame
    pub flush_divisor: u32,
    /// Stage number -> duration in ms (0 disables the automatic timer)
    pub stage_durations_ms: BTreeMap<u8, u64>,
    /// Stage number -> audio cue handed to the output
    pub stage_cues: BTreeMap<u8, String>,
    pub normalization: NormalizationConfig,
    pub maintenance_interval_ms: u64,
    /// Storage may exceed capacity by this factor before compaction
    pub compaction_slack: f64,
    pub shutdown_grace_ms: u64,
    /// Time-series channels
    pub channels: Vec<String>,
    /// Channels carrying keyed scalar metrics instead of samples
    pub aggregate_channels: Vec<String>,
    pub sensor_id: String,
    /// Start a stage-1 recording when data arrives while idle
    pub auto_start_on_data: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            display_window: 125,
            flush_divisor: 4,
            stage_durations_ms: BTreeMap::from([
                (1, 10_000),
                (2, 10_000),
                (3, 70_000),
                (4, 10_000),
            ]),
            stage_cues: (1..=4u8).map(|s| (s, format!("bp{}.ogg", s))).collect(),
            normalization: NormalizationConfig::default(),
            maintenance_interval_ms: 10_000,
            compaction_slack: 1.1,
            shutdown_grace_ms: 1_000,
            channels: vec!["fp1".to_string(), "fpz".to_string(), "fp2".to_string()],
            aggregate_channels: vec!["snr".to_string()],
            sensor_id: "ads1299".to_string(),
            auto_start_on_data: false,
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> EegResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        log::debug!("Loaded pipeline config from {}", path.display());
        Ok(config)
    }

    /// Apply `EEG_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> EegResult<()> {
        if let Ok(value) = env::var("EEG_BUFFER_CAPACITY") {
            self.capacity = parse_env("EEG_BUFFER_CAPACITY", &value)?;
        }
        if let Ok(value) = env::var("EEG_DISPLAY_WINDOW") {
            self.display_window = parse_env("EEG_DISPLAY_WINDOW", &value)?;
        }
        if let Ok(value) = env::var("EEG_FLUSH_DIVISOR") {
            self.flush_divisor = parse_env("EEG_FLUSH_DIVISOR", &value)?;
        }
        if let Ok(value) = env::var("EEG_STAGE_DURATIONS_MS") {
            self.stage_durations_ms
                .extend(parse_stage_durations(&value)?);
        }
        if let Ok(value) = env::var("EEG_SHUTDOWN_GRACE_MS") {
            self.shutdown_grace_ms = parse_env("EEG_SHUTDOWN_GRACE_MS", &value)?;
        }
        if let Ok(value) = env::var("EEG_SENSOR_ID") {
            self.sensor_id = value;
        }
        if let Ok(value) = env::var("EEG_AUTO_START") {
            self.auto_start_on_data = value.to_lowercase() == "true";
        }
        Ok(())
    }

    pub fn validate(&self) -> EegResult<()> {
        if self.capacity == 0 {
            return Err(EegError::InvalidCapacity(self.capacity));
        }
        if self.display_window == 0 {
            return Err(invalid("display_window must be at least 1"));
        }
        if self.display_window > self.capacity {
            return Err(invalid(format!(
                "display_window ({}) exceeds capacity ({})",
                self.display_window, self.capacity
            )));
        }
        if self.flush_divisor == 0 {
            return Err(invalid("flush_divisor must be at least 1"));
        }
        for stage in 1..=4u8 {
            if !self.stage_durations_ms.contains_key(&stage) {
                return Err(invalid(format!("missing duration for stage {}", stage)));
            }
        }
        if let Some(stage) = self.stage_durations_ms.keys().find(|s| !(1..=4).contains(*s)) {
            return Err(invalid(format!("unknown stage {} in stage_durations_ms", stage)));
        }
        if !(self.normalization.threshold > 0.0) || !(self.normalization.target_scale > 0.0) {
            return Err(invalid("normalization threshold and target_scale must be positive"));
        }
        if !(self.compaction_slack >= 1.0) {
            return Err(invalid("compaction_slack must be at least 1.0"));
        }
        if self.channels.is_empty() {
            return Err(invalid("at least one time-series channel is required"));
        }
        if let Some(channel) = self
            .channels
            .iter()
            .find(|c| self.aggregate_channels.contains(c))
        {
            return Err(invalid(format!(
                "channel {} is listed as both series and aggregate",
                channel
            )));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> EegError {
    EegError::InvalidConfig(message.into())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> EegResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(format!("{}: cannot parse '{}'", name, value)))
}

/// Parse "1:10000,2:10000,3:70000" into a stage -> ms map
pub fn parse_stage_durations(list: &str) -> EegResult<BTreeMap<u8, u64>> {
    list.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let (stage, ms) = part.split_once(':').ok_or_else(|| {
                invalid(format!("invalid stage duration '{}': expected 'stage:ms'", part))
            })?;
            let stage: u8 = stage
                .trim()
                .parse()
                .map_err(|_| invalid(format!("invalid stage number in '{}'", part)))?;
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| invalid(format!("invalid duration in '{}'", part)))?;
            Ok((stage, ms))
        })
        .collect()
}
