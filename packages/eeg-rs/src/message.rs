// Wire types exchanged with the acquisition backend
//
// Inbound sensor frames carry per-channel sample bursts (arrays) and
// aggregate metrics such as SNR (keyed objects). Outbound control commands
// drive the backend recorder. Field names are camelCase on the wire; the
// snake_case names used by older backends are accepted on input.

use crate::error::EegResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value reported for one channel in a sensor frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelPayload {
    /// Time series burst, written to the channel's ring buffer
    Series(Vec<f64>),

    /// Keyed scalar metrics (e.g. SNR per electrode), stored directly
    Aggregate(BTreeMap<String, f64>),

    /// Anything else; skipped during ingestion
    Malformed(serde_json::Value),
}

impl ChannelPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelPayload::Series(_) => "series",
            ChannelPayload::Aggregate(_) => "aggregate",
            ChannelPayload::Malformed(_) => "malformed",
        }
    }
}

/// One inbound data message from the acquisition backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorFrame {
    #[serde(default)]
    pub sensor: String,

    /// Channels to consume from `data`; empty means every key in `data`
    #[serde(default)]
    pub channels: Vec<String>,

    #[serde(default)]
    pub data: BTreeMap<String, ChannelPayload>,
}

impl SensorFrame {
    pub fn new(sensor: impl Into<String>) -> Self {
        Self {
            sensor: sensor.into(),
            ..Default::default()
        }
    }

    pub fn with_series(mut self, channel: &str, samples: Vec<f64>) -> Self {
        self.channels.push(channel.to_string());
        self.data
            .insert(channel.to_string(), ChannelPayload::Series(samples));
        self
    }

    pub fn with_aggregate(mut self, channel: &str, values: BTreeMap<String, f64>) -> Self {
        self.channels.push(channel.to_string());
        self.data
            .insert(channel.to_string(), ChannelPayload::Aggregate(values));
        self
    }

    /// Channel names in the order they should be consumed
    pub fn consumed_channels(&self) -> Vec<String> {
        if self.channels.is_empty() {
            self.data.keys().cloned().collect()
        } else {
            self.channels.clone()
        }
    }

    pub fn sample_count(&self) -> usize {
        self.data
            .values()
            .map(|payload| match payload {
                ChannelPayload::Series(samples) => samples.len(),
                _ => 0,
            })
            .sum()
    }
}

/// Envelope unwrapping for messages delivered by the native bridge
///
/// Accepts `{"payload": {"eeg": frame}}`, `{"eeg": frame}` or a bare frame.
pub struct InboundEnvelope;

impl InboundEnvelope {
    pub fn parse(json: &str) -> EegResult<SensorFrame> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    pub fn from_value(mut value: serde_json::Value) -> EegResult<SensorFrame> {
        if let Some(eeg) = value
            .get_mut("payload")
            .and_then(|payload| payload.get_mut("eeg"))
        {
            return Ok(serde_json::from_value(eeg.take())?);
        }
        if let Some(eeg) = value.get_mut("eeg") {
            return Ok(serde_json::from_value(eeg.take())?);
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Action requested from the backend recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Stop,
    Stage,
    Evaluate,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControlAction::Start => "start",
            ControlAction::Stop => "stop",
            ControlAction::Stage => "stage",
            ControlAction::Evaluate => "evaluate",
        };
        f.write_str(name)
    }
}

/// Stage control call sent to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlCommand {
    #[serde(alias = "sensor", alias = "sensor_id")]
    pub sensor_id: String,
    pub action: ControlAction,
    #[serde(alias = "diagnosis_id")]
    pub diagnosis_id: i64,
    #[serde(alias = "diagnosis_stage")]
    pub diagnosis_stage: u8,
}

impl ControlCommand {
    pub fn new(sensor_id: &str, action: ControlAction, diagnosis_id: i64, stage: u8) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            action,
            diagnosis_id,
            diagnosis_stage: stage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub label: String,
    pub probability: f64,
    #[serde(default, alias = "raw_output")]
    pub raw_output: Vec<f64>,
}

/// Evaluation result delivered by the backend after an `evaluate` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    #[serde(alias = "diagnosis_id")]
    pub diagnosis_id: i64,
    #[serde(alias = "diagnosis_stage")]
    pub diagnosis_stage: u8,
    #[serde(alias = "prediction_id")]
    pub prediction_id: i64,
    pub prediction: Prediction,
    #[serde(default, alias = "num_records")]
    pub num_records: u64,
    #[serde(default)]
    pub timestamp: i64,
}
