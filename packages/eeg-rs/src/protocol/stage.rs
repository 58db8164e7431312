use crate::config::PipelineConfig;
use crate::error::EegError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Numbered phase of the audio-guided recording protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Stage {
    One = 1,
    Two = 2,
    Three = 3,
    Four = 4,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::One, Stage::Two, Stage::Three, Stage::Four];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(number: u8) -> Option<Stage> {
        match number {
            1 => Some(Stage::One),
            2 => Some(Stage::Two),
            3 => Some(Stage::Three),
            4 => Some(Stage::Four),
            _ => None,
        }
    }

    /// Following stage, or None after the final stage
    pub fn next(self) -> Option<Stage> {
        Stage::from_number(self.number() + 1)
    }

    pub fn is_final(self) -> bool {
        self == Stage::Four
    }
}

impl TryFrom<u8> for Stage {
    type Error = EegError;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        Stage::from_number(number).ok_or_else(|| {
            EegError::InvalidStageTransition(format!("stage {} is outside 1..=4", number))
        })
    }
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> u8 {
        stage.number()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Automatic timer length per stage; `None` leaves the stage open until it
/// is advanced or stopped explicitly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDurations {
    durations: [Option<Duration>; 4],
}

impl StageDurations {
    /// Zero or missing entries disable the timer for that stage
    pub fn from_millis(map: &BTreeMap<u8, u64>) -> Self {
        let mut durations = [None; 4];
        for stage in Stage::ALL {
            durations[stage.number() as usize - 1] = map
                .get(&stage.number())
                .filter(|ms| **ms > 0)
                .map(|ms| Duration::from_millis(*ms));
        }
        Self { durations }
    }

    pub fn get(&self, stage: Stage) -> Option<Duration> {
        self.durations[stage.number() as usize - 1]
    }

    /// Sum of every timed stage
    pub fn total(&self) -> Duration {
        self.durations
            .iter()
            .flatten()
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(*d))
    }
}

impl Default for StageDurations {
    fn default() -> Self {
        Self::from_millis(&PipelineConfig::default().stage_durations_ms)
    }
}

/// Stage machine settings derived from the pipeline config
#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub sensor_id: String,
    pub durations: StageDurations,
    pub cues: BTreeMap<Stage, String>,
    pub shutdown_grace: Duration,
}

impl MachineSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let cues = config
            .stage_cues
            .iter()
            .filter_map(|(number, cue)| Stage::from_number(*number).map(|s| (s, cue.clone())))
            .collect();

        Self {
            sensor_id: config.sensor_id.clone(),
            durations: StageDurations::from_millis(&config.stage_durations_ms),
            cues,
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
        }
    }

    pub fn cue(&self, stage: Stage) -> Option<&str> {
        self.cues.get(&stage).map(String::as_str)
    }
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::One.next(), Some(Stage::Two));
        assert_eq!(Stage::Three.next(), Some(Stage::Four));
        assert_eq!(Stage::Four.next(), None);
        assert!(Stage::Four.is_final());
        assert_eq!(Stage::from_number(0), None);
        assert_eq!(Stage::from_number(5), None);
    }

    #[test]
    fn test_stage_serializes_as_number() {
        assert_eq!(serde_json::to_string(&Stage::Three).unwrap(), "3");
        assert_eq!(serde_json::from_str::<Stage>("2").unwrap(), Stage::Two);
        assert!(serde_json::from_str::<Stage>("7").is_err());
    }

    #[test]
    fn test_durations_from_config() {
        let durations = StageDurations::default();
        assert_eq!(durations.get(Stage::Three), Some(Duration::from_secs(70)));
        assert_eq!(durations.total(), Duration::from_secs(100));

        let open = StageDurations::from_millis(&BTreeMap::from([(1, 50), (2, 0)]));
        assert_eq!(open.get(Stage::One), Some(Duration::from_millis(50)));
        assert_eq!(open.get(Stage::Two), None);
        assert_eq!(open.get(Stage::Four), None);
    }

    #[test]
    fn test_total_of_huge_durations() {
        let durations = StageDurations::from_millis(&BTreeMap::from([(1, u64::MAX), (2, u64::MAX)]));
        assert_eq!(durations.total(), Duration::from_millis(u64::MAX) * 2);
    }

    #[test]
    fn test_settings_cues() {
        let settings = MachineSettings::default();
        assert_eq!(settings.cue(Stage::One), Some("bp1.ogg"));
        assert_eq!(settings.shutdown_grace, Duration::from_millis(1000));
        assert_eq!(settings.sensor_id, "ads1299");
    }
}
