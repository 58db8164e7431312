pub mod config;
pub mod simulate;
pub mod validate;

use eeg_rs::PipelineConfig;

/// Config file (or defaults) with `EEG_*` overrides applied
pub fn load_config(path: Option<&str>) -> Result<PipelineConfig, String> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_json_file(path)
            .map_err(|e| format!("Failed to load config '{}': {}", path, e))?,
        None => PipelineConfig::default(),
    };
    config
        .apply_env_overrides()
        .map_err(|e| format!("Invalid environment override: {}", e))?;
    Ok(config)
}
