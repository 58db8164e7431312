use serde::Serialize;
use std::io::Write;

/// Serialize `value` and write it to `path`, or to stdout when no path is given
pub fn emit_json<T: Serialize>(value: &T, compact: bool, path: Option<&str>) -> Result<(), String> {
    let json = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    }
    .map_err(|e| format!("JSON serialization failed: {}", e))?;

    match path {
        Some(path) => std::fs::write(path, format!("{}\n", json))
            .map_err(|e| format!("Failed to write output file '{}': {}", path, e)),
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", json).map_err(|e| format!("Failed to write to stdout: {}", e))
        }
    }
}
