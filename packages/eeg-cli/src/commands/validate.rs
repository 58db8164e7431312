use crate::cli::ValidateArgs;
use crate::exit_codes;
use crate::output;
use eeg_rs::PipelineConfig;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct ValidateOutput {
    file: String,
    exists: bool,
    parsed: bool,
    valid: bool,
    error: Option<String>,
}

pub fn execute(args: ValidateArgs) -> i32 {
    let path = Path::new(&args.file);
    let exists = path.is_file();

    let (parsed, error) = if !exists {
        (false, Some(format!("File not found: {}", args.file)))
    } else {
        match PipelineConfig::from_json_file(path) {
            Ok(config) => (true, config.validate().err().map(|e| e.to_string())),
            Err(e) => (false, Some(format!("Failed to parse '{}': {}", args.file, e))),
        }
    };

    let result = ValidateOutput {
        file: args.file.clone(),
        exists,
        parsed,
        valid: error.is_none(),
        error: error.clone(),
    };

    if args.json {
        if let Err(e) = output::emit_json(&result, false, None) {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    } else if let Some(ref err) = error {
        eprintln!("Error: {}", err);
    } else {
        println!("Config '{}' is valid", args.file);
    }

    if error.is_some() {
        exit_codes::INPUT_ERROR
    } else {
        exit_codes::SUCCESS
    }
}
