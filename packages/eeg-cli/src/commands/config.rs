use crate::cli::ConfigArgs;
use crate::commands::load_config;
use crate::exit_codes;
use crate::output;

pub fn execute(args: ConfigArgs) -> i32 {
    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };

    if args.json {
        if let Err(e) = output::emit_json(&config, false, None) {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    } else {
        let durations: Vec<String> = config
            .stage_durations_ms
            .iter()
            .map(|(stage, ms)| format!("{}:{}ms", stage, ms))
            .collect();

        println!("Sensor:            {}", config.sensor_id);
        println!("Channels:          {}", config.channels.join(", "));
        println!("Aggregates:        {}", config.aggregate_channels.join(", "));
        println!("Buffer capacity:   {}", config.capacity);
        println!("Display window:    {}", config.display_window);
        println!("Flush divisor:     {}", config.flush_divisor);
        println!("Stage durations:   {}", durations.join(", "));
        println!(
            "Normalization:     threshold {}, target {}",
            config.normalization.threshold, config.normalization.target_scale
        );
        println!(
            "Maintenance:       every {}ms, slack {}",
            config.maintenance_interval_ms, config.compaction_slack
        );
        println!("Shutdown grace:    {}ms", config.shutdown_grace_ms);
        println!("Auto-start:        {}", config.auto_start_on_data);
    }

    if let Err(e) = config.validate() {
        eprintln!("Warning: effective configuration is invalid: {}", e);
        return exit_codes::INPUT_ERROR;
    }

    exit_codes::SUCCESS
}
