use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "eegrec",
    version,
    about = "Staged EEG recording pipeline driver",
    long_about = "Run simulated four-stage EEG recordings and inspect pipeline configuration.\n\
                  Configuration comes from --config (JSON), then EEG_* environment variables.\n\
                  A .env file in the working directory is loaded first if present."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a full recording against synthetic data and a simulated backend
    Simulate(SimulateArgs),
    /// Print the effective pipeline configuration
    Config(ConfigArgs),
    /// Validate a pipeline configuration file
    Validate(ValidateArgs),
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Pipeline configuration file (JSON)
    #[arg(long, env = "EEG_CONFIG")]
    pub config: Option<String>,

    /// Diagnosis the recording belongs to
    #[arg(long, env = "EEG_DIAGNOSIS_ID", default_value_t = 1)]
    pub diagnosis_id: i64,

    /// Stage durations as "stage:ms" pairs (e.g., "1:200,2:200,3:400,4:200")
    #[arg(long)]
    pub stage_ms: Option<String>,

    /// Shutdown grace period in ms
    #[arg(long)]
    pub grace_ms: Option<u64>,

    /// Render frame interval in ms
    #[arg(long, default_value_t = 16)]
    pub frame_ms: u64,

    /// Interval between synthetic bursts in ms
    #[arg(long, default_value_t = 40)]
    pub burst_ms: u64,

    /// Delay before the simulated backend answers an evaluation
    #[arg(long, default_value_t = 100)]
    pub eval_delay_ms: u64,

    /// Seed for the signal generator and simulated backend
    #[arg(long)]
    pub seed: Option<u64>,

    /// Output the summary as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,

    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Suppress progress messages on stderr
    #[arg(long, default_value_t = false)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Pipeline configuration file (JSON)
    #[arg(long, env = "EEG_CONFIG")]
    pub config: Option<String>,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Configuration file path
    #[arg(long)]
    pub file: String,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}
