use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "stream-server", about = "Partitioned log stream processor")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the topology until interrupted or drained
    Serve(ServeArgs),
    /// Validate the config and print the topology as PlantUML
    Check(CheckArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml", env = "STREAM_CONFIG")]
    pub config: String,

    /// Stop once sources are done and every input is consumed
    #[arg(long)]
    pub drain: bool,

    /// Interval between two progress reports, in seconds
    #[arg(long, default_value_t = 10)]
    pub report_interval: u64,
}

#[derive(Args, Clone, Debug)]
pub struct CheckArgs {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml", env = "STREAM_CONFIG")]
    pub config: String,
}
