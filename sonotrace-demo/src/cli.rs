use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "sonotrace-demo")]
#[command(about = "Traces a sonar sensor sweeping a small room", long_about = None)]
pub struct Args {
    /// Number of triggered cycles
    #[arg(long, default_value_t = 8)]
    pub cycles: u32,

    /// Distribution rays per cycle; negative values trace a horizontal slice
    #[arg(long, default_value_t = 20_000, allow_hyphen_values = true)]
    pub rays: i32,

    /// Maximum reflections per ray
    #[arg(long, default_value_t = 3)]
    pub bounces: usize,

    /// Sensor yaw change between cycles (degrees)
    #[arg(long, value_name = "DEGREES", default_value_t = 10.0)]
    pub yaw_step: f32,

    /// Seed for diffraction sampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Seconds to wait for a cycle before giving up
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    pub timeout: u64,

    /// Write the last output to this file as JSON
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    pub log_level: log::LevelFilter,
}
