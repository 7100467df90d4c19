use crate::constants::{
    DEFAULT_FRAME_INTERVAL_MS, EVENT_CHANNEL_CAPACITY, KERNEL_CHANNEL_CAPACITY,
};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// What happens to entries still open when their workflow reports completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutstandingPolicy {
    /// Force them to `error` so the turn can complete.
    #[default]
    MarkError,
    /// Leave them as they are.
    Leave,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub frame_interval: Duration,
    pub command_capacity: usize,
    pub event_capacity: usize,
    pub outstanding_policy: OutstandingPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(DEFAULT_FRAME_INTERVAL_MS),
            command_capacity: KERNEL_CHANNEL_CAPACITY,
            event_capacity: EVENT_CHANNEL_CAPACITY,
            outstanding_policy: OutstandingPolicy::MarkError,
        }
    }
}

impl From<&Args> for EngineConfig {
    fn from(args: &Args) -> Self {
        Self {
            frame_interval: Duration::from_millis(args.frame_ms),
            outstanding_policy: args.outstanding,
            ..Self::default()
        }
    }
}

/// Replays a recorded protocol transcript through the aggregation engine.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// NDJSON file, one inbound protocol message per line.
    #[arg(long)]
    pub transcript: PathBuf,
    /// Prompt submitted before the transcript is fed in.
    #[arg(long)]
    pub prompt: String,
    /// Comma-separated providers the prompt is dispatched to.
    #[arg(long, value_delimiter = ',', required = true)]
    pub providers: Vec<String>,
    /// Providers asked to synthesize within the same workflow.
    #[arg(long, value_delimiter = ',')]
    pub synthesis: Vec<String>,
    /// Session the transcript belongs to; omitted means the transcript starts one.
    #[arg(long)]
    pub session: Option<String>,
    #[arg(long, default_value_t = DEFAULT_FRAME_INTERVAL_MS)]
    pub frame_ms: u64,
    #[arg(long, value_enum, default_value_t = OutstandingPolicy::MarkError)]
    pub outstanding: OutstandingPolicy,
    /// Write the final conversation snapshot as JSON here.
    #[arg(long)]
    pub out: Option<PathBuf>,
    /// Persist session history as JSON under this directory instead of in memory.
    #[arg(long)]
    pub history_dir: Option<PathBuf>,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
}
