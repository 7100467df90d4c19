/// Render cadence for coalesced delta flushes (one frame at ~60 Hz).
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;

/// Kernel command queue depth.
pub const KERNEL_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast buffer for engine events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Step id markers, checked in this order.
pub const SYNTHESIS_STEP_MARKERS: &[&str] = &["synthesis"];
pub const ENSEMBLE_STEP_MARKERS: &[&str] = &["ensemble"];
pub const BATCH_STEP_MARKERS: &[&str] = &["batch", "prompt"];

/// Completed, non-empty primary outputs a round needs before anything can be derived from it.
pub const MIN_OUTPUTS_FOR_DERIVED: usize = 2;

/// Error text recorded on entries still open when their workflow completes.
pub const OUTSTANDING_AT_COMPLETION_REASON: &str = "workflow completed before provider finished";

/// Characters of chunk text shown in debug logs.
pub const LOG_PREVIEW_CHARS: usize = 40;

/// Thread id sent when a prompt starts a conversation that has no session yet.
pub const NEW_THREAD_ID: &str = "new-thread";

/// Longest transcript line accepted by the replay reader.
pub const MAX_TRANSCRIPT_LINE_BYTES: usize = 1024 * 1024;
