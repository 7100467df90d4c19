//! Feeds an NDJSON protocol transcript into a running kernel, one message per line.

use crate::constants::{LOG_PREVIEW_CHARS, MAX_TRANSCRIPT_LINE_BYTES};
use crate::ingress::InboundMessage;
use crate::kernel::KernelHandle;
use crate::str_utils::preview;
use crate::types::{ChorusError, Result};
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub lines: usize,
    pub delivered: usize,
    pub malformed: usize,
}

/// Reads until EOF. Blank lines are skipped; lines that do not parse as an inbound
/// message are logged and counted, never fatal.
pub async fn replay_transcript<R>(handle: &KernelHandle, reader: R) -> Result<ReplayStats>
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(
        reader,
        LinesCodec::new_with_max_length(MAX_TRANSCRIPT_LINE_BYTES),
    );
    let mut stats = ReplayStats::default();

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!("[ROUTER] Transcript line {} too long, skipped", stats.lines + 1);
                stats.lines += 1;
                stats.malformed += 1;
                continue;
            }
            Err(LinesCodecError::Io(e)) => return Err(ChorusError::Io(e).into()),
        };
        stats.lines += 1;

        let data = line.trim();
        let data = data.strip_prefix("data: ").unwrap_or(data);
        if data.is_empty() {
            continue;
        }
        match serde_json::from_str::<InboundMessage>(data) {
            Ok(msg) => {
                handle.send_inbound(msg).await?;
                stats.delivered += 1;
            }
            Err(e) => {
                tracing::warn!(
                    "[ROUTER] Malformed transcript line {}: {} ({:?})",
                    stats.lines,
                    e,
                    preview(data, LOG_PREVIEW_CHARS)
                );
                stats.malformed += 1;
            }
        }
    }

    tracing::info!(
        "[KERNEL] Replayed {} lines: {} delivered, {} malformed",
        stats.lines,
        stats.delivered,
        stats.malformed
    );
    Ok(stats)
}
