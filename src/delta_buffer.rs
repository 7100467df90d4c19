//! Per-source fragment accumulator with frame-coalesced flushing.
//!
//! Fragments for one `SourceKey` are concatenated in receipt order. A flush drains
//! every key at once and returns the batch ordered by each key's last-fragment
//! timestamp (receipt sequence breaks ties), so interleaved providers land in one
//! replayable global order.

use crate::types::{ProviderId, ResponseKind, ResponseStatus, TurnId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub turn_id: TurnId,
    pub provider: ProviderId,
    pub kind: ResponseKind,
}

impl SourceKey {
    pub fn new(turn_id: TurnId, provider: ProviderId, kind: ResponseKind) -> Self {
        Self {
            turn_id,
            provider,
            kind,
        }
    }
}

/// Something that can fire a single callback at the next render frame.
pub trait FrameScheduler {
    fn request_frame(&mut self);
    fn cancel_frame(&mut self);
}

/// Scheduler driven by hand; records what the buffer asked for.
#[derive(Debug, Default, Clone)]
pub struct ManualFrames {
    pub requested: usize,
    pub cancelled: usize,
}

impl FrameScheduler for ManualFrames {
    fn request_frame(&mut self) {
        self.requested += 1;
    }

    fn cancel_frame(&mut self) {
        self.cancelled += 1;
    }
}

#[derive(Debug)]
struct PendingSource {
    text: String,
    status: ResponseStatus,
    meta: Option<serde_json::Value>,
    error: Option<String>,
    last_at: DateTime<Utc>,
    last_seq: u64,
    fragments: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlushedDelta {
    pub key: SourceKey,
    pub text: String,
    pub status: ResponseStatus,
    pub meta: Option<serde_json::Value>,
    pub error: Option<String>,
    pub last_at: DateTime<Utc>,
    pub fragments: usize,
}

pub struct DeltaBuffer<S> {
    pending: HashMap<SourceKey, PendingSource>,
    scheduler: S,
    frame_requested: bool,
    seq: u64,
}

impl<S: FrameScheduler> DeltaBuffer<S> {
    pub fn new(scheduler: S) -> Self {
        Self {
            pending: HashMap::new(),
            scheduler,
            frame_requested: false,
            seq: 0,
        }
    }

    pub fn add_delta(
        &mut self,
        key: SourceKey,
        fragment: &str,
        status: ResponseStatus,
        meta: Option<serde_json::Value>,
    ) {
        self.add_delta_at(key, fragment, status, meta, Utc::now());
    }

    pub fn add_delta_at(
        &mut self,
        key: SourceKey,
        fragment: &str,
        status: ResponseStatus,
        meta: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) {
        self.seq += 1;
        let seq = self.seq;
        match self.pending.get_mut(&key) {
            Some(entry) if entry.status.is_terminal() => {
                tracing::trace!(
                    "[BUFFER] Ignoring fragment for {}:{} after terminal status in this frame",
                    key.provider,
                    key.kind
                );
                return;
            }
            Some(entry) => {
                entry.text.push_str(fragment);
                entry.status = status;
                if meta.is_some() {
                    entry.meta = meta;
                }
                entry.last_at = at;
                entry.last_seq = seq;
                entry.fragments += 1;
            }
            None => {
                self.pending.insert(
                    key,
                    PendingSource {
                        text: fragment.to_string(),
                        status,
                        meta,
                        error: None,
                        last_at: at,
                        last_seq: seq,
                        fragments: 1,
                    },
                );
            }
        }
        self.schedule();
    }

    /// Replaces whatever has accumulated for `key` with the authoritative full text.
    pub fn set_complete(
        &mut self,
        key: SourceKey,
        full_text: &str,
        status: ResponseStatus,
        meta: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        self.seq += 1;
        let seq = self.seq;
        let at = Utc::now();
        let entry = self.pending.entry(key).or_insert_with(|| PendingSource {
            text: String::new(),
            status,
            meta: None,
            error: None,
            last_at: at,
            last_seq: seq,
            fragments: 0,
        });
        // An error without a payload keeps whatever streamed so far.
        if !(status == ResponseStatus::Error && full_text.is_empty()) {
            entry.text = full_text.to_string();
        }
        entry.status = status;
        if meta.is_some() {
            entry.meta = meta;
        }
        entry.error = error;
        entry.last_at = at;
        entry.last_seq = seq;
        entry.fragments += 1;
        self.schedule();
    }

    /// Drains every key now. Safe to call whether or not a frame is scheduled.
    pub fn flush_immediate(&mut self) -> Vec<FlushedDelta> {
        if self.frame_requested {
            self.scheduler.cancel_frame();
            self.frame_requested = false;
        }
        self.drain()
    }

    /// Called when the scheduled frame fires.
    pub fn on_frame(&mut self) -> Vec<FlushedDelta> {
        self.frame_requested = false;
        self.drain()
    }

    /// Teardown: cancel the frame and discard everything pending.
    pub fn clear(&mut self) {
        if self.frame_requested {
            self.scheduler.cancel_frame();
            self.frame_requested = false;
        }
        if !self.pending.is_empty() {
            tracing::debug!("[BUFFER] Discarding {} pending sources", self.pending.len());
        }
        self.pending.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn frame_requested(&self) -> bool {
        self.frame_requested
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    fn schedule(&mut self) {
        if !self.frame_requested {
            self.frame_requested = true;
            self.scheduler.request_frame();
        }
    }

    fn drain(&mut self) -> Vec<FlushedDelta> {
        let mut drained: Vec<(u64, FlushedDelta)> = self
            .pending
            .drain()
            .map(|(key, p)| {
                (
                    p.last_seq,
                    FlushedDelta {
                        key,
                        text: p.text,
                        status: p.status,
                        meta: p.meta,
                        error: p.error,
                        last_at: p.last_at,
                        fragments: p.fragments,
                    },
                )
            })
            .collect();
        drained.sort_by(|(seq_a, a), (seq_b, b)| a.last_at.cmp(&b.last_at).then(seq_a.cmp(seq_b)));
        drained.into_iter().map(|(_, d)| d).collect()
    }
}
