//! Gapless playback of streamed speech fragments.
//!
//! Fragments arrive one network message at a time. Each is decoded and
//! chained onto the output clock right after the previous one, so the
//! utterance plays back continuously. Barge-in discards everything queued.

use crate::audio::{OutputSink, PlaybackId};
use crate::codec::{pcm16_to_samples, PcmBuffer};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Decode raw PCM16 bytes into a playable buffer.
pub fn decode(bytes: &[u8], sample_rate: u32, channel_count: u16) -> PcmBuffer {
    pcm16_to_samples(bytes, sample_rate, channel_count)
}

/// Where a fragment landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledFragment {
    pub id: PlaybackId,
    pub start_at: f64,
    pub duration: f64,
}

/// Result of a natural completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Other fragments are still playing or queued.
    Pending,
    /// The last active fragment finished: the utterance is over.
    Drained,
    /// Not ours (already interrupted or from a torn-down sink).
    Stale,
}

/// Schedule cursor plus the set of in-flight fragments.
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    cursor: f64,
    active: BTreeSet<PlaybackId>,
    next_id: PlaybackId,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Earliest output time for the next fragment.
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Queue `buffer` right after the previous fragment, never in the past.
    ///
    /// Returns `None` without touching the cursor when there is no running
    /// sink (not yet opened, or already torn down) or the sink refuses it.
    pub fn schedule_next<S>(&mut self, sink: Option<&mut S>, buffer: &PcmBuffer) -> Option<ScheduledFragment>
    where
        S: OutputSink + ?Sized,
    {
        let sink = match sink {
            Some(sink) if sink.is_running() => sink,
            _ => {
                debug!("Output sink unavailable, dropping fragment");
                return None;
            }
        };

        let start_at = self.cursor.max(sink.current_time());
        let id = self.next_id;
        if let Err(e) = sink.schedule(id, buffer, start_at) {
            warn!("Failed to schedule fragment: {}", e);
            return None;
        }

        self.next_id += 1;
        let duration = buffer.duration_secs();
        self.cursor = start_at + duration;
        self.active.insert(id);

        Some(ScheduledFragment {
            id,
            start_at,
            duration,
        })
    }

    /// A fragment finished on its own.
    pub fn on_ended(&mut self, id: PlaybackId) -> Completion {
        if !self.active.remove(&id) {
            return Completion::Stale;
        }
        if self.active.is_empty() {
            Completion::Drained
        } else {
            Completion::Pending
        }
    }

    /// Hard stop: cut every active fragment mid-sample, forget them, rewind.
    pub fn interrupt<S>(&mut self, sink: Option<&mut S>)
    where
        S: OutputSink + ?Sized,
    {
        let cut = self.active.len();
        if let Some(sink) = sink {
            for id in &self.active {
                sink.stop_source(*id);
            }
        }
        self.active.clear();
        self.cursor = 0.0;
        if cut > 0 {
            info!("⚡ Playback interrupted, {} fragment(s) discarded", cut);
        }
    }
}
