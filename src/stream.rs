//! Per-stream bookkeeping shared by frames, modules and the pipeline.
//!
//! Worker loops of independent stages have no other rendezvous point to
//! learn that a stream finished draining, so the live frame counts, the
//! "EOS reached" markers and the "stream removed" markers live here. A
//! registry is an ordinary value: each pipeline (or test) owns its own and
//! hands it to the frames it creates.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error};

/// Stream index value for frames that were never assigned one
pub const INVALID_STREAM_IDX: u32 = u32::MAX;

/// Interval at which a blocked EOS waiter re-checks its marker
const EOS_WAIT_SLICE: Duration = Duration::from_millis(20);

/// Live-frame counts, EOS markers and removal markers keyed by stream id
#[derive(Debug, Default)]
pub struct StreamRegistry {
    /// Maximum live non-EOS frames per stream, 0 means unlimited
    flow_depth: AtomicUsize,
    live: Mutex<HashMap<String, usize>>,
    /// `false` while an EOS frame is in flight, `true` once it was dropped
    eos: Mutex<HashMap<String, bool>>,
    eos_reached: Condvar,
    removed: Mutex<HashSet<String>>,
}

impl StreamRegistry {
    /// Create a registry with the given flow depth (0 = unlimited)
    pub fn new(flow_depth: usize) -> Self {
        Self {
            flow_depth: AtomicUsize::new(flow_depth),
            ..Self::default()
        }
    }

    pub fn flow_depth(&self) -> usize {
        self.flow_depth.load(Ordering::Relaxed)
    }

    pub fn set_flow_depth(&self, flow_depth: usize) {
        self.flow_depth.store(flow_depth, Ordering::Relaxed);
    }

    /// Number of ordinary frames of `stream_id` currently alive
    pub fn live_frames(&self, stream_id: &str) -> usize {
        self.live.lock().get(stream_id).copied().unwrap_or(0)
    }

    /// Reserve a live-frame slot for `stream_id`.
    ///
    /// Returns false when the flow depth is already reached.
    pub(crate) fn try_acquire_frame(&self, stream_id: &str) -> bool {
        let depth = self.flow_depth();
        let mut live = self.live.lock();
        let count = live.entry(stream_id.to_string()).or_insert(0);
        if depth > 0 && *count >= depth {
            return false;
        }
        *count += 1;
        true
    }

    pub(crate) fn release_frame(&self, stream_id: &str) {
        let mut live = self.live.lock();
        match live.get_mut(stream_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                live.remove(stream_id);
            }
            None => error!(stream_id, "released a frame of an untracked stream"),
        }
    }

    pub(crate) fn mark_eos_pending(&self, stream_id: &str) {
        self.eos.lock().insert(stream_id.to_string(), false);
    }

    pub(crate) fn mark_eos_reached(&self, stream_id: &str) {
        self.eos.lock().insert(stream_id.to_string(), true);
        self.eos_reached.notify_all();
        debug!(stream_id, "eos reached");
    }

    /// Consume the "EOS reached" marker of `stream_id`.
    ///
    /// Without `wait` the marker is checked once. With `wait` the call blocks
    /// while an EOS frame of the stream is still in flight. Returns true if
    /// the marker was found (and cleared), false if no EOS frame was ever
    /// created for the stream or it has not been reached yet.
    pub fn check_eos_reached(&self, stream_id: &str, wait: bool) -> bool {
        let mut eos = self.eos.lock();
        loop {
            match eos.get(stream_id) {
                Some(true) => {
                    eos.remove(stream_id);
                    return true;
                }
                Some(false) if wait => {
                    self.eos_reached.wait_for(&mut eos, EOS_WAIT_SLICE);
                }
                _ => return false,
            }
        }
    }

    /// Mark or unmark `stream_id` as being torn down
    pub fn set_removed(&self, stream_id: &str, removed: bool) {
        let mut set = self.removed.lock();
        if removed {
            set.insert(stream_id.to_string());
        } else {
            set.remove(stream_id);
        }
    }

    pub fn is_removed(&self, stream_id: &str) -> bool {
        self.removed.lock().contains(stream_id)
    }
}

struct IndexSlots {
    used: Vec<bool>,
    by_stream: HashMap<String, u32>,
}

/// Bounded pool of compact stream indices
pub struct StreamIndexPool {
    slots: Mutex<IndexSlots>,
}

impl StreamIndexPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(IndexSlots {
                used: vec![false; capacity],
                by_stream: HashMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().used.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.lock().by_stream.len()
    }

    /// Index assigned to `stream_id`, allocating the lowest free one if needed.
    ///
    /// Returns `None` when every index is taken.
    pub fn acquire(&self, stream_id: &str) -> Option<u32> {
        let mut slots = self.slots.lock();
        if let Some(&idx) = slots.by_stream.get(stream_id) {
            return Some(idx);
        }
        let free = slots.used.iter().position(|used| !used)?;
        slots.used[free] = true;
        let idx = free as u32;
        slots.by_stream.insert(stream_id.to_string(), idx);
        Some(idx)
    }

    pub fn index_of(&self, stream_id: &str) -> Option<u32> {
        self.slots.lock().by_stream.get(stream_id).copied()
    }

    /// Return the index of `stream_id` to the pool
    pub fn release(&self, stream_id: &str) -> bool {
        let mut slots = self.slots.lock();
        match slots.by_stream.remove(stream_id) {
            Some(idx) => {
                slots.used[idx as usize] = false;
                true
            }
            None => false,
        }
    }
}
