//! The unit of data flowing through a pipeline.
//!
//! A [`Frame`] is created through [`Frame::create`], which enforces the
//! stream-id invariant and the per-stream flow depth of its
//! [`StreamRegistry`], and is shared as a [`FramePtr`]. Dropping the last
//! reference releases the flow-depth slot, or for a top-level EOS frame,
//! signals that the stream has drained.

use crate::stream::{StreamRegistry, INVALID_STREAM_IDX};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::error;

/// Shared handle to a frame
pub type FramePtr = Arc<Frame>;

/// Type-erased value attached to a frame by collaborators
pub type FrameData = Arc<dyn Any + Send + Sync>;

/// Lifecycle bits carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u32);

impl FrameFlags {
    /// End of the stream, no ordinary frames follow
    pub const EOS: FrameFlags = FrameFlags(1 << 0);
    /// Malformed frame, stages skip it but still forward
    pub const INVALID: FrameFlags = FrameFlags(1 << 1);
    /// The stream is being torn down, stages only forward
    pub const REMOVED: FrameFlags = FrameFlags(1 << 2);

    pub const fn empty() -> Self {
        FrameFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

/// One unit of data tagged with its stream and lifecycle flags
pub struct Frame {
    stream_id: String,
    timestamp: AtomicI64,
    flags: AtomicU32,
    stream_index: AtomicU32,
    modules_mask: Mutex<u64>,
    payload: Option<FramePtr>,
    datas: Mutex<HashMap<u32, FrameData>>,
    registry: Arc<StreamRegistry>,
}

impl Frame {
    /// Create a frame for `stream_id`.
    ///
    /// Returns `None` if `stream_id` is empty, or if `eos` is false and the
    /// stream already has `flow_depth` live frames. Callers retry later in the
    /// second case. `payload` links the frame to a frame of an enclosing
    /// pipeline.
    pub fn create(
        registry: &Arc<StreamRegistry>,
        stream_id: &str,
        eos: bool,
        payload: Option<FramePtr>,
    ) -> Option<FramePtr> {
        if stream_id.is_empty() {
            error!("Frame::create called with an empty stream id");
            return None;
        }

        let flags = if eos {
            if payload.is_none() {
                registry.mark_eos_pending(stream_id);
            }
            FrameFlags::EOS
        } else {
            if !registry.try_acquire_frame(stream_id) {
                return None;
            }
            FrameFlags::empty()
        };

        Some(Arc::new(Frame {
            stream_id: stream_id.to_string(),
            timestamp: AtomicI64::new(-1),
            flags: AtomicU32::new(flags.bits()),
            stream_index: AtomicU32::new(INVALID_STREAM_IDX),
            modules_mask: Mutex::new(0),
            payload,
            datas: Mutex::new(HashMap::new()),
            registry: Arc::clone(registry),
        }))
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp.load(Ordering::Relaxed)
    }

    pub fn set_timestamp(&self, timestamp: i64) {
        self.timestamp.store(timestamp, Ordering::Relaxed);
    }

    pub fn flags(&self) -> FrameFlags {
        FrameFlags(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flag(&self, flag: FrameFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn is_eos(&self) -> bool {
        self.flags().contains(FrameFlags::EOS)
    }

    pub fn is_invalid(&self) -> bool {
        self.flags().contains(FrameFlags::INVALID)
    }

    pub fn is_removed(&self) -> bool {
        self.flags().contains(FrameFlags::REMOVED)
    }

    /// Compact stream alias used to pick a conveyor lane
    pub fn stream_index(&self) -> u32 {
        self.stream_index.load(Ordering::Relaxed)
    }

    pub fn set_stream_index(&self, index: u32) {
        self.stream_index.store(index, Ordering::Relaxed);
    }

    /// Frame of the enclosing pipeline, if any
    pub fn payload(&self) -> Option<&FramePtr> {
        self.payload.as_ref()
    }

    /// Overwrite the record of modules that handled this frame
    pub fn set_modules_mask(&self, mask: u64) {
        *self.modules_mask.lock() = mask;
    }

    /// Record that module `module_id` handled this frame, returning the new mask
    pub fn mark_passed(&self, module_id: usize) -> u64 {
        let mut mask = self.modules_mask.lock();
        *mask |= 1u64 << module_id;
        *mask
    }

    pub fn modules_mask(&self) -> u64 {
        *self.modules_mask.lock()
    }

    /// Attach a value under `key`, replacing any previous one
    pub fn insert_data<T: Any + Send + Sync>(&self, key: u32, value: T) {
        self.datas.lock().insert(key, Arc::new(value));
    }

    /// Fetch the value under `key` if it has type `T`
    pub fn data<T: Any + Send + Sync>(&self, key: u32) -> Option<Arc<T>> {
        let value = self.datas.lock().get(&key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn remove_data(&self, key: u32) -> Option<FrameData> {
        self.datas.lock().remove(&key)
    }

    pub fn has_data(&self, key: u32) -> bool {
        self.datas.lock().contains_key(&key)
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if self.is_eos() {
            if self.payload.is_none() {
                self.registry.mark_eos_reached(&self.stream_id);
            }
            return;
        }
        self.registry.release_frame(&self.stream_id);
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("stream_id", &self.stream_id)
            .field("timestamp", &self.timestamp())
            .field("flags", &self.flags())
            .field("stream_index", &self.stream_index())
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}
