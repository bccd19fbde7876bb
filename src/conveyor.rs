use crate::frame::FramePtr;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use crossbeam::select;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Default number of frames a conveyor can hold
pub const DEFAULT_CONVEYOR_CAPACITY: usize = 20;

/// Longest time a pop waits for a frame before giving up
pub const POP_TIMEOUT: Duration = Duration::from_millis(20);

/// A bounded FIFO between one producer-side worker and one consumer-side worker
#[derive(Debug)]
pub struct Conveyor {
    tx: Sender<FramePtr>,
    rx: Receiver<FramePtr>,
    capacity: usize,
    /// Pushes that found the queue full since the last successful push
    fail_count: AtomicU64,
    /// Pushes that found the queue full over the conveyor's lifetime
    total_failures: AtomicU64,
}

impl Conveyor {
    /// Create a new conveyor holding at most `capacity` frames
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            fail_count: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    /// Push a frame without blocking, returns false if the conveyor is full
    pub fn push(&self, frame: FramePtr) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.fail_count.store(0, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.fail_count.fetch_add(1, Ordering::Relaxed);
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop a frame if one is queued
    pub fn try_pop(&self) -> Option<FramePtr> {
        self.rx.try_recv().ok()
    }

    /// Remove and return every queued frame
    pub fn pop_all(&self) -> Vec<FramePtr> {
        self.rx.try_iter().collect()
    }

    pub(crate) fn receiver(&self) -> &Receiver<FramePtr> {
        &self.rx
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rx.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the utilization of the conveyor as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        ((self.len() as u32 * 100) / self.capacity.max(1) as u32).min(100)
    }

    /// Consecutive failed pushes since the last successful one
    pub fn fail_count(&self) -> u64 {
        self.fail_count.load(Ordering::Relaxed)
    }

    /// Failed pushes over the lifetime of the conveyor
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }
}

/// The group of conveyors implementing one graph edge.
///
/// There is one conveyor per worker of the downstream module; a frame is
/// routed to lane `stream_index % conveyor_count` so that every frame of a
/// stream is handled, in order, by the same downstream worker.
#[derive(Debug)]
pub struct Connector {
    conveyors: Vec<Conveyor>,
    capacity: usize,
    stopped: AtomicBool,
    /// Dropped by `stop()`, which wakes every receiver selecting on `stop_rx`
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl Connector {
    pub fn new(conveyor_count: usize, capacity: usize) -> Self {
        let (stop_tx, stop_rx) = channel::bounded(0);
        Self {
            conveyors: (0..conveyor_count).map(|_| Conveyor::new(capacity)).collect(),
            capacity,
            stopped: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
        }
    }

    pub fn conveyor_count(&self) -> usize {
        self.conveyors.len()
    }

    pub fn conveyor_capacity(&self) -> usize {
        self.capacity
    }

    pub fn conveyor(&self, idx: usize) -> Option<&Conveyor> {
        self.conveyors.get(idx)
    }

    /// Lane that frames with `stream_index` travel on
    pub fn lane_for(&self, stream_index: u32) -> usize {
        stream_index as usize % self.conveyors.len().max(1)
    }

    /// Push a frame onto conveyor `idx` without blocking.
    ///
    /// Returns false if that conveyor is full or `idx` is out of range;
    /// callers retry after a short backoff.
    pub fn push(&self, idx: usize, frame: FramePtr) -> bool {
        match self.conveyors.get(idx) {
            Some(conveyor) => conveyor.push(frame),
            None => false,
        }
    }

    /// Pop a frame from conveyor `idx`, waiting at most [`POP_TIMEOUT`].
    ///
    /// Frames already queued are returned even after `stop()` so consumers
    /// can drain; an empty stopped conveyor returns `None` immediately.
    pub fn pop(&self, idx: usize) -> Option<FramePtr> {
        let conveyor = self.conveyors.get(idx)?;
        if let Some(frame) = conveyor.try_pop() {
            return Some(frame);
        }
        if self.is_stopped() {
            return None;
        }
        select! {
            recv(conveyor.rx) -> frame => frame.ok(),
            recv(self.stop_rx) -> _ => None,
            default(POP_TIMEOUT) => None,
        }
    }

    /// Receiver that becomes ready (disconnected) once the connector stops
    pub(crate) fn stop_signal(&self) -> &Receiver<()> {
        &self.stop_rx
    }

    /// Mark the connector stopped and wake every blocked consumer
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stop_tx.lock().take();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_full(&self, idx: usize) -> bool {
        self.conveyors.get(idx).map_or(false, Conveyor::is_full)
    }

    pub fn is_empty(&self, idx: usize) -> bool {
        self.conveyors.get(idx).map_or(true, Conveyor::is_empty)
    }

    pub fn conveyor_len(&self, idx: usize) -> usize {
        self.conveyors.get(idx).map_or(0, Conveyor::len)
    }

    pub fn fail_count(&self, idx: usize) -> u64 {
        self.conveyors.get(idx).map_or(0, Conveyor::fail_count)
    }

    /// Drop every queued frame, returning how many were discarded
    pub fn clear(&self) -> usize {
        self.conveyors.iter().map(|c| c.pop_all().len()).sum()
    }
}
