//! Asynchronous error and lifecycle notifications, decoupled from the data path.
//!
//! Any stage posts [`Event`]s to the [`EventBus`]; a dedicated thread hands
//! each one to the registered watchers, most recently added first. What
//! happens on an error (log, retry, remove the stream, stop everything) is
//! decided by whoever registers the watchers.

use crate::error::{PipelineError, Result};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, info, warn};

/// Kind of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Invalid,
    Error,
    Warning,
    Eos,
    /// Ends the dispatch loop
    Stop,
    /// A failure fatal to one stream
    StreamError,
}

/// A notification posted by a module or the pipeline
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub stream_id: String,
    pub message: String,
    pub module_name: String,
    /// Thread the event was posted from
    pub thread_id: ThreadId,
}

impl Event {
    pub fn new(
        event_type: EventType,
        module_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            stream_id: String::new(),
            message: message.into(),
            module_name: module_name.into(),
            thread_id: thread::current().id(),
        }
    }

    /// Attribute the event to a stream
    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = stream_id.into();
        self
    }

    fn stop() -> Self {
        Event::new(EventType::Stop, "", "event bus stopped")
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.event_type)?;
        if !self.module_name.is_empty() {
            write!(f, " from [{}]", self.module_name)?;
        }
        if !self.stream_id.is_empty() {
            write!(f, " on stream {}", self.stream_id)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// What a watcher did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventHandleFlag {
    /// Not handled, keep informing other watchers
    Null,
    /// Handled exclusively, skip the remaining watchers
    Intercepted,
    /// Handled, keep informing other watchers
    Synced,
    /// Halt the dispatch loop
    Stop,
}

/// Callback invoked by the event bus for every event
pub type BusWatcher = Box<dyn Fn(&Event) -> EventHandleFlag + Send + Sync>;

struct BusShared {
    running: AtomicBool,
    watchers: Mutex<Vec<BusWatcher>>,
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

/// Many-producer, one-dispatcher notification channel
pub struct EventBus {
    shared: Arc<BusShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            shared: Arc::new(BusShared {
                running: AtomicBool::new(false),
                watchers: Mutex::new(Vec::new()),
                tx,
                rx,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the dispatch thread
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(PipelineError::AlreadyStarted);
        }
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("event-bus".into())
            .spawn(move || event_loop(&shared))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                PipelineError::ThreadError(e.to_string())
            })?;
        *handle = Some(spawned);
        Ok(())
    }

    /// Stop accepting events and join the dispatch thread
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            // The loop may already have exited through a Stop watcher
            let _ = self.shared.tx.send(Event::stop());
            if handle.thread().id() == thread::current().id() {
                // Stopped from inside a watcher, the loop exits on its own
                return;
            }
            if handle.join().is_err() {
                warn!("event bus thread panicked");
            }
        }
        // Events posted after the loop exited are discarded
        self.shared.rx.try_iter().for_each(drop);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Queue an event for dispatch, returns false if the bus is not running
    pub fn post_event(&self, event: Event) -> bool {
        if !self.is_running() {
            warn!(%event, "post event failed, event bus not running");
            return false;
        }
        self.shared.tx.send(event).is_ok()
    }

    /// Register a watcher, returns the number of registered watchers.
    ///
    /// Watchers run on the dispatch thread with the watcher list locked and
    /// must not register further watchers from inside the callback.
    pub fn add_bus_watch<F>(&self, watcher: F) -> usize
    where
        F: Fn(&Event) -> EventHandleFlag + Send + Sync + 'static,
    {
        let mut watchers = self.shared.watchers.lock();
        watchers.push(Box::new(watcher));
        watchers.len()
    }

    pub fn clear_watchers(&self) {
        self.shared.watchers.lock().clear();
    }

    pub fn watcher_count(&self) -> usize {
        self.shared.watchers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

fn event_loop(shared: &BusShared) {
    debug!("event bus started");
    while let Ok(event) = shared.rx.recv() {
        match event.event_type {
            EventType::Stop => {
                info!("event loop received stop event");
                // Posted stop events end the loop too, so refuse later posts
                shared.running.store(false, Ordering::Release);
                break;
            }
            EventType::Invalid => {
                debug!(%event, "skipping invalid event");
                continue;
            }
            _ => {}
        }

        if dispatch(&shared.watchers.lock(), &event) == EventHandleFlag::Stop {
            info!(%event, "watcher stopped the event loop");
            shared.running.store(false, Ordering::Release);
            break;
        }
    }
    info!("event bus exit");
}

/// Hand `event` to `watchers`, newest first, until one intercepts or stops it
fn dispatch(watchers: &[BusWatcher], event: &Event) -> EventHandleFlag {
    let mut flag = EventHandleFlag::Null;
    for watcher in watchers.iter().rev() {
        flag = watcher(event);
        if matches!(flag, EventHandleFlag::Intercepted | EventHandleFlag::Stop) {
            break;
        }
    }
    flag
}
