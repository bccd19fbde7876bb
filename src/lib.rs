//! A multi-stream frame processing engine for analytics pipelines.
//!
//! A pipeline is a directed acyclic graph of modules. Source handlers feed
//! frames of many concurrent streams into root modules; every other module
//! runs a fixed number of worker loops that pull frames from bounded
//! conveyors, process them and forward them downstream.
//!
//! # Features
//!
//! - Bounded per-worker conveyors built on crossbeam channels
//! - Stream-to-worker affinity, so frames of one stream stay in order
//! - Backoff on full conveyors instead of dropping frames
//! - Graceful and forced stream removal, with EOS tracking
//! - An event bus for errors, warnings and end-of-stream notifications
//! - Per-module metrics: throughput, latency percentiles, failures
//! - Builder pattern with serde-friendly module descriptors
//!
//! # Example
//!
//! ```ignore
//! use frame_pipeline::{ModuleConfig, PipelineBuilder};
//!
//! let pipeline = PipelineBuilder::new("analytics")
//!     .add_module(ModuleConfig::new("decoder", "source").with_next("detector"))
//!     .add_module_instance(
//!         ModuleConfig::new("detector", "detector").with_parallelism(4),
//!         Arc::new(Detector::default()),
//!     )
//!     .build()?;
//!
//! pipeline.start()?;
//! pipeline.add_source(Arc::new(FileSource::new("cam0", "cam0.mp4")))?;
//! // ...
//! pipeline.remove_source("cam0", false)?;
//! pipeline.stop();
//! ```

pub mod backpressure;
pub mod config;
pub mod conveyor;
pub mod error;
pub mod event;
pub mod frame;
pub mod metrics;
pub mod module;
pub mod pipeline;
pub mod source;
pub mod stream;

// Re-exports for convenience
pub use backpressure::PushBackoff;
pub use config::{ModuleConfig, PipelineConfig};
pub use conveyor::{Connector, Conveyor};
pub use error::{PipelineError, Result};
pub use event::{BusWatcher, Event, EventBus, EventHandleFlag, EventType};
pub use frame::{Frame, FrameFlags, FramePtr};
pub use metrics::{MetricsSnapshot, ModuleMetrics};
pub use module::{
    do_process, param, Module, ModuleContext, ModuleIdPool, ModuleParams, ModuleRegistry,
};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use source::{SourceHandler, SourceModule, SourceSink};
pub use stream::{StreamIndexPool, StreamRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
