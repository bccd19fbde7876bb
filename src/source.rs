//! Stream producers.
//!
//! A [`SourceHandler`] produces the frames of one stream (decoding a file,
//! reading a camera, replaying a test vector). The pipeline admits it with
//! [`Pipeline::add_source`](crate::Pipeline::add_source), hands it a
//! [`SourceSink`] bound to a source module, and closes it again on removal.

use crate::error::Result;
use crate::frame::FramePtr;
use crate::module::{Module, ModuleContext, ModuleParams};
use std::sync::Arc;
use tracing::trace;

/// Producer of one stream's frames
pub trait SourceHandler: Send + Sync + 'static {
    /// Stream this handler produces
    fn stream_id(&self) -> &str;

    /// Start producing frames into `sink`
    fn open(&self, sink: SourceSink) -> Result<()>;

    /// Stop producing. Handlers send their EOS frame before returning so
    /// that a graceful removal can wait for it.
    fn close(&self);
}

/// Entry point a source handler uses to feed its stream into the pipeline
#[derive(Debug, Clone)]
pub struct SourceSink {
    stream_id: Arc<str>,
    stream_index: u32,
    ctx: ModuleContext,
}

impl SourceSink {
    pub(crate) fn new(stream_id: &str, stream_index: u32, ctx: ModuleContext) -> Self {
        Self {
            stream_id: Arc::from(stream_id),
            stream_index,
            ctx,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn stream_index(&self) -> u32 {
        self.stream_index
    }

    /// Create a frame tagged with this stream's id and index.
    ///
    /// Returns `None` while the stream is at its flow depth; the producer
    /// backs off and retries.
    pub fn create_frame(&self, eos: bool, payload: Option<FramePtr>) -> Option<FramePtr> {
        let frame = self.ctx.create_frame(&self.stream_id, eos, payload)?;
        frame.set_stream_index(self.stream_index);
        Some(frame)
    }

    /// Forward `frame` to the modules downstream of the source.
    ///
    /// Ordinary frames of a stream being removed are refused.
    pub fn send_data(&self, frame: FramePtr) -> bool {
        if !frame.is_eos() && self.ctx.registry().is_removed(frame.stream_id()) {
            trace!(stream_id = frame.stream_id(), "dropping frame of removed stream");
            return false;
        }
        self.ctx.transmit(frame).is_ok()
    }

    /// Create and send the EOS frame of this stream
    pub fn send_eos(&self) -> bool {
        match self.create_frame(true, None) {
            Some(eos) => self.send_data(eos),
            None => false,
        }
    }
}

/// Built-in root module that source handlers feed.
///
/// It has no workers of its own; frames enter through [`SourceSink`] and
/// leave on the connectors to its `next_modules`.
#[derive(Debug)]
pub struct SourceModule {
    name: String,
}

impl SourceModule {
    /// Class name the module is registered under
    pub const CLASS_NAME: &'static str = "source";

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Module for SourceModule {
    fn open(&self, _ctx: &ModuleContext, _params: &ModuleParams) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}

    fn process(&self, ctx: &ModuleContext, frame: &FramePtr) -> Result<()> {
        ctx.transmit(Arc::clone(frame))
    }

    fn has_transmit(&self) -> bool {
        true
    }
}
