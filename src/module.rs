use crate::error::{PipelineError, Result};
use crate::event::{Event, EventType};
use crate::frame::{Frame, FrameFlags, FramePtr};
use crate::pipeline::Shared;
use crate::source::SourceModule;
use crate::stream::StreamRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use tracing::warn;

/// Maximum number of modules in one pipeline, bounded by the width of
/// [`Frame::modules_mask`]
pub const MAX_MODULES: usize = 64;

/// Parameters handed verbatim to [`Module::open`]
pub type ModuleParams = HashMap<String, String>;

/// Parse parameter `key` as `T`, `Ok(None)` if it is absent
pub fn param<T: FromStr>(params: &ModuleParams, key: &str) -> Result<Option<T>> {
    match params.get(key) {
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            PipelineError::ConfigError(format!("invalid value {raw:?} for parameter {key}"))
        }),
        None => Ok(None),
    }
}

/// A processing stage of the pipeline.
///
/// One instance is shared by all worker loops of the stage, so methods take
/// `&self` and implementations guard their own mutable state.
pub trait Module: Send + Sync + 'static {
    /// Prepare the module. An error aborts pipeline startup.
    fn open(&self, ctx: &ModuleContext, params: &ModuleParams) -> Result<()>;

    /// Release resources. Must tolerate being called more than once.
    fn close(&self);

    /// Handle one frame. An error stops this frame at this stage.
    fn process(&self, ctx: &ModuleContext, frame: &FramePtr) -> Result<()>;

    /// Called once per stream, instead of `process`, for its EOS frame
    fn on_eos(&self, _ctx: &ModuleContext, _stream_id: &str) {}

    /// Whether the module forwards frames itself through
    /// [`ModuleContext::transmit`] instead of relying on automatic forwarding
    fn has_transmit(&self) -> bool {
        false
    }
}

/// Identity of a module and its link back to the owning pipeline
#[derive(Clone)]
pub struct ModuleContext {
    name: Arc<str>,
    id: usize,
    node: usize,
    registry: Arc<StreamRegistry>,
    pipeline: Weak<Shared>,
}

impl ModuleContext {
    pub(crate) fn attached(
        name: Arc<str>,
        id: usize,
        node: usize,
        registry: Arc<StreamRegistry>,
        pipeline: Weak<Shared>,
    ) -> Self {
        Self {
            name,
            id,
            node,
            registry,
            pipeline,
        }
    }

    /// Context for a module running outside any pipeline, e.g. under test.
    ///
    /// Transmitting is a no-op and events cannot be posted.
    pub fn detached(name: &str, id: usize, registry: Arc<StreamRegistry>) -> Self {
        Self {
            name: Arc::from(name),
            id,
            node: usize::MAX,
            registry,
            pipeline: Weak::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn is_attached(&self) -> bool {
        self.pipeline.strong_count() > 0
    }

    /// Create a frame in this module's stream registry.
    ///
    /// A frame wrapping a payload inherits the payload's stream index, so it
    /// is routed on the same lanes as its parent.
    pub fn create_frame(
        &self,
        stream_id: &str,
        eos: bool,
        payload: Option<FramePtr>,
    ) -> Option<FramePtr> {
        let stream_index = payload.as_ref().map(|parent| parent.stream_index());
        let frame = Frame::create(&self.registry, stream_id, eos, payload)?;
        if let Some(index) = stream_index {
            frame.set_stream_index(index);
        }
        Some(frame)
    }

    /// Create a frame of the same stream as `like`, carrying its stream index
    pub fn create_frame_like(&self, like: &FramePtr, eos: bool) -> Option<FramePtr> {
        let frame = Frame::create(&self.registry, like.stream_id(), eos, None)?;
        frame.set_stream_index(like.stream_index());
        Some(frame)
    }

    /// Forward `frame` to every downstream module
    pub fn transmit(&self, frame: FramePtr) -> Result<()> {
        match self.pipeline.upgrade() {
            Some(shared) => shared.transmit(self.node, frame),
            None => Ok(()),
        }
    }

    /// Post an event attributed to this module
    pub fn post_event(&self, event_type: EventType, stream_id: &str, message: &str) -> bool {
        let event = Event::new(event_type, self.name(), message).with_stream(stream_id);
        match self.pipeline.upgrade() {
            Some(shared) => shared.bus().post_event(event),
            None => {
                warn!(module = self.name(), "module is not attached to a pipeline, event dropped");
                false
            }
        }
    }
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Run one frame through `module`, applying the shared execution policy.
///
/// Frames of a removed stream (or of a removed enclosing stream) are flagged
/// [`FrameFlags::REMOVED`]. Self-transmitting modules always see the frame.
/// Otherwise EOS frames go to `on_eos`, removed frames skip `process`, and
/// the frame is forwarded unless `process` fails.
pub fn do_process(module: &dyn Module, ctx: &ModuleContext, frame: FramePtr) -> Result<()> {
    let registry = ctx.registry();
    let mut removed = registry.is_removed(frame.stream_id());
    if !removed {
        if let Some(parent) = frame.payload() {
            if registry.is_removed(parent.stream_id()) {
                registry.set_removed(frame.stream_id(), true);
                removed = true;
            }
        }
    }
    if removed {
        frame.set_flag(FrameFlags::REMOVED);
    }

    if module.has_transmit() {
        return module.process(ctx, &frame);
    }

    if frame.is_eos() {
        module.on_eos(ctx, frame.stream_id());
    } else if !removed {
        module.process(ctx, &frame)?;
    }
    ctx.transmit(frame)
}

/// Allocator for module ids in `[0, MAX_MODULES)`
#[derive(Debug, Default)]
pub struct ModuleIdPool {
    mask: Mutex<u64>,
}

impl ModuleIdPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lowest free id, `None` when all are in use
    pub fn acquire(&self) -> Option<usize> {
        let mut mask = self.mask.lock();
        let id = (!*mask).trailing_zeros() as usize;
        if id >= MAX_MODULES {
            return None;
        }
        *mask |= 1u64 << id;
        Some(id)
    }

    pub fn release(&self, id: usize) {
        if id < MAX_MODULES {
            *self.mask.lock() &= !(1u64 << id);
        }
    }

    pub fn in_use(&self) -> usize {
        self.mask.lock().count_ones() as usize
    }
}

/// Constructor registered for a module class name
pub type ModuleConstructor = Box<dyn Fn(&str) -> Arc<dyn Module> + Send + Sync>;

/// Maps class names found in module descriptors to constructors
pub struct ModuleRegistry {
    constructors: HashMap<String, ModuleConstructor>,
}

impl ModuleRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// A registry with the built-in modules (`"source"`)
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(SourceModule::CLASS_NAME, |name| {
            Arc::new(SourceModule::new(name)) as Arc<dyn Module>
        });
        registry
    }

    /// Register `constructor` under `class_name`.
    ///
    /// Returns false if the class name is already taken.
    pub fn register<F>(&mut self, class_name: &str, constructor: F) -> bool
    where
        F: Fn(&str) -> Arc<dyn Module> + Send + Sync + 'static,
    {
        if self.constructors.contains_key(class_name) {
            return false;
        }
        self.constructors
            .insert(class_name.to_string(), Box::new(constructor));
        true
    }

    /// Instantiate the module registered as `class_name`, named `name`
    pub fn create(&self, class_name: &str, name: &str) -> Option<Arc<dyn Module>> {
        self.constructors.get(class_name).map(|ctor| ctor(name))
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.constructors.contains_key(class_name)
    }

    /// Registered class names, sorted
    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
