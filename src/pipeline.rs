use crate::backpressure::PushBackoff;
use crate::config::{ModuleConfig, PipelineConfig};
use crate::conveyor::{Connector, POP_TIMEOUT};
use crate::error::{PipelineError, Result};
use crate::event::{Event, EventBus, EventHandleFlag, EventType};
use crate::frame::FramePtr;
use crate::metrics::{MetricsSnapshot, ModuleMetrics};
use crate::module::{do_process, Module, ModuleContext, ModuleIdPool, ModuleRegistry, MAX_MODULES};
use crate::source::{SourceHandler, SourceSink};
use crate::stream::{StreamIndexPool, StreamRegistry};
use crossbeam::channel::Select;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// A module descriptor waiting to be built, with an optional ready instance
struct PipelineModule {
    config: ModuleConfig,
    instance: Option<Arc<dyn Module>>,
}

/// Builder for constructing pipelines
pub struct PipelineBuilder {
    name: String,
    config: PipelineConfig,
    stream_registry: Option<Arc<StreamRegistry>>,
    module_registry: ModuleRegistry,
    id_pool: Option<Arc<ModuleIdPool>>,
    modules: Vec<PipelineModule>,
}

impl PipelineBuilder {
    /// Create a new pipeline builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: PipelineConfig::default(),
            stream_registry: None,
            module_registry: ModuleRegistry::with_builtins(),
            id_pool: None,
            modules: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing stream registry instead of creating one
    pub fn with_stream_registry(mut self, registry: Arc<StreamRegistry>) -> Self {
        self.stream_registry = Some(registry);
        self
    }

    /// Draw module ids from `pool`, shared with other pipelines. Ids go back
    /// to the pool when the pipeline is dropped.
    pub fn with_module_id_pool(mut self, pool: Arc<ModuleIdPool>) -> Self {
        self.id_pool = Some(pool);
        self
    }

    /// Registry used to instantiate modules added by descriptor only
    pub fn with_module_registry(mut self, registry: ModuleRegistry) -> Self {
        self.module_registry = registry;
        self
    }

    /// Add a module instantiated from `config.class_name` at build time
    pub fn add_module(mut self, config: ModuleConfig) -> Self {
        self.modules.push(PipelineModule {
            config,
            instance: None,
        });
        self
    }

    /// Add a module with an already constructed instance
    pub fn add_module_instance(mut self, config: ModuleConfig, module: Arc<dyn Module>) -> Self {
        self.modules.push(PipelineModule {
            config,
            instance: Some(module),
        });
        self
    }

    /// Validate the graph, instantiate every module and wire the connectors
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        if self.modules.is_empty() {
            return Err(PipelineError::NoModules);
        }
        if self.modules.len() > MAX_MODULES {
            return Err(PipelineError::TooManyModules {
                count: self.modules.len(),
                max: MAX_MODULES,
            });
        }

        let mut index_of = HashMap::with_capacity(self.modules.len());
        for (idx, module) in self.modules.iter().enumerate() {
            if index_of.insert(module.config.name.clone(), idx).is_some() {
                return Err(PipelineError::DuplicateModule(module.config.name.clone()));
            }
        }

        let mut edges = Vec::new();
        for (from, module) in self.modules.iter().enumerate() {
            let mut seen = HashSet::new();
            for next in &module.config.next_modules {
                let to = *index_of.get(next).ok_or_else(|| PipelineError::UnknownModule {
                    from: module.config.name.clone(),
                    to: next.clone(),
                })?;
                if seen.insert(to) {
                    edges.push((from, to));
                } else {
                    warn!(from = %module.config.name, to = %next, "duplicate link ignored");
                }
            }
        }
        check_acyclic(self.modules.len(), &edges)?;

        let mut has_inputs = vec![false; self.modules.len()];
        for &(_, to) in &edges {
            has_inputs[to] = true;
        }
        for (module, &inputs) in self.modules.iter().zip(&has_inputs) {
            module.config.validate(inputs)?;
        }

        let id_pool = self.id_pool.unwrap_or_default();
        let count = self.modules.len();
        let mut parts: Vec<NodeParts> = Vec::with_capacity(count);
        for entry in self.modules {
            let acquired = match entry.instance {
                Some(instance) => Ok(instance),
                None => self
                    .module_registry
                    .create(&entry.config.class_name, &entry.config.name)
                    .ok_or_else(|| PipelineError::UnknownClass(entry.config.class_name.clone())),
            }
            .and_then(|module| {
                let id = id_pool.acquire().ok_or(PipelineError::TooManyModules {
                    count: id_pool.in_use() + count - parts.len(),
                    max: MAX_MODULES,
                })?;
                Ok((module, id))
            });
            let (module, id) = match acquired {
                Ok(acquired) => acquired,
                Err(e) => {
                    for part in &parts {
                        id_pool.release(part.id);
                    }
                    return Err(e);
                }
            };
            parts.push(NodeParts {
                config: entry.config,
                module,
                id,
                parent_ids: Vec::new(),
                inputs: Vec::new(),
                outputs: Vec::new(),
            });
        }

        let mut connectors = Vec::with_capacity(edges.len());
        for &(from, to) in &edges {
            let consumer = &parts[to].config;
            let connector = Arc::new(Connector::new(
                consumer.parallelism,
                consumer.max_input_queue_size,
            ));
            let parent_id = parts[from].id;
            parts[from].outputs.push(Arc::clone(&connector));
            parts[to].inputs.push(Arc::clone(&connector));
            parts[to].parent_ids.push(parent_id);
            connectors.push(connector);
        }

        let registry = self
            .stream_registry
            .unwrap_or_else(|| Arc::new(StreamRegistry::new(self.config.flow_depth)));
        let name = self.name;

        info!(
            pipeline = %name,
            modules = parts.len(),
            edges = edges.len(),
            "pipeline built"
        );

        let shared = Arc::new_cyclic(|weak| {
            let nodes: Vec<Node> = parts
                .into_iter()
                .enumerate()
                .map(|(idx, part)| {
                    let module_name: Arc<str> = Arc::from(part.config.name.as_str());
                    let ctx = ModuleContext::attached(
                        Arc::clone(&module_name),
                        part.id,
                        idx,
                        Arc::clone(&registry),
                        weak.clone(),
                    );
                    let parent_mask = part
                        .parent_ids
                        .iter()
                        .fold(0u64, |mask, id| mask | (1u64 << id));
                    Node {
                        name: module_name,
                        id: part.id,
                        config: part.config,
                        module: part.module,
                        ctx,
                        parent_ids: part.parent_ids,
                        parent_mask,
                        inputs: part.inputs,
                        outputs: part.outputs,
                        metrics: ModuleMetrics::new(),
                    }
                })
                .collect();
            let by_name = nodes
                .iter()
                .enumerate()
                .map(|(idx, node)| (node.name.to_string(), idx))
                .collect();
            Shared {
                name,
                nodes,
                by_name,
                connectors,
                running: AtomicBool::new(false),
                registry,
                bus: EventBus::new(),
                id_pool,
            }
        });

        Ok(Pipeline {
            shared,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stream_pool: StreamIndexPool::new(self.config.max_streams),
            sources: Mutex::new(HashMap::new()),
        })
    }
}

/// Reject graphs with a cycle (Kahn's algorithm)
fn check_acyclic(count: usize, edges: &[(usize, usize)]) -> Result<()> {
    let mut in_degree = vec![0usize; count];
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); count];
    for &(from, to) in edges {
        adj[from].push(to);
        in_degree[to] += 1;
    }
    let mut queue: Vec<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;
    while let Some(node) = queue.pop() {
        visited += 1;
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push(next);
            }
        }
    }
    if visited != count {
        return Err(PipelineError::CycleDetected);
    }
    Ok(())
}

struct NodeParts {
    config: ModuleConfig,
    module: Arc<dyn Module>,
    id: usize,
    parent_ids: Vec<usize>,
    inputs: Vec<Arc<Connector>>,
    outputs: Vec<Arc<Connector>>,
}

/// A module placed in the graph
struct Node {
    name: Arc<str>,
    id: usize,
    config: ModuleConfig,
    module: Arc<dyn Module>,
    ctx: ModuleContext,
    parent_ids: Vec<usize>,
    /// Ids of every upstream module, as bits. Not consulted when routing:
    /// a module with several parents receives a frame once per edge.
    parent_mask: u64,
    inputs: Vec<Arc<Connector>>,
    outputs: Vec<Arc<Connector>>,
    metrics: ModuleMetrics,
}

/// State reachable from worker loops and module contexts
pub(crate) struct Shared {
    name: String,
    nodes: Vec<Node>,
    by_name: HashMap<String, usize>,
    connectors: Vec<Arc<Connector>>,
    running: AtomicBool,
    registry: Arc<StreamRegistry>,
    bus: EventBus,
    id_pool: Arc<ModuleIdPool>,
}

impl Shared {
    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Forward `frame` from node `from` onto every outgoing connector.
    ///
    /// The lane is picked from the frame's stream index so one stream always
    /// lands on the same downstream worker. Full conveyors are retried with
    /// backoff until the pipeline stops.
    pub(crate) fn transmit(&self, from: usize, frame: FramePtr) -> Result<()> {
        let Some(node) = self.nodes.get(from) else {
            return Ok(());
        };
        frame.mark_passed(node.id);

        let Some((last, rest)) = node.outputs.split_last() else {
            if frame.is_eos() && frame.payload().is_none() && self.bus.is_running() {
                let event = Event::new(EventType::Eos, node.name.as_ref(), "end of stream")
                    .with_stream(frame.stream_id());
                self.bus.post_event(event);
            }
            return Ok(());
        };
        for connector in rest {
            self.push_with_backoff(node, connector, Arc::clone(&frame))?;
        }
        self.push_with_backoff(node, last, frame)
    }

    fn push_with_backoff(&self, node: &Node, connector: &Connector, frame: FramePtr) -> Result<()> {
        let lane = connector.lane_for(frame.stream_index());
        let mut backoff = PushBackoff::new();
        loop {
            if connector.push(lane, Arc::clone(&frame)) {
                return Ok(());
            }
            if connector.is_stopped() {
                return Err(PipelineError::Stopped);
            }
            if backoff.attempts() == 0 {
                node.metrics.record_push_retry();
                debug!(module = %node.name, lane, stream_id = frame.stream_id(), "downstream conveyor full");
            }
            backoff.snooze();
        }
    }

    fn process_frame(&self, node: &Node, frame: FramePtr) {
        // An EOS frame stays alive until its metrics are recorded, so anyone
        // waiting on the stream's EOS sees them
        let eos = frame.is_eos().then(|| Arc::clone(&frame));
        let start = Instant::now();
        match do_process(node.module.as_ref(), &node.ctx, frame) {
            Ok(()) if eos.is_some() => node.metrics.record_eos(),
            Ok(()) => node.metrics.record_processed(start.elapsed()),
            Err(PipelineError::Stopped) => {
                debug!(module = %node.name, "frame dropped during shutdown");
            }
            Err(e) => {
                node.metrics.record_failed();
                warn!(module = %node.name, error = %e, "frame processing failed");
            }
        }
    }
}

/// Input side of one worker: lane `lane` of every connector into its module
struct WorkerInput<'a> {
    connectors: &'a [Arc<Connector>],
    lane: usize,
    /// Connector checked first on the next pop, rotated for fairness
    cursor: usize,
}

impl WorkerInput<'_> {
    fn pop(&mut self) -> Option<FramePtr> {
        if let [connector] = self.connectors {
            return connector.pop(self.lane);
        }
        if let Some(frame) = self.try_pop() {
            return Some(frame);
        }
        let mut select = Select::new();
        for connector in self.connectors {
            select.recv(connector.conveyor(self.lane)?.receiver());
        }
        // All connectors of a pipeline stop together
        select.recv(self.connectors.first()?.stop_signal());
        select.ready_timeout(POP_TIMEOUT).ok()?;
        self.try_pop()
    }

    fn try_pop(&mut self) -> Option<FramePtr> {
        let count = self.connectors.len();
        for offset in 0..count {
            let idx = (self.cursor + offset) % count;
            if let Some(frame) = self.connectors[idx].conveyor(self.lane)?.try_pop() {
                self.cursor = (idx + 1) % count;
                return Some(frame);
            }
        }
        None
    }
}

fn run_worker(shared: Arc<Shared>, node_idx: usize, lane: usize) {
    let node = &shared.nodes[node_idx];
    debug!(module = %node.name, lane, "worker started");
    let mut input = WorkerInput {
        connectors: &node.inputs,
        lane,
        cursor: 0,
    };
    while shared.is_running() {
        if let Some(frame) = input.pop() {
            shared.process_frame(node, frame);
        }
    }
    debug!(module = %node.name, lane, "worker exit");
}

/// A graph of modules connected by connectors, plus the streams fed into it
pub struct Pipeline {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stream_pool: StreamIndexPool,
    sources: Mutex<HashMap<String, Arc<dyn SourceHandler>>>,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Open every module, start the event bus and spawn the worker loops.
    ///
    /// If a module fails to open, the modules opened before it are closed
    /// again and nothing runs.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::AlreadyStarted);
        }

        for (idx, node) in self.shared.nodes.iter().enumerate() {
            if let Err(e) = node.module.open(&node.ctx, &node.config.parameters) {
                error!(module = %node.name, error = %e, "module open failed");
                for opened in self.shared.nodes[..idx].iter().rev() {
                    opened.module.close();
                }
                self.started.store(false, Ordering::Release);
                return Err(PipelineError::ModuleOpen {
                    module: node.name.to_string(),
                    reason: e.to_string(),
                });
            }
            debug!(module = %node.name, id = node.id, "module opened");
        }

        if let Err(e) = self.shared.bus.start() {
            self.close_modules();
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        self.shared.running.store(true, Ordering::Release);

        let mut workers = self.workers.lock();
        for (idx, node) in self.shared.nodes.iter().enumerate() {
            if node.inputs.is_empty() {
                continue;
            }
            for lane in 0..node.config.parallelism {
                let shared = Arc::clone(&self.shared);
                let spawned = thread::Builder::new()
                    .name(format!("{}-{}", node.name, lane))
                    .spawn(move || run_worker(shared, idx, lane));
                match spawned {
                    Ok(handle) => workers.push(handle),
                    Err(e) => {
                        drop(workers);
                        self.stop();
                        return Err(PipelineError::ThreadError(e.to_string()));
                    }
                }
            }
        }

        info!(pipeline = %self.shared.name, workers = workers.len(), "pipeline started");
        Ok(())
    }

    /// Force-remove every source, stop the workers and the event bus, then
    /// close all modules. Frames still queued are released.
    pub fn stop(&self) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        self.remove_sources(true);

        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for connector in &self.shared.connectors {
            connector.stop();
        }
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                error!(pipeline = %self.shared.name, "worker thread panicked");
            }
        }
        self.shared.bus.stop();
        self.close_modules();

        let dropped: usize = self.shared.connectors.iter().map(|c| c.clear()).sum();
        info!(pipeline = %self.shared.name, dropped, "pipeline stopped");
    }

    fn close_modules(&self) {
        for node in self.shared.nodes.iter().rev() {
            node.module.close();
            debug!(module = %node.name, "module closed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Admit a stream through the first root module of the graph
    pub fn add_source(&self, handler: Arc<dyn SourceHandler>) -> Result<()> {
        let node = self
            .shared
            .nodes
            .iter()
            .position(|node| node.inputs.is_empty())
            .ok_or_else(|| PipelineError::NoSource("graph has no root module".into()))?;
        self.admit(node, handler)
    }

    /// Admit a stream through the module named `module`
    pub fn add_source_to(&self, module: &str, handler: Arc<dyn SourceHandler>) -> Result<()> {
        let node = *self
            .shared
            .by_name
            .get(module)
            .ok_or_else(|| PipelineError::NoSource(format!("no module named {module}")))?;
        self.admit(node, handler)
    }

    fn admit(&self, node_idx: usize, handler: Arc<dyn SourceHandler>) -> Result<()> {
        if !self.is_running() {
            return Err(PipelineError::NotRunning);
        }
        let stream_id = handler.stream_id().to_string();
        if stream_id.is_empty() {
            return Err(PipelineError::ConfigError("source stream id must not be empty".into()));
        }

        let mut sources = self.sources.lock();
        if sources.contains_key(&stream_id) {
            error!(stream_id = %stream_id, "duplicate stream id");
            return Err(PipelineError::DuplicateStream(stream_id));
        }
        let Some(stream_index) = self.stream_pool.acquire(&stream_id) else {
            error!(
                stream_id = %stream_id,
                max = self.stream_pool.capacity(),
                "stream rejected, maximum number of streams reached"
            );
            return Err(PipelineError::StreamLimit {
                stream_id,
                max: self.stream_pool.capacity(),
            });
        };

        self.shared.registry.set_removed(&stream_id, false);
        let node = &self.shared.nodes[node_idx];
        let sink = SourceSink::new(&stream_id, stream_index, node.ctx.clone());
        if let Err(e) = handler.open(sink) {
            error!(stream_id = %stream_id, error = %e, "source open failed");
            self.stream_pool.release(&stream_id);
            return Err(PipelineError::SourceOpen(stream_id));
        }

        info!(stream_id = %stream_id, stream_index, module = %node.name, "source added");
        sources.insert(stream_id, handler);
        Ok(())
    }

    /// Tear down one stream.
    ///
    /// The handler is closed, then the call waits until the stream's EOS
    /// frame has left the pipeline. With `force`, in-flight frames are
    /// flagged removed and the EOS is not waited for.
    pub fn remove_source(&self, stream_id: &str, force: bool) -> Result<()> {
        let Some(handler) = self.source_handler(stream_id) else {
            warn!(stream_id, "source does not exist");
            return Ok(());
        };
        let registry = &self.shared.registry;
        registry.set_removed(stream_id, force);
        handler.close();

        let reached = registry.check_eos_reached(stream_id, !force);
        registry.set_removed(stream_id, false);
        self.sources.lock().remove(stream_id);
        self.stream_pool.release(stream_id);
        info!(stream_id, force, eos_reached = reached, "source removed");
        Ok(())
    }

    /// Tear down every admitted stream, marking all before closing any
    pub fn remove_sources(&self, force: bool) {
        let handlers: Vec<(String, Arc<dyn SourceHandler>)> = self
            .sources
            .lock()
            .iter()
            .map(|(id, handler)| (id.clone(), Arc::clone(handler)))
            .collect();
        let registry = &self.shared.registry;
        for (stream_id, _) in &handlers {
            registry.set_removed(stream_id, force);
        }
        for (_, handler) in &handlers {
            handler.close();
        }
        for (stream_id, _) in &handlers {
            registry.check_eos_reached(stream_id, !force);
            registry.set_removed(stream_id, false);
            self.sources.lock().remove(stream_id);
            self.stream_pool.release(stream_id);
        }
        if !handlers.is_empty() {
            info!(count = handlers.len(), force, "sources removed");
        }
    }

    pub fn source_handler(&self, stream_id: &str) -> Option<Arc<dyn SourceHandler>> {
        self.sources.lock().get(stream_id).cloned()
    }

    /// Number of admitted streams
    pub fn stream_count(&self) -> usize {
        self.sources.lock().len()
    }

    /// Stream index assigned to an admitted stream
    pub fn stream_index(&self, stream_id: &str) -> Option<u32> {
        self.stream_pool.index_of(stream_id)
    }

    pub fn stream_registry(&self) -> &Arc<StreamRegistry> {
        &self.shared.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Register an event watcher, returns the number of watchers
    pub fn add_bus_watch<F>(&self, watcher: F) -> usize
    where
        F: Fn(&Event) -> EventHandleFlag + Send + Sync + 'static,
    {
        self.shared.bus.add_bus_watch(watcher)
    }

    pub fn post_event(&self, event: Event) -> bool {
        self.shared.bus.post_event(event)
    }

    pub fn module_names(&self) -> Vec<&str> {
        self.shared.nodes.iter().map(|node| node.name.as_ref()).collect()
    }

    pub fn module_id(&self, module: &str) -> Option<usize> {
        self.node(module).map(|node| node.id)
    }

    /// Ids of the modules feeding `module`
    pub fn parent_ids(&self, module: &str) -> Option<&[usize]> {
        self.node(module).map(|node| node.parent_ids.as_slice())
    }

    /// Bitmask of the ids of the modules feeding `module`
    pub fn parent_mask(&self, module: &str) -> Option<u64> {
        self.node(module).map(|node| node.parent_mask)
    }

    /// The connector on the edge `from` -> `to`
    pub fn connector(&self, from: &str, to: &str) -> Option<Arc<Connector>> {
        let producer = self.node(from)?;
        let consumer = self.node(to)?;
        producer
            .outputs
            .iter()
            .find(|out| consumer.inputs.iter().any(|input| Arc::ptr_eq(out, input)))
            .cloned()
    }

    pub fn module_metrics(&self, module: &str) -> Option<MetricsSnapshot> {
        self.node(module).map(|node| node.metrics.snapshot())
    }

    /// Get a summary of all module metrics
    pub fn metrics_summary(&self) -> String {
        let mut summary = format!("Pipeline {} metrics:\n", self.shared.name);
        for node in &self.shared.nodes {
            summary.push_str(&format!("  Module {} (id {}): {}\n", node.name, node.id, node.metrics.snapshot()));
        }
        summary
    }

    fn node(&self, module: &str) -> Option<&Node> {
        self.shared
            .by_name
            .get(module)
            .map(|&idx| &self.shared.nodes[idx])
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
        for node in &self.shared.nodes {
            self.shared.id_pool.release(node.id);
        }
    }
}
