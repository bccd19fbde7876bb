use frame_pipeline::{
    param, EventHandleFlag, EventType, FramePtr, Module, ModuleConfig, ModuleContext,
    ModuleParams, ModuleRegistry, PipelineBuilder, PipelineConfig, PipelineError,
    Result as PipelineResult, SourceHandler, SourceSink,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Produces `frames` ordinary frames then an EOS. An endless source keeps
/// going until closed.
struct TestSource {
    stream_id: String,
    frames: usize,
    endless: bool,
    stop: Arc<AtomicBool>,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl TestSource {
    fn new(stream_id: &str, frames: usize) -> Arc<Self> {
        Arc::new(Self {
            stream_id: stream_id.to_string(),
            frames,
            endless: false,
            stop: Arc::new(AtomicBool::new(false)),
            producer: Mutex::new(None),
        })
    }

    fn endless(stream_id: &str) -> Arc<Self> {
        Arc::new(Self {
            stream_id: stream_id.to_string(),
            frames: 0,
            endless: true,
            stop: Arc::new(AtomicBool::new(false)),
            producer: Mutex::new(None),
        })
    }
}

impl SourceHandler for TestSource {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn open(&self, sink: SourceSink) -> PipelineResult<()> {
        let stop = Arc::clone(&self.stop);
        let frames = self.frames;
        let endless = self.endless;
        let handle = thread::spawn(move || {
            for i in 0.. {
                if endless {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                } else if i >= frames {
                    break;
                }
                let frame = loop {
                    match sink.create_frame(false, None) {
                        Some(frame) => break frame,
                        None => thread::sleep(Duration::from_millis(1)),
                    }
                };
                frame.set_timestamp(i as i64);
                sink.send_data(frame);
                if endless {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            sink.send_eos();
        });
        *self.producer.lock() = Some(handle);
        Ok(())
    }

    fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.producer.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Records the timestamps and EOS of every stream it sees
#[derive(Default)]
struct CollectSink {
    seen: Mutex<HashMap<String, Vec<i64>>>,
    eos: Mutex<Vec<String>>,
}

impl CollectSink {
    fn frames_of(&self, stream_id: &str) -> Vec<i64> {
        self.seen.lock().get(stream_id).cloned().unwrap_or_default()
    }

    fn total(&self) -> usize {
        self.seen.lock().values().map(Vec::len).sum()
    }
}

impl Module for CollectSink {
    fn open(&self, _ctx: &ModuleContext, _params: &ModuleParams) -> PipelineResult<()> {
        Ok(())
    }

    fn close(&self) {}

    fn process(&self, _ctx: &ModuleContext, frame: &FramePtr) -> PipelineResult<()> {
        self.seen
            .lock()
            .entry(frame.stream_id().to_string())
            .or_default()
            .push(frame.timestamp());
        Ok(())
    }

    fn on_eos(&self, _ctx: &ModuleContext, stream_id: &str) {
        self.eos.lock().push(stream_id.to_string());
    }
}

/// Counts frames, optionally failing every frame at `fail_at`
#[derive(Default)]
struct Counter {
    processed: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail_at: Option<i64>,
    fail_open: bool,
}

impl Module for Counter {
    fn open(&self, _ctx: &ModuleContext, _params: &ModuleParams) -> PipelineResult<()> {
        if self.fail_open {
            return Err(PipelineError::ConfigError("model file missing".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn process(&self, ctx: &ModuleContext, frame: &FramePtr) -> PipelineResult<()> {
        if Some(frame.timestamp()) == self.fail_at {
            ctx.post_event(EventType::StreamError, frame.stream_id(), "decode failed");
            return Err(PipelineError::process(ctx.name(), frame.stream_id(), "decode failed"));
        }
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn test_end_to_end_graceful_removal() {
    let filter = Arc::new(Counter::default());
    let sink = Arc::new(CollectSink::default());
    let pipeline = PipelineBuilder::new("e2e")
        .add_module(ModuleConfig::new("src", "source").with_next("filter"))
        .add_module_instance(
            ModuleConfig::new("filter", "counter")
                .with_parallelism(2)
                .with_next("sink"),
            filter.clone(),
        )
        .add_module_instance(ModuleConfig::new("sink", "collect"), sink.clone())
        .build()
        .expect("Pipeline build failed");

    let (eos_tx, eos_rx) = crossbeam::channel::unbounded();
    pipeline.add_bus_watch(move |event| {
        if event.event_type == EventType::Eos {
            let _ = eos_tx.send((event.stream_id.clone(), event.module_name.clone()));
        }
        EventHandleFlag::Null
    });

    pipeline.start().expect("Pipeline start failed");
    pipeline
        .add_source(TestSource::new("0", 100))
        .expect("Add source failed");
    assert_eq!(pipeline.stream_index("0"), Some(0));

    pipeline.remove_source("0", false).expect("Remove failed");

    // Removal returned, so the EOS has left the pipeline
    assert_eq!(*sink.eos.lock(), vec!["0".to_string()]);
    assert_eq!(sink.frames_of("0"), (0..100).collect::<Vec<i64>>());
    assert_eq!(filter.processed.load(Ordering::SeqCst), 100);
    assert_eq!(pipeline.stream_count(), 0);
    assert_eq!(pipeline.stream_registry().live_frames("0"), 0);

    let (stream_id, module) = eos_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("No EOS event");
    assert_eq!(stream_id, "0");
    assert_eq!(module, "sink");

    let metrics = pipeline.module_metrics("sink").unwrap();
    assert_eq!(metrics.processed, 100);
    assert_eq!(metrics.eos, 1);
    assert!(pipeline.metrics_summary().contains("Module filter"));

    pipeline.stop();
    assert_eq!(filter.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_forced_removal_returns_immediately() {
    let sink = Arc::new(CollectSink::default());
    let pipeline = PipelineBuilder::new("forced")
        .add_module(ModuleConfig::new("src", "source").with_next("sink"))
        .add_module_instance(ModuleConfig::new("sink", "collect"), sink.clone())
        .build()
        .unwrap();
    pipeline.start().unwrap();
    pipeline.add_source(TestSource::endless("cam")).unwrap();

    assert!(wait_until(Duration::from_secs(5), || sink.total() > 10));

    let start = Instant::now();
    pipeline.remove_source("cam", true).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(pipeline.source_handler("cam").is_none());
    assert!(!pipeline.stream_registry().is_removed("cam"));

    // The stream id can be admitted again once removed
    pipeline.add_source(TestSource::new("cam", 3)).unwrap();
    pipeline.remove_source("cam", false).unwrap();
    pipeline.stop();
}

#[test]
fn test_remove_unknown_source_is_noop() {
    let pipeline = PipelineBuilder::new("p")
        .add_module(ModuleConfig::new("src", "source"))
        .build()
        .unwrap();
    assert!(pipeline.remove_source("nope", false).is_ok());
}

#[test]
fn test_open_failure_aborts_start() {
    let first = Arc::new(Counter::default());
    let broken = Arc::new(Counter {
        fail_open: true,
        ..Counter::default()
    });
    let pipeline = PipelineBuilder::new("broken")
        .add_module(ModuleConfig::new("src", "source").with_next("first"))
        .add_module_instance(ModuleConfig::new("first", "counter").with_next("broken"), first.clone())
        .add_module_instance(ModuleConfig::new("broken", "counter"), broken.clone())
        .build()
        .unwrap();

    let err = pipeline.start().unwrap_err();
    assert!(matches!(err, PipelineError::ModuleOpen { ref module, .. } if module == "broken"));
    assert!(!pipeline.is_running());
    assert_eq!(first.opened.load(Ordering::SeqCst), 1);
    assert_eq!(first.closed.load(Ordering::SeqCst), 1);
    assert_eq!(broken.opened.load(Ordering::SeqCst), 0);
}

#[test]
fn test_duplicate_stream_rejected() {
    let pipeline = PipelineBuilder::new("dup")
        .add_module(ModuleConfig::new("src", "source").with_next("sink"))
        .add_module_instance(ModuleConfig::new("sink", "collect"), Arc::new(CollectSink::default()))
        .build()
        .unwrap();
    pipeline.start().unwrap();

    pipeline.add_source(TestSource::new("a", 0)).unwrap();
    let err = pipeline.add_source(TestSource::new("a", 0)).unwrap_err();
    assert!(matches!(err, PipelineError::DuplicateStream(id) if id == "a"));
    assert_eq!(pipeline.stream_count(), 1);
    pipeline.stop();
}

#[test]
fn test_stream_limit() {
    let pipeline = PipelineBuilder::new("limit")
        .with_config(PipelineConfig {
            max_streams: 1,
            flow_depth: 0,
        })
        .add_module(ModuleConfig::new("src", "source").with_next("sink"))
        .add_module_instance(ModuleConfig::new("sink", "collect"), Arc::new(CollectSink::default()))
        .build()
        .unwrap();
    pipeline.start().unwrap();

    pipeline.add_source(TestSource::new("a", 0)).unwrap();
    let err = pipeline.add_source(TestSource::new("b", 0)).unwrap_err();
    assert!(matches!(err, PipelineError::StreamLimit { max: 1, .. }));

    // Removing frees the index for the next stream
    pipeline.remove_source("a", false).unwrap();
    pipeline.add_source(TestSource::new("b", 0)).unwrap();
    assert_eq!(pipeline.stream_index("b"), Some(0));
    pipeline.stop();
}

#[test]
fn test_add_source_to_unknown_module() {
    let pipeline = PipelineBuilder::new("p")
        .add_module(ModuleConfig::new("src", "source"))
        .build()
        .unwrap();
    let err = pipeline
        .add_source_to("decoder", TestSource::new("a", 0))
        .unwrap_err();
    assert!(matches!(err, PipelineError::NoSource(_)));
}

#[test]
fn test_stream_error_reaches_watcher() {
    let counter = Arc::new(Counter {
        fail_at: Some(5),
        ..Counter::default()
    });
    let pipeline = PipelineBuilder::new("errors")
        .add_module(ModuleConfig::new("src", "source").with_next("decoder"))
        .add_module_instance(ModuleConfig::new("decoder", "counter"), counter.clone())
        .build()
        .unwrap();

    let (tx, rx) = crossbeam::channel::unbounded();
    pipeline.add_bus_watch(move |event| {
        if event.event_type == EventType::StreamError {
            let _ = tx.send(event.clone());
            return EventHandleFlag::Intercepted;
        }
        EventHandleFlag::Null
    });
    pipeline.start().unwrap();
    pipeline.add_source(TestSource::new("cam", 10)).unwrap();

    let event = rx.recv_timeout(Duration::from_secs(5)).expect("No stream error");
    assert_eq!(event.stream_id, "cam");
    assert_eq!(event.module_name, "decoder");
    assert_eq!(event.message, "decode failed");

    pipeline.remove_source("cam", false).unwrap();
    assert_eq!(counter.processed.load(Ordering::SeqCst), 9);
    assert_eq!(pipeline.module_metrics("decoder").unwrap().failed, 1);
    pipeline.stop();
}

#[test]
fn test_streams_keep_order_across_workers() {
    let sink = Arc::new(CollectSink::default());
    let pipeline = PipelineBuilder::new("multi")
        .add_module(ModuleConfig::new("src", "source").with_next("relay"))
        .add_module_instance(
            ModuleConfig::new("relay", "counter")
                .with_parallelism(3)
                .with_queue_size(4)
                .with_next("sink"),
            Arc::new(Counter::default()),
        )
        .add_module_instance(
            ModuleConfig::new("sink", "collect").with_parallelism(2),
            sink.clone(),
        )
        .build()
        .unwrap();
    pipeline.start().unwrap();

    let streams = ["a", "b", "c", "d", "e"];
    for id in streams {
        pipeline.add_source(TestSource::new(id, 50)).unwrap();
    }
    for id in streams {
        pipeline.remove_source(id, false).unwrap();
    }

    for id in streams {
        assert_eq!(sink.frames_of(id), (0..50).collect::<Vec<i64>>(), "stream {id}");
    }
    assert_eq!(sink.eos.lock().len(), streams.len());
    pipeline.stop();
}

#[test]
fn test_fan_out_and_join() {
    // src -> left -> join, src -> right -> join
    let left = Arc::new(CollectSink::default());
    let right = Arc::new(CollectSink::default());
    let join = Arc::new(CollectSink::default());
    let pipeline = PipelineBuilder::new("diamond")
        .add_module(
            ModuleConfig::new("src", "source")
                .with_next("left")
                .with_next("right"),
        )
        .add_module_instance(ModuleConfig::new("left", "collect").with_next("join"), left.clone())
        .add_module_instance(ModuleConfig::new("right", "collect").with_next("join"), right.clone())
        .add_module_instance(ModuleConfig::new("join", "collect"), join.clone())
        .build()
        .unwrap();

    let left_id = pipeline.module_id("left").unwrap();
    let right_id = pipeline.module_id("right").unwrap();
    assert_eq!(
        pipeline.parent_mask("join"),
        Some((1u64 << left_id) | (1u64 << right_id))
    );

    pipeline.start().unwrap();
    pipeline.add_source(TestSource::new("s", 20)).unwrap();
    pipeline.remove_source("s", false).unwrap();

    assert_eq!(left.frames_of("s").len(), 20);
    assert_eq!(right.frames_of("s").len(), 20);
    // One delivery per incoming edge
    assert_eq!(join.frames_of("s").len(), 40);
    pipeline.stop();
}

#[test]
fn test_flow_depth_bounds_live_frames() {
    let pipeline = PipelineBuilder::new("depth")
        .with_config(PipelineConfig {
            max_streams: 4,
            flow_depth: 2,
        })
        .add_module(ModuleConfig::new("src", "source").with_next("sink"))
        .add_module_instance(ModuleConfig::new("sink", "collect"), Arc::new(CollectSink::default()))
        .build()
        .unwrap();
    assert_eq!(pipeline.stream_registry().flow_depth(), 2);

    pipeline.start().unwrap();
    pipeline.add_source(TestSource::new("s", 30)).unwrap();
    let registry = Arc::clone(pipeline.stream_registry());
    let mut peak = 0;
    wait_until(Duration::from_millis(200), || {
        peak = peak.max(registry.live_frames("s"));
        false
    });
    assert!(peak <= 2);
    pipeline.remove_source("s", false).unwrap();
    assert_eq!(pipeline.module_metrics("sink").unwrap().processed, 30);
    pipeline.stop();
}

#[test]
fn test_stop_releases_sources() {
    let pipeline = PipelineBuilder::new("stop")
        .add_module(ModuleConfig::new("src", "source").with_next("sink"))
        .add_module_instance(ModuleConfig::new("sink", "collect"), Arc::new(CollectSink::default()))
        .build()
        .unwrap();
    pipeline.start().unwrap();
    pipeline.add_source(TestSource::endless("a")).unwrap();
    pipeline.add_source(TestSource::endless("b")).unwrap();

    pipeline.stop();
    assert!(!pipeline.is_running());
    assert_eq!(pipeline.stream_count(), 0);
    assert!(!pipeline.event_bus().is_running());
}

/// Forwards frames itself, re-issuing some as new frames of the same stream
#[derive(Default)]
struct SelfForwarding {
    seen: AtomicUsize,
    eos_seen: AtomicUsize,
    wrapped: AtomicUsize,
}

impl Module for SelfForwarding {
    fn open(&self, _ctx: &ModuleContext, _params: &ModuleParams) -> PipelineResult<()> {
        Ok(())
    }

    fn close(&self) {}

    fn process(&self, ctx: &ModuleContext, frame: &FramePtr) -> PipelineResult<()> {
        if frame.is_eos() {
            self.eos_seen.fetch_add(1, Ordering::SeqCst);
            return ctx.transmit(Arc::clone(frame));
        }
        self.seen.fetch_add(1, Ordering::SeqCst);
        // Every third frame is re-issued as a new frame of the same stream
        if frame.timestamp() % 3 == 0 {
            if let Some(copy) = ctx.create_frame_like(frame, false) {
                copy.set_timestamp(frame.timestamp());
                self.wrapped.fetch_add(1, Ordering::SeqCst);
                return ctx.transmit(copy);
            }
        }
        ctx.transmit(Arc::clone(frame))
    }

    fn has_transmit(&self) -> bool {
        true
    }
}

#[test]
fn test_self_forwarding_module_mid_graph() {
    let relay = Arc::new(SelfForwarding::default());
    let sink = Arc::new(CollectSink::default());
    let pipeline = PipelineBuilder::new("relay")
        .add_module(ModuleConfig::new("src", "source").with_next("relay"))
        .add_module_instance(
            ModuleConfig::new("relay", "relay")
                .with_parallelism(2)
                .with_next("sink"),
            relay.clone(),
        )
        .add_module_instance(
            ModuleConfig::new("sink", "collect").with_parallelism(2),
            sink.clone(),
        )
        .build()
        .unwrap();
    pipeline.start().unwrap();

    for id in ["a", "b"] {
        pipeline.add_source(TestSource::new(id, 30)).unwrap();
    }
    for id in ["a", "b"] {
        pipeline.remove_source(id, false).unwrap();
    }

    for id in ["a", "b"] {
        assert_eq!(sink.frames_of(id), (0..30).collect::<Vec<i64>>(), "stream {id}");
    }
    // The relay sees EOS frames through process, never through on_eos
    assert_eq!(relay.eos_seen.load(Ordering::SeqCst), 2);
    assert_eq!(relay.seen.load(Ordering::SeqCst), 60);
    assert_eq!(relay.wrapped.load(Ordering::SeqCst), 20);
    assert_eq!(sink.eos.lock().len(), 2);
    pipeline.stop();
}

/// Counts frames and checks them against a `limit` parameter
#[derive(Default)]
struct Limiter {
    limit: AtomicUsize,
    passed: Arc<AtomicUsize>,
}

impl Module for Limiter {
    fn open(&self, _ctx: &ModuleContext, params: &ModuleParams) -> PipelineResult<()> {
        let limit = param::<usize>(params, "limit")?.unwrap_or(usize::MAX);
        self.limit.store(limit, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {}

    fn process(&self, ctx: &ModuleContext, frame: &FramePtr) -> PipelineResult<()> {
        if frame.timestamp() as usize >= self.limit.load(Ordering::SeqCst) {
            return Err(PipelineError::process(ctx.name(), frame.stream_id(), "over limit"));
        }
        self.passed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_pipeline_from_json_descriptors() {
    let json = r#"[
        { "name": "decoder", "class_name": "source", "parallelism": 0, "next_modules": ["limiter"] },
        { "name": "limiter", "class_name": "limiter", "parallelism": 2,
          "max_input_queue_size": 8, "parameters": { "limit": "7" } }
    ]"#;
    let configs: Vec<ModuleConfig> = serde_json::from_str(json).unwrap();

    let passed = Arc::new(AtomicUsize::new(0));
    let mut registry = ModuleRegistry::with_builtins();
    let counter = Arc::clone(&passed);
    registry.register("limiter", move |_name| {
        Arc::new(Limiter {
            limit: AtomicUsize::new(0),
            passed: Arc::clone(&counter),
        }) as Arc<dyn Module>
    });

    let mut builder = PipelineBuilder::new("json").with_module_registry(registry);
    for config in configs {
        builder = builder.add_module(config);
    }
    let pipeline = builder.build().unwrap();
    assert_eq!(pipeline.connector("decoder", "limiter").unwrap().conveyor_capacity(), 8);

    pipeline.start().unwrap();
    pipeline.add_source(TestSource::new("cam", 10)).unwrap();
    pipeline.remove_source("cam", false).unwrap();

    assert_eq!(passed.load(Ordering::SeqCst), 7);
    assert_eq!(pipeline.module_metrics("limiter").unwrap().failed, 3);
    pipeline.stop();
}

#[test]
fn test_invalid_parameter_fails_open() {
    let mut registry = ModuleRegistry::with_builtins();
    registry.register("limiter", |_| Arc::new(Limiter::default()) as Arc<dyn Module>);
    let pipeline = PipelineBuilder::new("bad-param")
        .with_module_registry(registry)
        .add_module(ModuleConfig::new("src", "source").with_next("limiter"))
        .add_module(ModuleConfig::new("limiter", "limiter").with_param("limit", "lots"))
        .build()
        .unwrap();
    assert!(matches!(pipeline.start(), Err(PipelineError::ModuleOpen { .. })));
}
