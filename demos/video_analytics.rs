//! Multi-camera analytics pipeline over synthetic frames
//!
//! Pipeline:
//! 1. decoder: built-in source module fed by one synthetic camera per stream
//! 2. detector: marks every frame whose timestamp is a multiple of 7 as
//!    containing an object (4 workers)
//! 3. tracker: counts detections per stream
//!
//! Camera "cam2" reports a decode error halfway through; a bus watcher
//! removes it while the other cameras keep running.
//!
//! Usage: RUST_LOG=info cargo run --example video_analytics --release

use frame_pipeline::{
    param, EventHandleFlag, EventType, FrameFlags, FramePtr, Module, ModuleConfig,
    ModuleContext, ModuleParams, ModuleRegistry, Pipeline, PipelineBuilder,
    Result as PipelineResult, SourceHandler, SourceSink,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const DETECTION_KEY: u32 = 1;

/// Emits `frames` frames at a fixed rate, failing at frame `fail_at` if set
struct SyntheticCamera {
    stream_id: String,
    frames: usize,
    fail_at: Option<usize>,
    stop: Arc<AtomicBool>,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl SyntheticCamera {
    fn new(stream_id: &str, frames: usize, fail_at: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            stream_id: stream_id.to_string(),
            frames,
            fail_at,
            stop: Arc::new(AtomicBool::new(false)),
            producer: Mutex::new(None),
        })
    }
}

impl SourceHandler for SyntheticCamera {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn open(&self, sink: SourceSink) -> PipelineResult<()> {
        let stop = Arc::clone(&self.stop);
        let frames = self.frames;
        let fail_at = self.fail_at;
        let handle = thread::spawn(move || {
            for i in 0..frames {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let Some(frame) = sink.create_frame(false, None) else {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                };
                frame.set_timestamp(i as i64);
                if Some(i) == fail_at {
                    frame.set_flag(FrameFlags::INVALID);
                }
                sink.send_data(frame);
                thread::sleep(Duration::from_millis(2));
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

/// Flags frames that contain an "object"
#[derive(Default)]
struct Detector {
    every: AtomicUsize,
}

impl Module for Detector {
    fn open(&self, _ctx: &ModuleContext, params: &ModuleParams) -> PipelineResult<()> {
        let every = param::<usize>(params, "every")?.unwrap_or(7).max(1);
        self.every.store(every, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) {}

    fn process(&self, ctx: &ModuleContext, frame: &FramePtr) -> PipelineResult<()> {
        // Invalid frames are reported and passed on untouched
        if frame.is_invalid() {
            ctx.post_event(EventType::StreamError, frame.stream_id(), "corrupted frame");
            return Ok(());
        }
        let every = self.every.load(Ordering::Relaxed) as i64;
        frame.insert_data(DETECTION_KEY, frame.timestamp() % every == 0);
        Ok(())
    }
}

/// Counts detections per stream and prints a line at each EOS
#[derive(Default)]
struct Tracker {
    detections: Mutex<HashMap<String, usize>>,
}

impl Module for Tracker {
    fn open(&self, _ctx: &ModuleContext, _params: &ModuleParams) -> PipelineResult<()> {
        Ok(())
    }

    fn close(&self) {}

    fn process(&self, _ctx: &ModuleContext, frame: &FramePtr) -> PipelineResult<()> {
        let hit = frame.data::<bool>(DETECTION_KEY).map_or(false, |hit| *hit);
        let mut detections = self.detections.lock();
        let count = detections.entry(frame.stream_id().to_string()).or_default();
        if hit {
            *count += 1;
        }
        Ok(())
    }

    fn on_eos(&self, _ctx: &ModuleContext, stream_id: &str) {
        let count = self.detections.lock().get(stream_id).copied().unwrap_or(0);
        println!("{stream_id}: finished with {count} detections");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    println!("Video Analytics Pipeline");
    println!("========================");
    println!();

    let start = Instant::now();

    let mut registry = ModuleRegistry::with_builtins();
    registry.register("detector", |_| Arc::new(Detector::default()) as Arc<dyn Module>);
    registry.register("tracker", |_| Arc::new(Tracker::default()) as Arc<dyn Module>);

    let pipeline = Arc::new(
        PipelineBuilder::new("video-analytics")
            .with_module_registry(registry)
            .add_module(ModuleConfig::new("decoder", "source").with_next("detector"))
            .add_module(
                ModuleConfig::new("detector", "detector")
                    .with_parallelism(4)
                    .with_param("every", "7")
                    .with_next("tracker"),
            )
            .add_module(ModuleConfig::new("tracker", "tracker").with_parallelism(2))
            .build()?,
    );

    // Removing a stream waits on its EOS, so it happens off the bus thread
    let weak: Weak<Pipeline> = Arc::downgrade(&pipeline);
    pipeline.add_bus_watch(move |event| {
        match event.event_type {
            EventType::StreamError => {
                println!("{event}, removing stream");
                let weak = weak.clone();
                let stream_id = event.stream_id.clone();
                thread::spawn(move || {
                    if let Some(pipeline) = weak.upgrade() {
                        let _ = pipeline.remove_source(&stream_id, true);
                    }
                });
                EventHandleFlag::Intercepted
            }
            EventType::Eos => EventHandleFlag::Synced,
            _ => EventHandleFlag::Null,
        }
    });

    pipeline.start()?;

    let cameras = [("cam0", None), ("cam1", None), ("cam2", Some(100)), ("cam3", None)];
    for (stream_id, fail_at) in cameras {
        pipeline.add_source(SyntheticCamera::new(stream_id, 300, fail_at))?;
    }
    for (stream_id, _) in cameras {
        pipeline.remove_source(stream_id, false)?;
    }

    println!();
    print!("{}", pipeline.metrics_summary());
    pipeline.stop();

    let elapsed = start.elapsed();
    println!("\nPipeline execution time: {:.3}s", elapsed.as_secs_f64());

    Ok(())
}
