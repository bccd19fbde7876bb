use thiserror::Error;

/// Result type for frame pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while building, running or feeding a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Pipeline has already been started
    #[error("Pipeline has already been started")]
    AlreadyStarted,

    /// Pipeline is not running
    #[error("Pipeline is not running")]
    NotRunning,

    /// Pipeline was stopped while an operation was in progress
    #[error("Pipeline stopped")]
    Stopped,

    /// No modules in pipeline
    #[error("Cannot build pipeline with no modules")]
    NoModules,

    /// Two module descriptors share a name
    #[error("Duplicate module name: {0}")]
    DuplicateModule(String),

    /// A `next_modules` entry names a module that was never added
    #[error("Module {from} links to unknown module {to}")]
    UnknownModule { from: String, to: String },

    /// No constructor is registered for a class name
    #[error("No module registered for class name {0}")]
    UnknownClass(String),

    /// The graph exceeds the module id space
    #[error("Too many modules: {count} exceeds the limit of {max}")]
    TooManyModules { count: usize, max: usize },

    /// The module graph contains a cycle
    #[error("Cycle detected in module graph")]
    CycleDetected,

    /// A module failed to open
    #[error("Module {module} failed to open: {reason}")]
    ModuleOpen { module: String, reason: String },

    /// A module failed to process one frame
    #[error("Module {module} failed to process frame of stream {stream_id}: {message}")]
    Process {
        module: String,
        stream_id: String,
        message: String,
    },

    /// A stream id is already admitted
    #[error("Duplicate stream id: {0}")]
    DuplicateStream(String),

    /// The stream index pool is exhausted
    #[error("Stream {stream_id} rejected: maximum of {max} streams reached")]
    StreamLimit { stream_id: String, max: usize },

    /// A source handler failed to open
    #[error("Source for stream {0} failed to open")]
    SourceOpen(String),

    /// No module can accept source handlers
    #[error("No source module: {0}")]
    NoSource(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Thread spawn or join error
    #[error("Thread error: {0}")]
    ThreadError(String),
}

impl PipelineError {
    /// Build a processing failure for `module` on `stream_id`
    pub fn process(
        module: impl Into<String>,
        stream_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        PipelineError::Process {
            module: module.into(),
            stream_id: stream_id.into(),
            message: message.into(),
        }
    }
}
