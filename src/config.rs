//! Module descriptors and pipeline-wide settings.
//!
//! Both types derive serde traits so whatever loads the application's
//! configuration can deserialize them directly; the crate itself never reads
//! files.

use crate::conveyor::DEFAULT_CONVEYOR_CAPACITY;
use crate::error::{PipelineError, Result};
use crate::module::ModuleParams;
use serde::{Deserialize, Serialize};

/// Default upper bound on concurrently admitted streams
pub const DEFAULT_MAX_STREAMS: usize = 64;

/// Description of one module in the graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Unique module name, used for routing and event attribution
    pub name: String,
    /// Tag looked up in the [`ModuleRegistry`](crate::ModuleRegistry)
    pub class_name: String,
    /// Passed verbatim to `Module::open`
    #[serde(alias = "custom_params")]
    pub parameters: ModuleParams,
    /// Number of worker loops, and of conveyors on every edge into the module
    pub parallelism: usize,
    /// Capacity of each input conveyor
    pub max_input_queue_size: usize,
    /// Names of the downstream modules
    pub next_modules: Vec<String>,
}

impl ModuleConfig {
    pub fn new(name: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_name: class_name.into(),
            ..Self::default()
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.max_input_queue_size = size;
        self
    }

    /// Add a downstream module
    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next_modules.push(next.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Check the descriptor on its own. `has_inputs` tells whether any edge
    /// leads into the module; root modules may have zero parallelism.
    pub fn validate(&self, has_inputs: bool) -> Result<()> {
        if self.name.is_empty() {
            return Err(PipelineError::ConfigError("module name must not be empty".into()));
        }
        if has_inputs && self.parallelism == 0 {
            return Err(PipelineError::ConfigError(format!(
                "parallelism of module {} must be larger than 0",
                self.name
            )));
        }
        if has_inputs && self.max_input_queue_size == 0 {
            return Err(PipelineError::ConfigError(format!(
                "max_input_queue_size of module {} must be larger than 0",
                self.name
            )));
        }
        Ok(())
    }
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            class_name: String::new(),
            parameters: ModuleParams::new(),
            parallelism: 1,
            max_input_queue_size: DEFAULT_CONVEYOR_CAPACITY,
            next_modules: Vec::new(),
        }
    }
}

/// Settings shared by the whole pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Size of the stream index pool
    pub max_streams: usize,
    /// Live non-EOS frames allowed per stream, 0 = unlimited. Only used when
    /// the pipeline creates its own stream registry.
    pub flow_depth: usize,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_streams == 0 {
            return Err(PipelineError::ConfigError(
                "max_streams must be larger than 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            flow_depth: 0,
        }
    }
}
