//! Configuration for blobvfs
//!
//! Centralized configuration with sensible defaults.

use tracing::level_filters::LevelFilter;

use crate::bridge::DEFAULT_POLL_BUDGET;
use crate::error::{Result, VfsError};
use crate::topology::{Topology, DEFAULT_DEVICE};

/// Main configuration for a blobvfs context
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Descriptor Table
    // -------------------------------------------------------------------------
    /// Number of descriptor slots (the highest descriptor is `max_descriptors - 1`)
    pub max_descriptors: usize,

    /// Descriptors below this value are never issued (stdin/stdout/stderr)
    pub reserved_descriptors: usize,

    // -------------------------------------------------------------------------
    // Bridge
    // -------------------------------------------------------------------------
    /// Poll attempts before an in-flight operation is reported as timed out
    pub poll_budget: u32,

    /// Name given to the single worker
    pub worker_name: String,

    // -------------------------------------------------------------------------
    // Storage
    // -------------------------------------------------------------------------
    /// Block device the blob store is initialized on
    pub store_device: String,

    /// Clusters each new blob is resized to.
    /// `None` resizes to every cluster the store reports free at that moment.
    pub blob_clusters: Option<u64>,

    /// Verbosity handed to the storage engine at bring-up
    pub backend_log_level: LevelFilter,

    /// Device topology loaded on engine bring-up
    pub topology: Topology,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_descriptors: 1024,
            reserved_descriptors: 3,
            poll_budget: DEFAULT_POLL_BUDGET,
            worker_name: "blobvfs-worker".to_string(),
            store_device: DEFAULT_DEVICE.to_string(),
            blob_clusters: None,
            backend_log_level: LevelFilter::INFO,
            topology: Topology::default(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.reserved_descriptors >= self.max_descriptors {
            return Err(VfsError::Config(format!(
                "reserved descriptors ({}) leave no room in a table of {}",
                self.reserved_descriptors, self.max_descriptors
            )));
        }
        if self.max_descriptors > i32::MAX as usize {
            return Err(VfsError::Config(format!(
                "descriptor table of {} slots exceeds the descriptor range",
                self.max_descriptors
            )));
        }
        if self.poll_budget == 0 {
            return Err(VfsError::Config("poll budget must be at least 1".into()));
        }
        if self.blob_clusters == Some(0) {
            return Err(VfsError::Config("blobs need at least one cluster".into()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the descriptor table capacity
    pub fn max_descriptors(mut self, count: usize) -> Self {
        self.config.max_descriptors = count;
        self
    }

    /// Set how many low descriptors are never issued
    pub fn reserved_descriptors(mut self, count: usize) -> Self {
        self.config.reserved_descriptors = count;
        self
    }

    /// Set the poll attempt budget per operation
    pub fn poll_budget(mut self, attempts: u32) -> Self {
        self.config.poll_budget = attempts;
        self
    }

    /// Set the worker name
    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.config.worker_name = name.into();
        self
    }

    /// Set the block device the store lives on
    pub fn store_device(mut self, name: impl Into<String>) -> Self {
        self.config.store_device = name.into();
        self
    }

    /// Pin every new blob to a fixed cluster count
    pub fn blob_clusters(mut self, clusters: u64) -> Self {
        self.config.blob_clusters = Some(clusters);
        self
    }

    /// Set the storage engine log level
    pub fn backend_log_level(mut self, level: LevelFilter) -> Self {
        self.config.backend_log_level = level;
        self
    }

    /// Set the device topology
    pub fn topology(mut self, topology: Topology) -> Self {
        self.config.topology = topology;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
