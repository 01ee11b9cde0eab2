//! Device Topology
//!
//! The structured payload handed to engine initialization. It lists the
//! block devices the engine should bring up before the blob store is
//! initialized on one of them.
//!
//! ## Format
//! ```text
//! {
//!   "subsystems": [
//!     { "subsystem": "bdev",
//!       "config": [
//!         { "method": "bdev_malloc_create",
//!           "params": { "name": "Malloc0", "num_blocks": 32768, "block_size": 512 } }
//!       ] }
//!   ]
//! }
//! ```
//!
//! Unknown subsystems and methods are carried but ignored by the memory backend.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VfsError};

/// Subsystem holding block device definitions
pub const BDEV_SUBSYSTEM: &str = "bdev";

/// Method creating a RAM-backed block device
pub const MALLOC_CREATE_METHOD: &str = "bdev_malloc_create";

/// Name of the device described by the embedded payload
pub const DEFAULT_DEVICE: &str = "Malloc0";

/// Embedded payload used when no topology is supplied
pub const DEFAULT_TOPOLOGY_JSON: &str = r#"{
  "subsystems": [
    {
      "subsystem": "bdev",
      "config": [
        {
          "method": "bdev_malloc_create",
          "params": {
            "name": "Malloc0",
            "num_blocks": 32768,
            "block_size": 512
          }
        }
      ]
    }
  ]
}"#;

/// Full topology payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub subsystems: Vec<Subsystem>,
}

/// One subsystem section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subsystem {
    pub subsystem: String,

    #[serde(default)]
    pub config: Vec<MethodCall>,
}

/// A configuration call inside a subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,

    #[serde(default)]
    pub params: serde_json::Value,
}

/// Parameters of a `bdev_malloc_create` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MallocDeviceSpec {
    pub name: String,
    pub num_blocks: u64,
    pub block_size: u32,
}

impl MallocDeviceSpec {
    /// Device capacity in bytes; `None` when it does not fit in a `u64`
    pub fn capacity(&self) -> Option<u64> {
        self.num_blocks.checked_mul(u64::from(self.block_size))
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(VfsError::Config("malloc device without a name".into()));
        }
        if self.num_blocks == 0 {
            return Err(VfsError::Config(format!(
                "device {} has zero blocks",
                self.name
            )));
        }
        if self.capacity().is_none() {
            return Err(VfsError::Config(format!(
                "device {} is too large: {} blocks of {} bytes",
                self.name, self.num_blocks, self.block_size
            )));
        }
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(VfsError::Config(format!(
                "device {} has invalid block size {} (power of two >= 512 required)",
                self.name, self.block_size
            )));
        }
        Ok(())
    }
}

impl Topology {
    /// Parse a topology from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| VfsError::Config(format!("invalid topology: {}", e)))
    }

    /// Parse a topology from raw bytes (a trailing NUL is tolerated)
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes = bytes.strip_suffix(&[0]).unwrap_or(bytes);
        serde_json::from_slice(bytes)
            .map_err(|e| VfsError::Config(format!("invalid topology: {}", e)))
    }

    /// Load a topology from a JSON file
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_slice(&bytes)
    }

    /// Serialize back to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| VfsError::Serialization(e.to_string()))
    }

    /// A topology with a single malloc device
    pub fn single_malloc(name: impl Into<String>, num_blocks: u64, block_size: u32) -> Self {
        let spec = MallocDeviceSpec {
            name: name.into(),
            num_blocks,
            block_size,
        };
        Self {
            subsystems: vec![Subsystem {
                subsystem: BDEV_SUBSYSTEM.to_string(),
                config: vec![MethodCall {
                    method: MALLOC_CREATE_METHOD.to_string(),
                    params: serde_json::json!(spec),
                }],
            }],
        }
    }

    /// All malloc devices declared in the bdev subsystem, validated
    pub fn malloc_devices(&self) -> Result<Vec<MallocDeviceSpec>> {
        let mut devices = Vec::new();

        for subsystem in self.subsystems.iter().filter(|s| s.subsystem == BDEV_SUBSYSTEM) {
            for call in &subsystem.config {
                if call.method != MALLOC_CREATE_METHOD {
                    tracing::debug!("Ignoring topology method {}", call.method);
                    continue;
                }

                let spec: MallocDeviceSpec = serde_json::from_value(call.params.clone())
                    .map_err(|e| VfsError::Config(format!("bad {} params: {}", call.method, e)))?;
                spec.validate()?;

                if devices.iter().any(|d: &MallocDeviceSpec| d.name == spec.name) {
                    return Err(VfsError::Config(format!("duplicate device {}", spec.name)));
                }
                devices.push(spec);
            }
        }

        Ok(devices)
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::single_malloc(DEFAULT_DEVICE, 32768, 512)
    }
}
