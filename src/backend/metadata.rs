//! Blob metadata page
//!
//! The memory backend keeps its blob table in the device's first cluster.
//!
//! ## Page Format
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────────────────────┐
//! │Magic (4) │ Len (4)  │ CRC (4)  │ bincode(MetadataPage)    │
//! └──────────┴──────────┴──────────┴──────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, VfsError};

/// Magic bytes opening a metadata page
pub(crate) const MAGIC: &[u8; 4] = b"BVMD";

/// Magic (4) + payload length (4) + payload CRC (4)
pub(crate) const HEADER_SIZE: usize = 12;

/// Persisted blob table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPage {
    /// Cluster size the store was initialized with
    pub cluster_size: u64,

    /// Every blob with its cluster map, ordered by id
    pub blobs: Vec<BlobMetadata>,
}

/// One persisted blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub id: u64,
    pub clusters: Vec<u64>,
}

impl MetadataPage {
    /// Encode into a framed page
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload =
            bincode::serialize(self).map_err(|e| VfsError::Serialization(e.to_string()))?;
        let crc = crc32fast::hash(&payload);

        let mut page = Vec::with_capacity(HEADER_SIZE + payload.len());
        page.extend_from_slice(MAGIC);
        page.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        page.extend_from_slice(&crc.to_le_bytes());
        page.extend_from_slice(&payload);
        Ok(page)
    }

    /// Decode a framed page.
    ///
    /// Returns `Ok(None)` for a region that was never written (no magic).
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.len() < HEADER_SIZE || &bytes[0..4] != MAGIC {
            return Ok(None);
        }

        let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let stored_crc = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        let payload = bytes.get(HEADER_SIZE..HEADER_SIZE + len).ok_or_else(|| {
            VfsError::Serialization(format!("metadata page truncated: {} payload bytes", len))
        })?;

        let crc = crc32fast::hash(payload);
        if crc != stored_crc {
            return Err(VfsError::Serialization(format!(
                "metadata page checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, crc
            )));
        }

        bincode::deserialize(payload)
            .map(Some)
            .map_err(|e| VfsError::Serialization(e.to_string()))
    }
}
