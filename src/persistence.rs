use crate::error::{FilterError, Result};
use crate::registry::FileIdRegistry;
use memmap2::Mmap;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic bytes for state file identification
const MAGIC: &[u8; 4] = b"SCPF";

/// Everything needed to resume incremental passes over a root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterState {
    /// Version for format compatibility
    pub version: u32,

    /// Timestamp when the state was captured (unix seconds)
    pub created_at: u64,

    /// Path to id assignments
    pub registry: FileIdRegistry,

    /// Ids in scope when the state was captured
    pub members: RoaringBitmap,
}

impl FilterState {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(registry: FileIdRegistry, members: RoaringBitmap) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            registry,
            members,
        }
    }
}

/// Save state to disk
pub fn save_state(state: &FilterState, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(MAGIC)?;

    // bincode 2.0 serde compat
    let config = bincode::config::standard();
    let encoded = bincode::serde::encode_to_vec(state, config)
        .map_err(|e| FilterError::Serialization(e.to_string()))?;

    writer.write_all(&encoded)?;
    writer.flush()?;

    Ok(())
}

/// Load state from disk
pub fn load_state(path: &Path) -> Result<FilterState> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;

    decode_state(&data)
}

/// Load state through a memory map
pub fn load_state_mmap(path: &Path) -> Result<FilterState> {
    let file = File::open(path)?;
    // SAFETY: the map is read once and dropped before returning.
    let mmap = unsafe { Mmap::map(&file)? };

    decode_state(&mmap)
}

fn decode_state(bytes: &[u8]) -> Result<FilterState> {
    let payload = bytes
        .strip_prefix(MAGIC.as_slice())
        .ok_or_else(|| FilterError::InvalidStateFormat("Invalid magic bytes".to_string()))?;

    let config = bincode::config::standard();
    let (mut state, _): (FilterState, _) = bincode::serde::decode_from_slice(payload, config)
        .map_err(|e| FilterError::Serialization(e.to_string()))?;

    if state.version != FilterState::CURRENT_VERSION {
        return Err(FilterError::InvalidStateFormat(format!(
            "State version mismatch: expected {}, got {}",
            FilterState::CURRENT_VERSION,
            state.version
        )));
    }

    // Rebuild transient lookup tables
    state.registry.rebuild_lookup()?;

    Ok(state)
}

/// Check if a state file exists and carries the right magic bytes
pub fn state_exists(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };

    let mut reader = BufReader::new(file);
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).is_ok() && &magic == MAGIC
}
