use serde::Deserialize;

/// UCI option values a freshly booted engine starts with. Option commands
/// are only sent when a work's options differ from these (or from the last
/// values sent).
pub const DEFAULT_THREADS: u32 = 1;
pub const DEFAULT_HASH_MB: u32 = 16;
pub const DEFAULT_MULTI_PV: u32 = 1;

/// FEN of the standard initial position, accepted as a `Work` starting point.
pub const STARTPOS_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// Configuration for one engine instance. Two instances share a pool slot
/// exactly when their `(asset_path, asset_version)` pairs match.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Root URL the versioned binary is fetched from.
    pub asset_root: String,
    /// Path of the engine binary under `asset_root`, also the cache key.
    pub asset_path: String,
    /// Version tag of the binary; a mismatch with the cached copy is a miss.
    pub asset_version: String,
    /// Directory used for the on-disk asset cache.
    pub cache_dir: String,
}

impl EngineConfig {
    /// Pool slot key: one retained instance per distinct configuration.
    pub fn slot_key(&self) -> String {
        format!("{}@{}", self.asset_path, self.asset_version)
    }
}
