// Instance pool — implements the deliberate reuse-on-destroy policy, one
// retained instance per distinct engine configuration.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::cache::AssetCache;
use super::instance::{EngineInstance, EngineState};
use crate::config::EngineConfig;
use crate::exec::process::ProcessRuntime;
use crate::exec::EngineRuntime;
use crate::source::http_source::HttpAssetSource;
use crate::source::traits::AssetSource;
use crate::work::Listeners;

/// Shared home for engine instances. The asset cache is shared across all
/// instances; each execution context stays exclusively owned by its
/// instance. Retained instances are never evicted during a session, so the
/// pool grows by one entry per distinct configuration.
pub struct EnginePool {
    cache: Arc<AssetCache>,
    source: Arc<dyn AssetSource>,
    runtime: Arc<dyn EngineRuntime>,
    slots: RwLock<HashMap<String, Arc<EngineInstance>>>,
}

impl EnginePool {
    pub fn new(
        cache: Arc<AssetCache>,
        source: Arc<dyn AssetSource>,
        runtime: Arc<dyn EngineRuntime>,
    ) -> Self {
        Self {
            cache,
            source,
            runtime,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Production composition: on-disk cache and process runtime under
    /// `config.cache_dir`, HTTP fetch from `config.asset_root`.
    pub fn with_defaults(config: &EngineConfig) -> Result<Self> {
        let cache_root = Path::new(&config.cache_dir);
        let cache = Arc::new(AssetCache::new(cache_root)?);
        let source = Arc::new(HttpAssetSource::new(config.asset_root.clone()));
        let runtime = Arc::new(ProcessRuntime::new(&cache_root.join("run"))?);
        Ok(Self::new(cache, source, runtime))
    }

    /// Get the retained instance for `config`, or construct one. A reused
    /// instance is stopped and rebound to the new listener set. A failed
    /// instance is terminal and gets replaced by a fresh one.
    ///
    /// Slots are keyed by asset identity (`asset_path@asset_version`). The
    /// pool's source, cache, and runtime are fixed at construction, so a
    /// config whose `asset_root` or `cache_dir` differs from the retained
    /// instance's is served from the pool's dependencies anyway; use a
    /// separate pool per asset host or cache location.
    pub fn acquire(&self, config: EngineConfig, listeners: Listeners) -> Arc<EngineInstance> {
        let key = config.slot_key();
        let mut slots = self.slots.write();

        if let Some(existing) = slots.get(&key) {
            let retained = existing.config();
            if retained.asset_root != config.asset_root || retained.cache_dir != config.cache_dir {
                warn!(
                    "pool dependencies are fixed; ignoring divergent asset_root/cache_dir for {}",
                    key
                );
            }
            if existing.state() != EngineState::Failed {
                debug!("reusing retained engine instance for {}", key);
                existing.stop();
                existing.rebind(listeners);
                return Arc::clone(existing);
            }
            info!("replacing failed engine instance for {}", key);
            existing.shutdown();
        }

        info!(
            "retaining new engine instance for {} (pool size {})",
            key,
            slots.len() + 1
        );
        let instance = Arc::new(EngineInstance::new(
            config,
            Arc::clone(&self.cache),
            Arc::clone(&self.source),
            Arc::clone(&self.runtime),
            listeners,
        ));
        slots.insert(key, Arc::clone(&instance));
        instance
    }

    /// Number of retained instances.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// End-of-session teardown: stop every retained instance's reader task
    /// and drop the slots.
    pub fn shutdown(&self) {
        let mut slots = self.slots.write();
        for (key, instance) in slots.drain() {
            debug!("shutting down engine instance {}", key);
            instance.shutdown();
        }
    }
}
