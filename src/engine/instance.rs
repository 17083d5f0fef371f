// Engine instance lifecycle — boots the binary asset into an execution
// context, wires its line stream to the protocol, derives observable state.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::cache::AssetCache;
use super::protocol::Protocol;
use crate::config::EngineConfig;
use crate::exec::{EngineHandle, EngineRuntime};
use crate::source::traits::AssetSource;
use crate::work::{Listeners, Work};

/// Observable lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initial,
    Loading,
    Idle,
    Computing,
    /// Terminal: no operation recovers a failed instance.
    Failed,
}

/// Boot failure, memoized so repeated `load()` calls return the same
/// outcome.
#[derive(Debug, Clone, Error)]
pub enum BootError {
    #[error("asset fetch failed: {0}")]
    Fetch(String),
    #[error("engine instantiation failed: {0}")]
    Instantiate(String),
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Initial,
    Loading,
    Idle,
    Failed,
}

/// One loaded, stateful wrapper around an isolated analysis execution
/// context. All dependencies are injected at construction; there is no
/// process-wide state.
pub struct EngineInstance {
    config: EngineConfig,
    cache: Arc<AssetCache>,
    source: Arc<dyn AssetSource>,
    runtime: Arc<dyn EngineRuntime>,
    protocol: Arc<Mutex<Protocol>>,
    listeners: Arc<Mutex<Listeners>>,
    boot: OnceCell<Result<(), BootError>>,
    phase: Mutex<Phase>,
    shutdown: CancellationToken,
}

impl EngineInstance {
    pub fn new(
        config: EngineConfig,
        cache: Arc<AssetCache>,
        source: Arc<dyn AssetSource>,
        runtime: Arc<dyn EngineRuntime>,
        listeners: Listeners,
    ) -> Self {
        Self {
            config,
            cache,
            source,
            runtime,
            protocol: Arc::new(Mutex::new(Protocol::new())),
            listeners: Arc::new(Mutex::new(listeners)),
            boot: OnceCell::new(),
            phase: Mutex::new(Phase::Initial),
            shutdown: CancellationToken::new(),
        }
    }

    /// Resolve the binary (cache, then network), instantiate the execution
    /// context, and wire it to the protocol. Idempotent: repeated calls
    /// return the first call's outcome and never re-fetch.
    pub async fn load(&self) -> Result<(), BootError> {
        self.boot.get_or_init(|| self.boot_inner()).await.clone()
    }

    async fn boot_inner(&self) -> Result<(), BootError> {
        *self.phase.lock() = Phase::Loading;

        let result = self.boot_steps().await;
        match &result {
            Ok(()) => {
                debug!("engine {} booted", self.config.slot_key());
                *self.phase.lock() = Phase::Idle;
            }
            Err(e) => {
                error!("engine {} boot failed: {}", self.config.slot_key(), e);
                *self.phase.lock() = Phase::Failed;
                let on_failure = self.listeners.lock().on_failure.clone();
                on_failure();
            }
        }
        result
    }

    async fn boot_steps(&self) -> Result<(), BootError> {
        let key = self.config.asset_path.as_str();
        let version = self.config.asset_version.as_str();

        // A broken cache is a miss, never a boot failure.
        let cached = match self.cache.get(key, version) {
            Ok(hit) => hit,
            Err(e) => {
                warn!("cache read failed for {}, treating as miss: {}", key, e);
                None
            }
        };

        let binary = match cached {
            Some(bytes) => {
                debug!("asset cache hit for {} ({} bytes)", key, bytes.len());
                bytes
            }
            None => {
                let on_progress = self.listeners.lock().on_progress.clone();
                let bytes = self
                    .source
                    .fetch(key, version, &*on_progress)
                    .await
                    .map_err(|e| BootError::Fetch(e.to_string()))?;
                if let Err(e) = self.cache.set(key, version, &bytes) {
                    warn!("cache write failed for {}, continuing: {}", key, e);
                }
                bytes
            }
        };

        let EngineHandle {
            commands,
            mut lines,
        } = self
            .runtime
            .instantiate(binary)
            .await
            .map_err(|e| BootError::Instantiate(e.to_string()))?;

        // Reader task: the context's ordered line stream feeds the protocol
        // until the channel closes or the pool shuts the instance down.
        // The protocol lock is released before the listener runs, so a
        // listener may call back into the instance (state, start, stop).
        let protocol = Arc::clone(&self.protocol);
        let listeners = Arc::clone(&self.listeners);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    line = lines.recv() => match line {
                        Some(line) => {
                            let update = protocol.lock().received(&line);
                            if let Some(update) = update {
                                let on_update = listeners.lock().on_update.clone();
                                on_update(update);
                            }
                        }
                        None => {
                            debug!("engine output channel closed");
                            break;
                        }
                    },
                    _ = shutdown.cancelled() => {
                        debug!("engine reader shut down");
                        break;
                    }
                }
            }
        });

        self.protocol.lock().connected(Box::new(move |command: &str| {
            if commands.send(command.to_string()).is_err() {
                warn!("engine command channel closed, dropping: {}", command);
            }
        }));

        Ok(())
    }

    /// Route a new analysis request through the protocol. Superseding an
    /// in-flight search is handled there; a failed instance rejects.
    pub fn start(&self, work: Work) -> Result<()> {
        if matches!(*self.phase.lock(), Phase::Failed) {
            return Err(anyhow!("engine failed to boot; construct a new instance"));
        }
        self.protocol.lock().compute(Some(work));
        Ok(())
    }

    /// Stop any active computation with no queued replacement.
    pub fn stop(&self) {
        self.protocol.lock().compute(None);
    }

    /// Stop and retain. The underlying execution context cannot be torn down
    /// with guaranteed resource reclamation, so instances are pooled and
    /// reused instead of recreated per caller.
    pub fn destroy(&self) {
        self.stop();
    }

    pub fn state(&self) -> EngineState {
        match *self.phase.lock() {
            Phase::Failed => EngineState::Failed,
            Phase::Initial => EngineState::Initial,
            Phase::Loading => EngineState::Loading,
            Phase::Idle => {
                if self.protocol.lock().is_computing() {
                    EngineState::Computing
                } else {
                    EngineState::Idle
                }
            }
        }
    }

    /// Replace the listener set; a retained instance must never emit to a
    /// previous caller's listeners.
    pub fn rebind(&self, listeners: Listeners) {
        *self.listeners.lock() = listeners;
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// End-of-session teardown: stop the reader task. Only the pool calls
    /// this; `destroy()` keeps the instance alive on purpose.
    pub fn shutdown(&self) {
        self.stop();
        self.shutdown.cancel();
    }
}
