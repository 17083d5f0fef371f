// Engine lifecycle integration tests driven through fake source/runtime
// seams: boot state sequences, single-fetch guarantees, supersession.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use engine_bridge::config::STARTPOS_FEN;
use engine_bridge::engine::cache::AssetCache;
use engine_bridge::exec::{EngineHandle, EngineRuntime};
use engine_bridge::source::traits::{AssetSource, ProgressFn};
use engine_bridge::{
    EngineConfig, EngineInstance, EnginePool, EngineState, EvalUpdate, Listeners, SearchLimit,
    Work,
};

const BINARY: &[u8] = b"\0asm fake engine binary";

fn config() -> EngineConfig {
    EngineConfig {
        asset_root: "http://assets.test".to_string(),
        asset_path: "engine/sf.wasm".to_string(),
        asset_version: "v1".to_string(),
        cache_dir: String::new(),
    }
}

fn work(request_id: u64, depth: u32) -> Work {
    Work {
        initial_fen: STARTPOS_FEN.to_string(),
        moves: vec![],
        limit: SearchLimit::Depth(depth),
        multi_pv: 1,
        threads: 1,
        hash_mb: 16,
        request_id,
    }
}

/// Asset source that serves a fixed binary and counts fetches.
struct FakeSource {
    fetches: AtomicUsize,
    fail: bool,
}

impl FakeSource {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicUsize::new(0),
            fail,
        })
    }
}

#[async_trait]
impl AssetSource for FakeSource {
    async fn fetch(&self, _path: &str, _version: &str, progress: &ProgressFn) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("connection reset"));
        }
        let total = BINARY.len() as u64;
        progress(total / 2, Some(total));
        progress(total, Some(total));
        Ok(Bytes::from_static(BINARY))
    }
}

/// The far end of one instantiated fake context, driven by the test.
struct FakeEngine {
    commands: mpsc::UnboundedReceiver<String>,
    lines: mpsc::UnboundedSender<String>,
}

impl FakeEngine {
    async fn next_command(&mut self) -> String {
        timeout(Duration::from_secs(2), self.commands.recv())
            .await
            .expect("timed out waiting for engine command")
            .expect("command channel closed")
    }

    fn emit(&self, line: &str) {
        self.lines.send(line.to_string()).unwrap();
    }
}

/// Runtime that hands out in-memory channel pairs instead of real contexts.
#[derive(Default)]
struct FakeRuntime {
    engines: Mutex<Vec<FakeEngine>>,
}

impl FakeRuntime {
    fn take_engine(&self) -> FakeEngine {
        self.engines.lock().pop().expect("no engine instantiated")
    }

    fn instantiated(&self) -> usize {
        self.engines.lock().len()
    }
}

#[async_trait]
impl EngineRuntime for FakeRuntime {
    async fn instantiate(&self, binary: Bytes) -> Result<EngineHandle> {
        assert_eq!(&binary[..], BINARY, "instance must receive the fetched bytes");
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        self.engines.lock().push(FakeEngine {
            commands: command_rx,
            lines: line_tx,
        });
        Ok(EngineHandle {
            commands: command_tx,
            lines: line_rx,
        })
    }
}

struct Harness {
    instance: EngineInstance,
    source: Arc<FakeSource>,
    runtime: Arc<FakeRuntime>,
    cache: Arc<AssetCache>,
    updates: mpsc::UnboundedReceiver<EvalUpdate>,
    failed: Arc<AtomicBool>,
    _dir: tempfile::TempDir,
}

fn harness(fail_fetch: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(AssetCache::new(dir.path()).unwrap());
    let source = FakeSource::new(fail_fetch);
    let runtime = Arc::new(FakeRuntime::default());

    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let failed = Arc::new(AtomicBool::new(false));
    let failed_flag = Arc::clone(&failed);
    let listeners = Listeners {
        on_update: Arc::new(move |u| {
            let _ = update_tx.send(u);
        }),
        on_failure: Arc::new(move || failed_flag.store(true, Ordering::SeqCst)),
        on_progress: Arc::new(|_, _| {}),
    };

    let instance = EngineInstance::new(
        config(),
        Arc::clone(&cache),
        source.clone() as Arc<dyn AssetSource>,
        runtime.clone() as Arc<dyn EngineRuntime>,
        listeners,
    );

    Harness {
        instance,
        source,
        runtime,
        cache,
        updates: update_rx,
        failed,
        _dir: dir,
    }
}

async fn next_update(rx: &mut mpsc::UnboundedReceiver<EvalUpdate>) -> EvalUpdate {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for update")
        .expect("update channel closed")
}

#[tokio::test]
async fn test_clean_boot_reaches_idle_and_populates_cache() {
    let h = harness(false);

    assert_eq!(h.instance.state(), EngineState::Initial);
    h.instance.load().await.unwrap();
    assert_eq!(h.instance.state(), EngineState::Idle);

    assert_eq!(h.source.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.runtime.instantiated(), 1);

    // The fetched bytes landed in the cache under (path, version).
    let hit = h.cache.get("engine/sf.wasm", "v1").unwrap();
    assert_eq!(hit.as_deref(), Some(BINARY));
}

#[tokio::test]
async fn test_load_is_idempotent() {
    let h = harness(false);

    h.instance.load().await.unwrap();
    h.instance.load().await.unwrap();

    assert_eq!(h.source.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.runtime.instantiated(), 1);
}

#[tokio::test]
async fn test_preseeded_cache_boots_without_fetching() {
    let h = harness(false);
    h.cache.set("engine/sf.wasm", "v1", BINARY).unwrap();

    h.instance.load().await.unwrap();

    assert_eq!(h.source.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(h.runtime.instantiated(), 1);
}

#[tokio::test]
async fn test_failing_boot_is_terminal() {
    let h = harness(true);

    assert!(h.instance.load().await.is_err());
    assert_eq!(h.instance.state(), EngineState::Failed);
    assert!(h.failed.load(Ordering::SeqCst));

    // The outcome is memoized: no retry on repeated load.
    assert!(h.instance.load().await.is_err());
    assert_eq!(h.source.fetches.load(Ordering::SeqCst), 1);

    // start is rejected while Failed, and the state stays Failed.
    assert!(h.instance.start(work(1, 10)).is_err());
    assert_eq!(h.instance.state(), EngineState::Failed);
}

#[tokio::test]
async fn test_fetch_progress_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(AssetCache::new(dir.path()).unwrap());
    let source = FakeSource::new(false);
    let runtime = Arc::new(FakeRuntime::default());

    let progress: Arc<Mutex<Vec<(u64, Option<u64>)>>> = Arc::new(Mutex::new(Vec::new()));
    let progress_sink = Arc::clone(&progress);
    let listeners = Listeners {
        on_progress: Arc::new(move |received, total| {
            progress_sink.lock().push((received, total))
        }),
        ..Listeners::default()
    };

    let instance = EngineInstance::new(
        config(),
        cache,
        source as Arc<dyn AssetSource>,
        runtime as Arc<dyn EngineRuntime>,
        listeners,
    );
    instance.load().await.unwrap();

    let total = BINARY.len() as u64;
    assert_eq!(
        progress.lock().as_slice(),
        &[(total / 2, Some(total)), (total, Some(total))]
    );
}

#[tokio::test]
async fn test_analysis_flow_progress_then_single_final() {
    let mut h = harness(false);
    h.instance.load().await.unwrap();
    let mut engine = h.runtime.take_engine();

    h.instance.start(work(1, 10)).unwrap();
    assert_eq!(h.instance.state(), EngineState::Computing);

    assert!(engine.next_command().await.starts_with("position fen"));
    assert_eq!(engine.next_command().await, "go depth 10");

    engine.emit("info depth 1 seldepth 1 multipv 1 score cp 30 nodes 20 nps 1000 pv e2e4");
    engine.emit("info depth 2 seldepth 3 multipv 1 score cp 28 nodes 90 nps 2000 pv e2e4 e7e5");
    engine.emit("info string ignored banter");
    engine.emit("info depth 3 seldepth 5 multipv 1 score cp 33 nodes 400 nps 2500 pv e2e4 e7e5 g1f3");
    engine.emit("bestmove e2e4 ponder e7e5");

    let mut last_depth = 0;
    let mut finals = 0;
    for _ in 0..4 {
        match next_update(&mut h.updates).await {
            EvalUpdate::Progress { request_id, info } => {
                assert_eq!(request_id, 1);
                assert!(info.depth >= last_depth, "depth must be non-decreasing");
                last_depth = info.depth;
            }
            EvalUpdate::Final {
                request_id,
                best_move,
                ..
            } => {
                assert_eq!(request_id, 1);
                assert_eq!(best_move, "e2e4");
                finals += 1;
            }
        }
    }
    assert_eq!(finals, 1);

    // bestmove while Computing transitions back to Idle.
    assert_eq!(h.instance.state(), EngineState::Idle);
}

#[tokio::test]
async fn test_supersession_delivers_only_newer_work() {
    let mut h = harness(false);
    h.instance.load().await.unwrap();
    let mut engine = h.runtime.take_engine();

    h.instance.start(work(1, 10)).unwrap();
    assert!(engine.next_command().await.starts_with("position fen"));
    assert_eq!(engine.next_command().await, "go depth 10");

    // Supersede before any line is received: the engine observes stop.
    h.instance.start(work(2, 12)).unwrap();
    assert_eq!(engine.next_command().await, "stop");

    // Trailing output for work 1, then its termination.
    engine.emit("info depth 9 seldepth 12 multipv 1 score cp 44 nodes 9000 nps 90000 pv d2d4");
    engine.emit("bestmove d2d4");

    // Only now do work 2's commands go out.
    assert!(engine.next_command().await.starts_with("position fen"));
    assert_eq!(engine.next_command().await, "go depth 12");

    engine.emit("info depth 2 seldepth 2 multipv 1 score cp 11 nodes 50 nps 500 pv c2c4");
    engine.emit("bestmove c2c4");

    // Work 1's updates were suppressed entirely; only id 2 arrives.
    let first = next_update(&mut h.updates).await;
    assert_eq!(first.request_id(), 2);
    let second = next_update(&mut h.updates).await;
    assert_eq!(second.request_id(), 2);
    assert!(second.is_final());

    assert_eq!(h.instance.state(), EngineState::Idle);
}

#[tokio::test]
async fn test_listener_may_reenter_instance_during_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(AssetCache::new(dir.path()).unwrap());
    let source = FakeSource::new(false);
    let runtime = Arc::new(FakeRuntime::default());

    // The listener is built before the instance exists; hand it the
    // instance through a shared slot.
    let slot: Arc<Mutex<Option<Arc<EngineInstance>>>> = Arc::new(Mutex::new(None));
    let states: Arc<Mutex<Vec<EngineState>>> = Arc::new(Mutex::new(Vec::new()));
    let (update_tx, mut update_rx) = mpsc::unbounded_channel();

    let slot_ref = Arc::clone(&slot);
    let states_sink = Arc::clone(&states);
    let listeners = Listeners {
        on_update: Arc::new(move |u: EvalUpdate| {
            // Calling back into the instance from inside the listener must
            // not wedge the reader task.
            if let Some(instance) = slot_ref.lock().clone() {
                states_sink.lock().push(instance.state());
                if u.is_final() && u.request_id() == 1 {
                    instance.start(work(2, 6)).unwrap();
                }
            }
            let _ = update_tx.send(u);
        }),
        ..Listeners::default()
    };

    let instance = Arc::new(EngineInstance::new(
        config(),
        cache,
        source as Arc<dyn AssetSource>,
        runtime.clone() as Arc<dyn EngineRuntime>,
        listeners,
    ));
    *slot.lock() = Some(Arc::clone(&instance));

    instance.load().await.unwrap();
    let mut engine = runtime.take_engine();

    instance.start(work(1, 5)).unwrap();
    assert!(engine.next_command().await.starts_with("position fen"));
    assert_eq!(engine.next_command().await, "go depth 5");

    engine.emit("info depth 1 seldepth 1 multipv 1 score cp 10 nodes 5 nps 100 pv e2e4");
    engine.emit("bestmove e2e4");

    assert_eq!(next_update(&mut update_rx).await.request_id(), 1);
    assert!(next_update(&mut update_rx).await.is_final());

    // The follow-up issued from inside the listener went out on the wire.
    assert!(engine.next_command().await.starts_with("position fen"));
    assert_eq!(engine.next_command().await, "go depth 6");

    // Progress arrived while computing; the final observed the idle gap
    // before the follow-up started.
    assert_eq!(
        states.lock().as_slice(),
        &[EngineState::Computing, EngineState::Idle]
    );
}

#[tokio::test]
async fn test_destroy_retains_instance_for_reuse() {
    let mut h = harness(false);
    h.instance.load().await.unwrap();
    let mut engine = h.runtime.take_engine();

    h.instance.start(work(1, 8)).unwrap();
    assert!(engine.next_command().await.starts_with("position fen"));
    assert_eq!(engine.next_command().await, "go depth 8");
    engine.emit("bestmove e2e4");
    let _ = next_update(&mut h.updates).await;

    h.instance.destroy();
    assert_eq!(h.instance.state(), EngineState::Idle);

    // Same instance keeps working without a second fetch or instantiation.
    h.instance.start(work(2, 9)).unwrap();
    assert!(engine.next_command().await.starts_with("position fen"));
    assert_eq!(engine.next_command().await, "go depth 9");

    assert_eq!(h.source.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.runtime.instantiated(), 0); // the single engine was taken above
}

#[tokio::test]
async fn test_pool_reuses_instance_per_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(AssetCache::new(dir.path()).unwrap());
    let source = FakeSource::new(false);
    let runtime = Arc::new(FakeRuntime::default());

    let pool = EnginePool::new(
        cache,
        source.clone() as Arc<dyn AssetSource>,
        runtime.clone() as Arc<dyn EngineRuntime>,
    );

    let a = pool.acquire(config(), Listeners::default());
    a.load().await.unwrap();

    let b = pool.acquire(config(), Listeners::default());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(pool.len(), 1);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

    // A different version is a different configuration.
    let mut other = config();
    other.asset_version = "v2".to_string();
    let c = pool.acquire(other, Listeners::default());
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(pool.len(), 2);

    pool.shutdown();
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_pool_slots_key_on_asset_identity_only() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(AssetCache::new(dir.path()).unwrap());
    let source = FakeSource::new(false);
    let runtime = Arc::new(FakeRuntime::default());

    let pool = EnginePool::new(
        cache,
        source as Arc<dyn AssetSource>,
        runtime as Arc<dyn EngineRuntime>,
    );

    let a = pool.acquire(config(), Listeners::default());

    // Same asset, different host and cache location: the pool's
    // dependencies are fixed, so this resolves to the retained slot.
    let mut divergent = config();
    divergent.asset_root = "http://mirror.test".to_string();
    divergent.cache_dir = "/elsewhere".to_string();
    let b = pool.acquire(divergent, Listeners::default());

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(pool.len(), 1);
}
