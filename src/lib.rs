// Client-side orchestration of UCI analysis engines — versioned asset
// loading, isolated execution contexts, protocol handling, work supersession.

pub mod config;
pub mod engine;
pub mod exec;
pub mod source;
pub mod work;

pub use config::EngineConfig;
pub use engine::instance::{BootError, EngineInstance, EngineState};
pub use engine::pool::EnginePool;
pub use work::{EvalUpdate, Listeners, Score, SearchInfo, SearchLimit, Work};

use std::sync::Once;

use tracing::info;
use tracing_subscriber::EnvFilter;

static INIT_TRACING: Once = Once::new();

/// Initialize tracing output for embedders that don't install their own
/// subscriber. Safe to call more than once.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();

        info!("engine bridge tracing initialized");
    });
}
