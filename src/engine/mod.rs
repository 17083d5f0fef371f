// Engine orchestration — asset cache, protocol handling, instance lifecycle.

pub mod cache;
pub mod instance;
pub mod pool;
pub mod protocol;
