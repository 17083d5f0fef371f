pub mod http_source;
pub mod traits;
