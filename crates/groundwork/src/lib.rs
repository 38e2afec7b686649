pub mod auth;
pub mod coord;
pub mod kv;
pub mod pool;

pub use groundwork_core::prelude::*;
pub use groundwork_core::telemetry;
