pub mod constants;
pub mod delta_buffer;
pub mod dispatch;
pub mod engine;
pub mod history;
pub mod ingress;
pub mod kernel;
pub mod logging;
pub mod main_helper;
pub mod metrics;
pub mod reducers;
pub mod replay;
pub mod round;
pub mod router;
pub mod session;
pub mod str_utils;
pub mod turn_store;
pub mod types;

pub use types::*;

pub use main_helper::{Args, EngineConfig, OutstandingPolicy};
