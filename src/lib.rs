pub mod config;
pub mod error;
pub mod schedule;
pub mod storage;
pub mod transcriber;
pub mod utils;
pub mod web;

use std::sync::Arc;
use schedule::BatchScheduler;

pub use config::{init_env, Settings};
pub use error::{BatchError, Result};

pub struct AppContext {
    pub scheduler: Arc<BatchScheduler>,
}
