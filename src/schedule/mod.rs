pub mod events;
pub mod notify;
pub mod progress;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod tests;

// 重导出主要类型
pub use events::{BatchEvent, ControlAction, EventKind};
pub use notify::{NotificationHub, Observer};
pub use progress::{BatchProgress, ProgressAggregator};
pub use scheduler::{BatchScheduler, BatchView, SchedulerConfig};
pub use types::{BatchRecord, BatchState, JobOptions, JobRecord, JobState, OutputFormat};

use std::sync::Arc;

use crate::storage::batch::BatchStore;
use crate::transcriber::Transcriber;

// 提供便捷的构建方法
pub fn create_scheduler(
    store: impl BatchStore,
    transcriber: impl Transcriber,
    config: SchedulerConfig,
) -> BatchScheduler {
    BatchScheduler::new(
        Arc::new(store),
        Arc::new(transcriber),
        Arc::new(NotificationHub::default()),
        config,
    )
}
