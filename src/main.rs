#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use asr_batch::schedule::{BatchScheduler, NotificationHub};
use asr_batch::storage::batch::sqlite::SqliteBatchStore;
use asr_batch::transcriber::{RemoteTranscriber, Transcriber};
use asr_batch::utils::logger;
use asr_batch::{init_env, AppContext, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    init_env();
    let settings = Settings::from_env()?;

    // 初始化日志系统
    let _guard = logger::init(settings.log_dir.clone())?;
    info!("Starting ASR batch service (build {})...", env!("GIT_HASH"));

    // 初始化 storage
    info!("Initializing storage at {}...", settings.sqlite_path);
    let store = SqliteBatchStore::new(&settings.sqlite_path).await?;

    // 初始化转写后端
    let transcriber = build_transcriber(&settings)?;

    // 初始化调度器
    info!("Initializing scheduler...");
    let scheduler = Arc::new(BatchScheduler::new(
        Arc::new(store),
        transcriber,
        Arc::new(NotificationHub::new(settings.observer_buffer)),
        settings.scheduler.clone(),
    ));
    scheduler.restore().await?;

    // 创建应用上下文
    let ctx = Arc::new(AppContext {
        scheduler: scheduler.clone(),
    });

    // 启动 HTTP 服务器
    info!("Starting HTTP server at http://{}", settings.addr);
    let served = asr_batch::web::start_server(ctx, settings.addr).await;

    // 优雅关闭
    info!("Shutting down...");
    scheduler.shutdown().await;

    match served {
        Ok(()) => {
            info!("Server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e)
        }
    }
}

fn build_transcriber(settings: &Settings) -> Result<Arc<dyn Transcriber>> {
    #[cfg(feature = "whisper")]
    if let Some(model) = &settings.whisper_model {
        use asr_batch::transcriber::WhisperTranscriber;

        info!("Initializing Whisper model {}...", model);
        let whisper = WhisperTranscriber::new(model, PathBuf::from(&settings.output_dir))?;
        return Ok(Arc::new(whisper));
    }

    if let Some(url) = &settings.transcriber_url {
        info!("Forwarding transcriptions to {}", url);
        return Ok(Arc::new(RemoteTranscriber::new(url.clone())));
    }

    if settings.whisper_model.is_some() {
        anyhow::bail!(
            "ASR_BATCH_WHISPER_MODEL is set but this build has no whisper support, rebuild with --features whisper"
        );
    }
    anyhow::bail!(
        "no transcription backend configured, set ASR_BATCH_TRANSCRIBER_URL or ASR_BATCH_WHISPER_MODEL (output dir {})",
        PathBuf::from(&settings.output_dir).display()
    )
}
