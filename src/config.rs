use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use crate::schedule::notify::DEFAULT_OBSERVER_BUFFER;
use crate::schedule::progress::DEFAULT_ETA_WINDOW;
use crate::schedule::SchedulerConfig;

const ASR_BATCH_ADDR: &str = "127.0.0.1:7200";
const ASR_BATCH_SQLITE_PATH: &str = "sqlite://./asr_data/database/batches.db?mode=rwc";
const ASR_BATCH_LOG_DIR: &str = "./logs";
const ASR_BATCH_OUTPUT_DIR: &str = "./asr_data/output/";

// 环境变量优先，其次是 .env 文件
fn lookup(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) => Some(value),
        Err(_) => dotenv::var(key).ok(),
    }
}

pub static SQLITE_PATH: Lazy<String> =
    Lazy::new(|| lookup("ASR_BATCH_SQLITE_PATH").unwrap_or_else(|| ASR_BATCH_SQLITE_PATH.to_string()));

pub static LOG_DIR: Lazy<String> =
    Lazy::new(|| lookup("ASR_BATCH_LOG_DIR").unwrap_or_else(|| ASR_BATCH_LOG_DIR.to_string()));

pub static OUTPUT_DIR: Lazy<String> =
    Lazy::new(|| lookup("ASR_BATCH_OUTPUT_DIR").unwrap_or_else(|| ASR_BATCH_OUTPUT_DIR.to_string()));

/// Service settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub addr: SocketAddr,
    pub sqlite_path: String,
    pub log_dir: String,
    pub output_dir: String,
    pub observer_buffer: usize,
    pub scheduler: SchedulerConfig,
    pub transcriber_url: Option<String>,
    pub whisper_model: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            default_max_concurrent: parse_or("ASR_BATCH_DEFAULT_CONCURRENCY", defaults.default_max_concurrent)?,
            max_concurrent_limit: parse_or("ASR_BATCH_MAX_CONCURRENCY", defaults.max_concurrent_limit)?,
            eta_window: parse_or("ASR_BATCH_ETA_WINDOW", DEFAULT_ETA_WINDOW)?,
        };
        if scheduler.max_concurrent_limit == 0 {
            anyhow::bail!("ASR_BATCH_MAX_CONCURRENCY must be at least 1");
        }
        if scheduler.default_max_concurrent == 0 || scheduler.default_max_concurrent > scheduler.max_concurrent_limit {
            anyhow::bail!(
                "ASR_BATCH_DEFAULT_CONCURRENCY must be between 1 and {}",
                scheduler.max_concurrent_limit
            );
        }

        Ok(Self {
            addr: parse_or("ASR_BATCH_ADDR", SocketAddr::from_str(ASR_BATCH_ADDR)?)?,
            sqlite_path: SQLITE_PATH.clone(),
            log_dir: LOG_DIR.clone(),
            output_dir: OUTPUT_DIR.clone(),
            observer_buffer: parse_or("ASR_BATCH_OBSERVER_BUFFER", DEFAULT_OBSERVER_BUFFER)?.max(1),
            scheduler,
            transcriber_url: lookup("ASR_BATCH_TRANSCRIBER_URL").filter(|v| !v.is_empty()),
            whisper_model: lookup("ASR_BATCH_WHISPER_MODEL").filter(|v| !v.is_empty()),
        })
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {}", key, raw)),
        _ => Ok(default),
    }
}

pub fn init_env() {
    dotenv::dotenv().ok();

    // 确保数据目录存在
    let db_path = SQLITE_PATH.trim_start_matches("sqlite://");
    let db_path = db_path.split('?').next().unwrap_or(db_path);
    if let Some(dir) = Path::new(db_path).parent() {
        std::fs::create_dir_all(dir).unwrap_or_else(|e| {
            eprintln!("Failed to create database directory: {}", e);
        });
    }
    std::fs::create_dir_all(OUTPUT_DIR.as_str()).unwrap_or_else(|e| {
        eprintln!("Failed to create output directory: {}", e);
    });
}
