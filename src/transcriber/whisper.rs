use anyhow::Result;
use async_trait::async_trait;
use hound::{SampleFormat, WavReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::output::{self, Segment, Transcript};
use super::{JobContext, Transcriber};
use crate::schedule::types::{JobOptions, JobRecord};

const SAMPLE_RATE: u32 = 16_000;

/// Local transcription with whisper.cpp. Media is decoded to 16 kHz mono PCM
/// with ffmpeg first, so any container ffmpeg understands (video included)
/// can be a job source.
pub struct WhisperTranscriber {
    whisper_ctx: Arc<WhisperContext>,
    output_dir: PathBuf,
    threads: i32,
}

impl WhisperTranscriber {
    pub fn new(model_path: &str, output_dir: PathBuf) -> Result<Self> {
        let whisper_ctx = WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
            .map_err(|e| anyhow::anyhow!("failed to open whisper model: {}", e))?;
        Ok(Self {
            whisper_ctx: Arc::new(whisper_ctx),
            output_dir,
            threads: 8,
        })
    }

    pub fn with_threads(mut self, threads: i32) -> Self {
        self.threads = threads.max(1);
        self
    }

    async fn extract_audio(&self, source: &str, job_id: &str) -> Result<PathBuf> {
        let work_dir = self.output_dir.join(".work");
        tokio::fs::create_dir_all(&work_dir).await?;
        let wav_path = work_dir.join(format!("{}.wav", job_id));

        let output = Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(source)
            .args(["-vn", "-ac", "1", "-ar", "16000", "-acodec", "pcm_s16le"])
            .arg(&wav_path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to execute ffmpeg: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!(
                "ffmpeg could not decode {}: {}",
                source,
                stderr.lines().last().unwrap_or_default()
            ));
        }
        Ok(wav_path)
    }

    fn run_whisper(
        whisper_ctx: &WhisperContext,
        audio: &[f32],
        options: &JobOptions,
        threads: i32,
    ) -> Result<Transcript> {
        let mut state = whisper_ctx.create_state()?;
        let language = options.language.clone().unwrap_or_else(|| "auto".to_string());

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some(language.as_str()));
        // speaker turns are only tracked when more than one speaker is expected
        params.set_tdrz_enable(options.speaker_count.map_or(false, |n| n > 1));
        params.set_n_threads(threads);
        params.set_temperature(0.3);
        params.set_translate(false);
        params.set_no_context(false);
        params.set_single_segment(false);
        params.set_suppress_blank(true);
        params.set_suppress_non_speech_tokens(true);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);

        state.full(params, audio)?;
        let num_segments = state.full_n_segments()?;

        let mut segments = Vec::new();
        let mut full_text = String::new();
        let mut current_speaker = 0;
        for i in 0..num_segments {
            let text = state.full_get_segment_text(i)?;
            // timestamps come back in centiseconds
            let start = state.full_get_segment_t0(i)? as f64 / 100.0;
            let end = state.full_get_segment_t1(i)? as f64 / 100.0;
            if i > 0 && state.full_get_segment_speaker_turn_next(i - 1) {
                current_speaker += 1;
            }
            full_text.push_str(&text);
            segments.push(Segment {
                text,
                speaker_id: current_speaker,
                start,
                end,
            });
        }

        Ok(Transcript { segments, full_text })
    }
}

fn read_wav(path: &Path) -> Result<Vec<f32>> {
    let mut reader = WavReader::open(path).map_err(|e| anyhow::anyhow!("Failed to read WAV file: {}", e))?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(anyhow::anyhow!("Unsupported WAV encoding: expected 16-bit integer samples"));
    }
    if spec.sample_rate != SAMPLE_RATE || spec.channels != 1 {
        return Err(anyhow::anyhow!(
            "Unexpected WAV layout: {} Hz, {} channels",
            spec.sample_rate,
            spec.channels
        ));
    }

    reader
        .samples::<i16>()
        .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
        .collect::<std::result::Result<Vec<f32>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to read samples: {}", e))
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn transcribe(&self, job: &JobRecord, ctx: JobContext) -> Result<String> {
        info!("Transcribing {} for job {}", job.source_ref, job.id);

        let wav_path = self.extract_audio(&job.source_ref, &job.id).await?;
        let audio = tokio::task::spawn_blocking({
            let wav_path = wav_path.clone();
            move || read_wav(&wav_path)
        })
        .await??;
        if let Err(e) = tokio::fs::remove_file(&wav_path).await {
            warn!("Failed to remove temporary WAV file {}: {}", wav_path.display(), e);
        }
        ctx.report_progress(0.1);

        if ctx.is_cancelled() {
            return Err(anyhow::anyhow!("transcription of job {} was cancelled", job.id));
        }

        // whisper cannot be interrupted once running
        let transcript = tokio::task::spawn_blocking({
            let whisper_ctx = self.whisper_ctx.clone();
            let options = job.options.clone();
            let threads = self.threads;
            move || Self::run_whisper(&whisper_ctx, &audio, &options, threads)
        })
        .await??;
        ctx.report_progress(0.9);

        let written = output::write_all(&transcript, &job.options.output_formats, &self.output_dir, &job.id).await?;
        let primary = written
            .first()
            .ok_or_else(|| anyhow::anyhow!("job {} requested no output formats", job.id))?;
        Ok(primary.display().to_string())
    }
}
