use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::schedule::types::OutputFormat;

#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub text: String,
    pub speaker_id: usize,
    /// Seconds.
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Serialize)]
pub struct Transcript {
    pub segments: Vec<Segment>,
    pub full_text: String,
}

fn timestamp(seconds: f64, decimal: char) -> String {
    let millis = (seconds.max(0.0) * 1000.0).round() as u64;
    format!(
        "{:02}:{:02}:{:02}{}{:03}",
        millis / 3_600_000,
        (millis / 60_000) % 60,
        (millis / 1000) % 60,
        decimal,
        millis % 1000
    )
}

pub fn render(transcript: &Transcript, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Txt => transcript
            .segments
            .iter()
            .map(|s| s.text.trim())
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Srt => transcript
            .segments
            .iter()
            .enumerate()
            .map(|(i, s)| {
                format!(
                    "{}\n{} --> {}\n{}\n",
                    i + 1,
                    timestamp(s.start, ','),
                    timestamp(s.end, ','),
                    s.text.trim()
                )
            })
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Vtt => {
            let mut out = String::from("WEBVTT\n\n");
            for s in &transcript.segments {
                out.push_str(&format!(
                    "{} --> {}\n{}\n\n",
                    timestamp(s.start, '.'),
                    timestamp(s.end, '.'),
                    s.text.trim()
                ));
            }
            out
        }
        OutputFormat::Json => serde_json::to_string_pretty(transcript)?,
    })
}

/// Writes every requested format next to each other as `<stem>.<ext>` and
/// returns the written paths in request order.
pub async fn write_all(
    transcript: &Transcript,
    formats: &[OutputFormat],
    dir: &Path,
    stem: &str,
) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir).await?;
    let mut written = Vec::with_capacity(formats.len());
    for format in formats {
        let path = dir.join(format!("{}.{}", stem, format.extension()));
        tokio::fs::write(&path, render(transcript, *format)?).await?;
        written.push(path);
    }
    Ok(written)
}
