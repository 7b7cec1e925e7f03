use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{JobContext, Transcriber};
use crate::schedule::types::{JobOptions, JobRecord};

/// Delegates transcription to an HTTP service.
///
/// Request: `POST {endpoint}` with `{job_id, source_ref, options}`.
/// Response: `{result_ref}` on success, any non-2xx status fails the job.
pub struct RemoteTranscriber {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct RemoteRequest<'a> {
    job_id: &'a str,
    source_ref: &'a str,
    options: &'a JobOptions,
}

#[derive(Debug, Deserialize)]
struct RemoteResponse {
    result_ref: String,
}

impl RemoteTranscriber {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl Transcriber for RemoteTranscriber {
    fn name(&self) -> &str {
        "remote"
    }

    async fn transcribe(&self, job: &JobRecord, ctx: JobContext) -> Result<String> {
        info!("Sending job {} ({}) to {}", job.id, job.source_ref, self.endpoint);

        let request = self
            .client
            .post(&self.endpoint)
            .json(&RemoteRequest {
                job_id: &job.id,
                source_ref: &job.source_ref,
                options: &job.options,
            })
            .send();

        let response = tokio::select! {
            _ = ctx.cancellation().cancelled() => {
                return Err(anyhow::anyhow!("transcription of job {} was cancelled", job.id));
            }
            response = request => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("transcription service returned {}: {}", status, body));
        }

        let body: RemoteResponse = response.json().await?;
        ctx.report_progress(1.0);
        Ok(body.result_ref)
    }
}
