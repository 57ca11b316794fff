//! Feature-extraction worker client
//!
//! Transport to the worker's HTTP API. Two submission modes chosen at
//! configuration: a local worker reads audio straight off the shared
//! filesystem and gets a small JSON message; a remote worker gets the bytes
//! as a multipart upload. Result data never comes back on these calls; it
//! arrives asynchronously on the callback endpoint.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::models::AnalysisJob;

/// Worker client errors
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Worker not reachable (connection refused, DNS, timeout)
    #[error("Worker unreachable: {0}")]
    Unreachable(String),

    /// Worker answered with a non-success status
    #[error("Worker API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Worker answered 2xx but the body did not parse
    #[error("Invalid worker response: {0}")]
    InvalidResponse(String),

    /// Local file could not be read for upload
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WorkerClientConfig {
    pub base_url: String,
    /// Remote workers get audio bytes uploaded; local workers get the path
    pub remote: bool,
    pub callback_url: String,
    /// Timeout for control calls (submit-by-path, status, cancel, health)
    pub request_timeout: Duration,
    /// Timeout for multipart uploads
    pub upload_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SubmitAck {
    job_id: String,
}

/// HTTP client for the extraction worker
pub struct WorkerClient {
    http: reqwest::Client,
    config: WorkerClientConfig,
}

impl WorkerClient {
    pub fn new(config: WorkerClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.config.remote
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Submit a job; returns the worker-side job id from the `{job_id}` ack
    pub async fn submit(&self, job: &AnalysisJob) -> Result<String, WorkerError> {
        let response = if self.config.remote {
            self.submit_upload(job).await?
        } else {
            self.submit_by_path(job).await?
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(WorkerError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let ack: SubmitAck = response
            .json()
            .await
            .map_err(|e| WorkerError::InvalidResponse(e.to_string()))?;

        tracing::debug!(
            job_id = %ack.job_id,
            content_hash = %job.content_hash,
            remote = self.config.remote,
            "Job submitted to worker"
        );
        Ok(ack.job_id)
    }

    async fn submit_by_path(&self, job: &AnalysisJob) -> Result<reqwest::Response, WorkerError> {
        self.http
            .post(self.url("/jobs"))
            .timeout(self.config.request_timeout)
            .json(&json!({
                "file_path": job.source_path,
                "track_hash": job.content_hash,
                "options": job.options,
                "callback_url": self.config.callback_url,
                "stem_delivery_mode": "path",
            }))
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))
    }

    async fn submit_upload(&self, job: &AnalysisJob) -> Result<reqwest::Response, WorkerError> {
        let bytes = tokio::fs::read(&job.source_path).await?;
        let file_name = std::path::Path::new(&job.source_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            )
            .text("track_hash", job.content_hash.clone())
            .text(
                "options",
                serde_json::to_string(&job.options)
                    .map_err(|e| WorkerError::InvalidResponse(e.to_string()))?,
            )
            .text("callback_url", self.config.callback_url.clone())
            .text("stem_delivery_mode", "callback");

        self.http
            .post(self.url("/jobs"))
            .timeout(self.config.upload_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))
    }

    /// Worker-side job status; None when the worker no longer knows the id
    pub async fn status(&self, job_id: &str) -> Result<Option<serde_json::Value>, WorkerError> {
        let response = self
            .http
            .get(self.url(&format!("/jobs/{}", job_id)))
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(WorkerError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| WorkerError::InvalidResponse(e.to_string()))
    }

    /// Best-effort cancel; false when the worker no longer knows the id
    pub async fn cancel(&self, job_id: &str) -> Result<bool, WorkerError> {
        let response = self
            .http
            .delete(self.url(&format!("/jobs/{}", job_id)))
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(WorkerError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Liveness probe used before dequeuing and by the health endpoint
    pub async fn health(&self) -> bool {
        match self
            .http
            .get(self.url("/health"))
            .timeout(self.config.request_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
