//! Document-intelligence (layout analysis) client.
//!
//! Analysis is asynchronous on the service side: a submit returns a job id
//! and the result is fetched later with
//! `GET {endpoint}formrecognizer/documentModels/{model}/analyzeResults/{id}`.
//!
//! Several endpoint/key pairs may be configured. The index picked at submit
//! time travels with the job, and every poll of that job must use it.
//!
//! Polls go through [`durable_get`], which retries transport failures only
//! (connection errors, timeouts) a bounded number of times with a fixed
//! wait. Any HTTP response, successful or not, ends the retry and is
//! classified by the caller.

use std::time::Duration;

use async_trait::async_trait;
use docflow_core::docmap::{AnalyzeResponse, AnalyzeResult};
use docflow_core::error::PipelineError;
use tracing::{debug, warn};

use crate::config::DocIntelConfig;

const KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Result of submitting a document for analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { result_id: String },
    /// 429 or 503; the caller requeues.
    Throttled { status: u16, body: String },
    Rejected { status: u16, body: String },
}

/// Result of polling an analysis job.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// The raw payload is kept for the audit artifact.
    Succeeded { raw: String, result: AnalyzeResult },
    Running,
    /// HTTP 200 with a status we do not expect.
    Unexpected { status: String },
    /// Any non-200 response.
    HttpError { status: u16, body: String },
}

#[async_trait]
pub trait LayoutService: Send + Sync {
    fn endpoint_count(&self) -> usize;

    async fn submit(
        &self,
        endpoint_index: usize,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<SubmitOutcome, PipelineError>;

    async fn poll(&self, endpoint_index: usize, result_id: &str)
        -> Result<PollOutcome, PipelineError>;
}

/// Classify a poll response body received with HTTP 200.
pub fn classify_poll_body(raw: String) -> Result<PollOutcome, PipelineError> {
    let response: AnalyzeResponse = serde_json::from_str(&raw).map_err(|e| {
        PipelineError::ServiceAnomaly(format!("unreadable analysis response: {}", e))
    })?;
    match response.status.as_str() {
        "succeeded" => {
            let result = response.analyze_result.unwrap_or_default();
            Ok(PollOutcome::Succeeded { raw, result })
        }
        "running" => Ok(PollOutcome::Running),
        other => Ok(PollOutcome::Unexpected {
            status: other.to_string(),
        }),
    }
}

/// Job id from an `Operation-Location` header value.
pub fn result_id_from_operation_location(location: &str) -> Option<String> {
    let (_, tail) = location.rsplit_once("/analyzeResults/")?;
    let id = tail.split('?').next().unwrap_or_default();
    (!id.is_empty()).then(|| id.to_string())
}

fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.ends_with('/') {
        endpoint.to_string()
    } else {
        format!("{}/", endpoint)
    }
}

/// GET with a bounded, fixed-wait retry on transport failures.
pub async fn durable_get(
    client: &reqwest::Client,
    url: &str,
    headers: &[(&str, &str)],
    max_attempts: u32,
    wait: Duration,
) -> Result<reqwest::Response, PipelineError> {
    let mut last_err = None;

    for attempt in 1..=max_attempts.max(1) {
        if attempt > 1 {
            tokio::time::sleep(wait).await;
        }
        let mut request = client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        match request.send().await {
            Ok(response) => return Ok(response),
            Err(e) => {
                warn!(attempt, max_attempts, "poll transport failure: {}", e);
                last_err = Some(e);
            }
        }
    }

    Err(PipelineError::Transport(
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string()),
    ))
}

/// HTTP client for the document-intelligence REST API.
pub struct DocIntelClient {
    client: reqwest::Client,
    endpoints: Vec<String>,
    keys: Vec<String>,
    api_version: String,
    model: String,
    max_read_attempts: u32,
    read_retry_wait: Duration,
}

impl DocIntelClient {
    pub fn new(config: &DocIntelConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoints: config.endpoints.iter().map(|e| normalize_endpoint(e)).collect(),
            keys: config.keys.clone(),
            api_version: config.api_version.clone(),
            model: config.model.clone(),
            max_read_attempts: config.max_read_attempts,
            read_retry_wait: Duration::from_secs(config.read_retry_wait_secs),
        })
    }

    fn endpoint(&self, index: usize) -> Result<(&str, &str), PipelineError> {
        match (self.endpoints.get(index), self.keys.get(index)) {
            (Some(endpoint), Some(key)) => Ok((endpoint, key)),
            _ => Err(PipelineError::MalformedMessage(format!(
                "endpoint index {} out of range ({} configured)",
                index,
                self.endpoints.len()
            ))),
        }
    }
}

fn transport(e: reqwest::Error) -> PipelineError {
    PipelineError::Transport(e.to_string())
}

#[async_trait]
impl LayoutService for DocIntelClient {
    fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    async fn submit(
        &self,
        endpoint_index: usize,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<SubmitOutcome, PipelineError> {
        let (endpoint, key) = self.endpoint(endpoint_index)?;
        let url = format!(
            "{}formrecognizer/documentModels/{}:analyze?api-version={}",
            endpoint, self.model, self.api_version
        );
        let response = self
            .client
            .post(&url)
            .header(KEY_HEADER, key)
            .header("Content-Type", content_type)
            .body(content)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status().as_u16();
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let result_id = header("Operation-Location")
            .as_deref()
            .and_then(result_id_from_operation_location)
            .or_else(|| header("apim-request-id"));

        match status {
            202 => match result_id {
                Some(result_id) => Ok(SubmitOutcome::Accepted { result_id }),
                None => Err(PipelineError::ServiceAnomaly(
                    "analysis accepted without a job id".to_string(),
                )),
            },
            429 | 503 => Ok(SubmitOutcome::Throttled {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
            _ => Ok(SubmitOutcome::Rejected {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn poll(
        &self,
        endpoint_index: usize,
        result_id: &str,
    ) -> Result<PollOutcome, PipelineError> {
        let (endpoint, key) = self.endpoint(endpoint_index)?;
        let url = format!(
            "{}formrecognizer/documentModels/{}/analyzeResults/{}?api-version={}",
            endpoint, self.model, result_id, self.api_version
        );
        debug!(endpoint_index, result_id, "polling analysis job");
        let response = durable_get(
            &self.client,
            &url,
            &[(KEY_HEADER, key)],
            self.max_read_attempts,
            self.read_retry_wait,
        )
        .await?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport)?;
        if status != 200 {
            return Ok(PollOutcome::HttpError { status, body });
        }
        classify_poll_body(body)
    }
}
