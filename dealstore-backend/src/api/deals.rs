//! Deal-submission API client.
//!
//! Applying a storage configuration to a content id starts an asynchronous
//! job that eventually pins and replicates the content. The job outlives
//! the caller; its state can be polled but nothing here waits on it.

use std::fmt;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::content::ContentId;
use super::transport::{AuthTransport, Session, DEAL_AUTH_HEADER};
use super::{check_response, ApiError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Replace a configuration already attached to the content id.
    pub override_config: bool,
}

/// Remote state of a deal job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealJobState {
    Unspecified,
    Queued,
    Executing,
    Success,
    Failed,
    Canceled,
}

impl DealJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DealJobState::Success | DealJobState::Failed | DealJobState::Canceled)
    }

    fn parse(status: &str) -> Self {
        let status = status.trim();
        let status = status.strip_prefix("JOB_STATUS_").unwrap_or(status);
        match status.to_ascii_uppercase().as_str() {
            "QUEUED" => DealJobState::Queued,
            "EXECUTING" => DealJobState::Executing,
            "SUCCESS" => DealJobState::Success,
            "FAILED" => DealJobState::Failed,
            "CANCELED" | "CANCELLED" => DealJobState::Canceled,
            _ => DealJobState::Unspecified,
        }
    }
}

impl fmt::Display for DealJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DealJobState::Unspecified => "unspecified",
            DealJobState::Queued => "queued",
            DealJobState::Executing => "executing",
            DealJobState::Success => "success",
            DealJobState::Failed => "failed",
            DealJobState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

#[async_trait]
pub trait DealApi: Send + Sync {
    /// Attach a storage configuration to `content`, starting a deal job.
    async fn apply(
        &self,
        session: &Session,
        content: &ContentId,
        options: ApplyOptions,
    ) -> Result<JobId, ApiError>;

    async fn job_status(&self, session: &Session, job: &JobId) -> Result<DealJobState, ApiError>;
}

pub struct HttpDealApi {
    transport: AuthTransport,
}

#[derive(Debug, Serialize)]
struct ApplyRequest<'a> {
    cid: &'a str,
    #[serde(rename = "override")]
    override_config: bool,
}

#[derive(Debug, Deserialize)]
struct ApplyResponse {
    #[serde(rename = "jobId", alias = "job_id")]
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    job: JobBody,
}

#[derive(Debug, Deserialize)]
struct JobBody {
    #[serde(default)]
    status: String,
}

impl HttpDealApi {
    pub fn new(server_addr: &str) -> Result<Self, ApiError> {
        Ok(Self {
            transport: AuthTransport::new(server_addr, DEAL_AUTH_HEADER)?,
        })
    }
}

#[async_trait]
impl DealApi for HttpDealApi {
    async fn apply(
        &self,
        session: &Session,
        content: &ContentId,
        options: ApplyOptions,
    ) -> Result<JobId, ApiError> {
        let resp = self
            .transport
            .request(session, Method::POST, "/v1/storage-config/apply")?
            .json(&ApplyRequest {
                cid: &content.0,
                override_config: options.override_config,
            })
            .send()
            .await?;
        let body: ApplyResponse = check_response(resp, &content.0).await?.json().await?;
        if body.job_id.is_empty() {
            return Err(ApiError::Decode("apply response has an empty job id".to_string()));
        }
        debug!(content = %content, job_id = %body.job_id, "Storage config applied");
        Ok(JobId(body.job_id))
    }

    async fn job_status(&self, session: &Session, job: &JobId) -> Result<DealJobState, ApiError> {
        let path = format!("/v1/storage-jobs/{}", urlencoding::encode(&job.0));
        let resp = self.transport.request(session, Method::GET, &path)?.send().await?;
        let body: JobResponse = check_response(resp, &job.0).await?.json().await?;
        Ok(DealJobState::parse(&body.job.status))
    }
}
