//! Sync transports
//!
//! The engine only needs two calls from the server, so the network sits
//! behind a small trait. `HttpTransport` talks to a running server;
//! `InProcessTransport` calls a `SyncService` directly, for embedding the
//! server in the same process and for tests.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{ClientError, ClientResult};
use crate::sync::{PullRequest, PullResponse, PushRequest, PushResponse, SyncService};

/// Sync transport trait
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Send a batch of changes
    async fn push(&self, request: &PushRequest) -> ClientResult<PushResponse>;

    /// Fetch one page of changes after the request's cursor
    async fn pull(&self, request: &PullRequest) -> ClientResult<PullResponse>;
}

/// HTTP transport for a remote FieldSync server
pub struct HttpTransport {
    client: reqwest::Client,
    /// Server root, e.g. "http://localhost:3000"
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> ClientResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/sync/{}", self.base_url, path)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

async fn server_error(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.message)
        .unwrap_or(body);

    ClientError::Server { status, message }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, request: &PushRequest) -> ClientResult<PushResponse> {
        let response = self
            .client
            .post(self.url("push"))
            .json(request)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::MULTI_STATUS => Ok(response.json().await?),
            _ => Err(server_error(response).await),
        }
    }

    async fn pull(&self, request: &PullRequest) -> ClientResult<PullResponse> {
        let response = self
            .client
            .post(self.url("pull"))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(server_error(response).await);
        }

        Ok(response.json().await?)
    }
}

/// Transport that calls a sync service in the same process
#[derive(Clone)]
pub struct InProcessTransport {
    service: SyncService,
}

impl InProcessTransport {
    pub fn new(service: SyncService) -> Self {
        Self { service }
    }
}

fn app_error(e: crate::error::AppError) -> ClientError {
    ClientError::Server {
        status: e.status_code().as_u16(),
        message: e.to_string(),
    }
}

#[async_trait]
impl SyncTransport for InProcessTransport {
    async fn push(&self, request: &PushRequest) -> ClientResult<PushResponse> {
        self.service.push(request.clone()).await.map_err(app_error)
    }

    async fn pull(&self, request: &PullRequest) -> ClientResult<PullResponse> {
        self.service.pull(request.clone()).await.map_err(app_error)
    }
}
