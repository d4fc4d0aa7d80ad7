use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::WorkQueue;
use super::error::QueueError;
use crate::api::types::{CompleteRequest, PendingList, PendingTask};
use crate::state_machine::ExecutionResult;

/// HTTP client for the broker's worker endpoints.
pub struct BrokerClient {
    api_key: String,
    client: Client,
    base_url: String,
}

impl BrokerClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, QueueError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            api_key: api_key.into(),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, QueueError> {
        Ok(request.bearer_auth(&self.api_key).send().await?)
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T, QueueError> {
        Ok(response.json::<T>().await?)
    }

    async fn unexpected(response: Response) -> QueueError {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return QueueError::Unauthorized;
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        QueueError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

impl WorkQueue for BrokerClient {
    async fn pending(&self) -> Result<Vec<PendingTask>, QueueError> {
        let response = self
            .send(self.client.get(self.url("/api/worker/pending")))
            .await?;
        if !response.status().is_success() {
            return Err(Self::unexpected(response).await);
        }
        Ok(Self::json::<PendingList>(response).await?.items)
    }

    async fn claim(&self, id: i64) -> Result<Option<PendingTask>, QueueError> {
        let url = self.url(&format!("/api/worker/claim/{id}"));
        let response = self.send(self.client.post(url)).await?;
        match response.status() {
            s if s.is_success() => Ok(Some(Self::json(response).await?)),
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn complete(&self, id: i64, result: &ExecutionResult) -> Result<bool, QueueError> {
        let url = self.url(&format!("/api/worker/complete/{id}"));
        let response = self
            .send(self.client.post(url).json(&CompleteRequest::from(result)))
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::unexpected(response).await),
        }
    }
}
