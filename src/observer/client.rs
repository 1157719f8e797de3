//! HTTP client for the observable's four read operations.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

use crate::merkle::{MerkleId, PayloadId};
use crate::protocol::{
    ErrorMessage, PayloadRequest, PayloadResponse, QueryResponse, RootResponse, SourcesRequest,
    SourcesResponse,
};

/// Per-request deadline. Expiry surfaces as a transport error and fails the
/// containing sync task, which retries on a later poll.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("root not published")]
    RootNotFound,
    #[error("sources rejected for root {id}: {message}")]
    RootMismatch { id: MerkleId, message: String },
    #[error("payload {payload_id} not found")]
    PayloadNotFound { payload_id: PayloadId },
    #[error("{op} request failed with status {status}: {message}")]
    Status {
        op: &'static str,
        status: StatusCode,
        message: String,
    },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    root_url: Url,
    sources_url: Url,
    query_url: Url,
    payload_url: Url,
}

impl Client {
    /// `endpoint` is the observable's base URL, e.g. `http://127.0.0.1:3633`.
    pub fn new(endpoint: Url) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Client {
            http,
            root_url: endpoint.join("root")?,
            sources_url: endpoint.join("sources")?,
            query_url: endpoint.join("query")?,
            payload_url: endpoint.join("payload")?,
        })
    }

    pub async fn root(&self) -> Result<RootResponse, ClientError> {
        let response = self.http.get(self.root_url.clone()).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::RootNotFound);
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                op: "root",
                status,
                message: error_message(response).await,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn sources(&self, root: &MerkleId) -> Result<SourcesResponse, ClientError> {
        let response = self
            .http
            .get(self.sources_url.clone())
            .json(&SourcesRequest { id: root.clone() })
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::RootMismatch {
                id: root.clone(),
                message: error_message(response).await,
            });
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                op: "sources",
                status,
                message: error_message(response).await,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn query(&self, merkle_ids: &[MerkleId]) -> Result<QueryResponse, ClientError> {
        let response = self
            .http
            .get(self.query_url.clone())
            .json(&merkle_ids)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                op: "query",
                status,
                message: error_message(response).await,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn payload(&self, payload_id: &PayloadId) -> Result<PayloadResponse, ClientError> {
        let response = self
            .http
            .get(self.payload_url.clone())
            .json(&PayloadRequest {
                payload_id: payload_id.clone(),
            })
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::PayloadNotFound {
                payload_id: payload_id.clone(),
            });
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                op: "payload",
                status,
                message: error_message(response).await,
            });
        }
        Ok(response.json().await?)
    }
}

async fn error_message(response: reqwest::Response) -> String {
    match response.json::<ErrorMessage>().await {
        Ok(body) => body.message,
        Err(_) => "(no error body)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_routes() {
        let client = Client::new(Url::parse("http://127.0.0.1:3633").unwrap()).unwrap();
        assert_eq!(client.root_url.as_str(), "http://127.0.0.1:3633/root");
        assert_eq!(client.query_url.as_str(), "http://127.0.0.1:3633/query");
    }
}
