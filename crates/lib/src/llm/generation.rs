//! HTTP client for the generation endpoint: `POST {"prompt"}` -> `{"shell_script"}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::GenerationConfig;

/// Request body sent verbatim to the endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
}

/// Success body returned by the endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationResponse {
    pub shell_script: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// Transport failure: connect, timeout, or reading the body.
    #[error("generation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("generation endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("generation response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Turns a prompt into a script. Implementations must be safe to call concurrently.
#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// Client for the generation endpoint. One request per call, no retries.
#[derive(Clone)]
pub struct GenerationClient {
    endpoint: String,
    client: reqwest::Client,
}

impl GenerationClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self, GenerationError> {
        Self::new(config.endpoint.clone(), config.timeout())
    }
}

#[async_trait]
impl ScriptGenerator for GenerationClient {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let body = GenerationRequest {
            prompt: prompt.to_string(),
        };
        let res = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        let data: GenerationResponse = serde_json::from_str(&text)?;
        Ok(data.shell_script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GenerationClient {
        GenerationClient::new(
            format!("{}/generate-shell", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn returns_script_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate-shell"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({ "prompt": "list files" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "shell_script": "ls" })))
            .expect(1)
            .mount(&server)
            .await;

        let script = client_for(&server).generate("list files").await.unwrap();
        assert_eq!(script, "ls");
    }

    #[tokio::test]
    async fn non_success_status_carries_code_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
            .mount(&server)
            .await;

        let err = client_for(&server).generate("x").await.unwrap_err();
        match &err {
            GenerationError::Status { status, body } => {
                assert_eq!(*status, 500);
                assert_eq!(body, "internal error");
            }
            other => panic!("expected status error, got {:?}", other),
        }
        let msg = err.to_string();
        assert!(msg.contains("500") && msg.contains("internal error"));
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "script": "ls" })))
            .mount(&server)
            .await;

        let err = client_for(&server).generate("x").await.unwrap_err();
        assert!(matches!(err, GenerationError::Decode(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_request_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let client =
            GenerationClient::new(format!("http://127.0.0.1:{}/", port), Duration::from_secs(2))
                .unwrap();
        let err = client.generate("x").await.unwrap_err();
        assert!(matches!(err, GenerationError::Request(_)), "{:?}", err);
    }
}
