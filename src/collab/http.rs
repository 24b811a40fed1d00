//! HTTP delivery to the remote analysis endpoint.
//!
//! The artifact is posted as multipart form data together with the model and
//! prompt. The response body is the result.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::{Deliver, DeliveryError};
use crate::error::{Error, Result};
use crate::model::work::{ArtifactRef, PromptConfig};

pub struct HttpDelivery {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpDelivery {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl Deliver for HttpDelivery {
    async fn deliver(
        &self,
        artifact: &ArtifactRef,
        prompt: &PromptConfig,
    ) -> std::result::Result<String, DeliveryError> {
        let bytes = match tokio::fs::read(artifact.as_path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DeliveryError::terminal(format!(
                    "artifact missing: {artifact}"
                )));
            }
            Err(e) => {
                return Err(DeliveryError::retryable(format!(
                    "cannot read artifact {artifact}: {e}"
                )));
            }
        };

        let file_name = artifact
            .as_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "capture.png".to_string());
        let image = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/png")
            .map_err(|e| DeliveryError::terminal(format!("bad image part: {e}")))?;
        let form = Form::new()
            .text("model", prompt.model.clone())
            .text("prompt", prompt.prompt.clone())
            .part("image", image);

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        debug!(artifact = %artifact, status = status.as_u16(), "delivery response");

        if let Some(err) = classify_status(status) {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError {
                message: format!("{}: {}", err.message, truncate(&body, 200)),
                ..err
            });
        }

        response
            .text()
            .await
            .map_err(|e| DeliveryError::retryable(format!("failed to read response body: {e}")))
    }
}

/// Map a non-success status to a delivery error. `None` means success.
///
/// Rate limiting and server errors are transient; everything else in the
/// 4xx range (including 413 Payload Too Large) is permanent for this item.
pub fn classify_status(status: StatusCode) -> Option<DeliveryError> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Some(DeliveryError::retryable(format!("endpoint returned {status}")))
    } else {
        Some(DeliveryError::terminal(format!("endpoint rejected artifact: {status}")))
    }
}

fn classify_transport_error(e: reqwest::Error) -> DeliveryError {
    if e.is_builder() {
        DeliveryError::terminal(format!("invalid request: {e}"))
    } else {
        // Timeouts, refused connections, DNS and TLS hiccups: the network may come back.
        DeliveryError::retryable(format!("request failed: {e}"))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        for code in [429, 408, 500, 502, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(classify_status(status).unwrap().retryable, "{code}");
        }
    }

    #[test]
    fn client_errors_are_terminal() {
        for code in [400, 401, 404, 413, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(!classify_status(status).unwrap().retryable, "{code}");
        }
    }

    #[test]
    fn success_is_not_an_error() {
        assert!(classify_status(StatusCode::OK).is_none());
    }

    #[tokio::test]
    async fn missing_artifact_is_terminal() {
        let delivery =
            HttpDelivery::new("http://127.0.0.1:9/analyze", None, Duration::from_secs(1)).unwrap();
        let err = delivery
            .deliver(
                &ArtifactRef::new("/nonexistent/ss-0.png"),
                &PromptConfig::default(),
            )
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
