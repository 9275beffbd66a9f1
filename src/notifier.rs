//! Best-effort, fire-and-forget delivery of the per-request webhook.

use base64::Engine as _;
use serde::Serialize;
use std::time::Duration;

/// Body POSTed to a request's `webhook_url`.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub status: &'static str,
    pub prompt_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookPayload {
    #[must_use]
    pub fn success(prompt_id: String, images_base64: Vec<String>) -> Self {
        Self {
            status: "success",
            prompt_id,
            images: Some(images_base64),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(prompt_id: String, error: String) -> Self {
        Self {
            status: "failure",
            prompt_id,
            images: None,
            error: Some(error),
        }
    }
}

/// Delivers webhook notifications. `notify` must return immediately; the
/// actual POST happens on a detached task.
pub trait Notifier: Send + Sync {
    fn notify(&self, url: String, payload: WebhookPayload);
}

/// Delivers webhooks over HTTP with a fixed per-request timeout and no retry.
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    /// # Panics
    /// Panics if the underlying TLS backend cannot be initialized, mirroring
    /// `reqwest::Client::new`'s own panic contract.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build the webhook HTTP client");
        Self { client }
    }
}

impl Notifier for HttpNotifier {
    fn notify(&self, url: String, payload: WebhookPayload) {
        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(url, prompt_id = %payload.prompt_id, "webhook delivered");
                }
                Ok(response) => {
                    tracing::warn!(
                        url,
                        status = %response.status(),
                        prompt_id = %payload.prompt_id,
                        "webhook delivery returned non-2xx"
                    );
                }
                Err(err) => {
                    tracing::warn!(url, %err, prompt_id = %payload.prompt_id, "webhook delivery failed");
                }
            }
        });
    }
}

/// Base64-encode an image, the encoding this gateway uses for webhook bodies.
#[must_use]
pub fn encode_image(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
