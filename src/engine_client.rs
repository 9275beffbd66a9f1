//! Maintains the one persistent connection to the image-generation engine:
//! submits workflows over HTTP and translates the engine's WebSocket frame
//! stream into [`crate::tracker::Event`]s.

use crate::tracker::Event;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use snafu::prelude::*;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to connect to engine websocket at {url}: {source}"))]
    Connect {
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[snafu(display("failed to submit workflow to engine: {source}"))]
    SubmitRequest { source: reqwest::Error },

    #[snafu(display("engine rejected submission with status {status}"))]
    SubmitRejected { status: reqwest::StatusCode },

    #[snafu(display("failed to decode engine submission response: {source}"))]
    SubmitDecode { source: reqwest::Error },

    #[snafu(display("workflow bytes were not valid JSON: {source}"))]
    InvalidWorkflow { source: serde_json::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    prompt_id: String,
    #[serde(default)]
    node_errors: Value,
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    data: WireData,
}

#[derive(Debug, Default, Deserialize)]
struct WireData {
    #[serde(default)]
    prompt_id: Option<String>,
}

/// One persistent connection to the engine, identified by a stable client ID.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Open the stream and spawn the reader task that writes translated
    /// events to `event_sink`. Returns once the connection is established;
    /// the reader keeps running until a read error closes `event_sink`.
    async fn start(&self, event_sink: mpsc::Sender<Event>) -> Result<()>;

    /// Submit a workflow graph and return the engine-assigned prompt ID.
    async fn submit(&self, workflow_bytes: Vec<u8>) -> Result<String>;
}

/// [`EngineClient`] implementation backed by `reqwest` (submission) and
/// `tokio-tungstenite` (event stream).
pub struct HttpEngineClient {
    http: reqwest::Client,
    base_url: String,
    client_id: uuid::Uuid,
}

impl HttpEngineClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>, client_id: uuid::Uuid) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            client_id,
        }
    }

    fn ws_url(&self) -> String {
        let ws_base = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{ws_base}/ws?clientId={}", self.client_id)
    }

    /// Translate one wire frame into zero or one internal events.
    fn translate_text(raw: &str) -> Option<Event> {
        let frame: WireFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(%err, "dropping unparseable engine frame");
                return None;
            }
        };

        match frame.frame_type.as_str() {
            "execution_start" => frame.data.prompt_id.map(|prompt_id| Event::ExecutionStart { prompt_id }),
            "execution_success" => frame
                .data
                .prompt_id
                .map(|prompt_id| Event::ExecutionFinished { prompt_id }),
            _ => {
                if frame.data.prompt_id.is_some() {
                    Some(Event::Heartbeat {
                        prompt_id: frame.data.prompt_id,
                    })
                } else {
                    None
                }
            }
        }
    }
}

#[async_trait]
impl EngineClient for HttpEngineClient {
    async fn start(&self, event_sink: mpsc::Sender<Event>) -> Result<()> {
        let url = self.ws_url();
        let (stream, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .context(ConnectSnafu { url: url.clone() })?;
        tracing::info!(url, "connected to engine event stream");

        let (_write, mut read) = stream.split();

        tokio::spawn(async move {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = HttpEngineClient::translate_text(&text) {
                            if event_sink.send(event).await.is_err() {
                                tracing::info!("event sink closed; stopping engine reader");
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let event = Event::ImageReceived { bytes: bytes.into() };
                        if event_sink.send(event).await.is_err() {
                            tracing::info!("event sink closed; stopping engine reader");
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("engine closed the event stream");
                        return;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                        // No event to translate; keep reading.
                    }
                    Some(Err(err)) => {
                        tracing::warn!(%err, "engine stream read error; terminating reader");
                        return;
                    }
                    None => {
                        tracing::info!("engine stream ended");
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    async fn submit(&self, workflow_bytes: Vec<u8>) -> Result<String> {
        let workflow: Value = serde_json::from_slice(&workflow_bytes).context(InvalidWorkflowSnafu)?;

        let response = self
            .http
            .post(format!("{}/prompt", self.base_url))
            .json(&serde_json::json!({
                "prompt": workflow,
                "client_id": self.client_id,
            }))
            .send()
            .await
            .context(SubmitRequestSnafu)?;

        ensure!(
            response.status().is_success(),
            SubmitRejectedSnafu {
                status: response.status()
            }
        );

        let decoded: SubmitResponse = response.json().await.context(SubmitDecodeSnafu)?;

        if decoded.node_errors.is_object()
            && !decoded.node_errors.as_object().is_some_and(serde_json::Map::is_empty)
        {
            tracing::warn!(
                prompt_id = %decoded.prompt_id,
                node_errors = %decoded.node_errors,
                "engine reported node errors for submitted workflow"
            );
        }

        Ok(decoded.prompt_id)
    }
}
