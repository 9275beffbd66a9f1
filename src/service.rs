//! Orchestrates one generation request end-to-end: build the workflow,
//! submit it, subscribe for its outcome, and wait.

use crate::engine_client::EngineClient;
use crate::tracker::Tracker;
use crate::workflow::WorkflowBuilder;
use bytes::Bytes;
use serde_json::Value;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build workflow: {source}"))]
    Build { source: crate::workflow::Error },

    #[snafu(display("failed to submit workflow to engine: {source}"))]
    Submit { source: crate::engine_client::Error },

    #[snafu(display("failed to subscribe for generation result: {source}"))]
    Subscribe { source: crate::tracker::Error },

    #[snafu(display("result sink closed without a value for prompt {prompt_id}"))]
    SinkClosed { prompt_id: String },

    #[snafu(display("generation failed for prompt {prompt_id}: {diagnostic}"))]
    GenerationFailed { prompt_id: String, diagnostic: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Successful outcome of [`Service::generate_image`].
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub prompt_id: String,
    pub images: Vec<Bytes>,
}

/// Orchestrates the Workflow Builder, Engine Client and Tracker for one
/// request. Cheap to clone: all fields are shared handles.
#[derive(Clone)]
pub struct Service {
    builder: Arc<WorkflowBuilder>,
    engine: Arc<dyn EngineClient>,
    tracker: Tracker,
}

impl Service {
    #[must_use]
    pub fn new(builder: WorkflowBuilder, engine: Arc<dyn EngineClient>, tracker: Tracker) -> Self {
        Self {
            builder: Arc::new(builder),
            engine,
            tracker,
        }
    }

    /// Build, submit, and await completion of one generation request.
    pub async fn generate_image(
        &self,
        workflow_name: &str,
        params: &HashMap<String, Value>,
        webhook_url: Option<String>,
    ) -> Result<GenerationResult> {
        let images_expected = params
            .get("imageCount")
            .and_then(Value::as_u64)
            .unwrap_or(1) as usize;

        let workflow_bytes = self.builder.build(workflow_name, params).context(BuildSnafu)?;

        let prompt_id = self
            .engine
            .submit(workflow_bytes)
            .await
            .context(SubmitSnafu)?;

        let result_rx = self
            .tracker
            .subscribe(prompt_id.clone(), images_expected, webhook_url)
            .context(SubscribeSnafu)?;

        let outcome = result_rx.await.ok().context(SinkClosedSnafu {
            prompt_id: prompt_id.clone(),
        })?;

        if outcome.success {
            Ok(GenerationResult {
                prompt_id,
                images: outcome.images,
            })
        } else {
            GenerationFailedSnafu {
                prompt_id,
                diagnostic: outcome.error.unwrap_or_default(),
            }
            .fail()
        }
    }
}
