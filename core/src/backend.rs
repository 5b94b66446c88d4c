/// Sequence and feedback endpoints of the reasoning backend.
use crate::action_stream::{ActionLineDecoder, DecoderConfig, SequenceRecord};
use crate::config::BackendConfig;
use crate::errors::{BackendError, BackendResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Stream of decoded lines from a sequence response.
pub type SequenceStream = BoxStream<'static, BackendResult<SequenceRecord>>;

/// Body of a sequence (behavior expansion) request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceRequest {
    pub stage_id: String,
    pub step_index: usize,
    pub state: serde_json::Value,
    pub stream: bool,
}

/// Body of a feedback (behavior evaluation) request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub stage_id: String,
    pub step_index: usize,
    pub state: serde_json::Value,
}

/// Verdict returned by the feedback endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackResponse {
    pub target_achieved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_behavior_id: Option<String>,
}

/// The external reasoning/action backend.
#[async_trait]
pub trait WorkflowBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Expand the current behavior into a stream of action records.
    async fn sequence(&self, request: SequenceRequest) -> BackendResult<SequenceStream>;

    /// Evaluate the behavior's outcome against its goal.
    async fn feedback(&self, request: FeedbackRequest) -> BackendResult<FeedbackResponse>;
}

/// HTTP implementation of [`WorkflowBackend`].
pub struct HttpBackend {
    client: reqwest::Client,
    config: BackendConfig,
    decoder: DecoderConfig,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config,
            decoder: DecoderConfig::default(),
        })
    }

    pub fn with_decoder_config(mut self, decoder: DecoderConfig) -> Self {
        self.decoder = decoder;
        self
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.url(path));
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl WorkflowBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn sequence(&self, request: SequenceRequest) -> BackendResult<SequenceStream> {
        debug!(
            "POST {} (stage {}, step {})",
            self.config.sequence_path, request.stage_id, request.step_index
        );

        let response = self
            .post(&self.config.sequence_path)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::ApiError(format!(
                "sequence request failed with status {}",
                response.status()
            )));
        }

        let decoder_config = self.decoder.clone();
        let stream = async_stream::stream! {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = ActionLineDecoder::with_config(decoder_config);

            while let Some(chunk_result) = byte_stream.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        for record in decoder.push(&chunk) {
                            yield Ok(record);
                        }
                    }
                    Err(e) => {
                        yield Err(BackendError::ReqwestError(e));
                        return;
                    }
                }
            }

            if let Some(record) = decoder.finish() {
                yield Ok(record);
            }

            let stats = decoder.statistics();
            debug!(
                "Sequence stream closed: {} lines, {} actions, {} skipped, {} malformed",
                stats.lines, stats.actions, stats.skipped, stats.malformed
            );
        };

        Ok(Box::pin(stream))
    }

    async fn feedback(&self, request: FeedbackRequest) -> BackendResult<FeedbackResponse> {
        debug!(
            "POST {} (stage {}, step {})",
            self.config.feedback_path, request.stage_id, request.step_index
        );

        let response = self
            .post(&self.config.feedback_path)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::ApiError(format!(
                "feedback request failed with status {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| BackendError::InvalidResponse(format!("{}: {}", e, body)))
    }
}
