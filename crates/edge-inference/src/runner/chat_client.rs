//! OpenAI-compatible chat completions client shared by the remote and local
//! server runners.

use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde_json::json;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

use super::types::InferenceRequest;
use crate::error::RunnerError;

/// Content deltas of a streamed completion.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, RunnerError>> + Send>>;

#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ChatClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, RunnerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RunnerError::resource_unavailable("failed to build HTTP client").with_cause(e))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    /// Request body for a chat completion built from the request's inputs and
    /// resolved parameters.
    pub fn build_payload(model: &str, request: &InferenceRequest, stream: bool) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = request.text("system") {
            messages.push(json!({"role": "system", "content": system}));
        }
        let prompt = request.prompt().unwrap_or_default();
        match request.text("image_url") {
            Some(image) => messages.push(json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": image}},
                ],
            })),
            None => messages.push(json!({"role": "user", "content": prompt})),
        }

        let mut payload = json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        for key in ["temperature", "max_tokens", "top_p"] {
            if let Some(value) = request.params.get(key) {
                payload[key] = value.clone();
            }
        }
        if request.param_str("response_format") == Some("json") {
            payload["response_format"] = json!({"type": "json_object"});
        }
        payload
    }

    fn post(&self, payload: &serde_json::Value) -> reqwest::RequestBuilder {
        let builder = self.http.post(self.completions_url()).json(payload);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, payload: &serde_json::Value) -> Result<reqwest::Response, RunnerError> {
        let resp = self
            .post(payload)
            .send()
            .await
            .map_err(|e| RunnerError::network("inference request failed").with_cause(e))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(map_status(status, &body))
    }

    /// One-shot completion. Returns the content and finish reason.
    pub async fn complete(
        &self,
        model: &str,
        request: &InferenceRequest,
    ) -> Result<(String, Option<String>), RunnerError> {
        let payload = Self::build_payload(model, request, false);
        let resp = self.send(&payload).await?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RunnerError::processing("failed to parse completion").with_cause(e))?;

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        let finish_reason = body["choices"][0]["finish_reason"].as_str().map(str::to_string);
        Ok((content, finish_reason))
    }

    /// Streaming completion as a sequence of content deltas.
    pub async fn stream(
        &self,
        model: &str,
        request: &InferenceRequest,
    ) -> Result<DeltaStream, RunnerError> {
        let payload = Self::build_payload(model, request, true);
        let resp = self.send(&payload).await?;
        let byte_stream = resp.bytes_stream();

        Ok(Box::pin(async_stream::try_stream! {
            let mut buffer = String::new();
            futures_util::pin_mut!(byte_stream);

            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk.map_err(|e| RunnerError::network("stream read error").with_cause(e))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer[..newline_pos].trim().to_string();
                    buffer = buffer[newline_pos + 1..].to_string();

                    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };
                    if data == "[DONE]" {
                        return;
                    }
                    match serde_json::from_str::<serde_json::Value>(data) {
                        Ok(event) => {
                            if let Some(delta) = event["choices"][0]["delta"]["content"].as_str() {
                                if !delta.is_empty() {
                                    yield delta.to_string();
                                }
                            }
                        }
                        Err(e) => debug!("Skipping malformed SSE payload: {}", e),
                    }
                }
            }
        }))
    }
}

pub fn map_status(status: StatusCode, body: &str) -> RunnerError {
    let message = format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RunnerError::authentication(message),
        StatusCode::TOO_MANY_REQUESTS => RunnerError::quota_exceeded(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => RunnerError::invalid_input(message),
        s if s.is_server_error() => RunnerError::network(message),
        _ => RunnerError::processing(message),
    }
}
