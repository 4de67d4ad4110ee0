//! Single-provider call and stream execution.
//!
//! The manager owns the HTTP path to one provider endpoint: payload
//! assembly through the compat, payload-extension injection, rate-limit
//! detection (HTTP 429 or a `retryWords` sentinel in the error body), and
//! the configured retry-delay sequence with jitter. Priority fallback
//! across providers lives a level up, in the coordinator.

use futures_util::StreamExt;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::compat::LlmCompat;
use crate::error::{CoordResult, CoordinatorError};
use crate::extensions::apply_extensions;
use crate::logging::{log_debug, log_warn};
use crate::registry::ProviderManifest;
use crate::settings::ProviderSettings;
use crate::spec::{Message, Tool, ToolChoice, UnifiedResponse};

/// De-framed SSE data payloads from a streaming provider call.
pub type RawChunkStream = Pin<Box<dyn futures_util::Stream<Item = CoordResult<String>> + Send>>;

/// Everything one provider attempt needs, passed by reference from the
/// coordinator's per-entry state.
pub struct ProviderCall<'a> {
    pub manifest: &'a ProviderManifest,
    pub compat: &'a Arc<dyn LlmCompat>,
    pub model: &'a str,
    pub settings: &'a ProviderSettings,
    pub messages: &'a [Message],
    pub tools: &'a [Tool],
    pub tool_choice: Option<&'a ToolChoice>,
    pub extras: &'a BTreeMap<String, Value>,
    /// Sleep sequence between rate-limited attempts
    pub retry_delays_ms: &'a [u64],
}

/// How one HTTP attempt failed.
enum AttemptError {
    RateLimited(String),
    Other(String),
}

/// Executes single provider calls and streams.
#[derive(Debug, Clone)]
pub struct LlmManager {
    client: reqwest::Client,
}

impl Default for LlmManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmManager {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// One unary provider call with rate-limit retries.
    pub async fn call_provider(&self, call: &ProviderCall<'_>) -> CoordResult<UnifiedResponse> {
        let payload = self.build_payload(call)?;

        if call.compat.has_direct_call() {
            return call
                .compat
                .call_direct(&payload, &call.manifest.id, call.model)
                .await;
        }

        let mut attempt = 0usize;
        loop {
            match self
                .post_once(call.manifest, &call.manifest.endpoint.url, &call.manifest.endpoint.headers, &payload)
                .await
            {
                Ok(raw) => {
                    return call.compat.parse_response(raw, &call.manifest.id, call.model);
                }
                Err(AttemptError::RateLimited(message)) => {
                    let Some(delay_ms) = call.retry_delays_ms.get(attempt).copied() else {
                        return Err(CoordinatorError::provider_rate_limit(
                            &call.manifest.id,
                            message,
                        ));
                    };
                    attempt += 1;
                    log_warn!(
                        provider = %call.manifest.id,
                        attempt = attempt,
                        delay_ms = delay_ms,
                        "Rate limited, sleeping before retry"
                    );
                    sleep(with_jitter(delay_ms)).await;
                }
                Err(AttemptError::Other(message)) => {
                    return Err(CoordinatorError::provider(&call.manifest.id, message));
                }
            }
        }
    }

    /// One streaming provider call; yields de-framed SSE data payloads.
    /// Chunk parsing belongs to the compat.
    pub async fn stream_provider(&self, call: &ProviderCall<'_>) -> CoordResult<RawChunkStream> {
        let mut payload = self.build_payload(call)?;
        if let Some(map) = payload.as_object_mut() {
            map.insert("stream".to_string(), Value::Bool(true));
        }

        if call.compat.has_direct_call() {
            return call
                .compat
                .stream_direct(&payload, &call.manifest.id, call.model)
                .await;
        }

        let (url, headers) = call.manifest.endpoint.stream_parts();
        let mut attempt = 0usize;
        let response = loop {
            let mut request = self.client.post(url).json(&payload);
            for (name, value) in headers {
                request = request.header(name, value);
            }
            let response = request.send().await.map_err(|err| {
                CoordinatorError::provider(&call.manifest.id, format!("stream request failed: {err}"))
            })?;

            let status = response.status();
            if status.is_success() {
                break response;
            }

            let body = response.text().await.unwrap_or_default();
            let rate_limited = status == reqwest::StatusCode::TOO_MANY_REQUESTS
                || contains_retry_word(&body, &call.manifest.retry_words);
            if rate_limited {
                if let Some(delay_ms) = call.retry_delays_ms.get(attempt).copied() {
                    attempt += 1;
                    sleep(with_jitter(delay_ms)).await;
                    continue;
                }
                return Err(CoordinatorError::provider_rate_limit(
                    &call.manifest.id,
                    format!("stream returned {status}: {body}"),
                ));
            }
            return Err(CoordinatorError::provider(
                &call.manifest.id,
                format!("stream returned {status}: {body}"),
            ));
        };

        let provider_id = call.manifest.id.clone();
        let bytes = response.bytes_stream();
        let stream = futures_util::stream::unfold(
            SseState {
                bytes: Box::pin(bytes),
                buffer: String::new(),
                ready: VecDeque::new(),
                provider_id,
            },
            |mut state| async move {
                loop {
                    if let Some(line) = state.ready.pop_front() {
                        return Some((Ok(line), state));
                    }
                    match state.bytes.next().await {
                        Some(Ok(chunk)) => {
                            state.buffer.push_str(&String::from_utf8_lossy(&chunk));
                            while let Some(pos) = state.buffer.find('\n') {
                                let line: String =
                                    state.buffer.drain(..=pos).collect::<String>();
                                let line = line.trim_end();
                                if let Some(data) = line.strip_prefix("data:") {
                                    state.ready.push_back(data.trim_start().to_string());
                                }
                            }
                        }
                        Some(Err(err)) => {
                            let failure = CoordinatorError::provider(
                                &state.provider_id,
                                format!("stream read failed: {err}"),
                            );
                            return Some((Err(failure), state));
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    fn build_payload(&self, call: &ProviderCall<'_>) -> CoordResult<Value> {
        let mut payload = call.compat.build_payload(
            call.model,
            call.settings,
            call.messages,
            call.tools,
            call.tool_choice,
        )?;

        let mut extras = call.extras.clone();
        apply_extensions(&mut payload, &call.manifest.payload_extensions, &mut extras)?;
        call.compat.apply_provider_extensions(&mut payload, &extras);

        log_debug!(
            provider = %call.manifest.id,
            model = call.model,
            extension_count = call.manifest.payload_extensions.len(),
            "Payload ready"
        );
        Ok(payload)
    }

    async fn post_once(
        &self,
        manifest: &ProviderManifest,
        url: &str,
        headers: &BTreeMap<String, String>,
        payload: &Value,
    ) -> Result<Value, AttemptError> {
        let mut request = self.client.post(url).json(payload);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|err| AttemptError::Other(format!("request failed: {err}")))?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptError::RateLimited(format!("429 from upstream: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if contains_retry_word(&body, &manifest.retry_words) {
                return Err(AttemptError::RateLimited(format!(
                    "rate-limit sentinel in {status} response: {body}"
                )));
            }
            return Err(AttemptError::Other(format!("upstream returned {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|err| AttemptError::Other(format!("unparseable response body: {err}")))
    }
}

struct SseState {
    bytes: Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    buffer: String,
    ready: VecDeque<String>,
    provider_id: String,
}

fn contains_retry_word(body: &str, retry_words: &[String]) -> bool {
    let lowered = body.to_lowercase();
    retry_words
        .iter()
        .any(|word| !word.is_empty() && lowered.contains(&word.to_lowercase()))
}

/// Up to 10% jitter to avoid thundering herds on shared limits.
fn with_jitter(delay_ms: u64) -> Duration {
    let jitter = fastrand::f64() * 0.1;
    Duration::from_secs_f64((delay_ms as f64 / 1000.0) * (1.0 + jitter))
}
