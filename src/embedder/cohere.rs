//! Cohere-based embedding client implementation.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{EmbedRequest, EmbeddingService, ServiceError, Truncate};
use crate::error::{PipelineError, Result};

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://api.cohere.ai/v1";

/// Blocking embeddings client for the Cohere `embed` endpoint.
#[derive(Clone)]
pub struct CohereEmbedder {
    client: Client,
    endpoint: String,
    input_type: Option<String>,
}

impl CohereEmbedder {
    /// Builds a new Cohere embeddings client.
    ///
    /// `input_type` is required by v3 models (`clustering` suits this
    /// pipeline) and omitted from requests when `None`.
    pub fn new(
        api_key: &str,
        base_url: &str,
        input_type: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(PipelineError::invalid_parameter("api_key", "missing Cohere API key"));
        }
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).map_err(|_| {
                PipelineError::invalid_parameter("api_key", "invalid Cohere API key")
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| {
                PipelineError::invalid_parameter(
                    "http_client",
                    format!("failed to build client: {err}"),
                )
            })?;
        let endpoint = format!("{}/embed", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            input_type: input_type.filter(|value| !value.trim().is_empty()),
        })
    }

    /// Endpoint receiving embed requests.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl EmbeddingService for CohereEmbedder {
    fn embed(
        &self,
        request: &EmbedRequest<'_>,
    ) -> std::result::Result<Vec<Vec<f32>>, ServiceError> {
        if request.texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = CohereRequest {
            texts: request.texts,
            model: request.model,
            truncate: request.truncate,
            input_type: self.input_type.as_deref(),
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|err| classify_transport(&err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            let message = format!("Cohere embed request failed ({status}): {body}");
            return Err(if is_transient_status(status) {
                ServiceError::transient(message)
            } else {
                ServiceError::fatal(message)
            });
        }

        let parsed: CohereResponse = response
            .json()
            .map_err(|err| ServiceError::fatal(format!("failed to parse Cohere response: {err}")))?;
        Ok(parsed.embeddings)
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn classify_transport(err: &reqwest::Error) -> ServiceError {
    let message = format!("Cohere embed request failed: {err}");
    if err.is_timeout() || err.is_connect() {
        ServiceError::transient(message)
    } else {
        ServiceError::fatal(message)
    }
}

#[derive(Serialize)]
struct CohereRequest<'a> {
    #[serde(borrow)]
    texts: &'a [&'a str],
    model: &'a str,
    truncate: Truncate,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_type: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CohereResponse {
    embeddings: Vec<Vec<f32>>,
}
