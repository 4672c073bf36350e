//! Image generation job runner.
//!
//! Wraps an OpenAI-compatible `/images/generations` endpoint using
//! [`reqwest`]. The runner is a trait so the queue and tests never depend
//! on a live provider.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::models::generation::{GeneratedImage, GenerationRequest};

/// Errors from a single generation attempt.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("Image service unreachable: {0}")]
    Request(#[from] reqwest::Error),

    /// The provider returned a non-2xx status code.
    #[error("Image service error ({status}): {message}")]
    Provider {
        /// HTTP status code.
        status: u16,
        /// Provider's error message, or the raw body.
        message: String,
    },

    /// The provider answered 2xx but without a usable image.
    #[error("Image service returned no image")]
    EmptyResponse,

    /// The image payload was not valid base64.
    #[error("Image payload could not be decoded: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// Executes one generation and resolves to an image or an error.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, request: &GenerationRequest) -> Result<GeneratedImage, JobError>;
}

#[derive(Debug, Serialize)]
struct ImagesRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    size: &'a str,
    quality: &'a str,
    n: u8,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    reference_image_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    error: ProviderErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorDetail {
    message: String,
}

/// Job runner backed by an HTTP image API.
pub struct HttpJobRunner {
    client: reqwest::Client,
    api_url: String,
}

impl HttpJobRunner {
    /// Creates a new runner.
    ///
    /// # Arguments
    ///
    /// * `api_url` - Base URL, e.g. `https://api.openai.com/v1`.
    /// * `timeout` - Upper bound for one generation request.
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, JobError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Creates a runner reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/images/generations", self.api_url)
    }
}

#[async_trait]
impl JobRunner for HttpJobRunner {
    async fn run(&self, request: &GenerationRequest) -> Result<GeneratedImage, JobError> {
        let body = ImagesRequest {
            model: &request.params.model,
            prompt: &request.prompt,
            size: request.params.size.as_str(),
            quality: request.params.quality.as_str(),
            n: request.params.count,
            reference_image_ids: &request.reference_image_ids,
        };

        tracing::debug!(
            "Requesting image for session {} (model {}, key {})",
            request.session_id,
            request.params.model,
            request.credential
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(request.credential.expose())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            return Err(JobError::Provider {
                status: status.as_u16(),
                message: provider_message(&raw),
            });
        }

        let parsed: ImagesResponse = response.json().await?;
        decode_first_image(parsed)
    }
}

/// Extracts `error.message` from a provider error body, falling back to the raw text.
fn provider_message(raw: &str) -> String {
    sonic_rs::from_str::<ProviderErrorBody>(raw)
        .map(|body| body.error.message)
        .unwrap_or_else(|_| raw.chars().take(500).collect())
}

fn decode_first_image(response: ImagesResponse) -> Result<GeneratedImage, JobError> {
    let encoded = response
        .data
        .into_iter()
        .find_map(|datum| datum.b64_json)
        .ok_or(JobError::EmptyResponse)?;

    let bytes = general_purpose::STANDARD.decode(encoded.as_bytes())?;
    if bytes.is_empty() {
        return Err(JobError::EmptyResponse);
    }
    Ok(GeneratedImage::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_message_is_extracted() {
        let raw = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#;
        assert_eq!(provider_message(raw), "Incorrect API key provided");
        assert_eq!(provider_message("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn first_image_is_decoded() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        let response = ImagesResponse {
            data: vec![
                ImageDatum { b64_json: None },
                ImageDatum {
                    b64_json: Some(general_purpose::STANDARD.encode(png)),
                },
            ],
        };

        let image = decode_first_image(response).unwrap();
        assert_eq!(image.bytes.as_slice(), &png);
        assert_eq!(image.mime_type, "image/png");
    }

    #[test]
    fn missing_or_invalid_payloads_fail() {
        assert!(matches!(
            decode_first_image(ImagesResponse { data: vec![] }),
            Err(JobError::EmptyResponse)
        ));
        assert!(matches!(
            decode_first_image(ImagesResponse {
                data: vec![ImageDatum {
                    b64_json: Some("not base64!".to_string())
                }]
            }),
            Err(JobError::Decode(_))
        ));
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        let runner = HttpJobRunner::with_client(reqwest::Client::new(), "http://localhost:9000/v1/");
        assert_eq!(runner.endpoint(), "http://localhost:9000/v1/images/generations");
    }

    #[test]
    fn request_body_omits_empty_references() {
        let body = ImagesRequest {
            model: "gpt-image-1",
            prompt: "a fox",
            size: "1024x1024",
            quality: "auto",
            n: 1,
            reference_image_ids: &[],
        };
        let json = sonic_rs::to_string(&body).unwrap();
        assert!(!json.contains("reference_image_ids"));
        assert!(json.contains(r#""n":1"#));
    }
}
