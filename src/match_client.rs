//! Client for the remote perceptual-hash matching service.

use crate::attachment_classifier::ImageRef;
use crate::config::PipelineConfig;
use crate::host::UploadStore;
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Image bytes resolved from upload storage for a single scan.
#[derive(Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub content_type: String,
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePayload")
            .field("content_type", &self.content_type)
            .field("filename", &self.filename)
            .field("bytes", &format_args!("<{} bytes>", self.bytes.len()))
            .finish()
    }
}

impl ImagePayload {
    pub fn base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MatchVerdict {
    #[serde(default)]
    pub status: MatchStatus,
    #[serde(default)]
    pub tracking_id: String,
    #[serde(default)]
    pub content_id: Option<String>,
    #[serde(default)]
    pub is_match: Option<bool>,
    #[serde(default)]
    pub match_details: Option<MatchDetails>,
    /// The payload that was submitted, kept for a follow-up report.
    #[serde(skip)]
    pub image_payload: Option<ImagePayload>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MatchStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MatchDetails {
    #[serde(default)]
    pub match_flags: Vec<MatchFlag>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MatchFlag {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub violations: Vec<String>,
    #[serde(default)]
    pub advanced_info: Vec<AdvancedInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AdvancedInfo {
    pub key: String,
    pub value: String,
}

impl MatchVerdict {
    /// Only an explicit `IsMatch: true` counts as a match.
    pub fn is_match(&self) -> bool {
        self.is_match == Some(true)
    }

    pub fn match_flags(&self) -> &[MatchFlag] {
        self.match_details
            .as_ref()
            .map(|d| d.match_flags.as_slice())
            .unwrap_or_default()
    }
}

impl MatchFlag {
    pub fn violation_set(&self) -> BTreeSet<&str> {
        self.violations.iter().map(String::as_str).collect()
    }

    pub fn advanced_info_map(&self) -> BTreeMap<&str, &str> {
        self.advanced_info
            .iter()
            .map(|info| (info.key.as_str(), info.value.as_str()))
            .collect()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct MatchRequest<'a> {
    data_representation: &'a str,
    value: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Matching service returned HTTP {0}")]
    Status(u16),
    #[error("Could not decode match response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait MatchService: Send + Sync {
    /// Returns `Ok(None)` when the scan cannot run (not configured, upload
    /// missing, empty response); errors are transport level only.
    async fn match_image(
        &self,
        config: &PipelineConfig,
        image: &ImageRef,
        uploads: &dyn UploadStore,
    ) -> Result<Option<MatchVerdict>, MatchError>;
}

pub struct MatchClient {
    client: Client,
}

impl MatchClient {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("csem-scanner/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {e}");
                Client::new()
            });

        Self { client }
    }

    async fn perform_match_operation(
        &self,
        url: &str,
        api_key: &str,
        payload: &ImagePayload,
    ) -> Result<Option<MatchVerdict>, MatchError> {
        let request = MatchRequest {
            data_representation: "inline",
            value: payload.base64(),
        };

        let response = self
            .client
            .post(url)
            .query(&[("enhance", "false")])
            .header(SUBSCRIPTION_KEY_HEADER, api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MatchError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            log::debug!("Matching service returned an empty body");
            return Ok(None);
        }

        let verdict: MatchVerdict = serde_json::from_slice(&body)?;
        log::debug!(
            "Match result: tracking id {}, status {} ({}), is_match {:?}",
            verdict.tracking_id,
            verdict.status.code,
            verdict.status.description,
            verdict.is_match
        );
        Ok(Some(verdict))
    }
}

impl Default for MatchClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl MatchService for MatchClient {
    async fn match_image(
        &self,
        config: &PipelineConfig,
        image: &ImageRef,
        uploads: &dyn UploadStore,
    ) -> Result<Option<MatchVerdict>, MatchError> {
        let Some(api_key) = config.api_key() else {
            log::warn!("No API key configured, skipping match operation");
            return Ok(None);
        };

        let Some(bytes) = uploads.buffer_by_id(&image.content_id).await else {
            log::warn!(
                "Could not load image buffer for image id {}",
                image.content_id
            );
            return Ok(None);
        };

        let payload = ImagePayload {
            content_type: image.mime_type.clone(),
            filename: image.filename.clone(),
            bytes,
        };

        let verdict = self
            .perform_match_operation(&config.match_url, api_key, &payload)
            .await?;
        Ok(verdict.map(|mut verdict| {
            verdict.image_payload = Some(payload);
            verdict
        }))
    }
}
