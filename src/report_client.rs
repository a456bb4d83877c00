use crate::config::PipelineConfig;
use crate::host::Message;
use crate::match_client::{MatchVerdict, SUBSCRIPTION_KEY_HEADER};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

pub const REPORT_USER_HEADER: &str = "x-usr";
pub const REPORT_PASSWORD_HEADER: &str = "x-pwd";

const PLACEHOLDER_IP_ADDRESS: &str = "127.0.0.1";
const MISSING_FILE_NAME: &str = "noFileName";
const MISSING_IMAGE_DATA: &str = "noImageData";

/// Violation report submitted to the clearinghouse.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ViolationReport {
    pub org_name: String,
    pub reporter_name: String,
    pub reporter_email: String,
    pub incident_time: String,
    pub reportee_name: String,
    #[serde(rename = "ReporteeIPAddress")]
    pub reportee_ip_address: String,
    pub violation_content_collection: Vec<ViolationContent>,
    pub additional_metadata: Vec<MetadataEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ViolationContent {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
}

/// What the reporting service answered. Only logged.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportOutcome {
    pub status: u16,
    pub body: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Reporting service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait ReportService: Send + Sync {
    /// Best effort. `None` when reporting is not configured or failed.
    async fn report(
        &self,
        config: &PipelineConfig,
        verdict: &MatchVerdict,
        message: &Message,
    ) -> Option<ReportOutcome>;
}

pub struct ReportClient {
    client: Client,
}

impl ReportClient {
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

    pub fn build_report(
        config: &PipelineConfig,
        verdict: &MatchVerdict,
        message: &Message,
    ) -> ViolationReport {
        let (name, value) = match &verdict.image_payload {
            Some(payload) => (
                payload
                    .filename
                    .clone()
                    .unwrap_or_else(|| MISSING_FILE_NAME.to_string()),
                payload.base64(),
            ),
            None => (MISSING_FILE_NAME.to_string(), MISSING_IMAGE_DATA.to_string()),
        };

        let mut additional_metadata = Vec::new();
        if config.report_test_mode {
            additional_metadata.push(MetadataEntry {
                key: "IsTest".to_string(),
                value: "true".to_string(),
            });
        }

        ViolationReport {
            org_name: config.ncmec.org_name.clone(),
            reporter_name: config.ncmec.reporter_name.clone(),
            reporter_email: config.ncmec.reporter_email.clone(),
            incident_time: message
                .created_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            reportee_name: message.sender.username.clone(),
            reportee_ip_address: PLACEHOLDER_IP_ADDRESS.to_string(),
            violation_content_collection: vec![ViolationContent { name, value }],
            additional_metadata,
        }
    }

    async fn submit(
        &self,
        config: &PipelineConfig,
        credentials: (&str, &str, &str),
        report: &ViolationReport,
    ) -> Result<ReportOutcome, ReportError> {
        let (api_key, user, password) = credentials;

        let response = self
            .client
            .post(&config.report_url)
            .header(SUBSCRIPTION_KEY_HEADER, api_key)
            .header(REPORT_USER_HEADER, user)
            .header(REPORT_PASSWORD_HEADER, password)
            .json(report)
            .send()
            .await?;

        let status = response.status().as_u16();
        let success = response.status().is_success();
        let text = response.text().await?;
        if !success {
            return Err(ReportError::Status { status, body: text });
        }

        let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        Ok(ReportOutcome { status, body })
    }
}

impl Default for ReportClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl ReportService for ReportClient {
    async fn report(
        &self,
        config: &PipelineConfig,
        verdict: &MatchVerdict,
        message: &Message,
    ) -> Option<ReportOutcome> {
        let Some(credentials) = config.reporting_credentials() else {
            log::warn!("Reporting credentials incomplete, skipping violation report");
            return None;
        };

        let report = Self::build_report(config, verdict, message);
        if report.violation_content_collection[0].value == MISSING_IMAGE_DATA {
            log::warn!(
                "Reporting message {} without image data (tracking id {})",
                message.id,
                verdict.tracking_id
            );
        }

        match self.submit(config, credentials, &report).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                log::error!("Violation report for message {} failed: {e}", message.id);
                None
            }
        }
    }
}
