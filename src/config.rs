use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};

pub const SETTING_API_KEY: &str = "api-key";
pub const SETTING_QUARANTINE_TARGET_ROOM: &str = "quarantine-target-room";
pub const SETTING_LIMIT_ANALYSIS_TO_ROOMS: &str = "limit-analysis-to-rooms-csv";
pub const SETTING_ENABLE_AUTOMATED_REPORT: &str = "enable-automated-report";
pub const SETTING_ASYNCHRONOUS_VALIDATION: &str = "asynchronous-validation";
pub const SETTING_REPORT_TEST_MODE: &str = "report-test-mode";
pub const SETTING_NCMEC_ORGNAME: &str = "ncmec-orgname";
pub const SETTING_NCMEC_REPORTER_NAME: &str = "ncmec-reporter-name";
pub const SETTING_NCMEC_REPORTER_EMAIL: &str = "ncmec-reporter-email";
pub const SETTING_NCMEC_USER: &str = "ncmec-user";
pub const SETTING_NCMEC_PASSWORD: &str = "ncmec-password";

pub const DEFAULT_MATCH_URL: &str = "https://api.microsoftmoderator.com/photodna/v1.0/Match";
pub const DEFAULT_REPORT_URL: &str = "https://api.microsoftmoderator.com/photodna/v1.0/Report";

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PipelineConfig {
    pub api_key: Option<String>,
    pub quarantine_target_room: Option<String>,
    pub limit_analysis_to_rooms_csv: String,
    pub enable_automated_report: bool,
    pub asynchronous_validation: bool,
    pub report_test_mode: bool,
    #[serde(flatten)]
    pub ncmec: NcmecCredentials,
    pub match_url: String,
    pub report_url: String,
    pub request_timeout_seconds: u64,
    pub statistics: Option<StatisticsConfig>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NcmecCredentials {
    #[serde(rename = "ncmec-orgname")]
    pub org_name: String,
    #[serde(rename = "ncmec-reporter-name")]
    pub reporter_name: String,
    #[serde(rename = "ncmec-reporter-email")]
    pub reporter_email: String,
    #[serde(rename = "ncmec-user")]
    pub user: Option<String>,
    #[serde(rename = "ncmec-password")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatisticsConfig {
    pub enabled: bool,
    pub database_path: String,
    pub flush_interval_seconds: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            api_key: None,
            quarantine_target_room: Some("csem-quarantine".to_string()),
            limit_analysis_to_rooms_csv: String::new(),
            enable_automated_report: false,
            asynchronous_validation: false,
            report_test_mode: true,
            ncmec: NcmecCredentials::default(),
            match_url: DEFAULT_MATCH_URL.to_string(),
            report_url: DEFAULT_REPORT_URL.to_string(),
            request_timeout_seconds: 30,
            statistics: None,
        }
    }
}

impl Default for NcmecCredentials {
    fn default() -> Self {
        NcmecCredentials {
            org_name: "TestOrg".to_string(),
            reporter_name: "ReporterName".to_string(),
            reporter_email: "test@example.org".to_string(),
            user: None,
            password: None,
        }
    }
}

// Credentials stay out of log output.
impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("api_key", &redact(self.api_key()))
            .field("quarantine_target_room", &self.quarantine_target_room())
            .field(
                "limit_analysis_to_rooms_csv",
                &self.limit_analysis_to_rooms_csv,
            )
            .field("enable_automated_report", &self.enable_automated_report)
            .field("asynchronous_validation", &self.asynchronous_validation)
            .field("report_test_mode", &self.report_test_mode)
            .field("ncmec", &self.ncmec)
            .field("match_url", &self.match_url)
            .field("report_url", &self.report_url)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field("statistics", &self.statistics)
            .finish()
    }
}

impl fmt::Debug for NcmecCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NcmecCredentials")
            .field("org_name", &self.org_name)
            .field("reporter_name", &self.reporter_name)
            .field("reporter_email", &self.reporter_email)
            .field("user", &self.user())
            .field("password", &redact(self.password()))
            .finish()
    }
}

fn redact(secret: Option<&str>) -> Option<&'static str> {
    secret.map(|_| "<redacted>")
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.as_str()).filter(|s| !s.trim().is_empty())
}

impl PipelineConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn api_key(&self) -> Option<&str> {
        non_empty(self.api_key.as_ref())
    }

    pub fn quarantine_target_room(&self) -> Option<&str> {
        non_empty(self.quarantine_target_room.as_ref())
    }

    /// API key, reporting user and password, when all three are set.
    pub fn reporting_credentials(&self) -> Option<(&str, &str, &str)> {
        Some((self.api_key()?, self.ncmec.user()?, self.ncmec.password()?))
    }
}

impl NcmecCredentials {
    pub fn user(&self) -> Option<&str> {
        non_empty(self.user.as_ref())
    }

    pub fn password(&self) -> Option<&str> {
        non_empty(self.password.as_ref())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown setting: {0}")]
    UnknownSetting(String),
    #[error("Setting {key} expects a boolean, got '{value}'")]
    InvalidBool { key: String, value: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Live configuration shared by every hook invocation.
///
/// Readers take a snapshot `Arc` and keep it for the whole invocation.
/// Updates replace one field at a time by swapping in a modified copy, so
/// a snapshot never changes underneath its reader.
#[derive(Debug)]
pub struct SettingsStore {
    current: RwLock<Arc<PipelineConfig>>,
}

impl SettingsStore {
    pub fn new(config: PipelineConfig) -> Self {
        SettingsStore {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<PipelineConfig> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Applies a host setting change. The value is parsed for the key's
    /// type before anything is written.
    pub fn apply_setting(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let update = SettingUpdate::parse(key, value)?;

        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = PipelineConfig::clone(&current);
        update.apply_to(&mut next);
        *current = Arc::new(next);

        log::debug!("Setting '{key}' updated");
        Ok(())
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

enum SettingUpdate {
    ApiKey(Option<String>),
    QuarantineTargetRoom(Option<String>),
    LimitAnalysisToRooms(String),
    EnableAutomatedReport(bool),
    AsynchronousValidation(bool),
    ReportTestMode(bool),
    OrgName(String),
    ReporterName(String),
    ReporterEmail(String),
    NcmecUser(Option<String>),
    NcmecPassword(Option<String>),
}

impl SettingUpdate {
    fn parse(key: &str, value: &str) -> Result<Self, ConfigError> {
        let optional = || {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        };
        let flag = || parse_bool(key, value);

        let update = match key {
            SETTING_API_KEY => SettingUpdate::ApiKey(optional()),
            SETTING_QUARANTINE_TARGET_ROOM => SettingUpdate::QuarantineTargetRoom(optional()),
            SETTING_LIMIT_ANALYSIS_TO_ROOMS => {
                SettingUpdate::LimitAnalysisToRooms(value.to_string())
            }
            SETTING_ENABLE_AUTOMATED_REPORT => SettingUpdate::EnableAutomatedReport(flag()?),
            SETTING_ASYNCHRONOUS_VALIDATION => SettingUpdate::AsynchronousValidation(flag()?),
            SETTING_REPORT_TEST_MODE => SettingUpdate::ReportTestMode(flag()?),
            SETTING_NCMEC_ORGNAME => SettingUpdate::OrgName(value.to_string()),
            SETTING_NCMEC_REPORTER_NAME => SettingUpdate::ReporterName(value.to_string()),
            SETTING_NCMEC_REPORTER_EMAIL => SettingUpdate::ReporterEmail(value.to_string()),
            SETTING_NCMEC_USER => SettingUpdate::NcmecUser(optional()),
            SETTING_NCMEC_PASSWORD => SettingUpdate::NcmecPassword(optional()),
            other => return Err(ConfigError::UnknownSetting(other.to_string())),
        };
        Ok(update)
    }

    fn apply_to(self, config: &mut PipelineConfig) {
        match self {
            SettingUpdate::ApiKey(v) => config.api_key = v,
            SettingUpdate::QuarantineTargetRoom(v) => config.quarantine_target_room = v,
            SettingUpdate::LimitAnalysisToRooms(v) => config.limit_analysis_to_rooms_csv = v,
            SettingUpdate::EnableAutomatedReport(v) => config.enable_automated_report = v,
            SettingUpdate::AsynchronousValidation(v) => config.asynchronous_validation = v,
            SettingUpdate::ReportTestMode(v) => config.report_test_mode = v,
            SettingUpdate::OrgName(v) => config.ncmec.org_name = v,
            SettingUpdate::ReporterName(v) => config.ncmec.reporter_name = v,
            SettingUpdate::ReporterEmail(v) => config.ncmec.reporter_email = v,
            SettingUpdate::NcmecUser(v) => config.ncmec.user = v,
            SettingUpdate::NcmecPassword(v) => config.ncmec.password = v,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
