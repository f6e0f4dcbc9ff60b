pub mod credentials;
pub mod roz_config;
pub mod varys;

pub use credentials::{AwsCredential, SiteCredentials};
pub use roz_config::{BucketConfig, ExtensionSpec, Permission, PlatformSpec, ProjectConfig, RozConfig};
pub use varys::{VarysConfig, VarysProfile};

use crate::utils::error::{Result, RozError};
use crate::utils::validation::{validate_positive_number, validate_url, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_S3_ENDPOINT: &str = "https://s3.climb.ac.uk";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Shared-credentials profile used when no key pair is configured.
    pub profile: Option<String>,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_S3_ENDPOINT.to_string(),
            region: "s3".to_string(),
            access_key_id: None,
            secret_access_key: None,
            profile: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnyxSettings {
    pub domain: Option<String>,
    pub username: String,
    pub password: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for OnyxSettings {
    fn default() -> Self {
        Self {
            domain: None,
            username: "roz".to_string(),
            password: None,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathogenwatchSettings {
    pub endpoint_url: Option<String>,
    pub api_key: Option<String>,
    pub collection_id: u64,
}

impl Default for PathogenwatchSettings {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            api_key: None,
            collection_id: 41,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackSettings {
    pub new_artifact_webhook: Option<String>,
    pub public_result_webhook: Option<String>,
    pub mscape_alert_webhook: Option<String>,
    pub hcid_webhook: Option<String>,
    pub pathsafe_alert_webhook: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub notifications: Option<PathBuf>,
    pub matcher: Option<PathBuf>,
    pub ingest: Option<PathBuf>,
    pub validation: Option<PathBuf>,
}

/// Runtime settings: optional TOML file first, environment variables on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub roz_config: Option<PathBuf>,
    pub varys_config: Option<PathBuf>,
    pub varys_profile: String,
    pub log_level: String,
    pub s3: S3Settings,
    pub onyx: OnyxSettings,
    pub pathogenwatch: PathogenwatchSettings,
    pub slack: SlackSettings,
    pub logs: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            roz_config: None,
            varys_config: None,
            varys_profile: varys::DEFAULT_PROFILE.to_string(),
            log_level: "INFO".to_string(),
            s3: S3Settings::default(),
            onyx: OnyxSettings::default(),
            pathogenwatch: PathogenwatchSettings::default(),
            slack: SlackSettings::default(),
            logs: LogSettings::default(),
        }
    }
}

impl Settings {
    /// 載入設定：TOML 檔案 (可選) + 環境變數覆蓋
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok().filter(|v| !v.is_empty()));
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed = substitute_env_vars(content)?;
        Ok(toml::from_str(&processed)?)
    }

    /// Environment names are the ones used by the deployment env files.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = |name: &str| lookup(name).map(PathBuf::from);

        if let Some(v) = path("ROZ_CONFIG_JSON") {
            self.roz_config = Some(v);
        }
        if let Some(v) = path("VARYS_CFG") {
            self.varys_config = Some(v);
        }
        if let Some(v) = lookup("INGEST_LOG_LEVEL") {
            self.log_level = v;
        }

        if let Some(v) = lookup("AWS_ENDPOINT_URL") {
            self.s3.endpoint_url = v;
        }
        if let Some(v) = lookup("AWS_ACCESS_KEY_ID") {
            self.s3.access_key_id = Some(v);
        }
        if let Some(v) = lookup("AWS_SECRET_ACCESS_KEY") {
            self.s3.secret_access_key = Some(v);
        }
        if let Some(v) = lookup("AWS_PROFILE") {
            self.s3.profile = Some(v);
        }

        if let Some(v) = lookup("ONYX_DOMAIN") {
            self.onyx.domain = Some(v);
        }
        if let Some(v) = lookup("ONYX_USERNAME") {
            self.onyx.username = v;
        }
        if let Some(v) = lookup("ONYX_ROZ_PASSWORD") {
            self.onyx.password = Some(v);
        }

        if let Some(v) = lookup("PATHOGENWATCH_ENDPOINT_URL") {
            self.pathogenwatch.endpoint_url = Some(v);
        }
        if let Some(v) = lookup("PATHOGENWATCH_API_KEY") {
            self.pathogenwatch.api_key = Some(v);
        }

        if let Some(v) = lookup("NEW_ARTIFACT_WEBHOOK") {
            self.slack.new_artifact_webhook = Some(v);
        }
        if let Some(v) = lookup("PUBLIC_RESULT_WEBHOOK") {
            self.slack.public_result_webhook = Some(v);
        }
        if let Some(v) = lookup("MSCAPE_ALERT_WEBHOOK") {
            self.slack.mscape_alert_webhook = Some(v);
        }
        if let Some(v) = lookup("HCID_WEBHOOK") {
            self.slack.hcid_webhook = Some(v);
        }
        if let Some(v) = lookup("PATHSAFE_ALERT_WEBHOOK") {
            self.slack.pathsafe_alert_webhook = Some(v);
        }

        if let Some(v) = path("S3_NOTIFICATIONS_LOG") {
            self.logs.notifications = Some(v);
        }
        if let Some(v) = path("S3_MATCHER_LOG") {
            self.logs.matcher = Some(v);
        }
        if let Some(v) = path("ROZ_INGEST_LOG") {
            self.logs.ingest = Some(v.clone());
            if self.logs.validation.is_none() {
                self.logs.validation = Some(v);
            }
        }
    }

    pub fn roz_config_path(&self) -> Result<&Path> {
        required("ROZ_CONFIG_JSON", &self.roz_config).map(PathBuf::as_path)
    }

    pub fn varys_config_path(&self) -> Result<&Path> {
        required("VARYS_CFG", &self.varys_config).map(PathBuf::as_path)
    }

    pub fn load_roz_config(&self) -> Result<RozConfig> {
        RozConfig::from_file(self.roz_config_path()?)
    }

    pub fn amqp_uri(&self) -> Result<String> {
        let varys = VarysConfig::from_file(self.varys_config_path()?)?;
        varys.profile(&self.varys_profile)?.amqp_uri()
    }

    pub fn onyx_domain(&self) -> Result<&str> {
        required("ONYX_DOMAIN", &self.onyx.domain).map(String::as_str)
    }

    pub fn onyx_password(&self) -> Result<&str> {
        required("ONYX_ROZ_PASSWORD", &self.onyx.password).map(String::as_str)
    }

    /// Key pair for the default S3 client; `None` falls back to the profile chain.
    pub fn s3_key_pair(&self) -> Option<(&str, &str)> {
        match (&self.s3.access_key_id, &self.s3.secret_access_key) {
            (Some(id), Some(secret)) => Some((id.as_str(), secret.as_str())),
            _ => None,
        }
    }

    pub fn pathogenwatch_endpoint(&self) -> Result<&str> {
        required("PATHOGENWATCH_ENDPOINT_URL", &self.pathogenwatch.endpoint_url).map(String::as_str)
    }

    pub fn pathogenwatch_api_key(&self) -> Result<&str> {
        required("PATHOGENWATCH_API_KEY", &self.pathogenwatch.api_key).map(String::as_str)
    }
}

fn required<'a, T>(name: &str, value: &'a Option<T>) -> Result<&'a T> {
    crate::utils::validation::validate_required_field(name, value)
}

/// 替換環境變數 (例如 ${ONYX_DOMAIN})
fn substitute_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| RozError::config(format!("invalid substitution pattern: {}", e)))?;

    let result = re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
    });

    Ok(result.to_string())
}

impl Validate for Settings {
    fn validate(&self) -> Result<()> {
        validate_url("s3.endpoint_url", &self.s3.endpoint_url)?;

        if let Some(domain) = &self.onyx.domain {
            validate_url("onyx.domain", domain)?;
        }
        if let Some(endpoint) = &self.pathogenwatch.endpoint_url {
            validate_url("pathogenwatch.endpoint_url", endpoint)?;
        }

        let webhooks = [
            ("slack.new_artifact_webhook", &self.slack.new_artifact_webhook),
            ("slack.public_result_webhook", &self.slack.public_result_webhook),
            ("slack.mscape_alert_webhook", &self.slack.mscape_alert_webhook),
            ("slack.hcid_webhook", &self.slack.hcid_webhook),
            ("slack.pathsafe_alert_webhook", &self.slack.pathsafe_alert_webhook),
        ];
        for (field, url) in webhooks {
            if let Some(url) = url {
                validate_url(field, url)?;
            }
        }

        validate_positive_number("onyx.timeout_seconds", self.onyx.timeout_seconds as usize, 1)?;

        if self.s3.access_key_id.is_some() != self.s3.secret_access_key.is_some() {
            return Err(RozError::config(
                "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be provided together",
            ));
        }

        tracing::debug!("✅ 設定驗證通過");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.s3.endpoint_url, DEFAULT_S3_ENDPOINT);
        assert_eq!(settings.varys_profile, "roz");
        assert_eq!(settings.pathogenwatch.collection_id, 41);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_toml() {
        let mut settings = Settings::from_toml_str(
            r#"
            log_level = "WARNING"

            [onyx]
            domain = "https://onyx.example.com"
            username = "roz-test"
            "#,
        )
        .unwrap();

        settings.apply_env(env(&[
            ("ONYX_DOMAIN", "https://onyx.internal"),
            ("ONYX_ROZ_PASSWORD", "secret"),
            ("ROZ_CONFIG_JSON", "/etc/roz/config.json"),
            ("ROZ_INGEST_LOG", "/var/log/roz/ingest.log"),
        ]));

        assert_eq!(settings.log_level, "WARNING");
        assert_eq!(settings.onyx.username, "roz-test");
        assert_eq!(settings.onyx_domain().unwrap(), "https://onyx.internal");
        assert_eq!(settings.onyx_password().unwrap(), "secret");
        assert_eq!(
            settings.roz_config_path().unwrap(),
            Path::new("/etc/roz/config.json")
        );
        assert_eq!(
            settings.logs.validation.as_deref(),
            Some(Path::new("/var/log/roz/ingest.log"))
        );
    }

    #[test]
    fn test_missing_values_reported_by_name() {
        let settings = Settings::default();
        match settings.varys_config_path() {
            Err(RozError::MissingConfigError { field }) => assert_eq!(field, "VARYS_CFG"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(settings.onyx_password().unwrap_err().exit_code(), 3);
    }

    #[test]
    fn test_half_key_pair_rejected() {
        let mut settings = Settings::default();
        settings.apply_env(env(&[("AWS_ACCESS_KEY_ID", "abc")]));
        assert!(settings.validate().is_err());
        assert!(settings.s3_key_pair().is_none());
    }

    #[test]
    fn test_invalid_webhook_rejected() {
        let mut settings = Settings::default();
        settings.slack.hcid_webhook = Some("not a url".to_string());
        assert!(settings.validate().is_err());
    }
}
