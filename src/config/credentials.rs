use crate::utils::error::{Result, RozError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsCredential {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub username: String,
}

// 避免在日誌中洩漏密鑰
impl fmt::Debug for AwsCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredential")
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field("aws_secret_access_key", &"***")
            .field("username", &self.username)
            .finish()
    }
}

/// Controller credentials file: `{"admin": cred, project: {site: cred}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteCredentials {
    pub admin: AwsCredential,
    #[serde(flatten)]
    pub projects: BTreeMap<String, BTreeMap<String, AwsCredential>>,
}

impl SiteCredentials {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| {
            RozError::config(format!("AWS credentials file could not be parsed: {}", e))
        })
    }

    pub fn site(&self, project: &str, site: &str) -> Result<&AwsCredential> {
        self.projects
            .get(project)
            .and_then(|sites| sites.get(site))
            .ok_or_else(|| RozError::MissingConfigError {
                field: format!("credentials for {}.{}", project, site),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_site_credentials() {
        let creds = SiteCredentials::from_json_str(
            r#"{
                "admin": {"aws_access_key_id": "a", "aws_secret_access_key": "b", "username": "admin"},
                "mscapetest": {
                    "birm": {"aws_access_key_id": "c", "aws_secret_access_key": "d", "username": "mscapetest-birm"}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(creds.admin.username, "admin");
        assert_eq!(creds.site("mscapetest", "birm").unwrap().aws_access_key_id, "c");
        assert!(creds.site("mscapetest", "bath").is_err());
        assert!(!format!("{:?}", creds.admin).contains("\"b\""));
    }
}
