use crate::utils::error::{Result, RozError};
use crate::utils::validation::{validate_non_empty_string, Validate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Bucket permission as used in `bucket_policies`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    List,
    Get,
    Put,
    Delete,
    PutPolicy,
    DeletePolicy,
    GetPolicy,
}

impl Permission {
    /// Probe order used when auditing a bucket.
    pub const ALL: [Permission; 7] = [
        Permission::List,
        Permission::Get,
        Permission::Delete,
        Permission::Put,
        Permission::PutPolicy,
        Permission::DeletePolicy,
        Permission::GetPolicy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::List => "list",
            Permission::Get => "get",
            Permission::Put => "put",
            Permission::Delete => "delete",
            Permission::PutPolicy => "put_policy",
            Permission::DeletePolicy => "delete_policy",
            Permission::GetPolicy => "get_policy",
        }
    }

    /// S3 action a bucket policy grants for this permission.
    pub fn s3_action(&self) -> &'static str {
        match self {
            Permission::List => "s3:ListBucket",
            Permission::Get => "s3:GetObject",
            Permission::Put => "s3:PutObject",
            Permission::Delete => "s3:DeleteObject",
            Permission::PutPolicy => "s3:PutBucketPolicy",
            Permission::DeletePolicy => "s3:DeleteBucketPolicy",
            Permission::GetPolicy => "s3:GetBucketPolicy",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub name_layout: String,
    pub policy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionSpec {
    pub layout: String,
    pub sections: usize,
}

impl ExtensionSpec {
    pub fn layout_fields(&self) -> Vec<&str> {
        self.layout.split('.').collect()
    }
}

/// Files expected for one platform, keyed by extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformSpec {
    pub files: Vec<String>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, ExtensionSpec>,
}

impl PlatformSpec {
    /// Listed extension `fname` ends with; the longest one wins.
    pub fn match_extension(&self, fname: &str) -> Option<&str> {
        self.files
            .iter()
            .filter(|ext| fname.ends_with(ext.as_str()))
            .max_by_key(|ext| ext.len())
            .map(String::as_str)
    }

    pub fn extension(&self, ext: &str) -> Option<&ExtensionSpec> {
        self.extensions.get(ext)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub artifact_layout: String,
    pub sites: Vec<String>,
    #[serde(default)]
    pub bucket_policies: BTreeMap<String, Vec<Permission>>,
    #[serde(default)]
    pub site_buckets: BTreeMap<String, BucketConfig>,
    #[serde(default)]
    pub project_buckets: BTreeMap<String, BucketConfig>,
    pub file_specs: BTreeMap<String, PlatformSpec>,
}

impl ProjectConfig {
    pub fn platform(&self, platform: &str) -> Option<&PlatformSpec> {
        self.file_specs.get(platform)
    }

    pub fn artifact_fields(&self) -> Vec<&str> {
        self.artifact_layout.split('.').collect()
    }

    pub fn policy(&self, name: &str) -> Option<&[Permission]> {
        self.bucket_policies.get(name).map(Vec::as_slice)
    }

    pub fn has_site(&self, site: &str) -> bool {
        self.sites.iter().any(|s| s == site)
    }
}

/// Contents of `ROZ_CONFIG_JSON`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RozConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub pathogen_configs: Vec<String>,
    pub configs: BTreeMap<String, ProjectConfig>,
}

impl RozConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&content)?;
        tracing::debug!(path = %path.as_ref().display(), projects = config.configs.len(), "📋 載入 roz 配置");
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: RozConfig = serde_json::from_str(content).map_err(|e| {
            RozError::config(format!(
                "roz configuration JSON could not be parsed, ensure it is valid JSON: {}",
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn project(&self, project: &str) -> Option<&ProjectConfig> {
        self.configs.get(project)
    }

    pub fn platform(&self, project: &str, platform: &str) -> Option<&PlatformSpec> {
        self.project(project).and_then(|p| p.platform(platform))
    }
}

impl Validate for RozConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |field: String, value: &str, reason: String| RozError::InvalidConfigValueError {
            field,
            value: value.to_string(),
            reason,
        };

        for (project, config) in &self.configs {
            validate_non_empty_string(&format!("configs.{}.artifact_layout", project), &config.artifact_layout)?;

            if config.sites.is_empty() {
                return Err(invalid(
                    format!("configs.{}.sites", project),
                    "",
                    "at least one site is required".to_string(),
                ));
            }

            for (platform, spec) in &config.file_specs {
                if spec.files.is_empty() {
                    return Err(invalid(
                        format!("configs.{}.file_specs.{}.files", project, platform),
                        "",
                        "at least one file extension is required".to_string(),
                    ));
                }

                for ext in &spec.files {
                    let field = format!("configs.{}.file_specs.{}.{}", project, platform, ext);
                    let ext_spec = spec.extension(ext).ok_or_else(|| {
                        invalid(field.clone(), ext, "listed file has no layout entry".to_string())
                    })?;

                    let fields = ext_spec.layout_fields().len();
                    if fields != ext_spec.sections {
                        return Err(invalid(
                            field,
                            &ext_spec.layout,
                            format!(
                                "layout has {} sections but sections is {}",
                                fields, ext_spec.sections
                            ),
                        ));
                    }
                }
            }

            let buckets = config
                .site_buckets
                .iter()
                .map(|(kind, b)| ("site_buckets", kind, b))
                .chain(config.project_buckets.iter().map(|(kind, b)| ("project_buckets", kind, b)));

            for (group, kind, bucket) in buckets {
                if !config.bucket_policies.contains_key(&bucket.policy) {
                    return Err(invalid(
                        format!("configs.{}.{}.{}.policy", project, group, kind),
                        &bucket.policy,
                        "policy is not defined in bucket_policies".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}
