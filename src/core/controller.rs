//! Bucket provisioning and policy audit/repair.
//!
//! Every bucket the configuration implies is created if missing, then probed
//! with each site's credentials to find out what the site can actually do.
//! Buckets whose observed permissions differ from the configured ones get a
//! freshly generated policy, after which everything is audited again.

use crate::config::{Permission, ProjectConfig, RozConfig, SiteCredentials};
use crate::core::bucket_map::{BucketMap, MappedBucket};
use crate::core::policy::BucketPolicy;
use crate::domain::ports::{ObjectStore, StoreFactory};
use crate::utils::error::{Result, RozError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Key used by the object probes.
const PROBE_KEY: &str = "test";

/// Observed permissions of one site on one bucket.
pub type SiteAudit = BTreeMap<Permission, bool>;

/// One managed bucket. `site` is the owning site for site buckets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketRef {
    pub project: String,
    pub site: Option<String>,
    pub kind: String,
    pub name: String,
}

impl BucketRef {
    fn new(project: &str, site: Option<&str>, bucket: &MappedBucket) -> Self {
        Self {
            project: project.to_string(),
            site: site.map(str::to_string),
            kind: bucket.kind.clone(),
            name: bucket.name.clone(),
        }
    }

    pub fn is_site_bucket(&self) -> bool {
        self.site.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketAudit {
    pub bucket: BucketRef,
    /// auditing site -> observed permissions
    pub sites: BTreeMap<String, SiteAudit>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerReport {
    pub dry_run: bool,
    pub to_fix: BTreeSet<BucketRef>,
    /// Buckets still wrong after applying policies. Empty on dry runs.
    pub still_incorrect: BTreeSet<BucketRef>,
}

impl ControllerReport {
    pub fn site_bucket_count(&self) -> usize {
        self.to_fix.iter().filter(|b| b.is_site_bucket()).count()
    }

    pub fn project_bucket_count(&self) -> usize {
        self.to_fix.len() - self.site_bucket_count()
    }

    pub fn is_converged(&self) -> bool {
        self.still_incorrect.is_empty()
    }
}

#[derive(Debug, PartialEq)]
enum CurrentPolicy {
    Present(String),
    Absent,
    /// admin may not read it
    Denied,
}

pub struct Controller {
    config: Arc<RozConfig>,
    buckets: BucketMap,
    admin_username: String,
    admin: Arc<dyn ObjectStore>,
    /// (project, site) -> store acting with the site's credentials
    site_stores: BTreeMap<(String, String), Arc<dyn ObjectStore>>,
    /// (project, site) -> S3 username named in policies
    usernames: BTreeMap<(String, String), String>,
}

impl Controller {
    pub fn new(config: Arc<RozConfig>, credentials: &SiteCredentials, factory: &dyn StoreFactory) -> Result<Self> {
        let buckets = BucketMap::from_config(&config)?;
        let admin = factory.store_for(
            &credentials.admin.aws_access_key_id,
            &credentials.admin.aws_secret_access_key,
        )?;

        let mut site_stores = BTreeMap::new();
        let mut usernames = BTreeMap::new();
        for (project, project_config) in &config.configs {
            for site in &project_config.sites {
                let cred = credentials.site(project, site)?;
                let store = factory.store_for(&cred.aws_access_key_id, &cred.aws_secret_access_key)?;
                site_stores.insert((project.clone(), site.clone()), store);
                usernames.insert((project.clone(), site.clone()), cred.username.clone());
            }
        }

        Ok(Self {
            config,
            buckets,
            admin_username: credentials.admin.username.clone(),
            admin,
            site_stores,
            usernames,
        })
    }

    fn missing_credentials(project: &str, site: &str) -> RozError {
        RozError::MissingConfigError {
            field: format!("credentials for {}.{}", project, site),
        }
    }

    fn site_store(&self, project: &str, site: &str) -> Result<&Arc<dyn ObjectStore>> {
        self.site_stores
            .get(&(project.to_string(), site.to_string()))
            .ok_or_else(|| Self::missing_credentials(project, site))
    }

    fn username(&self, project: &str, site: &str) -> Result<&str> {
        self.usernames
            .get(&(project.to_string(), site.to_string()))
            .map(String::as_str)
            .ok_or_else(|| Self::missing_credentials(project, site))
    }

    fn all_buckets(&self) -> Vec<BucketRef> {
        let mut refs = Vec::new();
        for (project, buckets) in &self.buckets.projects {
            for bucket in &buckets.project_buckets {
                refs.push(BucketRef::new(project, None, bucket));
            }
            for (site, list) in &buckets.sites {
                for bucket in list {
                    refs.push(BucketRef::new(project, Some(site), bucket));
                }
            }
        }
        refs
    }

    /// Create every missing bucket. Project buckets belong to the admin user,
    /// site buckets to their site.
    pub async fn ensure_buckets(&self) -> Result<()> {
        for bucket in self.all_buckets() {
            if self.admin.head_bucket(&bucket.name).await.is_ok() {
                tracing::info!(bucket = %bucket.name, "Bucket already exists, no need to create");
                continue;
            }

            let creator = match &bucket.site {
                Some(site) => self.site_store(&bucket.project, site)?,
                None => &self.admin,
            };

            tracing::info!(bucket = %bucket.name, "🪣 Creating bucket");
            creator.create_bucket(&bucket.name).await.map_err(|e| {
                RozError::processing(format!("Bucket {} could not be created: {}", bucket.name, e))
            })?;
        }
        Ok(())
    }

    async fn current_policy(&self, bucket: &str) -> Result<CurrentPolicy> {
        match self.admin.get_bucket_policy(bucket).await {
            Ok(policy) => Ok(CurrentPolicy::Present(policy)),
            Err(e) if e.is_s3_code("NoSuchBucketPolicy") => Ok(CurrentPolicy::Absent),
            Err(e) if e.is_s3_code("AccessDenied") => Ok(CurrentPolicy::Denied),
            Err(e) => Err(e),
        }
    }

    async fn probe(&self, site: &dyn ObjectStore, bucket: &str, permission: Permission) -> Result<bool> {
        let missing = || RozError::processing(format!("Bucket {} does not exist", bucket));

        match permission {
            Permission::List => match site.list_objects(bucket).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_s3_code("NoSuchBucket") => Err(missing()),
                Err(_) => Ok(false),
            },
            Permission::Get => match site.get_object(bucket, PROBE_KEY).await {
                Ok(_) => Ok(true),
                Err(e) => Ok(e.is_s3_code("NoSuchKey")),
            },
            Permission::Delete => match site.delete_object(bucket, PROBE_KEY).await {
                Ok(()) => Ok(true),
                Err(e) if e.is_s3_code("NoSuchBucket") => Err(missing()),
                Err(e) => Ok(e.is_s3_code("NoSuchKey")),
            },
            Permission::Put => match site.put_object(bucket, PROBE_KEY, PROBE_KEY.as_bytes().to_vec()).await {
                Ok(()) => {
                    if let Err(e) = self.admin.delete_object(bucket, PROBE_KEY).await {
                        tracing::warn!(bucket = %bucket, "Could not remove probe object: {}", e);
                    }
                    Ok(true)
                }
                Err(e) if e.is_s3_code("NoSuchBucket") => Err(missing()),
                Err(_) => Ok(false),
            },
            Permission::PutPolicy => {
                let body = match self.current_policy(bucket).await? {
                    CurrentPolicy::Denied => return Ok(false),
                    CurrentPolicy::Present(policy) => policy,
                    CurrentPolicy::Absent => {
                        let default = BucketPolicy::admin_only(bucket, &self.admin_username).to_json()?;
                        if site.put_bucket_policy(bucket, &default).await.is_err() {
                            return Ok(false);
                        }
                        // leave the bucket without a policy, as found
                        self.admin.delete_bucket_policy(bucket).await?;
                        return Ok(true);
                    }
                };
                Ok(site.put_bucket_policy(bucket, &body).await.is_ok())
            }
            Permission::DeletePolicy => {
                let existing = self.current_policy(bucket).await?;
                if existing == CurrentPolicy::Denied || site.delete_bucket_policy(bucket).await.is_err() {
                    return Ok(false);
                }
                if let CurrentPolicy::Present(policy) = existing {
                    self.admin.put_bucket_policy(bucket, &policy).await?;
                }
                Ok(true)
            }
            Permission::GetPolicy => match site.get_bucket_policy(bucket).await {
                Ok(_) => Ok(true),
                Err(e) => Ok(e.is_s3_code("NoSuchBucketPolicy")),
            },
        }
    }

    /// Probe `bucket` with the credentials of every site in the project.
    pub async fn audit_bucket(&self, bucket: &BucketRef) -> Result<BucketAudit> {
        let project_config = self.project_config(&bucket.project)?;
        let mut sites = BTreeMap::new();

        for site in &project_config.sites {
            let store = self.site_store(&bucket.project, site)?;
            let mut observed = SiteAudit::new();
            for permission in Permission::ALL {
                let allowed = self.probe(store.as_ref(), &bucket.name, permission).await?;
                observed.insert(permission, allowed);
            }
            tracing::debug!(bucket = %bucket.name, site = %site, ?observed, "Audited bucket");
            sites.insert(site.clone(), observed);
        }

        Ok(BucketAudit {
            bucket: bucket.clone(),
            sites,
        })
    }

    pub async fn audit_all(&self) -> Result<Vec<BucketAudit>> {
        let mut audits = Vec::new();
        for bucket in self.all_buckets() {
            audits.push(self.audit_bucket(&bucket).await?);
        }
        Ok(audits)
    }

    fn project_config(&self, project: &str) -> Result<&ProjectConfig> {
        self.config
            .project(project)
            .ok_or_else(|| RozError::config(format!("Unknown project {}", project)))
    }

    /// Permissions `site` should have on `bucket`.
    pub fn expected_permissions(&self, bucket: &BucketRef, site: &str) -> Result<&[Permission]> {
        let project_config = self.project_config(&bucket.project)?;

        let bucket_config = match &bucket.site {
            Some(owner) if owner != site => return Ok(&[][..]),
            Some(_) => project_config.site_buckets.get(&bucket.kind),
            None => project_config.project_buckets.get(&bucket.kind),
        }
        .ok_or_else(|| RozError::config(format!("No bucket config for {}", bucket.kind)))?;

        project_config.policy(&bucket_config.policy).ok_or_else(|| {
            RozError::config(format!("Policy {} is not defined in bucket_policies", bucket_config.policy))
        })
    }

    /// Buckets where any site can do more or less than configured.
    pub fn test_policies(&self, audits: &[BucketAudit]) -> Result<BTreeSet<BucketRef>> {
        let mut to_fix = BTreeSet::new();

        for audit in audits {
            for (site, observed) in &audit.sites {
                let expected = self.expected_permissions(&audit.bucket, site)?;
                for (permission, allowed) in observed {
                    match (*allowed, expected.contains(permission)) {
                        (true, false) => {
                            tracing::warn!(bucket = %audit.bucket.name, %site, %permission, "Incorrect policy for bucket detected");
                            to_fix.insert(audit.bucket.clone());
                        }
                        (false, true) => {
                            tracing::warn!(bucket = %audit.bucket.name, %site, %permission, "Missing policy for bucket detected");
                            to_fix.insert(audit.bucket.clone());
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(to_fix)
    }

    /// Policy the bucket should carry.
    pub fn generate_policy(&self, bucket: &BucketRef) -> Result<BucketPolicy> {
        let project_config = self.project_config(&bucket.project)?;

        let owners: Vec<&str> = match &bucket.site {
            Some(owner) => vec![owner.as_str()],
            None => project_config.sites.iter().map(String::as_str).collect(),
        };

        let mut grants = Vec::new();
        for site in owners {
            grants.push((
                self.username(&bucket.project, site)?,
                self.expected_permissions(bucket, site)?,
            ));
        }

        Ok(BucketPolicy::for_bucket(&bucket.name, &self.admin_username, grants))
    }

    /// Put generated policies with the admin credentials. Failures are logged
    /// and left for the re-audit to report.
    pub async fn apply_policies(&self, to_fix: &BTreeSet<BucketRef>) -> Result<()> {
        for bucket in to_fix {
            let policy = self.generate_policy(bucket)?.to_json()?;
            match self.admin.put_bucket_policy(&bucket.name, &policy).await {
                Ok(()) => tracing::info!(bucket = %bucket.name, "🔐 Applied bucket policy"),
                Err(e) => tracing::error!(bucket = %bucket.name, "Failed to apply bucket policy: {}", e),
            }
        }
        Ok(())
    }

    /// Full run: create, audit, repair (unless `dry_run`), re-audit.
    pub async fn run(&self, dry_run: bool) -> Result<ControllerReport> {
        self.ensure_buckets().await?;

        let audits = self.audit_all().await?;
        let to_fix = self.test_policies(&audits)?;

        let mut report = ControllerReport {
            dry_run,
            to_fix,
            still_incorrect: BTreeSet::new(),
        };

        if dry_run {
            tracing::info!(
                site_buckets = report.site_bucket_count(),
                project_buckets = report.project_bucket_count(),
                "Dry run, not applying policies"
            );
            return Ok(report);
        }

        self.apply_policies(&report.to_fix).await?;

        let retest = self.audit_all().await?;
        report.still_incorrect = self.test_policies(&retest)?;

        if report.is_converged() {
            tracing::info!("✅ All policies applied successfully");
        } else {
            for bucket in &report.still_incorrect {
                tracing::error!(bucket = %bucket.name, project = %bucket.project, site = ?bucket.site, "Bucket still appears to have an incorrect policy");
            }
        }

        Ok(report)
    }
}
