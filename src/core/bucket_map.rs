use crate::config::RozConfig;
use crate::domain::model::TestFlag;
use crate::utils::error::{Result, RozError};
use crate::utils::validation::validate_s3_bucket_name;
use regex::Regex;
use std::collections::BTreeMap;

/// Substitute `{label}` placeholders in a bucket name layout.
pub fn render_layout(layout: &str, namespace: &BTreeMap<&str, &str>) -> Result<String> {
    let re = Regex::new(r"\{(\w*)\}")
        .map_err(|e| RozError::config(format!("invalid layout pattern: {}", e)))?;

    let mut missing = None;
    let rendered = re.replace_all(layout, |caps: &regex::Captures| {
        let label = &caps[1];
        match namespace.get(label) {
            Some(value) => value.to_string(),
            None => {
                missing.get_or_insert_with(|| label.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(label) => Err(RozError::InvalidConfigValueError {
            field: "name_layout".to_string(),
            value: layout.to_string(),
            reason: format!("Bucket layout {} is invalid, unknown label '{}'", layout, label),
        }),
        None => Ok(rendered.into_owned()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedBucket {
    /// Key in `site_buckets` / `project_buckets`.
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectBuckets {
    pub project_buckets: Vec<MappedBucket>,
    pub sites: BTreeMap<String, Vec<MappedBucket>>,
}

impl ProjectBuckets {
    pub fn site_buckets(&self, site: &str) -> &[MappedBucket] {
        self.sites.get(site).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Every bucket the configuration implies, per project and site.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketMap {
    pub projects: BTreeMap<String, ProjectBuckets>,
}

fn push_unique(list: &mut Vec<MappedBucket>, kind: &str, name: String) {
    if !list.iter().any(|b| b.name == name) {
        list.push(MappedBucket {
            kind: kind.to_string(),
            name,
        });
    }
}

impl BucketMap {
    pub fn from_config(config: &RozConfig) -> Result<Self> {
        let mut projects = BTreeMap::new();

        for (project, project_config) in &config.configs {
            let mut buckets = ProjectBuckets::default();

            for (kind, bucket) in &project_config.project_buckets {
                let namespace = BTreeMap::from([("project", project.as_str()), ("bucket", kind.as_str())]);
                let name = render_layout(&bucket.name_layout, &namespace)?;
                validate_s3_bucket_name(&format!("{}.project_buckets.{}", project, kind), &name)?;
                push_unique(&mut buckets.project_buckets, kind, name);
            }

            for site in &project_config.sites {
                let site_list = buckets.sites.entry(site.clone()).or_default();

                for (kind, bucket) in &project_config.site_buckets {
                    for platform in project_config.file_specs.keys() {
                        for test_flag in TestFlag::ALL {
                            let namespace = BTreeMap::from([
                                ("project", project.as_str()),
                                ("site", site.as_str()),
                                ("platform", platform.as_str()),
                                ("test_flag", test_flag.as_str()),
                                ("bucket", kind.as_str()),
                            ]);
                            let name = render_layout(&bucket.name_layout, &namespace)?;
                            validate_s3_bucket_name(&format!("{}.site_buckets.{}", project, kind), &name)?;
                            push_unique(site_list, kind, name);
                        }
                    }
                }
            }

            projects.insert(project.clone(), buckets);
        }

        Ok(Self { projects })
    }

    pub fn project(&self, project: &str) -> Option<&ProjectBuckets> {
        self.projects.get(project)
    }

    /// `(project, site, bucket)` for every site bucket of the given kind.
    pub fn site_buckets_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = (&'a str, &'a str, &'a MappedBucket)> + 'a {
        self.projects.iter().flat_map(move |(project, buckets)| {
            buckets.sites.iter().flat_map(move |(site, list)| {
                list.iter()
                    .filter(move |b| b.kind == kind)
                    .map(move |b| (project.as_str(), site.as_str(), b))
            })
        })
    }

    /// `(project, bucket)` for every project bucket of the given kind.
    pub fn project_buckets_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = (&'a str, &'a MappedBucket)> + 'a {
        self.projects.iter().flat_map(move |(project, buckets)| {
            buckets
                .project_buckets
                .iter()
                .filter(move |b| b.kind == kind)
                .map(move |b| (project.as_str(), b))
        })
    }
}

/// Components of a site ingest bucket name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IngestBucket {
    pub project: String,
    pub site: String,
    pub platform: String,
    pub test_flag: TestFlag,
}

/// `project-site-platform-test_flag`, test flag `prod` or `test`.
pub fn parse_ingest_bucket(name: &str) -> Option<IngestBucket> {
    let parts: Vec<&str> = name.split('-').collect();
    let [project, site, platform, flag] = parts.as_slice() else {
        return None;
    };
    if project.is_empty() || site.is_empty() || platform.is_empty() {
        return None;
    }
    Some(IngestBucket {
        project: project.to_string(),
        site: site.to_string(),
        platform: platform.to_string(),
        test_flag: TestFlag::parse(flag)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::roz_config::tests::TEST_CONFIG;

    #[test]
    fn test_render_layout() {
        let ns = BTreeMap::from([("project", "mscape"), ("site", "birm")]);
        assert_eq!(render_layout("{project}-{site}-in", &ns).unwrap(), "mscape-birm-in");
        assert!(render_layout("{project}-{platform}", &ns).is_err());
        assert_eq!(render_layout("static-name", &ns).unwrap(), "static-name");
    }

    #[test]
    fn test_bucket_map_from_config() {
        let config = RozConfig::from_json_str(TEST_CONFIG).unwrap();
        let map = BucketMap::from_config(&config).unwrap();
        let project = map.project("mscapetest").unwrap();

        let names: Vec<&str> = project.project_buckets.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["mscapetest-private", "mscapetest-published-reads"]);

        let birm: Vec<&str> = project.site_buckets("birm").iter().map(|b| b.name.as_str()).collect();
        assert_eq!(
            birm,
            vec![
                "mscapetest-birm-illumina-prod",
                "mscapetest-birm-illumina-test",
                "mscapetest-birm-ont-prod",
                "mscapetest-birm-ont-test",
            ]
        );
        assert_eq!(map.site_buckets_of_kind("ingest").count(), 8);
    }

    #[test]
    fn test_layout_without_labels_is_deduplicated() {
        let mut config = RozConfig::from_json_str(TEST_CONFIG).unwrap();
        config
            .configs
            .get_mut("mscapetest")
            .unwrap()
            .site_buckets
            .get_mut("ingest")
            .unwrap()
            .name_layout = "{project}-{site}-shared".to_string();

        let map = BucketMap::from_config(&config).unwrap();
        assert_eq!(
            map.project("mscapetest").unwrap().site_buckets("bath"),
            &[MappedBucket {
                kind: "ingest".to_string(),
                name: "mscapetest-bath-shared".to_string()
            }]
        );
    }

    #[test]
    fn test_parse_ingest_bucket() {
        let parsed = parse_ingest_bucket("mscapetest-birm-ont-prod").unwrap();
        assert_eq!(parsed.project, "mscapetest");
        assert_eq!(parsed.site, "birm");
        assert_eq!(parsed.platform, "ont");
        assert_eq!(parsed.test_flag, TestFlag::Prod);

        assert!(parse_ingest_bucket("mscapetest-birm-ont-staging").is_none());
        assert!(parse_ingest_bucket("mscapetest-published-reads").is_none());
        assert!(parse_ingest_bucket("a-b-c-d-test").is_none());
    }
}
