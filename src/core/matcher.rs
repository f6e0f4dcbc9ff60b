//! Groups object-created events into complete artifacts.

use crate::config::{PlatformSpec, ProjectConfig, RozConfig};
use crate::core::bucket_map::parse_ingest_bucket;
use crate::core::records::can_resubmit;
use crate::domain::model::{now_ns, MatchedPayload, S3Event, S3EventRecord, TestFlag};
use crate::domain::ports::{send_json, MessageBus, OnyxApi};
use crate::utils::error::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const MATCHED_EXCHANGE: &str = "inbound.matched";
pub const QUEUE_SUFFIX: &str = "s3_matcher";
pub const DEFAULT_SLEEP_TIME: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    pub project: String,
    pub site: String,
    pub platform: String,
    pub test_flag: TestFlag,
    pub artifact: String,
}

/// Extension -> event record for that file.
pub type FileSet = BTreeMap<String, S3EventRecord>;

/// Zip filename sections onto layout field names.
pub fn parse_fname(fname: &str, layout: &str) -> BTreeMap<String, String> {
    layout
        .split('.')
        .zip(fname.split('.'))
        .map(|(field, value)| (field.to_string(), value.to_string()))
        .collect()
}

pub fn generate_artifact(parsed: &BTreeMap<String, String>, artifact_layout: &str) -> Option<String> {
    artifact_layout
        .split('.')
        .map(|field| parsed.get(field).cloned())
        .collect::<Option<Vec<_>>>()
        .map(|parts| parts.join("."))
}

/// A record that passed every filename check.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifiedFile {
    pub key: ArtifactKey,
    pub extension: String,
    pub parsed: BTreeMap<String, String>,
}

/// Run the bucket and filename checks on one record. `None` means the
/// record is ignored.
pub fn identify(config: &RozConfig, record: &S3EventRecord) -> Option<IdentifiedFile> {
    let bucket = record.bucket_name();
    let fname = record.key();

    let Some(ingest) = parse_ingest_bucket(bucket) else {
        tracing::error!(bucket, "Bucket name is not project-site-platform-(test|prod), ignoring message");
        return None;
    };

    if fname.contains('/') || fname.contains('\\') {
        tracing::info!(
            "Submitted object: {} in bucket: {} appears to be within a bucket subdirectory, ignoring",
            fname,
            bucket
        );
        return None;
    }

    let Some(project_config) = config.project(&ingest.project) else {
        tracing::error!(project = %ingest.project, "Unknown project, ignoring");
        return None;
    };
    let Some(spec) = project_config.platform(&ingest.platform) else {
        tracing::error!(platform = %ingest.platform, "Unknown platform, ignoring");
        return None;
    };

    tracing::info!("Attempting to process object with key: {}", fname);

    let Some(extension) = spec.match_extension(fname) else {
        tracing::error!(
            "File {} doesn't appear to have a valid extension (accepted extensions are: {}), ignoring",
            fname,
            spec.files.join(", ")
        );
        return None;
    };
    let ext_spec = spec.extension(extension)?;

    if fname.split('.').count() != ext_spec.sections {
        tracing::error!("File {} does not appear to conform to filename specification, ignoring", fname);
        return None;
    }

    let parsed = parse_fname(fname, &ext_spec.layout);

    if parsed.get("project").is_some_and(|p| *p != ingest.project) {
        tracing::info!(
            "Submitted file: {} appears to be in a bucket for the wrong project, only files for the project {} should be submitted to bucket: {}, ignoring",
            fname,
            ingest.project,
            bucket
        );
        return None;
    }
    if parsed.get("platform").is_some_and(|p| *p != ingest.platform) {
        tracing::info!(
            "Submitted file: {} appears to be in a bucket for the wrong platform, only files for the platform {} should be submitted to bucket: {}, ignoring",
            fname,
            ingest.platform,
            bucket
        );
        return None;
    }

    let Some(artifact) = generate_artifact(&parsed, &project_config.artifact_layout) else {
        tracing::error!("File {} does not contain every artifact_layout field, ignoring", fname);
        return None;
    };

    Some(IdentifiedFile {
        key: ArtifactKey {
            project: ingest.project,
            site: ingest.site,
            platform: ingest.platform,
            test_flag: ingest.test_flag,
            artifact,
        },
        extension: extension.to_string(),
        parsed,
    })
}

fn is_complete(spec: &PlatformSpec, files: &FileSet) -> bool {
    files.len() == spec.files.len() && spec.files.iter().all(|ext| files.contains_key(ext))
}

/// Build the payload, taking `sample_id` / `run_name` from the file with the
/// given extension.
pub fn build_payload(
    key: &ArtifactKey,
    project_config: &ProjectConfig,
    files: &FileSet,
    name_from: &str,
) -> Option<MatchedPayload> {
    let spec = project_config.platform(&key.platform)?;
    let ext_spec = spec.extension(name_from)?;
    let record = files.get(name_from)?;
    let parsed = parse_fname(record.key(), &ext_spec.layout);

    let listed: Vec<&S3EventRecord> = spec.files.iter().filter_map(|ext| files.get(ext)).collect();

    Some(MatchedPayload {
        uuid: uuid::Uuid::new_v4().to_string(),
        payload_version: 1,
        site: key.site.clone(),
        uploaders: MatchedPayload::uploaders_from(listed.iter().copied()),
        match_timestamp: now_ns(),
        artifact: key.artifact.clone(),
        sample_id: parsed.get("sample_id")?.clone(),
        run_name: parsed.get("run_name")?.clone(),
        project: key.project.clone(),
        platform: key.platform.clone(),
        files: spec
            .files
            .iter()
            .filter_map(|ext| files.get(ext).map(|r| (ext.clone(), r.to_file_record())))
            .collect(),
        test_flag: key.test_flag.is_test(),
    })
}

pub struct Matcher {
    config: Arc<RozConfig>,
    bus: Arc<dyn MessageBus>,
    onyx: Arc<dyn OnyxApi>,
    pending: BTreeMap<ArtifactKey, FileSet>,
    matched: BTreeMap<ArtifactKey, FileSet>,
}

impl Matcher {
    pub fn new(config: Arc<RozConfig>, bus: Arc<dyn MessageBus>, onyx: Arc<dyn OnyxApi>) -> Self {
        Self {
            config,
            bus,
            onyx,
            pending: BTreeMap::new(),
            matched: BTreeMap::new(),
        }
    }

    pub fn pending(&self) -> &BTreeMap<ArtifactKey, FileSet> {
        &self.pending
    }

    pub fn matched(&self) -> &BTreeMap<ArtifactKey, FileSet> {
        &self.matched
    }

    async fn handle_record(&mut self, record: S3EventRecord, updates: &mut BTreeMap<ArtifactKey, FileSet>) {
        let Some(file) = identify(&self.config, &record) else {
            return;
        };

        let Some(previous) = self.matched.get(&file.key) else {
            self.pending
                .entry(file.key)
                .or_default()
                .insert(file.extension, record);
            return;
        };

        let previous_etag = previous.get(&file.extension).map(S3EventRecord::etag);
        if previous_etag == Some(record.etag()) {
            tracing::info!(
                "Previously ingested file: {} has been previously matched and appears identical to previously matched version, ignoring",
                record.key()
            );
            return;
        }

        let (Some(sample_id), Some(run_name)) = (file.parsed.get("sample_id"), file.parsed.get("run_name")) else {
            tracing::error!(key = record.key(), "Filename has no sample_id / run_name, cannot check Onyx");
            return;
        };

        let allowed = can_resubmit(
            self.onyx.as_ref(),
            &file.key.project,
            &file.key.artifact,
            sample_id,
            run_name,
        )
        .await;

        if allowed {
            tracing::info!(
                "Resubmitting previously rejected submission for artifact: {} due to update of submission {}",
                file.key.artifact,
                file.extension
            );
            let base = previous.clone();
            updates
                .entry(file.key)
                .or_insert(base)
                .insert(file.extension, record);
        }
    }

    async fn send_payload(&self, payload: &MatchedPayload) -> bool {
        match send_json(self.bus.as_ref(), payload, MATCHED_EXCHANGE, QUEUE_SUFFIX).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(artifact = %payload.artifact, "Failed to send payload with error: {}", e);
                false
            }
        }
    }

    /// Send every pending artifact whose file set is complete.
    async fn flush_complete(&mut self) -> usize {
        let mut sent = 0;
        let keys: Vec<ArtifactKey> = self.pending.keys().cloned().collect();

        for key in keys {
            let Some(project_config) = self.config.project(&key.project) else {
                continue;
            };
            let Some(spec) = project_config.platform(&key.platform) else {
                continue;
            };
            let Some(files) = self.pending.get(&key) else {
                continue;
            };
            if !is_complete(spec, files) {
                tracing::debug!(artifact = %key.artifact, "Artifact is not yet complete");
                continue;
            }

            let Some(last) = spec.files.last() else {
                continue;
            };
            let Some(payload) = build_payload(&key, project_config, files, last) else {
                tracing::error!(artifact = %key.artifact, "Could not build payload, dropping artifact");
                self.pending.remove(&key);
                continue;
            };

            tracing::info!(artifact = %key.artifact, "🧩 Submission matched, attempting to send submission payload");
            if self.send_payload(&payload).await {
                if let Some(files) = self.pending.remove(&key) {
                    self.matched.insert(key, files);
                }
                sent += 1;
            }
        }

        sent
    }

    async fn flush_updates(&mut self, updates: BTreeMap<ArtifactKey, FileSet>) -> usize {
        let mut sent = 0;

        for (key, files) in updates {
            let Some(project_config) = self.config.project(&key.project) else {
                continue;
            };
            let Some(first) = project_config.platform(&key.platform).and_then(|s| s.files.first()) else {
                continue;
            };
            let Some(payload) = build_payload(&key, project_config, &files, first) else {
                tracing::error!(artifact = %key.artifact, "Could not build update payload");
                continue;
            };

            tracing::info!(
                "Submission matched for previously rejected artifact: {}, attempting to send submission payload",
                key.artifact
            );
            if self.send_payload(&payload).await {
                self.matched.insert(key, files);
                sent += 1;
            }
        }

        sent
    }

    /// Process one batch of queued events. Returns the number of payloads sent.
    pub async fn run_once(&mut self) -> Result<usize> {
        let deliveries = self.bus.receive_batch(crate::core::notifications::S3_EXCHANGE, QUEUE_SUFFIX).await?;
        let mut updates = BTreeMap::new();

        for delivery in &deliveries {
            match delivery.json::<S3Event>() {
                Ok(event) => {
                    for record in event.records {
                        self.handle_record(record, &mut updates).await;
                    }
                }
                Err(e) => tracing::error!("Could not parse S3 event message: {}", e),
            }
        }

        let sent = self.flush_complete().await + self.flush_updates(updates).await;

        for delivery in &deliveries {
            self.bus.acknowledge(delivery).await?;
        }
        Ok(sent)
    }

    pub async fn run(&mut self, sleep_time: Duration) -> Result<()> {
        loop {
            self.run_once().await?;
            tokio::time::sleep(sleep_time).await;
        }
    }
}
