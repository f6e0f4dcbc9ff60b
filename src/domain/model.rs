use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Field name -> messages, as returned by Onyx and accumulated on payloads.
pub type ErrorMap = BTreeMap<String, Vec<String>>;

pub fn merge_errors(target: &mut ErrorMap, incoming: ErrorMap) {
    for (field, mut messages) in incoming {
        target.entry(field).or_default().append(&mut messages);
    }
}

pub fn push_error(target: &mut ErrorMap, field: &str, message: impl Into<String>) {
    target
        .entry(field.to_string())
        .or_default()
        .push(message.into());
}

/// Bucket test flag: the last section of an ingest bucket name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestFlag {
    Prod,
    Test,
}

impl TestFlag {
    pub const ALL: [TestFlag; 2] = [TestFlag::Prod, TestFlag::Test];

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "prod" => Some(TestFlag::Prod),
            "test" => Some(TestFlag::Test),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestFlag::Prod => "prod",
            TestFlag::Test => "test",
        }
    }

    pub fn is_test(&self) -> bool {
        matches!(self, TestFlag::Test)
    }
}

impl fmt::Display for TestFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---- S3 object-created events (Ceph bucket notification format) ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Event {
    #[serde(rename = "Records")]
    pub records: Vec<S3EventRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3EventRecord {
    #[serde(default)]
    pub event_version: String,
    #[serde(default)]
    pub event_source: String,
    #[serde(default)]
    pub aws_region: String,
    #[serde(default)]
    pub event_time: String,
    #[serde(default)]
    pub event_name: String,
    #[serde(default)]
    pub user_identity: UserIdentity,
    #[serde(default)]
    pub request_parameters: RequestParameters,
    #[serde(default)]
    pub response_elements: ResponseElements,
    pub s3: S3Entity,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub opaque_data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    #[serde(default)]
    pub principal_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestParameters {
    #[serde(rename = "sourceIPAddress", default)]
    pub source_ip_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseElements {
    #[serde(rename = "x-amz-request-id", default)]
    pub request_id: String,
    #[serde(rename = "x-amz-id-2", default)]
    pub id_2: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Entity {
    #[serde(default)]
    pub s3_schema_version: String,
    #[serde(default)]
    pub configuration_id: String,
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Bucket {
    pub name: String,
    #[serde(default)]
    pub owner_identity: UserIdentity,
    #[serde(default)]
    pub arn: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Object {
    pub key: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub e_tag: String,
    #[serde(default)]
    pub version_id: String,
    #[serde(default)]
    pub sequencer: String,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
    #[serde(default)]
    pub tags: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub key: String,
    pub val: String,
}

impl S3EventRecord {
    pub fn bucket_name(&self) -> &str {
        &self.s3.bucket.name
    }

    pub fn key(&self) -> &str {
        &self.s3.object.key
    }

    pub fn etag(&self) -> &str {
        &self.s3.object.e_tag
    }

    pub fn uploader(&self) -> &str {
        &self.user_identity.principal_id
    }

    pub fn file_uri(&self) -> String {
        format!("s3://{}/{}", self.bucket_name(), self.key())
    }

    pub fn to_file_record(&self) -> FileRecord {
        FileRecord {
            uri: self.file_uri(),
            etag: self.etag().to_string(),
            key: self.key().to_string(),
        }
    }
}

/// One object listed from a bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSummary {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
    pub owner_id: String,
    pub owner_display_name: String,
}

/// An object body together with the ETag S3 reported for it.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub etag: String,
}

// ---- Message payloads ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub uri: String,
    pub etag: String,
    pub key: String,
}

/// Published on `inbound.matched` once every file of an artifact is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedPayload {
    pub uuid: String,
    pub payload_version: u32,
    pub site: String,
    pub uploaders: Vec<String>,
    pub match_timestamp: i64,
    pub artifact: String,
    pub sample_id: String,
    pub run_name: String,
    pub project: String,
    pub platform: String,
    pub files: BTreeMap<String, FileRecord>,
    pub test_flag: bool,
}

impl MatchedPayload {
    pub fn uploaders_from<'a>(records: impl IntoIterator<Item = &'a S3EventRecord>) -> Vec<String> {
        records
            .into_iter()
            .map(|r| r.uploader().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Carried from ingest through validation to the results exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestPayload {
    pub uuid: String,
    pub artifact: String,
    pub sample_id: String,
    pub run_name: String,
    pub project: String,
    #[serde(default)]
    pub uploaders: Vec<String>,
    pub platform: String,
    #[serde(default)]
    pub ingest_timestamp: Option<i64>,
    #[serde(default)]
    pub cid: Option<String>,
    #[serde(default = "default_true")]
    pub validate: bool,
    pub site: String,
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub ingested: bool,
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
    #[serde(default)]
    pub onyx_test_status_code: Option<u16>,
    #[serde(default)]
    pub onyx_test_create_errors: ErrorMap,
    #[serde(default)]
    pub onyx_test_create_status: bool,
    #[serde(default)]
    pub onyx_status_code: Option<u16>,
    #[serde(default)]
    pub onyx_errors: ErrorMap,
    #[serde(default)]
    pub onyx_create_status: bool,
    #[serde(default)]
    pub ingest_errors: Vec<String>,
    #[serde(default = "default_true")]
    pub test_flag: bool,
    #[serde(default)]
    pub test_ingest_result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembly_presigned_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl IngestPayload {
    pub fn from_match(matched: &MatchedPayload, ingest_timestamp: i64) -> Self {
        Self {
            uuid: matched.uuid.clone(),
            artifact: matched.artifact.clone(),
            sample_id: matched.sample_id.clone(),
            run_name: matched.run_name.clone(),
            project: matched.project.clone(),
            uploaders: matched.uploaders.clone(),
            platform: matched.platform.clone(),
            ingest_timestamp: Some(ingest_timestamp),
            cid: None,
            validate: true,
            site: matched.site.clone(),
            created: false,
            ingested: false,
            files: matched.files.clone(),
            onyx_test_status_code: None,
            onyx_test_create_errors: ErrorMap::new(),
            onyx_test_create_status: false,
            onyx_status_code: None,
            onyx_errors: ErrorMap::new(),
            onyx_create_status: false,
            ingest_errors: Vec::new(),
            test_flag: matched.test_flag,
            test_ingest_result: false,
            assembly_presigned_url: None,
        }
    }

    pub fn add_test_create_error(&mut self, field: &str, message: impl Into<String>) {
        push_error(&mut self.onyx_test_create_errors, field, message);
    }

    pub fn add_onyx_error(&mut self, field: &str, message: impl Into<String>) {
        push_error(&mut self.onyx_errors, field, message);
    }

    pub fn cid_or_empty(&self) -> &str {
        self.cid.as_deref().unwrap_or("")
    }

    pub fn file(&self, extension: &str) -> Option<&FileRecord> {
        self.files.get(extension)
    }
}

/// Published on `inbound.new_artifact.{stem}` after a successful ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewArtifact {
    pub ingest_timestamp: i64,
    pub cid: String,
    pub site: String,
    pub platform: String,
    pub match_uuid: String,
}

/// Current wall-clock time in nanoseconds since the epoch.
pub fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
