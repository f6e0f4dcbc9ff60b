use super::{ArtifactHandler, PublishContext, TraceEntry};
use crate::adapters::PathogenwatchClient;
use crate::domain::model::IngestPayload;
use crate::utils::error::{Result, RozError};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const PIPELINE: &str = "CLIMB-TRE/path-safe_assembler";
pub const PRESIGN_EXPIRY: Duration = Duration::from_secs(86400);

/// Record fields never sent to Pathogenwatch.
const PRIVATE_FIELDS: [&str; 3] = ["suppressed", "sample_id", "run_name"];

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
    }
}

/// Metadata shared with Pathogenwatch: non-empty public fields of the record.
pub fn public_metadata(record: &Map<String, Value>) -> Map<String, Value> {
    record
        .iter()
        .filter(|(k, v)| !PRIVATE_FIELDS.contains(&k.as_str()) && !is_empty(v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Isolate assembly with the PATH-SAFE assembler, then Pathogenwatch submission.
pub struct PathsafeHandler {
    project: String,
    pathogenwatch: PathogenwatchClient,
}

impl PathsafeHandler {
    pub fn new(project: &str, pathogenwatch: PathogenwatchClient) -> Self {
        Self {
            project: project.to_string(),
            pathogenwatch,
        }
    }

    fn assembly_bucket(&self) -> String {
        format!("{}-published-assembly", self.project)
    }

    async fn assembly_to_s3(&self, ctx: &PublishContext<'_>, payload: &mut IngestPayload) -> bool {
        let bucket = self.assembly_bucket();
        let key = format!("{}.assembly.fasta", payload.cid_or_empty());
        let local = ctx
            .result_path
            .join("assembly")
            .join(format!("{}.result.fasta", payload.uuid));

        let uploaded: Result<String> = async {
            ctx.store.upload_file(&local, &bucket, &key).await?;
            ctx.store.presign_get(&bucket, &key, PRESIGN_EXPIRY).await
        }
        .await;

        match uploaded {
            Ok(url) => payload.assembly_presigned_url = Some(url),
            Err(e) => {
                tracing::error!(
                    uuid = %payload.uuid,
                    cid = %payload.cid_or_empty(),
                    "Failed to upload assembly to long-term storage bucket due to client error: {}",
                    e
                );
                payload
                    .ingest_errors
                    .push("Failed to upload assembly to storage bucket".to_string());
                return true;
            }
        }

        let fields = json!({ "assembly": format!("s3://{}/{}", bucket, key) });
        ctx.records.update_record(payload, &fields).await
    }

    async fn fetch_record(&self, ctx: &PublishContext<'_>, payload: &IngestPayload) -> Result<Map<String, Value>> {
        let response = ctx.records.api().get(&payload.project, payload.cid_or_empty()).await?;
        if !response.is_success() {
            return Err(RozError::processing(format!(
                "Onyx get for CID {} returned status {}",
                payload.cid_or_empty(),
                response.status
            )));
        }
        response
            .data()
            .unwrap_or(&response.body)
            .as_object()
            .cloned()
            .ok_or_else(|| RozError::processing("Onyx record is not an object"))
    }

    async fn pathogenwatch_submission(&self, ctx: &PublishContext<'_>, payload: &mut IngestPayload) -> bool {
        let Some(url) = payload.assembly_presigned_url.clone() else {
            payload
                .ingest_errors
                .push("No assembly URL available for Pathogenwatch submission".to_string());
            return true;
        };

        let record = match self.fetch_record(ctx, payload).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(cid = %payload.cid_or_empty(), "Could not fetch Onyx record: {}", e);
                payload
                    .ingest_errors
                    .push(format!("Pathogenwatch submission failed, could not fetch record: {}", e));
                return true;
            }
        };

        let response = match self.pathogenwatch.submit(&url, &public_metadata(&record)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(cid = %payload.cid_or_empty(), "Pathogenwatch submission failed: {}", e);
                payload
                    .ingest_errors
                    .push(format!("Pathogenwatch submission failed due to error: {}", e));
                return true;
            }
        };

        if !response.created() {
            tracing::error!(
                uuid = %payload.uuid,
                cid = %payload.cid_or_empty(),
                "Pathogenwatch submission failed due to error: {}",
                response.text
            );
            payload.ingest_errors.push(format!(
                "Pathogenwatch submission failed with status code: {}, due to error: {}",
                response.status, response.text
            ));
            return true;
        }

        match response.id() {
            Some(id) => {
                tracing::info!(cid = %payload.cid_or_empty(), pathogenwatch_uuid = %id, "🧬 Submitted to Pathogenwatch");
                ctx.records
                    .update_record(payload, &json!({ "pathogenwatch_uuid": id }))
                    .await
            }
            None => {
                payload
                    .ingest_errors
                    .push("Pathogenwatch response did not contain an id".to_string());
                true
            }
        }
    }
}

#[async_trait]
impl ArtifactHandler for PathsafeHandler {
    fn stem(&self) -> &str {
        "pathsafe"
    }

    fn project(&self) -> &str {
        &self.project
    }

    fn parameters(&self, payload: &IngestPayload, result_dir: &Path) -> Result<BTreeMap<String, String>> {
        let uri = |ext: &str| {
            payload
                .file(ext)
                .map(|f| f.uri.clone())
                .ok_or_else(|| RozError::processing(format!("Payload has no {} file", ext)))
        };

        Ok(BTreeMap::from([
            ("out_dir".to_string(), result_dir.display().to_string()),
            ("sample_uuid".to_string(), payload.uuid.clone()),
            ("fastq_1".to_string(), uri(".1.fastq.gz")?),
            ("fastq_2".to_string(), uri(".2.fastq.gz")?),
        ]))
    }

    fn trace_error(&self, entry: &TraceEntry) -> String {
        format!(
            "PATH-SAFE validation pipeline failed in process {} with exit code {} and status {}",
            entry.process, entry.exit, entry.status
        )
    }

    async fn publish(&self, ctx: &PublishContext<'_>, payload: &mut IngestPayload) -> bool {
        if self.assembly_to_s3(ctx, payload).await {
            return true;
        }
        self.pathogenwatch_submission(ctx, payload).await
    }
}
