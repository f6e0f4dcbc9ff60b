use super::{ArtifactHandler, PublishContext, TraceEntry};
use crate::domain::model::IngestPayload;
use crate::utils::error::{Result, RozError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const PIPELINE: &str = "snowy-leopard/scylla";
const K2_PORT: &str = "8080";
const K2_DB: &str = "/shared/public/db/kraken2/k2_pluspf/";
const MAX_HUMAN_READS: &str = "10000";

/// Entry of `reads_by_taxa/reads_summary.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaxonSummary {
    pub taxon: Value,
    pub human_readable: String,
    pub qc_metrics: QcMetrics,
    pub tax_level: Value,
    #[serde(default)]
    pub filenames: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QcMetrics {
    pub num_reads: Value,
    pub avg_qual: Value,
    pub mean_len: Value,
}

impl TaxonSummary {
    fn taxon_id(&self) -> String {
        match &self.taxon {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Metagenomics validation with Scylla.
#[derive(Debug, Clone)]
pub struct MscapeHandler {
    project: String,
    k2_host: String,
}

impl MscapeHandler {
    pub fn new(project: &str, k2_host: &str) -> Self {
        Self {
            project: project.to_string(),
            k2_host: k2_host.to_string(),
        }
    }

    fn bucket(&self, suffix: &str) -> String {
        format!("{}-published-{}", self.project, suffix)
    }

    async fn upload(
        ctx: &PublishContext<'_>,
        payload: &mut IngestPayload,
        local: &Path,
        bucket: &str,
        key: &str,
        what: &str,
    ) -> bool {
        match ctx.store.upload_file(local, bucket, key).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    uuid = %payload.uuid,
                    cid = %payload.cid_or_empty(),
                    "Failed to upload {} to long-term storage bucket due to client error: {}",
                    what,
                    e
                );
                payload
                    .ingest_errors
                    .push(format!("Failed to upload {} to storage bucket", what));
                false
            }
        }
    }

    /// Preprocessed reads -> `{project}-published-reads`, Onyx `fastq_1`/`fastq_2`.
    async fn add_reads_record(&self, ctx: &PublishContext<'_>, payload: &mut IngestPayload) -> bool {
        let bucket = self.bucket("reads");
        let cid = payload.cid_or_empty().to_string();
        let uuid = payload.uuid.clone();

        let uploads: Vec<(String, String, &str)> = if payload.platform == "illumina" {
            vec![
                (format!("preprocess/{}_1.fastp.fastq.gz", uuid), format!("{}_1.fastq.gz", cid), "fastq_1"),
                (format!("preprocess/{}_2.fastp.fastq.gz", uuid), format!("{}_2.fastq.gz", cid), "fastq_2"),
            ]
        } else {
            vec![(format!("preprocess/{}.fastp.fastq.gz", uuid), format!("{}.fastq.gz", cid), "fastq_1")]
        };

        let mut failed = false;
        let mut fields = Map::new();
        for (local, key, field) in uploads {
            if Self::upload(ctx, payload, &ctx.result_path.join(local), &bucket, &key, "reads").await {
                fields.insert(field.to_string(), json!(format!("s3://{}/{}", bucket, key)));
            } else {
                failed = true;
            }
        }

        if failed {
            return true;
        }
        ctx.records.update_record(payload, &Value::Object(fields)).await
    }

    /// Reads binned per taxon -> `{project}-published-binned-reads`, Onyx `taxa`.
    async fn add_taxon_records(&self, ctx: &PublishContext<'_>, payload: &mut IngestPayload) -> bool {
        let summary_path = ctx.result_path.join("reads_by_taxa").join("reads_summary.json");
        let summary: Vec<TaxonSummary> = match read_summary(&summary_path).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(uuid = %payload.uuid, "Could not read reads summary: {}", e);
                payload.ingest_errors.push("couldn't read binned reads summary".to_string());
                return true;
            }
        };

        let bucket = self.bucket("binned-reads");
        let cid = payload.cid_or_empty().to_string();
        let mut failed = false;
        let mut taxa = Vec::new();

        for taxon in &summary {
            let taxon_id = taxon.taxon_id();
            let mut record = Map::new();
            record.insert("taxon_id".to_string(), taxon.taxon.clone());
            record.insert("human_readable".to_string(), json!(taxon.human_readable));
            record.insert("n_reads".to_string(), taxon.qc_metrics.num_reads.clone());
            record.insert("avg_quality".to_string(), taxon.qc_metrics.avg_qual.clone());
            record.insert("mean_len".to_string(), taxon.qc_metrics.mean_len.clone());
            record.insert("tax_level".to_string(), taxon.tax_level.clone());

            let reads: Vec<(usize, String)> = match payload.platform.as_str() {
                "illumina" => (1..=2).map(|i| (i, format!("{}/{}_{}.fastq.gz", cid, taxon_id, i))).collect(),
                "ont" => vec![(1, format!("{}/{}.fastq.gz", cid, taxon_id))],
                other => {
                    tracing::error!("Unknown platform: {}", other);
                    payload.ingest_errors.push(format!("Unknown platform: {}", other));
                    failed = true;
                    continue;
                }
            };

            let mut taxon_ok = true;
            for (i, key) in reads {
                let Some(filename) = taxon.filenames.get(i - 1) else {
                    payload
                        .ingest_errors
                        .push(format!("No binned reads listed for taxon: {}", taxon_id));
                    taxon_ok = false;
                    continue;
                };
                let local = ctx.result_path.join("reads_by_taxa").join(format!("{}.gz", filename));
                let what = format!("binned reads for taxon: {}", taxon_id);
                if Self::upload(ctx, payload, &local, &bucket, &key, &what).await {
                    record.insert(format!("fastq_{}", i), json!(format!("s3://{}/{}", bucket, key)));
                } else {
                    taxon_ok = false;
                }
            }

            if taxon_ok {
                taxa.push(Value::Object(record));
            } else {
                failed = true;
            }
        }

        if failed {
            return true;
        }
        ctx.records.update_record(payload, &json!({ "taxa": taxa })).await
    }

    /// HTML report -> `{project}-published-reports`, Onyx `validation_report`.
    async fn push_report_file(&self, ctx: &PublishContext<'_>, payload: &mut IngestPayload) -> bool {
        let bucket = self.bucket("reports");
        let key = format!("{}_validation_report.html", payload.cid_or_empty());
        let local = ctx.result_path.join(format!("{}_report.html", payload.uuid));

        if !Self::upload(ctx, payload, &local, &bucket, &key, "validation report").await {
            return true;
        }
        let fields = json!({ "validation_report": format!("s3://{}/{}", bucket, key) });
        ctx.records.update_record(payload, &fields).await
    }

    /// Classification reports -> `{project}-published-taxon-reports/{cid}/`,
    /// Onyx `taxon_reports`.
    async fn push_taxon_reports(&self, ctx: &PublishContext<'_>, payload: &mut IngestPayload) -> bool {
        let bucket = self.bucket("taxon-reports");
        let cid = payload.cid_or_empty().to_string();
        let report_dir = ctx.result_path.join("classifications");

        let reports = match list_files(&report_dir).await {
            Ok(reports) => reports,
            Err(e) => {
                tracing::error!(uuid = %payload.uuid, "Could not list taxon reports: {}", e);
                payload
                    .ingest_errors
                    .push("Failed to upload taxon classification to storage bucket".to_string());
                return true;
            }
        };

        for name in reports {
            let key = format!("{}/{}", cid, name);
            if !Self::upload(ctx, payload, &report_dir.join(&name), &bucket, &key, "taxon classification").await {
                return true;
            }
        }

        let fields = json!({ "taxon_reports": format!("s3://{}/{}/", bucket, cid) });
        ctx.records.update_record(payload, &fields).await
    }
}

async fn read_summary(path: &Path) -> Result<Vec<TaxonSummary>> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

async fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn file_uri<'a>(payload: &'a IngestPayload, ext: &str) -> Result<&'a str> {
    payload
        .file(ext)
        .map(|f| f.uri.as_str())
        .ok_or_else(|| RozError::processing(format!("Payload has no {} file", ext)))
}

#[async_trait]
impl ArtifactHandler for MscapeHandler {
    fn stem(&self) -> &str {
        "mscape"
    }

    fn project(&self) -> &str {
        &self.project
    }

    fn parameters(&self, payload: &IngestPayload, result_dir: &Path) -> Result<BTreeMap<String, String>> {
        let mut params = BTreeMap::from([
            ("outdir".to_string(), result_dir.display().to_string()),
            ("unique_id".to_string(), payload.uuid.clone()),
            ("climb".to_string(), String::new()),
            ("max_human_reads_before_rejection".to_string(), MAX_HUMAN_READS.to_string()),
            ("k2_host".to_string(), self.k2_host.clone()),
            ("k2_port".to_string(), K2_PORT.to_string()),
            ("db".to_string(), K2_DB.to_string()),
        ]);

        match payload.platform.as_str() {
            "ont" => {
                params.insert("fastq".to_string(), file_uri(payload, ".fastq.gz")?.to_string());
            }
            "illumina" => {
                params.insert("fastq1".to_string(), file_uri(payload, ".1.fastq.gz")?.to_string());
                params.insert("fastq2".to_string(), file_uri(payload, ".2.fastq.gz")?.to_string());
                params.insert("paired".to_string(), String::new());
            }
            other => return Err(RozError::processing(format!("Unknown platform: {}", other))),
        }

        Ok(params)
    }

    fn trace_error(&self, entry: &TraceEntry) -> String {
        let extraction = entry.process.starts_with("extract_paired_reads") || entry.process.starts_with("extract_reads");
        if extraction && entry.exit == "2" {
            "Human reads detected above rejection threshold, please ensure pre-upload dehumanisation has been performed properly".to_string()
        } else {
            format!(
                "MScape validation pipeline (Scylla) failed in process {} with exit code {} and status {}",
                entry.process, entry.exit, entry.status
            )
        }
    }

    async fn publish(&self, ctx: &PublishContext<'_>, payload: &mut IngestPayload) -> bool {
        // all four steps run even when an earlier one failed
        let reads_failed = self.add_reads_record(ctx, payload).await;
        let taxa_failed = self.add_taxon_records(ctx, payload).await;
        let report_failed = self.push_report_file(ctx, payload).await;
        let taxon_reports_failed = self.push_taxon_reports(ctx, payload).await;

        reads_failed || taxa_failed || report_failed || taxon_reports_failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::FileRecord;

    fn payload(platform: &str) -> IngestPayload {
        serde_json::from_value(json!({
            "uuid": "u1",
            "artifact": "mscape.r1.s1",
            "sample_id": "s1",
            "run_name": "r1",
            "project": "mscape",
            "platform": platform,
            "site": "birm",
        }))
        .unwrap()
    }

    fn file(uri: &str) -> FileRecord {
        FileRecord {
            uri: uri.to_string(),
            etag: "e".to_string(),
            key: "k".to_string(),
        }
    }

    #[test]
    fn test_illumina_parameters() {
        let handler = MscapeHandler::new("mscape", "k2.internal");
        let mut payload = payload("illumina");
        payload.files.insert(".1.fastq.gz".to_string(), file("s3://b/r1"));
        payload.files.insert(".2.fastq.gz".to_string(), file("s3://b/r2"));

        let params = handler.parameters(&payload, Path::new("/results")).unwrap();
        assert_eq!(params["fastq1"], "s3://b/r1");
        assert_eq!(params["fastq2"], "s3://b/r2");
        assert_eq!(params["paired"], "");
        assert_eq!(params["k2_host"], "k2.internal");
        assert_eq!(params["outdir"], "/results");
        assert!(!params.contains_key("fastq"));
    }

    #[test]
    fn test_missing_file_is_error() {
        let handler = MscapeHandler::new("mscape", "k2");
        assert!(handler.parameters(&payload("ont"), Path::new("/results")).is_err());
    }

    #[test]
    fn test_human_read_rejection_wording() {
        let handler = MscapeHandler::new("mscape", "k2");
        let human = TraceEntry {
            process: "extract_paired_reads (1)".to_string(),
            exit: "2".to_string(),
            status: "FAILED".to_string(),
        };
        assert!(handler.trace_error(&human).starts_with("Human reads detected"));

        let other = TraceEntry {
            process: "kraken2".to_string(),
            exit: "1".to_string(),
            status: "FAILED".to_string(),
        };
        assert_eq!(
            handler.trace_error(&other),
            "MScape validation pipeline (Scylla) failed in process kraken2 with exit code 1 and status FAILED"
        );
    }
}
