mod common;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use httpmock::prelude::*;
use httpmock::Method::PATCH;
use roz::adapters::{MemoryBus, MemoryStore, PathogenwatchClient};
use roz::core::records::OnyxRecords;
use roz::core::validation::{PathsafeHandler, Validator};
use roz::domain::ports::{Delivery, MessageBus, ObjectStore, PipelineOutcome, PipelineRunner};
use roz::RozError;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const PROJECT: &str = "pathsafetest";
const INGEST_BUCKET: &str = "pathsafetest-birm-illumina-prod";
const CSV_KEY: &str = "pathsafetest.s1.r1.illumina.csv";
const TO_VALIDATE: &str = "inbound.to_validate.pathsafetest";
const RESULTS: &str = "inbound.results.pathsafe.birm";
const NEW_ARTIFACT: &str = "inbound.new_artifact.pathsafe";

/// Writes the files a real assembler run leaves behind.
struct FakeRunner {
    trace: String,
    delay: Duration,
    executed: AtomicUsize,
    cleaned: AtomicUsize,
}

impl FakeRunner {
    fn new(trace_rows: &str) -> Self {
        Self {
            trace: format!("task_id\tname\tstatus\texit\n{}", trace_rows),
            delay: Duration::ZERO,
            executed: AtomicUsize::new(0),
            cleaned: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl PipelineRunner for FakeRunner {
    async fn execute(&self, params: &BTreeMap<String, String>) -> roz::Result<PipelineOutcome> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let uuid = &params["sample_uuid"];
        let out = PathBuf::from(&params["out_dir"]).join(uuid);

        std::fs::create_dir_all(out.join("pipeline_info"))?;
        std::fs::write(
            out.join("pipeline_info").join(format!("execution_trace_{}.txt", uuid)),
            &self.trace,
        )?;
        std::fs::create_dir_all(out.join("assembly"))?;
        std::fs::write(out.join("assembly").join(format!("{}.result.fasta", uuid)), ">contig_1\nACGT\n")?;

        Ok(PipelineOutcome {
            return_code: 0,
            timed_out: false,
            stdout: "Launching `CLIMB-TRE/path-safe_assembler` [sad_euler] DSL2\n".to_string(),
            stderr: String::new(),
            command: vec!["nextflow".to_string(), "run".to_string()],
        })
    }

    async fn cleanup(&self, _stdout: &str) -> roz::Result<PipelineOutcome> {
        self.cleaned.fetch_add(1, Ordering::SeqCst);
        Ok(PipelineOutcome::default())
    }
}

/// Hands out whatever is queued once, then loses the broker connection.
struct DroppingBus {
    inner: Arc<MemoryBus>,
    receives: AtomicUsize,
}

#[async_trait]
impl MessageBus for DroppingBus {
    async fn send(&self, message: &Value, exchange: &str, queue_suffix: &str) -> roz::Result<()> {
        self.inner.send(message, exchange, queue_suffix).await
    }

    async fn receive(
        &self,
        exchange: &str,
        queue_suffix: &str,
        timeout: Option<Duration>,
    ) -> roz::Result<Option<Delivery>> {
        if self.receives.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(RozError::BusProtocolError {
                message: "connection reset".to_string(),
            });
        }
        self.inner.receive(exchange, queue_suffix, timeout).await
    }

    async fn receive_batch(&self, exchange: &str, queue_suffix: &str) -> roz::Result<Vec<Delivery>> {
        self.inner.receive_batch(exchange, queue_suffix).await
    }

    async fn acknowledge(&self, delivery: &Delivery) -> roz::Result<()> {
        self.inner.acknowledge(delivery).await
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> roz::Result<()> {
        self.inner.nack(delivery, requeue).await
    }
}

struct Harness {
    _dir: TempDir,
    result_dir: PathBuf,
    store: Arc<MemoryStore>,
    bus: Arc<MemoryBus>,
    runner: Arc<FakeRunner>,
    validator: Validator,
}

async fn harness(server: &MockServer, runner: FakeRunner) -> Result<Harness> {
    let dir = TempDir::new()?;
    let result_dir = dir.path().join("results");

    let store = Arc::new(MemoryStore::new());
    store.create_bucket(INGEST_BUCKET).await?;
    store.create_bucket("pathsafetest-published-assembly").await?;

    let bus = Arc::new(MemoryBus::new());
    bus.bind(TO_VALIDATE, "validator");

    let onyx = common::onyx(server).await;
    let pathogenwatch = PathogenwatchClient::new(&server.url("/genomes"), "pw-key", 41);
    let runner = Arc::new(runner);

    let validator = Validator::new(
        Arc::new(PathsafeHandler::new(PROJECT, pathogenwatch)),
        runner.clone(),
        store.clone(),
        OnyxRecords::new(onyx, store.clone()),
        bus.clone(),
        result_dir.clone(),
    );

    Ok(Harness {
        _dir: dir,
        result_dir,
        store,
        bus,
        runner,
        validator,
    })
}

impl Harness {
    /// Queue an ingest payload for `s1`/`r1`, returning its uuid.
    async fn submit(&self, overrides: Value) -> Result<String> {
        let etag = self.store.put_object_at(
            INGEST_BUCKET,
            CSV_KEY,
            b"sample_id,run_name\ns1,r1\n",
            Utc::now(),
        )?;
        let file = |key: &str, etag: &str| {
            json!({"uri": format!("s3://{}/{}", INGEST_BUCKET, key), "etag": etag, "key": key})
        };

        let mut payload = json!({
            "uuid": "3b7e0c1a-uuid",
            "artifact": "pathsafetest.r1.s1",
            "sample_id": "s1",
            "run_name": "r1",
            "project": PROJECT,
            "platform": "illumina",
            "site": "birm",
            "uploaders": ["pathsafetest-birm"],
            "files": {
                ".1.fastq.gz": file("pathsafetest.s1.r1.1.fastq.gz", "e1"),
                ".2.fastq.gz": file("pathsafetest.s1.r1.2.fastq.gz", "e2"),
                ".csv": file(CSV_KEY, &etag)
            },
            "validate": true,
            "onyx_test_create_status": true,
            "test_flag": false
        });
        if let (Some(target), Some(extra)) = (payload.as_object_mut(), overrides.as_object()) {
            for (k, v) in extra {
                target.insert(k.clone(), v.clone());
            }
        }

        self.bus.send(&payload, TO_VALIDATE, "ingest").await?;
        Ok(payload["uuid"].as_str().unwrap_or_default().to_string())
    }

    fn result(&self) -> Value {
        let results = self.bus.published(RESULTS);
        assert_eq!(results.len(), 1);
        results[0].clone()
    }
}

#[tokio::test]
async fn test_successful_validation_publishes_assembly() -> Result<()> {
    let server = MockServer::start_async().await;

    let create = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/projects/pathsafetest/")
                .json_body(json!({"sample_id": "s1", "run_name": "r1", "suppressed": true, "site": "birm"}));
            then.status(201).json_body(json!({"data": {"cid": "C-123"}}));
        })
        .await;
    let assembly_update = server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path("/projects/pathsafetest/C-123/")
                .json_body(json!({"assembly": "s3://pathsafetest-published-assembly/C-123.assembly.fasta"}));
            then.status(200).json_body(json!({"data": {}}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/projects/pathsafetest/C-123/")
                .query_param("scope", "admin");
            then.status(200).json_body(json!({"data": {
                "cid": "C-123",
                "sample_id": "s1",
                "run_name": "r1",
                "suppressed": true,
                "species": "salmonella",
                "notes": ""
            }}));
        })
        .await;
    let submission = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/genomes")
                .header("X-API-Key", "pw-key")
                .json_body(json!({
                    "url": "memory://pathsafetest-published-assembly/C-123.assembly.fasta?X-Amz-Expires=86400",
                    "collectionId": 41,
                    "metadata": {"cid": "C-123", "species": "salmonella"}
                }));
            then.status(201).json_body(json!({"id": "pw-9"}));
        })
        .await;
    let pathogenwatch_update = server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path("/projects/pathsafetest/C-123/")
                .json_body(json!({"pathogenwatch_uuid": "pw-9"}));
            then.status(200).json_body(json!({"data": {}}));
        })
        .await;
    let unsuppress = server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path("/projects/pathsafetest/C-123/")
                .json_body(json!({"suppressed": false}));
            then.status(200).json_body(json!({"data": {}}));
        })
        .await;

    let h = harness(&server, FakeRunner::new("1\tassemble:shovill\tCOMPLETED\t0\n")).await?;
    let uuid = h.submit(json!({})).await?;
    assert!(h.validator.run_once(Some(Duration::from_secs(1))).await?);

    create.assert_async().await;
    assembly_update.assert_async().await;
    submission.assert_async().await;
    pathogenwatch_update.assert_async().await;
    unsuppress.assert_async().await;

    let result = h.result();
    assert_eq!(result["ingested"], true);
    assert_eq!(result["created"], true);
    assert_eq!(result["cid"], "C-123");
    assert_eq!(result["ingest_errors"], json!([]));

    let announced = h.bus.published(NEW_ARTIFACT);
    assert_eq!(announced.len(), 1);
    assert_eq!(announced[0]["cid"], "C-123");
    assert_eq!(announced[0]["match_uuid"], uuid.as_str());

    assert_eq!(
        h.store.object("pathsafetest-published-assembly", "C-123.assembly.fasta"),
        Some(b">contig_1\nACGT\n".to_vec())
    );
    assert!(h.result_dir.join(&uuid).join("nextflow.stdout").exists());
    assert_eq!(h.runner.cleaned.load(Ordering::SeqCst), 1);
    assert_eq!(h.bus.unacked(), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_process_blocks_onyx_create() -> Result<()> {
    let server = MockServer::start_async().await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST).path("/projects/pathsafetest/");
            then.status(201).json_body(json!({"data": {"cid": "C-123"}}));
        })
        .await;

    let h = harness(&server, FakeRunner::new("1\tassemble:shovill\tFAILED\t1\n")).await?;
    h.submit(json!({})).await?;
    assert!(h.validator.run_once(Some(Duration::from_secs(1))).await?);

    create.assert_hits_async(0).await;
    let result = h.result();
    assert_eq!(result["ingested"], false);
    assert_eq!(
        result["ingest_errors"],
        json!(["PATH-SAFE validation pipeline failed in process shovill with exit code 1 and status FAILED"])
    );
    assert!(h.bus.published(NEW_ARTIFACT).is_empty());
    assert_eq!(h.runner.cleaned.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_unvalidated_payload_is_passed_through() -> Result<()> {
    let server = MockServer::start_async().await;
    let h = harness(&server, FakeRunner::new("")).await?;
    h.submit(json!({"validate": false})).await?;
    assert!(h.validator.run_once(Some(Duration::from_secs(1))).await?);

    assert_eq!(h.runner.executed.load(Ordering::SeqCst), 0);
    assert_eq!(h.result()["validate"], false);
    assert_eq!(h.runner.cleaned.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_test_flag_stops_after_pipeline() -> Result<()> {
    let server = MockServer::start_async().await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST).path("/projects/pathsafetest/");
            then.status(201).json_body(json!({"data": {"cid": "C-123"}}));
        })
        .await;

    let h = harness(&server, FakeRunner::new("1\tassemble:shovill\tCOMPLETED\t0\n")).await?;
    h.submit(json!({"test_flag": true})).await?;
    assert!(h.validator.run_once(Some(Duration::from_secs(1))).await?);

    create.assert_hits_async(0).await;
    let result = h.result();
    assert_eq!(result["test_ingest_result"], true);
    assert_eq!(result["ingested"], false);
    Ok(())
}

#[tokio::test]
async fn test_other_project_is_ignored() -> Result<()> {
    let server = MockServer::start_async().await;
    let h = harness(&server, FakeRunner::new("")).await?;
    h.submit(json!({"project": "mscapetest"})).await?;
    assert!(h.validator.run_once(Some(Duration::from_secs(1))).await?);

    assert!(h.bus.published(RESULTS).is_empty());
    assert_eq!(h.bus.unacked(), 0);
    Ok(())
}

#[tokio::test]
async fn test_bus_failure_lets_running_validation_finish() -> Result<()> {
    let server = MockServer::start_async().await;
    let h = harness(&server, FakeRunner::new("")).await?;
    h.submit(json!({"test_flag": true})).await?;

    let runner = Arc::new(
        FakeRunner::new("1\tassemble:shovill\tCOMPLETED\t0\n").with_delay(Duration::from_millis(200)),
    );
    let bus = Arc::new(DroppingBus {
        inner: h.bus.clone(),
        receives: AtomicUsize::new(0),
    });
    let validator = Arc::new(Validator::new(
        Arc::new(PathsafeHandler::new(
            PROJECT,
            PathogenwatchClient::new(&server.url("/genomes"), "pw-key", 41),
        )),
        runner.clone(),
        h.store.clone(),
        OnyxRecords::new(common::onyx(&server).await, h.store.clone()),
        bus,
        h.result_dir.clone(),
    ));

    assert!(validator.run(2).await.is_err());

    assert_eq!(runner.executed.load(Ordering::SeqCst), 1);
    assert_eq!(h.result()["test_ingest_result"], true);
    assert_eq!(h.bus.unacked(), 0);
    Ok(())
}
