//! Validation stage: runs a project's Nextflow pipeline over an ingested
//! artifact, creates its Onyx record and publishes the derived files.

pub mod mscape;
pub mod pathsafe;

use crate::core::records::OnyxRecords;
use crate::domain::model::{now_ns, IngestPayload, NewArtifact};
use crate::domain::ports::{send_json, Delivery, MessageBus, ObjectStore, PipelineRunner};
use crate::utils::error::{Result, RozError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub use mscape::MscapeHandler;
pub use pathsafe::PathsafeHandler;

pub const QUEUE_SUFFIX: &str = "validator";
pub const DEFAULT_WORKERS: usize = 5;

/// One row of a Nextflow execution trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    /// Last `:` separated part of the task name.
    pub process: String,
    pub exit: String,
    pub status: String,
}

impl TraceEntry {
    pub fn failed(&self) -> bool {
        self.exit != "0"
    }
}

/// Parse `execution_trace_{uuid}.txt` (tab separated, with header). A later
/// row for the same process replaces the earlier one.
pub fn parse_trace(path: &Path) -> Result<Vec<TraceEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| RozError::processing(format!("trace has no '{}' column", name)))
    };
    let (name_col, exit_col, status_col) = (column("name")?, column("exit")?, column("status")?);

    let mut entries: Vec<TraceEntry> = Vec::new();
    for row in reader.records() {
        let row = row?;
        let name = row.get(name_col).unwrap_or_default();
        let entry = TraceEntry {
            process: name.rsplit(':').next().unwrap_or(name).to_string(),
            exit: row.get(exit_col).unwrap_or_default().to_string(),
            status: row.get(status_col).unwrap_or_default().to_string(),
        };

        match entries.iter_mut().find(|e| e.process == entry.process) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }
    Ok(entries)
}

pub fn trace_path(result_path: &Path, uuid: &str) -> PathBuf {
    result_path
        .join("pipeline_info")
        .join(format!("execution_trace_{}.txt", uuid))
}

fn log_worker(finished: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match finished {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Worker failed: {}", e),
        Err(e) => tracing::error!("Worker failed with unhandled exception {}", e),
    }
}

/// What a handler's publish step gets to work with.
pub struct PublishContext<'a> {
    pub store: &'a dyn ObjectStore,
    pub records: &'a OnyxRecords,
    /// `{result_dir}/{uuid}`
    pub result_path: &'a Path,
}

/// Project specific parts of validation.
#[async_trait]
pub trait ArtifactHandler: Send + Sync {
    /// Project family used in result exchange names.
    fn stem(&self) -> &str;

    /// Onyx project this handler validates; other projects are dropped.
    fn project(&self) -> &str;

    fn parameters(&self, payload: &IngestPayload, result_dir: &Path) -> Result<BTreeMap<String, String>>;

    /// Ingest error for a failed trace entry.
    fn trace_error(&self, entry: &TraceEntry) -> String;

    /// Publish derived files after the record was created. Returns `true`
    /// on failure.
    async fn publish(&self, ctx: &PublishContext<'_>, payload: &mut IngestPayload) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Message for another project.
    Ignored,
    Completed { payload: IngestPayload, ingested: bool },
}

pub struct Validator {
    handler: Arc<dyn ArtifactHandler>,
    runner: Arc<dyn PipelineRunner>,
    store: Arc<dyn ObjectStore>,
    records: OnyxRecords,
    bus: Arc<dyn MessageBus>,
    result_dir: PathBuf,
}

impl Validator {
    pub fn new(
        handler: Arc<dyn ArtifactHandler>,
        runner: Arc<dyn PipelineRunner>,
        store: Arc<dyn ObjectStore>,
        records: OnyxRecords,
        bus: Arc<dyn MessageBus>,
        result_dir: PathBuf,
    ) -> Self {
        Self {
            handler,
            runner,
            store,
            records,
            bus,
            result_dir,
        }
    }

    pub fn to_validate_exchange(&self) -> String {
        format!("inbound.to_validate.{}", self.handler.project())
    }

    fn results_exchange(&self, site: &str) -> String {
        format!("inbound.results.{}.{}", self.handler.stem(), site)
    }

    fn new_artifact_exchange(&self) -> String {
        format!("inbound.new_artifact.{}", self.handler.stem())
    }

    async fn cleanup(&self, uuid: &str, stdout: &str) {
        match self.runner.cleanup(stdout).await {
            Ok(outcome) if outcome.timed_out => {
                tracing::error!(%uuid, "Cleanup of pipeline timed out");
            }
            Ok(outcome) if outcome.return_code != 0 => {
                tracing::error!(
                    %uuid,
                    "Cleanup of pipeline failed with exit code: {}. stdout: {}, stderr: {}",
                    outcome.return_code,
                    outcome.stdout,
                    outcome.stderr
                );
            }
            Ok(_) => tracing::debug!(%uuid, "🧹 pipeline work files cleaned"),
            Err(e) => tracing::error!(%uuid, "Cleanup of pipeline failed: {}", e),
        }
    }

    async fn write_logs(result_path: &Path, stdout: &str, stderr: &str) -> Result<()> {
        tokio::fs::create_dir_all(result_path).await?;
        tokio::fs::write(result_path.join("nextflow.stdout"), stdout).await?;
        tokio::fs::write(result_path.join("nextflow.stderr"), stderr).await?;
        Ok(())
    }

    /// Check the trace of a run that exited 0. Returns `true` on failure.
    fn check_trace(&self, payload: &mut IngestPayload, result_path: &Path) -> bool {
        let entries = match parse_trace(&trace_path(result_path, &payload.uuid)) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(
                    uuid = %payload.uuid,
                    "Could not open pipeline trace despite NXF exit code 0 due to error: {}",
                    e
                );
                payload
                    .ingest_errors
                    .push("couldn't open nxf ingest pipeline trace".to_string());
                return true;
            }
        };

        let mut failed = false;
        for entry in entries.iter().filter(|e| e.failed()) {
            payload.ingest_errors.push(self.handler.trace_error(entry));
            failed = true;
        }
        failed
    }

    /// Run the whole validation of one payload.
    pub async fn validate(&self, mut payload: IngestPayload) -> Outcome {
        tracing::info!(uuid = %payload.uuid, "Started validation");

        if payload.project != self.handler.project() {
            tracing::info!(
                uuid = %payload.uuid,
                project = %payload.project,
                "Ignoring file set for another project"
            );
            return Outcome::Ignored;
        }

        let done = |payload: IngestPayload, ingested: bool| Outcome::Completed { payload, ingested };

        if !payload.onyx_test_create_status || !payload.validate {
            return done(payload, false);
        }

        let params = match self.handler.parameters(&payload, &self.result_dir) {
            Ok(params) => params,
            Err(e) => {
                payload.ingest_errors.push(e.to_string());
                return done(payload, false);
            }
        };

        tracing::info!(uuid = %payload.uuid, "🚀 Submitting validation pipeline");
        let run = match self.runner.execute(&params).await {
            Ok(run) => run,
            Err(e) => {
                tracing::error!(uuid = %payload.uuid, "Validation pipeline could not be started: {}", e);
                payload
                    .ingest_errors
                    .push(format!("Validation pipeline could not be started: {}", e));
                return done(payload, false);
            }
        };
        tracing::info!(uuid = %payload.uuid, "Execution of pipeline complete. Command was: {}", run.command.join(" "));

        if run.timed_out {
            tracing::error!(uuid = %payload.uuid, "Pipeline execution timed out");
            payload.ingest_errors.push("Validation pipeline timeout".to_string());
            return done(payload, false);
        }

        let result_path = self.result_dir.join(&payload.uuid);
        if let Err(e) = Self::write_logs(&result_path, &run.stdout, &run.stderr).await {
            tracing::warn!(uuid = %payload.uuid, "Could not write nextflow logs: {}", e);
        }

        let outcome = self.after_pipeline(payload, run.return_code, &result_path).await;
        if let Outcome::Completed { payload, .. } = &outcome {
            self.cleanup(&payload.uuid, &run.stdout).await;
        }
        outcome
    }

    async fn after_pipeline(&self, mut payload: IngestPayload, return_code: i32, result_path: &Path) -> Outcome {
        let done = |payload: IngestPayload, ingested: bool| Outcome::Completed { payload, ingested };

        if return_code != 0 {
            tracing::error!(uuid = %payload.uuid, "Validation pipeline exited with non-0 exit code: {}", return_code);
            payload.ingest_errors.push(format!(
                "Validation pipeline exited with non-0 exit code: {}",
                return_code
            ));
            return done(payload, false);
        }

        if self.check_trace(&mut payload, result_path) {
            return done(payload, false);
        }

        if payload.test_flag {
            tracing::info!(
                uuid = %payload.uuid,
                artifact = %payload.artifact,
                "Test ingest completed successfully"
            );
            payload.test_ingest_result = true;
            return done(payload, false);
        }

        if self.records.submit_record(&mut payload).await {
            tracing::info!(uuid = %payload.uuid, "Failed to submit to Onyx");
            return done(payload, false);
        }

        tracing::info!(cid = %payload.cid_or_empty(), "Uploading files to long-term storage buckets after successful Onyx submission");
        let ctx = PublishContext {
            store: self.store.as_ref(),
            records: &self.records,
            result_path,
        };
        if self.handler.publish(&ctx, &mut payload).await {
            tracing::error!(cid = %payload.cid_or_empty(), "Failed to publish at least one file to long-term storage");
            return done(payload, false);
        }

        if self.records.unsuppress_record(&mut payload).await {
            return done(payload, false);
        }

        payload.ingested = true;
        tracing::info!(uuid = %payload.uuid, cid = %payload.cid_or_empty(), "✅ Successful ingest");
        done(payload, true)
    }

    async fn send_result(&self, payload: &IngestPayload, ingested: bool) -> Result<()> {
        if ingested {
            let new_artifact = NewArtifact {
                ingest_timestamp: now_ns(),
                cid: payload.cid_or_empty().to_string(),
                site: payload.site.clone(),
                platform: payload.platform.clone(),
                match_uuid: payload.uuid.clone(),
            };
            send_json(self.bus.as_ref(), &new_artifact, &self.new_artifact_exchange(), QUEUE_SUFFIX).await?;
        }

        tracing::info!(uuid = %payload.uuid, "Sending validation result");
        send_json(self.bus.as_ref(), payload, &self.results_exchange(&payload.site), QUEUE_SUFFIX).await
    }

    /// Validate one delivery, send its result and acknowledge it.
    pub async fn process(&self, delivery: Delivery) -> Result<()> {
        match delivery.json::<IngestPayload>() {
            Ok(payload) => {
                if let Outcome::Completed { payload, ingested } = self.validate(payload).await {
                    self.send_result(&payload, ingested).await?;
                }
            }
            Err(e) => tracing::error!("Could not parse validation message, dropping: {}", e),
        }
        self.bus.acknowledge(&delivery).await
    }

    /// Handle at most one message inline. Returns whether one was received.
    pub async fn run_once(&self, timeout: Option<Duration>) -> Result<bool> {
        match self
            .bus
            .receive(&self.to_validate_exchange(), QUEUE_SUFFIX, timeout)
            .await?
        {
            Some(delivery) => {
                self.process(delivery).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Consume forever with up to `n_workers` validations in flight.
    pub async fn run(self: Arc<Self>, n_workers: usize) -> Result<()> {
        let permits = Arc::new(Semaphore::new(n_workers.max(1)));
        let mut workers = JoinSet::new();
        let exchange = self.to_validate_exchange();
        tracing::info!(workers = n_workers.max(1), %exchange, "Successfully initialised worker pool");

        loop {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|e| RozError::processing(format!("worker pool closed: {}", e)))?;

            while let Some(finished) = workers.try_join_next() {
                log_worker(finished);
            }

            let delivery = match self.bus.receive(&exchange, QUEUE_SUFFIX, None).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    // let running validations send their results before giving up
                    tracing::error!(running = workers.len(), "Could not receive from {}: {}", exchange, e);
                    drop(permit);
                    while let Some(finished) = workers.join_next().await {
                        log_worker(finished);
                    }
                    return Err(e);
                }
            };
            tracing::info!(tag = delivery.tag, "Submitting job to the worker pool");

            let validator = Arc::clone(&self);
            workers.spawn(async move {
                let _permit = permit;
                validator.process(delivery).await
            });
        }
    }
}
