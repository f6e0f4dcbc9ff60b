use crate::domain::model::{ObjectSummary, StoredObject};
use crate::utils::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// S3-compatible object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_objects(&self, bucket: &str) -> Result<Vec<ObjectSummary>>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<StoredObject>;

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;

    async fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> Result<()> {
        let body = tokio::fs::read(path).await?;
        self.put_object(bucket, key, body).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    async fn head_bucket(&self, bucket: &str) -> Result<()>;

    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    async fn get_bucket_policy(&self, bucket: &str) -> Result<String>;

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<()>;

    async fn delete_bucket_policy(&self, bucket: &str) -> Result<()>;

    async fn presign_get(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<String>;
}

/// Builds a store acting with one set of credentials.
pub trait StoreFactory: Send + Sync {
    fn store_for(&self, access_key_id: &str, secret_access_key: &str) -> Result<Arc<dyn ObjectStore>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub exchange: String,
    pub tag: u64,
}

impl Delivery {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Fanout message bus. Queues are named `{exchange}.{queue_suffix}`.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn send(&self, message: &Value, exchange: &str, queue_suffix: &str) -> Result<()>;

    /// Waits up to `timeout` (forever when `None`) for one message.
    async fn receive(
        &self,
        exchange: &str,
        queue_suffix: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Delivery>>;

    /// Everything currently queued, without waiting.
    async fn receive_batch(&self, exchange: &str, queue_suffix: &str) -> Result<Vec<Delivery>>;

    async fn acknowledge(&self, delivery: &Delivery) -> Result<()>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;
}

pub async fn send_json<T: Serialize + Sync>(
    bus: &dyn MessageBus,
    message: &T,
    exchange: &str,
    queue_suffix: &str,
) -> Result<()> {
    let value = serde_json::to_value(message)?;
    bus.send(&value, exchange, queue_suffix).await
}

/// Raw Onyx reply: HTTP status plus decoded body (`Value::Null` if empty).
#[derive(Debug, Clone, PartialEq)]
pub struct OnyxResponse {
    pub status: u16,
    pub body: Value,
}

impl OnyxResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn data(&self) -> Option<&Value> {
        self.body.get("data")
    }

    /// Messages keyed by field from an error body (`{"messages": {field: [..]}}`).
    pub fn messages(&self) -> BTreeMap<String, Vec<String>> {
        let mut out = BTreeMap::new();
        let Some(messages) = self.body.get("messages").and_then(Value::as_object) else {
            return out;
        };
        for (field, value) in messages {
            let entries = match value {
                Value::Array(items) => items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect(),
                Value::String(s) => vec![s.clone()],
                other => vec![other.to_string()],
            };
            out.insert(field.clone(), entries);
        }
        out
    }
}

/// Metadata store client.
#[async_trait]
pub trait OnyxApi: Send + Sync {
    async fn filter(
        &self,
        project: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<OnyxResponse>;

    /// One request per CSV row; `fields` are merged into every row.
    async fn csv_create(
        &self,
        project: &str,
        csv: &[u8],
        fields: &BTreeMap<String, Value>,
        test: bool,
    ) -> Result<Vec<OnyxResponse>>;

    async fn get(&self, project: &str, cid: &str) -> Result<OnyxResponse>;

    async fn update(&self, project: &str, cid: &str, fields: &Value) -> Result<OnyxResponse>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineOutcome {
    pub return_code: i32,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub command: Vec<String>,
}

/// External workflow engine.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn execute(&self, params: &BTreeMap<String, String>) -> Result<PipelineOutcome>;

    /// Removes the run's work files, identified from the run's stdout.
    async fn cleanup(&self, stdout: &str) -> Result<PipelineOutcome>;
}

/// Chat webhook poster.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post(&self, webhook: &str, text: &str) -> Result<()>;
}
