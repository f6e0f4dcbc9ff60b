//! In-process implementations of the storage and bus ports.
//!
//! `MemoryStore` keeps buckets in a shared map. Handles created through
//! [`StoreFactory`] act as a named user and are subject to bucket policies
//! (`Allow` statements naming `arn:aws:iam:::user/{name}`); without a policy
//! only the bucket's creator may touch it. The root handle bypasses policies.
//!
//! `MemoryBus` models fanout exchanges: every queue bound to an exchange gets
//! its own copy of each message.

use crate::domain::model::{ObjectSummary, StoredObject};
use crate::domain::ports::{Delivery, MessageBus, ObjectStore, StoreFactory};
use crate::utils::error::{Result, RozError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct MemoryObject {
    body: Vec<u8>,
    etag: String,
    last_modified: DateTime<Utc>,
    owner: String,
}

#[derive(Debug, Default)]
struct MemoryBucket {
    owner: String,
    objects: BTreeMap<String, MemoryObject>,
    policy: Option<String>,
}

#[derive(Debug, Default)]
struct StoreState {
    buckets: HashMap<String, MemoryBucket>,
    /// access key id -> username
    users: HashMap<String, String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn content_etag(body: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("{:016x}{:016x}", hasher.finish(), body.len())
}

const ROOT_USER: &str = "admin";

#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    /// `None` is the root handle.
    user: Option<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            user: None,
        }
    }

    /// Register a user the factory can hand out handles for.
    pub fn add_user(&self, access_key_id: &str, username: &str) {
        lock(&self.state)
            .users
            .insert(access_key_id.to_string(), username.to_string());
    }

    /// Handle acting as `username`.
    pub fn as_user(&self, username: &str) -> MemoryStore {
        MemoryStore {
            state: Arc::clone(&self.state),
            user: Some(username.to_string()),
        }
    }

    /// Store an object with an explicit modification time.
    pub fn put_object_at(&self, bucket: &str, key: &str, body: &[u8], at: DateTime<Utc>) -> Result<String> {
        let mut state = lock(&self.state);
        let owner = self.user.clone().unwrap_or_else(|| ROOT_USER.to_string());
        let bucket = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket(bucket))?;
        let etag = content_etag(body);
        bucket.objects.insert(
            key.to_string(),
            MemoryObject {
                body: body.to_vec(),
                etag: etag.clone(),
                last_modified: at,
                owner,
            },
        );
        Ok(etag)
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        lock(&self.state)
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.body.clone())
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        lock(&self.state)
            .buckets
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn policy(&self, bucket: &str) -> Option<String> {
        lock(&self.state)
            .buckets
            .get(bucket)
            .and_then(|b| b.policy.clone())
    }

    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).buckets.keys().cloned().collect();
        names.sort();
        names
    }

    fn authorize(&self, state: &StoreState, bucket: &str, action: &str) -> Result<()> {
        let Some(user) = &self.user else {
            return Ok(());
        };
        let bucket_state = state.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;

        let allowed = match &bucket_state.policy {
            Some(policy) => policy_allows(policy, user, action),
            None => &bucket_state.owner == user,
        };

        if allowed {
            Ok(())
        } else {
            Err(RozError::s3(
                "AccessDenied",
                format!("{} may not {} on {}", user, action, bucket),
            ))
        }
    }
}

fn no_such_bucket(bucket: &str) -> RozError {
    RozError::s3("NoSuchBucket", format!("The specified bucket does not exist: {}", bucket))
}

fn as_list(value: Option<&Value>) -> Vec<&str> {
    match value {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn policy_allows(policy: &str, user: &str, action: &str) -> bool {
    let Ok(policy) = serde_json::from_str::<Value>(policy) else {
        return false;
    };
    let principal = format!("arn:aws:iam:::user/{}", user);

    let statements = match policy.get("Statement") {
        Some(Value::Array(items)) => items.iter().collect::<Vec<_>>(),
        Some(single @ Value::Object(_)) => vec![single],
        _ => Vec::new(),
    };

    statements.into_iter().any(|statement| {
        let effect_allows = statement.get("Effect").and_then(Value::as_str) == Some("Allow");
        let principals = as_list(statement.get("Principal").and_then(|p| p.get("AWS")));
        let actions = as_list(statement.get("Action"));

        effect_allows
            && principals.iter().any(|p| *p == principal || *p == "*")
            && actions.iter().any(|a| *a == action || *a == "s3:*")
    })
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_objects(&self, bucket: &str) -> Result<Vec<ObjectSummary>> {
        let state = lock(&self.state);
        self.authorize(&state, bucket, "s3:ListBucket")?;
        let bucket_state = state.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;

        Ok(bucket_state
            .objects
            .iter()
            .map(|(key, obj)| ObjectSummary {
                bucket: bucket.to_string(),
                key: key.clone(),
                etag: format!("\"{}\"", obj.etag),
                size: obj.body.len() as i64,
                last_modified: obj.last_modified,
                owner_id: obj.owner.clone(),
                owner_display_name: obj.owner.clone(),
            })
            .collect())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        let state = lock(&self.state);
        self.authorize(&state, bucket, "s3:GetObject")?;
        let bucket_state = state.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        let obj = bucket_state
            .objects
            .get(key)
            .ok_or_else(|| RozError::s3("NoSuchKey", format!("The specified key does not exist: {}", key)))?;

        Ok(StoredObject {
            body: obj.body.clone(),
            etag: format!("\"{}\"", obj.etag),
        })
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        {
            let state = lock(&self.state);
            self.authorize(&state, bucket, "s3:PutObject")?;
        }
        self.put_object_at(bucket, key, &body, Utc::now())?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let mut state = lock(&self.state);
        self.authorize(&state, bucket, "s3:DeleteObject")?;
        if let Some(bucket_state) = state.buckets.get_mut(bucket) {
            bucket_state.objects.remove(key);
        }
        Ok(())
    }

    async fn head_bucket(&self, bucket: &str) -> Result<()> {
        if lock(&self.state).buckets.contains_key(bucket) {
            Ok(())
        } else {
            Err(no_such_bucket(bucket))
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if state.buckets.contains_key(bucket) {
            return Err(RozError::s3(
                "BucketAlreadyExists",
                format!("bucket {} already exists", bucket),
            ));
        }
        state.buckets.insert(
            bucket.to_string(),
            MemoryBucket {
                owner: self.user.clone().unwrap_or_else(|| ROOT_USER.to_string()),
                ..MemoryBucket::default()
            },
        );
        Ok(())
    }

    async fn get_bucket_policy(&self, bucket: &str) -> Result<String> {
        let state = lock(&self.state);
        self.authorize(&state, bucket, "s3:GetBucketPolicy")?;
        state
            .buckets
            .get(bucket)
            .and_then(|b| b.policy.clone())
            .ok_or_else(|| RozError::s3("NoSuchBucketPolicy", format!("no policy on {}", bucket)))
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<()> {
        serde_json::from_str::<Value>(policy)
            .map_err(|e| RozError::s3("MalformedPolicy", e.to_string()))?;
        let mut state = lock(&self.state);
        self.authorize(&state, bucket, "s3:PutBucketPolicy")?;
        if let Some(bucket_state) = state.buckets.get_mut(bucket) {
            bucket_state.policy = Some(policy.to_string());
        }
        Ok(())
    }

    async fn delete_bucket_policy(&self, bucket: &str) -> Result<()> {
        let mut state = lock(&self.state);
        self.authorize(&state, bucket, "s3:DeleteBucketPolicy")?;
        if let Some(bucket_state) = state.buckets.get_mut(bucket) {
            bucket_state.policy = None;
        }
        Ok(())
    }

    async fn presign_get(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<String> {
        self.head_bucket(bucket).await?;
        Ok(format!(
            "memory://{}/{}?X-Amz-Expires={}",
            bucket,
            key,
            expires_in.as_secs()
        ))
    }
}

impl StoreFactory for MemoryStore {
    fn store_for(&self, access_key_id: &str, _secret_access_key: &str) -> Result<Arc<dyn ObjectStore>> {
        let username = lock(&self.state).users.get(access_key_id).cloned();
        match username {
            Some(name) if name == ROOT_USER => Ok(Arc::new(self.as_root())),
            Some(name) => Ok(Arc::new(self.as_user(&name))),
            None => Err(RozError::s3(
                "InvalidAccessKeyId",
                format!("unknown access key {}", access_key_id),
            )),
        }
    }
}

impl MemoryStore {
    fn as_root(&self) -> MemoryStore {
        MemoryStore {
            state: Arc::clone(&self.state),
            user: None,
        }
    }
}

// ---- bus ----

#[derive(Debug, Default)]
struct BusState {
    /// exchange -> bound queue names
    bindings: HashMap<String, HashSet<String>>,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    unacked: HashMap<u64, (String, Vec<u8>)>,
    next_tag: u64,
    published: Vec<(String, Value)>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
}

fn queue_name(exchange: &str, queue_suffix: &str) -> String {
    format!("{}.{}", exchange, queue_suffix)
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare and bind `{exchange}.{queue_suffix}`.
    pub fn bind(&self, exchange: &str, queue_suffix: &str) {
        let mut state = lock(&self.state);
        Self::bind_locked(&mut state, exchange, queue_suffix);
    }

    fn bind_locked(state: &mut BusState, exchange: &str, queue_suffix: &str) -> String {
        let queue = queue_name(exchange, queue_suffix);
        state
            .bindings
            .entry(exchange.to_string())
            .or_default()
            .insert(queue.clone());
        state.queues.entry(queue.clone()).or_default();
        queue
    }

    /// Every message published to `exchange`, in order.
    pub fn published(&self, exchange: &str) -> Vec<Value> {
        lock(&self.state)
            .published
            .iter()
            .filter(|(ex, _)| ex == exchange)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn queued(&self, exchange: &str, queue_suffix: &str) -> usize {
        lock(&self.state)
            .queues
            .get(&queue_name(exchange, queue_suffix))
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn unacked(&self) -> usize {
        lock(&self.state).unacked.len()
    }

    fn pop(&self, exchange: &str, queue_suffix: &str) -> Option<Delivery> {
        let mut state = lock(&self.state);
        let queue = Self::bind_locked(&mut state, exchange, queue_suffix);
        let body = state.queues.get_mut(&queue)?.pop_front()?;
        state.next_tag += 1;
        let tag = state.next_tag;
        state.unacked.insert(tag, (queue, body.clone()));
        Some(Delivery {
            body,
            exchange: exchange.to_string(),
            tag,
        })
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn send(&self, message: &Value, exchange: &str, queue_suffix: &str) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        {
            let mut state = lock(&self.state);
            Self::bind_locked(&mut state, exchange, queue_suffix);
            let queues: Vec<String> = state
                .bindings
                .get(exchange)
                .map(|q| q.iter().cloned().collect())
                .unwrap_or_default();
            for queue in queues {
                state.queues.entry(queue).or_default().push_back(body.clone());
            }
            state.published.push((exchange.to_string(), message.clone()));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        exchange: &str,
        queue_suffix: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Delivery>> {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if let Some(delivery) = self.pop(exchange, queue_suffix) {
                    return delivery;
                }
                notified.await;
            }
        };

        match timeout {
            Some(limit) => Ok(tokio::time::timeout(limit, wait).await.ok()),
            None => Ok(Some(wait.await)),
        }
    }

    async fn receive_batch(&self, exchange: &str, queue_suffix: &str) -> Result<Vec<Delivery>> {
        let mut batch = Vec::new();
        while let Some(delivery) = self.pop(exchange, queue_suffix) {
            batch.push(delivery);
        }
        Ok(batch)
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<()> {
        lock(&self.state)
            .unacked
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or_else(|| RozError::BusProtocolError {
                message: format!("unknown delivery tag {}", delivery.tag),
            })
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        {
            let mut state = lock(&self.state);
            let (queue, body) = state.unacked.remove(&delivery.tag).ok_or_else(|| {
                RozError::BusProtocolError {
                    message: format!("unknown delivery tag {}", delivery.tag),
                }
            })?;
            if requeue {
                state.queues.entry(queue).or_default().push_front(body);
            }
        }
        if requeue {
            self.notify.notify_waiters();
        }
        Ok(())
    }
}
