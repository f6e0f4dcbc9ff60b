//! Bucket notification emulator: lists ingest buckets on an interval and
//! publishes an object-created event for each new object.

use crate::core::bucket_map::BucketMap;
use crate::domain::model::{
    MetadataEntry, ObjectSummary, RequestParameters, ResponseElements, S3Bucket, S3Entity,
    S3Event, S3EventRecord, S3Object, UserIdentity,
};
use crate::domain::ports::{send_json, MessageBus, ObjectStore};
use crate::utils::error::Result;
use chrono::{DateTime, SubsecRound, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub const S3_EXCHANGE: &str = "inbound.s3";
pub const INGEST_KIND: &str = "ingest";
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Build the Ceph-style event for a listed object.
pub fn object_to_event(obj: &ObjectSummary) -> S3Event {
    let owner = obj.owner_id.clone();
    let bucket_arn = format!("arn:aws:s3:::{}", obj.bucket);

    S3Event {
        records: vec![S3EventRecord {
            event_version: "2.2".to_string(),
            event_source: "ceph:s3".to_string(),
            aws_region: String::new(),
            event_time: obj.last_modified.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            event_name: "ObjectCreated:Put".to_string(),
            user_identity: UserIdentity {
                principal_id: owner.clone(),
            },
            request_parameters: RequestParameters {
                source_ip_address: obj.owner_display_name.clone(),
            },
            response_elements: ResponseElements {
                request_id: owner.clone(),
                id_2: owner.clone(),
            },
            s3: S3Entity {
                s3_schema_version: "1.0".to_string(),
                configuration_id: S3_EXCHANGE.to_string(),
                bucket: S3Bucket {
                    name: obj.bucket.clone(),
                    owner_identity: UserIdentity::default(),
                    arn: bucket_arn.clone(),
                    id: bucket_arn,
                },
                object: S3Object {
                    key: obj.key.clone(),
                    size: obj.size,
                    e_tag: obj.etag.replace('"', ""),
                    version_id: String::new(),
                    sequencer: owner.clone(),
                    metadata: vec![
                        MetadataEntry {
                            key: "x-amz-content-sha256".to_string(),
                            val: "UNSIGNED-PAYLOAD".to_string(),
                        },
                        MetadataEntry {
                            key: "x-amz-date".to_string(),
                            val: "testdata".to_string(),
                        },
                    ],
                    tags: Vec::new(),
                },
            },
            event_id: owner.clone(),
            opaque_data: owner,
        }],
    }
}

pub fn now_seconds() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

struct WatchedBucket {
    name: String,
    queue_suffix: &'static str,
}

pub struct NotificationService {
    store: Arc<dyn ObjectStore>,
    bus: Arc<dyn MessageBus>,
    buckets: Vec<WatchedBucket>,
    /// bucket -> (key, etag) already published
    sent: HashMap<String, HashSet<(String, String)>>,
}

impl NotificationService {
    pub fn new(store: Arc<dyn ObjectStore>, bus: Arc<dyn MessageBus>, bucket_map: &BucketMap) -> Self {
        // project ingest buckets feed ingest directly, site ingest buckets go through the matcher
        let mut buckets: Vec<WatchedBucket> = bucket_map
            .project_buckets_of_kind(INGEST_KIND)
            .map(|(_, b)| WatchedBucket {
                name: b.name.clone(),
                queue_suffix: "ingest",
            })
            .collect();
        buckets.extend(
            bucket_map
                .site_buckets_of_kind(INGEST_KIND)
                .map(|(_, _, b)| WatchedBucket {
                    name: b.name.clone(),
                    queue_suffix: "s3_matcher",
                }),
        );

        tracing::info!(buckets = buckets.len(), "👀 watching ingest buckets");
        Self {
            store,
            bus,
            buckets,
            sent: HashMap::new(),
        }
    }

    async fn list_or_empty(&self, bucket: &str) -> Result<Vec<ObjectSummary>> {
        match self.store.list_objects(bucket).await {
            Ok(objects) => Ok(objects),
            Err(e) if e.is_s3_code("NoSuchBucket") => {
                tracing::debug!(bucket, "bucket does not exist yet");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Publish events for objects modified within `[start, end]`. Returns the
    /// number of events sent.
    pub async fn poll_window(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize> {
        tracing::info!("Checking for new objects between {} and {}", start, end);
        let mut sent_count = 0;

        for index in 0..self.buckets.len() {
            let (name, suffix) = {
                let bucket = &self.buckets[index];
                (bucket.name.clone(), bucket.queue_suffix)
            };
            let objects = self.list_or_empty(&name).await?;

            for obj in objects {
                if obj.last_modified < start || obj.last_modified > end {
                    continue;
                }

                let marker = (obj.key.clone(), obj.etag.clone());
                if self.sent.get(&name).is_some_and(|s| s.contains(&marker)) {
                    tracing::info!(key = %obj.key, "Object already sent");
                    continue;
                }

                tracing::info!(bucket = %name, key = %obj.key, "📨 New object");
                send_json(self.bus.as_ref(), &object_to_event(&obj), S3_EXCHANGE, suffix).await?;
                self.sent.entry(name.clone()).or_default().insert(marker);
                sent_count += 1;
            }
        }

        Ok(sent_count)
    }

    /// Poll forever, each window starting where the previous one ended.
    pub async fn run(&mut self, interval: Duration) -> Result<()> {
        let mut start = now_seconds();
        loop {
            tracing::info!("Sleeping for {} seconds", interval.as_secs());
            tokio::time::sleep(interval).await;
            let end = now_seconds();
            self.poll_window(start, end).await?;
            start = end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryBus, MemoryStore};
    use crate::config::roz_config::tests::TEST_CONFIG;
    use crate::config::RozConfig;
    use chrono::TimeZone;

    #[test]
    fn test_object_to_event_fields() {
        let obj = ObjectSummary {
            bucket: "mscapetest-birm-ont-prod".to_string(),
            key: "mscapetest.sample-test.run-test.ont.csv".to_string(),
            etag: "\"c48a8da4\"".to_string(),
            size: 275,
            last_modified: Utc.with_ymd_and_hms(2023, 10, 10, 6, 39, 35).unwrap(),
            owner_id: "testuser".to_string(),
            owner_display_name: "Test User".to_string(),
        };

        let event = object_to_event(&obj);
        let record = &event.records[0];
        assert_eq!(record.event_time, "2023-10-10T06:39:35Z");
        assert_eq!(record.etag(), "c48a8da4");
        assert_eq!(record.uploader(), "testuser");
        assert_eq!(record.request_parameters.source_ip_address, "Test User");
        assert_eq!(record.s3.object.sequencer, "testuser");
        assert_eq!(record.s3.bucket.arn, "arn:aws:s3:::mscapetest-birm-ont-prod");
        assert_eq!(record.s3.configuration_id, "inbound.s3");

        let metadata = serde_json::to_value(&record.s3.object.metadata).unwrap();
        assert_eq!(
            metadata,
            serde_json::json!([
                {"key": "x-amz-content-sha256", "val": "UNSIGNED-PAYLOAD"},
                {"key": "x-amz-date", "val": "testdata"}
            ])
        );
    }

    #[tokio::test]
    async fn test_window_bounds_are_inclusive() {
        let config = RozConfig::from_json_str(TEST_CONFIG).unwrap();
        let buckets = BucketMap::from_config(&config).unwrap();
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        bus.bind(S3_EXCHANGE, "s3_matcher");

        let bucket = "mscapetest-birm-ont-prod";
        store.create_bucket(bucket).await.unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 12, 10, 0).unwrap();
        let second = chrono::Duration::seconds(1);

        store.put_object_at(bucket, "at_start.csv", b"a", start).unwrap();
        store.put_object_at(bucket, "at_end.csv", b"b", end).unwrap();
        store.put_object_at(bucket, "before.csv", b"c", start - second).unwrap();
        store.put_object_at(bucket, "after.csv", b"d", end + second).unwrap();

        let mut service = NotificationService::new(store, bus.clone(), &buckets);
        assert_eq!(service.poll_window(start, end).await.unwrap(), 2);

        let keys: Vec<String> = bus
            .published(S3_EXCHANGE)
            .iter()
            .map(|e| e["Records"][0]["s3"]["object"]["key"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(keys, vec!["at_end.csv", "at_start.csv"]);
    }
}
