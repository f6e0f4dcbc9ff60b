mod common;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use httpmock::prelude::*;
use roz::adapters::{MemoryBus, MemoryStore};
use roz::core::bucket_map::BucketMap;
use roz::core::ingest::IngestService;
use roz::core::matcher::Matcher;
use roz::core::notifications::{now_seconds, NotificationService};
use roz::domain::ports::{MessageBus, ObjectStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const BUCKET: &str = "mscapetest-birm-ont-prod";
const TO_VALIDATE: &str = "inbound.to_validate.mscapetest";

struct Flow {
    store: Arc<MemoryStore>,
    bus: Arc<MemoryBus>,
    notifications: NotificationService,
    matcher: Matcher,
    ingest: IngestService,
}

async fn flow(server: &MockServer) -> Result<Flow> {
    let config = common::roz_config();
    let store = Arc::new(MemoryStore::new());
    store.create_bucket(BUCKET).await?;

    let bus = Arc::new(MemoryBus::new());
    bus.bind("inbound.s3", "s3_matcher");
    bus.bind("inbound.matched", "ingest");
    bus.bind(TO_VALIDATE, "validator");

    let onyx = common::onyx(server).await;
    let buckets = BucketMap::from_config(&config)?;

    Ok(Flow {
        notifications: NotificationService::new(store.clone(), bus.clone(), &buckets),
        matcher: Matcher::new(Arc::new(config), bus.clone(), onyx.clone()),
        ingest: IngestService::new(store.clone(), bus.clone(), onyx),
        store,
        bus,
    })
}

/// Upload both ONT files and push them through notifications and the matcher.
async fn upload_and_match(flow: &mut Flow, csv: &str) -> Result<()> {
    let now = now_seconds();
    flow.store
        .put_object_at(BUCKET, "mscapetest.s1.r1.fastq.gz", b"@read\nACGT\n+\n!!!!\n", now)?;
    flow.store
        .put_object_at(BUCKET, "mscapetest.s1.r1.ont.csv", csv.as_bytes(), now)?;

    let window = ChronoDuration::seconds(60);
    let sent = flow.notifications.poll_window(now - window, now + window).await?;
    assert_eq!(sent, 2);

    assert_eq!(flow.matcher.run_once().await?, 1);
    Ok(())
}

fn forwarded(bus: &MemoryBus) -> Value {
    let published = bus.published(TO_VALIDATE);
    assert_eq!(published.len(), 1);
    published[0].clone()
}

#[tokio::test]
async fn test_upload_reaches_validation_queue() -> Result<()> {
    let server = MockServer::start_async().await;
    let test_create = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/projects/mscapetest/test/")
                .json_body(json!({"sample_id": "s1", "run_name": "r1", "site": "birm"}));
            then.status(201).json_body(json!({"data": {}}));
        })
        .await;

    let mut flow = flow(&server).await?;
    upload_and_match(&mut flow, "sample_id,run_name\ns1,r1\n").await?;

    let matched = flow.bus.published("inbound.matched");
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0]["artifact"], "mscapetest.r1.s1");
    assert_eq!(matched[0]["test_flag"], false);
    assert_eq!(matched[0]["files"].as_object().unwrap().len(), 2);

    assert!(flow.ingest.run_once(Some(Duration::from_secs(1))).await?);
    test_create.assert_async().await;

    let payload = forwarded(&flow.bus);
    assert_eq!(payload["validate"], true);
    assert_eq!(payload["onyx_test_create_status"], true);
    assert_eq!(payload["onyx_test_status_code"], 201);
    assert_eq!(payload["uuid"], matched[0]["uuid"]);
    assert_eq!(flow.bus.queued(TO_VALIDATE, "validator"), 1);
    assert_eq!(flow.bus.unacked(), 0);
    Ok(())
}

#[tokio::test]
async fn test_repeat_poll_does_not_resend() -> Result<()> {
    let server = MockServer::start_async().await;
    let mut flow = flow(&server).await?;
    upload_and_match(&mut flow, "sample_id,run_name\ns1,r1\n").await?;

    let now = Utc::now();
    let sent = flow
        .notifications
        .poll_window(now - ChronoDuration::seconds(120), now + ChronoDuration::seconds(60))
        .await?;
    assert_eq!(sent, 0);
    assert_eq!(flow.matcher.run_once().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_filename_mismatch_is_forwarded_unvalidated() -> Result<()> {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/projects/mscapetest/test/");
            then.status(201).json_body(json!({"data": {}}));
        })
        .await;

    let mut flow = flow(&server).await?;
    upload_and_match(&mut flow, "sample_id,run_name\ns2,r1\n").await?;
    assert!(flow.ingest.run_once(Some(Duration::from_secs(1))).await?);

    let payload = forwarded(&flow.bus);
    assert_eq!(payload["validate"], false);
    assert_eq!(
        payload["onyx_test_create_errors"]["sample_id"],
        json!(["Field does not match filename"])
    );
    Ok(())
}

#[tokio::test]
async fn test_rejected_test_create_keeps_onyx_messages() -> Result<()> {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/projects/mscapetest/test/");
            then.status(400)
                .json_body(json!({"messages": {"collection_date": ["Invalid date."]}}));
        })
        .await;

    let mut flow = flow(&server).await?;
    upload_and_match(&mut flow, "sample_id,run_name,collection_date\ns1,r1,yesterday\n").await?;
    assert!(flow.ingest.run_once(Some(Duration::from_secs(1))).await?);

    let payload = forwarded(&flow.bus);
    assert_eq!(payload["validate"], false);
    assert_eq!(payload["onyx_test_create_status"], false);
    assert_eq!(payload["onyx_test_status_code"], 400);
    assert_eq!(
        payload["onyx_test_create_errors"]["collection_date"],
        json!(["Invalid date."])
    );
    Ok(())
}

/// Replace the csv with new content and push the changed object to the matcher.
async fn reupload_csv(flow: &mut Flow, csv: &str) -> Result<usize> {
    let now = now_seconds();
    flow.store
        .put_object_at(BUCKET, "mscapetest.s1.r1.ont.csv", csv.as_bytes(), now)?;

    let window = ChronoDuration::seconds(60);
    let sent = flow.notifications.poll_window(now - window, now + window).await?;
    assert_eq!(sent, 1);

    Ok(flow.matcher.run_once().await?)
}

async fn mock_filter(server: &MockServer, status: u16, data: Value) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/projects/mscapetest/")
                .query_param("sample_id", "s1")
                .query_param("run_name", "r1")
                .query_param("scope", "admin");
            then.status(status).json_body(json!({"data": data}));
        })
        .await
}

#[tokio::test]
async fn test_identical_etag_is_not_rematched() -> Result<()> {
    let server = MockServer::start_async().await;
    let filter = mock_filter(&server, 200, json!([])).await;

    let mut flow = flow(&server).await?;
    upload_and_match(&mut flow, "sample_id,run_name\ns1,r1\n").await?;

    // the same notification arriving twice
    let events = flow.bus.published("inbound.s3");
    for event in &events {
        flow.bus.send(event, "inbound.s3", "s3_matcher").await?;
    }
    assert_eq!(flow.matcher.run_once().await?, 0);

    filter.assert_hits_async(0).await;
    assert_eq!(flow.bus.published("inbound.matched").len(), 1);
    assert!(flow.matcher.pending().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_changed_etag_resubmits_unrecorded_artifact() -> Result<()> {
    let server = MockServer::start_async().await;
    let filter = mock_filter(&server, 200, json!([])).await;

    let mut flow = flow(&server).await?;
    upload_and_match(&mut flow, "sample_id,run_name\ns1,r1\n").await?;
    let first_etag = flow.bus.published("inbound.matched")[0]["files"][".csv"]["etag"].clone();

    assert_eq!(reupload_csv(&mut flow, "sample_id,run_name,notes\ns1,r1,fixed\n").await?, 1);
    filter.assert_async().await;

    let matched = flow.bus.published("inbound.matched");
    assert_eq!(matched.len(), 2);
    let resubmitted = &matched[1];
    assert_eq!(resubmitted["artifact"], "mscapetest.r1.s1");
    assert_eq!(resubmitted["sample_id"], "s1");
    assert_eq!(resubmitted["run_name"], "r1");
    assert_ne!(resubmitted["uuid"], matched[0]["uuid"]);
    assert_ne!(resubmitted["files"][".csv"]["etag"], first_etag);
    assert_eq!(
        resubmitted["files"][".fastq.gz"]["etag"],
        matched[0]["files"][".fastq.gz"]["etag"]
    );
    assert!(flow.matcher.pending().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_changed_etag_of_ingested_artifact_is_ignored() -> Result<()> {
    let server = MockServer::start_async().await;
    let filter = mock_filter(&server, 200, json!([{"cid": "C-1"}])).await;

    let mut flow = flow(&server).await?;
    upload_and_match(&mut flow, "sample_id,run_name\ns1,r1\n").await?;

    assert_eq!(reupload_csv(&mut flow, "sample_id,run_name\ns1,r1\n\n").await?, 0);
    filter.assert_async().await;
    assert_eq!(flow.bus.published("inbound.matched").len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_onyx_lookup_blocks_resubmission() -> Result<()> {
    let server = MockServer::start_async().await;
    let filter = mock_filter(&server, 500, json!(null)).await;

    let mut flow = flow(&server).await?;
    upload_and_match(&mut flow, "sample_id,run_name\ns1,r1\n").await?;

    assert_eq!(reupload_csv(&mut flow, "sample_id,run_name\ns1,r1\n\n").await?, 0);
    filter.assert_async().await;
    assert_eq!(flow.bus.published("inbound.matched").len(), 1);
    Ok(())
}
