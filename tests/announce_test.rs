use anyhow::Result;
use httpmock::prelude::*;
use roz::adapters::{MemoryBus, SlackWebhook};
use roz::config::SlackSettings;
use roz::core::announce::{channels_for, Announcer, QUEUE_SUFFIX};
use roz::domain::ports::MessageBus;
use serde_json::json;
use std::sync::Arc;

fn announcer(server: &MockServer, bus: &Arc<MemoryBus>) -> Result<Announcer> {
    let slack = SlackSettings {
        new_artifact_webhook: Some(server.url("/hooks/new")),
        pathsafe_alert_webhook: Some(server.url("/hooks/alert")),
        ..SlackSettings::default()
    };
    let channels = channels_for("pathsafe", &slack)?;
    for channel in &channels {
        bus.bind(&channel.exchange, QUEUE_SUFFIX);
    }
    Ok(Announcer::new(bus.clone(), Arc::new(SlackWebhook::new()), channels))
}

#[tokio::test]
async fn test_new_artifact_is_posted() -> Result<()> {
    let server = MockServer::start_async().await;
    let hook = server
        .mock_async(|when, then| {
            when.method(POST).path("/hooks/new").json_body(json!({
                "text": "*New PATH-SAFE Artifact Published*\n```\n{\n  \"cid\": \"C-1\"\n}\n```\n"
            }));
            then.status(200);
        })
        .await;

    let bus = Arc::new(MemoryBus::new());
    let announcer = announcer(&server, &bus)?;
    bus.send(&json!({"cid": "C-1"}), "inbound.new_artifact.pathsafe", "validator")
        .await?;

    assert_eq!(announcer.run_once().await?, 1);
    hook.assert_async().await;
    assert_eq!(bus.queued("inbound.new_artifact.pathsafe", QUEUE_SUFFIX), 0);
    assert_eq!(bus.unacked(), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_post_requeues_message() -> Result<()> {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/hooks/alert");
            then.status(500);
        })
        .await;

    let bus = Arc::new(MemoryBus::new());
    let announcer = announcer(&server, &bus)?;
    bus.send(&json!({"alert": "hcid detected"}), "pathsafe.restricted.announce", "validator")
        .await?;

    assert!(announcer.run_once().await.is_err());
    assert_eq!(bus.unacked(), 0);
    assert_eq!(bus.queued("pathsafe.restricted.announce", QUEUE_SUFFIX), 1);
    Ok(())
}
