#![allow(dead_code)]

use httpmock::prelude::*;
use roz::adapters::OnyxClient;
use roz::domain::ports::OnyxApi;
use roz::RozConfig;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const ROZ_CONFIG: &str = r#"{
    "version": "0.1",
    "pathogen_configs": ["mscapetest"],
    "configs": {
        "mscapetest": {
            "artifact_layout": "project.run_name.sample_id",
            "sites": ["birm", "bath"],
            "bucket_policies": {
                "site_ingest": ["get", "put", "list", "delete"],
                "project_read": ["get", "list"],
                "project_private": []
            },
            "site_buckets": {
                "ingest": {"name_layout": "{project}-{site}-{platform}-{test_flag}", "policy": "site_ingest"}
            },
            "project_buckets": {
                "published_reads": {"name_layout": "{project}-published-reads", "policy": "project_read"}
            },
            "file_specs": {
                "ont": {
                    "files": [".fastq.gz", ".csv"],
                    ".fastq.gz": {"layout": "project.sample_id.run_name.ftype.gzip", "sections": 5},
                    ".csv": {"layout": "project.sample_id.run_name.platform.ftype", "sections": 5}
                }
            }
        }
    }
}"#;

pub fn roz_config() -> RozConfig {
    RozConfig::from_json_str(ROZ_CONFIG).unwrap()
}

/// Onyx client against `server`, with login already mocked.
pub async fn onyx(server: &MockServer) -> Arc<dyn OnyxApi> {
    server
        .mock_async(|when, then| {
            when.method(POST).path("/accounts/login/");
            then.status(200).json_body(json!({"data": {"token": "test-token"}}));
        })
        .await;
    Arc::new(OnyxClient::new(&server.base_url(), "roz", "pw", Duration::from_secs(5)).unwrap())
}
