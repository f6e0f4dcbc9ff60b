use crate::adapters::onyx::csv_rows;
use crate::core::records::{fetch_checked, ONYX_CLIENT_ERRORS};
use crate::domain::model::{merge_errors, now_ns, IngestPayload, MatchedPayload};
use crate::domain::ports::{send_json, MessageBus, ObjectStore, OnyxApi, OnyxResponse};
use crate::utils::error::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const QUEUE_SUFFIX: &str = "ingest";

pub fn to_validate_exchange(project: &str) -> String {
    format!("inbound.to_validate.{}", project)
}

/// Test-creates matched artifacts in Onyx and forwards them for validation.
pub struct IngestService {
    store: Arc<dyn ObjectStore>,
    bus: Arc<dyn MessageBus>,
    onyx: Arc<dyn OnyxApi>,
}

impl IngestService {
    pub fn new(store: Arc<dyn ObjectStore>, bus: Arc<dyn MessageBus>, onyx: Arc<dyn OnyxApi>) -> Self {
        Self { store, bus, onyx }
    }

    async fn test_create(&self, matched: &MatchedPayload, csv: &[u8]) -> Result<Vec<OnyxResponse>> {
        let fields = BTreeMap::from([("site".to_string(), json!(matched.site))]);
        self.onyx.csv_create(&matched.project, csv, &fields, true).await
    }

    /// Build the payload sent on to validation. Never fails: every problem is
    /// recorded on the payload and clears `validate`.
    pub async fn ingest(&self, matched: &MatchedPayload) -> IngestPayload {
        let mut payload = IngestPayload::from_match(matched, now_ns());

        tracing::info!(
            artifact = %matched.artifact,
            uuid = %matched.uuid,
            "Received match, now attempting to test_create record in Onyx"
        );

        let Some(csv_file) = matched.files.get(".csv") else {
            payload.add_test_create_error("metadata_csv", "No metadata CSV in matched files");
            payload.validate = false;
            return payload;
        };

        let csv = match fetch_checked(self.store.as_ref(), &csv_file.uri, &csv_file.etag).await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(uuid = %matched.uuid, "Could not fetch metadata CSV: {}", e);
                payload.add_test_create_error(ONYX_CLIENT_ERRORS, format!("Unhandled client error {}", e));
                payload.validate = false;
                return payload;
            }
        };

        let responses = match self.test_create(matched, &csv).await {
            Ok(responses) => responses,
            Err(e) => {
                tracing::error!(uuid = %matched.uuid, "Onyx test csv create failed due to client error: {}", e);
                payload.add_test_create_error(ONYX_CLIENT_ERRORS, format!("Unhandled client error {}", e));
                payload.validate = false;
                return payload;
            }
        };

        let response = match responses.as_slice() {
            [] => {
                tracing::error!("Onyx test csv create failed to return any responses");
                payload.add_test_create_error(
                    ONYX_CLIENT_ERRORS,
                    "Onyx test csv create failed to return any responses",
                );
                payload.validate = false;
                return payload;
            }
            [single] => single,
            _ => {
                tracing::info!(
                    artifact = %matched.artifact,
                    "Metadata CSV contains more than one record, metadata CSVs should only ever contain a single record"
                );
                payload.add_test_create_error("metadata_csv", "Multiline metadata CSVs are not permitted");
                payload.validate = false;
                return payload;
            }
        };

        tracing::info!(artifact = %matched.artifact, status = response.status, "Received Onyx test create response");
        payload.onyx_test_create_status = response.is_success();
        payload.onyx_test_status_code = Some(response.status);
        if !response.is_success() {
            payload.validate = false;
        }
        merge_errors(&mut payload.onyx_test_create_errors, response.messages());

        check_filename_fields(&csv, matched, &mut payload);
        payload
    }

    /// Handle at most one matched message. Returns whether one was received.
    pub async fn run_once(&self, timeout: Option<Duration>) -> Result<bool> {
        let Some(delivery) = self
            .bus
            .receive(crate::core::matcher::MATCHED_EXCHANGE, QUEUE_SUFFIX, timeout)
            .await?
        else {
            return Ok(false);
        };

        match delivery.json::<MatchedPayload>() {
            Ok(matched) => {
                let payload = self.ingest(&matched).await;
                send_json(
                    self.bus.as_ref(),
                    &payload,
                    &to_validate_exchange(&matched.project),
                    QUEUE_SUFFIX,
                )
                .await?;
                tracing::info!(uuid = %payload.uuid, validate = payload.validate, "📤 Sent for validation");
            }
            Err(e) => tracing::error!("Could not parse matched message, dropping: {}", e),
        }

        self.bus.acknowledge(&delivery).await?;
        Ok(true)
    }

    pub async fn run(&self) -> Result<()> {
        loop {
            self.run_once(None).await?;
        }
    }
}

/// The CSV's `sample_id` / `run_name` must be present and equal the values
/// parsed from the filename.
fn check_filename_fields(csv: &[u8], matched: &MatchedPayload, payload: &mut IngestPayload) {
    let first_row = match csv_rows(csv) {
        Ok(rows) => rows.into_iter().next().unwrap_or_default(),
        Err(e) => {
            tracing::error!(uuid = %matched.uuid, "Metadata CSV could not be parsed: {}", e);
            payload.add_test_create_error("metadata_csv", format!("Metadata CSV could not be parsed: {}", e));
            payload.validate = false;
            return;
        }
    };

    let expected = [("sample_id", &matched.sample_id), ("run_name", &matched.run_name)];

    let mut all_present = true;
    for (field, _) in expected {
        let present = first_row
            .get(field)
            .and_then(Value::as_str)
            .is_some_and(|v| !v.is_empty());
        if !present {
            payload.add_test_create_error(field, "Required field is not present");
            all_present = false;
        }
    }
    if !all_present {
        payload.validate = false;
        return;
    }

    for (field, from_name) in expected {
        if first_row.get(field).and_then(Value::as_str) != Some(from_name.as_str()) {
            payload.add_test_create_error(field, "Field does not match filename");
            payload.validate = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::FileRecord;

    fn matched() -> MatchedPayload {
        MatchedPayload {
            uuid: "u1".to_string(),
            payload_version: 1,
            site: "birm".to_string(),
            uploaders: vec!["testuser".to_string()],
            match_timestamp: 0,
            artifact: "mscapetest.r1.s1".to_string(),
            sample_id: "s1".to_string(),
            run_name: "r1".to_string(),
            project: "mscapetest".to_string(),
            platform: "ont".to_string(),
            files: BTreeMap::from([(
                ".csv".to_string(),
                FileRecord {
                    uri: "s3://b/k.csv".to_string(),
                    etag: "e".to_string(),
                    key: "k.csv".to_string(),
                },
            )]),
            test_flag: false,
        }
    }

    #[test]
    fn test_fields_match_filename() {
        let matched = matched();
        let mut payload = IngestPayload::from_match(&matched, 1);
        check_filename_fields(b"sample_id,run_name\ns1,r1\n", &matched, &mut payload);
        assert!(payload.validate);
        assert!(payload.onyx_test_create_errors.is_empty());
    }

    #[test]
    fn test_missing_field_is_reported() {
        let matched = matched();
        let mut payload = IngestPayload::from_match(&matched, 1);
        check_filename_fields(b"sample_id,other\ns1,x\n", &matched, &mut payload);
        assert!(!payload.validate);
        assert_eq!(payload.onyx_test_create_errors["run_name"], vec!["Required field is not present"]);
        assert!(!payload.onyx_test_create_errors.contains_key("sample_id"));
    }

    #[test]
    fn test_mismatched_field_is_reported() {
        let matched = matched();
        let mut payload = IngestPayload::from_match(&matched, 1);
        check_filename_fields(b"sample_id,run_name\ns2,r1\n", &matched, &mut payload);
        assert!(!payload.validate);
        assert_eq!(payload.onyx_test_create_errors["sample_id"], vec!["Field does not match filename"]);
    }
}
