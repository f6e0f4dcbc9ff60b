//! Onyx record lifecycle helpers shared by the matcher, ingest and validation.

use crate::domain::model::{merge_errors, ErrorMap, IngestPayload};
use crate::domain::ports::{ObjectStore, OnyxApi, OnyxResponse};
use crate::utils::error::{Result, RozError};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const ONYX_CLIENT_ERRORS: &str = "onyx_client_errors";

/// Split `s3://bucket/key`.
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    uri.strip_prefix("s3://")
        .and_then(|rest| rest.split_once('/'))
        .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
        .ok_or_else(|| RozError::processing(format!("Invalid S3 URI: {}", uri)))
}

/// Download an object, refusing it if it changed since its event was seen.
pub async fn fetch_checked(store: &dyn ObjectStore, uri: &str, etag: &str) -> Result<Vec<u8>> {
    let (bucket, key) = parse_s3_uri(uri)?;
    let object = store.get_object(bucket, key).await?;

    let found = object.etag.trim_matches('"');
    let expected = etag.trim_matches('"');
    if found != expected {
        return Err(RozError::EtagMismatch {
            uri: uri.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        });
    }
    Ok(object.body)
}

/// Outcome of a create request.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateStatus {
    Created { cid: String },
    /// 200 where 201 was expected
    Unexpected200,
    BadRequest(ErrorMap),
    Unauthorized,
    Forbidden,
    ProjectMissing,
    ValidationFailure(ErrorMap),
    ServerError,
    Unhandled(u16),
}

pub fn classify_create_status(response: &OnyxResponse) -> CreateStatus {
    match response.status {
        201 => match response.data().and_then(|d| d.get("cid")).and_then(Value::as_str) {
            Some(cid) => CreateStatus::Created { cid: cid.to_string() },
            None => CreateStatus::Unhandled(201),
        },
        200 => CreateStatus::Unexpected200,
        400 => CreateStatus::BadRequest(response.messages()),
        401 => CreateStatus::Unauthorized,
        403 => CreateStatus::Forbidden,
        404 => CreateStatus::ProjectMissing,
        422 => CreateStatus::ValidationFailure(response.messages()),
        500 => CreateStatus::ServerError,
        other => CreateStatus::Unhandled(other),
    }
}

impl CreateStatus {
    /// Message recorded under `onyx_client_errors`, if the status carries one.
    pub fn client_error(&self, project: &str) -> Option<String> {
        match self {
            CreateStatus::Created { .. }
            | CreateStatus::BadRequest(_)
            | CreateStatus::ValidationFailure(_) => None,
            CreateStatus::Unexpected200 => {
                Some("200 response status on onyx create (should be 201)".to_string())
            }
            CreateStatus::Unauthorized => Some("Incorrect Onyx credentials".to_string()),
            CreateStatus::Forbidden => Some("Permission error on Onyx create".to_string()),
            CreateStatus::ProjectMissing => Some(format!("Project {} does not exist", project)),
            CreateStatus::ServerError => Some("Onyx internal server error".to_string()),
            CreateStatus::Unhandled(code) => Some(format!(
                "Unhandled response status code {} from Onyx create",
                code
            )),
        }
    }
}

fn set_client_error(payload: &mut IngestPayload, message: String) {
    payload
        .onyx_errors
        .insert(ONYX_CLIENT_ERRORS.to_string(), vec![message]);
}

/// Onyx operations over an in-flight [`IngestPayload`]. Each returns `true`
/// when the operation failed; details are folded into `onyx_errors`.
#[derive(Clone)]
pub struct OnyxRecords {
    onyx: Arc<dyn OnyxApi>,
    store: Arc<dyn ObjectStore>,
}

impl OnyxRecords {
    pub fn new(onyx: Arc<dyn OnyxApi>, store: Arc<dyn ObjectStore>) -> Self {
        Self { onyx, store }
    }

    pub fn api(&self) -> &dyn OnyxApi {
        self.onyx.as_ref()
    }

    /// Create the suppressed record from the artifact's metadata CSV.
    pub async fn submit_record(&self, payload: &mut IngestPayload) -> bool {
        tracing::info!(
            "Received match for artifact: {}, now attempting to create record in Onyx",
            payload.artifact
        );

        let response = match self.create_from_csv(payload).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(uuid = %payload.uuid, "Onyx CSV create failed due to client error: {}", e);
                set_client_error(payload, format!("Unhandled client error {}", e));
                return true;
            }
        };

        payload.onyx_status_code = Some(response.status);
        let status = classify_create_status(&response);

        match status {
            CreateStatus::Created { cid } => {
                tracing::info!(uuid = %payload.uuid, %cid, "✅ Successful create");
                payload.onyx_create_status = true;
                payload.created = true;
                payload.cid = Some(cid);
                false
            }
            CreateStatus::BadRequest(messages) | CreateStatus::ValidationFailure(messages) => {
                tracing::error!(uuid = %payload.uuid, status = response.status, "Onyx create rejected");
                merge_errors(&mut payload.onyx_errors, messages);
                true
            }
            other => {
                let message = other.client_error(&payload.project).unwrap_or_default();
                tracing::error!(uuid = %payload.uuid, status = response.status, "{}", message);
                set_client_error(payload, message);
                true
            }
        }
    }

    async fn create_from_csv(&self, payload: &IngestPayload) -> Result<OnyxResponse> {
        let csv = payload
            .file(".csv")
            .ok_or_else(|| RozError::processing("Payload has no .csv file"))?;
        let body = fetch_checked(self.store.as_ref(), &csv.uri, &csv.etag).await?;

        let fields = BTreeMap::from([
            ("suppressed".to_string(), json!(true)),
            ("site".to_string(), json!(payload.site)),
        ]);
        self.onyx
            .csv_create(&payload.project, &body, &fields, false)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RozError::processing("Onyx create returned no responses"))
    }

    pub async fn update_record(&self, payload: &mut IngestPayload, fields: &Value) -> bool {
        let cid = payload.cid_or_empty().to_string();
        match self.onyx.update(&payload.project, &cid, fields).await {
            Ok(response) if response.status == 200 => {
                tracing::info!(%cid, "Successfully updated Onyx record");
                false
            }
            Ok(response) => {
                tracing::error!(%cid, status = response.status, "Failed to update Onyx record");
                merge_errors(&mut payload.onyx_errors, response.messages());
                true
            }
            Err(e) => {
                tracing::error!(%cid, "Failed to update Onyx record with unhandled onyx client error: {}", e);
                payload.add_onyx_error(ONYX_CLIENT_ERRORS, format!("Unhandled client error {}", e));
                true
            }
        }
    }

    pub async fn unsuppress_record(&self, payload: &mut IngestPayload) -> bool {
        self.update_record(payload, &json!({ "suppressed": false })).await
    }
}

/// Whether a previously matched artifact may be matched again: only when
/// Onyx has no record for it.
pub async fn can_resubmit(
    onyx: &dyn OnyxApi,
    project: &str,
    artifact: &str,
    sample_id: &str,
    run_name: &str,
) -> bool {
    let fields = BTreeMap::from([
        ("sample_id".to_string(), sample_id.to_string()),
        ("run_name".to_string(), run_name.to_string()),
    ]);

    let response = match onyx.filter(project, &fields).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(%artifact, "Onyx query lead to onyx-client exception: {}", e);
            return false;
        }
    };

    match response.status {
        200 => {
            let records = response
                .data()
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            match records {
                0 => true,
                1 => {
                    tracing::info!(
                        %artifact,
                        "Artifact has been successfully ingested previously and cannot be modified by re-submission"
                    );
                    false
                }
                _ => {
                    tracing::error!(%artifact, "Onyx query returned more than one record");
                    false
                }
            }
        }
        500 => {
            tracing::error!(%artifact, "Onyx query lead to onyx internal server error");
            false
        }
        404 => {
            tracing::error!(%artifact, "Onyx query failed because project: {} does not exist", project);
            false
        }
        403 => {
            tracing::error!(%artifact, "Onyx query failed due to a permission error");
            false
        }
        400 => {
            tracing::error!(%artifact, "Onyx query failed due to a bad request");
            false
        }
        other => {
            tracing::error!(%artifact, "Onyx query failed due to unhandled error code: {}", other);
            false
        }
    }
}
