use crate::utils::error::Result;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionBody<'a> {
    url: &'a str,
    collection_id: u64,
    metadata: &'a Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionResponse {
    pub status: u16,
    pub text: String,
}

impl SubmissionResponse {
    pub fn created(&self) -> bool {
        self.status == 201
    }

    /// Genome id assigned by Pathogenwatch.
    pub fn id(&self) -> Option<String> {
        let body: Value = serde_json::from_str(&self.text).ok()?;
        match body.get("id")? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Genome submission endpoint of Pathogenwatch.
#[derive(Debug, Clone)]
pub struct PathogenwatchClient {
    client: Client,
    endpoint_url: String,
    api_key: String,
    collection_id: u64,
}

impl PathogenwatchClient {
    pub fn new(endpoint_url: &str, api_key: &str, collection_id: u64) -> Self {
        Self {
            client: Client::new(),
            endpoint_url: endpoint_url.to_string(),
            api_key: api_key.to_string(),
            collection_id,
        }
    }

    pub async fn submit(&self, assembly_url: &str, metadata: &Map<String, Value>) -> Result<SubmissionResponse> {
        let body = SubmissionBody {
            url: assembly_url,
            collection_id: self.collection_id,
            metadata,
        };

        let response = self
            .client
            .post(&self.endpoint_url)
            .header("X-API-Key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await?;
        Ok(SubmissionResponse { status, text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_submit_sends_key_and_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/genomes")
                    .header("X-API-Key", "k")
                    .json_body(json!({
                        "url": "https://s3/presigned",
                        "collectionId": 41,
                        "metadata": {"species": "salmonella"}
                    }));
                then.status(201).json_body(json!({"id": "pw-123"}));
            })
            .await;

        let client = PathogenwatchClient::new(&server.url("/genomes"), "k", 41);
        let mut metadata = Map::new();
        metadata.insert("species".to_string(), json!("salmonella"));

        let response = client.submit("https://s3/presigned", &metadata).await.unwrap();
        mock.assert_async().await;
        assert!(response.created());
        assert_eq!(response.id().as_deref(), Some("pw-123"));
    }
}
