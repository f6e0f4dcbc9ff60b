use crate::config::OnyxSettings;
use crate::domain::ports::{OnyxApi, OnyxResponse};
use crate::utils::error::{Result, RozError};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Onyx REST client. Logs in once with basic auth and reuses the token.
pub struct OnyxClient {
    client: Client,
    domain: String,
    username: String,
    password: String,
    token: OnceCell<String>,
}

impl OnyxClient {
    pub fn new(domain: &str, username: &str, password: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            domain: domain.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            token: OnceCell::new(),
        })
    }

    pub fn from_settings(settings: &OnyxSettings, domain: &str, password: &str) -> Result<Self> {
        Self::new(
            domain,
            &settings.username,
            password,
            Duration::from_secs(settings.timeout_seconds),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.domain, path.trim_start_matches('/'))
    }

    async fn token(&self) -> Result<&str> {
        let token = self
            .token
            .get_or_try_init(|| async {
                let response = self
                    .client
                    .post(self.url("accounts/login/"))
                    .basic_auth(&self.username, Some(&self.password))
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    return Err(RozError::ConfigError {
                        message: format!("Onyx login failed with status {}", status),
                    });
                }

                let body: Value = response.json().await?;
                body.pointer("/data/token")
                    .or_else(|| body.get("token"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| RozError::processing("Onyx login response did not contain a token"))
            })
            .await?;
        Ok(token.as_str())
    }

    async fn send(&self, request: RequestBuilder) -> Result<OnyxResponse> {
        let token = self.token().await?;
        let response = request
            .header("Authorization", format!("Token {}", token))
            .send()
            .await?;
        into_onyx_response(response).await
    }
}

async fn into_onyx_response(response: Response) -> Result<OnyxResponse> {
    let status = response.status().as_u16();
    let text = response.text().await?;
    let body = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };
    tracing::debug!(status, "Onyx response");
    Ok(OnyxResponse { status, body })
}

/// CSV rows as JSON objects; a leading UTF-8 BOM is ignored.
pub fn csv_rows(csv: &[u8]) -> Result<Vec<Map<String, Value>>> {
    let csv = csv.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(csv);
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(csv);
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.to_string(), Value::String(v.to_string())))
            .collect::<Map<String, Value>>();
        rows.push(row);
    }
    Ok(rows)
}

#[async_trait]
impl OnyxApi for OnyxClient {
    async fn filter(
        &self,
        project: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<OnyxResponse> {
        let mut query: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        query.push(("scope", "admin"));

        let request = self
            .client
            .get(self.url(&format!("projects/{}/", project)))
            .query(&query);
        self.send(request).await
    }

    async fn csv_create(
        &self,
        project: &str,
        csv: &[u8],
        fields: &BTreeMap<String, Value>,
        test: bool,
    ) -> Result<Vec<OnyxResponse>> {
        let path = if test {
            format!("projects/{}/test/", project)
        } else {
            format!("projects/{}/", project)
        };

        let mut responses = Vec::new();
        for mut row in csv_rows(csv)? {
            for (k, v) in fields {
                row.insert(k.clone(), v.clone());
            }
            let request = self.client.post(self.url(&path)).json(&row);
            responses.push(self.send(request).await?);
        }
        Ok(responses)
    }

    async fn get(&self, project: &str, cid: &str) -> Result<OnyxResponse> {
        let request = self
            .client
            .get(self.url(&format!("projects/{}/{}/", project, cid)))
            .query(&[("scope", "admin")]);
        self.send(request).await
    }

    async fn update(&self, project: &str, cid: &str, fields: &Value) -> Result<OnyxResponse> {
        let request = self
            .client
            .patch(self.url(&format!("projects/{}/{}/", project, cid)))
            .json(fields);
        self.send(request).await
    }
}
