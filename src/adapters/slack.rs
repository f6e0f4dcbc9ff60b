use crate::domain::ports::Notifier;
use crate::utils::error::{Result, RozError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

/// Posts `{"text": ...}` to Slack incoming webhooks.
#[derive(Debug, Clone, Default)]
pub struct SlackWebhook {
    client: Client,
}

impl SlackWebhook {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for SlackWebhook {
    async fn post(&self, webhook: &str, text: &str) -> Result<()> {
        let response = self
            .client
            .post(webhook)
            .json(&json!({ "text": text }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RozError::processing(format!(
                "Error posting to Slack webhook: {} - {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("unknown")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn test_post_text_body() {
        let server = MockServer::start_async().await;
        let hook = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hook")
                    .json_body(json!({"text": "hello"}));
                then.status(200);
            })
            .await;

        SlackWebhook::new()
            .post(&server.url("/hook"), "hello")
            .await
            .unwrap();
        hook.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_2xx_is_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(500);
            })
            .await;

        let err = SlackWebhook::new()
            .post(&server.url("/hook"), "hello")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
