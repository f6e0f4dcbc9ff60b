use crate::config::SlackSettings;
use crate::domain::ports::{MessageBus, Notifier};
use crate::utils::error::{Result, RozError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const QUEUE_SUFFIX: &str = "slack_integration";
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    NewArtifact { name: &'static str },
    PublicResult { name: &'static str },
    Alert { name: &'static str },
}

impl Template {
    /// Slack text for one announcement body.
    pub fn render(&self, body: &Value) -> Result<String> {
        let pretty = serde_json::to_string_pretty(body)?;
        Ok(match self {
            Template::NewArtifact { name } => {
                format!("*New {} Artifact Published*\n```\n{}\n```\n", name, pretty)
            }
            Template::PublicResult { name } => {
                let outcome = match body {
                    Value::Object(map) if map.get("published") == Some(&Value::Bool(true)) => "Success",
                    Value::Object(_) => "Failure",
                    _ => "",
                };
                format!(
                    "*New {} Public Dataset Result*\nOutcome - *{}*\n```\n{}\n```\n",
                    name, outcome, pretty
                )
            }
            Template::Alert { name } => format!("<!channel>\n*{} Alert*\n```\n{}\n```\n", name, pretty),
        })
    }
}

/// One exchange relayed to one webhook.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub exchange: String,
    pub webhook: String,
    pub template: Template,
}

fn webhook(env_name: &str, value: &Option<String>) -> Result<String> {
    value.clone().ok_or_else(|| RozError::MissingConfigError {
        field: env_name.to_string(),
    })
}

/// Channels relayed for a project stem.
pub fn channels_for(stem: &str, slack: &SlackSettings) -> Result<Vec<Channel>> {
    let channel = |exchange: &str, webhook: String, template: Template| Channel {
        exchange: exchange.to_string(),
        webhook,
        template,
    };

    match stem {
        "mscape" => {
            let name = "MScape";
            Ok(vec![
                channel(
                    "inbound.new_artifact.mscape",
                    webhook("NEW_ARTIFACT_WEBHOOK", &slack.new_artifact_webhook)?,
                    Template::NewArtifact { name },
                ),
                channel(
                    "inbound.results.mscape.public",
                    webhook("PUBLIC_RESULT_WEBHOOK", &slack.public_result_webhook)?,
                    Template::PublicResult { name },
                ),
                channel(
                    "mscape.restricted.announce",
                    webhook("MSCAPE_ALERT_WEBHOOK", &slack.mscape_alert_webhook)?,
                    Template::Alert { name },
                ),
                channel(
                    "mscape.restricted.hcid",
                    webhook("HCID_WEBHOOK", &slack.hcid_webhook)?,
                    Template::Alert { name },
                ),
            ])
        }
        "pathsafe" => {
            let name = "PATH-SAFE";
            Ok(vec![
                channel(
                    "inbound.new_artifact.pathsafe",
                    webhook("NEW_ARTIFACT_WEBHOOK", &slack.new_artifact_webhook)?,
                    Template::NewArtifact { name },
                ),
                channel(
                    "pathsafe.restricted.announce",
                    webhook("PATHSAFE_ALERT_WEBHOOK", &slack.pathsafe_alert_webhook)?,
                    Template::Alert { name },
                ),
            ])
        }
        other => Err(RozError::InvalidConfigValueError {
            field: "stem".to_string(),
            value: other.to_string(),
            reason: "announcements exist for mscape and pathsafe only".to_string(),
        }),
    }
}

/// Relays announcement exchanges to Slack.
pub struct Announcer {
    bus: Arc<dyn MessageBus>,
    notifier: Arc<dyn Notifier>,
    channels: Vec<Channel>,
}

impl Announcer {
    pub fn new(bus: Arc<dyn MessageBus>, notifier: Arc<dyn Notifier>, channels: Vec<Channel>) -> Self {
        Self { bus, notifier, channels }
    }

    /// Poll every channel once. A failed post is returned as an error after
    /// the message is put back on its queue.
    pub async fn run_once(&self) -> Result<usize> {
        let mut relayed = 0;

        for channel in &self.channels {
            let Some(delivery) = self
                .bus
                .receive(&channel.exchange, QUEUE_SUFFIX, Some(RECEIVE_TIMEOUT))
                .await?
            else {
                continue;
            };

            let body: Value = match delivery.json() {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!(exchange = %channel.exchange, "Announcement is not valid JSON, dropping: {}", e);
                    self.bus.acknowledge(&delivery).await?;
                    continue;
                }
            };

            let text = channel.template.render(&body)?;
            if let Err(e) = self.notifier.post(&channel.webhook, &text).await {
                tracing::error!(exchange = %channel.exchange, "Slack post failed, requeueing: {}", e);
                self.bus.nack(&delivery, true).await?;
                return Err(e);
            }
            self.bus.acknowledge(&delivery).await?;

            tracing::info!(exchange = %channel.exchange, "📣 Relayed announcement to Slack");
            relayed += 1;
        }

        Ok(relayed)
    }

    pub async fn run(&self) -> Result<()> {
        loop {
            self.run_once().await?;
        }
    }
}
