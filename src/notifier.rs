// 🔔 Webhook notifier
// Posts the alert feed to an external automation webhook

use crate::config::NotifyConfig;
use crate::dashboard::{decide, AlertFeed, NotifyDecision};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),

    #[error("webhook request failed")]
    Request(#[source] reqwest::Error),

    #[error("webhook answered {status}")]
    Status { status: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum NotifyOutcome {
    Sent { status: u16 },
    Skipped { reason: String },
}

/// Send the feed when the configuration allows it
pub async fn notify(config: &NotifyConfig, feed: &AlertFeed) -> Result<NotifyOutcome, NotifyError> {
    if let NotifyDecision::Skip(reason) = decide(config, feed) {
        tracing::info!("Notification skipped: {}", reason);
        return Ok(NotifyOutcome::Skipped { reason });
    }

    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(NotifyError::Client)?;

    let response = client
        .post(config.webhook_url.trim())
        .json(feed)
        .send()
        .await
        .map_err(NotifyError::Request)?;

    let status = response.status();
    if !status.is_success() {
        tracing::warn!("Webhook rejected feed with status {}", status);
        return Err(NotifyError::Status {
            status: status.as_u16(),
        });
    }

    tracing::info!(
        "Feed sent to webhook ({} alerts, status {})",
        feed.totale_dpi_allarme,
        status
    );
    Ok(NotifyOutcome::Sent {
        status: status.as_u16(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::Counts;

    #[tokio::test]
    async fn test_disabled_config_skips_without_network() {
        let feed = AlertFeed::new(Counts::default(), &[]);
        let outcome = notify(&NotifyConfig::default(), &feed).await.unwrap();

        assert!(matches!(outcome, NotifyOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_an_error() {
        let mut row = crate::dashboard::DashboardRow::new();
        row.insert(
            crate::dashboard::STATUS_COLUMN.to_string(),
            "SCADUTO".to_string(),
        );
        let feed = AlertFeed::new(Counts::default(), &[row]);
        let config = NotifyConfig {
            enabled: true,
            // Port 9 on loopback: nothing listens there
            webhook_url: "http://127.0.0.1:9/webhook".to_string(),
            timeout: std::time::Duration::from_secs(2),
            min_alerts: 1,
        };

        let result = notify(&config, &feed).await;

        assert!(matches!(result, Err(NotifyError::Request(_))));
    }
}
