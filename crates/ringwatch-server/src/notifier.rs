use ringwatch_alert::NotifyRequest;
use ringwatch_common::shutdown::ShutdownSignal;
use std::time::Duration;
use tokio::sync::mpsc;

/// Consumer of the notification channel.
///
/// Every request is logged; when a webhook is configured it is also POSTed
/// there as JSON. Delivery failures are logged and not retried, the event
/// keeps its own repeat clock.
pub struct WebhookNotifier {
    webhook: Option<(reqwest::Client, String)>,
}

impl WebhookNotifier {
    pub fn new(webhook_url: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        let webhook = match webhook_url.filter(|u| !u.trim().is_empty()) {
            Some(url) => {
                let client = reqwest::Client::builder().timeout(timeout).build()?;
                Some((client, url.to_string()))
            }
            None => None,
        };
        Ok(Self { webhook })
    }

    pub async fn deliver(&self, req: &NotifyRequest) {
        tracing::info!(
            rule_id = req.rule_id,
            rule = %req.rule_name,
            hash = %req.event_hash,
            severity = ?req.severity,
            recovery = req.is_recovery,
            count = req.notify_count,
            value = %req.trigger_value,
            channels = ?req.channels,
            "Alert notification"
        );

        let Some((client, url)) = &self.webhook else {
            return;
        };
        match client.post(url).json(req).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                tracing::warn!(url = %url, status = resp.status().as_u16(), hash = %req.event_hash, "Webhook rejected notification");
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, hash = %req.event_hash, "Webhook delivery failed");
            }
        }
    }

    /// Drains `rx` until the channel closes or shutdown; requests already
    /// queued at shutdown are still delivered.
    pub async fn run(self, mut rx: mpsc::Receiver<NotifyRequest>, mut shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                req = rx.recv() => match req {
                    Some(req) => self.deliver(&req).await,
                    None => break,
                },
                _ = shutdown.recv() => {
                    while let Ok(req) = rx.try_recv() {
                        self.deliver(&req).await;
                    }
                    break;
                }
            }
        }
        tracing::info!("Notifier stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_webhook_is_log_only() {
        let notifier = WebhookNotifier::new(Some("  "), Duration::from_secs(1)).unwrap();
        assert!(notifier.webhook.is_none());
        let notifier = WebhookNotifier::new(Some("http://127.0.0.1:9/hook"), Duration::from_secs(1)).unwrap();
        assert!(notifier.webhook.is_some());
    }

    #[tokio::test]
    async fn run_stops_when_channel_closes() {
        let (tx, rx) = mpsc::channel(4);
        let (_trigger, signal) = ringwatch_common::shutdown::channel();
        let notifier = WebhookNotifier::new(None, Duration::from_secs(1)).unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), notifier.run(rx, signal))
            .await
            .unwrap();
    }
}
