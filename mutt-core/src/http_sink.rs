//! Delivers alerts to the external AIOps receiver over HTTP (spec §6 Sink
//! HTTP). A thin `reqwest` client; status-code handling maps directly onto
//! the forwarder's transient/permanent failure split (§4.F steps 6-7).

use std::time::Duration;

use async_trait::async_trait;
use mutt_config::RotatingSecret;
use mutt_contracts::sink::{Sink, SinkError, SinkHealth, SinkResult};
use reqwest::Client;
use tracing::warn;

fn is_auth_failure(status: u16) -> bool {
    status == 401 || status == 403
}

#[derive(Clone)]
pub struct HttpSink {
    client: Client,
    webhook_url: String,
    /// `Authorization` header values to try in order: current credential
    /// first, then the rotated `next` one if the first is refused as
    /// unauthorized (spec §6: "current/next" credential rotation).
    auth_header_candidates: Vec<String>,
}

impl HttpSink {
    pub fn new(webhook_url: impl Into<String>, auth_tokens: &RotatingSecret, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let auth_header_candidates = auth_tokens
            .candidates()
            .into_iter()
            .map(|token| format!("Bearer {token}"))
            .collect();
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
            auth_header_candidates,
        })
    }

    async fn attempt(&self, alert_json: &str, auth_header: &str) -> SinkResult<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .header("Authorization", auth_header)
            .header("Content-Type", "application/json")
            .body(alert_json.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SinkError::Timeout
                } else {
                    SinkError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(SinkError::Http4xx(status.as_u16(), body))
        } else {
            Err(SinkError::Http5xx(status.as_u16(), body))
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn deliver(&self, alert_json: &str) -> SinkResult<()> {
        let last = self.auth_header_candidates.len().saturating_sub(1);
        let mut last_err = None;

        for (i, auth_header) in self.auth_header_candidates.iter().enumerate() {
            match self.attempt(alert_json, auth_header).await {
                Ok(()) => return Ok(()),
                Err(SinkError::Http4xx(status, body)) if is_auth_failure(status) && i < last => {
                    warn!(status, "sink rejected credential as unauthorized, retrying with rotated credential");
                    last_err = Some(SinkError::Http4xx(status, body));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.expect("auth_header_candidates is never empty"))
    }

    async fn probe_health(&self) -> SinkHealth {
        let probe = self
            .client
            .head(&self.webhook_url)
            .timeout(Duration::from_secs(3))
            .send()
            .await;

        match probe {
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 405 => SinkHealth::Healthy,
            _ => SinkHealth::Unhealthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_401_and_403_as_auth_failures() {
        assert!(is_auth_failure(401));
        assert!(is_auth_failure(403));
        assert!(!is_auth_failure(400));
        assert!(!is_auth_failure(500));
    }

    #[test]
    fn builds_bearer_header_for_current_and_next() {
        let secret = RotatingSecret {
            current: "tok-a".to_string(),
            next: Some("tok-b".to_string()),
        };
        let sink = HttpSink::new("https://example.invalid/webhook", &secret, Duration::from_secs(1)).unwrap();
        assert_eq!(
            sink.auth_header_candidates,
            vec!["Bearer tok-a".to_string(), "Bearer tok-b".to_string()]
        );
    }

    #[test]
    fn builds_single_candidate_when_next_is_absent() {
        let secret = RotatingSecret {
            current: "tok-a".to_string(),
            next: None,
        };
        let sink = HttpSink::new("https://example.invalid/webhook", &secret, Duration::from_secs(1)).unwrap();
        assert_eq!(sink.auth_header_candidates, vec!["Bearer tok-a".to_string()]);
    }
}
