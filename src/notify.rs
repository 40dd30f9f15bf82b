// SnapGuard notify.rs
// Purpose: Webhook notification transport

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;

use crate::collaborators::Notifier;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs `{ "text", "source", "timestamp" }` JSON to a webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: WEBHOOK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Notifier for WebhookNotifier {
    fn send(&self, message: &str) -> Result<()> {
        let url = self.url.clone();
        let timeout = self.timeout;
        let payload = serde_json::json!({
            "text": message,
            "source": "snapguard",
            "timestamp": Utc::now().to_rfc3339(),
        });

        // The blocking client owns an internal runtime and must not be built
        // or dropped on a tokio worker, so the request runs on its own thread.
        let handle = thread::spawn(move || -> Result<()> {
            let client = reqwest::blocking::Client::builder()
                .timeout(timeout)
                .build()
                .context("building webhook client")?;
            client
                .post(&url)
                .json(&payload)
                .send()
                .with_context(|| format!("posting to {url}"))?
                .error_for_status()
                .context("webhook rejected notification")?;
            Ok(())
        });

        handle
            .join()
            .map_err(|_| anyhow!("notification thread panicked"))?
    }
}
