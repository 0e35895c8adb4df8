//! Best-effort pulse reporting for uptime monitors.
//!
//! Service mode can report every backup operation to an updown.io style
//! pulse URL. Reporting failures are logged and swallowed: monitoring is
//! never allowed to break the backup itself.

use std::time::Duration;

const ATTEMPTS: u32 = 5;
const PAUSE: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct Pulse {
    url: Option<String>,
    client: reqwest::Client,
}

impl Pulse {
    pub fn new(url: Option<String>) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    /// Sends one beat to the configured pulse URL. A successful operation
    /// is reported as a plain GET, a failure POSTs the error text. Does
    /// nothing when no URL is configured.
    pub async fn send(&self, ok: bool, message: &str) {
        let Some(url) = &self.url else {
            return;
        };

        let payload = if ok { "" } else { message };

        for attempt in 1..=ATTEMPTS {
            let request = if payload.is_empty() {
                self.client.get(url)
            } else {
                self.client.post(url).body(payload.to_string())
            };

            match request.timeout(REQUEST_TIMEOUT).send().await {
                Ok(response) if response.status() == reqwest::StatusCode::OK => return,
                Ok(response) => {
                    tracing::warn!(
                        status = %response.status(),
                        attempt,
                        "Pulse URL returned unexpected status"
                    );
                }
                Err(err) => {
                    tracing::warn!(error = %err, attempt, "Can't send request to pulse URL");
                }
            }

            if attempt < ATTEMPTS {
                tokio::time::sleep(PAUSE).await;
            }
        }

        tracing::error!("Can't send request to pulse URL, giving up");
    }
}
