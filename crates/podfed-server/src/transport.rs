//! Federation over HTTP: each message is a JSON POST to the peer's inbox.

use std::time::Duration;

use async_trait::async_trait;
use podfed::core::PodHost;
use podfed::sync::{PodMessage, PodReply, Result, SyncError, Transport};
use tracing::debug;

/// Path every pod serves its federation inbox on.
pub const INBOX_PATH: &str = "/federation/inbox";

pub struct HttpTransport {
    host: PodHost,
    scheme: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(host: PodHost, scheme: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(Self {
            host,
            scheme: scheme.into(),
            client,
        })
    }

    fn inbox_url(&self, to: &PodHost) -> String {
        format!("{}://{}{}", self.scheme, to, INBOX_PATH)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, to: &PodHost, message: PodMessage) -> Result<PodReply> {
        let url = self.inbox_url(to);
        debug!(%to, kind = message.kind(), "POST {url}");

        let failed = |reason: String| SyncError::Delivery {
            host: to.to_string(),
            reason,
        };

        let response = self
            .client
            .post(&url)
            .json(&message)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(failed(format!("status {}", response.status())));
        }

        response
            .json::<PodReply>()
            .await
            .map_err(|e| failed(format!("bad reply body: {e}")))
    }

    fn local_host(&self) -> &PodHost {
        &self.host
    }
}
