//! Upstream adapter: posts an HL7 message to the LIS and returns its ER7
//! reply.

use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait LisUpstream: Send + Sync {
    /// Deliver `hl7` to the LIS endpoint at `url` and return the LIS reply
    /// (an ER7 ACK/RSP body).
    async fn send(&self, url: &str, hl7: &str) -> Result<String, String>;
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    pub retry_delay_seconds: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            retry_attempts: 3,
            retry_delay_seconds: 2,
        }
    }
}

/// HTTP transport to the LIS MLLP gateway. The LIS dedups on MSH-10, so a
/// bounded retry on transport failures is safe.
pub struct HttpLisClient {
    config: UpstreamConfig,
    client: reqwest::Client,
}

impl HttpLisClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap();

        log::info!(
            "LIS upstream client ready (timeout {}s, {} attempt(s))",
            config.timeout_seconds,
            config.retry_attempts
        );

        Self { config, client }
    }

    pub fn with_default_config() -> Self {
        Self::new(UpstreamConfig::default())
    }

    async fn send_request(&self, url: &str, hl7: &str) -> Result<String, String> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=us-ascii")
            .body(hl7.to_string())
            .send()
            .await
            .map_err(|e| format!("HTTP request failed: {}", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("failed to read LIS response body: {}", e))?;

        if status.is_success() {
            log::debug!("LIS replied {} with {} bytes", status, body.len());
            Ok(body)
        } else {
            Err(format!("LIS returned error status {}: {}", status, body))
        }
    }
}

#[async_trait]
impl LisUpstream for HttpLisClient {
    async fn send(&self, url: &str, hl7: &str) -> Result<String, String> {
        log::info!("Posting {} byte HL7 message to {}", hl7.len(), url);

        let mut last_error = String::new();
        for attempt in 1..=self.config.retry_attempts {
            match self.send_request(url, hl7).await {
                Ok(reply) => {
                    if attempt > 1 {
                        log::info!("Upstream delivery succeeded on attempt {}", attempt);
                    }
                    return Ok(reply);
                }
                Err(e) => {
                    log::warn!(
                        "Upstream delivery failed (attempt {}/{}): {}",
                        attempt,
                        self.config.retry_attempts,
                        e
                    );
                    last_error = e;
                    if attempt < self.config.retry_attempts {
                        tokio::time::sleep(Duration::from_secs(
                            self.config.retry_delay_seconds,
                        ))
                        .await;
                    }
                }
            }
        }

        Err(format!(
            "upstream unreachable after {} attempts: {}",
            self.config.retry_attempts, last_error
        ))
    }
}
