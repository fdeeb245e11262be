//! Provider that drives a relay service over its HTTP control API.
//!
//! Endpoints, relative to `api_url`:
//! - `POST   /api/sessions/start`
//! - `DELETE /api/sessions/{connection_id}` (404 means already ended)
//! - `POST   /api/sessions/{connection_id}/input`
//! - `GET    /api/sessions/{connection_id}/screenshot`
//! - `GET    /api/sessions/{connection_id}/status`

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ProviderInput, ProviderSessionHandle, RemoteProvider, ScreenFrame, SessionStatistics};
use crate::config::RelayConfig;
use crate::errors::ProviderError;

const FRAME_WIDTH_HEADER: &str = "x-frame-width";
const FRAME_HEIGHT_HEADER: &str = "x-frame-height";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    session_id: &'a str,
    device_id: &'a str,
    timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StartResponse {
    connection_id: Option<String>,
    connection_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StatusResponse {
    is_active: bool,
    statistics: Option<SessionStatistics>,
}

pub struct RelayProvider {
    config: RelayConfig,
    base_url: String,
    client: Option<reqwest::Client>,
}

impl RelayProvider {
    /// Never fails. A client that cannot be built surfaces from `initialize`.
    pub fn new(config: RelayConfig) -> Self {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_millis(config.connection_timeout_ms))
            .build()
            .map_err(|e| warn!(error = %e, "relay HTTP client could not be built"))
            .ok();

        Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            config,
            client,
        }
    }

    fn client(&self) -> Result<&reqwest::Client, ProviderError> {
        self.client
            .as_ref()
            .ok_or_else(|| ProviderError::Unavailable("relay HTTP client unavailable".to_string()))
    }

    fn session_url(&self, connection_id: &str, suffix: &str) -> String {
        format!("{}/api/sessions/{}{}", self.base_url, connection_id, suffix)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.config.api_key.is_empty() {
            request
        } else {
            request.bearer_auth(&self.config.api_key)
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))
    }

    async fn rejected(operation: &str, resp: reqwest::Response) -> ProviderError {
        ProviderError::Rejected(format!(
            "{} status={} body={:?}",
            operation,
            resp.status(),
            resp.text().await.ok()
        ))
    }
}

#[async_trait]
impl RemoteProvider for RelayProvider {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        self.client()?;
        reqwest::Url::parse(&self.base_url).map_err(|e| {
            ProviderError::Unavailable(format!("invalid relay api_url {:?}: {}", self.base_url, e))
        })?;
        debug!(api_url = %self.base_url, "relay provider initialized");
        Ok(())
    }

    async fn start_session(
        &self,
        device_id: &str,
        token: &str,
    ) -> Result<ProviderSessionHandle, ProviderError> {
        let url = format!("{}/api/sessions/start", self.base_url);
        let body = StartRequest {
            session_id: token,
            device_id,
            timestamp: Utc::now(),
        };
        let resp = self.send(self.client()?.post(url).json(&body)).await?;
        if !resp.status().is_success() {
            return Err(Self::rejected("start", resp).await);
        }

        let started: StartResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Rejected(format!("start: malformed response: {}", e)))?;
        let connection_id = match started.connection_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(ProviderError::Rejected(
                    "start: response carried no connectionId".to_string(),
                ))
            }
        };
        if self.config.enable_logging {
            debug!(connection_id = %connection_id, device_id, "relay session started");
        }

        Ok(ProviderSessionHandle {
            connection_id,
            device_id: device_id.to_string(),
            connection_url: started.connection_url,
            started_at: Utc::now(),
        })
    }

    async fn end_session(&self, handle: &ProviderSessionHandle) -> Result<bool, ProviderError> {
        let url = self.session_url(&handle.connection_id, "");
        let resp = self.send(self.client()?.delete(url)).await?;
        match resp.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => {
                debug!(connection_id = %handle.connection_id, "relay connection already gone");
                Ok(true)
            }
            status => {
                warn!(
                    connection_id = %handle.connection_id,
                    status = %status,
                    "relay declined to end session"
                );
                Ok(false)
            }
        }
    }

    async fn send_input(
        &self,
        handle: &ProviderSessionHandle,
        input: ProviderInput,
    ) -> Result<(), ProviderError> {
        let url = self.session_url(&handle.connection_id, "/input");
        let resp = self.send(self.client()?.post(url).json(&input)).await?;
        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProviderError::UnknownConnection(handle.connection_id.clone())),
            _ => Err(Self::rejected("input", resp).await),
        }
    }

    async fn capture_frame(&self, handle: &ProviderSessionHandle) -> Result<ScreenFrame, ProviderError> {
        let url = self.session_url(&handle.connection_id, "/screenshot");
        let resp = self.send(self.client()?.get(url)).await?;
        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NO_CONTENT => return Ok(ScreenFrame::empty()),
            StatusCode::NOT_FOUND => {
                return Err(ProviderError::UnknownConnection(handle.connection_id.clone()))
            }
            _ => return Err(Self::rejected("screenshot", resp).await),
        }

        let dimension = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0)
        };
        let width = dimension(FRAME_WIDTH_HEADER);
        let height = dimension(FRAME_HEIGHT_HEADER);
        let data = resp
            .bytes()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        Ok(ScreenFrame {
            width,
            height,
            data,
            timestamp: Utc::now(),
            key_frame: true,
        })
    }

    async fn get_statistics(
        &self,
        handle: &ProviderSessionHandle,
    ) -> Result<Option<SessionStatistics>, ProviderError> {
        let url = self.session_url(&handle.connection_id, "/status");
        let resp = self.send(self.client()?.get(url)).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if status.is_success() => {}
            _ => return Err(Self::rejected("status", resp).await),
        }

        let status: StatusResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Rejected(format!("status: malformed response: {}", e)))?;
        if !status.is_active {
            return Ok(None);
        }
        Ok(Some(status.statistics.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(url: &str) -> RelayProvider {
        RelayProvider::new(RelayConfig {
            api_url: url.to_string(),
            ..RelayConfig::default()
        })
    }

    #[test]
    fn session_urls_are_rooted_at_api_url() {
        let provider = relay("https://relay.example.net/");
        assert_eq!(
            provider.session_url("abc", "/status"),
            "https://relay.example.net/api/sessions/abc/status"
        );
        assert_eq!(
            provider.session_url("abc", ""),
            "https://relay.example.net/api/sessions/abc"
        );
    }

    #[tokio::test]
    async fn initialize_rejects_unparseable_url() {
        let provider = relay("not a url");
        assert!(matches!(
            provider.initialize().await,
            Err(ProviderError::Unavailable(_))
        ));
        relay("https://relay.example.net").initialize().await.unwrap();
    }

    #[test]
    fn status_response_tolerates_missing_fields() {
        let status: StatusResponse = serde_json::from_str(r#"{"isActive":true}"#).unwrap();
        assert!(status.is_active);
        assert!(status.statistics.is_none());

        let status: StatusResponse = serde_json::from_str(
            r#"{"isActive":true,"statistics":{"framesPerSecond":30.0,"latencyMs":12.5}}"#,
        )
        .unwrap();
        let stats = status.statistics.unwrap();
        assert_eq!(stats.frames_per_second, 30.0);
        assert_eq!(stats.latency_ms, 12.5);
    }
}
