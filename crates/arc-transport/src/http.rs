/// HTTP adapters for the link seams.
///
/// `HttpSink` delivers packets to a node's callback URL; `HttpSimulatorClient`
/// drives a simulator service exposing `/register`, `/unregister`, `/send`
/// and `/admin/config`.
use std::time::Duration;

use serde::Serialize;

use crate::config::{SettingsUpdate, SimSettings};
use crate::error::TransportError;
use crate::link::{Network, PacketSink, SendReport};
use crate::packet::{HubAck, Packet};
use crate::simulator::NodeType;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

fn build_client() -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| TransportError::Config(format!("http client: {e}")))
}

/// Turn a non-2xx response into a delivery error carrying the body text.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Delivery(format!("HTTP {status}: {body}")))
}

// ── HttpSink ─────────────────────────────────────────────────────────

/// Delivers packets by POSTing their JSON to a callback URL.
pub struct HttpSink {
    client: reqwest::Client,
    callback_url: String,
}

impl HttpSink {
    pub fn new(callback_url: impl Into<String>) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client()?,
            callback_url: callback_url.into(),
        })
    }

    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }
}

#[async_trait::async_trait]
impl PacketSink for HttpSink {
    async fn deliver(&self, packet: Packet) -> Result<HubAck, TransportError> {
        let response = self
            .client
            .post(&self.callback_url)
            .json(&packet)
            .send()
            .await?;
        let response = check_status(response).await?;
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(HubAck::ack("delivered"));
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

// ── HttpSimulatorClient ─────────────────────────────────────────────

#[derive(Serialize)]
struct RegisterRequest<'a> {
    node_id: &'a str,
    callback_url: &'a str,
    node_type: NodeType,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    src_id: &'a str,
    dst_id: &'a str,
    packet: &'a Packet,
}

/// Client for a remote simulator service.
pub struct HttpSimulatorClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSimulatorClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn register(
        &self,
        node_id: &str,
        callback_url: &str,
        node_type: NodeType,
    ) -> Result<(), TransportError> {
        let body = RegisterRequest {
            node_id,
            callback_url,
            node_type,
        };
        let response = self.client.post(self.url("/register")).json(&body).send().await?;
        check_status(response).await?;
        tracing::info!("registered {node_id} with simulator at {}", self.base_url);
        Ok(())
    }

    pub async fn unregister(
        &self,
        node_id: &str,
        callback_url: &str,
        node_type: NodeType,
    ) -> Result<(), TransportError> {
        let body = RegisterRequest {
            node_id,
            callback_url,
            node_type,
        };
        let response = self
            .client
            .post(self.url("/unregister"))
            .json(&body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn settings(&self) -> Result<SimSettings, TransportError> {
        let response = self.client.get(self.url("/admin/config")).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn update_settings(
        &self,
        update: &SettingsUpdate,
    ) -> Result<SimSettings, TransportError> {
        let response = self
            .client
            .post(self.url("/admin/config"))
            .json(update)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

#[async_trait::async_trait]
impl Network for HttpSimulatorClient {
    async fn send(
        &self,
        src_id: &str,
        dst_id: &str,
        packet: Packet,
    ) -> Result<SendReport, TransportError> {
        let body = SendRequest {
            src_id,
            dst_id,
            packet: &packet,
        };
        let response = self.client.post(self.url("/send")).json(&body).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TransportError::NotRegistered {
                node_id: dst_id.to_string(),
            });
        }
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}
