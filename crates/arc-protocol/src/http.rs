/// HTTP client for the authority's read endpoints:
/// `GET /manifests/latest`, `GET /capsules/{id}` and `GET /keys/public`.
use std::time::Duration;

use serde::Deserialize;

use crate::capsule::Capsule;
use crate::manifest::Manifest;
use crate::reconcile::AuthorityApi;
use crate::ArcProtocolError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Deserialize)]
struct PublicKeyResponse {
    verify_key: String,
}

pub struct HttpAuthority {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthority {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ArcProtocolError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ArcProtocolError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ArcProtocolError> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ArcProtocolError::authority(format!("GET {url}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ArcProtocolError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArcProtocolError::authority(format!("GET {url}: HTTP {status}: {body}")));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ArcProtocolError::authority(format!("GET {url}: {e}")))?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait::async_trait]
impl AuthorityApi for HttpAuthority {
    async fn fetch_manifest(&self) -> Result<Manifest, ArcProtocolError> {
        self.get_json("/manifests/latest").await
    }

    async fn fetch_capsule(&self, capsule_id: &str) -> Result<Capsule, ArcProtocolError> {
        self.get_json(&format!("/capsules/{capsule_id}")).await
    }

    async fn fetch_verify_key(&self) -> Result<String, ArcProtocolError> {
        let response: PublicKeyResponse = self.get_json("/keys/public").await?;
        Ok(response.verify_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_joined() {
        let authority = HttpAuthority::new("http://main-hub:8000/").unwrap();
        assert_eq!(authority.url("/keys/public"), "http://main-hub:8000/keys/public");
    }

    #[tokio::test]
    async fn unreachable_authority_is_authority_error() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let authority = HttpAuthority::new(format!("http://127.0.0.1:{port}")).unwrap();
        let err = authority.fetch_manifest().await.unwrap_err();
        assert!(matches!(err, ArcProtocolError::Authority { .. }));
    }
}
