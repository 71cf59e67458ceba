//! Authenticated API Calls
//!
//! Calls made after login. Each request carries the session credential in
//! its header and goes through the adaptive client.

use tracing::debug;

use crate::core::envelope::StructuredValue;
use crate::network::client::{AdaptiveRequestClient, ClientConfig, ClientError};
use crate::network::protocol::{request, ApiResponse, RequestHeader, SessionCredential};
use crate::network::transport::{HttpTransport, Transport};

/// Client bound to one session credential.
pub struct ApiClient<T> {
    client: AdaptiveRequestClient<T>,
    credential: SessionCredential,
    header: RequestHeader,
}

impl<T: Transport> ApiClient<T> {
    /// Bind `credential` for calls made as game player `player_id`.
    pub fn new(
        client: AdaptiveRequestClient<T>,
        credential: SessionCredential,
        player_id: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        let header = RequestHeader::authenticated(player_id, &credential, app_version);
        Self {
            client,
            credential,
            header,
        }
    }

    /// The credential in use.
    pub fn credential(&self) -> &SessionCredential {
        &self.credential
    }

    /// Call `endpoint` with a positional body; returns the response split
    /// into header and body.
    pub async fn call(&self, endpoint: &str, body: StructuredValue) -> Result<ApiResponse, ClientError> {
        let message = request(&self.header, body);
        let value = self.client.send_with_retry(endpoint, &message).await?;
        let response = ApiResponse::parse(value)?;
        debug!("{} returned {} header fields", endpoint, response.header.len());
        Ok(response)
    }
}

impl ApiClient<HttpTransport> {
    /// HTTP client for `credential`, with endpoints, key, retry policy and
    /// client version taken from `config`.
    pub fn connect(
        config: &ClientConfig,
        credential: SessionCredential,
        player_id: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let client = AdaptiveRequestClient::connect(config)?;
        Ok(Self::new(client, credential, player_id, config.app_version.as_str()))
    }
}
