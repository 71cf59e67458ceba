//! Session Login Flow
//!
//! Turns a platform game token into a game session credential:
//!
//! ```text
//! AwaitingTicket ──► AwaitingServerAck ──► AwaitingLoginResponse ──► Complete
//!       │                   │                       │
//!       └───────────────────┴───────────────────────┴──────────────► Failed(reason)
//! ```
//!
//! A flow runs once. Failures are terminal; the only retrying happens
//! inside the adaptive client while waiting for the login response.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::ticket::{login_token_blob, AuthTicket, TicketError};
use crate::network::client::{AdaptiveRequestClient, ClientConfig, ClientError};
use crate::network::protocol::{
    login_request, session_token, ProtocolError, SessionCredential, APP_ID, DEFAULT_APP_VERSION,
    LOGIN_ENDPOINT,
};
use crate::network::transport::{
    HttpIpResolver, HttpTransport, PublicIpResolver, Transport, TransportError,
};

/// Login flow state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    /// Building the auth ticket.
    AwaitingTicket,
    /// Auth list submitted, waiting for the platform ack.
    AwaitingServerAck,
    /// Login request sent, waiting for the decrypted response.
    AwaitingLoginResponse,
    /// Credential obtained.
    Complete,
    /// Flow aborted.
    Failed(String),
}

impl LoginState {
    /// Whether the flow has finished, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_))
    }

    /// Validate and perform a transition.
    pub fn transition(&self, next: LoginState) -> Result<LoginState, LoginError> {
        use LoginState::*;
        let allowed = match (self, &next) {
            (AwaitingTicket, AwaitingServerAck) => true,
            (AwaitingServerAck, AwaitingLoginResponse) => true,
            (AwaitingLoginResponse, Complete) => true,
            (current, Failed(_)) => !current.is_terminal(),
            _ => false,
        };

        if allowed {
            Ok(next)
        } else {
            Err(LoginError::InvalidTransition {
                from: self.clone(),
                to: next,
            })
        }
    }
}

/// Platform collaborator failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("platform error: {0}")]
pub struct PlatformError(pub String);

/// Login flow errors.
#[derive(Debug, Error)]
pub enum LoginError {
    /// Ticket could not be built.
    #[error("auth ticket: {0}")]
    Ticket(#[from] TicketError),

    /// Public address lookup failed.
    #[error("public IP lookup: {0}")]
    PublicIp(#[source] TransportError),

    /// Platform rejected or never acknowledged the auth list.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// Login request failed.
    #[error("login request: {0}")]
    Request(#[from] ClientError),

    /// Login response did not contain a token.
    #[error("login response: {0}")]
    Response(#[from] ProtocolError),

    /// Platform never delivered a game token.
    #[error("no game token received within {0:?}")]
    NoGameToken(Duration),

    /// State machine violation, e.g. reusing a finished flow.
    #[error("invalid login transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// State before.
        from: LoginState,
        /// Requested state.
        to: LoginState,
    },
}

/// Auth-list entry submitted to the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthListEntry {
    /// App the ticket is for.
    pub game_id: u32,
    /// Encoded auth ticket.
    pub ticket: Vec<u8>,
    /// CRC32 of `ticket`.
    pub ticket_crc: u32,
    /// Game tokens the platform handed us.
    pub tokens_left: u32,
}

/// The logged-in platform client.
#[async_trait]
pub trait PlatformSession: Send + Sync {
    /// Encrypted app ticket for `app_id`.
    async fn app_ticket(&self, app_id: u32) -> Result<Vec<u8>, PlatformError>;

    /// Submit the auth list and wait for its acknowledgement.
    async fn submit_auth_list(&self, entry: &AuthListEntry) -> Result<(), PlatformError>;
}

// =============================================================================
// GAME TOKEN QUEUE
// =============================================================================

/// Create a bounded game token queue.
///
/// The sink goes to the platform callback; the flow owns the queue.
pub fn game_token_queue(capacity: usize) -> (GameTokenSink, GameTokenQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (GameTokenSink { tx }, GameTokenQueue { rx })
}

/// Producer half, handed to the platform's token callback.
#[derive(Debug, Clone)]
pub struct GameTokenSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl GameTokenSink {
    /// Queue tokens without blocking. Returns how many were accepted;
    /// tokens beyond the queue's capacity are dropped.
    pub fn push<I>(&self, tokens: I) -> usize
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut accepted = 0;
        for token in tokens {
            match self.tx.try_send(token) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    warn!("Dropping game token: {}", e);
                    break;
                }
            }
        }
        accepted
    }
}

/// Consumer half. Read exactly once.
#[derive(Debug)]
pub struct GameTokenQueue {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl GameTokenQueue {
    /// Wait for the first token, then count whatever else already arrived.
    ///
    /// Returns the first token and the total number received.
    pub async fn take_first(mut self, wait: Duration) -> Result<(Vec<u8>, u32), LoginError> {
        let first = match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(token)) => token,
            Ok(None) | Err(_) => return Err(LoginError::NoGameToken(wait)),
        };

        let mut count = 1u32;
        while self.rx.try_recv().is_ok() {
            count += 1;
        }
        Ok((first, count))
    }
}

// =============================================================================
// LOGIN FLOW
// =============================================================================

/// One-shot login orchestration.
pub struct SessionLoginFlow<T> {
    client: AdaptiveRequestClient<T>,
    platform: Arc<dyn PlatformSession>,
    ip_resolver: Arc<dyn PublicIpResolver>,
    session_start: Instant,
    app_id: u32,
    app_version: String,
    state: LoginState,
}

impl<T: Transport> SessionLoginFlow<T> {
    /// Create a flow for a platform session that started at `session_start`.
    pub fn new(
        client: AdaptiveRequestClient<T>,
        platform: Arc<dyn PlatformSession>,
        ip_resolver: Arc<dyn PublicIpResolver>,
        session_start: Instant,
    ) -> Self {
        Self {
            client,
            platform,
            ip_resolver,
            session_start,
            app_id: APP_ID,
            app_version: DEFAULT_APP_VERSION.to_string(),
            state: LoginState::AwaitingTicket,
        }
    }

    /// Override the client version sent in the login header.
    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    /// Current state.
    pub fn state(&self) -> &LoginState {
        &self.state
    }

    /// Log in with a single game token.
    pub async fn login(&mut self, token: &[u8], user_id: u64) -> Result<SessionCredential, LoginError> {
        self.login_with_count(token, user_id, 1).await
    }

    /// Wait for the platform's game tokens, then log in with the first.
    pub async fn login_from_queue(
        &mut self,
        queue: GameTokenQueue,
        user_id: u64,
        wait: Duration,
    ) -> Result<SessionCredential, LoginError> {
        if self.state != LoginState::AwaitingTicket {
            return Err(LoginError::InvalidTransition {
                from: self.state.clone(),
                to: LoginState::AwaitingTicket,
            });
        }

        match queue.take_first(wait).await {
            Ok((token, count)) => self.login_with_count(&token, user_id, count).await,
            Err(e) => {
                self.state = LoginState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn login_with_count(
        &mut self,
        token: &[u8],
        user_id: u64,
        tokens_left: u32,
    ) -> Result<SessionCredential, LoginError> {
        if self.state != LoginState::AwaitingTicket {
            return Err(LoginError::InvalidTransition {
                from: self.state.clone(),
                to: LoginState::AwaitingTicket,
            });
        }

        match self.run(token, user_id, tokens_left).await {
            Ok(credential) => Ok(credential),
            Err(e) => {
                warn!("Login failed in {:?}: {}", self.state, e);
                self.state = self.state.transition(LoginState::Failed(e.to_string()))?;
                Err(e)
            }
        }
    }

    async fn run(
        &mut self,
        token: &[u8],
        user_id: u64,
        tokens_left: u32,
    ) -> Result<SessionCredential, LoginError> {
        // AwaitingTicket
        let public_ip = self
            .ip_resolver
            .public_ip()
            .await
            .map_err(LoginError::PublicIp)?;
        let app_ticket = self.platform.app_ticket(self.app_id).await?;
        let elapsed = self.session_start.elapsed().as_secs_f64();
        let ticket = AuthTicket::build(token, elapsed, public_ip)?;
        debug!(
            "Built auth ticket: {} bytes, {}s into session",
            ticket.encoded_len(),
            ticket.elapsed_secs
        );

        // AwaitingServerAck
        self.advance(LoginState::AwaitingServerAck)?;
        let entry = AuthListEntry {
            game_id: self.app_id,
            ticket: ticket.encode(),
            ticket_crc: ticket.crc32(),
            tokens_left,
        };
        self.platform.submit_auth_list(&entry).await?;
        debug!("Auth list acknowledged (crc {:08x})", entry.ticket_crc);

        // AwaitingLoginResponse
        self.advance(LoginState::AwaitingLoginResponse)?;
        let blob = login_token_blob(&ticket, &app_ticket)?;
        let message = login_request(user_id, &blob, &self.app_version);
        let response = self.client.send_with_retry(LOGIN_ENDPOINT, &message).await?;

        // Complete
        let session_token = session_token(&response)?;
        self.advance(LoginState::Complete)?;
        info!("Obtained session token for user {}", user_id);

        Ok(SessionCredential {
            steam_id: user_id,
            session_token,
        })
    }

    fn advance(&mut self, next: LoginState) -> Result<(), LoginError> {
        self.state = self.state.transition(next)?;
        Ok(())
    }
}

impl SessionLoginFlow<HttpTransport> {
    /// Flow over HTTP, with endpoints, key, retry policy and client version
    /// all taken from `config`.
    pub fn connect(
        config: &ClientConfig,
        platform: Arc<dyn PlatformSession>,
        session_start: Instant,
    ) -> Result<Self, ClientError> {
        let client = AdaptiveRequestClient::connect(config)?;
        let ip_resolver = Arc::new(HttpIpResolver::from_config(config));
        Ok(Self::new(client, platform, ip_resolver, session_start)
            .with_app_version(config.app_version.as_str()))
    }
}

// =============================================================================
// TESTS
// =============================================================================
