//! Network Layer
//!
//! HTTP transport, the adaptive envelope client, and the login flow
//! built on top of them.

pub mod api;
pub mod client;
pub mod protocol;
pub mod session;
pub mod transport;

pub use api::ApiClient;
pub use client::{
    AdaptiveRequestClient, AttemptFailure, ClientConfig, ClientError, ConfigError, ShrinkPolicy,
    GAME_KEY,
};
pub use protocol::{ApiResponse, ProtocolError, RequestHeader, SessionCredential};
pub use session::{
    game_token_queue, AuthListEntry, GameTokenQueue, GameTokenSink, LoginError, LoginState,
    PlatformError, PlatformSession, SessionLoginFlow,
};
pub use transport::{
    HttpIpResolver, HttpTransport, PublicIpResolver, StaticIpResolver, Transport, TransportError,
};
