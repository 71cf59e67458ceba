//! # Strive Auth
//!
//! Auth ticket framing and encrypted envelope client for the GGST game API.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        STRIVE AUTH                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/            - Pure codec primitives                    │
//! │  ├── ticket.rs    - Fixed-layout auth ticket + CRC32         │
//! │  └── envelope.rs  - AES-256-GCM / MessagePack envelopes      │
//! │                                                              │
//! │  network/         - I/O (async)                              │
//! │  ├── transport.rs - HTTP POST + public IP lookup             │
//! │  ├── client.rs    - Truncate-and-retry request client        │
//! │  ├── protocol.rs  - Request/response message shapes          │
//! │  ├── session.rs   - Login state machine                      │
//! │  └── api.rs       - Authenticated calls after login          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Envelope Guarantees
//!
//! - Every request uses a fresh random nonce
//! - Tampered or truncated responses fail tag verification and are never
//!   decoded
//! - A response that decrypts but does not parse is an error, not an
//!   empty success

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;

// Re-export commonly used types
pub use crate::core::envelope::{decrypt, encrypt, EnvelopeError, EnvelopeKey, StructuredValue};
pub use crate::core::ticket::{AuthTicket, TicketError};
pub use network::{
    AdaptiveRequestClient, ApiClient, ClientConfig, ClientError, HttpTransport, LoginError,
    SessionCredential, SessionLoginFlow,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
