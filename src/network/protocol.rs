//! Protocol Messages
//!
//! Shapes of the MessagePack messages exchanged with the game API.
//! Every request is a two-element array `[header, body]`; every response
//! is `[header, body]` as well. Bodies are positional arrays.

use rmpv::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::envelope::StructuredValue;

/// Steam app id of the game.
pub const APP_ID: u32 = 1384160;

/// Client version string sent in every request header.
pub const DEFAULT_APP_VERSION: &str = "0.2.1";

/// Login endpoint, relative to the API root.
pub const LOGIN_ENDPOINT: &str = "user/login";

/// Fixed third header field.
const HEADER_KIND: i64 = 2;

/// Platform code for PC.
const PLATFORM_PC: i64 = 3;

/// First login body field.
const LOGIN_KIND: i64 = 1;

/// Fourth login body field.
const LOGIN_FLAGS: i64 = 256;

/// Credential produced by a successful login. Stored as JSON by callers
/// that keep it between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredential {
    /// 64-bit platform user id.
    pub steam_id: u64,
    /// Game session token (hex string).
    pub session_token: String,
}

/// Response shape errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Expected an array.
    #[error("expected array for {0}")]
    NotAnArray(&'static str),
    /// Array too short.
    #[error("missing {0}")]
    Missing(&'static str),
    /// Session token neither string nor binary.
    #[error("session token has unexpected type: {0}")]
    BadToken(String),
}

// =============================================================================
// REQUESTS
// =============================================================================

/// Request header: `[player_id, token, 2, version, 3]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// Game-side player id, empty before login.
    pub player_id: String,
    /// Session token, empty before login.
    pub token: String,
    /// Client version.
    pub version: String,
}

impl RequestHeader {
    /// Header used for the login call itself.
    pub fn anonymous(version: impl Into<String>) -> Self {
        Self {
            player_id: String::new(),
            token: String::new(),
            version: version.into(),
        }
    }

    /// Header for calls made after login.
    pub fn authenticated(
        player_id: impl Into<String>,
        credential: &SessionCredential,
        version: impl Into<String>,
    ) -> Self {
        Self {
            player_id: player_id.into(),
            token: credential.session_token.clone(),
            version: version.into(),
        }
    }

    /// Positional MessagePack form.
    pub fn to_value(&self) -> StructuredValue {
        Value::Array(vec![
            Value::from(self.player_id.as_str()),
            Value::from(self.token.as_str()),
            Value::from(HEADER_KIND),
            Value::from(self.version.as_str()),
            Value::from(PLATFORM_PC),
        ])
    }
}

/// Wrap a body with its header.
pub fn request(header: &RequestHeader, body: StructuredValue) -> StructuredValue {
    Value::Array(vec![header.to_value(), body])
}

/// The two characters that precede the user id's hex digits (`"0x"`).
pub fn id_prefix(user_id: u64) -> String {
    format!("{:#x}", user_id).chars().take(2).collect()
}

/// Login request: `[header, [1, user_id, id_prefix, 256, token_blob]]`.
///
/// `token_blob` is the upper-case hex of the ticket followed by the
/// length-prefixed app ticket.
pub fn login_request(user_id: u64, token_blob: &str, version: &str) -> StructuredValue {
    let body = Value::Array(vec![
        Value::from(LOGIN_KIND),
        Value::from(user_id),
        Value::from(id_prefix(user_id)),
        Value::from(LOGIN_FLAGS),
        Value::from(token_blob),
    ]);
    request(&RequestHeader::anonymous(version), body)
}

// =============================================================================
// RESPONSES
// =============================================================================

/// Decrypted `[header, body]` response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// Positional header fields.
    pub header: Vec<StructuredValue>,
    /// Endpoint-specific body.
    pub body: StructuredValue,
}

impl ApiResponse {
    /// Split a decrypted response into header and body.
    pub fn parse(value: StructuredValue) -> Result<Self, ProtocolError> {
        let Value::Array(mut parts) = value else {
            return Err(ProtocolError::NotAnArray("response"));
        };
        if parts.len() < 2 {
            return Err(ProtocolError::Missing("response body"));
        }
        let body = parts.swap_remove(1);
        let Value::Array(header) = parts.swap_remove(0) else {
            return Err(ProtocolError::NotAnArray("response header"));
        };
        Ok(Self { header, body })
    }
}

/// Session token from a login response: first field of the first element.
///
/// Binary tokens are hex encoded.
pub fn session_token(response: &StructuredValue) -> Result<String, ProtocolError> {
    let outer = response
        .as_array()
        .ok_or(ProtocolError::NotAnArray("login response"))?;
    let first = outer
        .first()
        .ok_or(ProtocolError::Missing("login response header"))?
        .as_array()
        .ok_or(ProtocolError::NotAnArray("login response header"))?;
    let token = first.first().ok_or(ProtocolError::Missing("session token"))?;

    match token {
        Value::String(s) => s
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::BadToken("non-UTF-8 string".into())),
        Value::Binary(b) => Ok(hex::encode_upper(b)),
        other => Err(ProtocolError::BadToken(format!("{:?}", other))),
    }
}
