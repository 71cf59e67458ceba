//! Auth Ticket Framing
//!
//! Fixed-layout binary ticket proving an active platform session.
//! Embedded (hex encoded) in the login request and submitted with its
//! CRC32 in the platform auth-list message.
//!
//! ```text
//! ┌──────────┬───────────┬────────┬──────┬──────┬──────────┬──────┬─────────┬──────┐
//! │ len u32  │ token     │ 24 u32 │ 1    │ 2    │ ip (rev) │ 0    │ elapsed │ 1    │
//! │ LE       │ len bytes │ LE     │ LE   │ LE   │ 4 bytes  │ LE   │ LE      │ LE   │
//! └──────────┴───────────┴────────┴──────┴──────┴──────────┴──────┴─────────┴──────┘
//! ```

use std::net::Ipv4Addr;
use thiserror::Error;

/// Size of the session info block that follows the token.
pub const SESSION_INFO_SIZE: u32 = 24;

/// Bytes in the ticket besides the token itself.
pub const TICKET_OVERHEAD: usize = 4 + 28;

/// Ticket construction / parsing errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TicketError {
    /// Game token was empty.
    #[error("game token is empty")]
    EmptyToken,
    /// Token does not fit a u32 length prefix.
    #[error("game token too long: {0} bytes")]
    TokenTooLong(usize),
    /// App ticket does not fit a u32 length prefix.
    #[error("app ticket too long: {0} bytes")]
    AppTicketTooLong(usize),
    /// Session time negative, NaN or infinite.
    #[error("invalid session elapsed seconds: {0}")]
    InvalidElapsed(f64),
    /// Address string is not a dotted quad.
    #[error("invalid IPv4 address: {0:?}")]
    InvalidAddress(String),
    /// Input shorter than the layout requires.
    #[error("ticket truncated: need {needed} bytes, have {actual}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        actual: usize,
    },
    /// A constant field held an unexpected value.
    #[error("unexpected value {actual} in {field} (expected {expected})")]
    BadConstant {
        /// Field name.
        field: &'static str,
        /// Expected value.
        expected: u32,
        /// Value found.
        actual: u32,
    },
    /// Bytes left over after the final field.
    #[error("{0} trailing bytes after ticket")]
    TrailingBytes(usize),
}

/// Authentication ticket.
///
/// Built once per login and never mutated. All multi-byte integers are
/// little-endian; the address is stored with its octets reversed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTicket {
    /// Opaque game connect token from the platform.
    pub token: Vec<u8>,
    /// Public address of this client.
    pub public_ip: Ipv4Addr,
    /// Whole seconds since the platform session started.
    pub elapsed_secs: u32,
}

impl AuthTicket {
    /// Build a ticket from a game token, session age and public address.
    ///
    /// Fractional seconds are discarded.
    pub fn build(
        token: &[u8],
        session_elapsed_secs: f64,
        public_ip: Ipv4Addr,
    ) -> Result<Self, TicketError> {
        if token.is_empty() {
            return Err(TicketError::EmptyToken);
        }
        if u32::try_from(token.len()).is_err() {
            return Err(TicketError::TokenTooLong(token.len()));
        }
        if !session_elapsed_secs.is_finite() || session_elapsed_secs < 0.0 {
            return Err(TicketError::InvalidElapsed(session_elapsed_secs));
        }

        Ok(Self {
            token: token.to_vec(),
            public_ip,
            // Saturating float->int cast, so huge values clamp to u32::MAX.
            elapsed_secs: session_elapsed_secs.trunc() as u32,
        })
    }

    /// Same as [`AuthTicket::build`] with the address given as a string.
    pub fn build_from_str(
        token: &[u8],
        session_elapsed_secs: f64,
        public_ip: &str,
    ) -> Result<Self, TicketError> {
        let ip = parse_ipv4(public_ip)?;
        Self::build(token, session_elapsed_secs, ip)
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        TICKET_OVERHEAD + self.token.len()
    }

    /// Serialize to the wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());

        out.extend_from_slice(&(self.token.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.token);

        for value in [SESSION_INFO_SIZE, 1, 2] {
            out.extend_from_slice(&value.to_le_bytes());
        }

        let mut octets = self.public_ip.octets();
        octets.reverse();
        out.extend_from_slice(&octets);

        for value in [0, self.elapsed_secs, 1] {
            out.extend_from_slice(&value.to_le_bytes());
        }

        out
    }

    /// Parse the wire layout back into a ticket.
    pub fn decode(bytes: &[u8]) -> Result<Self, TicketError> {
        let mut reader = Reader::new(bytes);

        let token_len = reader.u32()? as usize;
        if token_len == 0 {
            return Err(TicketError::EmptyToken);
        }
        let token = reader.take(token_len)?.to_vec();

        reader.expect("session_info_size", SESSION_INFO_SIZE)?;
        reader.expect("session_info_a", 1)?;
        reader.expect("session_info_b", 2)?;

        let raw_ip = reader.take(4)?;
        let octets = [raw_ip[3], raw_ip[2], raw_ip[1], raw_ip[0]];

        reader.expect("reserved", 0)?;
        let elapsed_secs = reader.u32()?;
        reader.expect("trailer", 1)?;

        let rest = reader.remaining();
        if rest != 0 {
            return Err(TicketError::TrailingBytes(rest));
        }

        Ok(Self {
            token,
            public_ip: Ipv4Addr::from(octets),
            elapsed_secs,
        })
    }

    /// CRC32 (IEEE) of the encoded ticket, as sent alongside it.
    pub fn crc32(&self) -> u32 {
        crc32fast::hash(&self.encode())
    }
}

/// Login token blob: ticket, then the app ticket with a u32 LE length prefix,
/// upper-case hex encoded.
pub fn login_token_blob(ticket: &AuthTicket, app_ticket: &[u8]) -> Result<String, TicketError> {
    let prefix =
        length_prefix(app_ticket.len()).ok_or(TicketError::AppTicketTooLong(app_ticket.len()))?;

    let mut blob = ticket.encode();
    blob.extend_from_slice(&prefix);
    blob.extend_from_slice(app_ticket);
    Ok(hex::encode_upper(blob))
}

/// u32 LE length prefix, if `len` fits.
fn length_prefix(len: usize) -> Option<[u8; 4]> {
    u32::try_from(len).ok().map(u32::to_le_bytes)
}

/// Parse a dotted-quad IPv4 address.
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr, TicketError> {
    s.trim()
        .parse()
        .map_err(|_| TicketError::InvalidAddress(s.to_string()))
}

/// Cursor over ticket bytes.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TicketError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(TicketError::Truncated {
                needed: self.pos.saturating_add(n),
                actual: self.bytes.len(),
            }),
        }
    }

    fn u32(&mut self) -> Result<u32, TicketError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn expect(&mut self, field: &'static str, expected: u32) -> Result<(), TicketError> {
        let actual = self.u32()?;
        if actual != expected {
            return Err(TicketError::BadConstant { field, expected, actual });
        }
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

// =============================================================================
// TESTS
// =============================================================================
