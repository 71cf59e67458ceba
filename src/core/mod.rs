//! Core codec primitives.
//!
//! Pure functions only: no I/O, no clocks, no global key.

pub mod envelope;
pub mod ticket;

// Re-export core types
pub use envelope::{decrypt, encrypt, EnvelopeError, EnvelopeKey, StructuredValue};
pub use ticket::{AuthTicket, TicketError};
