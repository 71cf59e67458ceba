//! Adaptive Request Client
//!
//! Sends encrypted envelopes and decrypts the replies. The game server
//! sometimes answers a perfectly valid request with something that does
//! not decrypt; resending the same message with the tail of the base64url
//! payload cut off gets through. The client does that in fixed steps,
//! with a hard cap on the total cut.
//!
//! ```text
//! attempt 1: encrypt ──► payload            ──► decrypt? ── ok ──► value
//! attempt 2: encrypt ──► payload[..len-2]   ──► decrypt? ── ok ──► value
//! attempt 3: encrypt ──► payload[..len-4]   ──► ...
//! ...        until shrink + step > max_shrink ──► RetryExhausted
//! ```

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};

use crate::core::envelope::{self, EnvelopeError, EnvelopeKey, StructuredValue};
use crate::network::protocol::{ProtocolError, DEFAULT_APP_VERSION};
use crate::network::transport::{
    HttpTransport, Transport, TransportError, DEFAULT_BASE_URL, DEFAULT_IP_LOOKUP_URL,
};

/// Pre-shared key of the game API.
pub const GAME_KEY: EnvelopeKey = EnvelopeKey::new([
    0xEE, 0xBC, 0x1F, 0x57, 0x48, 0x7F, 0x51, 0x92, 0x1C, 0x04, 0x65, 0x66, 0x5F, 0x8A, 0xE6, 0xD1,
    0x65, 0x8B, 0xB2, 0x6D, 0xE6, 0xF8, 0xA0, 0x69, 0xA3, 0x52, 0x02, 0x93, 0xA5, 0x72, 0x07, 0x8F,
]);

/// Characters dropped per retry. A compatibility constant, not a protocol rule.
pub const DEFAULT_SHRINK_STEP: usize = 2;

/// Cap on the total characters dropped.
pub const DEFAULT_MAX_SHRINK: usize = 16;

/// Per-attempt deadline.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Environment variable held an unusable value.
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
        /// What was wrong.
        reason: String,
    },
}

/// Truncation policy for the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkPolicy {
    /// Characters removed per retry.
    pub step: usize,
    /// Largest total number of characters removed.
    pub max_shrink: usize,
}

impl Default for ShrinkPolicy {
    fn default() -> Self {
        Self {
            step: DEFAULT_SHRINK_STEP,
            max_shrink: DEFAULT_MAX_SHRINK,
        }
    }
}

impl ShrinkPolicy {
    /// Number of truncated resends after the first attempt.
    pub fn retries(&self) -> usize {
        if self.step == 0 {
            0
        } else {
            self.max_shrink / self.step
        }
    }

    /// Total sends the policy allows.
    pub fn max_attempts(&self) -> usize {
        self.retries() + 1
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API root URL.
    pub base_url: String,
    /// Public-IP lookup URL.
    pub ip_lookup_url: String,
    /// Envelope key.
    pub key: EnvelopeKey,
    /// Retry truncation policy.
    pub shrink: ShrinkPolicy,
    /// Deadline for a single send + receive.
    pub attempt_timeout: Duration,
    /// Client version placed in request headers.
    pub app_version: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            ip_lookup_url: DEFAULT_IP_LOOKUP_URL.to_string(),
            key: GAME_KEY,
            shrink: ShrinkPolicy::default(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            app_version: DEFAULT_APP_VERSION.to_string(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `STRIVE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("STRIVE_BASE_URL") {
            config.base_url = url;
        }
        if let Some(url) = lookup("STRIVE_IP_LOOKUP_URL") {
            config.ip_lookup_url = url;
        }
        if let Some(version) = lookup("STRIVE_APP_VERSION") {
            config.app_version = version;
        }
        if let Some(raw) = lookup("STRIVE_KEY") {
            config.key = EnvelopeKey::from_hex(&raw).map_err(|e| ConfigError::Invalid {
                var: "STRIVE_KEY",
                value: "<redacted>".into(),
                reason: e.to_string(),
            })?;
        }
        if let Some(raw) = lookup("STRIVE_SHRINK_STEP") {
            config.shrink.step = parse_number("STRIVE_SHRINK_STEP", &raw)?;
        }
        if let Some(raw) = lookup("STRIVE_MAX_SHRINK") {
            config.shrink.max_shrink = parse_number("STRIVE_MAX_SHRINK", &raw)?;
        }
        if let Some(raw) = lookup("STRIVE_ATTEMPT_TIMEOUT_MS") {
            let ms: u64 = parse_number("STRIVE_ATTEMPT_TIMEOUT_MS", &raw)?;
            config.attempt_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shrink.step == 0 {
            return Err(ConfigError::Invalid {
                var: "STRIVE_SHRINK_STEP",
                value: "0".into(),
                reason: "step must be positive".into(),
            });
        }
        if self.attempt_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                var: "STRIVE_ATTEMPT_TIMEOUT_MS",
                value: "0".into(),
                reason: "timeout must be positive".into(),
            });
        }
        Ok(())
    }
}

fn parse_number<N: std::str::FromStr>(var: &'static str, raw: &str) -> Result<N, ConfigError>
where
    N::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: N::Err| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

// =============================================================================
// ERRORS
// =============================================================================

/// Why a single attempt did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    /// Response did not authenticate or decode.
    #[error(transparent)]
    Envelope(EnvelopeError),
    /// No response within the attempt deadline.
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

/// Request client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Envelope error that retrying cannot fix.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Every allowed attempt failed.
    #[error("{endpoint}: gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Endpoint being called.
        endpoint: String,
        /// Sends made, including the first.
        attempts: usize,
        /// Failure of the final attempt.
        #[source]
        last: AttemptFailure,
    },

    /// Transport failure. Not retried.
    #[error("network error: {0}")]
    Network(#[from] TransportError),

    /// Configuration the client cannot run with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Decrypted response has the wrong shape.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(#[from] ProtocolError),
}

// =============================================================================
// CLIENT
// =============================================================================

/// Envelope client with bounded truncate-and-retry.
pub struct AdaptiveRequestClient<T> {
    transport: Arc<T>,
    key: EnvelopeKey,
    shrink: ShrinkPolicy,
    attempt_timeout: Duration,
}

impl<T> Clone for AdaptiveRequestClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            key: self.key.clone(),
            shrink: self.shrink,
            attempt_timeout: self.attempt_timeout,
        }
    }
}

impl<T: Transport> AdaptiveRequestClient<T> {
    /// Create a client over `transport`.
    pub fn new(
        transport: T,
        key: EnvelopeKey,
        shrink: ShrinkPolicy,
        attempt_timeout: Duration,
    ) -> Result<Self, ClientError> {
        if shrink.step == 0 {
            return Err(ConfigError::Invalid {
                var: "shrink.step",
                value: "0".into(),
                reason: "step must be positive".into(),
            }
            .into());
        }

        Ok(Self {
            transport: Arc::new(transport),
            key,
            shrink,
            attempt_timeout,
        })
    }

    /// Create a client from a validated config.
    pub fn from_config(transport: T, config: &ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        Self::new(transport, config.key.clone(), config.shrink, config.attempt_timeout)
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The truncation policy in use.
    pub fn shrink_policy(&self) -> ShrinkPolicy {
        self.shrink
    }

    /// Send `message` to `endpoint`, retrying with shorter payloads when the
    /// reply fails to authenticate or decode.
    pub async fn send_with_retry(
        &self,
        endpoint: &str,
        message: &StructuredValue,
    ) -> Result<StructuredValue, ClientError> {
        let mut shrink = 0usize;
        let mut attempts = 0usize;

        loop {
            attempts += 1;

            // Fresh nonce on every attempt.
            let sealed = envelope::encrypt(message, &self.key)?;
            let payload = truncate_payload(&sealed, shrink);
            debug!(
                "{} attempt {}: {} of {} chars (shrink {})",
                endpoint,
                attempts,
                payload.len(),
                sealed.len(),
                shrink
            );

            let reply = time::timeout(self.attempt_timeout, self.transport.post(endpoint, payload)).await;
            let failure = match reply {
                Err(_) => AttemptFailure::Timeout(self.attempt_timeout),
                Ok(Err(e)) => return Err(ClientError::Network(e)),
                Ok(Ok(body)) => match envelope::decrypt(&hex::encode(&body), &self.key) {
                    Ok(value) => {
                        if attempts > 1 {
                            info!("{} succeeded on attempt {} (shrink {})", endpoint, attempts, shrink);
                        }
                        return Ok(value);
                    }
                    Err(e) if e.is_retryable() => AttemptFailure::Envelope(e),
                    Err(e) => return Err(e.into()),
                },
            };

            if shrink + self.shrink.step > self.shrink.max_shrink {
                warn!("{} failed after {} attempts: {}", endpoint, attempts, failure);
                return Err(ClientError::RetryExhausted {
                    endpoint: endpoint.to_string(),
                    attempts,
                    last: failure,
                });
            }

            shrink += self.shrink.step;
            warn!("{} attempt {} failed ({}); retrying with shrink {}", endpoint, attempts, failure, shrink);
        }
    }
}

impl AdaptiveRequestClient<HttpTransport> {
    /// HTTP client for `config.base_url` with the configured key and policy.
    pub fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let transport = HttpTransport::from_config(config)?;
        Self::from_config(transport, config)
    }
}

/// Drop the last `shrink` characters. Payloads are base64url, so ASCII.
fn truncate_payload(envelope: &str, shrink: usize) -> &str {
    &envelope[..envelope.len().saturating_sub(shrink)]
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::{encode_message, open_request, seal_bytes, NONCE_LEN};
    use async_trait::async_trait;
    use rmpv::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn key() -> EnvelopeKey {
        GAME_KEY
    }

    fn sealed_body(value: &Value) -> Vec<u8> {
        seal_bytes(&encode_message(value).unwrap(), &key(), [9u8; NONCE_LEN]).unwrap()
    }

    /// What the stub server does with each request.
    enum Behavior {
        Garbage,
        SucceedOn(usize),
        /// Answers only when the payload carries no `=` padding.
        RejectPadded,
        NetworkDown,
        HangFirst,
        Hang,
        /// Authentic envelope around this plaintext.
        Plaintext(&'static [u8]),
    }

    struct StubTransport {
        behavior: Behavior,
        calls: AtomicUsize,
        payloads: Mutex<Vec<String>>,
    }

    impl StubTransport {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                calls: AtomicUsize::new(0),
                payloads: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn post(&self, endpoint: &str, envelope: &str) -> Result<Vec<u8>, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.payloads.lock().unwrap().push(envelope.to_string());
            let reply = Value::from("ok");

            match &self.behavior {
                Behavior::Garbage => Ok(vec![0xAB; 40]),
                Behavior::SucceedOn(k) if n >= *k => Ok(sealed_body(&reply)),
                Behavior::SucceedOn(_) => Ok(b"<html>bad request</html>".to_vec()),
                Behavior::RejectPadded => {
                    if envelope.ends_with('=') {
                        return Ok(Vec::new());
                    }
                    match open_request(envelope, &key()) {
                        Ok(request) => Ok(sealed_body(&request)),
                        Err(_) => Ok(Vec::new()),
                    }
                }
                Behavior::NetworkDown => Err(TransportError::Status {
                    endpoint: endpoint.into(),
                    status: 503,
                }),
                Behavior::HangFirst => {
                    if n == 1 {
                        time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(sealed_body(&reply))
                }
                Behavior::Hang => {
                    time::sleep(Duration::from_secs(5)).await;
                    Ok(sealed_body(&reply))
                }
                Behavior::Plaintext(bytes) => {
                    Ok(seal_bytes(bytes, &key(), [9u8; NONCE_LEN]).unwrap())
                }
            }
        }
    }

    fn client(behavior: Behavior, step: usize, max_shrink: usize) -> AdaptiveRequestClient<StubTransport> {
        AdaptiveRequestClient::new(
            StubTransport::new(behavior),
            key(),
            ShrinkPolicy { step, max_shrink },
            Duration::from_millis(200),
        )
        .unwrap()
    }

    fn message() -> Value {
        Value::Array(vec![Value::from("hello"), Value::from(42)])
    }

    #[tokio::test]
    async fn test_retry_terminates_after_budget() {
        let c = client(Behavior::Garbage, 2, 10);
        let err = c.send_with_retry("user/login", &message()).await.unwrap_err();

        match err {
            ClientError::RetryExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 10 / 2 + 1);
                assert!(matches!(last, AttemptFailure::Envelope(EnvelopeError::Authentication { .. })));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(c.transport.calls.load(Ordering::SeqCst), c.shrink_policy().max_attempts());
    }

    #[tokio::test]
    async fn test_each_retry_cuts_one_more_step() {
        let c = client(Behavior::Garbage, 3, 9);
        let _ = c.send_with_retry("x", &message()).await;

        let payloads = c.transport.payloads.lock().unwrap();
        let full = envelope::encrypt(&message(), &key()).unwrap().len();
        let lens: Vec<usize> = payloads.iter().map(String::len).collect();
        assert_eq!(lens, vec![full, full - 3, full - 6, full - 9]);

        // Re-encrypted every time, so no two payloads share a prefix nonce.
        assert_ne!(payloads[0][..16], payloads[1][..16]);
    }

    #[tokio::test]
    async fn test_success_after_retries() {
        let c = client(Behavior::SucceedOn(3), 2, 16);
        let value = c.send_with_retry("x", &message()).await.unwrap();
        assert_eq!(value, Value::from("ok"));
        assert_eq!(c.transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_first_attempt_sends_full_payload() {
        let c = client(Behavior::SucceedOn(1), 2, 16);
        c.send_with_retry("x", &message()).await.unwrap();

        let payloads = c.transport.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(open_request(&payloads[0], &key()).unwrap(), message());
    }

    #[tokio::test]
    async fn test_padding_sensitive_server() {
        // 3 byte plaintext -> 31 byte envelope -> two padding characters.
        let msg = Value::Array(vec![Value::from(""), Value::from(1)]);
        assert!(envelope::encrypt(&msg, &key()).unwrap().ends_with("=="));

        let c = client(Behavior::RejectPadded, 2, 8);
        let echoed = c.send_with_retry("x", &msg).await.unwrap();
        assert_eq!(echoed, msg);
        assert_eq!(c.transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_network_error_is_not_retried() {
        let c = client(Behavior::NetworkDown, 2, 16);
        let err = c.send_with_retry("x", &message()).await.unwrap_err();
        assert!(matches!(err, ClientError::Network(TransportError::Status { status: 503, .. })));
        assert_eq!(c.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_feeds_retry_budget() {
        let c = client(Behavior::HangFirst, 2, 4);
        let value = c.send_with_retry("x", &message()).await.unwrap();
        assert_eq!(value, Value::from("ok"));
        assert_eq!(c.transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_final_timeout_is_reported() {
        let c = client(Behavior::Hang, 2, 4);
        let err = c.send_with_retry("x", &message()).await.unwrap_err();

        match err {
            ClientError::RetryExhausted { attempts, last, .. } => {
                assert_eq!(attempts, c.shrink_policy().max_attempts());
                assert_eq!(last, AttemptFailure::Timeout(Duration::from_millis(200)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(c.transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_undecodable_reply_is_retried_until_exhausted() {
        // Trailing byte, reserved marker, reserved marker inside an array.
        const UNDECODABLE: [&[u8]; 3] = [&[0x01, 0x02], &[0xc1], &[0x91, 0xc1]];

        for plaintext in UNDECODABLE {
            let c = client(Behavior::Plaintext(plaintext), 2, 6);
            let err = c.send_with_retry("x", &message()).await.unwrap_err();

            match err {
                ClientError::RetryExhausted { attempts, last, .. } => {
                    assert_eq!(attempts, 4, "{plaintext:?}");
                    assert!(
                        matches!(last, AttemptFailure::Envelope(EnvelopeError::Decode { .. })),
                        "{plaintext:?}: {last:?}"
                    );
                }
                other => panic!("{plaintext:?}: unexpected error: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_zero_budget_means_single_attempt() {
        let c = client(Behavior::Garbage, 2, 0);
        let err = c.send_with_retry("x", &message()).await.unwrap_err();
        assert!(matches!(err, ClientError::RetryExhausted { attempts: 1, .. }));
    }

    #[test]
    fn test_zero_step_rejected() {
        let result = AdaptiveRequestClient::new(
            StubTransport::new(Behavior::Garbage),
            key(),
            ShrinkPolicy { step: 0, max_shrink: 4 },
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(ClientError::InvalidConfig(_))));
    }

    #[test]
    fn test_truncate_payload() {
        assert_eq!(truncate_payload("abcdef", 0), "abcdef");
        assert_eq!(truncate_payload("abcdef", 2), "abcd");
        assert_eq!(truncate_payload("ab", 4), "");
    }

    #[test]
    fn test_connect_applies_config() {
        let config = ClientConfig {
            base_url: "http://127.0.0.1:9/api".into(),
            shrink: ShrinkPolicy { step: 4, max_shrink: 8 },
            ..ClientConfig::default()
        };
        let c = AdaptiveRequestClient::connect(&config).unwrap();
        assert_eq!(c.shrink_policy().max_attempts(), 3);

        let zero_timeout = ClientConfig {
            attempt_timeout: Duration::ZERO,
            ..ClientConfig::default()
        };
        assert!(matches!(
            AdaptiveRequestClient::connect(&zero_timeout),
            Err(ClientError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_from_lookup() {
        let config = ClientConfig::from_lookup(|var| match var {
            "STRIVE_SHRINK_STEP" => Some("4".into()),
            "STRIVE_MAX_SHRINK" => Some("12".into()),
            "STRIVE_ATTEMPT_TIMEOUT_MS" => Some("2500".into()),
            "STRIVE_BASE_URL" => Some("http://localhost:9000/api".into()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.shrink, ShrinkPolicy { step: 4, max_shrink: 12 });
        assert_eq!(config.shrink.retries(), 3);
        assert_eq!(config.attempt_timeout, Duration::from_millis(2500));
        assert_eq!(config.base_url, "http://localhost:9000/api");
        assert_eq!(config.key, GAME_KEY);
        assert_eq!(config.app_version, DEFAULT_APP_VERSION);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let bad_step = ClientConfig::from_lookup(|var| (var == "STRIVE_SHRINK_STEP").then(|| "0".into()));
        assert!(bad_step.is_err());

        let not_a_number =
            ClientConfig::from_lookup(|var| (var == "STRIVE_MAX_SHRINK").then(|| "lots".into()));
        assert!(matches!(not_a_number, Err(ConfigError::Invalid { var: "STRIVE_MAX_SHRINK", .. })));

        let bad_key = ClientConfig::from_lookup(|var| (var == "STRIVE_KEY").then(|| "beef".into()));
        assert!(matches!(bad_key, Err(ConfigError::Invalid { var: "STRIVE_KEY", .. })));
    }
}
