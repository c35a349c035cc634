//! Authentication of sign requests.
//!
//! Profiles reference an authentication key by name. Each name resolves to a
//! [`Provider`] which checks the token of an [`AuthenticatedRequest`]. The
//! only built-in mechanism is [`Standard`], an HMAC-SHA256 over the raw sign
//! request bytes.
use std::{
    fmt::Debug,
    time::{SystemTime, UNIX_EPOCH},
};

use hmac::{Hmac, Mac};
use multiroot_shared::time::Duration;
use sha2::Sha256;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use zeroize::Zeroizing;

use crate::request::AuthenticatedRequest;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, PartialEq, Snafu)]
pub enum VerifyError {
    #[snafu(display("token does not match the request"))]
    TokenMismatch,

    #[snafu(display("request carries no timestamp"))]
    MissingTimestamp,

    #[snafu(display("timestamp {timestamp} is more than {max_skew} away from now"))]
    StaleTimestamp { timestamp: i64, max_skew: Duration },

    #[snafu(display("system clock is before the UNIX epoch"))]
    ReadClock,
}

#[derive(Debug, Snafu)]
pub enum CreateProviderError {
    #[snafu(display("failed to decode the authentication key as hex"))]
    DecodeHexKey { source: hex::FromHexError },

    #[snafu(display("the authentication key is empty"))]
    EmptyKey,

    #[snafu(display("failed to key the HMAC"))]
    InitializeMac { source: hmac::digest::InvalidLength },
}

/// Verifies the token of an authenticated request.
pub trait Provider: Debug + Send + Sync {
    /// Checks the token of `envelope`. The error tells operators why a
    /// request was rejected, callers only ever learn that it was.
    fn verify(&self, envelope: &AuthenticatedRequest) -> Result<(), VerifyError>;

    fn is_valid(&self, envelope: &AuthenticatedRequest) -> bool {
        self.verify(envelope).is_ok()
    }
}

/// HMAC-SHA256 keyed with a shared secret.
///
/// The MAC covers the raw request bytes followed by the timestamp as 8-byte
/// big-endian integer, if the envelope carries one. With `max_skew` set,
/// envelopes without a timestamp or with one too far from the current time
/// are rejected.
#[derive(Clone)]
pub struct Standard {
    mac: HmacSha256,
    max_skew: Option<Duration>,
}

impl Debug for Standard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Standard")
            .field("max_skew", &self.max_skew)
            .finish_non_exhaustive()
    }
}

impl Standard {
    pub fn new(key: &[u8]) -> Result<Self, CreateProviderError> {
        ensure!(!key.is_empty(), EmptyKeySnafu);
        let mac = HmacSha256::new_from_slice(key).context(InitializeMacSnafu)?;

        Ok(Self {
            mac,
            max_skew: None,
        })
    }

    /// Creates a provider from a hex encoded key.
    pub fn from_hex(key: &str) -> Result<Self, CreateProviderError> {
        let key = Zeroizing::new(hex::decode(key.trim()).context(DecodeHexKeySnafu)?);
        Self::new(&key)
    }

    pub fn with_max_skew(mut self, max_skew: impl Into<Option<Duration>>) -> Self {
        self.max_skew = max_skew.into();
        self
    }

    /// Computes the token for `request`, as a client would.
    pub fn token(&self, request: &[u8], timestamp: Option<i64>) -> Vec<u8> {
        self.keyed_mac(request, timestamp)
            .finalize()
            .into_bytes()
            .to_vec()
    }

    /// Wraps `request` into an envelope carrying its token.
    pub fn authenticate(&self, request: Vec<u8>, timestamp: Option<i64>) -> AuthenticatedRequest {
        AuthenticatedRequest {
            timestamp,
            remote_address: None,
            token: self.token(&request, timestamp),
            request,
        }
    }

    fn keyed_mac(&self, request: &[u8], timestamp: Option<i64>) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(request);
        if let Some(timestamp) = timestamp {
            mac.update(&timestamp.to_be_bytes());
        }
        mac
    }

    fn check_timestamp(&self, timestamp: Option<i64>) -> Result<(), VerifyError> {
        let Some(max_skew) = self.max_skew else {
            return Ok(());
        };

        let timestamp = timestamp.context(MissingTimestampSnafu)?;
        let now = unix_timestamp().context(ReadClockSnafu)?;
        ensure!(
            now.abs_diff(timestamp) <= max_skew.as_secs(),
            StaleTimestampSnafu {
                timestamp,
                max_skew
            }
        );

        Ok(())
    }
}

impl Provider for Standard {
    fn verify(&self, envelope: &AuthenticatedRequest) -> Result<(), VerifyError> {
        self.check_timestamp(envelope.timestamp)?;

        self.keyed_mac(&envelope.request, envelope.timestamp)
            .verify_slice(&envelope.token)
            .ok()
            .context(TokenMismatchSnafu)
    }
}

/// The current time in seconds since the UNIX epoch.
pub fn unix_timestamp() -> Option<i64> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(elapsed.as_secs()).ok()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    fn provider() -> Standard {
        Standard::from_hex(KEY).unwrap()
    }

    #[test]
    fn accept_correct_token() {
        let envelope = provider().authenticate(br#"{"label":"primary"}"#.to_vec(), None);

        assert_eq!(provider().verify(&envelope), Ok(()));
        assert!(provider().is_valid(&envelope));
    }

    #[test]
    fn token_is_hmac_sha256() {
        // HMAC-SHA256 with the key "key" over the classic fox sentence.
        let provider = Standard::new(b"key").unwrap();
        let token = provider.token(b"The quick brown fox jumps over the lazy dog", None);

        assert_eq!(
            hex::encode(token),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn reject_token_for_other_key() {
        let other = Standard::from_hex("fedcba9876543210").unwrap();
        let envelope = other.authenticate(b"request".to_vec(), None);

        assert_eq!(provider().verify(&envelope), Err(VerifyError::TokenMismatch));
    }

    #[test]
    fn reject_modified_request() {
        let mut envelope = provider().authenticate(b"request".to_vec(), None);
        envelope.request = b"Request".to_vec();

        assert_eq!(provider().verify(&envelope), Err(VerifyError::TokenMismatch));
    }

    #[test]
    fn timestamp_salts_token() {
        let provider = provider();

        assert_ne!(
            provider.token(b"request", Some(1)),
            provider.token(b"request", Some(2))
        );
        assert_ne!(provider.token(b"request", None), provider.token(b"request", Some(0)));

        let mut envelope = provider.authenticate(b"request".to_vec(), Some(1));
        envelope.timestamp = Some(2);
        assert_eq!(provider.verify(&envelope), Err(VerifyError::TokenMismatch));
    }

    #[test]
    fn max_skew_requires_timestamp() {
        let provider = provider().with_max_skew(Duration::from_minutes_unchecked(5));
        let envelope = provider.authenticate(b"request".to_vec(), None);

        assert_eq!(provider.verify(&envelope), Err(VerifyError::MissingTimestamp));
    }

    #[rstest]
    #[case::now(0, true)]
    #[case::slightly_behind(-60, true)]
    #[case::slightly_ahead(60, true)]
    #[case::replayed(-3600, false)]
    #[case::from_the_future(3600, false)]
    fn max_skew_bounds_timestamp(#[case] offset: i64, #[case] accepted: bool) {
        let provider = provider().with_max_skew(Duration::from_minutes_unchecked(5));
        let timestamp = unix_timestamp().unwrap() + offset;
        let envelope = provider.authenticate(b"request".to_vec(), Some(timestamp));

        assert_eq!(provider.is_valid(&envelope), accepted);
    }

    #[rstest]
    #[case::empty("")]
    #[case::not_hex("not a hex key")]
    #[case::odd_length("abc")]
    fn reject_invalid_keys(#[case] key: &str) {
        assert!(Standard::from_hex(key).is_err());
    }

    #[test]
    fn debug_hides_key() {
        let output = format!("{:?}", provider());

        assert!(!output.contains("0123"));
        assert!(output.starts_with("Standard"));
    }
}
