use coarsetime::{Clock, Duration, UnixTimeStamp};

/// Additional features to enable during verification
#[derive(Clone, Debug, Default)]
pub struct VerificationOptions {
    /// Use this time instead of the system clock, both for certificate
    /// validity windows and for time-based claims
    pub artificial_time: Option<UnixTimeStamp>,

    /// Time tolerance for validating expiration dates and certificate windows
    ///
    /// No tolerance is applied by default.
    pub time_tolerance: Option<Duration>,

    /// Reject tokens without an `exp` claim
    pub require_expiration: bool,

    /// Require a specific issuer to be present
    pub required_issuer: Option<String>,

    /// Require the audience (or one of the audiences) to match
    pub required_audience: Option<String>,

    /// Maximum token length to accept
    pub max_token_length: Option<usize>,

    /// Maximum length of the encoded header
    pub max_header_length: Option<usize>,
}

impl VerificationOptions {
    pub(crate) fn now(&self) -> UnixTimeStamp {
        self.artificial_time.unwrap_or_else(Clock::now_since_epoch)
    }

    pub(crate) fn tolerance(&self) -> Duration {
        self.time_tolerance.unwrap_or_else(|| Duration::from_secs(0))
    }
}

/// Constant-time comparison. Only the length of the inputs leaks.
#[inline(never)]
pub(crate) fn timingsafe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0, |c, (x, y)| c | (x ^ y)) == 0
}

#[test]
fn timingsafe_eq_handles_lengths() {
    assert!(timingsafe_eq(b"appstoreconnect-v1", b"appstoreconnect-v1"));
    assert!(!timingsafe_eq(b"appstoreconnect-v1", b"appstoreconnect-v2"));
    assert!(!timingsafe_eq(b"a", b"ab"));
    assert!(timingsafe_eq(b"", b""));
}
