use ct_codecs::{Base64UrlSafeNoPadding, Decoder, Encoder};
use serde::Serialize;

use crate::common::*;
use crate::error::*;
use crate::jws_header::*;

pub const MAX_HEADER_LENGTH: usize = 8192;

/// A compact JWS split into its three decoded segments
#[derive(Debug, Clone)]
pub struct CompactToken {
    encoded: String,
    signing_input_len: usize,
    header: Vec<u8>,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

impl CompactToken {
    /// Split `token` on `.` and base64url-decode every segment.
    ///
    /// No cryptographic work happens here.
    pub fn parse(token: &str) -> Result<Self, Error> {
        Self::parse_with_options(token, &VerificationOptions::default())
    }

    pub(crate) fn parse_with_options(
        token: &str,
        options: &VerificationOptions,
    ) -> Result<Self, Error> {
        if let Some(max_token_length) = options.max_token_length {
            ensure!(token.len() <= max_token_length, JWSError::TokenTooLong);
        }
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(JWSError::MalformedToken)?;
        let payload_b64 = parts.next().ok_or(JWSError::MalformedToken)?;
        let signature_b64 = parts.next().ok_or(JWSError::MalformedToken)?;
        ensure!(parts.next().is_none(), JWSError::MalformedToken);
        ensure!(
            !header_b64.is_empty() && !payload_b64.is_empty() && !signature_b64.is_empty(),
            JWSError::MalformedToken
        );
        ensure!(
            header_b64.len() <= options.max_header_length.unwrap_or(MAX_HEADER_LENGTH),
            JWSError::HeaderTooLarge
        );
        Ok(CompactToken {
            encoded: token.to_string(),
            signing_input_len: header_b64.len() + 1 + payload_b64.len(),
            header: decode_segment(header_b64)?,
            payload: decode_segment(payload_b64)?,
            signature: decode_segment(signature_b64)?,
        })
    }

    /// The token as it was received
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// Decoded header bytes (JSON)
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Decoded payload bytes (JSON)
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decoded signature bytes
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// `base64url(header) || '.' || base64url(payload)`, sliced from the
    /// original string so the exact received encoding is authenticated.
    pub fn signing_input(&self) -> &[u8] {
        self.encoded[..self.signing_input_len].as_bytes()
    }
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, Error> {
    let decoded = Base64UrlSafeNoPadding::decode_to_vec(segment, None)
        .map_err(|_| JWSError::DecodeError)?;
    ensure!(!decoded.is_empty(), JWSError::DecodeError);
    Ok(decoded)
}

/// Utilities to build and inspect compact tokens
pub struct Token;

/// Token information useful before signature verification
#[derive(Debug, Clone, Default)]
pub struct TokenMetadata {
    pub(crate) jws_header: JWSHeader,
}

impl TokenMetadata {
    /// The algorithm for this token ("alg")
    /// This information should not be trusted: it is unprotected and can be
    /// freely modified by a third party.
    pub fn algorithm(&self) -> &str {
        self.jws_header.algorithm()
    }

    /// The key identifier for this token ("kid")
    pub fn key_id(&self) -> Option<&str> {
        self.jws_header.key_id()
    }

    /// The signature type for this token ("typ")
    pub fn signature_type(&self) -> Option<&str> {
        self.jws_header.signature_type()
    }

    /// Number of certificates carried in "x5c"
    /// The chain is only meaningful once it has been verified against a
    /// pinned root.
    pub fn chain_len(&self) -> usize {
        self.jws_header.chain_len()
    }
}

impl Token {
    pub(crate) fn build<Claims, SignatureFn>(
        jws_header: &JWSHeader,
        claims: &Claims,
        signature_fn: SignatureFn,
    ) -> Result<String, Error>
    where
        Claims: Serialize,
        SignatureFn: FnOnce(&str) -> Result<Vec<u8>, Error>,
    {
        let jws_header_json = serde_json::to_string(jws_header)?;
        let claims_json = serde_json::to_string(claims)?;
        let authenticated = format!(
            "{}.{}",
            Base64UrlSafeNoPadding::encode_to_string(jws_header_json)?,
            Base64UrlSafeNoPadding::encode_to_string(claims_json)?
        );
        let signature = signature_fn(&authenticated)?;
        let mut token = authenticated;
        token.push('.');
        token.push_str(&Base64UrlSafeNoPadding::encode_to_string(signature)?);
        Ok(token)
    }

    /// Decode token information that can be useful prior to signature
    /// verification
    pub fn decode_metadata(token: &str) -> Result<TokenMetadata, Error> {
        let compact = CompactToken::parse(token)?;
        let jws_header = JWSHeader::from_slice(compact.header())?;
        Ok(TokenMetadata { jws_header })
    }
}

#[test]
fn splits_three_segments() {
    let token = "eyJhbGciOiJFUzI1NiJ9.eyJhIjoxfQ.AQID";
    let compact = CompactToken::parse(token).unwrap();
    assert_eq!(compact.header(), br#"{"alg":"ES256"}"#);
    assert_eq!(compact.payload(), br#"{"a":1}"#);
    assert_eq!(compact.signature(), &[1, 2, 3]);
    assert_eq!(compact.signing_input(), b"eyJhbGciOiJFUzI1NiJ9.eyJhIjoxfQ");
    assert_eq!(compact.as_str(), token);
}

#[test]
fn rejects_wrong_segment_count() {
    for token in [
        "",
        "badtoken",
        "eyJhbGciOiJFUzI1NiJ9.eyJhIjoxfQ",
        "eyJhbGciOiJFUzI1NiJ9.eyJhIjoxfQ.AQID.AQID",
        "eyJhbGciOiJFUzI1NiJ9..AQID",
    ] {
        let err = CompactToken::parse(token).unwrap_err();
        assert!(
            matches!(JWSError::kind_of(&err), Some(JWSError::MalformedToken)),
            "{:?}",
            token
        );
    }
}

#[test]
fn rejects_invalid_base64() {
    for token in [
        "eyJhbGciOiJFUzI1NiJ9.eyJhIjoxfQ.!!!",
        "e.eyJhIjoxfQ.AQID",
    ] {
        let err = CompactToken::parse(token).unwrap_err();
        assert!(
            matches!(JWSError::kind_of(&err), Some(JWSError::DecodeError)),
            "{:?}",
            token
        );
    }
}

#[test]
fn enforces_length_limits() {
    let options = VerificationOptions {
        max_token_length: Some(10),
        ..Default::default()
    };
    let err = CompactToken::parse_with_options("eyJhbGciOiJFUzI1NiJ9.eyJhIjoxfQ.AQID", &options)
        .unwrap_err();
    assert!(matches!(
        JWSError::kind_of(&err),
        Some(JWSError::TokenTooLong)
    ));

    let options = VerificationOptions {
        max_header_length: Some(4),
        ..Default::default()
    };
    let err = CompactToken::parse_with_options("eyJhbGciOiJFUzI1NiJ9.eyJhIjoxfQ.AQID", &options)
        .unwrap_err();
    assert!(matches!(
        JWSError::kind_of(&err),
        Some(JWSError::HeaderTooLarge)
    ));
}

#[test]
fn decode_metadata_reads_header() {
    let metadata = Token::decode_metadata("eyJhbGciOiJFUzI1NiIsImtpZCI6IjJYOVI0SFhGMzQifQ.eyJhIjoxfQ.AQID")
        .unwrap();
    assert_eq!(metadata.algorithm(), "ES256");
    assert_eq!(metadata.key_id(), Some("2X9R4HXF34"));
    assert_eq!(metadata.chain_len(), 0);
}
