use ct_codecs::{Base64, Decoder};
use serde::{Deserialize, Serialize};

use crate::error::*;

/// Position of the signing certificate in `x5c`
pub const LEAF_INDEX: usize = 0;
/// Position of the intermediate authority in `x5c`
pub const INTERMEDIATE_INDEX: usize = 1;
/// Position of the root certificate in `x5c`
pub const ROOT_INDEX: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JWSHeader {
    #[serde(rename = "alg", default)]
    pub(crate) algorithm: String,

    #[serde(rename = "kid", default, skip_serializing_if = "Option::is_none")]
    pub(crate) key_id: Option<String>,

    #[serde(rename = "typ", default, skip_serializing_if = "Option::is_none")]
    pub(crate) signature_type: Option<String>,

    /// Standard (not URL-safe) base64 DER blobs, leaf first
    #[serde(rename = "x5c", default, skip_serializing_if = "Option::is_none")]
    pub(crate) certificate_chain: Option<Vec<String>>,
}

impl Default for JWSHeader {
    fn default() -> Self {
        JWSHeader {
            algorithm: "Not set".to_string(),
            key_id: None,
            signature_type: None,
            certificate_chain: None,
        }
    }
}

impl JWSHeader {
    pub(crate) fn new(algorithm: impl ToString) -> Self {
        JWSHeader {
            algorithm: algorithm.to_string(),
            ..Default::default()
        }
    }

    /// Parse a decoded (JSON) header.
    pub fn from_slice(raw: &[u8]) -> Result<Self, Error> {
        let header: JWSHeader =
            serde_json::from_slice(raw).map_err(|_| JWSError::MalformedToken)?;
        Ok(header)
    }

    /// The algorithm declared by the header ("alg")
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The key identifier ("kid")
    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    /// The token type ("typ")
    pub fn signature_type(&self) -> Option<&str> {
        self.signature_type.as_deref()
    }

    /// Number of certificates in the chain, 0 if the header has none
    pub fn chain_len(&self) -> usize {
        self.certificate_chain.as_ref().map_or(0, Vec::len)
    }

    /// Raw DER bytes of the certificate at `index`.
    ///
    /// The bytes are not parsed here.
    pub fn certificate_at(&self, index: usize) -> Result<Vec<u8>, Error> {
        let chain = self
            .certificate_chain
            .as_ref()
            .ok_or(JWSError::MissingCertificateChain)?;
        let encoded = chain.get(index).ok_or(JWSError::IndexOutOfRange {
            index,
            len: chain.len(),
        })?;
        let der = Base64::decode_to_vec(encoded, None).map_err(|_| JWSError::DecodeError)?;
        ensure!(!der.is_empty(), JWSError::DecodeError);
        Ok(der)
    }

    pub fn leaf_certificate(&self) -> Result<Vec<u8>, Error> {
        self.certificate_at(LEAF_INDEX)
    }

    pub fn intermediate_certificate(&self) -> Result<Vec<u8>, Error> {
        self.certificate_at(INTERMEDIATE_INDEX)
    }

    pub fn root_certificate(&self) -> Result<Vec<u8>, Error> {
        self.certificate_at(ROOT_INDEX)
    }

    pub(crate) fn with_certificate_chain(mut self, chain: Vec<String>) -> Self {
        self.certificate_chain = Some(chain);
        self
    }

    pub(crate) fn with_key_id(mut self, key_id: Option<String>) -> Self {
        self.key_id = key_id;
        self
    }

    pub(crate) fn with_signature_type(mut self, signature_type: Option<String>) -> Self {
        self.signature_type = signature_type;
        self
    }
}

#[test]
fn certificate_at_decodes_standard_base64() {
    let header = JWSHeader::from_slice(br#"{"alg":"ES256","x5c":["AQID","BAU=","Bg=="]}"#).unwrap();
    assert_eq!(header.algorithm(), "ES256");
    assert_eq!(header.chain_len(), 3);
    assert_eq!(header.leaf_certificate().unwrap(), vec![1, 2, 3]);
    assert_eq!(header.intermediate_certificate().unwrap(), vec![4, 5]);
    assert_eq!(header.root_certificate().unwrap(), vec![6]);
}

#[test]
fn short_chain_is_out_of_range() {
    let header = JWSHeader::from_slice(br#"{"alg":"ES256","x5c":["AQID","BAU="]}"#).unwrap();
    let err = header.root_certificate().unwrap_err();
    match JWSError::kind_of(&err) {
        Some(JWSError::IndexOutOfRange { index: 2, len: 2 }) => {}
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn missing_chain_and_bad_base64() {
    let header = JWSHeader::from_slice(br#"{"alg":"ES256"}"#).unwrap();
    assert!(matches!(
        JWSError::kind_of(&header.leaf_certificate().unwrap_err()),
        Some(JWSError::MissingCertificateChain)
    ));

    let header = JWSHeader::from_slice(br#"{"alg":"ES256","x5c":["*not base64*"]}"#).unwrap();
    assert!(matches!(
        JWSError::kind_of(&header.leaf_certificate().unwrap_err()),
        Some(JWSError::DecodeError)
    ));
}

#[test]
fn header_must_be_json_object() {
    let err = JWSHeader::from_slice(b"not json").unwrap_err();
    assert!(matches!(
        JWSError::kind_of(&err),
        Some(JWSError::MalformedToken)
    ));

    let header = JWSHeader::from_slice(br#"{"x5c":[]}"#).unwrap();
    assert_eq!(header.algorithm(), "");
    assert_eq!(header.chain_len(), 0);
}
