use serde::de::DeserializeOwned;

use crate::chain::{PinnedRoot, TrustVerifier};
use crate::claims::{MapClaims, VerifiedClaims};
use crate::common::VerificationOptions;
use crate::error::*;
use crate::es256::SignatureVerifier;
use crate::jws_header::JWSHeader;
use crate::token::CompactToken;

/// Verifies Apple-signed compact JWS payloads.
///
/// Every call runs the whole pipeline: token split, chain validation
/// against the pinned root, signature check with the leaf key, then claims
/// validation. Nothing is cached between calls. A verifier only holds
/// read-only state and can be shared between threads.
#[derive(Debug, Clone)]
pub struct SignedPayloadVerifier {
    trust: TrustVerifier,
    options: VerificationOptions,
}

impl SignedPayloadVerifier {
    pub fn new(root: PinnedRoot) -> Self {
        SignedPayloadVerifier {
            trust: TrustVerifier::new(root),
            options: VerificationOptions::default(),
        }
    }

    /// A verifier trusting the embedded Apple Root CA - G3
    pub fn apple() -> Result<Self, Error> {
        Ok(Self::new(PinnedRoot::apple()?))
    }

    pub fn with_options(mut self, options: VerificationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &VerificationOptions {
        &self.options
    }

    pub fn root(&self) -> &PinnedRoot {
        self.trust.root()
    }

    /// Verify `token` and map its payload onto `CustomClaims`.
    pub fn verify<CustomClaims: DeserializeOwned>(
        &self,
        token: &str,
    ) -> Result<VerifiedClaims<CustomClaims>, Error> {
        self.run(token).map_err(|err| {
            match JWSError::kind_of(&err) {
                Some(kind) if kind.is_untrusted() => {
                    log::warn!("rejected signed payload: {}", kind)
                }
                Some(kind) => log::debug!("invalid signed payload: {}", kind),
                None => log::debug!("invalid signed payload"),
            }
            err
        })
    }

    /// Verify `token` and return its payload as a generic map.
    pub fn verify_claims(&self, token: &str) -> Result<MapClaims, Error> {
        Ok(self.verify::<MapClaims>(token)?.map)
    }

    fn run<CustomClaims: DeserializeOwned>(
        &self,
        token: &str,
    ) -> Result<VerifiedClaims<CustomClaims>, Error> {
        ensure!(!token.is_empty(), JWSError::EmptySignedPayload);
        let compact = CompactToken::parse_with_options(token, &self.options)?;
        let header = JWSHeader::from_slice(compact.header())?;
        let chain = self.trust.verify_header(&header, &self.options)?;
        log::debug!("certificate chain trusted");
        SignatureVerifier::verify(&chain, &header, &compact)?;
        log::debug!("signature verified");
        VerifiedClaims::materialize(compact.payload(), &self.options)
    }
}
