use std::sync::Arc;

use der::asn1::ObjectIdentifier;
use der::oid::AssociatedOid;
use der::{Decode, Encode};
use once_cell::sync::Lazy;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::pkcs8::DecodePublicKey;
use x509_cert::ext::pkix::BasicConstraints;
use x509_cert::Certificate;

use crate::common::VerificationOptions;
use crate::error::*;
use crate::jws_header::JWSHeader;

/// Apple Root CA - G3, <https://www.apple.com/certificateauthority/>
pub const APPLE_ROOT_CA_G3_PEM: &str = include_str!("certs/AppleRootCA-G3.pem");

const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const ECDSA_WITH_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");

static APPLE_ROOT_CA_G3: Lazy<Option<PinnedRoot>> =
    Lazy::new(|| match PinnedRoot::from_pem(APPLE_ROOT_CA_G3_PEM) {
        Ok(root) => Some(root),
        Err(err) => {
            log::error!("embedded Apple root certificate is unusable: {}", err);
            None
        }
    });

/// The single trust anchor certificate chains must lead to
#[derive(Debug, Clone)]
pub struct PinnedRoot {
    inner: Arc<RootInner>,
}

#[derive(Debug)]
struct RootInner {
    der: Vec<u8>,
    certificate: Certificate,
    key: IssuerKey,
}

impl PinnedRoot {
    /// The embedded Apple Root CA - G3.
    ///
    /// Parsed once, on first use; every later call shares the same value.
    pub fn apple() -> Result<PinnedRoot, Error> {
        APPLE_ROOT_CA_G3
            .as_ref()
            .cloned()
            .ok_or_else(|| JWSError::InvalidRootCertificate.into())
    }

    pub fn from_pem(pem: &str) -> Result<PinnedRoot, Error> {
        let (label, der) =
            der::pem::decode_vec(pem.trim().as_bytes()).map_err(|_| JWSError::InvalidRootCertificate)?;
        ensure!(label == "CERTIFICATE", JWSError::InvalidRootCertificate);
        Self::from_der(&der)
    }

    pub fn from_der(der: &[u8]) -> Result<PinnedRoot, Error> {
        let certificate =
            Certificate::from_der(der).map_err(|_| JWSError::InvalidRootCertificate)?;
        let key = IssuerKey::from_certificate(&certificate)
            .map_err(|_| JWSError::InvalidRootCertificate)?;
        Ok(PinnedRoot {
            inner: Arc::new(RootInner {
                der: der.to_vec(),
                certificate,
                key,
            }),
        })
    }

    /// DER encoding of the root, as it was loaded
    pub fn to_der(&self) -> &[u8] {
        &self.inner.der
    }

    pub fn certificate(&self) -> &Certificate {
        &self.inner.certificate
    }
}

/// Leaf and intermediate certificates proven to chain to a [`PinnedRoot`].
///
/// Only [`TrustVerifier`] can produce this value.
#[derive(Debug, Clone)]
pub struct TrustedChain {
    leaf: Certificate,
    intermediate: Certificate,
}

impl TrustedChain {
    pub fn leaf(&self) -> &Certificate {
        &self.leaf
    }

    pub fn intermediate(&self) -> &Certificate {
        &self.intermediate
    }
}

/// Validates `x5c` chains against a pinned root
#[derive(Debug, Clone)]
pub struct TrustVerifier {
    root: PinnedRoot,
}

impl TrustVerifier {
    pub fn new(root: PinnedRoot) -> Self {
        TrustVerifier { root }
    }

    pub fn root(&self) -> &PinnedRoot {
        &self.root
    }

    /// Validate the chain carried by a token header.
    ///
    /// The header must carry leaf, intermediate and root; the root entry has
    /// to be the pinned root itself.
    pub fn verify_header(
        &self,
        header: &JWSHeader,
        options: &VerificationOptions,
    ) -> Result<TrustedChain, Error> {
        let leaf_der = header.leaf_certificate()?;
        let intermediate_der = header.intermediate_certificate()?;
        let root_der = header.root_certificate()?;
        let chain = self.verify_chain(&leaf_der, &intermediate_der, options)?;
        ensure!(
            root_der == self.root.to_der(),
            JWSError::UntrustedChain("chain root is not the pinned root".to_string())
        );
        Ok(chain)
    }

    /// Validate `leaf -> intermediate -> pinned root`.
    ///
    /// Revocation is not checked.
    pub fn verify_chain(
        &self,
        leaf_der: &[u8],
        intermediate_der: &[u8],
        options: &VerificationOptions,
    ) -> Result<TrustedChain, Error> {
        let intermediate = parse_certificate(intermediate_der, "intermediate")?;
        let leaf = parse_certificate(leaf_der, "leaf")?;
        let root = self.root.certificate();

        check_validity(root, "root", options)?;
        check_validity(&intermediate, "intermediate", options)?;
        check_validity(&leaf, "leaf", options)?;

        check_issued_by(&intermediate, root, &self.root.inner.key, "intermediate")?;
        let intermediate_key = IssuerKey::from_certificate(&intermediate).map_err(|_| {
            JWSError::UntrustedChain("unsupported intermediate key".to_string())
        })?;
        check_issued_by(&leaf, &intermediate, &intermediate_key, "leaf")?;

        Ok(TrustedChain { leaf, intermediate })
    }
}

fn parse_certificate(der: &[u8], position: &str) -> Result<Certificate, Error> {
    Certificate::from_der(der)
        .map_err(|e| JWSError::CertParseError(format!("{}: {}", position, e)).into())
}

fn untrusted(position: &str, reason: &str) -> Error {
    JWSError::UntrustedChain(format!("{}: {}", position, reason)).into()
}

fn check_validity(
    certificate: &Certificate,
    position: &str,
    options: &VerificationOptions,
) -> Result<(), Error> {
    let now = options.now().as_secs();
    let tolerance = options.tolerance().as_secs();
    let validity = &certificate.tbs_certificate.validity;
    let not_before = validity.not_before.to_unix_duration().as_secs();
    let not_after = validity.not_after.to_unix_duration().as_secs();
    if now.saturating_add(tolerance) < not_before {
        return Err(untrusted(position, "certificate not valid yet"));
    }
    if now.saturating_sub(tolerance) > not_after {
        return Err(untrusted(position, "certificate has expired"));
    }
    Ok(())
}

fn check_issued_by(
    certificate: &Certificate,
    issuer: &Certificate,
    issuer_key: &IssuerKey,
    position: &str,
) -> Result<(), Error> {
    if certificate.tbs_certificate.issuer != issuer.tbs_certificate.subject {
        return Err(untrusted(position, "issuer name mismatch"));
    }
    if !is_certificate_authority(issuer) {
        return Err(untrusted(position, "issuer is not a certificate authority"));
    }
    issuer_key.verify_certificate(certificate, position)
}

fn is_certificate_authority(certificate: &Certificate) -> bool {
    certificate
        .tbs_certificate
        .extensions
        .iter()
        .flatten()
        .filter(|ext| ext.extn_id == BasicConstraints::OID)
        .filter_map(|ext| BasicConstraints::from_der(ext.extn_value.as_bytes()).ok())
        .any(|constraints| constraints.ca)
}

/// Public key of a certificate authority
#[derive(Debug, Clone)]
enum IssuerKey {
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
}

impl IssuerKey {
    fn from_certificate(certificate: &Certificate) -> Result<Self, Error> {
        let spki = certificate
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|_| JWSError::UnsupportedKeyType)?;
        if let Ok(pk) = p256::ecdsa::VerifyingKey::from_public_key_der(&spki) {
            return Ok(IssuerKey::P256(pk));
        }
        if let Ok(pk) = p384::ecdsa::VerifyingKey::from_public_key_der(&spki) {
            return Ok(IssuerKey::P384(pk));
        }
        bail!(JWSError::UnsupportedKeyType)
    }

    fn verify_certificate(&self, certificate: &Certificate, position: &str) -> Result<(), Error> {
        let tbs = certificate
            .tbs_certificate
            .to_der()
            .map_err(|e| JWSError::CertParseError(format!("{}: {}", position, e)))?;
        let algorithm = certificate.signature_algorithm.oid;
        let digest = if algorithm == ECDSA_WITH_SHA256 {
            hmac_sha256::Hash::hash(&tbs).to_vec()
        } else if algorithm == ECDSA_WITH_SHA384 {
            let mut digest = hmac_sha512::sha384::Hash::new();
            digest.update(&tbs);
            digest.finalize().to_vec()
        } else {
            return Err(untrusted(position, "unsupported signature algorithm"));
        };
        let signature = certificate
            .signature
            .as_bytes()
            .ok_or_else(|| untrusted(position, "malformed signature"))?;
        let verified = match self {
            IssuerKey::P256(pk) => p256::ecdsa::Signature::from_der(signature)
                .map(|sig| pk.verify_prehash(&digest, &sig).is_ok())
                .unwrap_or(false),
            IssuerKey::P384(pk) => p384::ecdsa::Signature::from_der(signature)
                .map(|sig| pk.verify_prehash(&digest, &sig).is_ok())
                .unwrap_or(false),
        };
        if !verified {
            return Err(untrusted(position, "certificate signature mismatch"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use coarsetime::UnixTimeStamp;

    use super::*;
    use crate::test_pki::*;

    fn kind(err: &Error) -> &JWSError {
        JWSError::kind_of(err).expect("crate error")
    }

    #[test]
    fn embedded_apple_root_parses() {
        let root = PinnedRoot::apple().unwrap();
        let subject = root.certificate().tbs_certificate.subject.to_string();
        assert!(subject.contains("Apple Root CA - G3"), "{}", subject);
        let again = PinnedRoot::apple().unwrap();
        assert!(Arc::ptr_eq(&root.inner, &again.inner));
    }

    #[test]
    fn garbage_root_is_rejected() {
        let err = PinnedRoot::from_pem("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----")
            .unwrap_err();
        assert!(matches!(kind(&err), JWSError::InvalidRootCertificate));
        assert!(kind(&err).is_untrusted());
        let err = PinnedRoot::from_der(b"not a certificate").unwrap_err();
        assert!(matches!(kind(&err), JWSError::InvalidRootCertificate));
    }

    #[test]
    fn valid_chain_is_trusted() {
        let pki = TestPki::generate();
        let verifier = TrustVerifier::new(pki.pinned_root());
        let chain = verifier
            .verify_chain(&pki.leaf.der, &pki.intermediate.der, &Default::default())
            .unwrap();
        assert_eq!(
            chain.leaf().tbs_certificate.subject.to_string(),
            "CN=Test Signing Leaf"
        );
        verifier
            .verify_header(&pki.header(), &Default::default())
            .unwrap();
    }

    #[test]
    fn root_from_pem_matches_der() {
        let pki = TestPki::generate();
        let root = PinnedRoot::from_pem(&pki.root.to_pem()).unwrap();
        assert_eq!(root.to_der(), pki.root.der.as_slice());
    }

    #[test]
    fn foreign_root_is_untrusted() {
        let pki = TestPki::generate();
        let other = TestPki::generate();
        let verifier = TrustVerifier::new(other.pinned_root());
        let err = verifier
            .verify_chain(&pki.leaf.der, &pki.intermediate.der, &Default::default())
            .unwrap_err();
        assert!(matches!(kind(&err), JWSError::UntrustedChain(_)));

        let err = TrustVerifier::new(PinnedRoot::apple().unwrap())
            .verify_header(&pki.header(), &Default::default())
            .unwrap_err();
        assert!(matches!(kind(&err), JWSError::UntrustedChain(_)));
    }

    #[test]
    fn self_signed_intermediate_is_untrusted() {
        let pki = TestPki::generate();
        let rogue = TestCert::self_signed_ca("Test Intermediate CA", TestKey::generate_p384());
        let leaf = TestCert::issue("Test Signing Leaf", TestKey::generate_p256(), &rogue, false);
        let err = TrustVerifier::new(pki.pinned_root())
            .verify_chain(&leaf.der, &rogue.der, &Default::default())
            .unwrap_err();
        assert!(matches!(kind(&err), JWSError::UntrustedChain(_)));
    }

    #[test]
    fn leaf_cannot_act_as_issuer() {
        let pki = TestPki::generate();
        let leaf = TestCert::issue("Second Leaf", TestKey::generate_p256(), &pki.leaf, false);
        let err = TrustVerifier::new(pki.pinned_root())
            .verify_chain(&leaf.der, &pki.leaf.der, &Default::default())
            .unwrap_err();
        assert!(matches!(kind(&err), JWSError::UntrustedChain(_)));
    }

    #[test]
    fn intermediate_must_be_certificate_authority() {
        let pki = TestPki::generate();
        let intermediate = TestCert::issue(
            "Test Intermediate CA",
            TestKey::generate_p384(),
            &pki.root,
            false,
        );
        let leaf = TestCert::issue(
            "Test Signing Leaf",
            TestKey::generate_p256(),
            &intermediate,
            false,
        );
        let verifier = TrustVerifier::new(pki.pinned_root());
        let err = verifier
            .verify_chain(&leaf.der, &intermediate.der, &Default::default())
            .unwrap_err();
        match kind(&err) {
            JWSError::UntrustedChain(reason) => {
                assert!(reason.contains("not a certificate authority"), "{}", reason)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn root_entry_must_be_pinned_root() {
        let pki = TestPki::generate();
        let other = TestPki::generate();
        let header = JWSHeader::new("ES256").with_certificate_chain(vec![
            pki.leaf.to_base64(),
            pki.intermediate.to_base64(),
            other.root.to_base64(),
        ]);
        let err = TrustVerifier::new(pki.pinned_root())
            .verify_header(&header, &Default::default())
            .unwrap_err();
        assert!(matches!(kind(&err), JWSError::UntrustedChain(_)));
    }

    #[test]
    fn short_chain_is_rejected() {
        let pki = TestPki::generate();
        let header = JWSHeader::new("ES256")
            .with_certificate_chain(vec![pki.leaf.to_base64(), pki.intermediate.to_base64()]);
        let err = TrustVerifier::new(pki.pinned_root())
            .verify_header(&header, &Default::default())
            .unwrap_err();
        assert!(matches!(
            kind(&err),
            JWSError::IndexOutOfRange { index: 2, len: 2 }
        ));
    }

    #[test]
    fn malformed_certificates() {
        let pki = TestPki::generate();
        let verifier = TrustVerifier::new(pki.pinned_root());
        let err = verifier
            .verify_chain(&pki.leaf.der, b"\x30\x03\x02\x01\x01", &Default::default())
            .unwrap_err();
        assert!(matches!(kind(&err), JWSError::CertParseError(_)));
        let err = verifier
            .verify_chain(&pki.leaf.der[..20], &pki.intermediate.der, &Default::default())
            .unwrap_err();
        assert!(matches!(kind(&err), JWSError::CertParseError(_)));
    }

    #[test]
    fn validity_window_is_enforced() {
        let pki = TestPki::generate();
        let verifier = TrustVerifier::new(pki.pinned_root());
        let far_future = VerificationOptions {
            artificial_time: Some(UnixTimeStamp::from_secs(TestCert::now() + 10 * 365 * 86400)),
            ..Default::default()
        };
        let err = verifier
            .verify_chain(&pki.leaf.der, &pki.intermediate.der, &far_future)
            .unwrap_err();
        assert!(matches!(kind(&err), JWSError::UntrustedChain(_)));

        let past = VerificationOptions {
            artificial_time: Some(UnixTimeStamp::from_secs(TestCert::now() - 7 * 86400)),
            ..Default::default()
        };
        let err = verifier
            .verify_chain(&pki.leaf.der, &pki.intermediate.der, &past)
            .unwrap_err();
        assert!(matches!(kind(&err), JWSError::UntrustedChain(_)));
    }

    #[test]
    fn tampered_intermediate_signature() {
        let pki = TestPki::generate();
        let mut intermediate = pki.intermediate.der.clone();
        let last = intermediate.len() - 1;
        intermediate[last] ^= 0x01;
        let err = TrustVerifier::new(pki.pinned_root())
            .verify_chain(&pki.leaf.der, &intermediate, &Default::default())
            .unwrap_err();
        assert!(matches!(
            kind(&err),
            JWSError::UntrustedChain(_) | JWSError::CertParseError(_)
        ));
    }
}
