//! Throw-away certificate hierarchies shaped like Apple's:
//! P-384 root and intermediate, P-256 signing leaf.

use std::str::FromStr;
use std::time::Duration;

use coarsetime::Clock;

use ct_codecs::{Base64, Encoder};
use der::asn1::{BitString, ObjectIdentifier, OctetString, UtcTime};
use der::oid::AssociatedOid;
use der::{Decode, Encode};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::pkcs8::EncodePublicKey;
use serde::Serialize;
use x509_cert::certificate::{TbsCertificateInner, Version};
use x509_cert::ext::pkix::BasicConstraints;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};
use x509_cert::Certificate;

use crate::chain::PinnedRoot;
use crate::es256::{ES256KeyPair, ES256};
use crate::jws_header::JWSHeader;

const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const ECDSA_WITH_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");

pub(crate) enum TestKey {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
}

impl TestKey {
    pub(crate) fn generate_p256() -> Self {
        TestKey::P256(p256::ecdsa::SigningKey::random(&mut rand::thread_rng()))
    }

    pub(crate) fn generate_p384() -> Self {
        TestKey::P384(p384::ecdsa::SigningKey::random(&mut rand::thread_rng()))
    }

    fn spki(&self) -> SubjectPublicKeyInfoOwned {
        let document = match self {
            TestKey::P256(sk) => sk.verifying_key().to_public_key_der(),
            TestKey::P384(sk) => sk.verifying_key().to_public_key_der(),
        }
        .unwrap();
        SubjectPublicKeyInfoOwned::from_der(document.as_bytes()).unwrap()
    }

    fn signature_algorithm(&self) -> AlgorithmIdentifierOwned {
        let oid = match self {
            TestKey::P256(_) => ECDSA_WITH_SHA256,
            TestKey::P384(_) => ECDSA_WITH_SHA384,
        };
        AlgorithmIdentifierOwned {
            oid,
            parameters: None,
        }
    }

    /// DER-encoded ECDSA signature over a TBS certificate
    fn sign_tbs(&self, tbs: &[u8]) -> Vec<u8> {
        match self {
            TestKey::P256(sk) => {
                let digest = hmac_sha256::Hash::hash(tbs);
                let signature: p256::ecdsa::Signature = sk.sign_prehash(&digest).unwrap();
                signature.to_der().as_bytes().to_vec()
            }
            TestKey::P384(sk) => {
                let mut digest = hmac_sha512::sha384::Hash::new();
                digest.update(tbs);
                let signature: p384::ecdsa::Signature =
                    sk.sign_prehash(&digest.finalize()).unwrap();
                signature.to_der().as_bytes().to_vec()
            }
        }
    }

    fn es256_key_pair(&self) -> ES256KeyPair {
        match self {
            TestKey::P256(sk) => ES256KeyPair::from_bytes(&sk.to_bytes()).unwrap(),
            TestKey::P384(_) => panic!("ES256 needs a P-256 key"),
        }
    }
}

pub(crate) struct TestCert {
    pub(crate) der: Vec<u8>,
    pub(crate) key: TestKey,
    name: Name,
}

impl TestCert {
    pub(crate) fn now() -> u64 {
        Clock::now_since_epoch().as_secs()
    }

    pub(crate) fn self_signed_ca(subject: &str, key: TestKey) -> TestCert {
        let name = Name::from_str(&format!("CN={}", subject)).unwrap();
        let der = build(&name, &key, &name, &key, true, 1);
        TestCert { der, key, name }
    }

    pub(crate) fn issue(subject: &str, key: TestKey, issuer: &TestCert, ca: bool) -> TestCert {
        let name = Name::from_str(&format!("CN={}", subject)).unwrap();
        let der = build(&name, &key, &issuer.name, &issuer.key, ca, 2);
        TestCert { der, key, name }
    }

    pub(crate) fn to_base64(&self) -> String {
        Base64::encode_to_string(&self.der).unwrap()
    }

    pub(crate) fn to_pem(&self) -> String {
        let body = self.to_base64();
        let lines: Vec<&str> = body
            .as_bytes()
            .chunks(64)
            .map(|chunk| std::str::from_utf8(chunk).unwrap())
            .collect();
        format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
            lines.join("\n")
        )
    }
}

fn build(
    subject: &Name,
    subject_key: &TestKey,
    issuer: &Name,
    issuer_key: &TestKey,
    ca: bool,
    serial: u8,
) -> Vec<u8> {
    let now = TestCert::now();
    let time = |secs: u64| {
        Time::UtcTime(UtcTime::from_unix_duration(Duration::from_secs(secs)).unwrap())
    };
    let constraints = BasicConstraints {
        ca,
        path_len_constraint: None,
    };
    let signature_alg = issuer_key.signature_algorithm();
    let tbs_certificate = TbsCertificateInner {
        version: Version::V3,
        serial_number: SerialNumber::new(&[serial]).unwrap(),
        signature: signature_alg.clone(),
        issuer: issuer.clone(),
        validity: Validity {
            not_before: time(now - 3600),
            not_after: time(now + 365 * 86400),
        },
        subject: subject.clone(),
        subject_public_key_info: subject_key.spki(),
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(vec![Extension {
            extn_id: BasicConstraints::OID,
            critical: true,
            extn_value: OctetString::new(constraints.to_der().unwrap()).unwrap(),
        }]),
    };
    let signature = issuer_key.sign_tbs(&tbs_certificate.to_der().unwrap());
    Certificate {
        tbs_certificate,
        signature_algorithm: signature_alg,
        signature: BitString::from_bytes(&signature).unwrap(),
    }
    .to_der()
    .unwrap()
}

pub(crate) struct TestPki {
    pub(crate) root: TestCert,
    pub(crate) intermediate: TestCert,
    pub(crate) leaf: TestCert,
}

impl TestPki {
    pub(crate) fn generate() -> Self {
        let root = TestCert::self_signed_ca("Test Root CA", TestKey::generate_p384());
        let intermediate =
            TestCert::issue("Test Intermediate CA", TestKey::generate_p384(), &root, true);
        let leaf = TestCert::issue(
            "Test Signing Leaf",
            TestKey::generate_p256(),
            &intermediate,
            false,
        );
        TestPki {
            root,
            intermediate,
            leaf,
        }
    }

    pub(crate) fn pinned_root(&self) -> PinnedRoot {
        PinnedRoot::from_der(&self.root.der).unwrap()
    }

    pub(crate) fn x5c(&self) -> Vec<String> {
        vec![
            self.leaf.to_base64(),
            self.intermediate.to_base64(),
            self.root.to_base64(),
        ]
    }

    pub(crate) fn header(&self) -> JWSHeader {
        JWSHeader::new(ES256).with_certificate_chain(self.x5c())
    }

    /// A token signed by the leaf, carrying the full chain
    pub(crate) fn sign<Claims: Serialize>(&self, claims: &Claims) -> String {
        self.sign_with_header(&self.header(), claims)
    }

    pub(crate) fn sign_with_header<Claims: Serialize>(
        &self,
        header: &JWSHeader,
        claims: &Claims,
    ) -> String {
        self.leaf
            .key
            .es256_key_pair()
            .sign_with_header(header, claims)
            .unwrap()
    }
}
