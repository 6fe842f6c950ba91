use std::fmt;

use coarsetime::UnixTimeStamp;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::common::{timingsafe_eq, VerificationOptions};
use crate::error::*;
use crate::serde_additions;

/// A claim check that did not pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimFailure {
    /// `exp` is in the past
    Expired,
    /// `exp` is absent but was required
    MissingExpiration,
    /// `iat` is in the future
    IssuedInFuture,
    /// `nbf` is in the future
    NotYetValid,
    /// `iss` does not match the required issuer
    IssuerMismatch,
    /// No `aud` entry matches the required audience
    AudienceMismatch,
}

impl fmt::Display for ClaimFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClaimFailure::Expired => "token has expired",
            ClaimFailure::MissingExpiration => "token has no expiration",
            ClaimFailure::IssuedInFuture => "token used before issued",
            ClaimFailure::NotYetValid => "token is not valid yet",
            ClaimFailure::IssuerMismatch => "issuer mismatch",
            ClaimFailure::AudienceMismatch => "audience mismatch",
        })
    }
}

/// Every claim check that failed during validation, in evaluation order
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("Claims validation failed: {}", describe(.failures))]
pub struct ClaimsValidationError {
    failures: Vec<ClaimFailure>,
}

fn describe(failures: &[ClaimFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ClaimsValidationError {
    pub fn failures(&self) -> &[ClaimFailure] {
        &self.failures
    }

    pub fn contains(&self, failure: ClaimFailure) -> bool {
        self.failures.contains(&failure)
    }

    fn record(&mut self, ok: bool, failure: ClaimFailure) {
        if !ok && !self.contains(failure) {
            self.failures.push(failure);
        }
    }

    fn into_result(self) -> Result<(), ClaimsValidationError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

/// Generic string-keyed view of a JSON payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapClaims(pub Map<String, Value>);

impl MapClaims {
    /// Parse a payload that must be a JSON object.
    pub fn from_slice(payload: &[u8]) -> Result<Self, Error> {
        match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) => Ok(MapClaims(map)),
            Ok(_) => bail!(JWSError::InvalidPayload("not a JSON object".to_string())),
            Err(e) => bail!(JWSError::InvalidPayload(e.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String claim, `None` if absent or not a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Deserialize the claims into a structured type.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let value = Value::Object(self.0.clone());
        serde_json::from_value(value).map_err(|e| JWSError::InvalidPayload(e.to_string()).into())
    }

    /// The registered claims, typed. A registered claim of the wrong type
    /// is an `InvalidPayload` error.
    pub fn standard_claims(&self) -> Result<StandardClaims, Error> {
        self.to_typed()
    }

    /// `exp` check: valid if `now <= exp`, or if unset and not `required`.
    pub fn verify_expires_at(&self, now: UnixTimeStamp, required: bool) -> bool {
        self.verify_expires_at_secs(secs(now), required)
    }

    /// `iat` check: valid if `now >= iat`, or if unset and not `required`.
    pub fn verify_issued_at(&self, now: UnixTimeStamp, required: bool) -> bool {
        self.verify_issued_at_secs(secs(now), required)
    }

    /// `nbf` check: valid if `now >= nbf`, or if unset and not `required`.
    pub fn verify_not_before(&self, now: UnixTimeStamp, required: bool) -> bool {
        self.verify_not_before_secs(secs(now), required)
    }

    /// `iss` check, constant time.
    pub fn verify_issuer(&self, cmp: &str, required: bool) -> bool {
        match self.0.get("iss") {
            None | Some(Value::Null) => !required,
            Some(Value::String(iss)) if iss.is_empty() => !required,
            Some(Value::String(iss)) => timingsafe_eq(iss.as_bytes(), cmp.as_bytes()),
            Some(_) => false,
        }
    }

    /// `aud` check, constant time. `aud` may be a string or a list; any
    /// matching entry is enough.
    pub fn verify_audience(&self, cmp: &str, required: bool) -> bool {
        let audiences: Vec<&str> = match self.0.get("aud") {
            None | Some(Value::Null) => vec![],
            Some(Value::String(aud)) => vec![aud.as_str()],
            Some(Value::Array(entries)) => {
                let mut audiences = Vec::with_capacity(entries.len());
                for entry in entries {
                    match entry.as_str() {
                        Some(aud) => audiences.push(aud),
                        None => return false,
                    }
                }
                audiences
            }
            Some(_) => return false,
        };
        // every entry is compared, so timing does not depend on the match position
        let mut matched = false;
        let mut total_len = 0;
        for aud in &audiences {
            matched |= timingsafe_eq(aud.as_bytes(), cmp.as_bytes());
            total_len += aud.len();
        }
        if total_len == 0 {
            return !required;
        }
        matched
    }

    /// Run every configured check and report all failures together.
    pub fn validate(&self, options: &VerificationOptions) -> Result<(), ClaimsValidationError> {
        let now = secs(options.now());
        let tolerance = options.tolerance().as_secs() as i64;
        let mut errors = ClaimsValidationError::default();

        if options.require_expiration && self.time_claim("exp").is_none() {
            errors.record(false, ClaimFailure::MissingExpiration);
        } else {
            errors.record(
                self.verify_expires_at_secs(now - tolerance, false),
                ClaimFailure::Expired,
            );
        }
        errors.record(
            self.verify_issued_at_secs(now + tolerance, false),
            ClaimFailure::IssuedInFuture,
        );
        errors.record(
            self.verify_not_before_secs(now + tolerance, false),
            ClaimFailure::NotYetValid,
        );
        if let Some(required_issuer) = &options.required_issuer {
            errors.record(
                self.verify_issuer(required_issuer, true),
                ClaimFailure::IssuerMismatch,
            );
        }
        if let Some(required_audience) = &options.required_audience {
            errors.record(
                self.verify_audience(required_audience, true),
                ClaimFailure::AudienceMismatch,
            );
        }
        errors.into_result()
    }

    fn verify_expires_at_secs(&self, now: i64, required: bool) -> bool {
        self.verify_time_claim("exp", required, |exp| now <= exp)
    }

    fn verify_issued_at_secs(&self, now: i64, required: bool) -> bool {
        self.verify_time_claim("iat", required, |iat| now >= iat)
    }

    fn verify_not_before_secs(&self, now: i64, required: bool) -> bool {
        self.verify_time_claim("nbf", required, |nbf| now >= nbf)
    }

    /// A zero timestamp counts as unset. Non-numeric values always fail.
    fn verify_time_claim(&self, name: &str, required: bool, check: impl Fn(i64) -> bool) -> bool {
        match self.0.get(name) {
            None | Some(Value::Null) => !required,
            Some(value) => match value_as_secs(value) {
                Some(0) => !required,
                Some(secs) => check(secs),
                None => false,
            },
        }
    }

    fn time_claim(&self, name: &str) -> Option<i64> {
        self.0
            .get(name)
            .and_then(value_as_secs)
            .filter(|&secs| secs != 0)
    }
}

fn value_as_secs(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_u64().map(|x| x.min(i64::MAX as u64) as i64))
        .or_else(|| value.as_f64().map(|x| x as i64))
}

fn secs(ts: UnixTimeStamp) -> i64 {
    ts.as_secs().min(i64::MAX as u64) as i64
}

/// `aud` can be a single string or a set of strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audiences {
    AsString(String),
    AsSet(Vec<String>),
}

impl Audiences {
    /// Constant time; every entry is compared.
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audiences::AsString(aud) => timingsafe_eq(aud.as_bytes(), audience.as_bytes()),
            Audiences::AsSet(auds) => auds.iter().fold(false, |matched, aud| {
                matched | timingsafe_eq(aud.as_bytes(), audience.as_bytes())
            }),
        }
    }
}

/// Registered claims
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardClaims {
    /// Time the claims were created at
    #[serde(
        rename = "iat",
        default,
        skip_serializing_if = "Option::is_none",
        with = "self::serde_additions::unix_timestamp"
    )]
    pub issued_at: Option<UnixTimeStamp>,

    /// Time the claims expire at
    #[serde(
        rename = "exp",
        default,
        skip_serializing_if = "Option::is_none",
        with = "self::serde_additions::unix_timestamp"
    )]
    pub expires_at: Option<UnixTimeStamp>,

    /// Time the claims will be invalid until
    #[serde(
        rename = "nbf",
        default,
        skip_serializing_if = "Option::is_none",
        with = "self::serde_additions::unix_timestamp"
    )]
    pub invalid_before: Option<UnixTimeStamp>,

    #[serde(rename = "iss", default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    #[serde(rename = "sub", default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(rename = "aud", default, skip_serializing_if = "Option::is_none")]
    pub audiences: Option<Audiences>,

    #[serde(rename = "jti", default, skip_serializing_if = "Option::is_none")]
    pub jwt_id: Option<String>,
}

/// Claims of a payload whose signature and chain have been verified
#[derive(Debug, Clone)]
pub struct VerifiedClaims<CustomClaims> {
    /// The payload mapped onto the caller's type
    pub custom: CustomClaims,

    /// The same payload as a generic map
    pub map: MapClaims,
}

impl<CustomClaims: DeserializeOwned> VerifiedClaims<CustomClaims> {
    pub(crate) fn materialize(
        payload: &[u8],
        options: &VerificationOptions,
    ) -> Result<Self, Error> {
        let map = MapClaims::from_slice(payload)?;
        map.validate(options).map_err(JWSError::from)?;
        let custom = map.to_typed()?;
        Ok(VerifiedClaims { custom, map })
    }

    pub fn into_inner(self) -> CustomClaims {
        self.custom
    }
}

#[cfg(test)]
fn claims(json: &str) -> MapClaims {
    MapClaims::from_slice(json.as_bytes()).unwrap()
}

#[test]
fn expires_at() {
    let now = UnixTimeStamp::from_secs(1_700_000_000);
    let expired = claims(r#"{"exp":1699999999}"#);
    assert!(!expired.verify_expires_at(now, false));
    assert!(claims(r#"{"exp":1700000000}"#).verify_expires_at(now, true));

    let unset = claims(r#"{}"#);
    assert!(unset.verify_expires_at(now, false));
    assert!(!unset.verify_expires_at(now, true));

    assert!(claims(r#"{"exp":0}"#).verify_expires_at(now, false));
    assert!(claims(r#"{"exp":1700000000.5}"#).verify_expires_at(now, false));
    assert!(!claims(r#"{"exp":"tomorrow"}"#).verify_expires_at(now, false));
}

#[test]
fn issued_at_and_not_before() {
    let now = UnixTimeStamp::from_secs(1_700_000_000);
    assert!(claims(r#"{"iat":1700000000}"#).verify_issued_at(now, false));
    assert!(!claims(r#"{"iat":1700000001}"#).verify_issued_at(now, false));
    assert!(!claims(r#"{}"#).verify_issued_at(now, true));
    assert!(claims(r#"{"nbf":1699999000}"#).verify_not_before(now, false));
    assert!(!claims(r#"{"nbf":1700000100}"#).verify_not_before(now, false));
}

#[test]
fn audience_single_and_list() {
    let list = claims(r#"{"aud":["a","b"]}"#);
    assert!(list.verify_audience("b", true));
    assert!(!list.verify_audience("c", true));

    let single = claims(r#"{"aud":"appstoreconnect-v1"}"#);
    assert!(single.verify_audience("appstoreconnect-v1", true));
    assert!(!single.verify_audience("appstoreconnect", true));

    assert!(claims(r#"{}"#).verify_audience("a", false));
    assert!(!claims(r#"{}"#).verify_audience("a", true));
    assert!(!claims(r#"{"aud":["",""]}"#).verify_audience("a", true));
    assert!(!claims(r#"{"aud":["a",1]}"#).verify_audience("a", false));
}

#[test]
fn issuer() {
    let c = claims(r#"{"iss":"https://appleid.apple.com"}"#);
    assert!(c.verify_issuer("https://appleid.apple.com", true));
    assert!(!c.verify_issuer("https://appleid.apple.co", true));
    assert!(claims(r#"{"iss":""}"#).verify_issuer("x", false));
    assert!(!claims(r#"{}"#).verify_issuer("x", true));
}

#[test]
fn validate_reports_every_failure() {
    let c = claims(r#"{"exp":100,"iat":5000,"nbf":5000,"iss":"other","aud":["x"]}"#);
    let options = VerificationOptions {
        artificial_time: Some(UnixTimeStamp::from_secs(1000)),
        required_issuer: Some("https://appleid.apple.com".to_string()),
        required_audience: Some("com.example.app".to_string()),
        ..Default::default()
    };
    let err = c.validate(&options).unwrap_err();
    assert_eq!(
        err.failures(),
        &[
            ClaimFailure::Expired,
            ClaimFailure::IssuedInFuture,
            ClaimFailure::NotYetValid,
            ClaimFailure::IssuerMismatch,
            ClaimFailure::AudienceMismatch,
        ]
    );
    assert!(err.to_string().contains("token has expired"));
    assert!(err.to_string().contains("audience mismatch"));
}

#[test]
fn validate_with_tolerance_and_required_expiration() {
    let options = VerificationOptions {
        artificial_time: Some(UnixTimeStamp::from_secs(1000)),
        time_tolerance: Some(coarsetime::Duration::from_secs(60)),
        ..Default::default()
    };
    claims(r#"{"exp":950,"iat":1050}"#).validate(&options).unwrap();

    let options = VerificationOptions {
        require_expiration: true,
        ..options
    };
    let err = claims(r#"{"iat":900}"#).validate(&options).unwrap_err();
    assert_eq!(err.failures(), &[ClaimFailure::MissingExpiration]);
}

#[test]
fn standard_claims_view() {
    let c = claims(r#"{"iss":"team","sub":"com.example","aud":"https://appleid.apple.com","exp":2000,"iat":1000}"#);
    let std_claims = c.standard_claims().unwrap();
    assert_eq!(std_claims.issuer.as_deref(), Some("team"));
    assert_eq!(std_claims.subject.as_deref(), Some("com.example"));
    assert!(std_claims
        .audiences
        .unwrap()
        .contains("https://appleid.apple.com"));
    assert_eq!(std_claims.expires_at, Some(UnixTimeStamp::from_secs(2000)));
}

#[test]
fn mistyped_registered_claim_is_an_error() {
    let err = claims(r#"{"iss":"team","aud":5}"#)
        .standard_claims()
        .unwrap_err();
    assert!(matches!(
        JWSError::kind_of(&err),
        Some(JWSError::InvalidPayload(_))
    ));
}

#[test]
fn audiences_contains() {
    let single = Audiences::AsString("appstoreconnect-v1".to_string());
    assert!(single.contains("appstoreconnect-v1"));
    assert!(!single.contains("appstoreconnect-v"));
    assert!(!single.contains("appstoreconnect-v2"));

    let set = Audiences::AsSet(vec![
        "com.example.app".to_string(),
        "https://appleid.apple.com".to_string(),
        "com.example.app".to_string(),
    ]);
    assert!(set.contains("com.example.app"));
    assert!(set.contains("https://appleid.apple.com"));
    assert!(!set.contains("com.example"));
    assert!(!Audiences::AsSet(vec![]).contains(""));
}

#[test]
fn payload_must_be_object() {
    let err = MapClaims::from_slice(b"[1,2]").unwrap_err();
    assert!(matches!(
        JWSError::kind_of(&err),
        Some(JWSError::InvalidPayload(_))
    ));
}
