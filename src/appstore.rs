//! App Store Server API and App Store Server Notifications V2.
//!
//! Every `signed*` field Apple returns is a compact JWS whose `x5c` chain
//! leads to Apple Root CA - G3. The `decode_*` helpers run each of them
//! through a [`SignedPayloadVerifier`] before mapping the payload.

use coarsetime::{Clock, Duration};
use serde::{Deserialize, Serialize};

use crate::error::*;
use crate::es256::ES256KeyPair;
use crate::verifier::SignedPayloadVerifier;

/// Audience of App Store Server API tokens
pub const API_AUDIENCE: &str = "appstoreconnect-v1";

/// Lifetime of an App Store Server API token
pub const API_TOKEN_LIFETIME_SECS: u64 = 5 * 60;

/// App Store Server API deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    Production,
    #[default]
    Sandbox,
}

impl Environment {
    pub fn base_url(self) -> &'static str {
        match self {
            Environment::Production => "https://api.storekit.itunes.apple.com",
            Environment::Sandbox => "https://api.storekit-sandbox.itunes.apple.com",
        }
    }
}

/// Credentials issued in App Store Connect (Users and Access > Keys)
#[derive(Debug, Clone, Default)]
pub struct AppStoreConfig {
    /// Issuer ID, e.g. `57246542-96fe-1a63-e053-0824d011072a`
    pub issuer_id: String,
    /// Bundle ID of the app, e.g. `com.example.testbundleid2021`
    pub bundle_id: String,
    /// Private key ID, e.g. `2X9R4HXF34`
    pub key_id: String,
    /// Contents of the `.p8` private key
    pub private_key: String,
    pub environment: Environment,
}

#[derive(Serialize)]
struct ApiTokenClaims<'a> {
    iss: &'a str,
    iat: u64,
    exp: u64,
    aud: &'a str,
    bid: &'a str,
}

/// Mint a bearer token for the App Store Server API.
pub fn api_token(config: &AppStoreConfig) -> Result<String, Error> {
    let key_pair = ES256KeyPair::from_pem(&config.private_key)?.with_key_id(&config.key_id);
    let now = Clock::now_since_epoch();
    let claims = ApiTokenClaims {
        iss: &config.issuer_id,
        iat: now.as_secs(),
        exp: (now + Duration::from_secs(API_TOKEN_LIFETIME_SECS)).as_secs(),
        aud: API_AUDIENCE,
        bid: &config.bundle_id,
    };
    key_pair.sign(&claims, Some("JWT"))
}

/// Error fields present on every API response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ApiError {
    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }
}

/// Decoded `signedTransactionInfo` (JWSTransactionDecodedPayload)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionInfo {
    pub transaction_id: String,
    pub original_transaction_id: String,
    pub web_order_line_item_id: String,
    pub bundle_id: String,
    pub product_id: String,
    pub subscription_group_identifier: String,
    /// Milliseconds since the epoch, like every App Store date
    pub purchase_date: i64,
    pub original_purchase_date: i64,
    pub expires_date: i64,
    pub quantity: i64,
    #[serde(rename = "type")]
    pub product_type: String,
    pub app_account_token: String,
    pub in_app_ownership_type: String,
    pub signed_date: i64,
    pub revocation_reason: Option<i64>,
    pub revocation_date: Option<i64>,
    pub is_upgraded: bool,
    pub offer_type: Option<i64>,
    pub offer_identifier: Option<String>,
    pub environment: String,
    pub storefront: String,
    pub storefront_id: String,
    pub transaction_reason: String,
    pub currency: Option<String>,
    pub price: Option<i64>,
}

/// Decoded `signedRenewalInfo` (JWSRenewalInfoDecodedPayload)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenewalInfo {
    pub original_transaction_id: String,
    pub product_id: String,
    pub auto_renew_product_id: String,
    pub auto_renew_status: i64,
    pub expiration_intent: Option<i64>,
    pub grace_period_expires_date: Option<i64>,
    pub is_in_billing_retry_period: bool,
    pub offer_identifier: Option<String>,
    pub offer_type: Option<i64>,
    pub price_increase_status: Option<i64>,
    pub recent_subscription_start_date: i64,
    pub renewal_date: i64,
    pub signed_date: i64,
    pub environment: String,
}

/// Decoded `signedPayload` of a server notification (responseBodyV2)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationPayload {
    pub notification_type: String,
    pub subtype: String,
    #[serde(rename = "notificationUUID")]
    pub notification_uuid: String,
    pub version: String,
    pub signed_date: i64,
    pub data: Option<NotificationData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationData {
    pub app_apple_id: i64,
    pub bundle_id: String,
    pub bundle_version: String,
    pub environment: String,
    pub signed_transaction_info: String,
    pub signed_renewal_info: String,
    pub status: Option<i64>,
}

/// A notification with its nested payloads verified and decoded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedNotification {
    pub payload: NotificationPayload,
    pub transaction_info: Option<TransactionInfo>,
    pub renewal_info: Option<RenewalInfo>,
}

fn decode_signed<T: serde::de::DeserializeOwned>(
    verifier: &SignedPayloadVerifier,
    signed: &str,
) -> Result<T, Error> {
    ensure!(!signed.is_empty(), JWSError::EmptySignedPayload);
    Ok(verifier.verify::<T>(signed)?.into_inner())
}

fn decode_optional<T: serde::de::DeserializeOwned>(
    verifier: &SignedPayloadVerifier,
    signed: &str,
) -> Result<Option<T>, Error> {
    if signed.is_empty() {
        return Ok(None);
    }
    decode_signed(verifier, signed).map(Some)
}

/// Verify and decode a `signedTransactionInfo`.
pub fn decode_transaction(
    verifier: &SignedPayloadVerifier,
    signed: &str,
) -> Result<TransactionInfo, Error> {
    decode_signed(verifier, signed)
}

/// Verify and decode a `signedRenewalInfo`.
pub fn decode_renewal_info(
    verifier: &SignedPayloadVerifier,
    signed: &str,
) -> Result<RenewalInfo, Error> {
    decode_signed(verifier, signed)
}

/// Verify and decode a notification `signedPayload`.
///
/// The transaction and renewal info it carries are verified on their own;
/// a notification without them (e.g. `TEST`) decodes with `None`.
pub fn decode_notification(
    verifier: &SignedPayloadVerifier,
    signed_payload: &str,
) -> Result<DecodedNotification, Error> {
    let payload: NotificationPayload = decode_signed(verifier, signed_payload)?;
    let (transaction_info, renewal_info) = match &payload.data {
        Some(data) => (
            decode_optional(verifier, &data.signed_transaction_info)?,
            decode_optional(verifier, &data.signed_renewal_info)?,
        ),
        None => (None, None),
    };
    Ok(DecodedNotification {
        payload,
        transaction_info,
        renewal_info,
    })
}

/// Response of Get Transaction Info
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfoResponse {
    #[serde(flatten)]
    pub error: ApiError,
    #[serde(default)]
    pub signed_transaction_info: String,
}

impl TransactionInfoResponse {
    pub fn decode_transaction(
        &self,
        verifier: &SignedPayloadVerifier,
    ) -> Result<TransactionInfo, Error> {
        decode_transaction(verifier, &self.signed_transaction_info)
    }
}

/// Response of Get Transaction History
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    #[serde(flatten)]
    pub error: ApiError,
    #[serde(default)]
    pub app_apple_id: i64,
    #[serde(default)]
    pub bundle_id: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub signed_transactions: Vec<String>,
}

impl HistoryResponse {
    /// Every transaction of the page; one bad entry fails the whole page.
    pub fn decode_transactions(
        &self,
        verifier: &SignedPayloadVerifier,
    ) -> Result<Vec<TransactionInfo>, Error> {
        decode_all(verifier, &self.signed_transactions)
    }
}

/// Response of Get Refund History
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundHistoryResponse {
    #[serde(flatten)]
    pub error: ApiError,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub signed_transactions: Vec<String>,
}

impl RefundHistoryResponse {
    pub fn decode_transactions(
        &self,
        verifier: &SignedPayloadVerifier,
    ) -> Result<Vec<TransactionInfo>, Error> {
        decode_all(verifier, &self.signed_transactions)
    }
}

fn decode_all(
    verifier: &SignedPayloadVerifier,
    signed_transactions: &[String],
) -> Result<Vec<TransactionInfo>, Error> {
    signed_transactions
        .iter()
        .map(|signed| decode_transaction(verifier, signed))
        .collect()
}

/// Response of Get All Subscription Statuses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(flatten)]
    pub error: ApiError,
    #[serde(default)]
    pub app_apple_id: i64,
    #[serde(default)]
    pub bundle_id: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub data: Vec<SubscriptionGroupStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionGroupStatus {
    pub subscription_group_identifier: String,
    pub last_transactions: Vec<LastTransactionsItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LastTransactionsItem {
    pub original_transaction_id: String,
    /// 1 active, 2 expired, 3 billing retry, 4 grace period, 5 revoked
    pub status: i64,
    pub signed_renewal_info: String,
    pub signed_transaction_info: String,
}

impl LastTransactionsItem {
    pub fn decode_transaction(
        &self,
        verifier: &SignedPayloadVerifier,
    ) -> Result<TransactionInfo, Error> {
        decode_transaction(verifier, &self.signed_transaction_info)
    }

    pub fn decode_renewal_info(
        &self,
        verifier: &SignedPayloadVerifier,
    ) -> Result<RenewalInfo, Error> {
        decode_renewal_info(verifier, &self.signed_renewal_info)
    }
}
