#![forbid(unsafe_code)]

pub mod appstore;
pub mod chain;
pub mod claims;
pub mod common;
pub mod error;
pub mod es256;
pub mod jws_header;
pub mod signin;
pub mod token;
pub mod verifier;

mod serde_additions;

#[cfg(test)]
mod test_pki;

pub use coarsetime;
pub use serde;

pub mod prelude {
    pub use crate::appstore::{
        DecodedNotification, NotificationPayload, RenewalInfo, TransactionInfo,
    };
    pub use crate::chain::*;
    pub use crate::claims::*;
    pub use crate::common::*;
    pub use crate::error::{Error, JWSError};
    pub use crate::es256::*;
    pub use crate::jws_header::*;
    pub use crate::token::*;
    pub use crate::verifier::*;
    pub use coarsetime::{self, Clock, Duration, UnixTimeStamp};
    pub use serde::{Deserialize, Serialize};
}
