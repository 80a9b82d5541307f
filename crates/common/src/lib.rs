//! Common types for the search gateway workspace

mod clock;
mod crypto;
mod error;
mod secret;

pub use clock::now_millis;
pub use crypto::{SecretCipher, parse_encryption_key};
pub use error::{Error, Result};
pub use secret::Secret;
