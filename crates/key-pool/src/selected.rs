//! Keys handed out by the pools

use common::{Secret, SecretCipher};
use key_store::UpstreamKey;

use crate::error::{Error, Result};

/// A selected key with its decrypted secret, valid for one upstream call.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub id: String,
    pub label: String,
    pub secret: Secret<String>,
}

impl SelectedKey {
    /// Decrypt `row`'s secret.
    pub(crate) fn open(cipher: &SecretCipher, row: UpstreamKey) -> Result<Self> {
        let secret = cipher
            .decrypt(&row.encrypted_secret)
            .map_err(|e| Error::Decrypt {
                key_id: row.short_id().to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            id: row.id,
            label: row.label,
            secret,
        })
    }

    pub fn short_id(&self) -> &str {
        key_store::model::short_id(&self.id)
    }
}
