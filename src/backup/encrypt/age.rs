use crate::backup::encrypt::{Encryptor, EncryptorBuilder};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use age::secrecy::SecretString;
use derive_more::From;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io::Write;
use std::result;
use validator::{Validate, ValidationErrors};

/// Configuration for Age encryption
///
/// Only passphrase encryption is supported. Age derives the file key with
/// scrypt from the passphrase and a random salt generated for every stream;
/// the salt and work factor travel in the age header at the start of the
/// ciphertext, so any age client holding the passphrase can decrypt it with
/// `age -d`. The payload is encrypted with ChaCha20-Poly1305 in 64 KiB
/// authenticated chunks.
#[derive(From, Clone, Deserialize, Serialize, Debug)]
#[serde(tag = "secret_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum AgeEncryptorConfig {
    Passphrase {
        /// The encryption passphrase (redacted in logs, at least 8 characters)
        passphrase: RedactedString,
    },
}

impl AgeEncryptorConfig {
    pub fn passphrase<S: Into<RedactedString>>(passphrase: S) -> Self {
        AgeEncryptorConfig::Passphrase {
            passphrase: passphrase.into(),
        }
    }
}

impl<W: Write> EncryptorBuilder<W> for AgeEncryptorConfig {
    fn build_encryptor(&self, writer: W) -> Result<Encryptor<W>> {
        match self {
            AgeEncryptorConfig::Passphrase { passphrase } => {
                tracing::debug!("Deriving Age file key from passphrase");
                let secret = SecretString::from(passphrase.expose().to_owned());
                Ok(::age::Encryptor::with_user_passphrase(secret)
                    .wrap_output(writer)
                    .map_err(|e| Error::Encryption(e.to_string()))?
                    .into())
            }
        }
    }
}

impl Validate for AgeEncryptorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            AgeEncryptorConfig::Passphrase { passphrase } => passphrase.validate(),
        }
    }
}
