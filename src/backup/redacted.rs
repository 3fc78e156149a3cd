//! Secret string handling with redacted display and serialization.
//!
//! `RedactedString` holds the backup passphrase and store credentials. The value
//! only leaves the struct through [`RedactedString::expose`], is never printed by
//! `Debug` or serialized back out, and its memory is zeroed on drop.

use bon::Builder;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Formatter};
use std::result;
use validator::Validate;
use zeroize::Zeroize;

/// Placeholder text shown instead of the secret in logs/debug output
pub static REDACTED_SECRET: &str = "###REDACTED_SECRET###";

#[derive(Validate, Clone, Zeroize, Builder, PartialEq, Eq)]
pub struct RedactedString {
    /// Minimum 8 characters for basic security
    #[validate(length(min = 8))]
    #[builder(into)]
    inner: String,
}

impl RedactedString {
    /// Borrows the secret value. Callers must not log or persist it.
    pub fn expose(&self) -> &str {
        self.inner.as_str()
    }
}

impl From<&str> for RedactedString {
    fn from(value: &str) -> Self {
        Self::builder().inner(value).build()
    }
}

impl From<String> for RedactedString {
    fn from(value: String) -> Self {
        Self::builder().inner(value).build()
    }
}

impl Debug for RedactedString {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", REDACTED_SECRET)
    }
}

impl Serialize for RedactedString {
    fn serialize<S: Serializer>(&self, serializer: S) -> result::Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED_SECRET)
    }
}

impl<'de> Deserialize<'de> for RedactedString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(RedactedStringVisitor)
    }
}

impl Drop for RedactedString {
    fn drop(&mut self) {
        self.zeroize();
    }
}

struct RedactedStringVisitor;

impl Visitor<'_> for RedactedStringVisitor {
    type Value = RedactedString;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a string")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(RedactedString::from(v))
    }
}
