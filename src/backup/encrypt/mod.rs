pub mod age;

use crate::backup::encrypt::age::AgeEncryptorConfig;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::pipeline::cancel::Cancellation;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use crate::backup::tar::ArchiveBlock;
use ::age::stream::StreamWriter;
use derive_more::From;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::result;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, OnceLock};
use validator::{Validate, ValidationErrors};

/// Streaming encryptor wrapping the downstream writer
#[derive(From)]
pub enum Encryptor<W: Write> {
    AgeEncryptor(StreamWriter<W>),
}

impl<W: Write> Write for Encryptor<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Encryptor::AgeEncryptor(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Encryptor::AgeEncryptor(w) => w.flush(),
        }
    }
}

#[derive(Clone, From, Serialize, Deserialize, Debug)]
#[serde(tag = "encryptor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum EncryptorConfig {
    Age(AgeEncryptorConfig),
}

impl Validate for EncryptorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            EncryptorConfig::Age(inner) => inner.validate(),
        }
    }
}

pub trait EncryptorBuilder<W: Write> {
    fn build_encryptor(&self, writer: W) -> Result<Encryptor<W>>;
}

impl<W: Write> Finish<W> for Encryptor<W> {
    /// Writes the final authenticated chunk and returns the downstream writer.
    fn finish(self) -> result::Result<W, std::io::Error> {
        match self {
            Encryptor::AgeEncryptor(w) => w.finish(),
        }
    }
}

impl<W: Write> EncryptorBuilder<W> for EncryptorConfig {
    fn build_encryptor(&self, writer: W) -> Result<Encryptor<W>> {
        let encryptor = match self {
            EncryptorConfig::Age(age) => {
                tracing::info!("Initializing Age encryption with passphrase");
                age.build_encryptor(writer)
            }
        };
        encryptor.with_debug_object_and_fn_name(self.clone(), "build_encryptor")
    }
}

static AGE_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();
impl FileExtProvider for EncryptorConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        match self {
            EncryptorConfig::Age(_) => Some(AGE_FILE_EXT.get_or_init(|| "age".into()).clone()),
        }
    }
}

/// Cipher stage: encrypts the archive stream block by block into `output`
///
/// Only an explicit end marker finalizes the ciphertext. If the archive channel
/// closes without one, the reader failed and the partial ciphertext is never
/// finalized, so no authenticated stream is produced from a partial archive.
///
/// Returns `output` after the final authenticated chunk has been written.
pub fn run_cipher_stage<W: Write>(
    archive_rx: Receiver<ArchiveBlock>,
    encryptor: &EncryptorConfig,
    output: W,
    cancel: &Cancellation,
) -> Result<W> {
    let mut writer = encryptor.build_encryptor(output)?;
    let mut plaintext = 0u64;
    loop {
        match archive_rx.recv() {
            Ok(ArchiveBlock::Data(block)) => {
                cancel.check()?;
                writer.write_all(&block).map_err(cipher_failure)?;
                plaintext += block.len() as u64;
            }
            Ok(ArchiveBlock::End) => break,
            Err(_) => {
                return Err(Error::Cancelled(
                    "archive stream closed before its end".into(),
                ))
            }
        }
    }
    cancel.check()?;
    let output = writer.finish().map_err(cipher_failure)?;
    tracing::info!("Encrypted {} archive bytes", plaintext);
    Ok(output)
}

/// Sorts a write failure of the cipher stage by where it came from.
pub(crate) fn cipher_failure(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe => Error::Cancelled(format!("upload stage stopped: {e}")),
        std::io::ErrorKind::InvalidInput => Error::Configuration(e.to_string()),
        _ => Error::Encryption(e.to_string()),
    }
}

#[cfg(test)]
pub(crate) fn decrypt(ciphertext: &[u8], passphrase: &str) -> Vec<u8> {
    use ::age::secrecy::SecretString;
    use std::io::Read;

    let identity = ::age::scrypt::Identity::new(SecretString::from(passphrase.to_owned()));
    let decryptor = ::age::Decryptor::new(ciphertext).unwrap();
    let mut reader = decryptor
        .decrypt(std::iter::once(&identity as &dyn ::age::Identity))
        .unwrap();
    let mut plaintext = Vec::new();
    reader.read_to_end(&mut plaintext).unwrap();
    plaintext
}
