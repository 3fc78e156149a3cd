use age::stream::StreamWriter;
use std::io::{Error, Write};

/// Flushes trailing state of a streaming writer and hands back what it wrapped.
///
/// Stages are chained writers (tar into channel, age into chunker); finishing
/// the outer one must finish every layer below it, innermost last.
pub trait Finish<O> {
    fn finish(self) -> Result<O, Error>;
}

impl<W: Write> Finish<W> for StreamWriter<W> {
    fn finish(self) -> Result<W, Error> {
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn age_writer<W: Write>(inner: W) -> StreamWriter<W> {
        age::Encryptor::with_user_passphrase(age::secrecy::SecretString::from(
            "finish_test_passphrase".to_owned(),
        ))
        .wrap_output(inner)
        .unwrap()
    }

    #[test]
    fn test_age_stream_writer_finish_returns_inner() {
        let out: Vec<u8> = Finish::finish(age_writer(Vec::new())).unwrap();
        assert!(out.starts_with(b"age-encryption.org/v1"));
    }

    #[test]
    fn test_finish_flushes_buffered_payload() {
        let mut writer = age_writer(Vec::new());
        writer.write_all(&[7u8; 100]).unwrap();
        let out = Finish::finish(writer).unwrap();
        // header, then the 100 byte chunk plus its 16 byte tag
        assert!(out.len() > 116);
    }
}
