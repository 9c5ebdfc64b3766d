//! The encrypted blob container.
//!
//! ```text
//! [ "Salted__" ][ 8-byte salt ][ AES-256-CBC( gzip( plaintext ) ) ]
//! ```
//!
//! Key and IV are the first 32 and next 16 bytes of
//! PBKDF2-HMAC-SHA256(passphrase, salt, 10 000 iterations). This is the
//! layout `openssl enc -pbkdf2` produces, so blobs can be recovered with
//! stock tooling if this program is ever unavailable.

use crate::Passphrase;
use crate::cipher::{BLOCK, CbcReader, CbcWriter, KeyIv};
use crate::error::{Error, ErrorKind, Result};
use exn::ResultExt;
use flate2::Compression as GzCompression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rand::RngCore;
use sha2::Sha256;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::instrument;

/// ASCII marker that opens every blob.
pub const SALT_MARKER: &[u8; 8] = b"Salted__";
/// Marker plus salt.
pub const HEADER_LEN: usize = 16;
pub const PBKDF2_ITERATIONS: u32 = 10_000;
const SALT_LEN: usize = 8;
const GZIP_LEVEL: GzCompression = GzCompression::new(6);

/// Encrypts and decrypts blobs with a repository passphrase.
///
/// Cheap to clone. All methods are blocking and are meant to run inside
/// [`spawn_blocking`](https://docs.rs/tokio/latest/tokio/task/fn.spawn_blocking.html).
#[derive(Clone)]
pub struct Codec {
    passphrase: Arc<Passphrase>,
}

impl Codec {
    pub fn new(passphrase: Passphrase) -> Self {
        Self {
            passphrase: Arc::new(passphrase),
        }
    }

    fn derive(&self, salt: &[u8; SALT_LEN]) -> KeyIv {
        let mut derived = [0u8; 32 + BLOCK];
        pbkdf2::pbkdf2_hmac::<Sha256>(self.passphrase.expose(), salt, PBKDF2_ITERATIONS, &mut derived);
        let mut keys = KeyIv {
            key: [0u8; 32],
            iv: [0u8; BLOCK],
        };
        keys.key.copy_from_slice(&derived[..32]);
        keys.iv.copy_from_slice(&derived[32..]);
        keys
    }

    /// Compress and encrypt everything from `reader` into `writer`.
    ///
    /// Returns the number of bytes written, header included.
    #[instrument(level = "debug", skip_all, fields(written))]
    pub fn encrypt(&self, mut reader: impl Read, mut writer: impl Write) -> Result<u64> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        writer.write_all(SALT_MARKER).or_raise(|| ErrorKind::Io)?;
        writer.write_all(&salt).or_raise(|| ErrorKind::Io)?;

        let cipher = CbcWriter::new(writer, &self.derive(&salt));
        let mut gzip = GzEncoder::new(cipher, GZIP_LEVEL);
        io::copy(&mut reader, &mut gzip).or_raise(|| ErrorKind::Io)?;
        let cipher = gzip.finish().or_raise(|| ErrorKind::Io)?;
        let (_, ciphertext) = cipher.finish().or_raise(|| ErrorKind::Io)?;

        let written = HEADER_LEN as u64 + ciphertext;
        tracing::Span::current().record("written", written);
        Ok(written)
    }

    /// Decrypt and decompress everything from `reader` into `writer`.
    ///
    /// Returns the number of plaintext bytes written. Any malformed header,
    /// padding or compressed stream is reported as [`ErrorKind::Decrypt`].
    #[instrument(level = "debug", skip_all, fields(written))]
    pub fn decrypt(&self, mut reader: impl Read, mut writer: impl Write) -> Result<u64> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).map_err(classify)?;
        if &header[..SALT_MARKER.len()] != SALT_MARKER {
            exn::bail!(ErrorKind::Decrypt);
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&header[SALT_MARKER.len()..]);

        let mut gzip = GzDecoder::new(CbcReader::new(reader, &self.derive(&salt)));
        let written = io::copy(&mut gzip, &mut writer).map_err(classify)?;
        writer.flush().or_raise(|| ErrorKind::Io)?;
        tracing::Span::current().record("written", written);
        Ok(written)
    }

    pub fn encrypt_to_vec(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(plaintext.len() / 2 + HEADER_LEN + BLOCK);
        self.encrypt(plaintext, &mut out)?;
        Ok(out)
    }

    pub fn decrypt_to_vec(&self, blob: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.decrypt(blob, &mut out)?;
        Ok(out)
    }
}

/// Malformed input surfaces from the cipher and gzip layers as these kinds;
/// anything else is a genuine I/O failure on one of the two ends.
fn classify(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            Error::from(ErrorKind::Decrypt)
        },
        _ => exn::Exn::new(err).raise(ErrorKind::Io),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn codec(passphrase: &str) -> Codec {
        Codec::new(Passphrase::new(passphrase))
    }

    #[rstest]
    #[case::empty(b"".to_vec())]
    #[case::text(b"The quick brown fox jumps over the lazy dog".to_vec())]
    #[case::large((0..300_000u32).map(|i| (i * 7 % 256) as u8).collect())]
    fn decrypts_what_it_encrypts(#[case] plaintext: Vec<u8>) {
        let codec = codec("correct horse");
        let blob = codec.encrypt_to_vec(&plaintext).unwrap();
        assert_eq!(codec.decrypt_to_vec(&blob).unwrap(), plaintext);
    }

    #[test]
    fn header_is_openssl_compatible() {
        let blob = codec("pw").encrypt_to_vec(b"data").unwrap();
        assert_eq!(&blob[..8], b"Salted__");
        // Header then at least one cipher block, always block aligned.
        assert!(blob.len() >= HEADER_LEN + BLOCK);
        assert_eq!((blob.len() - HEADER_LEN) % BLOCK, 0);
    }

    #[test]
    fn salt_is_random_per_blob() {
        let codec = codec("pw");
        let one = codec.encrypt_to_vec(b"same").unwrap();
        let two = codec.encrypt_to_vec(b"same").unwrap();
        assert_ne!(one[8..16], two[8..16]);
        assert_ne!(one, two);
    }

    #[test]
    fn encrypt_reports_bytes_written() {
        let mut out = Vec::new();
        let written = codec("pw").encrypt(&b"counted"[..], &mut out).unwrap();
        assert_eq!(written, out.len() as u64);
    }

    #[rstest]
    #[case::short(b"tiny".to_vec())]
    #[case::repetitive(vec![0u8; 100_000])]
    #[case::mixed((0..50_000u32).map(|i| (i % 97) as u8).collect())]
    fn wrong_passphrase_never_yields_plaintext(#[case] plaintext: Vec<u8>) {
        let blob = codec("right").encrypt_to_vec(&plaintext).unwrap();
        for wrong in ["wrong", "Right", "right ", ""] {
            let err = codec(wrong).decrypt_to_vec(&blob).unwrap_err();
            assert_eq!(*err, ErrorKind::Decrypt, "passphrase {wrong:?}");
        }
    }

    #[rstest]
    #[case::empty(Vec::new())]
    #[case::marker_only(b"Salted__".to_vec())]
    #[case::bad_marker(b"Unsalted12345678aaaaaaaaaaaaaaaa".to_vec())]
    fn malformed_blobs_are_decrypt_errors(#[case] blob: Vec<u8>) {
        let err = codec("pw").decrypt_to_vec(&blob).unwrap_err();
        assert_eq!(*err, ErrorKind::Decrypt);
    }

    #[test]
    fn flipped_ciphertext_is_detected() {
        let codec = codec("pw");
        let mut blob = codec.encrypt_to_vec(&[42u8; 4096]).unwrap();
        let middle = HEADER_LEN + (blob.len() - HEADER_LEN) / 2;
        blob[middle] ^= 0x01;
        assert!(codec.decrypt_to_vec(&blob).is_err());
    }
}
