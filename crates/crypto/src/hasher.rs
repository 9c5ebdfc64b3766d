use crate::error::{ErrorKind, Result};
use crate::{Hash, Passphrase};
use exn::ResultExt;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::instrument;

const BLOCK_SIZE: usize = 64 * 1024;

/// Salted SHA-256 over arbitrary content.
///
/// The salt bytes are fed to the digest before the content, so identical
/// content produces identical hashes only within one repository.
#[derive(Clone)]
pub struct ContentHasher {
    salt: Vec<u8>,
}

impl ContentHasher {
    pub fn new(passphrase: &Passphrase) -> Self {
        Self {
            salt: passphrase.expose().to_vec(),
        }
    }

    fn digest(&self) -> Sha256 {
        let mut digest = Sha256::new();
        digest.update(&self.salt);
        digest
    }

    pub fn hash_bytes(&self, bytes: &[u8]) -> Hash {
        let mut digest = self.digest();
        digest.update(bytes);
        Hash::from_digest(digest.finalize().into())
    }

    /// Hash everything `reader` yields, one block at a time.
    pub fn hash_reader(&self, mut reader: impl Read) -> io::Result<Hash> {
        let mut digest = self.digest();
        let mut block = vec![0u8; BLOCK_SIZE];
        loop {
            match reader.read(&mut block) {
                Ok(0) => break,
                Ok(n) => digest.update(&block[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Hash::from_digest(digest.finalize().into()))
    }

    /// Hash a file on disk. Blocking; call from a blocking context.
    #[instrument(level = "debug", skip(self), fields(path = %path.display()))]
    pub fn hash_file(&self, path: &Path) -> Result<Hash> {
        let file = File::open(path).or_raise(|| ErrorKind::Io)?;
        self.hash_reader(file).or_raise(|| ErrorKind::Io)
    }

    /// Wrap `inner` so that every byte written through it is also hashed.
    pub fn writer<W: Write>(&self, inner: W) -> HashingWriter<W> {
        HashingWriter {
            inner,
            digest: self.digest(),
            written: 0,
        }
    }
}

/// A [`Write`] adapter that hashes what passes through it.
pub struct HashingWriter<W> {
    inner: W,
    digest: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush the inner writer and return it with the final hash.
    pub fn finish(mut self) -> io::Result<(W, Hash)> {
        self.inner.flush()?;
        Ok((self.inner, Hash::from_digest(self.digest.finalize().into())))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn hasher(passphrase: &str) -> ContentHasher {
        ContentHasher::new(&Passphrase::new(passphrase))
    }

    #[test]
    fn deterministic_for_same_passphrase() {
        assert_eq!(hasher("one").hash_bytes(b"content"), hasher("one").hash_bytes(b"content"));
    }

    #[test]
    fn salted_by_passphrase() {
        assert_ne!(hasher("one").hash_bytes(b"content"), hasher("two").hash_bytes(b"content"));
    }

    #[test]
    fn streaming_matches_in_memory() {
        let data: Vec<u8> = (0..(BLOCK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let hasher = hasher("secret");
        let streamed = hasher.hash_reader(Cursor::new(&data)).unwrap();
        assert_eq!(streamed, hasher.hash_bytes(&data));
    }

    #[test]
    fn salt_then_content() {
        // The salt is a plain prefix of the digest input.
        let mut digest = Sha256::new();
        digest.update(b"secret");
        digest.update(b"content");
        let expected: [u8; 32] = digest.finalize().into();
        assert_eq!(hasher("secret").hash_bytes(b"content").as_bytes(), &expected);
    }

    #[test]
    fn hash_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"on disk").unwrap();
        let hasher = hasher("secret");
        assert_eq!(hasher.hash_file(&path).unwrap(), hasher.hash_bytes(b"on disk"));
        assert!(hasher.hash_file(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn hashing_writer_hashes_passthrough() {
        let hasher = hasher("secret");
        let mut writer = hasher.writer(Vec::new());
        writer.write_all(b"some ").unwrap();
        writer.write_all(b"bytes").unwrap();
        assert_eq!(writer.written(), 10);
        let (out, hash) = writer.finish().unwrap();
        assert_eq!(out, b"some bytes");
        assert_eq!(hash, hasher.hash_bytes(b"some bytes"));
    }
}
