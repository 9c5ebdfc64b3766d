//! Streaming AES-256-CBC with PKCS#7 padding.
//!
//! The block-mode crates operate on whole buffers; these adapters feed them
//! block by block so that neither side of the codec has to hold a complete
//! blob in memory.

use aes::Aes256;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use std::io::{self, Read, Write};

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;

pub(crate) const BLOCK: usize = 16;
const READ_SIZE: usize = 64 * 1024;

pub(crate) struct KeyIv {
    pub key: [u8; 32],
    pub iv: [u8; BLOCK],
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Encrypts everything written to it; [`finish`](Self::finish) pads and
/// writes the final block.
pub(crate) struct CbcWriter<W: Write> {
    inner: W,
    cipher: Encryptor,
    pending: Vec<u8>,
    written: u64,
}

impl<W: Write> CbcWriter<W> {
    pub fn new(inner: W, keys: &KeyIv) -> Self {
        Self {
            inner,
            cipher: Encryptor::new(GenericArray::from_slice(&keys.key), GenericArray::from_slice(&keys.iv)),
            pending: Vec::with_capacity(READ_SIZE + BLOCK),
            written: 0,
        }
    }

    fn encrypt_ready_blocks(&mut self) -> io::Result<()> {
        let ready = self.pending.len() - self.pending.len() % BLOCK;
        if ready == 0 {
            return Ok(());
        }
        for block in self.pending[..ready].chunks_exact_mut(BLOCK) {
            self.cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.inner.write_all(&self.pending[..ready])?;
        self.written += ready as u64;
        self.pending.drain(..ready);
        Ok(())
    }

    /// Pad, encrypt the last block and flush. Returns the inner writer and
    /// the number of ciphertext bytes written.
    pub fn finish(mut self) -> io::Result<(W, u64)> {
        self.encrypt_ready_blocks()?;
        // PKCS#7 always pads, a full block of 16s when already aligned.
        let pad = BLOCK - self.pending.len();
        self.pending.resize(BLOCK, pad as u8);
        self.encrypt_ready_blocks()?;
        self.inner.flush()?;
        Ok((self.inner, self.written))
    }
}

impl<W: Write> Write for CbcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if self.pending.len() >= READ_SIZE {
            self.encrypt_ready_blocks()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encrypt_ready_blocks()?;
        self.inner.flush()
    }
}

/// Decrypts a ciphertext stream, holding back the final block until EOF so
/// the padding can be checked and stripped.
pub(crate) struct CbcReader<R: Read> {
    inner: R,
    cipher: Decryptor,
    ciphertext: Vec<u8>,
    plaintext: Vec<u8>,
    position: usize,
    eof: bool,
}

impl<R: Read> CbcReader<R> {
    pub fn new(inner: R, keys: &KeyIv) -> Self {
        Self {
            inner,
            cipher: Decryptor::new(GenericArray::from_slice(&keys.key), GenericArray::from_slice(&keys.iv)),
            ciphertext: Vec::with_capacity(READ_SIZE + BLOCK),
            plaintext: Vec::with_capacity(READ_SIZE + BLOCK),
            position: 0,
            eof: false,
        }
    }

    fn decrypt_blocks(&mut self, count: usize) {
        let end = count * BLOCK;
        for block in self.ciphertext[..end].chunks_exact_mut(BLOCK) {
            self.cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.plaintext.clear();
        self.plaintext.extend(self.ciphertext.drain(..end));
        self.position = 0;
    }

    fn refill(&mut self) -> io::Result<()> {
        let start = self.ciphertext.len();
        self.ciphertext.resize(start + READ_SIZE, 0);
        let n = loop {
            match self.inner.read(&mut self.ciphertext[start..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.ciphertext.truncate(start);
                    return Err(e);
                },
            }
        };
        self.ciphertext.truncate(start + n);
        if n == 0 {
            self.eof = true;
            if self.ciphertext.len() != BLOCK {
                return Err(invalid("ciphertext is not a whole number of blocks"));
            }
            self.decrypt_blocks(1);
            let pad = usize::from(self.plaintext[BLOCK - 1]);
            if pad == 0 || pad > BLOCK || self.plaintext[BLOCK - pad..].iter().any(|&b| usize::from(b) != pad) {
                return Err(invalid("bad padding"));
            }
            self.plaintext.truncate(BLOCK - pad);
            return Ok(());
        }
        // Always keep at least one whole block back for the padding check.
        let whole = self.ciphertext.len() / BLOCK;
        let keep = if self.ciphertext.len() % BLOCK == 0 { 1 } else { 0 };
        if whole > keep {
            self.decrypt_blocks(whole - keep);
        } else {
            self.plaintext.clear();
            self.position = 0;
        }
        Ok(())
    }
}

impl<R: Read> Read for CbcReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.position < self.plaintext.len() {
                let n = out.len().min(self.plaintext.len() - self.position);
                out[..n].copy_from_slice(&self.plaintext[self.position..self.position + n]);
                self.position += n;
                return Ok(n);
            }
            if self.eof || out.is_empty() {
                return Ok(0);
            }
            self.refill()?;
        }
    }
}
