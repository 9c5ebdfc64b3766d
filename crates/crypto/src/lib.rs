//! Content addressing and the encrypted blob format.
//!
//! Everything stored remotely by arca passes through this crate:
//!
//! - [`Hash`] is the 32-byte content address of a binary or a chunk.
//! - [`ContentHasher`] computes salted SHA-256 hashes, streaming the input so
//!   large files are never buffered whole. The salt comes from the repository
//!   passphrase, so the same bytes hash differently in different repositories.
//! - [`Codec`] wraps a byte stream in gzip then AES-256-CBC inside an
//!   OpenSSL-compatible `Salted__` container (`openssl enc -aes-256-cbc
//!   -pbkdf2 -iter 10000 -md sha256` can read what it writes, after gunzip).

mod cipher;
mod codec;
pub mod error;
mod hash;
mod hasher;
mod passphrase;

pub use crate::codec::{Codec, HEADER_LEN, PBKDF2_ITERATIONS, SALT_MARKER};
pub use crate::hash::Hash;
pub use crate::hasher::{ContentHasher, HashingWriter};
pub use crate::passphrase::Passphrase;
