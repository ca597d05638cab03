//! AES-128-CBC cipher used for archive entries.
//!
//! Entries are encrypted one by one with PKCS#7 padding, so every stored
//! encrypted entry is a non-empty multiple of the block size.

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use std::fmt;
use std::path::Path;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;

/// IV the app archives are packed with unless configured otherwise.
pub const DEFAULT_IV: &[u8; IV_LEN] = b"yue is good lib!";

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("iv must be {IV_LEN} bytes, got {0}")]
    InvalidIvLength(usize),
    #[error("decryption failed (wrong key or corrupt data)")]
    Decrypt,
    #[error("cannot read key file {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, PartialEq, Eq)]
pub struct Decipher {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl Decipher {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, CipherError> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
        let iv: [u8; IV_LEN] = iv
            .try_into()
            .map_err(|_| CipherError::InvalidIvLength(iv.len()))?;
        Ok(Self { key, iv })
    }

    pub const fn from_parts(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self { key, iv }
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.is_empty() || data.len() % 16 != 0 {
            return Err(CipherError::Decrypt);
        }
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| CipherError::Decrypt)
    }

    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
    }
}

// The key is compiled into the binary; keep it out of logs anyway.
impl fmt::Debug for Decipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decipher")
            .field("key", &"<redacted>")
            .field("iv", &String::from_utf8_lossy(&self.iv))
            .finish()
    }
}

/// Parse the contents of an `ENCRYPTION_KEY` file. A single trailing newline
/// is ignored so the file can be written with an editor.
pub fn parse_key(bytes: &[u8]) -> Result<[u8; KEY_LEN], CipherError> {
    let trimmed = bytes
        .strip_suffix(b"\r\n")
        .or_else(|| bytes.strip_suffix(b"\n"))
        .unwrap_or(bytes);
    trimmed
        .try_into()
        .map_err(|_| CipherError::InvalidKeyLength(trimmed.len()))
}

pub fn read_key_file(path: &Path) -> Result<[u8; KEY_LEN], CipherError> {
    let bytes = std::fs::read(path).map_err(|source| CipherError::KeyFile {
        path: path.display().to_string(),
        source,
    })?;
    parse_key(&bytes)
}
