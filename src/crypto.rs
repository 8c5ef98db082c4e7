//! Tuya protocol encryption primitives.
//! AES-128-ECB with PKCS7 (v3.1, v3.3, v3.4), AES-128-GCM (v3.5) and the
//! MD5 body signature used by v3.1 control frames.

use crate::error::FrameError;
use aes::Aes128;
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine as _, engine::general_purpose};
use cipher::block_padding::{NoPadding, Pkcs7};
use cipher::{BlockDecryptMut, BlockEncryptMut};
use ecb::{Decryptor, Encryptor};
use md5::{Digest, Md5};

pub const KEY_LEN: usize = 16;
pub const GCM_IV_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;

/// Converts a configured key into the fixed-size form every cipher expects.
pub fn key_array(key: &[u8]) -> Result<[u8; KEY_LEN], FrameError> {
    key.try_into().map_err(|_| FrameError::InvalidKey(key.len()))
}

/// TuyaCipher provides AES-128 encryption and decryption in ECB and GCM modes.
#[derive(Clone)]
pub struct TuyaCipher {
    key: [u8; KEY_LEN],
    gcm: Aes128Gcm,
}

impl TuyaCipher {
    pub fn new(key: &[u8]) -> Result<Self, FrameError> {
        let key = key_array(key)?;
        let gcm = Aes128Gcm::new(&key.into());
        Ok(Self { key, gcm })
    }

    /// ECB encryption with PKCS7 padding.
    pub fn encrypt_ecb(&self, data: &[u8]) -> Vec<u8> {
        Encryptor::<Aes128>::new(&self.key.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
    }

    /// ECB encryption of block-aligned data without padding.
    pub fn encrypt_ecb_raw(&self, data: &[u8]) -> Result<Vec<u8>, FrameError> {
        if data.len() % 16 != 0 {
            return Err(FrameError::EncryptionFailed);
        }
        Ok(Encryptor::<Aes128>::new(&self.key.into()).encrypt_padded_vec_mut::<NoPadding>(data))
    }

    /// ECB decryption, validating and stripping PKCS7 padding.
    pub fn decrypt_ecb(&self, data: &[u8]) -> Result<Vec<u8>, FrameError> {
        if data.is_empty() || data.len() % 16 != 0 {
            return Err(FrameError::DecryptionFailed);
        }
        Decryptor::<Aes128>::new(&self.key.into())
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| FrameError::DecryptionFailed)
    }

    /// GCM encryption. Returns `ciphertext || tag`; the IV is not included.
    pub fn encrypt_gcm(&self, iv: &[u8], aad: &[u8], data: &[u8]) -> Result<Vec<u8>, FrameError> {
        if iv.len() < GCM_IV_LEN {
            return Err(FrameError::EncryptionFailed);
        }
        let nonce = Nonce::from_slice(&iv[..GCM_IV_LEN]);
        self.gcm
            .encrypt(nonce, Payload { msg: data, aad })
            .map_err(|_| FrameError::EncryptionFailed)
    }

    /// GCM decryption of `ciphertext || tag`. A tag that does not verify is an
    /// integrity failure, not a decryption failure.
    pub fn decrypt_gcm(&self, iv: &[u8], aad: &[u8], data: &[u8]) -> Result<Vec<u8>, FrameError> {
        if iv.len() < GCM_IV_LEN || data.len() < GCM_TAG_LEN {
            return Err(FrameError::DecryptionFailed);
        }
        let nonce = Nonce::from_slice(&iv[..GCM_IV_LEN]);
        self.gcm
            .decrypt(nonce, Payload { msg: data, aad })
            .map_err(|_| FrameError::IntegrityMismatch)
    }

    /// v3.1 control body: `"3.1" + md5 signature + base64(ECB(data))`.
    pub fn seal_v31(&self, data: &[u8]) -> Vec<u8> {
        let b64 = general_purpose::STANDARD.encode(self.encrypt_ecb(data));
        let mut body = Vec::with_capacity(3 + 16 + b64.len());
        body.extend_from_slice(b"3.1");
        body.extend_from_slice(v31_signature(b64.as_bytes(), &self.key).as_bytes());
        body.extend_from_slice(b64.as_bytes());
        body
    }

    /// Reverses [`seal_v31`](Self::seal_v31). The signature is checked before
    /// anything is decrypted.
    pub fn open_v31(&self, body: &[u8]) -> Result<Vec<u8>, FrameError> {
        if body.len() < 19 || &body[..3] != b"3.1" {
            return Err(FrameError::DecryptionFailed);
        }
        let b64 = &body[19..];
        if v31_signature(b64, &self.key).as_bytes() != &body[3..19] {
            return Err(FrameError::IntegrityMismatch);
        }
        let raw = general_purpose::STANDARD
            .decode(b64)
            .map_err(|_| FrameError::DecryptionFailed)?;
        self.decrypt_ecb(&raw)
    }
}

fn v31_signature(b64: &[u8], key: &[u8]) -> String {
    let mut md5 = Md5::new();
    md5.update(b"data=");
    md5.update(b64);
    md5.update(b"||lpv=3.1||");
    md5.update(key);
    hex::encode(md5.finalize())[8..24].to_string()
}
