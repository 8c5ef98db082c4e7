//! Generation-aware frame codec.
//!
//! [`FrameCodec`] turns a plaintext [`Frame`] into wire bytes and back for one
//! key and one protocol generation. It holds no sequence state: the session
//! assigns sequence numbers and the codec only carries them.
//!
//! For 3.4 and 3.5 the key handed to the codec is the negotiated session key;
//! for older generations it is the device's local key.

use crate::crypto::{GCM_IV_LEN, TuyaCipher, key_array};
use crate::error::FrameError;
use crate::protocol::{
    CommandType, Frame, Generation, PREFIX_6699, pack_55aa, pack_6699, parse_header,
    skips_version_header, split_retcode, unpack_55aa, unpack_6699,
};
use rand::RngCore;

const VERSION_HEADER_LEN: usize = 15;

#[derive(Clone)]
pub struct FrameCodec {
    key: [u8; 16],
    generation: Generation,
    cipher: TuyaCipher,
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl FrameCodec {
    pub fn new(key: &[u8], generation: Generation) -> Result<Self, FrameError> {
        Ok(Self {
            key: key_array(key)?,
            generation,
            cipher: TuyaCipher::new(key)?,
        })
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Encodes `frame` with a fresh random IV where the generation needs one.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        let mut iv = [0u8; GCM_IV_LEN];
        rand::rng().fill_bytes(&mut iv);
        self.encode_with_iv(frame, &iv)
    }

    /// Encodes `frame` using the given GCM IV (ignored before 3.5).
    pub fn encode_with_iv(
        &self,
        frame: &Frame,
        iv: &[u8; GCM_IV_LEN],
    ) -> Result<Vec<u8>, FrameError> {
        let header = !skips_version_header(frame.cmd);
        let payload = &frame.payload;

        let mut body = Vec::with_capacity(payload.len() + 40);
        if let Some(rc) = frame.retcode {
            body.extend_from_slice(&rc.to_be_bytes());
        }

        match self.generation {
            Generation::V3_1 => {
                if frame.cmd == CommandType::Control.code() && !payload.is_empty() {
                    body.extend_from_slice(&self.cipher.seal_v31(payload));
                } else {
                    body.extend_from_slice(payload);
                }
                pack_55aa(frame.seqno, frame.cmd, &body, None)
            }
            Generation::V3_3 => {
                if !payload.is_empty() {
                    if header {
                        body.extend_from_slice(&self.version_header());
                    }
                    body.extend_from_slice(&self.cipher.encrypt_ecb(payload));
                }
                pack_55aa(frame.seqno, frame.cmd, &body, None)
            }
            Generation::V3_4 => {
                if !payload.is_empty() {
                    let plain = self.with_header(payload, header);
                    body.extend_from_slice(&self.cipher.encrypt_ecb(&plain));
                }
                pack_55aa(frame.seqno, frame.cmd, &body, Some(&self.key))
            }
            Generation::V3_5 => {
                if !payload.is_empty() {
                    body.extend_from_slice(&self.with_header(payload, header));
                }
                pack_6699(frame.seqno, frame.cmd, &body, &self.key, iv)
            }
        }
    }

    /// Decodes a device-originated frame (return code expected).
    pub fn decode(&self, data: &[u8]) -> Result<Frame, FrameError> {
        self.decode_frame(data, true)
    }

    /// Decodes a client-originated frame (no return code).
    pub fn decode_request(&self, data: &[u8]) -> Result<Frame, FrameError> {
        self.decode_frame(data, false)
    }

    fn decode_frame(&self, data: &[u8], has_retcode: bool) -> Result<Frame, FrameError> {
        let expected = self.generation.prefix();
        let header = parse_header(data)?;
        if header.prefix != expected {
            return Err(FrameError::MalformedHeader("prefix does not match generation"));
        }

        let (retcode, body) = if header.prefix == PREFIX_6699 {
            let (_, plaintext) = unpack_6699(data, &self.key)?;
            let (retcode, rest) = self.take_retcode(&plaintext, has_retcode);
            (retcode, rest.to_vec())
        } else {
            let hmac_key = self.generation.uses_hmac().then_some(&self.key[..]);
            let (_, body) = unpack_55aa(data, hmac_key)?;
            let (retcode, rest) = self.take_retcode(body, has_retcode);
            (retcode, rest.to_vec())
        };

        let payload = if body.is_empty() {
            body
        } else {
            self.open_body(body)?
        };

        Ok(Frame {
            seqno: header.seqno,
            cmd: header.cmd,
            retcode,
            payload,
        })
    }

    fn take_retcode<'a>(&self, body: &'a [u8], has_retcode: bool) -> (Option<u32>, &'a [u8]) {
        if has_retcode {
            split_retcode(body)
        } else {
            (None, body)
        }
    }

    fn open_body(&self, body: Vec<u8>) -> Result<Vec<u8>, FrameError> {
        match self.generation {
            Generation::V3_1 => {
                if body.starts_with(b"3.1") {
                    self.cipher.open_v31(&body)
                } else {
                    Ok(body)
                }
            }
            Generation::V3_3 => {
                let ciphertext = self.strip_header(body);
                match self.cipher.decrypt_ecb(&ciphertext) {
                    Ok(plain) => Ok(self.strip_header(plain)),
                    // Some firmware answers errors in plaintext.
                    Err(_) if ciphertext.first() == Some(&b'{') => Ok(ciphertext),
                    Err(e) => Err(e),
                }
            }
            Generation::V3_4 => {
                let plain = self.cipher.decrypt_ecb(&body)?;
                Ok(self.strip_header(plain))
            }
            Generation::V3_5 => Ok(self.strip_header(body)),
        }
    }

    fn version_header(&self) -> [u8; VERSION_HEADER_LEN] {
        let mut header = [0u8; VERSION_HEADER_LEN];
        header[..3].copy_from_slice(self.generation.as_bytes());
        header
    }

    fn with_header(&self, payload: &[u8], header: bool) -> Vec<u8> {
        if !header {
            return payload.to_vec();
        }
        let mut out = Vec::with_capacity(VERSION_HEADER_LEN + payload.len());
        out.extend_from_slice(&self.version_header());
        out.extend_from_slice(payload);
        out
    }

    fn strip_header(&self, mut payload: Vec<u8>) -> Vec<u8> {
        if payload.len() >= VERSION_HEADER_LEN && payload.starts_with(self.generation.as_bytes()) {
            payload.drain(..VERSION_HEADER_LEN);
        }
        payload
    }
}
