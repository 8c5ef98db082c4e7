//! Session key negotiation for protocol 3.4 and 3.5.
//!
//! Three frames are exchanged with the device, all encoded with the local
//! key: our nonce, the device's nonce plus proof it knows the key, and our
//! proof over the device's nonce. Both ends then derive the same session key
//! and every later frame on the connection is encoded with it.

use crate::codec::FrameCodec;
use crate::crypto::{KEY_LEN, TuyaCipher, key_array};
use crate::error::{FrameError, Result, TuyaError};
use crate::protocol::{CommandType, Frame, Generation, HMAC_LEN};
use crate::transport::read_frame;
use hmac::{Hmac, Mac};
use log::debug;
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{Duration, timeout};

pub const NONCE_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Key used for all frames after a successful negotiation.
pub type SessionKey = [u8; KEY_LEN];

/// HMAC-SHA256 of a nonce under the local key.
pub fn nonce_hmac(local_key: &[u8], nonce: &[u8]) -> Result<[u8; HMAC_LEN]> {
    let mut mac = HmacSha256::new_from_slice(local_key)
        .map_err(|_| FrameError::InvalidKey(local_key.len()))?;
    mac.update(nonce);
    Ok(mac.finalize().into_bytes().into())
}

/// Derives the session key from both nonces.
///
/// The nonces are XORed and the result encrypted with the local key: plain
/// ECB for 3.4, GCM keyed on the first 12 bytes of the local nonce for 3.5
/// (only the ciphertext is kept).
pub fn derive_session_key(
    local_key: &[u8],
    generation: Generation,
    local_nonce: &[u8; NONCE_LEN],
    remote_nonce: &[u8; NONCE_LEN],
) -> Result<SessionKey> {
    let mut mixed = [0u8; NONCE_LEN];
    for (i, b) in mixed.iter_mut().enumerate() {
        *b = local_nonce[i] ^ remote_nonce[i];
    }

    let cipher = TuyaCipher::new(local_key)?;
    let encrypted = if generation >= Generation::V3_5 {
        cipher.encrypt_gcm(&local_nonce[..12], &[], &mixed)?
    } else {
        cipher.encrypt_ecb_raw(&mixed)?
    };

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&encrypted[..KEY_LEN]);
    Ok(key)
}

/// Runs the client side of the key exchange on a fresh connection.
pub struct HandshakeNegotiator {
    codec: FrameCodec,
    local_key: [u8; KEY_LEN],
    local_nonce: [u8; NONCE_LEN],
    step_timeout: Duration,
}

impl HandshakeNegotiator {
    /// Creates a negotiator with a random local nonce.
    pub fn new(local_key: &[u8], generation: Generation, step_timeout: Duration) -> Result<Self> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        Self::with_nonce(local_key, generation, nonce, step_timeout)
    }

    pub fn with_nonce(
        local_key: &[u8],
        generation: Generation,
        local_nonce: [u8; NONCE_LEN],
        step_timeout: Duration,
    ) -> Result<Self> {
        if !generation.requires_handshake() {
            return Err(TuyaError::Handshake(format!(
                "protocol {} does not negotiate a session key",
                generation
            )));
        }
        Ok(Self {
            codec: FrameCodec::new(local_key, generation)?,
            local_key: key_array(local_key)?,
            local_nonce,
            step_timeout,
        })
    }

    /// Performs the exchange, advancing `seqno` for each frame sent.
    ///
    /// Every step is bounded by the step timeout. Any unexpected frame or a
    /// proof that does not verify fails the handshake.
    pub async fn negotiate<S>(&self, stream: &mut S, seqno: &mut u32) -> Result<SessionKey>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let generation = self.codec.generation();
        debug!("Starting session key negotiation ({})", generation);

        self.send(stream, seqno, CommandType::SessKeyNegStart, &self.local_nonce)
            .await?;

        let raw = read_frame(stream, self.step_timeout);
        let raw = timeout(self.step_timeout, raw)
            .await
            .map_err(|_| TuyaError::Timeout)?
            .map_err(|e| match e {
                TuyaError::Io(msg) => TuyaError::Handshake(msg),
                other => other,
            })?;
        let resp = self
            .codec
            .decode(&raw)
            .map_err(|e| TuyaError::Handshake(format!("undecodable response: {}", e)))?;

        if resp.command() != Some(CommandType::SessKeyNegResp) {
            return Err(TuyaError::Handshake(format!(
                "unexpected command 0x{:02x} during negotiation",
                resp.cmd
            )));
        }
        if resp.payload.len() < NONCE_LEN + HMAC_LEN {
            return Err(TuyaError::Handshake(format!(
                "response too short ({} bytes)",
                resp.payload.len()
            )));
        }

        let mut remote_nonce = [0u8; NONCE_LEN];
        remote_nonce.copy_from_slice(&resp.payload[..NONCE_LEN]);
        let proof = &resp.payload[NONCE_LEN..NONCE_LEN + HMAC_LEN];

        let mut mac = HmacSha256::new_from_slice(&self.local_key)
            .map_err(|_| FrameError::InvalidKey(self.local_key.len()))?;
        mac.update(&self.local_nonce);
        mac.verify_slice(proof)
            .map_err(|_| TuyaError::Handshake("device proof did not verify".to_string()))?;

        let answer = nonce_hmac(&self.local_key, &remote_nonce)?;
        self.send(stream, seqno, CommandType::SessKeyNegFinish, &answer)
            .await?;

        let key = derive_session_key(&self.local_key, generation, &self.local_nonce, &remote_nonce)?;
        debug!("Session key negotiated");
        Ok(key)
    }

    async fn send<S>(
        &self,
        stream: &mut S,
        seqno: &mut u32,
        cmd: CommandType,
        payload: &[u8],
    ) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let frame = Frame::new(*seqno, cmd, payload);
        *seqno = seqno.wrapping_add(1);
        let bytes = self.codec.encode(&frame)?;
        timeout(self.step_timeout, stream.write_all(&bytes))
            .await
            .map_err(|_| TuyaError::Timeout)??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    const KEY: &[u8] = b"0123456789abcdef";
    const STEP: Duration = Duration::from_millis(500);

    /// Answers one negotiation; `tamper` corrupts the device proof.
    async fn device_side(
        mut stream: DuplexStream,
        generation: Generation,
        remote_nonce: [u8; NONCE_LEN],
        tamper: bool,
    ) -> Option<[u8; HMAC_LEN]> {
        let codec = FrameCodec::new(KEY, generation).unwrap();
        let raw = read_frame(&mut stream, STEP).await.ok()?;
        let start = codec.decode_request(&raw).unwrap();
        assert_eq!(start.command(), Some(CommandType::SessKeyNegStart));

        let mut proof = nonce_hmac(KEY, &start.payload).unwrap();
        if tamper {
            proof[0] ^= 0xff;
        }
        let mut payload = remote_nonce.to_vec();
        payload.extend_from_slice(&proof);
        let resp = Frame::new(start.seqno, CommandType::SessKeyNegResp, payload).with_retcode(0);
        stream.write_all(&codec.encode(&resp).unwrap()).await.unwrap();

        let raw = read_frame(&mut stream, STEP).await.ok()?;
        let finish = codec.decode_request(&raw).unwrap();
        assert_eq!(finish.command(), Some(CommandType::SessKeyNegFinish));
        finish.payload.try_into().ok()
    }

    #[tokio::test]
    async fn both_sides_agree_on_the_key() {
        for generation in [Generation::V3_4, Generation::V3_5] {
            let (mut client, device) = tokio::io::duplex(4096);
            let local = [0x11u8; NONCE_LEN];
            let remote = [0x5au8; NONCE_LEN];
            let peer = tokio::spawn(device_side(device, generation, remote, false));

            let negotiator = HandshakeNegotiator::with_nonce(KEY, generation, local, STEP).unwrap();
            let mut seqno = 1;
            let key = negotiator.negotiate(&mut client, &mut seqno).await.unwrap();

            let finish = peer.await.unwrap().unwrap();
            assert_eq!(finish, nonce_hmac(KEY, &remote).unwrap());
            assert_eq!(key, derive_session_key(KEY, generation, &local, &remote).unwrap());
            assert_eq!(seqno, 3);
        }
    }

    #[test]
    fn derived_keys_differ_between_generations() {
        let local = [1u8; NONCE_LEN];
        let remote = [2u8; NONCE_LEN];
        let v34 = derive_session_key(KEY, Generation::V3_4, &local, &remote).unwrap();
        let v35 = derive_session_key(KEY, Generation::V3_5, &local, &remote).unwrap();
        assert_ne!(v34, v35);
        assert_ne!(v34, [3u8; NONCE_LEN]);
    }

    #[tokio::test]
    async fn bad_device_proof_fails() {
        let (mut client, device) = tokio::io::duplex(4096);
        let _peer = tokio::spawn(device_side(device, Generation::V3_4, [9; NONCE_LEN], true));

        let negotiator = HandshakeNegotiator::new(KEY, Generation::V3_4, STEP).unwrap();
        let err = negotiator.negotiate(&mut client, &mut 1).await.unwrap_err();
        assert!(matches!(err, TuyaError::Handshake(_)));
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let (mut client, _device) = tokio::io::duplex(4096);
        let negotiator =
            HandshakeNegotiator::new(KEY, Generation::V3_5, Duration::from_millis(50)).unwrap();
        let err = negotiator.negotiate(&mut client, &mut 1).await.unwrap_err();
        assert!(matches!(err, TuyaError::Timeout));
    }

    #[test]
    fn legacy_generations_do_not_negotiate() {
        assert!(HandshakeNegotiator::new(KEY, Generation::V3_3, STEP).is_err());
    }
}
