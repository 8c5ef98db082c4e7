//! Tuya wire protocol framing.
//! Handles header parsing, marker and length checks, and CRC/HMAC/GCM
//! integrity for both frame layouts. Payload encryption lives in `codec`.

use crate::crypto::{GCM_IV_LEN, GCM_TAG_LEN, TuyaCipher};
use crate::error::FrameError;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const PREFIX_6699: u32 = 0x00006699;
pub const SUFFIX_55AA: u32 = 0x0000AA55;
pub const SUFFIX_6699: u32 = 0x00009966;

pub const HEADER_LEN_55AA: usize = 16;
pub const HEADER_LEN_6699: usize = 18;
pub const SUFFIX_LEN: usize = 4;
pub const CRC_LEN: usize = 4;
pub const HMAC_LEN: usize = 32;
pub const RETCODE_LEN: usize = 4;

/// Upper bound on a single frame; anything larger is treated as a framing
/// error before a buffer is allocated.
pub const MAX_FRAME_LEN: usize = 0x10000;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

type HmacSha256 = Hmac<Sha256>;

define_command_type! {
    ApConfig = 0x01,
    Active = 0x02,
    SessKeyNegStart = 0x03,
    SessKeyNegResp = 0x04,
    SessKeyNegFinish = 0x05,
    Unbind = 0x06,
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    QueryWifi = 0x0b,
    TokenBind = 0x0c,
    ControlNew = 0x0d,
    EnableWifi = 0x0e,
    WifiInfo = 0x0f,
    DpQueryNew = 0x10,
    SceneExecute = 0x11,
    UpdateDps = 0x12,
    UdpNew = 0x13,
    ApConfigNew = 0x14,
    LanExtStream = 0x40,
}

define_generation! {
    V3_1 = "3.1",
    V3_3 = "3.3",
    V3_4 = "3.4",
    V3_5 = "3.5",
}

impl Generation {
    /// Generations that negotiate a session key before the first
    /// application frame.
    pub fn requires_handshake(self) -> bool {
        self >= Generation::V3_4
    }

    /// Generations whose 55AA frames carry an HMAC instead of a CRC32.
    pub fn uses_hmac(self) -> bool {
        self == Generation::V3_4
    }

    pub fn prefix(self) -> u32 {
        if self == Generation::V3_5 {
            PREFIX_6699
        } else {
            PREFIX_55AA
        }
    }

    /// Maps legacy command codes onto the ones newer firmware expects.
    pub fn command_for(self, command: CommandType) -> CommandType {
        if self < Generation::V3_4 {
            return command;
        }
        match command {
            CommandType::Control => CommandType::ControlNew,
            CommandType::DpQuery => CommandType::DpQueryNew,
            other => other,
        }
    }
}

/// Commands whose bodies never carry the 15-byte version header.
pub fn skips_version_header(cmd: u32) -> bool {
    matches!(
        CommandType::from_u32(cmd),
        Some(
            CommandType::DpQuery
                | CommandType::DpQueryNew
                | CommandType::UpdateDps
                | CommandType::HeartBeat
                | CommandType::SessKeyNegStart
                | CommandType::SessKeyNegResp
                | CommandType::SessKeyNegFinish
                | CommandType::LanExtStream
        )
    )
}

/// One protocol frame with its payload in plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    /// Sequence number, assigned by the session
    pub seqno: u32,
    /// Command code
    pub cmd: u32,
    /// Return code; only present on device-originated frames
    pub retcode: Option<u32>,
    /// Plaintext payload, usually JSON
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(seqno: u32, cmd: CommandType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            seqno,
            cmd: cmd.code(),
            retcode: None,
            payload: payload.into(),
        }
    }

    pub fn with_retcode(mut self, retcode: u32) -> Self {
        self.retcode = Some(retcode);
        self
    }

    pub fn command(&self) -> Option<CommandType> {
        CommandType::from_u32(self.cmd)
    }
}

/// Fixed-position fields of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub prefix: u32,
    pub seqno: u32,
    pub cmd: u32,
    /// Length field as transmitted
    pub payload_len: usize,
    /// Total bytes the frame occupies on the wire, markers included
    pub total_len: usize,
}

impl FrameHeader {
    pub fn header_len(&self) -> usize {
        header_len_for(self.prefix)
    }
}

pub fn header_len_for(prefix: u32) -> usize {
    if prefix == PREFIX_6699 {
        HEADER_LEN_6699
    } else {
        HEADER_LEN_55AA
    }
}

/// Parses the fixed header at the start of `data`.
///
/// Only the header bytes need to be present; the body is not inspected.
pub fn parse_header(data: &[u8]) -> Result<FrameHeader, FrameError> {
    if data.len() < 4 {
        return Err(FrameError::MalformedHeader("header truncated"));
    }
    let prefix = BigEndian::read_u32(&data[..4]);
    match prefix {
        PREFIX_55AA => {
            if data.len() < HEADER_LEN_55AA {
                return Err(FrameError::MalformedHeader("header truncated"));
            }
            let payload_len = BigEndian::read_u32(&data[12..16]) as usize;
            if !(CRC_LEN + SUFFIX_LEN..=MAX_FRAME_LEN).contains(&payload_len) {
                return Err(FrameError::BadLength {
                    declared: payload_len,
                    available: data.len().saturating_sub(HEADER_LEN_55AA),
                });
            }
            Ok(FrameHeader {
                prefix,
                seqno: BigEndian::read_u32(&data[4..8]),
                cmd: BigEndian::read_u32(&data[8..12]),
                payload_len,
                total_len: HEADER_LEN_55AA + payload_len,
            })
        }
        PREFIX_6699 => {
            if data.len() < HEADER_LEN_6699 {
                return Err(FrameError::MalformedHeader("header truncated"));
            }
            let payload_len = BigEndian::read_u32(&data[14..18]) as usize;
            if !(GCM_IV_LEN + GCM_TAG_LEN..=MAX_FRAME_LEN).contains(&payload_len) {
                return Err(FrameError::BadLength {
                    declared: payload_len,
                    available: data.len().saturating_sub(HEADER_LEN_6699),
                });
            }
            Ok(FrameHeader {
                prefix,
                seqno: BigEndian::read_u32(&data[6..10]),
                cmd: BigEndian::read_u32(&data[10..14]),
                payload_len,
                total_len: HEADER_LEN_6699 + payload_len + SUFFIX_LEN,
            })
        }
        _ => Err(FrameError::MalformedHeader("unknown prefix")),
    }
}

/// Checks the declared length against `data` and the trailing marker.
fn check_bounds(data: &[u8], header: &FrameHeader, suffix: u32) -> Result<(), FrameError> {
    if data.len() != header.total_len {
        return Err(FrameError::BadLength {
            declared: header.payload_len,
            available: data.len().saturating_sub(header.header_len()),
        });
    }
    if BigEndian::read_u32(&data[data.len() - SUFFIX_LEN..]) != suffix {
        return Err(FrameError::MalformedHeader("suffix marker mismatch"));
    }
    Ok(())
}

/// Packs a 55AA frame. `body` is everything between header and integrity
/// code (return code included). With `hmac_key` the integrity code is an
/// HMAC-SHA256, otherwise a CRC32.
pub fn pack_55aa(
    seqno: u32,
    cmd: u32,
    body: &[u8],
    hmac_key: Option<&[u8]>,
) -> Result<Vec<u8>, FrameError> {
    let footer_len = if hmac_key.is_some() { HMAC_LEN } else { CRC_LEN } + SUFFIX_LEN;
    let payload_len = body.len() + footer_len;
    if payload_len > MAX_FRAME_LEN {
        return Err(FrameError::EncryptionFailed);
    }

    let mut data = Vec::with_capacity(HEADER_LEN_55AA + payload_len);
    data.extend_from_slice(&PREFIX_55AA.to_be_bytes());
    data.extend_from_slice(&seqno.to_be_bytes());
    data.extend_from_slice(&cmd.to_be_bytes());
    data.extend_from_slice(&(payload_len as u32).to_be_bytes());
    data.extend_from_slice(body);

    match hmac_key {
        Some(key) => {
            let mut mac =
                HmacSha256::new_from_slice(key).map_err(|_| FrameError::InvalidKey(key.len()))?;
            mac.update(&data);
            data.extend_from_slice(&mac.finalize().into_bytes());
        }
        None => {
            let crc = CRC32.checksum(&data);
            data.extend_from_slice(&crc.to_be_bytes());
        }
    }
    data.extend_from_slice(&SUFFIX_55AA.to_be_bytes());
    Ok(data)
}

/// Validates a complete 55AA frame and returns its header and body.
pub fn unpack_55aa<'a>(
    data: &'a [u8],
    hmac_key: Option<&[u8]>,
) -> Result<(FrameHeader, &'a [u8]), FrameError> {
    let header = parse_header(data)?;
    if header.prefix != PREFIX_55AA {
        return Err(FrameError::MalformedHeader("expected 55AA prefix"));
    }
    let integrity_len = if hmac_key.is_some() { HMAC_LEN } else { CRC_LEN };
    if header.payload_len < integrity_len + SUFFIX_LEN {
        return Err(FrameError::BadLength {
            declared: header.payload_len,
            available: data.len().saturating_sub(HEADER_LEN_55AA),
        });
    }
    check_bounds(data, &header, SUFFIX_55AA)?;

    let body_end = data.len() - SUFFIX_LEN - integrity_len;
    let signed = &data[..body_end];
    let code = &data[body_end..body_end + integrity_len];

    match hmac_key {
        Some(key) => {
            let mut mac =
                HmacSha256::new_from_slice(key).map_err(|_| FrameError::InvalidKey(key.len()))?;
            mac.update(signed);
            mac.verify_slice(code)
                .map_err(|_| FrameError::IntegrityMismatch)?;
        }
        None => {
            if CRC32.checksum(signed) != BigEndian::read_u32(code) {
                return Err(FrameError::IntegrityMismatch);
            }
        }
    }

    Ok((header, &data[HEADER_LEN_55AA..body_end]))
}

/// Packs a 6699 frame, encrypting `plaintext` with AES-GCM under `key`.
/// The header after the prefix is bound as associated data.
pub fn pack_6699(
    seqno: u32,
    cmd: u32,
    plaintext: &[u8],
    key: &[u8],
    iv: &[u8; GCM_IV_LEN],
) -> Result<Vec<u8>, FrameError> {
    let payload_len = GCM_IV_LEN + plaintext.len() + GCM_TAG_LEN;
    if payload_len > MAX_FRAME_LEN {
        return Err(FrameError::EncryptionFailed);
    }

    let mut data = Vec::with_capacity(HEADER_LEN_6699 + payload_len + SUFFIX_LEN);
    data.write_u32::<BigEndian>(PREFIX_6699)
        .map_err(|_| FrameError::EncryptionFailed)?;
    data.write_u16::<BigEndian>(0)
        .map_err(|_| FrameError::EncryptionFailed)?;
    data.extend_from_slice(&seqno.to_be_bytes());
    data.extend_from_slice(&cmd.to_be_bytes());
    data.extend_from_slice(&(payload_len as u32).to_be_bytes());

    let cipher = TuyaCipher::new(key)?;
    let sealed = cipher.encrypt_gcm(iv, &data[4..HEADER_LEN_6699], plaintext)?;

    data.extend_from_slice(iv);
    data.extend_from_slice(&sealed);
    data.extend_from_slice(&SUFFIX_6699.to_be_bytes());
    Ok(data)
}

/// Validates and decrypts a complete 6699 frame.
pub fn unpack_6699(data: &[u8], key: &[u8]) -> Result<(FrameHeader, Vec<u8>), FrameError> {
    let header = parse_header(data)?;
    if header.prefix != PREFIX_6699 {
        return Err(FrameError::MalformedHeader("expected 6699 prefix"));
    }
    check_bounds(data, &header, SUFFIX_6699)?;

    let sealed = &data[HEADER_LEN_6699..data.len() - SUFFIX_LEN];
    let (iv, ciphertext) = sealed.split_at(GCM_IV_LEN);
    let cipher = TuyaCipher::new(key)?;
    let plaintext = cipher.decrypt_gcm(iv, &data[4..HEADER_LEN_6699], ciphertext)?;
    Ok((header, plaintext))
}

/// Splits a leading return code off a device-originated body.
pub fn split_retcode(body: &[u8]) -> (Option<u32>, &[u8]) {
    if body.len() >= RETCODE_LEN {
        (
            Some(BigEndian::read_u32(&body[..RETCODE_LEN])),
            &body[RETCODE_LEN..],
        )
    } else {
        (None, body)
    }
}
