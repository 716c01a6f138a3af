//! Response layouts for the AMTHI operations the dumper uses.
//!
//! Every response starts with the 12-byte header plus a 4-byte `amt_status`;
//! a non-zero status ends parsing and is surfaced as [`AhiError::Status`].
//! All scalars are little-endian.

use tracing::warn;

use crate::{AhiError, AhiHeader, Result};

/// Strip the header and status, returning the remaining body.
fn parse_status_header(buf: &[u8]) -> Result<&[u8]> {
    if buf.len() < AhiHeader::LEN + 4 {
        return Err(AhiError::Truncated {
            need: AhiHeader::LEN + 4,
            have: buf.len(),
        });
    }
    let _header = AhiHeader::decode(buf)?;
    let status = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
    if status != 0 {
        return Err(AhiError::Status(status));
    }
    Ok(&buf[16..])
}

fn read_u32(body: &[u8], offset: usize) -> Result<u32> {
    let bytes = body
        .get(offset..offset + 4)
        .ok_or(AhiError::Malformed("scalar out of bounds"))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// The `$$OsAdmin` digest credentials AMT provisions for host-local use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSystemAccount {
    pub username: String,
    pub password: String,
}

impl LocalSystemAccount {
    /// Fixed-size field: 32 characters plus a NUL.
    const FIELD_LEN: usize = 33;

    pub(crate) fn parse(buf: &[u8]) -> Result<Self> {
        let body = parse_status_header(buf)?;
        // Two 33-byte NUL-padded strings plus 2 bytes of padding.
        if body.len() != 2 * Self::FIELD_LEN + 2 {
            return Err(AhiError::Malformed("unexpected account body length"));
        }

        let username = fixed_cstr(&body[..Self::FIELD_LEN])?;
        let password = fixed_cstr(&body[Self::FIELD_LEN..2 * Self::FIELD_LEN])?;

        let padding = u16::from_le_bytes([body[66], body[67]]);
        if padding != 0 {
            warn!(padding, "unexpected padding after local system account");
        }

        Ok(LocalSystemAccount { username, password })
    }
}

/// Decode a NUL-padded fixed-width string field.
fn fixed_cstr(field: &[u8]) -> Result<String> {
    let len = field
        .iter()
        .position(|&b| b == 0)
        .ok_or(AhiError::Malformed("unterminated string field"))?;
    std::str::from_utf8(&field[..len])
        .map(str::to_owned)
        .map_err(|_| AhiError::Malformed("string field is not valid UTF-8"))
}

pub(crate) fn parse_hash_handles(buf: &[u8]) -> Result<Vec<u32>> {
    let body = parse_status_header(buf)?;
    let count = read_u32(body, 0)? as usize;
    if body.len() != 4 + 4 * count {
        return Err(AhiError::Malformed("handle list length mismatch"));
    }
    (0..count).map(|i| read_u32(body, 4 + 4 * i)).collect()
}

pub(crate) fn parse_uuid(buf: &[u8]) -> Result<[u8; 16]> {
    let body = parse_status_header(buf)?;
    let raw = body
        .get(..16)
        .ok_or(AhiError::Malformed("uuid body too short"))?;
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(raw);
    Ok(uuid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Unknown(u8),
}

impl HashAlgorithm {
    fn from_wire(value: u8) -> Self {
        match value {
            1 => HashAlgorithm::Sha1,
            2 => HashAlgorithm::Sha256,
            3 => HashAlgorithm::Sha384,
            other => HashAlgorithm::Unknown(other),
        }
    }

    /// Number of meaningful bytes in the 64-byte hash buffer.
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Unknown(_) => 64,
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashAlgorithm::Sha1 => f.write_str("SHA1"),
            HashAlgorithm::Sha256 => f.write_str("SHA256"),
            HashAlgorithm::Sha384 => f.write_str("SHA384"),
            HashAlgorithm::Unknown(value) => write!(f, "UNKNOWN({value})"),
        }
    }
}

/// One entry of AMT's trusted root certificate hash store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateHashEntry {
    pub is_default: bool,
    pub is_active: bool,
    pub hash: [u8; 64],
    pub algorithm: HashAlgorithm,
    pub name: String,
}

impl CertificateHashEntry {
    pub(crate) fn parse(buf: &[u8]) -> Result<Self> {
        let body = parse_status_header(buf)?;
        // is_default(4) + is_active(4) + hash(64) + algorithm(1) + name_len(2)
        if body.len() < 75 {
            return Err(AhiError::Truncated {
                need: 16 + 75,
                have: buf.len(),
            });
        }
        let name_len = u16::from_le_bytes([body[73], body[74]]) as usize;
        if body.len() != 75 + name_len {
            return Err(AhiError::Malformed("entry name length mismatch"));
        }

        let mut hash = [0u8; 64];
        hash.copy_from_slice(&body[8..72]);

        let name = std::str::from_utf8(&body[75..])
            .map(str::to_owned)
            .map_err(|_| AhiError::Malformed("entry name is not valid UTF-8"))?;

        Ok(CertificateHashEntry {
            is_default: read_u32(body, 0)? == 1,
            is_active: read_u32(body, 4)? == 1,
            hash,
            algorithm: HashAlgorithm::from_wire(body[72]),
            name,
        })
    }

    /// The meaningful prefix of the hash buffer as uppercase hex.
    pub fn hash_hex(&self) -> String {
        mei::hexdump::hex_string(&self.hash[..self.algorithm.digest_len()])
    }
}
