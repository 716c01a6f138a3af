//! Client for the AMT Host Interface (AMTHI, a.k.a. PTHI).
//!
//! AMTHI is the fixed-layout request/response control plane the ME exposes
//! next to the LME port-forwarding service. Unlike APF it is little-endian:
//! every exchange is one [`AhiHeader`]-prefixed request frame followed by one
//! response frame read back from the same device.
//!
//! Used by the `ahi-info` diagnostic dumper; the port-forwarding daemon does
//! not touch this interface.

mod client;
mod messages;

pub use client::{format_uuid_le, AmtHostInterface};
pub use messages::{CertificateHashEntry, HashAlgorithm, LocalSystemAccount};

use thiserror::Error;

/// AMTHI command codes (`class << 24 | operation`).
pub mod command {
    pub const GET_LOCAL_SYSTEM_ACCOUNT: u32 = 0x0400_0067;
    pub const ENUMERATE_HASH_HANDLES: u32 = 0x0400_002C;
    pub const GET_CERTIFICATE_HASH_ENTRY: u32 = 0x0400_002D;
    pub const GET_UUID: u32 = 0x0400_005C;
}

pub type Result<T> = std::result::Result<T, AhiError>;

#[derive(Error, Debug)]
pub enum AhiError {
    #[error("MEI transport error: {0}")]
    Mei(#[from] mei::MeiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("AMT returned status {0:#010x}")]
    Status(u32),

    #[error("response truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("malformed AMTHI response: {0}")]
    Malformed(&'static str),
}

/// The 12-byte little-endian header every AMTHI frame starts with.
///
/// `cmd` packs `operation:23 | is_response:1 | class:8` starting at the LSB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AhiHeader {
    pub ver_major: u8,
    pub ver_minor: u8,
    pub reserved: u16,
    pub cmd: u32,
    /// Body length in bytes, excluding the header itself.
    pub length: u32,
}

impl AhiHeader {
    pub const LEN: usize = 12;

    const RESPONSE_BIT: u32 = 1 << 23;

    /// Header for an outgoing request. The interface version is fixed at 1.1.
    pub fn request(cmd: u32, length: u32) -> Self {
        AhiHeader {
            ver_major: 1,
            ver_minor: 1,
            reserved: 0,
            cmd,
            length,
        }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.ver_major;
        buf[1] = self.ver_minor;
        buf[2..4].copy_from_slice(&self.reserved.to_le_bytes());
        buf[4..8].copy_from_slice(&self.cmd.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(AhiError::Truncated {
                need: Self::LEN,
                have: buf.len(),
            });
        }
        Ok(AhiHeader {
            ver_major: buf[0],
            ver_minor: buf[1],
            reserved: u16::from_le_bytes([buf[2], buf[3]]),
            cmd: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            length: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    pub fn operation(&self) -> u32 {
        self.cmd & (Self::RESPONSE_BIT - 1)
    }

    pub fn is_response(&self) -> bool {
        self.cmd & Self::RESPONSE_BIT != 0
    }

    pub fn class(&self) -> u8 {
        (self.cmd >> 24) as u8
    }
}

impl std::fmt::Display for AhiHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AhiHeader{{ver={}.{}, cmd={:#010x}(class={}, op={:#x}, is_resp={}), len={}}}",
            self.ver_major,
            self.ver_minor,
            self.cmd,
            self.class(),
            self.operation(),
            self.is_response(),
            self.length
        )
    }
}
