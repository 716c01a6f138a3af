use std::path::Path;

use tracing::debug;

use mei::{FrameTransport, MeiDevice, AMTHI_GUID};

use crate::messages::{parse_hash_handles, parse_uuid};
use crate::{command, AhiError, AhiHeader, CertificateHashEntry, LocalSystemAccount, Result};

/// Blocking request/response client for the AMTHI service.
pub struct AmtHostInterface {
    device: MeiDevice,
    recv_buf: Vec<u8>,
}

impl AmtHostInterface {
    /// Open the MEI device and connect to the PTHI client.
    pub fn open(path: &Path) -> Result<Self> {
        let device = MeiDevice::open(path, &AMTHI_GUID)?;
        debug!(
            max_msg_length = device.max_msg_length(),
            protocol_version = device.protocol_version(),
            "connected to AMTHI"
        );
        let recv_buf = vec![0u8; device.max_frame_len() + 1];
        Ok(AmtHostInterface { device, recv_buf })
    }

    pub fn get_local_system_account(&mut self) -> Result<LocalSystemAccount> {
        let rsp = self.exchange(command::GET_LOCAL_SYSTEM_ACCOUNT, &[0u8; 40])?;
        LocalSystemAccount::parse(rsp)
    }

    pub fn enumerate_hash_handles(&mut self) -> Result<Vec<u32>> {
        let rsp = self.exchange(command::ENUMERATE_HASH_HANDLES, &[])?;
        parse_hash_handles(rsp)
    }

    pub fn get_certificate_hash_entry(&mut self, handle: u32) -> Result<CertificateHashEntry> {
        let rsp = self.exchange(command::GET_CERTIFICATE_HASH_ENTRY, &handle.to_le_bytes())?;
        CertificateHashEntry::parse(rsp)
    }

    pub fn get_uuid(&mut self) -> Result<[u8; 16]> {
        let rsp = self.exchange(command::GET_UUID, &[])?;
        parse_uuid(rsp)
    }

    /// Write one request frame, read back one response frame.
    fn exchange(&mut self, cmd: u32, body: &[u8]) -> Result<&[u8]> {
        let header = AhiHeader::request(cmd, body.len() as u32);
        let mut req = Vec::with_capacity(AhiHeader::LEN + body.len());
        req.extend_from_slice(&header.encode());
        req.extend_from_slice(body);
        self.device.write_frame(&req)?;

        let n = self.device.read_frame(&mut self.recv_buf)?;
        if n == 0 {
            return Err(AhiError::Malformed("empty reply from AMTHI"));
        }
        if n > self.device.max_frame_len() {
            return Err(AhiError::Malformed("reply exceeds negotiated maximum"));
        }
        debug!(cmd = %format_args!("{cmd:#010x}"), len = n, "AMTHI exchange complete");
        Ok(&self.recv_buf[..n])
    }
}

/// Format a little-endian 16-byte UUID in its canonical grouped form.
pub fn format_uuid_le(uuid: &[u8; 16]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        uuid[3], uuid[2], uuid[1], uuid[0], uuid[5], uuid[4], uuid[7], uuid[6], uuid[8],
        uuid[9], uuid[10], uuid[11], uuid[12], uuid[13], uuid[14], uuid[15]
    )
}
