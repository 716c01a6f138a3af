//! Transport layer for talking to Intel ME clients over the MEI character
//! device.
//!
//! The MEI driver multiplexes several firmware-side clients behind one
//! character device; a connection is established by an ioctl carrying the
//! target client's GUID. The device preserves message boundaries: every
//! successful `read` returns exactly one protocol frame, and a frame must be
//! submitted in a single `write`.
//!
//! [`FrameTransport`] is the seam the session layer is generic over, so the
//! protocol state machine can be driven from tests without hardware.

mod device;
mod error;
pub mod hexdump;

pub use device::MeiDevice;
pub use error::MeiError;

pub type Result<T> = std::result::Result<T, MeiError>;

/// A 16-byte MEI client GUID in the kernel's `uuid_le` byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientGuid(pub [u8; 16]);

impl ClientGuid {
    /// Build a GUID from its canonical grouped form, producing the
    /// little-endian byte pattern the MEI connect ioctl expects.
    pub const fn new(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> Self {
        let a = d1.to_le_bytes();
        let b = d2.to_le_bytes();
        let c = d3.to_le_bytes();
        ClientGuid([
            a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], d4[0], d4[1], d4[2], d4[3],
            d4[4], d4[5], d4[6], d4[7],
        ])
    }
}

impl std::fmt::Display for ClientGuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6], b[8], b[9], b[10], b[11], b[12],
            b[13], b[14], b[15]
        )
    }
}

/// The Local Manageability Engine, which speaks the APF port-forwarding
/// protocol.
pub const LME_GUID: ClientGuid = ClientGuid::new(
    0x6733_a4db,
    0x0476,
    0x4e7b,
    [0xb3, 0xaf, 0xbc, 0xfc, 0x29, 0xbe, 0xe7, 0xa7],
);

/// The AMT Host Interface (PTHI), a fixed-layout request/response service.
pub const AMTHI_GUID: ClientGuid = ClientGuid::new(
    0x12f8_0028,
    0xb4b7,
    0x4b2d,
    [0xac, 0xa8, 0x46, 0xe0, 0xff, 0x65, 0x81, 0x4c],
);

/// Message-boundary-preserving frame I/O.
///
/// `read_frame` returns one complete frame per call, `Ok(0)` when the peer
/// has closed, and `ErrorKind::WouldBlock` when the transport is
/// non-blocking and no frame is pending. `write_frame` submits a complete
/// frame or fails; partial writes are an error, never retried.
pub trait FrameTransport {
    fn read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Largest frame the peer negotiated; reads need a buffer at least this
    /// big and writes above it will be rejected by the driver.
    fn max_frame_len(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lme_guid_byte_pattern() {
        // UUID_LE(0x6733a4db, 0x0476, 0x4e7b, b3 af bc fc 29 be e7 a7)
        assert_eq!(
            LME_GUID.0,
            [
                0xdb, 0xa4, 0x33, 0x67, 0x76, 0x04, 0x7b, 0x4e, 0xb3, 0xaf, 0xbc, 0xfc,
                0x29, 0xbe, 0xe7, 0xa7
            ]
        );
    }

    #[test]
    fn amthi_guid_byte_pattern() {
        assert_eq!(
            AMTHI_GUID.0,
            [
                0x28, 0x00, 0xf8, 0x12, 0xb7, 0xb4, 0x2d, 0x4b, 0xac, 0xa8, 0x46, 0xe0,
                0xff, 0x65, 0x81, 0x4c
            ]
        );
    }

    #[test]
    fn guid_displays_canonically() {
        assert_eq!(
            LME_GUID.to_string(),
            "6733a4db-0476-4e7b-b3af-bcfc29bee7a7"
        );
        assert_eq!(
            AMTHI_GUID.to_string(),
            "12f80028-b4b7-4b2d-aca8-46e0ff65814c"
        );
    }
}
