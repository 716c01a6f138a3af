//! The MEI character device.
//!
//! Opening a device is a three-step dance: open the chardev read/write,
//! issue `IOCTL_MEI_CONNECT_CLIENT` with the firmware client's GUID, and
//! record the negotiated maximum message length from the reply. The device
//! starts out blocking (the AMTHI request/response client wants that); the
//! port-forwarding event loop switches it to non-blocking.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use tracing::debug;

use crate::{ClientGuid, FrameTransport, MeiError, Result};

/// Kernel ABI for `IOCTL_MEI_CONNECT_CLIENT` (linux/mei.h).
mod ffi {
    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct MeiClient {
        pub max_msg_length: u32,
        pub protocol_version: u8,
        pub reserved: [u8; 3],
    }

    #[repr(C)]
    pub union MeiConnectClientData {
        pub in_client_uuid: [u8; 16],
        pub out_client_properties: MeiClient,
    }

    nix::ioctl_readwrite!(mei_connect_client, b'H', 0x01, MeiConnectClientData);
}

/// An open, connected MEI client handle.
pub struct MeiDevice {
    file: File,
    max_msg_length: u32,
    protocol_version: u8,
}

impl MeiDevice {
    /// Open `path` and connect to the firmware client identified by `guid`.
    pub fn open(path: &Path, guid: &ClientGuid) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| MeiError::Open {
                path: path.display().to_string(),
                source,
            })?;

        let mut data = ffi::MeiConnectClientData {
            in_client_uuid: guid.0,
        };
        unsafe { ffi::mei_connect_client(file.as_raw_fd(), &mut data) }.map_err(|errno| {
            MeiError::Connect {
                guid: guid.to_string(),
                errno,
            }
        })?;

        let props = unsafe { data.out_client_properties };
        debug!(
            %guid,
            max_msg_length = props.max_msg_length,
            protocol_version = props.protocol_version,
            "connected MEI client"
        );

        Ok(MeiDevice {
            file,
            max_msg_length: props.max_msg_length,
            protocol_version: props.protocol_version,
        })
    }

    /// Switch the device to non-blocking mode so the event loop can poll it.
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
        let fd = self.file.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Maximum message length negotiated with the firmware client.
    pub fn max_msg_length(&self) -> u32 {
        self.max_msg_length
    }

    /// MEI protocol version reported by the firmware client.
    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }
}

impl AsRawFd for MeiDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl FrameTransport for MeiDevice {
    fn read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // MEI preserves message boundaries: one read, one frame.
        (&self.file).read(buf)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.max_msg_length as usize {
            return Err(MeiError::FrameTooLarge {
                len: frame.len(),
                max: self.max_msg_length as usize,
            });
        }
        let written = (&self.file).write(frame)?;
        if written != frame.len() {
            return Err(MeiError::ShortWrite {
                written,
                len: frame.len(),
            });
        }
        Ok(())
    }

    fn max_frame_len(&self) -> usize {
        self.max_msg_length as usize
    }
}
