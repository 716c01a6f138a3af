//! Wire format for the AMT Port Forwarding (APF) protocol.
//!
//! APF is the SSH-derived framing the Intel ME's Local Manageability Engine
//! (LME) speaks over the MEI character device. Each MEI read delivers exactly
//! one message, so there is no outer length prefix: a frame is a 1-byte type
//! discriminator followed by the message body.
//!
//! All multi-byte scalars are big-endian. Variable-length fields use the SSH
//! string convention:
//!
//! ```text
//! [len:4 BE][bytes:len]
//! ```
//!
//! with no trailing NUL. Decoding is strict: a frame whose length does not
//! exactly match the sum of its fields is rejected. Byte-for-byte
//! compatibility with the LME is required, so [`ApfMessage::encode`] and
//! [`ApfMessage::decode`] are inverses for every representable message.

use thiserror::Error;

/// APF message type discriminators (first byte of every frame).
pub mod msg_type {
    pub const DISCONNECT: u8 = 1;
    pub const SERVICE_REQUEST: u8 = 5;
    pub const SERVICE_ACCEPT: u8 = 6;
    pub const GLOBAL_REQUEST: u8 = 80;
    pub const REQUEST_SUCCESS: u8 = 81;
    pub const REQUEST_FAILURE: u8 = 82;
    pub const CHANNEL_OPEN: u8 = 90;
    pub const CHANNEL_OPEN_CONFIRM: u8 = 91;
    pub const CHANNEL_WINDOW_ADJUST: u8 = 93;
    pub const CHANNEL_DATA: u8 = 94;
    pub const CHANNEL_CLOSE: u8 = 97;
    pub const PROTOCOL_VERSION: u8 = 192;
}

/// Disconnect reason codes.
pub mod disconnect_reason {
    pub const SERVICE_NOT_AVAILABLE: u32 = 7;
}

/// The service name the LME requests before port forwarding can begin.
pub const PFWD_SERVICE: &str = "pfwd@amt.intel.com";

/// Errors produced while decoding an APF frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty frame")]
    Empty,

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    #[error("string field is not valid UTF-8")]
    InvalidString,

    #[error("unsupported global request {0:?}")]
    UnsupportedGlobalRequest(String),

    #[error("global request without want_reply")]
    NoReplyRequested,

    #[error("unknown channel open type {0:?}")]
    UnknownChannelType(String),

    #[error("invalid length for {what}: {len}")]
    InvalidLength { what: &'static str, len: usize },
}

/// A global request the protocol recognizes. Anything else (UDP relays,
/// silent forwards) is rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalRequestKind {
    TcpipForward,
    CancelTcpipForward,
}

impl GlobalRequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GlobalRequestKind::TcpipForward => "tcpip-forward",
            GlobalRequestKind::CancelTcpipForward => "cancel-tcpip-forward",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "tcpip-forward" => Some(GlobalRequestKind::TcpipForward),
            "cancel-tcpip-forward" => Some(GlobalRequestKind::CancelTcpipForward),
            _ => None,
        }
    }
}

/// Channel open type. The daemon only ever opens `forwarded-tcpip` channels
/// (remote forwards of host-local listeners), but the direct form is part of
/// the wire vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOpenKind {
    ForwardedTcpip,
    DirectTcpip,
}

impl ChannelOpenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelOpenKind::ForwardedTcpip => "forwarded-tcpip",
            ChannelOpenKind::DirectTcpip => "direct-tcpip",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "forwarded-tcpip" => Some(ChannelOpenKind::ForwardedTcpip),
            "direct-tcpip" => Some(ChannelOpenKind::DirectTcpip),
            _ => None,
        }
    }
}

/// The closed set of APF messages the daemon recognizes and emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApfMessage {
    /// Session teardown. 7 bytes on the wire: the reason code is followed by
    /// two reserved zero bytes.
    Disconnect { reason: u32 },

    /// LME asks for a service by name.
    ServiceRequest { name: String },

    /// Our reply accepting a requested service.
    ServiceAccept { name: String },

    /// `tcpip-forward` / `cancel-tcpip-forward`. Requests without a reply
    /// flag, or for any other request string, fail to decode.
    GlobalRequest {
        request: GlobalRequestKind,
        address: String,
        port: u32,
    },

    /// Positive reply to a global request. The `port_bound` form is used for
    /// `tcpip-forward` grants; the bare 1-byte form for everything else.
    RequestSuccess { port_bound: Option<u32> },

    /// Negative reply to a global request.
    RequestFailure,

    /// Open a new channel toward the ME. `reserved` is always 0xFFFFFFFF on
    /// the wire.
    ChannelOpen {
        kind: ChannelOpenKind,
        sender: u32,
        window: u32,
        conn_addr: String,
        conn_port: u32,
        orig_addr: String,
        orig_port: u32,
    },

    /// ME accepted a channel open; carries its channel id and initial window.
    ChannelOpenConfirm {
        recipient: u32,
        sender: u32,
        window: u32,
    },

    /// Grant the peer `bytes_to_add` more credit on a channel.
    ChannelWindowAdjust { recipient: u32, bytes_to_add: u32 },

    /// Channel payload.
    ChannelData { recipient: u32, data: Vec<u8> },

    /// Close a channel.
    ChannelClose { recipient: u32 },

    /// Version handshake. Always a 93-byte frame; the reserved and trailing
    /// regions are kept opaque so the frame can be echoed back verbatim.
    ProtocolVersion {
        major: u32,
        minor: u32,
        reserved: [u8; 4],
        uuid: [u8; 16],
        trailing: [u8; 64],
    },
}

impl ApfMessage {
    /// The type discriminator this message is framed with.
    pub fn msg_type(&self) -> u8 {
        match self {
            ApfMessage::Disconnect { .. } => msg_type::DISCONNECT,
            ApfMessage::ServiceRequest { .. } => msg_type::SERVICE_REQUEST,
            ApfMessage::ServiceAccept { .. } => msg_type::SERVICE_ACCEPT,
            ApfMessage::GlobalRequest { .. } => msg_type::GLOBAL_REQUEST,
            ApfMessage::RequestSuccess { .. } => msg_type::REQUEST_SUCCESS,
            ApfMessage::RequestFailure => msg_type::REQUEST_FAILURE,
            ApfMessage::ChannelOpen { .. } => msg_type::CHANNEL_OPEN,
            ApfMessage::ChannelOpenConfirm { .. } => msg_type::CHANNEL_OPEN_CONFIRM,
            ApfMessage::ChannelWindowAdjust { .. } => msg_type::CHANNEL_WINDOW_ADJUST,
            ApfMessage::ChannelData { .. } => msg_type::CHANNEL_DATA,
            ApfMessage::ChannelClose { .. } => msg_type::CHANNEL_CLOSE,
            ApfMessage::ProtocolVersion { .. } => msg_type::PROTOCOL_VERSION,
        }
    }

    /// Encode this message as a single APF frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.push(self.msg_type());

        match self {
            ApfMessage::Disconnect { reason } => {
                buf.extend_from_slice(&reason.to_be_bytes());
                buf.extend_from_slice(&[0, 0]);
            }
            ApfMessage::ServiceRequest { name } | ApfMessage::ServiceAccept { name } => {
                put_lenstr(&mut buf, name);
            }
            ApfMessage::GlobalRequest {
                request,
                address,
                port,
            } => {
                put_lenstr(&mut buf, request.as_str());
                buf.push(1); // want_reply
                put_lenstr(&mut buf, address);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            ApfMessage::RequestSuccess { port_bound } => {
                if let Some(port) = port_bound {
                    buf.extend_from_slice(&port.to_be_bytes());
                }
            }
            ApfMessage::RequestFailure => {}
            ApfMessage::ChannelOpen {
                kind,
                sender,
                window,
                conn_addr,
                conn_port,
                orig_addr,
                orig_port,
            } => {
                put_lenstr(&mut buf, kind.as_str());
                buf.extend_from_slice(&sender.to_be_bytes());
                buf.extend_from_slice(&window.to_be_bytes());
                buf.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
                put_lenstr(&mut buf, conn_addr);
                buf.extend_from_slice(&conn_port.to_be_bytes());
                put_lenstr(&mut buf, orig_addr);
                buf.extend_from_slice(&orig_port.to_be_bytes());
            }
            ApfMessage::ChannelOpenConfirm {
                recipient,
                sender,
                window,
            } => {
                buf.extend_from_slice(&recipient.to_be_bytes());
                buf.extend_from_slice(&sender.to_be_bytes());
                buf.extend_from_slice(&window.to_be_bytes());
            }
            ApfMessage::ChannelWindowAdjust {
                recipient,
                bytes_to_add,
            } => {
                buf.extend_from_slice(&recipient.to_be_bytes());
                buf.extend_from_slice(&bytes_to_add.to_be_bytes());
            }
            ApfMessage::ChannelData { recipient, data } => {
                buf.extend_from_slice(&recipient.to_be_bytes());
                buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
                buf.extend_from_slice(data);
            }
            ApfMessage::ChannelClose { recipient } => {
                buf.extend_from_slice(&recipient.to_be_bytes());
            }
            ApfMessage::ProtocolVersion {
                major,
                minor,
                reserved,
                uuid,
                trailing,
            } => {
                buf.extend_from_slice(&major.to_be_bytes());
                buf.extend_from_slice(&minor.to_be_bytes());
                buf.extend_from_slice(reserved);
                buf.extend_from_slice(uuid);
                buf.extend_from_slice(trailing);
            }
        }

        buf
    }

    /// Decode a single APF frame.
    ///
    /// The buffer must contain exactly one message; trailing bytes are an
    /// error (MEI preserves message boundaries, so anything extra means a
    /// framing bug).
    pub fn decode(buf: &[u8]) -> Result<ApfMessage, ParseError> {
        let mut r = Reader::new(buf);
        let msg = match r.u8().map_err(|_| ParseError::Empty)? {
            msg_type::DISCONNECT => {
                let reason = r.u32()?;
                // Two reserved bytes follow the reason code.
                r.bytes(2)?;
                ApfMessage::Disconnect { reason }
            }
            msg_type::SERVICE_REQUEST => ApfMessage::ServiceRequest { name: r.lenstr()? },
            msg_type::SERVICE_ACCEPT => ApfMessage::ServiceAccept { name: r.lenstr()? },
            msg_type::GLOBAL_REQUEST => {
                let name = r.lenstr()?;
                let request = GlobalRequestKind::from_name(&name)
                    .ok_or(ParseError::UnsupportedGlobalRequest(name))?;
                if r.u8()? != 1 {
                    return Err(ParseError::NoReplyRequested);
                }
                let address = r.lenstr()?;
                let port = r.u32()?;
                ApfMessage::GlobalRequest {
                    request,
                    address,
                    port,
                }
            }
            msg_type::REQUEST_SUCCESS => {
                let port_bound = match buf.len() {
                    1 => None,
                    5 => Some(r.u32()?),
                    len => {
                        return Err(ParseError::InvalidLength {
                            what: "RequestSuccess",
                            len,
                        })
                    }
                };
                ApfMessage::RequestSuccess { port_bound }
            }
            msg_type::REQUEST_FAILURE => ApfMessage::RequestFailure,
            msg_type::CHANNEL_OPEN => {
                let name = r.lenstr()?;
                let kind = ChannelOpenKind::from_name(&name)
                    .ok_or(ParseError::UnknownChannelType(name))?;
                let sender = r.u32()?;
                let window = r.u32()?;
                let _reserved = r.u32()?;
                let conn_addr = r.lenstr()?;
                let conn_port = r.u32()?;
                let orig_addr = r.lenstr()?;
                let orig_port = r.u32()?;
                ApfMessage::ChannelOpen {
                    kind,
                    sender,
                    window,
                    conn_addr,
                    conn_port,
                    orig_addr,
                    orig_port,
                }
            }
            msg_type::CHANNEL_OPEN_CONFIRM => ApfMessage::ChannelOpenConfirm {
                recipient: r.u32()?,
                sender: r.u32()?,
                window: r.u32()?,
            },
            msg_type::CHANNEL_WINDOW_ADJUST => ApfMessage::ChannelWindowAdjust {
                recipient: r.u32()?,
                bytes_to_add: r.u32()?,
            },
            msg_type::CHANNEL_DATA => {
                let recipient = r.u32()?;
                let data = r.lenstr_bytes()?.to_vec();
                ApfMessage::ChannelData { recipient, data }
            }
            msg_type::CHANNEL_CLOSE => ApfMessage::ChannelClose { recipient: r.u32()? },
            msg_type::PROTOCOL_VERSION => {
                let major = r.u32()?;
                let minor = r.u32()?;
                let mut reserved = [0u8; 4];
                reserved.copy_from_slice(r.bytes(4)?);
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(r.bytes(16)?);
                let mut trailing = [0u8; 64];
                trailing.copy_from_slice(r.bytes(64)?);
                ApfMessage::ProtocolVersion {
                    major,
                    minor,
                    reserved,
                    uuid,
                    trailing,
                }
            }
            other => return Err(ParseError::UnknownType(other)),
        };

        r.finish()?;
        Ok(msg)
    }
}

fn put_lenstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Cursor over a frame with bounds-checked field readers.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let end = self.pos.checked_add(n).ok_or(ParseError::Truncated {
            need: usize::MAX,
            have: self.buf.len(),
        })?;
        if end > self.buf.len() {
            return Err(ParseError::Truncated {
                need: end,
                have: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn lenstr_bytes(&mut self) -> Result<&'a [u8], ParseError> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    fn lenstr(&mut self) -> Result<String, ParseError> {
        let raw = self.lenstr_bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ParseError::InvalidString)
    }

    fn finish(self) -> Result<(), ParseError> {
        if self.pos != self.buf.len() {
            return Err(ParseError::TrailingBytes(self.buf.len() - self.pos));
        }
        Ok(())
    }
}
