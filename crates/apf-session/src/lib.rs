//! APF session state machine for the LME port-forwarding service.
//!
//! [`Session`] owns the MEI transport and every per-channel buffer. The event
//! loop drives it with [`Session::process_one_message`] whenever the device
//! is readable and reacts to the returned [`MeEvent`]; in the other direction
//! socket readiness turns into the command calls (`open_channel`,
//! `send_data`, `pop_data`, `close_channel`).
//!
//! Flow control is credit-based, as in SSH: we may transmit at most
//! `send_window` payload bytes per channel, replenished by the peer's
//! window-adjust messages, and we return one credit byte for every byte the
//! caller consumes via `pop_data`.

mod session;

pub use session::{Session, INITIAL_WINDOW};

use thiserror::Error;

/// Token identifying a pending `tcpip-forward` request.
///
/// Carried by [`MeEvent::RequestTcpForward`]; the caller answers with
/// [`Session::respond_forward`]. Each token is valid for exactly one answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForwardRequest(pub(crate) u32);

/// The caller's verdict on a `tcpip-forward` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    Accept,
    Reject,
}

/// What the ME asked of us, surfaced from [`Session::process_one_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeEvent {
    /// ME wants a listen port opened on the host. Must be answered via
    /// [`Session::respond_forward`].
    RequestTcpForward {
        request: ForwardRequest,
        address: String,
        port: u32,
    },

    /// Outcome of an earlier [`Session::open_channel`]. Data may only be sent
    /// after a successful result.
    OpenChannelResult { channel: u32, success: bool },

    /// New bytes are buffered; consume them with `peek_data` / `pop_data`.
    IncomingData { channel: u32 },

    /// The last `send_data` has fully left the send buffer; the caller may
    /// feed the next chunk.
    SendDataCompletion { channel: u32 },

    /// ME closed its side; the caller should `close_channel` if it has not
    /// already.
    ChannelClosed { channel: u32 },

    /// ME tore the session down. No further messages will be processed.
    MeDisconnect,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("MEI device error: {0}")]
    Device(#[from] std::io::Error),

    #[error("MEI transport error: {0}")]
    Transport(#[from] mei::MeiError),

    #[error("ME closed the MEI connection")]
    DeviceClosed,

    #[error("malformed APF frame: {0}")]
    Malformed(#[from] apf_proto::ParseError),

    #[error("unsupported request: {0}")]
    Unsupported(&'static str),

    #[error("unknown channel {0}")]
    UnknownChannel(u32),

    #[error("channel {0} is not open")]
    ChannelNotOpen(u32),

    #[error("no pending forward request for token {0:?}")]
    UnknownForwardRequest(ForwardRequest),

    #[error("send_data called with no bytes")]
    EmptySend,

    #[error("pop_data({requested}) exceeds {buffered} buffered bytes on channel {channel}")]
    PopOverrun {
        channel: u32,
        requested: usize,
        buffered: usize,
    },
}
