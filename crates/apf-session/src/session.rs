use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use tracing::{debug, info, trace, warn};

use apf_proto::{
    disconnect_reason, ApfMessage, ChannelOpenKind, GlobalRequestKind, PFWD_SERVICE,
};
use mei::hexdump::hexdump;
use mei::FrameTransport;

use crate::{ForwardDecision, ForwardRequest, MeEvent, SessionError};

/// Receive window we offer the ME when opening a channel.
pub const INITIAL_WINDOW: u32 = 4096;

/// ChannelData framing overhead: type(1) + recipient(4) + length(4).
const CHANNEL_DATA_OVERHEAD: usize = 9;

/// Extra slack on the frame buffer so an over-long read is caught by the
/// decoder instead of truncated silently.
const FRAME_SLACK: usize = 32;

const LOCALHOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    /// ChannelOpen sent, confirmation not yet received.
    Pending,
    Open,
}

struct Channel {
    state: ChannelState,
    /// Channel id the ME assigned, learned from the open confirmation.
    peer_id: u32,
    /// Bytes we may still transmit before the ME grants more credit.
    send_window: u32,
    /// Data queued by the caller, not yet framed for lack of window.
    send_buf: BytesMut,
    /// Data delivered by the ME, not yet consumed by the caller.
    recv_buf: BytesMut,
    want_send_completion: bool,
}

impl Channel {
    fn pending() -> Self {
        Channel {
            state: ChannelState::Pending,
            peer_id: 0,
            send_window: 0,
            send_buf: BytesMut::new(),
            recv_buf: BytesMut::new(),
            want_send_completion: false,
        }
    }

    fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }
}

/// The APF protocol engine, generic over the frame transport so it can be
/// driven from tests.
pub struct Session<T> {
    transport: T,
    frame_buf: Vec<u8>,
    /// Live channels keyed by our local id.
    channels: HashMap<u32, Channel>,
    next_channel_id: u32,
    /// Unanswered `tcpip-forward` requests, token -> requested port.
    pending_forwards: HashMap<ForwardRequest, u32>,
    next_forward_id: u32,
}

impl<T: FrameTransport> Session<T> {
    pub fn new(transport: T) -> Self {
        let frame_buf = vec![0u8; transport.max_frame_len() + FRAME_SLACK];
        Session {
            transport,
            frame_buf,
            channels: HashMap::new(),
            next_channel_id: 0,
            pending_forwards: HashMap::new(),
            next_forward_id: 0,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Read exactly one frame from the device and run it through the state
    /// machine.
    ///
    /// Returns at most one event. Device errors (including `WouldBlock` on a
    /// non-blocking transport), malformed frames, and unknown message types
    /// surface as errors; only unknown-channel data and window adjusts are
    /// dropped with the session intact.
    pub fn process_one_message(&mut self) -> Result<Option<MeEvent>, SessionError> {
        let n = self.transport.read_frame(&mut self.frame_buf)?;
        if n == 0 {
            info!("ME connection closing");
            return Err(SessionError::DeviceClosed);
        }

        let msg = match ApfMessage::decode(&self.frame_buf[..n]) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(len = n, error = %e, "invalid message\n{}", hexdump(&self.frame_buf[..n]));
                return Err(e.into());
            }
        };

        self.handle(msg)
    }

    fn handle(&mut self, msg: ApfMessage) -> Result<Option<MeEvent>, SessionError> {
        match msg {
            ApfMessage::Disconnect { reason } => {
                info!(reason, "ME disconnected");
                Ok(Some(MeEvent::MeDisconnect))
            }

            msg @ ApfMessage::ProtocolVersion { .. } => {
                if let ApfMessage::ProtocolVersion { major, minor, .. } = &msg {
                    info!(major = *major, minor = *minor, "protocol version received, echoing");
                }
                // The peer expects its own frame back, unknown regions included.
                self.send(&msg)?;
                Ok(None)
            }

            ApfMessage::ServiceRequest { name } => {
                if name == PFWD_SERVICE {
                    info!(service = %name, "accepting service request");
                    self.send(&ApfMessage::ServiceAccept { name })?;
                    Ok(None)
                } else {
                    warn!(service = %name, "service not available, disconnecting");
                    self.send(&ApfMessage::Disconnect {
                        reason: disconnect_reason::SERVICE_NOT_AVAILABLE,
                    })?;
                    Ok(Some(MeEvent::MeDisconnect))
                }
            }

            ApfMessage::GlobalRequest {
                request: GlobalRequestKind::TcpipForward,
                address,
                port,
            } => {
                let request = ForwardRequest(self.next_forward_id);
                self.next_forward_id += 1;
                self.pending_forwards.insert(request, port);
                debug!(address = %address, port, "ME requests tcp forward");
                Ok(Some(MeEvent::RequestTcpForward {
                    request,
                    address,
                    port,
                }))
            }

            ApfMessage::GlobalRequest {
                request: GlobalRequestKind::CancelTcpipForward,
                ..
            } => Err(SessionError::Unsupported("cancel-tcpip-forward")),

            ApfMessage::ChannelOpenConfirm {
                recipient,
                sender,
                window,
            } => match self.channels.get_mut(&recipient) {
                Some(ch) if ch.state == ChannelState::Pending => {
                    ch.state = ChannelState::Open;
                    ch.peer_id = sender;
                    ch.send_window = window;
                    info!(channel = recipient, peer = sender, window, "channel open");
                    Ok(Some(MeEvent::OpenChannelResult {
                        channel: recipient,
                        success: true,
                    }))
                }
                Some(_) => {
                    warn!(channel = recipient, "duplicate open confirmation");
                    Ok(Some(MeEvent::OpenChannelResult {
                        channel: recipient,
                        success: false,
                    }))
                }
                None => {
                    warn!(channel = recipient, "open confirmation for unknown channel");
                    Ok(Some(MeEvent::OpenChannelResult {
                        channel: recipient,
                        success: false,
                    }))
                }
            },

            ApfMessage::ChannelClose { recipient } => {
                debug!(channel = recipient, "ME closed channel");
                // State is removed in close_channel(), which the caller
                // invokes to send our half of the close.
                Ok(Some(MeEvent::ChannelClosed { channel: recipient }))
            }

            ApfMessage::ChannelData { recipient, data } => {
                match self.channels.get_mut(&recipient) {
                    Some(ch) if ch.is_open() => {
                        trace!(channel = recipient, len = data.len(), "channel data");
                        ch.recv_buf.extend_from_slice(&data);
                        Ok(Some(MeEvent::IncomingData { channel: recipient }))
                    }
                    _ => {
                        warn!(channel = recipient, "data for unknown channel, dropping");
                        Ok(None)
                    }
                }
            }

            ApfMessage::ChannelWindowAdjust {
                recipient,
                bytes_to_add,
            } => {
                match self.channels.get_mut(&recipient) {
                    Some(ch) if ch.is_open() => {
                        ch.send_window = ch.send_window.saturating_add(bytes_to_add);
                        trace!(
                            channel = recipient,
                            bytes_to_add,
                            window = ch.send_window,
                            "window adjust"
                        );
                    }
                    _ => {
                        warn!(channel = recipient, "window adjust for unknown channel, dropping");
                        return Ok(None);
                    }
                }

                self.flush_channel(recipient)?;

                if let Some(ch) = self.channels.get_mut(&recipient) {
                    if ch.send_buf.is_empty() && ch.want_send_completion {
                        ch.want_send_completion = false;
                        return Ok(Some(MeEvent::SendDataCompletion { channel: recipient }));
                    }
                }
                Ok(None)
            }

            // Emit-only messages coming back at us mean a confused peer.
            ApfMessage::ServiceAccept { .. }
            | ApfMessage::RequestSuccess { .. }
            | ApfMessage::RequestFailure
            | ApfMessage::ChannelOpen { .. } => {
                Err(SessionError::Unsupported("unexpected message direction"))
            }
        }
    }

    /// Open a `forwarded-tcpip` channel toward the ME service on
    /// `dest_port`, originated by a host client on `orig_port`.
    ///
    /// Returns the allocated local channel id. Data may flow only after the
    /// matching [`MeEvent::OpenChannelResult`] reports success.
    pub fn open_channel(&mut self, orig_port: u32, dest_port: u32) -> Result<u32, SessionError> {
        let id = self.next_channel_id;
        self.next_channel_id += 1;
        self.channels.insert(id, Channel::pending());

        info!(channel = id, orig_port, dest_port, "opening channel");
        self.send(&ApfMessage::ChannelOpen {
            kind: ChannelOpenKind::ForwardedTcpip,
            sender: id,
            window: INITIAL_WINDOW,
            conn_addr: LOCALHOST.into(),
            conn_port: dest_port,
            orig_addr: LOCALHOST.into(),
            orig_port,
        })?;
        Ok(id)
    }

    /// Queue `data` for transmission and flush as much as the current window
    /// allows. Returns `true` when bytes remain buffered.
    ///
    /// The caller must wait for [`MeEvent::SendDataCompletion`] before the
    /// next `send_data` on the same channel.
    pub fn send_data(&mut self, id: u32, data: &[u8]) -> Result<bool, SessionError> {
        if data.is_empty() {
            return Err(SessionError::EmptySend);
        }
        {
            let ch = self
                .channels
                .get_mut(&id)
                .ok_or(SessionError::UnknownChannel(id))?;
            if !ch.is_open() {
                return Err(SessionError::ChannelNotOpen(id));
            }
            ch.send_buf.extend_from_slice(data);
            ch.want_send_completion = true;
        }
        self.flush_channel(id)?;

        let ch = self
            .channels
            .get(&id)
            .ok_or(SessionError::UnknownChannel(id))?;
        Ok(!ch.send_buf.is_empty())
    }

    /// Borrow the bytes received on `id` that have not been consumed yet.
    pub fn peek_data(&self, id: u32) -> Result<&[u8], SessionError> {
        let ch = self
            .channels
            .get(&id)
            .ok_or(SessionError::UnknownChannel(id))?;
        Ok(&ch.recv_buf)
    }

    /// Drop the first `n` received bytes and return the same amount of
    /// window credit to the ME.
    pub fn pop_data(&mut self, id: u32, n: usize) -> Result<(), SessionError> {
        let peer = {
            let ch = self
                .channels
                .get_mut(&id)
                .ok_or(SessionError::UnknownChannel(id))?;
            if n > ch.recv_buf.len() {
                return Err(SessionError::PopOverrun {
                    channel: id,
                    requested: n,
                    buffered: ch.recv_buf.len(),
                });
            }
            ch.recv_buf.advance(n);
            ch.peer_id
        };

        if n > 0 {
            self.send(&ApfMessage::ChannelWindowAdjust {
                recipient: peer,
                bytes_to_add: n as u32,
            })?;
        }
        Ok(())
    }

    /// Send our half of the close and forget the channel. Buffered data in
    /// either direction is dropped.
    pub fn close_channel(&mut self, id: u32) -> Result<(), SessionError> {
        let ch = self
            .channels
            .remove(&id)
            .ok_or(SessionError::UnknownChannel(id))?;
        match ch.state {
            ChannelState::Open => {
                debug!(channel = id, peer = ch.peer_id, "closing channel");
                self.send(&ApfMessage::ChannelClose {
                    recipient: ch.peer_id,
                })
            }
            ChannelState::Pending => {
                debug!(channel = id, "dropping channel that was never confirmed");
                Ok(())
            }
        }
    }

    /// Answer a pending `tcpip-forward` request.
    pub fn respond_forward(
        &mut self,
        request: ForwardRequest,
        decision: ForwardDecision,
    ) -> Result<(), SessionError> {
        let port = self
            .pending_forwards
            .remove(&request)
            .ok_or(SessionError::UnknownForwardRequest(request))?;
        match decision {
            ForwardDecision::Accept => {
                info!(port, "accepting tcp forward");
                self.send(&ApfMessage::RequestSuccess {
                    port_bound: Some(port),
                })
            }
            ForwardDecision::Reject => {
                info!(port, "rejecting tcp forward");
                self.send(&ApfMessage::RequestFailure)
            }
        }
    }

    /// Emit at most one ChannelData frame covering
    /// `min(send_buf, send_window, max frame payload)` bytes.
    fn flush_channel(&mut self, id: u32) -> Result<(), SessionError> {
        let max_payload = self
            .transport
            .max_frame_len()
            .saturating_sub(CHANNEL_DATA_OVERHEAD);

        let ch = self
            .channels
            .get_mut(&id)
            .ok_or(SessionError::UnknownChannel(id))?;
        let len = ch
            .send_buf
            .len()
            .min(ch.send_window as usize)
            .min(max_payload);
        if len == 0 {
            return Ok(());
        }

        let payload = ch.send_buf.split_to(len);
        let peer = ch.peer_id;
        ch.send_window -= len as u32;
        trace!(channel = id, len, window = ch.send_window, "flushing send buffer");

        let frame = ApfMessage::ChannelData {
            recipient: peer,
            data: payload.to_vec(),
        }
        .encode();
        self.transport.write_frame(&frame)?;
        Ok(())
    }

    fn send(&mut self, msg: &ApfMessage) -> Result<(), SessionError> {
        let frame = msg.encode();
        trace!(msg_type = msg.msg_type(), len = frame.len(), "sending frame");
        Ok(self.transport.write_frame(&frame)?)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;

    #[derive(Default)]
    struct MockInner {
        incoming: VecDeque<Vec<u8>>,
        written: Vec<Vec<u8>>,
        closed: bool,
    }

    /// Scripted transport: the test queues incoming frames and inspects what
    /// the session wrote.
    #[derive(Clone, Default)]
    struct MockTransport(Rc<RefCell<MockInner>>);

    impl MockTransport {
        fn push_incoming(&self, msg: &ApfMessage) {
            self.0.borrow_mut().incoming.push_back(msg.encode());
        }

        fn push_raw(&self, frame: Vec<u8>) {
            self.0.borrow_mut().incoming.push_back(frame);
        }

        fn take_written(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.0.borrow_mut().written)
        }

        fn take_written_msgs(&self) -> Vec<ApfMessage> {
            self.take_written()
                .iter()
                .map(|f| ApfMessage::decode(f).expect("session wrote malformed frame"))
                .collect()
        }

        fn close(&self) {
            self.0.borrow_mut().closed = true;
        }
    }

    impl FrameTransport for MockTransport {
        fn read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut inner = self.0.borrow_mut();
            match inner.incoming.pop_front() {
                Some(frame) => {
                    buf[..frame.len()].copy_from_slice(&frame);
                    Ok(frame.len())
                }
                None if inner.closed => Ok(0),
                None => Err(std::io::ErrorKind::WouldBlock.into()),
            }
        }

        fn write_frame(&mut self, frame: &[u8]) -> mei::Result<()> {
            self.0.borrow_mut().written.push(frame.to_vec());
            Ok(())
        }

        fn max_frame_len(&self) -> usize {
            4096
        }
    }

    fn session() -> (Session<MockTransport>, MockTransport) {
        let transport = MockTransport::default();
        (Session::new(transport.clone()), transport)
    }

    /// Bring a session to the point where channel 0 is open with the given
    /// peer id and send window.
    fn open_channel(
        session: &mut Session<MockTransport>,
        transport: &MockTransport,
        peer: u32,
        window: u32,
    ) -> u32 {
        let id = session.open_channel(40000, 16992).unwrap();
        transport.take_written();
        transport.push_incoming(&ApfMessage::ChannelOpenConfirm {
            recipient: id,
            sender: peer,
            window,
        });
        let ev = session.process_one_message().unwrap();
        assert_eq!(
            ev,
            Some(MeEvent::OpenChannelResult {
                channel: id,
                success: true
            })
        );
        id
    }

    #[test]
    fn protocol_version_is_echoed_verbatim() {
        let (mut session, transport) = session();
        let mut trailing = [0u8; 64];
        trailing[0] = 0xEE;
        trailing[63] = 0x01;
        let frame = ApfMessage::ProtocolVersion {
            major: 1,
            minor: 0,
            reserved: [9, 8, 7, 6],
            uuid: [0xAB; 16],
            trailing,
        }
        .encode();
        assert_eq!(frame.len(), 93);

        transport.push_raw(frame.clone());
        let ev = session.process_one_message().unwrap();
        assert_eq!(ev, None);
        assert_eq!(transport.take_written(), vec![frame]);
    }

    #[test]
    fn pfwd_service_is_accepted() {
        let (mut session, transport) = session();
        transport.push_incoming(&ApfMessage::ServiceRequest {
            name: PFWD_SERVICE.into(),
        });
        let ev = session.process_one_message().unwrap();
        assert_eq!(ev, None);
        assert_eq!(
            transport.take_written_msgs(),
            vec![ApfMessage::ServiceAccept {
                name: PFWD_SERVICE.into()
            }]
        );
    }

    #[test]
    fn unknown_service_disconnects() {
        let (mut session, transport) = session();
        transport.push_incoming(&ApfMessage::ServiceRequest {
            name: "auth@amt.intel.com".into(),
        });
        let ev = session.process_one_message().unwrap();
        assert_eq!(ev, Some(MeEvent::MeDisconnect));
        assert_eq!(
            transport.take_written(),
            vec![vec![1, 0, 0, 0, 7, 0, 0]] // Disconnect, service-not-available
        );
    }

    #[test]
    fn forward_request_accept_binds_port() {
        let (mut session, transport) = session();
        transport.push_incoming(&ApfMessage::GlobalRequest {
            request: GlobalRequestKind::TcpipForward,
            address: "0.0.0.0".into(),
            port: 16992,
        });
        let ev = session.process_one_message().unwrap();
        let Some(MeEvent::RequestTcpForward {
            request,
            address,
            port,
        }) = ev
        else {
            panic!("expected forward request, got {ev:?}");
        };
        assert_eq!(address, "0.0.0.0");
        assert_eq!(port, 16992);

        session
            .respond_forward(request, ForwardDecision::Accept)
            .unwrap();
        assert_eq!(
            transport.take_written(),
            vec![vec![0x51, 0x00, 0x00, 0x42, 0x20]]
        );

        // The token is single-use.
        assert!(matches!(
            session.respond_forward(request, ForwardDecision::Accept),
            Err(SessionError::UnknownForwardRequest(_))
        ));
    }

    #[test]
    fn forward_request_reject_sends_failure() {
        let (mut session, transport) = session();
        transport.push_incoming(&ApfMessage::GlobalRequest {
            request: GlobalRequestKind::TcpipForward,
            address: "0.0.0.0".into(),
            port: 9999,
        });
        let Some(MeEvent::RequestTcpForward { request, .. }) =
            session.process_one_message().unwrap()
        else {
            panic!("expected forward request");
        };
        session
            .respond_forward(request, ForwardDecision::Reject)
            .unwrap();
        assert_eq!(transport.take_written(), vec![vec![0x52]]);
    }

    #[test]
    fn cancel_forward_is_session_fatal() {
        let (mut session, transport) = session();
        transport.push_incoming(&ApfMessage::GlobalRequest {
            request: GlobalRequestKind::CancelTcpipForward,
            address: "0.0.0.0".into(),
            port: 16992,
        });
        assert!(matches!(
            session.process_one_message(),
            Err(SessionError::Unsupported(_))
        ));
    }

    #[test]
    fn open_channel_sends_forwarded_tcpip() {
        let (mut session, transport) = session();
        let id = session.open_channel(40000, 16992).unwrap();
        assert_eq!(id, 0);

        assert_eq!(
            transport.take_written_msgs(),
            vec![ApfMessage::ChannelOpen {
                kind: ChannelOpenKind::ForwardedTcpip,
                sender: 0,
                window: INITIAL_WINDOW,
                conn_addr: "127.0.0.1".into(),
                conn_port: 16992,
                orig_addr: "127.0.0.1".into(),
                orig_port: 40000,
            }]
        );

        // Ids are allocated monotonically.
        assert_eq!(session.open_channel(40001, 16992).unwrap(), 1);
    }

    #[test]
    fn send_data_respects_window_and_completes_on_adjust() {
        let (mut session, transport) = session();
        let id = open_channel(&mut session, &transport, 17, 1000);

        let payload: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        let remaining = session.send_data(id, &payload).unwrap();
        assert!(remaining, "500 bytes should stay buffered");

        let written = transport.take_written_msgs();
        assert_eq!(
            written,
            vec![ApfMessage::ChannelData {
                recipient: 17,
                data: payload[..1000].to_vec(),
            }]
        );

        // Window is exhausted; more data just buffers.
        transport.push_incoming(&ApfMessage::ChannelWindowAdjust {
            recipient: id,
            bytes_to_add: 500,
        });
        let ev = session.process_one_message().unwrap();
        assert_eq!(ev, Some(MeEvent::SendDataCompletion { channel: id }));
        assert_eq!(
            transport.take_written_msgs(),
            vec![ApfMessage::ChannelData {
                recipient: 17,
                data: payload[1000..].to_vec(),
            }]
        );
    }

    #[test]
    fn send_data_within_window_flushes_once() {
        let (mut session, transport) = session();
        let id = open_channel(&mut session, &transport, 17, 1000);

        let remaining = session.send_data(id, b"hello").unwrap();
        assert!(!remaining);
        assert_eq!(transport.take_written_msgs().len(), 1);

        // Completion is raised by the next window adjust, not by send_data.
        transport.push_incoming(&ApfMessage::ChannelWindowAdjust {
            recipient: id,
            bytes_to_add: 5,
        });
        let ev = session.process_one_message().unwrap();
        assert_eq!(ev, Some(MeEvent::SendDataCompletion { channel: id }));
        assert_eq!(transport.take_written(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn send_data_with_zero_window_emits_nothing() {
        let (mut session, transport) = session();
        let id = open_channel(&mut session, &transport, 17, 0);

        let remaining = session.send_data(id, b"blocked").unwrap();
        assert!(remaining);
        assert_eq!(transport.take_written(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn flush_caps_at_transport_frame_size() {
        let (mut session, transport) = session();
        // Window far larger than the 4096-byte mock transport frame.
        let id = open_channel(&mut session, &transport, 17, 100_000);

        let payload = vec![0x55u8; 5000];
        let remaining = session.send_data(id, &payload).unwrap();
        assert!(remaining);

        let written = transport.take_written_msgs();
        let ApfMessage::ChannelData { data, .. } = &written[0] else {
            panic!("expected channel data");
        };
        assert_eq!(data.len(), 4096 - 9);

        // Any adjust flushes the remainder in a second frame.
        transport.push_incoming(&ApfMessage::ChannelWindowAdjust {
            recipient: id,
            bytes_to_add: 0,
        });
        let ev = session.process_one_message().unwrap();
        assert_eq!(ev, Some(MeEvent::SendDataCompletion { channel: id }));
        let written = transport.take_written_msgs();
        let ApfMessage::ChannelData { data, .. } = &written[0] else {
            panic!("expected channel data");
        };
        assert_eq!(data.len(), 5000 - (4096 - 9));
    }

    #[test]
    fn payload_bytes_keep_their_order() {
        let (mut session, transport) = session();
        let id = open_channel(&mut session, &transport, 17, 300);

        let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        session.send_data(id, &payload).unwrap();
        transport.push_incoming(&ApfMessage::ChannelWindowAdjust {
            recipient: id,
            bytes_to_add: 300,
        });
        session.process_one_message().unwrap();

        let mut reassembled = Vec::new();
        for msg in transport.take_written_msgs() {
            let ApfMessage::ChannelData { data, .. } = msg else {
                panic!("expected channel data");
            };
            reassembled.extend_from_slice(&data);
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn incoming_data_is_buffered_and_credited_on_pop() {
        let (mut session, transport) = session();
        let id = open_channel(&mut session, &transport, 17, 1000);

        let body = vec![0x77u8; 200];
        transport.push_incoming(&ApfMessage::ChannelData {
            recipient: id,
            data: body.clone(),
        });
        let ev = session.process_one_message().unwrap();
        assert_eq!(ev, Some(MeEvent::IncomingData { channel: id }));
        assert_eq!(session.peek_data(id).unwrap(), &body[..]);

        session.pop_data(id, 200).unwrap();
        assert!(session.peek_data(id).unwrap().is_empty());
        assert_eq!(
            transport.take_written_msgs(),
            vec![ApfMessage::ChannelWindowAdjust {
                recipient: 17,
                bytes_to_add: 200,
            }]
        );
    }

    #[test]
    fn partial_pops_return_exactly_the_consumed_credit() {
        let (mut session, transport) = session();
        let id = open_channel(&mut session, &transport, 17, 1000);

        transport.push_incoming(&ApfMessage::ChannelData {
            recipient: id,
            data: vec![1u8; 300],
        });
        session.process_one_message().unwrap();

        session.pop_data(id, 120).unwrap();
        session.pop_data(id, 0).unwrap();
        session.pop_data(id, 180).unwrap();

        let credits: Vec<u32> = transport
            .take_written_msgs()
            .into_iter()
            .map(|msg| match msg {
                ApfMessage::ChannelWindowAdjust { bytes_to_add, .. } => bytes_to_add,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(credits, vec![120, 180]);
        assert_eq!(credits.iter().sum::<u32>(), 300);
    }

    #[test]
    fn pop_beyond_buffer_is_an_error() {
        let (mut session, transport) = session();
        let id = open_channel(&mut session, &transport, 17, 1000);
        assert!(matches!(
            session.pop_data(id, 1),
            Err(SessionError::PopOverrun { .. })
        ));
    }

    #[test]
    fn bidirectional_close_removes_the_channel() {
        let (mut session, transport) = session();
        let id = open_channel(&mut session, &transport, 17, 1000);

        transport.push_incoming(&ApfMessage::ChannelClose { recipient: id });
        let ev = session.process_one_message().unwrap();
        assert_eq!(ev, Some(MeEvent::ChannelClosed { channel: id }));

        session.close_channel(id).unwrap();
        assert_eq!(
            transport.take_written_msgs(),
            vec![ApfMessage::ChannelClose { recipient: 17 }]
        );

        // The id is gone: further operations are precondition violations.
        assert!(matches!(
            session.send_data(id, b"late"),
            Err(SessionError::UnknownChannel(0))
        ));
        assert!(matches!(
            session.close_channel(id),
            Err(SessionError::UnknownChannel(0))
        ));
    }

    #[test]
    fn close_of_unconfirmed_channel_sends_nothing() {
        let (mut session, transport) = session();
        let id = session.open_channel(40000, 16992).unwrap();
        transport.take_written();

        session.close_channel(id).unwrap();
        assert_eq!(transport.take_written(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn send_data_before_confirmation_is_rejected() {
        let (mut session, _transport) = session();
        let id = session.open_channel(40000, 16992).unwrap();
        assert!(matches!(
            session.send_data(id, b"early"),
            Err(SessionError::ChannelNotOpen(0))
        ));
    }

    #[test]
    fn empty_send_is_rejected() {
        let (mut session, transport) = session();
        let id = open_channel(&mut session, &transport, 17, 1000);
        assert!(matches!(
            session.send_data(id, b""),
            Err(SessionError::EmptySend)
        ));
    }

    #[test]
    fn data_for_unknown_channel_is_dropped() {
        let (mut session, transport) = session();
        transport.push_incoming(&ApfMessage::ChannelData {
            recipient: 42,
            data: vec![0; 8],
        });
        assert_eq!(session.process_one_message().unwrap(), None);

        transport.push_incoming(&ApfMessage::ChannelWindowAdjust {
            recipient: 42,
            bytes_to_add: 100,
        });
        assert_eq!(session.process_one_message().unwrap(), None);
    }

    #[test]
    fn confirmation_for_unknown_channel_reports_failure() {
        let (mut session, transport) = session();
        transport.push_incoming(&ApfMessage::ChannelOpenConfirm {
            recipient: 9,
            sender: 17,
            window: 1000,
        });
        assert_eq!(
            session.process_one_message().unwrap(),
            Some(MeEvent::OpenChannelResult {
                channel: 9,
                success: false
            })
        );
    }

    #[test]
    fn disconnect_surfaces_me_disconnect() {
        let (mut session, transport) = session();
        transport.push_incoming(&ApfMessage::Disconnect { reason: 7 });
        assert_eq!(
            session.process_one_message().unwrap(),
            Some(MeEvent::MeDisconnect)
        );
    }

    #[test]
    fn device_close_is_fatal() {
        let (mut session, transport) = session();
        transport.close();
        assert!(matches!(
            session.process_one_message(),
            Err(SessionError::DeviceClosed)
        ));
    }

    #[test]
    fn malformed_frame_is_fatal() {
        let (mut session, transport) = session();
        transport.push_raw(vec![0xC8, 0xDE, 0xAD]);
        assert!(matches!(
            session.process_one_message(),
            Err(SessionError::Malformed(_))
        ));
    }

    #[test]
    fn would_block_surfaces_as_device_error() {
        let (mut session, _transport) = session();
        match session.process_one_message() {
            Err(SessionError::Device(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::WouldBlock);
            }
            other => panic!("expected WouldBlock, got {other:?}"),
        }
    }
}
