//! The readiness loop coupling the APF session with TCP sockets.
//!
//! Everything runs on one task: the loop waits for the first ready source
//! among the MEI device, the granted listen sockets, and the connected
//! clients, then mutates the daemon state directly. No locks, no spawned
//! tasks; concurrency comes entirely from non-blocking I/O.
//!
//! Per client, two flags gate the two pump directions. `apf_blocked` is set
//! after each `send_data` and cleared by the matching completion event, so a
//! chatty socket cannot outrun the ME's window grants. `apf_incoming` is set
//! while received bytes are still buffered after a partial socket write, so
//! write readiness is only watched when there is something to write.

use std::collections::{HashMap, HashSet};
use std::future::poll_fn;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::task::{Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use apf_session::{ForwardDecision, MeEvent, Session, SessionError};
use mei::MeiDevice;

use crate::error::{Error, Result};

/// Listen backlog for granted forward ports.
const LISTEN_BACKLOG: u32 = 4096;

/// Socket read chunk; one chunk is in flight per channel at a time.
const READ_CHUNK: usize = 4096;

struct ClientConn {
    stream: TcpStream,
    peer: SocketAddr,
    /// Readiness is ignored until the ME confirms the channel.
    registered: bool,
    /// A send_data awaits completion; stop reading the socket.
    apf_blocked: bool,
    /// Received bytes remain buffered after a partial write.
    apf_incoming: bool,
}

/// The one ready source a loop iteration acts on.
enum Wake {
    Me(Option<MeEvent>),
    Accepted {
        port: u16,
        stream: TcpStream,
        peer: SocketAddr,
    },
    ClientReadable(u32),
    ClientWritable(u32),
}

pub struct Apfd {
    session: Session<MeiDevice>,
    mei_ready: AsyncFd<RawFd>,
    listen_addr: Ipv4Addr,
    allowed_ports: HashSet<u16>,
    /// Granted listen sockets, keyed by port.
    listeners: HashMap<u16, TcpListener>,
    /// Connected clients, keyed by channel id.
    clients: HashMap<u32, ClientConn>,
}

impl Apfd {
    pub fn new(
        session: Session<MeiDevice>,
        listen_addr: Ipv4Addr,
        allowed_ports: HashSet<u16>,
    ) -> Result<Self> {
        let mei_ready =
            AsyncFd::with_interest(session.transport().as_raw_fd(), Interest::READABLE)?;
        Ok(Apfd {
            session,
            mei_ready,
            listen_addr,
            allowed_ports,
            listeners: HashMap::new(),
            clients: HashMap::new(),
        })
    }

    pub async fn run(mut self) -> Result<()> {
        info!(allowed_ports = ?self.allowed_ports, "waiting for the ME");
        loop {
            let wake = poll_fn(|cx| self.poll_wake(cx)).await?;
            match wake {
                Wake::Me(Some(event)) => self.handle_me_event(event)?,
                Wake::Me(None) => {}
                Wake::Accepted { port, stream, peer } => {
                    self.handle_accept(port, stream, peer)?;
                }
                Wake::ClientReadable(channel) => self.pump_socket_to_apf(channel, true)?,
                Wake::ClientWritable(channel) => self.pump_apf_to_socket(channel, true)?,
            }
        }
    }

    /// Wait for the first ready source. The MEI device is checked first so
    /// session processing never starves behind socket chatter.
    fn poll_wake(&mut self, cx: &mut Context<'_>) -> Poll<Result<Wake>> {
        if let Poll::Ready(guard) = self.mei_ready.poll_read_ready(cx) {
            let mut guard = match guard {
                Ok(guard) => guard,
                Err(e) => return Poll::Ready(Err(e.into())),
            };
            match guard.try_io(|_| read_one_message(&mut self.session)) {
                Ok(Ok(result)) => {
                    return Poll::Ready(result.map(Wake::Me).map_err(Error::from));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e.into())),
                Err(_would_block) => {}
            }
        }

        for (&port, listener) in &self.listeners {
            if let Poll::Ready(result) = listener.poll_accept(cx) {
                return Poll::Ready(match result {
                    Ok((stream, peer)) => Ok(Wake::Accepted { port, stream, peer }),
                    Err(e) => Err(e.into()),
                });
            }
        }

        for (&channel, conn) in &self.clients {
            if !conn.registered {
                continue;
            }
            if !conn.apf_blocked {
                if let Poll::Ready(result) = conn.stream.poll_read_ready(cx) {
                    return Poll::Ready(match result {
                        Ok(()) => Ok(Wake::ClientReadable(channel)),
                        Err(e) => Err(e.into()),
                    });
                }
            }
            if conn.apf_incoming {
                if let Poll::Ready(result) = conn.stream.poll_write_ready(cx) {
                    return Poll::Ready(match result {
                        Ok(()) => Ok(Wake::ClientWritable(channel)),
                        Err(e) => Err(e.into()),
                    });
                }
            }
        }

        Poll::Pending
    }

    fn handle_me_event(&mut self, event: MeEvent) -> Result<()> {
        match event {
            MeEvent::RequestTcpForward {
                request,
                address,
                port,
            } => {
                let port = match vet_forward_port(port, &self.allowed_ports, |p| {
                    self.listeners.contains_key(&p)
                }) {
                    Ok(port) => port,
                    Err(reason) => {
                        warn!(%address, port, reason, "rejecting forward");
                        return Ok(self.session.respond_forward(request, ForwardDecision::Reject)?);
                    }
                };

                match bind_listener(self.listen_addr, port) {
                    Ok(listener) => {
                        info!(%address, port, "forward granted, listening");
                        self.listeners.insert(port, listener);
                        self.session
                            .respond_forward(request, ForwardDecision::Accept)?;
                    }
                    Err(e) => {
                        warn!(port, error = %e, "bind failed, rejecting forward");
                        self.session
                            .respond_forward(request, ForwardDecision::Reject)?;
                    }
                }
                Ok(())
            }

            MeEvent::OpenChannelResult { channel, success } => {
                if !self.clients.contains_key(&channel) {
                    warn!(channel, success, "open result for unknown client");
                    return Ok(());
                }
                if success {
                    if let Some(conn) = self.clients.get_mut(&channel) {
                        conn.registered = true;
                    }
                    debug!(channel, "accepting data on channel");
                    Ok(())
                } else {
                    warn!(channel, "channel open failed");
                    self.drop_client(channel)
                }
            }

            MeEvent::IncomingData { channel } => self.pump_apf_to_socket(channel, false),

            MeEvent::SendDataCompletion { channel } => self.pump_socket_to_apf(channel, false),

            MeEvent::ChannelClosed { channel } => {
                debug!(channel, "ME closed channel");
                self.drop_client(channel)
            }

            MeEvent::MeDisconnect => Err(Error::MeDisconnect),
        }
    }

    fn handle_accept(&mut self, port: u16, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        // Listen sockets are bound v4; anything else is misconfiguration.
        if !peer.is_ipv4() {
            return Err(Error::NotIpv4(peer));
        }
        let _ = stream.set_nodelay(true);

        let channel = self
            .session
            .open_channel(u32::from(peer.port()), u32::from(port))?;
        info!(%peer, channel, port, "incoming connection");

        // Readiness is not watched until OpenChannelResult arrives.
        self.clients.insert(
            channel,
            ClientConn {
                stream,
                peer,
                registered: false,
                apf_blocked: false,
                apf_incoming: false,
            },
        );
        Ok(())
    }

    /// socket -> APF. `from_socket` distinguishes a readiness trigger from a
    /// SendDataCompletion trigger.
    fn pump_socket_to_apf(&mut self, channel: u32, from_socket: bool) -> Result<()> {
        let Some(conn) = self.clients.get_mut(&channel) else {
            debug!(channel, "pump for unknown client");
            return Ok(());
        };
        if from_socket && conn.apf_blocked {
            // The previous send_data has not completed yet.
            return Ok(());
        }

        let mut buf = [0u8; READ_CHUNK];
        match conn.stream.try_read(&mut buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if !from_socket {
                    conn.apf_blocked = false;
                }
                Ok(())
            }
            Ok(0) => {
                debug!(channel, peer = %conn.peer, "client EOF");
                self.drop_client(channel)
            }
            Ok(n) => {
                self.session.send_data(channel, &buf[..n])?;
                conn.apf_blocked = true;
                Ok(())
            }
            Err(e) => {
                warn!(channel, error = %e, "client read error");
                self.drop_client(channel)
            }
        }
    }

    /// APF -> socket. `from_socket` distinguishes write readiness from an
    /// IncomingData trigger.
    fn pump_apf_to_socket(&mut self, channel: u32, from_socket: bool) -> Result<()> {
        let Some(conn) = self.clients.get_mut(&channel) else {
            debug!(channel, "pump for unknown client");
            return Ok(());
        };
        if from_socket && !conn.apf_incoming {
            return Ok(());
        }

        let data = self.session.peek_data(channel)?;
        let mut written = 0;
        let mut broken = false;
        while written < data.len() {
            match conn.stream.try_write(&data[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(channel, error = %e, "client write error");
                    broken = true;
                    break;
                }
            }
        }
        conn.apf_incoming = !broken && written < data.len();

        self.session.pop_data(channel, written)?;
        if broken {
            return self.drop_client(channel);
        }
        Ok(())
    }

    /// Close the socket, send our half of the channel close, and forget both.
    fn drop_client(&mut self, channel: u32) -> Result<()> {
        if let Some(conn) = self.clients.remove(&channel) {
            debug!(channel, peer = %conn.peer, "closing client");
        }
        match self.session.close_channel(channel) {
            Ok(()) => Ok(()),
            // Open failures race the close; nothing to tear down then.
            Err(SessionError::UnknownChannel(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Run one session step inside the AsyncFd guard so a dry read clears the
/// readiness flag instead of spinning the loop.
fn read_one_message(
    session: &mut Session<MeiDevice>,
) -> io::Result<std::result::Result<Option<MeEvent>, SessionError>> {
    match session.process_one_message() {
        Err(SessionError::Device(e)) if e.kind() == io::ErrorKind::WouldBlock => Err(e),
        Ok(event) => Ok(Ok(event)),
        Err(e) => Ok(Err(e)),
    }
}

/// Policy check for a `tcpip-forward` request.
fn vet_forward_port(
    port: u32,
    allowed: &HashSet<u16>,
    is_listening: impl FnOnce(u16) -> bool,
) -> std::result::Result<u16, &'static str> {
    let Ok(port) = u16::try_from(port) else {
        return Err("port out of range");
    };
    if !allowed.contains(&port) {
        return Err("port not on the allowlist");
    }
    if is_listening(port) {
        return Err("already listening");
    }
    Ok(port)
}

fn bind_listener(addr: Ipv4Addr, port: u16) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.bind(SocketAddr::from((addr, port)))?;
    socket.listen(LISTEN_BACKLOG)
}
