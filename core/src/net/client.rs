//! Client-side network context.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use nix::sys::socket::{
    connect, getsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn,
};
use polling::{Event, Poller};

use crate::codec::MIN_PACKET_LEN;
use crate::error::{ResultExt, SystemError, TypedResult};
use crate::protocol::Header;

use super::{buffer_packet, NetArgs, PeerBuf, SendOutcome};

const SOCK_KEY: usize = 0;

/// Events surfaced to the owning node by [`ClientCtx::poll_events`].
#[derive(Debug)]
pub enum ClientEvent {
    /// The outbound connection is established (non-blocking connects only).
    Connected,
    ConnectFailed {
        reason: String,
    },
    Disconnected {
        reason: String,
    },
    Packet {
        header: Header,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Connecting,
    Connected,
    Closed,
}

struct Inner {
    state: ClientState,
    validated: bool,
    sock: Option<TcpStream>,
    connect_started: Instant,
    inbuf: PeerBuf,
    out: PeerBuf,
}

/// A single outbound TCP connection with buffered packet IO.
pub struct ClientCtx {
    name: String,
    ip: String,
    port: u16,
    poller: Poller,
    connect_timeout: Duration,
    inner: Mutex<Inner>,
    writable: Condvar,
}

impl ClientCtx {
    /// Starts a connection attempt. With `connect_blocking` the call only
    /// returns once the connection is established (or the timeout hit);
    /// otherwise the context transitions to connected when the poller
    /// reports writability.
    pub fn connect(args: &NetArgs) -> TypedResult<Self> {
        let addr = SocketAddrV4::new(
            args.ip
                .parse::<Ipv4Addr>()
                .with_context(|| format!("invalid ipv4 address '{}'", args.ip))
                .typ(SystemError::Config)?,
            args.port,
        );

        let poller = Poller::new().typ(SystemError::Init)?;

        let (sock, state) = if args.connect_blocking {
            let sock = TcpStream::connect_timeout(&addr.into(), args.connect_timeout)
                .with_context(|| format!("connecting to {addr}"))
                .typ(SystemError::Init)?;
            sock.set_nonblocking(true).typ(SystemError::Init)?;
            (sock, ClientState::Connected)
        } else {
            (nonblocking_connect(addr)?, ClientState::Connecting)
        };

        poller
            .add(&sock, Event::all(SOCK_KEY))
            .typ(SystemError::Init)?;

        debug!("[{}] connecting to {addr} ({:?})", args.name, state);

        Ok(Self {
            name: args.name.clone(),
            ip: args.ip.clone(),
            port: args.port,
            poller,
            connect_timeout: args.connect_timeout,
            inner: Mutex::new(Inner {
                state,
                validated: false,
                sock: Some(sock),
                connect_started: Instant::now(),
                inbuf: PeerBuf::new(),
                out: PeerBuf::new(),
            }),
            writable: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().state == ClientState::Connected
    }

    /// Marks the handshake as acknowledged by the server.
    pub fn validate(&self) {
        self.inner.lock().unwrap().validated = true;
    }

    pub fn is_validated(&self) -> bool {
        self.inner.lock().unwrap().validated
    }

    pub fn send(&self, header: Header, payload: &[u8]) -> SendOutcome {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ClientState::Connected {
            return SendOutcome::Disconnected;
        }

        if buffer_packet(&mut inner.out, header, payload) {
            return SendOutcome::Ok;
        }
        if flush(&mut inner).is_err() {
            inner.close();
            return SendOutcome::Disconnected;
        }
        if buffer_packet(&mut inner.out, header, payload) {
            return SendOutcome::Ok;
        }

        if let Some(sock) = &inner.sock {
            let _ = self.poller.modify(sock, Event::all(SOCK_KEY));
            let _ = self.poller.notify();
        }
        SendOutcome::BufferFull
    }

    /// Blocks until the outbound buffer can take a maximum-size packet or
    /// the connection dies.
    pub fn wait_outbound(&self, timeout: Option<Duration>) -> SendOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.state != ClientState::Connected {
                return SendOutcome::Disconnected;
            }
            if inner.out.space() >= MIN_PACKET_LEN + crate::codec::MAX_PAYLOAD_LEN {
                return SendOutcome::Ok;
            }
            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return SendOutcome::BufferFull;
                    }
                    self.writable.wait_timeout(inner, deadline - now).unwrap().0
                }
                None => self.writable.wait(inner).unwrap(),
            };
        }
    }

    /// Polls readiness, performs IO and returns the resulting events.
    pub fn poll_events(&self, timeout: Option<Duration>) -> Vec<ClientEvent> {
        let mut io_events: Vec<Event> = Vec::new();
        match self.poller.wait(&mut io_events, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("[{}] poll failed: {e}", self.name);
                return Vec::new();
            }
        }

        let mut out = Vec::new();
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            ClientState::Closed => return out,
            ClientState::Connecting => {
                let became_writable = io_events.iter().any(|e| e.writable);
                if became_writable {
                    match socket_error(inner.sock.as_ref().unwrap()) {
                        Ok(()) => {
                            inner.state = ClientState::Connected;
                            debug!("[{}] connected to {}:{}", self.name, self.ip, self.port);
                            out.push(ClientEvent::Connected);
                        }
                        Err(reason) => {
                            inner.close();
                            out.push(ClientEvent::ConnectFailed { reason });
                        }
                    }
                } else if inner.connect_started.elapsed() > self.connect_timeout {
                    inner.close();
                    out.push(ClientEvent::ConnectFailed {
                        reason: "connect timed out".to_owned(),
                    });
                }
            }
            ClientState::Connected => {}
        }

        if inner.state == ClientState::Connected {
            let mut gone: Option<String> = None;

            for ev in &io_events {
                if ev.writable && !inner.out.is_empty() && flush(&mut inner).is_err() {
                    gone = Some("send failed".to_owned());
                }
                if ev.readable && gone.is_none() {
                    gone = read_pending(&mut inner);
                }
            }

            if gone.is_none() {
                parse_inbound(&self.name, &mut inner, &mut out);
                if !inner.out.is_empty() && flush(&mut inner).is_err() {
                    gone = Some("send failed".to_owned());
                }
            }

            if let Some(reason) = gone {
                inner.close();
                out.push(ClientEvent::Disconnected { reason });
            } else if let Some(sock) = &inner.sock {
                let interest = if inner.out.is_empty() {
                    Event::readable(SOCK_KEY)
                } else {
                    Event::all(SOCK_KEY)
                };
                let _ = self.poller.modify(sock, interest);
            }
        }

        drop(inner);
        self.writable.notify_all();
        out
    }

    /// Flushes what it can and closes the connection. Safe to call while
    /// workers are blocked in `wait_outbound`.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ClientState::Connected {
            let _ = flush(&mut inner);
        }
        if let Some(sock) = &inner.sock {
            let _ = self.poller.delete(sock);
        }
        inner.close();
        drop(inner);
        self.writable.notify_all();
        debug!("[{}] context closed", self.name);
    }
}

impl Inner {
    fn close(&mut self) {
        self.state = ClientState::Closed;
        self.sock = None;
    }
}

impl Drop for ClientCtx {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Opens a non-blocking TCP connect; the poller reports writability once
/// the handshake resolves.
fn nonblocking_connect(addr: SocketAddrV4) -> TypedResult<TcpStream> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK,
        None,
    )
    .typ(SystemError::Init)?;

    match connect(fd, &SockaddrIn::from(addr)) {
        Ok(()) => {}
        Err(nix::errno::Errno::EINPROGRESS) => {}
        Err(e) => {
            let _ = nix::unistd::close(fd);
            return Err(e).context("starting connect").typ(SystemError::Init);
        }
    }

    // the fd is owned by the TcpStream from here on
    Ok(unsafe { TcpStream::from_raw_fd(fd) })
}

/// Resolves the outcome of a non-blocking connect from SO_ERROR.
fn socket_error(sock: &TcpStream) -> Result<(), String> {
    match getsockopt(sock.as_raw_fd(), sockopt::SocketError) {
        Ok(0) => Ok(()),
        Ok(errno) => Err(std::io::Error::from_raw_os_error(errno).to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn flush(inner: &mut Inner) -> std::io::Result<()> {
    let Inner { sock, out, .. } = inner;
    let Some(mut sock) = sock.as_ref() else {
        return Err(std::io::Error::from(ErrorKind::NotConnected));
    };
    while !out.is_empty() {
        match sock.write(out.filled()) {
            Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => out.consume(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn read_pending(inner: &mut Inner) -> Option<String> {
    let Inner { sock, inbuf, .. } = inner;
    let Some(mut sock) = sock.as_ref() else {
        return Some("not connected".to_owned());
    };
    loop {
        let tail = inbuf.tail_mut();
        if tail.is_empty() {
            return None; // buffer full; parse first
        }
        match sock.read(tail) {
            Ok(0) => return Some("peer closed the connection".to_owned()),
            Ok(n) => inbuf.grow(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Some(format!("read failed: {e}")),
        }
    }
}

/// Parses complete packets, handling keepalive internally and gating
/// non-handshake headers until the context is validated.
fn parse_inbound(name: &str, inner: &mut Inner, out: &mut Vec<ClientEvent>) {
    loop {
        let Some((raw_header, len)) = crate::codec::parse_packet(inner.inbuf.filled()) else {
            return;
        };
        let total = MIN_PACKET_LEN + len;

        match Header::from_u8(raw_header) {
            Some(Header::Ping) => {
                let _ = buffer_packet(&mut inner.out, Header::Pong, &[]);
                inner.inbuf.consume(total);
            }
            Some(Header::Pong) => {
                inner.inbuf.consume(total);
            }
            Some(header) => {
                if !inner.validated && !matches!(header, Header::Auth | Header::Ack) {
                    inner.inbuf.consume(total);
                    continue;
                }
                let payload = inner.inbuf.filled()[MIN_PACKET_LEN..total].to_vec();
                inner.inbuf.consume(total);
                let stop = !inner.validated;
                out.push(ClientEvent::Packet { header, payload });
                if stop {
                    // let the ACK handler validate before parsing further
                    return;
                }
            }
            None => {
                warn!("[{name}] server sent unknown header {raw_header}");
                inner.inbuf.consume(total);
            }
        }
    }
}
