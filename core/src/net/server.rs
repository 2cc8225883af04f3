//! Server-side network context.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use polling::{Event, Poller};

use crate::codec::MIN_PACKET_LEN;
use crate::error::{ResultExt, SystemError, TypedResult};
use crate::halloc::{HandleAlloc, INVALID_HANDLE};
use crate::protocol::Header;

use super::{buffer_packet, NetArgs, PeerBuf, SendOutcome, INACTIVITY_TIMEOUT};

const LISTENER_KEY: usize = usize::MAX - 1;

/// Events surfaced to the owning node by [`ServerCtx::poll_events`].
#[derive(Debug)]
pub enum ServerEvent {
    Connected {
        client: u16,
        ip: String,
    },
    Disconnected {
        client: u16,
        reason: String,
    },
    /// A complete packet that passed the validation gate.
    Packet {
        client: u16,
        header: Header,
        payload: Vec<u8>,
    },
}

struct Peer {
    validated: bool,
    connected_at: Instant,
    last_packet_at: Instant,
    last_ping_at: Instant,
    ip: String,
    sock: TcpStream,
    inbuf: PeerBuf,
    out: PeerBuf,
}

struct Inner {
    listener: Option<TcpListener>,
    halloc: HandleAlloc,
    peers: Vec<Option<Peer>>,
    closing: bool,
}

/// A listening TCP context with per-client buffered packet IO.
///
/// The main thread drives it through [`ServerCtx::poll_events`]; worker
/// threads may call [`ServerCtx::send`] and [`ServerCtx::wait_outbound`]
/// concurrently.
pub struct ServerCtx {
    name: String,
    poller: Poller,
    validation_timeout: Duration,
    inner: Mutex<Inner>,
    writable: Condvar,
}

impl ServerCtx {
    pub fn listen(args: &NetArgs) -> TypedResult<Self> {
        let listener = TcpListener::bind((args.ip.as_str(), args.port))
            .with_context(|| format!("binding {}:{}", args.ip, args.port))
            .typ(SystemError::Init)?;
        listener.set_nonblocking(true).typ(SystemError::Init)?;

        let poller = Poller::new().typ(SystemError::Init)?;
        poller
            .add(&listener, Event::readable(LISTENER_KEY))
            .typ(SystemError::Init)?;

        info!("[{}] listening on {}:{}", args.name, args.ip, args.port);

        Ok(Self {
            name: args.name.clone(),
            poller,
            validation_timeout: args.validation_timeout,
            inner: Mutex::new(Inner {
                listener: Some(listener),
                halloc: HandleAlloc::new(args.max_clients),
                peers: (0..args.max_clients).map(|_| None).collect(),
                closing: false,
            }),
            writable: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Actual listening port (relevant when bound to port 0).
    pub fn local_port(&self) -> u16 {
        self.inner
            .lock()
            .unwrap()
            .listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
            .unwrap_or(0)
    }

    pub fn client_count(&self) -> u16 {
        self.inner.lock().unwrap().halloc.count()
    }

    pub fn client_ip(&self, client: u16) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.peer(client).map(|p| p.ip.clone())
    }

    /// Marks the peer as having completed the AUTH handshake.
    pub fn validate(&self, client: u16) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.peer_mut(client) {
            peer.validated = true;
        }
    }

    /// Serializes a packet into the peer's outbound buffer.
    pub fn send(&self, client: u16, header: Header, payload: &[u8]) -> SendOutcome {
        let mut inner = self.inner.lock().unwrap();
        if inner.closing {
            return SendOutcome::Disconnected;
        }
        let Some(peer) = inner.peer_mut(client) else {
            return SendOutcome::Disconnected;
        };

        if buffer_packet(&mut peer.out, header, payload) {
            return SendOutcome::Ok;
        }

        // no space: try to free some with an immediate flush, then retry
        match flush_peer(peer) {
            Ok(()) => {}
            Err(_) => return SendOutcome::Disconnected,
        }
        if buffer_packet(&mut peer.out, header, payload) {
            return SendOutcome::Ok;
        }

        // still saturated; ask the poller for writability and report back
        let key = client as usize;
        let _ = self.poller.modify(&peer.sock, Event::all(key));
        let _ = self.poller.notify();
        SendOutcome::BufferFull
    }

    /// Blocks until the peer's outbound buffer can take a maximum-size
    /// packet, or the peer goes away.
    pub fn wait_outbound(&self, client: u16, timeout: Option<Duration>) -> SendOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closing {
                return SendOutcome::Disconnected;
            }
            match inner.peer(client) {
                None => return SendOutcome::Disconnected,
                Some(peer) if peer.out.space() >= MIN_PACKET_LEN + crate::codec::MAX_PAYLOAD_LEN => {
                    return SendOutcome::Ok;
                }
                Some(_) => {}
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

    /// Drops a peer. No event is emitted for locally initiated disconnects.
    pub fn disconnect(&self, client: u16, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.remove_peer(&self.poller, client).is_some() {
            debug!("[{}] client #{client} disconnected: {reason}", self.name);
        }
        drop(inner);
        self.writable.notify_all();
    }

    /// Polls readiness, performs IO and returns the resulting events.
    pub fn poll_events(&self, timeout: Option<Duration>) -> Vec<ServerEvent> {
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
        if inner.closing {
            return out;
        }

        for ev in io_events {
            if ev.key == LISTENER_KEY {
                self.accept_pending(&mut inner, &mut out);
                if let Some(listener) = &inner.listener {
                    let _ = self.poller.modify(listener, Event::readable(LISTENER_KEY));
                }
            } else {
                self.service_peer(&mut inner, ev.key as u16, ev.readable, ev.writable, &mut out);
            }
        }

        // flush pending outbound data and rearm interest
        let handles: Vec<u16> = inner.halloc.iter().collect();
        for client in handles {
            let mut dead = false;
            if let Some(peer) = inner.peer_mut(client) {
                if !peer.out.is_empty() {
                    dead = flush_peer(peer).is_err();
                }
                if !dead {
                    let interest = if peer.out.is_empty() {
                        Event::readable(client as usize)
                    } else {
                        Event::all(client as usize)
                    };
                    let _ = self.poller.modify(&peer.sock, interest);
                }
            }
            if dead {
                inner.remove_peer(&self.poller, client);
                out.push(ServerEvent::Disconnected {
                    client,
                    reason: "send failed".to_owned(),
                });
            }
        }

        self.sweep_timeouts(&mut inner, &mut out);

        drop(inner);
        self.writable.notify_all();
        out
    }

    /// Flushes what it can, disconnects every peer and stops listening.
    /// Safe to call while workers are blocked in `wait_outbound`.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closing {
            return;
        }
        inner.closing = true;

        let handles: Vec<u16> = inner.halloc.iter().collect();
        for client in handles {
            if let Some(peer) = inner.peer_mut(client) {
                let _ = flush_peer(peer);
            }
            inner.remove_peer(&self.poller, client);
        }
        if let Some(listener) = inner.listener.take() {
            let _ = self.poller.delete(&listener);
        }
        drop(inner);
        self.writable.notify_all();
        info!("[{}] context closed", self.name);
    }

    fn accept_pending(&self, inner: &mut Inner, out: &mut Vec<ServerEvent>) {
        loop {
            let accepted = match inner.listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((sock, addr)) => {
                    let handle = inner.halloc.alloc();
                    if handle == INVALID_HANDLE {
                        warn!("[{}] rejecting {addr}: server is full", self.name);
                        continue; // socket dropped, connection closed
                    }
                    if sock.set_nonblocking(true).is_err() {
                        inner.halloc.free(handle);
                        continue;
                    }
                    if self
                        .poller
                        .add(&sock, Event::readable(handle as usize))
                        .is_err()
                    {
                        inner.halloc.free(handle);
                        continue;
                    }

                    let now = Instant::now();
                    let ip = addr.ip().to_string();
                    inner.peers[handle as usize] = Some(Peer {
                        validated: false,
                        connected_at: now,
                        last_packet_at: now,
                        last_ping_at: now,
                        ip: ip.clone(),
                        sock,
                        inbuf: PeerBuf::new(),
                        out: PeerBuf::new(),
                    });
                    debug!("[{}] client #{handle} connected from {ip}", self.name);
                    out.push(ServerEvent::Connected { client: handle, ip });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("[{}] accept failed: {e}", self.name);
                    return;
                }
            }
        }
    }

    fn service_peer(
        &self,
        inner: &mut Inner,
        client: u16,
        readable: bool,
        writable: bool,
        out: &mut Vec<ServerEvent>,
    ) {
        let Some(peer) = inner.peer_mut(client) else { return };

        let mut gone: Option<String> = None;

        if writable && !peer.out.is_empty() {
            if flush_peer(peer).is_err() {
                gone = Some("send failed".to_owned());
            }
        }

        if readable && gone.is_none() {
            loop {
                match peer.sock.read(peer.inbuf.tail_mut()) {
                    Ok(0) => {
                        gone = Some("peer closed the connection".to_owned());
                        break;
                    }
                    Ok(n) => {
                        peer.inbuf.grow(n);
                        peer.last_packet_at = Instant::now();
                        if peer.inbuf.space() == 0 {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        gone = Some(format!("read failed: {e}"));
                        break;
                    }
                }
            }
        }

        if gone.is_none() {
            parse_inbound(&self.name, client, peer, out);
        }

        if let Some(reason) = gone {
            inner.remove_peer(&self.poller, client);
            out.push(ServerEvent::Disconnected { client, reason });
        }
    }

    fn sweep_timeouts(&self, inner: &mut Inner, out: &mut Vec<ServerEvent>) {
        let now = Instant::now();
        let handles: Vec<u16> = inner.halloc.iter().collect();
        for client in handles {
            let reason = {
                let Some(peer) = inner.peer_mut(client) else { continue };

                if !peer.validated && now - peer.connected_at > self.validation_timeout {
                    Some("validation handshake timed-out")
                } else if now - peer.last_packet_at > INACTIVITY_TIMEOUT {
                    Some("inactivity timeout")
                } else {
                    // keepalive: ping peers quiet for half the window
                    if peer.validated
                        && now - peer.last_packet_at > INACTIVITY_TIMEOUT / 2
                        && now - peer.last_ping_at > INACTIVITY_TIMEOUT / 2
                    {
                        peer.last_ping_at = now;
                        let _ = buffer_packet(&mut peer.out, Header::Ping, &[]);
                    }
                    None
                }
            };

            if let Some(reason) = reason {
                inner.remove_peer(&self.poller, client);
                out.push(ServerEvent::Disconnected {
                    client,
                    reason: reason.to_owned(),
                });
            }
        }
    }
}

impl Inner {
    fn peer(&self, client: u16) -> Option<&Peer> {
        if !self.halloc.is_valid(client) {
            return None;
        }
        self.peers[client as usize].as_ref()
    }

    fn peer_mut(&mut self, client: u16) -> Option<&mut Peer> {
        if !self.halloc.is_valid(client) {
            return None;
        }
        self.peers[client as usize].as_mut()
    }

    fn remove_peer(&mut self, poller: &Poller, client: u16) -> Option<Peer> {
        if !self.halloc.is_valid(client) {
            return None;
        }
        let peer = self.peers[client as usize].take();
        if let Some(peer) = &peer {
            let _ = poller.delete(&peer.sock);
        }
        self.halloc.free(client);
        peer
    }
}

impl Drop for ServerCtx {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Writes as much buffered outbound data as the socket accepts.
fn flush_peer(peer: &mut Peer) -> std::io::Result<()> {
    while !peer.out.is_empty() {
        match peer.sock.write(peer.out.filled()) {
            Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => peer.out.consume(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    let _ = peer.sock.flush();
    Ok(())
}

/// Parses complete packets off a peer's inbound buffer, applying the
/// validation gate and the keepalive protocol.
fn parse_inbound(name: &str, client: u16, peer: &mut Peer, out: &mut Vec<ServerEvent>) {
    loop {
        let Some((raw_header, len)) = crate::codec::parse_packet(peer.inbuf.filled()) else {
            return;
        };
        let total = MIN_PACKET_LEN + len;

        let header = Header::from_u8(raw_header);
        match header {
            Some(Header::Ping) => {
                let _ = buffer_packet(&mut peer.out, Header::Pong, &[]);
                peer.inbuf.consume(total);
            }
            Some(Header::Pong) => {
                peer.inbuf.consume(total);
            }
            Some(header) => {
                if !peer.validated && !matches!(header, Header::Auth | Header::Ack) {
                    // unvalidated peers only get AUTH/ACK through
                    peer.inbuf.consume(total);
                    continue;
                }
                let payload = peer.inbuf.filled()[MIN_PACKET_LEN..total].to_vec();
                peer.inbuf.consume(total);
                let stop = !peer.validated;
                out.push(ServerEvent::Packet {
                    client,
                    header,
                    payload,
                });
                if stop {
                    // let the AUTH handler validate before parsing further
                    return;
                }
            }
            None => {
                warn!("[{name}] client #{client} sent unknown header {raw_header}");
                peer.inbuf.consume(total);
            }
        }
    }
}
