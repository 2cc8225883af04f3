//! TCP network contexts with per-peer buffered packet IO.
//!
//! Two context flavours share the framing, validation and keepalive rules:
//! a [`server::ServerCtx`] accepting up to a fixed number of peers, and a
//! [`client::ClientCtx`] holding one outbound connection. Both are polled
//! from the owning node's main loop and deliver parsed packets as events;
//! `send` may be called concurrently from worker threads.

pub mod client;
pub mod server;

pub use client::{ClientCtx, ClientEvent};
pub use server::{ServerCtx, ServerEvent};

use std::time::Duration;

use crate::codec::{MAX_PACKET_LEN, MIN_PACKET_LEN};
use crate::protocol::Header;

/// Capacity of each peer's inbound and outbound buffer.
pub const NET_BUF_LEN: usize = 2 * MAX_PACKET_LEN;

/// Peers idle longer than this are disconnected by the server.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum grace period for the AUTH handshake.
pub const VALIDATION_TIMEOUT_MIN: Duration = Duration::from_secs(5);

/// Outcome of a buffered send.
///
/// Network failure is an explicit variant; callers must match on it rather
/// than folding it into a boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Ok,
    /// The outbound buffer lacks space; retry after `wait_outbound`.
    BufferFull,
    /// The peer is gone (or was never connected).
    Disconnected,
}

/// Construction arguments shared by both context flavours.
#[derive(Debug, Clone)]
pub struct NetArgs {
    /// Descriptive context name used in log lines.
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub validation_timeout: Duration,
    /// Server contexts only: maximum concurrently connected peers.
    pub max_clients: u16,
    /// Client contexts only: wait for the connection to be established
    /// before returning, up to `connect_timeout`.
    pub connect_blocking: bool,
    pub connect_timeout: Duration,
}

impl NetArgs {
    pub fn new(name: &str, ip: &str, port: u16) -> Self {
        Self {
            name: name.to_owned(),
            ip: ip.to_owned(),
            port,
            validation_timeout: VALIDATION_TIMEOUT_MIN,
            max_clients: 16,
            connect_blocking: false,
            connect_timeout: Duration::from_millis(3000),
        }
    }

    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout.max(VALIDATION_TIMEOUT_MIN);
        self
    }

    pub fn max_clients(mut self, max: u16) -> Self {
        self.max_clients = max;
        self
    }

    pub fn connect_blocking(mut self, timeout: Duration) -> Self {
        self.connect_blocking = true;
        self.connect_timeout = timeout;
        self
    }
}

/// Fixed-capacity byte ring used for both directions of a peer.
///
/// The write side appends at the tail; the consumer drains from the head
/// and shifts the remainder down, which keeps parsed packets contiguous.
pub(crate) struct PeerBuf {
    data: Box<[u8; NET_BUF_LEN]>,
    len: usize,
}

impl PeerBuf {
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; NET_BUF_LEN]),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn space(&self) -> usize {
        NET_BUF_LEN - self.len
    }

    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Tail region available for appending.
    pub fn tail_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.data[len..]
    }

    pub fn grow(&mut self, added: usize) {
        assert!(self.len + added <= NET_BUF_LEN, "peer buffer overflow");
        self.len += added;
    }

    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.space() {
            return false;
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        true
    }

    /// Removes `count` bytes from the head, shifting the tail down.
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len, "consuming past the buffered data");
        self.data.copy_within(count..self.len, 0);
        self.len -= count;
    }
}

/// Appends a framed packet (`header | len | payload`) to an outbound buffer.
pub(crate) fn buffer_packet(out: &mut PeerBuf, header: Header, payload: &[u8]) -> bool {
    assert!(
        MIN_PACKET_LEN + payload.len() <= MAX_PACKET_LEN,
        "payload exceeds the maximum packet length"
    );
    if out.space() < MIN_PACKET_LEN + payload.len() {
        return false;
    }
    let frame = [header as u8, payload.len() as u8, (payload.len() >> 8) as u8];
    out.append(&frame);
    out.append(payload);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn peer_buf_append_consume() {
        let mut buf = PeerBuf::new();
        assert!(buf.append(b"hello"));
        assert!(buf.append(b" world"));
        assert_eq!(buf.filled(), b"hello world");
        buf.consume(6);
        assert_eq!(buf.filled(), b"world");
        buf.consume(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn peer_buf_rejects_overflow() {
        let mut buf = PeerBuf::new();
        let chunk = vec![0u8; NET_BUF_LEN];
        assert!(buf.append(&chunk));
        assert!(!buf.append(b"x"));
    }

    #[test]
    fn buffer_packet_frames_little_endian_length() {
        let mut buf = PeerBuf::new();
        assert!(buffer_packet(&mut buf, Header::Auth, b"pw"));
        assert_eq!(buf.filled(), &[Header::Auth as u8, 2, 0, b'p', b'w']);
    }

    struct Loopback {
        server: ServerCtx,
        client: ClientCtx,
        server_events: Vec<ServerEvent>,
        client_events: Vec<ClientEvent>,
    }

    impl Loopback {
        fn new() -> Self {
            let server = ServerCtx::listen(&NetArgs::new("sv", "127.0.0.1", 0)).unwrap();
            let client = ClientCtx::connect(
                &NetArgs::new("cl", "127.0.0.1", server.local_port())
                    .connect_blocking(Duration::from_secs(2)),
            )
            .unwrap();
            Self {
                server,
                client,
                server_events: Vec::new(),
                client_events: Vec::new(),
            }
        }

        /// Drives both contexts until `done` or a deadline.
        fn pump(&mut self, mut done: impl FnMut(&Self) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(3);
            while !done(self) {
                assert!(Instant::now() < deadline, "loopback pump timed out");
                let events = self.server.poll_events(Some(Duration::from_millis(5)));
                self.server_events.extend(events);
                let events = self.client.poll_events(Some(Duration::from_millis(5)));
                self.client_events.extend(events);
            }
        }

        fn server_packets(&self) -> Vec<(u16, Header, Vec<u8>)> {
            self.server_events
                .iter()
                .filter_map(|ev| match ev {
                    ServerEvent::Packet {
                        client,
                        header,
                        payload,
                    } => Some((*client, *header, payload.clone())),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn loopback_validation_gate_and_round_trip() {
        let mut link = Loopback::new();

        // pre-AUTH traffic is silently dropped by the gate
        assert_eq!(link.client.send(Header::ReqInsert, b"early"), SendOutcome::Ok);
        assert_eq!(link.client.send(Header::Auth, b"secret"), SendOutcome::Ok);
        link.pump(|l| !l.server_packets().is_empty());

        let packets = link.server_packets();
        assert_eq!(packets.len(), 1);
        let (peer, header, payload) = packets[0].clone();
        assert_eq!(header, Header::Auth);
        assert_eq!(payload, b"secret");

        // the server validates and acknowledges
        link.server.validate(peer);
        assert_eq!(link.server.send(peer, Header::Ack, &[42]), SendOutcome::Ok);
        link.pump(|l| {
            l.client_events
                .iter()
                .any(|ev| matches!(ev, ClientEvent::Packet { header: Header::Ack, .. }))
        });
        link.client.validate();

        // validated traffic flows both ways
        assert_eq!(link.client.send(Header::ReqSelect, b"payload"), SendOutcome::Ok);
        link.pump(|l| l.server_packets().len() >= 2);
        let (_, header, payload) = link.server_packets()[1].clone();
        assert_eq!(header, Header::ReqSelect);
        assert_eq!(payload, b"payload");

        assert_eq!(link.server.send(peer, Header::ResSelect, b"reply"), SendOutcome::Ok);
        link.pump(|l| {
            l.client_events.iter().any(|ev| {
                matches!(ev, ClientEvent::Packet { header: Header::ResSelect, payload } if payload == b"reply")
            })
        });
    }

    #[test]
    fn loopback_disconnect_is_observed() {
        let mut link = Loopback::new();
        assert_eq!(link.client.send(Header::Auth, b"pw"), SendOutcome::Ok);
        link.pump(|l| !l.server_packets().is_empty());

        link.client.destroy();
        link.pump(|l| {
            l.server_events
                .iter()
                .any(|ev| matches!(ev, ServerEvent::Disconnected { .. }))
        });

        assert_eq!(link.server.client_count(), 0);
        assert_eq!(link.client.send(Header::ReqSelect, b"x"), SendOutcome::Disconnected);
    }

    #[test]
    fn server_rejects_clients_beyond_capacity() {
        let server = ServerCtx::listen(
            &NetArgs::new("tiny", "127.0.0.1", 0).max_clients(1),
        )
        .unwrap();
        let port = server.local_port();

        let _first = ClientCtx::connect(
            &NetArgs::new("c1", "127.0.0.1", port).connect_blocking(Duration::from_secs(2)),
        )
        .unwrap();
        let second = ClientCtx::connect(
            &NetArgs::new("c2", "127.0.0.1", port).connect_blocking(Duration::from_secs(2)),
        )
        .unwrap();

        // the server accepts the first and drops the surplus connection
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut rejected = false;
        while !rejected {
            assert!(Instant::now() < deadline, "surplus client was never rejected");
            server.poll_events(Some(Duration::from_millis(5)));
            rejected = second
                .poll_events(Some(Duration::from_millis(5)))
                .iter()
                .any(|ev| matches!(ev, ClientEvent::Disconnected { .. }));
        }
        assert_eq!(server.client_count(), 1);
    }
}
