//! Gossip-based membership.
//!
//! Each node keeps a map of peers keyed by `ip:port`. On every gossip
//! timer tick an idle peer gets a fresh client connection and walks the
//! handshake: AUTH → ACK → GOSSIP request → peer table response. Known
//! nodes from the response are imported, the connection is dropped and the
//! peer is marked available; failures mark it unavailable but keep it for
//! later retries.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::net::{ClientCtx, ClientEvent, NetArgs};
use crate::protocol::{self, Header, NodeIdentity};

/// Shard numbers are 1-based; 0 marks a peer whose number is still unknown.
pub const NODE_NUMBER_UNKNOWN: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    None,
    Handshaking,
    Acknowledged,
    Requesting,
    Done,
}

struct Peer {
    number: u16,
    ip: String,
    port: u16,
    stage: Stage,
    conn: Option<ClientCtx>,
    available: bool,
    last_seen: Option<Instant>,
}

pub struct Gossip {
    name: String,
    password: String,
    /// Identity presented to peers; `None` for nodes that only consume
    /// membership (the router).
    identity: Option<NodeIdentity>,
    peers: HashMap<String, Peer>,
}

fn peer_key(ip: &str, port: u16) -> String {
    format!("{ip}:{port}")
}

impl Gossip {
    pub fn new(
        name: &str,
        password: &str,
        identity: Option<NodeIdentity>,
        seeds: &[(String, u16)],
    ) -> Self {
        let mut gossip = Self {
            name: name.to_owned(),
            password: password.to_owned(),
            identity,
            peers: HashMap::new(),
        };
        for (ip, port) in seeds {
            gossip.add(ip, *port, NODE_NUMBER_UNKNOWN);
        }
        gossip
    }

    /// Registers a peer. Adding our own listening endpoint is a no-op.
    pub fn add(&mut self, ip: &str, port: u16, number: u16) {
        if let Some(me) = &self.identity {
            if me.ip == ip && me.port == port {
                return;
            }
        }
        let key = peer_key(ip, port);
        let peer = self.peers.entry(key).or_insert_with(|| Peer {
            number,
            ip: ip.to_owned(),
            port,
            stage: Stage::None,
            conn: None,
            // new peers are assumed available until a handshake says otherwise
            available: true,
            last_seen: None,
        });
        if peer.number == NODE_NUMBER_UNKNOWN {
            peer.number = number;
        }
    }

    /// Known peers with a resolved number, for feeding the shard pool and
    /// for answering GOSSIP requests.
    pub fn known_nodes(&self) -> Vec<NodeIdentity> {
        let mut nodes: Vec<NodeIdentity> = self
            .peers
            .values()
            .filter(|p| p.number != NODE_NUMBER_UNKNOWN && p.available)
            .map(|p| NodeIdentity {
                number: p.number,
                ip: p.ip.clone(),
                port: p.port,
            })
            .collect();
        if let Some(me) = &self.identity {
            if me.number != NODE_NUMBER_UNKNOWN {
                nodes.push(me.clone());
            }
        }
        nodes.sort_by_key(|n| n.number);
        nodes
    }

    /// Gossip timer tick: open a connection towards every idle peer.
    pub fn run(&mut self) {
        for (key, peer) in self.peers.iter_mut() {
            if peer.stage != Stage::None || peer.conn.is_some() {
                continue;
            }
            let args = NetArgs::new(&format!("gossip-{key}"), &peer.ip, peer.port);
            match ClientCtx::connect(&args) {
                Ok(conn) => {
                    peer.stage = Stage::Handshaking;
                    peer.conn = Some(conn);
                }
                Err(e) => {
                    debug!("[{}] gossip connect to {key} failed: {e}", self.name);
                    peer.available = false;
                }
            }
        }
    }

    /// Main-loop poll: advances every in-flight handshake. Returns peers
    /// newly imported from gossip responses.
    pub fn update(&mut self) -> Vec<NodeIdentity> {
        let mut imported = Vec::new();

        for peer in self.peers.values_mut() {
            let Some(conn) = peer.conn.as_ref() else { continue };

            let mut failed = false;
            let mut done = false;

            for event in conn.poll_events(Some(Duration::ZERO)) {
                match event {
                    ClientEvent::Connected => {
                        let payload = protocol::pack_auth(&self.password, self.identity.as_ref());
                        conn.send(Header::Auth, &payload);
                    }
                    ClientEvent::Packet {
                        header: Header::Ack,
                        ..
                    } => {
                        conn.validate();
                        peer.stage = Stage::Acknowledged;
                        conn.send(Header::ReqGossip, &protocol::pack_req_gossip());
                        peer.stage = Stage::Requesting;
                    }
                    ClientEvent::Packet {
                        header: Header::ResGossip,
                        payload,
                    } => {
                        for node in protocol::unpack_res_gossip(&payload) {
                            imported.push(node);
                        }
                        peer.stage = Stage::Done;
                        done = true;
                    }
                    ClientEvent::Packet { .. } => {}
                    ClientEvent::ConnectFailed { reason } | ClientEvent::Disconnected { reason } => {
                        debug!(
                            "[{}] gossip with {}:{} failed: {reason}",
                            self.name, peer.ip, peer.port
                        );
                        failed = true;
                    }
                }
                if failed || done {
                    break;
                }
            }

            if done {
                peer.available = true;
                peer.last_seen = Some(Instant::now());
                peer.stage = Stage::None;
                peer.conn = None; // drops and closes the connection
            } else if failed {
                peer.available = false;
                peer.stage = Stage::None;
                peer.conn = None;
            }
        }

        // fold imports back into the peer map
        for node in &imported {
            self.add(&node.ip, node.port, node.number);
        }

        imported
    }

    pub fn available_count(&self) -> usize {
        self.peers.values().filter(|p| p.available).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_are_registered_unknown() {
        let gossip = Gossip::new(
            "test",
            "pw",
            None,
            &[("127.0.0.1".to_owned(), 15001), ("127.0.0.1".to_owned(), 15002)],
        );
        assert_eq!(gossip.peers.len(), 2);
        assert!(gossip.known_nodes().is_empty());
    }

    #[test]
    fn add_resolves_unknown_numbers() {
        let mut gossip = Gossip::new("test", "pw", None, &[("127.0.0.1".to_owned(), 15001)]);
        gossip.add("127.0.0.1", 15001, 3);
        let nodes = gossip.known_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].number, 3);
    }

    #[test]
    fn own_endpoint_is_not_gossiped_to_itself() {
        let me = NodeIdentity {
            number: 1,
            ip: "127.0.0.1".to_owned(),
            port: 15001,
        };
        let mut gossip = Gossip::new("test", "pw", Some(me.clone()), &[]);
        gossip.add("127.0.0.1", 15001, 1);
        assert!(gossip.peers.is_empty());
        // but we do advertise ourselves
        assert_eq!(gossip.known_nodes(), vec![me]);
    }
}
