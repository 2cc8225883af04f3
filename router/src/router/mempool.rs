//! The router's pool of shard nodes.
//!
//! Every shard node the router learns about (from gossip or config seeds)
//! gets a client connection here. Nodes are assigned to consistency
//! classes; queries select a node according to the table's class: Strong
//! uses the single assigned node, StrongHashed shards by key, Eventual and
//! the routing-only None class rotate round-robin.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use stratakv_core::error::TypedResult;
use stratakv_core::net::{ClientCtx, ClientEvent, NetArgs, SendOutcome};
use stratakv_core::protocol::{self, Header};
use stratakv_core::table::{Consistency, TableMeta};
use stratakv_core::typed_err;

pub const MAX_SHARD_NODES: u16 = 100;

/// What a query needs from the pool.
#[derive(Debug, Clone)]
pub enum Selection {
    /// CREATE: the class comes from the statement itself.
    Create(Consistency),
    /// DESCRIBE: any node will do.
    Describe,
    /// SELECT/INSERT/DROP: the class comes from the cached table metadata.
    ByTable { table: String, key: u16 },
}

pub struct ShardNode {
    pub number: u16,
    pub ip: String,
    pub port: u16,
    /// Read-locked for sends; write-locked to tear the connection down.
    conn: RwLock<Option<Arc<ClientCtx>>>,
    state: Mutex<NodeState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Handshaking,
    Available,
    Gone,
}

impl ShardNode {
    pub fn is_available(&self) -> bool {
        *self.state.lock().unwrap() == NodeState::Available
    }
}

pub struct Mempool {
    password: String,
    connect_timeout: Duration,
    nodes: Mutex<HashMap<u16, Arc<ShardNode>>>,
    /// Assigned node numbers per consistency class, index per
    /// [`Consistency::index`].
    criteria: [Mutex<VecDeque<u16>>; Consistency::COUNT],
    /// table name → consistency, refreshed from DESCRIBE.
    tables: Mutex<HashMap<String, Consistency>>,
}

impl Mempool {
    pub fn new(password: &str, connect_timeout: Duration) -> Self {
        Self {
            password: password.to_owned(),
            connect_timeout,
            nodes: Mutex::new(HashMap::new()),
            criteria: Default::default(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a shard node and starts connecting to it. Repeated adds
    /// of a connected node are no-ops.
    pub fn add(&self, number: u16, ip: &str, port: u16) {
        if number == 0 || number >= MAX_SHARD_NODES {
            warn!("ignoring shard node #{number} (outside the supported range)");
            return;
        }

        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.entry(number).or_insert_with(|| {
            Arc::new(ShardNode {
                number,
                ip: ip.to_owned(),
                port,
                conn: RwLock::new(None),
                state: Mutex::new(NodeState::Gone),
            })
        });

        let mut conn = node.conn.write().unwrap();
        if conn.is_none() {
            let args = NetArgs::new(&format!("shard-{number}"), &node.ip, node.port);
            match ClientCtx::connect(&args) {
                Ok(ctx) => {
                    *conn = Some(Arc::new(ctx));
                    *node.state.lock().unwrap() = NodeState::Handshaking;
                }
                Err(e) => debug!("shard node #{number} connect failed: {e}"),
            }
        }
    }

    pub fn node(&self, number: u16) -> Option<Arc<ShardNode>> {
        self.nodes.lock().unwrap().get(&number).cloned()
    }

    pub fn numbers(&self) -> Vec<u16> {
        let mut numbers: Vec<u16> = self.nodes.lock().unwrap().keys().copied().collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn connected_numbers(&self) -> Vec<u16> {
        let nodes = self.nodes.lock().unwrap();
        let mut numbers: Vec<u16> = nodes
            .values()
            .filter(|n| n.is_available())
            .map(|n| n.number)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    /// Replaces the cached table → consistency map.
    pub fn feed_tables(&self, metas: &[TableMeta]) {
        let mut tables = self.tables.lock().unwrap();
        tables.clear();
        for meta in metas {
            tables.insert(meta.name.clone(), meta.consistency);
        }
    }

    pub fn table_consistency(&self, table: &str) -> Option<Consistency> {
        self.tables.lock().unwrap().get(table).copied()
    }

    /// Assigns a shard node to a consistency class.
    pub fn assign(&self, number: u16, consistency: Consistency) -> TypedResult<()> {
        let node = self
            .node(number)
            .ok_or_else(|| typed_err!(Generic, "Shard node #{number} is unknown."))?;
        if !node.is_available() {
            return Err(typed_err!(Generic, "Shard node #{number} is not connected."));
        }

        // one critical section for the membership checks and the push, so
        // concurrent assigns cannot both pass the Strong exclusivity check
        let journal_targets = {
            let mut list = self.criteria[consistency.index()].lock().unwrap();
            if list.contains(&number) {
                return Err(typed_err!(
                    Generic,
                    "Shard node #{number} is already assigned to {consistency} consistency."
                ));
            }
            if consistency == Consistency::Strong {
                if let Some(&current) = list.front() {
                    return Err(typed_err!(
                        Generic,
                        "{consistency} consistency already has shard node #{current} assigned."
                    ));
                }
            }

            let previously_assigned: Vec<u16> = if consistency == Consistency::StrongHashed {
                list.iter().copied().collect()
            } else {
                Vec::new()
            };
            list.push_front(number);
            previously_assigned
        };

        // ask every already-assigned node to journal so consumers of the
        // new shard observe a coherent starting point; sending outside the
        // list lock because a dead peer unassigns itself
        for peer in journal_targets {
            match self.send(peer, Header::ReqJournal, &[]) {
                SendOutcome::Ok => {}
                outcome => warn!("journal request to shard node #{peer} failed: {outcome:?}"),
            }
        }

        info!("shard node #{number} assigned to {consistency} consistency");
        Ok(())
    }

    /// Picks a node for a query.
    pub fn get(&self, selection: &Selection) -> TypedResult<u16> {
        let (consistency, key) = match selection {
            Selection::Create(consistency) => (*consistency, 0),
            Selection::Describe => (Consistency::None, 0),
            Selection::ByTable { table, key } => {
                let consistency = self.table_consistency(table).ok_or_else(|| {
                    typed_err!(Generic, "Table '{table}' does not exist.")
                })?;
                (consistency, *key)
            }
        };

        let mut list = self.criteria[consistency.index()].lock().unwrap();
        let chosen = match consistency {
            Consistency::Strong => list.front().copied(),
            Consistency::StrongHashed => {
                if list.is_empty() {
                    None
                } else {
                    list.get(key as usize % list.len()).copied()
                }
            }
            Consistency::Eventual | Consistency::None => {
                // rotate for round-robin
                list.pop_front().map(|number| {
                    list.push_back(number);
                    number
                })
            }
        };

        chosen.ok_or_else(|| {
            typed_err!(Generic, "There are no shard nodes satisfying {consistency} consistency.")
        })
    }

    /// Sends a packet to a node. A live connection observed dead is torn
    /// down and the node unassigned, so the next selection skips it; a
    /// node with no connection just reports `Disconnected`.
    pub fn send(&self, number: u16, header: Header, payload: &[u8]) -> SendOutcome {
        let Some(node) = self.node(number) else {
            return SendOutcome::Disconnected;
        };
        let outcome = {
            let conn = node.conn.read().unwrap();
            conn.as_ref().map(|ctx| ctx.send(header, payload))
        };
        match outcome {
            Some(SendOutcome::Disconnected) => {
                self.on_disconnect(number);
                SendOutcome::Disconnected
            }
            Some(outcome) => outcome,
            None => SendOutcome::Disconnected,
        }
    }

    /// Blocks until the node's outbound buffer has room again.
    pub fn wait_outbound(&self, number: u16) -> SendOutcome {
        let Some(node) = self.node(number) else {
            return SendOutcome::Disconnected;
        };
        let ctx = {
            let conn = node.conn.read().unwrap();
            conn.as_ref().cloned()
        };
        match ctx {
            Some(ctx) => ctx.wait_outbound(None),
            None => SendOutcome::Disconnected,
        }
    }

    /// Polls every node connection; returns the per-node events.
    pub fn poll(&self) -> Vec<(u16, ClientEvent)> {
        let nodes: Vec<Arc<ShardNode>> = self.nodes.lock().unwrap().values().cloned().collect();
        let mut out = Vec::new();
        for node in nodes {
            let ctx = {
                let conn = node.conn.read().unwrap();
                conn.as_ref().cloned()
            };
            let Some(ctx) = ctx else { continue };
            for event in ctx.poll_events(Some(Duration::ZERO)) {
                out.push((node.number, event));
            }
        }
        out
    }

    /// Marks the handshake started on connect established.
    pub fn on_connected(&self, number: u16) {
        if let Some(node) = self.node(number) {
            let conn = node.conn.read().unwrap();
            if let Some(ctx) = conn.as_ref() {
                ctx.send(Header::Auth, &protocol::pack_auth(&self.password, None));
            }
        }
    }

    pub fn on_acknowledged(&self, number: u16) {
        if let Some(node) = self.node(number) {
            let conn = node.conn.read().unwrap();
            if let Some(ctx) = conn.as_ref() {
                ctx.validate();
            }
            *node.state.lock().unwrap() = NodeState::Available;
            info!("shard node #{number} joined the pool");
        }
    }

    /// Removes a dead node from every consistency class and drops its
    /// connection. The caller wakes tasks awaiting replies from it.
    pub fn on_disconnect(&self, number: u16) {
        let Some(node) = self.node(number) else { return };

        let was_available = {
            let mut state = node.state.lock().unwrap();
            let was = *state == NodeState::Available;
            *state = NodeState::Gone;
            was
        };

        for criteria in &self.criteria {
            let mut list = criteria.lock().unwrap();
            if let Some(pos) = list.iter().position(|&n| n == number) {
                list.remove(pos);
            }
        }

        let mut conn = node.conn.write().unwrap();
        if let Some(ctx) = conn.take() {
            ctx.destroy();
        }

        if was_available {
            info!("shard node #{number} ({}:{}) left the pool", node.ip, node.port);
        }
    }

    pub fn disconnect_all(&self) {
        for number in self.numbers() {
            self.on_disconnect(number);
        }
    }

    /// Timeout for blocking waits against this pool's nodes.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Mempool {
        Mempool::new("a-long-enough-password", Duration::from_secs(1))
    }

    /// Registers a node without a live connection and forces it available.
    fn add_fake(pool: &Mempool, number: u16) {
        pool.nodes.lock().unwrap().insert(
            number,
            Arc::new(ShardNode {
                number,
                ip: "127.0.0.1".into(),
                port: 15000 + number,
                conn: RwLock::new(None),
                state: Mutex::new(NodeState::Available),
            }),
        );
    }

    #[test]
    fn strong_allows_a_single_assignment() {
        let pool = pool();
        add_fake(&pool, 1);
        add_fake(&pool, 2);
        pool.assign(1, Consistency::Strong).unwrap();
        let err = pool.assign(2, Consistency::Strong).unwrap_err();
        assert!(err.description().contains("already has"));
    }

    #[test]
    fn duplicate_assignment_fails() {
        let pool = pool();
        add_fake(&pool, 1);
        pool.assign(1, Consistency::Eventual).unwrap();
        assert!(pool.assign(1, Consistency::Eventual).is_err());
        // the same node may join several classes
        pool.assign(1, Consistency::None).unwrap();
    }

    #[test]
    fn eventual_rotates_round_robin() {
        let pool = pool();
        add_fake(&pool, 1);
        add_fake(&pool, 2);
        pool.assign(1, Consistency::Eventual).unwrap();
        pool.assign(2, Consistency::Eventual).unwrap();
        pool.feed_tables(&[TableMeta::new("T", Consistency::Eventual, 4, 60_000)]);

        let selection = Selection::ByTable {
            table: "T".into(),
            key: 0,
        };
        let a = pool.get(&selection).unwrap();
        let b = pool.get(&selection).unwrap();
        let c = pool.get(&selection).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn strong_hashed_shards_by_key() {
        let pool = pool();
        add_fake(&pool, 1);
        add_fake(&pool, 2);
        pool.assign(1, Consistency::StrongHashed).unwrap();
        pool.assign(2, Consistency::StrongHashed).unwrap();
        pool.feed_tables(&[TableMeta::new("T", Consistency::StrongHashed, 4, 60_000)]);

        let pick = |key: u16| {
            pool.get(&Selection::ByTable {
                table: "T".into(),
                key,
            })
            .unwrap()
        };
        // the same key always lands on the same node
        assert_eq!(pick(0), pick(2));
        assert_eq!(pick(1), pick(3));
        assert_ne!(pick(0), pick(1));
    }

    #[test]
    fn unknown_table_is_a_domain_error() {
        let pool = pool();
        let err = pool
            .get(&Selection::ByTable {
                table: "NOPE".into(),
                key: 0,
            })
            .unwrap_err();
        assert!(err.description().contains("does not exist"));
    }

    #[test]
    fn empty_criteria_reports_no_nodes() {
        let pool = pool();
        assert!(pool.get(&Selection::Describe).is_err());
        assert!(pool.get(&Selection::Create(Consistency::Eventual)).is_err());
    }

    #[test]
    fn disconnect_unassigns_everywhere() {
        let pool = pool();
        add_fake(&pool, 1);
        pool.assign(1, Consistency::Eventual).unwrap();
        pool.assign(1, Consistency::None).unwrap();

        pool.on_disconnect(1);
        assert!(pool.get(&Selection::Describe).is_err());
        assert!(pool.get(&Selection::Create(Consistency::Eventual)).is_err());
        // the node record survives for future reconnects
        assert!(pool.node(1).is_some());
        assert!(!pool.node(1).unwrap().is_available());
    }

    #[test]
    fn describe_uses_the_none_class() {
        let pool = pool();
        add_fake(&pool, 3);
        pool.assign(3, Consistency::None).unwrap();
        assert_eq!(pool.get(&Selection::Describe).unwrap(), 3);
    }
}
