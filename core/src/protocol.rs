//! Wire protocol: request/response payload packing and unpacking.
//!
//! Every request begins with a `remote_id` so the response can be matched
//! back to the originating task. Every response begins with the `remote_id`
//! followed by a status (`code: u32`, plus a description string iff the
//! code is non-zero). DESCRIBE-all responses are chunked: the first chunk
//! carries the total table count and the receiver reassembles until no
//! tables remain.

use crate::codec;
use crate::codec::MAX_PAYLOAD_LEN;
use crate::error::{SystemError, TypedError};
use crate::table::{Consistency, Record, TableMeta};

/// Packet headers. `Ping`/`Pong` are reserved for the keepalive layer and
/// never reach user handlers; `Auth`/`Ack` are the only headers admitted
/// before a peer passes validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Header {
    Ping = 0,
    Pong = 1,
    Auth = 2,
    Ack = 3,
    ReqCreate = 4,
    ReqDrop = 5,
    ReqDescribe = 6,
    ReqSelect = 7,
    ReqInsert = 8,
    ReqJournal = 9,
    ReqGossip = 10,
    ResCreate = 11,
    ResDrop = 12,
    ResDescribe = 13,
    ResSelect = 14,
    ResInsert = 15,
    ResGossip = 16,
}

impl Header {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Header::Ping),
            1 => Some(Header::Pong),
            2 => Some(Header::Auth),
            3 => Some(Header::Ack),
            4 => Some(Header::ReqCreate),
            5 => Some(Header::ReqDrop),
            6 => Some(Header::ReqDescribe),
            7 => Some(Header::ReqSelect),
            8 => Some(Header::ReqInsert),
            9 => Some(Header::ReqJournal),
            10 => Some(Header::ReqGossip),
            11 => Some(Header::ResCreate),
            12 => Some(Header::ResDrop),
            13 => Some(Header::ResDescribe),
            14 => Some(Header::ResSelect),
            15 => Some(Header::ResInsert),
            16 => Some(Header::ResGossip),
            _ => None,
        }
    }
}

/// Status carried by every response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    Err { kind: SystemError, description: String },
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    pub fn from_result<T>(result: &Result<T, TypedError>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => Status::Err {
                kind: e.err(),
                description: e.description(),
            },
        }
    }

    pub fn into_result(self) -> Result<(), TypedError> {
        match self {
            Status::Ok => Ok(()),
            Status::Err { kind, description } => {
                Err(TypedError::new(kind, anyhow::anyhow!("{description}")))
            }
        }
    }
}

fn write_status(buf: &mut [u8], pos: &mut usize, status: &Status) {
    match status {
        Status::Ok => codec::write_u32(buf, pos, 0),
        Status::Err { kind, description } => {
            codec::write_u32(buf, pos, kind.code());
            codec::write_str(buf, pos, description);
        }
    }
}

fn read_status(buf: &[u8], pos: &mut usize) -> Status {
    let code = codec::read_u32(buf, pos);
    if code == 0 {
        Status::Ok
    } else {
        Status::Err {
            kind: SystemError::from_code(code),
            description: codec::read_str(buf, pos),
        }
    }
}

// ---------------------------------------------------------------------------
// auth / ack

/// Identity a node presents when authenticating against a peer node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub number: u16,
    pub ip: String,
    pub port: u16,
}

pub fn pack_auth(password: &str, identity: Option<&NodeIdentity>) -> Vec<u8> {
    let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
    let mut pos = 0;
    codec::write_str(&mut buf, &mut pos, password);
    match identity {
        Some(id) => {
            codec::write_bool(&mut buf, &mut pos, true);
            codec::write_u16(&mut buf, &mut pos, id.number);
            codec::write_str(&mut buf, &mut pos, &id.ip);
            codec::write_u16(&mut buf, &mut pos, id.port);
        }
        None => codec::write_bool(&mut buf, &mut pos, false),
    }
    buf.truncate(pos);
    buf
}

pub fn unpack_auth(payload: &[u8]) -> (String, Option<NodeIdentity>) {
    let mut pos = 0;
    let password = codec::read_str(payload, &mut pos);
    let identity = codec::read_bool(payload, &mut pos).then(|| NodeIdentity {
        number: codec::read_u16(payload, &mut pos),
        ip: codec::read_str(payload, &mut pos),
        port: codec::read_u16(payload, &mut pos),
    });
    (password, identity)
}

/// ACK carries the negotiated maximum value size.
pub fn pack_ack(value_size: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 2];
    let mut pos = 0;
    codec::write_u16(&mut buf, &mut pos, value_size);
    buf
}

pub fn unpack_ack(payload: &[u8]) -> u16 {
    let mut pos = 0;
    codec::read_u16(payload, &mut pos)
}

// ---------------------------------------------------------------------------
// requests

pub fn pack_req_create(remote_id: u16, meta: &TableMeta) -> Vec<u8> {
    let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
    let mut pos = 0;
    codec::write_u16(&mut buf, &mut pos, remote_id);
    codec::write_str(&mut buf, &mut pos, &meta.name);
    codec::write_u8(&mut buf, &mut pos, meta.consistency.index() as u8);
    codec::write_u16(&mut buf, &mut pos, meta.partitions);
    codec::write_u32(&mut buf, &mut pos, meta.compaction_interval_ms);
    buf.truncate(pos);
    buf
}

pub fn unpack_req_create(payload: &[u8]) -> (u16, TableMeta) {
    let mut pos = 0;
    let remote_id = codec::read_u16(payload, &mut pos);
    let name = codec::read_str(payload, &mut pos);
    let consistency =
        Consistency::from_index(codec::read_u8(payload, &mut pos)).unwrap_or(Consistency::None);
    let partitions = codec::read_u16(payload, &mut pos);
    let interval = codec::read_u32(payload, &mut pos);
    (remote_id, TableMeta::new(name, consistency, partitions, interval))
}

pub fn pack_req_drop(remote_id: u16, table: &str) -> Vec<u8> {
    let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
    let mut pos = 0;
    codec::write_u16(&mut buf, &mut pos, remote_id);
    codec::write_str(&mut buf, &mut pos, table);
    buf.truncate(pos);
    buf
}

pub fn unpack_req_drop(payload: &[u8]) -> (u16, String) {
    let mut pos = 0;
    let remote_id = codec::read_u16(payload, &mut pos);
    (remote_id, codec::read_str(payload, &mut pos))
}

/// An empty table name describes every table.
pub fn pack_req_describe(remote_id: u16, table: Option<&str>) -> Vec<u8> {
    let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
    let mut pos = 0;
    codec::write_u16(&mut buf, &mut pos, remote_id);
    codec::write_str(&mut buf, &mut pos, table.unwrap_or(""));
    buf.truncate(pos);
    buf
}

pub fn unpack_req_describe(payload: &[u8]) -> (u16, Option<String>) {
    let mut pos = 0;
    let remote_id = codec::read_u16(payload, &mut pos);
    let name = codec::read_str(payload, &mut pos);
    (remote_id, (!name.is_empty()).then_some(name))
}

pub fn pack_req_select(remote_id: u16, table: &str, key: u16) -> Vec<u8> {
    let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
    let mut pos = 0;
    codec::write_u16(&mut buf, &mut pos, remote_id);
    codec::write_str(&mut buf, &mut pos, table);
    codec::write_u16(&mut buf, &mut pos, key);
    buf.truncate(pos);
    buf
}

pub fn unpack_req_select(payload: &[u8]) -> (u16, String, u16) {
    let mut pos = 0;
    let remote_id = codec::read_u16(payload, &mut pos);
    let table = codec::read_str(payload, &mut pos);
    let key = codec::read_u16(payload, &mut pos);
    (remote_id, table, key)
}

pub fn pack_req_insert(remote_id: u16, table: &str, record: &Record) -> Vec<u8> {
    let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
    let mut pos = 0;
    codec::write_u16(&mut buf, &mut pos, remote_id);
    codec::write_str(&mut buf, &mut pos, table);
    codec::write_u16(&mut buf, &mut pos, record.key);
    codec::write_str(&mut buf, &mut pos, &record.value);
    codec::write_u64(&mut buf, &mut pos, record.timestamp);
    buf.truncate(pos);
    buf
}

pub fn unpack_req_insert(payload: &[u8]) -> (u16, String, Record) {
    let mut pos = 0;
    let remote_id = codec::read_u16(payload, &mut pos);
    let table = codec::read_str(payload, &mut pos);
    let key = codec::read_u16(payload, &mut pos);
    let value = codec::read_str(payload, &mut pos);
    let timestamp = codec::read_u64(payload, &mut pos);
    (remote_id, table, Record::new(key, value, timestamp))
}

// ---------------------------------------------------------------------------
// responses

/// Packs the generic response (`remote_id`, status) shared by
/// CREATE/DROP/INSERT and the error path of SELECT.
pub fn pack_res_generic(remote_id: u16, status: &Status) -> Vec<u8> {
    let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
    let mut pos = 0;
    codec::write_u16(&mut buf, &mut pos, remote_id);
    write_status(&mut buf, &mut pos, status);
    buf.truncate(pos);
    buf
}

pub fn unpack_res_generic(payload: &[u8]) -> (u16, Status) {
    let mut pos = 0;
    let remote_id = codec::read_u16(payload, &mut pos);
    (remote_id, read_status(payload, &mut pos))
}

pub fn pack_res_select(remote_id: u16, result: &Result<Record, TypedError>) -> Vec<u8> {
    let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
    let mut pos = 0;
    codec::write_u16(&mut buf, &mut pos, remote_id);
    write_status(&mut buf, &mut pos, &Status::from_result(result));
    if let Ok(record) = result {
        codec::write_u16(&mut buf, &mut pos, record.key);
        codec::write_str(&mut buf, &mut pos, &record.value);
        codec::write_u64(&mut buf, &mut pos, record.timestamp);
    }
    buf.truncate(pos);
    buf
}

pub fn unpack_res_select(payload: &[u8]) -> (u16, Result<Record, TypedError>) {
    let mut pos = 0;
    let remote_id = codec::read_u16(payload, &mut pos);
    let status = read_status(payload, &mut pos);
    let result = status.into_result().map(|_| {
        let key = codec::read_u16(payload, &mut pos);
        let value = codec::read_str(payload, &mut pos);
        let timestamp = codec::read_u64(payload, &mut pos);
        Record::new(key, value, timestamp)
    });
    (remote_id, result)
}

// ---------------------------------------------------------------------------
// describe chunking

fn meta_size(meta: &TableMeta) -> usize {
    codec::str_size(&meta.name) + 1 + 2 + 4
}

fn write_meta(buf: &mut [u8], pos: &mut usize, meta: &TableMeta) {
    codec::write_str(buf, pos, &meta.name);
    codec::write_u8(buf, pos, meta.consistency.index() as u8);
    codec::write_u16(buf, pos, meta.partitions);
    codec::write_u32(buf, pos, meta.compaction_interval_ms);
}

fn read_meta(buf: &[u8], pos: &mut usize) -> TableMeta {
    let name = codec::read_str(buf, pos);
    let consistency =
        Consistency::from_index(codec::read_u8(buf, pos)).unwrap_or(Consistency::None);
    let partitions = codec::read_u16(buf, pos);
    let interval = codec::read_u32(buf, pos);
    TableMeta::new(name, consistency, partitions, interval)
}

/// Splits a DESCRIBE response into as many packets as needed.
///
/// The first chunk carries the total count (and the status when a single
/// named table was requested); follow-up chunks pack as many serialized
/// metadata rows as fit.
pub fn pack_res_describe(
    remote_id: u16,
    result: &Result<Vec<TableMeta>, TypedError>,
) -> Vec<Vec<u8>> {
    let status = Status::from_result(result);
    let empty = Vec::new();
    let tables = result.as_ref().map(|t| t.as_slice()).unwrap_or(&empty);

    let mut chunks = Vec::new();
    let mut packed = 0usize;

    loop {
        let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
        let mut pos = 0;
        codec::write_u16(&mut buf, &mut pos, remote_id);

        if chunks.is_empty() {
            codec::write_u16(&mut buf, &mut pos, tables.len() as u16);
            write_status(&mut buf, &mut pos, &status);
        }

        while packed < tables.len() && pos + meta_size(&tables[packed]) <= buf.len() {
            write_meta(&mut buf, &mut pos, &tables[packed]);
            packed += 1;
        }

        buf.truncate(pos);
        chunks.push(buf);

        if packed == tables.len() {
            return chunks;
        }
    }
}

/// Reassembles chunked DESCRIBE responses.
#[derive(Debug, Default)]
pub struct DescribeAssembler {
    remaining: u16,
    started: bool,
    status: Option<Status>,
    tables: Vec<TableMeta>,
}

impl DescribeAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one response payload. Returns `true` once the response is
    /// complete; `take` then yields the outcome.
    pub fn feed(&mut self, payload: &[u8]) -> (u16, bool) {
        let mut pos = 0;
        let remote_id = codec::read_u16(payload, &mut pos);

        if !self.started {
            self.started = true;
            self.remaining = codec::read_u16(payload, &mut pos);
            let status = read_status(payload, &mut pos);
            if !status.is_ok() {
                self.remaining = 0;
            }
            self.status = Some(status);
            self.tables.reserve(self.remaining as usize);
        }

        while self.remaining > 0 && pos < payload.len() {
            self.tables.push(read_meta(payload, &mut pos));
            self.remaining -= 1;
        }

        (remote_id, self.remaining == 0)
    }

    pub fn take(&mut self) -> Result<Vec<TableMeta>, TypedError> {
        let status = self.status.take().unwrap_or(Status::Ok);
        let tables = std::mem::take(&mut self.tables);
        self.started = false;
        self.remaining = 0;
        status.into_result().map(|_| tables)
    }
}

// ---------------------------------------------------------------------------
// gossip

pub fn pack_req_gossip() -> Vec<u8> {
    Vec::new()
}

pub fn pack_res_gossip(nodes: &[NodeIdentity]) -> Vec<u8> {
    let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
    let mut pos = 0;
    codec::write_u16(&mut buf, &mut pos, nodes.len() as u16);
    for node in nodes {
        codec::write_u16(&mut buf, &mut pos, node.number);
        codec::write_str(&mut buf, &mut pos, &node.ip);
        codec::write_u16(&mut buf, &mut pos, node.port);
    }
    buf.truncate(pos);
    buf
}

pub fn unpack_res_gossip(payload: &[u8]) -> Vec<NodeIdentity> {
    let mut pos = 0;
    let count = codec::read_u16(payload, &mut pos);
    (0..count)
        .map(|_| NodeIdentity {
            number: codec::read_u16(payload, &mut pos),
            ip: codec::read_str(payload, &mut pos),
            port: codec::read_u16(payload, &mut pos),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed_err;

    #[test]
    fn header_round_trip() {
        for raw in 0..=u8::MAX {
            if let Some(h) = Header::from_u8(raw) {
                assert_eq!(h as u8, raw);
            }
        }
        assert_eq!(Header::from_u8(200), None);
    }

    #[test]
    fn insert_request_round_trip() {
        let record = Record::new(17, "abc", 1000);
        let payload = pack_req_insert(3, "WEATHER", &record);
        let (remote_id, table, parsed) = unpack_req_insert(&payload);
        assert_eq!(remote_id, 3);
        assert_eq!(table, "WEATHER");
        assert_eq!(parsed, record);
    }

    #[test]
    fn select_response_carries_record_or_error() {
        let ok: Result<Record, TypedError> = Ok(Record::new(7, "x", 42));
        let (_, result) = unpack_res_select(&pack_res_select(1, &ok));
        assert_eq!(result.unwrap(), Record::new(7, "x", 42));

        let err: Result<Record, TypedError> = Err(typed_err!(Generic, "Key 7 does not exist"));
        let (_, result) = unpack_res_select(&pack_res_select(1, &err));
        let e = result.unwrap_err();
        assert_eq!(e.err(), SystemError::Generic);
        assert!(e.description().contains("does not exist"));
    }

    #[test]
    fn auth_round_trip() {
        let identity = NodeIdentity {
            number: 4,
            ip: "10.0.0.4".into(),
            port: 15000,
        };
        let (password, parsed) = unpack_auth(&pack_auth("secret-password", Some(&identity)));
        assert_eq!(password, "secret-password");
        assert_eq!(parsed, Some(identity));

        let (password, parsed) = unpack_auth(&pack_auth("client", None));
        assert_eq!(password, "client");
        assert_eq!(parsed, None);
    }

    fn table_fixture(count: usize) -> Vec<TableMeta> {
        (0..count)
            .map(|i| TableMeta::new(format!("TABLE{i:04}"), Consistency::Eventual, 4, 60_000))
            .collect()
    }

    #[test]
    fn describe_single_chunk() {
        let tables = table_fixture(3);
        let chunks = pack_res_describe(9, &Ok(tables.clone()));
        assert_eq!(chunks.len(), 1);

        let mut assembler = DescribeAssembler::new();
        let (remote_id, done) = assembler.feed(&chunks[0]);
        assert_eq!(remote_id, 9);
        assert!(done);
        assert_eq!(assembler.take().unwrap(), tables);
    }

    #[test]
    fn describe_reassembles_across_chunks() {
        // enough rows that a single 4 KiB packet cannot hold them
        let tables = table_fixture(400);
        let chunks = pack_res_describe(2, &Ok(tables.clone()));
        assert!(chunks.len() > 1);

        let mut assembler = DescribeAssembler::new();
        let mut done = false;
        for chunk in &chunks {
            let (_, complete) = assembler.feed(chunk);
            done = complete;
        }
        assert!(done);
        assert_eq!(assembler.take().unwrap(), tables);
    }

    #[test]
    fn describe_error_completes_immediately() {
        let err: Result<Vec<TableMeta>, TypedError> =
            Err(typed_err!(Generic, "Table 'T' does not exist."));
        let chunks = pack_res_describe(5, &err);
        assert_eq!(chunks.len(), 1);

        let mut assembler = DescribeAssembler::new();
        let (_, done) = assembler.feed(&chunks[0]);
        assert!(done);
        assert!(assembler.take().is_err());
    }

    #[test]
    fn describe_zero_tables() {
        let chunks = pack_res_describe(1, &Ok(Vec::new()));
        let mut assembler = DescribeAssembler::new();
        let (_, done) = assembler.feed(&chunks[0]);
        assert!(done);
        assert!(assembler.take().unwrap().is_empty());
    }

    #[test]
    fn gossip_round_trip() {
        let nodes = vec![
            NodeIdentity {
                number: 1,
                ip: "127.0.0.1".into(),
                port: 15001,
            },
            NodeIdentity {
                number: 2,
                ip: "127.0.0.1".into(),
                port: 15002,
            },
        ];
        assert_eq!(unpack_res_gossip(&pack_res_gossip(&nodes)), nodes);
    }
}
