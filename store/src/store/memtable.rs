//! In-memory record buffers and their serialized form.
//!
//! A memtable in `Mem` mode accumulates raw inserts (duplicates allowed,
//! unsorted) until a dump; `Disk` mode is the projection of a partition or
//! dump file (sorted, no duplicates). Records serialize to
//! `TIMESTAMP;KEY;VALUE` rows separated by newlines.
//!
//! The full comparator orders by `(key % partitions) asc, key asc,
//! timestamp desc`; the basic comparator compares only `(partition, key)`,
//! which is what dedup collapses, keeping the first (most recent) record
//! per key after a full sort.

use std::cmp::Ordering;
use std::path::Path;

use stratakv_core::error::TypedResult;
use stratakv_core::table::Record;
use stratakv_core::typed_err;

use super::fs::{FileDesc, Filesystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemtableMode {
    /// Pre-dump buffer: may contain duplicates, unsorted.
    Mem,
    /// File projection: sorted, unique keys.
    Disk,
}

#[derive(Debug)]
pub struct Memtable {
    table: String,
    partitions: u16,
    mode: MemtableMode,
    records: Vec<Record>,
    sorted: bool,
}

fn cmp_full(a: &Record, b: &Record, partitions: u16) -> Ordering {
    (a.key % partitions)
        .cmp(&(b.key % partitions))
        .then(a.key.cmp(&b.key))
        .then(b.timestamp.cmp(&a.timestamp))
}

fn cmp_basic(a: &Record, b: &Record, partitions: u16) -> Ordering {
    (a.key % partitions)
        .cmp(&(b.key % partitions))
        .then(a.key.cmp(&b.key))
}

impl Memtable {
    pub fn new(table: &str, partitions: u16) -> Self {
        assert!(partitions > 0, "a table has at least one partition");
        Self {
            table: table.to_owned(),
            partitions,
            mode: MemtableMode::Mem,
            records: Vec::new(),
            sorted: false,
        }
    }

    /// Loads the projection of a partition file.
    pub fn from_part(
        fs: &Filesystem,
        table: &str,
        partitions: u16,
        part: u16,
        during_compaction: bool,
    ) -> TypedResult<Self> {
        let path = fs.part_path(table, part, during_compaction);
        Self::from_desc_file(fs, table, partitions, &path)
    }

    /// Loads the projection of a dump file.
    pub fn from_dump(
        fs: &Filesystem,
        table: &str,
        partitions: u16,
        dump: u16,
        during_compaction: bool,
    ) -> TypedResult<Self> {
        let path = fs.dump_path(table, dump, during_compaction);
        Self::from_desc_file(fs, table, partitions, &path)
    }

    fn from_desc_file(
        fs: &Filesystem,
        table: &str,
        partitions: u16,
        path: &Path,
    ) -> TypedResult<Self> {
        let desc = fs.read_desc(path)?;
        let payload = fs.load_payload(&desc)?;
        let mut memtable = Self::new(table, partitions);
        memtable.mode = MemtableMode::Disk;
        memtable.sorted = true;
        memtable.records = parse_rows(&payload)?;
        Ok(memtable)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn mode(&self) -> MemtableMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn add(&mut self, record: Record) {
        self.records.push(record);
        self.sorted = false;
    }

    pub fn add_all(&mut self, records: impl IntoIterator<Item = Record>) {
        self.records.extend(records);
        self.sorted = false;
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Sorts with the full comparator and removes duplicate logical rows,
    /// keeping the highest-timestamp record per key.
    pub fn preprocess(&mut self) {
        let partitions = self.partitions;
        self.records.sort_by(|a, b| cmp_full(a, b, partitions));
        self.records
            .dedup_by(|a, b| cmp_basic(a, b, partitions) == Ordering::Equal);
        self.sorted = true;
    }

    /// Most recent record stored under `key`, if any.
    pub fn find(&self, key: u16) -> Option<Record> {
        if self.sorted {
            let probe = Record::new(key, "", 0);
            let partitions = self.partitions;
            self.records
                .binary_search_by(|r| cmp_basic(r, &probe, partitions))
                .ok()
                .map(|i| self.records[i].clone())
        } else {
            // unsorted Mem buffer: linear scan for the freshest entry
            self.records
                .iter()
                .filter(|r| r.key == key)
                .max_by_key(|r| r.timestamp)
                .cloned()
        }
    }

    /// Serializes every record as `TIMESTAMP;KEY;VALUE\n` rows.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for record in &self.records {
            out.extend_from_slice(record.timestamp.to_string().as_bytes());
            out.push(b';');
            out.extend_from_slice(record.key.to_string().as_bytes());
            out.push(b';');
            out.extend_from_slice(record.value.as_bytes());
            out.push(b'\n');
        }
        out
    }

    /// Sorts, uniquifies and writes this memtable out as the table's next
    /// dump. Returns `None` without touching the disk when there is
    /// nothing to dump.
    pub fn make_dump(&mut self, fs: &Filesystem) -> TypedResult<Option<u16>> {
        assert!(self.mode == MemtableMode::Mem, "only Mem memtables can be dumped");
        if self.records.is_empty() {
            return Ok(None);
        }

        self.preprocess();
        let desc = fs.store_payload(&self.serialize())?;
        let number = fs.next_dump_number(&self.table);
        if let Err(e) = fs.write_desc(&fs.dump_path(&self.table, number, false), &desc) {
            fs.block_free(&desc.blocks);
            return Err(e);
        }
        self.clear();
        Ok(Some(number))
    }

    /// Sorts, uniquifies and writes this memtable out as the compaction
    /// replacement (`P<part>.binc`) of a partition.
    pub fn make_part(&mut self, fs: &Filesystem, part: u16) -> TypedResult<FileDesc> {
        self.preprocess();
        let desc = fs.store_payload(&self.serialize())?;
        if let Err(e) = fs.write_desc(&fs.part_path(&self.table, part, true), &desc) {
            fs.block_free(&desc.blocks);
            return Err(e);
        }
        Ok(desc)
    }
}

/// Parses `TIMESTAMP;KEY;VALUE\n` rows.
fn parse_rows(payload: &[u8]) -> TypedResult<Vec<Record>> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| typed_err!(Generic, "record rows are not valid utf-8"))?;
    let mut records = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ';');
        let (Some(ts), Some(key), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(typed_err!(Generic, "malformed record row '{line}'"));
        };
        records.push(Record {
            timestamp: ts
                .parse()
                .map_err(|_| typed_err!(Generic, "malformed timestamp in row '{line}'"))?,
            key: key
                .parse()
                .map_err(|_| typed_err!(Generic, "malformed key in row '{line}'"))?,
            value: value.to_owned(),
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mount() -> (tempfile::TempDir, Filesystem) {
        let dir = tempdir().unwrap();
        let root = dir.path().join("lfs");
        let fs = Filesystem::init(&root, 128, 64).unwrap();
        (dir, fs)
    }

    #[test]
    fn preprocess_orders_and_dedups() {
        // partitionsCount = 6: keys 12, 49, 52, 106, 77 land in
        // partitions 0, 1, 4, 4, 5
        let mut mt = Memtable::new("T", 6);
        mt.add(Record::new(49, "Orange", 146_001));
        mt.add(Record::new(12, "Green", 578_340));
        mt.add(Record::new(77, "White", 969_580));
        mt.add(Record::new(12, "Red", 945_869));
        mt.add(Record::new(106, "Black", 744_543));
        mt.add(Record::new(49, "Blue", 195_834));
        mt.add(Record::new(52, "Cyan", 145_869));
        mt.add(Record::new(49, "Yellow", 116_001));

        mt.preprocess();
        let rows: Vec<(u16, &str)> = mt.records().iter().map(|r| (r.key, r.value.as_str())).collect();
        assert_eq!(
            rows,
            vec![
                (12, "Red"),
                (49, "Blue"),
                (52, "Cyan"),
                (106, "Black"),
                (77, "White"),
            ]
        );
    }

    #[test]
    fn find_in_unsorted_mem_picks_freshest() {
        let mut mt = Memtable::new("T", 4);
        mt.add(Record::new(7, "old", 10));
        mt.add(Record::new(7, "new", 20));
        mt.add(Record::new(7, "stale", 15));
        assert_eq!(mt.find(7).unwrap().value, "new");
        assert_eq!(mt.find(9), None);
    }

    #[test]
    fn find_after_preprocess_uses_binary_search() {
        let mut mt = Memtable::new("T", 4);
        for key in (0..100u16).rev() {
            mt.add(Record::new(key, format!("v{key}"), key as u64));
        }
        mt.preprocess();
        assert_eq!(mt.find(42).unwrap().value, "v42");
        assert_eq!(mt.find(101), None);
    }

    #[test]
    fn rows_round_trip() {
        let mut mt = Memtable::new("T", 4);
        mt.add(Record::new(1, "plain", 100));
        mt.add(Record::new(2, "with spaces", 200));
        let rows = mt.serialize();
        assert_eq!(parse_rows(&rows).unwrap(), mt.records());
    }

    #[test]
    fn value_may_contain_the_field_separator() {
        let rows = b"5;1;a;b;c\n";
        let records = parse_rows(rows).unwrap();
        assert_eq!(records, vec![Record::new(1, "a;b;c", 5)]);
    }

    #[test]
    fn dump_and_reload() {
        let (_dir, fs) = mount();
        let meta = stratakv_core::table::TableMeta::new(
            "T",
            stratakv_core::table::Consistency::Strong,
            2,
            60_000,
        );
        fs.table_create(&meta).unwrap();

        let mut mt = Memtable::new("T", 2);
        mt.add(Record::new(1, "a", 10));
        mt.add(Record::new(1, "b", 20));
        mt.add(Record::new(2, "c", 30));
        let number = mt.make_dump(&fs).unwrap().unwrap();
        assert_eq!(number, 0);
        assert!(mt.is_empty());

        let loaded = Memtable::from_dump(&fs, "T", 2, 0, false).unwrap();
        assert_eq!(loaded.mode(), MemtableMode::Disk);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.find(1).unwrap().value, "b");
        assert_eq!(loaded.find(2).unwrap().value, "c");
    }

    #[test]
    fn empty_memtable_is_not_dumped() {
        let (_dir, fs) = mount();
        let mut mt = Memtable::new("T", 2);
        assert_eq!(mt.make_dump(&fs).unwrap(), None);
    }
}
