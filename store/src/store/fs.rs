//! On-disk layout and block device of the store node.
//!
//! The root directory holds a marker file, a metadata file, the block
//! bitmap, one `N.bin` file per block and one directory per table. Table
//! partitions and dumps are descriptor files (`size`, `blocksCount`,
//! `blocks=[…]`) whose logical content is the concatenation of the
//! referenced blocks truncated to `size`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;

use stratakv_core::error::{ResultExt, SystemError, TypedResult};
use stratakv_core::table::{Consistency, TableMeta};
use stratakv_core::typed_err;

pub const ROOT_MARKER: &str = ".lfs_root";
pub const DIR_METADATA: &str = "metadata";
pub const DIR_TABLES: &str = "tables";
pub const DIR_BLOCKS: &str = "blocks";
pub const FILE_BITMAP: &str = "bitmap.bin";
pub const MAGIC: &str = "LSFS";

/// Maximum number of blocks a single descriptor may reference.
pub const MAX_FILE_FRAG: usize = 1024;

const SEGMENT_BITS: u32 = 32;

/// Descriptor of a partition or dump file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDesc {
    pub size: u32,
    pub blocks: Vec<u32>,
}

#[derive(Debug, Clone)]
struct FsMeta {
    blocks_count: u32,
    blocks_size: u32,
}

/// In-memory mirror of the block bitmap; bit i is set iff block i is owned
/// by some descriptor. Updates go to the file 32-bit segment at a time.
struct Bitmap {
    segments: Vec<u32>,
    blocks_count: u32,
}

impl Bitmap {
    fn segment_count(blocks_count: u32) -> usize {
        blocks_count.div_ceil(SEGMENT_BITS) as usize
    }

    fn byte_len(blocks_count: u32) -> usize {
        blocks_count.div_ceil(8) as usize
    }

    fn last_segment_bits(&self) -> u32 {
        match self.blocks_count % SEGMENT_BITS {
            0 => SEGMENT_BITS,
            bits => bits,
        }
    }

    /// Finds and sets the lowest clear bit; returns the block number and
    /// the segment index that changed.
    fn take_lowest_clear(&mut self) -> Option<(u32, usize)> {
        let last = self.segments.len().saturating_sub(1);
        let last_segment_bits = self.last_segment_bits();
        for (i, segment) in self.segments.iter_mut().enumerate() {
            if *segment == u32::MAX {
                continue;
            }
            let max_bit = if i == last { last_segment_bits } else { SEGMENT_BITS };
            for bit in 0..max_bit {
                if *segment & (1 << bit) == 0 {
                    *segment |= 1 << bit;
                    return Some((i as u32 * SEGMENT_BITS + bit, i));
                }
            }
        }
        None
    }

    fn clear(&mut self, block: u32) -> usize {
        let segment = (block / SEGMENT_BITS) as usize;
        let bit = block % SEGMENT_BITS;
        self.segments[segment] &= !(1u32 << bit);
        segment
    }

    fn is_set(&self, block: u32) -> bool {
        let segment = (block / SEGMENT_BITS) as usize;
        let bit = block % SEGMENT_BITS;
        self.segments[segment] & (1 << bit) != 0
    }
}

/// The store node's filesystem engine.
pub struct Filesystem {
    root: PathBuf,
    meta: FsMeta,
    /// Serializes each alloc-or-free including its bitmap file write.
    bitmap: Mutex<Bitmap>,
    /// Serializes table creation against deletion.
    create_drop: Mutex<()>,
}

impl Filesystem {
    /// Mounts the filesystem at `root`, bootstrapping an empty one when
    /// the directory does not exist yet.
    pub fn init(root: &Path, blocks_count: u32, blocks_size: u32) -> TypedResult<Self> {
        if root.exists() {
            if !root.is_dir() {
                return Err(typed_err!(
                    Init,
                    "the given root dir '{}' already exists and is a file",
                    root.display()
                ));
            }
            if !root.join(ROOT_MARKER).is_file() {
                return Err(typed_err!(
                    Init,
                    "the given root dir '{}' exists but is not a store filesystem ({ROOT_MARKER} is missing)",
                    root.display()
                ));
            }
        } else {
            Self::bootstrap(root, blocks_count, blocks_size)?;
        }

        let meta = Self::load_meta(root)?;
        let bitmap = Self::load_bitmap(root, &meta)?;

        info!("filesystem mount point: {}", root.display());

        Ok(Self {
            root: root.to_owned(),
            meta,
            bitmap: Mutex::new(bitmap),
            create_drop: Mutex::new(()),
        })
    }

    fn bootstrap(root: &Path, blocks_count: u32, blocks_size: u32) -> TypedResult<()> {
        info!("bootstrapping store filesystem in {}...", root.display());

        fs::create_dir_all(root.join(DIR_METADATA)).typ(SystemError::Init)?;
        fs::create_dir_all(root.join(DIR_TABLES)).typ(SystemError::Init)?;
        fs::create_dir_all(root.join(DIR_BLOCKS)).typ(SystemError::Init)?;
        fs::write(root.join(ROOT_MARKER), b"").typ(SystemError::Init)?;

        let mut meta = BTreeMap::new();
        meta.insert("blocksCount".to_owned(), blocks_count.to_string());
        meta.insert("blocksSize".to_owned(), blocks_size.to_string());
        meta.insert("magicNumber".to_owned(), MAGIC.to_owned());
        write_kv_file(&root.join(DIR_METADATA).join(DIR_METADATA), &meta)?;

        // all blocks start available (all bits clear)
        let zeroed = vec![0u8; Bitmap::byte_len(blocks_count)];
        fs::write(root.join(DIR_METADATA).join(FILE_BITMAP), zeroed).typ(SystemError::Init)?;
        Ok(())
    }

    fn load_meta(root: &Path) -> TypedResult<FsMeta> {
        let path = root.join(DIR_METADATA).join(DIR_METADATA);
        let kv = read_kv_file(&path)?;
        let magic = kv_get(&kv, "magicNumber", &path)?;
        if magic != MAGIC {
            return Err(typed_err!(Init, "unexpected magic number '{magic}' in '{}'", path.display()));
        }
        Ok(FsMeta {
            blocks_count: kv_parse(&kv, "blocksCount", &path)?,
            blocks_size: kv_parse(&kv, "blocksSize", &path)?,
        })
    }

    fn load_bitmap(root: &Path, meta: &FsMeta) -> TypedResult<Bitmap> {
        let path = root.join(DIR_METADATA).join(FILE_BITMAP);
        let bytes = fs::read(&path).typ(SystemError::Init)?;
        if bytes.len() != Bitmap::byte_len(meta.blocks_count) {
            return Err(typed_err!(
                Init,
                "bitmap file '{}' has {} bytes but {} were expected; the file might be corrupt",
                path.display(),
                bytes.len(),
                Bitmap::byte_len(meta.blocks_count)
            ));
        }

        let mut segments = vec![0u32; Bitmap::segment_count(meta.blocks_count)];
        for (i, chunk) in bytes.chunks(4).enumerate() {
            let mut raw = [0u8; 4];
            raw[..chunk.len()].copy_from_slice(chunk);
            segments[i] = u32::from_le_bytes(raw);
        }
        Ok(Bitmap {
            segments,
            blocks_count: meta.blocks_count,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn block_size(&self) -> u32 {
        self.meta.blocks_size
    }

    pub fn blocks_count(&self) -> u32 {
        self.meta.blocks_count
    }

    // -- block allocator ----------------------------------------------------

    /// Allocates `count` blocks, persisting each bit flip before use.
    pub fn block_alloc(&self, count: usize) -> TypedResult<Vec<u32>> {
        let mut bitmap = self.bitmap.lock().unwrap();
        let mut file = self.open_bitmap()?;
        let mut taken = Vec::with_capacity(count);

        for _ in 0..count {
            match bitmap.take_lowest_clear() {
                Some((block, segment)) => {
                    self.write_segment(&mut file, &bitmap, segment)?;
                    taken.push(block);
                }
                None => {
                    // roll the partial allocation back
                    for &block in &taken {
                        let segment = bitmap.clear(block);
                        let _ = self.write_segment(&mut file, &bitmap, segment);
                    }
                    return Err(typed_err!(
                        Generic,
                        "out of blocks ({} requested, {} available were taken back)",
                        count,
                        taken.len()
                    ));
                }
            }
        }
        Ok(taken)
    }

    pub fn block_free(&self, blocks: &[u32]) {
        let mut bitmap = self.bitmap.lock().unwrap();
        let Ok(mut file) = self.open_bitmap() else {
            warn!("bitmap file could not be opened for writing");
            return;
        };
        for &block in blocks {
            let segment = bitmap.clear(block);
            if let Err(e) = self.write_segment(&mut file, &bitmap, segment) {
                warn!("bitmap write-back for block {block} failed: {e}");
            }
        }
    }

    pub fn block_is_allocated(&self, block: u32) -> bool {
        self.bitmap.lock().unwrap().is_set(block)
    }

    pub fn blocks_allocated(&self) -> u32 {
        let bitmap = self.bitmap.lock().unwrap();
        bitmap.segments.iter().map(|s| s.count_ones()).sum()
    }

    fn open_bitmap(&self) -> TypedResult<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.root.join(DIR_METADATA).join(FILE_BITMAP))
            .typ(SystemError::Generic)
    }

    fn write_segment(&self, file: &mut File, bitmap: &Bitmap, segment: usize) -> TypedResult<()> {
        file.seek(SeekFrom::Start(segment as u64 * 4))
            .typ(SystemError::Generic)?;
        file.write_all(&bitmap.segments[segment].to_le_bytes())
            .typ(SystemError::Generic)?;
        file.sync_data().typ(SystemError::Generic)?;
        Ok(())
    }

    // -- block payloads -----------------------------------------------------

    fn block_path(&self, block: u32) -> PathBuf {
        self.root.join(DIR_BLOCKS).join(format!("{block}.bin"))
    }

    pub fn block_read(&self, block: u32) -> TypedResult<Vec<u8>> {
        fs::read(self.block_path(block))
            .with_context(|| format!("reading block {block}"))
            .typ(SystemError::Generic)
    }

    pub fn block_write(&self, block: u32, payload: &[u8]) -> TypedResult<()> {
        assert!(payload.len() <= self.meta.blocks_size as usize, "payload exceeds block size");
        fs::write(self.block_path(block), payload)
            .with_context(|| format!("writing block {block}"))
            .typ(SystemError::Generic)
    }

    /// Allocates blocks for `payload` and writes it out chunk by chunk.
    pub fn store_payload(&self, payload: &[u8]) -> TypedResult<FileDesc> {
        let block_size = self.meta.blocks_size as usize;
        let needed = payload.len().div_ceil(block_size).max(1);
        if needed > MAX_FILE_FRAG {
            return Err(typed_err!(
                Generic,
                "payload of {} bytes needs {needed} blocks, more than the {MAX_FILE_FRAG} supported",
                payload.len()
            ));
        }

        let blocks = self.block_alloc(needed)?;
        for (i, &block) in blocks.iter().enumerate() {
            let chunk = &payload[i * block_size..payload.len().min((i + 1) * block_size)];
            if let Err(e) = self.block_write(block, chunk) {
                self.block_free(&blocks);
                return Err(e);
            }
        }
        Ok(FileDesc {
            size: payload.len() as u32,
            blocks,
        })
    }

    /// Reads the logical content of a descriptor: its blocks in order,
    /// truncated to `size`.
    pub fn load_payload(&self, desc: &FileDesc) -> TypedResult<Vec<u8>> {
        if desc.size == 0 {
            // freshly created partitions own a block whose payload file
            // was never written
            return Ok(Vec::new());
        }
        let mut payload = Vec::with_capacity(desc.size as usize);
        for &block in &desc.blocks {
            payload.extend_from_slice(&self.block_read(block)?);
            if payload.len() >= desc.size as usize {
                break;
            }
        }
        payload.truncate(desc.size as usize);
        Ok(payload)
    }

    // -- table directories --------------------------------------------------

    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(DIR_TABLES).join(table)
    }

    pub fn part_path(&self, table: &str, part: u16, during_compaction: bool) -> PathBuf {
        let ext = if during_compaction { "binc" } else { "bin" };
        self.table_dir(table).join(format!("P{part}.{ext}"))
    }

    pub fn dump_path(&self, table: &str, dump: u16, during_compaction: bool) -> PathBuf {
        let ext = if during_compaction { "tmpc" } else { "tmp" };
        self.table_dir(table).join(format!("D{dump}.{ext}"))
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.table_dir(table).is_dir()
    }

    /// Creates a table directory with its metadata and one empty (single
    /// block) partition per partition number.
    pub fn table_create(&self, meta: &TableMeta) -> TypedResult<()> {
        let _guard = self.create_drop.lock().unwrap();
        let dir = self.table_dir(&meta.name);
        if dir.exists() {
            return Err(typed_err!(Generic, "Table '{}' already exists.", meta.name));
        }
        fs::create_dir_all(&dir).typ(SystemError::Generic)?;

        let result = (|| -> TypedResult<()> {
            self.write_table_meta(meta)?;
            for part in 0..meta.partitions {
                let blocks = self.block_alloc(1)?;
                let desc = FileDesc { size: 0, blocks };
                self.write_desc(&self.part_path(&meta.name, part, false), &desc)?;
            }
            Ok(())
        })();

        if result.is_err() {
            // leave no half-created table behind
            let _ = self.table_delete_locked(&meta.name);
        }
        result
    }

    fn write_table_meta(&self, meta: &TableMeta) -> TypedResult<()> {
        let mut kv = BTreeMap::new();
        kv.insert("consistency".to_owned(), (meta.consistency.index() as u8).to_string());
        kv.insert("partitionsCount".to_owned(), meta.partitions.to_string());
        kv.insert("compactionInterval".to_owned(), meta.compaction_interval_ms.to_string());
        write_kv_file(&self.table_dir(&meta.name).join(DIR_METADATA), &kv)
    }

    pub fn table_meta(&self, table: &str) -> TypedResult<TableMeta> {
        let path = self.table_dir(table).join(DIR_METADATA);
        let kv = read_kv_file(&path)?;
        let consistency = Consistency::from_index(kv_parse::<u8>(&kv, "consistency", &path)?)
            .ok_or_else(|| typed_err!(Generic, "invalid consistency in '{}'", path.display()))?;
        Ok(TableMeta {
            name: table.to_owned(),
            consistency,
            partitions: kv_parse(&kv, "partitionsCount", &path)?,
            compaction_interval_ms: kv_parse(&kv, "compactionInterval", &path)?,
        })
    }

    /// Enumerates the tables found on disk.
    pub fn table_names(&self) -> TypedResult<Vec<String>> {
        let mut names = Vec::new();
        let entries = fs::read_dir(self.root.join(DIR_TABLES)).typ(SystemError::Init)?;
        for entry in entries {
            let entry = entry.typ(SystemError::Init)?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Frees every block the table owns and removes its directory.
    pub fn table_delete(&self, table: &str) -> TypedResult<()> {
        let _guard = self.create_drop.lock().unwrap();
        self.table_delete_locked(table)
    }

    fn table_delete_locked(&self, table: &str) -> TypedResult<()> {
        let dir = self.table_dir(table);
        if !dir.exists() {
            return Err(typed_err!(Generic, "Table '{table}' does not exist."));
        }

        let entries = fs::read_dir(&dir).typ(SystemError::Generic)?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.file_name().map(|n| n == DIR_METADATA).unwrap_or(false) {
                continue;
            }
            if let Ok(desc) = self.read_desc(&path) {
                self.block_free(&desc.blocks);
            }
        }

        fs::remove_dir_all(&dir).typ(SystemError::Generic)?;
        Ok(())
    }

    // -- descriptors --------------------------------------------------------

    pub fn write_desc(&self, path: &Path, desc: &FileDesc) -> TypedResult<()> {
        assert!(desc.blocks.len() <= MAX_FILE_FRAG, "descriptor fragments over the limit");
        let mut kv = BTreeMap::new();
        kv.insert("size".to_owned(), desc.size.to_string());
        kv.insert("blocksCount".to_owned(), desc.blocks.len().to_string());
        let list = desc
            .blocks
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",");
        kv.insert("blocks".to_owned(), format!("[{list}]"));
        write_kv_file(path, &kv)
    }

    pub fn read_desc(&self, path: &Path) -> TypedResult<FileDesc> {
        let kv = read_kv_file(path)?;
        let size = kv_parse::<u32>(&kv, "size", path)?;
        let blocks_count = kv_parse::<u32>(&kv, "blocksCount", path)?;
        let raw = kv_get(&kv, "blocks", path)?;
        let trimmed = raw.trim().trim_start_matches('[').trim_end_matches(']');
        let blocks: Vec<u32> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed
                .split(',')
                .map(|s| s.trim().parse::<u32>())
                .collect::<Result<_, _>>()
                .with_context(|| format!("parsing blocks list in '{}'", path.display()))
                .typ(SystemError::Generic)?
        };
        if blocks.len() as u32 != blocks_count {
            warn!(
                "blocksCount ({blocks_count}) and actual blocks ({}) in '{}' do not match",
                blocks.len(),
                path.display()
            );
        }
        Ok(FileDesc { size, blocks })
    }

    /// Frees the descriptor's blocks and removes the descriptor file.
    pub fn delete_file(&self, path: &Path) -> TypedResult<()> {
        let desc = self.read_desc(path)?;
        self.block_free(&desc.blocks);
        fs::remove_file(path)
            .with_context(|| format!("removing '{}'", path.display()))
            .typ(SystemError::Generic)
    }

    // -- dumps --------------------------------------------------------------

    /// Dump numbers present for a table, in ascending order, separated by
    /// whether they were renamed for an in-flight compaction.
    pub fn dump_numbers(&self, table: &str) -> TypedResult<Vec<(u16, bool)>> {
        let mut dumps = Vec::new();
        let entries = fs::read_dir(self.table_dir(table)).typ(SystemError::Generic)?;
        for entry in entries.flatten() {
            if let Some((number, during_compaction)) = parse_dump_name(&entry.path()) {
                dumps.push((number, during_compaction));
            }
        }
        dumps.sort_unstable();
        Ok(dumps)
    }

    pub fn next_dump_number(&self, table: &str) -> u16 {
        self.dump_numbers(table)
            .map(|dumps| dumps.iter().map(|&(n, _)| n + 1).max().unwrap_or(0))
            .unwrap_or(0)
    }
}

/// Parses `D<number>.tmp` / `D<number>.tmpc` file names.
pub fn parse_dump_name(path: &Path) -> Option<(u16, bool)> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix('D')?;
    if let Some(number) = rest.strip_suffix(".tmpc") {
        return number.parse().ok().map(|n| (n, true));
    }
    if let Some(number) = rest.strip_suffix(".tmp") {
        return number.parse().ok().map(|n| (n, false));
    }
    None
}

// ---------------------------------------------------------------------------
// key=value descriptor files

fn write_kv_file(path: &Path, kv: &BTreeMap<String, String>) -> TypedResult<()> {
    let mut out = String::new();
    for (key, value) in kv {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    fs::write(path, out)
        .with_context(|| format!("writing '{}'", path.display()))
        .typ(SystemError::Generic)
}

fn read_kv_file(path: &Path) -> TypedResult<BTreeMap<String, String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading '{}'", path.display()))
        .typ(SystemError::Generic)?;
    let mut kv = BTreeMap::new();
    for line in raw.lines() {
        if let Some((key, value)) = line.split_once('=') {
            kv.insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }
    Ok(kv)
}

fn kv_get<'a>(kv: &'a BTreeMap<String, String>, key: &str, path: &Path) -> TypedResult<&'a str> {
    kv.get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| typed_err!(Generic, "key '{key}' is missing in '{}'", path.display()))
}

fn kv_parse<T: std::str::FromStr>(
    kv: &BTreeMap<String, String>,
    key: &str,
    path: &Path,
) -> TypedResult<T> {
    kv_get(kv, key, path)?
        .parse::<T>()
        .map_err(|_| typed_err!(Generic, "key '{key}' in '{}' is not a valid number", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mount(blocks: u32, block_size: u32) -> (tempfile::TempDir, Filesystem) {
        let dir = tempdir().unwrap();
        let root = dir.path().join("lfs");
        let fs = Filesystem::init(&root, blocks, block_size).unwrap();
        (dir, fs)
    }

    #[test]
    fn bootstrap_creates_layout() {
        let (_dir, fs) = mount(64, 256);
        assert!(fs.root().join(ROOT_MARKER).is_file());
        assert!(fs.root().join(DIR_METADATA).join(DIR_METADATA).is_file());
        assert!(fs.root().join(DIR_METADATA).join(FILE_BITMAP).is_file());
        assert!(fs.root().join(DIR_TABLES).is_dir());
        assert!(fs.root().join(DIR_BLOCKS).is_dir());
        assert_eq!(fs.blocks_allocated(), 0);
    }

    #[test]
    fn remount_preserves_metadata_and_bitmap() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("lfs");
        {
            let fs = Filesystem::init(&root, 64, 256).unwrap();
            let blocks = fs.block_alloc(3).unwrap();
            assert_eq!(blocks, vec![0, 1, 2]);
        }
        let fs = Filesystem::init(&root, 0, 0).unwrap();
        assert_eq!(fs.blocks_count(), 64);
        assert_eq!(fs.block_size(), 256);
        assert_eq!(fs.blocks_allocated(), 3);
        // the next allocation continues after the persisted ones
        assert_eq!(fs.block_alloc(1).unwrap(), vec![3]);
    }

    #[test]
    fn alloc_prefers_lowest_clear_bit() {
        let (_dir, fs) = mount(64, 256);
        let first = fs.block_alloc(4).unwrap();
        assert_eq!(first, vec![0, 1, 2, 3]);
        fs.block_free(&[1, 2]);
        assert_eq!(fs.block_alloc(3).unwrap(), vec![1, 2, 4]);
    }

    #[test]
    fn alloc_exhaustion_rolls_back() {
        let (_dir, fs) = mount(8, 64);
        let taken = fs.block_alloc(8).unwrap();
        assert_eq!(taken.len(), 8);
        assert!(fs.block_alloc(1).is_err());
        fs.block_free(&taken);
        assert!(fs.block_alloc(9).is_err());
        // the failed request must not leak block ownership
        assert_eq!(fs.blocks_allocated(), 0);
    }

    #[test]
    fn payload_round_trip_spans_blocks() {
        let (_dir, fs) = mount(16, 32);
        let payload: Vec<u8> = (0..100u8).collect();
        let desc = fs.store_payload(&payload).unwrap();
        assert_eq!(desc.size, 100);
        assert_eq!(desc.blocks.len(), 4);
        assert_eq!(fs.load_payload(&desc).unwrap(), payload);
    }

    #[test]
    fn descriptor_round_trip() {
        let (_dir, fs) = mount(16, 64);
        let path = fs.root().join("desc.test");
        let desc = FileDesc {
            size: 1234,
            blocks: vec![5, 9, 2],
        };
        fs.write_desc(&path, &desc).unwrap();
        assert_eq!(fs.read_desc(&path).unwrap(), desc);
    }

    #[test]
    fn table_create_and_delete_recycle_blocks() {
        let (_dir, fs) = mount(32, 64);
        let meta = TableMeta::new("T", Consistency::Strong, 4, 60_000);
        fs.table_create(&meta).unwrap();
        assert!(fs.table_exists("T"));
        assert_eq!(fs.table_meta("T").unwrap(), meta);
        assert_eq!(fs.blocks_allocated(), 4);
        assert!(fs.table_create(&meta).is_err());

        fs.table_delete("T").unwrap();
        assert!(!fs.table_exists("T"));
        assert_eq!(fs.blocks_allocated(), 0);
    }

    #[test]
    fn dump_name_parsing() {
        assert_eq!(parse_dump_name(Path::new("/t/D3.tmp")), Some((3, false)));
        assert_eq!(parse_dump_name(Path::new("/t/D12.tmpc")), Some((12, true)));
        assert_eq!(parse_dump_name(Path::new("/t/P0.bin")), None);
        assert_eq!(parse_dump_name(Path::new("/t/metadata")), None);
    }

    #[test]
    fn dump_numbering() {
        let (_dir, fs) = mount(32, 64);
        let meta = TableMeta::new("T", Consistency::Eventual, 1, 60_000);
        fs.table_create(&meta).unwrap();
        assert_eq!(fs.next_dump_number("T"), 0);

        let desc = fs.store_payload(b"10;1;x\n").unwrap();
        fs.write_desc(&fs.dump_path("T", 0, false), &desc).unwrap();
        assert_eq!(fs.dump_numbers("T").unwrap(), vec![(0, false)]);
        assert_eq!(fs.next_dump_number("T"), 1);
    }
}
