//! Node-level tests driving the scheduler, the worker handlers and the
//! filesystem together.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stratakv_core::error::TypedError;
use stratakv_core::net::{NetArgs, ServerCtx};
use stratakv_core::table::{Consistency, Record, TableMeta};
use stratakv_core::taskman::{TaskOrigin, TaskState, Taskman, CLI_CLIENT};
use stratakv_core::timer::TimerSet;

use super::config::StoreConfig;
use super::fs::Filesystem;
use super::memtable::Memtable;
use super::{Registry, StoreData, StoreHooks, StoreKind, StoreTaskman};

struct Fixture {
    _dir: tempfile::TempDir,
    hooks: Arc<StoreHooks>,
    taskman: Arc<StoreTaskman>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig {
            listen_ip: "127.0.0.1".into(),
            listen_port: 0,
            password: "a-long-enough-password".into(),
            workers: 2,
            max_clients: 4,
            root_dir: dir.path().join("lfs"),
            blocks_count: 512,
            blocks_size: 128,
            value_size: 64,
            dump_interval: Duration::from_secs(3600),
            delay: None,
            validation_timeout: Duration::from_secs(5),
        };

        let fs =
            Arc::new(Filesystem::init(&cfg.root_dir, cfg.blocks_count, cfg.blocks_size).unwrap());
        let registry = Arc::new(Registry::default());
        let server =
            Arc::new(ServerCtx::listen(&NetArgs::new("test-api", &cfg.listen_ip, 0)).unwrap());

        let hooks = Arc::new(StoreHooks {
            cfg,
            fs,
            registry,
            server,
            taskman: Mutex::new(None),
            timers: Mutex::new(TimerSet::new(64)),
        });
        let taskman = Taskman::new(2, StoreKind::WtInsert, hooks.clone() as _);
        *hooks.taskman.lock().unwrap() = Some(Arc::clone(&taskman));

        Self {
            _dir: dir,
            hooks,
            taskman,
        }
    }

    /// Runs one task through the real scheduler, capturing its outcome in
    /// the window between completion and slot reuse.
    fn run(&self, kind: StoreKind, data: StoreData) -> (Option<TypedError>, StoreData) {
        let task = self
            .taskman
            .create(TaskOrigin::Cli, kind, data, CLI_CLIENT)
            .unwrap();
        task.activate();

        let mut captured = (None, StoreData::None);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match task.state() {
                TaskState::Completed => {
                    captured = (task.err(), task.with_body(|body| body.data.clone()));
                }
                TaskState::None => return captured,
                _ => {}
            }
            assert!(Instant::now() < deadline, "task {kind:?} did not finish in time");
            self.taskman.update(&*self.hooks);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn create_table(&self, name: &str, partitions: u16) {
        let meta = TableMeta::new(name, Consistency::Strong, partitions, 3_600_000);
        let (err, _) = self.run(StoreKind::WtCreate, StoreData::Create { meta });
        assert!(err.is_none(), "create failed: {err:?}");
    }

    fn insert(&self, table: &str, record: Record) {
        let (err, _) = self.run(
            StoreKind::WtInsert,
            StoreData::Insert {
                table: table.into(),
                record,
            },
        );
        assert!(err.is_none(), "insert failed: {err:?}");
    }

    fn select(&self, table: &str, key: u16) -> Option<Record> {
        let (err, data) = self.run(
            StoreKind::WtSelect,
            StoreData::Select {
                table: table.into(),
                key,
                record: None,
            },
        );
        if err.is_some() {
            return None;
        }
        match data {
            StoreData::Select { record, .. } => record,
            _ => None,
        }
    }

    fn dump(&self, table: &str) {
        let (err, _) = self.run(StoreKind::WtDump, StoreData::Dump { table: table.into() });
        assert!(err.is_none(), "dump failed: {err:?}");
    }

    fn compact(&self, table: &str) {
        let state = self.hooks.registry.get(table).unwrap();
        state
            .compacting
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let (err, _) = self.run(
            StoreKind::WtCompact,
            StoreData::Compact {
                table: table.into(),
                dumps: 0,
                snapshot_blocked: Duration::ZERO,
                swap_blocked: Duration::ZERO,
            },
        );
        assert!(err.is_none(), "compact failed: {err:?}");
    }

    fn partition_rows(&self, table: &str, part: u16) -> Vec<Record> {
        let state = self.hooks.registry.get(table).unwrap();
        let memtable =
            Memtable::from_part(&self.hooks.fs, table, state.meta.partitions, part, false).unwrap();
        memtable.records().to_vec()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.taskman.stop();
        self.hooks.server.destroy();
        self.taskman.shutdown();
    }
}

#[test]
fn create_insert_select() {
    let fx = Fixture::new();
    fx.create_table("T", 4);
    fx.insert("T", Record::new(17, "abc", 1000));
    assert_eq!(fx.select("T", 17), Some(Record::new(17, "abc", 1000)));
    assert_eq!(fx.select("T", 18), None);
}

#[test]
fn timestamp_dominance() {
    let fx = Fixture::new();
    fx.create_table("T", 4);
    fx.insert("T", Record::new(7, "old", 10));
    fx.insert("T", Record::new(7, "new", 20));
    fx.insert("T", Record::new(7, "stale", 15));
    assert_eq!(fx.select("T", 7), Some(Record::new(7, "new", 20)));
}

#[test]
fn select_merges_memtable_dumps_and_partition() {
    let fx = Fixture::new();
    fx.create_table("T", 2);

    // partition generation
    fx.insert("T", Record::new(4, "from-part", 1));
    fx.dump("T");
    fx.compact("T");

    // dump generation
    fx.insert("T", Record::new(4, "from-dump", 2));
    fx.dump("T");

    // live memtable generation
    fx.insert("T", Record::new(4, "from-mem", 3));

    assert_eq!(fx.select("T", 4), Some(Record::new(4, "from-mem", 3)));
}

#[test]
fn create_twice_fails() {
    let fx = Fixture::new();
    fx.create_table("T", 1);
    let meta = TableMeta::new("T", Consistency::Strong, 1, 3_600_000);
    let (err, _) = fx.run(StoreKind::WtCreate, StoreData::Create { meta });
    assert!(err.unwrap().description().contains("already exists"));
}

#[test]
fn drop_removes_table_and_blocks_access() {
    let fx = Fixture::new();
    fx.create_table("T", 2);
    fx.insert("T", Record::new(1, "a", 1));

    let (err, _) = fx.run(StoreKind::WtDrop, StoreData::Drop { table: "T".into() });
    assert!(err.is_none());
    assert!(!fx.hooks.fs.table_exists("T"));

    // the in-memory state is released by a follow-up main-thread task
    let deadline = Instant::now() + Duration::from_secs(2);
    while fx.hooks.registry.contains("T") {
        assert!(Instant::now() < deadline);
        fx.taskman.update(&*fx.hooks);
        std::thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(fx.select("T", 1), None);
}

#[test]
fn compaction_merges_dumps_into_partitions() {
    let fx = Fixture::new();
    fx.create_table("T", 1);

    // seed the partition with an old value, then a fresher dump
    fx.insert("T", Record::new(5, "x", 1));
    fx.dump("T");
    fx.compact("T");
    fx.insert("T", Record::new(5, "y", 2));
    fx.dump("T");

    fx.compact("T");

    assert_eq!(fx.partition_rows("T", 0), vec![Record::new(5, "y", 2)]);
    assert!(fx.hooks.fs.dump_numbers("T").unwrap().is_empty());
}

#[test]
fn compaction_is_idempotent() {
    let fx = Fixture::new();
    fx.create_table("T", 2);
    for key in 0..20u16 {
        fx.insert("T", Record::new(key, format!("v{key}"), key as u64 + 1));
    }
    fx.dump("T");
    fx.compact("T");

    let first: Vec<_> = (0..2).map(|p| fx.partition_rows("T", p)).collect();
    fx.compact("T");
    let second: Vec<_> = (0..2).map(|p| fx.partition_rows("T", p)).collect();
    assert_eq!(first, second);

    for key in 0..20u16 {
        assert_eq!(fx.select("T", key).unwrap().value, format!("v{key}"));
    }
}

#[test]
fn describe_lists_tables() {
    let fx = Fixture::new();
    fx.create_table("A", 1);
    fx.create_table("B", 2);

    let (err, data) = fx.run(
        StoreKind::WtDescribe,
        StoreData::Describe {
            table: None,
            result: Vec::new(),
        },
    );
    assert!(err.is_none());
    let names = match data {
        StoreData::Describe { result, .. } => {
            result.iter().map(|m| m.name.clone()).collect::<Vec<_>>()
        }
        _ => Vec::new(),
    };
    assert_eq!(names, vec!["A", "B"]);

    let (err, _) = fx.run(
        StoreKind::WtDescribe,
        StoreData::Describe {
            table: Some("NOPE".into()),
            result: Vec::new(),
        },
    );
    assert!(err.is_some());
}

#[test]
fn blocked_table_reschedules_task() {
    let fx = Fixture::new();
    fx.create_table("T", 1);
    let state = fx.hooks.registry.get("T").unwrap();

    state.reslock.block();
    let task = fx
        .taskman
        .create(
            TaskOrigin::Cli,
            StoreKind::WtInsert,
            StoreData::Insert {
                table: "T".into(),
                record: Record::new(1, "a", 1),
            },
            CLI_CLIENT,
        )
        .unwrap();
    task.activate();

    // the worker hits TableBlocked and the task parks on the blocked queue
    let deadline = Instant::now() + Duration::from_secs(2);
    while task.state() != TaskState::BlockedAwaiting {
        assert!(Instant::now() < deadline, "task never parked");
        fx.taskman.update(&*fx.hooks);
        std::thread::sleep(Duration::from_millis(2));
    }

    // unblocking drains the queue and the insert completes
    fx.hooks.table_unblock(&state);
    let deadline = Instant::now() + Duration::from_secs(2);
    while task.state() != TaskState::None {
        assert!(Instant::now() < deadline, "task never completed");
        fx.taskman.update(&*fx.hooks);
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(fx.select("T", 1), Some(Record::new(1, "a", 1)));
}

#[test]
fn empty_dump_leaves_no_file_behind() {
    let fx = Fixture::new();
    fx.create_table("T", 1);
    fx.dump("T");
    assert!(fx.hooks.fs.dump_numbers("T").unwrap().is_empty());
}
