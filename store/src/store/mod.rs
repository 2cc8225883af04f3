//! The store node: partitioned tables over a block device, periodic dumps
//! and per-table compaction, serving create/drop/describe/select/insert
//! requests from shard nodes.

pub mod config;
pub mod fs;
pub mod memtable;
pub mod worker;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stratakv_core::error::{SystemError, TypedError, TypedResult};
use stratakv_core::net::{NetArgs, SendOutcome, ServerCtx, ServerEvent};
use stratakv_core::protocol::{self, Header};
use stratakv_core::reslock::ResLock;
use stratakv_core::table::{Record, TableMeta};
use stratakv_core::taskman::{Task, TaskHooks, TaskKind, TaskOrigin, Taskman};
use stratakv_core::timer::{TimerHandle, TimerSet};
use stratakv_core::typed_err;

use self::config::StoreConfig;
use self::fs::Filesystem;
use self::memtable::Memtable;

// ---------------------------------------------------------------------------
// tables registry

/// Live state of one table.
pub struct TableState {
    pub meta: TableMeta,
    pub memtable: Mutex<Memtable>,
    /// Brackets every operation; blocked and drained by compaction/drop.
    pub reslock: ResLock,
    /// Task handles parked while the table is blocked.
    pub blocked: Mutex<VecDeque<u16>>,
    /// At most one compaction runs per table.
    pub compacting: AtomicBool,
    pub timer: Mutex<Option<TimerHandle>>,
}

impl TableState {
    pub fn new(meta: TableMeta) -> Arc<Self> {
        let memtable = Memtable::new(&meta.name, meta.partitions);
        Arc::new(Self {
            meta,
            memtable: Mutex::new(memtable),
            reslock: ResLock::new(false),
            blocked: Mutex::new(VecDeque::new()),
            compacting: AtomicBool::new(false),
            timer: Mutex::new(None),
        })
    }
}

/// Concurrent name → table map.
#[derive(Default)]
pub struct Registry {
    tables: Mutex<HashMap<String, Arc<TableState>>>,
}

impl Registry {
    pub fn get(&self, name: &str) -> Option<Arc<TableState>> {
        self.tables.lock().unwrap().get(name).cloned()
    }

    pub fn insert(&self, table: Arc<TableState>) {
        self.tables
            .lock()
            .unwrap()
            .insert(table.meta.name.clone(), table);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<TableState>> {
        self.tables.lock().unwrap().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.lock().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn metas(&self) -> Vec<TableMeta> {
        let mut metas: Vec<TableMeta> = self
            .tables
            .lock()
            .unwrap()
            .values()
            .map(|t| t.meta.clone())
            .collect();
        metas.sort_by(|a, b| a.name.cmp(&b.name));
        metas
    }

    /// Admits an operation on `name`, failing with a domain error when the
    /// table does not exist and `TableBlocked` while it is draining.
    pub fn avail_guard_begin(&self, name: &str) -> TypedResult<Arc<TableState>> {
        let table = self
            .get(name)
            .ok_or_else(|| typed_err!(Generic, "Table '{name}' does not exist."))?;
        if !table.reslock.avail_guard_begin() {
            return Err(typed_err!(
                TableBlocked,
                "Operation cannot be performed at this time since table '{name}' is blocked. Try again later."
            ));
        }
        Ok(table)
    }
}

// ---------------------------------------------------------------------------
// tasks

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    // main-thread tasks
    MtDumpAll,
    MtCompact,
    MtFree,
    // worker-thread tasks
    WtCreate,
    WtDrop,
    WtDescribe,
    WtSelect,
    WtInsert,
    WtDump,
    WtCompact,
}

impl TaskKind for StoreKind {
    fn is_worker(&self) -> bool {
        matches!(
            self,
            StoreKind::WtCreate
                | StoreKind::WtDrop
                | StoreKind::WtDescribe
                | StoreKind::WtSelect
                | StoreKind::WtInsert
                | StoreKind::WtDump
                | StoreKind::WtCompact
        )
    }
}

#[derive(Debug, Clone, Default)]
pub enum StoreData {
    #[default]
    None,
    Create {
        meta: TableMeta,
    },
    Drop {
        table: String,
    },
    Describe {
        table: Option<String>,
        result: Vec<TableMeta>,
    },
    Select {
        table: String,
        key: u16,
        record: Option<Record>,
    },
    Insert {
        table: String,
        record: Record,
    },
    Dump {
        table: String,
    },
    Compact {
        table: String,
        dumps: usize,
        snapshot_blocked: Duration,
        swap_blocked: Duration,
    },
    Free {
        table: String,
    },
}

impl StoreData {
    pub fn table_name(&self) -> Option<&str> {
        match self {
            StoreData::Create { meta } => Some(&meta.name),
            StoreData::Drop { table }
            | StoreData::Select { table, .. }
            | StoreData::Insert { table, .. }
            | StoreData::Dump { table }
            | StoreData::Compact { table, .. }
            | StoreData::Free { table } => Some(table),
            StoreData::Describe { table, .. } => table.as_deref(),
            StoreData::None => None,
        }
    }
}

pub type StoreTask = Task<StoreKind, StoreData>;
pub type StoreTaskman = Taskman<StoreKind, StoreData>;

#[derive(Debug, Clone)]
enum StoreTimer {
    Dump,
    Compact(String),
}

// ---------------------------------------------------------------------------
// hooks

/// Shared node context: everything the worker handlers and the scheduler
/// hooks need to reach.
pub struct StoreHooks {
    pub cfg: StoreConfig,
    pub fs: Arc<Filesystem>,
    pub registry: Arc<Registry>,
    pub server: Arc<ServerCtx>,
    taskman: Mutex<Option<Arc<StoreTaskman>>>,
    timers: Mutex<TimerSet<StoreTimer>>,
}

impl StoreHooks {
    fn taskman(&self) -> Arc<StoreTaskman> {
        Arc::clone(self.taskman.lock().unwrap().as_ref().expect("taskman not wired up"))
    }

    /// Reactivates every task parked on the table's blocked queue.
    pub fn drain_blocked(&self, table: &TableState) {
        let taskman = self.taskman();
        let mut blocked = table.blocked.lock().unwrap();
        while let Some(handle) = blocked.pop_front() {
            if let Some(task) = taskman.get(handle) {
                task.activate();
            }
        }
    }

    /// Unblocks the table and releases its parked tasks.
    pub fn table_unblock(&self, table: &TableState) {
        table.reslock.unblock();
        self.drain_blocked(table);
    }

    fn send_response(&self, task: &StoreTask, header: Header, payload: &[u8]) {
        let client = task.client();
        match self.server.send(client, header, payload) {
            SendOutcome::Ok => {}
            SendOutcome::BufferFull => {
                // a half-written response would poison the stream
                warn!("response to client #{client} dropped (outbound buffer saturated)");
                self.server.disconnect(client, "outbound buffer saturated");
            }
            SendOutcome::Disconnected => {
                debug!("response to client #{client} dropped (peer is gone)");
            }
        }
    }

    fn err_of(task: &StoreTask) -> Result<(), TypedError> {
        match task.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl TaskHooks<StoreKind, StoreData> for StoreHooks {
    fn run_worker(&self, task: &Arc<StoreTask>) {
        match task.kind() {
            StoreKind::WtCreate => worker::handle_create(self, task),
            StoreKind::WtDrop => worker::handle_drop(self, task),
            StoreKind::WtDescribe => worker::handle_describe(self, task),
            StoreKind::WtSelect => worker::handle_select(self, task),
            StoreKind::WtInsert => worker::handle_insert(self, task),
            StoreKind::WtDump => worker::handle_dump(self, task),
            StoreKind::WtCompact => worker::handle_compact(self, task),
            kind => warn!("undefined worker behaviour for task kind {kind:?}"),
        }

        // blocked-resource failures are re-scheduled instead of completed
        let blocked = matches!(
            task.err().map(|e| e.err()),
            Some(SystemError::TableBlocked)
        );
        if blocked {
            task.set_state(stratakv_core::taskman::TaskState::BlockedReschedule);
        } else {
            self.taskman().complete(task);
        }

        if let Some(delay) = self.cfg.delay {
            std::thread::sleep(delay);
        }
    }

    fn run_main(&self, task: &Arc<StoreTask>) -> bool {
        match task.kind() {
            StoreKind::MtDumpAll => {
                let taskman = self.taskman();
                for name in self.registry.names() {
                    if let Some(dump) = taskman.create(
                        TaskOrigin::Internal,
                        StoreKind::WtDump,
                        StoreData::Dump { table: name },
                        stratakv_core::taskman::CLI_CLIENT,
                    ) {
                        dump.activate();
                    }
                }
                true
            }
            StoreKind::MtCompact => {
                let name = task
                    .with_body(|body| body.data.table_name().map(str::to_owned))
                    .unwrap_or_default();
                let Some(table) = self.registry.get(&name) else {
                    return true; // table dropped since the timer fired
                };
                if table.compacting.swap(true, Ordering::SeqCst) {
                    debug!("ignoring compaction for table '{name}' (another one is running)");
                    return true;
                }
                let taskman = self.taskman();
                match taskman.create(
                    TaskOrigin::Internal,
                    StoreKind::WtCompact,
                    StoreData::Compact {
                        table: name,
                        dumps: 0,
                        snapshot_blocked: Duration::ZERO,
                        swap_blocked: Duration::ZERO,
                    },
                    stratakv_core::taskman::CLI_CLIENT,
                ) {
                    Some(compact) => compact.activate(),
                    None => table.compacting.store(false, Ordering::SeqCst),
                }
                true
            }
            StoreKind::MtFree => {
                let name = task
                    .with_body(|body| body.data.table_name().map(str::to_owned))
                    .unwrap_or_default();
                if let Some(table) = self.registry.remove(&name) {
                    if let Some(timer) = table.timer.lock().unwrap().take() {
                        self.timers.lock().unwrap().remove(timer);
                    }
                    // parked tasks retry and observe that the table is gone
                    self.drain_blocked(&table);
                }
                true
            }
            kind => {
                warn!("undefined main-thread behaviour for task kind {kind:?}");
                true
            }
        }
    }

    fn completed(&self, task: &Arc<StoreTask>) {
        let origin = task.origin();
        let api = origin == TaskOrigin::Api;
        let remote_id = task.remote_id();

        match task.kind() {
            StoreKind::WtCreate => {
                if task.err().is_none() {
                    // arm the compaction timer now that the table is live
                    task.with_body(|body| {
                        if let StoreData::Create { meta } = &body.data {
                            if let Some(table) = self.registry.get(&meta.name) {
                                let interval =
                                    Duration::from_millis(meta.compaction_interval_ms as u64);
                                let handle = self
                                    .timers
                                    .lock()
                                    .unwrap()
                                    .add(interval, StoreTimer::Compact(meta.name.clone()));
                                *table.timer.lock().unwrap() = handle;
                            }
                        }
                    });
                }
                if api {
                    let status = protocol::Status::from_result(&Self::err_of(task));
                    self.send_response(
                        task,
                        Header::ResCreate,
                        &protocol::pack_res_generic(remote_id, &status),
                    );
                } else {
                    report_outcome(task, "CREATE");
                }
            }
            StoreKind::WtDrop => {
                if task.err().is_none() {
                    // free the in-memory table state from the main thread
                    let name = task
                        .with_body(|body| body.data.table_name().map(str::to_owned))
                        .unwrap_or_default();
                    if let Some(free) = self.taskman().create(
                        TaskOrigin::Internal,
                        StoreKind::MtFree,
                        StoreData::Free { table: name },
                        stratakv_core::taskman::CLI_CLIENT,
                    ) {
                        free.activate();
                    }
                }
                if api {
                    let status = protocol::Status::from_result(&Self::err_of(task));
                    self.send_response(
                        task,
                        Header::ResDrop,
                        &protocol::pack_res_generic(remote_id, &status),
                    );
                } else {
                    report_outcome(task, "DROP");
                }
            }
            StoreKind::WtDescribe => {
                if api {
                    let result = match task.err() {
                        Some(err) => Err(err),
                        None => Ok(task.with_body(|body| match &body.data {
                            StoreData::Describe { result, .. } => result.clone(),
                            _ => Vec::new(),
                        })),
                    };
                    for chunk in protocol::pack_res_describe(remote_id, &result) {
                        self.send_response(task, Header::ResDescribe, &chunk);
                    }
                } else {
                    report_outcome(task, "DESCRIBE");
                }
            }
            StoreKind::WtSelect => {
                if api {
                    let result = match task.err() {
                        Some(err) => Err(err),
                        None => task.with_body(|body| match &body.data {
                            StoreData::Select { record: Some(r), .. } => Ok(r.clone()),
                            _ => Err(typed_err!(Generic, "select produced no record")),
                        }),
                    };
                    self.send_response(
                        task,
                        Header::ResSelect,
                        &protocol::pack_res_select(remote_id, &result),
                    );
                } else {
                    report_outcome(task, "SELECT");
                }
            }
            StoreKind::WtInsert => {
                if api {
                    let status = protocol::Status::from_result(&Self::err_of(task));
                    self.send_response(
                        task,
                        Header::ResInsert,
                        &protocol::pack_res_generic(remote_id, &status),
                    );
                } else {
                    report_outcome(task, "INSERT");
                }
            }
            StoreKind::WtDump => match task.err() {
                Some(err) => warn!("dump failed: {err}"),
                None => {}
            },
            StoreKind::WtCompact => {
                task.with_body(|body| {
                    if let StoreData::Compact {
                        table,
                        dumps,
                        snapshot_blocked,
                        swap_blocked,
                    } = &body.data
                    {
                        if let Some(state) = self.registry.get(table) {
                            state.compacting.store(false, Ordering::SeqCst);
                        }
                        match &body.err {
                            Some(err) => warn!("compaction of '{table}' failed: {err}"),
                            None => info!(
                                "table '{table}' compacted ({dumps} dumps merged, blocked {:?} + {:?})",
                                snapshot_blocked, swap_blocked
                            ),
                        }
                    }
                });
            }
            kind => debug!("task {kind:?} completed"),
        }
    }

    fn reschedule(&self, task: &Arc<StoreTask>) {
        let name = task.with_body(|body| body.data.table_name().map(str::to_owned));
        let parked = name
            .as_deref()
            .and_then(|name| self.registry.get(name))
            .map(|table| {
                table.blocked.lock().unwrap().push_back(task.handle());
                task.set_state(stratakv_core::taskman::TaskState::BlockedAwaiting);
            })
            .is_some();
        if !parked {
            // the table vanished while we were blocked; retry immediately
            // and let the handler surface the domain error
            task.activate();
        }
    }
}

fn report_outcome(task: &StoreTask, verb: &str) {
    match task.err() {
        Some(err) => warn!("{verb} failed: {}", err.description()),
        None => info!("{verb} completed"),
    }
}

// ---------------------------------------------------------------------------
// node entry point

/// Runs the store node until a termination signal arrives.
pub fn run_store(config_path: &Path) -> TypedResult<()> {
    let cfg: StoreConfig = stratakv_core::config::load(config_path)?;
    cfg.validate()?;

    let fs = Arc::new(Filesystem::init(&cfg.root_dir, cfg.blocks_count, cfg.blocks_size)?);
    let registry = Arc::new(Registry::default());

    // import the tables already on disk
    for name in fs.table_names()? {
        match fs.table_meta(&name) {
            Ok(meta) => registry.insert(TableState::new(meta)),
            Err(e) => warn!("table '{name}' skipped: {e}"),
        }
    }
    info!("{} tables imported from the filesystem", registry.names().len());

    let server = Arc::new(ServerCtx::listen(
        &NetArgs::new("store-api", &cfg.listen_ip, cfg.listen_port)
            .max_clients(cfg.max_clients)
            .validation_timeout(cfg.validation_timeout),
    )?);

    let hooks = Arc::new(StoreHooks {
        cfg: cfg.clone(),
        fs,
        registry: Arc::clone(&registry),
        server: Arc::clone(&server),
        taskman: Mutex::new(None),
        timers: Mutex::new(TimerSet::new(stratakv_core::table::MAX_TABLES as u16)),
    });

    let taskman = Taskman::new(cfg.workers, StoreKind::WtInsert, hooks.clone() as _);
    *hooks.taskman.lock().unwrap() = Some(Arc::clone(&taskman));

    {
        let mut timers = hooks.timers.lock().unwrap();
        timers.add(cfg.dump_interval, StoreTimer::Dump);
        for name in registry.names() {
            if let Some(table) = registry.get(&name) {
                let interval = Duration::from_millis(table.meta.compaction_interval_ms as u64);
                *table.timer.lock().unwrap() = timers.add(interval, StoreTimer::Compact(name));
            }
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .map_err(|e| typed_err!(Init, "signal handler registration failed: {e}"))?;
    }

    info!("store node is up");

    while !shutdown.load(Ordering::SeqCst) {
        for event in server.poll_events(Some(Duration::from_millis(10))) {
            handle_server_event(&hooks, &taskman, event);
        }

        let expired = hooks.timers.lock().unwrap().poll();
        for (_, tag) in expired {
            let (kind, data) = match tag {
                StoreTimer::Dump => (StoreKind::MtDumpAll, StoreData::None),
                StoreTimer::Compact(table) => {
                    (StoreKind::MtCompact, StoreData::Compact {
                        table,
                        dumps: 0,
                        snapshot_blocked: Duration::ZERO,
                        swap_blocked: Duration::ZERO,
                    })
                }
            };
            if let Some(task) =
                taskman.create(TaskOrigin::Internal, kind, data, stratakv_core::taskman::CLI_CLIENT)
            {
                task.activate();
            }
        }

        taskman.update(&*hooks);
    }

    info!("store node is shutting down");
    taskman.stop();
    server.destroy();
    taskman.shutdown();
    Ok(())
}

/// Maps inbound packets onto tasks.
fn handle_server_event(hooks: &Arc<StoreHooks>, taskman: &Arc<StoreTaskman>, event: ServerEvent) {
    let ServerEvent::Packet {
        client,
        header,
        payload,
    } = event
    else {
        return;
    };

    match header {
        Header::Auth => {
            let (password, identity) = protocol::unpack_auth(&payload);
            if password == hooks.cfg.password {
                hooks.server.validate(client);
                hooks
                    .server
                    .send(client, Header::Ack, &protocol::pack_ack(hooks.cfg.value_size));
                if let Some(peer) = identity {
                    debug!("shard node #{} authenticated", peer.number);
                }
            } else {
                hooks.server.disconnect(client, "authentication failed");
            }
        }
        Header::ReqCreate => {
            let (remote_id, meta) = protocol::unpack_req_create(&payload);
            spawn_api_task(taskman, client, remote_id, StoreKind::WtCreate, StoreData::Create { meta });
        }
        Header::ReqDrop => {
            let (remote_id, table) = protocol::unpack_req_drop(&payload);
            spawn_api_task(taskman, client, remote_id, StoreKind::WtDrop, StoreData::Drop { table });
        }
        Header::ReqDescribe => {
            let (remote_id, table) = protocol::unpack_req_describe(&payload);
            spawn_api_task(
                taskman,
                client,
                remote_id,
                StoreKind::WtDescribe,
                StoreData::Describe {
                    table,
                    result: Vec::new(),
                },
            );
        }
        Header::ReqSelect => {
            let (remote_id, table, key) = protocol::unpack_req_select(&payload);
            spawn_api_task(
                taskman,
                client,
                remote_id,
                StoreKind::WtSelect,
                StoreData::Select {
                    table,
                    key,
                    record: None,
                },
            );
        }
        Header::ReqInsert => {
            let (remote_id, table, record) = protocol::unpack_req_insert(&payload);
            spawn_api_task(
                taskman,
                client,
                remote_id,
                StoreKind::WtInsert,
                StoreData::Insert { table, record },
            );
        }
        other => debug!("unhandled packet {other:?} from client #{client}"),
    }
}

fn spawn_api_task(
    taskman: &Arc<StoreTaskman>,
    client: u16,
    remote_id: u16,
    kind: StoreKind,
    data: StoreData,
) {
    if let Some(task) = taskman.create(TaskOrigin::Api, kind, data, client) {
        task.with_body(|body| body.remote_id = remote_id);
        task.activate();
    }
}
