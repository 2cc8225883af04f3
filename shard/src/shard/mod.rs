//! The shard node: a page-cached in-memory tier fronting the store node,
//! serving reads and writes for the router and draining modified pages to
//! the store through journals.

pub mod config;
pub mod pagecache;
pub mod worker;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stratakv_core::codec;
use stratakv_core::config::ConfigWatcher;
use stratakv_core::error::{SystemError, TypedError, TypedResult};
use stratakv_core::gossip::Gossip;
use stratakv_core::net::{
    ClientCtx, ClientEvent, NetArgs, SendOutcome, ServerCtx, ServerEvent,
};
use stratakv_core::protocol::{self, DescribeAssembler, Header, NodeIdentity};
use stratakv_core::table::{Record, TableMeta};
use stratakv_core::taskman::{Task, TaskHooks, TaskKind, TaskOrigin, Taskman};
use stratakv_core::timer::TimerSet;
use stratakv_core::typed_err;

use self::config::ShardConfig;
use self::pagecache::PageCache;

// ---------------------------------------------------------------------------
// tasks

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    WtCreate,
    WtDrop,
    WtDescribe,
    WtSelect,
    WtInsert,
    WtJournal,
}

impl TaskKind for ShardKind {
    fn is_worker(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub enum ShardData {
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
        assembler: DescribeAssembler,
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
    Journal {
        blocked: Duration,
    },
}

impl ShardData {
    pub fn table_name(&self) -> Option<&str> {
        match self {
            ShardData::Create { meta } => Some(&meta.name),
            ShardData::Drop { table }
            | ShardData::Select { table, .. }
            | ShardData::Insert { table, .. } => Some(table),
            ShardData::Describe { table, .. } => table.as_deref(),
            ShardData::None | ShardData::Journal { .. } => None,
        }
    }
}

pub type ShardTask = Task<ShardKind, ShardData>;
pub type ShardTaskman = Taskman<ShardKind, ShardData>;

// ---------------------------------------------------------------------------
// hooks

pub struct ShardHooks {
    pub cfg: ShardConfig,
    pub cache: Arc<PageCache>,
    pub server: Arc<ServerCtx>,
    pub store: Arc<ClientCtx>,
    taskman: Mutex<Option<Arc<ShardTaskman>>>,
    /// Value size advertised by the store on ACK.
    store_value_size: AtomicU16,
}

impl ShardHooks {
    pub fn taskman(&self) -> Arc<ShardTaskman> {
        Arc::clone(self.taskman.lock().unwrap().as_ref().expect("taskman not wired up"))
    }

    fn send_response(&self, task: &ShardTask, header: Header, payload: &[u8]) {
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

    fn err_of(task: &ShardTask) -> Result<(), TypedError> {
        match task.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl TaskHooks<ShardKind, ShardData> for ShardHooks {
    fn run_worker(&self, task: &Arc<ShardTask>) {
        match task.kind() {
            ShardKind::WtCreate => worker::handle_create(self, task),
            ShardKind::WtDrop => worker::handle_drop(self, task),
            ShardKind::WtDescribe => worker::handle_describe(self, task),
            ShardKind::WtSelect => worker::handle_select(self, task),
            ShardKind::WtInsert => worker::handle_insert(self, task),
            ShardKind::WtJournal => worker::handle_journal(self, task),
        }

        let blocked = matches!(
            task.err().map(|e| e.err()),
            Some(SystemError::MemoryFull)
                | Some(SystemError::MemoryBlocked)
                | Some(SystemError::TableBlocked)
        );
        if blocked {
            task.set_state(stratakv_core::taskman::TaskState::BlockedReschedule);
        } else {
            self.taskman().complete(task);
        }
    }

    fn run_main(&self, task: &Arc<ShardTask>) -> bool {
        warn!("undefined main-thread behaviour for task kind {:?}", task.kind());
        true
    }

    fn completed(&self, task: &Arc<ShardTask>) {
        let api = task.origin() == TaskOrigin::Api;
        let remote_id = task.remote_id();

        match task.kind() {
            ShardKind::WtCreate => {
                if api {
                    let status = protocol::Status::from_result(&Self::err_of(task));
                    self.send_response(task, Header::ResCreate, &protocol::pack_res_generic(remote_id, &status));
                }
            }
            ShardKind::WtDrop => {
                if api {
                    let status = protocol::Status::from_result(&Self::err_of(task));
                    self.send_response(task, Header::ResDrop, &protocol::pack_res_generic(remote_id, &status));
                }
            }
            ShardKind::WtDescribe => {
                if api {
                    let result = match task.err() {
                        Some(err) => Err(err),
                        None => Ok(task.with_body(|body| match &body.data {
                            ShardData::Describe { result, .. } => result.clone(),
                            _ => Vec::new(),
                        })),
                    };
                    for chunk in protocol::pack_res_describe(remote_id, &result) {
                        self.send_response(task, Header::ResDescribe, &chunk);
                    }
                }
            }
            ShardKind::WtSelect => {
                if api {
                    let result = match task.err() {
                        Some(err) => Err(err),
                        None => task.with_body(|body| match &body.data {
                            ShardData::Select { record: Some(r), .. } => Ok(r.clone()),
                            _ => Err(typed_err!(Generic, "select produced no record")),
                        }),
                    };
                    self.send_response(task, Header::ResSelect, &protocol::pack_res_select(remote_id, &result));
                }
            }
            ShardKind::WtInsert => {
                if api {
                    let status = protocol::Status::from_result(&Self::err_of(task));
                    self.send_response(task, Header::ResInsert, &protocol::pack_res_generic(remote_id, &status));
                }
            }
            ShardKind::WtJournal => match task.err() {
                Some(err) => warn!("memory journal failed: {}", err.description()),
                None => {
                    let blocked = task.with_body(|body| match &body.data {
                        ShardData::Journal { blocked } => *blocked,
                        _ => Duration::ZERO,
                    });
                    info!("memory journal completed ({blocked:?} blocked)");
                }
            },
        }
    }

    fn reschedule(&self, task: &Arc<ShardTask>) {
        let kind = task.err().map(|e| e.err());
        match kind {
            Some(SystemError::MemoryFull) => {
                if self.cache.journal_claim() {
                    spawn_journal_task(self, TaskOrigin::InternalPriority);
                }
                self.cache.park(task.handle());
                task.set_state(stratakv_core::taskman::TaskState::BlockedAwaiting);
            }
            Some(SystemError::MemoryBlocked) => {
                self.cache.park(task.handle());
                task.set_state(stratakv_core::taskman::TaskState::BlockedAwaiting);
            }
            _ => {
                // blocked tables only happen around a drop; surface the
                // error instead of waiting for a table that is going away
                self.taskman().complete(task);
            }
        }
    }
}

/// Creates and activates a journal task. The caller must have claimed the
/// journal slot.
pub(crate) fn spawn_journal_task(hooks: &ShardHooks, origin: TaskOrigin) {
    let taskman = hooks.taskman();
    match taskman.create(
        origin,
        ShardKind::WtJournal,
        ShardData::Journal { blocked: Duration::ZERO },
        stratakv_core::taskman::CLI_CLIENT,
    ) {
        Some(task) => task.activate(),
        None => hooks.cache.journal_release(),
    }
}

// ---------------------------------------------------------------------------
// node entry point

#[derive(Debug, Clone)]
enum ShardTimer {
    Journal,
    Gossip,
}

/// Runs the shard node until a termination signal arrives or the store
/// link is permanently lost.
pub fn run_shard(config_path: &Path) -> TypedResult<()> {
    let cfg: ShardConfig = stratakv_core::config::load(config_path)?;
    cfg.validate()?;

    let cache = Arc::new(PageCache::new(cfg.mem_size.as_u64() as usize, cfg.value_size)?);
    cache.set_delay(cfg.delay_mem);
    info!(
        "page cache sized at {} frames of {} bytes",
        cache.frame_max(),
        cache.frame_size()
    );

    let server = Arc::new(ServerCtx::listen(
        &NetArgs::new("shard-api", &cfg.listen_ip, cfg.listen_port)
            .max_clients(cfg.max_clients)
            .validation_timeout(cfg.validation_timeout),
    )?);

    let store = Arc::new(ClientCtx::connect(
        &NetArgs::new("store-link", &cfg.store_ip, cfg.store_port)
            .connect_blocking(cfg.connect_timeout),
    )?);
    store.send(
        Header::Auth,
        &protocol::pack_auth(&cfg.store_password, Some(&identity(&cfg))),
    );

    let hooks = Arc::new(ShardHooks {
        cfg: cfg.clone(),
        cache: Arc::clone(&cache),
        server: Arc::clone(&server),
        store: Arc::clone(&store),
        taskman: Mutex::new(None),
        store_value_size: AtomicU16::new(0),
    });

    let taskman = Taskman::new(cfg.workers, ShardKind::WtInsert, hooks.clone() as _);
    *hooks.taskman.lock().unwrap() = Some(Arc::clone(&taskman));

    let seeds: Vec<(String, u16)> = cfg.seeds.iter().map(|s| (s.ip.clone(), s.port)).collect();
    let mut gossip = Gossip::new("shard-gossip", &cfg.password, Some(identity(&cfg)), &seeds);

    let mut timers: TimerSet<ShardTimer> = TimerSet::new(8);
    let journal_timer = timers.add(cfg.journal_interval, ShardTimer::Journal);
    let gossip_timer = timers.add(cfg.gossip_interval, ShardTimer::Gossip);

    let watcher = ConfigWatcher::new(config_path)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .map_err(|e| typed_err!(Init, "signal handler registration failed: {e}"))?;
    }

    info!("shard node #{} is up", cfg.number);

    while !shutdown.load(Ordering::SeqCst) {
        for event in server.poll_events(Some(Duration::from_millis(5))) {
            handle_server_event(&hooks, &taskman, &mut gossip, event);
        }

        for event in store.poll_events(Some(Duration::ZERO)) {
            if handle_store_event(&hooks, &taskman, event) {
                // permanent store loss: shut down cleanly
                shutdown.store(true, Ordering::SeqCst);
            }
        }

        gossip.update();

        for (_, tag) in timers.poll() {
            match tag {
                ShardTimer::Journal => {
                    if hooks.cache.journal_claim() {
                        spawn_journal_task(&hooks, TaskOrigin::Internal);
                    }
                }
                ShardTimer::Gossip => gossip.run(),
            }
        }

        if watcher.changed() {
            match stratakv_core::config::load::<ShardConfig>(config_path) {
                Ok(fresh) => {
                    cache.set_delay(fresh.delay_mem);
                    if let Some(t) = journal_timer {
                        timers.reschedule(t, fresh.journal_interval);
                    }
                    if let Some(t) = gossip_timer {
                        timers.reschedule(t, fresh.gossip_interval);
                    }
                    info!("configuration file successfully reloaded");
                }
                Err(e) => warn!("configuration file reload failed: {e}"),
            }
        }

        taskman.update(&*hooks);
    }

    info!("shard node is shutting down");
    taskman.stop();
    // signal each awaiting task's response slot so no worker stays parked
    // in wait_response past this point
    taskman.foreach(|task| {
        task.abort_await(typed_err!(NetStoreUnavailable, "shutting down"));
        true
    });
    // closing the contexts releases workers blocked in wait_outbound
    store.destroy();
    server.destroy();
    taskman.shutdown();
    Ok(())
}

fn identity(cfg: &ShardConfig) -> NodeIdentity {
    NodeIdentity {
        number: cfg.number,
        ip: cfg.listen_ip.clone(),
        port: cfg.listen_port,
    }
}

/// Maps inbound packets from routers and gossiping peers onto tasks.
fn handle_server_event(
    hooks: &Arc<ShardHooks>,
    taskman: &Arc<ShardTaskman>,
    gossip: &mut Gossip,
    event: ServerEvent,
) {
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
                    gossip.add(&peer.ip, peer.port, peer.number);
                }
            } else {
                hooks.server.disconnect(client, "authentication failed");
            }
        }
        Header::ReqGossip => {
            let nodes = gossip.known_nodes();
            hooks
                .server
                .send(client, Header::ResGossip, &protocol::pack_res_gossip(&nodes));
        }
        Header::ReqJournal => {
            if hooks.cache.journal_claim() {
                spawn_journal_task(hooks, TaskOrigin::Internal);
            } else {
                debug!("ignoring journal request (one is already running)");
            }
        }
        Header::ReqCreate => {
            let (remote_id, meta) = protocol::unpack_req_create(&payload);
            spawn_api_task(taskman, client, remote_id, ShardKind::WtCreate, ShardData::Create { meta });
        }
        Header::ReqDrop => {
            let (remote_id, table) = protocol::unpack_req_drop(&payload);
            spawn_api_task(taskman, client, remote_id, ShardKind::WtDrop, ShardData::Drop { table });
        }
        Header::ReqDescribe => {
            let (remote_id, table) = protocol::unpack_req_describe(&payload);
            spawn_api_task(
                taskman,
                client,
                remote_id,
                ShardKind::WtDescribe,
                ShardData::Describe {
                    table,
                    assembler: DescribeAssembler::new(),
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
                ShardKind::WtSelect,
                ShardData::Select {
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
                ShardKind::WtInsert,
                ShardData::Insert { table, record },
            );
        }
        other => debug!("unhandled packet {other:?} from client #{client}"),
    }
}

fn spawn_api_task(
    taskman: &Arc<ShardTaskman>,
    client: u16,
    remote_id: u16,
    kind: ShardKind,
    data: ShardData,
) {
    if let Some(task) = taskman.create(TaskOrigin::Api, kind, data, client) {
        task.with_body(|body| body.remote_id = remote_id);
        task.activate();
    }
}

/// Demultiplexes store responses back onto their awaiting tasks. Returns
/// `true` when the store connection is gone for good.
fn handle_store_event(
    hooks: &Arc<ShardHooks>,
    taskman: &Arc<ShardTaskman>,
    event: ClientEvent,
) -> bool {
    match event {
        ClientEvent::Connected => {
            hooks.store.send(
                Header::Auth,
                &protocol::pack_auth(&hooks.cfg.store_password, Some(&identity(&hooks.cfg))),
            );
            false
        }
        ClientEvent::Packet {
            header: Header::Ack,
            payload,
        } => {
            hooks.store.validate();
            let value_size = protocol::unpack_ack(&payload);
            hooks.store_value_size.store(value_size, Ordering::SeqCst);
            if value_size != hooks.cfg.value_size {
                warn!(
                    "store negotiated value size {value_size} differs from ours ({})",
                    hooks.cfg.value_size
                );
            }
            info!("store link established");
            false
        }
        ClientEvent::Packet { header, payload } => {
            demux_store_response(taskman, header, &payload);
            false
        }
        ClientEvent::ConnectFailed { reason } | ClientEvent::Disconnected { reason } => {
            error!("store link lost: {reason}");
            taskman.foreach(|task| {
                task.abort_await(typed_err!(NetStoreUnavailable, "store node is unavailable"));
                true
            });
            true
        }
    }
}

fn demux_store_response(taskman: &Arc<ShardTaskman>, header: Header, payload: &[u8]) {
    let mut pos = 0;
    let remote_id = codec::read_u16(payload, &mut pos);
    let Some(task) = taskman.get(remote_id) else {
        debug!("store response {header:?} for unknown task #{remote_id}");
        return;
    };

    match header {
        Header::ResCreate | Header::ResDrop | Header::ResInsert => {
            let (_, status) = protocol::unpack_res_generic(payload);
            task.resume(|body| body.err = status.into_result().err());
        }
        Header::ResSelect => {
            let (_, result) = protocol::unpack_res_select(payload);
            task.resume(|body| match result {
                Ok(record) => {
                    if let ShardData::Select { record: slot, .. } = &mut body.data {
                        *slot = Some(record);
                    }
                }
                Err(e) => body.err = Some(e),
            });
        }
        Header::ResDescribe => {
            // chunked: feed the assembler, resume only on the last chunk
            let done = task.with_body(|body| {
                if let ShardData::Describe { assembler, .. } = &mut body.data {
                    let (_, done) = assembler.feed(payload);
                    done
                } else {
                    true
                }
            });
            if done {
                task.resume(|body| {
                    if let ShardData::Describe { assembler, result, .. } = &mut body.data {
                        match assembler.take() {
                            Ok(tables) => *result = tables,
                            Err(e) => body.err = Some(e),
                        }
                    }
                });
            }
        }
        other => debug!("unhandled store response {other:?}"),
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use std::time::Instant;
    use stratakv_core::taskman::{TaskState, CLI_CLIENT};

    /// A shard node without a live store: the client context points at a
    /// listener nobody polls, so its connect never resolves and every send
    /// observes `Disconnected`.
    pub struct Fixture {
        pub hooks: Arc<ShardHooks>,
        pub taskman: Arc<ShardTaskman>,
        _sink: std::net::TcpListener,
    }

    impl Fixture {
        pub fn new(frames: u16) -> Self {
            let sink = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let sink_port = sink.local_addr().unwrap().port();

            let mut cfg: ShardConfig = serde_yaml::from_str(
                "number: 1\n\
                 listen_ip: 127.0.0.1\n\
                 listen_port: 0\n\
                 password: a-long-enough-password\n\
                 store_ip: 127.0.0.1\n\
                 store_port: 9\n\
                 store_password: a-long-enough-password\n\
                 mem_size: 1MB\n\
                 value_size: 6\n\
                 journal_interval: 1h\n\
                 gossip_interval: 1h\n",
            )
            .unwrap();
            cfg.store_port = sink_port;

            // value_size 6 → 16-byte frames
            let cache = Arc::new(PageCache::new(frames as usize * 16, cfg.value_size).unwrap());
            let server =
                Arc::new(ServerCtx::listen(&NetArgs::new("test-api", "127.0.0.1", 0)).unwrap());
            let store = Arc::new(
                ClientCtx::connect(&NetArgs::new("test-store", &cfg.store_ip, cfg.store_port))
                    .unwrap(),
            );

            let hooks = Arc::new(ShardHooks {
                cfg,
                cache,
                server,
                store,
                taskman: Mutex::new(None),
                store_value_size: AtomicU16::new(0),
            });
            let taskman = Taskman::new(2, ShardKind::WtInsert, hooks.clone() as _);
            *hooks.taskman.lock().unwrap() = Some(Arc::clone(&taskman));

            Self {
                hooks,
                taskman,
                _sink: sink,
            }
        }

        /// Runs one task through the scheduler, capturing its error in the
        /// window between completion and slot reuse.
        pub fn run(
            &self,
            kind: ShardKind,
            data: ShardData,
        ) -> (Option<TypedError>, Option<Record>) {
            let task = self
                .taskman
                .create(TaskOrigin::Cli, kind, data, CLI_CLIENT)
                .unwrap();
            task.activate();

            let mut captured = (None, None);
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                match task.state() {
                    TaskState::Completed => {
                        captured = (
                            task.err(),
                            task.with_body(|body| match &body.data {
                                ShardData::Select { record, .. } => record.clone(),
                                ShardData::Insert { record, .. } => Some(record.clone()),
                                _ => None,
                            }),
                        );
                    }
                    TaskState::None => return captured,
                    _ => {}
                }
                assert!(Instant::now() < deadline, "task {kind:?} did not finish in time");
                self.taskman.update(&*self.hooks);
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.taskman.stop();
            self.hooks.store.destroy();
            self.hooks.server.destroy();
            self.taskman.shutdown();
        }
    }
}
