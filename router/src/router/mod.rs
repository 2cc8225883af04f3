//! The router node: parses LQL, picks a shard node per the table's
//! consistency class and forwards the query, retrying around node
//! failures. Also runs LQL scripts with a cooperative per-line quantum.

pub mod config;
pub mod mempool;
pub mod script;
pub mod worker;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stratakv_core::codec;
use stratakv_core::error::{SystemError, TypedResult};
use stratakv_core::gossip::Gossip;
use stratakv_core::lql::{self, Query};
use stratakv_core::net::ClientEvent;
use stratakv_core::protocol::{self, DescribeAssembler, Header};
use stratakv_core::table::{Record, TableMeta};
use stratakv_core::taskman::{Task, TaskHooks, TaskKind, TaskOrigin, TaskState, Taskman};
use stratakv_core::timer::TimerSet;
use stratakv_core::typed_err;

use self::config::RouterConfig;
use self::mempool::Mempool;
use self::script::Script;

// ---------------------------------------------------------------------------
// tasks

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterKind {
    WtCreate,
    WtDrop,
    WtDescribe,
    WtSelect,
    WtInsert,
    WtJournal,
    WtAddMemory,
    WtRun,
}

impl TaskKind for RouterKind {
    fn is_worker(&self) -> bool {
        true
    }
}

/// Task payload: the parsed query plus the response scratch space the
/// demultiplexer fills in.
#[derive(Debug, Default)]
pub struct RouterData {
    pub query: Option<Query>,
    pub script: Option<Script>,
    pub failed_line: Option<usize>,
    pub printable: String,
    pub response_record: Option<Record>,
    pub response_tables: Vec<TableMeta>,
    pub assembler: DescribeAssembler,
}

pub type RouterTask = Task<RouterKind, RouterData>;
pub type RouterTaskman = Taskman<RouterKind, RouterData>;

// ---------------------------------------------------------------------------
// hooks

pub struct RouterHooks {
    pub cfg: RouterConfig,
    pub mempool: Arc<Mempool>,
    taskman: Mutex<Option<Arc<RouterTaskman>>>,
}

impl RouterHooks {
    pub fn taskman(&self) -> Arc<RouterTaskman> {
        Arc::clone(self.taskman.lock().unwrap().as_ref().expect("taskman not wired up"))
    }
}

impl TaskHooks<RouterKind, RouterData> for RouterHooks {
    fn run_worker(&self, task: &Arc<RouterTask>) {
        match task.kind() {
            RouterKind::WtCreate
            | RouterKind::WtDrop
            | RouterKind::WtDescribe
            | RouterKind::WtSelect
            | RouterKind::WtInsert => worker::handle_query(self, task),
            RouterKind::WtJournal => worker::handle_journal(self, task),
            RouterKind::WtAddMemory => worker::handle_add_memory(self, task),
            RouterKind::WtRun => worker::handle_run(self, task),
        }

        let yielded = matches!(
            task.err().map(|e| e.err()),
            Some(SystemError::QuantumExhausted)
        );
        if yielded {
            task.set_state(TaskState::BlockedReschedule);
        } else {
            self.taskman().complete(task);
        }
    }

    fn run_main(&self, task: &Arc<RouterTask>) -> bool {
        warn!("undefined main-thread behaviour for task kind {:?}", task.kind());
        true
    }

    fn completed(&self, task: &Arc<RouterTask>) {
        let origin = task.origin();

        // internal DESCRIBE refreshes the routing metadata
        if task.kind() == RouterKind::WtDescribe && origin != TaskOrigin::Cli {
            if task.err().is_none() {
                task.with_body(|body| self.mempool.feed_tables(&body.data.response_tables));
            }
            return;
        }

        if origin != TaskOrigin::Cli {
            if let Some(err) = task.err() {
                warn!("{:?} failed: {}", task.kind(), err.description());
            }
            return;
        }

        match task.kind() {
            RouterKind::WtRun => {
                let (script_path, failed_line) = task.with_body(|body| {
                    (
                        body.data
                            .script
                            .as_ref()
                            .map(|s| s.path.display().to_string())
                            .unwrap_or_default(),
                        body.data.failed_line,
                    )
                });
                match task.err() {
                    None => info!("script '{script_path}' completed successfully"),
                    Some(err) => info!(
                        "script '{script_path}' failed at line {}: {}",
                        failed_line.unwrap_or(0),
                        err.description()
                    ),
                }
            }
            _ => match task.err() {
                None => {
                    let printable = task.with_body(|body| body.data.printable.clone());
                    if printable.is_empty() {
                        println!("ok");
                    } else {
                        println!("{printable}");
                    }
                }
                Some(err) => println!("error: {}", err.description()),
            },
        }
    }

    fn reschedule(&self, task: &Arc<RouterTask>) {
        if matches!(task.err().map(|e| e.err()), Some(SystemError::QuantumExhausted)) {
            // round-robin: back of the queue, next update re-dispatches
            task.activate();
        } else {
            warn!("undefined reschedule behaviour for task kind {:?}", task.kind());
            self.taskman().complete(task);
        }
    }
}

// ---------------------------------------------------------------------------
// node entry point

#[derive(Debug, Clone, Copy)]
enum RouterTimer {
    Gossip,
    Metadata,
}

/// Runs the router node until EXIT or a termination signal.
pub fn run_router(config_path: &Path) -> TypedResult<()> {
    let cfg: RouterConfig = stratakv_core::config::load(config_path)?;
    cfg.validate()?;

    let mempool = Arc::new(Mempool::new(&cfg.password, cfg.connect_timeout));
    let hooks = Arc::new(RouterHooks {
        cfg: cfg.clone(),
        mempool: Arc::clone(&mempool),
        taskman: Mutex::new(None),
    });
    let taskman = Taskman::new(cfg.workers, RouterKind::WtSelect, hooks.clone() as _);
    *hooks.taskman.lock().unwrap() = Some(Arc::clone(&taskman));

    let seeds: Vec<(String, u16)> = cfg.seeds.iter().map(|s| (s.ip.clone(), s.port)).collect();
    let mut gossip = Gossip::new("router-gossip", &cfg.password, None, &seeds);

    let mut timers: TimerSet<RouterTimer> = TimerSet::new(8);
    timers.add(cfg.gossip_interval, RouterTimer::Gossip);
    timers.add(cfg.metadata_interval, RouterTimer::Metadata);

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .map_err(|e| typed_err!(Init, "signal handler registration failed: {e}"))?;
    }

    let commands = spawn_command_reader();
    gossip.run(); // kick an immediate discovery round

    info!("router node is up");

    while !shutdown.load(Ordering::SeqCst) {
        match commands.try_recv() {
            Ok(line) => {
                if !dispatch_command(&taskman, &line) {
                    shutdown.store(true, Ordering::SeqCst);
                }
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => shutdown.store(true, Ordering::SeqCst),
        }

        for (number, event) in mempool.poll() {
            handle_node_event(&hooks, &taskman, number, event);
        }

        for node in gossip.update() {
            mempool.add(node.number, &node.ip, node.port);
        }

        for (_, tag) in timers.poll() {
            match tag {
                RouterTimer::Gossip => {
                    gossip.run();
                    for node in gossip.known_nodes() {
                        mempool.add(node.number, &node.ip, node.port);
                    }
                }
                RouterTimer::Metadata => {
                    if let Some(task) = taskman.create(
                        TaskOrigin::InternalPriority,
                        RouterKind::WtDescribe,
                        RouterData {
                            query: Some(Query::Describe { table: None }),
                            ..Default::default()
                        },
                        stratakv_core::taskman::CLI_CLIENT,
                    ) {
                        task.activate();
                    }
                }
            }
        }

        taskman.update(&*hooks);
        std::thread::sleep(Duration::from_millis(5));
    }

    info!("router node is shutting down");
    taskman.stop();
    taskman.foreach(|task| {
        task.abort_await(typed_err!(NetShardUnavailable, "shutting down"));
        true
    });
    mempool.disconnect_all();
    taskman.shutdown();
    Ok(())
}

/// Reads LQL command lines from stdin on a dedicated thread.
fn spawn_command_reader() -> Receiver<String> {
    let (tx, rx) = channel();
    std::thread::Builder::new()
        .name("cli".to_owned())
        .spawn(move || {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                match std::io::BufRead::read_line(&mut stdin.lock(), &mut line) {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() && tx.send(trimmed.to_owned()).is_err() {
                            return;
                        }
                    }
                }
            }
        })
        .expect("cli thread spawn failed");
    rx
}

/// Parses one command line and spawns its task. Returns `false` on EXIT.
fn dispatch_command(taskman: &Arc<RouterTaskman>, line: &str) -> bool {
    let query = match lql::parse(line) {
        Ok(query) => query,
        Err(e) => {
            println!("error: {e}");
            return true;
        }
    };

    let (kind, data) = match query {
        Query::Exit => return false,
        Query::Logfile => {
            println!("logging to stderr (RUST_LOG controls the level)");
            return true;
        }
        Query::Run { ref path } => match Script::load(Path::new(path)) {
            Ok(script) => (
                RouterKind::WtRun,
                RouterData {
                    script: Some(script),
                    ..Default::default()
                },
            ),
            Err(e) => {
                println!("error: {}", e.description());
                return true;
            }
        },
        Query::Journal => (RouterKind::WtJournal, RouterData::default()),
        Query::AddMemory { .. } => (
            RouterKind::WtAddMemory,
            RouterData {
                query: Some(query.clone()),
                ..Default::default()
            },
        ),
        Query::Create(_) => (
            RouterKind::WtCreate,
            RouterData {
                query: Some(query.clone()),
                ..Default::default()
            },
        ),
        Query::Drop { .. } => (
            RouterKind::WtDrop,
            RouterData {
                query: Some(query.clone()),
                ..Default::default()
            },
        ),
        Query::Describe { .. } => (
            RouterKind::WtDescribe,
            RouterData {
                query: Some(query.clone()),
                ..Default::default()
            },
        ),
        Query::Select { .. } => (
            RouterKind::WtSelect,
            RouterData {
                query: Some(query.clone()),
                ..Default::default()
            },
        ),
        Query::Insert { .. } => (
            RouterKind::WtInsert,
            RouterData {
                query: Some(query.clone()),
                ..Default::default()
            },
        ),
    };

    match taskman.create(TaskOrigin::Cli, kind, data, stratakv_core::taskman::CLI_CLIENT) {
        Some(task) => task.activate(),
        None => println!("error: the node is shutting down"),
    }
    true
}

/// Routes one shard-node event.
fn handle_node_event(
    hooks: &Arc<RouterHooks>,
    taskman: &Arc<RouterTaskman>,
    number: u16,
    event: ClientEvent,
) {
    match event {
        ClientEvent::Connected => hooks.mempool.on_connected(number),
        ClientEvent::Packet {
            header: Header::Ack,
            ..
        } => hooks.mempool.on_acknowledged(number),
        ClientEvent::Packet { header, payload } => {
            demux_node_response(taskman, header, &payload);
        }
        ClientEvent::ConnectFailed { reason } | ClientEvent::Disconnected { reason } => {
            debug!("shard node #{number} connection lost: {reason}");
            hooks.mempool.on_disconnect(number);
            // wake every task awaiting a reply from this node
            taskman.foreach(|task| {
                let awaiting = task.with_body(|body| body.awaiting_node);
                if awaiting == number {
                    task.abort_await(typed_err!(
                        NetShardUnavailable,
                        "Shard node #{number} is unavailable."
                    ));
                }
                true
            });
        }
    }
}

fn demux_node_response(taskman: &Arc<RouterTaskman>, header: Header, payload: &[u8]) {
    let mut pos = 0;
    let remote_id = codec::read_u16(payload, &mut pos);
    let Some(task) = taskman.get(remote_id) else {
        debug!("shard response {header:?} for unknown task #{remote_id}");
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
                Ok(record) => body.data.response_record = Some(record),
                Err(e) => body.err = Some(e),
            });
        }
        Header::ResDescribe => {
            let done = task.with_body(|body| {
                let (_, done) = body.data.assembler.feed(payload);
                done
            });
            if done {
                task.resume(|body| match body.data.assembler.take() {
                    Ok(tables) => body.data.response_tables = tables,
                    Err(e) => body.err = Some(e),
                });
            }
        }
        other => debug!("unhandled shard response {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratakv_core::error::TypedError;
    use stratakv_core::taskman::CLI_CLIENT;
    use std::time::Instant;

    struct Fixture {
        hooks: Arc<RouterHooks>,
        taskman: Arc<RouterTaskman>,
    }

    impl Fixture {
        fn new() -> Self {
            let cfg: RouterConfig = serde_yaml::from_str(
                "password: a-long-enough-password\n\
                 quantum: 2\n\
                 gossip_interval: 1h\n\
                 metadata_interval: 1h\n",
            )
            .unwrap();
            let mempool = Arc::new(Mempool::new(&cfg.password, cfg.connect_timeout));
            let hooks = Arc::new(RouterHooks {
                cfg,
                mempool,
                taskman: Mutex::new(None),
            });
            let taskman = Taskman::new(2, RouterKind::WtSelect, hooks.clone() as _);
            *hooks.taskman.lock().unwrap() = Some(Arc::clone(&taskman));
            Self { hooks, taskman }
        }

        fn run(&self, kind: RouterKind, data: RouterData) -> (Option<TypedError>, Option<usize>) {
            let task = self
                .taskman
                .create(TaskOrigin::Internal, kind, data, CLI_CLIENT)
                .unwrap();
            task.activate();

            let mut captured = (None, None);
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                match task.state() {
                    TaskState::Completed => {
                        captured = (task.err(), task.with_body(|body| body.data.failed_line));
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
            self.taskman.shutdown();
        }
    }

    #[test]
    fn query_without_nodes_fails_cleanly() {
        let fx = Fixture::new();
        let (err, _) = fx.run(
            RouterKind::WtDescribe,
            RouterData {
                query: Some(Query::Describe { table: None }),
                ..Default::default()
            },
        );
        assert!(err.unwrap().description().contains("no shard nodes"));
    }

    #[test]
    fn select_on_unknown_table_is_a_domain_error() {
        let fx = Fixture::new();
        let (err, _) = fx.run(
            RouterKind::WtSelect,
            RouterData {
                query: Some(Query::Select {
                    table: "T".into(),
                    key: 1,
                }),
                ..Default::default()
            },
        );
        assert!(err.unwrap().description().contains("does not exist"));
    }

    #[test]
    fn script_yields_on_quantum_and_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.lql");
        // five no-op lines with quantum 2: two yields, then completion
        std::fs::write(&path, "LOGFILE\nLOGFILE\nLOGFILE\nLOGFILE\nLOGFILE\n").unwrap();

        let fx = Fixture::new();
        let (err, failed_line) = fx.run(
            RouterKind::WtRun,
            RouterData {
                script: Some(Script::load(&path).unwrap()),
                ..Default::default()
            },
        );
        assert!(err.is_none(), "script failed: {err:?}");
        assert_eq!(failed_line, None);

        let out = std::fs::read_to_string(dir.path().join("demo.lql.out")).unwrap();
        assert_eq!(out.lines().count(), 5);
    }

    #[test]
    fn script_failure_records_the_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.lql");
        std::fs::write(&path, "LOGFILE\nFROBNICATE\nLOGFILE\n").unwrap();

        let fx = Fixture::new();
        let (err, failed_line) = fx.run(
            RouterKind::WtRun,
            RouterData {
                script: Some(Script::load(&path).unwrap()),
                ..Default::default()
            },
        );
        assert!(err.unwrap().description().contains("unknown command"));
        assert_eq!(failed_line, Some(2));
    }

    #[test]
    fn add_memory_for_unknown_node_fails() {
        let fx = Fixture::new();
        let (err, _) = fx.run(
            RouterKind::WtAddMemory,
            RouterData {
                query: Some(Query::AddMemory {
                    shard_number: 7,
                    consistency: stratakv_core::table::Consistency::Eventual,
                }),
                ..Default::default()
            },
        );
        assert!(err.unwrap().description().contains("unknown"));
    }
}
