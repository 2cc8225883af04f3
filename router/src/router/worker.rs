//! Worker-thread handlers of the router node.
//!
//! Queries pick a shard node through the pool, send the request and park
//! on the task's response slot. A node that disappears mid-request wakes
//! the task with `NetShardUnavailable`; the request is then retried
//! against whatever node the next selection returns.

use std::sync::Arc;

use stratakv_core::error::SystemError;
use stratakv_core::lql::Query;
use stratakv_core::net::SendOutcome;
use stratakv_core::protocol::{self, Header};
use stratakv_core::table::Record;
use stratakv_core::taskman::TaskState;
use stratakv_core::typed_err;

use super::mempool::Selection;
use super::{RouterData, RouterHooks, RouterTask};

/// Upper bound on node re-selections for one request; each retry means a
/// node died mid-flight, so this only trips on a collapsing pool.
const MAX_RETRIES: u32 = 8;

pub fn handle_query(hooks: &RouterHooks, task: &Arc<RouterTask>) {
    let query = task.with_body(|body| body.data.query.clone());
    let Some(query) = query else { return };

    match execute_query(hooks, task, &query) {
        Ok(result) => task.with_body(|body| body.data.printable = result),
        Err(e) => task.set_err(e),
    }
}

pub fn handle_add_memory(hooks: &RouterHooks, task: &Arc<RouterTask>) {
    let query = task.with_body(|body| body.data.query.clone());
    let Some(Query::AddMemory {
        shard_number,
        consistency,
    }) = query
    else {
        return;
    };
    if let Err(e) = hooks.mempool.assign(shard_number, consistency) {
        task.set_err(e);
    }
}

pub fn handle_journal(hooks: &RouterHooks, task: &Arc<RouterTask>) {
    let mut asked = 0usize;
    for number in hooks.mempool.connected_numbers() {
        match hooks.mempool.send(number, Header::ReqJournal, &[]) {
            SendOutcome::Ok => asked += 1,
            outcome => warn!("journal request to shard node #{number} failed: {outcome:?}"),
        }
    }
    if asked == 0 {
        task.set_err(typed_err!(Generic, "There are no shard nodes to journal."));
    } else {
        task.with_body(|body| body.data.printable = format!("journal requested on {asked} nodes"));
    }
}

pub fn handle_run(hooks: &RouterHooks, task: &Arc<RouterTask>) {
    for _ in 0..hooks.cfg.quantum {
        let line = task.with_body(|body| {
            body.data
                .script
                .as_ref()
                .and_then(|s| s.peek().map(|line| (s.line_number(), line.to_owned())))
        });

        let Some((line_number, line)) = line else {
            return; // script finished
        };

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            task.with_body(|body| {
                if let Some(script) = body.data.script.as_mut() {
                    script.advance();
                }
            });
            continue;
        }

        let outcome = match stratakv_core::lql::parse(trimmed) {
            Ok(Query::Exit) => {
                task.with_body(|body| {
                    if let Some(script) = body.data.script.as_mut() {
                        script.finish();
                    }
                });
                return;
            }
            Ok(Query::Run { .. }) => Err(typed_err!(Generic, "RUN cannot be nested in a script")),
            Ok(Query::Logfile) => Ok(String::new()),
            Ok(Query::Journal) => {
                handle_journal(hooks, task);
                match task.err() {
                    Some(e) => {
                        task.with_body(|body| body.err = None);
                        Err(e)
                    }
                    None => Ok(task.with_body(|body| std::mem::take(&mut body.data.printable))),
                }
            }
            Ok(Query::AddMemory {
                shard_number,
                consistency,
            }) => hooks
                .mempool
                .assign(shard_number, consistency)
                .map(|_| format!("shard node #{shard_number} assigned")),
            Ok(query) => execute_query(hooks, task, &query),
            Err(e) => Err(typed_err!(Generic, "{e}")),
        };

        let (failed, output) = match &outcome {
            Ok(text) => (false, text.clone()),
            Err(e) => (true, e.description()),
        };
        task.with_body(|body| {
            if let Some(script) = body.data.script.as_ref() {
                let _ = script.append_output(line_number, &output);
            }
        });

        if failed {
            task.with_body(|body| {
                body.data.failed_line = Some(line_number);
                if let Some(script) = body.data.script.as_mut() {
                    script.finish();
                }
            });
            task.set_err(outcome.unwrap_err());
            return;
        }

        task.with_body(|body| {
            if let Some(script) = body.data.script.as_mut() {
                script.advance();
            }
        });
    }

    let finished = task.with_body(|body| {
        body.data
            .script
            .as_ref()
            .map(|s| s.is_finished())
            .unwrap_or(true)
    });
    if !finished {
        // cooperative yield so other tasks interleave with the script
        task.set_err(typed_err!(QuantumExhausted, "script quantum exhausted"));
    }
}

/// Executes one forwarded query and renders its result.
pub(crate) fn execute_query(
    hooks: &RouterHooks,
    task: &Arc<RouterTask>,
    query: &Query,
) -> Result<String, stratakv_core::error::TypedError> {
    let remote_id = task.handle();
    let (selection, header, payload) = match query {
        Query::Create(meta) => (
            Selection::Create(meta.consistency),
            Header::ReqCreate,
            protocol::pack_req_create(remote_id, meta),
        ),
        Query::Drop { table } => (
            Selection::ByTable {
                table: table.clone(),
                key: 0,
            },
            Header::ReqDrop,
            protocol::pack_req_drop(remote_id, table),
        ),
        Query::Describe { table } => (
            Selection::Describe,
            Header::ReqDescribe,
            protocol::pack_req_describe(remote_id, table.as_deref()),
        ),
        Query::Select { table, key } => (
            Selection::ByTable {
                table: table.clone(),
                key: *key,
            },
            Header::ReqSelect,
            protocol::pack_req_select(remote_id, table, *key),
        ),
        Query::Insert { table, record } => (
            Selection::ByTable {
                table: table.clone(),
                key: record.key,
            },
            Header::ReqInsert,
            protocol::pack_req_insert(remote_id, table, record),
        ),
        other => {
            return Err(typed_err!(Generic, "{} cannot be forwarded to a shard node", other.verb()))
        }
    };

    request_shard(hooks, task, &selection, header, &payload)?;
    Ok(render_result(task, query))
}

/// Sends one request, awaiting the reply; re-selects a node whenever the
/// current one disappears.
fn request_shard(
    hooks: &RouterHooks,
    task: &Arc<RouterTask>,
    selection: &Selection,
    header: Header,
    payload: &[u8],
) -> Result<(), stratakv_core::error::TypedError> {
    for _ in 0..MAX_RETRIES {
        task.with_body(|body| {
            body.err = None;
            body.data.response_record = None;
            body.data.response_tables.clear();
            body.data.assembler = Default::default();
        });

        let number = match hooks.mempool.get(selection) {
            Ok(number) => number,
            Err(e) => {
                task.set_state(TaskState::Running);
                return Err(e);
            }
        };

        task.begin_await(number);
        let sent = loop {
            match hooks.mempool.send(number, header, payload) {
                SendOutcome::Ok => break true,
                SendOutcome::BufferFull => {
                    if hooks.mempool.wait_outbound(number) == SendOutcome::Disconnected {
                        break false;
                    }
                }
                SendOutcome::Disconnected => break false,
            }
        };
        if !sent {
            // this node is gone; pick another
            task.set_state(TaskState::Running);
            continue;
        }

        task.wait_response();
        match task.err().map(|e| e.err()) {
            Some(SystemError::NetShardUnavailable) => continue, // failover
            Some(_) => return Err(task.err().unwrap()),
            None => return Ok(()),
        }
    }

    task.set_state(TaskState::Running);
    Err(typed_err!(NetShardUnavailable, "no shard node completed the request"))
}

fn render_result(task: &Arc<RouterTask>, query: &Query) -> String {
    match query {
        Query::Select { .. } => task.with_body(|body| match &body.data.response_record {
            Some(Record {
                key,
                timestamp,
                value,
            }) => format!("{key} \"{value}\" {timestamp}"),
            None => "ok".to_owned(),
        }),
        Query::Describe { .. } => task.with_body(|body| {
            body.data
                .response_tables
                .iter()
                .map(|meta| {
                    format!(
                        "{} {} {} {}",
                        meta.name, meta.consistency, meta.partitions, meta.compaction_interval_ms
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }),
        _ => "ok".to_owned(),
    }
}
