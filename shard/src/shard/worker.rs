//! Worker-thread handlers of the shard node.
//!
//! Reads and writes are served from the page cache; everything the cache
//! cannot answer is forwarded to the store node and awaited on the task's
//! response slot.

use std::sync::Arc;

use stratakv_core::net::SendOutcome;
use stratakv_core::protocol::{self, Header};
use stratakv_core::table::{epoch_ms, Record};
use stratakv_core::typed_err;

use super::{ShardData, ShardHooks, ShardTask};

/// Sends a request to the store node and parks the worker until the
/// response handler resumes the task. Returns `false` when the request
/// could not be sent; the task error is already set in that case.
fn forward_to_store(hooks: &ShardHooks, task: &Arc<ShardTask>, header: Header, payload: &[u8]) -> bool {
    task.begin_await(0);
    loop {
        match hooks.store.send(header, payload) {
            SendOutcome::Ok => break,
            SendOutcome::BufferFull => {
                if hooks.store.wait_outbound(None) == SendOutcome::Disconnected {
                    task.resume(|body| {
                        body.err = Some(typed_err!(NetStoreUnavailable, "store node is unavailable"))
                    });
                    return false;
                }
            }
            SendOutcome::Disconnected => {
                task.resume(|body| {
                    body.err = Some(typed_err!(NetStoreUnavailable, "store node is unavailable"))
                });
                return false;
            }
        }
    }
    task.wait_response();
    task.err().is_none()
}

pub fn handle_create(hooks: &ShardHooks, task: &Arc<ShardTask>) {
    let meta = task.with_body(|body| match &body.data {
        ShardData::Create { meta } => Some(meta.clone()),
        _ => None,
    });
    let Some(meta) = meta else { return };

    let payload = protocol::pack_req_create(task.handle(), &meta);
    forward_to_store(hooks, task, Header::ReqCreate, &payload);
}

pub fn handle_drop(hooks: &ShardHooks, task: &Arc<ShardTask>) {
    let table = task.with_body(|body| body.data.table_name().map(str::to_owned));
    let Some(table) = table else { return };

    let payload = protocol::pack_req_drop(task.handle(), &table);
    if forward_to_store(hooks, task, Header::ReqDrop, &payload) {
        // stop serving cached pages of the dropped table
        hooks.cache.segment_remove(&table);
    }
}

pub fn handle_describe(hooks: &ShardHooks, task: &Arc<ShardTask>) {
    let table = task.with_body(|body| match &body.data {
        ShardData::Describe { table, .. } => table.clone(),
        _ => None,
    });

    let payload = protocol::pack_req_describe(task.handle(), table.as_deref());
    forward_to_store(hooks, task, Header::ReqDescribe, &payload);
}

pub fn handle_select(hooks: &ShardHooks, task: &Arc<ShardTask>) {
    let query = task.with_body(|body| match &body.data {
        ShardData::Select { table, key, .. } => Some((table.clone(), *key)),
        _ => None,
    });
    let Some((table, key)) = query else { return };

    if let Err(e) = hooks.cache.avail_guard_begin() {
        task.set_err(e);
        return;
    }
    let segment = match hooks.cache.segment_guard_begin(&table) {
        Ok(segment) => segment,
        Err(e) => {
            hooks.cache.avail_guard_end();
            task.set_err(e);
            return;
        }
    };

    let outcome = match hooks.cache.read(&segment, key) {
        Some(record) => Some(record),
        None => {
            // miss: fetch from the store and install the page clean
            let payload = protocol::pack_req_select(task.handle(), &table, key);
            if forward_to_store(hooks, task, Header::ReqSelect, &payload) {
                let fetched = task.with_body(|body| match &body.data {
                    ShardData::Select { record, .. } => record.clone(),
                    _ => None,
                });
                match fetched {
                    Some(record) => match hooks.cache.write(&segment, &record, false) {
                        Ok(record) => Some(record),
                        Err(e) => {
                            task.set_err(e);
                            None
                        }
                    },
                    None => None,
                }
            } else {
                None
            }
        }
    };

    hooks.cache.segment_guard_end(&segment);
    hooks.cache.avail_guard_end();

    if let Some(record) = outcome {
        task.with_body(|body| {
            body.err = None;
            if let ShardData::Select { record: slot, .. } = &mut body.data {
                *slot = Some(record);
            }
        });
    }
}

pub fn handle_insert(hooks: &ShardHooks, task: &Arc<ShardTask>) {
    let query = task.with_body(|body| match &body.data {
        ShardData::Insert { table, record } => Some((table.clone(), record.clone())),
        _ => None,
    });
    let Some((table, mut record)) = query else { return };

    if record.value.len() > hooks.cfg.value_size as usize {
        task.set_err(typed_err!(
            Generic,
            "value length {} exceeds the maximum of {}",
            record.value.len(),
            hooks.cfg.value_size
        ));
        return;
    }

    if let Err(e) = hooks.cache.avail_guard_begin() {
        task.set_err(e);
        return;
    }
    let segment = match hooks.cache.segment_guard_begin(&table) {
        Ok(segment) => segment,
        Err(e) => {
            hooks.cache.avail_guard_end();
            task.set_err(e);
            return;
        }
    };

    if record.timestamp == 0 {
        record.timestamp = epoch_ms();
    }

    let result = hooks.cache.write(&segment, &record, true);
    hooks.cache.segment_guard_end(&segment);
    hooks.cache.avail_guard_end();

    match result {
        Ok(stored) => task.with_body(|body| {
            if let ShardData::Insert { record, .. } = &mut body.data {
                *record = stored;
            }
        }),
        Err(e) => task.set_err(e),
    }
}

pub fn handle_journal(hooks: &ShardHooks, task: &Arc<ShardTask>) {
    let (blocked_time, parked, failure) = hooks.cache.journal_drain(|table, record| {
        let payload = protocol::pack_req_insert(task.handle(), table, record);
        loop {
            match hooks.store.send(Header::ReqInsert, &payload) {
                SendOutcome::Ok => return Ok(()),
                SendOutcome::BufferFull => {
                    if hooks.store.wait_outbound(None) == SendOutcome::Disconnected {
                        return Err(typed_err!(NetStoreUnavailable, "store node is unavailable"));
                    }
                }
                SendOutcome::Disconnected => {
                    return Err(typed_err!(NetStoreUnavailable, "store node is unavailable"));
                }
            }
        }
    });

    // release every task parked while the memory was blocked or full
    let taskman = hooks.taskman();
    for handle in parked {
        if let Some(parked_task) = taskman.get(handle) {
            parked_task.activate();
        }
    }

    match failure {
        Some(e) => task.set_err(e),
        None => task.with_body(|body| {
            if let ShardData::Journal { blocked } = &mut body.data {
                *blocked = blocked_time;
            }
        }),
    }
}
