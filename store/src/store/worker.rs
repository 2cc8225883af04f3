//! Worker-thread handlers of the store node.

use std::sync::Arc;

use itertools::Itertools;

use stratakv_core::table::{epoch_ms, Record};
use stratakv_core::typed_err;

use super::memtable::Memtable;
use super::{StoreData, StoreHooks, StoreTask, TableState};

pub fn handle_create(hooks: &StoreHooks, task: &Arc<StoreTask>) {
    let meta = task.with_body(|body| match &body.data {
        StoreData::Create { meta } => Some(meta.clone()),
        _ => None,
    });
    let Some(meta) = meta else { return };

    if let Err(e) = meta.validate() {
        task.set_err(typed_err!(Generic, "{e}"));
        return;
    }
    if hooks.registry.contains(&meta.name) {
        task.set_err(typed_err!(Generic, "Table '{}' already exists.", meta.name));
        return;
    }
    match hooks.fs.table_create(&meta) {
        Ok(()) => {
            hooks.registry.insert(TableState::new(meta.clone()));
            info!(
                "table '{}' created ({}, {} partitions, compaction every {} ms)",
                meta.name, meta.consistency, meta.partitions, meta.compaction_interval_ms
            );
        }
        Err(e) => task.set_err(e),
    }
}

pub fn handle_drop(hooks: &StoreHooks, task: &Arc<StoreTask>) {
    let name = task.with_body(|body| body.data.table_name().map(str::to_owned));
    let Some(name) = name else { return };

    let Some(table) = hooks.registry.get(&name) else {
        task.set_err(typed_err!(Generic, "Table '{name}' does not exist."));
        return;
    };

    // drain in-flight operations, then remove the table from disk; the
    // in-memory state is freed by a main-thread task on completion
    table.reslock.block();
    table.reslock.wait_unused();

    if let Err(e) = hooks.fs.table_delete(&name) {
        hooks.table_unblock(&table);
        task.set_err(e);
    }
}

pub fn handle_describe(hooks: &StoreHooks, task: &Arc<StoreTask>) {
    let target = task.with_body(|body| match &body.data {
        StoreData::Describe { table, .. } => table.clone(),
        _ => None,
    });

    let outcome = match &target {
        Some(name) => match hooks.registry.get(name) {
            Some(table) => Ok(vec![table.meta.clone()]),
            None => Err(typed_err!(Generic, "Table '{name}' does not exist.")),
        },
        None => Ok(hooks.registry.metas()),
    };

    match outcome {
        Ok(metas) => task.with_body(|body| {
            if let StoreData::Describe { result, .. } = &mut body.data {
                *result = metas;
            }
        }),
        Err(e) => task.set_err(e),
    }
}

pub fn handle_select(hooks: &StoreHooks, task: &Arc<StoreTask>) {
    let query = task.with_body(|body| match &body.data {
        StoreData::Select { table, key, .. } => Some((table.clone(), *key)),
        _ => None,
    });
    let Some((name, key)) = query else { return };

    let table = match hooks.registry.avail_guard_begin(&name) {
        Ok(table) => table,
        Err(e) => {
            task.set_err(e);
            return;
        }
    };

    let found = select_record(hooks, &table, key);
    table.reslock.avail_guard_end();

    match found {
        Some(record) => task.with_body(|body| {
            if let StoreData::Select { record: slot, .. } = &mut body.data {
                *slot = Some(record);
            }
        }),
        None => task.set_err(typed_err!(Generic, "Key {key} does not exist in table '{name}'.")),
    }
}

/// The select merge: partition file, then every dump, then the live
/// memtable, each replacing the candidate when its timestamp is at least
/// as recent.
fn select_record(hooks: &StoreHooks, table: &TableState, key: u16) -> Option<Record> {
    let name = &table.meta.name;
    let partitions = table.meta.partitions;
    let mut best: Option<Record> = None;

    let mut consider = |record: Record| {
        if best.as_ref().map(|b| record.timestamp >= b.timestamp).unwrap_or(true) {
            best = Some(record);
        }
    };

    let part = key % partitions;
    match Memtable::from_part(&hooks.fs, name, partitions, part, false) {
        Ok(memtable) => {
            if let Some(record) = memtable.find(key) {
                consider(record);
            }
        }
        Err(e) => debug!("partition {part} of '{name}' unreadable: {e}"),
    }

    if let Ok(dumps) = hooks.fs.dump_numbers(name) {
        for (number, during_compaction) in dumps {
            match Memtable::from_dump(&hooks.fs, name, partitions, number, during_compaction) {
                Ok(memtable) => {
                    if let Some(record) = memtable.find(key) {
                        consider(record);
                    }
                }
                Err(e) => debug!("dump {number} of '{name}' unreadable: {e}"),
            }
        }
    }

    if let Some(record) = table.memtable.lock().unwrap().find(key) {
        consider(record);
    }

    best
}

pub fn handle_insert(hooks: &StoreHooks, task: &Arc<StoreTask>) {
    let query = task.with_body(|body| match &body.data {
        StoreData::Insert { table, record } => Some((table.clone(), record.clone())),
        _ => None,
    });
    let Some((name, mut record)) = query else { return };

    let table = match hooks.registry.avail_guard_begin(&name) {
        Ok(table) => table,
        Err(e) => {
            task.set_err(e);
            return;
        }
    };

    if record.timestamp == 0 {
        record.timestamp = epoch_ms();
    }
    table.memtable.lock().unwrap().add(record);
    table.reslock.avail_guard_end();
}

pub fn handle_dump(hooks: &StoreHooks, task: &Arc<StoreTask>) {
    let name = task.with_body(|body| body.data.table_name().map(str::to_owned));
    let Some(name) = name else { return };

    let table = match hooks.registry.avail_guard_begin(&name) {
        Ok(table) => table,
        Err(e) => {
            task.set_err(e);
            return;
        }
    };

    let result = table.memtable.lock().unwrap().make_dump(&hooks.fs);
    table.reslock.avail_guard_end();

    match result {
        Ok(Some(number)) => debug!("table '{name}' dumped as D{number}.tmp"),
        Ok(None) => {} // nothing to dump
        Err(e) => task.set_err(e),
    }
}

pub fn handle_compact(hooks: &StoreHooks, task: &Arc<StoreTask>) {
    let name = task.with_body(|body| body.data.table_name().map(str::to_owned));
    let Some(name) = name else { return };

    // the table cannot be dropped mid-compaction: drop blocks until the
    // compacting flag owner completes
    let Some(table) = hooks.registry.get(&name) else {
        return;
    };
    let partitions = table.meta.partitions;

    // stage 1: snapshot the dump set, renaming each chosen dump so that
    // concurrent dumps never extend the compaction scope
    table.reslock.block();
    table.reslock.wait_unused();

    let dumps: Vec<u16> = match hooks.fs.dump_numbers(&name) {
        Ok(dumps) => dumps
            .into_iter()
            .filter(|&(_, during_compaction)| !during_compaction)
            .map(|(number, _)| number)
            .collect(),
        Err(e) => {
            hooks.table_unblock(&table);
            task.set_err(e);
            return;
        }
    };
    for &number in &dumps {
        let from = hooks.fs.dump_path(&name, number, false);
        let to = hooks.fs.dump_path(&name, number, true);
        if let Err(e) = std::fs::rename(&from, &to) {
            hooks.table_unblock(&table);
            task.set_err(typed_err!(Generic, "renaming dump D{number} failed: {e}"));
            return;
        }
    }

    hooks.table_unblock(&table);
    let snapshot_blocked = table.reslock.blocked_time();

    // stage 2: merge, without the table block held
    let mut merged = Memtable::new(&name, partitions);
    for &number in &dumps {
        match Memtable::from_dump(&hooks.fs, &name, partitions, number, true) {
            Ok(dump) => merged.add_all(dump.records().iter().cloned()),
            Err(e) => {
                task.set_err(e);
                return;
            }
        }
    }
    merged.preprocess();

    let mut replaced_parts: Vec<u16> = Vec::new();
    let groups = merged
        .records()
        .iter()
        .chunk_by(|record| record.key % partitions);
    for (part, group) in &groups {
        let fresh: Vec<Record> = group.cloned().collect();
        let mut part_memtable = match Memtable::from_part(&hooks.fs, &name, partitions, part, false)
        {
            Ok(memtable) => memtable,
            Err(e) => {
                task.set_err(e);
                return;
            }
        };
        part_memtable.add_all(fresh);
        if let Err(e) = part_memtable.make_part(&hooks.fs, part) {
            task.set_err(e);
            return;
        }
        replaced_parts.push(part);
    }

    // stage 3: swap the new generation in under the table block
    table.reslock.block();
    table.reslock.wait_unused();

    for &number in &dumps {
        if let Err(e) = hooks.fs.delete_file(&hooks.fs.dump_path(&name, number, true)) {
            warn!("consumed dump D{number}.tmpc deletion failed: {e}");
        }
    }
    for &part in &replaced_parts {
        let current = hooks.fs.part_path(&name, part, false);
        let staged = hooks.fs.part_path(&name, part, true);
        if let Err(e) = hooks
            .fs
            .delete_file(&current)
            .and_then(|_| std::fs::rename(&staged, &current).map_err(|e| typed_err!(Generic, "{e}")))
        {
            hooks.table_unblock(&table);
            task.set_err(typed_err!(Generic, "partition {part} swap failed: {e}"));
            return;
        }
    }

    hooks.table_unblock(&table);
    let swap_blocked = table.reslock.blocked_time();

    task.with_body(|body| {
        if let StoreData::Compact {
            dumps: count,
            snapshot_blocked: snap,
            swap_blocked: swap,
            ..
        } = &mut body.data
        {
            *count = dumps.len();
            *snap = snapshot_blocked;
            *swap = swap_blocked;
        }
    });
}
