//! The database: write admission over sequence-windowed memtables, the
//! background flush worker, and open/recovery.
//!
//! A write allocates its sequence numbers first and only then resolves the
//! memtable that must receive them, so admission never needs a queue
//! mutex: the sequence space is partitioned into per-memtable windows and
//! the first writer to land beyond the current window rotates the roster
//! with a compare-and-swap. Writers block only when the rotation would need
//! a third memtable, i.e. the previous immutable table has not flushed yet.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::batch::WriteBatch;
use crate::config::Options;
use crate::env::{DbLock, Env, FsEnv};
use crate::error::{Error, Result};
use crate::filename::{
    current_file_name, lock_file_name, parse_file_name, table_file_name, wal_file_name, FileType,
};
use crate::format::{LookupKey, MAX_SEQUENCE};
use crate::memtable::{FlushState, LookupResult, Memtable};
use crate::roster::MemtableRoster;
use crate::table::{build_table, TableCache};
use crate::version::set::write_new_db;
use crate::version::version::FileMetaData;
use crate::version::{Version, VersionEdit, VersionSet};
use crate::wal;

/// A disaggregated LSM key-value store: the write path and memtable
/// lifecycle core.
pub struct Db {
    core: Arc<DbCore>,
}

struct WalState {
    writer: Option<wal::Writer>,
    number: u64,
}

#[derive(Default)]
struct DbState {
    pending_outputs: HashSet<u64>,
    bg_error: Option<Error>,
    flush_scheduled: bool,
}

struct DbCore {
    dbname: PathBuf,
    options: Options,
    env: Arc<dyn Env>,
    table_cache: Arc<TableCache>,
    versions: Arc<VersionSet>,
    roster: MemtableRoster,
    wal: Mutex<WalState>,
    // The coordination mutex: pending outputs, background error, and the
    // flush-scheduled flag. Never held across WAL writes, table builds, or
    // manifest IO.
    state: Mutex<DbState>,
    // Signalled when the immutable slot empties, a background error is
    // published, or the background worker finishes a pass.
    full_cv: Condvar,
    shutting_down: AtomicBool,
    db_lock: Mutex<Option<Box<dyn DbLock>>>,
}

impl Db {
    pub fn open(options: Options, dbname: impl AsRef<Path>) -> Result<Db> {
        Self::open_with_env(options, dbname, Arc::new(FsEnv::new()))
    }

    pub fn open_with_env(
        options: Options,
        dbname: impl AsRef<Path>,
        env: Arc<dyn Env>,
    ) -> Result<Db> {
        let dbname = dbname.as_ref().to_path_buf();
        env.create_dir(&dbname)?;
        let db_lock = env.lock_file(&lock_file_name(&dbname))?;

        let table_cache = Arc::new(TableCache::new(env.clone(), dbname.clone()));
        let versions = Arc::new(VersionSet::new(env.clone(), &dbname));
        let window = options.memtable_seq_window;

        let core = Arc::new(DbCore {
            dbname,
            options,
            env,
            table_cache,
            versions,
            roster: MemtableRoster::new(Arc::new(Memtable::new(1, window))),
            wal: Mutex::new(WalState {
                writer: None,
                number: 0,
            }),
            state: Mutex::new(DbState::default()),
            full_cv: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            db_lock: Mutex::new(Some(db_lock)),
        });

        let mut edit = VersionEdit::new();
        let mut save_manifest = core.recover(&mut edit)?;

        {
            let mut wal_state = core.wal.lock()?;
            if wal_state.writer.is_none() {
                // No reusable log: start a fresh WAL generation and a
                // fresh memtable windowed just above everything recovered.
                let number = core.versions.new_file_number();
                let file = core
                    .env
                    .new_writable_file(&wal_file_name(&core.dbname, number))?;
                wal_state.writer = Some(wal::Writer::new(file));
                wal_state.number = number;

                let last = core.versions.last_sequence();
                core.roster
                    .install_current(Arc::new(Memtable::new(last + 1, last + window)));
            }
        }

        if save_manifest {
            edit.set_prev_log_number(0);
            edit.set_log_number(core.wal.lock()?.number);
            core.versions.log_and_apply(&mut edit)?;
        }

        core.remove_obsolete_files();
        core.maybe_schedule_flush();

        Ok(Db { core })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch)
    }

    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        self.core.write(batch)
    }

    /// Point lookup at the latest sequence number.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.core.get_at(key, self.core.versions.last_sequence())
    }

    /// Point lookup at an explicit snapshot sequence.
    pub fn get_at(&self, key: &[u8], snapshot: u64) -> Result<Option<Vec<u8>>> {
        self.core.get_at(key, snapshot)
    }

    pub fn last_sequence(&self) -> u64 {
        self.core.versions.last_sequence()
    }

    /// Forces the writable memtable out to a level-0 table and waits for
    /// the flush to commit.
    pub fn compact_memtable(&self) -> Result<()> {
        self.core.compact_memtable()
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.core.versions.num_level_files(level)
    }

    /// Removes every file belonging to the database. The database must not
    /// be open.
    pub fn destroy(dbname: impl AsRef<Path>, env: Arc<dyn Env>) -> Result<()> {
        let dbname = dbname.as_ref();
        let children = match env.get_children(dbname) {
            Ok(children) => children,
            // The directory does not exist: nothing to destroy.
            Err(_) => return Ok(()),
        };

        let lock_path = lock_file_name(dbname);
        let lock = env.lock_file(&lock_path)?;
        let mut result = Ok(());
        for name in children {
            if let Some((_, ftype)) = parse_file_name(&name) {
                if ftype == FileType::DbLockFile {
                    continue;
                }
                if let Err(e) = env.remove_file(&dbname.join(&name)) {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        let _ = lock.unlock();
        let _ = env.remove_dir(dbname);
        result
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.core.shutting_down.store(true, Ordering::Release);

        let mut state = self
            .core
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while state.flush_scheduled {
            state = self
                .core
                .full_cv
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(state);

        if let Ok(mut guard) = self.core.db_lock.lock() {
            if let Some(lock) = guard.take() {
                let _ = lock.unlock();
            }
        }
    }
}

impl DbCore {
    // ---------------------------------------------------------------
    // Write path
    // ---------------------------------------------------------------

    fn write(self: &Arc<Self>, mut batch: WriteBatch) -> Result<()> {
        let count = batch.count() as u64;
        if count == 0 {
            return Ok(());
        }
        if let Some(e) = self.state.lock()?.bg_error.clone() {
            return Err(e);
        }

        let seq = self.versions.assign_sequence_numbers(count);
        batch.set_sequence(seq);

        let wal_result: std::result::Result<(), (Error, bool)> = {
            let mut wal_state = self.wal.lock()?;
            match wal_state.writer.as_mut() {
                Some(writer) => {
                    if let Err(e) = writer.add_record(batch.contents()) {
                        Err((e, false))
                    } else if self.options.sync {
                        // A failed sync leaves the record's durability
                        // indeterminate; the database stops taking writes.
                        writer.sync().map_err(|e| (e, true))
                    } else {
                        Ok(())
                    }
                }
                None => Ok(()),
            }
        };

        if let Err((error, is_sync_failure)) = wal_result {
            // The sequence numbers are already allocated; account for them
            // so their windows can still complete and flush.
            self.complete_without_insert(&batch);
            if is_sync_failure {
                self.record_background_error(error.clone());
            }
            return Err(error);
        }

        for entry in batch.iter() {
            let entry = entry?;
            let mem = self.pickup_table(entry.seq)?;
            mem.insert(entry.seq, entry.vtype, entry.key, entry.value);
        }
        Ok(())
    }

    /// Resolves the memtable whose window contains `seq`, rotating the
    /// roster or waiting for the flush worker as needed.
    fn pickup_table(self: &Arc<Self>, seq: u64) -> Result<Arc<Memtable>> {
        let window = self.options.memtable_seq_window;
        let mut mem = self.roster.current();

        while seq > mem.largest_seq_supposed() {
            if self.roster.has_immutable() {
                // Our sequence has outrun the current window and the
                // retired table has not flushed: a rotation would need a
                // third memtable, so wait.
                let mut state = self.state.lock()?;
                loop {
                    if let Some(e) = state.bg_error.clone() {
                        return Err(e);
                    }
                    let current = self.roster.current();
                    if !(self.roster.has_immutable() && seq > current.largest_seq_supposed()) {
                        break;
                    }
                    state = self.full_cv.wait(state)?;
                }
            } else {
                let first = mem.largest_seq_supposed() + 1;
                let candidate = Arc::new(Memtable::new(first, first + window - 1));
                if self.roster.try_rotate(&mem, candidate.clone()) {
                    mem.set_flush_state(FlushState::Requested);
                    self.maybe_schedule_flush();
                    // Our sequence may lie beyond even the fresh window;
                    // the loop re-checks.
                    mem = candidate;
                    continue;
                }
                // Another writer rotated first; fall through and re-read.
            }
            mem = self.roster.current();
        }

        if mem.contains_seq(seq) {
            return Ok(mem);
        }

        // seq precedes the current window, so it belongs to the immutable
        // table. That table cannot be flushed before this write completes,
        // because its window is not complete until we are done.
        let imm = self.roster.immutable().ok_or_else(|| {
            Error::Io("admitted sequence has no owning memtable".to_string())
        })?;
        debug_assert!(imm.contains_seq(seq));
        Ok(imm)
    }

    /// Marks the batch's sequence numbers complete without inserting, so a
    /// failed write does not leave its window permanently unfinished.
    fn complete_without_insert(self: &Arc<Self>, batch: &WriteBatch) {
        for entry in batch.iter().flatten() {
            if let Ok(mem) = self.pickup_table(entry.seq) {
                mem.add_completed(1);
            }
        }
    }

    fn get_at(&self, key: &[u8], snapshot: u64) -> Result<Option<Vec<u8>>> {
        let (mem, imm) = self.roster.snapshot();

        match mem.get(key, snapshot) {
            LookupResult::Found(value) => return Ok(Some(value)),
            LookupResult::Deleted => return Ok(None),
            LookupResult::Missing => {}
        }
        if let Some(imm) = imm {
            match imm.get(key, snapshot) {
                LookupResult::Found(value) => return Ok(Some(value)),
                LookupResult::Deleted => return Ok(None),
                LookupResult::Missing => {}
            }
        }

        let lookup = LookupKey::new(key, snapshot);
        match self.versions.current().get(&self.table_cache, &lookup)? {
            LookupResult::Found(value) => Ok(Some(value)),
            LookupResult::Deleted | LookupResult::Missing => Ok(None),
        }
    }

    // ---------------------------------------------------------------
    // Background flush
    // ---------------------------------------------------------------

    fn maybe_schedule_flush(self: &Arc<Self>) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.flush_scheduled {
            return;
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if state.bg_error.is_some() {
            return;
        }
        if !self.roster.has_immutable() {
            return;
        }
        state.flush_scheduled = true;
        drop(state);

        let core = self.clone();
        self.env.schedule(Box::new(move || core.background_call()));
    }

    fn background_call(self: &Arc<Self>) {
        let runnable = !self.shutting_down.load(Ordering::Acquire)
            && self
                .state
                .lock()
                .map(|s| s.bg_error.is_none())
                .unwrap_or(false);
        if runnable {
            self.background_flush();
        }

        {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.flush_scheduled = false;
            self.full_cv.notify_all();
        }

        // The flush may have exposed more work.
        self.maybe_schedule_flush();
    }

    /// Converts the immutable memtable into a level-0 table and commits it
    /// through the manifest.
    fn background_flush(self: &Arc<Self>) {
        let imm = match self.roster.immutable() {
            Some(imm) => imm,
            None => return,
        };
        debug_assert!(!imm.check_flush_scheduled());

        // Wait for every writer admitted to the retired window to finish
        // its insert. Bounded by the longest in-flight insert; every tenth
        // probe nudges blocked writers so they stay responsive.
        let mut probes = 0;
        while !imm.able_to_flush() {
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            if self
                .state
                .lock()
                .map(|s| s.bg_error.is_some())
                .unwrap_or(true)
            {
                return;
            }
            std::thread::sleep(Duration::from_micros(1));
            probes += 1;
            if probes == 10 {
                self.signal_writers();
                probes = 0;
            }
        }
        imm.set_flush_state(FlushState::Scheduled);

        let base = self.versions.current();
        let mut edit = VersionEdit::new();
        let result = self.write_level0_table(&imm, &mut edit, Some(&base));

        if result.is_ok() && self.shutting_down.load(Ordering::Acquire) {
            // Torn down mid-flush: leave the immutable in place and do not
            // commit; the WAL still covers its contents.
            return;
        }

        let result = result.and_then(|_| {
            edit.set_prev_log_number(0);
            // Earlier logs are no longer needed once this flush commits.
            edit.set_log_number(self.wal.lock()?.number);
            self.versions.log_and_apply(&mut edit)
        });

        match result {
            Ok(()) => {
                imm.set_flush_state(FlushState::Done);
                self.roster.clear_immutable();
                self.signal_writers();
                self.remove_obsolete_files();
            }
            Err(e) => self.record_background_error(e),
        }
    }

    /// Drains `mem` into a new sorted table and records it in `edit`. The
    /// file number stays in `pending_outputs` for the duration so the file
    /// is never garbage-collected mid-build.
    fn write_level0_table(
        &self,
        mem: &Memtable,
        edit: &mut VersionEdit,
        base: Option<&Version>,
    ) -> Result<()> {
        let start_micros = self.env.now_micros();
        let number = self.versions.new_file_number();
        self.state.lock()?.pending_outputs.insert(number);
        tracing::info!(file = number, "level-0 table started");

        let mut meta = FileMetaData::placeholder(number);
        let result = build_table(
            &self.dbname,
            self.env.as_ref(),
            &self.table_cache,
            mem.iter(),
            &mut meta,
        );

        self.state.lock()?.pending_outputs.remove(&number);

        match &result {
            Ok(()) => {
                if meta.file_size > 0 {
                    let level = base
                        .map(|b| {
                            b.pick_level_for_memtable_output(
                                meta.smallest.user_key(),
                                meta.largest.user_key(),
                            )
                        })
                        .unwrap_or(0);
                    edit.add_file(
                        level,
                        meta.number,
                        meta.file_size,
                        meta.smallest.clone(),
                        meta.largest.clone(),
                    );
                    tracing::info!(
                        file = number,
                        bytes = meta.file_size,
                        level,
                        micros = self.env.now_micros() - start_micros,
                        "level-0 table finished"
                    );
                } else {
                    // Nothing was written; the number was never installed.
                    self.versions.reuse_file_number(number);
                }
            }
            Err(e) => {
                tracing::error!(file = number, error = %e, "level-0 table failed");
            }
        }
        result
    }

    /// Publishes a background error. All subsequent writes and flushes
    /// fail with it; it is never cleared in this process.
    fn record_background_error(&self, error: Error) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.bg_error.is_none() {
            tracing::error!(error = %error, "background error");
            state.bg_error = Some(error);
            self.full_cv.notify_all();
        }
    }

    fn signal_writers(&self) {
        let _guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.full_cv.notify_all();
    }

    /// Forces the live window out through the normal admission machinery:
    /// the remainder of the window is burned as no-op sequence numbers, and
    /// the one past the boundary triggers the rotation.
    fn compact_memtable(self: &Arc<Self>) -> Result<()> {
        let mem = self.roster.current();
        if mem.is_empty() && !self.roster.has_immutable() {
            return Ok(());
        }

        let largest = mem.largest_seq_supposed();
        let last = self.versions.last_sequence();
        let n = largest.saturating_sub(last) + 1;
        let first = self.versions.assign_sequence_numbers(n);
        for seq in first..first + n {
            let table = self.pickup_table(seq)?;
            table.add_completed(1);
        }

        let mut state = self.state.lock()?;
        while self.roster.has_immutable() && state.bg_error.is_none() {
            state = self.full_cv.wait(state)?;
        }
        match &state.bg_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Deletes files no version refers to: stale WALs and manifests, and
    /// tables that are neither live nor being written.
    fn remove_obsolete_files(&self) {
        let live = {
            let state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.bg_error.is_some() {
                // After a background error it is unknown whether a version
                // commit landed, so nothing can be safely collected.
                return;
            }
            state.pending_outputs.clone()
        };
        let mut live = live;
        self.versions.add_live_files(&mut live);

        let children = match self.env.get_children(&self.dbname) {
            Ok(children) => children,
            Err(_) => return,
        };

        let log_number = self.versions.log_number();
        let prev_log_number = self.versions.prev_log_number();
        let manifest_number = self.versions.manifest_file_number();

        for name in children {
            let Some((number, ftype)) = parse_file_name(&name) else {
                continue;
            };
            let keep = match ftype {
                FileType::WalFile => number >= log_number || number == prev_log_number,
                FileType::DescriptorFile => number >= manifest_number,
                FileType::TableFile | FileType::TempFile => live.contains(&number),
                FileType::CurrentFile | FileType::DbLockFile | FileType::InfoLogFile => true,
            };
            if keep {
                continue;
            }
            if ftype == FileType::TableFile {
                self.table_cache.evict(number);
            }
            tracing::info!(file = %name, ?ftype, "deleting obsolete file");
            if let Err(e) = self.env.remove_file(&self.dbname.join(&name)) {
                tracing::warn!(file = %name, error = %e, "failed to delete obsolete file");
            }
        }
    }

    // ---------------------------------------------------------------
    // Recovery
    // ---------------------------------------------------------------

    /// Rebuilds state from the manifest and replays post-manifest WAL
    /// tails. Returns whether a fresh manifest must be written.
    fn recover(&self, edit: &mut VersionEdit) -> Result<bool> {
        if !self.env.file_exists(&current_file_name(&self.dbname)) {
            if !self.options.create_if_missing {
                return Err(Error::InvalidArgument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    self.dbname.display()
                )));
            }
            tracing::info!(db = %self.dbname.display(), "creating new database");
            write_new_db(self.env.as_ref(), &self.dbname)?;
        } else if self.options.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "{}: exists (error_if_exists is true)",
                self.dbname.display()
            )));
        }

        let mut save_manifest = self.versions.recover(self.options.reuse_logs)?;

        // Every WAL at or above the manifest's log number may hold writes
        // the manifest does not cover yet.
        let min_log = self.versions.log_number();
        let prev_log = self.versions.prev_log_number();

        let mut expected = HashSet::new();
        self.versions.add_live_files(&mut expected);

        let mut logs = Vec::new();
        for name in self.env.get_children(&self.dbname)? {
            if let Some((number, ftype)) = parse_file_name(&name) {
                expected.remove(&number);
                if ftype == FileType::WalFile && (number >= min_log || number == prev_log) {
                    logs.push(number);
                }
            }
        }
        if !expected.is_empty() {
            let example = expected.iter().next().expect("non-empty");
            return Err(Error::Corruption(format!(
                "{} missing files; e.g. {}",
                expected.len(),
                table_file_name(&self.dbname, *example).display()
            )));
        }

        logs.sort_unstable();
        let mut max_sequence = 0;
        let log_count = logs.len();
        for (i, &log_number) in logs.iter().enumerate() {
            self.recover_log_file(
                log_number,
                i + 1 == log_count,
                &mut save_manifest,
                edit,
                &mut max_sequence,
            )?;
            // The previous incarnation may not have registered this number
            // in the manifest before dying.
            self.versions.mark_file_number_used(log_number);
        }

        if self.versions.last_sequence() < max_sequence {
            self.versions.set_last_sequence(max_sequence);
        }

        Ok(save_manifest)
    }

    fn recover_log_file(
        &self,
        log_number: u64,
        last_log: bool,
        save_manifest: &mut bool,
        edit: &mut VersionEdit,
        max_sequence: &mut u64,
    ) -> Result<()> {
        struct LogReporter {
            log_number: u64,
            paranoid: bool,
            status: Option<Error>,
            saw_corruption: bool,
        }
        impl wal::Reporter for LogReporter {
            fn corruption(&mut self, bytes: usize, reason: &str) {
                tracing::warn!(
                    log = self.log_number,
                    bytes,
                    reason,
                    paranoid = self.paranoid,
                    "dropping bytes from wal"
                );
                self.saw_corruption = true;
                if self.paranoid && self.status.is_none() {
                    self.status = Some(Error::Corruption(format!(
                        "wal {:06}: {reason}",
                        self.log_number
                    )));
                }
            }
        }

        let path = wal_file_name(&self.dbname, log_number);
        let file = self.env.new_sequential_file(&path)?;
        tracing::info!(log = log_number, "recovering wal");

        let mut reporter = LogReporter {
            log_number,
            paranoid: self.options.paranoid_checks,
            status: None,
            saw_corruption: false,
        };
        let mut reader = wal::Reader::new(file, true);

        let mut mem: Option<Arc<Memtable>> = None;
        let mut compactions = 0;

        loop {
            let record = match reader.read_record(&mut reporter)? {
                Some(record) => record,
                None => break,
            };
            if let Some(status) = reporter.status.take() {
                return Err(status);
            }
            if record.len() < crate::batch::BATCH_HEADER_SIZE {
                use wal::Reporter;
                reporter.corruption(record.len(), "log record too small");
                if let Some(status) = reporter.status.take() {
                    return Err(status);
                }
                continue;
            }

            let batch = WriteBatch::from_contents(&record)?;
            let table = mem
                .get_or_insert_with(|| Arc::new(Memtable::new(0, MAX_SEQUENCE)))
                .clone();

            let mut batch_status: Result<()> = Ok(());
            for entry in batch.iter() {
                match entry {
                    Ok(entry) => table.insert(entry.seq, entry.vtype, entry.key, entry.value),
                    Err(e) => {
                        batch_status = Err(e);
                        break;
                    }
                }
            }
            if let Err(e) = batch_status {
                if self.options.paranoid_checks {
                    return Err(e);
                }
                tracing::warn!(log = log_number, error = %e, "ignoring bad batch");
            }

            let last_seq = batch.sequence() + batch.count() as u64 - 1;
            if last_seq > *max_sequence {
                *max_sequence = last_seq;
            }

            if table.approximate_memory_usage() > self.options.write_buffer_size {
                compactions += 1;
                *save_manifest = true;
                let status = self.write_level0_table(&table, edit, None);
                mem = None;
                // Surface errors immediately so a full filesystem fails
                // the open instead of looping.
                status?;
            }
        }
        if let Some(status) = reporter.status.take() {
            return Err(status);
        }

        // Keep appending to the final log if replaying it changed nothing
        // on storage and it read back clean.
        if self.options.reuse_logs && last_log && compactions == 0 && !reporter.saw_corruption {
            if let Ok(size) = self.env.get_file_size(&path) {
                if let Ok(file) = self.env.new_appendable_file(&path) {
                    tracing::info!(log = log_number, "reusing old wal");
                    let mut wal_state = self.wal.lock()?;
                    wal_state.writer = Some(wal::Writer::with_offset(file, size));
                    wal_state.number = log_number;

                    let table = mem
                        .take()
                        .unwrap_or_else(|| Arc::new(Memtable::new(0, MAX_SEQUENCE)));
                    // Re-base the window above everything recovered; all
                    // older sequence numbers count as completed, whether
                    // or not the log still carried an entry for them.
                    let last = self.versions.last_sequence().max(*max_sequence);
                    table.set_window(1, last + self.options.memtable_seq_window);
                    let already = table.completed_count();
                    table.add_completed(last.saturating_sub(already));
                    self.roster.install_current(table);
                    return Ok(());
                }
            }
        }

        if let Some(table) = mem {
            if !table.is_empty() {
                *save_manifest = true;
                self.write_level0_table(&table, edit, None)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::BackgroundWork;
    use crate::format::ValueType;
    use crate::tmpfs::TempDir;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    fn open_db(dir: &TempDir, options: Options) -> Db {
        Db::open(options, dir.path()).expect("open failed")
    }

    fn wait_until(deadline_ms: u64, mut pred: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(deadline_ms) {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        pred()
    }

    /// An environment whose background work can be held back, to keep the
    /// flush worker from running until the test releases it.
    struct GateEnv {
        inner: FsEnv,
        open: Mutex<bool>,
        held: Mutex<Vec<BackgroundWork>>,
    }

    impl GateEnv {
        fn new() -> Self {
            Self {
                inner: FsEnv::new(),
                open: Mutex::new(false),
                held: Mutex::new(Vec::new()),
            }
        }

        fn release(&self) {
            *self.open.lock().unwrap() = true;
            let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
            for work in held {
                self.inner.schedule(work);
            }
        }
    }

    impl Env for GateEnv {
        fn create_dir(&self, path: &Path) -> Result<()> {
            self.inner.create_dir(path)
        }
        fn file_exists(&self, path: &Path) -> bool {
            self.inner.file_exists(path)
        }
        fn get_children(&self, path: &Path) -> Result<Vec<String>> {
            self.inner.get_children(path)
        }
        fn new_writable_file(&self, path: &Path) -> Result<Box<dyn crate::env::WritableFile>> {
            self.inner.new_writable_file(path)
        }
        fn new_appendable_file(&self, path: &Path) -> Result<Box<dyn crate::env::WritableFile>> {
            self.inner.new_appendable_file(path)
        }
        fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn crate::env::SequentialFile>> {
            self.inner.new_sequential_file(path)
        }
        fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
            self.inner.rename_file(from, to)
        }
        fn remove_file(&self, path: &Path) -> Result<()> {
            self.inner.remove_file(path)
        }
        fn remove_dir(&self, path: &Path) -> Result<()> {
            self.inner.remove_dir(path)
        }
        fn get_file_size(&self, path: &Path) -> Result<u64> {
            self.inner.get_file_size(path)
        }
        fn lock_file(&self, path: &Path) -> Result<Box<dyn DbLock>> {
            self.inner.lock_file(path)
        }
        fn now_micros(&self) -> u64 {
            self.inner.now_micros()
        }
        fn schedule(&self, work: BackgroundWork) {
            if *self.open.lock().unwrap() {
                self.inner.schedule(work);
            } else {
                self.held.lock().unwrap().push(work);
            }
        }
    }

    #[test]
    fn single_write_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_db(&dir, Options::default());
            db.put(b"a", b"1").unwrap();
            assert_eq!(db.last_sequence(), 1);
        }
        let db = open_db(&dir, Options::default());
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.last_sequence(), 1);
    }

    #[test]
    fn window_rollover_flushes_one_table() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir, Options::default().memtable_seq_window(4));

        for i in 0..8 {
            db.put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
        }
        assert_eq!(db.last_sequence(), 8);

        // The first window [1,4] rotates at sequence 5 and flushes.
        assert!(wait_until(5000, || db.num_level_files(0)
            + db.num_level_files(1)
            + db.num_level_files(2)
            >= 1));

        for i in 0..8 {
            assert_eq!(
                db.get(format!("k{i}").as_bytes()).unwrap(),
                Some(format!("v{i}").into_bytes()),
                "k{i}"
            );
        }
    }

    #[test]
    fn backpressure_blocks_writers_beyond_two_windows() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(GateEnv::new());
        let db = Arc::new(
            Db::open_with_env(
                Options::default().memtable_seq_window(2),
                dir.path(),
                env.clone(),
            )
            .unwrap(),
        );

        let completed = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(6));
        let mut handles = Vec::new();
        for i in 0..6 {
            let db = db.clone();
            let completed = completed.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                db.put(format!("key{i}").as_bytes(), b"v").unwrap();
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Sequences 1-4 fit in the first two windows; 5 and 6 need a third
        // memtable and block while the gated worker sits on the first one.
        assert!(wait_until(5000, || completed.load(Ordering::SeqCst) == 4));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(completed.load(Ordering::SeqCst), 4);

        env.release();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), 6);
        assert_eq!(db.last_sequence(), 6);
        for i in 0..6 {
            assert_eq!(
                db.get(format!("key{i}").as_bytes()).unwrap(),
                Some(b"v".to_vec())
            );
        }
    }

    #[test]
    fn delete_shadows_value_and_flush_keeps_tombstone() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir, Options::default().memtable_seq_window(64));

        db.put(b"x", b"1").unwrap();
        db.delete(b"x").unwrap();
        assert_eq!(db.get(b"x").unwrap(), None);

        db.compact_memtable().unwrap();
        assert_eq!(db.get(b"x").unwrap(), None);

        // The flushed table holds both the tombstone and the old value.
        let current = db.core.versions.current();
        let mut entries = Vec::new();
        for level in current.levels() {
            for file in level {
                entries.extend(
                    db.core
                        .table_cache
                        .new_iterator(file.number, file.file_size)
                        .unwrap(),
                );
            }
        }
        let x_entries: Vec<_> = entries
            .iter()
            .filter(|(k, _)| k.user_key() == b"x")
            .map(|(k, _)| k.value_type())
            .collect();
        assert_eq!(x_entries, vec![ValueType::Deletion, ValueType::Value]);
    }

    #[test]
    fn wal_replay_after_unclean_close() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_db(&dir, Options::default());
            db.put(b"a", b"1").unwrap();
            db.put(b"b", b"2").unwrap();
            // No flush happened; contents live only in the WAL.
            assert_eq!(db.num_level_files(0), 0);
        }
        let db = open_db(&dir, Options::default());
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.last_sequence(), 2);
    }

    #[test]
    fn reuse_logs_keeps_the_wal_file() {
        let dir = TempDir::new().unwrap();
        let options = Options::default().reuse_logs(true);
        {
            let db = open_db(&dir, options.clone());
            db.put(b"a", b"1").unwrap();
            db.put(b"b", b"2").unwrap();
        }

        let wal_files_before: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".log"))
            .collect();
        assert_eq!(wal_files_before.len(), 1);

        let db = open_db(&dir, options);
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.last_sequence(), 2);
        // Nothing was flushed, and the same WAL file is still active.
        assert_eq!(db.num_level_files(0), 0);
        let wal_files_after: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".log"))
            .collect();
        assert_eq!(wal_files_after, wal_files_before);

        // And the reused log keeps accepting writes that survive reopen.
        db.put(b"c", b"3").unwrap();
        drop(db);
        let db = open_db(&dir, Options::default());
        assert_eq!(db.get(b"c").unwrap(), Some(b"3".to_vec()));
        assert_eq!(db.last_sequence(), 3);
    }

    fn corrupt_second_record(dir: &TempDir) {
        // Layout of the first WAL block: record 1 is the 19-byte batch for
        // ("k1","v1") framed with a 7-byte header; record 2 starts right
        // after it. Flip a byte inside record 2's payload.
        let wal_path: PathBuf = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.to_string_lossy().ends_with(".log"))
            .unwrap();
        let mut bytes = std::fs::read(&wal_path).unwrap();
        let offset = 7 + 19 + 7 + 5;
        bytes[offset] ^= 0xff;
        std::fs::write(&wal_path, &bytes).unwrap();
    }

    #[test]
    fn wal_corruption_is_dropped_without_paranoid_checks() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_db(&dir, Options::default());
            db.put(b"k1", b"v1").unwrap();
            // A value spanning two blocks, so later records live in a
            // block the corruption does not poison.
            db.put(b"k2", &vec![7u8; 40 * 1024]).unwrap();
            db.put(b"k3", b"v3").unwrap();
        }
        corrupt_second_record(&dir);

        let db = open_db(&dir, Options::default());
        assert_eq!(db.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(db.get(b"k2").unwrap(), None);
        assert_eq!(db.get(b"k3").unwrap(), Some(b"v3".to_vec()));
        assert_eq!(db.last_sequence(), 3);
    }

    #[test]
    fn wal_corruption_fails_open_with_paranoid_checks() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_db(&dir, Options::default());
            db.put(b"k1", b"v1").unwrap();
            db.put(b"k2", &vec![7u8; 40 * 1024]).unwrap();
            db.put(b"k3", b"v3").unwrap();
        }
        corrupt_second_record(&dir);

        let result = Db::open(Options::default().paranoid_checks(true), dir.path());
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn concurrent_writers_with_rotations_keep_everything_visible() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(open_db(&dir, Options::default().memtable_seq_window(8)));

        let mut handles = Vec::new();
        for t in 0..4 {
            let db = db.clone();
            handles.push(thread::spawn(move || {
                for i in 0..25 {
                    db.put(format!("t{t}-{i:02}").as_bytes(), format!("{t}/{i}").as_bytes())
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(db.last_sequence(), 100);
        for t in 0..4 {
            for i in 0..25 {
                assert_eq!(
                    db.get(format!("t{t}-{i:02}").as_bytes()).unwrap(),
                    Some(format!("{t}/{i}").into_bytes())
                );
            }
        }
    }

    #[test]
    fn snapshot_reads_resolve_by_sequence() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir, Options::default());

        db.put(b"k", b"first").unwrap();
        db.put(b"k", b"second").unwrap();
        db.delete(b"k").unwrap();

        assert_eq!(db.get_at(b"k", 1).unwrap(), Some(b"first".to_vec()));
        assert_eq!(db.get_at(b"k", 2).unwrap(), Some(b"second".to_vec()));
        assert_eq!(db.get_at(b"k", 3).unwrap(), None);
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn reopen_without_writes_is_idempotent() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_db(&dir, Options::default().memtable_seq_window(4));
            for i in 0..6 {
                db.put(format!("k{i}").as_bytes(), b"v").unwrap();
            }
        }

        let (first_last, first_files) = {
            let db = open_db(&dir, Options::default());
            let files: Vec<Vec<u64>> = db
                .core
                .versions
                .current()
                .levels()
                .iter()
                .map(|level| level.iter().map(|f| f.number).collect())
                .collect();
            (db.last_sequence(), files)
        };

        let db = open_db(&dir, Options::default());
        let files: Vec<Vec<u64>> = db
            .core
            .versions
            .current()
            .levels()
            .iter()
            .map(|level| level.iter().map(|f| f.number).collect())
            .collect();
        assert_eq!(db.last_sequence(), first_last);
        assert_eq!(files, first_files);
        for i in 0..6 {
            assert_eq!(db.get(format!("k{i}").as_bytes()).unwrap(), Some(b"v".to_vec()));
        }
    }

    #[test]
    fn committed_version_files_exist_on_disk() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir, Options::default().memtable_seq_window(4));
        for i in 0..12 {
            db.put(format!("k{i:02}").as_bytes(), b"v").unwrap();
        }
        db.compact_memtable().unwrap();

        let current = db.core.versions.current();
        let mut total = 0;
        for level in current.levels() {
            for file in level {
                total += 1;
                assert!(table_file_name(dir.path(), file.number).exists());
            }
        }
        assert!(total >= 1);
    }

    #[test]
    fn second_open_is_rejected_while_locked() {
        let dir = TempDir::new().unwrap();
        let _db = open_db(&dir, Options::default());
        assert!(Db::open(Options::default(), dir.path()).is_err());
    }

    #[test]
    fn missing_database_without_create_is_invalid_argument() {
        let dir = TempDir::new().unwrap();
        let result = Db::open(
            Options::default().create_if_missing(false),
            dir.path().join("absent"),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn error_if_exists_rejects_second_creation() {
        let dir = TempDir::new().unwrap();
        {
            let _db = open_db(&dir, Options::default());
        }
        let result = Db::open(Options::default().error_if_exists(true), dir.path());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn missing_table_file_is_corruption_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_db(&dir, Options::default().memtable_seq_window(64));
            db.put(b"a", b"1").unwrap();
            db.compact_memtable().unwrap();
            assert!(db.num_level_files(0) + db.num_level_files(1) + db.num_level_files(2) >= 1);
        }

        for entry in std::fs::read_dir(dir.path()).unwrap().filter_map(|e| e.ok()) {
            if entry.file_name().to_string_lossy().ends_with(".sst") {
                std::fs::remove_file(entry.path()).unwrap();
            }
        }

        let result = Db::open(Options::default(), dir.path());
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn destroy_removes_the_database() {
        let dir = TempDir::new().unwrap();
        let dbpath = dir.path().join("victim");
        {
            let db = Db::open(Options::default(), &dbpath).unwrap();
            db.put(b"a", b"1").unwrap();
        }
        assert!(dbpath.exists());
        Db::destroy(&dbpath, Arc::new(FsEnv::new())).unwrap();
        assert!(!dbpath.exists());
    }

    #[test]
    fn obsolete_wal_files_are_collected_after_flush() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_db(&dir, Options::default().memtable_seq_window(64));
            db.put(b"a", b"1").unwrap();
        }
        // Reopen flushes the replayed WAL into a table and rotates logs;
        // the old WAL must be gone afterwards.
        let db = open_db(&dir, Options::default());
        let wal_count = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".log"))
            .count();
        assert_eq!(wal_count, 1);
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    }
}
