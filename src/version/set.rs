use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::corruption;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::filename::{current_file_name, descriptor_file_name, set_current_file};
use crate::sequence::SequenceAllocator;
use crate::version::edit::VersionEdit;
use crate::version::version::{FileMetaData, Version, NUM_LEVELS};
use crate::wal;

pub const COMPARATOR_NAME: &str = "emberdb.BytewiseComparator";

/// Rotate the manifest on open once it has grown past this size; below it,
/// `reuse_logs` keeps appending to the old file.
const MAX_REUSED_MANIFEST_SIZE: u64 = 2 * 1024 * 1024;

struct Inner {
    next_file_number: u64,
    manifest_file_number: u64,
    log_number: u64,
    prev_log_number: u64,
    current: Arc<Version>,
    descriptor_log: Option<wal::Writer>,
    // Serializes log_and_apply so manifest edits are totally ordered.
    applying: bool,
}

/// Owns the manifest, the current `Version`, and the number allocators.
pub struct VersionSet {
    env: Arc<dyn Env>,
    dbname: PathBuf,
    sequence: SequenceAllocator,
    inner: Mutex<Inner>,
    apply_cv: Condvar,
}

impl VersionSet {
    pub fn new(env: Arc<dyn Env>, dbname: &Path) -> Self {
        Self {
            env,
            dbname: dbname.to_path_buf(),
            sequence: SequenceAllocator::new(),
            inner: Mutex::new(Inner {
                next_file_number: 2,
                manifest_file_number: 0,
                log_number: 0,
                prev_log_number: 0,
                current: Arc::new(Version::empty()),
                descriptor_log: None,
                applying: false,
            }),
            apply_cv: Condvar::new(),
        }
    }

    pub fn assign_sequence_numbers(&self, n: u64) -> u64 {
        self.sequence.assign(n)
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequence.last_sequence()
    }

    pub fn set_last_sequence(&self, seq: u64) {
        self.sequence.set_last_sequence(seq);
    }

    pub fn new_file_number(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let number = inner.next_file_number;
        inner.next_file_number += 1;
        number
    }

    /// Hands back the most recently allocated number if it was never used.
    pub fn reuse_file_number(&self, number: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.next_file_number == number + 1 {
            inner.next_file_number = number;
        }
    }

    pub fn mark_file_number_used(&self, number: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.next_file_number <= number {
            inner.next_file_number = number + 1;
        }
    }

    pub fn log_number(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).log_number
    }

    pub fn prev_log_number(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .prev_log_number
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .manifest_file_number
    }

    pub fn current(&self) -> Arc<Version> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current
            .clone()
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current().num_files(level)
    }

    /// Collects every file number referenced by the current version.
    pub fn add_live_files(&self, live: &mut HashSet<u64>) {
        let current = self.current();
        for level in 0..NUM_LEVELS {
            for file in current.files(level) {
                live.insert(file.number);
            }
        }
    }

    /// Appends `edit` to the manifest, fsyncs it, and installs the successor
    /// version. Creates the manifest/CURRENT pair on the first call after
    /// open. Concurrent callers are serialized.
    pub fn log_and_apply(&self, edit: &mut VersionEdit) -> Result<()> {
        let mut inner = self.lock_for_apply()?;

        if let Some(number) = edit.log_number {
            debug_assert!(number >= inner.log_number);
            debug_assert!(number < inner.next_file_number);
        } else {
            edit.set_log_number(inner.log_number);
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(inner.prev_log_number);
        }
        edit.set_next_file_number(inner.next_file_number);
        edit.set_last_sequence(self.last_sequence());

        let mut builder = Builder::new(inner.current.clone());
        builder.apply(edit);
        let new_version = Arc::new(builder.save_to());

        let new_log_number = edit.log_number.unwrap_or(inner.log_number);
        let new_prev_log_number = edit.prev_log_number.unwrap_or(inner.prev_log_number);

        // First commit after open: the manifest file does not exist yet, so
        // it begins with a snapshot of the current version.
        let creating_manifest = inner.descriptor_log.is_none();
        let manifest_number = inner.manifest_file_number;
        let snapshot = if creating_manifest {
            Some(Self::snapshot_edit(&inner.current).encode())
        } else {
            None
        };
        let mut descriptor_log = inner.descriptor_log.take();
        let record = edit.encode();

        // Manifest IO happens outside the lock; `applying` keeps other
        // committers out until the result is installed.
        drop(inner);

        let io_result = (|| -> Result<()> {
            if descriptor_log.is_none() {
                let path = descriptor_file_name(&self.dbname, manifest_number);
                let file = self.env.new_writable_file(&path)?;
                let mut log = wal::Writer::new(file);
                log.add_record(snapshot.as_ref().expect("snapshot accompanies a new manifest"))?;
                descriptor_log = Some(log);
            }
            let log = descriptor_log.as_mut().expect("descriptor log just ensured");
            log.add_record(&record)?;
            log.sync()?;
            if creating_manifest {
                set_current_file(self.env.as_ref(), &self.dbname, manifest_number)?;
            }
            Ok(())
        })();

        // Poison-tolerant: `applying` must be cleared on every path or
        // later committers wait forever.
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match &io_result {
            Ok(()) => {
                inner.descriptor_log = descriptor_log;
                inner.current = new_version;
                inner.log_number = new_log_number;
                inner.prev_log_number = new_prev_log_number;
            }
            Err(e) => {
                tracing::error!(error = %e, "manifest write failed; discarding version");
                if creating_manifest {
                    descriptor_log = None;
                    let _ = self
                        .env
                        .remove_file(&descriptor_file_name(&self.dbname, manifest_number));
                }
                inner.descriptor_log = descriptor_log;
            }
        }
        inner.applying = false;
        self.apply_cv.notify_all();
        io_result
    }

    /// Reads CURRENT and replays the manifest, rebuilding the current
    /// version. Returns `save_manifest`: whether the caller must write a
    /// fresh manifest (always, unless the old one was reused).
    pub fn recover(&self, reuse_manifest: bool) -> Result<bool> {
        let current_path = current_file_name(&self.dbname);
        let mut file = self.env.new_sequential_file(&current_path)?;
        let mut contents = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            contents.extend_from_slice(&buf[..n]);
        }
        if contents.is_empty() || *contents.last().expect("non-empty") != b'\n' {
            return Err(corruption!("CURRENT file does not end with newline"));
        }
        contents.pop();
        let manifest_name = String::from_utf8(contents)
            .map_err(|_| corruption!("CURRENT file is not utf-8"))?;
        let manifest_path = self.dbname.join(&manifest_name);

        let manifest_file = self.env.new_sequential_file(&manifest_path)?;

        struct ManifestReporter {
            status: Option<Error>,
        }
        impl wal::Reporter for ManifestReporter {
            fn corruption(&mut self, bytes: usize, reason: &str) {
                tracing::error!(bytes, reason, "manifest corruption");
                if self.status.is_none() {
                    self.status = Some(corruption!("manifest: {reason}"));
                }
            }
        }

        let mut reporter = ManifestReporter { status: None };
        let mut reader = wal::Reader::new(manifest_file, true);

        let mut builder = Builder::new(Arc::new(Version::empty()));
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        while let Some(record) = reader.read_record(&mut reporter)? {
            let edit = VersionEdit::decode(&record)?;
            if let Some(name) = &edit.comparator_name {
                if name != COMPARATOR_NAME {
                    return Err(Error::InvalidArgument(format!(
                        "comparator {name} does not match {COMPARATOR_NAME}"
                    )));
                }
            }
            builder.apply(&edit);
            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.prev_log_number.is_some() {
                prev_log_number = edit.prev_log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
        }
        if let Some(status) = reporter.status {
            return Err(status);
        }

        let next_file_number =
            next_file_number.ok_or_else(|| corruption!("no next-file entry in manifest"))?;
        let log_number =
            log_number.ok_or_else(|| corruption!("no log-number entry in manifest"))?;
        let last_sequence =
            last_sequence.ok_or_else(|| corruption!("no last-sequence entry in manifest"))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        let version = Arc::new(builder.save_to());

        let mut inner = self.inner.lock()?;
        inner.current = version;
        // The replacement manifest takes the manifest's next number; fresh
        // allocations start just above it.
        inner.manifest_file_number = next_file_number;
        inner.next_file_number = next_file_number + 1;
        inner.log_number = log_number;
        inner.prev_log_number = prev_log_number;
        self.sequence.set_last_sequence(last_sequence);
        inner.mark_used(log_number);
        inner.mark_used(prev_log_number);

        let mut save_manifest = true;
        if reuse_manifest {
            if let Ok(size) = self.env.get_file_size(&manifest_path) {
                if size < MAX_REUSED_MANIFEST_SIZE {
                    if let Some((number, _)) = crate::filename::parse_file_name(&manifest_name) {
                        if let Ok(file) = self.env.new_appendable_file(&manifest_path) {
                            tracing::info!(manifest = %manifest_name, "reusing manifest");
                            inner.descriptor_log = Some(wal::Writer::with_offset(file, size));
                            inner.manifest_file_number = number;
                            save_manifest = false;
                        }
                    }
                }
            }
        }

        Ok(save_manifest)
    }

    fn lock_for_apply(&self) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock()?;
        while inner.applying {
            inner = self.apply_cv.wait(inner)?;
        }
        inner.applying = true;
        Ok(inner)
    }

    /// An edit reproducing the full contents of `version`, written as the
    /// first record of a fresh manifest.
    fn snapshot_edit(version: &Version) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(COMPARATOR_NAME);
        for (level, files) in version.levels().iter().enumerate() {
            for file in files {
                edit.add_file(
                    level as u32,
                    file.number,
                    file.file_size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
            }
        }
        edit
    }
}

impl Inner {
    fn mark_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }
}

/// Accumulates edits on top of a base version and materializes the result.
struct Builder {
    base: Arc<Version>,
    deleted: Vec<HashSet<u64>>,
    added: Vec<Vec<Arc<FileMetaData>>>,
}

impl Builder {
    fn new(base: Arc<Version>) -> Self {
        Self {
            base,
            deleted: vec![HashSet::new(); NUM_LEVELS],
            added: vec![Vec::new(); NUM_LEVELS],
        }
    }

    fn apply(&mut self, edit: &VersionEdit) {
        for (level, number) in &edit.deleted_files {
            self.deleted[*level as usize].insert(*number);
        }
        for (level, meta) in &edit.new_files {
            self.deleted[*level as usize].remove(&meta.number);
            self.added[*level as usize].push(Arc::new(meta.clone()));
        }
    }

    fn save_to(self) -> Version {
        let mut files: Vec<Vec<Arc<FileMetaData>>> = Vec::with_capacity(NUM_LEVELS);
        for level in 0..NUM_LEVELS {
            let mut merged: Vec<Arc<FileMetaData>> = self
                .base
                .files(level)
                .iter()
                .filter(|f| !self.deleted[level].contains(&f.number))
                .cloned()
                .chain(
                    self.added[level]
                        .iter()
                        .filter(|f| !self.deleted[level].contains(&f.number))
                        .cloned(),
                )
                .collect();
            if level == 0 {
                merged.sort_by_key(|f| f.number);
            } else {
                merged.sort_by(|a, b| a.smallest.cmp(&b.smallest));
            }
            files.push(merged);
        }
        Version::with_files(files)
    }
}

/// Writes the initial manifest/CURRENT pair for a brand-new database.
pub(crate) fn write_new_db(env: &dyn Env, dbname: &Path) -> Result<()> {
    let mut new_db = VersionEdit::new();
    new_db.set_comparator_name(COMPARATOR_NAME);
    new_db.set_log_number(0);
    new_db.set_next_file_number(2);
    new_db.set_last_sequence(0);

    let manifest = descriptor_file_name(dbname, 1);
    let file = env.new_writable_file(&manifest)?;
    let mut log = wal::Writer::new(file);
    let result = log
        .add_record(&new_db.encode())
        .and_then(|_| log.sync());
    drop(log);

    match result {
        Ok(()) => set_current_file(env, dbname, 1),
        Err(e) => {
            let _ = env.remove_file(&manifest);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::FsEnv;
    use crate::format::{InternalKey, ValueType};
    use crate::tmpfs::TempDir;

    fn fresh_set(dir: &TempDir) -> VersionSet {
        let env: Arc<dyn Env> = Arc::new(FsEnv::new());
        write_new_db(env.as_ref(), dir.path()).unwrap();
        let set = VersionSet::new(env, dir.path());
        let save_manifest = set.recover(false).unwrap();
        assert!(save_manifest);
        set
    }

    fn add_file_edit(level: u32, number: u64) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.add_file(
            level,
            number,
            1024,
            InternalKey::new(b"a", 1, ValueType::Value),
            InternalKey::new(b"z", 9, ValueType::Value),
        );
        edit
    }

    #[test]
    fn new_db_recovers_empty() {
        let dir = TempDir::new().unwrap();
        let set = fresh_set(&dir);
        assert_eq!(set.num_level_files(0), 0);
        assert_eq!(set.last_sequence(), 0);
        assert_eq!(set.log_number(), 0);
        // MANIFEST-000001 existed; its number is retired.
        assert!(set.new_file_number() >= 2);
    }

    #[test]
    fn log_and_apply_installs_and_persists() {
        let dir = TempDir::new().unwrap();
        let env: Arc<dyn Env> = Arc::new(FsEnv::new());

        {
            let set = fresh_set(&dir);
            set.set_last_sequence(17);
            let mut edit = add_file_edit(0, set.new_file_number());
            set.log_and_apply(&mut edit).unwrap();
            assert_eq!(set.num_level_files(0), 1);
        }

        // A second incarnation rebuilds the same version from the manifest.
        let set = VersionSet::new(env, dir.path());
        let save_manifest = set.recover(false).unwrap();
        assert!(save_manifest);
        assert_eq!(set.num_level_files(0), 1);
        assert_eq!(set.last_sequence(), 17);
        let current = set.current();
        assert_eq!(current.files(0)[0].file_size, 1024);
    }

    #[test]
    fn deleted_files_disappear_from_recovered_version() {
        let dir = TempDir::new().unwrap();
        let set = fresh_set(&dir);

        let number = set.new_file_number();
        set.log_and_apply(&mut add_file_edit(0, number)).unwrap();

        let mut removal = VersionEdit::new();
        removal.remove_file(0, number);
        set.log_and_apply(&mut removal).unwrap();
        assert_eq!(set.num_level_files(0), 0);

        let env: Arc<dyn Env> = Arc::new(FsEnv::new());
        let reopened = VersionSet::new(env, dir.path());
        reopened.recover(false).unwrap();
        assert_eq!(reopened.num_level_files(0), 0);
    }

    #[test]
    fn live_files_cover_every_level() {
        let dir = TempDir::new().unwrap();
        let set = fresh_set(&dir);

        let n0 = set.new_file_number();
        set.log_and_apply(&mut add_file_edit(0, n0)).unwrap();
        let n1 = set.new_file_number();
        set.log_and_apply(&mut add_file_edit(2, n1)).unwrap();

        let mut live = HashSet::new();
        set.add_live_files(&mut live);
        assert_eq!(live, HashSet::from([n0, n1]));
    }

    #[test]
    fn file_number_allocation_is_monotonic_and_reusable() {
        let dir = TempDir::new().unwrap();
        let set = fresh_set(&dir);

        let a = set.new_file_number();
        let b = set.new_file_number();
        assert_eq!(b, a + 1);

        // The latest number can be retired; an installed one cannot.
        set.reuse_file_number(b);
        assert_eq!(set.new_file_number(), b);
        set.reuse_file_number(a);
        assert_eq!(set.new_file_number(), b + 1);

        set.mark_file_number_used(100);
        assert_eq!(set.new_file_number(), 101);
    }

    #[test]
    fn missing_current_is_an_error() {
        let dir = TempDir::new().unwrap();
        let env: Arc<dyn Env> = Arc::new(FsEnv::new());
        let set = VersionSet::new(env, dir.path());
        assert!(set.recover(false).is_err());
    }

    #[test]
    fn reuse_manifest_skips_rotation() {
        let dir = TempDir::new().unwrap();
        let env: Arc<dyn Env> = Arc::new(FsEnv::new());

        {
            let set = fresh_set(&dir);
            let mut edit = add_file_edit(0, set.new_file_number());
            set.log_and_apply(&mut edit).unwrap();
        }

        let set = VersionSet::new(env, dir.path());
        let save_manifest = set.recover(true).unwrap();
        assert!(!save_manifest);
        // Appending through the reused manifest still works.
        let mut edit = add_file_edit(0, set.new_file_number());
        set.log_and_apply(&mut edit).unwrap();
        assert_eq!(set.num_level_files(0), 2);
    }

    #[test]
    fn manifest_replay_reproduces_version_after_many_edits() {
        let dir = TempDir::new().unwrap();
        let set = fresh_set(&dir);

        let mut numbers = Vec::new();
        for _ in 0..5 {
            let n = set.new_file_number();
            numbers.push(n);
            set.log_and_apply(&mut add_file_edit(0, n)).unwrap();
        }
        let mut removal = VersionEdit::new();
        removal.remove_file(0, numbers[2]);
        set.log_and_apply(&mut removal).unwrap();

        let expected: Vec<u64> = set.current().files(0).iter().map(|f| f.number).collect();

        let env: Arc<dyn Env> = Arc::new(FsEnv::new());
        let reopened = VersionSet::new(env, dir.path());
        reopened.recover(false).unwrap();
        let got: Vec<u64> = reopened.current().files(0).iter().map(|f| f.number).collect();
        assert_eq!(got, expected);
    }
}
