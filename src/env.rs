//! Filesystem and scheduling capabilities consumed by the engine.
//!
//! Rather than one wide interface, collaborators receive narrow capability
//! objects: `WritableFile` and `SequentialFile` carry only the operations
//! the log and table codecs need, and `Env` bundles the directory-level
//! operations plus a `schedule` hook that runs background work on a single
//! worker thread.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::flock::FileLock;

/// An append-only file. Writes are buffered until `flush`; `sync` forces
/// the bytes to stable storage.
pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// A file read front to back.
pub trait SequentialFile: Send {
    /// Reads up to `buf.len()` bytes; returns the number read, zero at EOF.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn skip(&mut self, n: u64) -> Result<()>;
}

/// A held database lock; releasing it makes the directory claimable again.
pub trait DbLock: Send {
    fn unlock(self: Box<Self>) -> Result<()>;
}

pub type BackgroundWork = Box<dyn FnOnce() + Send>;

pub trait Env: Send + Sync {
    fn create_dir(&self, path: &Path) -> Result<()>;
    fn file_exists(&self, path: &Path) -> bool;
    fn get_children(&self, path: &Path) -> Result<Vec<String>>;
    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;
    /// Opens for append, preserving existing contents.
    fn new_appendable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>>;
    fn rename_file(&self, from: &Path, to: &Path) -> Result<()>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn remove_dir(&self, path: &Path) -> Result<()>;
    fn get_file_size(&self, path: &Path) -> Result<u64>;
    fn lock_file(&self, path: &Path) -> Result<Box<dyn DbLock>>;
    fn now_micros(&self) -> u64;
    /// Queues work onto the environment's background worker thread. Work
    /// items run one at a time in submission order.
    fn schedule(&self, work: BackgroundWork);
}

struct FsWritableFile {
    writer: BufWriter<File>,
}

impl WritableFile for FsWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

struct FsSequentialFile {
    file: File,
}

impl SequentialFile for FsSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        self.file.seek(SeekFrom::Current(n as i64))?;
        Ok(())
    }
}

struct FsDbLock {
    lock: FileLock,
}

impl DbLock for FsDbLock {
    fn unlock(self: Box<Self>) -> Result<()> {
        self.lock.unlock()?;
        Ok(())
    }
}

/// Background worker shared by one `FsEnv`: a single thread draining a
/// channel of work items, started lazily on the first `schedule` call.
struct BackgroundWorker {
    tx: Sender<BackgroundWork>,
    handle: Option<JoinHandle<()>>,
    thread_id: std::thread::ThreadId,
}

/// The standard-filesystem environment.
pub struct FsEnv {
    worker: Mutex<Option<BackgroundWorker>>,
}

impl FsEnv {
    pub fn new() -> Self {
        Self {
            worker: Mutex::new(None),
        }
    }
}

impl Default for FsEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Env for FsEnv {
    fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn get_children(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(FsWritableFile {
            writer: BufWriter::new(file),
        }))
    }

    fn new_appendable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(FsWritableFile {
            writer: BufWriter::new(file),
        }))
    }

    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        let file = File::open(path)?;
        Ok(Box::new(FsSequentialFile { file }))
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path)?;
        Ok(())
    }

    fn get_file_size(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn lock_file(&self, path: &Path) -> Result<Box<dyn DbLock>> {
        let lock = FileLock::lock(path)?;
        Ok(Box::new(FsDbLock { lock }))
    }

    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    fn schedule(&self, work: BackgroundWork) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let worker = guard.get_or_insert_with(|| {
            let (tx, rx) = mpsc::channel::<BackgroundWork>();
            let handle = std::thread::Builder::new()
                .name("emberdb-bg".to_string())
                .spawn(move || {
                    while let Ok(work) = rx.recv() {
                        work();
                    }
                    tracing::debug!("background worker exiting");
                })
                .expect("failed to spawn background worker");
            let thread_id = handle.thread().id();
            BackgroundWorker {
                tx,
                handle: Some(handle),
                thread_id,
            }
        });
        // A send only fails if the worker thread died; work is then dropped
        // along with the rest of the environment.
        let _ = worker.tx.send(work);
    }
}

impl Drop for FsEnv {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.worker.lock() {
            if let Some(mut worker) = guard.take() {
                drop(worker.tx);
                if let Some(handle) = worker.handle.take() {
                    // The environment can be released from a scheduled work
                    // item; the worker thread must not join itself.
                    if std::thread::current().id() != worker.thread_id {
                        let _ = handle.join();
                    }
                }
            }
        }
    }
}
